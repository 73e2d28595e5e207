use std::fs::File;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Read;
use std::ops::Range;
use std::path::PathBuf;

use crate::Addr;
use crate::Error;
use crate::Pid;
use crate::Result;


/// The "path" component of a proc maps entry.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum PathName {
    /// The entry references an actual file on disk.
    Path(PathBuf),
    /// The entry is a pseudo-mapping such as `[vdso]` or `[stack]`.
    Component(String),
}


#[derive(Clone, Debug)]
pub(crate) struct MapsEntry {
    /// The virtual address range covered by this entry.
    pub range: Range<Addr>,
    pub mode: u8,
    pub offset: u64,
    /// The path of the backing file, if any.
    pub path_name: Option<PathName>,
}

impl MapsEntry {
    /// Check whether the entry is executable and readable and, hence,
    /// could contribute symbols.
    pub fn is_executable(&self) -> bool {
        self.mode & 0b1010 == 0b1010
    }
}


/// Parse a line of a proc maps file.
fn parse_maps_line<'line>(line: &'line str, pid: Pid) -> Result<MapsEntry> {
    let full_line = line;

    let split_once = |line: &'line str, component| -> Result<(&'line str, &'line str)> {
        line.split_once(|c: char| c.is_ascii_whitespace())
            .ok_or_else(|| {
                Error::with_invalid_data(format!(
                    "failed to find {component} in proc maps line: {line}\n{full_line}"
                ))
            })
    };

    // Lines have the following format:
    // address           perms offset  dev   inode      pathname
    // 08048000-08049000 r-xp 00000000 03:00 8312       /opt/test
    // 0804a000-0806b000 rw-p 00000000 00:00 0          [heap]
    // a7cb1000-a7cb2000 ---p 00000000 00:00 0
    // a7ed5000-a8008000 r-xp 00000000 03:00 4222       /lib/libc.so.6
    let (address_str, line) = split_once(line, "address range")?;
    let (loaded_str, end_str) = address_str.split_once('-').ok_or_else(|| {
        Error::with_invalid_data(format!(
            "encountered malformed address range in proc maps line: {full_line}"
        ))
    })?;
    let loaded_address = Addr::from_str_radix(loaded_str, 16).map_err(|err| {
        Error::with_invalid_data(format!(
            "encountered malformed start address in proc maps line: {full_line}: {err}"
        ))
    })?;
    let end_address = Addr::from_str_radix(end_str, 16).map_err(|err| {
        Error::with_invalid_data(format!(
            "encountered malformed end address in proc maps line: {full_line}: {err}"
        ))
    })?;

    let (mode_str, line) = split_once(line, "permissions component")?;
    let mode = mode_str
        .chars()
        .fold(0, |mode, c| (mode << 1) | u8::from(c != '-'));

    let (offset_str, line) = split_once(line, "offset component")?;
    let offset = u64::from_str_radix(offset_str, 16).map_err(|err| {
        Error::with_invalid_data(format!(
            "encountered malformed offset component in proc maps line: {full_line}: {err}"
        ))
    })?;

    let (_dev, line) = split_once(line, "device component")?;
    // Note that by design, a path may not be present and so we may not
    // be able to successfully split.
    let path_str = split_once(line, "inode component")
        .map(|(_inode, line)| line.trim())
        .unwrap_or("");
    let path_name = if path_str.is_empty() {
        None
    } else if path_str.ends_with(" (deleted)") {
        // The backing file is gone from the file system, but the kernel
        // still allows access to the mapped contents through the
        // `map_files` directory.
        Some(PathName::Path(PathBuf::from(format!(
            "/proc/{pid}/map_files/{address_str}"
        ))))
    } else if path_str.starts_with('[') {
        Some(PathName::Component(path_str.to_string()))
    } else {
        Some(PathName::Path(PathBuf::from(path_str)))
    };

    let entry = MapsEntry {
        range: (loaded_address..end_address),
        mode,
        offset,
        path_name,
    };
    Ok(entry)
}


#[derive(Debug)]
struct MapsEntryIter<R> {
    reader: R,
    line: String,
    pid: Pid,
}

impl<R> Iterator for MapsEntryIter<R>
where
    R: BufRead,
{
    type Item = Result<MapsEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let () = self.line.clear();
            match self.reader.read_line(&mut self.line) {
                Err(err) => return Some(Err(Error::from(err))),
                Ok(0) => break None,
                Ok(_) => {
                    let line_str = self.line.trim();
                    // There shouldn't be any empty lines, but we'd just
                    // ignore them. We need to trim anyway.
                    if !line_str.is_empty() {
                        let result = parse_maps_line(line_str, self.pid);
                        break Some(result)
                    }
                }
            }
        }
    }
}


/// Parse a proc maps file from the provided reader.
pub(crate) fn parse_file<R>(reader: R, pid: Pid) -> impl Iterator<Item = Result<MapsEntry>>
where
    R: Read,
{
    MapsEntryIter {
        reader: BufReader::new(reader),
        line: String::new(),
        pid,
    }
}

/// Parse the maps file for the process with the given PID.
pub(crate) fn parse(pid: Pid) -> Result<impl Iterator<Item = Result<MapsEntry>>> {
    let path = format!("/proc/{pid}/maps");
    let file = File::open(&path)?;
    let iter = parse_file(file, pid);
    Ok(iter)
}
