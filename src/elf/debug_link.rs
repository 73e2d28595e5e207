//! Discovery of separate debug information files.
//!
//! Stripped binaries frequently reference a companion file carrying the
//! symbol table, either through a `.gnu_debuglink` section (file name
//! plus CRC-32 of the file contents) or through their GNU build ID.

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use crate::log::debug;
use crate::util::ReadRaw as _;
use crate::IntoError as _;
use crate::Result;

use super::ElfParser;
use super::SymTab;


const DEBUG_DIR: &str = "/usr/lib/debug";


/// Compute the CRC-32 checksum as used by `.gnu_debuglink` (the
/// standard IEEE polynomial, bit-reversed).
fn crc32(data: &[u8]) -> u32 {
    let mut crc = !0u32;
    for byte in data {
        crc ^= u32::from(*byte);
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xedb88320 & mask);
        }
    }
    !crc
}

/// Parse the `.gnu_debuglink` section, if present, yielding the
/// referenced file name and the expected checksum of its contents.
pub(crate) fn read_debug_link(parser: &ElfParser) -> Result<Option<(String, u32)>> {
    let idx = match parser.find_section(".gnu_debuglink")? {
        Some(idx) => idx,
        None => return Ok(None),
    };
    let mut data = parser.section_data(idx)?;
    let file = data
        .read_cstr()
        .ok_or_invalid_data(|| "failed to read .gnu_debuglink file name")?
        .to_string_lossy()
        .into_owned();
    // The checksum is aligned to four bytes after the NUL terminated
    // name; it always occupies the trailing four bytes of the section.
    let tail = parser.section_data(idx)?;
    let len = tail.len();
    let crc = tail
        .get(len.saturating_sub(4)..)
        .and_then(|mut crc| crc.read_u32())
        .ok_or_invalid_data(|| "failed to read .gnu_debuglink checksum")?;
    Ok(Some((file, crc)))
}

fn verify_checksum(path: &Path, crc: u32) -> bool {
    match fs::read(path) {
        Ok(data) => {
            let actual = crc32(&data);
            if actual != crc {
                debug!(
                    "checksum mismatch for debug file `{}`: expected {crc:#x}, found {actual:#x}",
                    path.display()
                );
                false
            } else {
                true
            }
        }
        Err(..) => false,
    }
}

fn has_symbols(path: &Path) -> bool {
    let parser = match ElfParser::open(path) {
        Ok(parser) => parser,
        Err(..) => return false,
    };
    matches!(parser.symbol_table(SymTab::Sym), Ok(Some(..)))
}

/// Locate the debug file for a binary based on its GNU build ID, i.e.,
/// `/usr/lib/debug/.build-id/ab/cdef...debug`.
pub(crate) fn find_debug_file_via_buildid(build_id: &str, root: &Path) -> Option<PathBuf> {
    if build_id.len() < 3 {
        return None
    }
    let (prefix, rest) = build_id.split_at(2);
    let path = root
        .join(DEBUG_DIR.trim_start_matches('/'))
        .join(".build-id")
        .join(prefix)
        .join(format!("{rest}.debug"));
    if has_symbols(&path) {
        Some(path)
    } else {
        None
    }
}

/// Locate the debug file referenced by a `.gnu_debuglink` section.
///
/// The search covers the directory of the binary itself, its `.debug/`
/// sub-directory, and the corresponding directory below
/// `/usr/lib/debug`, in that order. Unless `check_crc` is disabled, a
/// candidate only qualifies if the checksum of its contents matches the
/// one recorded in the section.
pub(crate) fn find_debug_file_via_debuglink(
    binary_path: &Path,
    name: &str,
    crc: u32,
    check_crc: bool,
    root: &Path,
) -> Option<PathBuf> {
    let dir = binary_path.parent()?;
    let candidates = [
        dir.join(name),
        dir.join(".debug").join(name),
        root.join(DEBUG_DIR.trim_start_matches('/'))
            .join(dir.strip_prefix("/").unwrap_or(dir))
            .join(name),
    ];

    candidates.into_iter().find(|candidate| {
        // Self-references are useless; the binary itself evidently did
        // not carry the symbols we are after.
        if candidate == binary_path {
            return false
        }
        if check_crc {
            verify_checksum(candidate, crc)
        } else {
            candidate.exists()
        }
    })
}


#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write as _;

    use tempfile::TempDir;
    use test_log::test;

    use crate::test_helper::ElfImage;


    /// Check our CRC-32 against a couple of well known values.
    #[test]
    fn crc32_known_values() {
        assert_eq!(crc32(b""), 0);
        assert_eq!(crc32(b"123456789"), 0xcbf43926);
        assert_eq!(crc32(b"The quick brown fox jumps over the lazy dog"), 0x414fa339);
    }

    /// Make sure that we can read a `.gnu_debuglink` section.
    #[test]
    fn debug_link_reading() {
        let image = ElfImage {
            funcs: vec![("func", 0x100, 0x10)],
            debug_link: Some(("app.debug".to_string(), 0xdeadbeef)),
            ..ElfImage::default()
        };
        let parser = ElfParser::from_bytes(&image.build());
        let (name, crc) = read_debug_link(&parser).unwrap().unwrap();
        assert_eq!(name, "app.debug");
        assert_eq!(crc, 0xdeadbeef);
    }

    /// Binaries without the section report no debug link.
    #[test]
    fn debug_link_absence() {
        let image = ElfImage {
            funcs: vec![("func", 0x100, 0x10)],
            ..ElfImage::default()
        };
        let parser = ElfParser::from_bytes(&image.build());
        assert_eq!(read_debug_link(&parser).unwrap(), None);
    }

    /// Exercise debug link based file discovery, including checksum
    /// rejection.
    #[test]
    fn debuglink_discovery() {
        let dir = TempDir::new().unwrap();
        let contents = ElfImage {
            funcs: vec![("debug_func", 0x100, 0x10)],
            ..ElfImage::default()
        }
        .build();
        let crc = crc32(&contents);

        let binary = dir.path().join("app");
        let () = fs::write(&binary, b"the binary itself").unwrap();
        let debug = dir.path().join("app.debug");
        let mut file = fs::File::create(&debug).unwrap();
        let () = file.write_all(&contents).unwrap();

        let found =
            find_debug_file_via_debuglink(&binary, "app.debug", crc, true, Path::new("/"))
                .unwrap();
        assert_eq!(found, debug);

        // A bogus checksum has to result in rejection.
        let found =
            find_debug_file_via_debuglink(&binary, "app.debug", crc ^ 1, true, Path::new("/"));
        assert_eq!(found, None);

        // ...unless checksum verification is disabled.
        let found =
            find_debug_file_via_debuglink(&binary, "app.debug", crc ^ 1, false, Path::new("/"))
                .unwrap();
        assert_eq!(found, debug);
    }
}
