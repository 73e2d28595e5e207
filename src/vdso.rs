use std::fs::File;
use std::io::Read as _;
use std::io::Seek as _;
use std::io::SeekFrom;
use std::ops::Range;
use std::slice;

use crate::elf::ElfParser;
use crate::Addr;
use crate::ErrorExt as _;
use crate::Pid;
use crate::Result;


/// The special module string that we report for symbols inside the
/// vDSO.
pub(crate) const VDSO_MODULE: &str = "[vdso]";
/// The name of the "component" representing the vDSO inside
/// `/proc/<pid>/maps`.
pub(crate) const VDSO_MAPS_COMPONENT: &str = "[vdso]";


/// Create a parser for the vDSO image of the given process.
///
/// The vDSO has no backing file, so the image is taken from the address
/// space itself: directly for our own process, via `/proc/<pid>/mem`
/// for everybody else.
pub(crate) fn create_vdso_parser(pid: Pid, range: &Range<Addr>) -> Result<ElfParser> {
    let len = range.end.saturating_sub(range.start) as usize;

    match pid {
        Pid::Slf => {
            let data = range.start as *const u8;
            // SAFETY: The range represents the memory range of our own
            //         vDSO, which is statically allocated by the kernel
            //         and will never vanish.
            let mem = unsafe { slice::from_raw_parts(data, len) };
            Ok(ElfParser::from_bytes(mem))
        }
        Pid::Pid(..) => {
            let path = format!("/proc/{pid}/mem");
            let mut file =
                File::open(&path).with_context(|| format!("failed to open `{path}`"))?;
            let _pos = file
                .seek(SeekFrom::Start(range.start))
                .with_context(|| format!("failed to seek in `{path}`"))?;
            let mut image = vec![0u8; len];
            let () = file
                .read_exact(&mut image)
                .with_context(|| format!("failed to read vDSO image from `{path}`"))?;
            Ok(ElfParser::from_bytes(&image))
        }
    }
}
