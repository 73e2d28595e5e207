//! Extraction of GNU build IDs from ELF binaries.

use std::fmt::Write as _;

use crate::elf::types::Elf64_Nhdr;
use crate::elf::types::NT_GNU_BUILD_ID;
use crate::elf::types::SHT_NOTE;
use crate::elf::ElfParser;
use crate::log::debug;
use crate::util::ReadRaw as _;
use crate::Result;


const BUILD_ID_SECTION: &str = ".note.gnu.build-id";
const NOTE_NAME_GNU: &[u8] = b"GNU\0";


fn align4(value: usize) -> usize {
    (value + 3) & !3
}

/// Parse the descriptor of a `NT_GNU_BUILD_ID` note out of raw note
/// section contents, if one is present.
fn parse_build_id_note(mut data: &[u8]) -> Option<&[u8]> {
    while !data.is_empty() {
        let nhdr = data.read_pod_ref::<Elf64_Nhdr>()?;
        let name = data.read_slice(align4(nhdr.n_namesz as usize))?;
        let desc = data.read_slice(align4(nhdr.n_descsz as usize))?;
        if nhdr.n_type == NT_GNU_BUILD_ID && name.get(..NOTE_NAME_GNU.len()) == Some(NOTE_NAME_GNU)
        {
            return desc.get(..nhdr.n_descsz as usize)
        }
    }
    None
}

fn format_build_id(bytes: &[u8]) -> String {
    let mut id = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        // The write cannot fail for a `String`.
        let _result = write!(id, "{byte:02x}");
    }
    id
}

/// Attempt to read the binary's build ID from the well-known
/// `.note.gnu.build-id` section.
fn read_build_id_from_section_name(parser: &ElfParser) -> Result<Option<&[u8]>> {
    if let Some(idx) = parser.find_section(BUILD_ID_SECTION)? {
        let data = parser.section_data(idx)?;
        Ok(parse_build_id_note(data))
    } else {
        Ok(None)
    }
}

/// Attempt to read the binary's build ID from any `SHT_NOTE` section.
fn read_build_id_from_notes(parser: &ElfParser) -> Result<Option<&[u8]>> {
    let shdrs = parser.section_headers()?;
    for (idx, shdr) in shdrs.iter().enumerate() {
        if shdr.sh_type == SHT_NOTE {
            let data = parser.section_data(idx)?;
            if let Some(build_id) = parse_build_id_note(data) {
                return Ok(Some(build_id))
            }
        }
    }
    Ok(None)
}

/// Read the GNU build ID of an ELF binary as a lowercase hex string.
///
/// Returns `None` if the binary does not carry a build ID note.
pub(crate) fn read_build_id(parser: &ElfParser) -> Result<Option<String>> {
    let build_id = match read_build_id_from_section_name(parser)? {
        Some(build_id) => Some(build_id),
        None => {
            debug!("build ID not found in stand-alone section; scanning notes...");
            read_build_id_from_notes(parser)?
        }
    };
    Ok(build_id.map(format_build_id))
}
