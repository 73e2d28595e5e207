//! **symcache** is a library for resolving addresses to symbols (and
//! symbols back to addresses) in the kernel and in running processes.
//!
//! Three caches cover the usual symbolization sources:
//! - [`KernelSymbolCache`] reads `/proc/kallsyms` (or a copy thereof).
//! - [`ProcessSymbolCache`] enumerates the modules of a process from
//!   `/proc/<pid>/maps` and reads their ELF symbol tables, including
//!   separate debug files, JIT perf maps, and the vDSO. Module files
//!   are accessed through the process' mount namespace, so
//!   symbolization works for containerized processes.
//! - [`BuildIdSymbolCache`] resolves file-relative addresses against
//!   binaries registered by GNU build ID, independently of any process.
//!
//! Symbol tables are loaded lazily and symbol names are not even read
//! out of the ELF string tables until a resolution actually reports
//! them.

use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::num::NonZeroU32;
use std::process::id;

mod buildid;
mod buildsym;
mod demangle;
mod elf;
mod error;
mod ksym;
mod log;
mod maps;
mod mmap;
mod module_path;
mod perf_map;
mod proc;
mod process;
#[cfg(test)]
mod test_helper;
mod util;
mod vdso;

pub use crate::buildsym::BuildIdSymbolCache;
pub use crate::error::Error;
pub use crate::error::ErrorExt;
pub use crate::error::ErrorKind;
pub use crate::error::IntoError;
pub use crate::error::Result;
pub use crate::ksym::KernelSymbolCache;
pub use crate::ksym::KALLSYMS;
pub use crate::process::ProcessSymbolCache;


/// A type representing addresses.
pub type Addr = u64;


/// An enumeration identifying a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pid {
    /// The current process.
    Slf,
    /// The process identified by the given PID.
    Pid(NonZeroU32),
}

impl Pid {
    /// Resolve the PID to a numeric value.
    pub fn resolve(&self) -> u32 {
        match self {
            Self::Slf => id(),
            Self::Pid(pid) => pid.get(),
        }
    }
}

impl Display for Pid {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Slf => write!(f, "self"),
            Self::Pid(pid) => write!(f, "{pid}"),
        }
    }
}

impl From<u32> for Pid {
    fn from(pid: u32) -> Self {
        NonZeroU32::new(pid).map(Pid::Pid).unwrap_or(Pid::Slf)
    }
}


/// Options influencing symbol resolution.
#[derive(Clone, Debug)]
pub struct SymbolOpts {
    /// Demangle C++ and Rust symbol names.
    pub demangle: bool,
    /// Only report function symbols, skipping data objects.
    pub functions_only: bool,
    /// Consult separate debug files (via build ID or `.gnu_debuglink`)
    /// for stripped binaries.
    pub use_debug_file: bool,
    /// Verify the CRC-32 recorded in a `.gnu_debuglink` section against
    /// the contents of the candidate debug file.
    pub check_debug_file_crc: bool,
    /// Parse a module's symbol table only once a resolution actually
    /// touches the module. When disabled, the first resolution loads
    /// the symbol tables of all enumerated modules.
    pub lazy_symbolize: bool,
}

impl Default for SymbolOpts {
    fn default() -> Self {
        Self {
            demangle: true,
            functions_only: true,
            use_debug_file: true,
            check_debug_file_crc: true,
            lazy_symbolize: true,
        }
    }
}


/// The result of a successful address resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedSymbol {
    /// The symbol's raw name.
    pub name: String,
    /// The demangled rendition of `name`, if demangling was requested
    /// and applicable.
    pub demangled: Option<String>,
    /// The module providing the symbol.
    pub module: Option<String>,
    /// The offset of the resolved address into the symbol.
    pub offset: u64,
}

impl ResolvedSymbol {
    /// The name to display: the demangled one if available, the raw one
    /// otherwise.
    pub fn display_name(&self) -> &str {
        self.demangled.as_deref().unwrap_or(&self.name)
    }
}


/// The common interface of address-to-symbol caches.
///
/// Methods take `&mut self`: caches load their data lazily and promote
/// symbol names in place as they get reported.
pub trait SymbolCache {
    /// Throw away cached state and re-read the underlying symbol
    /// source.
    fn refresh(&mut self) -> Result<()>;

    /// Resolve an address to the symbol covering it.
    ///
    /// A miss is not an error: `Ok(None)` means the address simply has
    /// no known symbol.
    fn resolve_addr(&mut self, addr: Addr, opts: &SymbolOpts) -> Result<Option<ResolvedSymbol>>;

    /// Find the address of the symbol with the given name, optionally
    /// restricted to the named module.
    fn resolve_name(&mut self, module: Option<&str>, name: &str) -> Result<Option<Addr>>;
}
