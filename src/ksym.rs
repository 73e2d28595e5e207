use std::collections::HashMap;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::fs::File;
use std::io::BufRead as _;
use std::io::BufReader;
use std::io::Read;
use std::path::Path;
use std::path::PathBuf;

use crate::demangle::maybe_demangle;
use crate::log::debug;
use crate::util::find_match_or_lower_bound_by_key;
use crate::Addr;
use crate::ResolvedSymbol;
use crate::Result;
use crate::SymbolCache;
use crate::SymbolOpts;

pub const KALLSYMS: &str = "/proc/kallsyms";
const DFL_KSYM_CAP: usize = 200000;

/// kallsyms type characters that denote text symbols.
const FUNC_TYPES: &[u8] = b"tTwW";


/// A kallsyms-style symbol.
#[derive(Debug)]
struct Ksym {
    addr: Addr,
    name: Box<str>,
    /// The kernel module providing the symbol, if any.
    module: Option<Box<str>>,
    /// The kallsyms symbol type character.
    sym_type: u8,
}

impl Ksym {
    fn is_function(&self) -> bool {
        FUNC_TYPES.contains(&self.sym_type)
    }
}


/// A symbol cache for the kernel, fed from a kallsyms-style file.
///
/// Symbols are loaded lazily on first use and can be re-read via
/// [`refresh`][SymbolCache::refresh] to pick up freshly loaded kernel
/// modules.
pub struct KernelSymbolCache {
    /// The path to the kallsyms file to use.
    path: PathBuf,
    /// All symbols, sorted by address.
    syms: Box<[Ksym]>,
    /// An index from symbol name to address. The first occurrence in
    /// file order wins for duplicated names.
    by_name: HashMap<Box<str>, Addr>,
    loaded: bool,
}

impl Default for KernelSymbolCache {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelSymbolCache {
    /// Create a new cache reading from `/proc/kallsyms`.
    pub fn new() -> Self {
        Self::with_path(Path::new(KALLSYMS))
    }

    /// Create a new cache reading from the given kallsyms-style file,
    /// e.g., a copy captured on a different system.
    pub fn with_path(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            syms: Box::default(),
            by_name: HashMap::new(),
            loaded: false,
        }
    }

    fn load_from_reader<R>(&mut self, reader: R) -> Result<()>
    where
        R: Read,
    {
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        let mut syms = Vec::with_capacity(DFL_KSYM_CAP);
        let mut by_name = HashMap::with_capacity(DFL_KSYM_CAP);

        loop {
            let () = line.clear();
            let sz = reader.read_line(&mut line)?;
            if sz == 0 {
                break
            }

            let mut tokens = line.split_ascii_whitespace();

            #[rustfmt::skip]
            let (addr, typ, name) = {
                let addr = if let Some(token) = tokens.next() { token } else { continue };
                let typ = if let Some(token) = tokens.next() { token } else { continue };
                let name = if let Some(token) = tokens.next() { token } else { continue };
                (addr, typ, name)
            };
            let module = tokens
                .next()
                .map(|token| Box::from(token.trim_start_matches('[').trim_end_matches(']')));

            if let Ok(addr) = Addr::from_str_radix(addr, 16) {
                if addr == 0 {
                    continue
                }

                let name = Box::<str>::from(name);
                let _prev = by_name.entry(name.clone()).or_insert(addr);
                let ksym = Ksym {
                    addr,
                    name,
                    module,
                    sym_type: typ.as_bytes().first().copied().unwrap_or(b'?'),
                };
                let () = syms.push(ksym);
            }
        }

        let () = syms.sort_by_key(|ksym| ksym.addr);

        self.syms = syms.into_boxed_slice();
        self.by_name = by_name;
        self.loaded = true;
        debug!("loaded {} kernel symbols", self.syms.len());
        Ok(())
    }

    fn load(&mut self) -> Result<()> {
        let file = File::open(&self.path)?;
        self.load_from_reader(file)
    }

    fn ensure_loaded(&mut self) -> Result<()> {
        if !self.loaded {
            let () = self.load()?;
        }
        Ok(())
    }

    fn find_ksym(&self, addr: Addr, opts: &SymbolOpts) -> Option<&Ksym> {
        let idx = find_match_or_lower_bound_by_key(&self.syms, addr, |ksym| ksym.addr)?;
        // With the symbol type honored, skip over non-text symbols at
        // lower addresses to find the nearest function instead.
        self.syms[..=idx]
            .iter()
            .rev()
            .find(|ksym| !opts.functions_only || ksym.is_function())
    }
}

impl SymbolCache for KernelSymbolCache {
    fn refresh(&mut self) -> Result<()> {
        self.load()
    }

    fn resolve_addr(&mut self, addr: Addr, opts: &SymbolOpts) -> Result<Option<ResolvedSymbol>> {
        let () = self.ensure_loaded()?;

        let sym = self.find_ksym(addr, opts).map(|ksym| ResolvedSymbol {
            // Kernel symbols are typically plain C names for which
            // demangling is a no-op.
            demangled: if opts.demangle {
                maybe_demangle(&ksym.name)
            } else {
                None
            },
            name: ksym.name.to_string(),
            module: Some(
                ksym.module
                    .as_deref()
                    .unwrap_or("kernel")
                    .to_string(),
            ),
            offset: addr - ksym.addr,
        });
        Ok(sym)
    }

    fn resolve_name(&mut self, _module: Option<&str>, name: &str) -> Result<Option<Addr>> {
        let () = self.ensure_loaded()?;
        Ok(self.by_name.get(name).copied())
    }
}

impl Debug for KernelSymbolCache {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "KernelSymbolCache(\"{}\")", self.path.display())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write as _;

    use tempfile::NamedTempFile;
    use test_log::test;

    use crate::ErrorKind;


    fn test_cache(kallsyms: &[u8]) -> KernelSymbolCache {
        let mut cache = KernelSymbolCache::with_path(Path::new("<dummy>"));
        let () = cache.load_from_reader(kallsyms).unwrap();
        cache
    }

    /// Check that we can parse a kallsyms-style file.
    #[test]
    fn kallsyms_parsing() {
        let kallsyms = br#"ffffffff81000000 T _text
ffffffff81812340 T tcp_sendmsg
ffffffff81812500 T tcp_recvmsg
ffffffff82000000 D vmap_area_lock
ffffffffc0279010 T fuse_dev_init        [fuse]
this line is garbage and has to be skipped
0000000000000000 A irq_stack_union
"#;
        let cache = test_cache(kallsyms);
        assert_eq!(cache.syms.len(), 5);

        let ksym = &cache.syms[1];
        assert_eq!(&*ksym.name, "tcp_sendmsg");
        assert_eq!(ksym.addr, 0xffffffff81812340);
        assert_eq!(ksym.module, None);
        assert!(ksym.is_function());

        let ksym = &cache.syms[4];
        assert_eq!(ksym.module.as_deref(), Some("fuse"));
    }

    /// Check address resolution, including nearest-preceding-symbol
    /// behavior.
    #[test]
    fn addr_resolution() {
        let kallsyms = br#"ffffffff81000000 T _text
ffffffff81812340 T tcp_sendmsg
ffffffff81812500 T tcp_recvmsg
"#;
        let mut cache = test_cache(kallsyms);
        let opts = SymbolOpts::default();

        let sym = cache
            .resolve_addr(0xffffffff81812345, &opts)
            .unwrap()
            .unwrap();
        assert_eq!(sym.name, "tcp_sendmsg");
        assert_eq!(sym.offset, 5);
        assert_eq!(sym.module.as_deref(), Some("kernel"));

        let sym = cache
            .resolve_addr(0xffffffff81812340, &opts)
            .unwrap()
            .unwrap();
        assert_eq!(sym.offset, 0);

        // Addresses past the last symbol resolve to it.
        let sym = cache
            .resolve_addr(0xffffffff91812340, &opts)
            .unwrap()
            .unwrap();
        assert_eq!(sym.name, "tcp_recvmsg");

        // Addresses before the first symbol don't resolve at all.
        assert_eq!(cache.resolve_addr(0x1000, &opts).unwrap(), None);
    }

    /// Check that non-text symbols are skipped when only functions are
    /// requested.
    #[test]
    fn function_filtering() {
        let kallsyms = br#"ffffffff81000000 T _text
ffffffff81100000 D some_data
"#;
        let mut cache = test_cache(kallsyms);

        let opts = SymbolOpts::default();
        let sym = cache.resolve_addr(0xffffffff81100010, &opts).unwrap().unwrap();
        assert_eq!(sym.name, "_text");

        let opts = SymbolOpts {
            functions_only: false,
            ..SymbolOpts::default()
        };
        let sym = cache.resolve_addr(0xffffffff81100010, &opts).unwrap().unwrap();
        assert_eq!(sym.name, "some_data");
    }

    /// Check that mangled names are demangled on request while plain C
    /// names pass through untouched.
    #[cfg(feature = "demangle")]
    #[test]
    fn mangled_name_handling() {
        let kallsyms = br#"ffffffff81000000 T _text
ffffffff81800000 t _Z3foov
"#;
        let mut cache = test_cache(kallsyms);

        let opts = SymbolOpts::default();
        let sym = cache.resolve_addr(0xffffffff81800010, &opts).unwrap().unwrap();
        assert_eq!(sym.name, "_Z3foov");
        assert_eq!(sym.demangled.as_deref(), Some("foo()"));

        let sym = cache.resolve_addr(0xffffffff81000010, &opts).unwrap().unwrap();
        assert_eq!(sym.name, "_text");
        assert_eq!(sym.demangled, None);

        let opts = SymbolOpts {
            demangle: false,
            ..SymbolOpts::default()
        };
        let sym = cache.resolve_addr(0xffffffff81800010, &opts).unwrap().unwrap();
        assert_eq!(sym.demangled, None);
    }

    /// Check name resolution and the first-occurrence-wins policy for
    /// duplicated names.
    #[test]
    fn name_resolution() {
        let kallsyms = br#"ffffffff81000000 T _text
ffffffff81812340 T tcp_sendmsg
ffffffff81912340 t duplicated
ffffffff81a12340 t duplicated
"#;
        let mut cache = test_cache(kallsyms);
        let addr = cache.resolve_name(None, "tcp_sendmsg").unwrap();
        assert_eq!(addr, Some(0xffffffff81812340));

        let addr = cache.resolve_name(None, "duplicated").unwrap();
        assert_eq!(addr, Some(0xffffffff81912340));

        assert_eq!(cache.resolve_name(None, "no_such_symbol").unwrap(), None);
    }

    /// Check that a refresh picks up new file contents.
    #[test]
    fn refresh_rereads() {
        let mut file = NamedTempFile::new().unwrap();
        let () = file
            .write_all(b"ffffffff81000000 T _text\n")
            .unwrap();
        let () = file.flush().unwrap();

        let mut cache = KernelSymbolCache::with_path(file.path());
        let addr = cache.resolve_name(None, "_text").unwrap();
        assert_eq!(addr, Some(0xffffffff81000000));
        assert_eq!(cache.resolve_name(None, "late_symbol").unwrap(), None);

        let () = file
            .write_all(b"ffffffff81800000 T late_symbol\n")
            .unwrap();
        let () = file.flush().unwrap();

        let () = cache.refresh().unwrap();
        let addr = cache.resolve_name(None, "late_symbol").unwrap();
        assert_eq!(addr, Some(0xffffffff81800000));
    }

    /// A missing kallsyms file surfaces as an error.
    #[test]
    fn missing_file() {
        let mut cache = KernelSymbolCache::with_path(Path::new("/no/such/kallsyms/file"));
        let err = cache.resolve_name(None, "_text").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
