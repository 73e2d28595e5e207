use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::path::Path;
use std::path::PathBuf;

use crate::buildid::read_build_id;
use crate::demangle::maybe_demangle;
use crate::elf::ElfParser;
use crate::elf::SymTab;
use crate::log::debug;
use crate::util::find_match_or_lower_bound_by_key;
use crate::Addr;
use crate::Error;
use crate::ErrorExt as _;
use crate::IntoError as _;
use crate::ResolvedSymbol;
use crate::Result;
use crate::SymbolCache;
use crate::SymbolOpts;


/// A symbol with a name that may not have been read out yet; see
/// [`crate::process`] for the rationale of deferring string table
/// accesses.
#[derive(Debug)]
enum SymName {
    Lazy { strtab_idx: usize, name_off: usize },
    Resolved(Box<str>),
}

#[derive(Debug)]
struct Sym {
    start: Addr,
    size: u64,
    function: bool,
    name: SymName,
}


struct BuildModule {
    path: PathBuf,
    /// The parser and sorted symbols; populated on first resolution.
    state: Option<(ElfParser, Vec<Sym>)>,
}

impl BuildModule {
    fn ensure_loaded(&mut self) -> Result<()> {
        if self.state.is_some() {
            return Ok(())
        }

        let parser = ElfParser::open(&self.path)
            .with_context(|| format!("failed to parse `{}`", self.path.display()))?;
        let mut syms = Vec::new();
        for tab in [SymTab::Sym, SymTab::Dyn] {
            let symtab = match parser.symbol_table(tab)? {
                Some(symtab) => symtab,
                None => continue,
            };
            for sym in symtab.syms {
                if !sym.is_resolvable(false) || sym.st_name == 0 {
                    continue
                }
                let () = syms.push(Sym {
                    start: sym.st_value,
                    size: sym.st_size,
                    function: sym.is_function(),
                    name: SymName::Lazy {
                        strtab_idx: symtab.strtab_idx,
                        name_off: sym.st_name as usize,
                    },
                });
            }
        }
        let () = syms.sort_by_key(|sym| (sym.start, sym.size));

        self.state = Some((parser, syms));
        Ok(())
    }

    fn sym_name(&mut self, idx: usize) -> Result<&str> {
        let (parser, syms) = self
            .state
            .as_mut()
            .ok_or_else(|| Error::with_invalid_input("module is not loaded"))?;
        let sym = &mut syms[idx];
        if let SymName::Lazy {
            strtab_idx,
            name_off,
        } = sym.name
        {
            let name = parser.string_at(strtab_idx, name_off)?;
            sym.name = SymName::Resolved(Box::from(name));
        }
        match &sym.name {
            SymName::Resolved(name) => Ok(name),
            // The lazy case was just promoted above.
            SymName::Lazy { .. } => Err(Error::with_invalid_input("symbol name unset")),
        }
    }

    fn resolve_addr(&mut self, addr: Addr, opts: &SymbolOpts) -> Result<Option<ResolvedSymbol>> {
        let () = self.ensure_loaded()?;

        let idx = {
            // SANITY: `ensure_loaded` just succeeded.
            let (_parser, syms) = self.state.as_ref().unwrap();
            let idx = find_match_or_lower_bound_by_key(syms, addr, |sym| sym.start);
            let idx = match idx {
                Some(idx) => idx,
                None => return Ok(None),
            };
            // Addresses here are file-relative, with no mapping to
            // bound them, so only strict containment counts.
            (0..=idx).rev().find(|idx| {
                let sym = &syms[*idx];
                if opts.functions_only && !sym.function {
                    return false
                }
                sym.start
                    .checked_add(sym.size)
                    .map(|end| sym.start <= addr && addr < end)
                    .unwrap_or(false)
            })
        };
        let (idx, start) = match idx {
            Some(idx) => {
                // SANITY: The state was just accessed above.
                let (_parser, syms) = self.state.as_ref().unwrap();
                (idx, syms[idx].start)
            }
            None => return Ok(None),
        };

        let name = self.sym_name(idx)?.to_string();
        let resolved = ResolvedSymbol {
            demangled: if opts.demangle {
                maybe_demangle(&name)
            } else {
                None
            },
            name,
            module: Some(self.path.to_string_lossy().into_owned()),
            offset: addr - start,
        };
        Ok(Some(resolved))
    }

    fn resolve_name(&mut self, name: &str) -> Result<Option<Addr>> {
        let () = self.ensure_loaded()?;

        // SANITY: `ensure_loaded` just succeeded.
        let count = self.state.as_ref().unwrap().1.len();
        for idx in 0..count {
            if self.sym_name(idx)? == name {
                // SANITY: The state was just accessed above.
                let (_parser, syms) = self.state.as_ref().unwrap();
                return Ok(Some(syms[idx].start))
            }
        }
        Ok(None)
    }

    /// Check whether the module matches the given name, either by path
    /// or by file name.
    fn matches(&self, name: &str) -> bool {
        if self.path == Path::new(name) {
            return true
        }
        self.path
            .file_name()
            .map(|file| file == name)
            .unwrap_or(false)
    }
}

impl Debug for BuildModule {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "BuildModule(\"{}\")", self.path.display())
    }
}


/// A symbol cache keyed by GNU build ID rather than by process.
///
/// Useful when samples carry build IDs and file-relative addresses
/// (e.g., perf data processed offline): modules are registered once and
/// addresses are then resolved against the matching binary, regardless
/// of where (or whether) it was mapped.
#[derive(Debug, Default)]
pub struct BuildIdSymbolCache {
    /// Registered modules, keyed (and ordered) by build ID.
    modules: BTreeMap<String, BuildModule>,
}

impl BuildIdSymbolCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a binary, keyed by its build ID. The build ID is read
    /// immediately, the symbol table only on first resolution.
    ///
    /// Returns the binary's build ID.
    pub fn add_module(&mut self, path: &Path) -> Result<String> {
        let parser = ElfParser::open(path)
            .with_context(|| format!("failed to parse `{}`", path.display()))?;
        let build_id = read_build_id(&parser)?
            .ok_or_not_found(|| format!("`{}` carries no build ID", path.display()))?;

        debug!("registered `{}` with build ID {build_id}", path.display());
        let _prev = self.modules.insert(
            build_id.clone(),
            BuildModule {
                path: path.to_path_buf(),
                state: None,
            },
        );
        Ok(build_id)
    }

    /// Remove the module registered under the given build ID.
    pub fn remove_module(&mut self, build_id: &str) -> bool {
        self.modules.remove(build_id).is_some()
    }

    /// Resolve a file-relative address in the module with the given
    /// build ID.
    pub fn resolve_addr(
        &mut self,
        build_id: &str,
        addr: Addr,
        opts: &SymbolOpts,
    ) -> Result<Option<ResolvedSymbol>> {
        let module = match self.modules.get_mut(build_id) {
            Some(module) => module,
            None => return Ok(None),
        };
        module.resolve_addr(addr, opts)
    }
}

impl SymbolCache for BuildIdSymbolCache {
    /// Throw away lazily loaded symbol data; registrations are kept and
    /// the binaries are re-read on the next resolution.
    fn refresh(&mut self) -> Result<()> {
        for module in self.modules.values_mut() {
            module.state = None;
        }
        Ok(())
    }

    /// Resolve a file-relative address against all registered modules,
    /// in build ID order. Prefer
    /// [`resolve_addr`][BuildIdSymbolCache::resolve_addr] with an
    /// explicit build ID where one is known.
    fn resolve_addr(&mut self, addr: Addr, opts: &SymbolOpts) -> Result<Option<ResolvedSymbol>> {
        for module in self.modules.values_mut() {
            if let Some(sym) = module.resolve_addr(addr, opts)? {
                return Ok(Some(sym))
            }
        }
        Ok(None)
    }

    /// Find a symbol by name; `module`, if provided, restricts the
    /// search to the module registered under that build ID or with a
    /// matching path.
    fn resolve_name(&mut self, module: Option<&str>, name: &str) -> Result<Option<Addr>> {
        for (build_id, candidate) in self.modules.iter_mut() {
            if let Some(module) = module {
                if build_id != module && !candidate.matches(module) {
                    continue
                }
            }
            if let Some(addr) = candidate.resolve_name(name)? {
                return Ok(Some(addr))
            }
        }
        Ok(None)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    use tempfile::tempdir;
    use test_log::test;

    use crate::test_helper::ElfImage;


    fn write_image(dir: &Path, name: &str, image: &ElfImage) -> PathBuf {
        let path = dir.join(name);
        let () = fs::write(&path, image.build()).unwrap();
        path
    }

    /// Check registration and address resolution by build ID.
    #[test]
    fn buildid_resolution() {
        let dir = tempdir().unwrap();
        let image = ElfImage {
            funcs: vec![("main", 0x1000, 0x100)],
            build_id: Some(vec![0xab, 0xc1, 0x23]),
            ..ElfImage::default()
        };
        let path = write_image(dir.path(), "app", &image);

        let mut cache = BuildIdSymbolCache::new();
        let build_id = cache.add_module(&path).unwrap();
        assert_eq!(build_id, "abc123");

        let opts = SymbolOpts::default();
        let sym = cache.resolve_addr("abc123", 0x1030, &opts).unwrap().unwrap();
        assert_eq!(sym.name, "main");
        assert_eq!(sym.offset, 0x30);

        // Only strict containment matches.
        assert_eq!(cache.resolve_addr("abc123", 0x1100, &opts).unwrap(), None);
        // Unknown build IDs don't resolve.
        assert_eq!(cache.resolve_addr("ffffff", 0x1030, &opts).unwrap(), None);
    }

    /// Binaries without a build ID are rejected.
    #[test]
    fn missing_build_id() {
        let dir = tempdir().unwrap();
        let image = ElfImage {
            funcs: vec![("main", 0x1000, 0x100)],
            ..ElfImage::default()
        };
        let path = write_image(dir.path(), "app", &image);

        let mut cache = BuildIdSymbolCache::new();
        assert!(cache.add_module(&path).is_err());
    }

    /// Check resolution through the polymorphic cache interface.
    #[test]
    fn trait_based_resolution() {
        let dir = tempdir().unwrap();
        let image = ElfImage {
            funcs: vec![("main", 0x1000, 0x100)],
            build_id: Some(vec![0xab, 0xc1, 0x23]),
            ..ElfImage::default()
        };
        let path = write_image(dir.path(), "app", &image);

        let mut cache = BuildIdSymbolCache::new();
        let build_id = cache.add_module(&path).unwrap();

        let opts = SymbolOpts::default();
        let cache: &mut dyn SymbolCache = &mut cache;
        let sym = cache.resolve_addr(0x1030, &opts).unwrap().unwrap();
        assert_eq!(sym.name, "main");

        let addr = cache.resolve_name(Some(&build_id), "main").unwrap();
        assert_eq!(addr, Some(0x1000));
        let addr = cache.resolve_name(Some("app"), "main").unwrap();
        assert_eq!(addr, Some(0x1000));
        assert_eq!(cache.resolve_name(Some("other"), "main").unwrap(), None);
        assert_eq!(cache.resolve_name(None, "no_such_symbol").unwrap(), None);

        // A refresh keeps registrations; data is simply re-read on the
        // next resolution.
        let () = cache.refresh().unwrap();
        let sym = cache.resolve_addr(0x1030, &opts).unwrap().unwrap();
        assert_eq!(sym.name, "main");
    }

    /// Bogus symbol sizes must not trip up address containment checks.
    #[test]
    fn bogus_symbol_size() {
        let dir = tempdir().unwrap();
        let image = ElfImage {
            funcs: vec![("huge", 0x200, u64::MAX)],
            build_id: Some(vec![0x01]),
            ..ElfImage::default()
        };
        let path = write_image(dir.path(), "app", &image);

        let mut cache = BuildIdSymbolCache::new();
        let build_id = cache.add_module(&path).unwrap();

        let opts = SymbolOpts::default();
        assert_eq!(cache.resolve_addr(&build_id, 0x400, &opts).unwrap(), None);
    }

    /// Check module removal.
    #[test]
    fn module_removal() {
        let dir = tempdir().unwrap();
        let image = ElfImage {
            funcs: vec![("main", 0x1000, 0x100)],
            build_id: Some(vec![0x42]),
            ..ElfImage::default()
        };
        let path = write_image(dir.path(), "app", &image);

        let mut cache = BuildIdSymbolCache::new();
        let build_id = cache.add_module(&path).unwrap();
        assert!(cache.remove_module(&build_id));
        assert!(!cache.remove_module(&build_id));

        let opts = SymbolOpts::default();
        assert_eq!(cache.resolve_addr(&build_id, 0x1030, &opts).unwrap(), None);
    }
}
