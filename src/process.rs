use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::fs::File;
use std::ops::Range;
use std::path::Path;
use std::path::PathBuf;

use crate::buildid::read_build_id;
use crate::demangle::maybe_demangle;
use crate::elf::debug_link::find_debug_file_via_buildid;
use crate::elf::debug_link::find_debug_file_via_debuglink;
use crate::elf::debug_link::read_debug_link;
use crate::elf::types::ET_EXEC;
use crate::elf::ElfParser;
use crate::elf::SymTab;
use crate::log::debug;
use crate::log::warn;
use crate::maps;
use crate::maps::PathName;
use crate::module_path::ModulePath;
use crate::perf_map::PerfMap;
use crate::proc::ProcessIdentity;
use crate::util::find_match_or_lower_bound_by_key;
use crate::vdso::create_vdso_parser;
use crate::vdso::VDSO_MAPS_COMPONENT;
use crate::vdso::VDSO_MODULE;
use crate::Addr;
use crate::Error;
use crate::ErrorExt as _;
use crate::Pid;
use crate::ResolvedSymbol;
use crate::Result;
use crate::SymbolCache;
use crate::SymbolOpts;


/// A symbol name, possibly not read out of the string table yet.
///
/// Symbol tables can be huge while typically only a handful of symbols
/// are ever reported. We hence defer string table accesses until a
/// name is actually needed and then promote it in place.
#[derive(Debug)]
enum SymName {
    /// The name still resides in a string table of the (pinned-open)
    /// backing file.
    Lazy {
        /// The index of the string table section.
        strtab_idx: usize,
        /// The name's offset inside the string table.
        name_off: usize,
        /// Whether the string table lives in the separate debug file.
        in_debug: bool,
    },
    /// The name has been read out.
    Resolved(Box<str>),
}


/// A symbol of a process module.
#[derive(Debug)]
struct Sym {
    /// The symbol's start address in the module's symbol space.
    start: Addr,
    size: u64,
    function: bool,
    name: SymName,
}


/// What a module is backed by.
#[derive(Debug)]
enum Backing {
    /// A file, resolved through the process' mount namespace.
    File(PathBuf),
    /// The vDSO image, which only exists in process memory.
    Vdso,
    /// A perf map covering JIT generated code.
    PerfMap(PathBuf),
}


#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ModuleType {
    /// A position dependent executable; symbol values are process
    /// addresses already.
    Exec,
    /// A shared object (or position independent executable); symbol
    /// values need translation through the load bias.
    So,
    Vdso,
    /// Perf map entries carry absolute addresses.
    PerfMap,
}


/// The loaded state of a module, established lazily on first use.
struct Loaded {
    type_: ModuleType,
    /// The file offset of the first executable `PT_LOAD` segment.
    sym_base_offset: u64,
    /// The virtual address of the first executable `PT_LOAD` segment.
    sym_base_addr: u64,
    /// All symbols, sorted by (start, size).
    syms: Vec<Sym>,
    parser: Option<ElfParser>,
    debug_parser: Option<ElfParser>,
    perf_map: Option<PerfMap>,
    /// Keeps the backing file pinned open.
    _module_path: Option<ModulePath>,
}

impl Debug for Loaded {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Loaded")
            .field("type_", &self.type_)
            .field("syms", &self.syms.len())
            .finish()
    }
}


/// A module of a process, i.e., one mapped executable entity.
#[derive(Debug)]
struct Module {
    /// The name under which the module is reported, i.e., its path as
    /// the process sees it (or `[vdso]`).
    name: String,
    backing: Backing,
    /// The virtual address ranges the module occupies, together with
    /// the file offset each range maps.
    ranges: Vec<(Range<Addr>, u64)>,
    /// The loaded state; populated on first use.
    state: Option<Loaded>,
    load_attempted: bool,
}

impl Module {
    fn new(name: String, backing: Backing) -> Self {
        Self {
            name,
            backing,
            ranges: Vec::new(),
            state: None,
            load_attempted: false,
        }
    }

    /// Check whether the module's mapped ranges cover the address.
    fn covers(&self, addr: Addr) -> bool {
        self.ranges.iter().any(|(range, _offset)| range.contains(&addr))
    }

    /// Collect the resolvable symbols of the given ELF symbol table.
    fn collect_elf_syms(
        parser: &ElfParser,
        tab: SymTab,
        in_debug: bool,
        syms: &mut Vec<Sym>,
    ) -> Result<()> {
        let symtab = if let Some(symtab) = parser.symbol_table(tab)? {
            symtab
        } else {
            return Ok(())
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
                    in_debug,
                },
            });
        }
        Ok(())
    }

    fn load_file(&self, path: &Path, identity: &ProcessIdentity, opts: &SymbolOpts) -> Result<Loaded> {
        let module_path = ModulePath::open(identity, path)?;
        let parser = ElfParser::open(&module_path.fd_path())
            .with_context(|| format!("failed to parse `{}`", module_path.ns_path().display()))?;

        let type_ = if parser.e_type()? == ET_EXEC {
            ModuleType::Exec
        } else {
            ModuleType::So
        };
        let (sym_base_offset, sym_base_addr) = parser.exec_segment()?.unwrap_or((0, 0));

        let mut syms = Vec::new();
        let () = Self::collect_elf_syms(&parser, SymTab::Sym, false, &mut syms)?;
        let () = Self::collect_elf_syms(&parser, SymTab::Dyn, false, &mut syms)?;

        // If the binary is stripped, look for a separate debug file via
        // its build ID or its `.gnu_debuglink` section.
        let mut debug_parser = None;
        if syms.is_empty() && opts.use_debug_file {
            let root = identity.root_path();
            let debug_path = match read_build_id(&parser)? {
                Some(build_id) => find_debug_file_via_buildid(&build_id, &root),
                None => None,
            };
            let debug_path = match debug_path {
                Some(debug_path) => Some(debug_path),
                None => match read_debug_link(&parser)? {
                    Some((name, crc)) => {
                        let binary = root.join(path.strip_prefix("/").unwrap_or(path));
                        find_debug_file_via_debuglink(
                            &binary,
                            &name,
                            crc,
                            opts.check_debug_file_crc,
                            &root,
                        )
                    }
                    None => None,
                },
            };

            if let Some(debug_path) = debug_path {
                debug!(
                    "using debug file `{}` for `{}`",
                    debug_path.display(),
                    path.display()
                );
                let parser = ElfParser::open(&debug_path)
                    .with_context(|| format!("failed to parse `{}`", debug_path.display()))?;
                let () = Self::collect_elf_syms(&parser, SymTab::Sym, true, &mut syms)?;
                debug_parser = Some(parser);
            }
        }

        let () = syms.sort_by_key(|sym| (sym.start, sym.size));

        Ok(Loaded {
            type_,
            sym_base_offset,
            sym_base_addr,
            syms,
            parser: Some(parser),
            debug_parser,
            perf_map: None,
            _module_path: Some(module_path),
        })
    }

    fn load_vdso(&self, pid: Pid) -> Result<Loaded> {
        let range = self
            .ranges
            .first()
            .map(|(range, _offset)| range.clone())
            .unwrap_or(0..0);
        let parser = create_vdso_parser(pid, &range)?;
        let (sym_base_offset, sym_base_addr) = parser.exec_segment()?.unwrap_or((0, 0));

        let mut syms = Vec::new();
        let () = Self::collect_elf_syms(&parser, SymTab::Dyn, false, &mut syms)?;
        let () = Self::collect_elf_syms(&parser, SymTab::Sym, false, &mut syms)?;
        let () = syms.sort_by_key(|sym| (sym.start, sym.size));

        Ok(Loaded {
            type_: ModuleType::Vdso,
            sym_base_offset,
            sym_base_addr,
            syms,
            parser: Some(parser),
            debug_parser: None,
            perf_map: None,
            _module_path: None,
        })
    }

    fn load_perf_map(&self, path: &Path) -> Result<Loaded> {
        let file =
            File::open(path).with_context(|| format!("failed to open `{}`", path.display()))?;
        let perf_map = PerfMap::from_file(path, &file)?;
        Ok(Loaded {
            type_: ModuleType::PerfMap,
            sym_base_offset: 0,
            sym_base_addr: 0,
            syms: Vec::new(),
            parser: None,
            debug_parser: None,
            perf_map: Some(perf_map),
            _module_path: None,
        })
    }

    /// Load the module's symbols if that has not happened yet. A failed
    /// attempt is not retried.
    fn ensure_loaded(&mut self, identity: &ProcessIdentity, opts: &SymbolOpts) {
        if self.load_attempted {
            return
        }
        self.load_attempted = true;

        let result = match &self.backing {
            Backing::File(path) => self.load_file(path, identity, opts),
            Backing::Vdso => self.load_vdso(identity.pid()),
            Backing::PerfMap(path) => self.load_perf_map(path),
        };
        match result {
            Ok(loaded) => self.state = Some(loaded),
            Err(err) => {
                warn!("failed to load symbols for `{}`: {err}", self.name);
            }
        }
    }

    /// Translate a process address into the module's symbol space.
    ///
    /// For executables symbol values are process addresses already. For
    /// shared objects (and the vDSO) the address is first converted into
    /// a file offset via the mapping and then shifted into the virtual
    /// address space of the ELF file proper.
    fn search_addr(&self, addr: Addr) -> Option<Addr> {
        let loaded = self.state.as_ref()?;
        let (range, file_offset) = self
            .ranges
            .iter()
            .find(|(range, _offset)| range.contains(&addr))?;
        match loaded.type_ {
            ModuleType::Exec | ModuleType::PerfMap => Some(addr),
            ModuleType::So | ModuleType::Vdso => {
                let offset = addr - range.start + file_offset;
                (offset + loaded.sym_base_addr).checked_sub(loaded.sym_base_offset)
            }
        }
    }

    /// Translate a symbol-space address back into the process' address
    /// space.
    fn translate_to_process(&self, sym_addr: Addr) -> Option<Addr> {
        let loaded = self.state.as_ref()?;
        match loaded.type_ {
            ModuleType::Exec | ModuleType::PerfMap => Some(sym_addr),
            ModuleType::So | ModuleType::Vdso => {
                let offset =
                    (sym_addr + loaded.sym_base_offset).checked_sub(loaded.sym_base_addr)?;
                self.ranges
                    .iter()
                    .find(|(range, file_offset)| {
                        let len = range.end - range.start;
                        (*file_offset..*file_offset + len).contains(&offset)
                    })
                    .map(|(range, file_offset)| offset - file_offset + range.start)
            }
        }
    }

    /// Read out (and cache) the name of the symbol at the given index.
    fn sym_name(&mut self, idx: usize) -> Result<&str> {
        let loaded = self
            .state
            .as_mut()
            .ok_or_else(|| Error::with_invalid_input("module is not loaded"))?;
        let Loaded {
            syms,
            parser,
            debug_parser,
            ..
        } = loaded;

        let sym = &mut syms[idx];
        if let SymName::Lazy {
            strtab_idx,
            name_off,
            in_debug,
        } = sym.name
        {
            let parser = if in_debug { debug_parser } else { parser };
            let parser = parser
                .as_ref()
                .ok_or_else(|| Error::with_invalid_input("module has no parser"))?;
            let name = parser.string_at(strtab_idx, name_off)?;
            sym.name = SymName::Resolved(Box::from(name));
        }

        match &sym.name {
            SymName::Resolved(name) => Ok(name),
            // The lazy case was just promoted above.
            SymName::Lazy { .. } => Err(Error::with_invalid_input("symbol name unset")),
        }
    }

    /// Find the symbol covering the given symbol-space address,
    /// returning its index.
    fn find_sym_idx(&self, target: Addr, opts: &SymbolOpts) -> Option<usize> {
        let loaded = self.state.as_ref()?;
        let idx = find_match_or_lower_bound_by_key(&loaded.syms, target, |sym| sym.start)?;
        // Symbols can overlap and zero sized ones abound. Walk backwards
        // from the closest preceding start until a covering symbol is
        // found.
        for idx in (0..=idx).rev() {
            let sym = &loaded.syms[idx];
            if opts.functions_only && !sym.function {
                continue
            }
            // A symbol size large enough to overflow is bogus; treat
            // the symbol as not covering anything.
            let end = sym.start.checked_add(sym.size);
            if (sym.start == target && sym.size == 0)
                || end.map(|end| sym.start <= target && target < end).unwrap_or(false)
            {
                return Some(idx)
            }
        }
        None
    }

    fn resolve_addr(
        &mut self,
        addr: Addr,
        opts: &SymbolOpts,
    ) -> Result<Option<ResolvedSymbol>> {
        // Perf map symbols are held by the map itself.
        if let Some(loaded) = &self.state {
            if let Some(perf_map) = &loaded.perf_map {
                let sym = perf_map.find_addr(addr).map(|(name, start)| ResolvedSymbol {
                    name: name.to_string(),
                    demangled: None,
                    module: Some(self.name.clone()),
                    offset: addr - start,
                });
                return Ok(sym)
            }
        }

        let target = if let Some(target) = self.search_addr(addr) {
            target
        } else {
            return Ok(None)
        };
        let idx = if let Some(idx) = self.find_sym_idx(target, opts) {
            idx
        } else {
            return Ok(None)
        };
        let start = match &self.state {
            Some(loaded) => loaded.syms[idx].start,
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
            module: Some(self.name.clone()),
            offset: target - start,
        };
        Ok(Some(resolved))
    }

    fn resolve_name(&mut self, name: &str) -> Result<Option<Addr>> {
        if let Some(loaded) = &self.state {
            if let Some(perf_map) = &loaded.perf_map {
                return Ok(perf_map.find_name(name))
            }
        }

        let count = match &self.state {
            Some(loaded) => loaded.syms.len(),
            None => return Ok(None),
        };
        for idx in 0..count {
            if self.sym_name(idx)? == name {
                let start = match &self.state {
                    Some(loaded) => loaded.syms[idx].start,
                    None => return Ok(None),
                };
                return Ok(self.translate_to_process(start))
            }
        }
        Ok(None)
    }

    /// Check whether the module matches the given name, either in full
    /// or by file name.
    fn matches(&self, name: &str) -> bool {
        if self.name == name {
            return true
        }
        Path::new(&self.name)
            .file_name()
            .map(|file| file == name)
            .unwrap_or(false)
    }
}


/// A symbol cache for the user-space portion of a single process.
///
/// Modules are enumerated from `/proc/<pid>/maps` and their symbol
/// tables are loaded lazily, on the first address or name that actually
/// falls into a module. Files are accessed via the process' mount
/// namespace root, so symbolization works for containerized processes
/// and keeps working after unlink or process exit.
pub struct ProcessSymbolCache {
    identity: ProcessIdentity,
    modules: Vec<Module>,
    modules_loaded: bool,
}

impl ProcessSymbolCache {
    /// Create a symbol cache for the process with the given PID.
    pub fn new(pid: Pid) -> Self {
        Self {
            identity: ProcessIdentity::new(pid),
            modules: Vec::new(),
            modules_loaded: false,
        }
    }

    fn load_modules(&mut self) -> Result<()> {
        let pid = self.identity.pid();
        let mut modules = Vec::<Module>::new();
        let mut anon_exec = Vec::<(Range<Addr>, u64)>::new();

        let entries = maps::parse(pid)?;
        for entry in entries {
            let entry = entry?;
            if !entry.is_executable() {
                continue
            }

            match &entry.path_name {
                Some(PathName::Path(path)) => {
                    let name = path.to_string_lossy().into_owned();
                    let module = match modules.iter_mut().find(|module| module.name == name) {
                        Some(module) => module,
                        None => {
                            let () = modules
                                .push(Module::new(name, Backing::File(path.clone())));
                            // SANITY: The module was just pushed.
                            modules.last_mut().unwrap()
                        }
                    };
                    let () = module.ranges.push((entry.range.clone(), entry.offset));
                }
                Some(PathName::Component(component)) if component == VDSO_MAPS_COMPONENT => {
                    let mut module = Module::new(VDSO_MODULE.to_string(), Backing::Vdso);
                    let () = module.ranges.push((entry.range.clone(), entry.offset));
                    let () = modules.push(module);
                }
                Some(PathName::Component(..)) => (),
                None => {
                    let () = anon_exec.push((entry.range.clone(), entry.offset));
                }
            }
        }

        // JIT compiled code lives in anonymous executable mappings; a
        // perf map file, if the runtime emits one, covers those.
        let perf_map_path = PerfMap::path(pid, &self.identity.root_path());
        if !anon_exec.is_empty() && perf_map_path.exists() {
            let mut module = Module::new(
                perf_map_path.to_string_lossy().into_owned(),
                Backing::PerfMap(perf_map_path),
            );
            module.ranges = anon_exec;
            let () = modules.push(module);
        }

        self.modules = modules;
        self.modules_loaded = true;
        debug!("enumerated {} modules for process {pid}", self.modules.len());
        Ok(())
    }

    fn ensure_modules(&mut self) -> Result<()> {
        if !self.modules_loaded {
            let () = self.load_modules()?;
        }
        Ok(())
    }

    /// Throw away all cached state and start over, e.g., after the
    /// process underwent an exec.
    fn reload(&mut self) -> Result<()> {
        self.modules = Vec::new();
        self.modules_loaded = false;
        let _refreshed = self.identity.refresh_root();
        self.identity.reset();
        self.load_modules()
    }
}

impl SymbolCache for ProcessSymbolCache {
    fn refresh(&mut self) -> Result<()> {
        self.reload()
    }

    fn resolve_addr(&mut self, addr: Addr, opts: &SymbolOpts) -> Result<Option<ResolvedSymbol>> {
        if self.modules_loaded && self.identity.is_stale() {
            let () = self.reload()?;
        }
        let () = self.ensure_modules()?;

        let identity = &self.identity;
        if !opts.lazy_symbolize {
            for module in self.modules.iter_mut() {
                let () = module.ensure_loaded(identity, opts);
            }
        }
        let module = match self.modules.iter_mut().find(|module| module.covers(addr)) {
            Some(module) => module,
            None => return Ok(None),
        };
        let () = module.ensure_loaded(identity, opts);
        module.resolve_addr(addr, opts)
    }

    fn resolve_name(&mut self, module: Option<&str>, name: &str) -> Result<Option<Addr>> {
        let () = self.ensure_modules()?;

        let identity = &self.identity;
        for candidate in self.modules.iter_mut() {
            if let Some(module) = module {
                if !candidate.matches(module) {
                    continue
                }
            }
            let () = candidate.ensure_loaded(identity, &SymbolOpts::default());
            if let Some(addr) = candidate.resolve_name(name)? {
                return Ok(Some(addr))
            }
        }
        Ok(None)
    }
}

impl Debug for ProcessSymbolCache {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(
            f,
            "ProcessSymbolCache({}, {} modules)",
            self.identity.pid(),
            self.modules.len()
        )
    }
}
