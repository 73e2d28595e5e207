use std::cell::OnceCell;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::fs::File;
use std::mem;
use std::mem::size_of;
use std::ops::Deref as _;
use std::path::Path;

use crate::mmap::Mmap;
use crate::util::AlignedBytes;
use crate::util::ReadRaw as _;
use crate::Error;
use crate::ErrorExt as _;
use crate::IntoError as _;
use crate::Result;

use super::types::Elf64_Ehdr;
use super::types::Elf64_Phdr;
use super::types::Elf64_Shdr;
use super::types::Elf64_Sym;
use super::types::PF_X;
use super::types::PT_LOAD;
use super::types::SHT_DYNSYM;
use super::types::SHT_SYMTAB;


/// An enumeration of the two ELF symbol tables we work with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SymTab {
    /// The regular symbol table, `.symtab`.
    Sym,
    /// The dynamic symbol table, `.dynsym`.
    Dyn,
}


/// A symbol table section together with the index of its associated
/// string table section (as per the section's `sh_link`).
#[derive(Debug)]
pub(crate) struct SymTabRef<'elf> {
    pub syms: &'elf [Elf64_Sym],
    pub strtab_idx: usize,
}


/// The memory backing an [`ElfParser`].
enum ElfMem {
    Mmap(Mmap),
    Owned(AlignedBytes),
}

impl ElfMem {
    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Mmap(mmap) => mmap.deref(),
            Self::Owned(bytes) => bytes.deref(),
        }
    }
}


struct Cache<'elf> {
    /// A slice of the raw ELF data that we are about to parse.
    elf_data: &'elf [u8],
    /// The cached ELF header.
    ehdr: OnceCell<&'elf Elf64_Ehdr>,
    /// The cached ELF section headers.
    shdrs: OnceCell<&'elf [Elf64_Shdr]>,
    /// The cached section name string table.
    shstrtab: OnceCell<&'elf [u8]>,
    /// The cached ELF program headers.
    phdrs: OnceCell<&'elf [Elf64_Phdr]>,
}

impl<'elf> Cache<'elf> {
    fn new(elf_data: &'elf [u8]) -> Self {
        Self {
            elf_data,
            ehdr: OnceCell::new(),
            shdrs: OnceCell::new(),
            shstrtab: OnceCell::new(),
            phdrs: OnceCell::new(),
        }
    }

    fn parse_ehdr(&self) -> Result<&'elf Elf64_Ehdr> {
        let mut elf_data = self.elf_data;
        let ehdr = elf_data
            .read_pod_ref::<Elf64_Ehdr>()
            .ok_or_invalid_data(|| "failed to read Elf64_Ehdr")?;
        if !(ehdr.e_ident[0] == 0x7f
            && ehdr.e_ident[1] == b'E'
            && ehdr.e_ident[2] == b'L'
            && ehdr.e_ident[3] == b'F')
        {
            return Err(Error::with_invalid_data(format!(
                "encountered unexpected e_ident: {:x?}",
                &ehdr.e_ident[0..4]
            )))
        }
        Ok(ehdr)
    }

    fn ensure_ehdr(&self) -> Result<&'elf Elf64_Ehdr> {
        if let Some(ehdr) = self.ehdr.get() {
            return Ok(ehdr)
        }
        let ehdr = self.parse_ehdr()?;
        Ok(self.ehdr.get_or_init(|| ehdr))
    }

    fn ensure_shdrs(&self) -> Result<&'elf [Elf64_Shdr]> {
        if let Some(shdrs) = self.shdrs.get() {
            return Ok(shdrs)
        }
        let ehdr = self.ensure_ehdr()?;
        let shdrs = self
            .elf_data
            .get(ehdr.e_shoff as usize..)
            .ok_or_invalid_data(|| "Elf64_Ehdr::e_shoff is invalid")?
            .read_pod_slice_ref::<Elf64_Shdr>(usize::from(ehdr.e_shnum))
            .ok_or_invalid_data(|| "failed to read Elf64_Shdr")?;
        Ok(self.shdrs.get_or_init(|| shdrs))
    }

    fn ensure_phdrs(&self) -> Result<&'elf [Elf64_Phdr]> {
        if let Some(phdrs) = self.phdrs.get() {
            return Ok(phdrs)
        }
        let ehdr = self.ensure_ehdr()?;
        let phdrs = self
            .elf_data
            .get(ehdr.e_phoff as usize..)
            .ok_or_invalid_data(|| "Elf64_Ehdr::e_phoff is invalid")?
            .read_pod_slice_ref::<Elf64_Phdr>(usize::from(ehdr.e_phnum))
            .ok_or_invalid_data(|| "failed to read Elf64_Phdr")?;
        Ok(self.phdrs.get_or_init(|| phdrs))
    }

    fn ensure_shstrtab(&self) -> Result<&'elf [u8]> {
        if let Some(shstrtab) = self.shstrtab.get() {
            return Ok(shstrtab)
        }
        let ehdr = self.ensure_ehdr()?;
        let shstrtab = self.section_data(usize::from(ehdr.e_shstrndx))?;
        Ok(self.shstrtab.get_or_init(|| shstrtab))
    }

    /// Retrieve the raw section data for the ELF section at index
    /// `idx`.
    fn section_data(&self, idx: usize) -> Result<&'elf [u8]> {
        let shdrs = self.ensure_shdrs()?;
        let section = shdrs
            .get(idx)
            .ok_or_invalid_input(|| format!("ELF section index ({idx}) out of bounds"))?;

        let data = self
            .elf_data
            .get(section.sh_offset as usize..)
            .ok_or_invalid_data(|| "failed to read section data: invalid offset")?
            .read_slice(section.sh_size as usize)
            .ok_or_invalid_data(|| "failed to read section data: invalid size")?;
        Ok(data)
    }

    /// Get the name of the section at a given index.
    fn section_name(&self, idx: usize) -> Result<&'elf str> {
        let shdrs = self.ensure_shdrs()?;
        let shstrtab = self.ensure_shstrtab()?;

        let sect = shdrs
            .get(idx)
            .ok_or_invalid_input(|| "ELF section index out of bounds")?;
        let name = shstrtab
            .get(sect.sh_name as usize..)
            .ok_or_invalid_input(|| "string table index out of bounds")?
            .read_cstr()
            .ok_or_invalid_input(|| "no valid string found in string table")?
            .to_str()
            .map_err(Error::with_invalid_data)
            .context("invalid section name")?;
        Ok(name)
    }

    /// Find a section of a given name, returning its index.
    fn find_section(&self, name: &str) -> Result<Option<usize>> {
        let shdrs = self.ensure_shdrs()?;
        for idx in 1..shdrs.len() {
            if self.section_name(idx)? == name {
                return Ok(Some(idx))
            }
        }
        Ok(None)
    }

    /// Find the first section of the given type, returning its index.
    fn find_section_by_type(&self, sh_type: u32) -> Result<Option<usize>> {
        let shdrs = self.ensure_shdrs()?;
        let idx = shdrs.iter().position(|shdr| shdr.sh_type == sh_type);
        Ok(idx)
    }

    fn symbol_table(&self, tab: SymTab) -> Result<Option<SymTabRef<'elf>>> {
        let sh_type = match tab {
            SymTab::Sym => SHT_SYMTAB,
            SymTab::Dyn => SHT_DYNSYM,
        };
        let idx = if let Some(idx) = self.find_section_by_type(sh_type)? {
            idx
        } else {
            return Ok(None)
        };
        let shdrs = self.ensure_shdrs()?;
        // SANITY: We just found the index so the section is present.
        let shdr = shdrs.get(idx).unwrap();
        let strtab_idx = usize::try_from(shdr.sh_link).unwrap_or(0);

        let mut data = self.section_data(idx)?;
        if data.len() % size_of::<Elf64_Sym>() != 0 {
            return Err(Error::with_invalid_data(
                "size of symbol table section is invalid",
            ))
        }
        let count = data.len() / size_of::<Elf64_Sym>();
        let syms = data
            .read_pod_slice_ref::<Elf64_Sym>(count)
            .ok_or_invalid_data(|| "failed to read symbol table contents")?;
        Ok(Some(SymTabRef { syms, strtab_idx }))
    }
}

impl Debug for Cache<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "Cache")
    }
}


/// A parser for ELF64 files.
///
/// The parser is purely in-memory and zero-copy: symbol and string
/// table accesses hand out references into the backing memory, which is
/// why consumers that defer name resolution keep the parser alive and
/// store indices into its string tables rather than strings.
pub(crate) struct ElfParser {
    /// A cache for relevant parts of the ELF file.
    // SAFETY: We must not hand out references with a 'static lifetime
    //         to this member. Rather, they should never outlive `self`.
    //         Furthermore, this member has to be listed before `_mem`
    //         to make sure we never end up with a dangling reference.
    cache: Cache<'static>,
    /// The memory backing the parse.
    _mem: ElfMem,
}

impl ElfParser {
    fn from_mem(mem: ElfMem) -> Self {
        // We transmute the memory's lifetime to static here as that is
        // a necessity for self-referentiality.
        // SAFETY: We never hand out any 'static references to cache
        //         data.
        let elf_data = unsafe { mem::transmute::<&[u8], &'static [u8]>(mem.as_slice()) };
        Self {
            cache: Cache::new(elf_data),
            _mem: mem,
        }
    }

    /// Create an `ElfParser` from an open file.
    pub fn open_file(file: &File) -> Result<Self> {
        Mmap::map(file)
            .map(|mmap| Self::from_mem(ElfMem::Mmap(mmap)))
            .context("failed to memory map file")
    }

    /// Create an `ElfParser` for a path.
    pub fn open(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("failed to open `{}`", path.display()))?;
        Self::open_file(&file)
    }

    /// Create an `ElfParser` from bytes read into memory, e.g., the
    /// vDSO image of a process.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self::from_mem(ElfMem::Owned(AlignedBytes::new(bytes)))
    }

    /// Retrieve the ELF object file type (`ET_EXEC`, `ET_DYN`, ...).
    pub fn e_type(&self) -> Result<u16> {
        let ehdr = self.cache.ensure_ehdr()?;
        Ok(ehdr.e_type)
    }

    /// Retrieve the data corresponding to the ELF section at index
    /// `idx`.
    pub fn section_data(&self, idx: usize) -> Result<&[u8]> {
        self.cache.section_data(idx)
    }

    /// Find the section of a given name, returning its index.
    pub fn find_section(&self, name: &str) -> Result<Option<usize>> {
        self.cache.find_section(name)
    }

    pub fn section_headers(&self) -> Result<&[Elf64_Shdr]> {
        self.cache.ensure_shdrs()
    }

    /// Retrieve the symbol table of the given kind, if present.
    pub fn symbol_table(&self, tab: SymTab) -> Result<Option<SymTabRef<'_>>> {
        self.cache.symbol_table(tab)
    }

    /// Read the NUL terminated string at offset `offset` of the string
    /// table section at index `section_idx`.
    pub fn string_at(&self, section_idx: usize, offset: usize) -> Result<&str> {
        let data = self.cache.section_data(section_idx)?;
        let name = data
            .get(offset..)
            .ok_or_invalid_input(|| "string table index out of bounds")?
            .read_cstr()
            .ok_or_invalid_input(|| "no valid string found in string table")?
            .to_str()
            .map_err(Error::with_invalid_data)
            .context("invalid symbol name")?;
        Ok(name)
    }

    /// Find the file offset and virtual address of the first executable
    /// `PT_LOAD` segment.
    ///
    /// The pair anchors the translation between file offsets and the
    /// ELF virtual address space that symbol values live in.
    pub fn exec_segment(&self) -> Result<Option<(u64, u64)>> {
        let phdrs = self.cache.ensure_phdrs()?;
        let segment = phdrs
            .iter()
            .find(|phdr| phdr.p_type == PT_LOAD && phdr.p_flags & PF_X != 0)
            .map(|phdr| (phdr.p_offset, phdr.p_vaddr));
        Ok(segment)
    }
}

impl Debug for ElfParser {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "ElfParser")
    }
}
