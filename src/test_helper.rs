//! Helpers for assembling synthetic ELF images in tests.

use std::mem::size_of;
use std::slice;

use crate::elf::types::Elf64_Ehdr;
use crate::elf::types::Elf64_Nhdr;
use crate::elf::types::Elf64_Phdr;
use crate::elf::types::Elf64_Shdr;
use crate::elf::types::Elf64_Sym;
use crate::elf::types::ET_DYN;
use crate::elf::types::NT_GNU_BUILD_ID;
use crate::elf::types::PF_X;
use crate::elf::types::PT_LOAD;
use crate::elf::types::SHT_NOTE;
use crate::elf::types::SHT_PROGBITS;
use crate::elf::types::SHT_STRTAB;
use crate::elf::types::SHT_SYMTAB;
use crate::elf::types::STT_FUNC;
use crate::util::Pod;


fn bytes_of<T>(value: &T) -> &[u8]
where
    T: Pod,
{
    // SAFETY: `T` is `Pod` and hence can be viewed as raw bytes.
    unsafe { slice::from_raw_parts(value as *const T as *const u8, size_of::<T>()) }
}

fn pad_to(data: &mut Vec<u8>, align: usize) {
    while data.len() % align != 0 {
        let () = data.push(0);
    }
}


/// A description of a synthetic ELF image.
pub(crate) struct ElfImage {
    pub e_type: u16,
    /// The file offset at which the text segment starts.
    pub text_off: u64,
    /// The virtual address of the text segment.
    pub text_vaddr: u64,
    /// Function symbols as (name, value, size) triples.
    pub funcs: Vec<(&'static str, u64, u64)>,
    pub build_id: Option<Vec<u8>>,
    /// A `.gnu_debuglink` section as (file name, crc) pair.
    pub debug_link: Option<(String, u32)>,
    pub include_symtab: bool,
}

impl Default for ElfImage {
    fn default() -> Self {
        Self {
            e_type: ET_DYN,
            text_off: 0x1000,
            text_vaddr: 0x1000,
            funcs: Vec::new(),
            build_id: None,
            debug_link: None,
            include_symtab: true,
        }
    }
}

impl ElfImage {
    /// Serialize the image description into ELF bytes.
    pub fn build(&self) -> Vec<u8> {
        const TEXT_SIZE: u64 = 0x100;

        // Section name string table, filled as sections are added.
        let mut shstrtab = vec![0u8];
        let add_name = |shstrtab: &mut Vec<u8>, name: &str| -> u32 {
            let off = shstrtab.len() as u32;
            let () = shstrtab.extend_from_slice(name.as_bytes());
            let () = shstrtab.push(0);
            off
        };

        // Symbol string table and symbol entries.
        let mut strtab = vec![0u8];
        let mut syms = vec![Elf64_Sym {
            st_name: 0,
            st_info: 0,
            st_other: 0,
            st_shndx: 0,
            st_value: 0,
            st_size: 0,
        }];
        for (name, value, size) in &self.funcs {
            let st_name = strtab.len() as u32;
            let () = strtab.extend_from_slice(name.as_bytes());
            let () = strtab.push(0);
            let () = syms.push(Elf64_Sym {
                st_name,
                // GLOBAL binding, FUNC type.
                st_info: (1 << 4) | STT_FUNC,
                st_other: 0,
                st_shndx: 1,
                st_value: *value,
                st_size: *size,
            });
        }

        let mut data = Vec::new();
        // Space for the ELF header; filled in at the very end.
        let () = data.resize(size_of::<Elf64_Ehdr>(), 0);

        let phdr = Elf64_Phdr {
            p_type: PT_LOAD,
            p_flags: PF_X | 0x4,
            p_offset: self.text_off,
            p_vaddr: self.text_vaddr,
            p_paddr: self.text_vaddr,
            p_filesz: TEXT_SIZE,
            p_memsz: TEXT_SIZE,
            p_align: 0x1000,
        };
        let e_phoff = data.len() as u64;
        let () = data.extend_from_slice(bytes_of(&phdr));

        assert!(self.text_off as usize >= data.len());
        let () = data.resize(self.text_off as usize, 0);
        let () = data.resize(self.text_off as usize + TEXT_SIZE as usize, 0);

        let mut shdrs = vec![
            // The mandatory null section.
            Elf64_Shdr {
                sh_name: 0,
                sh_type: 0,
                sh_flags: 0,
                sh_addr: 0,
                sh_offset: 0,
                sh_size: 0,
                sh_link: 0,
                sh_info: 0,
                sh_addralign: 0,
                sh_entsize: 0,
            },
            Elf64_Shdr {
                sh_name: add_name(&mut shstrtab, ".text"),
                sh_type: SHT_PROGBITS,
                sh_flags: 0x6,
                sh_addr: self.text_vaddr,
                sh_offset: self.text_off,
                sh_size: TEXT_SIZE,
                sh_link: 0,
                sh_info: 0,
                sh_addralign: 16,
                sh_entsize: 0,
            },
        ];

        if self.include_symtab {
            let strtab_idx = shdrs.len() as u32 + 1;

            let () = pad_to(&mut data, 8);
            let symtab_off = data.len() as u64;
            for sym in &syms {
                let () = data.extend_from_slice(bytes_of(sym));
            }
            let () = shdrs.push(Elf64_Shdr {
                sh_name: add_name(&mut shstrtab, ".symtab"),
                sh_type: SHT_SYMTAB,
                sh_flags: 0,
                sh_addr: 0,
                sh_offset: symtab_off,
                sh_size: (syms.len() * size_of::<Elf64_Sym>()) as u64,
                sh_link: strtab_idx,
                sh_info: 1,
                sh_addralign: 8,
                sh_entsize: size_of::<Elf64_Sym>() as u64,
            });

            let strtab_off = data.len() as u64;
            let () = data.extend_from_slice(&strtab);
            let () = shdrs.push(Elf64_Shdr {
                sh_name: add_name(&mut shstrtab, ".strtab"),
                sh_type: SHT_STRTAB,
                sh_flags: 0,
                sh_addr: 0,
                sh_offset: strtab_off,
                sh_size: strtab.len() as u64,
                sh_link: 0,
                sh_info: 0,
                sh_addralign: 1,
                sh_entsize: 0,
            });
        }

        if let Some(build_id) = &self.build_id {
            let () = pad_to(&mut data, 4);
            let note_off = data.len() as u64;
            let nhdr = Elf64_Nhdr {
                n_namesz: 4,
                n_descsz: build_id.len() as u32,
                n_type: NT_GNU_BUILD_ID,
            };
            let () = data.extend_from_slice(bytes_of(&nhdr));
            let () = data.extend_from_slice(b"GNU\0");
            let () = data.extend_from_slice(build_id);
            let () = pad_to(&mut data, 4);
            let () = shdrs.push(Elf64_Shdr {
                sh_name: add_name(&mut shstrtab, ".note.gnu.build-id"),
                sh_type: SHT_NOTE,
                sh_flags: 0x2,
                sh_addr: 0,
                sh_offset: note_off,
                sh_size: data.len() as u64 - note_off,
                sh_link: 0,
                sh_info: 0,
                sh_addralign: 4,
                sh_entsize: 0,
            });
        }

        if let Some((file, crc)) = &self.debug_link {
            let () = pad_to(&mut data, 4);
            let link_off = data.len() as u64;
            let () = data.extend_from_slice(file.as_bytes());
            let () = data.push(0);
            let () = pad_to(&mut data, 4);
            let () = data.extend_from_slice(&crc.to_ne_bytes());
            let () = shdrs.push(Elf64_Shdr {
                sh_name: add_name(&mut shstrtab, ".gnu_debuglink"),
                sh_type: SHT_PROGBITS,
                sh_flags: 0,
                sh_addr: 0,
                sh_offset: link_off,
                sh_size: data.len() as u64 - link_off,
                sh_link: 0,
                sh_info: 0,
                sh_addralign: 4,
                sh_entsize: 0,
            });
        }

        let shstrndx = shdrs.len() as u16;
        let shstrtab_name = add_name(&mut shstrtab, ".shstrtab");
        let shstrtab_off = data.len() as u64;
        let () = data.extend_from_slice(&shstrtab);
        let () = shdrs.push(Elf64_Shdr {
            sh_name: shstrtab_name,
            sh_type: SHT_STRTAB,
            sh_flags: 0,
            sh_addr: 0,
            sh_offset: shstrtab_off,
            sh_size: shstrtab.len() as u64,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: 1,
            sh_entsize: 0,
        });

        let () = pad_to(&mut data, 8);
        let e_shoff = data.len() as u64;
        for shdr in &shdrs {
            let () = data.extend_from_slice(bytes_of(shdr));
        }

        let mut e_ident = [0u8; 16];
        e_ident[0] = 0x7f;
        e_ident[1] = b'E';
        e_ident[2] = b'L';
        e_ident[3] = b'F';
        // ELFCLASS64, ELFDATA2LSB, EV_CURRENT.
        e_ident[4] = 2;
        e_ident[5] = 1;
        e_ident[6] = 1;

        let ehdr = Elf64_Ehdr {
            e_ident,
            e_type: self.e_type,
            e_machine: 0x3e,
            e_version: 1,
            e_entry: 0,
            e_phoff,
            e_shoff,
            e_flags: 0,
            e_ehsize: size_of::<Elf64_Ehdr>() as u16,
            e_phentsize: size_of::<Elf64_Phdr>() as u16,
            e_phnum: 1,
            e_shentsize: size_of::<Elf64_Shdr>() as u16,
            e_shnum: shdrs.len() as u16,
            e_shstrndx: shstrndx,
        };
        let () = data[..size_of::<Elf64_Ehdr>()].copy_from_slice(bytes_of(&ehdr));

        data
    }
}
