//! Test support: builds ELF64 relocatable objects in memory and drives the
//! whole pipeline over them, so scenarios can be expressed without compiled
//! fixtures.

use crate::args::Args;
use crate::args::Input;
use crate::elf::FileHeader;
use crate::elf::Rela;
use crate::elf::SectionHeader;
use crate::elf::SymtabEntry;
use crate::error::Result;
use crate::input_data::InputData;
use crate::LinkOutcome;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

pub(crate) const EXEC: u64 =
    (object::elf::SHF_ALLOC | object::elf::SHF_EXECINSTR) as u64;
pub(crate) const ALLOC: u64 = object::elf::SHF_ALLOC as u64;

struct SecDef {
    name: Vec<u8>,
    sh_type: u32,
    flags: u64,
    data: Vec<u8>,
    align: u64,
    entsize: u64,
    info: u32,
    rels: Vec<Rela>,
}

struct SymDef {
    name: Vec<u8>,
    info: u8,
    shndx: u16,
    value: u64,
    size: u64,
}

/// Builds a minimal ELF64 relocatable object. Add all local symbols before
/// the first global; returned symbol indices assume that order.
pub(crate) struct ElfBuilder {
    sections: Vec<SecDef>,
    locals: Vec<SymDef>,
    globals: Vec<SymDef>,
}

impl ElfBuilder {
    pub(crate) fn new() -> Self {
        Self {
            sections: Vec::new(),
            locals: Vec::new(),
            globals: Vec::new(),
        }
    }

    pub(crate) fn add_section(
        &mut self,
        name: &str,
        sh_type: u32,
        flags: u64,
        data: &[u8],
    ) -> u16 {
        self.add_section_full(name, sh_type, flags, data, 8, 0)
    }

    pub(crate) fn add_section_full(
        &mut self,
        name: &str,
        sh_type: u32,
        flags: u64,
        data: &[u8],
        align: u64,
        entsize: u64,
    ) -> u16 {
        self.sections.push(SecDef {
            name: name.as_bytes().to_vec(),
            sh_type,
            flags,
            data: data.to_vec(),
            align,
            entsize,
            info: 0,
            rels: Vec::new(),
        });
        self.sections.len() as u16
    }

    /// Mutable access to a section's contents, for corrupting fixtures.
    pub(crate) fn section_data_mut(&mut self, index: u16) -> &mut [u8] {
        &mut self.sections[index as usize - 1].data
    }

    pub(crate) fn add_rela(
        &mut self,
        section: u16,
        offset: u64,
        r_type: u32,
        sym: u32,
        addend: i64,
    ) {
        self.sections[section as usize - 1]
            .rels
            .push(Rela::new(offset, r_type, sym, addend));
    }

    /// A COMDAT group whose signature is the name of `signature_sym`.
    pub(crate) fn add_group(&mut self, signature_sym: u32, members: &[u16]) -> u16 {
        let mut data = Vec::new();
        data.extend_from_slice(&object::elf::GRP_COMDAT.to_le_bytes());
        for &member in members {
            data.extend_from_slice(&u32::from(member).to_le_bytes());
        }
        let index = self.add_section_full(".group", object::elf::SHT_GROUP, 0, &data, 4, 4);
        self.sections[index as usize - 1].info = signature_sym;
        index
    }

    fn push_local(&mut self, sym: SymDef) -> u32 {
        assert!(self.globals.is_empty(), "add locals before globals");
        self.locals.push(sym);
        self.locals.len() as u32
    }

    fn push_global(&mut self, sym: SymDef) -> u32 {
        self.globals.push(sym);
        (self.locals.len() + self.globals.len()) as u32
    }

    pub(crate) fn section_symbol(&mut self, shndx: u16) -> u32 {
        self.push_local(SymDef {
            name: Vec::new(),
            info: object::elf::STT_SECTION,
            shndx,
            value: 0,
            size: 0,
        })
    }

    pub(crate) fn global_with(
        &mut self,
        name: &str,
        binding: u8,
        sym_type: u8,
        shndx: u16,
        value: u64,
        size: u64,
    ) -> u32 {
        self.push_global(SymDef {
            name: name.as_bytes().to_vec(),
            info: (binding << 4) | sym_type,
            shndx,
            value,
            size,
        })
    }

    pub(crate) fn global(&mut self, name: &str, shndx: u16, value: u64) -> u32 {
        self.global_with(
            name,
            object::elf::STB_GLOBAL,
            object::elf::STT_NOTYPE,
            shndx,
            value,
            0,
        )
    }

    pub(crate) fn func(&mut self, name: &str, shndx: u16, value: u64) -> u32 {
        self.global_with(
            name,
            object::elf::STB_GLOBAL,
            object::elf::STT_FUNC,
            shndx,
            value,
            0,
        )
    }

    pub(crate) fn weak(&mut self, name: &str, shndx: u16, value: u64) -> u32 {
        self.global_with(
            name,
            object::elf::STB_WEAK,
            object::elf::STT_NOTYPE,
            shndx,
            value,
            0,
        )
    }

    pub(crate) fn undef(&mut self, name: &str) -> u32 {
        self.global_with(name, object::elf::STB_GLOBAL, object::elf::STT_NOTYPE, 0, 0, 0)
    }

    pub(crate) fn undef_weak(&mut self, name: &str) -> u32 {
        self.global_with(name, object::elf::STB_WEAK, object::elf::STT_NOTYPE, 0, 0, 0)
    }

    pub(crate) fn common(&mut self, name: &str, size: u64) -> u32 {
        self.global_with(
            name,
            object::elf::STB_GLOBAL,
            object::elf::STT_OBJECT,
            object::elf::SHN_COMMON,
            0,
            size,
        )
    }

    pub(crate) fn tls(&mut self, name: &str, shndx: u16, value: u64) -> u32 {
        self.global_with(
            name,
            object::elf::STB_GLOBAL,
            object::elf::STT_TLS,
            shndx,
            value,
            0,
        )
    }

    pub(crate) fn build(&self) -> Vec<u8> {
        let num_user = self.sections.len();
        let symtab_index = num_user + 1;
        let strtab_index = num_user + 2;
        let shstrtab_index = num_user + 3;

        // Symbol table and its string table.
        let mut strtab = vec![0u8];
        let mut symtab = vec![SymtabEntry {
            name: 0,
            info: 0,
            other: 0,
            shndx: 0,
            value: 0,
            size: 0,
        }];
        for (bind, syms) in [
            (object::elf::STB_LOCAL, &self.locals),
            (object::elf::STB_GLOBAL, &self.globals),
        ] {
            for sym in syms {
                let name_offset = if sym.name.is_empty() {
                    0
                } else {
                    let offset = strtab.len() as u32;
                    strtab.extend_from_slice(&sym.name);
                    strtab.push(0);
                    offset
                };
                // Globals carry their own binding in `info`.
                let info = if bind == object::elf::STB_LOCAL {
                    sym.info & 0xf
                } else {
                    sym.info
                };
                symtab.push(SymtabEntry {
                    name: name_offset,
                    info,
                    other: 0,
                    shndx: sym.shndx,
                    value: sym.value,
                    size: sym.size,
                });
            }
        }

        // Section name table.
        let mut shstrtab = vec![0u8];
        let name_offset = |name: &[u8], table: &mut Vec<u8>| -> u32 {
            let offset = table.len() as u32;
            table.extend_from_slice(name);
            table.push(0);
            offset
        };

        let mut out = vec![0u8; size_of::<FileHeader>()];
        let mut shdrs: Vec<SectionHeader> = vec![SectionHeader {
            name: 0,
            ty: 0,
            flags: 0,
            address: 0,
            offset: 0,
            size: 0,
            link: 0,
            info: 0,
            alignment: 0,
            entsize: 0,
        }];

        let append = |out: &mut Vec<u8>, data: &[u8]| -> u64 {
            while out.len() % 8 != 0 {
                out.push(0);
            }
            let offset = out.len() as u64;
            out.extend_from_slice(data);
            offset
        };

        for section in &self.sections {
            let offset = append(&mut out, &section.data);
            shdrs.push(SectionHeader {
                name: name_offset(&section.name, &mut shstrtab),
                ty: section.sh_type,
                flags: section.flags,
                address: 0,
                offset,
                size: section.data.len() as u64,
                link: if section.sh_type == object::elf::SHT_GROUP {
                    symtab_index as u32
                } else {
                    0
                },
                info: section.info,
                alignment: section.align,
                entsize: section.entsize,
            });
        }

        let symtab_bytes: Vec<u8> = symtab.iter().flat_map(|e| bytemuck::bytes_of(e).to_vec()).collect();
        let offset = append(&mut out, &symtab_bytes);
        shdrs.push(SectionHeader {
            name: name_offset(b".symtab", &mut shstrtab),
            ty: object::elf::SHT_SYMTAB,
            flags: 0,
            address: 0,
            offset,
            size: symtab_bytes.len() as u64,
            link: strtab_index as u32,
            info: self.locals.len() as u32 + 1,
            alignment: 8,
            entsize: size_of::<SymtabEntry>() as u64,
        });

        let offset = append(&mut out, &strtab);
        shdrs.push(SectionHeader {
            name: name_offset(b".strtab", &mut shstrtab),
            ty: object::elf::SHT_STRTAB,
            flags: 0,
            address: 0,
            offset,
            size: strtab.len() as u64,
            link: 0,
            info: 0,
            alignment: 1,
            entsize: 0,
        });

        // Relocation sections refer to their targets via sh_info.
        let mut rela_shdrs = Vec::new();
        for (i, section) in self.sections.iter().enumerate() {
            if section.rels.is_empty() {
                continue;
            }
            let rela_bytes: Vec<u8> = section
                .rels
                .iter()
                .flat_map(|r| bytemuck::bytes_of(r).to_vec())
                .collect();
            let offset = append(&mut out, &rela_bytes);
            let mut name = b".rela".to_vec();
            name.extend_from_slice(&section.name);
            rela_shdrs.push(SectionHeader {
                name: name_offset(&name, &mut shstrtab),
                ty: object::elf::SHT_RELA,
                flags: 0,
                address: 0,
                offset,
                size: rela_bytes.len() as u64,
                link: symtab_index as u32,
                info: (i + 1) as u32,
                alignment: 8,
                entsize: size_of::<Rela>() as u64,
            });
        }

        let shstrtab_name = name_offset(b".shstrtab", &mut shstrtab);
        let offset = append(&mut out, &shstrtab);
        shdrs.push(SectionHeader {
            name: shstrtab_name,
            ty: object::elf::SHT_STRTAB,
            flags: 0,
            address: 0,
            offset,
            size: shstrtab.len() as u64,
            link: 0,
            info: 0,
            alignment: 1,
            entsize: 0,
        });
        shdrs.extend(rela_shdrs);

        let shdr_bytes: Vec<u8> = shdrs.iter().flat_map(|s| bytemuck::bytes_of(s).to_vec()).collect();
        let shoff = append(&mut out, &shdr_bytes);

        let header = FileHeader {
            magic: object::elf::ELFMAG,
            class: object::elf::ELFCLASS64,
            data: object::elf::ELFDATA2LSB,
            ei_version: 1,
            os_abi: 0,
            abi_version: 0,
            padding: [0; 7],
            ty: object::elf::ET_REL,
            machine: object::elf::EM_X86_64,
            e_version: 1,
            entry_point: 0,
            program_header_offset: 0,
            section_header_offset: shoff,
            flags: 0,
            ehsize: size_of::<FileHeader>() as u16,
            program_header_entry_size: 0,
            program_header_num: 0,
            section_header_entry_size: size_of::<SectionHeader>() as u16,
            section_header_num: shdrs.len() as u16,
            section_names_index: shstrtab_index as u16,
        };
        out[..size_of::<FileHeader>()].copy_from_slice(bytemuck::bytes_of(&header));
        out
    }
}

static NEXT_DIR: AtomicUsize = AtomicUsize::new(0);

/// Writes the given objects to a scratch directory, links them and hands the
/// full outcome to `check`.
pub(crate) fn with_link<R>(
    objects: &[(&str, Vec<u8>)],
    configure: impl FnOnce(&mut Args),
    check: impl FnOnce(&LinkOutcome) -> R,
) -> Result<R> {
    let dir = std::env::temp_dir().join(format!(
        "fold-test-{}-{}",
        std::process::id(),
        NEXT_DIR.fetch_add(1, Ordering::Relaxed)
    ));
    std::fs::create_dir_all(&dir).unwrap();
    let result = run_link(&dir, objects, configure, check);
    std::fs::remove_dir_all(&dir).ok();
    result
}

fn run_link<R>(
    dir: &Path,
    objects: &[(&str, Vec<u8>)],
    configure: impl FnOnce(&mut Args),
    check: impl FnOnce(&LinkOutcome) -> R,
) -> Result<R> {
    let mut args = Args::for_testing();
    configure(&mut args);
    let mut paths: Vec<PathBuf> = Vec::new();
    for (name, bytes) in objects {
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        paths.push(path);
    }
    args.inputs = paths
        .iter()
        .map(|p| Input::File(Box::from(p.as_path())))
        .collect();

    let input_data = InputData::from_args(&args)?;
    let outcome = crate::link(&args, &input_data)?;
    Ok(check(&outcome))
}

/// The final address of a global symbol.
pub(crate) fn global_symbol_address(outcome: &LinkOutcome, name: &str) -> Option<u64> {
    let id = outcome.ctx.symbols.lookup(name.as_bytes())?;
    let cell = outcome.ctx.symbols.cell(id);
    Some(
        outcome
            .layout
            .symbol_address(&outcome.files, &outcome.ctx, &cell.def(), &cell.aux),
    )
}

/// The bytes a section contributed to the output image.
pub(crate) fn output_bytes<'a>(
    outcome: &'a LinkOutcome,
    file: usize,
    section_index: u16,
) -> &'a [u8] {
    let section = outcome.files[file]
        .input_section(section_index as usize)
        .unwrap();
    let offset = (outcome.layout.file_offsets[section.output_section.as_usize()]
        + section.output_offset) as usize;
    &outcome.image.buf[offset..offset + section.data.len()]
}
