//! Decodes each input object's section table, symbol table and relocation
//! tables into our own representation. Runs across all inputs in parallel;
//! everything it produces is per-file except for interned symbol names and
//! fragments, which go through their own concurrent tables.

use crate::elf::strtab_get;
use crate::elf::slice_from_bytes;
use crate::elf::FileHeader;
use crate::elf::Rela;
use crate::elf::SectionHeader;
use crate::elf::SymtabEntry;
use crate::eh_frame;
use crate::error::Diagnostics;
use crate::error::Result;
use crate::file_kind::FileKind;
use crate::fragment;
use crate::fragment::FragmentTable;
use crate::input_data::FileId;
use crate::input_data::InputBytes;
use crate::input_data::InputRef;
use crate::section::FragmentRef;
use crate::section::InputSection;
use crate::section::SectionRef;
use crate::symbol::SymFlags;
use crate::symbol::SymbolAux;
use crate::symbol::SymbolId;
use crate::symbol::SymbolInterner;
use anyhow::bail;
use anyhow::Context as _;
use rayon::iter::IndexedParallelIterator;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::ParallelIterator;
use std::sync::atomic::AtomicBool;

pub(crate) struct ObjectFile<'data> {
    pub(crate) input: InputRef<'data>,
    pub(crate) file_id: FileId,
    pub(crate) data: &'data [u8],
    shdrs: &'data [SectionHeader],
    pub(crate) symtab: &'data [SymtabEntry],
    pub(crate) strtab: &'data [u8],
    /// Index of the first global entry in the symbol table.
    pub(crate) first_global: usize,

    /// One slot per section header. `None` slots are sections we consumed as
    /// metadata or suppressed at parse time.
    pub(crate) sections: Vec<Option<InputSection<'data>>>,

    /// For each symbol table index, the interned identity. `None` for locals.
    pub(crate) global_ids: Vec<Option<SymbolId>>,

    /// Request flags and auxiliary-entry indices for local symbols, indexed
    /// like the symbol table. Only this file's scanning thread writes the
    /// flags; layout fills the aux entries.
    pub(crate) local_flags: Vec<SymFlags>,
    pub(crate) local_aux: Vec<SymbolAux>,

    /// COMDAT signatures seen at parse time: (signature, group section
    /// index). Turned into group ids at the parse barrier.
    pub(crate) comdat_signatures: Vec<(&'data [u8], u32)>,
    pub(crate) comdat_groups: Vec<(u32, u32)>,

    /// Number of dynamic relocations this file will emit. Written only by the
    /// thread scanning this file.
    pub(crate) num_dynrel: u32,
    /// Byte offset of this file's slice of the output dynamic relocation
    /// table. Assigned by layout.
    pub(crate) reldyn_offset: u32,

    pub(crate) is_dso: bool,
    pub(crate) is_in_archive: bool,
    /// Becomes true when the file is pulled into the link. The false -> true
    /// transition is a test-and-set so each file is traversed exactly once.
    pub(crate) is_alive: AtomicBool,
    pub(crate) has_common: bool,
}

#[tracing::instrument(skip_all, name = "Parse input files")]
pub(crate) fn parse_input_files<'data>(
    inputs: &[InputBytes<'data>],
    interner: &SymbolInterner<'data>,
    fragments: &FragmentTable<'data>,
    diagnostics: &Diagnostics,
) -> Result<Vec<ObjectFile<'data>>> {
    inputs
        .par_iter()
        .enumerate()
        .map(|(i, input)| {
            parse_object(FileId::from_usize(i)?, input, interner, fragments, diagnostics)
                .with_context(|| format!("Failed to parse `{}`", input.input))
        })
        .collect()
}

fn parse_object<'data>(
    file_id: FileId,
    input: &InputBytes<'data>,
    interner: &SymbolInterner<'data>,
    fragments: &FragmentTable<'data>,
    diagnostics: &Diagnostics,
) -> Result<ObjectFile<'data>> {
    let data = input.data;
    let header: &FileHeader = bytemuck::from_bytes(
        data.get(..size_of::<FileHeader>())
            .context("File too small for ELF header")?,
    );
    if header.machine != object::elf::EM_X86_64 {
        bail!("Unsupported architecture {}", header.machine);
    }
    let shdrs: &[SectionHeader] = slice_from_bytes(
        data,
        header.section_header_offset as usize,
        usize::from(header.section_header_num),
    )?;
    let shstrtab = match shdrs.get(usize::from(header.section_names_index)) {
        Some(shdr) => section_bytes(data, shdr)?,
        None => &[],
    };

    let is_dso = input.kind == FileKind::ElfDynamic;
    let wanted_symtab = if is_dso {
        object::elf::SHT_DYNSYM
    } else {
        object::elf::SHT_SYMTAB
    };
    let mut symtab: &[SymtabEntry] = &[];
    let mut strtab: &[u8] = &[];
    let mut first_global = 0;
    if let Some(shdr) = shdrs.iter().find(|shdr| shdr.ty == wanted_symtab) {
        symtab = slice_from_bytes(
            data,
            shdr.offset as usize,
            (shdr.size / size_of::<SymtabEntry>() as u64) as usize,
        )?;
        first_global = shdr.info as usize;
        strtab = match shdrs.get(shdr.link as usize) {
            Some(link) => section_bytes(data, link)?,
            None => &[],
        };
    }

    let mut file = ObjectFile {
        input: input.input,
        file_id,
        data,
        shdrs,
        symtab,
        strtab,
        first_global,
        sections: Vec::new(),
        global_ids: Vec::new(),
        local_flags: vec![SymFlags::empty(); symtab.len()],
        local_aux: vec![SymbolAux::default(); symtab.len()],
        comdat_signatures: Vec::new(),
        comdat_groups: Vec::new(),
        num_dynrel: 0,
        reldyn_offset: 0,
        is_dso,
        is_in_archive: input.is_in_archive,
        is_alive: AtomicBool::new(false),
        has_common: false,
    };

    if is_dso {
        // Only a shared object's symbols take part in the link; the sections
        // array stays allocated but empty.
        file.sections = (0..shdrs.len()).map(|_| None).collect();
    } else {
        initialize_sections(&mut file, shstrtab, diagnostics)?;
        attach_relocations(&mut file)?;
    }

    initialize_symbols(&mut file, interner)?;

    if !is_dso {
        split_mergeable_sections(&mut file, fragments, diagnostics)?;
        resolve_relocation_fragments(&mut file)?;
        eh_frame::associate_fdes(&mut file)?;
    }

    Ok(file)
}

fn initialize_sections<'data>(
    file: &mut ObjectFile<'data>,
    shstrtab: &'data [u8],
    diagnostics: &Diagnostics,
) -> Result {
    let data = file.data;
    let shdrs = file.shdrs;
    file.sections = Vec::with_capacity(shdrs.len());
    for (i, shdr) in shdrs.iter().enumerate() {
        if shdr.has_flag(object::elf::SHF_EXCLUDE) && !shdr.has_flag(object::elf::SHF_ALLOC) {
            file.sections.push(None);
            continue;
        }
        match shdr.ty {
            object::elf::SHT_GROUP => {
                let esym = file
                    .symtab
                    .get(shdr.info as usize)
                    .with_context(|| format!("{}: invalid symbol index in SHT_GROUP", file.input))?;
                let signature = strtab_get(file.strtab, esym.name as usize)?;
                let entries: &[u32] = slice_from_bytes(
                    data,
                    shdr.offset as usize,
                    (shdr.size / 4) as usize,
                )?;
                let Some((&flags, _)) = entries.split_first() else {
                    bail!("{}: empty SHT_GROUP", file.input);
                };
                file.sections.push(None);
                if flags == 0 {
                    continue;
                }
                if flags != object::elf::GRP_COMDAT {
                    bail!("{}: unsupported SHT_GROUP format", file.input);
                }
                file.comdat_signatures.push((signature, i as u32));
            }
            object::elf::SHT_SYMTAB_SHNDX => {
                diagnostics.report(anyhow::anyhow!(
                    "{}: SHT_SYMTAB_SHNDX section is not supported",
                    file.input
                ));
                file.sections.push(None);
            }
            object::elf::SHT_SYMTAB
            | object::elf::SHT_STRTAB
            | object::elf::SHT_REL
            | object::elf::SHT_RELA
            | object::elf::SHT_NULL => file.sections.push(None),
            _ => {
                let name = strtab_get(shstrtab, shdr.name as usize)?;
                let contents = section_bytes(data, shdr)?;
                file.sections
                    .push(Some(InputSection::new(i, name, *shdr, contents)));
            }
        }
    }
    Ok(())
}

/// Attaches each SHT_RELA section to the section it relocates.
fn attach_relocations(file: &mut ObjectFile) -> Result {
    let shdrs = file.shdrs;
    for shdr in shdrs {
        if shdr.ty != object::elf::SHT_RELA {
            continue;
        }
        let target = shdr.info as usize;
        if target >= file.sections.len() {
            bail!("{}: invalid relocated section index {target}", file.input);
        }
        let rels: &[Rela] = slice_from_bytes(
            file.data,
            shdr.offset as usize,
            (shdr.size / size_of::<Rela>() as u64) as usize,
        )?;
        if let Some(section) = &mut file.sections[target] {
            section.rels = rels;
        }
    }
    Ok(())
}

fn initialize_symbols<'data>(
    file: &mut ObjectFile<'data>,
    interner: &SymbolInterner<'data>,
) -> Result {
    file.global_ids = vec![None; file.symtab.len()];
    for i in 1..file.first_global.min(file.symtab.len()) {
        if file.symtab[i].is_common() {
            bail!("{}: common local symbol", file.input);
        }
    }
    for i in file.first_global..file.symtab.len() {
        let esym = &file.symtab[i];
        let name = strtab_get(file.strtab, esym.name as usize)?;
        file.global_ids[i] = Some(interner.intern(name));
        if esym.is_common() {
            file.has_common = true;
        }
    }
    Ok(())
}

fn split_mergeable_sections<'data>(
    file: &mut ObjectFile<'data>,
    fragments: &FragmentTable<'data>,
    diagnostics: &Diagnostics,
) -> Result {
    let input = file.input;
    for slot in &mut file.sections {
        let Some(section) = slot else { continue };
        if !section.shdr.has_flag(object::elf::SHF_MERGE) || section.is_nobits() {
            continue;
        }
        // Mergeable sections that carry relocations aren't supported as
        // such; they stay ordinary sections.
        if !section.rels.is_empty() {
            continue;
        }
        let display = SectionDisplay {
            input,
            name: section.name,
        };
        section.fragments = fragment::split_merge_section(
            fragments,
            diagnostics,
            &display,
            section.data,
            section.shdr.has_flag(object::elf::SHF_STRINGS),
            section.shdr.entsize,
            section.shdr.alignment,
        )?;
        section.is_merge = true;
    }
    Ok(())
}

/// For each relocation whose symbol table entry points into a mergeable
/// section of this file, precomputes the fragment it refers to. The applier
/// and ICF consume these in relocation order.
fn resolve_relocation_fragments(file: &mut ObjectFile) -> Result {
    let mut computed: Vec<(usize, Vec<bool>, Vec<FragmentRef>)> = Vec::new();
    for (i, slot) in file.sections.iter().enumerate() {
        let Some(section) = slot else { continue };
        if section.rels.is_empty() || section.is_merge {
            continue;
        }
        let mut has_fragments = vec![false; section.rels.len()];
        let mut rel_fragments = Vec::new();
        for (rel_index, rel) in section.rels.iter().enumerate() {
            let Some(esym) = file.symtab.get(rel.r_sym()) else {
                bail!("{}: invalid symbol index in relocation", file.input);
            };
            let Some(target_index) = esym.section_index() else {
                continue;
            };
            let Some(Some(target)) = file.sections.get(target_index) else {
                continue;
            };
            if !target.is_merge {
                continue;
            }
            let offset = esym.value.wrapping_add(rel.addend as u64);
            let Some((frag, within)) = fragment::find_fragment(&target.fragments, offset) else {
                bail!(
                    "{}: relocation offset 0x{offset:x} is outside merge section `{}`",
                    file.input,
                    String::from_utf8_lossy(target.name)
                );
            };
            has_fragments[rel_index] = true;
            rel_fragments.push(FragmentRef {
                frag,
                addend: within as i64,
            });
        }
        if rel_fragments.is_empty() {
            continue;
        }
        computed.push((i, has_fragments, rel_fragments));
    }
    for (index, has_fragments, rel_fragments) in computed {
        let section = file.sections[index].as_mut().unwrap();
        section.has_fragments = has_fragments;
        section.rel_fragments = rel_fragments;
    }
    Ok(())
}

fn section_bytes<'data>(data: &'data [u8], shdr: &SectionHeader) -> Result<&'data [u8]> {
    if shdr.ty == object::elf::SHT_NOBITS {
        return Ok(&[]);
    }
    let start = shdr.offset as usize;
    let end = start
        .checked_add(shdr.size as usize)
        .context("Section extent overflow")?;
    data.get(start..end)
        .context("Section extends past the end of the file")
}

impl<'data> ObjectFile<'data> {
    /// The file's tie-breaking priority. Lower wins.
    pub(crate) fn priority(&self) -> u32 {
        self.file_id.as_u32()
    }

    pub(crate) fn input_section(&self, index: usize) -> Option<&InputSection<'data>> {
        self.sections.get(index)?.as_ref()
    }

    pub(crate) fn section_ref(&self, index: usize) -> SectionRef {
        SectionRef::new(self.file_id, index)
    }

    pub(crate) fn symbol_name(&self, sym_index: usize) -> Result<&'data [u8]> {
        let esym = self
            .symtab
            .get(sym_index)
            .context("Symbol index out of range")?;
        strtab_get(self.strtab, esym.name as usize)
    }

    /// The section indices belonging to a COMDAT group, excluding the leading
    /// flags word.
    pub(crate) fn comdat_members(&self, group_section_index: u32) -> Result<&'data [u32]> {
        let shdr = self
            .shdrs
            .get(group_section_index as usize)
            .context("COMDAT group section index out of range")?;
        let entries: &[u32] =
            slice_from_bytes(self.data, shdr.offset as usize, (shdr.size / 4) as usize)?;
        Ok(&entries[1..])
    }

    /// The target symbol's name, for error messages.
    pub(crate) fn display_symbol_name(
        &self,
        sym_index: usize,
        symbols: &crate::symbol::SymbolTable,
    ) -> String {
        if let Some(Some(id)) = self.global_ids.get(sym_index) {
            return String::from_utf8_lossy(symbols.name(*id)).into_owned();
        }
        self.symbol_name(sym_index)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .unwrap_or_else(|_| String::from("<invalid>"))
    }

    pub(crate) fn display_section(&self, name: &'data [u8]) -> SectionDisplay<'data> {
        SectionDisplay {
            input: self.input,
            name,
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.is_alive.load(std::sync::atomic::Ordering::Acquire)
    }
}

/// Looks up a section through a cross-file reference.
pub(crate) fn section_by_ref<'a, 'data>(
    files: &'a [ObjectFile<'data>],
    r: SectionRef,
) -> Option<&'a InputSection<'data>> {
    files.get(r.file().as_usize())?.input_section(r.section_index())
}

impl std::fmt::Display for ObjectFile<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.input.fmt(f)
    }
}

pub(crate) struct SectionDisplay<'data> {
    input: InputRef<'data>,
    name: &'data [u8],
}

impl std::fmt::Display for SectionDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:({})", self.input, String::from_utf8_lossy(self.name))
    }
}

#[cfg(test)]
mod tests {
    use crate::test_elf::with_link;
    use crate::test_elf::ElfBuilder;
    use crate::test_elf::EXEC;

    fn no_config(_: &mut crate::args::Args) {}

    #[test]
    fn decodes_sections_and_attaches_relocations() {
        let mut b = ElfBuilder::new();
        let text = b.add_section(".text", object::elf::SHT_PROGBITS, EXEC, &[0xe8, 0, 0, 0, 0]);
        let target = b.add_section(".text.f", object::elf::SHT_PROGBITS, EXEC, &[0xc3]);
        let f = b.func("f", target, 0);
        b.add_rela(text, 1, object::elf::R_X86_64_PC32, f, -4);

        with_link(&[("a.o", b.build())], no_config, |outcome| {
            let file = &outcome.files[0];
            let section = file.input_section(text as usize).unwrap();
            assert_eq!(section.name, b".text");
            assert_eq!(section.data, &[0xe8, 0, 0, 0, 0]);
            assert_eq!(section.rels.len(), 1);
            assert_eq!(section.rels[0].r_type(), object::elf::R_X86_64_PC32);
            assert_eq!(section.rels[0].r_sym(), f as usize);
            // Metadata sections never become input sections.
            assert!(file
                .sections
                .iter()
                .flatten()
                .all(|s| s.shdr.ty != object::elf::SHT_SYMTAB));
        })
        .unwrap();
    }

    #[test]
    fn non_comdat_group_flags_are_rejected() {
        let mut b = ElfBuilder::new();
        let text = b.add_section(".text.x", object::elf::SHT_PROGBITS, EXEC, &[0xc3]);
        let x = b.func("x", text, 0);
        let group = b.add_group(x, &[text]);
        // Corrupt the flags word.
        b.section_data_mut(group)[..4].copy_from_slice(&2u32.to_le_bytes());

        let error = with_link(&[("a.o", b.build())], no_config, |_| ()).unwrap_err();
        assert!(error.to_string().contains("unsupported SHT_GROUP format"));
    }

    #[test]
    fn symtab_shndx_is_reported() {
        let mut b = ElfBuilder::new();
        b.add_section(".text", object::elf::SHT_PROGBITS, EXEC, &[0xc3]);
        b.add_section(
            ".symtab_shndx",
            object::elf::SHT_SYMTAB_SHNDX,
            0,
            &[0u8; 4],
        );
        let error = with_link(&[("a.o", b.build())], no_config, |_| ()).unwrap_err();
        assert!(error
            .to_string()
            .contains("SHT_SYMTAB_SHNDX section is not supported"));
    }

    #[test]
    fn excluded_sections_are_suppressed() {
        let mut b = ElfBuilder::new();
        let excluded = b.add_section(
            ".gnu.lto_bits",
            object::elf::SHT_PROGBITS,
            u64::from(object::elf::SHF_EXCLUDE),
            &[1, 2, 3],
        );
        b.add_section(".text", object::elf::SHT_PROGBITS, EXEC, &[0xc3]);
        with_link(&[("a.o", b.build())], no_config, |outcome| {
            assert!(outcome.files[0].input_section(excluded as usize).is_none());
        })
        .unwrap();
    }
}
