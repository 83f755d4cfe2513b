//! The registry of output sections. Input sections are routed to an output
//! section by name; registration is idempotent, so every request for the same
//! name observes the same instance.

use crate::parsing::ObjectFile;
use std::collections::HashMap;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub(crate) struct OutputSectionId(u32);

impl OutputSectionId {
    const fn built_in(value: u32) -> Self {
        Self(value)
    }

    pub(crate) fn placeholder() -> Self {
        Self(u32::MAX)
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

pub(crate) const RODATA: OutputSectionId = OutputSectionId::built_in(0);
pub(crate) const RELA_DYN: OutputSectionId = OutputSectionId::built_in(1);
pub(crate) const TEXT: OutputSectionId = OutputSectionId::built_in(2);
pub(crate) const PLT: OutputSectionId = OutputSectionId::built_in(3);
pub(crate) const TDATA: OutputSectionId = OutputSectionId::built_in(4);
pub(crate) const TBSS: OutputSectionId = OutputSectionId::built_in(5);
pub(crate) const DATA: OutputSectionId = OutputSectionId::built_in(6);
pub(crate) const GOT: OutputSectionId = OutputSectionId::built_in(7);
pub(crate) const BSS: OutputSectionId = OutputSectionId::built_in(8);
pub(crate) const NUM_BUILT_IN_SECTIONS: usize = 9;

struct BuiltInDetails {
    name: &'static [u8],
    sh_type: u32,
    sh_flags: u64,
}

const W: u64 = object::elf::SHF_WRITE as u64;
const A: u64 = object::elf::SHF_ALLOC as u64;
const X: u64 = object::elf::SHF_EXECINSTR as u64;
const T: u64 = object::elf::SHF_TLS as u64;

const BUILT_INS: [BuiltInDetails; NUM_BUILT_IN_SECTIONS] = [
    BuiltInDetails {
        name: b".rodata",
        sh_type: object::elf::SHT_PROGBITS,
        sh_flags: A,
    },
    BuiltInDetails {
        name: b".rela.dyn",
        sh_type: object::elf::SHT_RELA,
        sh_flags: A,
    },
    BuiltInDetails {
        name: b".text",
        sh_type: object::elf::SHT_PROGBITS,
        sh_flags: A | X,
    },
    BuiltInDetails {
        name: b".plt",
        sh_type: object::elf::SHT_PROGBITS,
        sh_flags: A | X,
    },
    BuiltInDetails {
        name: b".tdata",
        sh_type: object::elf::SHT_PROGBITS,
        sh_flags: A | W | T,
    },
    BuiltInDetails {
        name: b".tbss",
        sh_type: object::elf::SHT_NOBITS,
        sh_flags: A | W | T,
    },
    BuiltInDetails {
        name: b".data",
        sh_type: object::elf::SHT_PROGBITS,
        sh_flags: A | W,
    },
    BuiltInDetails {
        name: b".got",
        sh_type: object::elf::SHT_PROGBITS,
        sh_flags: A | W,
    },
    BuiltInDetails {
        name: b".bss",
        sh_type: object::elf::SHT_NOBITS,
        sh_flags: A | W,
    },
];

/// Prefixes that collapse into a single built-in output section, so that
/// `.text.foo` lands in `.text`. Longer prefixes first so `.tbss` isn't
/// swallowed by `.t...` lookalikes.
const COLLAPSED_PREFIXES: &[(&[u8], OutputSectionId)] = &[
    (b".rodata", RODATA),
    (b".text", TEXT),
    (b".tdata", TDATA),
    (b".tbss", TBSS),
    (b".data", DATA),
    (b".bss", BSS),
];

pub(crate) struct SectionInfo<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) sh_type: u32,
    pub(crate) sh_flags: u64,
}

pub(crate) struct OutputSections<'data> {
    infos: Vec<SectionInfo<'data>>,
    by_name: HashMap<&'data [u8], OutputSectionId>,
}

impl<'data> OutputSections<'data> {
    pub(crate) fn new() -> Self {
        let mut sections = Self {
            infos: Vec::with_capacity(NUM_BUILT_IN_SECTIONS),
            by_name: HashMap::new(),
        };
        for details in &BUILT_INS {
            let id = OutputSectionId(sections.infos.len() as u32);
            sections.infos.push(SectionInfo {
                name: details.name,
                sh_type: details.sh_type,
                sh_flags: details.sh_flags,
            });
            sections.by_name.insert(details.name, id);
        }
        sections
    }

    /// Returns the output section for the given input section name, creating
    /// it if this is the first time the name has been seen. Repeated calls
    /// with the same name return the same id regardless of type and flags.
    pub(crate) fn get_instance(
        &mut self,
        name: &'data [u8],
        sh_type: u32,
        sh_flags: u64,
    ) -> OutputSectionId {
        for (prefix, id) in COLLAPSED_PREFIXES {
            if name == *prefix || (name.starts_with(prefix) && name.get(prefix.len()) == Some(&b'.'))
            {
                return *id;
            }
        }
        if let Some(id) = self.by_name.get(name) {
            return *id;
        }
        let id = OutputSectionId(self.infos.len() as u32);
        self.infos.push(SectionInfo {
            name,
            sh_type,
            // Section-type flags like merge/strings don't propagate to the
            // output section.
            sh_flags: sh_flags
                & !(u64::from(object::elf::SHF_MERGE)
                    | u64::from(object::elf::SHF_STRINGS)
                    | u64::from(object::elf::SHF_GROUP)),
        });
        self.by_name.insert(name, id);
        id
    }

    pub(crate) fn name(&self, id: OutputSectionId) -> &'data [u8] {
        self.infos[id.as_usize()].name
    }

    pub(crate) fn info(&self, id: OutputSectionId) -> &SectionInfo<'data> {
        &self.infos[id.as_usize()]
    }

    pub(crate) fn len(&self) -> usize {
        self.infos.len()
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = OutputSectionId> {
        (0..self.infos.len() as u32).map(OutputSectionId)
    }
}

/// Routes every input section to its output section. Runs single-threaded at
/// the parse barrier so custom sections register in file priority order.
#[tracing::instrument(skip_all, name = "Assign output sections")]
pub(crate) fn assign_output_sections<'data>(
    files: &mut [ObjectFile<'data>],
) -> OutputSections<'data> {
    let mut sections = OutputSections::new();
    for file in files {
        for slot in &mut file.sections {
            if let Some(section) = slot {
                section.output_section =
                    sections.get_instance(section.name, section.shdr.ty, section.shdr.flags);
            }
        }
    }
    sections
}
