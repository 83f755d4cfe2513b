//! Input sections and the cross-file handles that refer to them.

use crate::elf::Rela;
use crate::elf::RelType;
use crate::elf::SectionHeader;
use crate::fragment::FragmentId;
use crate::input_data::FileId;
use crate::output_section::OutputSectionId;
use smallvec::SmallVec;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// Identifies a section in any input file: the file id in the high half, the
/// section index in the low half. The numeric value is also the section's
/// ordering key: comparing two refs compares (file priority, section index),
/// which is the tie-break order used by ICF and layout.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub(crate) struct SectionRef(u64);

impl SectionRef {
    pub(crate) fn new(file: FileId, section_index: usize) -> Self {
        Self((u64::from(file.as_u32()) << 32) | section_index as u64)
    }

    pub(crate) fn file(self) -> FileId {
        FileId::new((self.0 >> 32) as u32)
    }

    pub(crate) fn section_index(self) -> usize {
        (self.0 as u32) as usize
    }

    pub(crate) fn as_u64(self) -> u64 {
        self.0
    }

    fn from_u64(value: u64) -> Self {
        Self(value)
    }
}

/// A relocation's reference to a piece of a mergeable section.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FragmentRef {
    pub(crate) frag: FragmentId,
    pub(crate) addend: i64,
}

/// An `.eh_frame` frame description entry associated with a section, kept
/// only so that unwind information participates in content equality checks.
pub(crate) struct FdeRecord<'data> {
    pub(crate) data: &'data [u8],
    pub(crate) rels: &'data [Rela],
}

const NO_ICF_IDX: u32 = u32::MAX;
const NO_LEADER: u64 = u64::MAX;

pub(crate) struct InputSection<'data> {
    pub(crate) index: u32,
    pub(crate) name: &'data [u8],
    pub(crate) shdr: SectionHeader,
    pub(crate) data: &'data [u8],
    pub(crate) rels: &'data [Rela],
    pub(crate) output_section: OutputSectionId,

    /// The abstract action for each relocation. Filled by the scanner for
    /// allocated sections only.
    pub(crate) rel_types: Vec<RelType>,

    /// `has_fragments[i]` is set when relocation `i` targets a symbol that
    /// points into a mergeable section; the matching entries of
    /// `rel_fragments` are consumed in order as the relocations are walked.
    pub(crate) has_fragments: Vec<bool>,
    pub(crate) rel_fragments: Vec<FragmentRef>,

    /// For sections that were split: (offset, fragment) pairs in ascending
    /// offset order. Split sections don't get emitted as a unit.
    pub(crate) fragments: Vec<(u32, FragmentId)>,
    pub(crate) is_merge: bool,

    pub(crate) fdes: SmallVec<[FdeRecord<'data>; 1]>,

    is_alive: AtomicBool,
    /// Index into the ICF working arrays while folding runs.
    pub(crate) icf_idx: AtomicU32,
    /// The surviving section this one was folded into, if any.
    leader: AtomicU64,

    /// Byte offset of this section's dynamic relocations within its file's
    /// slice of the output dynamic relocation table.
    pub(crate) reldyn_offset: u32,

    /// Offset within the output section, assigned by layout.
    pub(crate) output_offset: u64,
}

impl<'data> InputSection<'data> {
    pub(crate) fn new(
        index: usize,
        name: &'data [u8],
        shdr: SectionHeader,
        data: &'data [u8],
    ) -> Self {
        Self {
            index: index as u32,
            name,
            shdr,
            data,
            rels: &[],
            output_section: OutputSectionId::placeholder(),
            rel_types: Vec::new(),
            has_fragments: Vec::new(),
            rel_fragments: Vec::new(),
            fragments: Vec::new(),
            is_merge: false,
            fdes: SmallVec::new(),
            is_alive: AtomicBool::new(true),
            icf_idx: AtomicU32::new(NO_ICF_IDX),
            leader: AtomicU64::new(NO_LEADER),
            reldyn_offset: 0,
            output_offset: 0,
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.is_alive.load(Ordering::Acquire)
    }

    /// Marks the section as excluded from the output. Called cross-thread by
    /// COMDAT deduplication and ICF.
    pub(crate) fn kill(&self) {
        self.is_alive.store(false, Ordering::Release);
    }

    pub(crate) fn leader(&self) -> Option<SectionRef> {
        match self.leader.load(Ordering::Acquire) {
            NO_LEADER => None,
            value => Some(SectionRef::from_u64(value)),
        }
    }

    pub(crate) fn set_leader(&self, leader: SectionRef) {
        self.leader.store(leader.as_u64(), Ordering::Release);
    }

    pub(crate) fn icf_index(&self) -> Option<usize> {
        match self.icf_idx.load(Ordering::Acquire) {
            NO_ICF_IDX => None,
            value => Some(value as usize),
        }
    }

    pub(crate) fn set_icf_index(&self, index: usize) {
        self.icf_idx.store(index as u32, Ordering::Release);
    }

    pub(crate) fn is_allocated(&self) -> bool {
        self.shdr.has_flag(object::elf::SHF_ALLOC)
    }

    pub(crate) fn is_nobits(&self) -> bool {
        self.shdr.ty == object::elf::SHT_NOBITS
    }

    /// Whether the section occupies space in the output image.
    pub(crate) fn is_emitted(&self) -> bool {
        self.is_alive() && !self.is_merge
    }
}

/// Returns whether `name` is a valid C identifier. Sections with such names
/// can be referenced from code via `__start_<name>`/`__stop_<name>`, so they
/// must never be folded away.
pub(crate) fn is_c_identifier(name: &[u8]) -> bool {
    let Some((&first, rest)) = name.split_first() else {
        return false;
    };
    if !first.is_ascii_alphabetic() && first != b'_' {
        return false;
    }
    rest.iter().all(|&b| b.is_ascii_alphanumeric() || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_ref_packing_and_order() {
        let a = SectionRef::new(FileId::new(1), 9);
        let b = SectionRef::new(FileId::new(2), 3);
        assert_eq!(a.file(), FileId::new(1));
        assert_eq!(a.section_index(), 9);
        // File priority dominates the ordering.
        assert!(a < b);
        assert!(SectionRef::new(FileId::new(1), 3) < a);
    }

    #[test]
    fn c_identifiers() {
        assert!(is_c_identifier(b"my_section"));
        assert!(is_c_identifier(b"_private0"));
        assert!(!is_c_identifier(b""));
        assert!(!is_c_identifier(b".text"));
        assert!(!is_c_identifier(b"0start"));
        assert!(!is_c_identifier(b"has-dash"));
    }
}
