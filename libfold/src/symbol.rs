//! Global symbol identities. The interner hands out a stable `SymbolId` for
//! each distinct name seen anywhere in the link; the symbol table then holds
//! one cell per id with the mutable resolution state.

use crate::fragment::FragmentId;
use crate::input_data::FileId;
use crate::section::SectionRef;
use bitflags::bitflags;
use foldhash::fast::FixedState;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::ParallelIterator;
use std::collections::HashMap;
use std::hash::BuildHasher;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::sync::MutexGuard;

const SYMBOL_SHARDS: usize = 16;
const SHARD_BITS: u32 = 4;

/// Routes a name to its shard. Shard maps hash with the same fixed-seed
/// state internally, so a name is only ever hashed by one function; this
/// call just happens before the shard lock is taken.
fn shard_for(bytes: &[u8]) -> usize {
    (FixedState::default().hash_one(bytes) as usize) & (SYMBOL_SHARDS - 1)
}

/// Identifies a symbol across the whole link. Two occurrences of the same
/// name anywhere always map to the same id. Ids are sharded, so their numeric
/// order carries no meaning and is never used as a tie-breaker.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub(crate) struct SymbolId(u32);

impl SymbolId {
    fn new(shard: usize, index: usize) -> SymbolId {
        debug_assert!(index < (1 << (32 - SHARD_BITS)) as usize);
        SymbolId(((index as u32) << SHARD_BITS) | shard as u32)
    }

    fn shard(self) -> usize {
        (self.0 as usize) & (SYMBOL_SHARDS - 1)
    }

    fn index(self) -> usize {
        (self.0 >> SHARD_BITS) as usize
    }
}

#[derive(Default)]
struct InternShard<'data> {
    ids: HashMap<&'data [u8], u32, FixedState>,
    names: Vec<&'data [u8]>,
}

/// Process-wide name -> id mapping. `intern` is safe to call concurrently
/// from any number of threads and always returns the same id for equal names.
pub(crate) struct SymbolInterner<'data> {
    shards: [Mutex<InternShard<'data>>; SYMBOL_SHARDS],
}

impl<'data> SymbolInterner<'data> {
    pub(crate) fn new() -> Self {
        Self {
            shards: std::array::from_fn(|_| Mutex::new(InternShard::default())),
        }
    }

    pub(crate) fn intern(&self, name: &'data [u8]) -> SymbolId {
        let shard_index = shard_for(name);
        let mut shard = self.shards[shard_index].lock().unwrap();
        if let Some(&index) = shard.ids.get(name) {
            return SymbolId::new(shard_index, index as usize);
        }
        let index = shard.names.len() as u32;
        shard.ids.insert(name, index);
        shard.names.push(name);
        SymbolId::new(shard_index, index as usize)
    }
}

bitflags! {
    /// Auxiliary entries a symbol was found to need during relocation
    /// scanning. Merged with atomic OR; read once scanning is complete.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub(crate) struct SymFlags: u32 {
        const NEEDS_GOT = 1 << 0;
        const NEEDS_PLT = 1 << 1;
        const NEEDS_COPYREL = 1 << 2;
        const NEEDS_DYNSYM = 1 << 3;
        const NEEDS_TLSGD = 1 << 4;
        const NEEDS_TLSLD = 1 << 5;
        const NEEDS_GOTTPOFF = 1 << 6;
    }
}

/// The authoritative definition of a symbol. Only ever written while the
/// owning cell's lock is held; read freely once resolution has finished.
#[derive(Clone, Copy, Default)]
pub(crate) struct SymbolDef {
    pub(crate) file: Option<FileId>,
    pub(crate) section: Option<SectionRef>,
    /// Set when the definition lands inside a mergeable section; `offset` is
    /// the distance from the start of the fragment.
    pub(crate) fragment: Option<(FragmentId, u64)>,
    pub(crate) value: u64,
    pub(crate) size: u64,
    pub(crate) sym_type: u8,
    pub(crate) visibility: u8,
    pub(crate) is_placeholder: bool,
    pub(crate) is_weak: bool,
    pub(crate) is_undef_weak: bool,
    pub(crate) is_dso: bool,
}

impl SymbolDef {
    pub(crate) fn is_imported(&self) -> bool {
        self.is_dso
    }

    /// Whether the symbol's value depends on the image load address.
    pub(crate) fn is_relative(&self) -> bool {
        self.section.is_some() || self.fragment.is_some()
    }
}

/// Indices into the auxiliary output structures, assigned during layout.
/// `u32::MAX` means no entry was allocated.
#[derive(Clone, Copy)]
pub(crate) struct SymbolAux {
    pub(crate) got_idx: u32,
    pub(crate) plt_idx: u32,
    pub(crate) tlsgd_idx: u32,
    pub(crate) gottpoff_idx: u32,
    pub(crate) dynsym_idx: u32,
    pub(crate) copyrel_addr: u64,
}

impl Default for SymbolAux {
    fn default() -> Self {
        Self {
            got_idx: u32::MAX,
            plt_idx: u32::MAX,
            tlsgd_idx: u32::MAX,
            gottpoff_idx: u32::MAX,
            dynsym_idx: u32::MAX,
            copyrel_addr: 0,
        }
    }
}

pub(crate) struct SymbolCell<'data> {
    pub(crate) name: &'data [u8],
    def: Mutex<SymbolDef>,
    flags: AtomicU32,
    pub(crate) traced: bool,
    pub(crate) aux: SymbolAux,
}

impl<'data> SymbolCell<'data> {
    fn new(name: &'data [u8]) -> Self {
        Self {
            name,
            def: Mutex::new(SymbolDef::default()),
            flags: AtomicU32::new(0),
            traced: false,
            aux: SymbolAux::default(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SymbolDef> {
        self.def.lock().unwrap()
    }

    /// Snapshot of the definition. Used by the read-only phases after
    /// resolution has settled.
    pub(crate) fn def(&self) -> SymbolDef {
        *self.def.lock().unwrap()
    }

    pub(crate) fn request(&self, flags: SymFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::Relaxed);
    }

    pub(crate) fn requested(&self) -> SymFlags {
        SymFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    pub(crate) fn display_name(&self) -> std::borrow::Cow<'data, str> {
        String::from_utf8_lossy(self.name)
    }
}

struct TableShard<'data> {
    ids: HashMap<&'data [u8], u32, FixedState>,
    cells: Vec<SymbolCell<'data>>,
}

pub(crate) struct SymbolTable<'data> {
    shards: Vec<TableShard<'data>>,
}

impl<'data> SymbolTable<'data> {
    /// Consumes the interner, creating one cell per interned name.
    pub(crate) fn build(interner: SymbolInterner<'data>) -> Self {
        let shards = interner
            .shards
            .into_iter()
            .map(|shard| {
                let shard = shard.into_inner().unwrap();
                TableShard {
                    ids: shard.ids,
                    cells: shard.names.into_iter().map(SymbolCell::new).collect(),
                }
            })
            .collect();
        Self { shards }
    }

    pub(crate) fn cell(&self, id: SymbolId) -> &SymbolCell<'data> {
        &self.shards[id.shard()].cells[id.index()]
    }

    pub(crate) fn cell_mut(&mut self, id: SymbolId) -> &mut SymbolCell<'data> {
        &mut self.shards[id.shard()].cells[id.index()]
    }

    pub(crate) fn name(&self, id: SymbolId) -> &'data [u8] {
        self.cell(id).name
    }

    pub(crate) fn lookup(&self, bytes: &[u8]) -> Option<SymbolId> {
        let shard_index = shard_for(bytes);
        self.shards[shard_index]
            .ids
            .get(bytes)
            .map(|&index| SymbolId::new(shard_index, index as usize))
    }

    pub(crate) fn num_symbols(&self) -> usize {
        self.shards.iter().map(|s| s.cells.len()).sum()
    }

    pub(crate) fn mark_traced(&mut self, names: &[String]) {
        for name in names {
            if let Some(id) = self.lookup(name.as_bytes()) {
                self.cell_mut(id).traced = true;
            }
        }
    }

    pub(crate) fn par_cells<'a>(
        &'a self,
    ) -> impl ParallelIterator<Item = &'a SymbolCell<'data>> + 'a {
        self.shards.par_iter().flat_map(|shard| shard.cells.par_iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_is_stable_across_threads() {
        let names: [&[u8]; 5] = [b"alpha", b"beta", b"gamma", b"delta", b"epsilon"];
        let interner = SymbolInterner::new();
        let ids: Vec<Vec<SymbolId>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        names
                            .iter()
                            .map(|&name| interner.intern(name))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for other in &ids[1..] {
            assert_eq!(&ids[0], other);
        }

        let table = SymbolTable::build(interner);
        assert_eq!(table.num_symbols(), names.len());
        for (&name, &id) in names.iter().zip(&ids[0]) {
            assert_eq!(table.lookup(name), Some(id));
            assert_eq!(table.name(id), name);
        }
        assert_eq!(table.lookup(b"zeta"), None);
    }

    #[test]
    fn request_flags_accumulate() {
        let cell = SymbolCell::new(b"x");
        cell.request(SymFlags::NEEDS_GOT);
        cell.request(SymFlags::NEEDS_TLSGD | SymFlags::NEEDS_DYNSYM);
        assert_eq!(
            cell.requested(),
            SymFlags::NEEDS_GOT | SymFlags::NEEDS_TLSGD | SymFlags::NEEDS_DYNSYM
        );
    }
}
