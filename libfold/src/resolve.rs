//! Resolves symbol references between files and decides which archive
//! members join the link. All tie-breaks reduce to file priority, which is
//! fixed before any parallel work starts, so the outcome is the same whatever
//! order the worker threads run in.

use crate::context::Context;
use crate::elf::SectionHeader;
use crate::error::Error;
use crate::error::Result;
use crate::fragment;
use crate::input_data::FileId;
use crate::output_section;
use crate::parsing::ObjectFile;
use crate::section::InputSection;
use crate::section::SectionRef;
use crate::symbol::SymbolCell;
use crossbeam_queue::ArrayQueue;
use crossbeam_utils::atomic::AtomicCell;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::IntoParallelRefMutIterator;
use rayon::iter::ParallelIterator;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

/// A COMDAT group, keyed by its signature. The winner is always the file
/// with the numerically smallest priority among all files that declared the
/// signature; every other declaration gets its member sections removed.
/// Sentinel stored in `ComdatGroup::file` meaning "no owner yet". `FileId`
/// values never reach `u32::MAX` in practice (that would require four
/// billion input files), so it is safe to reserve as a niche here to keep
/// the fast-path cell a lock-free 32-bit atomic.
const NO_OWNER: u32 = u32::MAX;

pub(crate) struct ComdatGroup {
    /// Owner fast path. The authoritative state is behind `mu`.
    file: AtomicCell<u32>,
    mu: Mutex<ComdatOwner>,
}

#[derive(Default, Clone, Copy)]
struct ComdatOwner {
    file: Option<FileId>,
    section_index: u32,
}

impl ComdatGroup {
    fn new() -> Self {
        Self {
            file: AtomicCell::new(NO_OWNER),
            mu: Mutex::new(ComdatOwner::default()),
        }
    }

    fn load_owner(&self) -> Option<FileId> {
        match self.file.load() {
            NO_OWNER => None,
            raw => Some(FileId::new(raw)),
        }
    }

    fn store_owner(&self, file: FileId) {
        self.file.store(file.as_u32());
    }

    #[cfg(test)]
    pub(crate) fn owner(&self) -> Option<FileId> {
        self.load_owner()
    }
}

pub(crate) struct ComdatGroups {
    pub(crate) groups: Vec<ComdatGroup>,
}

/// Merges the per-file signature lists into group records. Runs at the parse
/// barrier; group ids are deterministic because files are visited in priority
/// order.
pub(crate) fn collect_comdat_groups(files: &mut [ObjectFile]) -> ComdatGroups {
    assert!(AtomicCell::<u32>::is_lock_free());
    let mut ids: HashMap<&[u8], u32, foldhash::fast::FixedState> = HashMap::default();
    let mut groups = Vec::new();
    for file in files {
        file.comdat_groups = file
            .comdat_signatures
            .iter()
            .map(|&(signature, section_index)| {
                let id = *ids.entry(signature).or_insert_with(|| {
                    groups.push(ComdatGroup::new());
                    (groups.len() - 1) as u32
                });
                (id, section_index)
            })
            .collect();
    }
    ComdatGroups { groups }
}

#[tracing::instrument(skip_all, name = "Symbol resolution")]
pub(crate) fn resolve_symbols<'data>(
    files: &mut [ObjectFile<'data>],
    ctx: &Context<'data>,
) -> Result {
    resolve_file_symbols(files, ctx);
    eliminate_duplicate_comdat_groups(files, ctx)?;
    mark_live_archive_members(files, ctx);
    resolve_undefined_weak(files, ctx);
    convert_common_symbols(files, ctx);
    resolve_symbol_fragments(files, ctx);
    Ok(())
}

/// First pass over every file's defined globals. Archive members only lodge
/// placeholders: a promise that pulling the member in would provide the
/// definition.
#[tracing::instrument(skip_all, name = "Resolve file symbols")]
fn resolve_file_symbols<'data>(files: &[ObjectFile<'data>], ctx: &Context<'data>) {
    files.par_iter().for_each(|file| {
        for i in file.first_global..file.symtab.len() {
            let esym = &file.symtab[i];
            if !esym.is_defined() {
                continue;
            }
            let Some(id) = file.global_ids[i] else {
                continue;
            };
            let cell = ctx.symbols.cell(id);
            if file.is_in_archive {
                let mut def = cell.lock();
                let is_new = def.file.is_none();
                let tie_but_higher_priority = def.is_placeholder
                    && def.file.is_some_and(|f| file.priority() < f.as_u32());
                if is_new || tie_but_higher_priority {
                    def.file = Some(file.file_id);
                    def.is_placeholder = true;
                }
            } else {
                maybe_override_symbol(file, esym, cell);
            }
        }
    });
}

/// The definition merge. Locks the symbol, classifies the incumbent and
/// replaces all authoritative fields if this file's definition wins. The
/// decision function is total and antisymmetric on priorities, so the final
/// winner doesn't depend on the order in which threads get here.
fn maybe_override_symbol<'data>(
    file: &ObjectFile<'data>,
    esym: &crate::elf::SymtabEntry,
    cell: &SymbolCell<'data>,
) {
    let section = esym
        .section_index()
        .filter(|&index| file.input_section(index).is_some())
        .map(|index| file.section_ref(index));
    let is_weak = esym.is_weak();

    let mut def = cell.lock();
    let is_new = def.file.is_none();
    let win = def.is_placeholder || (def.is_weak && !is_weak);
    // A tie needs equal strength; without that, a late-arriving weak
    // definition from an earlier file could displace a strong one and the
    // result would depend on thread order.
    let tie_but_higher_priority = !is_new
        && !win
        && is_weak == def.is_weak
        && def.file.is_some_and(|f| file.priority() < f.as_u32());
    if is_new || win || tie_but_higher_priority {
        def.file = Some(file.file_id);
        def.section = section;
        def.fragment = None;
        def.value = esym.value;
        def.size = esym.size;
        def.sym_type = esym.sym_type();
        def.visibility = esym.visibility();
        def.is_placeholder = false;
        def.is_weak = is_weak;
        def.is_undef_weak = false;
        def.is_dso = file.is_dso;
    }
    let owner = def.file;
    drop(def);

    if cell.traced && owner == Some(file.file_id) {
        println!("trace: {}: definition of {}", file, cell.display_name());
    }
}

/// Keeps exactly one copy of each COMDAT group. Losers have their member
/// sections removed silently.
#[tracing::instrument(skip_all, name = "Deduplicate COMDAT groups")]
fn eliminate_duplicate_comdat_groups<'data>(
    files: &[ObjectFile<'data>],
    ctx: &Context<'data>,
) -> Result {
    let errors: ArrayQueue<Error> = ArrayQueue::new(1);
    files.par_iter().for_each(|file| {
        for &(group_id, section_index) in &file.comdat_groups {
            let group = &ctx.comdats.groups[group_id as usize];

            if let Some(owner) = group.load_owner() {
                if owner.as_u32() < file.priority() {
                    if let Err(error) = remove_comdat_members(file, section_index) {
                        let _ = errors.push(error);
                    }
                    continue;
                }
            }

            let loser;
            {
                let mut owner = group.mu.lock().unwrap();
                match owner.file {
                    None => {
                        owner.file = Some(file.file_id);
                        owner.section_index = section_index;
                        group.store_owner(file.file_id);
                        continue;
                    }
                    Some(current) => {
                        if current.as_u32() < file.priority() {
                            loser = (file.file_id, section_index);
                        } else {
                            loser = (current, owner.section_index);
                            owner.file = Some(file.file_id);
                            owner.section_index = section_index;
                            group.store_owner(file.file_id);
                        }
                    }
                }
            }
            let loser_file = &files[loser.0.as_usize()];
            if let Err(error) = remove_comdat_members(loser_file, loser.1) {
                let _ = errors.push(error);
            }
        }
    });
    if let Some(error) = errors.pop() {
        return Err(error);
    }
    Ok(())
}

fn remove_comdat_members(file: &ObjectFile, group_section_index: u32) -> Result {
    for &member in file.comdat_members(group_section_index)? {
        if let Some(section) = file.input_section(member as usize) {
            section.kill();
        }
    }
    Ok(())
}

/// Transitively pulls archive members into the link. Files outside archives
/// seed the traversal; each file is processed at most once thanks to the
/// test-and-set on `is_alive`.
#[tracing::instrument(skip_all, name = "Mark live archive members")]
fn mark_live_archive_members<'data>(files: &[ObjectFile<'data>], ctx: &Context<'data>) {
    rayon::scope(|scope| {
        for file in files.iter().filter(|f| !f.is_in_archive) {
            scope.spawn(move |scope| mark_file_live(file, files, ctx, scope));
        }
    });
}

fn mark_file_live<'scope, 'data>(
    file: &'scope ObjectFile<'data>,
    files: &'scope [ObjectFile<'data>],
    ctx: &'scope Context<'data>,
    scope: &rayon::Scope<'scope>,
) {
    if file.is_alive.swap(true, Ordering::AcqRel) {
        return;
    }
    for i in file.first_global..file.symtab.len() {
        let esym = &file.symtab[i];
        let Some(id) = file.global_ids[i] else {
            continue;
        };
        let cell = ctx.symbols.cell(id);

        if esym.is_defined() {
            // The placeholder from the first pass becomes a real definition
            // now that the member is in the link.
            if file.is_in_archive {
                maybe_override_symbol(file, esym, cell);
            }
            continue;
        }

        if cell.traced {
            println!("trace: {}: reference to {}", file, cell.display_name());
        }
        if esym.is_weak() {
            continue;
        }
        let target = cell.lock().file;
        if let Some(target_id) = target {
            let target_file = &files[target_id.as_usize()];
            if target_file.is_in_archive && !target_file.is_alive() {
                if cell.traced {
                    println!("trace: {} keeps {} for {}", file, target_file, cell.display_name());
                }
                scope.spawn(move |scope| mark_file_live(target_file, files, ctx, scope));
            }
        }
    }
}

/// Once liveness is final, still-unresolved weak references get claimed as
/// undefined-weak with value zero.
#[tracing::instrument(skip_all, name = "Resolve undefined weak symbols")]
fn resolve_undefined_weak<'data>(files: &[ObjectFile<'data>], ctx: &Context<'data>) {
    files
        .par_iter()
        .filter(|file| file.is_alive())
        .for_each(|file| {
            for i in file.first_global..file.symtab.len() {
                let esym = &file.symtab[i];
                if !esym.is_undefined() || !esym.is_weak() {
                    continue;
                }
                let Some(id) = file.global_ids[i] else {
                    continue;
                };
                let cell = ctx.symbols.cell(id);
                let mut def = cell.lock();
                let is_new = def
                    .file
                    .is_none_or(|f| !files[f.as_usize()].is_alive());
                let tie_but_higher_priority = !is_new
                    && def.is_undef_weak
                    && def.file.is_some_and(|f| file.priority() < f.as_u32());
                if is_new || tie_but_higher_priority {
                    def.file = Some(file.file_id);
                    def.section = None;
                    def.fragment = None;
                    def.value = 0;
                    def.size = 0;
                    def.visibility = esym.visibility();
                    def.is_undef_weak = true;
                    drop(def);
                    if cell.traced {
                        println!("trace: {}: unresolved weak symbol {}", file, cell.display_name());
                    }
                }
            }
        });
}

/// Materialises common symbols as synthetic NOBITS sections feeding `.bss`.
#[tracing::instrument(skip_all, name = "Convert common symbols")]
fn convert_common_symbols<'data>(files: &mut [ObjectFile<'data>], ctx: &Context<'data>) {
    files.par_iter_mut().for_each(|file| {
        if !file.has_common || !file.is_alive() {
            return;
        }
        for i in file.first_global..file.symtab.len() {
            let esym = file.symtab[i];
            if !esym.is_common() {
                continue;
            }
            let Some(id) = file.global_ids[i] else {
                continue;
            };
            let cell = ctx.symbols.cell(id);
            if cell.lock().file != Some(file.file_id) {
                continue;
            }

            let index = file.sections.len();
            let shdr = SectionHeader {
                name: 0,
                ty: object::elf::SHT_NOBITS,
                flags: u64::from(object::elf::SHF_ALLOC),
                address: 0,
                offset: 0,
                size: esym.size,
                link: 0,
                info: 0,
                alignment: 1,
                entsize: 0,
            };
            let mut section = InputSection::new(index, b".bss", shdr, &[]);
            section.output_section = output_section::BSS;
            file.sections.push(Some(section));

            let mut def = cell.lock();
            def.section = Some(SectionRef::new(file.file_id, index));
            def.value = 0;
        }
    });
}

/// Symbols that resolved into a mergeable section are redirected to the
/// fragment containing them, so their addresses follow the deduplicated copy.
#[tracing::instrument(skip_all, name = "Resolve symbol fragments")]
fn resolve_symbol_fragments<'data>(files: &[ObjectFile<'data>], ctx: &Context<'data>) {
    files.par_iter().for_each(|file| {
        if !file.is_alive() {
            return;
        }
        for i in file.first_global..file.symtab.len() {
            let Some(id) = file.global_ids[i] else {
                continue;
            };
            let cell = ctx.symbols.cell(id);
            let mut def = cell.lock();
            if def.file != Some(file.file_id) {
                continue;
            }
            let Some(section_ref) = def.section else {
                continue;
            };
            if section_ref.file() != file.file_id {
                continue;
            }
            let Some(section) = file.input_section(section_ref.section_index()) else {
                continue;
            };
            if !section.is_merge {
                continue;
            }
            if let Some((frag, within)) = fragment::find_fragment(&section.fragments, def.value) {
                def.fragment = Some((frag, within));
            }
        }
    });
}
