//! Identical code folding. Finds input sections that are observationally
//! identical (same bytes, same flags, transitively identical references) and
//! keeps a single copy.
//!
//! A one-shot content digest can't see that two sections are equal only
//! because the sections they reference become equal, so folding runs as a
//! fixed-point refinement: every round combines each section's digest with
//! the digests of its reference targets, which can only split equivalence
//! classes, never merge them. The round count is bounded by the longest
//! reference chain, and the final partition doesn't depend on thread
//! scheduling because every ordering step is keyed by (digest, section
//! priority).

use crate::context::Context;
use crate::error::Result;
use crate::parsing::ObjectFile;
use crate::section::is_c_identifier;
use crate::section::InputSection;
use crate::section::SectionRef;
use rayon::iter::IndexedParallelIterator;
use rayon::iter::IntoParallelIterator;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::IntoParallelRefMutIterator;
use rayon::iter::ParallelIterator;
use rayon::slice::ParallelSliceMut;
use sha2::Digest as _;
use sha2::Sha256;

const DIGEST_SIZE: usize = 16;

type Digest = [u8; DIGEST_SIZE];

#[tracing::instrument(skip_all, name = "Fold identical sections")]
pub(crate) fn fold_identical_sections<'data>(
    files: &[ObjectFile<'data>],
    ctx: &Context<'data>,
) -> Result {
    let gathered = gather_sections(files, ctx);
    if gathered.num_eligible == 0 {
        return Ok(());
    }
    let final_digests = propagate(&gathered);
    merge(files, ctx, &gathered, &final_digests);
    Ok(())
}

fn is_eligible(section: &InputSection) -> bool {
    let is_alloc = section.shdr.has_flag(object::elf::SHF_ALLOC);
    let is_executable = section.shdr.has_flag(object::elf::SHF_EXECINSTR);
    let is_writable = section.shdr.has_flag(object::elf::SHF_WRITE);
    let is_bss = section.shdr.ty == object::elf::SHT_NOBITS;
    let is_init =
        section.shdr.ty == object::elf::SHT_INIT_ARRAY || section.name == b".init".as_slice();
    let is_fini =
        section.shdr.ty == object::elf::SHT_FINI_ARRAY || section.name == b".fini".as_slice();
    // Sections whose name is a C identifier may be addressed via
    // __start_/__stop_ symbols from code we can't see.
    let is_enumerable = is_c_identifier(section.name);

    is_alloc && is_executable && !is_writable && !is_bss && !is_init && !is_fini && !is_enumerable
}

/// What a relocation's symbol refers to, uniformly for locals and globals.
struct SymbolView {
    fragment: Option<crate::fragment::FragmentId>,
    section: Option<SectionRef>,
    value: u64,
}

fn symbol_view<'data>(
    file: &ObjectFile<'data>,
    files: &[ObjectFile<'data>],
    ctx: &Context<'data>,
    sym_index: usize,
) -> SymbolView {
    if let Some(Some(id)) = file.global_ids.get(sym_index) {
        let def = ctx.symbols.cell(*id).def();
        return SymbolView {
            fragment: def.fragment.map(|(frag, _)| frag),
            section: def.section.filter(|r| section_is_alive(files, *r)),
            value: def.value,
        };
    }
    let Some(esym) = file.symtab.get(sym_index) else {
        return SymbolView {
            fragment: None,
            section: None,
            value: 0,
        };
    };
    let section = esym
        .section_index()
        .filter(|&index| file.input_section(index).is_some())
        .map(|index| file.section_ref(index))
        .filter(|r| section_is_alive(files, *r));
    SymbolView {
        fragment: None,
        section,
        value: esym.value,
    }
}

fn section_at<'a, 'data>(
    files: &'a [ObjectFile<'data>],
    r: SectionRef,
) -> &'a InputSection<'data> {
    files[r.file().as_usize()]
        .input_section(r.section_index())
        .expect("SectionRef to suppressed section")
}

fn section_at_opt<'a, 'data>(
    files: &'a [ObjectFile<'data>],
    r: SectionRef,
) -> Option<&'a InputSection<'data>> {
    files.get(r.file().as_usize())?.input_section(r.section_index())
}

fn section_is_alive(files: &[ObjectFile], r: SectionRef) -> bool {
    section_at_opt(files, r).is_some_and(|s| s.is_alive())
}

fn hash_u64(hasher: &mut Sha256, value: u64) {
    hasher.update(value.to_le_bytes());
}

fn hash_slice(hasher: &mut Sha256, bytes: &[u8]) {
    hash_u64(hasher, bytes.len() as u64);
    hasher.update(bytes);
}

fn hash_symbol(hasher: &mut Sha256, view: &SymbolView, ctx: &Context) {
    if let Some(frag) = view.fragment {
        hash_u64(hasher, 2);
        hash_slice(hasher, ctx.fragments.get(frag).data);
    } else if view.section.is_none() {
        hash_u64(hasher, 3);
    } else {
        hash_u64(hasher, 4);
    }
    hash_u64(hasher, view.value);
}

fn digest_final(hasher: Sha256) -> Digest {
    let full = hasher.finalize();
    let mut out = [0u8; DIGEST_SIZE];
    out.copy_from_slice(&full[..DIGEST_SIZE]);
    out
}

/// The initial content digest of an eligible section: its bytes, flags,
/// unwind records and relocations, with reference targets folded in by
/// content where they're position-independent (fragments) and by coarse kind
/// otherwise. The FDE bytes at [4, 8) hold the CIE offset, which depends on
/// final layout, so they're excluded.
fn compute_digest<'data>(
    file: &ObjectFile<'data>,
    section: &InputSection<'data>,
    files: &[ObjectFile<'data>],
    ctx: &Context<'data>,
) -> Digest {
    let mut hasher = Sha256::new();

    hash_slice(&mut hasher, section.data);
    hash_u64(&mut hasher, section.shdr.flags);
    hash_u64(&mut hasher, section.fdes.len() as u64);
    hash_u64(&mut hasher, section.rels.len() as u64);

    for fde in &section.fdes {
        hash_slice(&mut hasher, &fde.data[..4.min(fde.data.len())]);
        hash_slice(&mut hasher, fde.data.get(8..).unwrap_or(&[]));
        hash_u64(&mut hasher, fde.rels.len() as u64);
        // The first FDE relocation points back at this section; hashing it
        // would make every section distinct.
        for rel in fde.rels.iter().skip(1) {
            let view = symbol_view(file, files, ctx, rel.r_sym());
            hash_symbol(&mut hasher, &view, ctx);
            hash_u64(&mut hasher, u64::from(rel.r_type()));
            hash_u64(&mut hasher, rel.offset);
            hash_u64(&mut hasher, rel.addend as u64);
        }
    }

    let mut ref_index = 0;
    for (i, rel) in section.rels.iter().enumerate() {
        hash_u64(&mut hasher, rel.offset);
        hash_u64(&mut hasher, u64::from(rel.r_type()));
        hash_u64(&mut hasher, rel.addend as u64);

        if section.has_fragments.get(i).copied().unwrap_or(false) {
            let fragment_ref = &section.rel_fragments[ref_index];
            ref_index += 1;
            hash_u64(&mut hasher, 1);
            hash_u64(&mut hasher, fragment_ref.addend as u64);
            hash_slice(&mut hasher, ctx.fragments.get(fragment_ref.frag).data);
        } else {
            let view = symbol_view(file, files, ctx, rel.r_sym());
            hash_symbol(&mut hasher, &view, ctx);
        }
    }

    digest_final(hasher)
}

/// A digest no real content hash will collide with: ineligible sections are
/// their own equivalence class, keyed by their ordering priority.
fn unique_digest(section_ref: SectionRef) -> Digest {
    let mut out = [0u8; DIGEST_SIZE];
    out[..8].copy_from_slice(&section_ref.as_u64().to_le_bytes());
    out
}

struct Gathered {
    /// Section of each entry, sorted eligible-first then by initial digest.
    sections: Vec<SectionRef>,
    /// Initial digest per entry, aligned with `sections`.
    digests: Vec<Digest>,
    num_eligible: usize,
    /// Outgoing edges of the first `num_eligible` entries, flattened.
    edge_indices: Vec<u32>,
    edges: Vec<u32>,
}

#[tracing::instrument(skip_all, name = "Gather sections")]
fn gather_sections<'data>(files: &[ObjectFile<'data>], ctx: &Context<'data>) -> Gathered {
    struct Entry {
        sec: SectionRef,
        digest: Digest,
        eligible: bool,
    }

    let mut entries: Vec<Entry> = files
        .iter()
        .filter(|file| file.is_alive())
        .flat_map(|file| {
            file.sections
                .iter()
                .flatten()
                .filter(|section| section.is_alive())
                .map(move |section| Entry {
                    sec: file.section_ref(section.index as usize),
                    digest: [0; DIGEST_SIZE],
                    eligible: is_eligible(section),
                })
        })
        .collect();

    entries.par_iter_mut().for_each(|entry| {
        entry.digest = if entry.eligible {
            let file = &files[entry.sec.file().as_usize()];
            compute_digest(file, section_at(files, entry.sec), files, ctx)
        } else {
            unique_digest(entry.sec)
        };
    });

    // Eligible sections first, ordered by digest so that equal candidates sit
    // next to each other; priority as the final key makes the order total.
    entries.par_sort_unstable_by(|a, b| {
        b.eligible
            .cmp(&a.eligible)
            .then_with(|| a.digest.cmp(&b.digest))
            .then_with(|| a.sec.cmp(&b.sec))
    });

    entries
        .par_iter()
        .enumerate()
        .for_each(|(i, entry)| section_at(files, entry.sec).set_icf_index(i));

    let num_eligible = entries.iter().take_while(|e| e.eligible).count();

    let edge_lists: Vec<Vec<u32>> = entries[..num_eligible]
        .par_iter()
        .map(|entry| {
            let file = &files[entry.sec.file().as_usize()];
            let section = section_at(files, entry.sec);
            let mut out = Vec::new();
            for (i, rel) in section.rels.iter().enumerate() {
                if section.has_fragments.get(i).copied().unwrap_or(false) {
                    continue;
                }
                let view = symbol_view(file, files, ctx, rel.r_sym());
                if view.fragment.is_some() {
                    continue;
                }
                let Some(target_ref) = view.section else {
                    continue;
                };
                let Some(target) = section_at_opt(files, target_ref) else {
                    continue;
                };
                if let Some(index) = target.icf_index() {
                    out.push(index as u32);
                }
            }
            out
        })
        .collect();

    let mut edge_indices = Vec::with_capacity(num_eligible);
    let mut edges = Vec::new();
    for list in &edge_lists {
        edge_indices.push(edges.len() as u32);
        edges.extend_from_slice(list);
    }

    Gathered {
        digests: entries.iter().map(|e| e.digest).collect(),
        sections: entries.into_iter().map(|e| e.sec).collect(),
        num_eligible,
        edge_indices,
        edges,
    }
}

/// Refines the equivalence classes until the class count stops changing.
/// Only eligible entries are re-hashed; ineligible digests are constant and
/// already unique.
#[tracing::instrument(skip_all, name = "Propagate digests")]
fn propagate(gathered: &Gathered) -> Vec<Digest> {
    let num_eligible = gathered.num_eligible;
    let mut current = gathered.digests.clone();
    let mut next = gathered.digests.clone();

    let count_classes = |digests: &[Digest]| -> usize {
        if num_eligible == 0 {
            return 0;
        }
        let boundaries = (0..num_eligible - 1)
            .into_par_iter()
            .filter(|&i| digests[i] != digests[i + 1])
            .count();
        boundaries + 1
    };

    let mut num_classes = count_classes(&current);
    loop {
        {
            let current = &current;
            next[..num_eligible]
                .par_iter_mut()
                .enumerate()
                .for_each(|(i, out)| {
                    let mut hasher = Sha256::new();
                    hasher.update(current[i]);
                    let begin = gathered.edge_indices[i] as usize;
                    let end = if i + 1 == num_eligible {
                        gathered.edges.len()
                    } else {
                        gathered.edge_indices[i + 1] as usize
                    };
                    for &edge in &gathered.edges[begin..end] {
                        hasher.update(current[edge as usize]);
                    }
                    *out = digest_final(hasher);
                });
        }
        std::mem::swap(&mut current, &mut next);

        let n = count_classes(&current);
        if n == num_classes {
            break;
        }
        num_classes = n;
    }
    current
}

/// Groups sections by final digest, picks the lowest-priority member of each
/// group as its leader, retargets symbols and kills the rest.
#[tracing::instrument(skip_all, name = "Merge equivalent sections")]
fn merge<'data>(
    files: &[ObjectFile<'data>],
    ctx: &Context<'data>,
    gathered: &Gathered,
    final_digests: &[Digest],
) {
    let mut groups: Vec<(Digest, SectionRef)> = (0..gathered.num_eligible)
        .map(|i| (final_digests[i], gathered.sections[i]))
        .collect();
    groups.par_sort_unstable();

    let mut losers = Vec::new();
    let mut run_start = 0;
    while run_start < groups.len() {
        let mut run_end = run_start + 1;
        while run_end < groups.len() && groups[run_end].0 == groups[run_start].0 {
            run_end += 1;
        }
        if run_end > run_start + 1 {
            let leader = groups[run_start].1;
            for &(_, member) in &groups[run_start + 1..run_end] {
                section_at(files, member).set_leader(leader);
                losers.push(member);
            }
        }
        run_start = run_end;
    }

    // Any symbol whose section was folded now points at the leader. Offsets
    // within the section are unchanged by construction.
    ctx.symbols.par_cells().for_each(|cell| {
        let mut def = cell.lock();
        if let Some(section_ref) = def.section {
            if let Some(section) = section_at_opt(files, section_ref) {
                if let Some(leader) = section.leader() {
                    def.section = Some(leader);
                }
            }
        }
    });

    losers.par_iter().for_each(|&r| section_at(files, r).kill());

    if ctx.args.print_icf_sections {
        print_icf_sections(files, &groups);
    }
}

fn print_icf_sections(files: &[ObjectFile], groups: &[(Digest, SectionRef)]) {
    let mut saved_bytes = 0usize;
    let mut run_start = 0;
    while run_start < groups.len() {
        let mut run_end = run_start + 1;
        while run_end < groups.len() && groups[run_end].0 == groups[run_start].0 {
            run_end += 1;
        }
        if run_end > run_start + 1 {
            let leader = groups[run_start].1;
            let leader_file = &files[leader.file().as_usize()];
            let leader_section = section_at(files, leader);
            println!(
                "selected section {}",
                leader_file.display_section(leader_section.name)
            );
            for &(_, member) in &groups[run_start + 1..run_end] {
                let member_file = &files[member.file().as_usize()];
                let member_section = section_at(files, member);
                println!(
                    "  removing identical section {}",
                    member_file.display_section(member_section.name)
                );
            }
            saved_bytes += leader_section.data.len() * (run_end - run_start - 1);
        }
        run_start = run_end;
    }
    println!("ICF saved {saved_bytes} bytes");
}
