//! Copies live section bodies into the output image and patches them with
//! final addresses. Every write dispatches on the abstract action the
//! scanner assigned, computes the value, range-checks it and stores it
//! little-endian. Workers get disjoint slices of the image, so the whole
//! pass runs in parallel without synchronisation.

use crate::context::Context;
use crate::elf::rel_type_to_string;
use crate::elf::value_range;
use crate::elf::write_value;
use crate::elf::Rela;
use crate::elf::RelType;
use crate::elf::RELA_ENTRY_SIZE;
use crate::error::Result;
use crate::layout::Layout;
use crate::output_section;
use crate::parsing::ObjectFile;
use crate::section::InputSection;
use crate::section::SectionRef;
use crate::symbol::SymbolAux;
use crate::symbol::SymbolDef;
use anyhow::anyhow;
use bytemuck::Zeroable;
use itertools::izip;
use rayon::iter::IntoParallelIterator;
use rayon::iter::ParallelIterator;

pub(crate) struct OutputImage {
    pub(crate) buf: Vec<u8>,
    pub(crate) dynrels: Vec<Rela>,
}

struct Job<'a, 'data> {
    file: &'a ObjectFile<'data>,
    section: &'a InputSection<'data>,
    file_offset: usize,
    dynrel_start: usize,
    dynrel_count: usize,
}

#[tracing::instrument(skip_all, name = "Copy and apply relocations")]
pub(crate) fn copy_and_apply<'data>(
    files: &[ObjectFile<'data>],
    ctx: &Context<'data>,
    layout: &Layout,
) -> Result<OutputImage> {
    let mut buf = vec![0u8; layout.image_size];
    let mut dynrels = vec![Rela::zeroed(); layout.num_dynrel as usize];

    // Unique fragments are not owned by any input section, so their bytes go
    // in before the buffer is carved up.
    let rodata = output_section::RODATA.as_usize();
    for id in ctx.fragments.ids() {
        let frag = ctx.fragments.get(id);
        let offset =
            (layout.file_offsets[rodata] + (frag.address - layout.mem_addresses[rodata])) as usize;
        buf[offset..offset + frag.data.len()].copy_from_slice(frag.data);
    }

    let mut jobs: Vec<Job> = Vec::new();
    for file in files.iter().filter(|f| f.is_alive()) {
        for slot in &file.sections {
            let Some(section) = slot else { continue };
            if !section.is_emitted() || section.is_nobits() || section.data.is_empty() {
                continue;
            }
            let out = section.output_section.as_usize();
            let dynrel_count = section
                .rel_types
                .iter()
                .filter(|t| matches!(t, RelType::AbsDyn | RelType::Dyn))
                .count();
            jobs.push(Job {
                file,
                section,
                file_offset: (layout.file_offsets[out] + section.output_offset) as usize,
                dynrel_start: ((file.reldyn_offset + section.reldyn_offset)
                    / RELA_ENTRY_SIZE as u32) as usize,
                dynrel_count,
            });
        }
    }

    // Hand each job its own slice of the image. Gaps between slices are
    // alignment padding and stay zero.
    jobs.sort_by_key(|job| job.file_offset);
    let mut out_slices: Vec<&mut [u8]> = Vec::with_capacity(jobs.len());
    {
        let mut rest: &mut [u8] = &mut buf;
        let mut cursor = 0usize;
        for job in &jobs {
            take_prefix(&mut rest, job.file_offset - cursor);
            out_slices.push(take_prefix(&mut rest, job.section.data.len()));
            cursor = job.file_offset + job.section.data.len();
        }
    }

    // Same for the dynamic relocation table, whose per-section ranges were
    // fixed during scanning and layout.
    let mut dyn_slices: Vec<Option<&mut [Rela]>> = (0..jobs.len()).map(|_| None).collect();
    {
        let mut order: Vec<usize> = (0..jobs.len()).filter(|&i| jobs[i].dynrel_count > 0).collect();
        order.sort_by_key(|&i| jobs[i].dynrel_start);
        let mut rest: &mut [Rela] = &mut dynrels;
        let mut cursor = 0usize;
        for &i in &order {
            take_prefix(&mut rest, jobs[i].dynrel_start - cursor);
            dyn_slices[i] = Some(take_prefix(&mut rest, jobs[i].dynrel_count));
            cursor = jobs[i].dynrel_start + jobs[i].dynrel_count;
        }
    }

    let work: Vec<(Job, &mut [u8], Option<&mut [Rela]>)> =
        izip!(jobs, out_slices, dyn_slices).collect();
    work.into_par_iter().for_each(|(job, out, dynrel)| {
        out.copy_from_slice(job.section.data);
        if job.section.is_allocated() {
            apply_alloc(&job, out, dynrel.unwrap_or(&mut []), files, ctx, layout);
        } else {
            apply_nonalloc(&job, out, files, ctx, layout);
        }
    });

    Ok(OutputImage { buf, dynrels })
}

/// Splits the first `n` elements off the front of `*data`.
fn take_prefix<'t, T>(data: &mut &'t mut [T], n: usize) -> &'t mut [T] {
    let owned = core::mem::take(data);
    let (prefix, rest) = owned.split_at_mut(n);
    *data = rest;
    prefix
}

struct Target {
    def: SymbolDef,
    aux: SymbolAux,
}

/// The resolved target of a relocation: the global definition for interned
/// symbols, or a view of the local symbol entry.
fn resolve_target(file: &ObjectFile, sym_index: usize, ctx: &Context) -> Target {
    if let Some(Some(id)) = file.global_ids.get(sym_index) {
        let cell = ctx.symbols.cell(*id);
        return Target {
            def: cell.def(),
            aux: cell.aux,
        };
    }
    let esym = file.symtab.get(sym_index).copied().unwrap_or_else(Zeroable::zeroed);
    Target {
        def: SymbolDef {
            file: Some(file.file_id),
            section: esym
                .section_index()
                .map(|index| SectionRef::new(file.file_id, index)),
            fragment: None,
            value: esym.value,
            size: esym.size,
            sym_type: esym.sym_type(),
            visibility: esym.visibility(),
            is_placeholder: false,
            is_weak: false,
            is_undef_weak: false,
            is_dso: false,
        },
        aux: file.local_aux.get(sym_index).copied().unwrap_or_default(),
    }
}

/// Range-checks then stores a relocation value. Both failure modes are
/// reported rather than fatal so that one bad input surfaces every broken
/// relocation at once.
fn checked_write(
    out: &mut [u8],
    r_type: u32,
    offset: usize,
    value: u64,
    ctx: &Context,
    describe: &dyn Fn() -> (String, String),
) {
    let range = value_range(r_type);
    if !range.contains(value) {
        let (section, symbol) = describe();
        let shown = if range.is_signed() {
            (value as i64).to_string()
        } else {
            value.to_string()
        };
        ctx.diagnostics.report(anyhow!(
            "{section}: relocation {} against symbol `{symbol}' out of range: {shown} is not in {}",
            rel_type_to_string(r_type),
            range.bounds()
        ));
        return;
    }
    if let Err(error) = write_value(r_type, out, offset, value) {
        let (section, symbol) = describe();
        ctx.diagnostics
            .report(error.context(format!("{section}: relocation against `{symbol}'")));
    }
}

fn apply_alloc<'data>(
    job: &Job<'_, 'data>,
    out: &mut [u8],
    dynrel: &mut [Rela],
    files: &[ObjectFile<'data>],
    ctx: &Context<'data>,
    layout: &Layout,
) {
    let file = job.file;
    let section = job.section;
    let section_addr =
        layout.mem_addresses[section.output_section.as_usize()] + section.output_offset;

    let mut dyn_cursor = 0usize;
    let mut ref_index = 0usize;
    let mut i = 0usize;
    while i < section.rels.len() {
        let rel = &section.rels[i];
        let action = section.rel_types.get(i).copied().unwrap_or(RelType::None);
        let offset = rel.offset as usize;
        let place = section_addr + rel.offset;

        let fragment_ref = if section.has_fragments.get(i).copied().unwrap_or(false) {
            let r = section.rel_fragments[ref_index];
            ref_index += 1;
            Some(r)
        } else {
            None
        };

        let target = resolve_target(file, rel.r_sym(), ctx);
        // S and A per the action table: the fragment address and
        // fragment-relative addend when the relocation targets a merged
        // piece, otherwise the symbol (via its PLT stub if it has one) and
        // the relocation addend.
        let (s, addend) = match fragment_ref {
            Some(fr) => (ctx.fragments.get(fr.frag).address, fr.addend),
            None => {
                let s = if target.aux.plt_idx != u32::MAX {
                    layout.plt_entry_addr(target.aux.plt_idx)
                } else {
                    layout.symbol_address(files, ctx, &target.def, &target.aux)
                };
                (s, rel.addend)
            }
        };
        let a = addend as u64;

        let describe = || {
            (
                file.display_section(section.name).to_string(),
                file.display_symbol_name(rel.r_sym(), &ctx.symbols),
            )
        };
        let r_type = rel.r_type();

        match action {
            RelType::None => {}
            RelType::Abs => {
                checked_write(out, r_type, offset, s.wrapping_add(a), ctx, &describe);
            }
            RelType::AbsDyn => {
                let value = s.wrapping_add(a);
                checked_write(out, r_type, offset, value, ctx, &describe);
                dynrel[dyn_cursor] =
                    Rela::new(place, object::elf::R_X86_64_RELATIVE, 0, value as i64);
                dyn_cursor += 1;
            }
            RelType::Dyn => {
                dynrel[dyn_cursor] = Rela::new(
                    place,
                    object::elf::R_X86_64_64,
                    target.aux.dynsym_idx,
                    addend,
                );
                dyn_cursor += 1;
            }
            RelType::Pc => {
                let value = s.wrapping_add(a).wrapping_sub(place);
                checked_write(out, r_type, offset, value, ctx, &describe);
            }
            RelType::Got => {
                // Offset of the GOT slot from the GOT base.
                let g = u64::from(target.aux.got_idx) * crate::elf::GOT_ENTRY_SIZE;
                checked_write(out, r_type, offset, g.wrapping_add(a), ctx, &describe);
            }
            RelType::GotPc => {
                let value = layout.got_addr.wrapping_add(a).wrapping_sub(place);
                checked_write(out, r_type, offset, value, ctx, &describe);
            }
            RelType::GotPcRel => {
                let value = layout
                    .got_entry_addr(target.aux.got_idx)
                    .wrapping_add(a)
                    .wrapping_sub(place);
                checked_write(out, r_type, offset, value, ctx, &describe);
            }
            RelType::TlsGd => {
                let value = layout
                    .got_entry_addr(target.aux.tlsgd_idx)
                    .wrapping_add(a)
                    .wrapping_sub(place);
                checked_write(out, r_type, offset, value, ctx, &describe);
            }
            RelType::TlsGdRelaxLe => {
                // mov %fs:0,%rax; lea x@tpoff,%rax replacing the
                // __tls_get_addr call pair.
                const INSN: [u8; 16] = [
                    0x64, 0x48, 0x8b, 0x04, 0x25, 0, 0, 0, 0, // mov %fs:0,%rax
                    0x48, 0x8d, 0x80, 0, 0, 0, 0, // lea {offset}(%rax),%rax
                ];
                if offset < 4 || offset + 12 > out.len() {
                    let (section, symbol) = describe();
                    ctx.diagnostics.report(anyhow!(
                        "{section}: TLSGD relaxation site for `{symbol}' is out of bounds"
                    ));
                } else {
                    out[offset - 4..offset + 12].copy_from_slice(&INSN);
                    let value = s
                        .wrapping_sub(layout.tls_end)
                        .wrapping_add(a)
                        .wrapping_add(4);
                    out[offset + 8..offset + 12].copy_from_slice(&(value as u32).to_le_bytes());
                }
                // The following PLT32 relocation was part of the rewritten
                // sequence.
                i += 1;
            }
            RelType::TlsLd => {
                let tlsld = layout.tlsld_got_idx.unwrap_or(0);
                let value = layout
                    .got_entry_addr(tlsld)
                    .wrapping_add(a)
                    .wrapping_sub(place);
                checked_write(out, r_type, offset, value, ctx, &describe);
            }
            RelType::TlsLdRelaxLe => {
                // mov %fs:0,%rax with a prefix pad to cover the call.
                const INSN: [u8; 12] = [
                    0x66, 0x66, 0x66, 0x64, 0x48, 0x8b, 0x04, 0x25, 0, 0, 0, 0,
                ];
                if offset < 3 || offset + 9 > out.len() {
                    let (section, _) = describe();
                    ctx.diagnostics.report(anyhow!(
                        "{section}: TLSLD relaxation site is out of bounds"
                    ));
                } else {
                    out[offset - 3..offset + 9].copy_from_slice(&INSN);
                }
                i += 1;
            }
            RelType::DtpOff => {
                let value = s.wrapping_add(a).wrapping_sub(layout.tls_begin);
                checked_write(out, r_type, offset, value, ctx, &describe);
            }
            RelType::TpOff => {
                let value = s.wrapping_add(a).wrapping_sub(layout.tls_end);
                checked_write(out, r_type, offset, value, ctx, &describe);
            }
            RelType::GotTpOff => {
                let value = layout
                    .got_entry_addr(target.aux.gottpoff_idx)
                    .wrapping_add(a)
                    .wrapping_sub(place);
                checked_write(out, r_type, offset, value, ctx, &describe);
            }
        }
        i += 1;
    }
}

/// Non-allocated sections (mostly debug info) never reach memory at run
/// time, so they can't use the GOT, the PLT or PC-relative addressing; only
/// absolute forms and DTPOFF64 make sense.
fn apply_nonalloc<'data>(
    job: &Job<'_, 'data>,
    out: &mut [u8],
    files: &[ObjectFile<'data>],
    ctx: &Context<'data>,
    layout: &Layout,
) {
    let file = job.file;
    let section = job.section;
    let mut ref_index = 0usize;
    for (i, rel) in section.rels.iter().enumerate() {
        let target = resolve_target(file, rel.r_sym(), ctx);
        if target.def.file.is_none() || target.def.is_placeholder {
            ctx.diagnostics.report(anyhow!(
                "undefined symbol: {}: {}",
                file,
                file.display_symbol_name(rel.r_sym(), &ctx.symbols)
            ));
            continue;
        }
        let fragment_ref = if section.has_fragments.get(i).copied().unwrap_or(false) {
            let r = section.rel_fragments[ref_index];
            ref_index += 1;
            Some(r)
        } else {
            None
        };
        let offset = rel.offset as usize;
        let r_type = rel.r_type();
        let describe = || {
            (
                file.display_section(section.name).to_string(),
                file.display_symbol_name(rel.r_sym(), &ctx.symbols),
            )
        };
        match r_type {
            object::elf::R_X86_64_NONE => {}
            object::elf::R_X86_64_8
            | object::elf::R_X86_64_16
            | object::elf::R_X86_64_32
            | object::elf::R_X86_64_32S
            | object::elf::R_X86_64_64 => {
                let value = match fragment_ref {
                    Some(fr) => ctx.fragments.get(fr.frag).address,
                    None => layout.symbol_address(files, ctx, &target.def, &target.aux),
                };
                checked_write(out, r_type, offset, value, ctx, &describe);
            }
            object::elf::R_X86_64_DTPOFF64 => {
                let value = layout
                    .symbol_address(files, ctx, &target.def, &target.aux)
                    .wrapping_add(rel.addend as u64)
                    .wrapping_sub(layout.tls_begin);
                checked_write(out, r_type, offset, value, ctx, &describe);
            }
            object::elf::R_X86_64_PC8
            | object::elf::R_X86_64_PC16
            | object::elf::R_X86_64_PC32
            | object::elf::R_X86_64_PC64
            | object::elf::R_X86_64_GOT32
            | object::elf::R_X86_64_GOTPC32
            | object::elf::R_X86_64_GOTPCREL
            | object::elf::R_X86_64_GOTPCRELX
            | object::elf::R_X86_64_REX_GOTPCRELX
            | object::elf::R_X86_64_PLT32
            | object::elf::R_X86_64_TLSGD
            | object::elf::R_X86_64_TLSLD
            | object::elf::R_X86_64_DTPOFF32
            | object::elf::R_X86_64_TPOFF32
            | object::elf::R_X86_64_TPOFF64
            | object::elf::R_X86_64_GOTTPOFF => {
                ctx.diagnostics.report(anyhow!(
                    "{}: invalid relocation for non-allocated sections: {}",
                    file.display_section(section.name),
                    rel_type_to_string(r_type)
                ));
            }
            _ => {
                ctx.diagnostics.report(anyhow!(
                    "{}: unknown relocation: {r_type}",
                    file.display_section(section.name)
                ));
            }
        }
    }
}
