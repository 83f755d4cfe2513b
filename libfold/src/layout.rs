//! Assigns addresses. Output sections are laid out in registration order
//! from the base address; live input sections are placed within them in
//! (file priority, section index) order, which is also the order they were
//! visited in, so the pass is a single sweep. GOT and PLT slots, dynamic
//! symbol indices and copy-relocation space are allocated here from the
//! request flags the scanner produced.

use crate::context::Context;
use crate::elf::RELA_ENTRY_SIZE;
use crate::error::Result;
use crate::fragment::FragmentId;
use crate::output_section;
use crate::output_section::OutputSectionId;
use crate::parsing::section_by_ref;
use crate::parsing::ObjectFile;
use crate::section::SectionRef;
use crate::symbol::SymbolAux;
use crate::symbol::SymbolDef;
use crate::symbol::SymbolId;
use crate::symbol::SymFlags;

pub(crate) struct Layout {
    pub(crate) mem_addresses: Vec<u64>,
    pub(crate) file_offsets: Vec<u64>,
    pub(crate) sizes: Vec<u64>,
    pub(crate) image_size: usize,
    pub(crate) got_addr: u64,
    pub(crate) plt_addr: u64,
    pub(crate) tls_begin: u64,
    pub(crate) tls_end: u64,
    /// GOT slot pair holding the module id for local-dynamic TLS, shared by
    /// every TLSLD use.
    pub(crate) tlsld_got_idx: Option<u32>,
    pub(crate) num_got: u32,
    pub(crate) num_plt: u32,
    pub(crate) num_dynrel: u32,
}

pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    value.next_multiple_of(alignment.max(1))
}

#[tracing::instrument(skip_all, name = "Layout")]
pub(crate) fn compute<'data>(
    files: &mut [ObjectFile<'data>],
    ctx: &mut Context<'data>,
) -> Result<Layout> {
    let num_out = ctx.output_sections.len();
    let mut sizes = vec![0u64; num_out];
    let mut max_align = vec![1u64; num_out];

    // Place live input sections within their output sections.
    for file in files.iter_mut() {
        if !file.is_alive() {
            continue;
        }
        for slot in file.sections.iter_mut() {
            let Some(section) = slot else { continue };
            if !section.is_emitted() || section.output_section == OutputSectionId::placeholder() {
                continue;
            }
            let out = section.output_section.as_usize();
            let alignment = section.shdr.alignment.max(1);
            max_align[out] = max_align[out].max(alignment);
            let offset = align_up(sizes[out], alignment);
            section.output_offset = offset;
            sizes[out] = offset + section.shdr.size;
        }
    }

    // Unique fragments are appended to .rodata. Insertion order into the
    // shared table depends on thread scheduling, so sort by content to keep
    // addresses reproducible.
    let mut frag_ids: Vec<FragmentId> = ctx.fragments.ids().collect();
    frag_ids.sort_by(|&a, &b| {
        let fa = ctx.fragments.get(a);
        let fb = ctx.fragments.get(b);
        fa.data.cmp(fb.data).then(fa.alignment.cmp(&fb.alignment))
    });
    let mut frag_offsets = Vec::with_capacity(frag_ids.len());
    {
        let out = output_section::RODATA.as_usize();
        for id in frag_ids {
            let frag = ctx.fragments.get(id);
            let alignment = u64::from(frag.alignment.max(1));
            max_align[out] = max_align[out].max(alignment);
            let offset = align_up(sizes[out], alignment);
            frag_offsets.push((id, offset));
            sizes[out] = offset + frag.data.len() as u64;
        }
    }

    // Auxiliary entries, visited in file priority order so that slot
    // numbering is deterministic. Sentinels make repeat visits idempotent.
    let mut slots = SlotAllocator::default();
    let mut copyrel: Vec<(SymbolId, u64)> = Vec::new();
    for file in files.iter_mut() {
        if !file.is_alive() {
            continue;
        }
        for i in file.first_global..file.symtab.len() {
            let Some(id) = file.global_ids[i] else {
                continue;
            };
            let flags = ctx.symbols.cell(id).requested();
            if flags.is_empty() {
                continue;
            }
            if flags.contains(SymFlags::NEEDS_COPYREL) {
                let cell = ctx.symbols.cell_mut(id);
                if cell.aux.copyrel_addr == 0 {
                    cell.aux.copyrel_addr = u64::MAX;
                    let size = cell.def().size.max(1);
                    copyrel.push((id, size));
                }
            }
            slots.allocate(flags, &mut ctx.symbols.cell_mut(id).aux);
        }
        for i in 0..file.local_flags.len() {
            let flags = file.local_flags[i];
            if flags.is_empty() {
                continue;
            }
            slots.allocate(flags, &mut file.local_aux[i]);
        }
    }

    // Copy-relocated symbols get space at the end of .bss.
    let mut copyrel_offsets = Vec::with_capacity(copyrel.len());
    for (id, size) in copyrel {
        let offset = align_up(sizes[output_section::BSS.as_usize()], 8);
        copyrel_offsets.push((id, offset));
        sizes[output_section::BSS.as_usize()] = offset + size;
    }

    sizes[output_section::GOT.as_usize()] = u64::from(slots.next_got) * crate::elf::GOT_ENTRY_SIZE;
    sizes[output_section::PLT.as_usize()] = u64::from(slots.next_plt) * crate::elf::PLT_ENTRY_SIZE;

    // Each file's dynamic relocations occupy a contiguous slice of the
    // output table, at the offset precomputed here.
    let mut num_dynrel = 0u32;
    for file in files.iter_mut() {
        file.reldyn_offset = num_dynrel * RELA_ENTRY_SIZE as u32;
        num_dynrel += file.num_dynrel;
    }
    sizes[output_section::RELA_DYN.as_usize()] = u64::from(num_dynrel) * RELA_ENTRY_SIZE;

    // Output section addresses and file offsets. Only allocated sections get
    // memory addresses; everything still gets a place in the image.
    let mut mem_addresses = vec![0u64; num_out];
    let mut file_offsets = vec![0u64; num_out];
    let mut mem = ctx.args.base_address();
    let mut file_offset = 0u64;
    for id in ctx.output_sections.ids() {
        let idx = id.as_usize();
        let info = ctx.output_sections.info(id);
        let alignment = max_align[idx];
        file_offset = align_up(file_offset, alignment);
        file_offsets[idx] = file_offset;
        if info.sh_flags & u64::from(object::elf::SHF_ALLOC) != 0 {
            mem = align_up(mem, alignment);
            mem_addresses[idx] = mem;
            mem += sizes[idx];
        }
        if info.sh_type != object::elf::SHT_NOBITS {
            file_offset += sizes[idx];
        }
    }
    let image_size = file_offset as usize;

    for id in ctx.output_sections.ids() {
        if sizes[id.as_usize()] > 0 {
            tracing::debug!(
                section = %String::from_utf8_lossy(ctx.output_sections.name(id)),
                size = sizes[id.as_usize()],
                address = mem_addresses[id.as_usize()],
                "output section"
            );
        }
    }

    let tdata = output_section::TDATA.as_usize();
    let tbss = output_section::TBSS.as_usize();
    let tls_begin = if sizes[tdata] > 0 {
        mem_addresses[tdata]
    } else if sizes[tbss] > 0 {
        mem_addresses[tbss]
    } else {
        0
    };
    // Padding keeps the thread pointer usize-aligned, so the TLS block's end
    // rounds up.
    let tls_end = if sizes[tdata] > 0 || sizes[tbss] > 0 {
        let raw_end = if sizes[tbss] > 0 {
            mem_addresses[tbss] + sizes[tbss]
        } else {
            mem_addresses[tdata] + sizes[tdata]
        };
        align_up(raw_end, 8)
    } else {
        0
    };

    for (id, offset) in frag_offsets {
        ctx.fragments.get_mut(id).address =
            mem_addresses[output_section::RODATA.as_usize()] + offset;
    }
    for (id, offset) in copyrel_offsets {
        ctx.symbols.cell_mut(id).aux.copyrel_addr =
            mem_addresses[output_section::BSS.as_usize()] + offset;
    }

    Ok(Layout {
        got_addr: mem_addresses[output_section::GOT.as_usize()],
        plt_addr: mem_addresses[output_section::PLT.as_usize()],
        mem_addresses,
        file_offsets,
        sizes,
        image_size,
        tls_begin,
        tls_end,
        tlsld_got_idx: slots.tlsld_got_idx,
        num_got: slots.next_got,
        num_plt: slots.next_plt,
        num_dynrel,
    })
}

#[derive(Default)]
struct SlotAllocator {
    next_got: u32,
    next_plt: u32,
    next_dynsym: u32,
    tlsld_got_idx: Option<u32>,
}

impl SlotAllocator {
    fn allocate(&mut self, flags: SymFlags, aux: &mut SymbolAux) {
        if flags.contains(SymFlags::NEEDS_TLSLD) && self.tlsld_got_idx.is_none() {
            // A module-id/offset pair shared by all local-dynamic accesses.
            self.tlsld_got_idx = Some(self.next_got);
            self.next_got += 2;
        }
        if flags.contains(SymFlags::NEEDS_GOT) && aux.got_idx == u32::MAX {
            aux.got_idx = self.next_got;
            self.next_got += 1;
        }
        if flags.contains(SymFlags::NEEDS_TLSGD) && aux.tlsgd_idx == u32::MAX {
            aux.tlsgd_idx = self.next_got;
            self.next_got += 2;
        }
        if flags.contains(SymFlags::NEEDS_GOTTPOFF) && aux.gottpoff_idx == u32::MAX {
            aux.gottpoff_idx = self.next_got;
            self.next_got += 1;
        }
        if flags.contains(SymFlags::NEEDS_PLT) && aux.plt_idx == u32::MAX {
            aux.plt_idx = self.next_plt;
            self.next_plt += 1;
        }
        if flags.contains(SymFlags::NEEDS_DYNSYM) && aux.dynsym_idx == u32::MAX {
            // Index 0 is the reserved null dynamic symbol.
            self.next_dynsym += 1;
            aux.dynsym_idx = self.next_dynsym;
        }
    }
}

impl Layout {
    /// The output address of a section, following fold leaders.
    pub(crate) fn section_address(&self, files: &[ObjectFile], r: SectionRef) -> u64 {
        let mut section = section_by_ref(files, r).expect("dangling section reference");
        while let Some(leader) = section.leader() {
            section = section_by_ref(files, leader).expect("dangling fold leader");
        }
        self.mem_addresses[section.output_section.as_usize()] + section.output_offset
    }

    /// A symbol's final address: zero for unresolved weak references,
    /// otherwise the copy-relocation copy, the owning fragment, the defining
    /// section, or the absolute value, in that order.
    pub(crate) fn symbol_address(
        &self,
        files: &[ObjectFile],
        ctx: &Context,
        def: &SymbolDef,
        aux: &SymbolAux,
    ) -> u64 {
        if def.is_undef_weak {
            return 0;
        }
        if aux.copyrel_addr != 0 {
            return aux.copyrel_addr;
        }
        if let Some((frag, offset)) = def.fragment {
            return ctx.fragments.get(frag).address + offset;
        }
        if let Some(section_ref) = def.section {
            return self.section_address(files, section_ref) + def.value;
        }
        def.value
    }

    pub(crate) fn got_entry_addr(&self, index: u32) -> u64 {
        self.got_addr + u64::from(index) * crate::elf::GOT_ENTRY_SIZE
    }

    pub(crate) fn plt_entry_addr(&self, index: u32) -> u64 {
        self.plt_addr + u64::from(index) * crate::elf::PLT_ENTRY_SIZE
    }
}
