//! Relocation scanning. Before anything can be laid out we need to know
//! which relocations require GOT slots, PLT stubs, copy relocations or
//! dynamic relocations. Each relocation is classified into an abstract
//! action once, here; the applier later dispatches on that classification
//! without revisiting any policy.

use crate::context::Context;
use crate::elf::rel_type_to_string;
use crate::elf::RelType;
use crate::elf::SymtabEntry;
use crate::elf::RELA_ENTRY_SIZE;
use crate::error::Result;
use crate::input_data::FileId;
use crate::input_data::InputRef;
use crate::parsing::ObjectFile;
use crate::section::InputSection;
use crate::section::SectionRef;
use crate::symbol::SymFlags;
use crate::symbol::SymbolCell;
use crate::symbol::SymbolDef;
use crate::symbol::SymbolId;
use rayon::iter::IntoParallelRefMutIterator;
use rayon::iter::ParallelIterator;

#[tracing::instrument(skip_all, name = "Scan relocations")]
pub(crate) fn scan_relocations<'data>(
    files: &mut [ObjectFile<'data>],
    ctx: &Context<'data>,
) -> Result {
    files
        .par_iter_mut()
        .filter(|file| file.is_alive() && !file.is_dso)
        .for_each(|file| scan_file(file, ctx));
    Ok(())
}

fn scan_file<'data>(file: &mut ObjectFile<'data>, ctx: &Context<'data>) {
    let input = file.input;
    let file_id = file.file_id;
    let symtab = file.symtab;
    let strtab = file.strtab;
    let global_ids: &[Option<SymbolId>] = &file.global_ids;
    let local_flags: &mut [SymFlags] = &mut file.local_flags;
    let num_dynrel: &mut u32 = &mut file.num_dynrel;
    for slot in file.sections.iter_mut() {
        let Some(section) = slot else { continue };
        if !section.is_alive() || !section.is_allocated() || section.is_merge {
            continue;
        }
        scan_section(
            section,
            ScanFile {
                input,
                file_id,
                symtab,
                strtab,
                global_ids,
            },
            local_flags,
            num_dynrel,
            ctx,
        );
    }
}

/// The per-file context a section scan needs, split out so that the borrow
/// of the section can coexist with it.
struct ScanFile<'a, 'data> {
    input: InputRef<'data>,
    file_id: FileId,
    symtab: &'data [SymtabEntry],
    strtab: &'data [u8],
    global_ids: &'a [Option<SymbolId>],
}

impl<'a, 'data> ScanFile<'a, 'data> {
    /// A uniform view of a relocation's target symbol: the resolved global
    /// definition, or a definition synthesised from the local symbol entry.
    fn resolve(
        &self,
        sym_index: usize,
        ctx: &'a Context<'data>,
    ) -> Option<(SymbolDef, Option<&'a SymbolCell<'data>>)> {
        if let Some(Some(id)) = self.global_ids.get(sym_index) {
            let cell = ctx.symbols.cell(*id);
            return Some((cell.def(), Some(cell)));
        }
        let esym = self.symtab.get(sym_index)?;
        Some((
            SymbolDef {
                file: Some(self.file_id),
                section: esym
                    .section_index()
                    .map(|index| SectionRef::new(self.file_id, index)),
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
            None,
        ))
    }

    fn symbol_name(&self, sym_index: usize, ctx: &Context<'data>) -> String {
        if let Some(Some(id)) = self.global_ids.get(sym_index) {
            return String::from_utf8_lossy(ctx.symbols.name(*id)).into_owned();
        }
        self.symtab
            .get(sym_index)
            .and_then(|esym| crate::elf::strtab_get(self.strtab, esym.name as usize).ok())
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .unwrap_or_else(|| String::from("<local>"))
    }
}

fn scan_section<'data>(
    section: &mut InputSection<'data>,
    file: ScanFile<'_, 'data>,
    local_flags: &mut [SymFlags],
    num_dynrel: &mut u32,
    ctx: &Context<'data>,
) {
    section.reldyn_offset = *num_dynrel * RELA_ENTRY_SIZE as u32;
    section.rel_types = vec![RelType::None; section.rels.len()];
    let is_readonly = !section.shdr.has_flag(object::elf::SHF_WRITE);
    let pie = ctx.args.pie;
    let relax = ctx.args.relax;

    let mut request = |sym_index: usize, cell: Option<&SymbolCell<'data>>, flags: SymFlags| {
        match cell {
            Some(cell) => cell.request(flags),
            None => local_flags[sym_index] |= flags,
        }
    };

    let mut i = 0;
    while i < section.rels.len() {
        let rel = &section.rels[i];
        let r_type = rel.r_type();
        let sym_index = rel.r_sym();
        let Some((def, cell)) = file.resolve(sym_index, ctx) else {
            ctx.diagnostics.report(anyhow::anyhow!(
                "{}: invalid symbol index in relocation",
                file.input
            ));
            i += 1;
            continue;
        };

        if def.file.is_none() || def.is_placeholder {
            ctx.diagnostics.report(anyhow::anyhow!(
                "undefined symbol: {}: {}",
                file.input,
                file.symbol_name(sym_index, ctx)
            ));
            i += 1;
            continue;
        }

        let is_imported = def.is_imported();
        let is_code = def.sym_type == object::elf::STT_FUNC;
        let is_ifunc = def.sym_type == object::elf::STT_GNU_IFUNC;

        let report_pie_error = |ctx: &Context| {
            ctx.diagnostics.report(anyhow::anyhow!(
                "{}: {} relocation against symbol `{}' can not be used; recompile with -fPIE",
                file.input.to_string(),
                rel_type_to_string(r_type),
                file.symbol_name(sym_index, ctx)
            ));
        };

        match r_type {
            object::elf::R_X86_64_NONE => {
                section.rel_types[i] = RelType::None;
            }
            object::elf::R_X86_64_8
            | object::elf::R_X86_64_16
            | object::elf::R_X86_64_32
            | object::elf::R_X86_64_32S => {
                if pie && def.is_relative() {
                    report_pie_error(ctx);
                }
                if is_imported {
                    request(
                        sym_index,
                        cell,
                        if is_code {
                            SymFlags::NEEDS_PLT
                        } else {
                            SymFlags::NEEDS_COPYREL
                        },
                    );
                }
                section.rel_types[i] = RelType::Abs;
            }
            object::elf::R_X86_64_64 => {
                if pie {
                    if is_imported {
                        if is_readonly {
                            report_pie_error(ctx);
                        }
                        request(sym_index, cell, SymFlags::NEEDS_DYNSYM);
                        section.rel_types[i] = RelType::Dyn;
                        *num_dynrel += 1;
                    } else if def.is_relative() {
                        if is_readonly {
                            report_pie_error(ctx);
                        }
                        section.rel_types[i] = RelType::AbsDyn;
                        *num_dynrel += 1;
                    } else {
                        section.rel_types[i] = RelType::Abs;
                    }
                } else {
                    if is_imported {
                        request(
                            sym_index,
                            cell,
                            if is_code {
                                SymFlags::NEEDS_PLT
                            } else {
                                SymFlags::NEEDS_COPYREL
                            },
                        );
                    }
                    section.rel_types[i] = RelType::Abs;
                }
            }
            object::elf::R_X86_64_PC8
            | object::elf::R_X86_64_PC16
            | object::elf::R_X86_64_PC32
            | object::elf::R_X86_64_PC64 => {
                if is_imported {
                    request(
                        sym_index,
                        cell,
                        if is_code {
                            SymFlags::NEEDS_PLT
                        } else {
                            SymFlags::NEEDS_COPYREL
                        },
                    );
                }
                section.rel_types[i] = RelType::Pc;
            }
            object::elf::R_X86_64_GOT32 => {
                request(sym_index, cell, SymFlags::NEEDS_GOT);
                section.rel_types[i] = RelType::Got;
            }
            object::elf::R_X86_64_GOTPC32 => {
                request(sym_index, cell, SymFlags::NEEDS_GOT);
                section.rel_types[i] = RelType::GotPc;
            }
            object::elf::R_X86_64_GOTPCREL
            | object::elf::R_X86_64_GOTPCRELX
            | object::elf::R_X86_64_REX_GOTPCRELX => {
                request(sym_index, cell, SymFlags::NEEDS_GOT);
                section.rel_types[i] = RelType::GotPcRel;
            }
            object::elf::R_X86_64_PLT32 => {
                if is_imported || is_ifunc {
                    request(sym_index, cell, SymFlags::NEEDS_PLT);
                }
                section.rel_types[i] = RelType::Pc;
            }
            object::elf::R_X86_64_TLSGD => {
                if !next_is_plt32(section, i) {
                    ctx.diagnostics.report(anyhow::anyhow!(
                        "{}: TLSGD reloc not followed by PLT32",
                        file.input
                    ));
                }
                if relax && !is_imported {
                    section.rel_types[i] = RelType::TlsGdRelaxLe;
                    i += 1;
                } else {
                    request(sym_index, cell, SymFlags::NEEDS_TLSGD | SymFlags::NEEDS_DYNSYM);
                    section.rel_types[i] = RelType::TlsGd;
                }
            }
            object::elf::R_X86_64_TLSLD => {
                if !next_is_plt32(section, i) {
                    ctx.diagnostics.report(anyhow::anyhow!(
                        "{}: TLSLD reloc not followed by PLT32",
                        file.input
                    ));
                }
                if is_imported {
                    ctx.diagnostics.report(anyhow::anyhow!(
                        "{}: TLSLD reloc refers external symbol {}",
                        file.input,
                        file.symbol_name(sym_index, ctx)
                    ));
                }
                if relax {
                    section.rel_types[i] = RelType::TlsLdRelaxLe;
                    i += 1;
                } else {
                    request(sym_index, cell, SymFlags::NEEDS_TLSLD);
                    section.rel_types[i] = RelType::TlsLd;
                }
            }
            object::elf::R_X86_64_DTPOFF32 | object::elf::R_X86_64_DTPOFF64 => {
                if is_imported {
                    ctx.diagnostics.report(anyhow::anyhow!(
                        "{}: DTPOFF reloc refers external symbol {}",
                        file.input,
                        file.symbol_name(sym_index, ctx)
                    ));
                }
                section.rel_types[i] = if relax {
                    RelType::TpOff
                } else {
                    RelType::DtpOff
                };
            }
            object::elf::R_X86_64_TPOFF32 | object::elf::R_X86_64_TPOFF64 => {
                section.rel_types[i] = RelType::TpOff;
            }
            object::elf::R_X86_64_GOTTPOFF => {
                request(sym_index, cell, SymFlags::NEEDS_GOTTPOFF);
                section.rel_types[i] = RelType::GotTpOff;
            }
            _ => {
                ctx.diagnostics.report(anyhow::anyhow!(
                    "{}: unknown relocation: {r_type}",
                    file.input
                ));
            }
        }
        i += 1;
    }
}

fn next_is_plt32(section: &InputSection, i: usize) -> bool {
    section
        .rels
        .get(i + 1)
        .is_some_and(|rel| rel.r_type() == object::elf::R_X86_64_PLT32)
}

#[cfg(test)]
mod tests {
    use crate::elf::RelType;
    use crate::symbol::SymFlags;
    use crate::test_elf::with_link;
    use crate::test_elf::ElfBuilder;
    use crate::test_elf::ALLOC;
    use crate::test_elf::EXEC;

    fn no_config(_: &mut crate::args::Args) {}

    #[test]
    fn classification_and_flag_requests() {
        let mut b = ElfBuilder::new();
        let data = b.add_section(
            ".data",
            object::elf::SHT_PROGBITS,
            (object::elf::SHF_ALLOC | object::elf::SHF_WRITE) as u64,
            &[0u8; 16],
        );
        let text = b.add_section(".text", object::elf::SHT_PROGBITS, EXEC, &[0u8; 32]);
        let var = b.global("var", data, 0);
        let helper = b.func("helper", text, 0);
        b.add_rela(text, 0, object::elf::R_X86_64_GOT32, var, 0);
        b.add_rela(text, 4, object::elf::R_X86_64_GOTPCREL, var, -4);
        b.add_rela(text, 8, object::elf::R_X86_64_PLT32, helper, -4);
        b.add_rela(text, 12, object::elf::R_X86_64_PC32, var, -4);
        b.add_rela(text, 16, object::elf::R_X86_64_64, var, 0);

        with_link(&[("a.o", b.build())], no_config, |outcome| {
            let section = outcome.files[0].input_section(text as usize).unwrap();
            assert_eq!(
                section.rel_types,
                [
                    RelType::Got,
                    RelType::GotPcRel,
                    RelType::Pc,
                    RelType::Pc,
                    RelType::Abs,
                ]
            );

            let var = outcome.ctx.symbols.lookup(b"var").unwrap();
            assert_eq!(
                outcome.ctx.symbols.cell(var).requested(),
                SymFlags::NEEDS_GOT
            );
            // A direct call to a defined local function needs no PLT.
            let helper = outcome.ctx.symbols.lookup(b"helper").unwrap();
            assert!(outcome.ctx.symbols.cell(helper).requested().is_empty());

            // One GOT slot was allocated and the relocation wrote its
            // GOT-base-relative offset.
            assert_eq!(outcome.layout.num_got, 1);
        })
        .unwrap();
    }

    /// Every dynamic-relocation classification bumps the per-file counter,
    /// and the applier emits exactly that many entries.
    #[test]
    fn dynamic_relocation_counting_under_pie() {
        let make = |name: &str| {
            let mut b = ElfBuilder::new();
            let data = b.add_section(
                ".data",
                object::elf::SHT_PROGBITS,
                (object::elf::SHF_ALLOC | object::elf::SHF_WRITE) as u64,
                &[0u8; 24],
            );
            let var = b.global(name, data, 0);
            b.add_rela(data, 0, object::elf::R_X86_64_64, var, 0);
            b.add_rela(data, 8, object::elf::R_X86_64_64, var, 4);
            b
        };
        with_link(
            &[("a.o", make("var_a").build()), ("b.o", make("var_b").build())],
            |args| args.pie = true,
            |outcome| {
                let counted: u32 = outcome.files.iter().map(|f| f.num_dynrel).sum();
                assert_eq!(counted, 4);
                assert_eq!(outcome.layout.num_dynrel, 4);
                assert_eq!(outcome.image.dynrels.len(), 4);
                for rela in &outcome.image.dynrels {
                    assert_eq!(rela.r_type(), object::elf::R_X86_64_RELATIVE);
                }
                let section = outcome.files[0].input_section(1).unwrap();
                assert_eq!(section.rel_types, [RelType::AbsDyn, RelType::AbsDyn]);

                // The RELATIVE entry's addend is the resolved value, and its
                // offset is the patched location.
                let var_a = crate::test_elf::global_symbol_address(outcome, "var_a").unwrap();
                let first = &outcome.image.dynrels[0];
                assert_eq!(first.addend, var_a as i64);
            },
        )
        .unwrap();
    }

    #[test]
    fn tlsgd_without_plt32_is_an_error() {
        let mut b = ElfBuilder::new();
        let tdata = b.add_section(
            ".tdata",
            object::elf::SHT_PROGBITS,
            (object::elf::SHF_ALLOC | object::elf::SHF_WRITE | object::elf::SHF_TLS) as u64,
            &[0u8; 8],
        );
        let text = b.add_section(".text", object::elf::SHT_PROGBITS, EXEC, &[0u8; 16]);
        let x = b.tls("x", tdata, 0);
        b.add_rela(text, 4, object::elf::R_X86_64_TLSGD, x, -4);

        let error = with_link(&[("a.o", b.build())], no_config, |_| ()).unwrap_err();
        assert!(error.to_string().contains("TLSGD reloc not followed by PLT32"));
    }

    #[test]
    fn pie_rejects_absolute_relocations_to_relative_symbols() {
        let mut b = ElfBuilder::new();
        let rodata = b.add_section(".rodata", object::elf::SHT_PROGBITS, ALLOC, &[0u8; 8]);
        let text = b.add_section(".text", object::elf::SHT_PROGBITS, EXEC, &[0u8; 8]);
        let var = b.global("var", rodata, 0);
        b.add_rela(text, 0, object::elf::R_X86_64_32, var, 0);

        let error = with_link(&[("a.o", b.build())], |args| args.pie = true, |_| ())
            .unwrap_err();
        let message = error.to_string();
        assert!(message.contains("recompile with -fPIE"), "{message}");
        assert!(message.contains("var"), "{message}");
    }

    #[test]
    fn undefined_strong_reference_is_reported_once() {
        let mut b = ElfBuilder::new();
        let text = b.add_section(".text", object::elf::SHT_PROGBITS, EXEC, &[0u8; 8]);
        let missing = b.undef("missing_symbol");
        b.add_rela(text, 0, object::elf::R_X86_64_PC32, missing, -4);

        let error = with_link(&[("a.o", b.build())], no_config, |_| ()).unwrap_err();
        let message = error.to_string();
        assert!(message.contains("undefined symbol"), "{message}");
        assert!(message.contains("missing_symbol"), "{message}");
        assert!(message.contains("1 error"), "{message}");
    }
}
