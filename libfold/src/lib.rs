//! fold, a parallel ELF linker core for x86-64.
//!
//! The pipeline is strict: parse -> resolve -> fold -> scan -> layout ->
//! apply. Phases are separated by barriers; inside a phase, work is
//! data-parallel over files and sections, and every tie-break reduces to
//! file priority so the output never depends on thread scheduling.

use anyhow::Context as _;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub(crate) mod apply;
pub mod args;
pub(crate) mod archive;
pub(crate) mod context;
pub(crate) mod eh_frame;
pub(crate) mod elf;
pub mod error;
pub(crate) mod file_kind;
pub(crate) mod fragment;
pub(crate) mod icf;
pub(crate) mod input_data;
pub(crate) mod layout;
pub(crate) mod output_section;
pub(crate) mod parsing;
pub(crate) mod resolve;
pub(crate) mod scan;
pub(crate) mod section;
pub(crate) mod symbol;
#[cfg(test)]
pub(crate) mod test_elf;

pub fn run(args: &args::Args) -> error::Result {
    if args.time_phases {
        fmt()
            .with_span_events(fmt::format::FmtSpan::CLOSE)
            .with_target(false)
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(EnvFilter::from_default_env())
            .try_init()
            .ok();
    }
    args.setup_thread_pool()?;

    let input_data = input_data::InputData::from_args(args)?;
    let outcome = link(args, &input_data)?;
    tracing::debug!(
        files = outcome.files.len(),
        symbols = outcome.ctx.symbols.num_symbols(),
        got_entries = outcome.layout.num_got,
        image_size = outcome.image.buf.len(),
        "link complete"
    );
    std::fs::write(&args.output, &outcome.image.buf)
        .with_context(|| format!("Failed to write `{}`", args.output.display()))?;
    Ok(())
}

pub(crate) struct LinkOutcome<'data> {
    pub(crate) files: Vec<parsing::ObjectFile<'data>>,
    pub(crate) ctx: context::Context<'data>,
    pub(crate) layout: layout::Layout,
    pub(crate) image: apply::OutputImage,
}

#[tracing::instrument(skip_all, name = "Link")]
pub(crate) fn link<'data>(
    args: &'data args::Args,
    input_data: &'data input_data::InputData,
) -> error::Result<LinkOutcome<'data>> {
    let inputs = input_data::split_archives(input_data)?;

    let diagnostics = error::Diagnostics::new();
    let interner = symbol::SymbolInterner::new();
    let fragment_table = fragment::FragmentTable::new();
    let mut files = parsing::parse_input_files(&inputs, &interner, &fragment_table, &diagnostics)?;
    diagnostics.check_phase()?;

    let output_sections = output_section::assign_output_sections(&mut files);
    let comdats = resolve::collect_comdat_groups(&mut files);
    let mut symbols = symbol::SymbolTable::build(interner);
    symbols.mark_traced(&args.trace_symbols);
    let mut ctx = context::Context {
        args,
        symbols,
        fragments: fragment_table.finish(),
        comdats,
        output_sections,
        diagnostics,
    };

    tracing::debug!(
        num_symbols = ctx.symbols.num_symbols(),
        num_fragments = ctx.fragments.len(),
        "tables built"
    );

    resolve::resolve_symbols(&mut files, &ctx)?;
    ctx.diagnostics.check_phase()?;

    if args.icf {
        icf::fold_identical_sections(&files, &ctx)?;
    }

    scan::scan_relocations(&mut files, &ctx)?;
    ctx.diagnostics.check_phase()?;

    let layout = layout::compute(&mut files, &mut ctx)?;
    let image = apply::copy_and_apply(&files, &ctx, &layout)?;
    ctx.diagnostics.check_phase()?;

    Ok(LinkOutcome {
        files,
        ctx,
        layout,
        image,
    })
}

#[cfg(test)]
mod tests {
    use crate::test_elf::with_link;
    use crate::test_elf::ElfBuilder;
    use crate::test_elf::EXEC;

    /// The produced image must not depend on worker interleaving. Exercise a
    /// mix of folding, string merging and common symbols, then link the same
    /// inputs twice and require identical bytes.
    #[test]
    fn output_is_deterministic() {
        let make_inputs = || {
            let mut a = ElfBuilder::new();
            let body: &[u8] = &[0x55, 0x48, 0x89, 0xe5, 0x5d, 0xc3];
            let fa = a.add_section(".text.f", object::elf::SHT_PROGBITS, EXEC, body);
            a.add_section_full(
                ".rodata.str1.1",
                object::elf::SHT_PROGBITS,
                (object::elf::SHF_ALLOC | object::elf::SHF_MERGE | object::elf::SHF_STRINGS)
                    as u64,
                b"one\0two\0three\0",
                1,
                1,
            );
            a.func("f", fa, 0);
            a.common("buffer", 32);

            let mut b = ElfBuilder::new();
            let gb = b.add_section(".text.g", object::elf::SHT_PROGBITS, EXEC, body);
            b.add_section_full(
                ".rodata.str1.1",
                object::elf::SHT_PROGBITS,
                (object::elf::SHF_ALLOC | object::elf::SHF_MERGE | object::elf::SHF_STRINGS)
                    as u64,
                b"two\0four\0",
                1,
                1,
            );
            b.func("g", gb, 0);
            vec![("a.o", a.build()), ("b.o", b.build())]
        };

        let first = with_link(&make_inputs(), |_| {}, |outcome| {
            (outcome.image.buf.clone(), outcome.image.dynrels.clone())
        })
        .unwrap();
        let second = with_link(&make_inputs(), |_| {}, |outcome| {
            (outcome.image.buf.clone(), outcome.image.dynrels.clone())
        })
        .unwrap();
        assert_eq!(first, second);
    }
}
