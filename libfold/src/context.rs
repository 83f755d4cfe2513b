//! The link context: the shared tables that every phase reads or writes.
//! There is no process-global state; everything is owned here and threaded
//! through the phases explicitly.

use crate::args::Args;
use crate::error::Diagnostics;
use crate::fragment::Fragments;
use crate::output_section::OutputSections;
use crate::resolve::ComdatGroups;
use crate::symbol::SymbolTable;

pub(crate) struct Context<'data> {
    pub(crate) args: &'data Args,
    pub(crate) symbols: SymbolTable<'data>,
    pub(crate) fragments: Fragments<'data>,
    pub(crate) comdats: ComdatGroups,
    pub(crate) output_sections: OutputSections<'data>,
    pub(crate) diagnostics: Diagnostics,
}
