//! A static linker for 64-bit little-endian x86-64 ELF. Takes relocatable
//! objects, shared objects and archives, resolves symbols, optionally folds
//! identical code sections, applies relocations and writes an executable.

pub mod args;
pub mod error;

mod archive;
mod diagnostics;
mod eh_frame;
mod elf;
mod elf_writer;
mod elf_x86_64;
mod hash;
mod icf;
mod input_data;
mod input_section;
mod layout;
mod merge_strings;
mod object_file;
mod output_section;
mod symbol;
mod symbol_db;
#[cfg(test)]
mod test_util;

use crate::args::Args;
use crate::diagnostics::ErrorSink;
use crate::error::Result;
use crate::input_data::InputData;
use crate::layout::LinkContext;
use crate::output_section::OutputSections;
use crate::symbol_db::SymbolDb;

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("WELD_LOG"))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Runs the whole link. Phases are strictly ordered; within a phase, work
/// is distributed over the rayon pool.
pub fn link(args: &Args) -> Result {
    args.setup_thread_pool()?;
    let errors = ErrorSink::new();

    let input_data = InputData::from_args(args)?;
    let inputs = input_data.split_inputs()?;

    let comdat_map = object_file::ComdatMap::new();
    let mut files = {
        let _span = tracing::info_span!("parse").entered();
        object_file::parse_files(&inputs, &comdat_map)?
    };
    let comdat_groups = comdat_map.freeze();

    let mut db = {
        let _span = tracing::info_span!("resolve").entered();
        let mut db = SymbolDb::build(&mut files)?;
        db.resolve_symbols(&files, false);
        object_file::mark_live_archive_members(&files, &db);
        db.resolve_symbols(&files, true);
        db
    };

    {
        let _span = tracing::info_span!("eliminate_comdats").entered();
        object_file::claim_comdat_groups(&files, &comdat_groups);
        object_file::eliminate_duplicate_comdat_groups(&mut files, &comdat_groups)?;
        db.clear_dead_section_refs(&files);
    }

    object_file::convert_common_symbols(&mut files, &mut db);

    let mut merged = {
        let _span = tracing::info_span!("merge_strings").entered();
        merge_strings::merge_sections(&mut files, &mut db, &errors)
    };

    eh_frame::attach_fdes(&mut files, &db, &errors);

    let mut output_sections = OutputSections::new();
    output_section::assign_output_sections(&mut files, &mut merged, &mut output_sections);

    {
        let _span = tracing::info_span!("scan_relocations").entered();
        input_section::scan_all_relocations(&mut files, &db, args, &errors);
    }

    if args.icf {
        icf::icf_sections(&mut files, &mut db, &merged, args);
    }

    let layout = layout::compute(&mut files, &mut db, &mut merged, &mut output_sections)?;

    let ctx = LinkContext {
        args,
        files: &files,
        db: &db,
        merged: &merged,
        output_sections: &output_sections,
        layout: &layout,
    };
    elf_writer::write(&ctx, &errors)?;

    errors.finish()
}
