//! Splits `.eh_frame` sections into FDE records and attaches each record to
//! the function section it describes (named by the FDE's first relocation).
//! The records only feed ICF's equivalence analysis; `.eh_frame` itself is
//! still copied to the output like any other section.

use crate::diagnostics::ErrorSink;
use crate::elf::RelaExt as _;
use crate::error::error;
use crate::object_file::ObjectFile;
use crate::object_file::SectionSlot;
use crate::symbol::SymbolId;
use crate::symbol_db::SymbolDb;
use rayon::iter::IntoParallelRefMutIterator;
use rayon::iter::ParallelIterator;
use smallvec::SmallVec;

pub(crate) struct FdeRecord<'data> {
    /// The whole record including the length and CIE-offset fields.
    pub(crate) contents: &'data [u8],
    /// The record's relocations, offsets relative to the record start. The
    /// first one points at the function the FDE describes.
    pub(crate) rels: SmallVec<[EhReloc; 2]>,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct EhReloc {
    pub(crate) sym: SymbolId,
    pub(crate) r_type: u32,
    pub(crate) offset: u64,
    pub(crate) addend: i64,
}

pub(crate) fn attach_fdes(files: &mut [ObjectFile], db: &SymbolDb, errors: &ErrorSink) {
    files.par_iter_mut().for_each(|file| {
        if !file.alive() || file.is_dso {
            return;
        }
        let mut collected: Vec<(u32, FdeRecord)> = Vec::new();
        for slot in &file.sections {
            let Some(isec) = slot.as_loaded() else {
                continue;
            };
            if isec.name != b".eh_frame" {
                continue;
            }
            split_records(isec.contents, isec.rels, file, db, errors, &mut collected);
        }
        for (target, fde) in collected {
            if let Some(isec) = file.sections[target as usize].as_loaded_mut() {
                isec.fdes.push(fde);
            }
        }
    });
}

fn split_records<'data>(
    data: &'data [u8],
    rels: &[crate::elf::Rela],
    file: &ObjectFile<'data>,
    db: &SymbolDb,
    errors: &ErrorSink,
    out: &mut Vec<(u32, FdeRecord<'data>)>,
) {
    let mut pos = 0usize;
    // Relocations in .eh_frame come sorted by offset, so one cursor serves
    // all records.
    let mut rel_cursor = 0usize;

    while pos + 8 <= data.len() {
        let length = read_u32(data, pos) as usize;
        if length == 0 {
            break;
        }
        if length == 0xffff_ffff {
            errors.report(error!(
                "{}: 64-bit .eh_frame records are not supported",
                file.display_name()
            ));
            return;
        }
        let record_end = pos + 4 + length;
        if record_end > data.len() {
            errors.report(error!("{}: truncated .eh_frame record", file.display_name()));
            return;
        }

        let cie_offset = read_u32(data, pos + 4);
        if cie_offset != 0 {
            // An FDE. Gather its relocations.
            let mut fde_rels = SmallVec::new();
            while rel_cursor < rels.len() && (rels[rel_cursor].offset() as usize) < record_end {
                let rel = &rels[rel_cursor];
                fde_rels.push(EhReloc {
                    sym: file.symbols[rel.sym() as usize],
                    r_type: rel.rel_type(),
                    offset: rel.offset() - pos as u64,
                    addend: rel.addend(),
                });
                rel_cursor += 1;
            }
            if let Some(target) = fde_target(&fde_rels, file, db) {
                out.push((
                    target,
                    FdeRecord {
                        contents: &data[pos..record_end],
                        rels: fde_rels,
                    },
                ));
            }
        } else {
            // A CIE. Skip it, along with any relocations it holds
            // (personality routine references).
            while rel_cursor < rels.len() && (rels[rel_cursor].offset() as usize) < record_end {
                rel_cursor += 1;
            }
        }

        pos = record_end;
    }
}

/// The section the FDE's first relocation resolves into, if it's a live
/// section of the same file.
fn fde_target(rels: &[EhReloc], file: &ObjectFile, db: &SymbolDb) -> Option<u32> {
    let first = rels.first()?;
    let section = db.symbol(first.sym).input_section?;
    (section.file == file.file_id).then_some(section.index)
}

fn read_u32(data: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap())
}
