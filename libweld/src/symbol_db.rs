//! Process-wide symbol storage and resolution. Local symbols get their own
//! records; global names are interned so that every file referring to `foo`
//! shares one record. Resolution is a per-name election over the candidate
//! definitions, run as a data-parallel pass: each symbol's election is
//! independent, so no locks are needed and the outcome is deterministic.

use crate::elf;
use crate::error::Result;
use crate::object_file::ObjectFile;
use crate::object_file::SectionSlot;
use crate::symbol::FileId;
use crate::symbol::SectionId;
use crate::symbol::Symbol;
use crate::symbol::SymbolId;
use object::LittleEndian;
use rayon::iter::IndexedParallelIterator;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::IntoParallelRefMutIterator;
use rayon::iter::ParallelIterator;
use smallvec::SmallVec;

pub(crate) struct SymbolDb<'data> {
    symbols: Vec<Symbol<'data>>,
    global_names: foldhash::HashMap<&'data [u8], SymbolId>,
    /// For each global symbol, every file that mentions it, in priority
    /// order. Empty for locals.
    candidates: Vec<SmallVec<[Candidate; 2]>>,
}

#[derive(Clone, Copy)]
struct Candidate {
    file: FileId,
    esym_index: u32,
}

impl<'data> SymbolDb<'data> {
    /// Interns every symbol of every file and records the per-name candidate
    /// lists. Files are processed in priority order so the lists come out
    /// pre-sorted for the elections.
    pub(crate) fn build(files: &mut [ObjectFile<'data>]) -> Result<SymbolDb<'data>> {
        let e = LittleEndian;
        let mut db = SymbolDb {
            symbols: vec![Symbol::new(b"")],
            global_names: foldhash::HashMap::default(),
            candidates: vec![SmallVec::new()],
        };

        for file in files {
            let file_id = file.file_id;
            file.symbols.reserve(file.esyms.len());
            for (i, esym) in file.esyms.iter().enumerate() {
                if i == 0 {
                    // The null symbol aliases the shared null record.
                    file.symbols.push(SymbolId(0));
                    continue;
                }
                let name = elf::get_string(file.symbol_strtab, esym.st_name.get(e))?;
                if i < file.first_global {
                    let id = SymbolId(db.symbols.len() as u32);
                    let mut sym = Symbol::new(name);
                    sym.file = Some(file_id);
                    sym.esym_index = i as u32;
                    sym.value = esym.st_value.get(e);
                    sym.st_type = esym.st_info & 0xf;
                    sym.visibility = esym.st_other & 3;
                    sym.input_section =
                        local_section_ref(file_id, esym.st_shndx.get(e), &file.sections);
                    db.symbols.push(sym);
                    db.candidates.push(SmallVec::new());
                    file.symbols.push(id);
                } else {
                    let id = match db.global_names.get(name) {
                        Some(&id) => id,
                        None => {
                            let id = SymbolId(db.symbols.len() as u32);
                            db.symbols.push(Symbol::new(name));
                            db.candidates.push(SmallVec::new());
                            db.global_names.insert(name, id);
                            id
                        }
                    };
                    db.candidates[id.as_usize()].push(Candidate {
                        file: file_id,
                        esym_index: i as u32,
                    });
                    file.symbols.push(id);
                }
            }
        }
        Ok(db)
    }

    pub(crate) fn symbol(&self, id: SymbolId) -> &Symbol<'data> {
        &self.symbols[id.as_usize()]
    }

    pub(crate) fn symbol_mut(&mut self, id: SymbolId) -> &mut Symbol<'data> {
        &mut self.symbols[id.as_usize()]
    }

    pub(crate) fn symbols(&self) -> &[Symbol<'data>] {
        &self.symbols
    }

    pub(crate) fn symbols_mut(&mut self) -> &mut [Symbol<'data>] {
        &mut self.symbols
    }

    pub(crate) fn lookup_global(&self, name: &[u8]) -> Option<SymbolId> {
        self.global_names.get(name).copied()
    }

    /// Runs the election for every global symbol. In the first round only
    /// non-archive files can win outright; a definition that exists only in
    /// archive members produces a provisional placeholder win, which is what
    /// drives archive member extraction. The final round re-runs the
    /// election over the files that ended up alive.
    pub(crate) fn resolve_symbols(&mut self, files: &[ObjectFile], final_round: bool) {
        let SymbolDb {
            symbols,
            candidates,
            ..
        } = self;
        symbols
            .par_iter_mut()
            .zip(candidates.par_iter())
            .for_each(|(sym, cands)| {
                if !cands.is_empty() {
                    resolve_symbol(sym, cands, files, final_round);
                }
            });
    }

    /// Drops references into sections that were removed by comdat
    /// deduplication so that nothing downstream can observe a dead section.
    pub(crate) fn clear_dead_section_refs(&mut self, files: &[ObjectFile]) {
        self.symbols.par_iter_mut().for_each(|sym| {
            if let Some(section) = sym.input_section {
                if matches!(
                    files[section.file.as_usize()].slot(section.index),
                    SectionSlot::Dead
                ) {
                    sym.input_section = None;
                }
            }
        });
    }
}

fn local_section_ref(
    file_id: FileId,
    shndx: u16,
    sections: &[SectionSlot],
) -> Option<SectionId> {
    match shndx {
        object::elf::SHN_UNDEF | object::elf::SHN_ABS | object::elf::SHN_COMMON => None,
        _ => {
            let index = u32::from(shndx);
            if matches!(
                sections.get(index as usize),
                Some(SectionSlot::Loaded(_) | SectionSlot::MergeStrings(_))
            ) {
                Some(SectionId {
                    file: file_id,
                    index,
                })
            } else {
                None
            }
        }
    }
}

/// Ranks a candidate definition. Lower wins; priority breaks ties because
/// candidates are walked in priority order.
const RANK_STRONG: u8 = 0;
const RANK_COMMON: u8 = 1;
const RANK_WEAK: u8 = 2;
const RANK_DSO: u8 = 3;

fn resolve_symbol(
    sym: &mut Symbol,
    candidates: &[Candidate],
    files: &[ObjectFile],
    final_round: bool,
) {
    let e = LittleEndian;

    struct Winner {
        candidate: Candidate,
        rank: u8,
        common_size: u64,
    }

    let mut winner: Option<Winner> = None;
    let mut first_archive_def: Option<Candidate> = None;
    let mut weak_ref: Option<Candidate> = None;

    for &candidate in candidates {
        let file = &files[candidate.file.as_usize()];
        let esym = &file.esyms[candidate.esym_index as usize];
        let shndx = esym.st_shndx.get(e);
        let bind = esym.st_info >> 4;

        if shndx == object::elf::SHN_UNDEF {
            if bind == object::elf::STB_WEAK && weak_ref.is_none() && file.alive() {
                weak_ref = Some(candidate);
            }
            continue;
        }

        if final_round {
            if !file.alive() {
                continue;
            }
        } else if file.is_in_archive {
            // Archive members can only win provisionally until liveness has
            // decided which members get extracted.
            if first_archive_def.is_none() {
                first_archive_def = Some(candidate);
            }
            continue;
        }

        let rank = if file.is_dso {
            RANK_DSO
        } else if bind == object::elf::STB_WEAK {
            RANK_WEAK
        } else if shndx == object::elf::SHN_COMMON {
            RANK_COMMON
        } else {
            RANK_STRONG
        };
        let common_size = esym.st_size.get(e);

        let better = match &winner {
            None => true,
            Some(w) => {
                rank < w.rank
                    || (rank == RANK_COMMON && w.rank == RANK_COMMON && common_size > w.common_size)
            }
        };
        if better {
            winner = Some(Winner {
                candidate,
                rank,
                common_size,
            });
        }
    }

    // Re-elections fully overwrite whatever the previous round decided.
    sym.file = None;
    sym.input_section = None;
    sym.value = 0;
    sym.is_weak = false;
    sym.is_imported = false;
    sym.is_placeholder = false;
    sym.is_undef_weak = false;

    if let Some(w) = winner {
        let file = &files[w.candidate.file.as_usize()];
        let esym = &file.esyms[w.candidate.esym_index as usize];
        let shndx = esym.st_shndx.get(e);
        sym.file = Some(w.candidate.file);
        sym.esym_index = w.candidate.esym_index;
        sym.value = esym.st_value.get(e);
        sym.st_type = esym.st_info & 0xf;
        sym.visibility = esym.st_other & 3;
        sym.is_weak = esym.st_info >> 4 == object::elf::STB_WEAK;
        sym.is_imported = file.is_dso;
        if !file.is_dso {
            sym.input_section = local_section_ref(w.candidate.file, shndx, &file.sections);
        }
    } else if let Some(archive_def) = first_archive_def.filter(|_| !final_round) {
        sym.file = Some(archive_def.file);
        sym.esym_index = archive_def.esym_index;
        sym.is_placeholder = true;
    } else if let Some(weak) = weak_ref {
        let file = &files[weak.file.as_usize()];
        let esym = &file.esyms[weak.esym_index as usize];
        sym.file = Some(weak.file);
        sym.esym_index = weak.esym_index;
        sym.visibility = esym.st_other & 3;
        sym.is_undef_weak = true;
    }
}
