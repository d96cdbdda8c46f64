//! SHF_MERGE section handling. Mergeable sections are split into fragments
//! (typically one string literal each) which are deduplicated across all
//! input files through a concurrent content-keyed map. Symbols defined
//! inside a mergeable section are rebound to their fragment; relocations
//! that address mergeable content through a section symbol get a parallel
//! stream of fragment references.
//!
//! Mergeable sections that carry relocations are left alone and copied like
//! regular sections.

use crate::diagnostics::ErrorSink;
use crate::elf::Shdr;
use crate::elf::RelaExt as _;
use crate::elf::shf;
use crate::error::error;
use crate::hash::ConcurrentMap;
use crate::hash::FrozenMap;
use crate::hash::MapId;
use crate::object_file::ObjectFile;
use crate::object_file::SectionSlot;
use crate::output_section::OutputSectionId;
use crate::output_section::UNASSIGNED_OUTPUT_SECTION;
use crate::symbol_db::SymbolDb;
use rayon::iter::IndexedParallelIterator;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::IntoParallelRefMutIterator;
use rayon::iter::ParallelIterator;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct FragmentId {
    pub(crate) section: u32,
    pub(crate) id: MapId,
}

/// A relocation target inside a merged section: the fragment plus the
/// addend relative to the fragment start.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FragmentRef {
    pub(crate) frag: FragmentId,
    pub(crate) addend: i64,
}

pub(crate) struct SectionFragment<'data> {
    pub(crate) data: &'data [u8],
    pub(crate) alignment: u16,
    /// Offset within the merged output section, assigned at layout.
    pub(crate) offset: u64,
}

/// The per-input-section view of a mergeable section: which fragments it
/// contributed and at which input offsets, so that addresses into the
/// original section can be translated.
pub(crate) struct MergeableSection<'data> {
    pub(crate) parent: u32,
    pub(crate) name: &'data [u8],
    pub(crate) shdr: Shdr,
    pub(crate) contents: &'data [u8],
    pub(crate) fragments: Vec<FragmentId>,
    pub(crate) frag_offsets: Vec<u64>,
}

impl<'data> MergeableSection<'data> {
    /// Translates an offset into the original section contents into the
    /// fragment containing it plus the remaining offset.
    pub(crate) fn fragment_at(&self, offset: u64) -> Option<(FragmentId, u64)> {
        let idx = self.frag_offsets.partition_point(|&o| o <= offset);
        if idx == 0 {
            return None;
        }
        let idx = idx - 1;
        let start = self.frag_offsets[idx];
        let end = self
            .frag_offsets
            .get(idx + 1)
            .copied()
            .unwrap_or(self.contents.len() as u64);
        (offset < end).then(|| (self.fragments[idx], offset - start))
    }
}

pub(crate) struct MergedSection<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) shdr: Shdr,
    pub(crate) output_section: OutputSectionId,
    pub(crate) frags: FrozenMap<SectionFragment<'data>>,
}

pub(crate) struct MergedSections<'data> {
    pub(crate) sections: Vec<MergedSection<'data>>,
}

impl<'data> MergedSections<'data> {
    pub(crate) fn fragment(&self, id: FragmentId) -> &SectionFragment<'data> {
        self.sections[id.section as usize].frags.get(id.id)
    }

    pub(crate) fn empty() -> MergedSections<'data> {
        MergedSections {
            sections: Vec::new(),
        }
    }
}

struct MergedSectionBuilder<'data> {
    name: &'data [u8],
    shdr: Shdr,
    map: ConcurrentMap<&'data [u8], SectionFragment<'data>>,
}

/// Converts eligible sections to `MergeStrings` slots, splits their contents
/// into interned fragments, rebinds symbols and computes the relocation
/// fragment-reference streams.
pub(crate) fn merge_sections<'data>(
    files: &mut [ObjectFile<'data>],
    db: &mut SymbolDb<'data>,
    errors: &ErrorSink,
) -> MergedSections<'data> {
    let mut builders: Vec<MergedSectionBuilder<'data>> = Vec::new();
    let mut by_key: foldhash::HashMap<(&'data [u8], u64, u32), u32> =
        foldhash::HashMap::default();

    // Registration runs in priority order so parent indices are stable.
    for file in files.iter_mut() {
        if !file.alive() || file.is_dso {
            continue;
        }
        for slot in &mut file.sections {
            let Some(isec) = slot.as_loaded() else {
                continue;
            };
            let shdr = isec.shdr;
            if shdr.sh_flags & shf::MERGE == 0 || shdr.is_nobits() || !isec.rels.is_empty() {
                continue;
            }
            let key = (isec.name, shdr.sh_flags, shdr.sh_type);
            let parent = *by_key.entry(key).or_insert_with(|| {
                builders.push(MergedSectionBuilder {
                    name: isec.name,
                    shdr,
                    map: ConcurrentMap::new(),
                });
                (builders.len() - 1) as u32
            });
            let SectionSlot::Loaded(isec) = std::mem::replace(slot, SectionSlot::Absent) else {
                unreachable!();
            };
            *slot = SectionSlot::MergeStrings(MergeableSection {
                parent,
                name: isec.name,
                shdr,
                contents: isec.contents,
                fragments: Vec::new(),
                frag_offsets: Vec::new(),
            });
        }
    }

    files.par_iter_mut().for_each(|file| {
        let display = file.display_name();
        for slot in &mut file.sections {
            if let SectionSlot::MergeStrings(msec) = slot {
                split_section(msec, &builders[msec.parent as usize].map, &display, errors);
            }
        }
    });

    let merged = MergedSections {
        sections: builders
            .into_iter()
            .map(|b| MergedSection {
                name: b.name,
                shdr: b.shdr,
                output_section: UNASSIGNED_OUTPUT_SECTION,
                frags: b.map.freeze(),
            })
            .collect(),
    };

    bind_symbols_to_fragments(files, db, errors);
    resolve_fragment_refs(files, db, errors);
    merged
}

fn split_section<'data>(
    msec: &mut MergeableSection<'data>,
    map: &ConcurrentMap<&'data [u8], SectionFragment<'data>>,
    file_display: &str,
    errors: &ErrorSink,
) {
    let name = String::from_utf8_lossy(msec.name);
    let entsize = msec.shdr.sh_entsize;
    if entsize == 0 {
        errors.report(error!("{file_display}:({name}): mergeable section has zero sh_entsize"));
        return;
    }
    // Fragment alignments are stored in 16 bits.
    if msec.shdr.sh_addralign >= (1 << 16) {
        errors.report(error!("{file_display}:({name}): alignment too large"));
        return;
    }
    let alignment = msec.shdr.sh_addralign as u16;
    let parent = msec.parent;
    let contents = msec.contents;
    let is_strings = msec.shdr.sh_flags & shf::STRINGS != 0;

    let mut insert = |piece: &'data [u8], input_offset: u64| {
        let id = map.insert_with(
            piece,
            || SectionFragment {
                data: piece,
                alignment,
                offset: 0,
            },
            |frag| frag.alignment = frag.alignment.max(alignment),
        );
        msec.fragments.push(FragmentId {
            section: parent,
            id,
        });
        msec.frag_offsets.push(input_offset);
    };

    let mut data = contents;
    let mut offset = 0u64;
    if is_strings {
        while !data.is_empty() {
            let Some(end) = find_null(data, entsize as usize) else {
                errors.report(error!("{file_display}:({name}): string is not null terminated"));
                return;
            };
            let piece_len = end + entsize as usize;
            insert(&data[..piece_len], offset);
            data = &data[piece_len..];
            offset += piece_len as u64;
        }
    } else {
        if data.len() as u64 % entsize != 0 {
            errors.report(error!(
                "{file_display}:({name}): section size is not a multiple of sh_entsize"
            ));
            return;
        }
        while !data.is_empty() {
            insert(&data[..entsize as usize], offset);
            data = &data[entsize as usize..];
            offset += entsize;
        }
    }
}

/// Finds the start of the first all-zero entry.
fn find_null(data: &[u8], entsize: usize) -> Option<usize> {
    if entsize == 1 {
        return data.iter().position(|&b| b == 0);
    }
    (0..data.len().saturating_sub(entsize - 1))
        .step_by(entsize)
        .find(|&i| data[i..i + entsize].iter().all(|&b| b == 0))
}

/// Rebinds every non-section symbol defined inside a mergeable section to
/// its fragment. The symbol's value becomes the offset within the fragment.
fn bind_symbols_to_fragments<'data>(
    files: &[ObjectFile<'data>],
    db: &mut SymbolDb<'data>,
    errors: &ErrorSink,
) {
    db.symbols_mut().par_iter_mut().for_each(|sym| {
        if sym.st_type == object::elf::STT_SECTION {
            return;
        }
        let Some(section) = sym.input_section else {
            return;
        };
        let Some(msec) = files[section.file.as_usize()]
            .slot(section.index)
            .as_merge_strings()
        else {
            return;
        };
        match msec.fragment_at(sym.value) {
            Some((frag, offset_in_frag)) => {
                sym.frag = Some(frag);
                sym.value = offset_in_frag;
                sym.input_section = None;
            }
            None => errors.report(error!(
                "symbol {} has value outside its mergeable section",
                sym.name_for_display()
            )),
        }
    });
}

/// Computes `has_fragments`/`rel_fragments` for every loaded section:
/// relocations that reach mergeable content through a section symbol are
/// redirected to the fragment containing their addend.
fn resolve_fragment_refs<'data>(
    files: &mut [ObjectFile<'data>],
    db: &SymbolDb<'data>,
    errors: &ErrorSink,
) {
    let computed: Vec<Vec<(u32, Vec<bool>, Vec<FragmentRef>)>> = files
        .par_iter()
        .map(|file| {
            if !file.alive() {
                return Vec::new();
            }
            file.sections
                .iter()
                .enumerate()
                .filter_map(|(index, slot)| {
                    let isec = slot.as_loaded()?;
                    let mut has_fragments = vec![false; isec.rels.len()];
                    let mut refs = Vec::new();
                    for (i, rel) in isec.rels.iter().enumerate() {
                        let sym = db.symbol(file.symbols[rel.sym() as usize]);
                        if sym.st_type != object::elf::STT_SECTION {
                            continue;
                        }
                        let Some(section) = sym.input_section else {
                            continue;
                        };
                        let Some(msec) = files[section.file.as_usize()]
                            .slot(section.index)
                            .as_merge_strings()
                        else {
                            continue;
                        };
                        let addend = rel.addend();
                        match u64::try_from(addend).ok().and_then(|a| msec.fragment_at(a)) {
                            Some((frag, offset_in_frag)) => {
                                has_fragments[i] = true;
                                refs.push(FragmentRef {
                                    frag,
                                    addend: offset_in_frag as i64,
                                });
                            }
                            None => errors.report(error!(
                                "{}: relocation addend {addend} outside mergeable section",
                                file.display_name()
                            )),
                        }
                    }
                    (!refs.is_empty()).then_some((index as u32, has_fragments, refs))
                })
                .collect()
        })
        .collect();

    files
        .par_iter_mut()
        .zip(computed)
        .for_each(|(file, sections)| {
            for (index, has_fragments, refs) in sections {
                let isec = file.sections[index as usize].as_loaded_mut().unwrap();
                isec.has_fragments = has_fragments;
                isec.rel_fragments = refs;
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::make_rela;
    use crate::test_util::TestFileBuilder;
    use object::elf::{R_X86_64_32, SHT_PROGBITS, STB_GLOBAL, STT_OBJECT};

    fn str_section_flags() -> u64 {
        shf::ALLOC | shf::MERGE | shf::STRINGS
    }

    #[test]
    fn identical_strings_are_shared() {
        let errors = ErrorSink::new();
        let mut files = vec![
            TestFileBuilder::new("a.o")
                .section(".rodata.str1.1", SHT_PROGBITS, str_section_flags(), b"hi\0yo\0", 1, 1)
                .build(0),
            TestFileBuilder::new("b.o")
                .section(".rodata.str1.1", SHT_PROGBITS, str_section_flags(), b"yo\0", 1, 1)
                .build(1),
        ];
        let mut db = SymbolDb::build(&mut files).unwrap();
        db.resolve_symbols(&files, true);
        let merged = merge_sections(&mut files, &mut db, &errors);
        assert_eq!(errors.error_count(), 0);
        assert_eq!(merged.sections.len(), 1);
        // "hi\0" and one shared "yo\0".
        assert_eq!(merged.sections[0].frags.len(), 2);

        let a = files[0].slot(1).as_merge_strings().unwrap();
        let b = files[1].slot(1).as_merge_strings().unwrap();
        assert_eq!(a.fragments.len(), 2);
        assert_eq!(a.frag_offsets, vec![0, 3]);
        assert_eq!(a.fragments[1], b.fragments[0]);
    }

    #[test]
    fn unterminated_string_is_reported() {
        let errors = ErrorSink::new();
        let mut files = vec![
            TestFileBuilder::new("a.o")
                .section(".rodata.str1.1", SHT_PROGBITS, str_section_flags(), b"oops", 1, 1)
                .build(0),
        ];
        let mut db = SymbolDb::build(&mut files).unwrap();
        db.resolve_symbols(&files, true);
        merge_sections(&mut files, &mut db, &errors);
        assert_eq!(errors.error_count(), 1);
    }

    #[test]
    fn symbols_rebind_to_fragments() {
        let errors = ErrorSink::new();
        let mut files = vec![
            TestFileBuilder::new("a.o")
                .section(".rodata.str1.1", SHT_PROGBITS, str_section_flags(), b"ab\0cd\0", 1, 1)
                .global(b"msg", STB_GLOBAL, STT_OBJECT, 1, 3)
                .build(0),
        ];
        let mut db = SymbolDb::build(&mut files).unwrap();
        db.resolve_symbols(&files, true);
        merge_sections(&mut files, &mut db, &errors);
        let sym = db.symbol(db.lookup_global(b"msg").unwrap());
        assert!(sym.frag.is_some());
        assert_eq!(sym.value, 0);
        assert!(sym.input_section.is_none());
    }

    #[test]
    fn section_symbol_relocs_get_fragment_refs() {
        let errors = ErrorSink::new();
        let rels = vec![make_rela(0, R_X86_64_32, 1, 4)];
        let mut files = vec![
            TestFileBuilder::new("a.o")
                .section(".rodata.str1.1", SHT_PROGBITS, str_section_flags(), b"ab\0cd\0", 1, 1)
                .text_section(".text", &[0u8; 8])
                .local_section_symbol(1)
                .rels_for_section(2, rels)
                .build(0),
        ];
        let mut db = SymbolDb::build(&mut files).unwrap();
        db.resolve_symbols(&files, true);
        merge_sections(&mut files, &mut db, &errors);
        assert_eq!(errors.error_count(), 0);
        let text = files[0].section(2).unwrap();
        assert_eq!(text.has_fragments, vec![true]);
        assert_eq!(text.rel_fragments.len(), 1);
        // Addend 4 lands one byte into the "cd\0" fragment.
        assert_eq!(text.rel_fragments[0].addend, 1);
    }
}
