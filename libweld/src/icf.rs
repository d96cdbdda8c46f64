//! Identical code folding. Finds input sections that are byte-identical in
//! both content and relocation behaviour, keeps one representative per
//! equivalence class and redirects symbols at the rest.
//!
//! Equivalence of the sections a section refers to can't be decided locally,
//! so the pass runs a fixed-point refinement: every section gets an initial
//! content digest, then each round rehashes the digest together with the
//! digests of the sections it references. Once a round stops increasing the
//! number of distinct classes, no further round can separate anything.

use crate::args::Args;
use crate::elf;
use crate::elf::RelaExt as _;
use crate::input_section::InputSection;
use crate::merge_strings::MergedSections;
use crate::object_file::ObjectFile;
use crate::object_file::SectionSlot;
use crate::object_file::section_display_name;
use crate::symbol::SectionId;
use crate::symbol::Symbol;
use crate::symbol::SymbolId;
use crate::symbol_db::SymbolDb;
use rayon::iter::IndexedParallelIterator;
use rayon::iter::IntoParallelIterator;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::IntoParallelRefMutIterator;
use rayon::iter::ParallelIterator;
use rayon::slice::ParallelSliceMut;
use sha2::Digest as _;
use sha2::Sha256;
use std::io::Write as _;

/// Digests are truncated to 16 bytes so that the per-round working set
/// stays small. The type tags absorbed below provide domain separation; a
/// collision here would fold sections that aren't equivalent, so neither
/// the tags nor the absorb order should be changed.
const HASH_SIZE: usize = 16;

type IcfDigest = [u8; HASH_SIZE];

fn digest_final(hasher: Sha256) -> IcfDigest {
    let full = hasher.finalize();
    let mut out = [0u8; HASH_SIZE];
    out.copy_from_slice(&full[..HASH_SIZE]);
    out
}

fn is_eligible(isec: &InputSection) -> bool {
    let shdr = &isec.shdr;
    let is_init = shdr.sh_type == object::elf::SHT_INIT_ARRAY || isec.name == b".init";
    let is_fini = shdr.sh_type == object::elf::SHT_FINI_ARRAY || isec.name == b".fini";
    // C-identifier-named sections are reachable through __start_/__stop_
    // symbols, so folding them would change observable addresses.
    let is_enumerable = elf::is_c_identifier(isec.name);

    shdr.is_alloc()
        && shdr.is_executable()
        && !shdr.is_writable()
        && !shdr.is_nobits()
        && shdr.sh_size != 0
        && !is_init
        && !is_fini
        && !is_enumerable
}

fn hash_u64(hasher: &mut Sha256, val: u64) {
    hasher.update(val.to_le_bytes());
}

fn hash_bytes(hasher: &mut Sha256, bytes: &[u8]) {
    hash_u64(hasher, bytes.len() as u64);
    hasher.update(bytes);
}

fn hash_symbol(hasher: &mut Sha256, sym: &Symbol, merged: &MergedSections) {
    if let Some(frag) = sym.frag {
        hash_u64(hasher, 2);
        hash_bytes(hasher, merged.fragment(frag).data);
    } else if sym.input_section.is_none() {
        hash_u64(hasher, 3);
    } else {
        // The referenced section's identity is deliberately not hashed here;
        // equivalence of referenced sections is established by propagation.
        hash_u64(hasher, 4);
    }
    hash_u64(hasher, sym.value);
}

fn compute_digest(
    isec: &InputSection,
    symbols: &[SymbolId],
    db: &SymbolDb,
    merged: &MergedSections,
) -> IcfDigest {
    let mut hasher = Sha256::new();

    hash_bytes(&mut hasher, isec.contents);
    hash_u64(&mut hasher, isec.shdr.sh_flags);
    hash_u64(&mut hasher, isec.fdes.len() as u64);
    hash_u64(&mut hasher, isec.rels.len() as u64);

    for fde in &isec.fdes {
        // Bytes 4 to 8 hold the offset to the CIE; skip it.
        hash_bytes(&mut hasher, &fde.contents[..4]);
        hash_bytes(&mut hasher, &fde.contents[8..]);

        hash_u64(&mut hasher, fde.rels.len() as u64);

        // The first relocation points at the function this FDE describes,
        // which is the section being hashed, so it carries no information.
        for rel in fde.rels.iter().skip(1) {
            hash_symbol(&mut hasher, db.symbol(rel.sym), merged);
            hash_u64(&mut hasher, u64::from(rel.r_type));
            hash_u64(&mut hasher, rel.offset);
            hash_u64(&mut hasher, rel.addend as u64);
        }
    }

    let mut ref_idx = 0;
    for (i, rel) in isec.rels.iter().enumerate() {
        hash_u64(&mut hasher, rel.offset());
        hash_u64(&mut hasher, u64::from(rel.rel_type()));
        hash_u64(&mut hasher, rel.addend() as u64);

        if isec.has_fragments.get(i).copied().unwrap_or(false) {
            let frag_ref = isec.rel_fragments[ref_idx];
            ref_idx += 1;
            hash_u64(&mut hasher, 1);
            hash_u64(&mut hasher, frag_ref.addend as u64);
            hash_bytes(&mut hasher, merged.fragment(frag_ref.frag).data);
        } else {
            hash_symbol(&mut hasher, db.symbol(symbols[rel.sym() as usize]), merged);
        }
    }

    digest_final(hasher)
}

/// Ineligible sections get a unique pseudo-digest so they stay distinct and
/// sort after every real digest's entry.
fn pack_number(val: u64) -> IcfDigest {
    let mut out = [0u8; HASH_SIZE];
    out[..8].copy_from_slice(&val.to_le_bytes());
    out
}

#[derive(Clone)]
struct Entry {
    section: SectionId,
    digest: IcfDigest,
    eligible: bool,
}

fn section_priority(id: SectionId) -> u64 {
    (u64::from(id.file.0) << 32) | u64::from(id.index)
}

struct Graph {
    /// Initial digests for every entry, eligible entries first.
    digests: Vec<IcfDigest>,
    /// The eligible prefix of the entry ordering.
    sections: Vec<SectionId>,
    /// CSR edge storage: `edge_indices[i]` is the start of node i's edges.
    edge_indices: Vec<u32>,
    edges: Vec<u32>,
}

fn gather_sections(
    files: &mut [ObjectFile],
    db: &SymbolDb,
    merged: &MergedSections,
) -> Graph {
    let per_file: Vec<Vec<Entry>> = files
        .par_iter()
        .map(|file| {
            if !file.alive() || file.is_dso {
                return Vec::new();
            }
            file.sections
                .iter()
                .enumerate()
                .filter_map(|(index, slot)| {
                    let isec = slot.as_loaded()?;
                    let eligible = is_eligible(isec);
                    let digest = if eligible {
                        compute_digest(isec, &file.symbols, db, merged)
                    } else {
                        pack_number(
                            (u64::from(file.file_id.0) << 32) | index as u64,
                        )
                    };
                    Some(Entry {
                        section: isec.id,
                        digest,
                        eligible,
                    })
                })
                .collect()
        })
        .collect();
    let mut entries: Vec<Entry> = per_file.concat();

    // Eligible entries first, then by digest; priority makes the order total.
    entries.par_sort_unstable_by(|a, b| {
        b.eligible
            .cmp(&a.eligible)
            .then_with(|| a.digest.cmp(&b.digest))
            .then_with(|| section_priority(a.section).cmp(&section_priority(b.section)))
    });

    let num_eligible = entries.par_iter().filter(|e| e.eligible).count();

    let positions: foldhash::HashMap<SectionId, u32> = entries
        .par_iter()
        .enumerate()
        .map(|(i, entry)| (entry.section, i as u32))
        .collect();
    files.par_iter_mut().for_each(|file| {
        for slot in &mut file.sections {
            if let Some(isec) = slot.as_loaded_mut() {
                if let Some(&idx) = positions.get(&isec.id) {
                    isec.icf_idx = idx;
                }
            }
        }
    });

    let sections: Vec<SectionId> = entries[..num_eligible]
        .iter()
        .map(|entry| entry.section)
        .collect();

    let files = &*files;
    let edge_lists: Vec<Vec<u32>> = sections
        .par_iter()
        .map(|&id| {
            let file = &files[id.file.as_usize()];
            let isec = file.section(id.index).unwrap();
            let mut out = Vec::new();
            for (j, rel) in isec.rels.iter().enumerate() {
                if isec.has_fragments.get(j).copied().unwrap_or(false) {
                    continue;
                }
                let sym = db.symbol(file.symbols[rel.sym() as usize]);
                if sym.frag.is_some() {
                    continue;
                }
                let Some(target) = sym.input_section else {
                    continue;
                };
                let Some(target_isec) = files[target.file.as_usize()].section(target.index)
                else {
                    continue;
                };
                assert_ne!(target_isec.icf_idx, u32::MAX, "section not numbered by ICF");
                out.push(target_isec.icf_idx);
            }
            out
        })
        .collect();

    let mut edge_indices = Vec::with_capacity(edge_lists.len());
    let mut total = 0u32;
    for list in &edge_lists {
        edge_indices.push(total);
        total += list.len() as u32;
    }
    let edges = edge_lists.concat();

    Graph {
        digests: entries.into_iter().map(|entry| entry.digest).collect(),
        sections,
        edge_indices,
        edges,
    }
}

/// Counts adjacent digest pairs that differ within the eligible prefix.
/// This is monotone non-decreasing across rounds, which is what makes it a
/// usable convergence signal.
fn count_num_classes(digests: &[IcfDigest], num_eligible: usize) -> usize {
    if num_eligible == 0 {
        return 0;
    }
    (0..num_eligible - 1)
        .into_par_iter()
        .filter(|&i| digests[i] != digests[i + 1])
        .count()
}

pub(crate) fn icf_sections(
    files: &mut [ObjectFile],
    db: &mut SymbolDb,
    merged: &MergedSections,
    args: &Args,
) {
    let _span = tracing::info_span!("icf").entered();

    let graph = gather_sections(files, db, merged);
    let num_eligible = graph.sections.len();

    let mut cur = graph.digests;
    let mut next = cur.clone();

    let mut num_classes = count_num_classes(&cur, num_eligible);
    let mut rounds = 0usize;

    // Propagate until the class count stops growing.
    loop {
        rounds += 1;
        let cur_ref = &cur;
        next[..num_eligible]
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, out)| {
                let mut hasher = Sha256::new();
                hasher.update(cur_ref[i]);
                let begin = graph.edge_indices[i] as usize;
                let end = if i + 1 == num_eligible {
                    graph.edges.len()
                } else {
                    graph.edge_indices[i + 1] as usize
                };
                for &edge in &graph.edges[begin..end] {
                    hasher.update(cur_ref[edge as usize]);
                }
                *out = digest_final(hasher);
            });
        std::mem::swap(&mut cur, &mut next);

        let n = count_num_classes(&cur, num_eligible);
        if n == num_classes {
            break;
        }
        num_classes = n;
    }
    tracing::debug!("icf: {num_classes} classes after {rounds} rounds");

    // Group by final digest; the first member of each run (lowest priority)
    // becomes the leader.
    let mut final_entries: Vec<(IcfDigest, u64, SectionId)> = (0..num_eligible)
        .map(|i| (cur[i], section_priority(graph.sections[i]), graph.sections[i]))
        .collect();
    final_entries.par_sort_unstable_by_key(|entry| (entry.0, entry.1));

    let mut leader_of: foldhash::HashMap<SectionId, SectionId> = foldhash::HashMap::default();
    let mut i = 0;
    while i < final_entries.len() {
        let mut j = i + 1;
        while j < final_entries.len() && final_entries[j].0 == final_entries[i].0 {
            leader_of.insert(final_entries[j].2, final_entries[i].2);
            j += 1;
        }
        i = j;
    }

    files.par_iter_mut().for_each(|file| {
        for slot in &mut file.sections {
            if let Some(isec) = slot.as_loaded_mut() {
                if let Some(&leader) = leader_of.get(&isec.id) {
                    isec.leader = Some(leader);
                }
            }
        }
    });

    // Re-assign input sections to symbols so no reference can observe a
    // folded section.
    {
        let files = &*files;
        db.symbols_mut().par_iter_mut().for_each(|sym| {
            if let Some(section) = sym.input_section {
                if let Some(isec) = files[section.file.as_usize()].section(section.index) {
                    if let Some(leader) = isec.leader {
                        sym.input_section = Some(leader);
                    }
                }
            }
        });
    }

    if args.print_icf_sections {
        print_folded_sections(files, &final_entries);
    }

    // Finally, mark the non-leaders dead in their owning files.
    files.par_iter_mut().for_each(|file| {
        for slot in &mut file.sections {
            if let SectionSlot::Loaded(isec) = slot {
                if let Some(leader) = isec.leader {
                    *slot = SectionSlot::Folded(leader);
                }
            }
        }
    });
}

fn print_folded_sections(files: &[ObjectFile], entries: &[(IcfDigest, u64, SectionId)]) {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut saved_bytes = 0u64;

    let mut i = 0;
    while i < entries.len() {
        let mut j = i + 1;
        while j < entries.len() && entries[j].0 == entries[i].0 {
            j += 1;
        }
        if j != i + 1 {
            let leader = entries[i].2;
            let _ = writeln!(out, "selected section {}", section_display_name(files, leader));
            for entry in &entries[i + 1..j] {
                let _ = writeln!(
                    out,
                    "  removing identical section {}",
                    section_display_name(files, entry.2)
                );
            }
            let leader_size = files[leader.file.as_usize()]
                .section(leader.index)
                .map_or(0, |isec| isec.contents.len() as u64);
            saved_bytes += leader_size * (j - i - 1) as u64;
        }
        i = j;
    }

    let _ = writeln!(out, "ICF saved {saved_bytes} bytes");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::make_rela;
    use crate::merge_strings::MergedSections;
    use crate::test_util::TestFileBuilder;
    use object::elf::{R_X86_64_PC32, R_X86_64_PLT32, STB_GLOBAL, STT_FUNC};

    fn run_icf(files: &mut [ObjectFile], db: &mut SymbolDb) {
        let merged = MergedSections::empty();
        let args = Args::default();
        icf_sections(files, db, &merged, &args);
    }

    fn folded_to(files: &[ObjectFile], file: usize, section: u32) -> Option<SectionId> {
        match files[file].slot(section) {
            SectionSlot::Folded(leader) => Some(*leader),
            _ => None,
        }
    }

    #[test]
    fn identical_functions_fold_to_the_earlier_file() {
        let body = &[0x55, 0x48, 0x89, 0xe5, 0x5d, 0xc3];
        let mut files = vec![
            TestFileBuilder::new("a.o")
                .text_section(".text.f1", body)
                .global(b"f1", STB_GLOBAL, STT_FUNC, 1, 0)
                .build(0),
            TestFileBuilder::new("b.o")
                .text_section(".text.f2", body)
                .global(b"f2", STB_GLOBAL, STT_FUNC, 1, 0)
                .build(1),
        ];
        let mut db = SymbolDb::build(&mut files).unwrap();
        db.resolve_symbols(&files, true);
        run_icf(&mut files, &mut db);

        let leader = SectionId {
            file: files[0].file_id,
            index: 1,
        };
        // The earlier file survives; the later one is folded into it.
        assert!(files[0].section(1).is_some());
        assert_eq!(folded_to(&files, 1, 1), Some(leader));

        // Both symbols now name the surviving section.
        let f1 = db.symbol(db.lookup_global(b"f1").unwrap());
        let f2 = db.symbol(db.lookup_global(b"f2").unwrap());
        assert_eq!(f1.input_section, Some(leader));
        assert_eq!(f2.input_section, Some(leader));
    }

    #[test]
    fn no_leader_chains() {
        let body = &[0xc3];
        let mut files: Vec<_> = (0..4)
            .map(|i| {
                TestFileBuilder::new("x.o")
                    .text_section(".text.f", body)
                    .build(i)
            })
            .collect();
        let mut db = SymbolDb::build(&mut files).unwrap();
        db.resolve_symbols(&files, true);
        run_icf(&mut files, &mut db);
        for file in 1..4 {
            let leader = folded_to(&files, file, 1).unwrap();
            // The leader is itself a survivor, never another folded section.
            assert!(files[leader.file.as_usize()].section(leader.index).is_some());
        }
    }

    #[test]
    fn differing_bytes_do_not_fold() {
        let mut files = vec![
            TestFileBuilder::new("a.o")
                .text_section(".text.f1", &[0xc3])
                .build(0),
            TestFileBuilder::new("b.o")
                .text_section(".text.f2", &[0x90, 0xc3])
                .build(1),
        ];
        let mut db = SymbolDb::build(&mut files).unwrap();
        db.resolve_symbols(&files, true);
        run_icf(&mut files, &mut db);
        assert!(files[0].section(1).is_some());
        assert!(files[1].section(1).is_some());
    }

    #[test]
    fn ineligible_sections_never_fold() {
        let body = &[0xc3];
        let exec = crate::elf::shf::ALLOC | crate::elf::shf::EXECINSTR;
        let mut files = vec![
            TestFileBuilder::new("a.o")
                .section(".init", object::elf::SHT_PROGBITS, exec, body, 1, 0)
                .build(0),
            TestFileBuilder::new("b.o")
                .section(".init", object::elf::SHT_PROGBITS, exec, body, 1, 0)
                .build(1),
            // A C-identifier name keeps a section out of ICF even when its
            // dotted clone participates.
            TestFileBuilder::new("c.o")
                .section("enum_section", object::elf::SHT_PROGBITS, exec, body, 1, 0)
                .build(2),
            TestFileBuilder::new("d.o")
                .section("enum_section", object::elf::SHT_PROGBITS, exec, body, 1, 0)
                .build(3),
        ];
        let mut db = SymbolDb::build(&mut files).unwrap();
        db.resolve_symbols(&files, true);
        run_icf(&mut files, &mut db);
        for file in &files {
            assert!(file.section(1).is_some());
        }
    }

    #[test]
    fn self_referencing_sections_fold() {
        let body = &[0xe8, 0, 0, 0, 0];
        let mut files = vec![
            TestFileBuilder::new("a.o")
                .text_section(".text.f1", body)
                .global(b"f1", STB_GLOBAL, STT_FUNC, 1, 0)
                .rels_for_section(1, vec![make_rela(1, R_X86_64_PLT32, 1, -4)])
                .build(0),
            TestFileBuilder::new("b.o")
                .text_section(".text.f2", body)
                .global(b"f2", STB_GLOBAL, STT_FUNC, 1, 0)
                .rels_for_section(1, vec![make_rela(1, R_X86_64_PLT32, 1, -4)])
                .build(1),
        ];
        let mut db = SymbolDb::build(&mut files).unwrap();
        db.resolve_symbols(&files, true);
        run_icf(&mut files, &mut db);
        assert!(folded_to(&files, 1, 1).is_some());
    }

    #[test]
    fn structurally_identical_cycles_fold() {
        // Two files, each with a pair of functions calling each other.
        let body = &[0xe8, 0, 0, 0, 0];
        let make = |fname: &[u8], gname: &[u8], prio| {
            TestFileBuilder::new("x.o")
                .text_section(".text.f", body)
                .text_section(".text.g", body)
                .global(fname, STB_GLOBAL, STT_FUNC, 1, 0)
                .global(gname, STB_GLOBAL, STT_FUNC, 2, 0)
                // f calls g, g calls f.
                .rels_for_section(1, vec![make_rela(1, R_X86_64_PC32, 2, -4)])
                .rels_for_section(2, vec![make_rela(1, R_X86_64_PC32, 1, -4)])
                .build(prio)
        };
        let mut files = vec![make(b"f1", b"g1", 0), make(b"f2", b"g2", 1)];
        let mut db = SymbolDb::build(&mut files).unwrap();
        db.resolve_symbols(&files, true);
        run_icf(&mut files, &mut db);

        let f_leader = folded_to(&files, 1, 1).unwrap();
        let g_leader = folded_to(&files, 1, 2).unwrap();
        assert_eq!(f_leader.file, files[0].file_id);
        assert_eq!(g_leader.file, files[0].file_id);
        assert_ne!(f_leader, g_leader);
    }

    #[test]
    fn sections_with_different_callees_do_not_fold() {
        let body = &[0xe8, 0, 0, 0, 0];
        // Both wrappers are byte-identical and call byte-identical targets,
        // except the targets differ in one byte. The difference is only
        // discovered via propagation.
        let make = |tname: &'static [u8], target_body: &'static [u8], prio| {
            TestFileBuilder::new("x.o")
                .text_section(".text.wrapper", body)
                .text_section(".text.target", target_body)
                .global(tname, STB_GLOBAL, STT_FUNC, 2, 0)
                .rels_for_section(1, vec![make_rela(1, R_X86_64_PC32, 1, -4)])
                .build(prio)
        };
        let mut files = vec![make(b"t1", &[0xc3], 0), make(b"t2", &[0x90], 1)];
        let mut db = SymbolDb::build(&mut files).unwrap();
        db.resolve_symbols(&files, true);
        run_icf(&mut files, &mut db);

        // Targets differ, so the wrappers must stay distinct too.
        assert!(files[0].section(1).is_some());
        assert!(files[1].section(1).is_some());
    }

    #[test]
    fn folding_is_idempotent() {
        let body = &[0xc3];
        let mut files = vec![
            TestFileBuilder::new("a.o").text_section(".text.f", body).build(0),
            TestFileBuilder::new("b.o").text_section(".text.f", body).build(1),
        ];
        let mut db = SymbolDb::build(&mut files).unwrap();
        db.resolve_symbols(&files, true);
        run_icf(&mut files, &mut db);
        let first = folded_to(&files, 1, 1);
        run_icf(&mut files, &mut db);
        assert_eq!(folded_to(&files, 1, 1), first);
        assert!(files[0].section(1).is_some());
    }
}
