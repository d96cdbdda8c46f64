//! Input sections and the two-phase relocation engine. `scan_relocations`
//! classifies every relocation into an abstract kind and records what
//! auxiliary structures (PLT, GOT, TLS slots, dynamic relocations) the link
//! needs; `copy_buf` later writes the section into the output buffer and
//! patches each site using the recorded kind.

use crate::args::Args;
use crate::diagnostics::ErrorSink;
use crate::eh_frame::FdeRecord;
use crate::elf;
use crate::elf::Rela;
use crate::elf::RelaExt as _;
use crate::elf::Shdr;
use crate::elf_x86_64::RelKind;
use crate::elf_x86_64::TLSGD_TO_LE;
use crate::elf_x86_64::TLSLD_TO_LE;
use crate::elf_x86_64::check_range;
use crate::elf_x86_64::rel_type_to_string;
use crate::elf_x86_64::write_val;
use crate::elf_x86_64::write_width;
use crate::error::error;
use crate::layout::LinkContext;
use crate::merge_strings::FragmentRef;
use crate::object_file::ObjectFile;
use crate::output_section::OutputSectionId;
use crate::output_section::UNASSIGNED_OUTPUT_SECTION;
use crate::symbol::SectionId;
use crate::symbol::Symbol;
use crate::symbol::SymbolId;
use crate::symbol::sym_flags;
use crate::symbol_db::SymbolDb;
use object::elf::*;
use rayon::iter::IntoParallelRefMutIterator;
use rayon::iter::ParallelIterator;

pub(crate) struct InputSection<'data> {
    pub(crate) id: SectionId,
    pub(crate) shdr: Shdr,
    pub(crate) name: &'data [u8],
    pub(crate) contents: &'data [u8],

    pub(crate) output_section: OutputSectionId,
    /// Offset within the output section, assigned at layout.
    pub(crate) offset: u64,

    pub(crate) rels: &'data [Rela],
    /// Parallel to `rels`, filled by the scanner.
    pub(crate) rel_types: Vec<RelKind>,
    /// Marks relocations whose target is a mergeable-section fragment.
    /// Empty when no relocation targets a fragment.
    pub(crate) has_fragments: Vec<bool>,
    /// The fragment targets, consumed in lockstep with `has_fragments`.
    pub(crate) rel_fragments: Vec<FragmentRef>,

    pub(crate) fdes: Vec<FdeRecord<'data>>,

    /// Position in ICF's entry ordering; `u32::MAX` until ICF numbers it.
    pub(crate) icf_idx: u32,
    /// For a folded section, the surviving section it was folded into.
    pub(crate) leader: Option<SectionId>,

    /// Byte offset of this section's first dynamic relocation within its
    /// file's slice of `.rela.dyn`.
    pub(crate) reldyn_offset: u64,
}

impl<'data> InputSection<'data> {
    pub(crate) fn new(
        id: SectionId,
        shdr: Shdr,
        name: &'data [u8],
        contents: &'data [u8],
    ) -> InputSection<'data> {
        InputSection {
            id,
            shdr,
            name,
            contents,
            output_section: UNASSIGNED_OUTPUT_SECTION,
            offset: 0,
            rels: &[],
            rel_types: Vec::new(),
            has_fragments: Vec::new(),
            rel_fragments: Vec::new(),
            fdes: Vec::new(),
            icf_idx: u32::MAX,
            leader: None,
            reldyn_offset: 0,
        }
    }

    fn fragment_ref(&self, rel_index: usize, ref_idx: &mut usize) -> Option<FragmentRef> {
        if self.has_fragments.get(rel_index).copied().unwrap_or(false) {
            let r = self.rel_fragments[*ref_idx];
            *ref_idx += 1;
            Some(r)
        } else {
            None
        }
    }

    fn display(&self, file_display: &str) -> String {
        format!("{file_display}:({})", String::from_utf8_lossy(self.name))
    }

    /// Classifies every relocation, accumulates per-symbol demand flags and
    /// counts the dynamic relocations this section will emit. Non-ALLOC
    /// sections are not scanned.
    pub(crate) fn scan_relocations(
        &mut self,
        file_display: &str,
        symbols: &[SymbolId],
        db: &SymbolDb,
        args: &Args,
        num_dynrel: &mut u32,
        errors: &ErrorSink,
    ) {
        if !self.shdr.is_alloc() {
            return;
        }

        self.reldyn_offset = u64::from(*num_dynrel) * elf::RELA_ENTRY_SIZE;
        self.rel_types = vec![RelKind::None; self.rels.len()];
        let is_writable = self.shdr.is_writable();

        let mut i = 0;
        while i < self.rels.len() {
            let rel = &self.rels[i];
            let r_type = rel.rel_type();
            let sym = db.symbol(symbols[rel.sym() as usize]);
            let is_code = sym.st_type == STT_FUNC;

            if sym.file.is_none() || sym.is_placeholder {
                errors.report(error!(
                    "undefined symbol: {file_display}: {}",
                    sym.name_for_display()
                ));
                i += 1;
                continue;
            }

            let pie_error = || {
                error!(
                    "{}: {} relocation against symbol `{}' can not be used; \
                     recompile with -fPIE",
                    self.display(file_display),
                    rel_type_to_string(r_type),
                    sym.name_for_display()
                )
            };

            match r_type {
                R_X86_64_NONE => {
                    self.rel_types[i] = RelKind::None;
                }
                R_X86_64_8 | R_X86_64_16 | R_X86_64_32 | R_X86_64_32S => {
                    if args.pie && sym.is_relative() {
                        errors.report(pie_error());
                    }
                    if sym.is_imported {
                        sym.set_flags(abs_import_flags(is_code));
                    }
                    self.rel_types[i] = RelKind::Abs;
                }
                R_X86_64_64 => {
                    if args.pie {
                        if sym.is_imported {
                            if !is_writable {
                                errors.report(pie_error());
                            }
                            sym.set_flags(sym_flags::NEEDS_DYNSYM);
                            self.rel_types[i] = RelKind::Dyn;
                            *num_dynrel += 1;
                        } else if sym.is_relative() {
                            if !is_writable {
                                errors.report(pie_error());
                            }
                            self.rel_types[i] = RelKind::AbsDyn;
                            *num_dynrel += 1;
                        } else {
                            self.rel_types[i] = RelKind::Abs;
                        }
                    } else {
                        if sym.is_imported {
                            sym.set_flags(abs_import_flags(is_code));
                        }
                        self.rel_types[i] = RelKind::Abs;
                    }
                }
                R_X86_64_PC8 | R_X86_64_PC16 | R_X86_64_PC32 | R_X86_64_PC64 => {
                    if sym.is_imported {
                        sym.set_flags(abs_import_flags(is_code));
                    }
                    self.rel_types[i] = RelKind::Pc;
                }
                R_X86_64_GOT32 => {
                    sym.set_flags(sym_flags::NEEDS_GOT);
                    self.rel_types[i] = RelKind::Got;
                }
                R_X86_64_GOTPC32 => {
                    sym.set_flags(sym_flags::NEEDS_GOT);
                    self.rel_types[i] = RelKind::GotPc;
                }
                R_X86_64_GOTPCREL | R_X86_64_GOTPCRELX | R_X86_64_REX_GOTPCRELX => {
                    sym.set_flags(sym_flags::NEEDS_GOT);
                    self.rel_types[i] = RelKind::GotPcRel;
                }
                R_X86_64_PLT32 => {
                    if sym.is_imported || sym.st_type == STT_GNU_IFUNC {
                        sym.set_flags(sym_flags::NEEDS_PLT);
                    }
                    self.rel_types[i] = RelKind::Pc;
                }
                R_X86_64_TLSGD => {
                    if !next_is_plt32(self.rels, i) {
                        errors.report(error!(
                            "{}: TLSGD reloc not followed by PLT32",
                            self.display(file_display)
                        ));
                    }
                    if args.relax && !sym.is_imported {
                        // The relaxed sequence also swallows the call to
                        // __tls_get_addr, so consume the next relocation.
                        self.rel_types[i] = RelKind::TlsGdRelaxLe;
                        i += 1;
                    } else {
                        sym.set_flags(sym_flags::NEEDS_TLSGD | sym_flags::NEEDS_DYNSYM);
                        self.rel_types[i] = RelKind::TlsGd;
                    }
                }
                R_X86_64_TLSLD => {
                    if !next_is_plt32(self.rels, i) {
                        errors.report(error!(
                            "{}: TLSLD reloc not followed by PLT32",
                            self.display(file_display)
                        ));
                    }
                    if sym.is_imported {
                        errors.report(error!(
                            "{}: TLSLD reloc refers external symbol {}",
                            self.display(file_display),
                            sym.name_for_display()
                        ));
                    }
                    if args.relax {
                        self.rel_types[i] = RelKind::TlsLdRelaxLe;
                        i += 1;
                    } else {
                        sym.set_flags(sym_flags::NEEDS_TLSLD);
                        self.rel_types[i] = RelKind::TlsLd;
                    }
                }
                R_X86_64_DTPOFF32 | R_X86_64_DTPOFF64 => {
                    if sym.is_imported {
                        errors.report(error!(
                            "{}: DTPOFF reloc refers external symbol {}",
                            self.display(file_display),
                            sym.name_for_display()
                        ));
                    }
                    self.rel_types[i] = if args.relax {
                        RelKind::TpOff
                    } else {
                        RelKind::DtpOff
                    };
                }
                R_X86_64_TPOFF32 | R_X86_64_TPOFF64 => {
                    self.rel_types[i] = RelKind::TpOff;
                }
                R_X86_64_GOTTPOFF => {
                    sym.set_flags(sym_flags::NEEDS_GOTTPOFF);
                    self.rel_types[i] = RelKind::GotTpOff;
                }
                _ => {
                    errors.report(error!(
                        "{}: unknown relocation: {r_type}",
                        self.display(file_display)
                    ));
                }
            }
            i += 1;
        }
    }

    /// Copies the section into its output slice and applies relocations.
    /// `dynrel` is this section's pre-assigned slice of `.rela.dyn`.
    pub(crate) fn copy_buf(
        &self,
        ctx: &LinkContext,
        symbols: &[SymbolId],
        file_display: &str,
        base: &mut [u8],
        dynrel: &mut [u8],
        errors: &ErrorSink,
    ) {
        if self.shdr.is_nobits() || self.shdr.sh_size == 0 {
            return;
        }
        base[..self.contents.len()].copy_from_slice(self.contents);
        if self.shdr.is_alloc() {
            self.apply_reloc_alloc(ctx, symbols, file_display, base, dynrel, errors);
        } else {
            self.apply_reloc_nonalloc(ctx, symbols, file_display, base, errors);
        }
    }

    /// Applies relocations to a section that is mapped at runtime, using the
    /// kinds chosen by `scan_relocations`.
    fn apply_reloc_alloc(
        &self,
        ctx: &LinkContext,
        symbols: &[SymbolId],
        file_display: &str,
        base: &mut [u8],
        dynrel: &mut [u8],
        errors: &ErrorSink,
    ) {
        assert_eq!(self.rel_types.len(), self.rels.len());

        let mut ref_idx = 0;
        let mut dynrel = DynRelWriter { buf: dynrel };
        let section_addr = ctx.section_address(self);
        let got = ctx.got_base();

        let mut i = 0;
        while i < self.rels.len() {
            let rel = &self.rels[i];
            let r_type = rel.rel_type();
            let sym = ctx.db.symbol(symbols[rel.sym() as usize]);
            let frag_ref = self.fragment_ref(i, &mut ref_idx);

            if sym.file.is_none() && !sym.is_undef_weak {
                // Already reported by the scanner; leave the site alone.
                i += 1;
                continue;
            }

            let s = match frag_ref {
                Some(r) => ctx.fragment_address(r.frag),
                None => {
                    if sym.plt_idx.is_none() {
                        ctx.symbol_address(sym)
                    } else {
                        ctx.plt_address(sym)
                    }
                }
            };
            let a = frag_ref.map_or(rel.addend(), |r| r.addend) as u64;
            let p = section_addr + rel.offset();
            let loc = rel.offset() as usize;

            let patch = |base: &mut [u8], val: u64| {
                self.patch(base, r_type, loc, val, sym, file_display, errors);
            };

            match self.rel_types[i] {
                RelKind::None => {}
                RelKind::Abs => patch(base, s.wrapping_add(a)),
                RelKind::AbsDyn => {
                    patch(base, s.wrapping_add(a));
                    dynrel.push(p, R_X86_64_RELATIVE, 0, s.wrapping_add(a) as i64);
                }
                RelKind::Dyn => {
                    dynrel.push(p, R_X86_64_64, sym.dynsym_idx.unwrap_or(0), a as i64);
                }
                RelKind::Pc => patch(base, s.wrapping_add(a).wrapping_sub(p)),
                RelKind::Got => {
                    let g = ctx.got_entry_address(sym).wrapping_sub(got);
                    patch(base, g.wrapping_add(a));
                }
                RelKind::GotPc => patch(base, got.wrapping_add(a).wrapping_sub(p)),
                RelKind::GotPcRel => {
                    let g = ctx.got_entry_address(sym).wrapping_sub(got);
                    patch(base, g.wrapping_add(got).wrapping_add(a).wrapping_sub(p));
                }
                RelKind::TlsGd => {
                    patch(base, ctx.tlsgd_address(sym).wrapping_add(a).wrapping_sub(p));
                }
                RelKind::TlsGdRelaxLe => {
                    // mov %fs:0,%rax; lea x@tpoff(%rax),%rax replaces the
                    // 16 bytes starting 4 before the relocation site.
                    if loc < 4 || loc + 12 > base.len() {
                        errors.report(error!(
                            "{}: TLSGD relaxation site out of bounds",
                            self.display(file_display)
                        ));
                    } else {
                        base[loc - 4..loc + 12].copy_from_slice(&TLSGD_TO_LE);
                        let val = ctx
                            .symbol_address(sym)
                            .wrapping_sub(ctx.layout.tls_end)
                            .wrapping_add(a)
                            .wrapping_add(4);
                        base[loc + 8..loc + 12].copy_from_slice(&(val as u32).to_le_bytes());
                    }
                    // The PLT32 for __tls_get_addr was consumed by the scanner.
                    i += 1;
                }
                RelKind::TlsLd => {
                    patch(base, ctx.tlsld_address().wrapping_add(a).wrapping_sub(p));
                }
                RelKind::TlsLdRelaxLe => {
                    if loc < 3 || loc + 9 > base.len() {
                        errors.report(error!(
                            "{}: TLSLD relaxation site out of bounds",
                            self.display(file_display)
                        ));
                    } else {
                        base[loc - 3..loc + 9].copy_from_slice(&TLSLD_TO_LE);
                    }
                    i += 1;
                }
                RelKind::DtpOff => {
                    patch(base, s.wrapping_add(a).wrapping_sub(ctx.layout.tls_begin));
                }
                RelKind::TpOff => {
                    patch(base, s.wrapping_add(a).wrapping_sub(ctx.layout.tls_end));
                }
                RelKind::GotTpOff => {
                    patch(
                        base,
                        ctx.gottpoff_address(sym).wrapping_add(a).wrapping_sub(p),
                    );
                }
            }
            i += 1;
        }
    }

    /// Applies relocations to a section that isn't mapped at runtime
    /// (mostly debug info). Such sections never need PLT or GOT entries, so
    /// only the absolute kinds and DTPOFF64 are legal here. These sections
    /// aren't scanned, so we dispatch on the wire-level type.
    fn apply_reloc_nonalloc(
        &self,
        ctx: &LinkContext,
        symbols: &[SymbolId],
        file_display: &str,
        base: &mut [u8],
        errors: &ErrorSink,
    ) {
        let mut ref_idx = 0;

        for (i, rel) in self.rels.iter().enumerate() {
            let r_type = rel.rel_type();
            let sym = ctx.db.symbol(symbols[rel.sym() as usize]);

            if sym.file.is_none() || sym.is_placeholder {
                errors.report(error!(
                    "undefined symbol: {file_display}: {}",
                    sym.name_for_display()
                ));
                continue;
            }

            let frag_ref = self.fragment_ref(i, &mut ref_idx);
            let loc = rel.offset() as usize;

            match r_type {
                R_X86_64_NONE => {}
                R_X86_64_8 | R_X86_64_16 | R_X86_64_32 | R_X86_64_32S | R_X86_64_64 => {
                    let val = match frag_ref {
                        Some(r) => ctx.fragment_address(r.frag),
                        None => ctx.symbol_address(sym),
                    };
                    self.patch(base, r_type, loc, val, sym, file_display, errors);
                }
                R_X86_64_DTPOFF64 => {
                    let val = ctx
                        .symbol_address(sym)
                        .wrapping_add(rel.addend() as u64)
                        .wrapping_sub(ctx.layout.tls_begin);
                    self.patch(base, r_type, loc, val, sym, file_display, errors);
                }
                R_X86_64_PC8 | R_X86_64_PC16 | R_X86_64_PC32 | R_X86_64_PC64
                | R_X86_64_GOT32 | R_X86_64_GOTPC32 | R_X86_64_GOTPCREL | R_X86_64_GOTPCRELX
                | R_X86_64_REX_GOTPCRELX | R_X86_64_PLT32 | R_X86_64_TLSGD | R_X86_64_TLSLD
                | R_X86_64_DTPOFF32 | R_X86_64_TPOFF32 | R_X86_64_TPOFF64
                | R_X86_64_GOTTPOFF => {
                    errors.report(error!(
                        "{}: invalid relocation for non-allocated sections: {r_type}",
                        self.display(file_display)
                    ));
                }
                _ => {
                    errors.report(error!(
                        "{}: unknown relocation: {r_type}",
                        self.display(file_display)
                    ));
                }
            }
        }
    }

    /// Range-checks and writes one relocation value. A range violation is
    /// reported but the (truncated) write still happens; the link fails at
    /// the end.
    fn patch(
        &self,
        base: &mut [u8],
        r_type: u32,
        loc: usize,
        val: u64,
        sym: &Symbol,
        file_display: &str,
        errors: &ErrorSink,
    ) {
        if loc + write_width(r_type) > base.len() {
            errors.report(error!(
                "{}: relocation offset {loc:#x} out of bounds",
                self.display(file_display)
            ));
            return;
        }
        if let Some(violation) = check_range(r_type, val) {
            errors.report(error!(
                "{}: relocation {} against {} out of range: {violation}",
                self.display(file_display),
                rel_type_to_string(r_type),
                sym.name_for_display()
            ));
        }
        write_val(r_type, &mut base[loc..], val);
    }
}

fn abs_import_flags(is_code: bool) -> u8 {
    if is_code {
        sym_flags::NEEDS_PLT
    } else {
        sym_flags::NEEDS_COPYREL
    }
}

fn next_is_plt32(rels: &[Rela], i: usize) -> bool {
    rels.get(i + 1)
        .is_some_and(|next| next.rel_type() == R_X86_64_PLT32)
}

/// Writes dynamic relocation records into a pre-assigned `.rela.dyn` slice.
struct DynRelWriter<'a> {
    buf: &'a mut [u8],
}

impl DynRelWriter<'_> {
    fn push(&mut self, offset: u64, r_type: u32, sym: u32, addend: i64) {
        let rela = elf::make_rela(offset, r_type, sym, addend);
        let taken = std::mem::take(&mut self.buf);
        assert!(
            taken.len() as u64 >= elf::RELA_ENTRY_SIZE,
            "dynamic relocation slice exhausted"
        );
        let (head, rest) = taken.split_at_mut(elf::RELA_ENTRY_SIZE as usize);
        head.copy_from_slice(object::bytes_of(&rela));
        self.buf = rest;
    }
}

/// Scans every live file's relocations in parallel. Each file accumulates
/// its own dynamic relocation count.
pub(crate) fn scan_all_relocations(
    files: &mut [ObjectFile],
    db: &SymbolDb,
    args: &Args,
    errors: &ErrorSink,
) {
    files.par_iter_mut().for_each(|file| {
        if !file.alive() || file.is_dso {
            return;
        }
        let display = file.display_name();
        let ObjectFile {
            sections,
            symbols,
            num_dynrel,
            ..
        } = file;
        for slot in sections.iter_mut() {
            if let Some(isec) = slot.as_loaded_mut() {
                isec.scan_relocations(&display, symbols, db, args, num_dynrel, errors);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::make_rela;
    use crate::test_util::LinkHarness;
    use crate::test_util::TestFileBuilder;
    use object::elf::*;

    fn tls_flags() -> u64 {
        crate::elf::shf::ALLOC | crate::elf::shf::WRITE | crate::elf::shf::TLS
    }

    #[test]
    fn scan_fills_one_kind_per_relocation() {
        let rels = vec![
            make_rela(0, R_X86_64_64, 1, 0),
            make_rela(8, R_X86_64_PC32, 1, -4),
            make_rela(12, R_X86_64_GOTPCREL, 1, -4),
        ];
        let files = vec![
            TestFileBuilder::new("a.o")
                .text_section(".text", &[0u8; 16])
                .data_section(".data", &[0u8; 8])
                .global(b"x", STB_GLOBAL, STT_OBJECT, 2, 0)
                .rels_for_section(1, rels)
                .build(0),
        ];
        let harness = LinkHarness::run(files, Args::default());
        let isec = harness.files[0].section(1).unwrap();
        assert_eq!(isec.rel_types.len(), isec.rels.len());
        assert_eq!(
            isec.rel_types,
            vec![RelKind::Abs, RelKind::Pc, RelKind::GotPcRel]
        );
        let x = harness.db.symbol(harness.db.lookup_global(b"x").unwrap());
        assert!(x.got_idx.is_some());
        assert_eq!(harness.errors.error_count(), 0);
    }

    #[test]
    fn pie_forbids_narrow_absolute_against_relative_symbols() {
        let rels = vec![make_rela(0, R_X86_64_32, 1, 0)];
        let files = vec![
            TestFileBuilder::new("a.o")
                .text_section(".text", &[0u8; 8])
                .global(b"f", STB_GLOBAL, STT_FUNC, 1, 0)
                .rels_for_section(1, rels)
                .build(0),
        ];
        let args = Args {
            pie: true,
            ..Args::default()
        };
        let harness = LinkHarness::run(files, args);
        assert_eq!(harness.errors.error_count(), 1);
        // Classification still completes.
        let isec = harness.files[0].section(1).unwrap();
        assert_eq!(isec.rel_types[0], RelKind::Abs);
    }

    #[test]
    fn pie_wide_absolute_in_writable_section_becomes_dynamic() {
        let rels = vec![make_rela(0, R_X86_64_64, 1, 4)];
        let files = vec![
            TestFileBuilder::new("a.o")
                .data_section(".data", &[0u8; 8])
                .global(b"x", STB_GLOBAL, STT_OBJECT, 1, 0)
                .rels_for_section(1, rels)
                .build(0),
        ];
        let args = Args {
            pie: true,
            ..Args::default()
        };
        let harness = LinkHarness::run(files, args);
        assert_eq!(harness.errors.error_count(), 0);
        assert_eq!(harness.files[0].num_dynrel, 1);
        let isec = harness.files[0].section(1).unwrap();
        assert_eq!(isec.rel_types[0], RelKind::AbsDyn);

        // The site gets the link-time value and a RELATIVE record points the
        // runtime at the same place.
        let (bytes, dynrel) = harness.apply_section(0, 1);
        let ctx = harness.ctx();
        let x = harness.db.symbol(harness.db.lookup_global(b"x").unwrap());
        let expected = ctx.symbol_address(x) + 4;
        assert_eq!(u64::from_le_bytes(bytes[..8].try_into().unwrap()), expected);

        assert_eq!(dynrel.len(), 24);
        let r_offset = u64::from_le_bytes(dynrel[0..8].try_into().unwrap());
        let r_info = u64::from_le_bytes(dynrel[8..16].try_into().unwrap());
        let r_addend = i64::from_le_bytes(dynrel[16..24].try_into().unwrap());
        assert_eq!(r_info, u64::from(R_X86_64_RELATIVE));
        assert_eq!(r_addend, expected as i64);
        let isec = harness.files[0].section(1).unwrap();
        assert_eq!(r_offset, ctx.section_address(isec));
    }

    #[test]
    fn pie_wide_absolute_in_readonly_section_is_an_error() {
        let rels = vec![make_rela(0, R_X86_64_64, 1, 0)];
        let files = vec![
            TestFileBuilder::new("a.o")
                .section(
                    ".rodata",
                    SHT_PROGBITS,
                    crate::elf::shf::ALLOC,
                    &[0u8; 8],
                    1,
                    0,
                )
                .global(b"x", STB_GLOBAL, STT_OBJECT, 1, 0)
                .rels_for_section(1, rels)
                .build(0),
        ];
        let args = Args {
            pie: true,
            ..Args::default()
        };
        let harness = LinkHarness::run(files, args);
        assert_eq!(harness.errors.error_count(), 1);
    }

    #[test]
    fn pc_relative_formula() {
        let rels = vec![make_rela(4, R_X86_64_PC32, 1, -4)];
        let files = vec![
            TestFileBuilder::new("a.o")
                .text_section(".text", &[0u8; 8])
                .data_section(".data", &[0u8; 8])
                .global(b"x", STB_GLOBAL, STT_OBJECT, 2, 0)
                .rels_for_section(1, rels)
                .build(0),
        ];
        let harness = LinkHarness::run(files, Args::default());
        let (bytes, _) = harness.apply_section(0, 1);
        let ctx = harness.ctx();
        let x = harness.db.symbol(harness.db.lookup_global(b"x").unwrap());
        let isec = harness.files[0].section(1).unwrap();
        let p = ctx.section_address(isec) + 4;
        let expected = ctx.symbol_address(x).wrapping_sub(4).wrapping_sub(p);
        assert_eq!(
            u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            expected as u32
        );
    }

    #[test]
    fn gotpcrel_points_at_the_got_entry() {
        let rels = vec![make_rela(0, R_X86_64_GOTPCREL, 1, -4)];
        let files = vec![
            TestFileBuilder::new("a.o")
                .text_section(".text", &[0u8; 8])
                .data_section(".data", &[0u8; 8])
                .global(b"x", STB_GLOBAL, STT_OBJECT, 2, 0)
                .rels_for_section(1, rels)
                .build(0),
        ];
        let harness = LinkHarness::run(files, Args::default());
        let (bytes, _) = harness.apply_section(0, 1);
        let ctx = harness.ctx();
        let x = harness.db.symbol(harness.db.lookup_global(b"x").unwrap());
        let isec = harness.files[0].section(1).unwrap();
        let p = ctx.section_address(isec);
        // G + GOT + A - P collapses to the entry's absolute address - 4 - P.
        let expected = ctx.got_entry_address(x).wrapping_sub(4).wrapping_sub(p);
        assert_eq!(
            u32::from_le_bytes(bytes[..4].try_into().unwrap()),
            expected as u32
        );
    }

    #[test]
    fn narrow_overflow_is_reported_but_still_written() {
        let rels = vec![make_rela(0, R_X86_64_8, 1, 0)];
        let files = vec![
            TestFileBuilder::new("a.o")
                .text_section(".text", &[0u8; 4])
                // An absolute symbol whose value doesn't fit in 8 bits.
                .global(b"big", STB_GLOBAL, STT_OBJECT, SHN_ABS, 256)
                .rels_for_section(1, rels)
                .build(0),
        ];
        let harness = LinkHarness::run(files, Args::default());
        let (bytes, _) = harness.apply_section(0, 1);
        // 256 truncates to 0 on write; the error marks the link failed.
        assert_eq!(bytes[0], 0);
        assert_eq!(harness.errors.error_count(), 1);
        assert!(harness.errors.finish().is_err());
    }

    #[test]
    fn tlsgd_relaxes_to_local_exec() {
        // Instruction bytes around the TLSGD site; the relaxed sequence
        // replaces 16 bytes starting 4 before the relocation offset.
        let text = [0x90u8; 24];
        let rels = vec![
            make_rela(8, R_X86_64_TLSGD, 1, -4),
            make_rela(14, R_X86_64_PLT32, 1, -4),
        ];
        let files = vec![
            TestFileBuilder::new("a.o")
                .text_section(".text", &text)
                .section(".tdata", SHT_PROGBITS, tls_flags(), &[0u8; 8], 8, 0)
                .global(b"t", STB_GLOBAL, STT_TLS, 2, 0)
                .rels_for_section(1, rels)
                .build(0),
        ];
        let harness = LinkHarness::run(files, Args::default());
        assert_eq!(harness.errors.error_count(), 0);

        let isec = harness.files[0].section(1).unwrap();
        assert_eq!(isec.rel_types[0], RelKind::TlsGdRelaxLe);
        // The PLT32 for __tls_get_addr was consumed.
        assert_eq!(isec.rel_types[1], RelKind::None);
        let t = harness.db.symbol(harness.db.lookup_global(b"t").unwrap());
        assert!(!t.has_flag(sym_flags::NEEDS_TLSGD));

        let (bytes, _) = harness.apply_section(0, 1);
        assert_eq!(&bytes[4..16], &TLSGD_TO_LE[..12]);
        let imm = u32::from_le_bytes(bytes[16..20].try_into().unwrap());
        let ctx = harness.ctx();
        let expected = ctx
            .symbol_address(t)
            .wrapping_sub(harness.layout.tls_end)
            .wrapping_sub(4)
            .wrapping_add(4);
        assert_eq!(imm, expected as u32);
        // Bytes outside the rewritten window are untouched.
        assert_eq!(bytes[3], 0x90);
        assert_eq!(bytes[20], 0x90);
    }

    #[test]
    fn tlsld_relaxes_to_local_exec() {
        let text = [0x90u8; 24];
        let rels = vec![
            make_rela(8, R_X86_64_TLSLD, 1, -4),
            make_rela(14, R_X86_64_PLT32, 1, -4),
        ];
        let files = vec![
            TestFileBuilder::new("a.o")
                .text_section(".text", &text)
                .section(".tdata", SHT_PROGBITS, tls_flags(), &[0u8; 8], 8, 0)
                .global(b"t", STB_GLOBAL, STT_TLS, 2, 0)
                .rels_for_section(1, rels)
                .build(0),
        ];
        let harness = LinkHarness::run(files, Args::default());
        let isec = harness.files[0].section(1).unwrap();
        assert_eq!(isec.rel_types[0], RelKind::TlsLdRelaxLe);
        let (bytes, _) = harness.apply_section(0, 1);
        assert_eq!(&bytes[5..17], &TLSLD_TO_LE);
    }

    #[test]
    fn tlsgd_without_following_plt32_is_an_error() {
        let rels = vec![make_rela(8, R_X86_64_TLSGD, 1, -4)];
        let files = vec![
            TestFileBuilder::new("a.o")
                .text_section(".text", &[0x90; 16])
                .section(".tdata", SHT_PROGBITS, tls_flags(), &[0u8; 8], 8, 0)
                .global(b"t", STB_GLOBAL, STT_TLS, 2, 0)
                .rels_for_section(1, rels)
                .build(0),
        ];
        let harness = LinkHarness::run(files, Args::default());
        assert_eq!(harness.errors.error_count(), 1);
    }

    #[test]
    fn dtpoff_relaxes_to_tpoff() {
        let rels = vec![make_rela(0, R_X86_64_DTPOFF32, 1, 0)];
        let build = || {
            vec![
                TestFileBuilder::new("a.o")
                    .text_section(".text", &[0u8; 8])
                    .section(".tdata", SHT_PROGBITS, tls_flags(), &[0u8; 16], 8, 0)
                    .global(b"t", STB_GLOBAL, STT_TLS, 2, 8)
                    .rels_for_section(1, vec![rels[0]])
                    .build(0),
            ]
        };

        let relaxed = LinkHarness::run(build(), Args::default());
        let isec = relaxed.files[0].section(1).unwrap();
        assert_eq!(isec.rel_types[0], RelKind::TpOff);

        let args = Args {
            relax: false,
            ..Args::default()
        };
        let kept = LinkHarness::run(build(), args);
        let isec = kept.files[0].section(1).unwrap();
        assert_eq!(isec.rel_types[0], RelKind::DtpOff);

        // DTPOFF is relative to the start of the TLS block; `t` sits 8 bytes
        // into it.
        let (bytes, _) = kept.apply_section(0, 1);
        assert_eq!(u32::from_le_bytes(bytes[..4].try_into().unwrap()), 8);
    }

    #[test]
    fn undefined_symbol_is_reported_and_scanning_continues() {
        let rels = vec![
            make_rela(0, R_X86_64_PC32, 1, -4),
            make_rela(4, R_X86_64_PC32, 2, -4),
        ];
        let files = vec![
            TestFileBuilder::new("a.o")
                .text_section(".text", &[0u8; 8])
                .global_raw(b"missing", STB_GLOBAL, STT_FUNC, SHN_UNDEF, 0, 0)
                .global(b"present", STB_GLOBAL, STT_FUNC, 1, 0)
                .rels_for_section(1, rels)
                .build(0),
        ];
        let harness = LinkHarness::run(files, Args::default());
        assert_eq!(harness.errors.error_count(), 1);
        let isec = harness.files[0].section(1).unwrap();
        assert_eq!(isec.rel_types[1], RelKind::Pc);
    }

    #[test]
    fn nonalloc_sections_reject_pc_relative_relocations() {
        let rels = vec![
            make_rela(0, R_X86_64_64, 1, 0),
            make_rela(8, R_X86_64_PC32, 1, -4),
        ];
        let files = vec![
            TestFileBuilder::new("a.o")
                .section(".debug_info", SHT_PROGBITS, 0, &[0u8; 16], 1, 0)
                .data_section(".data", &[0u8; 8])
                .global(b"x", STB_GLOBAL, STT_OBJECT, 2, 0)
                .rels_for_section(1, rels)
                .build(0),
        ];
        let harness = LinkHarness::run(files, Args::default());
        // Non-ALLOC sections aren't scanned, so the error surfaces at apply.
        assert_eq!(harness.errors.error_count(), 0);
        let (bytes, _) = harness.apply_section(0, 1);
        assert_eq!(harness.errors.error_count(), 1);

        // The absolute relocation was still applied (symbol address, no
        // addend in the non-alloc path).
        let ctx = harness.ctx();
        let x = harness.db.symbol(harness.db.lookup_global(b"x").unwrap());
        assert_eq!(
            u64::from_le_bytes(bytes[..8].try_into().unwrap()),
            ctx.symbol_address(x)
        );
    }

    #[test]
    fn imported_data_symbol_demands_a_copy_relocation() {
        // A DSO-defined object referenced by an absolute relocation.
        let mut dso = TestFileBuilder::new("libx.so")
            .data_section(".data", &[0u8; 8])
            .global_raw(b"shared", STB_GLOBAL, STT_OBJECT, 1, 0, 8)
            .build(1);
        dso.is_dso = true;
        let files = vec![
            TestFileBuilder::new("main.o")
                .text_section(".text", &[0u8; 8])
                .global_raw(b"shared", STB_GLOBAL, STT_OBJECT, SHN_UNDEF, 0, 0)
                .rels_for_section(1, vec![make_rela(0, R_X86_64_64, 1, 0)])
                .build(0),
            dso,
        ];
        let harness = LinkHarness::run(files, Args::default());
        let shared = harness
            .db
            .symbol(harness.db.lookup_global(b"shared").unwrap());
        assert!(shared.is_imported);
        assert!(shared.has_flag(sym_flags::NEEDS_COPYREL));
        assert!(shared.copyrel_offset.is_some());
    }
}
