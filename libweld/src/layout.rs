//! Decides where everything goes in the output: section placement and
//! addresses, GOT/PLT/TLS slot allocation from the scanner's demand flags,
//! dynamic relocation area partitioning, symbol table sizing. After this
//! phase, every address the relocation applier asks for is fixed.

use crate::args::Args;
use crate::elf;
use crate::elf::shf;
use crate::elf_x86_64::PLT_ENTRY_SIZE;
use crate::error::Result;
use crate::input_section::InputSection;
use crate::merge_strings::FragmentId;
use crate::merge_strings::MergedSections;
use crate::object_file::ObjectFile;
use crate::object_file::SectionSlot;
use crate::output_section::OutputSectionId;
use crate::output_section::OutputSections;
use crate::symbol::Symbol;
use crate::symbol::sym_flags;
use crate::symbol_db::SymbolDb;
use itertools::Itertools;
use object::LittleEndian;

pub(crate) const IMAGE_BASE: u64 = 0x200000;
const PAGE_SIZE: u64 = 0x1000;
const GOT_ENTRY_SIZE: u64 = 8;

pub(crate) const EHDR_SIZE: u64 = core::mem::size_of::<elf::FileHeader>() as u64;
pub(crate) const PHDR_SIZE: u64 = core::mem::size_of::<elf::ProgramHeader>() as u64;
pub(crate) const SHDR_SIZE: u64 = core::mem::size_of::<elf::SectionHeader>() as u64;

pub(crate) struct Layout {
    pub(crate) tls_begin: u64,
    pub(crate) tls_end: u64,

    pub(crate) got: OutputSectionId,
    pub(crate) plt: OutputSectionId,
    pub(crate) reldyn: OutputSectionId,
    pub(crate) bss: OutputSectionId,
    pub(crate) symtab: OutputSectionId,
    pub(crate) strtab: OutputSectionId,
    pub(crate) shstrtab: OutputSectionId,

    /// GOT slot index where the PLT's slots begin.
    pub(crate) plt_got_start: u32,
    pub(crate) num_plt_entries: u32,
    pub(crate) tlsld_got_idx: Option<u32>,
    pub(crate) num_dynrel_total: u32,

    /// Offset within `.bss` where copy-relocated symbols start.
    pub(crate) copyrel_base: u64,

    pub(crate) num_local_symtab: u32,

    pub(crate) segments: Vec<Segment>,
    pub(crate) shdr_offset: u64,
    pub(crate) num_shdrs: u32,
    pub(crate) file_size: u64,
}

pub(crate) struct Segment {
    pub(crate) p_type: u32,
    pub(crate) p_flags: u32,
    pub(crate) addr: u64,
    pub(crate) file_offset: u64,
    pub(crate) file_size: u64,
    pub(crate) mem_size: u64,
    pub(crate) align: u64,
}

/// Read-only bundle handed to the relocation applier and the writer once
/// layout has frozen all addresses.
pub(crate) struct LinkContext<'a, 'data> {
    pub(crate) args: &'a Args,
    pub(crate) files: &'a [ObjectFile<'data>],
    pub(crate) db: &'a SymbolDb<'data>,
    pub(crate) merged: &'a MergedSections<'data>,
    pub(crate) output_sections: &'a OutputSections<'data>,
    pub(crate) layout: &'a Layout,
}

impl LinkContext<'_, '_> {
    pub(crate) fn section_address(&self, isec: &InputSection) -> u64 {
        self.output_sections.get(isec.output_section).addr + isec.offset
    }

    pub(crate) fn fragment_address(&self, frag: FragmentId) -> u64 {
        let msec = &self.merged.sections[frag.section as usize];
        self.output_sections.get(msec.output_section).addr + self.merged.fragment(frag).offset
    }

    /// The symbol's resolved runtime address. Folded sections never show up
    /// here: ICF rewrote every symbol to its leader before addresses were
    /// assigned.
    pub(crate) fn symbol_address(&self, sym: &Symbol) -> u64 {
        if let Some(frag) = sym.frag {
            return self.fragment_address(frag) + sym.value;
        }
        if let Some(offset) = sym.copyrel_offset {
            return self.output_sections.get(self.layout.bss).addr
                + self.layout.copyrel_base
                + offset;
        }
        match sym.input_section {
            Some(section) => {
                let file = &self.files[section.file.as_usize()];
                match file.slot(section.index) {
                    SectionSlot::Loaded(isec) => self.section_address(isec) + sym.value,
                    SectionSlot::MergeStrings(msec) => {
                        let parent = &self.merged.sections[msec.parent as usize];
                        self.output_sections.get(parent.output_section).addr + sym.value
                    }
                    _ => 0,
                }
            }
            // Absolute or undefined-weak.
            None => sym.value,
        }
    }

    pub(crate) fn got_base(&self) -> u64 {
        self.output_sections.get(self.layout.got).addr
    }

    pub(crate) fn got_entry_address(&self, sym: &Symbol) -> u64 {
        self.got_base() + u64::from(sym.got_idx.unwrap_or(0)) * GOT_ENTRY_SIZE
    }

    pub(crate) fn tlsgd_address(&self, sym: &Symbol) -> u64 {
        self.got_base() + u64::from(sym.tlsgd_idx.unwrap_or(0)) * GOT_ENTRY_SIZE
    }

    pub(crate) fn gottpoff_address(&self, sym: &Symbol) -> u64 {
        self.got_base() + u64::from(sym.gottpoff_idx.unwrap_or(0)) * GOT_ENTRY_SIZE
    }

    pub(crate) fn tlsld_address(&self) -> u64 {
        self.got_base() + u64::from(self.layout.tlsld_got_idx.unwrap_or(0)) * GOT_ENTRY_SIZE
    }

    /// The GOT slot backing a PLT entry.
    pub(crate) fn plt_got_address(&self, plt_idx: u32) -> u64 {
        self.got_base() + u64::from(self.layout.plt_got_start + plt_idx) * GOT_ENTRY_SIZE
    }

    pub(crate) fn plt_address(&self, sym: &Symbol) -> u64 {
        let plt_base = self.output_sections.get(self.layout.plt).addr;
        plt_base + (u64::from(sym.plt_idx.unwrap_or(0)) + 1) * PLT_ENTRY_SIZE
    }
}

pub(crate) fn align_to(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

pub(crate) fn compute<'data>(
    files: &mut [ObjectFile<'data>],
    db: &mut SymbolDb<'data>,
    merged: &mut MergedSections<'data>,
    output_sections: &mut OutputSections<'data>,
) -> Result<Layout> {
    let _span = tracing::info_span!("layout").entered();

    assign_fragment_offsets(merged, output_sections);
    place_input_sections(files, output_sections);
    let slots = allocate_demanded_slots(files, db);
    let num_dynrel_total = assign_reldyn_offsets(files);

    // Synthetic sections.
    let got =
        output_sections.get_instance(b".got", object::elf::SHT_PROGBITS, shf::ALLOC | shf::WRITE);
    let plt = output_sections.get_instance(
        b".plt",
        object::elf::SHT_PROGBITS,
        shf::ALLOC | shf::EXECINSTR,
    );
    let reldyn = output_sections.get_instance(b".rela.dyn", object::elf::SHT_RELA, shf::ALLOC);
    let bss =
        output_sections.get_instance(b".bss", object::elf::SHT_NOBITS, shf::ALLOC | shf::WRITE);
    let symtab = output_sections.get_instance(b".symtab", object::elf::SHT_SYMTAB, 0);
    let strtab = output_sections.get_instance(b".strtab", object::elf::SHT_STRTAB, 0);
    let shstrtab = output_sections.get_instance(b".shstrtab", object::elf::SHT_STRTAB, 0);

    {
        let osec = output_sections.get_mut(got);
        osec.size = u64::from(slots.num_got_slots) * GOT_ENTRY_SIZE;
        osec.alignment = osec.alignment.max(8);
    }
    {
        let osec = output_sections.get_mut(plt);
        osec.size = if slots.num_plt_entries == 0 {
            0
        } else {
            (u64::from(slots.num_plt_entries) + 1) * PLT_ENTRY_SIZE
        };
        osec.alignment = osec.alignment.max(16);
    }
    {
        let osec = output_sections.get_mut(reldyn);
        osec.size = u64::from(num_dynrel_total) * elf::RELA_ENTRY_SIZE;
        osec.alignment = osec.alignment.max(8);
    }
    let copyrel_base = {
        let osec = output_sections.get_mut(bss);
        let base = align_to(osec.size, 8);
        osec.size = base + slots.copyrel_size;
        osec.alignment = osec.alignment.max(8);
        base
    };

    let symtab_sizes = compute_symtab(files, db);
    {
        let osec = output_sections.get_mut(symtab);
        osec.size = u64::from(symtab_sizes.num_entries) * elf::SYMTAB_ENTRY_SIZE;
        osec.alignment = 8;
    }
    output_sections.get_mut(strtab).size = symtab_sizes.strtab_size;
    output_sections.get_mut(shstrtab).size = shstrtab_size(output_sections);

    let addressed = assign_addresses(output_sections);

    Ok(Layout {
        tls_begin: addressed.tls_begin,
        tls_end: addressed.tls_end,
        got,
        plt,
        reldyn,
        bss,
        symtab,
        strtab,
        shstrtab,
        plt_got_start: slots.plt_got_start,
        num_plt_entries: slots.num_plt_entries,
        tlsld_got_idx: slots.tlsld_got_idx,
        num_dynrel_total,
        copyrel_base,
        num_local_symtab: symtab_sizes.num_locals,
        segments: addressed.segments,
        shdr_offset: addressed.shdr_offset,
        num_shdrs: addressed.num_shdrs,
        file_size: addressed.file_size,
    })
}

/// Orders fragments deterministically (by content) and assigns their
/// offsets within the merged output sections.
fn assign_fragment_offsets(merged: &mut MergedSections, output_sections: &mut OutputSections) {
    for msec in &mut merged.sections {
        let ids = msec
            .frags
            .iter()
            .map(|(id, frag)| (frag.data, id))
            .sorted()
            .collect_vec();
        let mut offset = 0u64;
        let mut max_align = 1u64;
        for (_, id) in ids {
            let frag = msec.frags.get_mut(id);
            let align = u64::from(frag.alignment.max(1));
            offset = align_to(offset, align);
            frag.offset = offset;
            offset += frag.data.len() as u64;
            max_align = max_align.max(align);
        }
        let osec = output_sections.get_mut(msec.output_section);
        osec.size = offset;
        osec.alignment = osec.alignment.max(max_align);
    }
}

/// Walks files in priority order, giving every live loaded section its
/// offset within its output section.
fn place_input_sections(files: &mut [ObjectFile], output_sections: &mut OutputSections) {
    for file in files.iter_mut() {
        if !file.alive() || file.is_dso {
            continue;
        }
        for slot in &mut file.sections {
            let Some(isec) = slot.as_loaded_mut() else {
                continue;
            };
            let osec = output_sections.get_mut(isec.output_section);
            isec.offset = align_to(osec.size, isec.shdr.sh_addralign);
            osec.size = isec.offset + isec.shdr.sh_size;
            osec.alignment = osec.alignment.max(isec.shdr.sh_addralign);
        }
    }
}

struct SlotCounts {
    num_got_slots: u32,
    plt_got_start: u32,
    num_plt_entries: u32,
    tlsld_got_idx: Option<u32>,
    copyrel_size: u64,
}

/// Turns the scanner's demand flags into concrete GOT/PLT/TLS slot indices.
/// Symbols are visited in id order, which is deterministic.
fn allocate_demanded_slots(files: &[ObjectFile], db: &mut SymbolDb) -> SlotCounts {
    let e = LittleEndian;
    let mut next_got = 0u32;
    let mut next_plt = 0u32;
    let mut next_dynsym = 1u32;
    let mut copyrel_size = 0u64;
    let mut any_tlsld = false;

    for sym in db.symbols_mut() {
        let flags = sym.flags.load(std::sync::atomic::Ordering::Relaxed);
        if flags == 0 {
            continue;
        }
        if flags & sym_flags::NEEDS_GOT != 0 {
            sym.got_idx = Some(next_got);
            next_got += 1;
        }
        if flags & sym_flags::NEEDS_GOTTPOFF != 0 {
            sym.gottpoff_idx = Some(next_got);
            next_got += 1;
        }
        if flags & sym_flags::NEEDS_TLSGD != 0 {
            // A module id / offset pair.
            sym.tlsgd_idx = Some(next_got);
            next_got += 2;
        }
        if flags & sym_flags::NEEDS_TLSLD != 0 {
            any_tlsld = true;
        }
        if flags & sym_flags::NEEDS_PLT != 0 {
            sym.plt_idx = Some(next_plt);
            next_plt += 1;
        }
        if flags & sym_flags::NEEDS_DYNSYM != 0 {
            sym.dynsym_idx = Some(next_dynsym);
            next_dynsym += 1;
        }
        if flags & sym_flags::NEEDS_COPYREL != 0 && sym.is_imported {
            let size = sym
                .file
                .and_then(|f| {
                    files[f.as_usize()]
                        .esyms
                        .get(sym.esym_index as usize)
                        .map(|esym| esym.st_size.get(e))
                })
                .unwrap_or(0)
                .max(1);
            let offset = align_to(copyrel_size, 8);
            sym.copyrel_offset = Some(offset);
            copyrel_size = offset + size;
        }
    }

    let tlsld_got_idx = any_tlsld.then(|| {
        let idx = next_got;
        next_got += 2;
        idx
    });

    // The PLT's GOT slots follow all regular entries.
    let plt_got_start = next_got;
    next_got += next_plt;

    SlotCounts {
        num_got_slots: next_got,
        plt_got_start,
        num_plt_entries: next_plt,
        tlsld_got_idx,
        copyrel_size,
    }
}

/// Partitions `.rela.dyn` between files by prefix sum over their dynamic
/// relocation counts.
fn assign_reldyn_offsets(files: &mut [ObjectFile]) -> u32 {
    let mut total = 0u32;
    for file in files.iter_mut() {
        file.reldyn_file_offset = u64::from(total) * elf::RELA_ENTRY_SIZE;
        total += file.num_dynrel;
    }
    total
}

struct SymtabSizes {
    num_locals: u32,
    num_entries: u32,
    strtab_size: u64,
}

/// Sizes `.symtab`/`.strtab` and records each file's slice of both. All
/// locals precede all globals, as sh_info requires.
fn compute_symtab(files: &mut [ObjectFile], db: &SymbolDb) -> SymtabSizes {
    for file in files.iter_mut() {
        if !file.alive() || file.is_dso {
            continue;
        }
        let mut num_local = 0u32;
        let mut local_str = 0u32;
        let mut num_global = 0u32;
        let mut global_str = 0u32;
        for i in 1..file.esyms.len() {
            let sym = db.symbol(file.symbols[i]);
            if sym.st_type == object::elf::STT_SECTION || sym.file != Some(file.file_id) {
                continue;
            }
            if i < file.first_global {
                num_local += 1;
                local_str += sym.name.len() as u32 + 1;
            } else if sym.esym_index as usize == i {
                num_global += 1;
                global_str += sym.name.len() as u32 + 1;
            }
        }
        file.num_local_symtab = num_local;
        file.local_strtab_size = local_str;
        file.num_global_symtab = num_global;
        file.global_strtab_size = global_str;
    }

    // Locals first (after the null entry), then globals. The string table
    // starts with a null byte.
    let mut symtab_cursor = 1u32;
    let mut strtab_cursor = 1u64;
    for file in files.iter_mut() {
        file.local_symtab_offset = u64::from(symtab_cursor) * elf::SYMTAB_ENTRY_SIZE;
        file.local_strtab_offset = strtab_cursor;
        symtab_cursor += file.num_local_symtab;
        strtab_cursor += u64::from(file.local_strtab_size);
    }
    let num_locals = symtab_cursor;
    for file in files.iter_mut() {
        file.global_symtab_offset = u64::from(symtab_cursor) * elf::SYMTAB_ENTRY_SIZE;
        file.global_strtab_offset = strtab_cursor;
        symtab_cursor += file.num_global_symtab;
        strtab_cursor += u64::from(file.global_strtab_size);
    }

    SymtabSizes {
        num_locals,
        num_entries: symtab_cursor,
        strtab_size: strtab_cursor,
    }
}

fn shstrtab_size(output_sections: &OutputSections) -> u64 {
    1 + output_sections
        .ids()
        .map(|id| output_sections.get(id).name.len() as u64 + 1)
        .sum::<u64>()
}

/// Protection-group rank. Sections are laid out by ascending rank; a page
/// boundary separates groups so each can get its own PT_LOAD.
fn section_rank(sh_flags: u64, sh_type: u32) -> u32 {
    if sh_flags & shf::ALLOC == 0 {
        return 100;
    }
    if sh_flags & shf::EXECINSTR != 0 {
        return 1;
    }
    if sh_flags & shf::WRITE == 0 {
        return 0;
    }
    if sh_flags & shf::TLS != 0 {
        // TLS template data leads the writable group.
        return 2;
    }
    if sh_type == object::elf::SHT_NOBITS {
        return 4;
    }
    3
}

struct AddressedLayout {
    segments: Vec<Segment>,
    shdr_offset: u64,
    num_shdrs: u32,
    file_size: u64,
    tls_begin: u64,
    tls_end: u64,
}

fn assign_addresses(output_sections: &mut OutputSections) -> AddressedLayout {
    let mut order: Vec<OutputSectionId> = output_sections.ids().collect();
    order.sort_by_key(|&id| {
        let osec = output_sections.get(id);
        (section_rank(osec.sh_flags, osec.sh_type), id.0)
    });

    // One PT_LOAD per contiguous protection group; the first one also maps
    // the file and program headers.
    let num_loads = {
        let mut protections: Vec<u32> = order
            .iter()
            .map(|&id| output_sections.get(id))
            .filter(|osec| osec.size > 0)
            .map(|osec| load_flags(osec.sh_flags))
            .filter(|&f| f != 0)
            .collect();
        protections.dedup();
        protections.len().max(1)
    };
    let has_tls = order.iter().any(|&id| {
        let osec = output_sections.get(id);
        osec.is_alloc() && osec.sh_flags & shf::TLS != 0
    });
    let num_phdrs = num_loads + usize::from(has_tls);
    let header_size = EHDR_SIZE + num_phdrs as u64 * PHDR_SIZE;

    let mut vaddr = IMAGE_BASE + header_size;
    let mut foff = header_size;
    let mut prev_rank = u32::MAX;
    let mut tls_begin = 0u64;
    let mut tls_end = 0u64;
    let mut tls_align = 1u64;
    let mut shndx = 1u32;
    let mut segments: Vec<Segment> = Vec::new();

    for &id in &order {
        let osec = output_sections.get_mut(id);
        let rank = section_rank(osec.sh_flags, osec.sh_type);
        osec.shndx = shndx;
        shndx += 1;

        if !osec.is_alloc() {
            // File-only data, placed after everything that's mapped.
            foff = align_to(foff, osec.alignment.max(1));
            osec.addr = 0;
            osec.file_offset = foff;
            foff += osec.size;
            continue;
        }

        if rank != prev_rank && prev_rank != u32::MAX {
            vaddr = align_to(vaddr, PAGE_SIZE);
            foff = align_to(foff, PAGE_SIZE);
        }
        prev_rank = rank;

        vaddr = align_to(vaddr, osec.alignment.max(1));
        foff = align_to(foff, osec.alignment.max(1));
        osec.addr = vaddr;
        osec.file_offset = foff;

        if osec.sh_flags & shf::TLS != 0 {
            if tls_begin == 0 {
                tls_begin = vaddr;
            }
            tls_end = vaddr + osec.size;
            tls_align = tls_align.max(osec.alignment);
        }

        let flags = load_flags(osec.sh_flags);
        let is_nobits = osec.is_nobits();
        let (addr, size) = (osec.addr, osec.size);
        let file_offset = osec.file_offset;
        if size == 0 {
            continue;
        }
        match segments.last_mut() {
            Some(seg) if seg.p_flags == flags => {
                seg.mem_size = addr + size - seg.addr;
                if !is_nobits {
                    seg.file_size = file_offset + size - seg.file_offset;
                }
            }
            _ => {
                // The first segment reaches back to cover the headers.
                let (seg_addr, seg_off) = if segments.is_empty() {
                    (IMAGE_BASE, 0)
                } else {
                    (addr, file_offset)
                };
                segments.push(Segment {
                    p_type: object::elf::PT_LOAD,
                    p_flags: flags,
                    addr: seg_addr,
                    file_offset: seg_off,
                    file_size: if is_nobits {
                        file_offset - seg_off
                    } else {
                        file_offset + size - seg_off
                    },
                    mem_size: addr + size - seg_addr,
                    align: PAGE_SIZE,
                });
            }
        }

        vaddr += size;
        if !is_nobits {
            foff += size;
        }
    }

    if has_tls {
        let tls_sections: Vec<_> = order
            .iter()
            .map(|&id| output_sections.get(id))
            .filter(|osec| osec.is_alloc() && osec.sh_flags & shf::TLS != 0)
            .collect();
        let file_size: u64 = tls_sections
            .iter()
            .filter(|osec| !osec.is_nobits())
            .map(|osec| osec.size)
            .sum();
        segments.push(Segment {
            p_type: object::elf::PT_TLS,
            p_flags: object::elf::PF_R,
            addr: tls_begin,
            file_offset: tls_sections
                .first()
                .map(|osec| osec.file_offset)
                .unwrap_or(0),
            file_size,
            mem_size: tls_end - tls_begin,
            align: tls_align,
        });
        tls_end = align_to(tls_end, tls_align);
    }

    let shdr_offset = align_to(foff, 8);
    let num_shdrs = shndx;
    let file_size = shdr_offset + u64::from(num_shdrs) * SHDR_SIZE;
    AddressedLayout {
        segments,
        shdr_offset,
        num_shdrs,
        file_size,
        tls_begin,
        tls_end,
    }
}

fn load_flags(sh_flags: u64) -> u32 {
    if sh_flags & shf::ALLOC == 0 {
        return 0;
    }
    let mut flags = object::elf::PF_R;
    if sh_flags & shf::WRITE != 0 {
        flags |= object::elf::PF_W;
    }
    if sh_flags & shf::EXECINSTR != 0 {
        flags |= object::elf::PF_X;
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::align_to;

    #[test]
    fn alignment() {
        assert_eq!(align_to(0, 8), 0);
        assert_eq!(align_to(1, 8), 8);
        assert_eq!(align_to(8, 8), 8);
        assert_eq!(align_to(17, 16), 32);
    }
}
