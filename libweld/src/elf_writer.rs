//! Writes the output file: headers, section contents (in parallel, through
//! pre-split disjoint buffers), GOT/PLT contents, the symbol table and the
//! section header table.

use crate::diagnostics::ErrorSink;
use crate::elf;
use crate::elf_x86_64::PLT_ENTRY_SIZE;
use crate::elf_x86_64::RelKind;
use crate::elf_x86_64::write_plt_entry;
use crate::elf_x86_64::write_plt_header;
use crate::error::Context as _;
use crate::error::Result;
use crate::input_section::InputSection;
use crate::layout::EHDR_SIZE;
use crate::layout::IMAGE_BASE;
use crate::layout::LinkContext;
use crate::layout::PHDR_SIZE;
use crate::layout::SHDR_SIZE;
use crate::object_file::ObjectFile;
use crate::output_section::OutputSectionId;
use crate::symbol::SymbolId;
use memmap2::MmapMut;
use object::LittleEndian;
use rayon::iter::IntoParallelIterator;
use rayon::iter::ParallelIterator;
use std::fs::File;
use std::fs::OpenOptions;

pub(crate) fn write(ctx: &LinkContext, errors: &ErrorSink) -> Result {
    let _span = tracing::info_span!("write").entered();

    let path = &ctx.args.output;
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.set_len(ctx.layout.file_size)?;
    let mut mmap = unsafe { MmapMut::map_mut(&file) }
        .with_context(|| format!("failed to mmap {}", path.display()))?;

    write_file_header(ctx, &mut mmap);
    write_program_headers(ctx, &mut mmap);
    copy_section_contents(ctx, &mut mmap, errors);
    write_merged_sections(ctx, &mut mmap);
    write_got(ctx, &mut mmap);
    write_plt(ctx, &mut mmap);
    write_symtab(ctx, &mut mmap);
    write_section_headers(ctx, &mut mmap);

    mmap.flush()?;
    make_executable(&file)?;
    Ok(())
}

fn write_file_header(ctx: &LinkContext, out: &mut [u8]) {
    let e = LittleEndian;
    let layout = ctx.layout;

    let entry = match ctx.db.lookup_global(b"_start") {
        Some(id) => ctx.symbol_address(ctx.db.symbol(id)),
        None => {
            tracing::warn!("no _start symbol; entry point defaults to the image base");
            IMAGE_BASE
        }
    };

    let ehdr = elf::FileHeader {
        e_ident: object::elf::Ident {
            magic: elf::ELF_MAGIC,
            class: object::elf::ELFCLASS64,
            data: object::elf::ELFDATA2LSB,
            version: object::elf::EV_CURRENT,
            os_abi: object::elf::ELFOSABI_NONE,
            abi_version: 0,
            padding: [0; 7],
        },
        e_type: object::U16::new(
            e,
            if ctx.args.pie {
                object::elf::ET_DYN
            } else {
                object::elf::ET_EXEC
            },
        ),
        e_machine: object::U16::new(e, object::elf::EM_X86_64),
        e_version: object::U32::new(e, u32::from(object::elf::EV_CURRENT)),
        e_entry: object::U64::new(e, entry),
        e_phoff: object::U64::new(e, EHDR_SIZE),
        e_shoff: object::U64::new(e, layout.shdr_offset),
        e_flags: object::U32::new(e, 0),
        e_ehsize: object::U16::new(e, EHDR_SIZE as u16),
        e_phentsize: object::U16::new(e, PHDR_SIZE as u16),
        e_phnum: object::U16::new(e, layout.segments.len() as u16),
        e_shentsize: object::U16::new(e, SHDR_SIZE as u16),
        e_shnum: object::U16::new(e, layout.num_shdrs as u16),
        e_shstrndx: object::U16::new(
            e,
            ctx.output_sections.get(layout.shstrtab).shndx as u16,
        ),
    };
    out[..EHDR_SIZE as usize].copy_from_slice(object::bytes_of(&ehdr));
}

fn write_program_headers(ctx: &LinkContext, out: &mut [u8]) {
    let e = LittleEndian;
    let mut offset = EHDR_SIZE as usize;
    for seg in &ctx.layout.segments {
        let phdr = elf::ProgramHeader {
            p_type: object::U32::new(e, seg.p_type),
            p_flags: object::U32::new(e, seg.p_flags),
            p_offset: object::U64::new(e, seg.file_offset),
            p_vaddr: object::U64::new(e, seg.addr),
            p_paddr: object::U64::new(e, seg.addr),
            p_filesz: object::U64::new(e, seg.file_size),
            p_memsz: object::U64::new(e, seg.mem_size),
            p_align: object::U64::new(e, seg.align),
        };
        out[offset..offset + PHDR_SIZE as usize].copy_from_slice(object::bytes_of(&phdr));
        offset += PHDR_SIZE as usize;
    }
}

enum PieceKind {
    Content,
    DynRel,
}

struct Piece {
    offset: u64,
    len: u64,
    section: crate::symbol::SectionId,
    kind: PieceKind,
}

/// Splits the output buffer into one disjoint slice per input section (plus
/// its `.rela.dyn` slice, if any), then copies and relocates all sections in
/// parallel.
fn copy_section_contents(ctx: &LinkContext, mmap: &mut MmapMut, errors: &ErrorSink) {
    let reldyn_base = ctx.output_sections.get(ctx.layout.reldyn).file_offset;

    let mut pieces: Vec<Piece> = Vec::new();
    for file in ctx.files {
        if !file.alive() || file.is_dso {
            continue;
        }
        for slot in &file.sections {
            let Some(isec) = slot.as_loaded() else {
                continue;
            };
            if isec.shdr.is_nobits() {
                continue;
            }
            let osec = ctx.output_sections.get(isec.output_section);
            if !isec.contents.is_empty() {
                pieces.push(Piece {
                    offset: osec.file_offset + isec.offset,
                    len: isec.contents.len() as u64,
                    section: isec.id,
                    kind: PieceKind::Content,
                });
            }
            let num_dynrel = isec
                .rel_types
                .iter()
                .filter(|kind| matches!(kind, RelKind::Dyn | RelKind::AbsDyn))
                .count() as u64;
            if num_dynrel > 0 {
                pieces.push(Piece {
                    offset: reldyn_base + file.reldyn_file_offset + isec.reldyn_offset,
                    len: num_dynrel * elf::RELA_ENTRY_SIZE,
                    section: isec.id,
                    kind: PieceKind::DynRel,
                });
            }
        }
    }
    pieces.sort_by_key(|piece| piece.offset);
    let total_dynrel: u64 = pieces
        .iter()
        .filter(|piece| matches!(piece.kind, PieceKind::DynRel))
        .map(|piece| piece.len)
        .sum();
    debug_assert_eq!(
        total_dynrel,
        u64::from(ctx.layout.num_dynrel_total) * elf::RELA_ENTRY_SIZE
    );

    // Carve the buffer in file-offset order; each carve is a disjoint slice.
    let mut content_slices: foldhash::HashMap<crate::symbol::SectionId, &mut [u8]> =
        foldhash::HashMap::default();
    let mut dynrel_slices: foldhash::HashMap<crate::symbol::SectionId, &mut [u8]> =
        foldhash::HashMap::default();
    let mut rest: &mut [u8] = &mut mmap[..];
    let mut consumed = 0u64;
    for piece in pieces {
        let gap = (piece.offset - consumed) as usize;
        let tail = std::mem::take(&mut rest);
        let (_, tail) = tail.split_at_mut(gap);
        let (slice, tail) = tail.split_at_mut(piece.len as usize);
        rest = tail;
        consumed = piece.offset + piece.len;
        match piece.kind {
            PieceKind::Content => content_slices.insert(piece.section, slice),
            PieceKind::DynRel => dynrel_slices.insert(piece.section, slice),
        };
    }

    struct Job<'a, 'data> {
        isec: &'a InputSection<'data>,
        symbols: &'a [SymbolId],
        display: String,
        content: &'a mut [u8],
        dynrel: &'a mut [u8],
    }

    let mut jobs: Vec<Job> = Vec::new();
    for file in ctx.files {
        if !file.alive() || file.is_dso {
            continue;
        }
        let display = file.display_name();
        for slot in &file.sections {
            let Some(isec) = slot.as_loaded() else {
                continue;
            };
            let Some(content) = content_slices.remove(&isec.id) else {
                continue;
            };
            jobs.push(Job {
                isec,
                symbols: &file.symbols,
                display: display.clone(),
                content,
                dynrel: dynrel_slices.remove(&isec.id).unwrap_or(&mut []),
            });
        }
    }

    jobs.into_par_iter().for_each(|job| {
        job.isec
            .copy_buf(ctx, job.symbols, &job.display, job.content, job.dynrel, errors);
    });
}

fn write_merged_sections(ctx: &LinkContext, mmap: &mut MmapMut) {
    for msec in &ctx.merged.sections {
        let base = ctx.output_sections.get(msec.output_section).file_offset;
        for (_, frag) in msec.frags.iter() {
            let start = (base + frag.offset) as usize;
            mmap[start..start + frag.data.len()].copy_from_slice(frag.data);
        }
    }
}

fn write_u64_at(mmap: &mut MmapMut, offset: u64, value: u64) {
    mmap[offset as usize..offset as usize + 8].copy_from_slice(&value.to_le_bytes());
}

fn write_got(ctx: &LinkContext, mmap: &mut MmapMut) {
    let layout = ctx.layout;
    let base = ctx.output_sections.get(layout.got).file_offset;
    let slot = |idx: u32| base + u64::from(idx) * 8;

    for sym in ctx.db.symbols() {
        let addr = ctx.symbol_address(sym);
        if let Some(idx) = sym.got_idx {
            write_u64_at(mmap, slot(idx), addr);
        }
        if let Some(idx) = sym.gottpoff_idx {
            write_u64_at(mmap, slot(idx), addr.wrapping_sub(layout.tls_end));
        }
        if let Some(idx) = sym.tlsgd_idx {
            // Without a dynamic linker there is a single TLS module.
            write_u64_at(mmap, slot(idx), 1);
            write_u64_at(mmap, slot(idx + 1), addr.wrapping_sub(layout.tls_begin));
        }
        if let Some(idx) = sym.plt_idx {
            write_u64_at(mmap, slot(layout.plt_got_start + idx), addr);
        }
    }
    if let Some(idx) = layout.tlsld_got_idx {
        write_u64_at(mmap, slot(idx), 1);
        write_u64_at(mmap, slot(idx + 1), 0);
    }
}

fn write_plt(ctx: &LinkContext, mmap: &mut MmapMut) {
    let layout = ctx.layout;
    if layout.num_plt_entries == 0 {
        return;
    }
    let osec = ctx.output_sections.get(layout.plt);
    let base = osec.file_offset as usize;
    let plt_addr = osec.addr;

    write_plt_header(
        &mut mmap[base..base + PLT_ENTRY_SIZE as usize],
        ctx.plt_got_address(0),
        plt_addr,
    );
    for sym in ctx.db.symbols() {
        let Some(idx) = sym.plt_idx else {
            continue;
        };
        let entry_off = base + ((idx as usize) + 1) * PLT_ENTRY_SIZE as usize;
        let entry_addr = plt_addr + (u64::from(idx) + 1) * PLT_ENTRY_SIZE;
        write_plt_entry(
            &mut mmap[entry_off..entry_off + PLT_ENTRY_SIZE as usize],
            ctx.plt_got_address(idx),
            entry_addr,
            idx,
        );
    }
}

fn write_symtab(ctx: &LinkContext, mmap: &mut MmapMut) {
    for file in ctx.files {
        if !file.alive() || file.is_dso {
            continue;
        }
        write_file_symbols(ctx, mmap, file, true);
        write_file_symbols(ctx, mmap, file, false);
    }
}

fn write_file_symbols(ctx: &LinkContext, mmap: &mut MmapMut, file: &ObjectFile, locals: bool) {
    let e = LittleEndian;
    let symtab_base = ctx.output_sections.get(ctx.layout.symtab).file_offset;
    let strtab_base = ctx.output_sections.get(ctx.layout.strtab).file_offset;

    let (range, mut symtab_off, mut strtab_off) = if locals {
        (
            1..file.first_global.min(file.esyms.len()),
            symtab_base + file.local_symtab_offset,
            strtab_base + file.local_strtab_offset,
        )
    } else {
        (
            file.first_global..file.esyms.len(),
            symtab_base + file.global_symtab_offset,
            strtab_base + file.global_strtab_offset,
        )
    };

    for i in range {
        let sym = ctx.db.symbol(file.symbols[i]);
        if sym.st_type == object::elf::STT_SECTION || sym.file != Some(file.file_id) {
            continue;
        }
        if !locals && sym.esym_index as usize != i {
            continue;
        }
        let esym = &file.esyms[i];

        let shndx = match sym.input_section {
            Some(section) => {
                let slot = ctx.files[section.file.as_usize()].slot(section.index);
                match slot {
                    crate::object_file::SectionSlot::Loaded(isec) => {
                        ctx.output_sections.get(isec.output_section).shndx as u16
                    }
                    _ => object::elf::SHN_ABS,
                }
            }
            None => match sym.frag {
                Some(frag) => {
                    let parent = &ctx.merged.sections[frag.section as usize];
                    ctx.output_sections.get(parent.output_section).shndx as u16
                }
                None => object::elf::SHN_ABS,
            },
        };

        let name_offset = strtab_off - strtab_base;
        let out = elf::SymtabEntry {
            st_name: object::U32::new(e, name_offset as u32),
            st_info: esym.st_info,
            st_other: sym.visibility,
            st_shndx: object::U16::new(e, shndx),
            st_value: object::U64::new(e, ctx.symbol_address(sym)),
            st_size: esym.st_size,
        };
        let pos = symtab_off as usize;
        mmap[pos..pos + elf::SYMTAB_ENTRY_SIZE as usize]
            .copy_from_slice(object::bytes_of(&out));
        symtab_off += elf::SYMTAB_ENTRY_SIZE;

        let pos = strtab_off as usize;
        mmap[pos..pos + sym.name.len()].copy_from_slice(sym.name);
        mmap[pos + sym.name.len()] = 0;
        strtab_off += sym.name.len() as u64 + 1;
    }
}

fn write_section_headers(ctx: &LinkContext, mmap: &mut MmapMut) {
    let e = LittleEndian;
    let layout = ctx.layout;

    let mut by_shndx: Vec<OutputSectionId> = ctx.output_sections.ids().collect();
    by_shndx.sort_by_key(|&id| ctx.output_sections.get(id).shndx);

    // .shstrtab contents and per-section name offsets.
    let shstrtab_off = ctx.output_sections.get(layout.shstrtab).file_offset as usize;
    let mut name_offsets: foldhash::HashMap<OutputSectionId, u32> = foldhash::HashMap::default();
    let mut cursor = 1usize;
    for &id in &by_shndx {
        let name = ctx.output_sections.get(id).name;
        name_offsets.insert(id, cursor as u32);
        mmap[shstrtab_off + cursor..shstrtab_off + cursor + name.len()].copy_from_slice(name);
        cursor += name.len() + 1;
    }

    let strtab_shndx = ctx.output_sections.get(layout.strtab).shndx;
    let mut pos = layout.shdr_offset as usize + SHDR_SIZE as usize;
    for &id in &by_shndx {
        let osec = ctx.output_sections.get(id);
        let (sh_link, sh_info, sh_entsize) = if id == layout.symtab {
            (
                strtab_shndx,
                layout.num_local_symtab,
                elf::SYMTAB_ENTRY_SIZE,
            )
        } else if id == layout.reldyn {
            (0, 0, elf::RELA_ENTRY_SIZE)
        } else {
            (0, 0, 0)
        };
        let shdr = elf::SectionHeader {
            sh_name: object::U32::new(e, name_offsets[&id]),
            sh_type: object::U32::new(e, osec.sh_type),
            sh_flags: object::U64::new(e, osec.sh_flags),
            sh_addr: object::U64::new(e, osec.addr),
            sh_offset: object::U64::new(e, osec.file_offset),
            sh_size: object::U64::new(e, osec.size),
            sh_link: object::U32::new(e, sh_link),
            sh_info: object::U32::new(e, sh_info),
            sh_addralign: object::U64::new(e, osec.alignment),
            sh_entsize: object::U64::new(e, sh_entsize),
        };
        mmap[pos..pos + SHDR_SIZE as usize].copy_from_slice(object::bytes_of(&shdr));
        pos += SHDR_SIZE as usize;
    }
}

fn make_executable(file: &File) -> Result {
    use std::os::unix::prelude::PermissionsExt;

    let mut permissions = file.metadata()?.permissions();
    let mode = permissions.mode();
    // Whoever can read the output should also be able to run it.
    let exec_bits = (mode >> 2) & 0o111;
    permissions.set_mode(mode | exec_bits);
    file.set_permissions(permissions)?;
    Ok(())
}
