//! Input file representation and parsing. An `ObjectFile` owns its sections;
//! symbols are stored in the global `SymbolDb` and referenced by id. Shared
//! objects contribute symbols only.

use crate::elf;
use crate::elf::Rela;
use crate::elf::SectionHeader;
use crate::elf::Shdr;
use crate::elf::SymtabEntry;
use crate::error::Context;
use crate::error::Result;
use crate::error::bail;
use crate::error::ensure;
use crate::hash::ConcurrentMap;
use crate::hash::FrozenMap;
use crate::hash::MapId;
use crate::input_data::InputBytes;
use crate::input_section::InputSection;
use crate::merge_strings::MergeableSection;
use crate::symbol::FileId;
use crate::symbol::SectionId;
use crate::symbol::SymbolId;
use crate::symbol_db::SymbolDb;
use crossbeam_queue::SegQueue;
use object::LittleEndian;
use object::read::elf::FileHeader as _;
use rayon::iter::IndexedParallelIterator;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::IntoParallelRefMutIterator;
use rayon::iter::ParallelIterator;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;

pub(crate) struct ObjectFile<'data> {
    pub(crate) name: String,
    pub(crate) archive_name: Option<String>,
    pub(crate) file_id: FileId,
    /// Command line position. Smaller wins ties everywhere.
    pub(crate) priority: u32,
    pub(crate) data: &'data [u8],
    pub(crate) shdrs: &'data [SectionHeader],
    pub(crate) is_dso: bool,
    pub(crate) is_in_archive: bool,
    pub(crate) is_alive: AtomicBool,

    pub(crate) esyms: &'data [SymtabEntry],
    pub(crate) symbol_strtab: &'data [u8],
    pub(crate) first_global: usize,
    /// Global symbol ids, parallel to `esyms`.
    pub(crate) symbols: Vec<SymbolId>,

    pub(crate) sections: Vec<SectionSlot<'data>>,
    pub(crate) comdat_groups: Vec<(MapId, u32)>,

    /// Number of dynamic relocations this file will emit, accumulated by the
    /// relocation scanner.
    pub(crate) num_dynrel: u32,
    /// Byte offset of this file's slice of `.rela.dyn`, assigned at layout.
    pub(crate) reldyn_file_offset: u64,

    // Symbol table sizing, filled in by layout's `compute_symtab`.
    pub(crate) num_local_symtab: u32,
    pub(crate) local_strtab_size: u32,
    pub(crate) num_global_symtab: u32,
    pub(crate) global_strtab_size: u32,
    pub(crate) local_symtab_offset: u64,
    pub(crate) local_strtab_offset: u64,
    pub(crate) global_symtab_offset: u64,
    pub(crate) global_strtab_offset: u64,
}

pub(crate) enum SectionSlot<'data> {
    /// Holds no loadable content (symbol tables, relocation sections, holes).
    Absent,
    Loaded(InputSection<'data>),
    MergeStrings(MergeableSection<'data>),
    /// Removed by comdat deduplication.
    Dead,
    /// Folded away by ICF; the survivor is recorded.
    Folded(SectionId),
}

impl<'data> SectionSlot<'data> {
    pub(crate) fn as_loaded(&self) -> Option<&InputSection<'data>> {
        match self {
            SectionSlot::Loaded(isec) => Some(isec),
            _ => None,
        }
    }

    pub(crate) fn as_loaded_mut(&mut self) -> Option<&mut InputSection<'data>> {
        match self {
            SectionSlot::Loaded(isec) => Some(isec),
            _ => None,
        }
    }

    pub(crate) fn as_merge_strings(&self) -> Option<&MergeableSection<'data>> {
        match self {
            SectionSlot::MergeStrings(msec) => Some(msec),
            _ => None,
        }
    }
}

/// One comdat signature, shared by every file that brings a group with that
/// signature. The owner packs `(priority << 32) | section_idx`, so a
/// lock-free `fetch_min` elects the lowest-priority file.
pub(crate) struct ComdatGroup {
    owner: AtomicU64,
}

const UNCLAIMED: u64 = u64::MAX;

impl ComdatGroup {
    pub(crate) fn new() -> ComdatGroup {
        ComdatGroup {
            owner: AtomicU64::new(UNCLAIMED),
        }
    }
}

pub(crate) type ComdatMap<'data> = ConcurrentMap<&'data [u8], ComdatGroup>;

pub(crate) fn parse_files<'data>(
    inputs: &[InputBytes<'data>],
    comdat_map: &ComdatMap<'data>,
) -> Result<Vec<ObjectFile<'data>>> {
    inputs
        .par_iter()
        .enumerate()
        .map(|(i, input)| {
            ObjectFile::parse(input, FileId(i as u32), comdat_map)
                .with_context(|| format!("failed to parse {}", input.display_name()))
        })
        .collect()
}

impl<'data> ObjectFile<'data> {
    pub(crate) fn parse(
        input: &InputBytes<'data>,
        file_id: FileId,
        comdat_map: &ComdatMap<'data>,
    ) -> Result<ObjectFile<'data>> {
        let e = LittleEndian;
        let data = input.data;
        let header = elf::FileHeader::parse(data)?;
        ensure!(
            header.e_machine.get(e) == object::elf::EM_X86_64,
            "unsupported architecture (e_machine {})",
            header.e_machine.get(e)
        );
        let is_dso = match header.e_type.get(e) {
            object::elf::ET_REL => false,
            object::elf::ET_DYN => true,
            ty => bail!("unsupported ELF type {ty}"),
        };

        let shoff = header.e_shoff.get(e) as usize;
        let shnum = header.e_shnum.get(e) as usize;
        let shdrs: &[SectionHeader] = if shnum == 0 {
            &[]
        } else {
            let table = data.get(shoff..).context("section headers out of bounds")?;
            object::slice_from_bytes(table, shnum)
                .map_err(|()| crate::error::error!("bad section header table"))?
                .0
        };

        let shstrndx = header.e_shstrndx.get(e) as usize;
        let shstrtab = match shdrs.get(shstrndx) {
            Some(shdr) => section_data(data, shdr)?,
            None => &[],
        };

        let symtab_type = if is_dso {
            object::elf::SHT_DYNSYM
        } else {
            object::elf::SHT_SYMTAB
        };
        let symtab_sec = shdrs.iter().find(|s| s.sh_type.get(e) == symtab_type);

        let mut esyms: &[SymtabEntry] = &[];
        let mut symbol_strtab: &[u8] = &[];
        let mut first_global = 0;
        if let Some(symtab) = symtab_sec {
            let count = (symtab.sh_size.get(e) / elf::SYMTAB_ENTRY_SIZE) as usize;
            esyms = object::slice_from_bytes(section_data(data, symtab)?, count)
                .map_err(|()| crate::error::error!("bad symbol table"))?
                .0;
            first_global = symtab.sh_info.get(e) as usize;
            let strtab_sec = shdrs
                .get(symtab.sh_link.get(e) as usize)
                .context("invalid symbol string table index")?;
            symbol_strtab = section_data(data, strtab_sec)?;
        }

        let mut file = ObjectFile {
            name: input.name.clone(),
            archive_name: input.archive_name.clone(),
            file_id,
            priority: file_id.0,
            data,
            shdrs,
            is_dso,
            is_in_archive: input.archive_name.is_some(),
            is_alive: AtomicBool::new(input.archive_name.is_none()),
            esyms,
            symbol_strtab,
            first_global,
            symbols: Vec::new(),
            sections: Vec::new(),
            comdat_groups: Vec::new(),
            num_dynrel: 0,
            reldyn_file_offset: 0,
            num_local_symtab: 0,
            local_strtab_size: 0,
            num_global_symtab: 0,
            global_strtab_size: 0,
            local_symtab_offset: 0,
            local_strtab_offset: 0,
            global_symtab_offset: 0,
            global_strtab_offset: 0,
        };

        if is_dso {
            file.sections = (0..shdrs.len()).map(|_| SectionSlot::Absent).collect();
        } else {
            file.initialize_sections(shstrtab, comdat_map)?;
            file.attach_relocations()?;
        }

        Ok(file)
    }

    fn initialize_sections(
        &mut self,
        shstrtab: &'data [u8],
        comdat_map: &ComdatMap<'data>,
    ) -> Result {
        let e = LittleEndian;
        for (i, shdr) in self.shdrs.iter().enumerate() {
            let slot = match shdr.sh_type.get(e) {
                object::elf::SHT_GROUP => {
                    let sym = self
                        .esyms
                        .get(shdr.sh_info.get(e) as usize)
                        .context("invalid group signature symbol index")?;
                    let signature = elf::get_string(self.symbol_strtab, sym.st_name.get(e))?;
                    let contents = section_data(self.data, shdr)?;
                    let count = contents.len() / 4;
                    let entries: &[object::U32<LittleEndian>] =
                        object::slice_from_bytes(contents, count)
                            .map_err(|()| crate::error::error!("bad SHT_GROUP section"))?
                            .0;
                    ensure!(!entries.is_empty(), "empty SHT_GROUP");
                    match entries[0].get(e) {
                        0 => {}
                        object::elf::GRP_COMDAT => {
                            let group =
                                comdat_map.insert_with(signature, ComdatGroup::new, |_| {});
                            self.comdat_groups.push((group, i as u32));
                        }
                        _ => bail!("unsupported SHT_GROUP format"),
                    }
                    SectionSlot::Absent
                }
                object::elf::SHT_SYMTAB_SHNDX => {
                    bail!("SHT_SYMTAB_SHNDX sections are not supported")
                }
                object::elf::SHT_SYMTAB
                | object::elf::SHT_STRTAB
                | object::elf::SHT_REL
                | object::elf::SHT_RELA
                | object::elf::SHT_NULL => SectionSlot::Absent,
                _ => {
                    let flags = shdr.sh_flags.get(e);
                    if flags & elf::shf::EXCLUDE != 0 && flags & elf::shf::ALLOC == 0 {
                        SectionSlot::Absent
                    } else {
                        let name = elf::get_string(shstrtab, shdr.sh_name.get(e))?;
                        let contents = section_data(self.data, shdr)?;
                        SectionSlot::Loaded(InputSection::new(
                            SectionId {
                                file: self.file_id,
                                index: i as u32,
                            },
                            Shdr::from_raw(shdr),
                            name,
                            contents,
                        ))
                    }
                }
            };
            self.sections.push(slot);
        }
        Ok(())
    }

    /// Attaches each SHT_RELA section's entries to its target section.
    fn attach_relocations(&mut self) -> Result {
        let e = LittleEndian;
        for shdr in self.shdrs {
            if shdr.sh_type.get(e) != object::elf::SHT_RELA {
                continue;
            }
            let target = shdr.sh_info.get(e) as usize;
            ensure!(
                target < self.sections.len(),
                "invalid relocated section index {target}"
            );
            let count = (shdr.sh_size.get(e) / elf::RELA_ENTRY_SIZE) as usize;
            let rels: &[Rela] = object::slice_from_bytes(section_data(self.data, shdr)?, count)
                .map_err(|()| crate::error::error!("bad relocation section"))?
                .0;
            if let Some(isec) = self.sections[target].as_loaded_mut() {
                isec.rels = rels;
            }
        }
        Ok(())
    }

    pub(crate) fn alive(&self) -> bool {
        self.is_alive.load(Relaxed)
    }

    pub(crate) fn display_name(&self) -> String {
        match &self.archive_name {
            Some(archive) => format!("{archive}:{}", self.name),
            None => self.name.clone(),
        }
    }

    pub(crate) fn section(&self, index: u32) -> Option<&InputSection<'data>> {
        self.sections.get(index as usize)?.as_loaded()
    }

    pub(crate) fn slot(&self, index: u32) -> &SectionSlot<'data> {
        &self.sections[index as usize]
    }

    /// Removes the members of the comdat group held by the given group
    /// section from this file.
    fn remove_comdat_members(&mut self, group_section_idx: u32) -> Result {
        let e = LittleEndian;
        let shdr = &self.shdrs[group_section_idx as usize];
        let contents = section_data(self.data, shdr)?;
        let entries: &[object::U32<LittleEndian>] =
            object::slice_from_bytes(contents, contents.len() / 4)
                .map_err(|()| crate::error::error!("bad SHT_GROUP section"))?
                .0;
        for entry in &entries[1..] {
            let index = entry.get(e) as usize;
            ensure!(index < self.sections.len(), "invalid comdat member index");
            self.sections[index] = SectionSlot::Dead;
        }
        Ok(())
    }
}

pub(crate) fn section_data<'data>(data: &'data [u8], shdr: &SectionHeader) -> Result<&'data [u8]> {
    let e = LittleEndian;
    if shdr.sh_type.get(e) == object::elf::SHT_NOBITS {
        return Ok(&[]);
    }
    let start = shdr.sh_offset.get(e) as usize;
    let size = shdr.sh_size.get(e) as usize;
    let end = start.checked_add(size).context("section data out of bounds")?;
    data.get(start..end).context("section data out of bounds")
}

/// Walks the reference graph from the alive files, extracting archive
/// members that satisfy strong undefined references. The queue hands newly
/// live members to whichever worker is free; `swap` on the liveness flag
/// guarantees a member is enqueued at most once.
pub(crate) fn mark_live_archive_members(files: &[ObjectFile], db: &SymbolDb) {
    let queue = SegQueue::new();
    for file in files {
        if !file.is_in_archive {
            queue.push(file.file_id);
        }
    }
    loop {
        let mut batch = Vec::new();
        while let Some(file_id) = queue.pop() {
            batch.push(file_id);
        }
        if batch.is_empty() {
            break;
        }
        batch.par_iter().for_each(|&file_id| {
            mark_references(&files[file_id.as_usize()], files, db, &queue);
        });
    }
}

fn mark_references(
    file: &ObjectFile,
    files: &[ObjectFile],
    db: &SymbolDb,
    queue: &SegQueue<FileId>,
) {
    let e = LittleEndian;
    for i in file.first_global..file.esyms.len() {
        let esym = &file.esyms[i];
        if esym.st_shndx.get(e) != object::elf::SHN_UNDEF {
            continue;
        }
        if esym.st_info >> 4 == object::elf::STB_WEAK {
            continue;
        }
        let sym = db.symbol(file.symbols[i]);
        if let Some(winner) = sym.file {
            let winner = &files[winner.as_usize()];
            if winner.is_in_archive && !winner.is_alive.swap(true, Relaxed) {
                tracing::debug!(
                    "extracting {} for {}",
                    winner.display_name(),
                    sym.name_for_display()
                );
                queue.push(winner.file_id);
            }
        }
    }
}

/// First comdat pass: every file offers its groups; `fetch_min` on the
/// packed owner key elects the lowest-priority file per signature.
pub(crate) fn claim_comdat_groups(files: &[ObjectFile], groups: &FrozenMap<ComdatGroup>) {
    files.par_iter().for_each(|file| {
        if !file.alive() {
            return;
        }
        for &(group_id, section_idx) in &file.comdat_groups {
            let key = (u64::from(file.priority) << 32) | u64::from(section_idx);
            groups.get(group_id).owner.fetch_min(key, Relaxed);
        }
    });
}

/// Second comdat pass: every file that lost an election removes its own
/// members. No file touches another file's sections.
pub(crate) fn eliminate_duplicate_comdat_groups(
    files: &mut [ObjectFile],
    groups: &FrozenMap<ComdatGroup>,
) -> Result {
    files
        .par_iter_mut()
        .map(|file| {
            if !file.alive() {
                return Ok(());
            }
            let claimed = std::mem::take(&mut file.comdat_groups);
            for &(group_id, section_idx) in &claimed {
                let key = (u64::from(file.priority) << 32) | u64::from(section_idx);
                if groups.get(group_id).owner.load(Relaxed) != key {
                    file.remove_comdat_members(section_idx)?;
                }
            }
            file.comdat_groups = claimed;
            Ok(())
        })
        .collect()
}

/// Gives each common symbol that won resolution a synthetic NOBITS section
/// in its owning file.
pub(crate) fn convert_common_symbols<'data>(
    files: &mut [ObjectFile<'data>],
    db: &mut SymbolDb<'data>,
) {
    let e = LittleEndian;
    for file_idx in 0..files.len() {
        let file_id = files[file_idx].file_id;
        if !files[file_idx].alive() {
            continue;
        }
        let esyms = files[file_idx].esyms;
        let first_global = files[file_idx].first_global;
        for i in first_global..esyms.len() {
            let esym = &esyms[i];
            if esym.st_shndx.get(e) != object::elf::SHN_COMMON {
                continue;
            }
            let symbol_id = files[file_idx].symbols[i];
            if db.symbol(symbol_id).file != Some(file_id) {
                continue;
            }
            let shdr = Shdr {
                sh_type: object::elf::SHT_NOBITS,
                sh_flags: elf::shf::ALLOC | elf::shf::WRITE,
                sh_size: esym.st_size.get(e),
                sh_addralign: esym.st_value.get(e).max(1),
                sh_entsize: 0,
            };
            let index = files[file_idx].sections.len() as u32;
            let section_id = SectionId {
                file: file_id,
                index,
            };
            files[file_idx].sections.push(SectionSlot::Loaded(
                InputSection::new(section_id, shdr, b".bss", &[]),
            ));
            let sym = db.symbol_mut(symbol_id);
            sym.input_section = Some(section_id);
            sym.value = 0;
        }
    }
}

pub(crate) fn section_display_name(files: &[ObjectFile], id: SectionId) -> String {
    let file = &files[id.file.as_usize()];
    let section_name = match file.slot(id.index) {
        SectionSlot::Loaded(isec) => String::from_utf8_lossy(isec.name).into_owned(),
        SectionSlot::MergeStrings(msec) => String::from_utf8_lossy(msec.name).into_owned(),
        _ => format!("<section {}>", id.index),
    };
    format!("{}:({section_name})", file.display_name())
}
