//! Builders for synthetic input files, so tests can exercise resolution,
//! ICF and the relocation engine without fixture files on disk. Leaked
//! allocations stand in for the memory-mapped input data.

use crate::args::Args;
use crate::diagnostics::ErrorSink;
use crate::elf::Rela;
use crate::elf::Shdr;
use crate::elf::SymtabEntry;
use crate::elf::shf;
use crate::icf::icf_sections;
use crate::input_section::InputSection;
use crate::input_section::scan_all_relocations;
use crate::layout;
use crate::layout::Layout;
use crate::layout::LinkContext;
use crate::merge_strings::MergedSections;
use crate::merge_strings::merge_sections;
use crate::object_file::ObjectFile;
use crate::object_file::SectionSlot;
use crate::object_file::mark_live_archive_members;
use crate::output_section::OutputSections;
use crate::output_section::assign_output_sections;
use crate::symbol::FileId;
use crate::symbol::SectionId;
use crate::symbol_db::SymbolDb;
use object::LittleEndian;
use std::sync::atomic::AtomicBool;

pub(crate) struct TestFileBuilder {
    name: String,
    in_archive: bool,
    sections: Vec<BuiltSection>,
    rels: Vec<(u32, Vec<Rela>)>,
    locals: Vec<SymSpec>,
    globals: Vec<SymSpec>,
    strtab: Vec<u8>,
}

struct BuiltSection {
    name: &'static [u8],
    shdr: Shdr,
    contents: &'static [u8],
}

struct SymSpec {
    name_offset: u32,
    st_info: u8,
    st_shndx: u16,
    st_value: u64,
    st_size: u64,
}

fn leak<T: Clone>(data: &[T]) -> &'static [T] {
    Box::leak(data.to_vec().into_boxed_slice())
}

impl TestFileBuilder {
    pub(crate) fn new(name: &str) -> TestFileBuilder {
        TestFileBuilder {
            name: name.to_owned(),
            in_archive: false,
            sections: Vec::new(),
            rels: Vec::new(),
            locals: Vec::new(),
            globals: Vec::new(),
            strtab: vec![0],
        }
    }

    pub(crate) fn in_archive(mut self) -> TestFileBuilder {
        self.in_archive = true;
        self
    }

    pub(crate) fn section(
        mut self,
        name: &str,
        sh_type: u32,
        sh_flags: u64,
        contents: &[u8],
        sh_addralign: u64,
        sh_entsize: u64,
    ) -> TestFileBuilder {
        self.sections.push(BuiltSection {
            name: leak(name.as_bytes()),
            shdr: Shdr {
                sh_type,
                sh_flags,
                sh_size: contents.len() as u64,
                sh_addralign,
                sh_entsize,
            },
            contents: leak(contents),
        });
        self
    }

    pub(crate) fn text_section(self, name: &str, contents: &[u8]) -> TestFileBuilder {
        self.section(
            name,
            object::elf::SHT_PROGBITS,
            shf::ALLOC | shf::EXECINSTR,
            contents,
            1,
            0,
        )
    }

    pub(crate) fn data_section(self, name: &str, contents: &[u8]) -> TestFileBuilder {
        self.section(
            name,
            object::elf::SHT_PROGBITS,
            shf::ALLOC | shf::WRITE,
            contents,
            1,
            0,
        )
    }

    /// Attaches relocations to the section with the given (1-based) index.
    pub(crate) fn rels_for_section(mut self, index: u32, rels: Vec<Rela>) -> TestFileBuilder {
        self.rels.push((index, rels));
        self
    }

    fn intern_name(&mut self, name: &[u8]) -> u32 {
        let offset = self.strtab.len() as u32;
        self.strtab.extend_from_slice(name);
        self.strtab.push(0);
        offset
    }

    pub(crate) fn local_section_symbol(mut self, shndx: u16) -> TestFileBuilder {
        self.locals.push(SymSpec {
            name_offset: 0,
            st_info: object::elf::STT_SECTION,
            st_shndx: shndx,
            st_value: 0,
            st_size: 0,
        });
        self
    }

    pub(crate) fn local(
        mut self,
        name: &[u8],
        st_type: u8,
        shndx: u16,
        value: u64,
    ) -> TestFileBuilder {
        let name_offset = self.intern_name(name);
        self.locals.push(SymSpec {
            name_offset,
            st_info: st_type,
            st_shndx: shndx,
            st_value: value,
            st_size: 0,
        });
        self
    }

    pub(crate) fn global(
        self,
        name: &[u8],
        bind: u8,
        st_type: u8,
        shndx: u16,
        value: u64,
    ) -> TestFileBuilder {
        self.global_raw(name, bind, st_type, shndx, value, 0)
    }

    pub(crate) fn global_raw(
        mut self,
        name: &[u8],
        bind: u8,
        st_type: u8,
        shndx: u16,
        value: u64,
        size: u64,
    ) -> TestFileBuilder {
        let name_offset = self.intern_name(name);
        self.globals.push(SymSpec {
            name_offset,
            st_info: (bind << 4) | st_type,
            st_shndx: shndx,
            st_value: value,
            st_size: size,
        });
        self
    }

    pub(crate) fn build(self, priority: u32) -> ObjectFile<'static> {
        let e = LittleEndian;
        let file_id = FileId(priority);

        let mut esyms = vec![SymtabEntry {
            st_name: object::U32::new(e, 0),
            st_info: 0,
            st_other: 0,
            st_shndx: object::U16::new(e, 0),
            st_value: object::U64::new(e, 0),
            st_size: object::U64::new(e, 0),
        }];
        for spec in self.locals.iter().chain(&self.globals) {
            esyms.push(SymtabEntry {
                st_name: object::U32::new(e, spec.name_offset),
                st_info: spec.st_info,
                st_other: 0,
                st_shndx: object::U16::new(e, spec.st_shndx),
                st_value: object::U64::new(e, spec.st_value),
                st_size: object::U64::new(e, spec.st_size),
            });
        }
        let first_global = 1 + self.locals.len();

        let mut sections = vec![SectionSlot::Absent];
        for (i, built) in self.sections.iter().enumerate() {
            sections.push(SectionSlot::Loaded(InputSection::new(
                SectionId {
                    file: file_id,
                    index: i as u32 + 1,
                },
                built.shdr,
                built.name,
                built.contents,
            )));
        }
        for (index, rels) in &self.rels {
            let isec = sections[*index as usize]
                .as_loaded_mut()
                .expect("relocations attached to a non-loaded section");
            isec.rels = leak(rels);
        }

        ObjectFile {
            name: self.name,
            archive_name: self.in_archive.then(|| "lib.a".to_owned()),
            file_id,
            priority,
            data: &[],
            shdrs: &[],
            is_dso: false,
            is_in_archive: self.in_archive,
            is_alive: AtomicBool::new(!self.in_archive),
            esyms: leak(&esyms),
            symbol_strtab: leak(&self.strtab),
            first_global,
            symbols: Vec::new(),
            sections,
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
        }
    }
}

/// Runs the pipeline up to and including layout, so tests can exercise the
/// relocation applier with real addresses.
pub(crate) struct LinkHarness {
    pub(crate) args: Args,
    pub(crate) files: Vec<ObjectFile<'static>>,
    pub(crate) db: SymbolDb<'static>,
    pub(crate) merged: MergedSections<'static>,
    pub(crate) output_sections: OutputSections<'static>,
    pub(crate) layout: Layout,
    pub(crate) errors: ErrorSink,
}

impl LinkHarness {
    pub(crate) fn run(mut files: Vec<ObjectFile<'static>>, args: Args) -> LinkHarness {
        let errors = ErrorSink::new();
        let mut db = SymbolDb::build(&mut files).unwrap();
        db.resolve_symbols(&files, false);
        mark_live_archive_members(&files, &db);
        db.resolve_symbols(&files, true);
        let mut merged = merge_sections(&mut files, &mut db, &errors);
        crate::eh_frame::attach_fdes(&mut files, &db, &errors);
        let mut output_sections = OutputSections::new();
        assign_output_sections(&mut files, &mut merged, &mut output_sections);
        scan_all_relocations(&mut files, &db, &args, &errors);
        if args.icf {
            icf_sections(&mut files, &mut db, &merged, &args);
        }
        let layout = layout::compute(&mut files, &mut db, &mut merged, &mut output_sections)
            .unwrap();
        LinkHarness {
            args,
            files,
            db,
            merged,
            output_sections,
            layout,
            errors,
        }
    }

    pub(crate) fn ctx(&self) -> LinkContext<'_, 'static> {
        LinkContext {
            args: &self.args,
            files: &self.files,
            db: &self.db,
            merged: &self.merged,
            output_sections: &self.output_sections,
            layout: &self.layout,
        }
    }

    /// Copies one section through the applier and returns the patched bytes
    /// along with any dynamic relocation records it emitted.
    pub(crate) fn apply_section(&self, file: usize, section: u32) -> (Vec<u8>, Vec<u8>) {
        let file = &self.files[file];
        let isec = file.section(section).unwrap();
        let mut base = vec![0u8; isec.contents.len()];
        let num_dynrel = isec
            .rel_types
            .iter()
            .filter(|kind| {
                matches!(
                    kind,
                    crate::elf_x86_64::RelKind::Dyn | crate::elf_x86_64::RelKind::AbsDyn
                )
            })
            .count();
        let mut dynrel = vec![0u8; num_dynrel * crate::elf::RELA_ENTRY_SIZE as usize];
        isec.copy_buf(
            &self.ctx(),
            &file.symbols,
            &file.display_name(),
            &mut base,
            &mut dynrel,
            &self.errors,
        );
        (base, dynrel)
    }
}
