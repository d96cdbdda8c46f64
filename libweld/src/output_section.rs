//! Output section interning and naming. Input sections are mapped onto
//! output sections keyed by `(name, type, flags)`; well-known prefixes are
//! canonicalized so `.text.foo` lands in `.text`. Addresses and sizes are
//! filled in by the layout phase.

use crate::elf::Shdr;
use crate::elf::shf;
use crate::merge_strings::MergedSections;
use crate::object_file::ObjectFile;
use crate::object_file::SectionSlot;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct OutputSectionId(pub(crate) u32);

pub(crate) const UNASSIGNED_OUTPUT_SECTION: OutputSectionId = OutputSectionId(u32::MAX);

impl OutputSectionId {
    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

pub(crate) struct OutputSection<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) sh_type: u32,
    pub(crate) sh_flags: u64,
    pub(crate) alignment: u64,

    // Filled in by layout.
    pub(crate) size: u64,
    pub(crate) addr: u64,
    pub(crate) file_offset: u64,
    pub(crate) shndx: u32,
}

impl OutputSection<'_> {
    pub(crate) fn is_alloc(&self) -> bool {
        self.sh_flags & shf::ALLOC != 0
    }

    pub(crate) fn is_nobits(&self) -> bool {
        self.sh_type == object::elf::SHT_NOBITS
    }
}

pub(crate) struct OutputSections<'data> {
    sections: Vec<OutputSection<'data>>,
    by_key: foldhash::HashMap<(&'data [u8], u32, u64), OutputSectionId>,
}

impl<'data> OutputSections<'data> {
    pub(crate) fn new() -> OutputSections<'data> {
        OutputSections {
            sections: Vec::new(),
            by_key: foldhash::HashMap::default(),
        }
    }

    pub(crate) fn get_instance(
        &mut self,
        name: &'data [u8],
        sh_type: u32,
        sh_flags: u64,
    ) -> OutputSectionId {
        *self.by_key.entry((name, sh_type, sh_flags)).or_insert_with(|| {
            let id = OutputSectionId(self.sections.len() as u32);
            self.sections.push(OutputSection {
                name,
                sh_type,
                sh_flags,
                alignment: 1,
                size: 0,
                addr: 0,
                file_offset: 0,
                shndx: 0,
            });
            id
        })
    }

    pub(crate) fn get(&self, id: OutputSectionId) -> &OutputSection<'data> {
        &self.sections[id.as_usize()]
    }

    pub(crate) fn get_mut(&mut self, id: OutputSectionId) -> &mut OutputSection<'data> {
        &mut self.sections[id.as_usize()]
    }

    pub(crate) fn len(&self) -> usize {
        self.sections.len()
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = OutputSectionId> {
        (0..self.sections.len() as u32).map(OutputSectionId)
    }
}

const CANONICAL_PREFIXES: &[&[u8]] = &[
    b".text",
    b".data.rel.ro",
    b".data",
    b".rodata",
    b".bss",
    b".init_array",
    b".fini_array",
    b".tdata",
    b".tbss",
    b".gcc_except_table",
];

/// Maps an input section name to its output section name. `.text.foo` and
/// `.text` both land in `.text`; unknown names are kept as-is.
pub(crate) fn output_name(name: &[u8]) -> &[u8] {
    for &prefix in CANONICAL_PREFIXES {
        if name == prefix {
            return prefix;
        }
        if name.len() > prefix.len() && name.starts_with(prefix) && name[prefix.len()] == b'.' {
            return prefix;
        }
    }
    name
}

// Only these flags distinguish output sections; MERGE and friends are an
// input-side concern.
const OUTPUT_FLAGS: u64 = shf::ALLOC | shf::WRITE | shf::EXECINSTR | shf::TLS;

/// Assigns an interned output section to every live loaded section and every
/// merged section.
pub(crate) fn assign_output_sections<'data>(
    files: &mut [ObjectFile<'data>],
    merged: &mut MergedSections<'data>,
    output_sections: &mut OutputSections<'data>,
) {
    for file in files.iter_mut() {
        if !file.alive() || file.is_dso {
            continue;
        }
        for slot in &mut file.sections {
            if let SectionSlot::Loaded(isec) = slot {
                let shdr: &Shdr = &isec.shdr;
                isec.output_section = output_sections.get_instance(
                    output_name(isec.name),
                    if shdr.is_nobits() {
                        object::elf::SHT_NOBITS
                    } else {
                        object::elf::SHT_PROGBITS
                    },
                    shdr.sh_flags & OUTPUT_FLAGS,
                );
            }
        }
    }
    for msec in &mut merged.sections {
        // Merged sections keep their exact input name.
        msec.output_section =
            output_sections.get_instance(msec.name, msec.shdr.sh_type, msec.shdr.sh_flags);
    }
}
