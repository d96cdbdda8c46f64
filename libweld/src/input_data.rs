//! Maps input files into memory and splits archives into their members. The
//! mappings (and, for archive members, aligned copies) own all input bytes
//! for the duration of the link; everything downstream borrows from them.

use crate::archive;
use crate::args::Args;
use crate::error::Context;
use crate::error::Result;
use crate::error::bail;
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;
use std::path::PathBuf;

pub struct InputData {
    files: Vec<LoadedFile>,
}

struct LoadedFile {
    path: PathBuf,
    mmap: Mmap,
    /// Archive members, copied out so their ELF structures are aligned.
    /// Member bodies inside an archive are only 2-byte aligned.
    members: Vec<OwnedMember>,
}

struct OwnedMember {
    name: String,
    words: Vec<u64>,
    len: usize,
}

impl OwnedMember {
    fn copy_of(name: String, data: &[u8]) -> OwnedMember {
        let mut words = vec![0u64; data.len().div_ceil(8)];
        object::bytes_of_slice_mut(&mut words)[..data.len()].copy_from_slice(data);
        OwnedMember {
            name,
            words,
            len: data.len(),
        }
    }

    fn data(&self) -> &[u8] {
        &object::bytes_of_slice(&self.words)[..self.len]
    }
}

/// One ELF object or shared object, possibly extracted from an archive.
pub(crate) struct InputBytes<'data> {
    pub(crate) name: String,
    pub(crate) archive_name: Option<String>,
    pub(crate) data: &'data [u8],
}

impl InputData {
    pub fn from_args(args: &Args) -> Result<InputData> {
        let files = args
            .inputs
            .iter()
            .map(|path| LoadedFile::open(path))
            .collect::<Result<Vec<_>>>()?;
        Ok(InputData { files })
    }

    /// Produces one entry per linkable input in command line order. Archive
    /// members keep their position so that priority based tie-breaking
    /// matches GNU ld behaviour.
    pub(crate) fn split_inputs(&self) -> Result<Vec<InputBytes<'_>>> {
        let mut inputs = Vec::new();
        for file in &self.files {
            let display = file.path.display().to_string();
            if !file.members.is_empty() {
                for member in &file.members {
                    inputs.push(InputBytes {
                        name: member.name.clone(),
                        archive_name: Some(display.clone()),
                        data: member.data(),
                    });
                }
            } else if file.mmap.starts_with(&crate::elf::ELF_MAGIC) {
                inputs.push(InputBytes {
                    name: display,
                    archive_name: None,
                    data: &file.mmap[..],
                });
            } else {
                bail!("{display}: not an ELF file or archive");
            }
        }
        Ok(inputs)
    }
}

impl LoadedFile {
    fn open(path: &Path) -> Result<LoadedFile> {
        let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("failed to mmap {}", path.display()))?;
        let mut members = Vec::new();
        if archive::is_archive(&mmap) {
            members = archive::split_members(&mmap)
                .with_context(|| format!("failed to read archive {}", path.display()))?
                .into_iter()
                .map(|member| OwnedMember::copy_of(member.name, member.data))
                .collect();
        }
        Ok(LoadedFile {
            path: path.to_owned(),
            mmap,
            members,
        })
    }
}

impl<'data> InputBytes<'data> {
    pub(crate) fn display_name(&self) -> String {
        match &self.archive_name {
            Some(archive) => format!("{archive}:{}", self.name),
            None => self.name.clone(),
        }
    }
}
