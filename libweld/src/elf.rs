//! Typed access to the bits of ELF that we work with. We use the raw
//! little-endian types from the `object` crate and give the ones we pass
//! around frequently shorter names.

use crate::error::Result;
use crate::error::bail;
use object::LittleEndian;

pub(crate) type FileHeader = object::elf::FileHeader64<LittleEndian>;
pub(crate) type ProgramHeader = object::elf::ProgramHeader64<LittleEndian>;
pub(crate) type SectionHeader = object::elf::SectionHeader64<LittleEndian>;
pub(crate) type SymtabEntry = object::elf::Sym64<LittleEndian>;
pub(crate) type Rela = object::elf::Rela64<LittleEndian>;

pub(crate) const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

pub(crate) const RELA_ENTRY_SIZE: u64 = core::mem::size_of::<Rela>() as u64;
pub(crate) const SYMTAB_ENTRY_SIZE: u64 = core::mem::size_of::<SymtabEntry>() as u64;

/// Section flags as u64 so that they can be tested against `sh_flags`
/// without casts at every use site.
pub(crate) mod shf {
    pub(crate) const WRITE: u64 = object::elf::SHF_WRITE as u64;
    pub(crate) const ALLOC: u64 = object::elf::SHF_ALLOC as u64;
    pub(crate) const EXECINSTR: u64 = object::elf::SHF_EXECINSTR as u64;
    pub(crate) const MERGE: u64 = object::elf::SHF_MERGE as u64;
    pub(crate) const STRINGS: u64 = object::elf::SHF_STRINGS as u64;
    pub(crate) const TLS: u64 = object::elf::SHF_TLS as u64;
    pub(crate) const EXCLUDE: u64 = object::elf::SHF_EXCLUDE as u64;
}

/// The section header fields that survive parsing. Input section headers are
/// copied into this form so that synthetic sections (e.g. the `.bss` backing
/// a common symbol) can be made without fabricating raw ELF bytes.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Shdr {
    pub(crate) sh_type: u32,
    pub(crate) sh_flags: u64,
    pub(crate) sh_size: u64,
    pub(crate) sh_addralign: u64,
    pub(crate) sh_entsize: u64,
}

impl Shdr {
    pub(crate) fn from_raw(shdr: &SectionHeader) -> Shdr {
        let e = LittleEndian;
        Shdr {
            sh_type: shdr.sh_type.get(e),
            sh_flags: shdr.sh_flags.get(e),
            sh_size: shdr.sh_size.get(e),
            sh_addralign: shdr.sh_addralign.get(e).max(1),
            sh_entsize: shdr.sh_entsize.get(e),
        }
    }

    pub(crate) fn is_alloc(&self) -> bool {
        self.sh_flags & shf::ALLOC != 0
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.sh_flags & shf::WRITE != 0
    }

    pub(crate) fn is_executable(&self) -> bool {
        self.sh_flags & shf::EXECINSTR != 0
    }

    pub(crate) fn is_nobits(&self) -> bool {
        self.sh_type == object::elf::SHT_NOBITS
    }
}

/// Accessors for the packed fields of a RELA entry.
pub(crate) trait RelaExt {
    fn offset(&self) -> u64;
    fn rel_type(&self) -> u32;
    fn sym(&self) -> u32;
    fn addend(&self) -> i64;
}

impl RelaExt for Rela {
    fn offset(&self) -> u64 {
        self.r_offset.get(LittleEndian)
    }

    fn rel_type(&self) -> u32 {
        (self.r_info.get(LittleEndian) & 0xffff_ffff) as u32
    }

    fn sym(&self) -> u32 {
        (self.r_info.get(LittleEndian) >> 32) as u32
    }

    fn addend(&self) -> i64 {
        self.r_addend.get(LittleEndian)
    }
}

pub(crate) fn make_rela(offset: u64, rel_type: u32, sym: u32, addend: i64) -> Rela {
    let e = LittleEndian;
    Rela {
        r_offset: object::U64::new(e, offset),
        r_info: object::U64::new(e, (u64::from(sym) << 32) | u64::from(rel_type)),
        r_addend: object::I64::new(e, addend),
    }
}

/// Reads a null-terminated string from a string table.
pub(crate) fn get_string(strtab: &[u8], offset: u32) -> Result<&[u8]> {
    let start = offset as usize;
    if start > strtab.len() {
        bail!("string table offset {offset} out of bounds");
    }
    match strtab[start..].iter().position(|&b| b == 0) {
        Some(end) => Ok(&strtab[start..start + end]),
        None => bail!("unterminated string table entry"),
    }
}

/// Sections whose names are valid C identifiers are reachable via
/// `__start_<name>`/`__stop_<name>` symbols and must keep their identity.
pub(crate) fn is_c_identifier(name: &[u8]) -> bool {
    let Some(&first) = name.first() else {
        return false;
    };
    if !first.is_ascii_alphabetic() && first != b'_' {
        return false;
    }
    name[1..].iter().all(|&b| b.is_ascii_alphanumeric() || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn c_identifiers() {
        assert!(is_c_identifier(b"my_section"));
        assert!(is_c_identifier(b"_private"));
        assert!(!is_c_identifier(b".text.enum"));
        assert!(!is_c_identifier(b"4chan"));
        assert!(!is_c_identifier(b""));
    }

    #[test]
    fn string_table_lookup() {
        let strtab = b"\0foo\0bar\0";
        assert_eq!(get_string(strtab, 1).unwrap(), b"foo");
        assert_eq!(get_string(strtab, 5).unwrap(), b"bar");
        assert!(get_string(strtab, 100).is_err());
        assert!(get_string(b"nope", 0).is_err());
    }

    #[test]
    fn rela_field_packing() {
        let rela = make_rela(0x1000, object::elf::R_X86_64_PC32, 7, -4);
        assert_eq!(rela.offset(), 0x1000);
        assert_eq!(rela.rel_type(), object::elf::R_X86_64_PC32);
        assert_eq!(rela.sym(), 7);
        assert_eq!(rela.addend(), -4);
    }
}
