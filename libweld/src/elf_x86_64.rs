//! x86-64 specific encoding knowledge: the abstract relocation kinds the
//! scanner assigns, value range checks, patch widths, the TLS relaxation
//! instruction sequences and the PLT entry layout.

use object::elf::*;
use std::borrow::Cow;

/// Classification assigned to each relocation by `scan_relocations` and
/// consumed by the applier. This is deliberately independent of the wire
/// level `R_X86_64_*` code, which only selects the patch width and range
/// check.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub(crate) enum RelKind {
    #[default]
    None,
    Abs,
    AbsDyn,
    Dyn,
    Pc,
    Got,
    GotPc,
    GotPcRel,
    TlsGd,
    TlsGdRelaxLe,
    TlsLd,
    TlsLdRelaxLe,
    DtpOff,
    TpOff,
    GotTpOff,
}

pub(crate) fn rel_type_to_string(r_type: u32) -> Cow<'static, str> {
    let s = match r_type {
        R_X86_64_NONE => "R_X86_64_NONE",
        R_X86_64_8 => "R_X86_64_8",
        R_X86_64_16 => "R_X86_64_16",
        R_X86_64_32 => "R_X86_64_32",
        R_X86_64_32S => "R_X86_64_32S",
        R_X86_64_64 => "R_X86_64_64",
        R_X86_64_PC8 => "R_X86_64_PC8",
        R_X86_64_PC16 => "R_X86_64_PC16",
        R_X86_64_PC32 => "R_X86_64_PC32",
        R_X86_64_PC64 => "R_X86_64_PC64",
        R_X86_64_GOT32 => "R_X86_64_GOT32",
        R_X86_64_GOTPC32 => "R_X86_64_GOTPC32",
        R_X86_64_GOTPCREL => "R_X86_64_GOTPCREL",
        R_X86_64_GOTPCRELX => "R_X86_64_GOTPCRELX",
        R_X86_64_REX_GOTPCRELX => "R_X86_64_REX_GOTPCRELX",
        R_X86_64_PLT32 => "R_X86_64_PLT32",
        R_X86_64_TLSGD => "R_X86_64_TLSGD",
        R_X86_64_TLSLD => "R_X86_64_TLSLD",
        R_X86_64_TPOFF32 => "R_X86_64_TPOFF32",
        R_X86_64_DTPOFF32 => "R_X86_64_DTPOFF32",
        R_X86_64_TPOFF64 => "R_X86_64_TPOFF64",
        R_X86_64_DTPOFF64 => "R_X86_64_DTPOFF64",
        R_X86_64_GOTTPOFF => "R_X86_64_GOTTPOFF",
        _ => return Cow::Owned(format!("unknown relocation type {r_type}")),
    };
    Cow::Borrowed(s)
}

/// Checks a computed relocation value against the range the psABI allows for
/// the relocation's width. Returns a description of the violation, if any.
/// 64-bit relocations and NONE are unchecked.
pub(crate) fn check_range(r_type: u32, val: u64) -> Option<String> {
    match r_type {
        R_X86_64_8 => {
            (val > u8::MAX.into()).then(|| format!("{val} is not in [0, 255]"))
        }
        R_X86_64_PC8 => {
            let v = val as i64;
            (i64::from(val as u8 as i8) != v).then(|| format!("{v} is not in [-128, 127]"))
        }
        R_X86_64_16 => {
            (val > u16::MAX.into()).then(|| format!("{val} is not in [0, 65535]"))
        }
        R_X86_64_PC16 => {
            let v = val as i64;
            (i64::from(val as u16 as i16) != v).then(|| format!("{v} is not in [-32768, 32767]"))
        }
        R_X86_64_32 => {
            (val > u32::MAX.into()).then(|| format!("{val} is not in [0, 4294967295]"))
        }
        R_X86_64_32S | R_X86_64_PC32 | R_X86_64_GOT32 | R_X86_64_GOTPC32 | R_X86_64_GOTPCREL
        | R_X86_64_GOTPCRELX | R_X86_64_REX_GOTPCRELX | R_X86_64_PLT32 | R_X86_64_TLSGD
        | R_X86_64_TLSLD | R_X86_64_TPOFF32 | R_X86_64_DTPOFF32 | R_X86_64_GOTTPOFF => {
            let v = val as i64;
            (i64::from(val as u32 as i32) != v)
                .then(|| format!("{v} is not in [-2147483648, 2147483647]"))
        }
        R_X86_64_NONE | R_X86_64_64 | R_X86_64_PC64 | R_X86_64_TPOFF64 | R_X86_64_DTPOFF64 => {
            None
        }
        _ => unreachable!("unclassified relocation type {r_type} reached range check"),
    }
}

/// Patches a relocation site with `val`, using the width implied by the wire
/// level relocation type. Writes are little-endian and unaligned-safe.
pub(crate) fn write_val(r_type: u32, loc: &mut [u8], val: u64) {
    match r_type {
        R_X86_64_NONE => {}
        R_X86_64_8 | R_X86_64_PC8 => loc[0] = val as u8,
        R_X86_64_16 | R_X86_64_PC16 => {
            loc[..2].copy_from_slice(&(val as u16).to_le_bytes());
        }
        R_X86_64_32 | R_X86_64_32S | R_X86_64_PC32 | R_X86_64_GOT32 | R_X86_64_GOTPC32
        | R_X86_64_GOTPCREL | R_X86_64_GOTPCRELX | R_X86_64_REX_GOTPCRELX | R_X86_64_PLT32
        | R_X86_64_TLSGD | R_X86_64_TLSLD | R_X86_64_TPOFF32 | R_X86_64_DTPOFF32
        | R_X86_64_GOTTPOFF => {
            loc[..4].copy_from_slice(&(val as u32).to_le_bytes());
        }
        R_X86_64_64 | R_X86_64_PC64 | R_X86_64_TPOFF64 | R_X86_64_DTPOFF64 => {
            loc[..8].copy_from_slice(&val.to_le_bytes());
        }
        _ => unreachable!("unclassified relocation type {r_type} reached write_val"),
    }
}

/// The number of bytes `write_val` touches for the given relocation type.
pub(crate) fn write_width(r_type: u32) -> usize {
    match r_type {
        R_X86_64_NONE => 0,
        R_X86_64_8 | R_X86_64_PC8 => 1,
        R_X86_64_16 | R_X86_64_PC16 => 2,
        R_X86_64_64 | R_X86_64_PC64 | R_X86_64_TPOFF64 | R_X86_64_DTPOFF64 => 8,
        _ => 4,
    }
}

/// Replacement for `lea x@tlsgd(%rip), %rdi; call __tls_get_addr@plt` when a
/// general-dynamic TLS access is relaxed to local-exec:
///
/// ```text
/// mov %fs:0, %rax
/// lea x@tpoff(%rax), %rax
/// ```
///
/// The sequence replaces 16 bytes starting 4 bytes before the relocation
/// site; the trailing 32-bit field is patched with the tpoff value.
pub(crate) const TLSGD_TO_LE: [u8; 16] = [
    0x64, 0x48, 0x8b, 0x04, 0x25, 0, 0, 0, 0, // mov %fs:0, %rax
    0x48, 0x8d, 0x80, 0, 0, 0, 0, // lea x@tpoff, %rax
];

/// Replacement for `lea x@tlsld(%rip), %rdi; call __tls_get_addr@plt` when a
/// local-dynamic TLS access is relaxed to local-exec. The three 0x66
/// prefixes pad the 9-byte mov to fill the 12 bytes starting 3 bytes before
/// the relocation site.
pub(crate) const TLSLD_TO_LE: [u8; 12] = [
    0x66, 0x66, 0x66, 0x64, 0x48, 0x8b, 0x04, 0x25, 0, 0, 0, 0, // mov %fs:0, %rax
];

pub(crate) const PLT_ENTRY_SIZE: u64 = 16;

const PLT_ENTRY_TEMPLATE: &[u8] = &[
    0xff, 0x25, 0, 0, 0, 0, // jmp *got(%rip)
    0x68, 0, 0, 0, 0, // push $index
    0xe9, 0, 0, 0, 0, // jmp plt[0]
];

const _ASSERTS: () = {
    assert!(PLT_ENTRY_TEMPLATE.len() as u64 == PLT_ENTRY_SIZE);
};

/// Writes the lazy-binding PLT header. `got_address` is the base of the
/// region holding the PLT's GOT slots.
pub(crate) fn write_plt_header(plt_entry: &mut [u8], got_address: u64, plt_address: u64) {
    let template: &[u8] = &[
        0xff, 0x35, 0, 0, 0, 0, // push got[1](%rip)
        0xff, 0x25, 0, 0, 0, 0, // jmp *got[2](%rip)
        0x0f, 0x1f, 0x40, 0x00, // nop
    ];
    plt_entry.copy_from_slice(template);
    let rel = |target: u64, insn_end: u64| (target.wrapping_sub(insn_end) as u32).to_le_bytes();
    plt_entry[2..6].copy_from_slice(&rel(got_address + 8, plt_address + 6));
    plt_entry[8..12].copy_from_slice(&rel(got_address + 16, plt_address + 12));
}

pub(crate) fn write_plt_entry(
    plt_entry: &mut [u8],
    got_address: u64,
    plt_address: u64,
    index: u32,
) {
    plt_entry.copy_from_slice(PLT_ENTRY_TEMPLATE);
    let jmp_rel = got_address.wrapping_sub(plt_address + 6) as u32;
    plt_entry[2..6].copy_from_slice(&jmp_rel.to_le_bytes());
    plt_entry[7..11].copy_from_slice(&index.to_le_bytes());
    // This entry sits (index + 1) slots after the header; the jump lands on
    // the header from the end of the entry.
    let plt0_rel = 0u64.wrapping_sub((u64::from(index) + 2) * PLT_ENTRY_SIZE) as u32;
    plt_entry[12..16].copy_from_slice(&plt0_rel.to_le_bytes());
}
