//! Raw ELF64 little-endian structures and the relocation tables used by the
//! scanner and applier. The structures are plain-old-data so that they can be
//! cast directly out of memory-mapped input files.

use crate::error::Result;
use anyhow::bail;
use anyhow::Context as _;
use bytemuck::Pod;
use bytemuck::Zeroable;

/// Our starting address in memory when linking non-relocatable executables.
/// The same value ld uses; a distinctive non-zero base makes it obvious when a
/// file offset is mixed up with a memory address.
pub(crate) const NON_PIE_START_MEM_ADDRESS: u64 = 0x400_000;

pub(crate) const GOT_ENTRY_SIZE: u64 = 8;
pub(crate) const PLT_ENTRY_SIZE: u64 = 16;
pub(crate) const RELA_ENTRY_SIZE: u64 = 24;

#[derive(Zeroable, Pod, Clone, Copy)]
#[repr(C)]
pub(crate) struct FileHeader {
    pub(crate) magic: [u8; 4],
    pub(crate) class: u8,
    pub(crate) data: u8,
    pub(crate) ei_version: u8,
    pub(crate) os_abi: u8,
    pub(crate) abi_version: u8,
    pub(crate) padding: [u8; 7],
    pub(crate) ty: u16,
    pub(crate) machine: u16,
    pub(crate) e_version: u32,
    pub(crate) entry_point: u64,
    pub(crate) program_header_offset: u64,
    pub(crate) section_header_offset: u64,
    pub(crate) flags: u32,
    pub(crate) ehsize: u16,
    pub(crate) program_header_entry_size: u16,
    pub(crate) program_header_num: u16,
    pub(crate) section_header_entry_size: u16,
    pub(crate) section_header_num: u16,
    pub(crate) section_names_index: u16,
}

#[derive(Zeroable, Pod, Clone, Copy, Debug)]
#[repr(C)]
pub(crate) struct SectionHeader {
    pub(crate) name: u32,
    pub(crate) ty: u32,
    pub(crate) flags: u64,
    pub(crate) address: u64,
    pub(crate) offset: u64,
    pub(crate) size: u64,
    pub(crate) link: u32,
    pub(crate) info: u32,
    pub(crate) alignment: u64,
    pub(crate) entsize: u64,
}

impl SectionHeader {
    pub(crate) fn has_flag(&self, flag: u32) -> bool {
        self.flags & u64::from(flag) != 0
    }
}

#[derive(Zeroable, Pod, Clone, Copy, Debug)]
#[repr(C)]
pub(crate) struct SymtabEntry {
    pub(crate) name: u32,
    pub(crate) info: u8,
    pub(crate) other: u8,
    pub(crate) shndx: u16,
    pub(crate) value: u64,
    pub(crate) size: u64,
}

impl SymtabEntry {
    pub(crate) fn binding(&self) -> u8 {
        self.info >> 4
    }

    pub(crate) fn sym_type(&self) -> u8 {
        self.info & 0xf
    }

    pub(crate) fn visibility(&self) -> u8 {
        self.other & 0x3
    }

    pub(crate) fn is_weak(&self) -> bool {
        self.binding() == object::elf::STB_WEAK
    }

    pub(crate) fn is_undefined(&self) -> bool {
        self.shndx == object::elf::SHN_UNDEF
    }

    /// Common symbols count as defined; they get materialised as BSS later.
    pub(crate) fn is_defined(&self) -> bool {
        !self.is_undefined()
    }

    pub(crate) fn is_common(&self) -> bool {
        self.shndx == object::elf::SHN_COMMON
    }

    pub(crate) fn is_absolute(&self) -> bool {
        self.shndx == object::elf::SHN_ABS
    }

    /// Returns the index of the section this symbol is defined in, if it's
    /// defined in a regular section of its own file.
    pub(crate) fn section_index(&self) -> Option<usize> {
        if self.is_undefined() || self.is_absolute() || self.is_common() {
            return None;
        }
        Some(usize::from(self.shndx))
    }
}

#[derive(Zeroable, Pod, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub(crate) struct Rela {
    pub(crate) offset: u64,
    pub(crate) info: u64,
    pub(crate) addend: i64,
}

impl Rela {
    pub(crate) fn new(offset: u64, r_type: u32, r_sym: u32, addend: i64) -> Self {
        Self {
            offset,
            info: (u64::from(r_sym) << 32) | u64::from(r_type),
            addend,
        }
    }

    pub(crate) fn r_sym(&self) -> usize {
        (self.info >> 32) as usize
    }

    pub(crate) fn r_type(&self) -> u32 {
        self.info as u32
    }
}

const _ASSERTS: () = {
    assert!(size_of::<FileHeader>() == 0x40);
    assert!(size_of::<SectionHeader>() == 0x40);
    assert!(size_of::<SymtabEntry>() == 24);
    assert!(size_of::<Rela>() == RELA_ENTRY_SIZE as usize);
};

/// Casts `count` records of type `T` out of `data` starting at `offset`.
pub(crate) fn slice_from_bytes<T: Pod>(data: &[u8], offset: usize, count: usize) -> Result<&[T]> {
    let size = count
        .checked_mul(size_of::<T>())
        .context("Section size overflow")?;
    let end = offset.checked_add(size).context("Section extent overflow")?;
    if end > data.len() {
        bail!("Section extends past the end of the file");
    }
    bytemuck::try_cast_slice(&data[offset..end])
        .map_err(|_| anyhow::anyhow!("Misaligned table in input file"))
}

/// Returns the null-terminated string at `offset` within `strtab`.
pub(crate) fn strtab_get(strtab: &[u8], offset: usize) -> Result<&[u8]> {
    let rest = strtab
        .get(offset..)
        .context("String table offset out of bounds")?;
    let len = memchr::memchr(0, rest).context("Unterminated string table")?;
    Ok(&rest[..len])
}

/// The abstract action a relocation was classified into by the scanner. The
/// applier dispatches on this rather than on the raw relocation type, so all
/// policy decisions (PLT vs direct, dynamic vs static, TLS relaxation) are
/// made exactly once.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub(crate) enum RelType {
    #[default]
    None,
    /// Write `S + A`.
    Abs,
    /// Write `S + A` and emit a RELATIVE dynamic relocation at `P`.
    AbsDyn,
    /// Emit an `R_X86_64_64` dynamic relocation carrying the symbol index.
    Dyn,
    /// Write `S + A - P`.
    Pc,
    /// Write `G + A`.
    Got,
    /// Write `GOT + A - P`.
    GotPc,
    /// Write `G + GOT + A - P`.
    GotPcRel,
    TlsGd,
    /// GD -> LE rewrite; consumes the following relocation.
    TlsGdRelaxLe,
    TlsLd,
    /// LD -> LE rewrite; consumes the following relocation.
    TlsLdRelaxLe,
    /// Write `S + A - tls_begin`.
    DtpOff,
    /// Write `S + A - tls_end`.
    TpOff,
    GotTpOff,
}

pub(crate) fn rel_type_to_string(r_type: u32) -> &'static str {
    match r_type {
        object::elf::R_X86_64_NONE => "R_X86_64_NONE",
        object::elf::R_X86_64_8 => "R_X86_64_8",
        object::elf::R_X86_64_16 => "R_X86_64_16",
        object::elf::R_X86_64_32 => "R_X86_64_32",
        object::elf::R_X86_64_32S => "R_X86_64_32S",
        object::elf::R_X86_64_64 => "R_X86_64_64",
        object::elf::R_X86_64_PC8 => "R_X86_64_PC8",
        object::elf::R_X86_64_PC16 => "R_X86_64_PC16",
        object::elf::R_X86_64_PC32 => "R_X86_64_PC32",
        object::elf::R_X86_64_PC64 => "R_X86_64_PC64",
        object::elf::R_X86_64_GOT32 => "R_X86_64_GOT32",
        object::elf::R_X86_64_GOTPC32 => "R_X86_64_GOTPC32",
        object::elf::R_X86_64_GOTPCREL => "R_X86_64_GOTPCREL",
        object::elf::R_X86_64_GOTPCRELX => "R_X86_64_GOTPCRELX",
        object::elf::R_X86_64_REX_GOTPCRELX => "R_X86_64_REX_GOTPCRELX",
        object::elf::R_X86_64_PLT32 => "R_X86_64_PLT32",
        object::elf::R_X86_64_TLSGD => "R_X86_64_TLSGD",
        object::elf::R_X86_64_TLSLD => "R_X86_64_TLSLD",
        object::elf::R_X86_64_TPOFF32 => "R_X86_64_TPOFF32",
        object::elf::R_X86_64_DTPOFF32 => "R_X86_64_DTPOFF32",
        object::elf::R_X86_64_TPOFF64 => "R_X86_64_TPOFF64",
        object::elf::R_X86_64_DTPOFF64 => "R_X86_64_DTPOFF64",
        object::elf::R_X86_64_GOTTPOFF => "R_X86_64_GOTTPOFF",
        object::elf::R_X86_64_RELATIVE => "R_X86_64_RELATIVE",
        _ => "R_X86_64_<unknown>",
    }
}

/// The range of values a relocation of the given type accepts.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ValueRange {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    Unchecked,
}

pub(crate) fn value_range(r_type: u32) -> ValueRange {
    match r_type {
        object::elf::R_X86_64_8 => ValueRange::U8,
        object::elf::R_X86_64_PC8 => ValueRange::I8,
        object::elf::R_X86_64_16 => ValueRange::U16,
        object::elf::R_X86_64_PC16 => ValueRange::I16,
        object::elf::R_X86_64_32 => ValueRange::U32,
        object::elf::R_X86_64_32S
        | object::elf::R_X86_64_PC32
        | object::elf::R_X86_64_GOT32
        | object::elf::R_X86_64_GOTPC32
        | object::elf::R_X86_64_GOTPCREL
        | object::elf::R_X86_64_GOTPCRELX
        | object::elf::R_X86_64_REX_GOTPCRELX
        | object::elf::R_X86_64_PLT32
        | object::elf::R_X86_64_TLSGD
        | object::elf::R_X86_64_TLSLD
        | object::elf::R_X86_64_TPOFF32
        | object::elf::R_X86_64_DTPOFF32
        | object::elf::R_X86_64_GOTTPOFF => ValueRange::I32,
        _ => ValueRange::Unchecked,
    }
}

impl ValueRange {
    pub(crate) fn contains(self, value: u64) -> bool {
        match self {
            ValueRange::U8 => value == u64::from(value as u8),
            ValueRange::I8 => value as i64 == i64::from(value as i8),
            ValueRange::U16 => value == u64::from(value as u16),
            ValueRange::I16 => value as i64 == i64::from(value as i16),
            ValueRange::U32 => value == u64::from(value as u32),
            ValueRange::I32 => value as i64 == i64::from(value as i32),
            ValueRange::Unchecked => true,
        }
    }

    pub(crate) fn is_signed(self) -> bool {
        matches!(self, ValueRange::I8 | ValueRange::I16 | ValueRange::I32)
    }

    pub(crate) fn bounds(self) -> &'static str {
        match self {
            ValueRange::U8 => "[0, 255]",
            ValueRange::I8 => "[-128, 127]",
            ValueRange::U16 => "[0, 65535]",
            ValueRange::I16 => "[-32768, 32767]",
            ValueRange::U32 => "[0, 4294967295]",
            ValueRange::I32 => "[-2147483648, 2147483647]",
            ValueRange::Unchecked => "(unchecked)",
        }
    }
}

/// How many bytes a relocation of the given type writes.
pub(crate) fn write_size(r_type: u32) -> usize {
    match r_type {
        object::elf::R_X86_64_NONE => 0,
        object::elf::R_X86_64_8 | object::elf::R_X86_64_PC8 => 1,
        object::elf::R_X86_64_16 | object::elf::R_X86_64_PC16 => 2,
        object::elf::R_X86_64_64
        | object::elf::R_X86_64_PC64
        | object::elf::R_X86_64_TPOFF64
        | object::elf::R_X86_64_DTPOFF64 => 8,
        _ => 4,
    }
}

/// Stores `value` little-endian at `offset`, with the width implied by the
/// relocation type.
pub(crate) fn write_value(r_type: u32, out: &mut [u8], offset: usize, value: u64) -> Result {
    let size = write_size(r_type);
    let end = offset + size;
    if out.len() < end {
        bail!("Relocation outside the bounds of its section");
    }
    out[offset..end].copy_from_slice(&value.to_le_bytes()[..size]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_ranges() {
        assert!(value_range(object::elf::R_X86_64_8).contains(255));
        assert!(!value_range(object::elf::R_X86_64_8).contains(256));
        assert!(value_range(object::elf::R_X86_64_PC8).contains((-128i64) as u64));
        assert!(!value_range(object::elf::R_X86_64_PC8).contains(128));
        assert!(value_range(object::elf::R_X86_64_32).contains(u64::from(u32::MAX)));
        assert!(!value_range(object::elf::R_X86_64_32).contains(1 << 32));
        assert!(value_range(object::elf::R_X86_64_PC32).contains((-1i64) as u64));
        assert!(!value_range(object::elf::R_X86_64_32S).contains(1 << 31));
        assert!(value_range(object::elf::R_X86_64_64).contains(u64::MAX));
    }

    #[test]
    fn write_widths() {
        let mut buf = [0u8; 8];
        write_value(object::elf::R_X86_64_32, &mut buf, 0, 0x1122_3344).unwrap();
        assert_eq!(buf, [0x44, 0x33, 0x22, 0x11, 0, 0, 0, 0]);
        write_value(object::elf::R_X86_64_16, &mut buf, 6, 0xbeef).unwrap();
        assert_eq!(&buf[6..], &[0xef, 0xbe]);
        assert!(write_value(object::elf::R_X86_64_64, &mut buf, 4, 0).is_err());
    }

    #[test]
    fn symtab_entry_accessors() {
        let entry = SymtabEntry {
            name: 1,
            info: (object::elf::STB_WEAK << 4) | object::elf::STT_FUNC,
            other: object::elf::STV_HIDDEN,
            shndx: 3,
            value: 0x10,
            size: 4,
        };
        assert!(entry.is_weak());
        assert_eq!(entry.sym_type(), object::elf::STT_FUNC);
        assert_eq!(entry.visibility(), object::elf::STV_HIDDEN);
        assert_eq!(entry.section_index(), Some(3));
        let common = SymtabEntry {
            shndx: object::elf::SHN_COMMON,
            ..entry
        };
        assert!(common.is_common());
        assert!(common.is_defined());
        assert_eq!(common.section_index(), None);
    }

    #[test]
    fn rela_field_packing() {
        let rela = Rela::new(0x20, object::elf::R_X86_64_PC32, 7, -4);
        assert_eq!(rela.r_sym(), 7);
        assert_eq!(rela.r_type(), object::elf::R_X86_64_PC32);
        assert_eq!(rela.addend, -4);
    }
}
