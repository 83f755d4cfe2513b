//! Identifies what sort of input we're dealing with from its leading bytes.

use crate::elf::FileHeader;
use crate::error::Result;
use anyhow::bail;

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub(crate) enum FileKind {
    ElfObject,
    ElfDynamic,
    Archive,
}

impl FileKind {
    pub(crate) fn identify_bytes(bytes: &[u8]) -> Result<FileKind> {
        if bytes.starts_with(b"!<arch>\n") {
            return Ok(FileKind::Archive);
        }
        if !bytes.starts_with(&object::elf::ELFMAG) {
            bail!("Not an ELF file or archive");
        }
        const HEADER_LEN: usize = size_of::<FileHeader>();
        if bytes.len() < HEADER_LEN {
            bail!("Invalid ELF file");
        }
        let header: FileHeader = bytemuck::pod_read_unaligned(&bytes[..HEADER_LEN]);
        if header.class != object::elf::ELFCLASS64 {
            bail!("Only 64 bit ELF is supported");
        }
        if header.data != object::elf::ELFDATA2LSB {
            bail!("Only little endian is supported");
        }
        match header.ty {
            object::elf::ET_REL => Ok(FileKind::ElfObject),
            object::elf::ET_DYN => Ok(FileKind::ElfDynamic),
            t => bail!("Unsupported ELF type {t}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identify() {
        assert_eq!(
            FileKind::identify_bytes(b"!<arch>\nrest").unwrap(),
            FileKind::Archive
        );
        assert!(FileKind::identify_bytes(b"not elf").is_err());

        let mut header = [0u8; 64];
        header[..4].copy_from_slice(&object::elf::ELFMAG);
        header[4] = object::elf::ELFCLASS64;
        header[5] = object::elf::ELFDATA2LSB;
        header[16] = object::elf::ET_REL as u8;
        assert_eq!(
            FileKind::identify_bytes(&header).unwrap(),
            FileKind::ElfObject
        );
        header[16] = object::elf::ET_DYN as u8;
        assert_eq!(
            FileKind::identify_bytes(&header).unwrap(),
            FileKind::ElfDynamic
        );
        header[4] = object::elf::ELFCLASS32;
        assert!(FileKind::identify_bytes(&header).is_err());
    }
}
