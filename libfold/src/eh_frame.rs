//! Splits `.eh_frame` into its CIE and FDE records and attaches each FDE to
//! the section whose code it describes. The records aren't rewritten here;
//! they exist so that unwind information counts towards section content
//! equality when sections are folded.

use crate::error::Result;
use crate::parsing::ObjectFile;
use crate::section::FdeRecord;
use anyhow::bail;

pub(crate) fn associate_fdes(file: &mut ObjectFile) -> Result {
    let mut records = Vec::new();
    for slot in &file.sections {
        let Some(section) = slot else { continue };
        if section.name != b".eh_frame" {
            continue;
        }
        let data = section.data;
        let rels = section.rels;
        let mut offset = 0usize;
        while offset + 8 <= data.len() {
            let length = read_u32(data, offset) as usize;
            if length == 0 {
                break;
            }
            if length == 0xffff_ffff {
                bail!("{}: 64 bit .eh_frame entries are not supported", file.input);
            }
            let end = offset + 4 + length;
            if end > data.len() {
                bail!("{}: truncated .eh_frame entry", file.input);
            }
            // The word after the length distinguishes CIEs (zero) from FDEs.
            let is_fde = read_u32(data, offset + 4) != 0;
            if is_fde {
                let lo = rels.partition_point(|r| r.offset < offset as u64);
                let hi = rels.partition_point(|r| r.offset < end as u64);
                let fde_rels = &rels[lo..hi];
                // The first relocation is for pc_begin and identifies the
                // function section this FDE belongs to.
                if let Some(first) = fde_rels.first() {
                    if let Some(esym) = file.symtab.get(first.r_sym()) {
                        if let Some(target) = esym.section_index() {
                            records.push((
                                target,
                                FdeRecord {
                                    data: &data[offset..end],
                                    rels: fde_rels,
                                },
                            ));
                        }
                    }
                }
            }
            offset = end;
        }
    }
    for (target, record) in records {
        if let Some(Some(section)) = file.sections.get_mut(target) {
            section.fdes.push(record);
        }
    }
    Ok(())
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}
