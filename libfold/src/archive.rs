//! `ar` archive support. An archive is flat: a magic line, then a run of
//! members, each a fixed 60-byte ASCII header followed by the member's bytes.
//! Names longer than 15 characters live in a shared name-table member; the
//! parser resolves those up front so callers only ever see finished names
//! borrowed from the mapped file.

use crate::error::Result;
use anyhow::bail;
use anyhow::Context as _;

/// One object held in an archive.
pub(crate) struct ArchiveMember<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) data: &'data [u8],
}

const MAGIC: &[u8] = b"!<arch>\n";
const HEADER_LEN: usize = 60;
// Field layout of the member header. All fields are space-padded ASCII.
const NAME_END: usize = 16;
const SIZE_START: usize = 48;
const SIZE_END: usize = 58;
const END_MARKER: &[u8] = b"`\n";

/// Reads every regular member of an archive. The symbol index member is
/// skipped entirely: members are loaded eagerly, so the index has nothing to
/// tell us.
pub(crate) fn parse_archive(archive: &[u8]) -> Result<Vec<ArchiveMember>> {
    let Some(body) = archive.strip_prefix(MAGIC) else {
        bail!("Not an ar archive");
    };
    let mut members = Vec::new();
    let mut name_table: &[u8] = &[];
    let mut pos = 0;
    while pos + HEADER_LEN <= body.len() {
        let header = &body[pos..pos + HEADER_LEN];
        if &header[SIZE_END..] != END_MARKER {
            bail!("Archive member header at offset {pos} is corrupt");
        }
        let size = ascii_number(&header[SIZE_START..SIZE_END])
            .with_context(|| format!("Bad size in archive member header at offset {pos}"))?;
        let content = body
            .get(pos + HEADER_LEN..pos + HEADER_LEN + size)
            .context("Archive member extends past the end of the file")?;

        match trim_padding(&header[..NAME_END]) {
            b"/" => {}
            b"//" => name_table = content,
            raw_name => members.push(ArchiveMember {
                name: resolve_name(raw_name, name_table)?,
                data: content,
            }),
        }

        // Members always begin on even offsets; a member with an odd size is
        // followed by one padding byte.
        pos += HEADER_LEN + size + (size & 1);
    }
    if pos < body.len() {
        bail!("Truncated archive member header at offset {pos}");
    }
    Ok(members)
}

/// Short names are stored inline in the header and end at a `/`; long names
/// are `/offset` references into the shared name table, where each entry is
/// terminated by `/\n`.
fn resolve_name<'data>(raw_name: &'data [u8], name_table: &'data [u8]) -> Result<&'data [u8]> {
    if let Some(digits) = raw_name.strip_prefix(b"/") {
        if !digits.is_empty() {
            let start = ascii_number(digits).context("Bad long-name reference")?;
            let entry = name_table
                .get(start..)
                .context("Long-name reference outside the name table")?;
            let end = entry
                .iter()
                .position(|&b| b == b'/' || b == b'\n')
                .unwrap_or(entry.len());
            return Ok(&entry[..end]);
        }
    }
    let end = raw_name
        .iter()
        .position(|&b| b == b'/')
        .unwrap_or(raw_name.len());
    Ok(&raw_name[..end])
}

fn trim_padding(field: &[u8]) -> &[u8] {
    let end = field.iter().rposition(|&b| b != b' ').map_or(0, |i| i + 1);
    &field[..end]
}

/// Parses a space-padded decimal field. Unlike a plain digit scan, anything
/// that isn't digits-then-padding is rejected.
fn ascii_number(field: &[u8]) -> Result<usize> {
    let digits = trim_padding(field);
    if digits.is_empty() || !digits.iter().all(|b| b.is_ascii_digit()) {
        bail!("Expected a decimal number, got `{}`", String::from_utf8_lossy(field));
    }
    let mut value = 0usize;
    for &digit in digits {
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add(usize::from(digit - b'0')))
            .context("Decimal field overflow")?;
    }
    Ok(value)
}

#[cfg(test)]
pub(crate) mod test_support {
    /// Builds archive bytes from (name, data) members, using the
    /// extended-filenames member for all names so that long names are
    /// exercised.
    pub(crate) fn build_archive(members: &[(&str, &[u8])]) -> Vec<u8> {
        let mut names = Vec::new();
        let mut name_offsets = Vec::new();
        for (name, _) in members {
            name_offsets.push(names.len());
            names.extend_from_slice(name.as_bytes());
            names.extend_from_slice(b"/\n");
        }

        let mut out = b"!<arch>\n".to_vec();
        push_member(&mut out, "//", &names);
        for ((_, data), offset) in members.iter().zip(&name_offsets) {
            push_member(&mut out, &format!("/{offset}"), data);
        }
        out
    }

    pub(crate) fn push_member(out: &mut Vec<u8>, ident: &str, data: &[u8]) {
        out.extend_from_slice(format!("{ident:<16}").as_bytes());
        out.extend_from_slice(b"0           ");
        out.extend_from_slice(b"0     0     ");
        out.extend_from_slice(b"644     ");
        out.extend_from_slice(format!("{:<10}", data.len()).as_bytes());
        out.extend_from_slice(b"`\n");
        out.extend_from_slice(data);
        if data.len() % 2 == 1 {
            out.push(b'\n');
        }
    }
}
