//! Mergeable sections get split into fragments that are deduplicated across
//! the whole link. A fragment is identified by its bytes and alignment; the
//! shared table hands back a stable id so that relocations and symbols can
//! refer to the surviving copy.

use crate::error::Result;
use anyhow::bail;
use foldhash::fast::FixedState;
use std::collections::HashMap;
use std::hash::BuildHasher;
use std::sync::Mutex;

const FRAGMENT_BUCKETS: usize = 16;
const BUCKET_BITS: u32 = 4;

/// Identifies a unique fragment in the shared table.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub(crate) struct FragmentId(u32);

impl FragmentId {
    fn new(bucket: usize, index: usize) -> FragmentId {
        FragmentId(((index as u32) << BUCKET_BITS) | bucket as u32)
    }

    fn bucket(self) -> usize {
        (self.0 as usize) & (FRAGMENT_BUCKETS - 1)
    }

    fn index(self) -> usize {
        (self.0 >> BUCKET_BITS) as usize
    }
}

#[derive(PartialEq, Eq, Hash, Clone, Copy)]
struct FragKey<'data> {
    bytes: &'data [u8],
    alignment: u16,
}

pub(crate) struct Fragment<'data> {
    pub(crate) data: &'data [u8],
    pub(crate) alignment: u16,
    /// Assigned once layout has run.
    pub(crate) address: u64,
}

#[derive(Default)]
struct Bucket<'data> {
    ids: HashMap<FragKey<'data>, u32, FixedState>,
    frags: Vec<Fragment<'data>>,
}

/// The process-wide fragment table. Inserts are keyed by content and
/// alignment and are safe from any thread; buckets keep lock contention down
/// while fragments pour in from parallel section splitting.
pub(crate) struct FragmentTable<'data> {
    buckets: [Mutex<Bucket<'data>>; FRAGMENT_BUCKETS],
}

impl<'data> FragmentTable<'data> {
    pub(crate) fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| Mutex::new(Bucket::default())),
        }
    }

    /// Inserts a slice, deduplicating against previous inserts of the same
    /// bytes and alignment. The bucket is picked by content alone, so both
    /// alignments of the same bytes land behind one lock.
    pub(crate) fn insert(&self, bytes: &'data [u8], alignment: u16) -> FragmentId {
        let bucket_index =
            (FixedState::default().hash_one(bytes) as usize) & (FRAGMENT_BUCKETS - 1);
        let key = FragKey { bytes, alignment };
        let mut bucket = self.buckets[bucket_index].lock().unwrap();
        if let Some(&index) = bucket.ids.get(&key) {
            return FragmentId::new(bucket_index, index as usize);
        }
        let index = bucket.frags.len() as u32;
        bucket.ids.insert(key, index);
        bucket.frags.push(Fragment {
            data: bytes,
            alignment,
            address: 0,
        });
        FragmentId::new(bucket_index, index as usize)
    }

    /// Freezes the table into an indexable form once all splitting is done.
    pub(crate) fn finish(self) -> Fragments<'data> {
        Fragments {
            buckets: self
                .buckets
                .into_iter()
                .map(|bucket| bucket.into_inner().unwrap().frags)
                .collect(),
        }
    }
}

/// The frozen fragment table: lock-free lookups for all later phases.
pub(crate) struct Fragments<'data> {
    buckets: Vec<Vec<Fragment<'data>>>,
}

impl<'data> Fragments<'data> {
    pub(crate) fn get(&self, id: FragmentId) -> &Fragment<'data> {
        &self.buckets[id.bucket()][id.index()]
    }

    pub(crate) fn get_mut(&mut self, id: FragmentId) -> &mut Fragment<'data> {
        &mut self.buckets[id.bucket()][id.index()]
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = FragmentId> + '_ {
        self.buckets.iter().enumerate().flat_map(|(bucket, frags)| {
            (0..frags.len()).map(move |index| FragmentId::new(bucket, index))
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }
}

/// Splits the contents of a mergeable section into fragments and inserts each
/// into the shared table. Returns the fragments in section order together
/// with their starting offsets.
pub(crate) fn split_merge_section<'data>(
    table: &FragmentTable<'data>,
    diagnostics: &crate::error::Diagnostics,
    display_name: &dyn std::fmt::Display,
    data: &'data [u8],
    is_strings: bool,
    entsize: u64,
    alignment: u64,
) -> Result<Vec<(u32, FragmentId)>> {
    if alignment >= 1 << 16 {
        bail!("{display_name}: alignment too large");
    }
    let alignment = alignment.max(1) as u16;
    let entsize = if is_strings {
        entsize.max(1) as usize
    } else {
        if entsize == 0 {
            bail!("{display_name}: merge section has zero sh_entsize");
        }
        entsize as usize
    };

    let mut fragments = Vec::new();
    let mut offset = 0usize;
    let mut remaining = data;

    if is_strings {
        while !remaining.is_empty() {
            let Some(end) = find_null(remaining, entsize) else {
                diagnostics.report(anyhow::anyhow!(
                    "{display_name}: string is not null terminated"
                ));
                let id = table.insert(remaining, alignment);
                fragments.push((offset as u32, id));
                break;
            };
            let (piece, rest) = remaining.split_at(end + entsize);
            let id = table.insert(piece, alignment);
            fragments.push((offset as u32, id));
            offset += piece.len();
            remaining = rest;
        }
    } else {
        if !data.len().is_multiple_of(entsize) {
            bail!("{display_name}: section size is not a multiple of sh_entsize");
        }
        while !remaining.is_empty() {
            let (piece, rest) = remaining.split_at(entsize);
            let id = table.insert(piece, alignment);
            fragments.push((offset as u32, id));
            offset += entsize;
            remaining = rest;
        }
    }
    Ok(fragments)
}

/// Finds the offset of the terminating record. For wider records, the
/// terminator is the first record that is entirely zeros.
fn find_null(data: &[u8], entsize: usize) -> Option<usize> {
    if entsize == 1 {
        return memchr::memchr(0, data);
    }
    let mut offset = 0;
    while offset + entsize <= data.len() {
        if data[offset..offset + entsize].iter().all(|&b| b == 0) {
            return Some(offset);
        }
        offset += entsize;
    }
    None
}

/// Locates the fragment containing `offset`, given the section's fragments in
/// ascending offset order. Returns the fragment and the remainder offset
/// within it.
pub(crate) fn find_fragment(
    fragments: &[(u32, FragmentId)],
    offset: u64,
) -> Option<(FragmentId, u64)> {
    let index = fragments
        .partition_point(|&(start, _)| u64::from(start) <= offset)
        .checked_sub(1)?;
    let (start, id) = fragments[index];
    Some((id, offset - u64::from(start)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Diagnostics;

    struct Name(&'static str);
    impl std::fmt::Display for Name {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            self.0.fmt(f)
        }
    }

    #[test]
    fn split_strings_and_dedup() {
        let table = FragmentTable::new();
        let diagnostics = Diagnostics::new();
        let a = split_merge_section(
            &table,
            &diagnostics,
            &Name(".rodata.str1.1"),
            b"hi\0world\0",
            true,
            1,
            1,
        )
        .unwrap();
        let b = split_merge_section(
            &table,
            &diagnostics,
            &Name(".rodata.str1.1"),
            b"world\0hi\0",
            true,
            1,
            1,
        )
        .unwrap();
        assert!(!diagnostics.has_errors());
        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 2);
        // Identical strings from both sections share a fragment.
        assert_eq!(a[0].1, b[1].1);
        assert_eq!(a[1].1, b[0].1);
        assert_eq!(a[1].0, 3);

        let fragments = table.finish();
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments.get(a[0].1).data, b"hi\0");
    }

    #[test]
    fn missing_terminator_is_reported() {
        let table = FragmentTable::new();
        let diagnostics = Diagnostics::new();
        let pieces = split_merge_section(
            &table,
            &diagnostics,
            &Name(".rodata.str1.1"),
            b"ok\0oops",
            true,
            1,
            1,
        )
        .unwrap();
        assert!(diagnostics.has_errors());
        assert_eq!(pieces.len(), 2);
    }

    #[test]
    fn wide_records() {
        let table = FragmentTable::new();
        let diagnostics = Diagnostics::new();
        // Two 2-byte-wide strings, each terminated by an all-zero record.
        let data = &[b'a', b'b', 0, 0, b'c', b'd', 0, 0];
        let pieces = split_merge_section(
            &table,
            &diagnostics,
            &Name(".rodata.str2.2"),
            data,
            true,
            2,
            2,
        )
        .unwrap();
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[1].0, 4);

        // Fixed-size records without the string flag.
        let records = split_merge_section(
            &table,
            &diagnostics,
            &Name(".rodata.cst8"),
            &[0u8; 16],
            false,
            8,
            8,
        )
        .unwrap();
        assert_eq!(records.len(), 2);
        // Identical records dedup to one fragment.
        assert_eq!(records[0].1, records[1].1);
    }

    #[test]
    fn oversized_alignment_is_fatal() {
        let table = FragmentTable::new();
        let diagnostics = Diagnostics::new();
        assert!(split_merge_section(
            &table,
            &diagnostics,
            &Name(".rodata.str1.1"),
            b"x\0",
            true,
            1,
            1 << 16,
        )
        .is_err());
    }

    #[test]
    fn fragment_lookup_by_offset() {
        let table = FragmentTable::new();
        let diagnostics = Diagnostics::new();
        let pieces = split_merge_section(
            &table,
            &diagnostics,
            &Name(".rodata.str1.1"),
            b"one\0two\0",
            true,
            1,
            1,
        )
        .unwrap();
        let (frag, within) = find_fragment(&pieces, 5).unwrap();
        assert_eq!(frag, pieces[1].1);
        assert_eq!(within, 1);
    }
}
