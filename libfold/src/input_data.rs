//! Figures out which files we need to read, maps them into memory and splits
//! archives into their members. Input buffers stay mapped for the whole link.

use crate::archive::parse_archive;
use crate::args::Args;
use crate::args::Input;
use crate::error::Result;
use crate::file_kind::FileKind;
use anyhow::bail;
use anyhow::Context as _;
use memmap2::Mmap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;

pub(crate) struct InputData {
    pub(crate) files: Vec<InputFile>,

    /// Archive members are only 2-byte aligned in the `ar` format, but our
    /// parser casts ELF tables in place, which needs 8-byte alignment.
    /// Members that land misaligned in the mapped archive get copied here, in
    /// the order they're encountered.
    aligned_members: Vec<Vec<u64>>,
}

pub(crate) struct InputFile {
    pub(crate) filename: PathBuf,
    pub(crate) kind: FileKind,
    bytes: Mmap,
}

/// Identifies an input object, which may be an entry in an archive.
#[derive(Clone, Copy)]
pub(crate) struct InputRef<'data> {
    pub(crate) file: &'data InputFile,
    pub(crate) entry_filename: Option<&'data [u8]>,
}

/// One relocatable object or shared object, after archive splitting. The
/// index of an `InputBytes` in the split list is the file's ID and its
/// priority: lower index means earlier on the command line, which wins ties.
pub(crate) struct InputBytes<'data> {
    pub(crate) input: InputRef<'data>,
    pub(crate) kind: FileKind,
    pub(crate) data: &'data [u8],
    pub(crate) is_in_archive: bool,
}

impl InputFile {
    pub(crate) fn data(&self) -> &[u8] {
        &self.bytes
    }
}

impl InputData {
    #[tracing::instrument(skip_all, name = "Open input files")]
    pub(crate) fn from_args(args: &Args) -> Result<Self> {
        let mut input_data = Self {
            files: Vec::new(),
            aligned_members: Vec::new(),
        };
        let mut seen = HashSet::new();
        for input in &args.inputs {
            let path = resolve_input(input, args)?;
            if !seen.insert(path.clone()) {
                continue;
            }
            input_data.register_file(path)?;
        }
        input_data.aligned_members = copy_misaligned_members(&input_data.files)?;
        Ok(input_data)
    }

    fn register_file(&mut self, path: PathBuf) -> Result {
        let file = std::fs::File::open(&path)
            .with_context(|| format!("Failed to open input file `{}`", path.display()))?;

        // Safety: this is only sound if nothing modifies the file while we
        // have it mapped. That's the compromise every mmap-based linker makes;
        // input files that get rewritten mid-link were never going to produce
        // a usable output anyway.
        let bytes = unsafe { Mmap::map(&file) }
            .with_context(|| format!("Failed to mmap input file `{}`", path.display()))?;

        let kind = FileKind::identify_bytes(&bytes)
            .with_context(|| format!("Failed to identify `{}`", path.display()))?;
        self.files.push(InputFile {
            filename: path,
            kind,
            bytes,
        });
        Ok(())
    }
}

fn resolve_input(input: &Input, args: &Args) -> Result<PathBuf> {
    match input {
        Input::File(path) => Ok(path.as_ref().to_owned()),
        Input::Lib(lib_name) => {
            for dir in &args.lib_search_path {
                for filename in [format!("lib{lib_name}.so"), format!("lib{lib_name}.a")] {
                    let path = dir.join(&filename);
                    if path.exists() {
                        return Ok(path);
                    }
                }
            }
            bail!("Couldn't find library `{lib_name}` on the library search path")
        }
    }
}

fn is_misaligned(data: &[u8]) -> bool {
    data.as_ptr() as usize % 8 != 0
}

/// Scans archives for members whose bytes are misaligned in the mapped file
/// and copies each into an 8-aligned buffer. `split_archives` walks the same
/// members in the same order and consumes the copies with a cursor.
fn copy_misaligned_members(files: &[InputFile]) -> Result<Vec<Vec<u64>>> {
    let mut copies = Vec::new();
    for file in files {
        if file.kind != FileKind::Archive {
            continue;
        }
        for member in parse_archive(file.data())? {
            if is_misaligned(member.data) {
                let mut buffer = vec![0u64; member.data.len().div_ceil(8)];
                bytemuck::cast_slice_mut(&mut buffer)[..member.data.len()]
                    .copy_from_slice(member.data);
                copies.push(buffer);
            }
        }
    }
    Ok(copies)
}

/// Splits archive inputs into their members, producing the flat list of
/// objects that take part in the link in priority order.
#[tracing::instrument(skip_all, name = "Split archives")]
pub(crate) fn split_archives(input_data: &InputData) -> Result<Vec<InputBytes>> {
    let mut inputs = Vec::new();
    let mut aligned = input_data.aligned_members.iter();
    for file in &input_data.files {
        match file.kind {
            FileKind::Archive => {
                for member in parse_archive(file.data())? {
                    let data = if is_misaligned(member.data) {
                        let buffer = aligned.next().context("Misaligned member not copied")?;
                        &bytemuck::cast_slice(buffer)[..member.data.len()]
                    } else {
                        member.data
                    };
                    let kind = FileKind::identify_bytes(data).with_context(|| {
                        format!("Unsupported entry in archive `{}`", file.filename.display())
                    })?;
                    if kind == FileKind::Archive {
                        bail!("Nested archives are not supported");
                    }
                    inputs.push(InputBytes {
                        input: InputRef {
                            file,
                            entry_filename: Some(member.name),
                        },
                        kind,
                        data,
                        is_in_archive: true,
                    });
                }
            }
            kind => {
                inputs.push(InputBytes {
                    input: InputRef {
                        file,
                        entry_filename: None,
                    },
                    kind,
                    data: file.data(),
                    is_in_archive: false,
                });
            }
        }
    }
    Ok(inputs)
}

/// Identifies an object in the file vector. Doubles as the file's priority:
/// lower values win symbol and COMDAT tie-breaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct FileId(u32);

impl FileId {
    pub(crate) fn new(value: u32) -> Self {
        Self(value)
    }

    pub(crate) fn from_usize(value: usize) -> Result<Self> {
        Ok(Self(value.try_into().context("Too many input files")?))
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn as_u32(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Display for InputRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.file.filename.display().fmt(f)?;
        if let Some(entry) = self.entry_filename {
            write!(f, " @ {}", String::from_utf8_lossy(entry))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for InputRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}
