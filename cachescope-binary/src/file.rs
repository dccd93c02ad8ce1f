//! Target binary loading

use anyhow::{anyhow, Context};
use memmap2::Mmap;
use object::{Object, ObjectSegment};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A mapped ELF file with its parsed metadata.
pub struct BinaryFile {
    pub path: PathBuf,
    data: Arc<[u8]>,
}

impl BinaryFile {
    /// Map the file at `path` and verify it parses as an object file.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open binary {}", path.display()))?;
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("failed to map binary {}", path.display()))?;
        let data: Arc<[u8]> = Arc::from(&mmap[..]);
        object::File::parse(&data[..])
            .with_context(|| format!("failed to parse ELF {}", path.display()))?;
        Ok(BinaryFile {
            path: path.to_path_buf(),
            data,
        })
    }

    pub fn data(&self) -> Arc<[u8]> {
        self.data.clone()
    }

    /// Virtual `[start, end)` ranges of the loadable segments.
    pub fn load_segments(&self) -> anyhow::Result<Vec<(u64, u64)>> {
        let object = object::File::parse(&self.data[..])?;
        let mut ranges: Vec<(u64, u64)> = object
            .segments()
            .filter(|s| s.size() > 0)
            .map(|s| (s.address(), s.address() + s.size()))
            .collect();
        if ranges.is_empty() {
            return Err(anyhow!("{} has no loadable segments", self.path.display()));
        }
        ranges.sort_unstable();
        Ok(ranges)
    }

    /// The binary's file name, used for DSO filtering.
    pub fn basename(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}
