use indicatif::{ProgressBar, ProgressStyle};
use memmap2::{Mmap, MmapOptions};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> Error + '_ {
    move |source| Error::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Read-only memory map of one input file.
pub struct MappedFile {
    path: PathBuf,
    mmap: Option<Mmap>,
}

impl MappedFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(io_error(path))?;
        let file_size = file.metadata().map_err(io_error(path))?.len();

        // Empty files can not be mapped on every platform
        let mmap = if file_size == 0 {
            None
        } else {
            Some(unsafe { MmapOptions::new().map(&file).map_err(io_error(path))? })
        };

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_blocks(&self, block_size: usize) -> usize {
        if block_size == 0 {
            return 0;
        }
        self.len().div_ceil(block_size)
    }

    /// Bytes of block `index`; the last block may be short.
    pub fn block(&self, index: usize, block_size: usize) -> Option<&[u8]> {
        if index >= self.total_blocks(block_size) {
            return None;
        }

        let offset = index * block_size;
        let end = (offset + block_size).min(self.len());
        Some(&self.bytes()[offset..end])
    }
}

/// One path per non-blank line, surrounding whitespace trimmed.
pub fn load_file_list<P: AsRef<Path>>(path: P) -> Result<Vec<PathBuf>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(io_error(path))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(PathBuf::from)
        .collect())
}

pub fn create_progress_bar(total_files: usize) -> ProgressBar {
    let pb = ProgressBar::new(total_files as u64);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} files ({eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    pb.set_style(style);
    pb
}
