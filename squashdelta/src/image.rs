use std::fs::File;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;

use crate::{Error, Result};

/// A memory-mapped SquashFS image.
///
/// `Image` exclusively owns the mapping; walkers read through cheap
/// [`ImageCursor`] duplicates that share it.
#[derive(Debug, Clone)]
pub struct Image {
    mmap: Arc<Mmap>,
}

impl Image {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file) }?;
        Ok(Self { mmap: mmap.into() })
    }

    pub fn len(&self) -> u64 {
        self.mmap.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.len() == 0
    }

    /// A new independent read cursor positioned at the start of the image.
    pub fn cursor(&self) -> ImageCursor {
        ImageCursor {
            mmap: Arc::clone(&self.mmap),
            pos: 0,
        }
    }

    /// Borrow `len` bytes starting at the absolute `offset`.
    pub fn slice(&self, offset: u64, len: usize) -> Result<&[u8]> {
        let start = usize::try_from(offset).map_err(|_| Error::Eof)?;
        let end = start.checked_add(len).ok_or(Error::Eof)?;
        self.mmap.get(start..end).ok_or(Error::Eof)
    }
}

/// An independent position over a shared image mapping.
#[derive(Debug, Clone)]
pub struct ImageCursor {
    mmap: Arc<Mmap>,
    pos: u64,
}

impl ImageCursor {
    pub fn len(&self) -> u64 {
        self.mmap.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.len() == 0
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn seek(&mut self, seek: SeekFrom) -> Result<u64> {
        let pos = match seek {
            SeekFrom::Start(offset) => i64::try_from(offset).map_err(|_| Error::Eof)?,
            SeekFrom::Current(delta) => (self.pos as i64).checked_add(delta).ok_or(Error::Eof)?,
            SeekFrom::End(delta) => (self.len() as i64).checked_add(delta).ok_or(Error::Eof)?,
        };
        if pos < 0 || pos as u64 > self.len() {
            return Err(Error::Eof);
        }
        self.pos = pos as u64;
        Ok(self.pos)
    }

    /// Borrow `n` bytes at the current position and advance past them.
    pub fn read_slice(&mut self, n: usize) -> Result<&[u8]> {
        let start = self.pos as usize;
        let end = start.checked_add(n).ok_or(Error::Eof)?;
        let slice = self.mmap.get(start..end).ok_or(Error::Eof)?;
        self.pos = end as u64;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.read_slice(N)?.try_into().map_err(|_| Error::Eof)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_array::<2>()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array::<4>()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_array::<8>()?))
    }
}
