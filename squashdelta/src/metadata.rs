//! Pull-based reader over the SquashFS metadata-block stream.
//!
//! Metadata (inodes, fragment entries) lives in a sequence of blocks, each
//! prefixed by a 16-bit header and holding at most 8 KiB of logical data.
//! The reader refills a single contiguous `2 x 8192` window one block at a
//! time and compacts the consumed prefix when it crosses the midpoint, so
//! records may be peeked across block boundaries without copies elsewhere.

use crate::codec::Codec;
use crate::extent::{fingerprint, Extent};
use crate::image::{Image, ImageCursor};
use crate::types::{metadata_header, METADATA_SIZE};
use crate::{Error, Result};

pub struct MetadataReader<'a> {
    cursor: ImageCursor,
    codec: &'a mut Codec,
    buf: Box<[u8]>,
    start: usize,
    filled: usize,
    blocks: usize,
    extents: Vec<Extent>,
}

impl<'a> MetadataReader<'a> {
    pub fn new(image: &Image, offset: u64, codec: &'a mut Codec) -> Result<Self> {
        let mut cursor = image.cursor();
        cursor.seek(std::io::SeekFrom::Start(offset))?;
        Ok(Self {
            cursor,
            codec,
            buf: vec![0u8; 2 * METADATA_SIZE].into_boxed_slice(),
            start: 0,
            filled: 0,
            blocks: 0,
            extents: Vec::new(),
        })
    }

    fn unread(&self) -> usize {
        self.filled - self.start
    }

    /// Read one metadata block from the image and append its logical bytes
    /// to the window, recording provenance for compressed payloads.
    fn refill(&mut self) -> Result<()> {
        if self.start > 0 && self.filled + METADATA_SIZE > self.buf.len() {
            self.buf.copy_within(self.start..self.filled, 0);
            self.filled -= self.start;
            self.start = 0;
        }

        let header = self.cursor.read_u16()?;
        let length = metadata_header::payload_len(header);
        if length == 0 || length > METADATA_SIZE {
            return Err(Error::CorruptMetadata(format!(
                "metadata block of {length} bytes (limit is 8 KiB)"
            )));
        }
        let payload_offset = self.cursor.position();
        let payload = self.cursor.read_slice(length)?;

        if metadata_header::is_compressed(header) {
            self.extents.push(Extent {
                offset: payload_offset,
                length: length as u32,
                uncompressed_length: 0,
                fingerprint: fingerprint(payload),
            });
            let out = self.codec.decompress(payload, METADATA_SIZE)?;
            self.buf[self.filled..self.filled + out.len()].copy_from_slice(&out);
            self.filled += out.len();
        } else {
            self.buf[self.filled..self.filled + length].copy_from_slice(payload);
            self.filled += length;
        }

        self.blocks += 1;
        Ok(())
    }

    fn ensure(&mut self, n: usize) -> Result<()> {
        debug_assert!(n <= METADATA_SIZE);
        while self.unread() < n {
            self.refill()?;
        }
        Ok(())
    }

    /// Borrow the next `n` logical bytes without consuming them.
    pub fn peek(&mut self, n: usize) -> Result<&[u8]> {
        self.ensure(n)?;
        Ok(&self.buf[self.start..self.start + n])
    }

    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.unread());
        self.start += n;
    }

    /// Consume `n` logical bytes, refilling as needed; `n` may exceed the
    /// window (symlink targets, directory-index names).
    pub fn skip(&mut self, mut n: usize) -> Result<()> {
        while n > 0 {
            let step = n.min(METADATA_SIZE);
            self.ensure(step)?;
            self.consume(step);
            n -= step;
        }
        Ok(())
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let raw = u16::from_le_bytes(self.peek(2)?.try_into().map_err(|_| Error::Eof)?);
        self.consume(2);
        Ok(raw)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let raw = u32::from_le_bytes(self.peek(4)?.try_into().map_err(|_| Error::Eof)?);
        self.consume(4);
        Ok(raw)
    }

    pub fn block_count(&self) -> usize {
        self.blocks
    }

    /// Finish the walk: the logical stream must end exactly on a block
    /// boundary, otherwise the table was truncated or over-read.
    pub fn finish(self) -> Result<(Vec<Extent>, usize)> {
        if self.unread() > 0 {
            return Err(Error::TruncatedMetadata);
        }
        Ok((self.extents, self.blocks))
    }
}
