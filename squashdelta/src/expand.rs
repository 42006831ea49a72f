//! The expanded-image transform and its inverse.
//!
//! An expanded image is byte-identical to the original except that every
//! residual compressed extent becomes a sparse hole, with its decompressed
//! payload appended after the image tail. A descriptor envelope records the
//! extents; it sits at the end of intermediate files (so leading offsets
//! still match the original image) and at the front of shipped patches.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use tracing::debug;

use crate::codec::Codec;
use crate::extent::Extent;
use crate::image::{Image, ImageCursor};
use crate::types::METADATA_SIZE;
use crate::{Error, Result};

pub const PATCH_MAGIC: u32 = 0x5371_ceb4;
pub const ENVELOPE_HEADER_SIZE: u64 = 16;
pub const ENVELOPE_ENTRY_SIZE: u64 = 12;

/// The patch descriptor: which extents were expanded, and with what codec.
/// All fields are big-endian on the wire.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub compression_tag: u32,
    pub extents: Vec<Extent>,
}

impl Envelope {
    /// Header-at-front orientation, used by the shipped patch.
    pub fn write_leading(&self, out: &mut impl Write) -> Result<()> {
        self.write_header(out)?;
        self.write_entries(out)
    }

    /// Header-at-end orientation, used by temp expanded images.
    pub fn write_trailing(&self, out: &mut impl Write) -> Result<()> {
        self.write_entries(out)?;
        self.write_header(out)
    }

    fn write_header(&self, out: &mut impl Write) -> Result<()> {
        out.write_u32::<BigEndian>(PATCH_MAGIC)?;
        out.write_u32::<BigEndian>(0)?; // flags
        out.write_u32::<BigEndian>(self.compression_tag)?;
        out.write_u32::<BigEndian>(self.extents.len() as u32)?;
        Ok(())
    }

    fn write_entries(&self, out: &mut impl Write) -> Result<()> {
        for extent in &self.extents {
            let offset = u32::try_from(extent.offset).map_err(|_| {
                Error::CorruptMetadata(format!(
                    "extent at 0x{:x} beyond the 4 GiB patch format limit",
                    extent.offset
                ))
            })?;
            out.write_u32::<BigEndian>(offset)?;
            out.write_u32::<BigEndian>(extent.length)?;
            out.write_u32::<BigEndian>(extent.uncompressed_length)?;
        }
        Ok(())
    }

    /// Parse a header-at-front envelope from the start of a patch stream.
    pub fn read_leading(input: &mut impl Read) -> Result<Self> {
        let magic = input.read_u32::<BigEndian>()?;
        if magic != PATCH_MAGIC {
            return Err(Error::BadPatch(format!("bad magic 0x{magic:08x}")));
        }
        let _flags = input.read_u32::<BigEndian>()?;
        let compression_tag = input.read_u32::<BigEndian>()?;
        let count = input.read_u32::<BigEndian>()?;
        let mut extents = Vec::with_capacity(count as usize);
        for _ in 0..count {
            extents.push(Extent {
                offset: u64::from(input.read_u32::<BigEndian>()?),
                length: input.read_u32::<BigEndian>()?,
                uncompressed_length: input.read_u32::<BigEndian>()?,
                fingerprint: 0,
            });
        }
        Ok(Self {
            compression_tag,
            extents,
        })
    }

    /// Parse a header-at-end envelope from an expanded image. Returns the
    /// envelope and the offset where its entry list begins (the end of the
    /// appended payloads).
    pub fn read_trailing(expanded: &Image) -> Result<(Self, u64)> {
        let len = expanded.len();
        if len < ENVELOPE_HEADER_SIZE {
            return Err(Error::BadPatch("expanded image too short".into()));
        }
        let header = expanded.slice(len - ENVELOPE_HEADER_SIZE, ENVELOPE_HEADER_SIZE as usize)?;
        let mut header = io::Cursor::new(header);
        let magic = header.read_u32::<BigEndian>()?;
        if magic != PATCH_MAGIC {
            return Err(Error::BadPatch(format!(
                "no trailing envelope (magic 0x{magic:08x})"
            )));
        }
        let _flags = header.read_u32::<BigEndian>()?;
        let compression_tag = header.read_u32::<BigEndian>()?;
        let count = u64::from(header.read_u32::<BigEndian>()?);

        let entries_start = len
            .checked_sub(ENVELOPE_HEADER_SIZE + count * ENVELOPE_ENTRY_SIZE)
            .ok_or_else(|| Error::BadPatch("truncated envelope entry list".into()))?;
        let mut entries = io::Cursor::new(expanded.slice(
            entries_start,
            (count * ENVELOPE_ENTRY_SIZE) as usize,
        )?);
        let mut extents = Vec::with_capacity(count as usize);
        for _ in 0..count {
            extents.push(Extent {
                offset: u64::from(entries.read_u32::<BigEndian>()?),
                length: entries.read_u32::<BigEndian>()?,
                uncompressed_length: entries.read_u32::<BigEndian>()?,
                fingerprint: 0,
            });
        }
        Ok((
            Self {
                compression_tag,
                extents,
            },
            entries_start,
        ))
    }
}

/// Sequential writer that can leave sparse holes behind the cursor.
pub struct SparseWriter {
    file: File,
    offset: u64,
}

impl SparseWriter {
    pub fn new(file: File) -> Self {
        Self { file, offset: 0 }
    }

    pub fn position(&self) -> u64 {
        self.offset
    }

    /// Extend the file by `length` unwritten bytes and seek past them.
    /// Growth is monotonic, so the truncate never shrinks the file.
    pub fn write_sparse(&mut self, length: u64) -> Result<()> {
        let past = self.offset + length;
        self.file.set_len(past)?;
        self.file.seek(SeekFrom::Current(length as i64))?;
        self.offset = past;
        Ok(())
    }

    pub fn copy_from(&mut self, cursor: &mut ImageCursor, length: u64) -> Result<()> {
        let slice = cursor.read_slice(length as usize)?;
        self.write_all(slice)?;
        Ok(())
    }

    pub fn into_file(self) -> File {
        self.file
    }
}

impl Write for SparseWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.file.write(buf)?;
        self.offset += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Write the expanded form of `image` into `out`: residual extents become
/// holes, their decompressed payloads are appended after the tail, and a
/// trailing envelope records them with the codec tag.
///
/// `extents` is sorted by offset and gets its `uncompressed_length` fields
/// filled; entry order in the envelope matches payload append order.
pub fn write_expanded(
    image: &Image,
    extents: &mut Vec<Extent>,
    codec: &mut Codec,
    block_size: u32,
    out: &mut SparseWriter,
) -> Result<()> {
    codec.reset();
    extents.sort_by_key(|extent| extent.offset);

    let mut cursor = image.cursor();
    let mut prev_end = 0u64;
    for extent in extents.iter() {
        if extent.offset < prev_end {
            return Err(Error::CorruptMetadata(format!(
                "overlapping compressed extents at 0x{:x}",
                extent.offset
            )));
        }
        out.copy_from(&mut cursor, extent.offset - prev_end)?;
        out.write_sparse(u64::from(extent.length))?;
        cursor.seek(SeekFrom::Current(i64::from(extent.length)))?;
        prev_end = extent.offset + u64::from(extent.length);
    }
    out.copy_from(&mut cursor, image.len() - prev_end)?;

    let scratch = (block_size as usize).max(METADATA_SIZE);
    for extent in extents.iter_mut() {
        let src = image.slice(extent.offset, extent.length as usize)?;
        let data = codec.decompress(src, scratch)?;
        extent.uncompressed_length = data.len() as u32;
        out.write_all(&data)?;
    }
    codec.finish_detection();

    let envelope = Envelope {
        compression_tag: codec.tag(),
        extents: extents.clone(),
    };
    envelope.write_trailing(out)?;
    out.flush()?;
    debug!(
        extents = extents.len(),
        expanded_len = out.position(),
        tag = envelope.compression_tag,
        "expanded image written"
    );
    Ok(())
}

/// Re-create the expanded image the differ saw, from the source image and a
/// patch envelope. Byte-identical output is the whole point: the applier's
/// delta is expressed against the differ's temp file, trailing envelope
/// included, so the same entries and tag are written back verbatim.
pub fn rebuild_expanded(
    image: &Image,
    envelope: &Envelope,
    codec: &mut Codec,
    out: &mut SparseWriter,
) -> Result<()> {
    let mut cursor = image.cursor();
    let mut prev_end = 0u64;
    for extent in &envelope.extents {
        if extent.offset < prev_end {
            return Err(Error::BadPatch(format!(
                "extent list not in offset order at 0x{:x}",
                extent.offset
            )));
        }
        out.copy_from(&mut cursor, extent.offset - prev_end)?;
        out.write_sparse(u64::from(extent.length))?;
        cursor.seek(SeekFrom::Current(i64::from(extent.length)))?;
        prev_end = extent.offset + u64::from(extent.length);
    }
    out.copy_from(&mut cursor, image.len() - prev_end)?;

    for extent in &envelope.extents {
        let src = image.slice(extent.offset, extent.length as usize)?;
        let data = codec.decompress(src, extent.uncompressed_length as usize)?;
        if data.len() != extent.uncompressed_length as usize {
            return Err(Error::CorruptMetadata(format!(
                "extent at 0x{:x} decompressed to {} bytes, {} recorded",
                extent.offset,
                data.len(),
                extent.uncompressed_length
            )));
        }
        out.write_all(&data)?;
    }

    envelope.write_trailing(out)?;
    out.flush()?;
    Ok(())
}

/// The inverse transform: rebuild the original image from an expanded one by
/// recompressing every extent its trailing envelope records.
///
/// A recompressed block that does not come back at its recorded on-disk
/// length cannot reproduce the original stream, which is fatal.
pub fn recompress(expanded: &Image, out: &mut File) -> Result<()> {
    let (envelope, entries_start) = Envelope::read_trailing(expanded)?;
    let payload_total: u64 = envelope
        .extents
        .iter()
        .map(|extent| u64::from(extent.uncompressed_length))
        .sum();
    let original_len = entries_start
        .checked_sub(payload_total)
        .ok_or_else(|| Error::BadPatch("payloads overrun the expanded image".into()))?;

    let mut codec = Codec::from_tag(envelope.compression_tag)?;
    let mut position = 0u64;
    let mut payload_pos = original_len;
    for extent in &envelope.extents {
        if extent.offset < position {
            return Err(Error::BadPatch(format!(
                "extent list not in offset order at 0x{:x}",
                extent.offset
            )));
        }
        out.write_all(expanded.slice(position, (extent.offset - position) as usize)?)?;

        let payload = expanded.slice(payload_pos, extent.uncompressed_length as usize)?;
        let compressed = codec.compress(payload)?;
        if compressed.len() != extent.length as usize {
            return Err(Error::CodecIdentityMismatch);
        }
        out.write_all(&compressed)?;

        payload_pos += u64::from(extent.uncompressed_length);
        position = extent.offset + u64::from(extent.length);
    }
    let tail = original_len
        .checked_sub(position)
        .ok_or_else(|| Error::BadPatch("extent list overruns the image".into()))?;
    out.write_all(expanded.slice(position, tail as usize)?)?;
    out.flush()?;
    debug!(extents = envelope.extents.len(), original_len, "image recompressed");
    Ok(())
}
