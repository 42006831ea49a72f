//! In-memory SquashFS 4.0 image builder for the integration tests.
//!
//! Produces just enough of the format for the walkers: a superblock, a data
//! area, a compressed inode-table metadata stream, and a fragment table.
//! Blocks are compressed with the same codec backends the library uses, so
//! expand/recompress round trips are exact.

#![allow(dead_code)]

use std::io::Write;

use squashdelta::codec::Codec;

pub const LZO_TAG: u32 = 0x0100_0008; // lzo1x_999, level 8
pub const LZ4_TAG: u32 = 0x0200_0000; // lz4 legacy
pub const LZ4_HC_TAG: u32 = 0x0200_0001; // lz4 legacy, high compression

const METADATA_SIZE: usize = 8192;
const SUPERBLOCK_SIZE: usize = 96;
const INVALID_FRAG: u32 = 0xffff_ffff;
const BLOCK_UNCOMPRESSED: u32 = 1 << 24;
const HEADER_UNCOMPRESSED: u16 = 1 << 15;
const FLAG_COMPRESSOR_OPTIONS: u16 = 1 << 10;

pub struct FileSpec {
    content: Vec<u8>,
    tail_in_fragment: bool,
}

pub struct ImageBuilder {
    compression: u16,
    tag: u32,
    options: Option<Vec<u8>>,
    block_size: u32,
    block_log: u16,
    files: Vec<FileSpec>,
    symlink_target: Option<Vec<u8>>,
    first_inode_type: u16,
}

pub struct BuiltImage {
    pub bytes: Vec<u8>,
    pub inode_table_start: u64,
    /// Compressed data and fragment blocks, `(offset, on-disk length)`.
    pub data_extents: Vec<(u64, u32)>,
    /// Compressed metadata payloads, `(offset, on-disk length)`.
    pub metadata_extents: Vec<(u64, u32)>,
}

impl ImageBuilder {
    pub fn lzo(block_log: u16) -> Self {
        Self::new(3, LZO_TAG, None, block_log)
    }

    pub fn lz4(hc: bool, block_log: u16) -> Self {
        let mut options = Vec::new();
        options.extend_from_slice(&1u32.to_le_bytes()); // legacy version
        options.extend_from_slice(&u32::from(hc).to_le_bytes());
        let tag = if hc { LZ4_HC_TAG } else { LZ4_TAG };
        Self::new(5, tag, Some(options), block_log)
    }

    fn new(compression: u16, tag: u32, options: Option<Vec<u8>>, block_log: u16) -> Self {
        Self {
            compression,
            tag,
            options,
            block_size: 1 << block_log,
            block_log,
            files: Vec::new(),
            symlink_target: None,
            first_inode_type: 1,
        }
    }

    pub fn file(mut self, content: Vec<u8>, tail_in_fragment: bool) -> Self {
        self.files.push(FileSpec {
            content,
            tail_in_fragment,
        });
        self
    }

    pub fn symlink(mut self, target: &str) -> Self {
        self.symlink_target = Some(target.as_bytes().to_vec());
        self
    }

    /// Replace the leading directory inode's type field, for corruption tests.
    pub fn first_inode_type(mut self, raw: u16) -> Self {
        self.first_inode_type = raw;
        self
    }

    pub fn build(&self) -> BuiltImage {
        let mut codec = Codec::from_tag(self.tag).expect("builder tag");
        let mut bytes = vec![0u8; SUPERBLOCK_SIZE];
        let mut data_extents = Vec::new();
        let mut metadata_extents = Vec::new();

        if let Some(options) = &self.options {
            bytes.extend_from_slice(&(options.len() as u16).to_le_bytes());
            bytes.extend_from_slice(options);
        }

        // data area
        struct Reg {
            start_block: u64,
            fragment: u32,
            file_size: u32,
            words: Vec<u32>,
        }
        let mut regs = Vec::new();
        let mut fragments: Vec<(u64, u32)> = Vec::new();
        for spec in &self.files {
            let start_block = bytes.len() as u64;
            let mut words = Vec::new();
            let mut fragment = INVALID_FRAG;
            let chunks: Vec<&[u8]> = spec.content.chunks(self.block_size as usize).collect();
            for (i, chunk) in chunks.iter().enumerate() {
                let is_tail = i + 1 == chunks.len() && chunk.len() < self.block_size as usize;
                if is_tail && spec.tail_in_fragment {
                    let offset = bytes.len() as u64;
                    let (stored, word) = encode_block(&mut codec, chunk);
                    if word & BLOCK_UNCOMPRESSED == 0 {
                        data_extents.push((offset, word));
                    }
                    bytes.extend_from_slice(&stored);
                    fragment = fragments.len() as u32;
                    fragments.push((offset, word));
                } else if chunk.iter().all(|byte| *byte == 0) {
                    words.push(0); // sparse block, nothing on disk
                } else {
                    let offset = bytes.len() as u64;
                    let (stored, word) = encode_block(&mut codec, chunk);
                    if word & BLOCK_UNCOMPRESSED == 0 {
                        data_extents.push((offset, word));
                    }
                    bytes.extend_from_slice(&stored);
                    words.push(word);
                }
            }
            regs.push(Reg {
                start_block,
                fragment,
                file_size: spec.content.len() as u32,
                words,
            });
        }

        // inode table: one directory, the optional symlink, then the files
        let mut inode_stream = Vec::new();
        let mut inode_number = 0u32;

        push_inode_base(&mut inode_stream, self.first_inode_type, &mut inode_number);
        inode_stream.extend_from_slice(&[0u8; 16]); // dir payload, walker skips it

        if let Some(target) = &self.symlink_target {
            push_inode_base(&mut inode_stream, 3, &mut inode_number);
            inode_stream.extend_from_slice(&1u32.to_le_bytes()); // nlink
            inode_stream.extend_from_slice(&(target.len() as u32).to_le_bytes());
            inode_stream.extend_from_slice(target);
        }

        for reg in &regs {
            push_inode_base(&mut inode_stream, 2, &mut inode_number);
            inode_stream.extend_from_slice(&(reg.start_block as u32).to_le_bytes());
            inode_stream.extend_from_slice(&reg.fragment.to_le_bytes());
            inode_stream.extend_from_slice(&0u32.to_le_bytes()); // offset in fragment
            inode_stream.extend_from_slice(&reg.file_size.to_le_bytes());
            for word in &reg.words {
                inode_stream.extend_from_slice(&word.to_le_bytes());
            }
        }

        let inode_table_start = bytes.len() as u64;
        write_metadata_stream(&mut bytes, &mut codec, &inode_stream, &mut metadata_extents);

        // fragment table: entry stream, then the index word pointing at it
        let fragment_entries_start = bytes.len() as u64;
        let mut fragment_stream = Vec::new();
        for (start_block, word) in &fragments {
            fragment_stream.extend_from_slice(&start_block.to_le_bytes());
            fragment_stream.extend_from_slice(&word.to_le_bytes());
            fragment_stream.extend_from_slice(&0u32.to_le_bytes());
        }
        if !fragments.is_empty() {
            write_metadata_stream(&mut bytes, &mut codec, &fragment_stream, &mut metadata_extents);
        }
        let fragment_table_start = bytes.len() as u64;
        if !fragments.is_empty() {
            bytes.extend_from_slice(&fragment_entries_start.to_le_bytes());
        }

        // superblock
        let mut flags = 0u16;
        if self.options.is_some() {
            flags |= FLAG_COMPRESSOR_OPTIONS;
        }
        let bytes_used = bytes.len() as u64;
        write_superblock(
            &mut bytes,
            &SuperblockFields {
                inodes: inode_number,
                block_size: self.block_size,
                fragments: fragments.len() as u32,
                compression: self.compression,
                block_log: self.block_log,
                flags,
                bytes_used,
                inode_table_start,
                fragment_table_start,
            },
        );

        BuiltImage {
            bytes,
            inode_table_start,
            data_extents,
            metadata_extents,
        }
    }
}

struct SuperblockFields {
    inodes: u32,
    block_size: u32,
    fragments: u32,
    compression: u16,
    block_log: u16,
    flags: u16,
    bytes_used: u64,
    inode_table_start: u64,
    fragment_table_start: u64,
}

fn write_superblock(bytes: &mut [u8], fields: &SuperblockFields) {
    bytes[0..4].copy_from_slice(&0x7371_7368u32.to_le_bytes());
    bytes[4..8].copy_from_slice(&fields.inodes.to_le_bytes());
    bytes[12..16].copy_from_slice(&fields.block_size.to_le_bytes());
    bytes[16..20].copy_from_slice(&fields.fragments.to_le_bytes());
    bytes[20..22].copy_from_slice(&fields.compression.to_le_bytes());
    bytes[22..24].copy_from_slice(&fields.block_log.to_le_bytes());
    bytes[24..26].copy_from_slice(&fields.flags.to_le_bytes());
    bytes[28..30].copy_from_slice(&4u16.to_le_bytes());
    bytes[30..32].copy_from_slice(&0u16.to_le_bytes());
    bytes[40..48].copy_from_slice(&fields.bytes_used.to_le_bytes());
    bytes[64..72].copy_from_slice(&fields.inode_table_start.to_le_bytes());
    bytes[80..88].copy_from_slice(&fields.fragment_table_start.to_le_bytes());
}

fn push_inode_base(stream: &mut Vec<u8>, inode_type: u16, inode_number: &mut u32) {
    *inode_number += 1;
    stream.extend_from_slice(&inode_type.to_le_bytes());
    stream.extend_from_slice(&0o644u16.to_le_bytes()); // mode
    stream.extend_from_slice(&0u16.to_le_bytes()); // uid
    stream.extend_from_slice(&0u16.to_le_bytes()); // guid
    stream.extend_from_slice(&0u32.to_le_bytes()); // mtime
    stream.extend_from_slice(&inode_number.to_le_bytes());
}

fn encode_block(codec: &mut Codec, chunk: &[u8]) -> (Vec<u8>, u32) {
    let compressed = codec.compress(chunk).expect("builder compression");
    if compressed.len() < chunk.len() {
        let word = compressed.len() as u32;
        (compressed, word)
    } else {
        (chunk.to_vec(), chunk.len() as u32 | BLOCK_UNCOMPRESSED)
    }
}

fn write_metadata_stream(
    bytes: &mut Vec<u8>,
    codec: &mut Codec,
    logical: &[u8],
    metadata_extents: &mut Vec<(u64, u32)>,
) {
    for chunk in logical.chunks(METADATA_SIZE) {
        let compressed = codec.compress(chunk).expect("builder compression");
        if compressed.len() < chunk.len() {
            bytes.extend_from_slice(&(compressed.len() as u16).to_le_bytes());
            metadata_extents.push((bytes.len() as u64, compressed.len() as u32));
            bytes.extend_from_slice(&compressed);
        } else {
            let header = chunk.len() as u16 | HEADER_UNCOMPRESSED;
            bytes.extend_from_slice(&header.to_le_bytes());
            bytes.extend_from_slice(chunk);
        }
    }
}

/// Write image bytes to a temp file the library can open by path.
pub fn write_image(bytes: &[u8]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("temp image");
    file.write_all(bytes).expect("write image");
    file.flush().expect("flush image");
    file
}

/// Deterministic incompressible bytes, for exercising the stored-block path.
pub fn noise(len: usize, mut seed: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        out.push((seed >> 24) as u8);
    }
    out
}

/// Compressible but position-dependent content.
pub fn text(len: usize, phrase: &str) -> Vec<u8> {
    phrase.as_bytes().iter().copied().cycle().take(len).collect()
}
