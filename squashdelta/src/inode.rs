//! Sequential walk over the inode table.
//!
//! The walker decodes just enough of every variant to know its full on-disk
//! size, and emits a data extent for each compressed block of the regular
//! files it passes. Block lists are consumed word-by-word so the metadata
//! window never has to hold a large inode whole.

use tracing::trace;

use crate::codec::Codec;
use crate::extent::Extent;
use crate::image::Image;
use crate::metadata::MetadataReader;
use crate::read::ReadCursor;
use crate::types::{
    block_word, DirIndex, InodeType, RegularInode, SuperBlock, DIR_INDEX_SIZE, INODE_BASE_SIZE,
};
use crate::{Error, Result};

pub struct InodeWalker<'a> {
    reader: MetadataReader<'a>,
    block_size: u32,
    block_log: u16,
    inodes: u32,
    read: u32,
}

impl<'a> InodeWalker<'a> {
    pub fn new(image: &Image, sb: &SuperBlock, codec: &'a mut Codec) -> Result<Self> {
        Ok(Self {
            reader: MetadataReader::new(image, sb.inode_table_start, codec)?,
            block_size: sb.block_size,
            block_log: sb.block_log,
            inodes: sb.inodes,
            read: 0,
        })
    }

    /// Decode the next inode, appending the data extents of regular files
    /// to `out`.
    pub fn next_inode(&mut self, out: &mut Vec<Extent>) -> Result<()> {
        if self.read >= self.inodes {
            return Err(Error::CorruptMetadata(
                "trying to read past the last inode".into(),
            ));
        }

        let base = self.reader.peek(INODE_BASE_SIZE)?;
        let raw_type = u16::from_le_bytes([base[0], base[1]]);
        let kind = InodeType::try_from(raw_type)?;
        let fixed_size = kind.fixed_size();
        let fixed = self.reader.peek(fixed_size)?;
        trace!(inode = self.read, ?kind, "walking inode");

        match kind {
            InodeType::Reg => {
                let mut cursor = ReadCursor::new(&fixed[INODE_BASE_SIZE..]);
                let start_block = u64::from(cursor.read_u32_le()?);
                let fragment = cursor.read_u32_le()?;
                cursor.skip(4)?; // offset within the fragment
                let file_size = u64::from(cursor.read_u32_le()?);
                self.reader.consume(fixed_size);
                self.read_block_list(
                    RegularInode {
                        start_block,
                        fragment,
                        file_size,
                    },
                    out,
                )?;
            }
            InodeType::LReg => {
                let mut cursor = ReadCursor::new(&fixed[INODE_BASE_SIZE..]);
                let start_block = cursor.read_u64_le()?;
                let file_size = cursor.read_u64_le()?;
                cursor.skip(8)?; // sparse byte count
                cursor.skip(4)?; // nlink
                let fragment = cursor.read_u32_le()?;
                self.reader.consume(fixed_size);
                self.read_block_list(
                    RegularInode {
                        start_block,
                        fragment,
                        file_size,
                    },
                    out,
                )?;
            }
            InodeType::Symlink | InodeType::LSymlink => {
                let mut cursor = ReadCursor::new(&fixed[INODE_BASE_SIZE..]);
                cursor.skip(4)?; // nlink
                let symlink_size = cursor.read_u32_le()? as usize;
                self.reader.consume(fixed_size);
                self.reader.skip(symlink_size)?;
            }
            InodeType::LDir => {
                let mut cursor = ReadCursor::new(&fixed[INODE_BASE_SIZE..]);
                cursor.skip(16)?; // nlink, file_size, start_block, parent_inode
                let index_count = cursor.read_u16_le()? as usize;
                self.reader.consume(fixed_size);
                for _ in 0..index_count {
                    let index = DirIndex::read_from(self.reader.peek(DIR_INDEX_SIZE)?)?;
                    self.reader.consume(DIR_INDEX_SIZE);
                    // the stored size is one less than the name length
                    self.reader.skip(index.size as usize + 1)?;
                }
            }
            InodeType::Dir
            | InodeType::Blkdev
            | InodeType::Chrdev
            | InodeType::Fifo
            | InodeType::Socket
            | InodeType::LBlkdev
            | InodeType::LChrdev
            | InodeType::LFifo
            | InodeType::LSocket => {
                self.reader.consume(fixed_size);
            }
        }

        self.read += 1;
        Ok(())
    }

    fn read_block_list(&mut self, inode: RegularInode, out: &mut Vec<Extent>) -> Result<()> {
        let count = inode.block_count(self.block_size, self.block_log);
        let mut offset = inode.start_block;
        for _ in 0..count {
            let word = self.reader.read_u32()?;
            let length = block_word::on_disk_len(word);
            if block_word::is_compressed(word) && length > 0 {
                out.push(Extent {
                    offset,
                    length,
                    uncompressed_length: 0,
                    fingerprint: 0,
                });
            }
            offset += u64::from(length);
        }
        Ok(())
    }

    /// Walk-end bookkeeping: compressed metadata extents plus the number of
    /// metadata blocks the inode table occupied.
    pub fn finish(self) -> Result<(Vec<Extent>, usize)> {
        self.reader.finish()
    }
}
