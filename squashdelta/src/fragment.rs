//! Walk over the fragment table.
//!
//! The superblock points at an index whose first 64-bit word is the offset
//! of the metadata stream holding the fixed 16-byte fragment entries.

use crate::codec::Codec;
use crate::image::Image;
use crate::metadata::MetadataReader;
use crate::types::{FragmentEntry, SuperBlock, FRAGMENT_ENTRY_SIZE};
use crate::{Error, Result};

pub struct FragmentTableWalker<'a> {
    reader: MetadataReader<'a>,
    entries: u32,
    read: u32,
}

impl<'a> FragmentTableWalker<'a> {
    /// The caller is expected to skip construction when the superblock
    /// declares no fragments; there is no index word to read then.
    pub fn new(image: &Image, sb: &SuperBlock, codec: &'a mut Codec) -> Result<Self> {
        let mut cursor = image.cursor();
        cursor.seek(std::io::SeekFrom::Start(sb.fragment_table_start))?;
        let table_offset = cursor.read_u64()?;
        Ok(Self {
            reader: MetadataReader::new(image, table_offset, codec)?,
            entries: sb.fragments,
            read: 0,
        })
    }

    pub fn next_entry(&mut self) -> Result<FragmentEntry> {
        if self.read >= self.entries {
            return Err(Error::CorruptMetadata(
                "trying to read past the last fragment entry".into(),
            ));
        }
        let entry = FragmentEntry::read_from(self.reader.peek(FRAGMENT_ENTRY_SIZE)?)?;
        self.reader.consume(FRAGMENT_ENTRY_SIZE);
        self.read += 1;
        Ok(entry)
    }

    pub fn finish(self) -> Result<(Vec<crate::extent::Extent>, usize)> {
        self.reader.finish()
    }
}
