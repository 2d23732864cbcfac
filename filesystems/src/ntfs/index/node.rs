// NTFS index nodes
// The entry list shared by $INDEX_ROOT and every INDX block

use super::entry::{IndexEntry, IndexKind};
use crate::ntfs::codec::{ByteReader, ByteWriter};
use discfs_core::DiscError;

pub const NODE_HEADER_SIZE: usize = 0x10;
const NODE_FLAG_HAS_CHILDREN: u8 = 0x01;

/// An ordered run of entries closed by an End entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexNode {
    pub entries: Vec<IndexEntry>,
}

impl IndexNode {
    /// A node holding only the End entry.
    pub fn empty() -> Self {
        Self {
            entries: vec![IndexEntry::end(None)],
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.entries.iter().all(|entry| entry.child.is_none())
    }

    /// Number of keyed (non-End) entries.
    pub fn key_count(&self) -> usize {
        self.entries.iter().filter(|entry| !entry.is_end).count()
    }

    pub fn end_entry(&self) -> &IndexEntry {
        // read() and every mutation keep the End entry last
        &self.entries[self.entries.len() - 1]
    }

    pub fn end_entry_mut(&mut self) -> &mut IndexEntry {
        let last = self.entries.len() - 1;
        &mut self.entries[last]
    }

    /// Bytes of entries, without the node header.
    pub fn entries_size(&self, kind: IndexKind) -> usize {
        self.entries.iter().map(|entry| entry.size(kind)).sum()
    }

    /// Header plus entries.
    pub fn size(&self, kind: IndexKind) -> usize {
        NODE_HEADER_SIZE + self.entries_size(kind)
    }

    /// Decode the node whose header starts at `buf[0]`.
    pub fn read(buf: &[u8], kind: IndexKind) -> Result<Self, DiscError> {
        let mut reader = ByteReader::new(buf);
        let entries_offset = reader.u32()? as usize;
        let index_length = reader.u32()? as usize;
        let _allocated = reader.u32()?;

        if entries_offset < NODE_HEADER_SIZE || index_length > buf.len() || entries_offset > index_length {
            return Err(DiscError::Corrupt(format!(
                "Index node entries {}..{} outside {} bytes",
                entries_offset,
                index_length,
                buf.len()
            )));
        }

        let mut entries = Vec::new();
        let mut pos = entries_offset;
        loop {
            if pos >= index_length {
                return Err(DiscError::Corrupt("Index node has no End entry".to_string()));
            }
            let (entry, length) = IndexEntry::read(&buf[pos..index_length], kind)?;
            pos += length;
            let is_end = entry.is_end;
            entries.push(entry);
            if is_end {
                break;
            }
        }
        Ok(Self { entries })
    }

    /// Encode into `buf` with entries starting at `entries_offset` from the header.
    /// `allocated` is the node size recorded in the header.
    pub fn write(&self, buf: &mut [u8], kind: IndexKind, entries_offset: usize, allocated: usize) -> usize {
        let index_length = entries_offset + self.entries_size(kind);
        let mut writer = ByteWriter::new(buf);
        writer.u32(entries_offset as u32);
        writer.u32(index_length as u32);
        writer.u32(allocated as u32);
        writer.u8(if self.is_leaf() { 0 } else { NODE_FLAG_HAS_CHILDREN });
        writer.zeros(3);

        let mut pos = entries_offset;
        for entry in &self.entries {
            pos += entry.write(&mut buf[pos..], kind);
        }
        index_length
    }
}
