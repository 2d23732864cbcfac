// NTFS index entries
// Key, data and optional child-node pointer, in $I30 or view layout

use crate::ntfs::codec::{round_up, ByteReader, ByteWriter};
use discfs_core::DiscError;

pub const INDEX_ENTRY_NODE: u16 = 0x0001;
pub const INDEX_ENTRY_END: u16 = 0x0002;

const ENTRY_HEADER_SIZE: usize = 0x10;

/// Where an index keeps entry data.
///
/// File name indexes store a file reference in the first 8 header bytes;
/// view indexes ($SDH, $SII, $O, $Q, $R) point at data after the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    FileName,
    View,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: Vec<u8>,
    pub data: Vec<u8>,
    /// VCN of the block holding keys that sort before this one
    pub child: Option<u64>,
    pub is_end: bool,
}

impl IndexEntry {
    pub fn new(key: Vec<u8>, data: Vec<u8>) -> Self {
        Self {
            key,
            data,
            child: None,
            is_end: false,
        }
    }

    /// The key-less entry closing every node.
    pub fn end(child: Option<u64>) -> Self {
        Self {
            key: Vec::new(),
            data: Vec::new(),
            child,
            is_end: true,
        }
    }

    pub fn flags(&self) -> u16 {
        let mut flags = 0;
        if self.child.is_some() {
            flags |= INDEX_ENTRY_NODE;
        }
        if self.is_end {
            flags |= INDEX_ENTRY_END;
        }
        flags
    }

    pub fn size(&self, kind: IndexKind) -> usize {
        let body = match kind {
            IndexKind::FileName => self.key.len(),
            IndexKind::View => self.key.len() + self.data.len(),
        };
        round_up(ENTRY_HEADER_SIZE + body, 8) + if self.child.is_some() { 8 } else { 0 }
    }

    pub fn read(buf: &[u8], kind: IndexKind) -> Result<(Self, usize), DiscError> {
        let mut reader = ByteReader::new(buf);
        let head = reader.u64()?;
        let length = reader.u16()? as usize;
        let key_length = reader.u16()? as usize;
        let flags = reader.u16()?;

        if length < ENTRY_HEADER_SIZE || length > buf.len() || ENTRY_HEADER_SIZE + key_length > length {
            return Err(DiscError::Corrupt(format!(
                "Index entry length {} (key {}) invalid in {} bytes",
                length,
                key_length,
                buf.len()
            )));
        }

        let is_end = flags & INDEX_ENTRY_END != 0;
        let key = if is_end {
            Vec::new()
        } else {
            ByteReader::at(buf, ENTRY_HEADER_SIZE).bytes(key_length)?.to_vec()
        };

        let data = match kind {
            _ if is_end => Vec::new(),
            IndexKind::FileName => head.to_le_bytes().to_vec(),
            IndexKind::View => {
                let data_offset = (head & 0xFFFF) as usize;
                let data_length = ((head >> 16) & 0xFFFF) as usize;
                if data_offset + data_length > length {
                    return Err(DiscError::Corrupt(format!(
                        "Index entry data {}+{} outside entry of {} bytes",
                        data_offset, data_length, length
                    )));
                }
                ByteReader::at(buf, data_offset).bytes(data_length)?.to_vec()
            }
        };

        let child = if flags & INDEX_ENTRY_NODE != 0 {
            Some(ByteReader::at(buf, length - 8).u64()?)
        } else {
            None
        };

        Ok((
            Self {
                key,
                data,
                child,
                is_end,
            },
            length,
        ))
    }

    pub fn write(&self, buf: &mut [u8], kind: IndexKind) -> usize {
        let size = self.size(kind);
        buf[..size].fill(0);
        let data_offset = ENTRY_HEADER_SIZE + self.key.len();

        let mut writer = ByteWriter::new(buf);
        match kind {
            IndexKind::FileName => {
                let mut head = [0u8; 8];
                let n = self.data.len().min(8);
                head[..n].copy_from_slice(&self.data[..n]);
                writer.bytes(&head);
            }
            IndexKind::View => {
                writer.u16(if self.is_end { 0 } else { data_offset as u16 });
                writer.u16(self.data.len() as u16);
                writer.u32(0);
            }
        }
        writer.u16(size as u16);
        writer.u16(self.key.len() as u16);
        writer.u16(self.flags());
        writer.u16(0);
        writer.bytes(&self.key);
        if kind == IndexKind::View {
            writer.bytes(&self.data);
        }
        if let Some(child) = self.child {
            writer.seek(size - 8);
            writer.u64(child);
        }
        size
    }
}
