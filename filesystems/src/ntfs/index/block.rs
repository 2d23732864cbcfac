// NTFS index allocation blocks ("INDX")
// Fixed-size, fixup-protected containers for non-root index nodes

use super::entry::IndexKind;
use super::node::IndexNode;
use crate::ntfs::codec::{round_up, ByteReader, ByteWriter};
use crate::ntfs::fixup::{self, FixupHeader};
use discfs_core::DiscError;

pub const INDEX_BLOCK_MAGIC: &[u8; 4] = b"INDX";

const USA_OFFSET: usize = 0x28;
const VCN_OFFSET: usize = 0x10;
const NODE_OFFSET: usize = 0x18;

/// Offset of the first entry, counted from the block start.
pub fn entries_start(block_size: usize, bytes_per_sector: usize) -> usize {
    let count = fixup::update_sequence_count(block_size, bytes_per_sector) as usize;
    round_up(USA_OFFSET + count * 2, 8)
}

/// Bytes available for entries in one block.
pub fn node_capacity(block_size: usize, bytes_per_sector: usize) -> usize {
    block_size - entries_start(block_size, bytes_per_sector)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexBlock {
    pub vcn: u64,
    pub node: IndexNode,
}

impl IndexBlock {
    pub fn new(vcn: u64, node: IndexNode) -> Self {
        Self { vcn, node }
    }

    pub fn read(raw: &[u8], kind: IndexKind, bytes_per_sector: usize, strict: bool) -> Result<Self, DiscError> {
        let mut buf = raw.to_vec();
        let outcome = fixup::decode(&mut buf, INDEX_BLOCK_MAGIC, bytes_per_sector)?;
        if strict {
            outcome.into_strict()?;
        }
        let vcn = ByteReader::at(&buf, VCN_OFFSET).u64()?;
        let node = IndexNode::read(&buf[NODE_OFFSET..], kind)?;
        Ok(Self { vcn, node })
    }

    /// Serialize into a full block with fixups applied.
    pub fn to_bytes(&self, kind: IndexKind, block_size: usize, bytes_per_sector: usize) -> Result<Vec<u8>, DiscError> {
        let start = entries_start(block_size, bytes_per_sector);
        let used = self.node.entries_size(kind);
        if start + used > block_size {
            return Err(DiscError::CapacityExceeded(format!(
                "Index node of {} bytes does not fit a {} byte block",
                used, block_size
            )));
        }

        let mut buf = vec![0u8; block_size];
        FixupHeader::new(*INDEX_BLOCK_MAGIC, USA_OFFSET as u16, block_size, bytes_per_sector).write(&mut buf);
        let mut writer = ByteWriter::new(&mut buf);
        writer.seek(VCN_OFFSET);
        writer.u64(self.vcn);
        self.node.write(
            &mut buf[NODE_OFFSET..],
            kind,
            start - NODE_OFFSET,
            block_size - NODE_OFFSET,
        );
        fixup::encode(&mut buf, bytes_per_sector)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntfs::index::entry::IndexEntry;

    #[test]
    fn test_block_geometry() {
        assert_eq!(entries_start(4096, 512), 0x40);
        assert_eq!(node_capacity(4096, 512), 4096 - 0x40);
        assert_eq!(entries_start(4096, 4096), 0x30);
    }

    #[test]
    fn test_block_round_trip() {
        let mut node = IndexNode::empty();
        for id in 0..10u32 {
            let last = node.entries.len() - 1;
            node.entries.insert(last, IndexEntry::new(id.to_le_bytes().to_vec(), vec![id as u8; 20]));
        }
        let block = IndexBlock::new(8, node);
        let raw = block.to_bytes(IndexKind::View, 4096, 512).unwrap();
        assert_eq!(&raw[..4], INDEX_BLOCK_MAGIC);
        // The node header records entries at 0x40 from the block start
        assert_eq!(u32::from_le_bytes([raw[0x18], raw[0x19], raw[0x1A], raw[0x1B]]), 0x28);

        let decoded = IndexBlock::read(&raw, IndexKind::View, 512, true).unwrap();
        assert_eq!(decoded, block);
    }

    #[test]
    fn test_torn_block() {
        let raw = IndexBlock::new(0, IndexNode::empty())
            .to_bytes(IndexKind::View, 4096, 512)
            .unwrap();
        let mut torn = raw.clone();
        torn[1022] ^= 0xFF;
        assert!(IndexBlock::read(&torn, IndexKind::View, 512, false).is_ok());
        assert!(matches!(
            IndexBlock::read(&torn, IndexKind::View, 512, true),
            Err(DiscError::FixupMismatch { sector: 1, .. })
        ));
    }

    #[test]
    fn test_oversized_node() {
        let mut node = IndexNode::empty();
        node.entries.insert(0, IndexEntry::new(vec![0u8; 4000], Vec::new()));
        assert!(matches!(
            IndexBlock::new(0, node).to_bytes(IndexKind::View, 4096, 512),
            Err(DiscError::CapacityExceeded(_))
        ));
    }
}
