// NTFS FILE records
// Fixed-size MFT entries holding a packed, sorted sequence of attributes

use super::attributes::{
    attribute_type_name, AttributeRecord, ATTR_TYPE_ATTRIBUTE_LIST, ATTR_TYPE_END, ATTR_TYPE_STANDARD_INFORMATION,
};
use super::codec::{round_up, ByteCodec, ByteReader, ByteWriter};
use super::fixup::{self, FixupHeader, FixupOutcome};
use discfs_core::DiscError;
use std::fmt;

pub const FILE_RECORD_MAGIC: &[u8; 4] = b"FILE";
pub const FILE_RECORD_IN_USE: u16 = 0x0001;
pub const FILE_RECORD_IS_DIRECTORY: u16 = 0x0002;

const UPDATE_SEQUENCE_OFFSET: u16 = 0x30;
/// End marker plus padding.
const END_MARKER_SIZE: usize = 8;

/// MFT index (48 bits) and sequence number (16 bits) packed into a u64.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FileRecordReference(u64);

impl FileRecordReference {
    pub const NULL: FileRecordReference = FileRecordReference(0);

    pub fn new(index: u64, sequence: u16) -> Self {
        Self((index & 0x0000_FFFF_FFFF_FFFF) | (sequence as u64) << 48)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn index(&self) -> u64 {
        self.0 & 0x0000_FFFF_FFFF_FFFF
    }

    pub fn sequence(&self) -> u16 {
        (self.0 >> 48) as u16
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for FileRecordReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MFT#{} (seq {})", self.index(), self.sequence())
    }
}

#[derive(Debug, Clone)]
pub struct FileRecord {
    pub index: u64,
    pub sequence: u16,
    pub lsn: u64,
    pub hard_links: u16,
    pub flags: u16,
    /// Null for a base record, else the base record this extends
    pub base_reference: FileRecordReference,
    pub next_attribute_id: u16,
    /// Last update sequence number written to disk
    pub update_sequence: u16,
    /// Fixup result from the last load
    pub fixup: FixupOutcome,
    record_size: usize,
    bytes_per_sector: usize,
    attributes: Vec<AttributeRecord>,
}

impl FileRecord {
    /// Fresh, in-use record with no attributes.
    pub fn new(index: u64, sequence: u16, record_size: usize, bytes_per_sector: usize) -> Self {
        Self {
            index,
            sequence,
            lsn: 0,
            hard_links: 0,
            flags: FILE_RECORD_IN_USE,
            base_reference: FileRecordReference::NULL,
            next_attribute_id: 0,
            update_sequence: 0,
            fixup: FixupOutcome::default(),
            record_size,
            bytes_per_sector,
            attributes: Vec::new(),
        }
    }

    /// Decode a record read from the MFT. Torn sectors are returned in `fixup`.
    pub fn from_bytes(raw: &[u8], index: u64, bytes_per_sector: usize) -> Result<Self, DiscError> {
        let mut buf = raw.to_vec();
        let outcome = fixup::decode(&mut buf, FILE_RECORD_MAGIC, bytes_per_sector)?;

        let mut reader = ByteReader::at(&buf, 0x08);
        let lsn = reader.u64()?;
        let sequence = reader.u16()?;
        let hard_links = reader.u16()?;
        let first_attribute = reader.u16()? as usize;
        let flags = reader.u16()?;
        let bytes_in_use = reader.u32()? as usize;
        let bytes_allocated = reader.u32()? as usize;
        let base_reference = FileRecordReference::from_raw(reader.u64()?);
        let next_attribute_id = reader.u16()?;

        if bytes_allocated != raw.len() || bytes_in_use > bytes_allocated || first_attribute >= bytes_in_use {
            return Err(DiscError::Corrupt(format!(
                "FILE record {} has inconsistent sizes (first {:#x}, used {}, allocated {})",
                index, first_attribute, bytes_in_use, bytes_allocated
            )));
        }

        let mut attributes = Vec::new();
        let mut pos = first_attribute;
        loop {
            let attr_type = ByteReader::at(&buf[..bytes_in_use], pos).u32()?;
            if attr_type == ATTR_TYPE_END {
                break;
            }
            let (attr, length) = AttributeRecord::read_from(&buf[pos..bytes_in_use])?;
            attributes.push(attr);
            pos += length;
        }

        Ok(Self {
            index,
            sequence,
            lsn,
            hard_links,
            flags,
            base_reference,
            next_attribute_id,
            update_sequence: outcome.sequence_number,
            fixup: outcome,
            record_size: raw.len(),
            bytes_per_sector,
            attributes,
        })
    }

    /// Serialize and apply fixups. Fails if the attributes no longer fit.
    pub fn to_bytes(&self) -> Result<Vec<u8>, DiscError> {
        let used = self.used_size();
        if used > self.record_size {
            return Err(DiscError::CapacityExceeded(format!(
                "FILE record {} needs {} bytes, record size is {}",
                self.index, used, self.record_size
            )));
        }

        let mut buf = vec![0u8; self.record_size];
        let header = FixupHeader::new(
            *FILE_RECORD_MAGIC,
            UPDATE_SEQUENCE_OFFSET,
            self.record_size,
            self.bytes_per_sector,
        );
        header.write(&mut buf);

        let first_attribute = self.header_size();
        let mut writer = ByteWriter::new(&mut buf);
        writer.seek(0x08);
        writer.u64(self.lsn);
        writer.u16(self.sequence);
        writer.u16(self.hard_links);
        writer.u16(first_attribute as u16);
        writer.u16(self.flags);
        writer.u32(used as u32);
        writer.u32(self.record_size as u32);
        writer.u64(self.base_reference.raw());
        writer.u16(self.next_attribute_id);
        writer.u16(0);
        writer.u32(self.index as u32);
        writer.u16(self.update_sequence);

        let mut pos = first_attribute;
        for attr in &self.attributes {
            pos += attr.write_to(&mut buf[pos..]);
        }
        ByteWriter::new(&mut buf[pos..]).u32(ATTR_TYPE_END);

        fixup::encode(&mut buf, self.bytes_per_sector)?;
        Ok(buf)
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    pub fn reference(&self) -> FileRecordReference {
        FileRecordReference::new(self.index, self.sequence)
    }

    /// Header plus update sequence array, rounded to 8.
    pub fn header_size(&self) -> usize {
        let count = fixup::update_sequence_count(self.record_size, self.bytes_per_sector) as usize;
        round_up(UPDATE_SEQUENCE_OFFSET as usize + count * 2, 8)
    }

    /// Bytes needed on disk for the current attributes.
    pub fn used_size(&self) -> usize {
        self.header_size() + self.attributes.iter().map(ByteCodec::size).sum::<usize>() + END_MARKER_SIZE
    }

    pub fn free_space(&self) -> usize {
        self.record_size.saturating_sub(self.used_size())
    }

    /// Largest attribute an empty record of this size can hold.
    pub fn max_attribute_size(&self) -> usize {
        self.record_size - self.header_size() - END_MARKER_SIZE
    }

    pub fn is_in_use(&self) -> bool {
        self.flags & FILE_RECORD_IN_USE != 0
    }

    pub fn is_directory(&self) -> bool {
        self.flags & FILE_RECORD_IS_DIRECTORY != 0
    }

    pub fn set_directory(&mut self, directory: bool) {
        if directory {
            self.flags |= FILE_RECORD_IS_DIRECTORY;
        } else {
            self.flags &= !FILE_RECORD_IS_DIRECTORY;
        }
    }

    pub fn is_base(&self) -> bool {
        self.base_reference.is_null()
    }

    pub fn attributes(&self) -> &[AttributeRecord] {
        &self.attributes
    }

    pub fn attributes_mut(&mut self) -> &mut [AttributeRecord] {
        &mut self.attributes
    }

    pub fn allocate_attribute_id(&mut self) -> u16 {
        let id = self.next_attribute_id;
        self.next_attribute_id = self.next_attribute_id.wrapping_add(1);
        id
    }

    /// Insert keeping (type, name, start VCN) order.
    pub fn insert_attribute(&mut self, attr: AttributeRecord) {
        let position = self
            .attributes
            .iter()
            .position(|existing| existing.sort_order(&attr).is_gt())
            .unwrap_or(self.attributes.len());
        if attr.id >= self.next_attribute_id {
            self.next_attribute_id = attr.id.wrapping_add(1);
        }
        self.attributes.insert(position, attr);
    }

    /// First fragment of the named attribute.
    pub fn position(&self, attr_type: u32, name: &str) -> Option<usize> {
        self.attributes
            .iter()
            .enumerate()
            .filter(|(_, attr)| attr.matches(attr_type, name))
            .min_by_key(|(_, attr)| attr.start_vcn())
            .map(|(i, _)| i)
    }

    pub fn position_by_id(&self, id: u16) -> Option<usize> {
        self.attributes.iter().position(|attr| attr.id == id)
    }

    pub fn find(&self, attr_type: u32, name: &str) -> Option<&AttributeRecord> {
        self.position(attr_type, name).map(|i| &self.attributes[i])
    }

    pub fn find_mut(&mut self, attr_type: u32, name: &str) -> Option<&mut AttributeRecord> {
        self.position(attr_type, name).map(move |i| &mut self.attributes[i])
    }

    pub fn take_attribute(&mut self, position: usize) -> AttributeRecord {
        self.attributes.remove(position)
    }

    /// Remove every fragment of the named attribute.
    pub fn remove_attributes(&mut self, attr_type: u32, name: &str) -> Vec<AttributeRecord> {
        let (removed, kept): (Vec<_>, Vec<_>) = self
            .attributes
            .drain(..)
            .partition(|attr| attr.matches(attr_type, name));
        self.attributes = kept;
        removed
    }

    /// Largest attribute that may move to an extension record.
    pub fn largest_movable(&self) -> Option<usize> {
        self.attributes
            .iter()
            .enumerate()
            .filter(|(_, attr)| {
                attr.attr_type != ATTR_TYPE_STANDARD_INFORMATION && attr.attr_type != ATTR_TYPE_ATTRIBUTE_LIST
            })
            .max_by_key(|(_, attr)| attr.size())
            .map(|(i, _)| i)
    }

    pub fn dump(&self) -> String {
        let mut out = format!(
            "FILE RECORD {} seq {} flags {:#06x} used {}/{}\n",
            self.index,
            self.sequence,
            self.flags,
            self.used_size(),
            self.record_size
        );
        if !self.is_base() {
            out.push_str(&format!("  base: {}\n", self.base_reference));
        }
        for attr in &self.attributes {
            out.push_str(&format!(
                "  {} '{}' id {} {} ({} bytes)\n",
                attribute_type_name(attr.attr_type),
                attr.name,
                attr.id,
                if attr.is_resident() { "resident" } else { "non-resident" },
                attr.data_length()
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntfs::attributes::{ATTR_TYPE_DATA, ATTR_TYPE_FILE_NAME};

    fn record_with(values: &[(u32, &str, usize)]) -> FileRecord {
        let mut record = FileRecord::new(42, 3, 1024, 512);
        for &(attr_type, name, len) in values {
            let mut attr = AttributeRecord::new_resident(attr_type, name, vec![0x5A; len]);
            attr.id = record.allocate_attribute_id();
            record.insert_attribute(attr);
        }
        record
    }

    #[test]
    fn test_reference_packing() {
        let reference = FileRecordReference::new(0x1234_5678_9ABC, 0xBEEF);
        assert_eq!(reference.index(), 0x1234_5678_9ABC);
        assert_eq!(reference.sequence(), 0xBEEF);
        assert_eq!(FileRecordReference::from_raw(reference.raw()), reference);
        assert!(FileRecordReference::NULL.is_null());
    }

    #[test]
    fn test_round_trip() {
        let mut record = record_with(&[
            (ATTR_TYPE_DATA, "", 100),
            (ATTR_TYPE_STANDARD_INFORMATION, "", 0x48),
            (ATTR_TYPE_FILE_NAME, "", 0x50),
        ]);
        record.hard_links = 1;
        record.set_directory(true);

        let bytes = record.to_bytes().unwrap();
        assert_eq!(bytes.len(), 1024);
        assert_eq!(&bytes[0..4], b"FILE");

        let decoded = FileRecord::from_bytes(&bytes, 42, 512).unwrap();
        assert!(decoded.fixup.is_consistent());
        assert_eq!(decoded.reference(), FileRecordReference::new(42, 3));
        assert!(decoded.is_directory() && decoded.is_in_use());
        assert_eq!(decoded.next_attribute_id, 3);
        let types: Vec<u32> = decoded.attributes().iter().map(|a| a.attr_type).collect();
        assert_eq!(types, vec![ATTR_TYPE_STANDARD_INFORMATION, ATTR_TYPE_FILE_NAME, ATTR_TYPE_DATA]);
        assert_eq!(decoded.used_size(), record.used_size());
    }

    #[test]
    fn test_update_sequence_advances_on_rewrite() {
        let record = record_with(&[(ATTR_TYPE_DATA, "", 10)]);
        let first = FileRecord::from_bytes(&record.to_bytes().unwrap(), 42, 512).unwrap();
        let second = FileRecord::from_bytes(&first.to_bytes().unwrap(), 42, 512).unwrap();
        assert_eq!(second.update_sequence, first.update_sequence + 1);
    }

    #[test]
    fn test_overflow_is_capacity_error() {
        let record = record_with(&[(ATTR_TYPE_DATA, "a", 600), (ATTR_TYPE_DATA, "b", 600)]);
        assert!(record.used_size() > 1024);
        assert!(matches!(record.to_bytes(), Err(DiscError::CapacityExceeded(_))));
    }

    #[test]
    fn test_size_accounting() {
        let record = record_with(&[]);
        assert_eq!(record.header_size(), 0x38);
        assert_eq!(record.used_size(), 0x40);
        assert_eq!(record.free_space(), 1024 - 0x40);
        assert_eq!(record.max_attribute_size(), 1024 - 0x40);
    }

    #[test]
    fn test_corrupt_sizes_rejected() {
        let record = record_with(&[(ATTR_TYPE_DATA, "", 10)]);
        let mut bytes = record.to_bytes().unwrap();
        // bytes in use larger than the record
        bytes[0x18..0x1C].copy_from_slice(&2048u32.to_le_bytes());
        assert!(FileRecord::from_bytes(&bytes, 42, 512).unwrap_err().is_corruption());
    }

    #[test]
    fn test_largest_movable_skips_critical() {
        let record = record_with(&[
            (ATTR_TYPE_STANDARD_INFORMATION, "", 500),
            (ATTR_TYPE_DATA, "small", 10),
            (ATTR_TYPE_DATA, "large", 200),
        ]);
        let index = record.largest_movable().unwrap();
        assert_eq!(record.attributes()[index].name, "large");
    }
}
