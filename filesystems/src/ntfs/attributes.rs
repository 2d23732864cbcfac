// NTFS attribute records
// Resident and non-resident attribute headers as stored inside FILE records

use super::cluster_bitmap::ClusterRun;
use super::codec::{round_up, utf16_len, ByteCodec, ByteReader, ByteWriter};
use super::data_runs::RunList;
use discfs_core::DiscError;
use std::cmp::Ordering;

// Attribute type codes
pub const ATTR_TYPE_STANDARD_INFORMATION: u32 = 0x10;
pub const ATTR_TYPE_ATTRIBUTE_LIST: u32 = 0x20;
pub const ATTR_TYPE_FILE_NAME: u32 = 0x30;
pub const ATTR_TYPE_OBJECT_ID: u32 = 0x40;
pub const ATTR_TYPE_SECURITY_DESCRIPTOR: u32 = 0x50;
pub const ATTR_TYPE_VOLUME_NAME: u32 = 0x60;
pub const ATTR_TYPE_VOLUME_INFORMATION: u32 = 0x70;
pub const ATTR_TYPE_DATA: u32 = 0x80;
pub const ATTR_TYPE_INDEX_ROOT: u32 = 0x90;
pub const ATTR_TYPE_INDEX_ALLOCATION: u32 = 0xA0;
pub const ATTR_TYPE_BITMAP: u32 = 0xB0;
pub const ATTR_TYPE_REPARSE_POINT: u32 = 0xC0;
pub const ATTR_TYPE_EA_INFORMATION: u32 = 0xD0;
pub const ATTR_TYPE_EA: u32 = 0xE0;
pub const ATTR_TYPE_LOGGED_UTILITY_STREAM: u32 = 0x100;
pub const ATTR_TYPE_END: u32 = 0xFFFF_FFFF;

// Attribute flags
pub const ATTR_FLAG_COMPRESSED: u16 = 0x0001;
pub const ATTR_FLAG_ENCRYPTED: u16 = 0x4000;
pub const ATTR_FLAG_SPARSE: u16 = 0x8000;

const RESIDENT_HEADER_SIZE: usize = 0x18;
const NON_RESIDENT_HEADER_SIZE: usize = 0x40;
const COMPRESSED_HEADER_SIZE: usize = 0x48;

pub fn attribute_type_name(attr_type: u32) -> &'static str {
    match attr_type {
        ATTR_TYPE_STANDARD_INFORMATION => "$STANDARD_INFORMATION",
        ATTR_TYPE_ATTRIBUTE_LIST => "$ATTRIBUTE_LIST",
        ATTR_TYPE_FILE_NAME => "$FILE_NAME",
        ATTR_TYPE_OBJECT_ID => "$OBJECT_ID",
        ATTR_TYPE_SECURITY_DESCRIPTOR => "$SECURITY_DESCRIPTOR",
        ATTR_TYPE_VOLUME_NAME => "$VOLUME_NAME",
        ATTR_TYPE_VOLUME_INFORMATION => "$VOLUME_INFORMATION",
        ATTR_TYPE_DATA => "$DATA",
        ATTR_TYPE_INDEX_ROOT => "$INDEX_ROOT",
        ATTR_TYPE_INDEX_ALLOCATION => "$INDEX_ALLOCATION",
        ATTR_TYPE_BITMAP => "$BITMAP",
        ATTR_TYPE_REPARSE_POINT => "$REPARSE_POINT",
        ATTR_TYPE_EA_INFORMATION => "$EA_INFORMATION",
        ATTR_TYPE_EA => "$EA",
        ATTR_TYPE_LOGGED_UTILITY_STREAM => "$LOGGED_UTILITY_STREAM",
        _ => "$UNKNOWN",
    }
}

/// Attributes that must stay inside a FILE record.
pub fn is_always_resident(attr_type: u32) -> bool {
    matches!(
        attr_type,
        ATTR_TYPE_STANDARD_INFORMATION
            | ATTR_TYPE_FILE_NAME
            | ATTR_TYPE_OBJECT_ID
            | ATTR_TYPE_VOLUME_NAME
            | ATTR_TYPE_VOLUME_INFORMATION
            | ATTR_TYPE_INDEX_ROOT
    )
}

pub fn is_always_non_resident(attr_type: u32) -> bool {
    attr_type == ATTR_TYPE_INDEX_ALLOCATION
}

/// Case-insensitive ordering of attribute names.
pub fn compare_names(a: &str, b: &str) -> Ordering {
    a.chars()
        .flat_map(char::to_uppercase)
        .cmp(b.chars().flat_map(char::to_uppercase))
}

pub fn names_equal(a: &str, b: &str) -> bool {
    compare_names(a, b) == Ordering::Equal
}

/// Location and size bookkeeping of a non-resident attribute fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonResident {
    pub start_vcn: u64,
    /// Inclusive; `start_vcn - 1` for an empty fragment
    pub last_vcn: i64,
    pub compression_unit: u16,
    pub allocated_size: u64,
    pub data_size: u64,
    pub initialized_size: u64,
    pub compressed_size: Option<u64>,
    pub runs: RunList,
}

impl NonResident {
    pub fn empty() -> Self {
        Self {
            start_vcn: 0,
            last_vcn: -1,
            compression_unit: 0,
            allocated_size: 0,
            data_size: 0,
            initialized_size: 0,
            compressed_size: None,
            runs: RunList::new(),
        }
    }

    /// Refresh `last_vcn` and `allocated_size` from the run list.
    pub fn sync_extent(&mut self, cluster_size: u64) {
        let clusters = self.runs.total_clusters();
        self.last_vcn = self.start_vcn as i64 + clusters as i64 - 1;
        self.allocated_size = clusters * cluster_size;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeBody {
    Resident { value: Vec<u8>, indexed: bool },
    NonResident(NonResident),
}

/// One attribute as stored in a FILE record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeRecord {
    pub attr_type: u32,
    pub name: String,
    pub flags: u16,
    pub id: u16,
    pub body: AttributeBody,
}

impl AttributeRecord {
    pub fn new_resident(attr_type: u32, name: &str, value: Vec<u8>) -> Self {
        Self {
            attr_type,
            name: name.to_string(),
            flags: 0,
            id: 0,
            body: AttributeBody::Resident { value, indexed: false },
        }
    }

    pub fn new_non_resident(attr_type: u32, name: &str, info: NonResident) -> Self {
        Self {
            attr_type,
            name: name.to_string(),
            flags: 0,
            id: 0,
            body: AttributeBody::NonResident(info),
        }
    }

    pub fn with_flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }

    /// Mark a resident attribute as referenced by an index, as $FILE_NAME is.
    pub fn indexed(mut self) -> Self {
        if let AttributeBody::Resident { indexed, .. } = &mut self.body {
            *indexed = true;
        }
        self
    }

    pub fn is_resident(&self) -> bool {
        matches!(self.body, AttributeBody::Resident { .. })
    }

    pub fn matches(&self, attr_type: u32, name: &str) -> bool {
        self.attr_type == attr_type && names_equal(&self.name, name)
    }

    pub fn start_vcn(&self) -> u64 {
        match &self.body {
            AttributeBody::Resident { .. } => 0,
            AttributeBody::NonResident(info) => info.start_vcn,
        }
    }

    /// On-disk ordering key within a record and within an attribute list.
    pub fn sort_order(&self, other: &AttributeRecord) -> Ordering {
        self.attr_type
            .cmp(&other.attr_type)
            .then_with(|| compare_names(&self.name, &other.name))
            .then_with(|| self.start_vcn().cmp(&other.start_vcn()))
    }

    pub fn value(&self) -> Option<&[u8]> {
        match &self.body {
            AttributeBody::Resident { value, .. } => Some(value),
            AttributeBody::NonResident(_) => None,
        }
    }

    pub fn value_mut(&mut self) -> Option<&mut Vec<u8>> {
        match &mut self.body {
            AttributeBody::Resident { value, .. } => Some(value),
            AttributeBody::NonResident(_) => None,
        }
    }

    pub fn non_resident(&self) -> Option<&NonResident> {
        match &self.body {
            AttributeBody::NonResident(info) => Some(info),
            AttributeBody::Resident { .. } => None,
        }
    }

    pub fn non_resident_mut(&mut self) -> Option<&mut NonResident> {
        match &mut self.body {
            AttributeBody::NonResident(info) => Some(info),
            AttributeBody::Resident { .. } => None,
        }
    }

    /// Logical length of the content.
    pub fn data_length(&self) -> u64 {
        match &self.body {
            AttributeBody::Resident { value, .. } => value.len() as u64,
            AttributeBody::NonResident(info) => info.data_size,
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & ATTR_FLAG_COMPRESSED != 0
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & ATTR_FLAG_ENCRYPTED != 0
    }

    pub fn is_sparse(&self) -> bool {
        self.flags & ATTR_FLAG_SPARSE != 0
    }

    /// Physical extents of a non-resident attribute, in VCN order.
    pub fn get_clusters(&self) -> Vec<ClusterRun> {
        match &self.body {
            AttributeBody::Resident { .. } => Vec::new(),
            AttributeBody::NonResident(info) => info.runs.clusters(),
        }
    }

    fn name_offset(&self) -> usize {
        match &self.body {
            AttributeBody::Resident { .. } => RESIDENT_HEADER_SIZE,
            AttributeBody::NonResident(info) if info.compressed_size.is_some() => COMPRESSED_HEADER_SIZE,
            AttributeBody::NonResident(_) => NON_RESIDENT_HEADER_SIZE,
        }
    }

    fn payload_offset(&self) -> usize {
        round_up(self.name_offset() + utf16_len(&self.name) * 2, 8)
    }
}

impl ByteCodec for AttributeRecord {
    fn size(&self) -> usize {
        let payload = match &self.body {
            AttributeBody::Resident { value, .. } => value.len(),
            AttributeBody::NonResident(info) => info.runs.encoded_size(),
        };
        round_up(self.payload_offset() + payload, 8)
    }

    fn read_from(buf: &[u8]) -> Result<(Self, usize), DiscError> {
        let mut reader = ByteReader::new(buf);
        let attr_type = reader.u32()?;
        let length = reader.u32()? as usize;
        if length < RESIDENT_HEADER_SIZE || length > buf.len() || length % 8 != 0 {
            return Err(DiscError::Corrupt(format!(
                "Attribute {:#x} has invalid length {}",
                attr_type, length
            )));
        }
        let buf = &buf[..length];
        let mut reader = ByteReader::at(buf, 8);

        let non_resident = reader.u8()? != 0;
        let name_length = reader.u8()? as usize;
        let name_offset = reader.u16()? as usize;
        let flags = reader.u16()?;
        let id = reader.u16()?;
        let name = ByteReader::at(buf, name_offset).utf16(name_length)?;

        let body = if !non_resident {
            let value_length = reader.u32()? as usize;
            let value_offset = reader.u16()? as usize;
            let indexed = reader.u8()? != 0;
            let value = ByteReader::at(buf, value_offset).bytes(value_length)?.to_vec();
            AttributeBody::Resident { value, indexed }
        } else {
            let start_vcn = reader.u64()?;
            let last_vcn = reader.i64()?;
            let runs_offset = reader.u16()? as usize;
            let compression_unit = reader.u16()?;
            reader.skip(4)?;
            let allocated_size = reader.u64()?;
            let data_size = reader.u64()?;
            let initialized_size = reader.u64()?;
            let header_end = if name_length > 0 { name_offset } else { runs_offset };
            let compressed_size = if header_end >= COMPRESSED_HEADER_SIZE {
                Some(reader.u64()?)
            } else {
                None
            };
            if runs_offset >= length {
                return Err(DiscError::Corrupt(format!(
                    "Run list offset {:#x} outside attribute of {} bytes",
                    runs_offset, length
                )));
            }
            let (runs, _) = RunList::decode(&buf[runs_offset..])?;
            let info = NonResident {
                start_vcn,
                last_vcn,
                compression_unit,
                allocated_size,
                data_size,
                initialized_size,
                compressed_size,
                runs,
            };
            let span = i64::try_from(start_vcn)
                .ok()
                .and_then(|start| last_vcn.checked_sub(start))
                .and_then(|span| span.checked_add(1))
                .ok_or_else(|| {
                    DiscError::Corrupt(format!("Invalid VCN range {}..={}", start_vcn, last_vcn))
                })?;
            if i64::try_from(info.runs.total_clusters()).ok() != Some(span) {
                return Err(DiscError::Corrupt(format!(
                    "Run list covers {} clusters but VCN range is {}..={}",
                    info.runs.total_clusters(),
                    start_vcn,
                    last_vcn
                )));
            }
            AttributeBody::NonResident(info)
        };

        Ok((
            Self {
                attr_type,
                name,
                flags,
                id,
                body,
            },
            length,
        ))
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        let size = self.size();
        let name_offset = self.name_offset();
        let payload_offset = self.payload_offset();
        buf[..size].fill(0);

        let mut writer = ByteWriter::new(buf);
        writer.u32(self.attr_type);
        writer.u32(size as u32);
        writer.u8(u8::from(!self.is_resident()));
        writer.u8(utf16_len(&self.name) as u8);
        writer.u16(if self.name.is_empty() { 0 } else { name_offset as u16 });
        writer.u16(self.flags);
        writer.u16(self.id);

        match &self.body {
            AttributeBody::Resident { value, indexed } => {
                writer.u32(value.len() as u32);
                writer.u16(payload_offset as u16);
                writer.u8(u8::from(*indexed));
                writer.u8(0);
                writer.seek(payload_offset);
                writer.bytes(value);
            }
            AttributeBody::NonResident(info) => {
                writer.u64(info.start_vcn);
                writer.i64(info.last_vcn);
                writer.u16(payload_offset as u16);
                writer.u16(info.compression_unit);
                writer.u32(0);
                writer.u64(info.allocated_size);
                writer.u64(info.data_size);
                writer.u64(info.initialized_size);
                if let Some(compressed) = info.compressed_size {
                    writer.u64(compressed);
                }
                writer.seek(payload_offset);
                writer.bytes(&info.runs.encode());
            }
        }

        writer.seek(name_offset);
        writer.utf16(&self.name);
        size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntfs::data_runs::DataRun;

    #[test]
    fn test_resident_round_trip() {
        let attr = AttributeRecord {
            attr_type: ATTR_TYPE_DATA,
            name: "stream".to_string(),
            flags: 0,
            id: 3,
            body: AttributeBody::Resident {
                value: b"hello world".to_vec(),
                indexed: false,
            },
        };

        let bytes = attr.to_bytes();
        assert_eq!(bytes.len(), attr.size());
        assert_eq!(bytes.len() % 8, 0);

        let (decoded, consumed) = AttributeRecord::read_from(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, attr);
    }

    #[test]
    fn test_resident_unnamed_layout() {
        let attr = AttributeRecord::new_resident(ATTR_TYPE_FILE_NAME, "", vec![0xAA; 0x44]).indexed();
        let bytes = attr.to_bytes();
        // Header, value at 0x18, rounded to 8
        assert_eq!(bytes.len(), 0x60);
        assert_eq!(u16::from_le_bytes([bytes[0x14], bytes[0x15]]), 0x18);
        assert_eq!(bytes[0x16], 1);
        assert_eq!(&bytes[0x18..0x5C], &[0xAA; 0x44][..]);
    }

    #[test]
    fn test_non_resident_round_trip() {
        let mut info = NonResident::empty();
        info.runs = RunList::from_runs(vec![DataRun::allocated(1000, 4), DataRun::sparse(2)]);
        info.sync_extent(4096);
        info.data_size = 20000;
        info.initialized_size = 16384;
        let attr = AttributeRecord::new_non_resident(ATTR_TYPE_DATA, "", info).with_flags(ATTR_FLAG_SPARSE);

        let bytes = attr.to_bytes();
        let (decoded, _) = AttributeRecord::read_from(&bytes).unwrap();
        assert_eq!(decoded.non_resident().unwrap().last_vcn, 5);
        assert_eq!(decoded.non_resident().unwrap().allocated_size, 6 * 4096);
        assert_eq!(decoded.get_clusters(), vec![ClusterRun::new(1000, 4)]);
        assert_eq!(decoded.data_length(), 20000);
        assert!(decoded.is_sparse());
    }

    #[test]
    fn test_invalid_lengths_are_corruption() {
        let attr = AttributeRecord::new_resident(ATTR_TYPE_DATA, "", vec![1, 2, 3]);
        let mut bytes = attr.to_bytes();
        bytes[4] = 0x10;
        assert!(AttributeRecord::read_from(&bytes).unwrap_err().is_corruption());

        let mut bytes = attr.to_bytes();
        // Value length pointing past the attribute
        bytes[0x10] = 0xFF;
        assert!(AttributeRecord::read_from(&bytes).unwrap_err().is_corruption());
    }

    #[test]
    fn test_overflowing_vcn_range_is_corruption() {
        let mut info = NonResident::empty();
        info.runs = RunList::from_runs(vec![DataRun::allocated(50, 2)]);
        info.sync_extent(4096);
        let attr = AttributeRecord::new_non_resident(ATTR_TYPE_DATA, "", info);

        let mut bytes = attr.to_bytes();
        bytes[0x18..0x20].copy_from_slice(&i64::MIN.to_le_bytes());
        bytes[0x10..0x18].copy_from_slice(&1u64.to_le_bytes());
        assert!(AttributeRecord::read_from(&bytes).unwrap_err().is_corruption());

        let mut bytes = attr.to_bytes();
        bytes[0x10..0x18].copy_from_slice(&u64::MAX.to_le_bytes());
        assert!(AttributeRecord::read_from(&bytes).unwrap_err().is_corruption());

        let mut bytes = attr.to_bytes();
        bytes[0x18..0x20].copy_from_slice(&i64::MAX.to_le_bytes());
        assert!(AttributeRecord::read_from(&bytes).unwrap_err().is_corruption());
    }

    #[test]
    fn test_sort_order_is_case_insensitive() {
        let a = AttributeRecord::new_resident(ATTR_TYPE_DATA, "alpha", Vec::new());
        let b = AttributeRecord::new_resident(ATTR_TYPE_DATA, "BETA", Vec::new());
        let c = AttributeRecord::new_resident(ATTR_TYPE_FILE_NAME, "zzz", Vec::new());
        assert_eq!(a.sort_order(&b), Ordering::Less);
        assert_eq!(c.sort_order(&a), Ordering::Less);
        assert!(a.matches(ATTR_TYPE_DATA, "ALPHA"));
    }
}
