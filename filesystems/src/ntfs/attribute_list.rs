// NTFS $ATTRIBUTE_LIST
// Maps every attribute of a file to the FILE record (base or extension) holding it

use super::attributes::{attribute_type_name, compare_names, names_equal, AttributeRecord};
use super::codec::{round_up, utf16_len, ByteCodec, ByteReader, ByteWriter};
use super::file_record::FileRecordReference;
use discfs_core::DiscError;
use std::cmp::Ordering;

const NAME_OFFSET: usize = 0x20;
const MIN_RECORD_LENGTH: usize = 0x18;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeListRecord {
    pub attr_type: u32,
    pub name: String,
    pub start_vcn: u64,
    /// Record holding the attribute
    pub reference: FileRecordReference,
    pub attribute_id: u16,
}

impl AttributeListRecord {
    pub fn from_attribute(attr: &AttributeRecord, reference: FileRecordReference) -> Self {
        Self {
            attr_type: attr.attr_type,
            name: attr.name.clone(),
            start_vcn: attr.start_vcn(),
            reference,
            attribute_id: attr.id,
        }
    }

    pub fn matches(&self, attr_type: u32, name: &str) -> bool {
        self.attr_type == attr_type && names_equal(&self.name, name)
    }

    /// (type, case-insensitive name, start VCN)
    pub fn compare(&self, other: &Self) -> Ordering {
        self.attr_type
            .cmp(&other.attr_type)
            .then_with(|| compare_names(&self.name, &other.name))
            .then_with(|| self.start_vcn.cmp(&other.start_vcn))
    }

    pub fn dump(&self, indent: &str) -> String {
        format!(
            "{indent}ATTRIBUTE LIST RECORD\n\
             {indent}                 Type: {}\n\
             {indent}        Record Length: {}\n\
             {indent}                 Name: {}\n\
             {indent}            Start VCN: {}\n\
             {indent}  Base File Reference: {}\n\
             {indent}         Attribute ID: {}\n",
            attribute_type_name(self.attr_type),
            self.size(),
            self.name,
            self.start_vcn,
            self.reference,
            self.attribute_id,
        )
    }
}

impl ByteCodec for AttributeListRecord {
    fn size(&self) -> usize {
        round_up(NAME_OFFSET + utf16_len(&self.name) * 2, 8)
    }

    fn read_from(buf: &[u8]) -> Result<(Self, usize), DiscError> {
        let mut reader = ByteReader::new(buf);
        let attr_type = reader.u32()?;
        let record_length = reader.u16()? as usize;
        let name_length = reader.u8()? as usize;
        let name_offset = reader.u8()? as usize;
        let start_vcn = reader.u64()?;
        let reference = FileRecordReference::from_raw(reader.u64()?);
        let attribute_id = reader.u16()?;

        if record_length < MIN_RECORD_LENGTH || record_length > buf.len() {
            return Err(DiscError::Corrupt(format!(
                "Malformed attribute list record (length {})",
                record_length
            )));
        }
        let name = if name_length > 0 {
            ByteReader::at(&buf[..record_length], name_offset).utf16(name_length)?
        } else {
            String::new()
        };

        Ok((
            Self {
                attr_type,
                name,
                start_vcn,
                reference,
                attribute_id,
            },
            record_length,
        ))
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        let size = self.size();
        buf[..size].fill(0);
        let mut writer = ByteWriter::new(buf);
        writer.u32(self.attr_type);
        writer.u16(size as u16);
        writer.u8(utf16_len(&self.name) as u8);
        writer.u8(NAME_OFFSET as u8);
        writer.u64(self.start_vcn);
        writer.u64(self.reference.raw());
        writer.u16(self.attribute_id);
        writer.seek(NAME_OFFSET);
        writer.utf16(&self.name);
        size
    }
}

/// The sorted content of an $ATTRIBUTE_LIST attribute.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeList {
    records: Vec<AttributeListRecord>,
}

impl AttributeList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, DiscError> {
        let mut records = Vec::new();
        let mut pos = 0;
        while pos < data.len() {
            let (record, length) = AttributeListRecord::read_from(&data[pos..])?;
            records.push(record);
            pos += length;
        }
        let mut list = Self { records };
        list.records.sort_by(AttributeListRecord::compare);
        Ok(list)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.size()];
        let mut pos = 0;
        for record in &self.records {
            pos += record.write_to(&mut buf[pos..]);
        }
        buf
    }

    pub fn size(&self) -> usize {
        self.records.iter().map(ByteCodec::size).sum()
    }

    pub fn records(&self) -> &[AttributeListRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Insert in sorted position.
    pub fn insert(&mut self, record: AttributeListRecord) {
        let position = self
            .records
            .partition_point(|existing| existing.compare(&record) != Ordering::Greater);
        self.records.insert(position, record);
    }

    pub fn remove(&mut self, attr_type: u32, name: &str, start_vcn: u64) -> Option<AttributeListRecord> {
        let position = self
            .records
            .iter()
            .position(|r| r.matches(attr_type, name) && r.start_vcn == start_vcn)?;
        Some(self.records.remove(position))
    }

    /// Every fragment entry of the named attribute, in VCN order.
    pub fn find(&self, attr_type: u32, name: &str) -> impl Iterator<Item = &AttributeListRecord> + '_ {
        let name = name.to_string();
        self.records.iter().filter(move |r| r.matches(attr_type, &name))
    }

    pub fn find_first(&self, attr_type: u32, name: &str) -> Option<&AttributeListRecord> {
        self.find(attr_type, name).next()
    }

    /// Distinct records referenced by the list.
    pub fn referenced_records(&self) -> Vec<FileRecordReference> {
        let mut references: Vec<FileRecordReference> = self.records.iter().map(|r| r.reference).collect();
        references.sort();
        references.dedup();
        references
    }

    pub fn dump(&self) -> String {
        let mut out = format!("ATTRIBUTE LIST ({} records)\n", self.records.len());
        for record in &self.records {
            out.push_str(&record.dump("  "));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntfs::attributes::{ATTR_TYPE_DATA, ATTR_TYPE_FILE_NAME, ATTR_TYPE_STANDARD_INFORMATION};

    fn record(attr_type: u32, name: &str, vcn: u64, index: u64) -> AttributeListRecord {
        AttributeListRecord {
            attr_type,
            name: name.to_string(),
            start_vcn: vcn,
            reference: FileRecordReference::new(index, 1),
            attribute_id: index as u16,
        }
    }

    #[test]
    fn test_record_layout() {
        let unnamed = record(ATTR_TYPE_DATA, "", 0, 30);
        assert_eq!(unnamed.size(), 0x20);
        let named = record(ATTR_TYPE_DATA, "$I30", 0, 30);
        assert_eq!(named.size(), 0x28);

        let bytes = named.to_bytes();
        assert_eq!(bytes[7], 0x20);
        let (decoded, length) = AttributeListRecord::read_from(&bytes).unwrap();
        assert_eq!(length, 0x28);
        assert_eq!(decoded, named);
    }

    #[test]
    fn test_short_record_is_corruption() {
        let mut bytes = record(ATTR_TYPE_DATA, "", 0, 1).to_bytes();
        bytes[4] = 0x10;
        assert!(AttributeListRecord::read_from(&bytes).unwrap_err().is_corruption());
    }

    #[test]
    fn test_sorted_insert_and_find() {
        let mut list = AttributeList::new();
        list.insert(record(ATTR_TYPE_DATA, "b", 0, 31));
        list.insert(record(ATTR_TYPE_STANDARD_INFORMATION, "", 0, 30));
        list.insert(record(ATTR_TYPE_DATA, "A", 8, 32));
        list.insert(record(ATTR_TYPE_DATA, "a", 0, 30));
        list.insert(record(ATTR_TYPE_FILE_NAME, "", 0, 30));

        let order: Vec<(u32, &str, u64)> = list
            .records()
            .iter()
            .map(|r| (r.attr_type, r.name.as_str(), r.start_vcn))
            .collect();
        assert_eq!(
            order,
            vec![
                (ATTR_TYPE_STANDARD_INFORMATION, "", 0),
                (ATTR_TYPE_FILE_NAME, "", 0),
                (ATTR_TYPE_DATA, "a", 0),
                (ATTR_TYPE_DATA, "A", 8),
                (ATTR_TYPE_DATA, "b", 0),
            ]
        );

        let fragments: Vec<u64> = list.find(ATTR_TYPE_DATA, "a").map(|r| r.start_vcn).collect();
        assert_eq!(fragments, vec![0, 8]);
        assert_eq!(list.referenced_records().len(), 3);

        let decoded = AttributeList::from_bytes(&list.to_bytes()).unwrap();
        assert_eq!(decoded, list);

        assert!(list.remove(ATTR_TYPE_DATA, "A", 8).is_some());
        assert_eq!(list.len(), 4);
        assert!(list.dump().contains("$FILE_NAME"));
    }
}
