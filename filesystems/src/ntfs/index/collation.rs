// NTFS index collation
// Sort orders for index keys, selected by the collation rule in $INDEX_ROOT

use crate::ntfs::codec::ByteReader;
use crate::ntfs::structures::FileNameRecord;
use byteorder::{ByteOrder, LittleEndian};
use discfs_core::DiscError;
use std::cmp::Ordering;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollationRule {
    Binary,
    FileName,
    UnicodeString,
    UnsignedLong,
    Sid,
    SecurityHash,
    MultipleUnsignedLongs,
}

impl CollationRule {
    pub fn from_raw(raw: u32) -> Result<Self, DiscError> {
        match raw {
            0x00 => Ok(Self::Binary),
            0x01 => Ok(Self::FileName),
            0x02 => Ok(Self::UnicodeString),
            0x10 => Ok(Self::UnsignedLong),
            0x11 => Ok(Self::Sid),
            0x12 => Ok(Self::SecurityHash),
            0x13 => Ok(Self::MultipleUnsignedLongs),
            other => Err(DiscError::UnsupportedFeature(format!("Collation rule {:#x}", other))),
        }
    }

    pub fn raw(&self) -> u32 {
        match self {
            Self::Binary => 0x00,
            Self::FileName => 0x01,
            Self::UnicodeString => 0x02,
            Self::UnsignedLong => 0x10,
            Self::Sid => 0x11,
            Self::SecurityHash => 0x12,
            Self::MultipleUnsignedLongs => 0x13,
        }
    }
}

/// Comparison strategy for raw index keys.
pub trait Collate {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Upper-case mapping for every UTF-16 code unit, as stored in $UpCase.
pub struct UpperCase {
    table: Vec<u16>,
}

impl UpperCase {
    pub const SIZE: usize = 0x10000 * 2;

    /// Build the table from Rust's Unicode case mapping.
    pub fn generate() -> Self {
        let table = (0..=u16::MAX)
            .map(|unit| {
                let Some(c) = char::from_u32(unit as u32) else {
                    return unit;
                };
                let mut upper = c.to_uppercase();
                match (upper.next(), upper.next()) {
                    (Some(u), None) if (u as u32) <= 0xFFFF => u as u16,
                    _ => unit,
                }
            })
            .collect();
        Self { table }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DiscError> {
        if bytes.len() < Self::SIZE {
            return Err(DiscError::Corrupt(format!("$UpCase holds {} bytes", bytes.len())));
        }
        let table = bytes[..Self::SIZE].chunks_exact(2).map(LittleEndian::read_u16).collect();
        Ok(Self { table })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.table.iter().flat_map(|unit| unit.to_le_bytes()).collect()
    }

    pub fn upcase(&self, unit: u16) -> u16 {
        self.table[unit as usize]
    }

    pub fn compare(&self, a: &[u16], b: &[u16]) -> Ordering {
        for (x, y) in a.iter().zip(b) {
            match self.upcase(*x).cmp(&self.upcase(*y)) {
                Ordering::Equal => {}
                other => return other,
            }
        }
        a.len().cmp(&b.len())
    }

    pub fn compare_str(&self, a: &str, b: &str) -> Ordering {
        let a: Vec<u16> = a.encode_utf16().collect();
        let b: Vec<u16> = b.encode_utf16().collect();
        self.compare(&a, &b)
    }
}

fn units(bytes: &[u8]) -> Vec<u16> {
    bytes.chunks_exact(2).map(LittleEndian::read_u16).collect()
}

fn file_name_units(key: &[u8]) -> Vec<u16> {
    let length = key.get(FileNameRecord::NAME_LENGTH_OFFSET).copied().unwrap_or(0) as usize;
    let start = FileNameRecord::NAME_OFFSET;
    let end = (start + length * 2).min(key.len());
    key.get(start..end).map(units).unwrap_or_default()
}

fn u32_at(key: &[u8], offset: usize) -> u32 {
    ByteReader::at(key, offset).u32().unwrap_or(0)
}

/// A collation rule bound to the volume's upper-case table.
#[derive(Clone)]
pub struct Collator {
    rule: CollationRule,
    upcase: Arc<UpperCase>,
}

impl Collator {
    pub fn new(rule: CollationRule, upcase: Arc<UpperCase>) -> Self {
        Self { rule, upcase }
    }

    pub fn rule(&self) -> CollationRule {
        self.rule
    }
}

impl Collate for Collator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self.rule {
            CollationRule::Binary => a.cmp(b),
            CollationRule::FileName => self.upcase.compare(&file_name_units(a), &file_name_units(b)),
            CollationRule::UnicodeString => self.upcase.compare(&units(a), &units(b)),
            CollationRule::UnsignedLong => u32_at(a, 0).cmp(&u32_at(b, 0)),
            CollationRule::Sid => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
            CollationRule::SecurityHash => u32_at(a, 0)
                .cmp(&u32_at(b, 0))
                .then_with(|| u32_at(a, 4).cmp(&u32_at(b, 4))),
            CollationRule::MultipleUnsignedLongs => {
                let a_words = a.chunks_exact(4).map(LittleEndian::read_u32);
                let b_words = b.chunks_exact(4).map(LittleEndian::read_u32);
                a_words.cmp(b_words)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntfs::codec::ByteCodec;
    use crate::ntfs::file_record::FileRecordReference;

    fn collator(rule: CollationRule) -> Collator {
        Collator::new(rule, Arc::new(UpperCase::generate()))
    }

    #[test]
    fn test_upcase_table() {
        let upcase = UpperCase::generate();
        assert_eq!(upcase.upcase('a' as u16), 'A' as u16);
        assert_eq!(upcase.upcase('é' as u16), 'É' as u16);
        assert_eq!(upcase.upcase('1' as u16), '1' as u16);
        // Characters that expand to several upper-case letters stay put
        assert_eq!(upcase.upcase('ß' as u16), 'ß' as u16);

        let reloaded = UpperCase::from_bytes(&upcase.to_bytes()).unwrap();
        assert_eq!(reloaded.upcase('z' as u16), 'Z' as u16);
        assert!(UpperCase::from_bytes(&[0u8; 16]).is_err());
    }

    #[test]
    fn test_file_name_collation_ignores_case() {
        let c = collator(CollationRule::FileName);
        let parent = FileRecordReference::new(5, 5);
        let a = FileNameRecord::new(parent, "readme.TXT", 0, 0).to_bytes();
        let b = FileNameRecord::new(parent, "README.txt", 99, 0).to_bytes();
        let longer = FileNameRecord::new(parent, "readme.txt2", 0, 0).to_bytes();
        assert_eq!(c.compare(&a, &b), Ordering::Equal);
        assert_eq!(c.compare(&a, &longer), Ordering::Less);
        assert_eq!(c.compare(&FileNameRecord::lookup_key("b").to_bytes(), &a), Ordering::Less);
    }

    #[test]
    fn test_numeric_collations() {
        let c = collator(CollationRule::UnsignedLong);
        assert_eq!(c.compare(&0x100u32.to_le_bytes(), &0xFFu32.to_le_bytes()), Ordering::Greater);

        let c = collator(CollationRule::SecurityHash);
        let key = |hash: u32, id: u32| [hash.to_le_bytes(), id.to_le_bytes()].concat();
        assert_eq!(c.compare(&key(1, 9), &key(2, 0)), Ordering::Less);
        assert_eq!(c.compare(&key(2, 1), &key(2, 0)), Ordering::Greater);

        let c = collator(CollationRule::MultipleUnsignedLongs);
        assert_eq!(c.compare(&key(1, 0x200), &key(1, 0x1FF)), Ordering::Greater);
    }

    #[test]
    fn test_unknown_rule_is_unsupported() {
        assert!(matches!(
            CollationRule::from_raw(0x99),
            Err(DiscError::UnsupportedFeature(_))
        ));
        assert_eq!(CollationRule::from_raw(0x12).unwrap(), CollationRule::SecurityHash);
    }
}
