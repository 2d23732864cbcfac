// Typed index keys and data
// Decodes the raw entry bytes of the well-known NTFS indexes for diagnostics and callers

use super::collation::CollationRule;
use crate::ntfs::codec::{ByteCodec, ByteReader, ByteWriter};
use crate::ntfs::file_record::FileRecordReference;
use crate::ntfs::structures::FileNameRecord;
use discfs_core::DiscError;
use std::fmt;

/// Security identifier, as used for quota owners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sid {
    pub revision: u8,
    pub authority: [u8; 6],
    pub sub_authorities: Vec<u32>,
}

impl ByteCodec for Sid {
    fn size(&self) -> usize {
        8 + self.sub_authorities.len() * 4
    }

    fn read_from(buf: &[u8]) -> Result<(Self, usize), DiscError> {
        let mut reader = ByteReader::new(buf);
        let revision = reader.u8()?;
        let count = reader.u8()? as usize;
        let authority = reader.array::<6>()?;
        let sub_authorities = (0..count).map(|_| reader.u32()).collect::<Result<Vec<_>, _>>()?;
        Ok((
            Self {
                revision,
                authority,
                sub_authorities,
            },
            reader.position(),
        ))
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        let mut writer = ByteWriter::new(buf);
        writer.u8(self.revision);
        writer.u8(self.sub_authorities.len() as u8);
        writer.bytes(&self.authority);
        for sub in &self.sub_authorities {
            writer.u32(*sub);
        }
        writer.position()
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let authority = self.authority.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64);
        write!(f, "S-{}-{}", self.revision, authority)?;
        for sub in &self.sub_authorities {
            write!(f, "-{}", sub)?;
        }
        Ok(())
    }
}

/// $SDH key: descriptor hash, then id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityHashKey {
    pub hash: u32,
    pub id: u32,
}

impl ByteCodec for SecurityHashKey {
    fn size(&self) -> usize {
        8
    }

    fn read_from(buf: &[u8]) -> Result<(Self, usize), DiscError> {
        let mut reader = ByteReader::new(buf);
        Ok((
            Self {
                hash: reader.u32()?,
                id: reader.u32()?,
            },
            8,
        ))
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        let mut writer = ByteWriter::new(buf);
        writer.u32(self.hash);
        writer.u32(self.id);
        8
    }
}

/// $SII key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityIdKey {
    pub id: u32,
}

impl ByteCodec for SecurityIdKey {
    fn size(&self) -> usize {
        4
    }

    fn read_from(buf: &[u8]) -> Result<(Self, usize), DiscError> {
        Ok((
            Self {
                id: ByteReader::new(buf).u32()?,
            },
            4,
        ))
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        ByteWriter::new(buf).u32(self.id);
        4
    }
}

/// Data of both $SDH and $SII entries: where the descriptor sits in $SDS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityDescriptorData {
    pub hash: u32,
    pub id: u32,
    pub offset: u64,
    /// Size of the $SDS record, header included
    pub length: u32,
}

impl SecurityDescriptorData {
    pub const SIZE: usize = 20;
}

impl ByteCodec for SecurityDescriptorData {
    fn size(&self) -> usize {
        Self::SIZE
    }

    fn read_from(buf: &[u8]) -> Result<(Self, usize), DiscError> {
        let mut reader = ByteReader::new(buf);
        Ok((
            Self {
                hash: reader.u32()?,
                id: reader.u32()?,
                offset: reader.u64()?,
                length: reader.u32()?,
            },
            Self::SIZE,
        ))
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        let mut writer = ByteWriter::new(buf);
        writer.u32(self.hash);
        writer.u32(self.id);
        writer.u64(self.offset);
        writer.u32(self.length);
        Self::SIZE
    }
}

/// $ObjId:$O key, a GUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectIdKey {
    pub id: [u8; 16],
}

impl ByteCodec for ObjectIdKey {
    fn size(&self) -> usize {
        16
    }

    fn read_from(buf: &[u8]) -> Result<(Self, usize), DiscError> {
        Ok((
            Self {
                id: ByteReader::new(buf).array::<16>()?,
            },
            16,
        ))
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        ByteWriter::new(buf).bytes(&self.id);
        16
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectIdData {
    pub file: FileRecordReference,
    pub birth_volume_id: [u8; 16],
    pub birth_object_id: [u8; 16],
    pub domain_id: [u8; 16],
}

impl ByteCodec for ObjectIdData {
    fn size(&self) -> usize {
        56
    }

    fn read_from(buf: &[u8]) -> Result<(Self, usize), DiscError> {
        let mut reader = ByteReader::new(buf);
        Ok((
            Self {
                file: FileRecordReference::from_raw(reader.u64()?),
                birth_volume_id: reader.array::<16>()?,
                birth_object_id: reader.array::<16>()?,
                domain_id: reader.array::<16>()?,
            },
            56,
        ))
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        let mut writer = ByteWriter::new(buf);
        writer.u64(self.file.raw());
        writer.bytes(&self.birth_volume_id);
        writer.bytes(&self.birth_object_id);
        writer.bytes(&self.domain_id);
        56
    }
}

/// $Reparse:$R key. The entry carries no data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReparseKey {
    pub tag: u32,
    pub file: FileRecordReference,
}

impl ByteCodec for ReparseKey {
    fn size(&self) -> usize {
        12
    }

    fn read_from(buf: &[u8]) -> Result<(Self, usize), DiscError> {
        let mut reader = ByteReader::new(buf);
        Ok((
            Self {
                tag: reader.u32()?,
                file: FileRecordReference::from_raw(reader.u64()?),
            },
            12,
        ))
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        let mut writer = ByteWriter::new(buf);
        writer.u32(self.tag);
        writer.u64(self.file.raw());
        12
    }
}

/// $Quota:$Q data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaData {
    pub version: u32,
    pub flags: u32,
    pub bytes_used: u64,
    pub change_time: u64,
    pub warning_limit: u64,
    pub hard_limit: u64,
    pub exceeded_time: u64,
    pub sid: Option<Sid>,
}

impl ByteCodec for QuotaData {
    fn size(&self) -> usize {
        0x30 + self.sid.as_ref().map_or(0, |sid| sid.size())
    }

    fn read_from(buf: &[u8]) -> Result<(Self, usize), DiscError> {
        let mut reader = ByteReader::new(buf);
        let mut quota = Self {
            version: reader.u32()?,
            flags: reader.u32()?,
            bytes_used: reader.u64()?,
            change_time: reader.u64()?,
            warning_limit: reader.u64()?,
            hard_limit: reader.u64()?,
            exceeded_time: reader.u64()?,
            sid: None,
        };
        let mut consumed = reader.position();
        if reader.remaining() > 0 {
            let (sid, len) = Sid::read_from(&buf[consumed..])?;
            quota.sid = Some(sid);
            consumed += len;
        }
        Ok((quota, consumed))
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        let mut writer = ByteWriter::new(buf);
        writer.u32(self.version);
        writer.u32(self.flags);
        writer.u64(self.bytes_used);
        writer.u64(self.change_time);
        writer.u64(self.warning_limit);
        writer.u64(self.hard_limit);
        writer.u64(self.exceeded_time);
        let mut end = writer.position();
        if let Some(sid) = &self.sid {
            end += sid.write_to(&mut buf[end..]);
        }
        end
    }
}

/// Key of an entry in one of the well-known indexes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexKey {
    FileName(FileNameRecord),
    SecurityHash(SecurityHashKey),
    SecurityId(SecurityIdKey),
    ObjectId(ObjectIdKey),
    Reparse(ReparseKey),
    Owner(Sid),
    OwnerId(u32),
    Raw(Vec<u8>),
}

/// Data of an entry in one of the well-known indexes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexData {
    File(FileRecordReference),
    SecurityDescriptor(SecurityDescriptorData),
    ObjectId(ObjectIdData),
    OwnerId(u32),
    Quota(QuotaData),
    Empty,
    Raw(Vec<u8>),
}

/// Which well-known index an (index name, collation rule) pair denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    Directory,
    SecurityHash,
    SecurityId,
    ObjectId,
    Reparse,
    Owner,
    Quota,
    Other,
}

fn flavor(name: &str, rule: CollationRule) -> Flavor {
    match (name, rule) {
        ("$I30", _) => Flavor::Directory,
        ("$SDH", _) => Flavor::SecurityHash,
        ("$SII", _) => Flavor::SecurityId,
        ("$R", _) => Flavor::Reparse,
        // $Quota and $ObjId both name their index $O
        ("$O", CollationRule::Sid) => Flavor::Owner,
        ("$O", _) => Flavor::ObjectId,
        ("$Q", _) => Flavor::Quota,
        _ => Flavor::Other,
    }
}

fn decode<T: ByteCodec>(bytes: &[u8]) -> Result<T, DiscError> {
    T::read_from(bytes).map(|(value, _)| value)
}

impl IndexKey {
    pub fn decode(index_name: &str, rule: CollationRule, bytes: &[u8]) -> Result<Self, DiscError> {
        Ok(match flavor(index_name, rule) {
            Flavor::Directory => Self::FileName(decode(bytes)?),
            Flavor::SecurityHash => Self::SecurityHash(decode(bytes)?),
            Flavor::SecurityId => Self::SecurityId(decode(bytes)?),
            Flavor::ObjectId => Self::ObjectId(decode(bytes)?),
            Flavor::Reparse => Self::Reparse(decode(bytes)?),
            Flavor::Owner => Self::Owner(decode(bytes)?),
            Flavor::Quota => Self::OwnerId(ByteReader::new(bytes).u32()?),
            Flavor::Other => Self::Raw(bytes.to_vec()),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::FileName(key) => key.to_bytes(),
            Self::SecurityHash(key) => key.to_bytes(),
            Self::SecurityId(key) => key.to_bytes(),
            Self::ObjectId(key) => key.to_bytes(),
            Self::Reparse(key) => key.to_bytes(),
            Self::Owner(sid) => sid.to_bytes(),
            Self::OwnerId(id) => id.to_le_bytes().to_vec(),
            Self::Raw(bytes) => bytes.clone(),
        }
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FileName(name) => write!(f, "\"{}\" (parent {})", name.name, name.parent),
            Self::SecurityHash(key) => write!(f, "hash {:#010x} id {:#x}", key.hash, key.id),
            Self::SecurityId(key) => write!(f, "id {:#x}", key.id),
            Self::ObjectId(key) => write!(f, "object {}", hex::encode(key.id)),
            Self::Reparse(key) => write!(f, "tag {:#010x} file {}", key.tag, key.file),
            Self::Owner(sid) => write!(f, "owner {}", sid),
            Self::OwnerId(id) => write!(f, "owner id {}", id),
            Self::Raw(bytes) => write!(f, "{}", hex::encode(bytes)),
        }
    }
}

impl IndexData {
    pub fn decode(index_name: &str, rule: CollationRule, bytes: &[u8]) -> Result<Self, DiscError> {
        Ok(match flavor(index_name, rule) {
            Flavor::Directory => Self::File(FileRecordReference::from_raw(ByteReader::new(bytes).u64()?)),
            Flavor::SecurityHash | Flavor::SecurityId => Self::SecurityDescriptor(decode(bytes)?),
            Flavor::ObjectId => Self::ObjectId(decode(bytes)?),
            Flavor::Owner => Self::OwnerId(ByteReader::new(bytes).u32()?),
            Flavor::Quota => Self::Quota(decode(bytes)?),
            Flavor::Reparse if bytes.is_empty() => Self::Empty,
            Flavor::Reparse | Flavor::Other => Self::Raw(bytes.to_vec()),
        })
    }
}

impl fmt::Display for IndexData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(reference) => write!(f, "{}", reference),
            Self::SecurityDescriptor(data) => {
                write!(f, "$SDS {:#x}+{:#x} (id {:#x})", data.offset, data.length, data.id)
            }
            Self::ObjectId(data) => write!(f, "file {}", data.file),
            Self::OwnerId(id) => write!(f, "owner id {}", id),
            Self::Quota(quota) => write!(f, "{} bytes used, limit {}", quota.bytes_used, quota.hard_limit),
            Self::Empty => Ok(()),
            Self::Raw(bytes) => write!(f, "{}", hex::encode(bytes)),
        }
    }
}

/// One-line rendering of an entry, falling back to hex when the bytes do not decode.
pub fn describe_entry(index_name: &str, rule: CollationRule, key: &[u8], data: &[u8]) -> String {
    let key = IndexKey::decode(index_name, rule, key)
        .map(|k| k.to_string())
        .unwrap_or_else(|_| hex::encode(key));
    let data = IndexData::decode(index_name, rule, data)
        .map(|d| d.to_string())
        .unwrap_or_else(|_| hex::encode(data));
    if data.is_empty() {
        key
    } else {
        format!("{} -> {}", key, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sid_codec_and_display() {
        let sid = Sid {
            revision: 1,
            authority: [0, 0, 0, 0, 0, 5],
            sub_authorities: vec![32, 544],
        };
        let bytes = sid.to_bytes();
        assert_eq!(bytes.len(), 16);
        assert_eq!(decode::<Sid>(&bytes).unwrap(), sid);
        assert_eq!(sid.to_string(), "S-1-5-32-544");
    }

    #[test]
    fn test_security_keys_decode_by_index_name() {
        let key = SecurityHashKey { hash: 0xDEAD_BEEF, id: 0x100 };
        let data = SecurityDescriptorData {
            hash: 0xDEAD_BEEF,
            id: 0x100,
            offset: 0x40,
            length: 0x64,
        };
        assert_eq!(
            IndexKey::decode("$SDH", CollationRule::SecurityHash, &key.to_bytes()).unwrap(),
            IndexKey::SecurityHash(key)
        );
        assert_eq!(
            IndexData::decode("$SII", CollationRule::UnsignedLong, &data.to_bytes()).unwrap(),
            IndexData::SecurityDescriptor(data)
        );
        assert_eq!(
            describe_entry("$SII", CollationRule::UnsignedLong, &0x100u32.to_le_bytes(), &data.to_bytes()),
            "id 0x100 -> $SDS 0x40+0x64 (id 0x100)"
        );
    }

    #[test]
    fn test_o_index_depends_on_collation() {
        let sid = Sid {
            revision: 1,
            authority: [0, 0, 0, 0, 0, 5],
            sub_authorities: vec![18],
        };
        assert!(matches!(
            IndexKey::decode("$O", CollationRule::Sid, &sid.to_bytes()).unwrap(),
            IndexKey::Owner(_)
        ));
        assert!(matches!(
            IndexKey::decode("$O", CollationRule::MultipleUnsignedLongs, &[7u8; 16]).unwrap(),
            IndexKey::ObjectId(_)
        ));
    }

    #[test]
    fn test_directory_entry_description() {
        let parent = FileRecordReference::new(5, 5);
        let name = FileNameRecord::new(parent, "notes.txt", 0, 0);
        let file = FileRecordReference::new(30, 2);
        let text = describe_entry("$I30", CollationRule::FileName, &name.to_bytes(), &file.raw().to_le_bytes());
        assert_eq!(text, "\"notes.txt\" (parent MFT#5 (seq 5)) -> MFT#30 (seq 2)");
    }

    #[test]
    fn test_undecodable_bytes_fall_back_to_hex() {
        assert_eq!(describe_entry("$SDH", CollationRule::SecurityHash, &[1, 2], &[]), "0102");
        assert_eq!(describe_entry("$X", CollationRule::Binary, &[0xAB], &[0xCD]), "ab -> cd");
    }

    #[test]
    fn test_reparse_key_codec() {
        let key = ReparseKey {
            tag: 0xA000_000C,
            file: FileRecordReference::new(44, 1),
        };
        assert_eq!(key.to_bytes().len(), 12);
        assert_eq!(
            IndexKey::decode("$R", CollationRule::MultipleUnsignedLongs, &key.to_bytes()).unwrap(),
            IndexKey::Reparse(key)
        );
        assert_eq!(
            IndexData::decode("$R", CollationRule::MultipleUnsignedLongs, &[]).unwrap(),
            IndexData::Empty
        );
    }
}
