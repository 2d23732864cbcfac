// NTFS security descriptor table ($Secure)
// Descriptors are appended to the $SDS stream and indexed by hash ($SDH) and id ($SII)

use super::attributes::ATTR_TYPE_DATA;
use super::codec::{round_up, ByteCodec, ByteReader, ByteWriter};
use super::file::NtfsFile;
use super::index::{CollationRule, Index, SecurityDescriptorData, SecurityHashKey, SecurityIdKey};
use super::mft::MFT_RECORD_SECURE;
use super::stream::NtfsStream;
use super::transaction::NtfsTransaction;
use super::volume::NtfsContext;
use discfs_core::DiscError;
use log::{debug, info, trace};
use std::collections::HashMap;

pub const SECURITY_STREAM: &str = "$SDS";
pub const SECURITY_HASH_INDEX: &str = "$SDH";
pub const SECURITY_ID_INDEX: &str = "$SII";
pub const FIRST_SECURITY_ID: u32 = 0x100;

const RECORD_HEADER_SIZE: usize = 0x14;
const RECORD_ALIGNMENT: usize = 16;

/// Hash NTFS keys descriptors by: each little-endian word added to the running hash rotated left by 3.
/// Trailing bytes that do not fill a word are ignored.
pub fn descriptor_hash(descriptor: &[u8]) -> u32 {
    descriptor.chunks_exact(4).fold(0u32, |hash, word| {
        u32::from_le_bytes([word[0], word[1], word[2], word[3]]).wrapping_add(hash.rotate_left(3))
    })
}

/// One $SDS entry: header plus the opaque descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityDescriptorRecord {
    pub hash: u32,
    pub id: u32,
    pub offset: u64,
    pub descriptor: Vec<u8>,
}

impl ByteCodec for SecurityDescriptorRecord {
    fn size(&self) -> usize {
        RECORD_HEADER_SIZE + self.descriptor.len()
    }

    fn read_from(buf: &[u8]) -> Result<(Self, usize), DiscError> {
        let mut reader = ByteReader::new(buf);
        let hash = reader.u32()?;
        let id = reader.u32()?;
        let offset = reader.u64()?;
        let entry_size = reader.u32()? as usize;
        if entry_size < RECORD_HEADER_SIZE {
            return Err(DiscError::Corrupt(format!(
                "Security descriptor {:#x} has entry size {}",
                id, entry_size
            )));
        }
        let descriptor = reader.bytes(entry_size - RECORD_HEADER_SIZE)?.to_vec();
        Ok((
            Self {
                hash,
                id,
                offset,
                descriptor,
            },
            entry_size,
        ))
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        let mut writer = ByteWriter::new(buf);
        writer.u32(self.hash);
        writer.u32(self.id);
        writer.u64(self.offset);
        writer.u32(self.size() as u32);
        writer.bytes(&self.descriptor);
        writer.position()
    }
}

fn key_hash(key: &[u8]) -> u32 {
    ByteReader::new(key).u32().unwrap_or(0)
}

/// Deduplicating descriptor store of a mounted volume.
///
/// Reference counts live in memory only; nothing is ever removed from $SDS.
pub struct SecurityDescriptors {
    next_id: u32,
    next_offset: u64,
    references: HashMap<u32, u32>,
}

impl SecurityDescriptors {
    /// Add the $SDS stream and both indexes to a fresh $Secure file.
    pub fn initialize(ctx: &mut NtfsContext, tx: &NtfsTransaction, mut file: NtfsFile) -> Result<NtfsFile, DiscError> {
        NtfsStream::new(ATTR_TYPE_DATA, SECURITY_STREAM).create(ctx, &mut file, tx)?;
        let file = Index::create(ctx, tx, file, SECURITY_HASH_INDEX, 0, CollationRule::SecurityHash)?.into_file();
        let file = Index::create(ctx, tx, file, SECURITY_ID_INDEX, 0, CollationRule::UnsignedLong)?.into_file();
        Ok(file)
    }

    /// Scan $SII for the next free id and the end of $SDS.
    pub fn open(ctx: &mut NtfsContext) -> Result<Self, DiscError> {
        let file = NtfsFile::load_index(ctx, MFT_RECORD_SECURE)?;
        let mut sii = Index::open(ctx, file, SECURITY_ID_INDEX)?;

        let mut next_id = FIRST_SECURITY_ID;
        let mut next_offset = 0u64;
        let mut count = 0usize;
        for entry in sii.entries(ctx) {
            let (_, data) = entry?;
            let (data, _) = SecurityDescriptorData::read_from(&data)?;
            next_id = next_id.max(data.id + 1);
            next_offset = next_offset.max(round_up((data.offset + data.length as u64) as usize, RECORD_ALIGNMENT) as u64);
            count += 1;
        }
        info!(
            "Security table: {} descriptor(s), next id {:#x}, $SDS end {:#x}",
            count, next_id, next_offset
        );
        Ok(Self {
            next_id,
            next_offset,
            references: HashMap::new(),
        })
    }

    pub fn next_id(&self) -> u32 {
        self.next_id
    }

    /// Uses recorded since mount.
    pub fn reference_count(&self, id: u32) -> u32 {
        self.references.get(&id).copied().unwrap_or(0)
    }

    fn read_record(
        ctx: &mut NtfsContext,
        file: &NtfsFile,
        location: &SecurityDescriptorData,
    ) -> Result<SecurityDescriptorRecord, DiscError> {
        let mut buf = vec![0u8; location.length as usize];
        let read = NtfsStream::new(ATTR_TYPE_DATA, SECURITY_STREAM).read(ctx, file, location.offset, &mut buf)?;
        if read < buf.len() {
            return Err(DiscError::Corrupt(format!(
                "Security descriptor {:#x} runs past the end of $SDS",
                location.id
            )));
        }
        let (record, _) = SecurityDescriptorRecord::read_from(&buf)?;
        if record.id != location.id || record.hash != location.hash {
            return Err(DiscError::Corrupt(format!(
                "$SDS at {:#x} holds descriptor {:#x}, index says {:#x}",
                location.offset, record.id, location.id
            )));
        }
        Ok(record)
    }

    /// Store a descriptor, returning the id of an identical one when present.
    pub fn add_descriptor(
        &mut self,
        ctx: &mut NtfsContext,
        tx: &NtfsTransaction,
        descriptor: &[u8],
    ) -> Result<u32, DiscError> {
        let hash = descriptor_hash(descriptor);
        let file = NtfsFile::load_index(ctx, MFT_RECORD_SECURE)?;
        let mut sdh = Index::open(ctx, file, SECURITY_HASH_INDEX)?;

        let candidates = sdh
            .find_all(ctx, move |key| hash.cmp(&key_hash(key)))
            .map(|entry| entry.and_then(|(_, data)| SecurityDescriptorData::read_from(&data).map(|(d, _)| d)))
            .collect::<Result<Vec<_>, _>>()?;
        for candidate in &candidates {
            let existing = Self::read_record(ctx, sdh.file(), candidate)?;
            if existing.descriptor == descriptor {
                *self.references.entry(candidate.id).or_insert(0) += 1;
                trace!("Reusing security descriptor {:#x}", candidate.id);
                return Ok(candidate.id);
            }
        }

        let id = self.next_id;
        let offset = self.next_offset;
        let record = SecurityDescriptorRecord {
            hash,
            id,
            offset,
            descriptor: descriptor.to_vec(),
        };
        let mut bytes = record.to_bytes();
        let location = SecurityDescriptorData {
            hash,
            id,
            offset,
            length: bytes.len() as u32,
        };
        bytes.resize(round_up(bytes.len(), RECORD_ALIGNMENT), 0);

        let mut file = sdh.into_file();
        NtfsStream::new(ATTR_TYPE_DATA, SECURITY_STREAM).write(ctx, &mut file, tx, offset, &bytes)?;

        let mut sdh = Index::open(ctx, file, SECURITY_HASH_INDEX)?;
        sdh.insert(ctx, tx, &SecurityHashKey { hash, id }.to_bytes(), &location.to_bytes())?;
        let mut sii = Index::open(ctx, sdh.into_file(), SECURITY_ID_INDEX)?;
        sii.insert(ctx, tx, &SecurityIdKey { id }.to_bytes(), &location.to_bytes())?;

        self.next_id += 1;
        self.next_offset = offset + bytes.len() as u64;
        self.references.insert(id, 1);
        debug!(
            "Stored security descriptor {:#x} ({} bytes, hash {:#010x}) at $SDS {:#x}",
            id,
            descriptor.len(),
            hash,
            offset
        );
        Ok(id)
    }

    /// The descriptor stored under `id`, `NotFound` when there is none.
    pub fn get_descriptor(&self, ctx: &mut NtfsContext, id: u32) -> Result<Vec<u8>, DiscError> {
        let file = NtfsFile::load_index(ctx, MFT_RECORD_SECURE)?;
        let mut sii = Index::open(ctx, file, SECURITY_ID_INDEX)?;
        let data = sii
            .try_get(ctx, &SecurityIdKey { id }.to_bytes())?
            .ok_or_else(|| DiscError::NotFound(format!("Security descriptor {:#x}", id)))?;
        let (location, _) = SecurityDescriptorData::read_from(&data)?;
        Ok(Self::read_record(ctx, sii.file(), &location)?.descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::formatted_context;

    fn descriptor(seed: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn test_hash() {
        assert_eq!(descriptor_hash(&[]), 0);
        assert_eq!(descriptor_hash(&[1, 0, 0, 0]), 1);
        assert_eq!(descriptor_hash(&[1, 0, 0, 0, 0, 0, 0, 0]), 8);
        // Trailing partial words do not count
        assert_eq!(descriptor_hash(&[1, 0, 0, 0, 0xFF]), 1);
        assert_eq!(descriptor_hash(&[0, 0, 0, 0x80, 0, 0, 0, 0]), 4);
    }

    #[test]
    fn test_record_layout() {
        let record = SecurityDescriptorRecord {
            hash: 0x1234,
            id: 0x100,
            offset: 0x40,
            descriptor: vec![0xEE; 12],
        };
        let bytes = record.to_bytes();
        assert_eq!(bytes.len(), 0x14 + 12);
        assert_eq!(u32::from_le_bytes([bytes[0x10], bytes[0x11], bytes[0x12], bytes[0x13]]), 0x20);
        assert_eq!(SecurityDescriptorRecord::read_from(&bytes).unwrap().0, record);

        let mut short = bytes.clone();
        short[0x10] = 0x04;
        assert!(SecurityDescriptorRecord::read_from(&short).unwrap_err().is_corruption());
    }

    #[test]
    fn test_identical_descriptor_is_shared() {
        let (mut ctx, tx) = formatted_context();
        let mut table = SecurityDescriptors::open(&mut ctx).unwrap();
        let first = table.next_id();

        let a = descriptor(1, 60);
        let b = descriptor(2, 44);
        let id_a = table.add_descriptor(&mut ctx, &tx, &a).unwrap();
        let id_b = table.add_descriptor(&mut ctx, &tx, &b).unwrap();
        assert_eq!(id_a, first);
        assert_eq!(id_b, first + 1);

        assert_eq!(table.add_descriptor(&mut ctx, &tx, &a).unwrap(), id_a);
        assert_eq!(table.reference_count(id_a), 2);
        assert_eq!(table.get_descriptor(&mut ctx, id_b).unwrap(), b);
        assert!(table.get_descriptor(&mut ctx, 0x9999).unwrap_err().is_not_found());

        let mut reopened = SecurityDescriptors::open(&mut ctx).unwrap();
        assert_eq!(reopened.next_id(), first + 2);
        assert_eq!(reopened.get_descriptor(&mut ctx, id_a).unwrap(), a);
        assert_eq!(reopened.reference_count(id_a), 0);

        // Counts restart with the mount
        assert_eq!(reopened.add_descriptor(&mut ctx, &tx, &a).unwrap(), id_a);
        assert_eq!(reopened.reference_count(id_a), 1);
        assert_eq!(reopened.next_id(), first + 2);
    }

    #[test]
    fn test_hash_collision_gets_new_id() {
        let (mut ctx, tx) = formatted_context();
        let mut table = SecurityDescriptors::open(&mut ctx).unwrap();
        let x = vec![1, 0, 0, 0, 0, 0, 0, 0];
        let y = vec![8, 0, 0, 0];
        assert_eq!(descriptor_hash(&x), descriptor_hash(&y));

        let id_x = table.add_descriptor(&mut ctx, &tx, &x).unwrap();
        let id_y = table.add_descriptor(&mut ctx, &tx, &y).unwrap();
        assert_ne!(id_x, id_y);
        assert_eq!(table.get_descriptor(&mut ctx, id_y).unwrap(), y);
        assert_eq!(table.add_descriptor(&mut ctx, &tx, &y).unwrap(), id_y);
    }
}
