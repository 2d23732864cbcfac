// NTFS attribute bodies
// Typed views of $STANDARD_INFORMATION, $FILE_NAME, $VOLUME_INFORMATION and the $INDEX_ROOT header

use super::codec::{utf16_len, utf16_lossy, ByteCodec, ByteReader, ByteWriter};
use super::file_record::FileRecordReference;
use super::timestamps::NtfsTimestamps;
use discfs_core::DiscError;

// File attribute flags (DOS-style)
pub const FILE_ATTRIBUTE_READONLY: u32 = 0x0000_0001;
pub const FILE_ATTRIBUTE_HIDDEN: u32 = 0x0000_0002;
pub const FILE_ATTRIBUTE_SYSTEM: u32 = 0x0000_0004;
pub const FILE_ATTRIBUTE_ARCHIVE: u32 = 0x0000_0020;
pub const FILE_ATTRIBUTE_NORMAL: u32 = 0x0000_0080;
pub const FILE_ATTRIBUTE_SPARSE: u32 = 0x0000_0200;
pub const FILE_ATTRIBUTE_COMPRESSED: u32 = 0x0000_0800;
/// Set in $FILE_NAME entries of directories
pub const FILE_ATTRIBUTE_DIRECTORY: u32 = 0x1000_0000;

// File name namespaces
pub const FILE_NAME_POSIX: u8 = 0;
pub const FILE_NAME_WIN32: u8 = 1;
pub const FILE_NAME_DOS: u8 = 2;
pub const FILE_NAME_WIN32_AND_DOS: u8 = 3;

pub const VOLUME_FLAG_DIRTY: u16 = 0x0001;

const STANDARD_INFORMATION_V1_SIZE: usize = 0x30;
const STANDARD_INFORMATION_SIZE: usize = 0x48;
const FILE_NAME_HEADER_SIZE: usize = 0x42;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StandardInformation {
    pub times: NtfsTimestamps,
    pub file_attributes: u32,
    pub max_versions: u32,
    pub version: u32,
    pub class_id: u32,
    pub owner_id: u32,
    pub security_id: u32,
    pub quota_charged: u64,
    pub usn: u64,
}

impl StandardInformation {
    pub fn new(filetime: u64, file_attributes: u32) -> Self {
        Self {
            times: NtfsTimestamps::at(filetime),
            file_attributes,
            ..Default::default()
        }
    }
}

fn read_times(reader: &mut ByteReader<'_>) -> Result<NtfsTimestamps, DiscError> {
    Ok(NtfsTimestamps {
        creation_time: reader.u64()?,
        modification_time: reader.u64()?,
        mft_modification_time: reader.u64()?,
        access_time: reader.u64()?,
    })
}

fn write_times(writer: &mut ByteWriter<'_>, times: &NtfsTimestamps) {
    writer.u64(times.creation_time);
    writer.u64(times.modification_time);
    writer.u64(times.mft_modification_time);
    writer.u64(times.access_time);
}

impl ByteCodec for StandardInformation {
    fn size(&self) -> usize {
        STANDARD_INFORMATION_SIZE
    }

    fn read_from(buf: &[u8]) -> Result<(Self, usize), DiscError> {
        let mut reader = ByteReader::new(buf);
        let times = read_times(&mut reader)?;
        let file_attributes = reader.u32()?;
        let max_versions = reader.u32()?;
        let version = reader.u32()?;
        let class_id = reader.u32()?;

        let mut info = Self {
            times,
            file_attributes,
            max_versions,
            version,
            class_id,
            ..Default::default()
        };
        // NTFS 1.x records stop here
        if buf.len() < STANDARD_INFORMATION_SIZE {
            return Ok((info, STANDARD_INFORMATION_V1_SIZE));
        }
        info.owner_id = reader.u32()?;
        info.security_id = reader.u32()?;
        info.quota_charged = reader.u64()?;
        info.usn = reader.u64()?;
        Ok((info, STANDARD_INFORMATION_SIZE))
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        let mut writer = ByteWriter::new(buf);
        write_times(&mut writer, &self.times);
        writer.u32(self.file_attributes);
        writer.u32(self.max_versions);
        writer.u32(self.version);
        writer.u32(self.class_id);
        writer.u32(self.owner_id);
        writer.u32(self.security_id);
        writer.u64(self.quota_charged);
        writer.u64(self.usn);
        STANDARD_INFORMATION_SIZE
    }
}

/// Body of a $FILE_NAME attribute, also the key of $I30 directory indexes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileNameRecord {
    pub parent: FileRecordReference,
    pub times: NtfsTimestamps,
    pub allocated_size: u64,
    pub real_size: u64,
    pub flags: u32,
    pub ea_size: u32,
    pub namespace: u8,
    /// Display form; unpaired surrogates read from disk show as U+FFFD.
    pub name: String,
    /// On-disk code units, kept only when `name` cannot reproduce them.
    pub raw_name: Option<Vec<u16>>,
}

impl FileNameRecord {
    pub fn new(parent: FileRecordReference, name: &str, filetime: u64, flags: u32) -> Self {
        Self {
            parent,
            times: NtfsTimestamps::at(filetime),
            flags,
            namespace: FILE_NAME_WIN32,
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Search key carrying only a name, for directory lookups.
    pub fn lookup_key(name: &str) -> Self {
        Self {
            namespace: FILE_NAME_WIN32,
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn is_directory(&self) -> bool {
        self.flags & FILE_ATTRIBUTE_DIRECTORY != 0
    }

    fn name_units(&self) -> Vec<u16> {
        match &self.raw_name {
            Some(units) => units.clone(),
            None => self.name.encode_utf16().collect(),
        }
    }

    /// Offset of the name length byte, as collation needs it.
    pub const NAME_LENGTH_OFFSET: usize = 0x40;
    pub const NAME_OFFSET: usize = FILE_NAME_HEADER_SIZE;
}

impl ByteCodec for FileNameRecord {
    fn size(&self) -> usize {
        let chars = match &self.raw_name {
            Some(units) => units.len(),
            None => utf16_len(&self.name),
        };
        FILE_NAME_HEADER_SIZE + chars * 2
    }

    fn read_from(buf: &[u8]) -> Result<(Self, usize), DiscError> {
        let mut reader = ByteReader::new(buf);
        let parent = FileRecordReference::from_raw(reader.u64()?);
        let times = read_times(&mut reader)?;
        let allocated_size = reader.u64()?;
        let real_size = reader.u64()?;
        let flags = reader.u32()?;
        let ea_size = reader.u32()?;
        let name_length = reader.u8()? as usize;
        let namespace = reader.u8()?;
        let units = reader.utf16_units(name_length)?;
        let (name, raw_name) = match String::from_utf16(&units) {
            Ok(name) => (name, None),
            Err(_) => (utf16_lossy(&units), Some(units)),
        };
        Ok((
            Self {
                parent,
                times,
                allocated_size,
                real_size,
                flags,
                ea_size,
                namespace,
                name,
                raw_name,
            },
            reader.position(),
        ))
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        let mut writer = ByteWriter::new(buf);
        writer.u64(self.parent.raw());
        write_times(&mut writer, &self.times);
        writer.u64(self.allocated_size);
        writer.u64(self.real_size);
        writer.u32(self.flags);
        writer.u32(self.ea_size);
        let units = self.name_units();
        writer.u8(units.len() as u8);
        writer.u8(self.namespace);
        writer.utf16_units(&units);
        writer.position()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeInformation {
    pub major_version: u8,
    pub minor_version: u8,
    pub flags: u16,
}

impl VolumeInformation {
    pub fn new() -> Self {
        Self {
            major_version: 3,
            minor_version: 1,
            flags: 0,
        }
    }

    /// Set when the volume was not cleanly unmounted and needs log replay.
    pub fn is_dirty(&self) -> bool {
        self.flags & VOLUME_FLAG_DIRTY != 0
    }
}

impl Default for VolumeInformation {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteCodec for VolumeInformation {
    fn size(&self) -> usize {
        12
    }

    fn read_from(buf: &[u8]) -> Result<(Self, usize), DiscError> {
        let mut reader = ByteReader::at(buf, 8);
        Ok((
            Self {
                major_version: reader.u8()?,
                minor_version: reader.u8()?,
                flags: reader.u16()?,
            },
            12,
        ))
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        let mut writer = ByteWriter::new(buf);
        writer.u64(0);
        writer.u8(self.major_version);
        writer.u8(self.minor_version);
        writer.u16(self.flags);
        12
    }
}

/// First 0x10 bytes of an $INDEX_ROOT attribute; the root node follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRootHeader {
    /// Attribute type the index is built over, 0 for view indexes
    pub indexed_type: u32,
    pub collation_rule: u32,
    pub index_buffer_size: u32,
    pub raw_clusters_per_buffer: i8,
}

impl IndexRootHeader {
    pub const SIZE: usize = 0x10;
}

impl ByteCodec for IndexRootHeader {
    fn size(&self) -> usize {
        Self::SIZE
    }

    fn read_from(buf: &[u8]) -> Result<(Self, usize), DiscError> {
        let mut reader = ByteReader::new(buf);
        let indexed_type = reader.u32()?;
        let collation_rule = reader.u32()?;
        let index_buffer_size = reader.u32()?;
        let raw_clusters_per_buffer = reader.u8()? as i8;
        reader.skip(3)?;
        Ok((
            Self {
                indexed_type,
                collation_rule,
                index_buffer_size,
                raw_clusters_per_buffer,
            },
            Self::SIZE,
        ))
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        let mut writer = ByteWriter::new(buf);
        writer.u32(self.indexed_type);
        writer.u32(self.collation_rule);
        writer.u32(self.index_buffer_size);
        writer.u8(self.raw_clusters_per_buffer as u8);
        writer.zeros(3);
        Self::SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_information_round_trip() {
        let mut info = StandardInformation::new(0x01D9_0000_0000_0000, FILE_ATTRIBUTE_ARCHIVE);
        info.security_id = 0x101;
        let bytes = info.to_bytes();
        assert_eq!(bytes.len(), 0x48);
        let (decoded, _) = StandardInformation::read_from(&bytes).unwrap();
        assert_eq!(decoded, info);

        // Short legacy form
        let (legacy, consumed) = StandardInformation::read_from(&bytes[..0x30]).unwrap();
        assert_eq!(consumed, 0x30);
        assert_eq!(legacy.security_id, 0);
        assert_eq!(legacy.times, info.times);
    }

    #[test]
    fn test_file_name_layout() {
        let name = FileNameRecord::new(FileRecordReference::new(5, 5), "hello.txt", 1234, FILE_ATTRIBUTE_ARCHIVE);
        let bytes = name.to_bytes();
        assert_eq!(bytes.len(), 0x42 + 18);
        assert_eq!(bytes[FileNameRecord::NAME_LENGTH_OFFSET], 9);
        assert_eq!(bytes[0x41], FILE_NAME_WIN32);

        let (decoded, consumed) = FileNameRecord::read_from(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, name);
        assert!(!decoded.is_directory());
    }

    #[test]
    fn test_file_name_with_unpaired_surrogate() {
        let mut bytes = FileNameRecord::new(FileRecordReference::new(5, 5), "xA", 0, 0).to_bytes();
        // Replace 'x' with a lone high surrogate
        bytes[FileNameRecord::NAME_OFFSET..FileNameRecord::NAME_OFFSET + 2].copy_from_slice(&[0x00, 0xD8]);

        let (decoded, _) = FileNameRecord::read_from(&bytes).unwrap();
        assert_eq!(decoded.name, "\u{FFFD}A");
        assert_eq!(decoded.raw_name, Some(vec![0xD800, 0x41]));
        assert_eq!(decoded.size(), bytes.len());
        assert_eq!(decoded.to_bytes(), bytes);
    }

    #[test]
    fn test_volume_information_dirty_flag() {
        let mut info = VolumeInformation::new();
        assert!(!info.is_dirty());
        info.flags |= VOLUME_FLAG_DIRTY;
        let (decoded, _) = VolumeInformation::read_from(&info.to_bytes()).unwrap();
        assert!(decoded.is_dirty());
        assert_eq!((decoded.major_version, decoded.minor_version), (3, 1));
    }

    #[test]
    fn test_index_root_header() {
        let header = IndexRootHeader {
            indexed_type: 0x30,
            collation_rule: 1,
            index_buffer_size: 4096,
            raw_clusters_per_buffer: 1,
        };
        let (decoded, _) = IndexRootHeader::read_from(&header.to_bytes()).unwrap();
        assert_eq!(decoded, header);
    }
}
