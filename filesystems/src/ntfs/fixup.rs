// NTFS update sequence ("fixup") protection for multi-sector records
// Every FILE record and INDX block stamps a marker on each sector tail so a
// torn write can be detected when the record is read back.

use super::codec::{ByteReader, ByteWriter};
use byteorder::{ByteOrder, LittleEndian};
use discfs_core::DiscError;
use log::{trace, warn};

/// Magic, update sequence offset and update sequence count.
pub const FIXUP_HEADER_SIZE: usize = 8;

/// Common prefix of every fixed-up record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixupHeader {
    pub magic: [u8; 4],
    pub update_sequence_offset: u16,
    /// One entry for the sequence number plus one per sector.
    pub update_sequence_count: u16,
}

impl FixupHeader {
    pub fn new(magic: [u8; 4], update_sequence_offset: u16, record_size: usize, bytes_per_sector: usize) -> Self {
        Self {
            magic,
            update_sequence_offset,
            update_sequence_count: update_sequence_count(record_size, bytes_per_sector),
        }
    }

    pub fn read(buf: &[u8]) -> Result<Self, DiscError> {
        if buf.len() < FIXUP_HEADER_SIZE {
            return Err(DiscError::Corrupt(format!(
                "Record of {} bytes is smaller than the fixup header",
                buf.len()
            )));
        }
        let mut reader = ByteReader::new(buf);
        Ok(Self {
            magic: reader.array::<4>()?,
            update_sequence_offset: reader.u16()?,
            update_sequence_count: reader.u16()?,
        })
    }

    pub fn write(&self, buf: &mut [u8]) {
        let mut writer = ByteWriter::new(buf);
        writer.bytes(&self.magic);
        writer.u16(self.update_sequence_offset);
        writer.u16(self.update_sequence_count);
    }

    /// Size of the update sequence array in bytes.
    pub fn array_size(&self) -> usize {
        self.update_sequence_count as usize * 2
    }

    fn validate(&self, len: usize, bytes_per_sector: usize) -> Result<(), DiscError> {
        let offset = self.update_sequence_offset as usize;
        let count = self.update_sequence_count as usize;
        if count == 0 {
            return Err(DiscError::Corrupt("Empty update sequence array".to_string()));
        }
        if offset < FIXUP_HEADER_SIZE || offset + self.array_size() > len {
            return Err(DiscError::Corrupt(format!(
                "Update sequence array {}+{} outside record of {} bytes",
                offset,
                self.array_size(),
                len
            )));
        }
        if (count - 1) * bytes_per_sector > len {
            return Err(DiscError::Corrupt(format!(
                "{} protected sectors exceed record of {} bytes",
                count - 1,
                len
            )));
        }
        Ok(())
    }
}

/// Number of update sequence entries for a record of `record_size` bytes.
pub fn update_sequence_count(record_size: usize, bytes_per_sector: usize) -> u16 {
    (record_size / bytes_per_sector + 1) as u16
}

/// A sector whose tail did not carry the expected marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TornSector {
    pub sector: usize,
    pub expected: u16,
    pub found: u16,
}

/// Result of undoing the fixups on a record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixupOutcome {
    pub sequence_number: u16,
    pub torn_sectors: Vec<TornSector>,
}

impl FixupOutcome {
    pub fn is_consistent(&self) -> bool {
        self.torn_sectors.is_empty()
    }

    /// Turn the first torn sector into an error.
    pub fn into_strict(self) -> Result<Self, DiscError> {
        match self.torn_sectors.first() {
            Some(torn) => Err(DiscError::FixupMismatch {
                sector: torn.sector,
                expected: torn.expected,
                found: torn.found,
            }),
            None => Ok(self),
        }
    }
}

/// Verify the magic and undo the fixups in place.
///
/// A marker mismatch does not fail the decode: the sector's original bytes
/// are restored anyway and the mismatch is reported in the outcome.
pub fn decode(buf: &mut [u8], magic: &[u8; 4], bytes_per_sector: usize) -> Result<FixupOutcome, DiscError> {
    let header = FixupHeader::read(buf)?;
    if &header.magic != magic {
        return Err(DiscError::Corrupt(format!(
            "Bad record signature {:?}, expected {:?}",
            String::from_utf8_lossy(&header.magic),
            String::from_utf8_lossy(magic)
        )));
    }
    header.validate(buf.len(), bytes_per_sector)?;

    let usa = header.update_sequence_offset as usize;
    let sequence_number = LittleEndian::read_u16(&buf[usa..usa + 2]);
    let mut outcome = FixupOutcome {
        sequence_number,
        torn_sectors: Vec::new(),
    };

    for sector in 1..header.update_sequence_count as usize {
        let tail = sector * bytes_per_sector - 2;
        let found = LittleEndian::read_u16(&buf[tail..tail + 2]);
        if found != sequence_number {
            warn!(
                "Torn write detected in sector {}: marker {:#06x}, expected {:#06x}",
                sector - 1,
                found,
                sequence_number
            );
            outcome.torn_sectors.push(TornSector {
                sector: sector - 1,
                expected: sequence_number,
                found,
            });
        }
        let saved = usa + sector * 2;
        buf.copy_within(saved..saved + 2, tail);
    }

    trace!("Fixups removed, sequence number {:#06x}", sequence_number);
    Ok(outcome)
}

/// Stamp a fresh update sequence number over every sector tail.
///
/// The header (magic, array offset and count) must already be in `buf`.
/// Returns the sequence number written.
pub fn encode(buf: &mut [u8], bytes_per_sector: usize) -> Result<u16, DiscError> {
    let header = FixupHeader::read(buf)?;
    header.validate(buf.len(), bytes_per_sector)?;

    let usa = header.update_sequence_offset as usize;
    let mut sequence_number = LittleEndian::read_u16(&buf[usa..usa + 2]).wrapping_add(1);
    if sequence_number == 0 || sequence_number == 0xFFFF {
        sequence_number = 1;
    }
    LittleEndian::write_u16(&mut buf[usa..usa + 2], sequence_number);

    for sector in 1..header.update_sequence_count as usize {
        let tail = sector * bytes_per_sector - 2;
        let saved = usa + sector * 2;
        buf.copy_within(tail..tail + 2, saved);
        LittleEndian::write_u16(&mut buf[tail..tail + 2], sequence_number);
    }

    Ok(sequence_number)
}

/// The logical content of any fixed-up record, whatever its type.
#[derive(Debug, Clone)]
pub struct GenericFixupRecord {
    pub header: FixupHeader,
    pub outcome: FixupOutcome,
    content: Vec<u8>,
}

impl GenericFixupRecord {
    pub fn read(raw: &[u8], magic: &[u8; 4], bytes_per_sector: usize) -> Result<Self, DiscError> {
        let mut buf = raw.to_vec();
        let outcome = decode(&mut buf, magic, bytes_per_sector)?;
        let header = FixupHeader::read(&buf)?;
        buf.truncate((header.update_sequence_count as usize - 1) * bytes_per_sector);
        Ok(Self {
            header,
            outcome,
            content: buf,
        })
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> Vec<u8> {
        let mut data: Vec<u8> = (0..1024u32).map(|i| (i * 7 % 251) as u8).collect();
        FixupHeader::new(*b"FILE", 0x30, 1024, 512).write(&mut data);
        data[0x30..0x36].fill(0);
        data
    }

    #[test]
    fn test_fixup_round_trip() {
        let original = sample_record();
        let mut raw = original.clone();

        let usn = encode(&mut raw, 512).unwrap();
        assert_eq!(usn, 1);
        assert_eq!(LittleEndian::read_u16(&raw[510..512]), usn);
        assert_eq!(LittleEndian::read_u16(&raw[1022..1024]), usn);

        let outcome = decode(&mut raw, b"FILE", 512).unwrap();
        assert!(outcome.is_consistent());
        assert_eq!(outcome.sequence_number, usn);
        // Everything outside the update sequence array matches
        assert_eq!(&raw[..0x30], &original[..0x30]);
        assert_eq!(&raw[0x36..], &original[0x36..]);
    }

    #[test]
    fn test_sequence_number_increments() {
        let mut raw = sample_record();
        let first = encode(&mut raw, 512).unwrap();
        decode(&mut raw, b"FILE", 512).unwrap();
        let second = encode(&mut raw, 512).unwrap();
        assert_eq!(second, first + 1);
    }

    #[test]
    fn test_torn_sector_reported_but_restored() {
        let original = sample_record();
        let mut raw = original.clone();
        encode(&mut raw, 512).unwrap();

        // Corrupt the marker on the second sector
        raw[1022] ^= 0xFF;

        let outcome = decode(&mut raw, b"FILE", 512).unwrap();
        assert_eq!(outcome.torn_sectors.len(), 1);
        assert_eq!(outcome.torn_sectors[0].sector, 1);
        // Both sectors still carry their original content
        assert_eq!(&raw[0x36..1024], &original[0x36..1024]);

        let strict = outcome.into_strict();
        assert!(matches!(strict, Err(DiscError::FixupMismatch { sector: 1, .. })));
    }

    #[test]
    fn test_bad_magic_and_short_record() {
        let mut raw = sample_record();
        encode(&mut raw, 512).unwrap();
        assert!(decode(&mut raw.clone(), b"INDX", 512).unwrap_err().is_corruption());
        assert!(decode(&mut [0u8; 4], b"FILE", 512).unwrap_err().is_corruption());

        // Array pointing past the end of the record
        raw[4..6].copy_from_slice(&0x3FFu16.to_le_bytes());
        assert!(decode(&mut raw, b"FILE", 512).unwrap_err().is_corruption());
    }

    #[test]
    fn test_generic_fixup_record_content() {
        let original = sample_record();
        let mut raw = original.clone();
        encode(&mut raw, 512).unwrap();

        let record = GenericFixupRecord::read(&raw, b"FILE", 512).unwrap();
        assert_eq!(record.content().len(), 1024);
        assert_eq!(&record.content()[0x36..], &original[0x36..]);
        assert_eq!(record.header.update_sequence_count, 3);
    }
}
