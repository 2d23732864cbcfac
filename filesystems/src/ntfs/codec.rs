// Byte-level (de)serialization shared by every on-disk NTFS structure
// Cursors over explicit slices replace manual offset arithmetic

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use discfs_core::DiscError;

/// A fixed-layout structure that can be read from and written to raw bytes.
pub trait ByteCodec: Sized {
    /// Serialized size in bytes.
    fn size(&self) -> usize;

    /// Decode from the start of `buf`, returning the value and the bytes consumed.
    fn read_from(buf: &[u8]) -> Result<(Self, usize), DiscError>;

    /// Encode into the start of `buf`, which must be at least `size()` long.
    /// Returns the number of bytes written.
    fn write_to(&self, buf: &mut [u8]) -> usize;

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.size()];
        let written = self.write_to(&mut buf);
        buf.truncate(written);
        buf
    }
}

/// Round `value` up to a multiple of `unit`.
pub fn round_up(value: usize, unit: usize) -> usize {
    value.div_ceil(unit) * unit
}

pub fn ceil_div(value: u64, unit: u64) -> u64 {
    value.div_ceil(unit)
}

/// Encode a name as UTF-16LE bytes.
pub fn utf16_encode(name: &str) -> Vec<u8> {
    name.encode_utf16().flat_map(|c| c.to_le_bytes()).collect()
}

/// Decode UTF-16LE bytes into a String.
pub fn utf16_decode(data: &[u8]) -> Result<String, DiscError> {
    if data.len() % 2 != 0 {
        return Err(DiscError::Corrupt("Invalid UTF-16 string length".to_string()));
    }

    let units: Vec<u16> = data.chunks_exact(2).map(LittleEndian::read_u16).collect();

    String::from_utf16(&units).map_err(|_| DiscError::Corrupt("Invalid UTF-16 string".to_string()))
}

/// Decode UTF-16 code units, replacing unpaired surrogates with U+FFFD.
pub fn utf16_lossy(units: &[u16]) -> String {
    char::decode_utf16(units.iter().copied())
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

/// Number of UTF-16 code units in `name`.
pub fn utf16_len(name: &str) -> usize {
    name.encode_utf16().count()
}

/// Read cursor over a borrowed slice. Every accessor bounds-checks and reports
/// truncation as structural corruption.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn at(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn skip(&mut self, count: usize) -> Result<(), DiscError> {
        self.take(count).map(|_| ())
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], DiscError> {
        let end = self.pos.checked_add(count).filter(|&end| end <= self.buf.len()).ok_or_else(|| {
            DiscError::Corrupt(format!(
                "Truncated structure: need {} bytes at offset {}, have {}",
                count,
                self.pos,
                self.buf.len()
            ))
        })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8, DiscError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, DiscError> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn u32(&mut self) -> Result<u32, DiscError> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn u64(&mut self) -> Result<u64, DiscError> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    pub fn i64(&mut self) -> Result<i64, DiscError> {
        Ok(LittleEndian::read_i64(self.take(8)?))
    }

    pub fn u16_be(&mut self) -> Result<u16, DiscError> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    pub fn u32_be(&mut self) -> Result<u32, DiscError> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    /// Big-endian integer of `width` bytes (up to 8), e.g. a SID authority.
    pub fn uint_be(&mut self, width: usize) -> Result<u64, DiscError> {
        Ok(BigEndian::read_uint(self.take(width)?, width))
    }

    pub fn bytes(&mut self, count: usize) -> Result<&'a [u8], DiscError> {
        self.take(count)
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], DiscError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// UTF-16LE string of `chars` code units.
    pub fn utf16(&mut self, chars: usize) -> Result<String, DiscError> {
        utf16_decode(self.take(chars * 2)?)
    }

    /// Raw UTF-16LE code units, unpaired surrogates included.
    pub fn utf16_units(&mut self, chars: usize) -> Result<Vec<u16>, DiscError> {
        Ok(self.take(chars * 2)?.chunks_exact(2).map(LittleEndian::read_u16).collect())
    }
}

/// Write cursor over a caller-sized mutable slice.
pub struct ByteWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> ByteWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    fn slot(&mut self, count: usize) -> &mut [u8] {
        let start = self.pos;
        self.pos += count;
        &mut self.buf[start..start + count]
    }

    pub fn u8(&mut self, value: u8) {
        self.slot(1)[0] = value;
    }

    pub fn u16(&mut self, value: u16) {
        LittleEndian::write_u16(self.slot(2), value);
    }

    pub fn u32(&mut self, value: u32) {
        LittleEndian::write_u32(self.slot(4), value);
    }

    pub fn u64(&mut self, value: u64) {
        LittleEndian::write_u64(self.slot(8), value);
    }

    pub fn i64(&mut self, value: i64) {
        LittleEndian::write_i64(self.slot(8), value);
    }

    pub fn u32_be(&mut self, value: u32) {
        BigEndian::write_u32(self.slot(4), value);
    }

    pub fn uint_be(&mut self, value: u64, width: usize) {
        BigEndian::write_uint(self.slot(width), value, width);
    }

    pub fn bytes(&mut self, data: &[u8]) {
        self.slot(data.len()).copy_from_slice(data);
    }

    pub fn zeros(&mut self, count: usize) {
        self.slot(count).fill(0);
    }

    /// Write `name` as UTF-16LE, returning the number of code units.
    pub fn utf16(&mut self, name: &str) -> usize {
        let encoded = utf16_encode(name);
        self.bytes(&encoded);
        encoded.len() / 2
    }

    pub fn utf16_units(&mut self, units: &[u16]) {
        for &unit in units {
            self.u16(unit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_primitives() {
        let data = [0x34, 0x12, 0x78, 0x56, 0x34, 0x12, 0xAA, 0x00, 0x01];
        let mut reader = ByteReader::new(&data);
        assert_eq!(reader.u16().unwrap(), 0x1234);
        assert_eq!(reader.u32().unwrap(), 0x12345678);
        assert_eq!(reader.u8().unwrap(), 0xAA);
        assert_eq!(reader.u16_be().unwrap(), 0x0001);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_reader_truncation_is_corruption() {
        let data = [1u8, 2, 3];
        let mut reader = ByteReader::new(&data);
        let err = reader.u32().unwrap_err();
        assert!(err.is_corruption());
        // A failed read leaves the cursor in place
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn test_writer_and_utf16() {
        let mut buf = [0u8; 16];
        let mut writer = ByteWriter::new(&mut buf);
        writer.u32(0xDEADBEEF);
        let chars = writer.utf16("ab");
        writer.uint_be(0x0102_0304_0506, 6);
        assert_eq!(chars, 2);
        assert_eq!(writer.position(), 14);

        let mut reader = ByteReader::new(&buf);
        assert_eq!(reader.u32().unwrap(), 0xDEADBEEF);
        assert_eq!(reader.utf16(2).unwrap(), "ab");
        assert_eq!(reader.uint_be(6).unwrap(), 0x0102_0304_0506);
    }

    #[test]
    fn test_rounding() {
        assert_eq!(round_up(0, 8), 0);
        assert_eq!(round_up(1, 8), 8);
        assert_eq!(round_up(0x42, 8), 0x48);
        assert_eq!(ceil_div(4097, 4096), 2);
        assert_eq!(utf16_len("héllo"), 5);
    }

    #[test]
    fn test_invalid_utf16() {
        assert!(utf16_decode(&[0x41]).is_err());
        // Lone high surrogate
        assert!(utf16_decode(&[0x00, 0xD8]).is_err());
    }

    #[test]
    fn test_unpaired_surrogate_units() {
        let buf = [0x00, 0xD8, 0x41, 0x00];
        let mut reader = ByteReader::new(&buf);
        let units = reader.utf16_units(2).unwrap();
        assert_eq!(units, vec![0xD800, 0x41]);
        assert_eq!(utf16_lossy(&units), "\u{FFFD}A");

        let mut out = [0u8; 4];
        ByteWriter::new(&mut out).utf16_units(&units);
        assert_eq!(out, buf);
    }
}
