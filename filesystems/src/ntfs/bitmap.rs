// NTFS presence bitmaps
// Shared by the MFT record bitmap, index block bitmaps and the volume cluster bitmap

use discfs_core::DiscError;

/// Bit-per-unit presence vector, least significant bit first within each byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    bytes: Vec<u8>,
    /// Number of meaningful bits
    len: u64,
    /// Upper bound for `grow`
    max_len: u64,
}

impl Bitmap {
    /// All-clear bitmap of `len` bits that may not grow.
    pub fn new(len: u64) -> Self {
        Self::with_limit(len, len)
    }

    /// All-clear bitmap of `len` bits that may grow up to `max_len` bits.
    pub fn with_limit(len: u64, max_len: u64) -> Self {
        Self {
            bytes: vec![0u8; len.div_ceil(8) as usize],
            len,
            max_len: max_len.max(len),
        }
    }

    /// Wrap raw bitmap bytes. Bits past `len` are ignored.
    pub fn from_bytes(bytes: &[u8], len: u64, max_len: u64) -> Result<Self, DiscError> {
        let needed = len.div_ceil(8) as usize;
        if bytes.len() < needed {
            return Err(DiscError::Corrupt(format!(
                "Bitmap of {} bytes cannot describe {} units",
                bytes.len(),
                len
            )));
        }
        Ok(Self {
            bytes: bytes[..needed].to_vec(),
            len,
            max_len: max_len.max(len),
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn max_len(&self) -> u64 {
        self.max_len
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_present(&self, index: u64) -> bool {
        if index >= self.len {
            return false;
        }
        self.bytes[(index / 8) as usize] & (1 << (index % 8)) != 0
    }

    fn check(&self, index: u64) -> Result<(), DiscError> {
        if index >= self.len {
            return Err(DiscError::InvalidInput(format!(
                "Bit {} outside bitmap of {} bits",
                index, self.len
            )));
        }
        Ok(())
    }

    pub fn mark_present(&mut self, index: u64) -> Result<(), DiscError> {
        self.check(index)?;
        self.bytes[(index / 8) as usize] |= 1 << (index % 8);
        Ok(())
    }

    pub fn mark_absent(&mut self, index: u64) -> Result<(), DiscError> {
        self.check(index)?;
        self.bytes[(index / 8) as usize] &= !(1 << (index % 8));
        Ok(())
    }

    pub fn mark_range(&mut self, start: u64, count: u64, present: bool) -> Result<(), DiscError> {
        if count == 0 {
            return Ok(());
        }
        self.check(start + count - 1)?;
        for index in start..start + count {
            let mask = 1 << (index % 8);
            let byte = &mut self.bytes[(index / 8) as usize];
            if present {
                *byte |= mask;
            } else {
                *byte &= !mask;
            }
        }
        Ok(())
    }

    /// First clear bit at or after `start`.
    pub fn find_first_absent(&self, start: u64) -> Option<u64> {
        let mut index = start;
        while index < self.len {
            // Skip whole bytes that are fully used
            if index % 8 == 0 && self.bytes[(index / 8) as usize] == 0xFF {
                index += 8;
                continue;
            }
            if !self.is_present(index) {
                return Some(index);
            }
            index += 1;
        }
        None
    }

    /// Length of the clear run starting at `start`, capped at `limit`.
    pub fn absent_run_length(&self, start: u64, limit: u64) -> u64 {
        let mut length = 0;
        while length < limit && start + length < self.len && !self.is_present(start + length) {
            length += 1;
        }
        length
    }

    /// Extend to `new_len` bits, up to the configured maximum.
    pub fn grow(&mut self, new_len: u64) -> Result<(), DiscError> {
        if new_len <= self.len {
            return Ok(());
        }
        if new_len > self.max_len {
            return Err(DiscError::CapacityExceeded(format!(
                "Bitmap cannot grow to {} bits (limit {})",
                new_len, self.max_len
            )));
        }
        self.bytes.resize(new_len.div_ceil(8) as usize, 0);
        self.len = new_len;
        Ok(())
    }

    /// Mark the first clear bit at or after `start`, growing by one bit when full.
    pub fn allocate_first_available(&mut self, start: u64) -> Result<u64, DiscError> {
        let index = match self.find_first_absent(start) {
            Some(index) => index,
            None => {
                let index = self.len.max(start);
                self.grow(index + 1)?;
                index
            }
        };
        self.mark_present(index)?;
        Ok(index)
    }

    pub fn count_present(&self) -> u64 {
        (0..self.len).filter(|&i| self.is_present(i)).count() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_and_test() {
        let mut bitmap = Bitmap::new(20);
        bitmap.mark_present(3).unwrap();
        bitmap.mark_range(8, 4, true).unwrap();
        assert!(bitmap.is_present(3));
        assert!(bitmap.is_present(11));
        assert!(!bitmap.is_present(12));
        assert_eq!(bitmap.as_bytes()[1], 0x0F);
        assert_eq!(bitmap.count_present(), 5);

        bitmap.mark_absent(3).unwrap();
        assert!(!bitmap.is_present(3));
        assert!(bitmap.mark_present(20).is_err());
    }

    #[test]
    fn test_first_available() {
        let mut bitmap = Bitmap::new(32);
        bitmap.mark_range(0, 17, true).unwrap();
        assert_eq!(bitmap.find_first_absent(0), Some(17));
        assert_eq!(bitmap.find_first_absent(20), Some(20));
        assert_eq!(bitmap.absent_run_length(17, 100), 15);
        assert_eq!(bitmap.absent_run_length(17, 4), 4);
    }

    #[test]
    fn test_growth_limit() {
        let mut bitmap = Bitmap::with_limit(8, 10);
        bitmap.mark_range(0, 8, true).unwrap();
        assert_eq!(bitmap.allocate_first_available(0).unwrap(), 8);
        assert_eq!(bitmap.allocate_first_available(0).unwrap(), 9);
        let err = bitmap.allocate_first_available(0).unwrap_err();
        assert!(matches!(err, DiscError::CapacityExceeded(_)));
        assert_eq!(bitmap.as_bytes().len(), 2);
    }

    #[test]
    fn test_from_bytes() {
        let bitmap = Bitmap::from_bytes(&[0x81, 0xFF, 0x00], 9, 9).unwrap();
        assert!(bitmap.is_present(0));
        assert!(bitmap.is_present(7));
        assert!(bitmap.is_present(8));
        assert!(!bitmap.is_present(9));
        assert!(Bitmap::from_bytes(&[0x00], 9, 9).is_err());
    }
}
