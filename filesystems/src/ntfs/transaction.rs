// NTFS metadata transaction context
// One timestamp shared by every metadata change made for a single logical operation.
// Not a durability mechanism: nothing is journaled or rolled back.

use super::timestamps::datetime_to_filetime;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NtfsTransaction {
    timestamp: DateTime<Utc>,
}

impl NtfsTransaction {
    /// Transaction stamped with the current time.
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Self { timestamp }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// The timestamp as an NTFS FILETIME.
    pub fn filetime(&self) -> u64 {
        datetime_to_filetime(self.timestamp)
    }
}

impl Default for NtfsTransaction {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_fixed_timestamp() {
        let when = Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).unwrap();
        let tx = NtfsTransaction::at(when);
        assert_eq!(tx.timestamp(), when);
        assert_eq!(tx.filetime(), datetime_to_filetime(when));
        // Copies share the same stamp
        let copy = tx;
        assert_eq!(copy.filetime(), tx.filetime());
    }
}
