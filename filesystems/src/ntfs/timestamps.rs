// NTFS Windows timestamp handling
// FILETIME is 100ns ticks since 1601-01-01 UTC

use chrono::{DateTime, TimeZone, Utc};

/// Seconds between 1601-01-01 and 1970-01-01
const WINDOWS_EPOCH_DIFF: i64 = 11_644_473_600;

const FILETIME_TICKS_PER_SECOND: i64 = 10_000_000;

pub fn datetime_to_filetime(time: DateTime<Utc>) -> u64 {
    let seconds = time.timestamp() + WINDOWS_EPOCH_DIFF;
    if seconds < 0 {
        return 0;
    }
    seconds as u64 * FILETIME_TICKS_PER_SECOND as u64 + (time.timestamp_subsec_nanos() / 100) as u64
}

pub fn filetime_to_datetime(filetime: u64) -> Option<DateTime<Utc>> {
    let ticks = i64::try_from(filetime).ok()?;
    let seconds = ticks / FILETIME_TICKS_PER_SECOND - WINDOWS_EPOCH_DIFF;
    let nanos = ((ticks % FILETIME_TICKS_PER_SECOND) * 100) as u32;
    Utc.timestamp_opt(seconds, nanos).single()
}

pub fn current_filetime() -> u64 {
    datetime_to_filetime(Utc::now())
}

/// The four timestamps NTFS keeps per file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NtfsTimestamps {
    pub creation_time: u64,
    pub modification_time: u64,
    pub mft_modification_time: u64,
    pub access_time: u64,
}

impl NtfsTimestamps {
    pub fn at(filetime: u64) -> Self {
        Self {
            creation_time: filetime,
            modification_time: filetime,
            mft_modification_time: filetime,
            access_time: filetime,
        }
    }

    pub fn now() -> Self {
        Self::at(current_filetime())
    }

    /// Content and metadata changed at `filetime`.
    pub fn touch(&mut self, filetime: u64) {
        self.modification_time = filetime;
        self.mft_modification_time = filetime;
        self.access_time = filetime;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_epoch() {
        let epoch = Utc.timestamp_opt(0, 0).unwrap();
        assert_eq!(datetime_to_filetime(epoch), 116_444_736_000_000_000);
        assert_eq!(filetime_to_datetime(116_444_736_000_000_000), Some(epoch));
    }

    #[test]
    fn test_round_trip_keeps_100ns_precision() {
        let time = Utc.timestamp_opt(1_700_000_000, 123_456_700).unwrap();
        let filetime = datetime_to_filetime(time);
        assert_eq!(filetime_to_datetime(filetime), Some(time));
    }

    #[test]
    fn test_windows_epoch() {
        let start = filetime_to_datetime(0).unwrap();
        assert_eq!(start.format("%Y-%m-%d").to_string(), "1601-01-01");
        assert_eq!(datetime_to_filetime(start), 0);
    }

    #[test]
    fn test_touch_keeps_creation() {
        let mut times = NtfsTimestamps::at(10);
        times.touch(20);
        assert_eq!(times.creation_time, 10);
        assert_eq!(times.modification_time, 20);
        assert_eq!(times.access_time, 20);
    }
}
