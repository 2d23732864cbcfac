// NTFS mount and format options

use discfs_core::DiscError;
use serde::{Deserialize, Serialize};

/// Behaviour knobs for a mounted volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NtfsOptions {
    /// Leave `$MFT`, `$Bitmap` and friends out of directory listings
    pub hide_metafiles: bool,
    /// Index blocks kept in memory per open index
    pub index_cache_capacity: usize,
    /// Let the cluster allocator restart from cluster 0 when the scan reaches the end
    pub allocator_wraps: bool,
    /// Refuse to load FILE records with torn sectors instead of logging them
    pub strict_fixup: bool,
    /// Non-resident streams truncated to this many bytes or fewer move back into their record
    pub resident_threshold: usize,
}

impl Default for NtfsOptions {
    fn default() -> Self {
        Self {
            hide_metafiles: true,
            index_cache_capacity: 64,
            allocator_wraps: false,
            strict_fixup: false,
            resident_threshold: 256,
        }
    }
}

impl NtfsOptions {
    pub fn from_json(json: &str) -> Result<Self, DiscError> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), DiscError> {
        if self.index_cache_capacity == 0 {
            return Err(DiscError::Configuration(
                "index_cache_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Geometry of a volume created by the formatter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NtfsFormatParams {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub mft_record_size: u32,
    pub index_buffer_size: u32,
    /// Fixed number of MFT records; the MFT does not grow after format
    pub mft_records: u64,
    pub volume_label: String,
    /// Random when not given
    pub serial_number: Option<u64>,
}

impl Default for NtfsFormatParams {
    fn default() -> Self {
        Self {
            bytes_per_sector: 512,
            sectors_per_cluster: 8,
            mft_record_size: 1024,
            index_buffer_size: 4096,
            mft_records: 256,
            volume_label: String::new(),
            serial_number: None,
        }
    }
}

impl NtfsFormatParams {
    pub fn from_json(json: &str) -> Result<Self, DiscError> {
        let params: Self = serde_json::from_str(json)?;
        params.validate()?;
        Ok(params)
    }

    pub fn cluster_size(&self) -> u32 {
        self.bytes_per_sector as u32 * self.sectors_per_cluster as u32
    }

    pub fn validate(&self) -> Result<(), DiscError> {
        let sector = self.bytes_per_sector as u32;
        if !self.bytes_per_sector.is_power_of_two() || !(512..=4096).contains(&self.bytes_per_sector) {
            return Err(DiscError::Configuration(format!(
                "bytes_per_sector must be a power of two between 512 and 4096, got {}",
                self.bytes_per_sector
            )));
        }
        if self.sectors_per_cluster == 0 || !self.sectors_per_cluster.is_power_of_two() {
            return Err(DiscError::Configuration(format!(
                "sectors_per_cluster must be a power of two, got {}",
                self.sectors_per_cluster
            )));
        }
        for (what, size) in [
            ("mft_record_size", self.mft_record_size),
            ("index_buffer_size", self.index_buffer_size),
        ] {
            if !size.is_power_of_two() || size < sector || size > 65536 {
                return Err(DiscError::Configuration(format!(
                    "{} must be a power of two of at least one sector, got {}",
                    what, size
                )));
            }
        }
        if self.mft_records < 32 {
            return Err(DiscError::Configuration(format!(
                "mft_records must leave room past the reserved records, got {}",
                self.mft_records
            )));
        }
        if self.volume_label.encode_utf16().count() > 32 {
            return Err(DiscError::Configuration("volume_label is limited to 32 characters".to_string()));
        }
        Ok(())
    }
}
