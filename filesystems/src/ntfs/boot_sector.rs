// NTFS boot sector
// The BIOS parameter block describing volume geometry and where the MFT lives

use super::codec::{ByteReader, ByteWriter};
use discfs_core::DiscError;
use log::debug;

pub const BOOT_SECTOR_SIZE: usize = 512;
pub const NTFS_OEM_ID: &[u8; 8] = b"NTFS    ";
const BOOT_SIGNATURE: u16 = 0xAA55;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BiosParameterBlock {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub media_descriptor: u8,
    pub sectors_per_track: u16,
    pub num_heads: u16,
    pub hidden_sectors: u32,
    pub total_sectors: u64,
    pub mft_lcn: u64,
    pub mft_mirror_lcn: u64,
    /// Clusters per MFT record if positive, else log2 of the size in bytes, negated
    pub raw_mft_record_size: i8,
    pub raw_index_buffer_size: i8,
    pub serial_number: u64,
}

/// Encode a structure size the way the boot sector stores it.
pub fn encode_raw_size(size: u32, cluster_size: u32) -> i8 {
    if size >= cluster_size {
        (size / cluster_size) as i8
    } else {
        -(size.trailing_zeros() as i8)
    }
}

fn decode_raw_size(raw: i8, cluster_size: u32) -> Result<u32, DiscError> {
    if raw > 0 {
        Ok(raw as u32 * cluster_size)
    } else if (-31..0).contains(&raw) {
        Ok(1u32 << (-(raw as i32)))
    } else {
        Err(DiscError::Corrupt(format!("Invalid raw structure size {}", raw)))
    }
}

impl BiosParameterBlock {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bytes_per_sector: u16,
        sectors_per_cluster: u8,
        total_sectors: u64,
        mft_lcn: u64,
        mft_mirror_lcn: u64,
        mft_record_size: u32,
        index_buffer_size: u32,
        serial_number: u64,
    ) -> Self {
        let cluster_size = bytes_per_sector as u32 * sectors_per_cluster as u32;
        Self {
            bytes_per_sector,
            sectors_per_cluster,
            media_descriptor: 0xF8,
            sectors_per_track: 63,
            num_heads: 255,
            hidden_sectors: 0,
            total_sectors,
            mft_lcn,
            mft_mirror_lcn,
            raw_mft_record_size: encode_raw_size(mft_record_size, cluster_size),
            raw_index_buffer_size: encode_raw_size(index_buffer_size, cluster_size),
            serial_number,
        }
    }

    pub fn parse(sector: &[u8]) -> Result<Self, DiscError> {
        if sector.len() < BOOT_SECTOR_SIZE {
            return Err(DiscError::Corrupt("Boot sector too small".to_string()));
        }
        if &sector[3..11] != NTFS_OEM_ID {
            return Err(DiscError::Corrupt("Not an NTFS boot sector (bad OEM ID)".to_string()));
        }
        let mut reader = ByteReader::at(sector, 0x1FE);
        if reader.u16()? != BOOT_SIGNATURE {
            return Err(DiscError::Corrupt("Boot sector signature missing".to_string()));
        }

        let mut reader = ByteReader::at(sector, 0x0B);
        let bytes_per_sector = reader.u16()?;
        let sectors_per_cluster = reader.u8()?;
        reader.seek(0x15);
        let media_descriptor = reader.u8()?;
        reader.seek(0x18);
        let sectors_per_track = reader.u16()?;
        let num_heads = reader.u16()?;
        let hidden_sectors = reader.u32()?;
        reader.seek(0x28);
        let total_sectors = reader.u64()?;
        let mft_lcn = reader.u64()?;
        let mft_mirror_lcn = reader.u64()?;
        let raw_mft_record_size = reader.u8()? as i8;
        reader.seek(0x44);
        let raw_index_buffer_size = reader.u8()? as i8;
        reader.seek(0x48);
        let serial_number = reader.u64()?;

        let bpb = Self {
            bytes_per_sector,
            sectors_per_cluster,
            media_descriptor,
            sectors_per_track,
            num_heads,
            hidden_sectors,
            total_sectors,
            mft_lcn,
            mft_mirror_lcn,
            raw_mft_record_size,
            raw_index_buffer_size,
            serial_number,
        };
        bpb.validate()?;
        debug!(
            "NTFS boot sector: {} bytes/sector, {} sectors/cluster, {} sectors, MFT at LCN {}",
            bytes_per_sector, sectors_per_cluster, total_sectors, mft_lcn
        );
        Ok(bpb)
    }

    fn validate(&self) -> Result<(), DiscError> {
        if !self.bytes_per_sector.is_power_of_two() || !(256..=4096).contains(&self.bytes_per_sector) {
            return Err(DiscError::UnsupportedFeature(format!(
                "Unsupported sector size {}",
                self.bytes_per_sector
            )));
        }
        if self.sectors_per_cluster == 0 || !self.sectors_per_cluster.is_power_of_two() {
            return Err(DiscError::UnsupportedFeature(format!(
                "Unsupported sectors per cluster {}",
                self.sectors_per_cluster
            )));
        }
        let record_size = self.mft_record_size()?;
        if record_size < self.bytes_per_sector as u32 || record_size % self.bytes_per_sector as u32 != 0 {
            return Err(DiscError::UnsupportedFeature(format!(
                "MFT record size {} is not a multiple of the sector size",
                record_size
            )));
        }
        let index_size = self.index_buffer_size()?;
        if index_size < self.bytes_per_sector as u32 || index_size % self.bytes_per_sector as u32 != 0 {
            return Err(DiscError::UnsupportedFeature(format!(
                "Index buffer size {} is not a multiple of the sector size",
                index_size
            )));
        }
        if self.mft_lcn >= self.total_clusters() {
            return Err(DiscError::Corrupt(format!(
                "MFT cluster {} beyond volume end",
                self.mft_lcn
            )));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> [u8; BOOT_SECTOR_SIZE] {
        let mut sector = [0u8; BOOT_SECTOR_SIZE];
        let mut writer = ByteWriter::new(&mut sector);
        writer.bytes(&[0xEB, 0x52, 0x90]);
        writer.bytes(NTFS_OEM_ID);
        writer.u16(self.bytes_per_sector);
        writer.u8(self.sectors_per_cluster);
        writer.seek(0x15);
        writer.u8(self.media_descriptor);
        writer.seek(0x18);
        writer.u16(self.sectors_per_track);
        writer.u16(self.num_heads);
        writer.u32(self.hidden_sectors);
        writer.seek(0x24);
        // Physical drive number and extended boot signature
        writer.u32(0x0080_0080);
        writer.u64(self.total_sectors);
        writer.u64(self.mft_lcn);
        writer.u64(self.mft_mirror_lcn);
        writer.u8(self.raw_mft_record_size as u8);
        writer.seek(0x44);
        writer.u8(self.raw_index_buffer_size as u8);
        writer.seek(0x48);
        writer.u64(self.serial_number);
        writer.seek(0x1FE);
        writer.u16(BOOT_SIGNATURE);
        sector
    }

    pub fn cluster_size(&self) -> u32 {
        self.bytes_per_sector as u32 * self.sectors_per_cluster as u32
    }

    pub fn total_clusters(&self) -> u64 {
        self.total_sectors / self.sectors_per_cluster as u64
    }

    pub fn mft_record_size(&self) -> Result<u32, DiscError> {
        decode_raw_size(self.raw_mft_record_size, self.cluster_size())
    }

    pub fn index_buffer_size(&self) -> Result<u32, DiscError> {
        decode_raw_size(self.raw_index_buffer_size, self.cluster_size())
    }

    pub fn mft_offset(&self) -> u64 {
        self.mft_lcn * self.cluster_size() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BiosParameterBlock {
        BiosParameterBlock::new(512, 8, 1_000_000, 4, 1000, 1024, 4096, 0x1234_5678)
    }

    #[test]
    fn test_boot_sector_round_trip() {
        let bpb = sample();
        let bytes = bpb.to_bytes();
        assert_eq!(&bytes[3..11], b"NTFS    ");
        assert_eq!(bytes[0x40], 0xF6); // -10 => 1024 bytes
        assert_eq!(bytes[0x44], 1); // one cluster per index buffer
        assert_eq!(&bytes[0x1FE..], &[0x55, 0xAA]);

        let parsed = BiosParameterBlock::parse(&bytes).unwrap();
        assert_eq!(parsed, bpb);
        assert_eq!(parsed.cluster_size(), 4096);
        assert_eq!(parsed.mft_record_size().unwrap(), 1024);
        assert_eq!(parsed.index_buffer_size().unwrap(), 4096);
        assert_eq!(parsed.total_clusters(), 125_000);
        assert_eq!(parsed.mft_offset(), 4 * 4096);
    }

    #[test]
    fn test_rejects_foreign_sectors() {
        let mut bytes = sample().to_bytes();
        bytes[3..11].copy_from_slice(b"MSDOS5.0");
        assert!(BiosParameterBlock::parse(&bytes).unwrap_err().is_corruption());

        let mut bytes = sample().to_bytes();
        bytes[0x1FF] = 0;
        assert!(BiosParameterBlock::parse(&bytes).unwrap_err().is_corruption());
    }

    #[test]
    fn test_rejects_unsupported_geometry() {
        let mut bytes = sample().to_bytes();
        bytes[0x0D] = 3;
        assert!(matches!(
            BiosParameterBlock::parse(&bytes),
            Err(DiscError::UnsupportedFeature(_))
        ));
    }

    #[test]
    fn test_raw_size_encoding() {
        assert_eq!(encode_raw_size(1024, 4096), -10);
        assert_eq!(encode_raw_size(4096, 4096), 1);
        assert_eq!(encode_raw_size(8192, 4096), 2);
        assert_eq!(decode_raw_size(-12, 512).unwrap(), 4096);
    }
}
