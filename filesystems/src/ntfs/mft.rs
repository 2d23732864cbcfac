// NTFS Master File Table
// Record addressing, the record allocation bitmap and sequence-number checks

use super::attributes::{ATTR_TYPE_BITMAP, ATTR_TYPE_DATA};
use super::boot_sector::BiosParameterBlock;
use super::codec::{round_up, ByteReader};
use super::file_record::{FileRecord, FileRecordReference, FILE_RECORD_IN_USE, FILE_RECORD_MAGIC};
use super::bitmap::Bitmap;
use discfs_core::{BlockDevice, DiscError};
use log::{debug, info, trace};

pub const MFT_RECORD_MFT: u64 = 0;
pub const MFT_RECORD_MFT_MIRROR: u64 = 1;
pub const MFT_RECORD_LOGFILE: u64 = 2;
pub const MFT_RECORD_VOLUME: u64 = 3;
pub const MFT_RECORD_ATTRDEF: u64 = 4;
pub const MFT_RECORD_ROOT: u64 = 5;
pub const MFT_RECORD_BITMAP: u64 = 6;
pub const MFT_RECORD_BOOT: u64 = 7;
pub const MFT_RECORD_BADCLUS: u64 = 8;
pub const MFT_RECORD_SECURE: u64 = 9;
pub const MFT_RECORD_UPCASE: u64 = 10;
pub const MFT_RECORD_EXTEND: u64 = 11;

/// Records below this index are reserved for metadata files.
pub const FIRST_USER_RECORD: u64 = 24;

/// Records duplicated in $MFTMirr.
pub const MIRROR_RECORDS: u64 = 4;

pub struct Mft {
    record_size: usize,
    bytes_per_sector: usize,
    offset: u64,
    mirror_offset: u64,
    capacity: u64,
    bitmap: Bitmap,
    strict_fixup: bool,
    dirty: bool,
}

impl Mft {
    /// Empty table for a volume being formatted.
    pub fn new(
        record_size: usize,
        bytes_per_sector: usize,
        offset: u64,
        mirror_offset: u64,
        capacity: u64,
    ) -> Self {
        Self {
            record_size,
            bytes_per_sector,
            offset,
            mirror_offset,
            capacity,
            bitmap: Bitmap::new(capacity),
            strict_fixup: false,
            dirty: true,
        }
    }

    /// Locate the MFT from the boot sector and read its allocation bitmap.
    pub fn load(
        device: &mut dyn BlockDevice,
        bpb: &BiosParameterBlock,
        strict_fixup: bool,
    ) -> Result<Self, DiscError> {
        let record_size = bpb.mft_record_size()? as usize;
        let bytes_per_sector = bpb.bytes_per_sector as usize;
        let offset = bpb.mft_offset();
        let mirror_offset = bpb.mft_mirror_lcn * bpb.cluster_size() as u64;

        let raw = device.read_vec(offset, record_size)?;
        let record = FileRecord::from_bytes(&raw, MFT_RECORD_MFT, bytes_per_sector)?;
        if strict_fixup {
            record.fixup.clone().into_strict()?;
        }

        let data = record
            .find(ATTR_TYPE_DATA, "")
            .and_then(|attr| attr.non_resident())
            .ok_or_else(|| DiscError::Corrupt("$MFT has no non-resident $DATA attribute".to_string()))?;
        let clusters = data.runs.clusters();
        if clusters.len() != 1 || data.runs.has_holes() || clusters[0].start != bpb.mft_lcn {
            return Err(DiscError::UnsupportedFeature(format!(
                "Fragmented MFT ({} extents)",
                clusters.len()
            )));
        }
        let capacity = data.data_size / record_size as u64;

        let bitmap_value = record
            .find(ATTR_TYPE_BITMAP, "")
            .ok_or_else(|| DiscError::Corrupt("$MFT has no $BITMAP attribute".to_string()))?
            .value()
            .ok_or_else(|| DiscError::UnsupportedFeature("Non-resident MFT bitmap".to_string()))?;
        let bitmap = Bitmap::from_bytes(bitmap_value, capacity, capacity)?;

        info!(
            "MFT at {:#x}: {} records of {} bytes, {} in use",
            offset,
            capacity,
            record_size,
            bitmap.count_present()
        );

        Ok(Self {
            record_size,
            bytes_per_sector,
            offset,
            mirror_offset,
            capacity,
            bitmap,
            strict_fixup,
            dirty: false,
        })
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    pub fn bytes_per_sector(&self) -> usize {
        self.bytes_per_sector
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn is_allocated(&self, index: u64) -> bool {
        self.bitmap.is_present(index)
    }

    pub fn allocated_count(&self) -> u64 {
        self.bitmap.count_present()
    }

    /// Raw bitmap bytes, padded to 8 bytes as stored in record 0.
    pub fn bitmap_bytes(&self) -> Vec<u8> {
        let mut bytes = self.bitmap.as_bytes().to_vec();
        bytes.resize(round_up(bytes.len(), 8), 0);
        bytes
    }

    fn record_offset(&self, index: u64) -> Result<u64, DiscError> {
        if index >= self.capacity {
            return Err(DiscError::InvalidInput(format!(
                "MFT record {} beyond table of {} records",
                index, self.capacity
            )));
        }
        Ok(self.offset + index * self.record_size as u64)
    }

    pub fn read_record(&self, device: &mut dyn BlockDevice, index: u64) -> Result<FileRecord, DiscError> {
        let raw = device.read_vec(self.record_offset(index)?, self.record_size)?;
        let record = FileRecord::from_bytes(&raw, index, self.bytes_per_sector)?;
        if self.strict_fixup {
            record.fixup.clone().into_strict()?;
        }
        trace!("Read MFT record {}", index);
        Ok(record)
    }

    /// Read the record a reference points at, rejecting stale references.
    pub fn read_reference(
        &self,
        device: &mut dyn BlockDevice,
        reference: FileRecordReference,
    ) -> Result<FileRecord, DiscError> {
        let record = self.read_record(device, reference.index())?;
        if !record.is_in_use() {
            return Err(DiscError::StaleReference(format!("{} points at a free record", reference)));
        }
        if record.sequence != reference.sequence() {
            return Err(DiscError::StaleReference(format!(
                "{} but record has sequence {}",
                reference, record.sequence
            )));
        }
        Ok(record)
    }

    pub fn write_record(&self, device: &mut dyn BlockDevice, record: &mut FileRecord) -> Result<(), DiscError> {
        let bytes = record.to_bytes()?;
        record.update_sequence = ByteReader::at(&bytes, 0x30).u16()?;
        device.write_at(self.record_offset(record.index)?, &bytes)?;
        if record.index < MIRROR_RECORDS && self.mirror_offset != 0 {
            device.write_at(self.mirror_offset + record.index * self.record_size as u64, &bytes)?;
        }
        trace!("Wrote MFT record {} ({} bytes used)", record.index, record.used_size());
        Ok(())
    }

    /// Sequence number stored in a record slot, or 1 for a slot never written.
    fn stored_sequence(&self, device: &mut dyn BlockDevice, index: u64) -> Result<u16, DiscError> {
        let header = device.read_vec(self.record_offset(index)?, 0x12)?;
        if &header[..4] != FILE_RECORD_MAGIC {
            return Ok(1);
        }
        let sequence = ByteReader::at(&header, 0x10).u16()?;
        Ok(sequence.max(1))
    }

    /// Claim the first free record at or after `min_index`.
    pub fn allocate_record(&mut self, device: &mut dyn BlockDevice, min_index: u64) -> Result<FileRecord, DiscError> {
        let index = self
            .bitmap
            .find_first_absent(min_index)
            .ok_or_else(|| DiscError::CapacityExceeded(format!("MFT full ({} records)", self.capacity)))?;
        self.allocate_specific(device, index)
    }

    /// Claim a particular record slot, as format does for the metadata files.
    pub fn allocate_specific(&mut self, device: &mut dyn BlockDevice, index: u64) -> Result<FileRecord, DiscError> {
        if self.bitmap.is_present(index) {
            return Err(DiscError::InvalidInput(format!("MFT record {} already in use", index)));
        }
        let sequence = self.stored_sequence(device, index)?;
        self.bitmap.mark_present(index)?;
        self.dirty = true;
        debug!("Allocated MFT record {} (seq {})", index, sequence);
        Ok(FileRecord::new(index, sequence, self.record_size, self.bytes_per_sector))
    }

    /// Mark a record free and bump its sequence so old references go stale.
    ///
    /// The record is taken from memory and need not have been written yet.
    pub fn release_record(&mut self, device: &mut dyn BlockDevice, record: &mut FileRecord) -> Result<(), DiscError> {
        if !self.bitmap.is_present(record.index) {
            return Err(DiscError::InvalidInput(format!("MFT record {} is not in use", record.index)));
        }
        record.flags &= !FILE_RECORD_IN_USE;
        record.sequence = match record.sequence.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        self.write_record(device, record)?;
        self.bitmap.mark_absent(record.index)?;
        self.dirty = true;
        debug!("Freed MFT record {}", record.index);
        Ok(())
    }

    /// Persist the allocation bitmap into record 0.
    pub fn flush(&mut self, device: &mut dyn BlockDevice) -> Result<(), DiscError> {
        if !self.dirty {
            return Ok(());
        }
        let mut record = self.read_record(device, MFT_RECORD_MFT)?;
        let value = record
            .find_mut(ATTR_TYPE_BITMAP, "")
            .and_then(|attr| attr.value_mut())
            .ok_or_else(|| DiscError::Corrupt("$MFT has no resident $BITMAP attribute".to_string()))?;
        *value = self.bitmap_bytes();
        self.write_record(device, &mut record)?;
        self.dirty = false;
        Ok(())
    }
}
