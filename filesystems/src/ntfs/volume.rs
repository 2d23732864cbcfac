// NTFS volume context
// Everything a mounted volume shares: the device, geometry, MFT, cluster bitmap and collation table

use super::attributes::ATTR_TYPE_DATA;
use super::boot_sector::{BiosParameterBlock, BOOT_SECTOR_SIZE};
use super::cluster_bitmap::{ClusterBitmap, ClusterRun};
use super::file_record::{FileRecord, FileRecordReference};
use super::index::UpperCase;
use super::mft::{Mft, FIRST_USER_RECORD, MFT_RECORD_BITMAP, MFT_RECORD_UPCASE};
use super::options::NtfsOptions;
use super::stream::ContentTransform;
use discfs_core::{BlockDevice, DiscError};
use log::{debug, info, warn};
use std::sync::Arc;

pub struct NtfsContext {
    pub device: Box<dyn BlockDevice>,
    pub bpb: BiosParameterBlock,
    pub mft: Mft,
    pub clusters: ClusterBitmap,
    pub upcase: Arc<UpperCase>,
    pub options: NtfsOptions,
    pub transform: Option<Arc<dyn ContentTransform>>,
}

impl NtfsContext {
    /// Read the boot sector, MFT, cluster bitmap and $UpCase of an existing volume.
    pub fn open(mut device: Box<dyn BlockDevice>, options: NtfsOptions) -> Result<Self, DiscError> {
        options.validate()?;
        let sector = device.read_vec(0, BOOT_SECTOR_SIZE)?;
        let bpb = BiosParameterBlock::parse(&sector)?;
        if bpb.total_sectors * bpb.bytes_per_sector as u64 > device.length() {
            return Err(DiscError::Corrupt(format!(
                "Boot sector claims {} sectors, device holds {} bytes",
                bpb.total_sectors,
                device.length()
            )));
        }
        let mft = Mft::load(device.as_mut(), &bpb, options.strict_fixup)?;
        let clusters = ClusterBitmap::new(bpb.total_clusters(), options.allocator_wraps);

        let mut ctx = Self {
            device,
            bpb,
            mft,
            clusters,
            upcase: Arc::new(UpperCase::generate()),
            options,
            transform: None,
        };

        let bitmap = ctx.read_metafile_data(MFT_RECORD_BITMAP)?;
        ctx.clusters = ClusterBitmap::from_bytes(&bitmap, ctx.bpb.total_clusters(), ctx.options.allocator_wraps)?;
        info!(
            "Cluster bitmap loaded: {} of {} clusters free",
            ctx.clusters.free_count(),
            ctx.clusters.total_clusters()
        );

        match ctx.read_metafile_data(MFT_RECORD_UPCASE).and_then(|bytes| UpperCase::from_bytes(&bytes)) {
            Ok(upcase) => ctx.upcase = Arc::new(upcase),
            Err(e) => warn!("Unreadable $UpCase ({}), using the built-in table", e),
        }

        Ok(ctx)
    }

    /// Plug in the codec for compressed or encrypted attributes.
    pub fn set_transform(&mut self, transform: Arc<dyn ContentTransform>) {
        self.transform = Some(transform);
    }

    pub fn cluster_size(&self) -> u64 {
        self.bpb.cluster_size() as u64
    }

    pub fn bytes_per_sector(&self) -> usize {
        self.bpb.bytes_per_sector as usize
    }

    pub fn index_buffer_size(&self) -> Result<usize, DiscError> {
        Ok(self.bpb.index_buffer_size()? as usize)
    }

    pub fn read_bytes(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, DiscError> {
        self.device.read_vec(offset, len)
    }

    pub fn write_bytes(&mut self, offset: u64, data: &[u8]) -> Result<(), DiscError> {
        self.device.write_at(offset, data)
    }

    pub fn read_clusters(&mut self, lcn: u64, count: u64) -> Result<Vec<u8>, DiscError> {
        let cluster_size = self.cluster_size();
        self.device.read_vec(lcn * cluster_size, (count * cluster_size) as usize)
    }

    /// Zero-fill whole clusters, as freshly allocated space must read back empty.
    pub fn zero_clusters(&mut self, runs: &[ClusterRun]) -> Result<(), DiscError> {
        let cluster_size = self.cluster_size();
        for run in runs {
            let zeros = vec![0u8; (run.length * cluster_size) as usize];
            self.device.write_at(run.start * cluster_size, &zeros)?;
        }
        Ok(())
    }

    pub fn read_record(&mut self, index: u64) -> Result<FileRecord, DiscError> {
        self.mft.read_record(self.device.as_mut(), index)
    }

    pub fn read_reference(&mut self, reference: FileRecordReference) -> Result<FileRecord, DiscError> {
        self.mft.read_reference(self.device.as_mut(), reference)
    }

    pub fn write_record(&mut self, record: &mut FileRecord) -> Result<(), DiscError> {
        self.mft.write_record(self.device.as_mut(), record)
    }

    pub fn allocate_record(&mut self) -> Result<FileRecord, DiscError> {
        self.mft.allocate_record(self.device.as_mut(), FIRST_USER_RECORD)
    }

    pub fn release_record(&mut self, record: &mut FileRecord) -> Result<(), DiscError> {
        self.mft.release_record(self.device.as_mut(), record)
    }

    pub fn allocate_clusters(&mut self, count: u64) -> Result<Vec<ClusterRun>, DiscError> {
        self.clusters.allocate_clusters(count)
    }

    pub fn free_clusters(&mut self, runs: &[ClusterRun]) -> Result<(), DiscError> {
        self.clusters.free_clusters(runs)
    }

    /// Unnamed $DATA of a metadata file whose size never changes after format.
    pub fn read_metafile_data(&mut self, index: u64) -> Result<Vec<u8>, DiscError> {
        let record = self.read_record(index)?;
        let attr = record
            .find(ATTR_TYPE_DATA, "")
            .ok_or_else(|| DiscError::Corrupt(format!("Metadata record {} has no $DATA", index)))?;
        if let Some(value) = attr.value() {
            return Ok(value.to_vec());
        }

        let Some(info) = attr.non_resident() else {
            return Ok(Vec::new());
        };
        let cluster_size = self.cluster_size();
        let mut data = Vec::with_capacity(info.data_size as usize);
        for run in info.runs.runs() {
            match run.lcn {
                Some(lcn) => data.extend(self.read_clusters(lcn, run.length)?),
                None => data.resize(data.len() + (run.length * cluster_size) as usize, 0),
            }
        }
        data.truncate(info.data_size as usize);
        Ok(data)
    }

    /// Overwrite the content of a fixed-size metadata file in place.
    pub fn write_metafile_data(&mut self, index: u64, data: &[u8]) -> Result<(), DiscError> {
        let record = self.read_record(index)?;
        let attr = record
            .find(ATTR_TYPE_DATA, "")
            .ok_or_else(|| DiscError::Corrupt(format!("Metadata record {} has no $DATA", index)))?;
        let info = attr
            .non_resident()
            .ok_or_else(|| DiscError::UnsupportedFeature(format!("Resident $DATA in metadata record {}", index)))?;
        if data.len() as u64 > info.data_size {
            return Err(DiscError::CapacityExceeded(format!(
                "{} bytes do not fit metadata record {} ({} bytes)",
                data.len(),
                index,
                info.data_size
            )));
        }

        let cluster_size = self.cluster_size();
        let mut pos = 0usize;
        for run in info.runs.runs() {
            if pos >= data.len() {
                break;
            }
            let span = ((run.length * cluster_size) as usize).min(data.len() - pos);
            if let Some(lcn) = run.lcn {
                self.device.write_at(lcn * cluster_size, &data[pos..pos + span])?;
            }
            pos += span;
        }
        Ok(())
    }

    /// Persist the cluster bitmap and MFT bitmap, then flush the device.
    pub fn flush(&mut self) -> Result<(), DiscError> {
        if self.clusters.is_dirty() {
            let mut bytes = self.clusters.as_bytes().to_vec();
            bytes.resize(self.clusters.persisted_size(), 0);
            self.write_metafile_data(MFT_RECORD_BITMAP, &bytes)?;
            self.clusters.clear_dirty();
            debug!("Cluster bitmap written ({} bytes)", bytes.len());
        }
        self.mft.flush(self.device.as_mut())?;
        self.device.flush()
    }
}
