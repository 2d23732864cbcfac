// NTFS formatter
// Lays out a fresh volume: boot sector, MFT and mirror, then metadata records 0-11

use super::attributes::{
    AttributeRecord, NonResident, ATTR_TYPE_BITMAP, ATTR_TYPE_DATA, ATTR_TYPE_FILE_NAME, ATTR_TYPE_VOLUME_INFORMATION,
    ATTR_TYPE_VOLUME_NAME,
};
use super::boot_sector::BiosParameterBlock;
use super::cluster_bitmap::{ClusterBitmap, ClusterRun};
use super::codec::{ceil_div, utf16_encode, ByteCodec};
use super::file::NtfsFile;
use super::file_record::FileRecordReference;
use super::index::{CollationRule, Index, UpperCase};
use super::mft::{
    Mft, MFT_RECORD_ATTRDEF, MFT_RECORD_BADCLUS, MFT_RECORD_BITMAP, MFT_RECORD_BOOT, MFT_RECORD_EXTEND,
    MFT_RECORD_LOGFILE, MFT_RECORD_MFT, MFT_RECORD_MFT_MIRROR, MFT_RECORD_ROOT, MFT_RECORD_SECURE, MFT_RECORD_UPCASE,
    MFT_RECORD_VOLUME, MIRROR_RECORDS,
};
use super::options::{NtfsFormatParams, NtfsOptions};
use super::security::SecurityDescriptors;
use super::structures::{
    FileNameRecord, StandardInformation, VolumeInformation, FILE_ATTRIBUTE_DIRECTORY, FILE_ATTRIBUTE_HIDDEN,
    FILE_ATTRIBUTE_SYSTEM,
};
use super::transaction::NtfsTransaction;
use super::volume::NtfsContext;
use discfs_core::{BlockDevice, DiscError};
use log::{debug, info};
use std::sync::Arc;

/// Bytes reserved for the boot code at the start of the volume ($Boot)
const BOOT_FILE_SIZE: u64 = 8192;
const MFT_START_CLUSTER: u64 = 4;
/// Free clusters a new volume must have left over for user data
const MIN_FREE_CLUSTERS: u64 = 64;

pub const DIRECTORY_INDEX: &str = "$I30";

fn derive_serial(filetime: u64) -> u64 {
    filetime ^ (filetime << 13) ^ (filetime >> 7)
}

/// A non-resident attribute over fixed clusters.
fn fixed_extent(attr_type: u32, runs: &[ClusterRun], data_size: u64, cluster_size: u64) -> AttributeRecord {
    let mut info = NonResident::empty();
    info.runs.append_clusters(runs);
    info.sync_extent(cluster_size);
    info.data_size = data_size;
    info.initialized_size = data_size;
    AttributeRecord::new_non_resident(attr_type, "", info)
}

/// Where the fixed structures of a volume go, in clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Layout {
    device_sectors: u64,
    total_sectors: u64,
    total_clusters: u64,
    boot: ClusterRun,
    mft: ClusterRun,
    mirror: ClusterRun,
    bitmap_clusters: u64,
    upcase_clusters: u64,
}

impl Layout {
    fn plan(params: &NtfsFormatParams, device_length: u64) -> Result<Self, DiscError> {
        let sector = params.bytes_per_sector as u64;
        let cluster_size = params.cluster_size() as u64;
        let device_sectors = device_length / sector;
        // The last sector holds the backup boot sector, outside the volume proper
        let total_sectors = device_sectors.saturating_sub(1);
        let total_clusters = total_sectors / params.sectors_per_cluster as u64;

        let boot = ClusterRun::new(0, ceil_div(BOOT_FILE_SIZE, cluster_size));
        let mft_lcn = boot.end().max(MFT_START_CLUSTER);
        let mft = ClusterRun::new(
            mft_lcn,
            ceil_div(params.mft_records * params.mft_record_size as u64, cluster_size),
        );
        let mirror = ClusterRun::new(
            mft.end(),
            ceil_div(MIRROR_RECORDS * params.mft_record_size as u64, cluster_size),
        );
        let bitmap_bytes = ClusterBitmap::new(total_clusters, false).persisted_size() as u64;
        let layout = Self {
            device_sectors,
            total_sectors,
            total_clusters,
            boot,
            mft,
            mirror,
            bitmap_clusters: ceil_div(bitmap_bytes, cluster_size),
            upcase_clusters: ceil_div(UpperCase::SIZE as u64, cluster_size),
        };

        let needed = layout.mirror.end() + layout.bitmap_clusters + layout.upcase_clusters + MIN_FREE_CLUSTERS;
        if total_clusters < needed {
            return Err(DiscError::CapacityExceeded(format!(
                "Device of {} bytes holds {} clusters, format needs at least {}",
                device_length, total_clusters, needed
            )));
        }
        Ok(layout)
    }
}

/// Creates empty NTFS volumes.
pub struct NtfsFormatter {
    params: NtfsFormatParams,
}

impl NtfsFormatter {
    pub fn new(params: NtfsFormatParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &NtfsFormatParams {
        &self.params
    }

    /// Format `device` and return the mounted context of the new volume.
    pub fn format(
        &self,
        mut device: Box<dyn BlockDevice>,
        options: NtfsOptions,
        tx: &NtfsTransaction,
    ) -> Result<NtfsContext, DiscError> {
        self.params.validate()?;
        options.validate()?;
        let params = &self.params;
        let layout = Layout::plan(params, device.length())?;
        let cluster_size = params.cluster_size() as u64;
        let sector = params.bytes_per_sector as u64;
        info!(
            "Formatting NTFS: {} clusters of {} bytes, MFT of {} records at cluster {}",
            layout.total_clusters, cluster_size, params.mft_records, layout.mft.start
        );

        let serial = params.serial_number.unwrap_or_else(|| derive_serial(tx.filetime()));
        let bpb = BiosParameterBlock::new(
            params.bytes_per_sector,
            params.sectors_per_cluster,
            layout.total_sectors,
            layout.mft.start,
            layout.mirror.start,
            params.mft_record_size,
            params.index_buffer_size,
            serial,
        );
        let boot_sector = bpb.to_bytes();
        device.write_at(0, &boot_sector)?;
        device.write_at((layout.device_sectors - 1) * sector, &boot_sector)?;
        debug!("Boot sector written, backup at sector {}", layout.device_sectors - 1);

        let mft = Mft::new(
            params.mft_record_size as usize,
            params.bytes_per_sector as usize,
            layout.mft.start * cluster_size,
            layout.mirror.start * cluster_size,
            params.mft_records,
        );
        let mut ctx = NtfsContext {
            device,
            bpb,
            mft,
            clusters: ClusterBitmap::new(layout.total_clusters, options.allocator_wraps),
            upcase: Arc::new(UpperCase::generate()),
            options,
            transform: None,
        };
        for run in [layout.boot, layout.mft, layout.mirror] {
            ctx.clusters.mark_allocated(run)?;
        }
        // Stale FILE records from an earlier format would leak their sequence numbers
        ctx.zero_clusters(&[layout.mft, layout.mirror])?;

        let bitmap_runs = ctx.clusters.allocate_clusters_from(layout.bitmap_clusters, layout.mirror.end())?;
        let upcase_runs = ctx.clusters.allocate_clusters_from(layout.upcase_clusters, layout.mirror.end())?;

        let root = self.system_file(&mut ctx, tx, MFT_RECORD_ROOT, ".", None, true)?;
        let root_ref = root.reference();
        let mut links = vec![(file_name_of(&root)?, root_ref)];
        let mut root_index = Index::create(
            &mut ctx,
            tx,
            root,
            DIRECTORY_INDEX,
            ATTR_TYPE_FILE_NAME,
            CollationRule::FileName,
        )?;

        let mft_bytes = params.mft_records * params.mft_record_size as u64;
        let mirror_bytes = MIRROR_RECORDS * params.mft_record_size as u64;
        let bitmap_bytes = ctx.clusters.persisted_size() as u64;
        let label = params.volume_label.clone();

        for (index, name) in [
            (MFT_RECORD_MFT, "$MFT"),
            (MFT_RECORD_MFT_MIRROR, "$MFTMirr"),
            (MFT_RECORD_LOGFILE, "$LogFile"),
            (MFT_RECORD_VOLUME, "$Volume"),
            (MFT_RECORD_ATTRDEF, "$AttrDef"),
            (MFT_RECORD_BITMAP, "$Bitmap"),
            (MFT_RECORD_BOOT, "$Boot"),
            (MFT_RECORD_BADCLUS, "$BadClus"),
            (MFT_RECORD_SECURE, "$Secure"),
            (MFT_RECORD_UPCASE, "$UpCase"),
            (MFT_RECORD_EXTEND, "$Extend"),
        ] {
            let directory = index == MFT_RECORD_EXTEND;
            let mut file = self.system_file(&mut ctx, tx, index, name, Some(root_ref), directory)?;
            let content = match index {
                MFT_RECORD_MFT => vec![
                    fixed_extent(ATTR_TYPE_DATA, &[layout.mft], mft_bytes, cluster_size),
                    AttributeRecord::new_resident(ATTR_TYPE_BITMAP, "", ctx.mft.bitmap_bytes()),
                ],
                MFT_RECORD_MFT_MIRROR => vec![fixed_extent(ATTR_TYPE_DATA, &[layout.mirror], mirror_bytes, cluster_size)],
                MFT_RECORD_VOLUME => vec![
                    AttributeRecord::new_resident(ATTR_TYPE_VOLUME_NAME, "", utf16_encode(&label)),
                    AttributeRecord::new_resident(ATTR_TYPE_VOLUME_INFORMATION, "", VolumeInformation::new().to_bytes()),
                    AttributeRecord::new_resident(ATTR_TYPE_DATA, "", Vec::new()),
                ],
                MFT_RECORD_BITMAP => vec![fixed_extent(ATTR_TYPE_DATA, &bitmap_runs, bitmap_bytes, cluster_size)],
                MFT_RECORD_BOOT => vec![fixed_extent(
                    ATTR_TYPE_DATA,
                    &[layout.boot],
                    layout.boot.length * cluster_size,
                    cluster_size,
                )],
                MFT_RECORD_UPCASE => vec![fixed_extent(ATTR_TYPE_DATA, &upcase_runs, UpperCase::SIZE as u64, cluster_size)],
                MFT_RECORD_SECURE | MFT_RECORD_EXTEND => Vec::new(),
                _ => vec![AttributeRecord::new_resident(ATTR_TYPE_DATA, "", Vec::new())],
            };
            for attr in content {
                file.add_attribute(&mut ctx, attr)?;
            }
            file.save(&mut ctx)?;
            links.push((file_name_of(&file)?, file.reference()));

            match index {
                MFT_RECORD_SECURE => {
                    SecurityDescriptors::initialize(&mut ctx, tx, file)?;
                }
                MFT_RECORD_EXTEND => {
                    Index::create(&mut ctx, tx, file, DIRECTORY_INDEX, ATTR_TYPE_FILE_NAME, CollationRule::FileName)?;
                }
                _ => {}
            }
            debug!("Created metadata file {} ({})", name, index);
        }

        let upcase = ctx.upcase.to_bytes();
        ctx.write_metafile_data(MFT_RECORD_UPCASE, &upcase)?;

        for (name, reference) in &links {
            root_index.insert(&mut ctx, tx, &name.to_bytes(), &reference.raw().to_le_bytes())?;
        }
        drop(root_index);

        ctx.flush()?;
        info!(
            "NTFS format complete: serial {:016x}, {} of {} clusters free",
            serial,
            ctx.clusters.free_count(),
            ctx.clusters.total_clusters()
        );
        Ok(ctx)
    }

    /// Claim a reserved record and give it system attributes and a name.
    /// `parent` of `None` makes the file its own parent, as the root is.
    fn system_file(
        &self,
        ctx: &mut NtfsContext,
        tx: &NtfsTransaction,
        index: u64,
        name: &str,
        parent: Option<FileRecordReference>,
        directory: bool,
    ) -> Result<NtfsFile, DiscError> {
        let mut file = NtfsFile::create_at(ctx, tx, index, directory)?;
        let mut flags = FILE_ATTRIBUTE_HIDDEN | FILE_ATTRIBUTE_SYSTEM;
        file.set_standard_information(&StandardInformation::new(tx.filetime(), flags))?;
        if directory {
            flags |= FILE_ATTRIBUTE_DIRECTORY;
        }
        let parent = parent.unwrap_or_else(|| file.reference());
        file.add_file_name(ctx, &FileNameRecord::new(parent, name, tx.filetime(), flags))?;
        Ok(file)
    }
}

fn file_name_of(file: &NtfsFile) -> Result<FileNameRecord, DiscError> {
    file.file_name()?
        .ok_or_else(|| DiscError::Corrupt(format!("{} has no $FILE_NAME", file.reference())))
}
