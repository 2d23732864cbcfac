// NTFS attribute streams
// Byte-level access to one attribute's content, resident or backed by clusters

use super::attributes::{
    is_always_non_resident, is_always_resident, AttributeBody, AttributeRecord, NonResident, ATTR_FLAG_SPARSE,
    ATTR_TYPE_DATA,
};
use super::cluster_bitmap::ClusterRun;
use super::codec::{ceil_div, round_up, utf16_len, ByteCodec};
use super::data_runs::DataRun;
use super::file::NtfsFile;
use super::transaction::NtfsTransaction;
use super::volume::NtfsContext;
use discfs_core::DiscError;
use log::{debug, trace};

const RESIDENT_HEADER_SIZE: usize = 0x18;

/// Codec for compressed or encrypted attribute content.
///
/// `decode` receives the raw cluster payload and the logical length;
/// `encode` produces the payload to store. Flags are the attribute flags.
pub trait ContentTransform: Send + Sync {
    fn decode(&self, flags: u16, raw: &[u8], data_length: u64) -> Result<Vec<u8>, DiscError>;
    fn encode(&self, flags: u16, plain: &[u8]) -> Result<Vec<u8>, DiscError>;
}

fn needs_transform(attr: &AttributeRecord) -> bool {
    !attr.is_resident() && (attr.is_compressed() || attr.is_encrypted())
}

/// Bytes a resident attribute with this name and value length occupies.
pub(crate) fn resident_size(name: &str, length: usize) -> usize {
    round_up(round_up(RESIDENT_HEADER_SIZE + utf16_len(name) * 2, 8) + length, 8)
}

/// Write `data` over the clusters of `runs`, in order.
fn write_runs(ctx: &mut NtfsContext, runs: &[ClusterRun], data: &[u8]) -> Result<(), DiscError> {
    let cluster_size = ctx.cluster_size();
    let mut pos = 0usize;
    for run in runs {
        if pos >= data.len() {
            break;
        }
        let span = ((run.length * cluster_size) as usize).min(data.len() - pos);
        ctx.write_bytes(run.start * cluster_size, &data[pos..pos + span])?;
        pos += span;
    }
    Ok(())
}

/// Map a VCN through whichever fragment covers it.
fn lookup_vcn(fragments: &[&AttributeRecord], vcn: u64) -> Result<(Option<u64>, u64), DiscError> {
    for fragment in fragments {
        let Some(info) = fragment.non_resident() else {
            continue;
        };
        if vcn >= info.start_vcn && (vcn as i64) <= info.last_vcn {
            if let Some(mapped) = info.runs.lookup(vcn - info.start_vcn) {
                return Ok(mapped);
            }
        }
    }
    Err(DiscError::Corrupt(format!("VCN {} is not mapped by any fragment", vcn)))
}

/// One attribute of a file, addressed by type and name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtfsStream {
    attr_type: u32,
    name: String,
}

impl NtfsStream {
    pub fn new(attr_type: u32, name: &str) -> Self {
        Self {
            attr_type,
            name: name.to_string(),
        }
    }

    /// The unnamed $DATA stream.
    pub fn data() -> Self {
        Self::new(ATTR_TYPE_DATA, "")
    }

    pub fn attr_type(&self) -> u32 {
        self.attr_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exists(&self, file: &NtfsFile) -> Result<bool, DiscError> {
        Ok(file.attribute(self.attr_type, &self.name)?.is_some())
    }

    /// Add the attribute with empty content.
    pub fn create(&self, ctx: &mut NtfsContext, file: &mut NtfsFile, tx: &NtfsTransaction) -> Result<(), DiscError> {
        if is_always_non_resident(self.attr_type) {
            return self.create_non_resident(ctx, file, tx);
        }
        self.add(ctx, file, tx, AttributeRecord::new_resident(self.attr_type, &self.name, Vec::new()))
    }

    /// Add the attribute as an empty cluster-backed stream.
    pub fn create_non_resident(
        &self,
        ctx: &mut NtfsContext,
        file: &mut NtfsFile,
        tx: &NtfsTransaction,
    ) -> Result<(), DiscError> {
        self.add(
            ctx,
            file,
            tx,
            AttributeRecord::new_non_resident(self.attr_type, &self.name, NonResident::empty()),
        )
    }

    /// Add an empty non-resident stream whose unwritten ranges stay unallocated.
    pub fn create_sparse(&self, ctx: &mut NtfsContext, file: &mut NtfsFile, tx: &NtfsTransaction) -> Result<(), DiscError> {
        let mut info = NonResident::empty();
        info.compressed_size = Some(0);
        let attr = AttributeRecord::new_non_resident(self.attr_type, &self.name, info).with_flags(ATTR_FLAG_SPARSE);
        self.add(ctx, file, tx, attr)
    }

    fn add(
        &self,
        ctx: &mut NtfsContext,
        file: &mut NtfsFile,
        tx: &NtfsTransaction,
        attr: AttributeRecord,
    ) -> Result<(), DiscError> {
        if self.exists(file)? {
            return Err(DiscError::InvalidInput(format!(
                "Attribute {:#x} '{}' already exists in {}",
                self.attr_type,
                self.name,
                file.reference()
            )));
        }
        file.add_attribute(ctx, attr)?;
        file.touch(tx)?;
        file.save(ctx)
    }

    pub fn len(&self, file: &NtfsFile) -> Result<u64, DiscError> {
        Ok(file.require(self.attr_type, &self.name)?.data_length())
    }

    pub fn is_empty(&self, file: &NtfsFile) -> Result<bool, DiscError> {
        Ok(self.len(file)? == 0)
    }

    fn check_single_fragment(&self, file: &NtfsFile) -> Result<(), DiscError> {
        let count = file.fragments(self.attr_type, &self.name).len();
        if count > 1 {
            return Err(DiscError::UnsupportedFeature(format!(
                "Resizing attribute {:#x} '{}' split over {} fragments",
                self.attr_type, self.name, count
            )));
        }
        Ok(())
    }

    /// Read up to `buf.len()` bytes at `offset`; returns the count read.
    pub fn read(&self, ctx: &mut NtfsContext, file: &NtfsFile, offset: u64, buf: &mut [u8]) -> Result<usize, DiscError> {
        let attr = file.require(self.attr_type, &self.name)?;
        let length = attr.data_length();
        if offset >= length || buf.is_empty() {
            return Ok(0);
        }
        let end = length.min(offset + buf.len() as u64);
        let count = (end - offset) as usize;

        if let Some(value) = attr.value() {
            buf[..count].copy_from_slice(&value[offset as usize..end as usize]);
            return Ok(count);
        }
        if needs_transform(attr) {
            let content = self.get_content(ctx, file)?;
            buf[..count].copy_from_slice(&content[offset as usize..end as usize]);
            return Ok(count);
        }

        let initialized = attr.non_resident().map_or(0, |info| info.initialized_size);
        let fragments = file.fragments(self.attr_type, &self.name);
        let cluster_size = ctx.cluster_size();
        let mut pos = offset;
        while pos < end {
            let out = (pos - offset) as usize;
            if pos >= initialized {
                buf[out..count].fill(0);
                break;
            }
            let within = pos % cluster_size;
            let (lcn, remaining) = lookup_vcn(&fragments, pos / cluster_size)?;
            let span = (remaining * cluster_size - within).min(end - pos).min(initialized - pos) as usize;
            match lcn {
                Some(lcn) => {
                    let data = ctx.read_bytes(lcn * cluster_size + within, span)?;
                    buf[out..out + span].copy_from_slice(&data);
                }
                None => buf[out..out + span].fill(0),
            }
            pos += span as u64;
        }
        Ok(count)
    }

    /// Whole logical content, decoded through the transform when flagged.
    pub fn get_content(&self, ctx: &mut NtfsContext, file: &NtfsFile) -> Result<Vec<u8>, DiscError> {
        let attr = file.require(self.attr_type, &self.name)?;
        if let Some(value) = attr.value() {
            return Ok(value.to_vec());
        }
        if needs_transform(attr) {
            let transform = ctx.transform.clone().ok_or_else(|| {
                DiscError::UnsupportedFeature(format!(
                    "Attribute {:#x} '{}' is compressed or encrypted and no transform is configured",
                    self.attr_type, self.name
                ))
            })?;
            let flags = attr.flags;
            let length = attr.data_length();
            let raw = self.read_raw(ctx, file)?;
            return transform.decode(flags, &raw, length);
        }
        let mut content = vec![0u8; attr.data_length() as usize];
        self.read(ctx, file, 0, &mut content)?;
        Ok(content)
    }

    /// Stored cluster payload of all fragments, holes as zeros.
    fn read_raw(&self, ctx: &mut NtfsContext, file: &NtfsFile) -> Result<Vec<u8>, DiscError> {
        let cluster_size = ctx.cluster_size();
        let mut raw = Vec::new();
        let mut stored_length = None;
        for fragment in file.fragments(self.attr_type, &self.name) {
            let Some(info) = fragment.non_resident() else {
                continue;
            };
            if info.start_vcn == 0 {
                stored_length = info.compressed_size;
            }
            for run in info.runs.runs() {
                match run.lcn {
                    Some(lcn) => raw.extend(ctx.read_clusters(lcn, run.length)?),
                    None => raw.resize(raw.len() + (run.length * cluster_size) as usize, 0),
                }
            }
        }
        if let Some(length) = stored_length {
            raw.truncate(length as usize);
        }
        Ok(raw)
    }

    /// Write `data` at `offset`, growing the stream as needed.
    pub fn write(
        &self,
        ctx: &mut NtfsContext,
        file: &mut NtfsFile,
        tx: &NtfsTransaction,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DiscError> {
        if data.is_empty() {
            return Ok(());
        }
        self.write_inner(ctx, file, offset, data)?;
        file.touch(tx)?;
        file.save(ctx)
    }

    fn write_inner(&self, ctx: &mut NtfsContext, file: &mut NtfsFile, offset: u64, data: &[u8]) -> Result<(), DiscError> {
        let attr = file.require(self.attr_type, &self.name)?;
        let end = offset + data.len() as u64;

        if needs_transform(attr) {
            let mut content = self.get_content(ctx, file)?;
            if (content.len() as u64) < end {
                content.resize(end as usize, 0);
            }
            content[offset as usize..end as usize].copy_from_slice(data);
            return self.store_transformed(ctx, file, &content);
        }

        if end > attr.data_length() {
            self.set_length_inner(ctx, file, end)?;
        }
        self.check_single_fragment(file)?;

        let attr = file.require_mut(self.attr_type, &self.name)?;
        match &mut attr.body {
            AttributeBody::Resident { value, .. } => {
                value[offset as usize..end as usize].copy_from_slice(data);
                Ok(())
            }
            AttributeBody::NonResident(info) => Self::write_clusters(ctx, info, offset, data),
        }
    }

    fn write_clusters(ctx: &mut NtfsContext, info: &mut NonResident, offset: u64, data: &[u8]) -> Result<(), DiscError> {
        let cluster_size = ctx.cluster_size();
        let end = offset + data.len() as u64;

        if offset > info.initialized_size {
            Self::zero_allocated(ctx, info, info.initialized_size, offset)?;
        }

        // Back any holes under the write with zeroed clusters
        let last_vcn = (end - 1) / cluster_size;
        let mut vcn = offset / cluster_size;
        while vcn <= last_vcn {
            let (lcn, remaining) = info
                .runs
                .lookup(vcn)
                .ok_or_else(|| DiscError::Corrupt(format!("VCN {} beyond run list", vcn)))?;
            let count = remaining.min(last_vcn - vcn + 1);
            if lcn.is_none() {
                let runs = ctx.allocate_clusters(count)?;
                ctx.zero_clusters(&runs)?;
                if let Err(e) = info.runs.fill_hole(vcn, &runs) {
                    ctx.free_clusters(&runs)?;
                    return Err(e);
                }
                trace!("Filled sparse hole at VCN {} with {} clusters", vcn, count);
            }
            vcn += count;
        }
        info.sync_extent(cluster_size);
        if info.compressed_size.is_some() {
            info.compressed_size = Some(info.runs.allocated_clusters() * cluster_size);
        }

        let mut pos = offset;
        while pos < end {
            let within = pos % cluster_size;
            let (lcn, remaining) = info
                .runs
                .lookup(pos / cluster_size)
                .ok_or_else(|| DiscError::Corrupt(format!("Offset {} beyond run list", pos)))?;
            let lcn = lcn.ok_or_else(|| DiscError::Corrupt(format!("Offset {} still sparse", pos)))?;
            let span = (remaining * cluster_size - within).min(end - pos) as usize;
            let start = (pos - offset) as usize;
            ctx.write_bytes(lcn * cluster_size + within, &data[start..start + span])?;
            pos += span as u64;
        }

        info.initialized_size = info.initialized_size.max(end);
        Ok(())
    }

    /// Zero the allocated parts of `[from, to)`; holes already read as zeros.
    fn zero_allocated(ctx: &mut NtfsContext, info: &NonResident, from: u64, to: u64) -> Result<(), DiscError> {
        let cluster_size = ctx.cluster_size();
        let mut pos = from;
        while pos < to {
            let within = pos % cluster_size;
            let (lcn, remaining) = info
                .runs
                .lookup(pos / cluster_size)
                .ok_or_else(|| DiscError::Corrupt(format!("Offset {} beyond run list", pos)))?;
            let span = (remaining * cluster_size - within).min(to - pos);
            if let Some(lcn) = lcn {
                ctx.write_bytes(lcn * cluster_size + within, &vec![0u8; span as usize])?;
            }
            pos += span;
        }
        Ok(())
    }

    /// Change the logical length. New space reads as zeros.
    pub fn set_length(
        &self,
        ctx: &mut NtfsContext,
        file: &mut NtfsFile,
        tx: &NtfsTransaction,
        length: u64,
    ) -> Result<(), DiscError> {
        self.set_length_inner(ctx, file, length)?;
        file.touch(tx)?;
        file.save(ctx)
    }

    fn set_length_inner(&self, ctx: &mut NtfsContext, file: &mut NtfsFile, length: u64) -> Result<(), DiscError> {
        let attr = file.require(self.attr_type, &self.name)?;
        let current = attr.data_length();
        let sparse = attr.is_sparse();
        if length == current {
            return Ok(());
        }

        if needs_transform(attr) {
            let mut content = self.get_content(ctx, file)?;
            content.resize(length as usize, 0);
            return self.store_transformed(ctx, file, &content);
        }

        // Room the attribute could use in its record, counting its own space
        let budget = file.free_space_for(self.attr_type, &self.name)? + attr.size();
        let fits_resident = resident_size(&self.name, length as usize) <= budget;

        if attr.is_resident() {
            if length < current || fits_resident || is_always_resident(self.attr_type) {
                let value = file
                    .require_mut(self.attr_type, &self.name)?
                    .value_mut()
                    .ok_or_else(|| DiscError::Corrupt("Resident attribute without value".to_string()))?;
                value.resize(length as usize, 0);
                return Ok(());
            }
            return self.make_non_resident(ctx, file, length);
        }

        self.check_single_fragment(file)?;
        if length < current
            && length <= ctx.options.resident_threshold as u64
            && fits_resident
            && !is_always_non_resident(self.attr_type)
        {
            return self.make_resident(ctx, file, length);
        }

        let info = file
            .require_mut(self.attr_type, &self.name)?
            .non_resident_mut()
            .ok_or_else(|| DiscError::Corrupt("Non-resident attribute without run list".to_string()))?;
        Self::resize_clusters(ctx, info, length, sparse)
    }

    fn resize_clusters(ctx: &mut NtfsContext, info: &mut NonResident, length: u64, sparse: bool) -> Result<(), DiscError> {
        let cluster_size = ctx.cluster_size();
        let needed = ceil_div(length, cluster_size);
        let have = info.runs.total_clusters();

        if needed > have {
            if sparse {
                info.runs.append(DataRun::sparse(needed - have));
            } else {
                let runs = ctx.allocate_clusters(needed - have)?;
                info.runs.append_clusters(&runs);
            }
        } else if needed < have {
            let released = info.runs.truncate(needed);
            ctx.free_clusters(&released)?;
        }

        info.sync_extent(cluster_size);
        if sparse {
            info.compressed_size = Some(info.runs.allocated_clusters() * cluster_size);
        }
        info.data_size = length;
        info.initialized_size = info.initialized_size.min(length);
        trace!("Stream resized to {} bytes over {} clusters", length, needed);
        Ok(())
    }

    /// Move resident content out to clusters, keeping the attribute id.
    fn make_non_resident(&self, ctx: &mut NtfsContext, file: &mut NtfsFile, length: u64) -> Result<(), DiscError> {
        let cluster_size = ctx.cluster_size();
        let attr = file.require_mut(self.attr_type, &self.name)?;
        let mut content = attr.value().map(<[u8]>::to_vec).unwrap_or_default();
        let clusters = ceil_div(length, cluster_size);

        let runs = ctx.allocate_clusters(clusters)?;
        content.resize((clusters * cluster_size) as usize, 0);
        if let Err(e) = write_runs(ctx, &runs, &content) {
            ctx.free_clusters(&runs)?;
            return Err(e);
        }

        let mut info = NonResident::empty();
        info.runs.append_clusters(&runs);
        info.sync_extent(cluster_size);
        info.data_size = length;
        info.initialized_size = length;
        attr.body = AttributeBody::NonResident(info);
        debug!(
            "Attribute {:#x} '{}' id {} is now non-resident ({} clusters)",
            self.attr_type, self.name, attr.id, clusters
        );
        Ok(())
    }

    /// Pull short content back into the record, keeping the attribute id.
    fn make_resident(&self, ctx: &mut NtfsContext, file: &mut NtfsFile, length: u64) -> Result<(), DiscError> {
        let mut content = vec![0u8; length as usize];
        self.read(ctx, file, 0, &mut content)?;

        let attr = file.require_mut(self.attr_type, &self.name)?;
        let runs = attr.get_clusters();
        attr.body = AttributeBody::Resident {
            value: content,
            indexed: false,
        };
        debug!(
            "Attribute {:#x} '{}' id {} is resident again ({} bytes)",
            self.attr_type, self.name, attr.id, length
        );
        ctx.free_clusters(&runs)
    }

    /// Encode through the transform and store the payload.
    fn store_transformed(&self, ctx: &mut NtfsContext, file: &mut NtfsFile, plain: &[u8]) -> Result<(), DiscError> {
        self.check_single_fragment(file)?;
        let transform = ctx.transform.clone().ok_or_else(|| {
            DiscError::UnsupportedFeature(format!(
                "Attribute {:#x} '{}' is compressed or encrypted and no transform is configured",
                self.attr_type, self.name
            ))
        })?;
        let attr = file.require_mut(self.attr_type, &self.name)?;
        let compressed = attr.is_compressed();
        let encoded = transform.encode(attr.flags, plain)?;
        let info = attr
            .non_resident_mut()
            .ok_or_else(|| DiscError::Corrupt("Transformed attribute is resident".to_string()))?;

        Self::resize_clusters(ctx, info, encoded.len() as u64, false)?;
        write_runs(ctx, &info.runs.clusters(), &encoded)?;
        info.data_size = plain.len() as u64;
        info.initialized_size = plain.len() as u64;
        if compressed {
            info.compressed_size = Some(encoded.len() as u64);
        }
        trace!("Stored {} bytes as {} transformed bytes", plain.len(), encoded.len());
        Ok(())
    }

    /// Replace the whole content.
    pub fn set_content(
        &self,
        ctx: &mut NtfsContext,
        file: &mut NtfsFile,
        tx: &NtfsTransaction,
        data: &[u8],
    ) -> Result<(), DiscError> {
        if needs_transform(file.require(self.attr_type, &self.name)?) {
            self.store_transformed(ctx, file, data)?;
        } else {
            self.set_length_inner(ctx, file, data.len() as u64)?;
            if !data.is_empty() {
                self.write_inner(ctx, file, 0, data)?;
            }
        }
        file.touch(tx)?;
        file.save(ctx)
    }

    /// Physical clusters backing the stream, in VCN order.
    pub fn get_clusters(&self, file: &NtfsFile) -> Vec<ClusterRun> {
        file.fragments(self.attr_type, &self.name)
            .into_iter()
            .flat_map(AttributeRecord::get_clusters)
            .collect()
    }

    /// (byte offset, byte length) of every extent on the volume.
    /// Resident content has no extents of its own.
    pub fn absolute_extents(&self, ctx: &NtfsContext, file: &NtfsFile) -> Vec<(u64, u64)> {
        let cluster_size = ctx.cluster_size();
        self.get_clusters(file)
            .into_iter()
            .map(|run| (run.start * cluster_size, run.length * cluster_size))
            .collect()
    }

    /// Remove the attribute and release its clusters.
    pub fn delete(&self, ctx: &mut NtfsContext, file: &mut NtfsFile, tx: &NtfsTransaction) -> Result<(), DiscError> {
        let removed = file.remove_attribute(ctx, self.attr_type, &self.name)?;
        let runs: Vec<ClusterRun> = removed.iter().flat_map(AttributeRecord::get_clusters).collect();
        ctx.free_clusters(&runs)?;
        file.touch(tx)?;
        file.save(ctx)
    }
}
