// NTFS data runs
// Run-list codec for non-resident attributes and the VCN-ordered run list built on it

use super::cluster_bitmap::ClusterRun;
use discfs_core::DiscError;

/// One run of a non-resident attribute. `lcn` is `None` for a sparse hole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRun {
    pub lcn: Option<u64>,
    pub length: u64,
}

impl DataRun {
    pub fn allocated(lcn: u64, length: u64) -> Self {
        Self { lcn: Some(lcn), length }
    }

    pub fn sparse(length: u64) -> Self {
        Self { lcn: None, length }
    }

    pub fn is_sparse(&self) -> bool {
        self.lcn.is_none()
    }
}

/// Decode a run list, returning the runs and the bytes consumed including the terminator.
pub fn decode_data_runs(data: &[u8]) -> Result<(Vec<DataRun>, usize), DiscError> {
    let mut runs = Vec::new();
    let mut pos = 0;
    let mut prev_lcn = 0i64;
    let mut total = 0u64;

    loop {
        let Some(&header) = data.get(pos) else {
            return Err(DiscError::Corrupt("Run list is missing its terminator".to_string()));
        };
        pos += 1;
        if header == 0 {
            break;
        }

        let length_size = (header & 0x0F) as usize;
        let offset_size = (header >> 4) as usize;
        if length_size == 0 || length_size > 8 || offset_size > 8 {
            return Err(DiscError::Corrupt(format!("Invalid run header {:#04x}", header)));
        }
        if pos + length_size + offset_size > data.len() {
            return Err(DiscError::Corrupt("Data run extends beyond buffer".to_string()));
        }

        let length = read_le_unsigned(&data[pos..pos + length_size]);
        pos += length_size;
        if length == 0 {
            return Err(DiscError::Corrupt("Zero-length data run".to_string()));
        }
        total = total
            .checked_add(length)
            .filter(|&t| t <= i64::MAX as u64)
            .ok_or_else(|| DiscError::Corrupt(format!("Run list length overflows at run of {} clusters", length)))?;

        if offset_size == 0 {
            runs.push(DataRun::sparse(length));
        } else {
            let delta = read_le_signed(&data[pos..pos + offset_size]);
            pos += offset_size;
            let lcn = prev_lcn
                .checked_add(delta)
                .filter(|&lcn| lcn >= 0)
                .ok_or_else(|| DiscError::Corrupt(format!("Invalid LCN: {} {:+}", prev_lcn, delta)))?;
            prev_lcn = lcn;
            runs.push(DataRun::allocated(lcn as u64, length));
        }
    }

    Ok((runs, pos))
}

/// Encode runs, including the terminating zero byte.
pub fn encode_data_runs(runs: &[DataRun]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut prev_lcn = 0i64;

    for run in runs {
        let length_bytes = unsigned_width(run.length);
        match run.lcn {
            None => {
                out.push(length_bytes as u8);
                out.extend_from_slice(&run.length.to_le_bytes()[..length_bytes]);
            }
            Some(lcn) => {
                let delta = lcn as i64 - prev_lcn;
                let offset_bytes = signed_width(delta);
                out.push(((offset_bytes << 4) | length_bytes) as u8);
                out.extend_from_slice(&run.length.to_le_bytes()[..length_bytes]);
                out.extend_from_slice(&delta.to_le_bytes()[..offset_bytes]);
                prev_lcn = lcn as i64;
            }
        }
    }

    out.push(0);
    out
}

pub fn encoded_size(runs: &[DataRun]) -> usize {
    let mut size = 1;
    let mut prev_lcn = 0i64;
    for run in runs {
        size += 1 + unsigned_width(run.length);
        if let Some(lcn) = run.lcn {
            size += signed_width(lcn as i64 - prev_lcn);
            prev_lcn = lcn as i64;
        }
    }
    size
}

fn read_le_unsigned(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .enumerate()
        .fold(0u64, |value, (i, &byte)| value | (byte as u64) << (i * 8))
}

fn read_le_signed(bytes: &[u8]) -> i64 {
    let value = read_le_unsigned(bytes) as i64;
    let bits = bytes.len() * 8;
    if bits < 64 && value & (1 << (bits - 1)) != 0 {
        value | !((1i64 << bits) - 1)
    } else {
        value
    }
}

fn unsigned_width(value: u64) -> usize {
    (((64 - value.leading_zeros()) as usize).div_ceil(8)).max(1)
}

fn signed_width(value: i64) -> usize {
    (1..=8)
        .find(|&width| {
            let bits = width * 8;
            bits == 64 || (value >= -(1i64 << (bits - 1)) && value < (1i64 << (bits - 1)))
        })
        .unwrap_or(8)
}

/// A run list in VCN order, relative to the owning fragment's start VCN.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunList {
    runs: Vec<DataRun>,
}

impl RunList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_runs(runs: Vec<DataRun>) -> Self {
        let mut list = Self::new();
        for run in runs {
            list.append(run);
        }
        list
    }

    pub fn decode(data: &[u8]) -> Result<(Self, usize), DiscError> {
        let (runs, consumed) = decode_data_runs(data)?;
        // Keep the decoded shape as-is so re-encoding is stable
        Ok((Self { runs }, consumed))
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_data_runs(&self.runs)
    }

    pub fn encoded_size(&self) -> usize {
        encoded_size(&self.runs)
    }

    pub fn runs(&self) -> &[DataRun] {
        &self.runs
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Number of VCNs covered, holes included.
    pub fn total_clusters(&self) -> u64 {
        self.runs.iter().map(|r| r.length).sum()
    }

    /// Number of clusters backed by physical storage.
    pub fn allocated_clusters(&self) -> u64 {
        self.runs.iter().filter(|r| !r.is_sparse()).map(|r| r.length).sum()
    }

    pub fn has_holes(&self) -> bool {
        self.runs.iter().any(DataRun::is_sparse)
    }

    /// Append at the end, merging with the last run when contiguous.
    pub fn append(&mut self, run: DataRun) {
        if run.length == 0 {
            return;
        }
        if let Some(last) = self.runs.last_mut() {
            let contiguous = match (last.lcn, run.lcn) {
                (None, None) => true,
                (Some(prev), Some(next)) => prev + last.length == next,
                _ => false,
            };
            if contiguous {
                last.length += run.length;
                return;
            }
        }
        self.runs.push(run);
    }

    pub fn append_clusters(&mut self, runs: &[ClusterRun]) {
        for run in runs {
            self.append(DataRun::allocated(run.start, run.length));
        }
    }

    /// Physical cluster for `vcn` (relative to the list start) and the
    /// number of clusters left in the same run from there.
    pub fn lookup(&self, vcn: u64) -> Option<(Option<u64>, u64)> {
        let mut run_vcn = 0;
        for run in &self.runs {
            if vcn < run_vcn + run.length {
                let delta = vcn - run_vcn;
                return Some((run.lcn.map(|lcn| lcn + delta), run.length - delta));
            }
            run_vcn += run.length;
        }
        None
    }

    /// Allocated extents in VCN order.
    pub fn clusters(&self) -> Vec<ClusterRun> {
        self.runs
            .iter()
            .filter_map(|run| run.lcn.map(|lcn| ClusterRun::new(lcn, run.length)))
            .collect()
    }

    /// Cut the list to `clusters` VCNs, returning the released physical extents.
    pub fn truncate(&mut self, clusters: u64) -> Vec<ClusterRun> {
        let mut released = Vec::new();
        let mut kept = Vec::new();
        let mut run_vcn = 0;

        for run in self.runs.drain(..) {
            if run_vcn >= clusters {
                if let Some(lcn) = run.lcn {
                    released.push(ClusterRun::new(lcn, run.length));
                }
            } else if run_vcn + run.length > clusters {
                let keep = clusters - run_vcn;
                kept.push(DataRun { lcn: run.lcn, length: keep });
                if let Some(lcn) = run.lcn {
                    released.push(ClusterRun::new(lcn + keep, run.length - keep));
                }
            } else {
                kept.push(run);
            }
            run_vcn += run.length;
        }

        self.runs = kept;
        released
    }

    /// Replace the sparse range `[vcn, vcn + count)` with freshly allocated clusters.
    pub fn fill_hole(&mut self, vcn: u64, allocated: &[ClusterRun]) -> Result<(), DiscError> {
        let count: u64 = allocated.iter().map(|r| r.length).sum();
        if count == 0 {
            return Ok(());
        }

        let mut rebuilt = RunList::new();
        let mut run_vcn = 0;
        let mut inserted = false;

        for run in &self.runs {
            let run_end = run_vcn + run.length;
            let overlap_start = vcn.max(run_vcn);
            let overlap_end = (vcn + count).min(run_end);

            if overlap_start < overlap_end {
                if !run.is_sparse() {
                    return Err(DiscError::InvalidInput(format!(
                        "VCN {} is already allocated",
                        overlap_start
                    )));
                }
                rebuilt.append(DataRun::sparse(overlap_start - run_vcn));
                if !inserted {
                    rebuilt.append_clusters(allocated);
                    inserted = true;
                }
                rebuilt.append(DataRun::sparse(run_end - overlap_end));
            } else {
                rebuilt.append(*run);
            }
            run_vcn = run_end;
        }

        if !inserted || vcn + count > run_vcn {
            return Err(DiscError::InvalidInput(format!(
                "Hole {}+{} lies outside the run list",
                vcn, count
            )));
        }

        self.runs = rebuilt.runs;
        Ok(())
    }
}
