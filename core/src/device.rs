use crate::DiscError;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Randomly addressable byte stream a filesystem lives on.
///
/// The container layer (raw image, VHD, VMDK...) hands filesystems one of
/// these; offsets are relative to the start of the volume.
pub trait BlockDevice: Send {
    /// Fill `buf` from `offset`. Short reads are errors.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), DiscError>;

    /// Write all of `data` at `offset`.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), DiscError>;

    /// Size of the volume in bytes.
    fn length(&self) -> u64;

    fn flush(&mut self) -> Result<(), DiscError> {
        Ok(())
    }

    /// Convenience wrapper returning an owned buffer.
    fn read_vec(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, DiscError> {
        let mut buf = vec![0u8; len];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }
}

fn check_bounds(offset: u64, len: usize, size: u64) -> Result<(), DiscError> {
    let end = offset
        .checked_add(len as u64)
        .ok_or_else(|| DiscError::InvalidInput(format!("Offset overflow at {:#x}", offset)))?;
    if end > size {
        return Err(DiscError::InvalidInput(format!(
            "Access {:#x}..{:#x} beyond device end {:#x}",
            offset, end, size
        )));
    }
    Ok(())
}

/// Volume held entirely in memory.
#[derive(Debug, Clone)]
pub struct MemoryDevice {
    data: Vec<u8>,
}

impl MemoryDevice {
    /// Zero-filled device of `size` bytes.
    pub fn new(size: u64) -> Self {
        Self {
            data: vec![0u8; size as usize],
        }
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

impl BlockDevice for MemoryDevice {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), DiscError> {
        check_bounds(offset, buf.len(), self.data.len() as u64)?;
        let start = offset as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), DiscError> {
        check_bounds(offset, data.len(), self.data.len() as u64)?;
        let start = offset as usize;
        self.data[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn length(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Volume backed by an image file on the host.
pub struct FileDevice {
    path: PathBuf,
    file: File,
    size: u64,
}

impl FileDevice {
    /// Open an existing image read-write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DiscError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let size = file.metadata()?.len();
        debug!("Opened image {} ({} bytes)", path.display(), size);
        Ok(Self { path, file, size })
    }

    /// Create (or truncate) an image of `size` bytes.
    pub fn create(path: impl AsRef<Path>, size: u64) -> Result<Self, DiscError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(size)?;
        debug!("Created image {} ({} bytes)", path.display(), size);
        Ok(Self { path, file, size })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockDevice for FileDevice {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), DiscError> {
        check_bounds(offset, buf.len(), self.size)?;
        trace!("read {} bytes at {:#x}", buf.len(), offset);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), DiscError> {
        check_bounds(offset, data.len(), self.size)?;
        trace!("write {} bytes at {:#x}", data.len(), offset);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn length(&self) -> u64 {
        self.size
    }

    fn flush(&mut self) -> Result<(), DiscError> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}
