// NTFS file system
// Path-level operations over a mounted volume

use super::attributes::{ATTR_TYPE_FILE_NAME, ATTR_TYPE_VOLUME_INFORMATION, ATTR_TYPE_VOLUME_NAME};
use super::codec::{utf16_decode, ByteCodec};
use super::file::NtfsFile;
use super::file_record::FileRecordReference;
use super::formatter::{NtfsFormatter, DIRECTORY_INDEX};
use super::index::{CollationRule, Index};
use super::mft::{FIRST_USER_RECORD, MFT_RECORD_ROOT, MFT_RECORD_VOLUME};
use super::options::{NtfsFormatParams, NtfsOptions};
use super::security::SecurityDescriptors;
use super::stream::{ContentTransform, NtfsStream};
use super::structures::{
    FileNameRecord, VolumeInformation, FILE_ATTRIBUTE_ARCHIVE, FILE_ATTRIBUTE_DIRECTORY, FILE_NAME_DOS,
};
use super::transaction::NtfsTransaction;
use super::volume::NtfsContext;
use discfs_core::{BlockDevice, DiscError};
use log::{debug, info};
use std::sync::Arc;

const MAX_NAME_LENGTH: usize = 255;

/// One visible entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: String,
    pub reference: FileRecordReference,
    pub is_directory: bool,
    /// Length of the unnamed $DATA stream, 0 for directories
    pub size: u64,
}

fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split(['/', '\\']).filter(|c| !c.is_empty())
}

/// Split into (parent path, final name).
fn split_parent(path: &str) -> Result<(String, &str), DiscError> {
    let parts: Vec<&str> = components(path).collect();
    let Some((name, parents)) = parts.split_last() else {
        return Err(DiscError::InvalidInput("The root directory has no name".to_string()));
    };
    Ok((parents.join("/"), *name))
}

fn validate_name(name: &str) -> Result<(), DiscError> {
    if name.encode_utf16().count() > MAX_NAME_LENGTH {
        return Err(DiscError::InvalidInput(format!(
            "Name longer than {} characters",
            MAX_NAME_LENGTH
        )));
    }
    if name == "." || name == ".." || name.chars().any(|c| c == '\0' || c == ':') {
        return Err(DiscError::InvalidInput(format!("Invalid file name '{}'", name)));
    }
    Ok(())
}

fn name_key(name: &str) -> Vec<u8> {
    FileNameRecord::lookup_key(name).to_bytes()
}

/// A mounted NTFS volume.
pub struct NtfsFileSystem {
    ctx: NtfsContext,
    security: SecurityDescriptors,
    root: FileRecordReference,
}

impl NtfsFileSystem {
    /// Format `device` and mount the result.
    pub fn format(
        device: Box<dyn BlockDevice>,
        params: NtfsFormatParams,
        options: NtfsOptions,
    ) -> Result<Self, DiscError> {
        let tx = NtfsTransaction::new();
        let ctx = NtfsFormatter::new(params).format(device, options, &tx)?;
        Self::from_context(ctx)
    }

    /// Mount an existing volume. A volume flagged dirty needs log replay and is refused.
    pub fn mount(device: Box<dyn BlockDevice>, options: NtfsOptions) -> Result<Self, DiscError> {
        let mut ctx = NtfsContext::open(device, options)?;
        let volume = NtfsFile::load_index(&mut ctx, MFT_RECORD_VOLUME)?;
        let info = NtfsStream::new(ATTR_TYPE_VOLUME_INFORMATION, "").get_content(&mut ctx, &volume)?;
        let (info, _) = VolumeInformation::read_from(&info)?;
        if info.is_dirty() {
            return Err(DiscError::UnsupportedFeature(
                "Volume is marked dirty and needs $LogFile replay".to_string(),
            ));
        }
        info!("Mounted NTFS {}.{} volume", info.major_version, info.minor_version);
        Self::from_context(ctx)
    }

    fn from_context(mut ctx: NtfsContext) -> Result<Self, DiscError> {
        let root = NtfsFile::load_index(&mut ctx, MFT_RECORD_ROOT)?.reference();
        let security = SecurityDescriptors::open(&mut ctx)?;
        Ok(Self { ctx, security, root })
    }

    pub fn context(&self) -> &NtfsContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut NtfsContext {
        &mut self.ctx
    }

    pub fn set_transform(&mut self, transform: Arc<dyn ContentTransform>) {
        self.ctx.set_transform(transform);
    }

    pub fn volume_label(&mut self) -> Result<String, DiscError> {
        let volume = NtfsFile::load_index(&mut self.ctx, MFT_RECORD_VOLUME)?;
        let raw = NtfsStream::new(ATTR_TYPE_VOLUME_NAME, "").get_content(&mut self.ctx, &volume)?;
        utf16_decode(&raw)
    }

    pub fn volume_information(&mut self) -> Result<VolumeInformation, DiscError> {
        let volume = NtfsFile::load_index(&mut self.ctx, MFT_RECORD_VOLUME)?;
        let raw = NtfsStream::new(ATTR_TYPE_VOLUME_INFORMATION, "").get_content(&mut self.ctx, &volume)?;
        Ok(VolumeInformation::read_from(&raw)?.0)
    }

    fn open_directory(&mut self, reference: FileRecordReference) -> Result<Index, DiscError> {
        let file = NtfsFile::load(&mut self.ctx, reference)?;
        if !file.is_directory() {
            return Err(DiscError::InvalidInput(format!("{} is not a directory", reference)));
        }
        Index::open(&mut self.ctx, file, DIRECTORY_INDEX)
    }

    /// Walk `path` from the root directory. Names compare case-insensitively.
    pub fn resolve(&mut self, path: &str) -> Result<FileRecordReference, DiscError> {
        let mut current = self.root;
        for component in components(path) {
            let mut directory = self.open_directory(current)?;
            let data = directory
                .try_get(&mut self.ctx, &name_key(component))?
                .ok_or_else(|| DiscError::NotFound(format!("'{}' in path '{}'", component, path)))?;
            let raw: [u8; 8] = data
                .as_slice()
                .try_into()
                .map_err(|_| DiscError::Corrupt(format!("Directory entry '{}' has {} data bytes", component, data.len())))?;
            current = FileRecordReference::from_raw(u64::from_le_bytes(raw));
        }
        Ok(current)
    }

    pub fn exists(&mut self, path: &str) -> Result<bool, DiscError> {
        match self.resolve(path) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn create_file(&mut self, tx: &NtfsTransaction, path: &str) -> Result<FileRecordReference, DiscError> {
        self.create_entry(tx, path, false)
    }

    pub fn create_directory(&mut self, tx: &NtfsTransaction, path: &str) -> Result<FileRecordReference, DiscError> {
        self.create_entry(tx, path, true)
    }

    fn create_entry(
        &mut self,
        tx: &NtfsTransaction,
        path: &str,
        directory: bool,
    ) -> Result<FileRecordReference, DiscError> {
        let (parent_path, name) = split_parent(path)?;
        validate_name(name)?;
        let parent = self.resolve(&parent_path)?;
        let mut parent_index = self.open_directory(parent)?;
        if parent_index.contains_key(&mut self.ctx, &name_key(name))? {
            return Err(DiscError::InvalidInput(format!("'{}' already exists", path)));
        }

        let flags = if directory { FILE_ATTRIBUTE_DIRECTORY } else { FILE_ATTRIBUTE_ARCHIVE };
        let link = FileNameRecord::new(parent, name, tx.filetime(), flags);
        let mut file = NtfsFile::create(&mut self.ctx, tx, directory)?;
        file.add_file_name(&mut self.ctx, &link)?;
        let reference = file.reference();
        if directory {
            Index::create(
                &mut self.ctx,
                tx,
                file,
                DIRECTORY_INDEX,
                ATTR_TYPE_FILE_NAME,
                CollationRule::FileName,
            )?;
        } else {
            NtfsStream::data().create(&mut self.ctx, &mut file, tx)?;
        }

        parent_index.insert(&mut self.ctx, tx, &link.to_bytes(), &reference.raw().to_le_bytes())?;
        debug!("Created '{}' as {}", path, reference);
        Ok(reference)
    }

    fn open_file(&mut self, path: &str) -> Result<NtfsFile, DiscError> {
        let reference = self.resolve(path)?;
        let file = NtfsFile::load(&mut self.ctx, reference)?;
        if file.is_directory() {
            return Err(DiscError::InvalidInput(format!("'{}' is a directory", path)));
        }
        Ok(file)
    }

    /// Write `data` at `offset`, growing the file as needed.
    pub fn write_file(&mut self, tx: &NtfsTransaction, path: &str, offset: u64, data: &[u8]) -> Result<(), DiscError> {
        let mut file = self.open_file(path)?;
        NtfsStream::data().write(&mut self.ctx, &mut file, tx, offset, data)
    }

    /// Replace the whole content of a file.
    pub fn set_file_content(&mut self, tx: &NtfsTransaction, path: &str, data: &[u8]) -> Result<(), DiscError> {
        let mut file = self.open_file(path)?;
        NtfsStream::data().set_content(&mut self.ctx, &mut file, tx, data)
    }

    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>, DiscError> {
        let file = self.open_file(path)?;
        NtfsStream::data().get_content(&mut self.ctx, &file)
    }

    /// Read into `buf` from `offset`; returns the number of bytes read.
    pub fn read_at(&mut self, path: &str, offset: u64, buf: &mut [u8]) -> Result<usize, DiscError> {
        let file = self.open_file(path)?;
        NtfsStream::data().read(&mut self.ctx, &file, offset, buf)
    }

    pub fn file_length(&mut self, path: &str) -> Result<u64, DiscError> {
        let file = self.open_file(path)?;
        NtfsStream::data().len(&file)
    }

    pub fn truncate(&mut self, tx: &NtfsTransaction, path: &str, length: u64) -> Result<(), DiscError> {
        let mut file = self.open_file(path)?;
        NtfsStream::data().set_length(&mut self.ctx, &mut file, tx, length)
    }

    /// Delete a file or an empty directory.
    pub fn delete_file(&mut self, tx: &NtfsTransaction, path: &str) -> Result<(), DiscError> {
        let (_, name) = split_parent(path)?;
        let reference = self.resolve(path)?;
        let mut file = NtfsFile::load(&mut self.ctx, reference)?;
        if file.is_directory() {
            let mut index = Index::open(&mut self.ctx, file, DIRECTORY_INDEX)?;
            if index.count(&mut self.ctx)? > 0 {
                return Err(DiscError::InvalidInput(format!("Directory '{}' is not empty", path)));
            }
            file = index.into_file();
        }

        let link = file
            .file_name()?
            .ok_or_else(|| DiscError::Corrupt(format!("{} has no $FILE_NAME", reference)))?;
        let mut parent_index = self.open_directory(link.parent)?;
        if !parent_index.remove(&mut self.ctx, tx, &name_key(name))? {
            return Err(DiscError::Corrupt(format!(
                "'{}' is not listed in its parent {}",
                path, link.parent
            )));
        }
        file.delete(&mut self.ctx)?;
        debug!("Deleted '{}' ({})", path, reference);
        Ok(())
    }

    /// Entries of a directory in collation order, without DOS 8.3 aliases.
    pub fn list_directory(&mut self, path: &str) -> Result<Vec<DirectoryEntry>, DiscError> {
        let reference = self.resolve(path)?;
        let mut index = self.open_directory(reference)?;
        let hide_metafiles = self.ctx.options.hide_metafiles;

        let mut links = Vec::new();
        for entry in index.entries(&mut self.ctx) {
            let (key, data) = entry?;
            let (link, _) = FileNameRecord::read_from(&key)?;
            let raw: [u8; 8] = data
                .as_slice()
                .try_into()
                .map_err(|_| DiscError::Corrupt(format!("Directory entry '{}' has {} data bytes", link.name, data.len())))?;
            let target = FileRecordReference::from_raw(u64::from_le_bytes(raw));
            if link.namespace == FILE_NAME_DOS || (hide_metafiles && target.index() < FIRST_USER_RECORD) {
                continue;
            }
            links.push((link, target));
        }

        let mut entries = Vec::with_capacity(links.len());
        for (link, target) in links {
            let is_directory = link.is_directory();
            let size = if is_directory {
                0
            } else {
                let file = NtfsFile::load(&mut self.ctx, target)?;
                let data = NtfsStream::data();
                if data.exists(&file)? {
                    data.len(&file)?
                } else {
                    0
                }
            };
            entries.push(DirectoryEntry {
                name: link.name,
                reference: target,
                is_directory,
                size,
            });
        }
        Ok(entries)
    }

    /// Attach a security descriptor to a file, sharing storage with identical descriptors.
    pub fn set_security(&mut self, tx: &NtfsTransaction, path: &str, descriptor: &[u8]) -> Result<u32, DiscError> {
        let reference = self.resolve(path)?;
        let id = self.security.add_descriptor(&mut self.ctx, tx, descriptor)?;
        let mut file = NtfsFile::load(&mut self.ctx, reference)?;
        let mut info = file.standard_information()?;
        info.security_id = id;
        file.set_standard_information(&info)?;
        file.touch(tx)?;
        file.save(&mut self.ctx)?;
        Ok(id)
    }

    /// The descriptor attached by `set_security`, if any.
    pub fn get_security(&mut self, path: &str) -> Result<Option<Vec<u8>>, DiscError> {
        let reference = self.resolve(path)?;
        let file = NtfsFile::load(&mut self.ctx, reference)?;
        match file.standard_information()?.security_id {
            0 => Ok(None),
            id => self.security.get_descriptor(&mut self.ctx, id).map(Some),
        }
    }

    pub fn security(&self) -> &SecurityDescriptors {
        &self.security
    }

    pub fn flush(&mut self) -> Result<(), DiscError> {
        self.ctx.flush()
    }

    /// Flush and hand back the device.
    pub fn unmount(mut self) -> Result<Box<dyn BlockDevice>, DiscError> {
        self.ctx.flush()?;
        info!("Unmounted NTFS volume");
        Ok(self.ctx.device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use discfs_core::MemoryDevice;

    fn mounted() -> NtfsFileSystem {
        let _ = env_logger::builder().is_test(true).try_init();
        let params = NtfsFormatParams {
            volume_label: "DATA".to_string(),
            ..Default::default()
        };
        NtfsFileSystem::format(Box::new(MemoryDevice::new(8 * 1024 * 1024)), params, NtfsOptions::default()).unwrap()
    }

    #[test]
    fn test_split_parent() {
        assert_eq!(split_parent("/a/b/c.txt").unwrap(), ("a/b".to_string(), "c.txt"));
        assert_eq!(split_parent("top").unwrap(), (String::new(), "top"));
        assert_eq!(split_parent("\\win\\style").unwrap(), ("win".to_string(), "style"));
        assert!(split_parent("/").is_err());
        assert!(validate_name("ok.txt").is_ok());
        assert!(validate_name("bad:stream").is_err());
        assert!(validate_name(&"x".repeat(256)).is_err());
    }

    #[test]
    fn test_create_write_read() {
        let mut fs = mounted();
        let tx = NtfsTransaction::new();
        fs.create_directory(&tx, "/docs").unwrap();
        fs.create_file(&tx, "/docs/Readme.txt").unwrap();
        fs.write_file(&tx, "/docs/readme.TXT", 0, b"hello ntfs").unwrap();

        assert_eq!(fs.read_file("/DOCS/README.TXT").unwrap(), b"hello ntfs");
        assert_eq!(fs.file_length("/docs/Readme.txt").unwrap(), 10);
        let mut buf = [0u8; 4];
        assert_eq!(fs.read_at("/docs/Readme.txt", 6, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"ntfs");

        assert!(matches!(
            fs.create_file(&tx, "/docs/README.txt"),
            Err(DiscError::InvalidInput(_))
        ));
        assert!(fs.read_file("/docs").is_err());
        assert!(fs.resolve("/docs/missing").unwrap_err().is_not_found());
    }

    #[test]
    fn test_listing_hides_metafiles() {
        let mut fs = mounted();
        let tx = NtfsTransaction::new();
        fs.create_file(&tx, "/b.bin").unwrap();
        fs.create_file(&tx, "/A.bin").unwrap();
        fs.write_file(&tx, "/b.bin", 0, &[9u8; 3000]).unwrap();

        let names: Vec<_> = fs.list_directory("/").unwrap().into_iter().map(|e| (e.name, e.size)).collect();
        assert_eq!(names, vec![("A.bin".to_string(), 0), ("b.bin".to_string(), 3000)]);

        fs.context_mut().options.hide_metafiles = false;
        let all = fs.list_directory("/").unwrap();
        assert!(all.iter().any(|e| e.name == "$MFT"));
        assert_eq!(fs.volume_label().unwrap(), "DATA");
    }

    #[test]
    fn test_truncate_and_delete() {
        let mut fs = mounted();
        let tx = NtfsTransaction::new();
        fs.create_directory(&tx, "/d").unwrap();
        fs.create_file(&tx, "/d/f").unwrap();
        fs.write_file(&tx, "/d/f", 0, &vec![1u8; 20000]).unwrap();
        let free_with_data = fs.context().clusters.free_count();

        fs.truncate(&tx, "/d/f", 100).unwrap();
        assert_eq!(fs.file_length("/d/f").unwrap(), 100);
        assert!(fs.context().clusters.free_count() > free_with_data);

        assert!(matches!(fs.delete_file(&tx, "/d"), Err(DiscError::InvalidInput(_))));
        fs.delete_file(&tx, "/d/f").unwrap();
        fs.delete_file(&tx, "/d").unwrap();
        assert!(!fs.exists("/d").unwrap());
        assert!(fs.list_directory("/").unwrap().is_empty());
    }

    #[test]
    fn test_security_round_trip() {
        let mut fs = mounted();
        let tx = NtfsTransaction::new();
        fs.create_file(&tx, "/one").unwrap();
        fs.create_file(&tx, "/two").unwrap();
        assert_eq!(fs.get_security("/one").unwrap(), None);

        let descriptor = vec![1u8, 0, 4, 0x80, 0x14, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let a = fs.set_security(&tx, "/one", &descriptor).unwrap();
        let b = fs.set_security(&tx, "/two", &descriptor).unwrap();
        assert_eq!(a, b);
        assert_eq!(fs.security().reference_count(a), 2);
        assert_eq!(fs.get_security("/two").unwrap(), Some(descriptor));
    }

    #[test]
    fn test_remount_and_dirty_volume() {
        let mut fs = mounted();
        let tx = NtfsTransaction::new();
        fs.create_file(&tx, "/keep").unwrap();
        fs.write_file(&tx, "/keep", 0, b"persisted").unwrap();
        let device = fs.unmount().unwrap();

        let mut fs = NtfsFileSystem::mount(device, NtfsOptions::default()).unwrap();
        assert_eq!(fs.read_file("/keep").unwrap(), b"persisted");

        // Flag the volume dirty and expect the mount to be refused
        let ctx = fs.context_mut();
        let mut volume = NtfsFile::load_index(ctx, MFT_RECORD_VOLUME).unwrap();
        let dirty = VolumeInformation {
            flags: crate::ntfs::structures::VOLUME_FLAG_DIRTY,
            ..VolumeInformation::new()
        };
        NtfsStream::new(ATTR_TYPE_VOLUME_INFORMATION, "")
            .set_content(ctx, &mut volume, &tx, &dirty.to_bytes())
            .unwrap();
        let device = fs.unmount().unwrap();
        assert!(matches!(
            NtfsFileSystem::mount(device, NtfsOptions::default()),
            Err(DiscError::UnsupportedFeature(_))
        ));
    }
}
