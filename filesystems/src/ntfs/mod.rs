// NTFS read/write engine
// Fully portable - everything goes through a BlockDevice

pub mod codec;
pub mod fixup;
pub mod bitmap;
pub mod cluster_bitmap;
pub mod data_runs;
pub mod attributes;
pub mod attribute_list;
pub mod file_record;
pub mod mft;
pub mod file;
pub mod stream;
pub mod index;
pub mod security;
pub mod structures;
pub mod boot_sector;
pub mod options;
pub mod timestamps;
pub mod transaction;
pub mod volume;
pub mod formatter;
pub mod filesystem;

#[cfg(test)]
mod tests;

// Re-export main types
pub use file::NtfsFile;
pub use file_record::FileRecordReference;
pub use filesystem::{DirectoryEntry, NtfsFileSystem};
pub use formatter::NtfsFormatter;
pub use index::{CollationRule, Index};
pub use options::{NtfsFormatParams, NtfsOptions};
pub use security::SecurityDescriptors;
pub use stream::{ContentTransform, NtfsStream};
pub use transaction::NtfsTransaction;
pub use volume::NtfsContext;
