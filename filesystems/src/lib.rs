// NTFS filesystem support over virtual disk volumes
pub mod ntfs;

#[cfg(test)]
pub mod test_helpers;

pub use ntfs::{NtfsFileSystem, NtfsFormatParams, NtfsOptions, NtfsTransaction};
