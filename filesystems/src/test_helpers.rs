// Test helpers for NTFS testing

use crate::ntfs::{NtfsContext, NtfsFormatParams, NtfsFormatter, NtfsOptions, NtfsTransaction};
use discfs_core::MemoryDevice;

/// Size of the scratch volumes tests run against
pub const TEST_VOLUME_SIZE: u64 = 8 * 1024 * 1024;

/// Freshly formatted in-memory volume: 4 KiB clusters, 1 KiB records, 4 KiB index buffers.
pub fn formatted_context() -> (NtfsContext, NtfsTransaction) {
    formatted_context_with(NtfsFormatParams::default(), NtfsOptions::default())
}

pub fn formatted_context_with(params: NtfsFormatParams, options: NtfsOptions) -> (NtfsContext, NtfsTransaction) {
    let _ = env_logger::builder().is_test(true).try_init();
    let tx = NtfsTransaction::new();
    let ctx = NtfsFormatter::new(params)
        .format(Box::new(MemoryDevice::new(TEST_VOLUME_SIZE)), options, &tx)
        .expect("format test volume");
    (ctx, tx)
}
