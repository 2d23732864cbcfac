// NTFS scenario tests spanning files, streams and the volume context

use super::attributes::{AttributeRecord, ATTR_FLAG_COMPRESSED, ATTR_TYPE_DATA};
use super::file::NtfsFile;
use super::stream::{ContentTransform, NtfsStream};
use crate::test_helpers::formatted_context;
use discfs_core::DiscError;
use std::sync::Arc;

fn stream_names() -> Vec<String> {
    (0..4).map(|i| format!("s{}", i)).collect()
}

#[test]
fn test_attribute_list_spill() {
    let (mut ctx, tx) = formatted_context();
    let mut file = NtfsFile::create(&mut ctx, &tx, false).unwrap();
    // Four 250-byte named streams plus $STANDARD_INFORMATION come to 1248 bytes
    for (i, name) in stream_names().iter().enumerate() {
        let attr = AttributeRecord::new_resident(ATTR_TYPE_DATA, name, vec![i as u8 + 1; 250]);
        file.add_attribute(&mut ctx, attr).unwrap();
    }
    file.save(&mut ctx).unwrap();

    assert!(file.attribute_list().is_some());
    assert_eq!(file.extension_records().len(), 1);
    let extension = file.extension_records()[0].index;
    assert_eq!(file.extension_records()[0].base_reference, file.reference());

    let reloaded = NtfsFile::load(&mut ctx, file.reference()).unwrap();
    assert_eq!(reloaded.extension_records().len(), 1);
    for (i, name) in stream_names().iter().enumerate() {
        let content = NtfsStream::new(ATTR_TYPE_DATA, name).get_content(&mut ctx, &reloaded).unwrap();
        assert_eq!(content, vec![i as u8 + 1; 250], "stream {}", name);
    }
    assert!(reloaded.attribute(ATTR_TYPE_DATA, "missing").unwrap().is_none());

    // Ids stay unique across base and extension records
    let mut ids: Vec<u16> = reloaded.all_attributes().map(|a| a.id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), reloaded.all_attributes().count());

    let mut file = reloaded;
    for name in stream_names() {
        NtfsStream::new(ATTR_TYPE_DATA, &name).delete(&mut ctx, &mut file, &tx).unwrap();
    }
    assert!(file.attribute_list().is_none());
    assert!(file.extension_records().is_empty());
    assert!(!ctx.mft.is_allocated(extension));
}

#[test]
fn test_spilled_record_released_before_save() {
    let (mut ctx, tx) = formatted_context();
    let mut file = NtfsFile::create(&mut ctx, &tx, false).unwrap();
    let in_use = ctx.mft.allocated_count();
    for name in stream_names() {
        let attr = AttributeRecord::new_resident(ATTR_TYPE_DATA, &name, vec![0x5A; 250]);
        file.add_attribute(&mut ctx, attr).unwrap();
    }
    assert_eq!(file.extension_records().len(), 1);
    let extension = file.extension_records()[0].index;
    assert_eq!(ctx.mft.allocated_count(), in_use + 1);

    // The extension record was never written
    for name in stream_names() {
        file.remove_attribute(&mut ctx, ATTR_TYPE_DATA, &name).unwrap();
    }
    assert!(file.attribute_list().is_none());
    assert!(file.extension_records().is_empty());
    assert!(!ctx.mft.is_allocated(extension));
    assert_eq!(ctx.mft.allocated_count(), in_use);

    file.save(&mut ctx).unwrap();
    let reloaded = NtfsFile::load(&mut ctx, file.reference()).unwrap();
    assert!(reloaded.extension_records().is_empty());
}

#[test]
fn test_oversized_attribute_is_rejected() {
    let (mut ctx, tx) = formatted_context();
    let mut file = NtfsFile::create(&mut ctx, &tx, false).unwrap();
    let in_use = ctx.mft.allocated_count();
    let attributes = file.all_attributes().count();

    let attr = AttributeRecord::new_resident(ATTR_TYPE_DATA, "big", vec![0xEE; 1100]);
    let result = file.add_attribute(&mut ctx, attr);
    assert!(matches!(result, Err(DiscError::CapacityExceeded(_))));
    assert_eq!(ctx.mft.allocated_count(), in_use);
    assert_eq!(file.all_attributes().count(), attributes);
    assert!(file.extension_records().is_empty());

    file.save(&mut ctx).unwrap();
    let reloaded = NtfsFile::load(&mut ctx, file.reference()).unwrap();
    assert!(reloaded.attribute(ATTR_TYPE_DATA, "big").unwrap().is_none());
}

#[test]
fn test_resident_conversions_keep_attribute_id() {
    let (mut ctx, tx) = formatted_context();
    let mut file = NtfsFile::create(&mut ctx, &tx, false).unwrap();
    let data = NtfsStream::data();
    data.create(&mut ctx, &mut file, &tx).unwrap();
    let id = file.require(ATTR_TYPE_DATA, "").unwrap().id;

    data.write(&mut ctx, &mut file, &tx, 0, b"small").unwrap();
    assert!(file.require(ATTR_TYPE_DATA, "").unwrap().is_resident());

    let free_before = ctx.clusters.free_count();
    let big: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    data.write(&mut ctx, &mut file, &tx, 0, &big).unwrap();
    let attr = file.require(ATTR_TYPE_DATA, "").unwrap();
    assert!(!attr.is_resident());
    assert_eq!(attr.id, id);
    assert_eq!(ctx.clusters.free_count(), free_before - 3);
    assert_eq!(data.get_content(&mut ctx, &file).unwrap(), big);

    data.set_length(&mut ctx, &mut file, &tx, 50).unwrap();
    let attr = file.require(ATTR_TYPE_DATA, "").unwrap();
    assert!(attr.is_resident());
    assert_eq!(attr.id, id);
    assert_eq!(ctx.clusters.free_count(), free_before);
    assert_eq!(data.get_content(&mut ctx, &file).unwrap(), big[..50].to_vec());
}

#[test]
fn test_cluster_runs_cover_allocation() {
    let (mut ctx, tx) = formatted_context();
    let mut file = NtfsFile::create(&mut ctx, &tx, false).unwrap();
    let data = NtfsStream::data();
    data.create_non_resident(&mut ctx, &mut file, &tx).unwrap();
    for step in 1..=5u64 {
        data.set_length(&mut ctx, &mut file, &tx, step * 9000).unwrap();
    }

    let runs = data.get_clusters(&file);
    let mut sorted = runs.clone();
    sorted.sort();
    for pair in sorted.windows(2) {
        assert!(pair[0].end() <= pair[1].start, "runs overlap: {:?}", pair);
    }
    let total: u64 = runs.iter().map(|r| r.length).sum();
    let allocated = file.require(ATTR_TYPE_DATA, "").unwrap().non_resident().unwrap().allocated_size;
    assert_eq!(total * ctx.cluster_size(), allocated);
    assert_eq!(total, 11);

    let extents = data.absolute_extents(&ctx, &file);
    assert_eq!(extents.iter().map(|(_, len)| len).sum::<u64>(), allocated);
}

#[test]
fn test_sparse_holes() {
    let (mut ctx, tx) = formatted_context();
    let mut file = NtfsFile::create(&mut ctx, &tx, false).unwrap();
    let data = NtfsStream::data();
    data.create_sparse(&mut ctx, &mut file, &tx).unwrap();

    let free_before = ctx.clusters.free_count();
    data.set_length(&mut ctx, &mut file, &tx, 1024 * 1024).unwrap();
    assert!(data.get_clusters(&file).is_empty());
    assert_eq!(ctx.clusters.free_count(), free_before);

    data.write(&mut ctx, &mut file, &tx, 512 * 1024 + 100, b"island").unwrap();
    let runs = data.get_clusters(&file);
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].length, 1);
    assert_eq!(ctx.clusters.free_count(), free_before - 1);

    let content = data.get_content(&mut ctx, &file).unwrap();
    assert_eq!(content.len(), 1024 * 1024);
    assert_eq!(&content[512 * 1024 + 100..512 * 1024 + 106], b"island");
    assert!(content[..512 * 1024 + 100].iter().all(|&b| b == 0));
    assert!(content[512 * 1024 + 106..].iter().all(|&b| b == 0));
}

struct XorTransform(u8);

impl ContentTransform for XorTransform {
    fn decode(&self, _flags: u16, raw: &[u8], data_length: u64) -> Result<Vec<u8>, DiscError> {
        let mut plain: Vec<u8> = raw.iter().map(|b| b ^ self.0).collect();
        plain.truncate(data_length as usize);
        Ok(plain)
    }

    fn encode(&self, _flags: u16, plain: &[u8]) -> Result<Vec<u8>, DiscError> {
        Ok(plain.iter().map(|b| b ^ self.0).collect())
    }
}

#[test]
fn test_compressed_stream_needs_transform() {
    let (mut ctx, tx) = formatted_context();
    let mut file = NtfsFile::create(&mut ctx, &tx, false).unwrap();
    let data = NtfsStream::data();
    data.create_non_resident(&mut ctx, &mut file, &tx).unwrap();
    file.require_mut(ATTR_TYPE_DATA, "").unwrap().flags |= ATTR_FLAG_COMPRESSED;
    file.save(&mut ctx).unwrap();

    let plain = b"compressible compressible compressible".to_vec();
    assert!(matches!(
        data.set_content(&mut ctx, &mut file, &tx, &plain),
        Err(DiscError::UnsupportedFeature(_))
    ));

    ctx.set_transform(Arc::new(XorTransform(0x5A)));
    data.set_content(&mut ctx, &mut file, &tx, &plain).unwrap();
    assert_eq!(data.get_content(&mut ctx, &file).unwrap(), plain);

    let (offset, _) = data.absolute_extents(&ctx, &file)[0];
    let stored = ctx.read_bytes(offset, plain.len()).unwrap();
    assert_eq!(stored[0], plain[0] ^ 0x5A);
}
