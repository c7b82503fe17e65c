//! Container layout, schema gate and validator tests.

use univ_convert::container::layout::{
    resolution_path, AttrValue, CHECKSUM_ATTR, PHYSICAL_SIZE, PROVENANCE,
};
use univ_convert::container::{validate_path, ContainerReader, ContainerWriter, IssueKind};
use univ_convert::error::{AdapterError, ContainerError};
use univ_convert::format::{Compression, EncodeOptions, FormatAdapter, UnivAdapter};
use univ_convert::model::{
    build_pyramid, CanonicalTensor, ImagePyramid, PixelBuffer, PYRAMID_FLOOR, THUMBNAIL_MAX,
};

use super::test_utils::{
    find_bytes, ramp_u16, remove_node, restamp, sample_metadata, set_container_attr,
    write_container,
};

fn uncompressed() -> EncodeOptions {
    EncodeOptions {
        compression: Compression::None,
        ..EncodeOptions::default()
    }
}

/// Little-endian bytes of the first `n` samples of a `ramp_u16` row 0.
fn first_row_bytes(n: u16) -> Vec<u8> {
    (0..n).flat_map(u16::to_le_bytes).collect()
}

#[tokio::test]
async fn test_schema_gate_reads_no_data() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("future.univ");
    write_container(&path, ramp_u16([1, 1, 1, 64, 64]), &uncompressed()).await;
    restamp(&path, "version", "99.0");

    // Damage the samples too: a reader that looked at them would report a
    // checksum fault instead of the stamp.
    let offset = find_bytes(&path, &first_row_bytes(32)).expect("raw samples in file");
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[offset + 5] ^= 0xFF;
    std::fs::write(&path, &bytes).unwrap();

    let result = ContainerReader::open_path(&path).await;
    assert!(matches!(
        result,
        Err(ContainerError::SchemaMismatch { ref found, .. }) if found.contains("99.0")
    ));

    let report = validate_path(&path, true).await;
    let kinds: Vec<IssueKind> = report.errors().map(|i| i.kind).collect();
    assert_eq!(kinds, vec![IssueKind::SchemaStamp]);
}

#[tokio::test]
async fn test_validator_reports_schema_stamp() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.univ");
    write_container(&path, ramp_u16([1, 1, 1, 16, 16]), &EncodeOptions::default()).await;

    restamp(&path, "format", "hdf5");
    let report = validate_path(&path, false).await;
    assert!(!report.is_valid());
    assert_eq!(report.errors().next().unwrap().kind, IssueKind::SchemaStamp);
}

#[tokio::test]
async fn test_roundtrip_tensor_and_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pyramid.univ");
    let base = ramp_u16([1, 2, 3, 600, 700]);
    let pyramid = build_pyramid(base.clone(), |_| {});
    let meta = sample_metadata(2).with_scene(1, "20x_BF_01");

    ContainerWriter::from_options(&EncodeOptions::default())
        .unwrap()
        .write(&path, &pyramid, &meta)
        .await
        .unwrap();

    let reader = ContainerReader::open_path(&path).await.unwrap();
    assert_eq!(reader.level_count(), pyramid.level_count());
    assert_eq!(reader.read_level(0).await.unwrap(), base);
    for (k, level) in pyramid.iter().enumerate() {
        assert_eq!(reader.level_shape(k).unwrap(), level.shape());
    }
    let last = reader.level_shape(reader.level_count() - 1).unwrap();
    assert!(last[3].min(last[4]) <= PYRAMID_FLOOR);

    let base_layout = reader.index().dataset(&resolution_path(0)).unwrap();
    assert_eq!(base_layout.chunk_shape, Some(vec![1, 1, 3, 512, 512]));
    let level_layout = reader.index().dataset(&resolution_path(1)).unwrap();
    assert_eq!(level_layout.chunk_shape, Some(vec![1, 1, 1, 256, 256]));

    let stored = reader.metadata().unwrap();
    assert_eq!(stored.physical_size, meta.physical_size);
    assert_eq!(stored.channel_names, meta.channel_names);
    assert_eq!(stored.source_file, meta.source_file);
    assert_eq!(stored.source_format, meta.source_format);
    assert_eq!(stored.scene_name, meta.scene_name);
    assert_eq!(stored.conversion_date, meta.conversion_date);

    let provenance = reader.provenance().unwrap();
    assert_eq!(provenance.source_file, meta.source_file);
    assert!(provenance.creator.starts_with("univ-convert"));

    let thumbnail = reader.read_thumbnail().await.unwrap().unwrap();
    let [c, y, x] = thumbnail.shape();
    assert_eq!(c, 2);
    assert!(y.max(x) <= THUMBNAIL_MAX);

    let report = validate_path(&path, true).await;
    assert!(report.is_valid(), "{:?}", report.issues);
    assert_eq!(report.warnings().count(), 0, "{:?}", report.issues);
}

#[tokio::test]
async fn test_every_lossless_filter_roundtrips() {
    let dir = tempfile::tempdir().unwrap();
    let base = ramp_u16([1, 2, 1, 70, 90]);
    for compression in [
        Compression::None,
        Compression::LosslessGeneral,
        Compression::FastGeneral,
        Compression::CombinableFilters,
    ] {
        let path = dir.path().join(format!("{:?}.univ", compression));
        let options = EncodeOptions {
            compression,
            ..EncodeOptions::default()
        };
        write_container(&path, base.clone(), &options).await;

        let reader = ContainerReader::open_path(&path).await.unwrap();
        assert_eq!(reader.read_level(0).await.unwrap(), base, "{:?}", compression);
    }
}

#[tokio::test]
async fn test_read_region_matches_full_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("region.univ");
    let base = ramp_u16([2, 1, 1, 600, 560]);
    write_container(&path, base.clone(), &EncodeOptions::default()).await;

    let reader = ContainerReader::open_path(&path).await.unwrap();
    let region = reader.read_region(0, (1, 0, 0), 500..540, 505..520).await.unwrap();
    assert_eq!(region.shape(), [1, 1, 1, 40, 15]);

    let PixelBuffer::U16(full) = base.data() else {
        panic!("expected u16 samples");
    };
    let PixelBuffer::U16(window) = region.data() else {
        panic!("expected u16 samples");
    };
    for y in 0..40 {
        for x in 0..15 {
            assert_eq!(window[y * 15 + x], full[base.offset(1, 0, 0, 500 + y, 505 + x)]);
        }
    }

    // Served again from cached chunks.
    let again = reader.read_region(0, (1, 0, 0), 500..540, 505..520).await.unwrap();
    assert_eq!(again, region);

    assert!(matches!(
        reader.read_region(0, (2, 0, 0), 0..1, 0..1).await,
        Err(ContainerError::Shape(_))
    ));
}

#[tokio::test]
async fn test_strict_mode_detects_corrupted_samples() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("corrupt.univ");
    write_container(&path, ramp_u16([1, 1, 1, 64, 64]), &uncompressed()).await;

    let offset = find_bytes(&path, &first_row_bytes(32)).expect("raw samples in file");
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[offset + 5] ^= 0xFF;
    std::fs::write(&path, &bytes).unwrap();

    let lenient = validate_path(&path, false).await;
    assert!(lenient.is_valid(), "{:?}", lenient.issues);

    let strict = validate_path(&path, true).await;
    assert!(!strict.is_valid());
    assert!(strict.errors().any(|i| i.kind == IssueKind::ChunkChecksum));
}

#[tokio::test]
async fn test_missing_checksum_is_a_warning() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("foreign.univ");
    write_container(&path, ramp_u16([1, 1, 1, 16, 16]), &EncodeOptions::default()).await;

    {
        let file = hdf5::File::open_rw(&path).unwrap();
        file.dataset("ImageData/Resolution_0")
            .unwrap()
            .delete_attr(CHECKSUM_ATTR)
            .unwrap();
    }

    let report = validate_path(&path, true).await;
    assert!(report.is_valid(), "{:?}", report.issues);
    assert!(report.warnings().any(|i| i.kind == IssueKind::ChunkChecksum));
}

#[tokio::test]
async fn test_validator_collects_every_issue() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.univ");
    write_container(&path, ramp_u16([1, 1, 1, 16, 16]), &EncodeOptions::default()).await;

    remove_node(&path, PROVENANCE);
    set_container_attr(&path, PHYSICAL_SIZE, "X", AttrValue::Float(-1.0));

    let report = validate_path(&path, false).await;
    let kinds: Vec<IssueKind> = report.errors().map(|i| i.kind).collect();
    assert!(kinds.contains(&IssueKind::MissingGroup));
    assert!(kinds.contains(&IssueKind::InvalidPhysicalSize));
    assert!(report.clone().into_result().is_err());
}

#[tokio::test]
async fn test_empty_tensor_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.univ");
    let empty = CanonicalTensor::new([1, 1, 1, 0, 0], PixelBuffer::U16(vec![])).unwrap();

    let result = UnivAdapter::new()
        .encode(
            &ImagePyramid::base_only(empty),
            &sample_metadata(1),
            &path,
            &EncodeOptions::default(),
        )
        .await;
    assert!(matches!(
        result,
        Err(AdapterError::Container(ContainerError::EmptyDataset(_)))
    ));
    assert!(!path.exists());
}
