//! Format detection and adapter tests against real files on disk.

use std::sync::Arc;

use univ_convert::error::AdapterError;
use univ_convert::format::{
    default_registry, resolve_format, DecodeRequest, EncodeOptions, FormatAdapter,
    OmeTiffAdapter, OmeZarrAdapter, SourceFormat, VsiAdapter,
};
use univ_convert::model::{
    normalize, select_main_scene, ImagePyramid, SceneKind, SceneSelector,
};

use super::test_utils::{
    gradient_u8, ramp_u16, sample_metadata, vsi_pixel, vsi_scene, write_container,
    MemorySlideBackend,
};

#[tokio::test]
async fn test_resolve_format_by_content() {
    let dir = tempfile::tempdir().unwrap();

    let container = dir.path().join("no_extension");
    write_container(&container, ramp_u16([1, 1, 1, 8, 8]), &EncodeOptions::default()).await;
    assert_eq!(resolve_format(&container, None).await, Some(SourceFormat::Univ));

    let tiff = dir.path().join("plain_name");
    OmeTiffAdapter::new()
        .encode(
            &ImagePyramid::base_only(ramp_u16([1, 1, 1, 8, 8])),
            &sample_metadata(1),
            &tiff,
            &EncodeOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(resolve_format(&tiff, None).await, Some(SourceFormat::OmeTiff));

    let store = dir.path().join("store_dir");
    OmeZarrAdapter::new()
        .encode(
            &ImagePyramid::base_only(ramp_u16([1, 1, 1, 8, 8])),
            &sample_metadata(1),
            &store,
            &EncodeOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(resolve_format(&store, None).await, Some(SourceFormat::OmeZarr));

    // A hint wins over content.
    assert_eq!(
        resolve_format(&container, Some(SourceFormat::Vsi)).await,
        Some(SourceFormat::Vsi)
    );
    assert_eq!(resolve_format(&dir.path().join("absent"), None).await, None);
}

#[tokio::test]
async fn test_ome_tiff_and_zarr_agree() {
    let dir = tempfile::tempdir().unwrap();
    let tensor = ramp_u16([2, 3, 2, 70, 90]);
    let meta = sample_metadata(3);
    let pyramid = ImagePyramid::base_only(tensor.clone());
    let options = EncodeOptions {
        tile_size: 32,
        ..EncodeOptions::default()
    };

    let tiff = dir.path().join("a.ome.tiff");
    let zarr = dir.path().join("a.ome.zarr");
    OmeTiffAdapter::new().encode(&pyramid, &meta, &tiff, &options).await.unwrap();
    OmeZarrAdapter::new().encode(&pyramid, &meta, &zarr, &options).await.unwrap();

    for (adapter, path) in [
        (Arc::new(OmeTiffAdapter::new()) as Arc<dyn FormatAdapter>, &tiff),
        (Arc::new(OmeZarrAdapter::new()) as Arc<dyn FormatAdapter>, &zarr),
    ] {
        let decoded = adapter.decode(path, &DecodeRequest::default()).await.unwrap();
        let names = decoded.metadata.channel_names.clone();
        let normalized = normalize(decoded.raw, names).unwrap();
        assert_eq!(normalized.tensor, tensor, "{}", path.display());
        assert_eq!(normalized.channel_names, meta.channel_names);
        assert_eq!(decoded.metadata.physical_size, meta.physical_size);
    }
}

#[tokio::test]
async fn test_tiled_lossy_rejected_by_every_encoder() {
    let dir = tempfile::tempdir().unwrap();
    let pyramid = ImagePyramid::base_only(gradient_u8([1, 1, 1, 64, 64]));
    let options = EncodeOptions {
        compression: univ_convert::format::Compression::TiledLossy,
        tile_size: 32,
        ..EncodeOptions::default()
    };

    // VSI output is always LZW and ignores the requested compression.
    let registry = default_registry(None);
    for format in [SourceFormat::Univ, SourceFormat::OmeTiff, SourceFormat::OmeZarr] {
        let path = dir.path().join(format!("lossy.{}", format.default_extension()));
        let encoder = registry.encoder(format).unwrap();
        let result = encoder
            .encode(&pyramid, &sample_metadata(1), &path, &options)
            .await;
        assert!(result.is_err(), "{} accepted tiled-lossy", format);
        assert!(!path.exists(), "{} left {}", format, path.display());
    }
}

#[tokio::test]
async fn test_vsi_main_scene_selection() {
    let dir = tempfile::tempdir().unwrap();
    let slide = dir.path().join("slide.vsi");
    std::fs::write(&slide, b"").unwrap();

    let backend = Arc::new(MemorySlideBackend::new(vec![
        vsi_scene("Label_1", 100, 100, 1),
        vsi_scene("20x_BF_01", 30_000, 40_000, 3),
        vsi_scene("Overview", 1_500, 2_000, 3),
    ]));
    let adapter = VsiAdapter::with_backend(backend.clone());

    let scenes = adapter.list_scenes(&slide).await.unwrap();
    assert_eq!(scenes.len(), 3);
    assert_eq!(scenes[0].kind, SceneKind::Label);
    assert_eq!(scenes[1].kind, SceneKind::Main);
    assert_eq!(scenes[2].kind, SceneKind::Overview);
    assert_eq!(select_main_scene(&scenes), Some(1));
    assert_eq!(backend.read_count(), 0);
}

#[tokio::test]
async fn test_vsi_decode_with_override() {
    let dir = tempfile::tempdir().unwrap();
    let slide = dir.path().join("slide.vsi");
    std::fs::write(&slide, b"").unwrap();
    std::fs::create_dir(dir.path().join("_slide_")).unwrap();

    let backend = Arc::new(MemorySlideBackend::new(vec![
        vsi_scene("Label_1", 20, 20, 1),
        vsi_scene("20x_BF_01", 48, 64, 2),
        vsi_scene("Overview", 24, 32, 1),
    ]));
    let adapter = VsiAdapter::with_backend(backend);

    let decoded = adapter
        .decode(&slide, &DecodeRequest::scene(SceneSelector::Index(2)))
        .await
        .unwrap();
    assert!(decoded.warnings.is_empty());
    assert_eq!(decoded.metadata.scene_index, Some(2));
    assert_eq!(decoded.metadata.scene_name.as_deref(), Some("Overview"));

    let tensor = normalize(decoded.raw, vec![]).unwrap().tensor;
    assert_eq!(tensor.shape(), [1, 1, 1, 24, 32]);
    let univ_convert::model::PixelBuffer::U16(samples) = tensor.data() else {
        panic!("expected u16 samples");
    };
    assert_eq!(samples[tensor.offset(0, 0, 0, 5, 7)], vsi_pixel(2, 0, 5, 7));

    let missing = adapter
        .decode(&slide, &DecodeRequest::scene(SceneSelector::Index(9)))
        .await;
    assert!(matches!(
        missing,
        Err(AdapterError::SceneOutOfRange { index: 9, count: 3 })
    ));
}

#[tokio::test]
async fn test_vsi_without_backend() {
    let dir = tempfile::tempdir().unwrap();
    let slide = dir.path().join("slide.vsi");
    std::fs::write(&slide, b"").unwrap();

    let registry = default_registry(None);
    let adapter = registry.decoder(SourceFormat::Vsi).unwrap();
    assert!(matches!(
        adapter.decode(&slide, &DecodeRequest::default()).await,
        Err(AdapterError::BackendUnavailable(_))
    ));
}
