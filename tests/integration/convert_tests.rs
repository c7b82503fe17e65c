//! End-to-end conversion tests: routing, scoped cleanup, scene selection
//! and concurrent jobs.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use univ_convert::container::{validate_path, ContainerReader};
use univ_convert::convert::{
    CollectingSink, ConversionRequest, ConversionState, Converter, ProgressEvent, Route,
};
use univ_convert::error::{AdapterError, ConvertError};
use univ_convert::format::{
    default_registry, AdapterRegistry, Compression, DecodeRequest, EncodeOptions,
    FormatAdapter, OmeTiffAdapter, OmeZarrAdapter, SourceFormat, UnivAdapter,
};
use univ_convert::model::{
    normalize, CanonicalTensor, ImageMetadata, ImagePyramid, PhysicalSize, PixelBuffer,
    SceneKind, SceneSelector,
};

use super::test_utils::{
    intermediates, list_tree, ramp_u16, vsi_pixel, vsi_scene, write_container, FailingUnivDecoder,
    HollowEncoder, MemorySlideBackend,
};

async fn decode_tensor(adapter: &dyn FormatAdapter, path: &Path) -> CanonicalTensor {
    let decoded = adapter.decode(path, &DecodeRequest::default()).await.unwrap();
    normalize(decoded.raw, decoded.metadata.channel_names)
        .unwrap()
        .tensor
}

/// Write `tensor` as an OME-Zarr store at `path`.
async fn make_zarr(dir: &Path, path: &Path, tensor: CanonicalTensor) {
    let staging = dir.join("staging.univ");
    write_container(&staging, tensor, &EncodeOptions::default()).await;
    Converter::default()
        .convert(&ConversionRequest::new(&staging, path))
        .await
        .into_result()
        .unwrap();
    std::fs::remove_file(&staging).unwrap();
}

#[tokio::test]
async fn test_two_hop_zarr_to_tiff() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.ome.zarr");
    let output = dir.path().join("out.ome.tiff");
    let tensor = ramp_u16([1, 2, 1, 128, 96]);
    make_zarr(dir.path(), &input, tensor.clone()).await;

    let sink = Arc::new(CollectingSink::new());
    let converter = Converter::default().with_sink(sink.clone());
    let result = converter
        .convert(&ConversionRequest::new(&input, &output))
        .await;

    let summary = result.outcome.clone().unwrap();
    assert_eq!(
        summary.route,
        Route::ViaContainer {
            from: SourceFormat::OmeZarr,
            to: SourceFormat::OmeTiff
        }
    );
    assert_eq!(result.hops.len(), 2);
    assert_eq!(result.hops[0].to, SourceFormat::Univ);
    assert_eq!(result.hops[1].from, SourceFormat::Univ);
    assert!(result
        .hops
        .iter()
        .all(|h| h.final_state() == ConversionState::Done));
    assert_eq!(sink.stages(1).last(), Some(&ConversionState::Done));

    assert!(intermediates(dir.path()).is_empty());
    assert_eq!(decode_tensor(&OmeTiffAdapter::new(), &output).await, tensor);
}

#[tokio::test]
async fn test_two_hop_cleanup_when_intermediate_decode_fails() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.ome.zarr");
    let output = dir.path().join("out.ome.tiff");
    make_zarr(dir.path(), &input, ramp_u16([1, 1, 1, 128, 128])).await;
    let before = list_tree(dir.path());

    let failing = Arc::new(FailingUnivDecoder::default());
    let registry = default_registry(None).with(failing.clone());
    let result = Converter::new(registry)
        .convert(&ConversionRequest::new(&input, &output))
        .await;

    match result.error() {
        Some(ConvertError::Decode { format, source }) => {
            assert_eq!(*format, "univ");
            assert!(matches!(source, AdapterError::Malformed(_)));
        }
        other => panic!("expected a decode failure, got {:?}", other),
    }
    assert_eq!(failing.decode_attempts.load(Ordering::SeqCst), 1);

    // The first hop finished, the second failed while decoding.
    assert_eq!(result.hops.len(), 2);
    assert_eq!(result.hops[0].final_state(), ConversionState::Done);
    assert_eq!(
        result.hops[1].states,
        vec![
            ConversionState::Idle,
            ConversionState::Decoding,
            ConversionState::Failed
        ]
    );

    assert!(intermediates(dir.path()).is_empty());
    assert!(!output.exists());
    assert_eq!(list_tree(dir.path()), before);
}

#[tokio::test]
async fn test_failed_verification_removes_output() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.univ");
    let output = dir.path().join("out.ome.tiff");
    write_container(&input, ramp_u16([1, 1, 1, 32, 32]), &EncodeOptions::default()).await;

    let registry = AdapterRegistry::new()
        .with(Arc::new(UnivAdapter::new()))
        .with(Arc::new(HollowEncoder(SourceFormat::OmeTiff)));
    let result = Converter::new(registry)
        .convert(&ConversionRequest::new(&input, &output))
        .await;

    assert!(matches!(result.error(), Some(ConvertError::Verification(_))));
    let states = &result.hops[0].states;
    assert_eq!(states[states.len() - 2], ConversionState::Verifying);
    assert_eq!(result.hops[0].final_state(), ConversionState::Failed);
    assert!(!output.exists());
}

#[tokio::test]
async fn test_corrupt_source_fails_in_decoding() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.univ");
    let output = dir.path().join("out.ome.zarr");
    std::fs::write(&input, vec![0u8; 256]).unwrap();

    let result = Converter::default()
        .convert(&ConversionRequest::new(&input, &output))
        .await;

    assert!(matches!(
        result.error(),
        Some(ConvertError::Decode { format: "univ", .. })
    ));
    assert!(result.error().unwrap().container_error().is_some());
    assert_eq!(
        result.hops[0].states,
        vec![
            ConversionState::Idle,
            ConversionState::Decoding,
            ConversionState::Failed
        ]
    );
    assert!(!output.exists());
}

#[tokio::test]
async fn test_pyramid_events_and_skip() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.univ");
    write_container(&input, ramp_u16([1, 1, 1, 600, 600]), &EncodeOptions::default()).await;

    let sink = Arc::new(CollectingSink::new());
    let converter = Converter::default().with_sink(sink.clone());
    let summary = converter
        .convert(&ConversionRequest::new(&input, dir.path().join("p.ome.zarr")))
        .await
        .into_result()
        .unwrap();
    // 600 -> 300 -> 150
    assert_eq!(summary.levels, 3);
    let built: Vec<usize> = sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            ProgressEvent::PyramidLevelBuilt { level, .. } => Some(level),
            _ => None,
        })
        .collect();
    assert_eq!(built, vec![1, 2]);
    assert!(sink
        .events()
        .iter()
        .any(|e| matches!(e, ProgressEvent::BytesWritten { bytes, .. } if *bytes > 0)));

    let flat = EncodeOptions {
        include_pyramid: false,
        ..EncodeOptions::default()
    };
    let summary = converter
        .convert(&ConversionRequest::new(&input, dir.path().join("flat.ome.zarr")).with_options(flat))
        .await
        .into_result()
        .unwrap();
    assert_eq!(summary.levels, 1);
    // Skipping the pyramid still passes through the stage.
    assert_eq!(sink.stages(0).iter().filter(|s| **s == ConversionState::Pyramiding).count(), 2);
}

#[tokio::test]
async fn test_vsi_to_univ_selects_main_scene() {
    let dir = tempfile::tempdir().unwrap();
    let slide = dir.path().join("slide.vsi");
    let output = dir.path().join("slide.univ");
    std::fs::write(&slide, b"").unwrap();

    let backend = Arc::new(MemorySlideBackend::new(vec![
        vsi_scene("Label_1", 50, 40, 1),
        vsi_scene("20x_BF_01", 80, 96, 2),
        vsi_scene("Overview", 50, 60, 1),
    ]));
    let sink = Arc::new(CollectingSink::new());
    let converter = Converter::new(default_registry(Some(backend))).with_sink(sink.clone());
    let summary = converter
        .convert(&ConversionRequest::new(&slide, &output))
        .await
        .into_result()
        .unwrap();

    assert_eq!(summary.scene_index, Some(1));
    assert_eq!(summary.shape, [1, 2, 1, 80, 96]);
    assert!(sink.stages(0).contains(&ConversionState::SceneSelecting));
    assert!(sink.events().iter().any(|e| matches!(
        e,
        ProgressEvent::SceneSelected { index: 1, kind: SceneKind::Main, .. }
    )));
    // No data folder next to the slide.
    assert!(sink
        .events()
        .iter()
        .any(|e| matches!(e, ProgressEvent::Warning(m) if m.contains("data folder"))));

    let decoded = UnivAdapter::new()
        .decode(&output, &DecodeRequest::default())
        .await
        .unwrap();
    assert_eq!(decoded.metadata.source_format, SourceFormat::Vsi);
    assert_eq!(decoded.metadata.scene_name.as_deref(), Some("20x_BF_01"));
    assert_eq!(decoded.metadata.channel_names, vec!["DAPI0", "DAPI1"]);
    let tensor = normalize(decoded.raw, vec![]).unwrap().tensor;
    let PixelBuffer::U16(samples) = tensor.data() else {
        panic!("expected u16 samples");
    };
    assert_eq!(samples[tensor.offset(0, 1, 0, 33, 44)], vsi_pixel(1, 1, 33, 44));
}

#[tokio::test]
async fn test_vsi_scene_override_and_resolution_level() {
    let dir = tempfile::tempdir().unwrap();
    let slide = dir.path().join("slide.vsi");
    let output = dir.path().join("overview.ome.zarr");
    std::fs::write(&slide, b"").unwrap();

    let backend = Arc::new(MemorySlideBackend::new(vec![
        vsi_scene("20x_BF_01", 80, 96, 1),
        vsi_scene("Overview", 64, 64, 1),
    ]));
    let converter = Converter::new(default_registry(Some(backend)));
    let request = ConversionRequest::new(&slide, &output)
        .with_scene(SceneSelector::Index(1))
        .with_resolution_level(1)
        .with_options(EncodeOptions {
            compression: Compression::None,
            ..EncodeOptions::default()
        });
    let summary = converter.convert(&request).await.into_result().unwrap();
    assert_eq!(summary.scene_index, Some(1));
    assert_eq!(summary.shape, [1, 1, 1, 32, 32]);

    let decoded = OmeZarrAdapter::new()
        .decode(&output, &DecodeRequest::default())
        .await
        .unwrap();
    assert_eq!(decoded.metadata.physical_size.x, 0.5);
    assert_eq!(decoded.metadata.physical_size.z, 1.0);
}

#[tokio::test]
async fn test_zarr_to_vsi_compatible_tiff() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.ome.zarr");
    let output = dir.path().join("out.vsi");
    let tensor = ramp_u16([1, 1, 2, 96, 80]);
    make_zarr(dir.path(), &input, tensor.clone()).await;

    let summary = Converter::default()
        .convert(&ConversionRequest::new(&input, &output))
        .await
        .into_result()
        .unwrap();
    assert!(summary.route.is_two_hop());
    assert!(intermediates(dir.path()).is_empty());

    // VSI output is an LZW OME-TIFF.
    assert_eq!(decode_tensor(&OmeTiffAdapter::new(), &output).await, tensor);
}

#[tokio::test]
async fn test_concurrent_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let mut inputs = Vec::new();
    for i in 0..3 {
        let path = dir.path().join(format!("in{}.univ", i));
        write_container(&path, ramp_u16([1, 1, 1, 64 + i * 8, 64]), &EncodeOptions::default()).await;
        inputs.push(path);
    }

    let converter = Converter::default();
    let a = ConversionRequest::new(&inputs[0], dir.path().join("a.ome.tiff"));
    let b = ConversionRequest::new(&inputs[1], dir.path().join("b.ome.zarr"));
    let c = ConversionRequest::new(&inputs[2], dir.path().join("c.vsi"));
    let (ra, rb, rc) = tokio::join!(
        converter.convert(&a),
        converter.convert(&b),
        converter.convert(&c)
    );

    for (result, height) in [(ra, 64), (rb, 72), (rc, 80)] {
        let summary = result.into_result().unwrap();
        assert_eq!(summary.shape, [1, 1, 1, height, 64]);
    }

    // Two-hop jobs on separate outputs in parallel tasks.
    let converter = Arc::new(converter);
    let mut handles = Vec::new();
    for (i, name) in ["x.ome.zarr", "y.ome.zarr"].iter().enumerate() {
        let converter = Arc::clone(&converter);
        let request =
            ConversionRequest::new(dir.path().join("a.ome.tiff"), dir.path().join(format!("{}{}", i, name)));
        handles.push(tokio::spawn(async move { converter.convert(&request).await }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_success());
    }
    assert!(intermediates(dir.path()).is_empty());
}

#[tokio::test]
async fn test_existing_temp_file_survives_two_hop_job() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.ome.zarr");
    let output = dir.path().join("out.vsi");
    make_zarr(dir.path(), &input, ramp_u16([1, 1, 1, 64, 64])).await;

    // A user file that happens to carry the old fixed intermediate name.
    let bystander = dir.path().join("out.temp.univ");
    std::fs::write(&bystander, b"not ours").unwrap();

    let summary = Converter::default()
        .convert(&ConversionRequest::new(&input, &output))
        .await
        .into_result()
        .unwrap();
    assert!(summary.route.is_two_hop());
    assert_eq!(std::fs::read(&bystander).unwrap(), b"not ours");
    assert_eq!(intermediates(dir.path()), vec!["out.temp.univ".to_string()]);
}

#[tokio::test]
async fn test_two_hop_jobs_sharing_a_stem() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.ome.zarr");
    let tensor = ramp_u16([1, 1, 1, 96, 64]);
    make_zarr(dir.path(), &input, tensor.clone()).await;

    // Both outputs have the stem "out" and run their first hop at once.
    let converter = Arc::new(Converter::default());
    let mut handles = Vec::new();
    for name in ["out.vsi", "out.tif"] {
        let converter = Arc::clone(&converter);
        let request = ConversionRequest::new(&input, dir.path().join(name));
        handles.push(tokio::spawn(async move { converter.convert(&request).await }));
    }
    for handle in handles {
        let result = handle.await.unwrap();
        assert!(result.is_success(), "{:?}", result.error());
    }

    for name in ["out.vsi", "out.tif"] {
        let path = dir.path().join(name);
        assert_eq!(decode_tensor(&OmeTiffAdapter::new(), &path).await, tensor);
    }
    assert!(intermediates(dir.path()).is_empty());
}

#[tokio::test]
async fn test_univ_to_ome_tiff_and_back() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source.univ");
    let tiff = dir.path().join("middle.ome.tiff");
    let back = dir.path().join("back.univ");

    let tensor = ramp_u16([1, 2, 3, 300, 280]);
    let meta = ImageMetadata::new("slide.vsi", SourceFormat::Vsi)
        .with_physical_size(PhysicalSize::new(Some(0.325), Some(0.325), Some(1.5)))
        .with_channel_names(vec!["DAPI".into(), "FITC".into()]);
    UnivAdapter::new()
        .encode(
            &ImagePyramid::base_only(tensor.clone()),
            &meta,
            &source,
            &EncodeOptions::default(),
        )
        .await
        .unwrap();

    let converter = Converter::default();
    for (from, to) in [(&source, &tiff), (&tiff, &back)] {
        let summary = converter
            .convert(&ConversionRequest::new(from, to))
            .await
            .into_result()
            .unwrap();
        assert!(!summary.route.is_two_hop());
    }

    let reader = ContainerReader::open_path(&back).await.unwrap();
    assert_eq!(reader.read_level(0).await.unwrap(), tensor);
    assert!(reader.level_count() > 1);

    let stored = reader.metadata().unwrap();
    assert_eq!(stored.physical_size, meta.physical_size);
    assert_eq!(stored.physical_size.unit, "µm");
    assert_eq!(stored.channel_names, meta.channel_names);

    let report = validate_path(&back, true).await;
    assert!(report.is_valid(), "{:?}", report.issues);
}
