use datacube::core::merge::{MergeEngine, MergeRequest, SourceAsset};
use datacube::core::quality_mask::QualityMaskSpec;
use datacube::core::warp::{GridSpec, Resampling};
use datacube::io::{MemoryRasterStore, RasterStore};
use datacube::types::{BandSpec, BoundingBox, DataType, GeoTransform, RasterProfile, DATASOURCE_NAME};
use datacube::EngineConfig;
use ndarray::Array2;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const CRS: &str = "EPSG:32723";

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn source_profile(dtype: DataType, nodata: f64) -> RasterProfile {
    RasterProfile {
        width: 4,
        height: 4,
        dtype,
        nodata: Some(nodata),
        transform: GeoTransform::north_up(0.0, 120.0, 30.0, 30.0),
        crs: CRS.to_string(),
        block_size: (2, 2),
        tags: BTreeMap::new(),
    }
}

fn tile_grid() -> GridSpec {
    GridSpec {
        bounds: Some(BoundingBox {
            min_x: 0.0,
            min_y: 0.0,
            max_x: 120.0,
            max_y: 120.0,
        }),
        crs: CRS.to_string(),
        resolution: (30.0, 30.0),
        ..GridSpec::default()
    }
}

fn mask() -> QualityMaskSpec {
    QualityMaskSpec::categorical(&[0, 1], &[2, 3, 4], Some(255.0)).expect("valid mask")
}

fn asset(link: &str, dataset: &str) -> SourceAsset {
    SourceAsset {
        link: link.to_string(),
        dataset: dataset.to_string(),
        platform: None,
        nodata: None,
    }
}

fn request(band: BandSpec, assets: Vec<SourceAsset>, output: &str) -> MergeRequest {
    MergeRequest {
        assets,
        band,
        quality_band: "SCL".to_string(),
        mask: mask(),
        grid: tile_grid(),
        resampling: Some(Resampling::Nearest),
        datasets: Vec::new(),
        platforms: Vec::new(),
        combined: false,
        build_provenance: false,
        rescale: false,
        scale_override: None,
        token: None,
        output: PathBuf::from(output),
    }
}

fn nir() -> BandSpec {
    BandSpec::new("nir", -9999.0, DataType::Int16)
}

#[test]
fn test_merge_is_deterministic() {
    init_logging();
    let store = MemoryRasterStore::new();
    let config = EngineConfig::default();

    let first = Array2::from_shape_fn((4, 4), |(r, c)| (r * 100 + c * 10) as f64);
    let mut second = Array2::from_elem((4, 4), 777.0);
    second[[0, 0]] = -9999.0;
    store.write(Path::new("/mem/a/nir.tif"), &first, &source_profile(DataType::Int16, -9999.0)).unwrap();
    store.write(Path::new("/mem/b/nir.tif"), &second, &source_profile(DataType::Int16, -9999.0)).unwrap();

    let assets = vec![asset("/mem/a/nir.tif", "S2_L2A-1"), asset("/mem/b/nir.tif", "S2_L2A-1")];
    let engine = MergeEngine::new(&store, &config);

    let one = engine.merge(&request(nir(), assets.clone(), "/cube/one_nir.tif")).expect("merge");
    let two = engine.merge(&request(nir(), assets, "/cube/two_nir.tif")).expect("merge");

    let a = store.read(&one.file).unwrap();
    let b = store.read(&two.file).unwrap();
    assert_eq!(a, b);
    assert_eq!(store.info(&one.file).unwrap(), store.info(&two.file).unwrap());

    // single dataset: valid pixels of the later asset overwrite
    assert_eq!(a[[0, 0]], 0.0);
    assert_eq!(a[[3, 3]], 777.0);
    assert_eq!(one.resolution, 30.0);
    assert!(one.datasource.is_none());
}

#[test]
fn test_combined_collection_keeps_first_valid_value() {
    init_logging();
    let store = MemoryRasterStore::new();
    let config = EngineConfig::default();

    let mut sentinel = Array2::from_elem((4, 4), 100.0);
    sentinel[[0, 0]] = -9999.0;
    let landsat = Array2::from_elem((4, 4), 200.0);
    store.write(Path::new("/mem/s2/nir.tif"), &sentinel, &source_profile(DataType::Int16, -9999.0)).unwrap();
    store.write(Path::new("/mem/lc8/nir.tif"), &landsat, &source_profile(DataType::Int16, -9999.0)).unwrap();

    let mut merge = request(
        nir(),
        vec![asset("/mem/s2/nir.tif", "S2_L2A-1"), asset("/mem/lc8/nir.tif", "LC8_SR-1")],
        "/cube/combined_nir.tif",
    );
    merge.datasets = vec!["S2_L2A-1".to_string(), "LC8_SR-1".to_string()];

    let result = MergeEngine::new(&store, &config).merge(&merge).expect("merge");
    let merged = store.read(&result.file).unwrap();

    // only the gap of the first source is filled by the second one
    assert_eq!(merged[[0, 0]], 200.0);
    assert!(merged.iter().skip(1).all(|&v| v == 100.0));
    assert_eq!(result.dataset.as_deref(), Some("LC8_SR-1"));
}

#[test]
fn test_quality_merge_writes_dataset_provenance() {
    init_logging();
    let store = MemoryRasterStore::new();
    let config = EngineConfig::default();

    let mut sentinel = Array2::zeros((4, 4));
    sentinel[[0, 0]] = 255.0;
    sentinel[[3, 3]] = 3.0;
    let landsat = Array2::from_elem((4, 4), 1.0);
    store.write(Path::new("/mem/s2/scl.tif"), &sentinel, &source_profile(DataType::UInt8, 255.0)).unwrap();
    store.write(Path::new("/mem/lc8/scl.tif"), &landsat, &source_profile(DataType::UInt8, 255.0)).unwrap();

    let mut merge = request(
        BandSpec::new("SCL", 255.0, DataType::UInt8),
        vec![asset("/mem/s2/scl.tif", "S2_L2A-1"), asset("/mem/lc8/scl.tif", "LC8_SR-1")],
        "/cube/2020-01-10_SCL.tif",
    );
    merge.datasets = vec!["S2_L2A-1".to_string(), "LC8_SR-1".to_string()];
    merge.build_provenance = true;
    // quality bands are never interpolated
    merge.resampling = Some(Resampling::Bilinear);

    let result = MergeEngine::new(&store, &config).merge(&merge).expect("merge");

    // 15 clear pixels, one cloudy
    assert_eq!(result.efficacy, 93.75);
    assert_eq!(result.cloud_ratio, 6.25);
    assert_eq!(result.provenance_entries, vec!["S2_L2A-1", "LC8_SR-1"]);

    let datasource = result.datasource.expect("provenance raster");
    assert_eq!(datasource, PathBuf::from(format!("/cube/2020-01-10_{}.tif", DATASOURCE_NAME)));

    let codes = store.read(&datasource).unwrap();
    assert_eq!(codes[[0, 0]], 1.0);
    assert!(codes.iter().skip(1).all(|&c| c == 0.0));

    let info = store.info(&datasource).unwrap();
    assert_eq!(info.dtype, DataType::UInt8);
    assert_eq!(info.nodata, Some(255.0));
    assert_eq!(info.tags.get("S2_L2A-1").map(String::as_str), Some("0"));
    assert_eq!(info.tags.get("LC8_SR-1").map(String::as_str), Some("1"));
}

#[test]
fn test_merge_rescales_to_band_scale() {
    init_logging();
    let store = MemoryRasterStore::new();
    let config = EngineConfig::default();

    let mut raw = Array2::from_elem((4, 4), 17834.0);
    raw[[1, 1]] = 0.0;
    store.write(Path::new("/mem/lc9/nir.tif"), &raw, &source_profile(DataType::UInt16, 0.0)).unwrap();

    let mut band = BandSpec::new("nir", 0.0, DataType::UInt16);
    band.scale = Some(0.0001);
    let mut merge = request(band, vec![asset("/mem/lc9/nir.tif", "LC9_L2-1")], "/cube/lc9_nir.tif");
    merge.rescale = true;
    merge.scale_override = Some(datacube::core::rescale::ScaleOverride {
        mult: 0.0000275,
        add: Some(-0.2),
    });

    let result = MergeEngine::new(&store, &config).merge(&merge).expect("merge");
    let merged = store.read(&result.file).unwrap();

    assert_eq!(merged[[0, 0]], 2904.0);
    assert_eq!(merged[[1, 1]], 0.0);
    assert!(merged.iter().all(|&v| (0.0..=10000.0).contains(&v)));
}

#[test]
fn test_merge_explicit_shape_rejects_mismatched_asset() {
    let store = MemoryRasterStore::new();
    let config = EngineConfig::default();

    store
        .write(Path::new("/mem/a/nir.tif"), &Array2::zeros((4, 4)), &source_profile(DataType::Int16, -9999.0))
        .unwrap();

    let mut merge = request(nir(), vec![asset("/mem/a/nir.tif", "S2_L2A-1")], "/cube/shape_nir.tif");
    merge.grid.shape = Some((4, 4));
    let result = MergeEngine::new(&store, &config).merge(&merge).expect("merge");
    assert_eq!(store.read(&result.file).unwrap(), Array2::<f64>::zeros((4, 4)));

    merge.grid.shape = Some((2, 2));
    assert!(matches!(
        MergeEngine::new(&store, &config).merge(&merge),
        Err(datacube::CubeError::Configuration(_))
    ));
}

#[test]
fn test_merge_without_assets_fails() {
    let store = MemoryRasterStore::new();
    let config = EngineConfig::default();
    let merge = request(nir(), Vec::new(), "/cube/empty_nir.tif");

    assert!(MergeEngine::new(&store, &config).merge(&merge).is_err());
    assert!(store.is_empty());
}
