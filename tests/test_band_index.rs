use datacube::core::band_index::{generate_band_indexes, BandIndex};
use datacube::io::{CubeKey, CubePaths, MemoryRasterStore, RasterStore};
use datacube::types::{DataType, GeoTransform, Period, RasterProfile};
use chrono::NaiveDate;
use ndarray::array;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

fn profile() -> RasterProfile {
    RasterProfile {
        width: 4,
        height: 1,
        dtype: DataType::Int16,
        nodata: Some(-9999.0),
        transform: GeoTransform::north_up(0.0, 10.0, 10.0, 10.0),
        crs: "EPSG:32723".to_string(),
        block_size: (3, 3),
        tags: BTreeMap::new(),
    }
}

fn key() -> CubeKey {
    let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
    let end = NaiveDate::from_ymd_opt(2020, 1, 16).unwrap();
    CubeKey::new("S2_10_16D_STK", 1, "003004", Period::range(start, end).unwrap())
}

fn band_files(store: &MemoryRasterStore) -> BTreeMap<String, PathBuf> {
    let nir = array![[3000.0, 0.0, -9999.0, 5000.0]];
    let red = array![[1000.0, 0.0, 1000.0, 5000.0]];
    store.write(Path::new("/mem/nir.tif"), &nir, &profile()).unwrap();
    store.write(Path::new("/mem/red.tif"), &red, &profile()).unwrap();

    let mut files = BTreeMap::new();
    files.insert("NIR".to_string(), PathBuf::from("/mem/nir.tif"));
    files.insert("RED".to_string(), PathBuf::from("/mem/red.tif"));
    files
}

fn index(name: &str, expression: &str, dtype: DataType, nodata: f64) -> BandIndex {
    BandIndex {
        name: name.to_string(),
        expression: expression.to_string(),
        dtype,
        nodata,
    }
}

#[test]
fn test_ndvi_generation() {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = MemoryRasterStore::new();
    let paths = CubePaths::new("/data/cubes");
    let files = band_files(&store);

    let indexes = [index("NDVI", "10000. * (NIR - RED) / (NIR + RED)", DataType::Int16, -9999.0)];
    let generated = generate_band_indexes(&store, &indexes, &files, &paths, &key(), true).expect("indexes");

    let file = generated.get("NDVI").expect("NDVI file");
    assert_eq!(file, &paths.composite_file(&key(), "NDVI").unwrap());

    // nodata input and division by zero both give the index nodata
    let ndvi = store.read(file).unwrap();
    assert_eq!(ndvi, array![[5000.0, -9999.0, -9999.0, 0.0]]);
    assert_eq!(store.info(file).unwrap().nodata, Some(-9999.0));
}

#[test]
fn test_index_values_are_clamped_to_dtype() {
    let store = MemoryRasterStore::new();
    let paths = CubePaths::new("/data/cubes");
    let files = band_files(&store);

    let indexes = [index("SCALED", "NIR / 10 - 200", DataType::UInt8, 255.0)];
    let generated = generate_band_indexes(&store, &indexes, &files, &paths, &key(), false).expect("indexes");

    let scaled = store.read(&generated["SCALED"]).unwrap();
    assert_eq!(scaled, array![[100.0, 0.0, 255.0, 255.0]]);
    assert_eq!(store.info(&generated["SCALED"]).unwrap().dtype, DataType::UInt8);
}

#[test]
fn test_index_with_missing_band_is_skipped() {
    let store = MemoryRasterStore::new();
    let paths = CubePaths::new("/data/cubes");
    let files = band_files(&store);

    let indexes = [
        index("EVI", "2.5 * (NIR - RED) / (NIR + 6 * RED - 7.5 * BLUE + 1)", DataType::Int16, -9999.0),
        index("NDVI", "10000 * (NIR - RED) / (NIR + RED)", DataType::Int16, -9999.0),
    ];
    let generated = generate_band_indexes(&store, &indexes, &files, &paths, &key(), true).expect("indexes");

    assert_eq!(generated.keys().collect::<Vec<_>>(), vec!["NDVI"]);
}

#[test]
fn test_no_indexes_and_malformed_expressions() {
    let store = MemoryRasterStore::new();
    let paths = CubePaths::new("/data/cubes");
    let files = band_files(&store);

    let generated = generate_band_indexes(&store, &[], &files, &paths, &key(), true).unwrap();
    assert!(generated.is_empty());

    let broken = [index("NDVI", "(NIR - RED", DataType::Int16, -9999.0)];
    assert!(matches!(
        generate_band_indexes(&store, &broken, &files, &paths, &key(), true),
        Err(datacube::CubeError::InvalidFormat(_))
    ));
}
