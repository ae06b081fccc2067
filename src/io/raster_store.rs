use crate::types::{CubeError, CubeResult, RasterImage, RasterProfile, Window};
use ndarray::s;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Raster persistence used by the merge and compositing engine.
///
/// Implementations must allow concurrent reads of distinct files. Writes to
/// a single path are never issued concurrently by the engine.
pub trait RasterStore: Send + Sync {
    /// Geometry, data type and nodata of an existing raster
    fn info(&self, path: &Path) -> CubeResult<RasterProfile>;

    /// Read a rectangular window of band 1
    fn read_window(&self, path: &Path, window: Window) -> CubeResult<RasterImage>;

    /// Create (or replace) a single band raster
    fn write(&self, path: &Path, data: &RasterImage, profile: &RasterProfile) -> CubeResult<()>;

    fn exists(&self, path: &Path) -> bool;

    /// Read the whole of band 1
    fn read(&self, path: &Path) -> CubeResult<RasterImage> {
        let info = self.info(path)?;
        self.read_window(path, Window::full(info.width, info.height))
    }
}

pub(crate) fn check_window(size: (usize, usize), window: &Window, path: &Path) -> CubeResult<()> {
    let (width, height) = size;
    if window.col_off + window.width > width || window.row_off + window.height > height {
        return Err(CubeError::Processing(format!(
            "Window {:?} is outside raster {} ({}x{})",
            window,
            path.display(),
            width,
            height
        )));
    }
    Ok(())
}

pub(crate) fn check_shape(profile: &RasterProfile, data: &RasterImage, path: &Path) -> CubeResult<()> {
    if data.dim() != profile.shape() {
        return Err(CubeError::Configuration(format!(
            "Raster {} has shape {:?} but its profile declares {:?}",
            path.display(),
            data.dim(),
            profile.shape()
        )));
    }
    Ok(())
}

struct StoredRaster {
    data: RasterImage,
    profile: RasterProfile,
}

/// In-process raster store keyed by path.
///
/// Values are coerced to the profile data type on write so readers observe
/// the same pixels a file-backed store would return.
#[derive(Default)]
pub struct MemoryRasterStore {
    rasters: RwLock<HashMap<PathBuf, StoredRaster>>,
}

impl MemoryRasterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rasters.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> CubeError {
        CubeError::Processing("Memory raster store lock poisoned".to_string())
    }

    fn not_found(path: &Path) -> CubeError {
        CubeError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("No raster at {}", path.display()),
        ))
    }
}

impl RasterStore for MemoryRasterStore {
    fn info(&self, path: &Path) -> CubeResult<RasterProfile> {
        let rasters = self.rasters.read().map_err(|_| Self::poisoned())?;
        rasters
            .get(path)
            .map(|stored| stored.profile.clone())
            .ok_or_else(|| Self::not_found(path))
    }

    fn read_window(&self, path: &Path, window: Window) -> CubeResult<RasterImage> {
        let rasters = self.rasters.read().map_err(|_| Self::poisoned())?;
        let stored = rasters.get(path).ok_or_else(|| Self::not_found(path))?;
        check_window((stored.profile.width, stored.profile.height), &window, path)?;

        Ok(stored
            .data
            .slice(s![window.rows(), window.cols()])
            .to_owned())
    }

    fn write(&self, path: &Path, data: &RasterImage, profile: &RasterProfile) -> CubeResult<()> {
        check_shape(profile, data, path)?;

        let dtype = profile.dtype;
        let stored = StoredRaster {
            data: data.mapv(|v| dtype.coerce(v)),
            profile: profile.clone(),
        };

        log::debug!("Storing {}x{} raster at {}", profile.width, profile.height, path.display());

        let mut rasters = self.rasters.write().map_err(|_| Self::poisoned())?;
        rasters.insert(path.to_path_buf(), stored);
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.rasters
            .read()
            .map(|rasters| rasters.contains_key(path))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataType, GeoTransform};
    use ndarray::Array2;
    use std::collections::BTreeMap;

    fn profile(width: usize, height: usize) -> RasterProfile {
        RasterProfile {
            width,
            height,
            dtype: DataType::Int16,
            nodata: Some(-9999.0),
            transform: GeoTransform::north_up(0.0, 100.0, 10.0, 10.0),
            crs: "EPSG:4326".to_string(),
            block_size: (2, 2),
            tags: BTreeMap::new(),
        }
    }

    #[test]
    fn test_memory_store_window_read() {
        let store = MemoryRasterStore::new();
        let path = Path::new("/tmp/raster.tif");
        let data = Array2::from_shape_fn((3, 4), |(r, c)| (r * 10 + c) as f64);

        store.write(path, &data, &profile(4, 3)).unwrap();
        assert!(store.exists(path));

        let block = store.read_window(path, Window::new(1, 1, 2, 2)).unwrap();
        assert_eq!(block, Array2::from_shape_vec((2, 2), vec![11.0, 12.0, 21.0, 22.0]).unwrap());

        assert!(store.read_window(path, Window::new(3, 0, 2, 1)).is_err());
    }

    #[test]
    fn test_memory_store_coerces_on_write() {
        let store = MemoryRasterStore::new();
        let path = Path::new("/tmp/coerced.tif");
        let data = Array2::from_elem((1, 2), 40000.7);

        store.write(path, &data, &profile(2, 1)).unwrap();
        let read = store.read(path).unwrap();
        assert_eq!(read[[0, 0]], i16::MAX as f64);
    }

    #[test]
    fn test_memory_store_rejects_shape_mismatch() {
        let store = MemoryRasterStore::new();
        let data = Array2::zeros((2, 2));
        let result = store.write(Path::new("/tmp/bad.tif"), &data, &profile(3, 2));
        assert!(matches!(result, Err(CubeError::Configuration(_))));
    }

    #[test]
    fn test_missing_raster_is_io_error() {
        let store = MemoryRasterStore::new();
        assert!(matches!(store.info(Path::new("/nope.tif")), Err(CubeError::Io(_))));
    }
}
