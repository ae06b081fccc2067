use crate::config::EngineConfig;
use crate::io::raster_store::{check_shape, check_window, RasterStore};
use crate::types::{
    CubeError, CubeResult, DataType, GeoTransform, RasterImage, RasterProfile, Window,
};
use gdal::raster::{GdalDataType, GdalType, RasterCreationOption};
use gdal::spatial_ref::SpatialRef;
use gdal::{Dataset, DriverManager, Metadata};
use ndarray::Array2;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// GeoTIFF backed raster store.
///
/// Written rasters are tiled and compressed so the external COG finalize
/// step only has to add overviews and reorder the IFDs.
pub struct GdalRasterStore {
    compression: String,
    block_size: usize,
}

impl GdalRasterStore {
    pub fn new(config: &EngineConfig) -> CubeResult<Self> {
        for (key, value) in &config.gdal_options {
            gdal::config::set_config_option(key, value)?;
        }

        Ok(Self {
            compression: config.compression.clone(),
            block_size: config.block_size,
        })
    }

    /// Remote assets are read through GDAL's curl virtual file system
    fn gdal_path(path: &Path) -> PathBuf {
        let raw = path.to_string_lossy();
        if raw.starts_with("http://") || raw.starts_with("https://") {
            PathBuf::from(format!("/vsicurl/{}", raw))
        } else {
            path.to_path_buf()
        }
    }

    fn open(path: &Path) -> CubeResult<Dataset> {
        let dataset = Dataset::open(Self::gdal_path(path)).map_err(|e| {
            if path.to_string_lossy().starts_with("http") {
                CubeError::TransientIo(format!("Failed to open {}: {}", path.display(), e))
            } else {
                CubeError::Gdal(e)
            }
        })?;
        Ok(dataset)
    }

    fn data_type(dataset: &Dataset) -> CubeResult<DataType> {
        let band = dataset.rasterband(1)?;
        match band.band_type() {
            GdalDataType::UInt8 => Ok(DataType::UInt8),
            GdalDataType::UInt16 => Ok(DataType::UInt16),
            GdalDataType::Int16 => Ok(DataType::Int16),
            GdalDataType::UInt32 => Ok(DataType::UInt32),
            GdalDataType::Int32 => Ok(DataType::Int32),
            GdalDataType::Float32 => Ok(DataType::Float32),
            GdalDataType::Float64 => Ok(DataType::Float64),
            other => Err(CubeError::InvalidFormat(format!(
                "Unsupported GDAL data type {:?}",
                other
            ))),
        }
    }

    fn tags(dataset: &Dataset) -> BTreeMap<String, String> {
        dataset
            .metadata_domain("")
            .unwrap_or_default()
            .into_iter()
            .filter_map(|entry| {
                entry
                    .split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect()
    }

    fn write_typed<T>(&self, path: &Path, data: &RasterImage, profile: &RasterProfile) -> CubeResult<()>
    where
        T: GdalType + Copy + num_traits::NumCast,
    {
        // GTiff tiles must be multiples of 16
        let block = if profile.block_size.0 % 16 == 0 && profile.block_size.0 > 0 {
            profile.block_size.0
        } else {
            self.block_size
        }
        .to_string();
        let options = [
            RasterCreationOption { key: "TILED", value: "YES" },
            RasterCreationOption { key: "COMPRESS", value: &self.compression },
            RasterCreationOption { key: "BLOCKXSIZE", value: &block },
            RasterCreationOption { key: "BLOCKYSIZE", value: &block },
            RasterCreationOption { key: "INTERLEAVE", value: "PIXEL" },
        ];

        let driver = DriverManager::get_driver_by_name("GTiff")?;
        let mut dataset = driver.create_with_band_type_with_options::<T, _>(
            path,
            profile.width as _,
            profile.height as _,
            1,
            &options,
        )?;

        dataset.set_geo_transform(&profile.transform.to_gdal())?;
        if !profile.crs.is_empty() {
            dataset.set_spatial_ref(&SpatialRef::from_definition(&profile.crs)?)?;
        }
        for (key, value) in &profile.tags {
            dataset.set_metadata_item(key, value, "")?;
        }

        let dtype = profile.dtype;
        let values = data
            .iter()
            .map(|&v| {
                num_traits::cast::<f64, T>(dtype.coerce(v)).ok_or_else(|| {
                    CubeError::Processing(format!("Value {} does not fit {}", v, dtype))
                })
            })
            .collect::<CubeResult<Vec<T>>>()?;

        let mut rasterband = dataset.rasterband(1)?;
        if let Some(nodata) = profile.nodata {
            rasterband.set_no_data_value(Some(nodata))?;
        }

        let buffer = gdal::raster::Buffer::new((profile.width, profile.height), values);
        rasterband.write((0, 0), (profile.width, profile.height), &buffer)?;

        Ok(())
    }
}

impl RasterStore for GdalRasterStore {
    fn info(&self, path: &Path) -> CubeResult<RasterProfile> {
        let dataset = Self::open(path)?;
        let (width, height) = dataset.raster_size();
        let rasterband = dataset.rasterband(1)?;

        Ok(RasterProfile {
            width,
            height,
            dtype: Self::data_type(&dataset)?,
            nodata: rasterband.no_data_value(),
            transform: GeoTransform::from_gdal(dataset.geo_transform()?),
            crs: dataset.projection(),
            block_size: rasterband.block_size(),
            tags: Self::tags(&dataset),
        })
    }

    fn read_window(&self, path: &Path, window: Window) -> CubeResult<RasterImage> {
        let dataset = Self::open(path)?;
        let (width, height) = dataset.raster_size();
        let rasterband = dataset.rasterband(1)?;

        check_window((width, height), &window, path)?;

        log::debug!("Reading window {:?} of {}", window, path.display());

        let buffer = rasterband.read_as::<f64>(
            (window.col_off as _, window.row_off as _),
            (window.width, window.height),
            (window.width, window.height),
            None,
        )?;

        Array2::from_shape_vec(window.shape(), buffer.data)
            .map_err(|e| CubeError::Processing(format!("Failed to reshape raster window: {}", e)))
    }

    fn write(&self, path: &Path, data: &RasterImage, profile: &RasterProfile) -> CubeResult<()> {
        check_shape(profile, data, path)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        log::info!("Saving {} raster: {}", profile.dtype, path.display());

        match profile.dtype {
            DataType::UInt8 => self.write_typed::<u8>(path, data, profile),
            DataType::UInt16 => self.write_typed::<u16>(path, data, profile),
            DataType::Int16 => self.write_typed::<i16>(path, data, profile),
            DataType::UInt32 => self.write_typed::<u32>(path, data, profile),
            DataType::Int32 => self.write_typed::<i32>(path, data, profile),
            DataType::Float32 => self.write_typed::<f32>(path, data, profile),
            DataType::Float64 => self.write_typed::<f64>(path, data, profile),
        }
    }

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }
}
