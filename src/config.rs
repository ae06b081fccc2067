//! Engine configuration.

use crate::types::{CubeError, CubeResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Configuration shared by merge, blend and publishing steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory for intermediate (not yet published) rasters
    pub work_dir: PathBuf,
    /// Directory of published rasters
    pub data_dir: PathBuf,
    /// Square block size of written rasters
    pub block_size: usize,
    /// GeoTIFF compression codec
    pub compression: String,
    /// Extra GDAL configuration options applied on every raster access
    #[serde(default)]
    pub gdal_options: BTreeMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let base = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("datacube");

        Self {
            work_dir: base.join("work"),
            data_dir: base.join("data"),
            block_size: 512,
            compression: "DEFLATE".to_string(),
            gdal_options: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> CubeResult<Self> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("WORK_DIR") {
            config.work_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("DATA_DIR") {
            config.data_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("BLOCK_SIZE") {
            config.block_size = val.parse().map_err(|_| {
                CubeError::Configuration(format!("BLOCK_SIZE must be an integer, got '{}'", val))
            })?;
        }

        if let Ok(val) = std::env::var("COMPRESS") {
            config.compression = val.to_uppercase();
        }

        if let Ok(val) = std::env::var("GDAL_OPTIONS") {
            config.gdal_options = serde_json::from_str(&val)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> CubeResult<()> {
        if self.block_size == 0 {
            return Err(CubeError::Configuration(
                "block_size must be greater than zero".to_string(),
            ));
        }

        if self.work_dir == self.data_dir {
            return Err(CubeError::Configuration(format!(
                "work_dir and data_dir must differ ({})",
                self.work_dir.display()
            )));
        }

        Ok(())
    }

    pub fn block_shape(&self) -> (usize, usize) {
        (self.block_size, self.block_size)
    }
}
