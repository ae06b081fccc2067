//! I/O modules for raster persistence, remote assets and cube paths

pub mod raster_store;
pub mod gdal_store;
pub mod remote;
pub mod cube_path;

pub use raster_store::{MemoryRasterStore, RasterStore};
pub use gdal_store::GdalRasterStore;
pub use remote::{check_access, AccessTokenScope};
pub use cube_path::{CubeKey, CubePaths};
