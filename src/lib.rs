//! datacube: merge and temporal compositing engine for satellite data cubes
//!
//! This library warps and mosaics the scenes of one tile and date into per-band
//! merges, then stacks a period's merges into best-pixel and median composites
//! while tracking per-pixel provenance and quality statistics.

pub mod types;
pub mod config;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use types::{
    BandSpec, CubeError, CubeResult, DataType, GeoTransform, MaskImage, Period, Pixel,
    RasterImage, RasterProfile, Window,
};

pub use config::EngineConfig;
pub use io::{CubeKey, CubePaths, GdalRasterStore, MemoryRasterStore, RasterStore};
pub use crate::core::{
    BlendActivity, CompositeFunction, MergeEngine, MergeRequest, MergeResult, QualityMaskSpec,
    TemporalCompositor,
};
