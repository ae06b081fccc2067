use chrono::NaiveDate;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;

/// Pixel values are carried as f64 in memory and coerced to the band's
/// declared [`DataType`] when written.
pub type Pixel = f64;

/// 2D raster array (rows x cols)
pub type RasterImage = Array2<Pixel>;

/// 2D boolean mask (rows x cols)
pub type MaskImage = Array2<bool>;

/// Band name of the per-pixel dataset provenance raster
pub const DATASOURCE_NAME: &str = "DATASOURCE";
/// Band name of the day-of-year provenance raster
pub const PROVENANCE_NAME: &str = "PROVENANCE";
/// Band name of the clear observation count raster
pub const CLEAR_OBSERVATION_NAME: &str = "CLEAROB";
/// Band name of the total observation count raster
pub const TOTAL_OBSERVATION_NAME: &str = "TOTALOB";

pub const PROVENANCE_NODATA: Pixel = -1.0;
pub const DATASOURCE_NODATA: Pixel = 255.0;

/// Bands generated by the engine itself. They never feed nodata reconciliation.
pub const DERIVED_BAND_NAMES: [&str; 7] = [
    DATASOURCE_NAME,
    "ndvi",
    "evi",
    "cnc",
    TOTAL_OBSERVATION_NAME,
    CLEAR_OBSERVATION_NAME,
    PROVENANCE_NAME,
];

/// Returns true when `band` is an engine generated band (case-insensitive).
pub fn is_derived_band(band: &str) -> bool {
    DERIVED_BAND_NAMES
        .iter()
        .any(|name| name.eq_ignore_ascii_case(band))
}

/// Storage data type of a raster band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[serde(alias = "byte")]
    UInt8,
    UInt16,
    Int16,
    UInt32,
    Int32,
    Float32,
    Float64,
}

impl DataType {
    pub fn from_name(name: &str) -> CubeResult<Self> {
        match name.to_lowercase().as_str() {
            "uint8" | "byte" => Ok(DataType::UInt8),
            "uint16" => Ok(DataType::UInt16),
            "int16" => Ok(DataType::Int16),
            "uint32" => Ok(DataType::UInt32),
            "int32" => Ok(DataType::Int32),
            "float32" => Ok(DataType::Float32),
            "float64" => Ok(DataType::Float64),
            other => Err(CubeError::Configuration(format!(
                "Unsupported data type: {}",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataType::UInt8 => "uint8",
            DataType::UInt16 => "uint16",
            DataType::Int16 => "int16",
            DataType::UInt32 => "uint32",
            DataType::Int32 => "int32",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
        }
    }

    pub fn is_integer(&self) -> bool {
        !matches!(self, DataType::Float32 | DataType::Float64)
    }

    /// Representable value range
    pub fn range(&self) -> (Pixel, Pixel) {
        match self {
            DataType::UInt8 => (u8::MIN as f64, u8::MAX as f64),
            DataType::UInt16 => (u16::MIN as f64, u16::MAX as f64),
            DataType::Int16 => (i16::MIN as f64, i16::MAX as f64),
            DataType::UInt32 => (u32::MIN as f64, u32::MAX as f64),
            DataType::Int32 => (i32::MIN as f64, i32::MAX as f64),
            DataType::Float32 => (f32::MIN as f64, f32::MAX as f64),
            DataType::Float64 => (f64::MIN, f64::MAX),
        }
    }

    /// Cast a value the way a storage cast does: integer types truncate
    /// toward zero and saturate at the type bounds.
    pub fn coerce(&self, value: Pixel) -> Pixel {
        match self {
            DataType::Float64 => value,
            DataType::Float32 => value as f32 as f64,
            _ => {
                if value.is_nan() {
                    return 0.0;
                }
                let (min, max) = self.range();
                value.trunc().clamp(min, max)
            }
        }
    }

    /// Smallest unsigned type able to hold `entries` codes plus a reserved nodata code.
    pub fn for_code_count(entries: usize) -> (DataType, Pixel) {
        if entries < u8::MAX as usize {
            (DataType::UInt8, DATASOURCE_NODATA)
        } else {
            (DataType::UInt16, u16::MAX as f64)
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Geospatial transformation parameters (GDAL ordering)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform anchored at the upper-left corner
    pub fn north_up(xmin: f64, ymax: f64, resx: f64, resy: f64) -> Self {
        Self {
            top_left_x: xmin,
            pixel_width: resx,
            rotation_x: 0.0,
            top_left_y: ymax,
            rotation_y: 0.0,
            pixel_height: -resy.abs(),
        }
    }

    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    pub fn is_north_up(&self) -> bool {
        self.rotation_x == 0.0 && self.rotation_y == 0.0
    }

    /// Map coordinates of a pixel centre
    pub fn pixel_center(&self, col: usize, row: usize) -> (f64, f64) {
        let c = col as f64 + 0.5;
        let r = row as f64 + 0.5;
        (
            self.top_left_x + c * self.pixel_width + r * self.rotation_x,
            self.top_left_y + c * self.rotation_y + r * self.pixel_height,
        )
    }

    /// Fractional pixel coordinates (col, row) of a map position.
    /// Only valid for north-up transforms.
    pub fn to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.top_left_x) / self.pixel_width,
            (y - self.top_left_y) / self.pixel_height,
        )
    }
}

/// Geospatial bounding box in the raster CRS
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

/// Rectangular pixel window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Window {
    pub col_off: usize,
    pub row_off: usize,
    pub width: usize,
    pub height: usize,
}

impl Window {
    pub fn new(col_off: usize, row_off: usize, width: usize, height: usize) -> Self {
        Self {
            col_off,
            row_off,
            width,
            height,
        }
    }

    pub fn full(width: usize, height: usize) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn rows(&self) -> Range<usize> {
        self.row_off..self.row_off + self.height
    }

    pub fn cols(&self) -> Range<usize> {
        self.col_off..self.col_off + self.width
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }
}

/// Row-major block windows covering a `width` x `height` raster exactly once.
/// Edge blocks are clipped to the raster.
pub fn block_windows(width: usize, height: usize, block_size: (usize, usize)) -> Vec<Window> {
    let (block_w, block_h) = (block_size.0.max(1), block_size.1.max(1));
    let mut windows = Vec::new();

    for row_off in (0..height).step_by(block_h) {
        for col_off in (0..width).step_by(block_w) {
            windows.push(Window::new(
                col_off,
                row_off,
                block_w.min(width - col_off),
                block_h.min(height - row_off),
            ));
        }
    }

    windows
}

/// Everything needed to create a raster, and everything a store reports
/// about an existing one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterProfile {
    pub width: usize,
    pub height: usize,
    pub dtype: DataType,
    pub nodata: Option<Pixel>,
    pub transform: GeoTransform,
    /// WKT, PROJ string or `EPSG:<code>`
    pub crs: String,
    pub block_size: (usize, usize),
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl RasterProfile {
    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    pub fn with_dtype(mut self, dtype: DataType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn with_nodata(mut self, nodata: Option<Pixel>) -> Self {
        self.nodata = nodata;
        self
    }

    pub fn with_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn windows(&self) -> Vec<Window> {
        block_windows(self.width, self.height, self.block_size)
    }
}

/// Band definition of a data cube
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandSpec {
    pub name: String,
    pub nodata: Pixel,
    pub dtype: DataType,
    /// Target scale of rescaled values (e.g. 0.0001)
    #[serde(default)]
    pub scale: Option<f64>,
    #[serde(default)]
    pub scale_add: Option<f64>,
    #[serde(default)]
    pub min_value: Option<Pixel>,
    #[serde(default)]
    pub max_value: Option<Pixel>,
}

impl BandSpec {
    pub fn new(name: &str, nodata: Pixel, dtype: DataType) -> Self {
        Self {
            name: name.to_string(),
            nodata,
            dtype,
            scale: None,
            scale_add: None,
            min_value: None,
            max_value: None,
        }
    }

    pub fn valid_range(&self) -> Option<(Pixel, Pixel)> {
        match (self.min_value, self.max_value) {
            (Some(min), Some(max)) => Some((min, max)),
            _ => None,
        }
    }
}

/// Cube period: a single date for identity cubes, start/end for composites
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Period {
    pub start: NaiveDate,
    pub end: Option<NaiveDate>,
}

impl Period {
    pub fn single(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: None,
        }
    }

    pub fn range(start: NaiveDate, end: NaiveDate) -> CubeResult<Self> {
        if end < start {
            return Err(CubeError::Configuration(format!(
                "Period end {} is before start {}",
                end, start
            )));
        }
        Ok(Self {
            start,
            end: Some(end),
        })
    }

    /// Parse `YYYY-MM-DD` or `YYYY-MM-DD_YYYY-MM-DD`
    pub fn parse(value: &str) -> CubeResult<Self> {
        let parse_date = |s: &str| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map_err(|e| CubeError::InvalidFormat(format!("Invalid period '{}': {}", value, e)))
        };

        match value.split_once('_') {
            Some((start, end)) => Self::range(parse_date(start)?, parse_date(end)?),
            None => Ok(Self::single(parse_date(value)?)),
        }
    }

    /// Start date as `YYYYMMDD`
    pub fn start_compact(&self) -> String {
        self.start.format("%Y%m%d").to_string()
    }

    /// `YYYYMMDD`, or `YYYYMMDD_YYYYMMDD` for a range
    pub fn compact(&self) -> String {
        match self.end {
            Some(end) => format!("{}_{}", self.start_compact(), end.format("%Y%m%d")),
            None => self.start_compact(),
        }
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.end {
            Some(end) => write!(f, "{}_{}", self.start.format("%Y-%m-%d"), end.format("%Y-%m-%d")),
            None => write!(f, "{}", self.start.format("%Y-%m-%d")),
        }
    }
}

/// Error types for data cube processing
#[derive(Debug, thiserror::Error)]
pub enum CubeError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    #[error("Access denied: {0}")]
    Access(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Processing error: {0}")]
    Processing(String),
}

impl CubeError {
    /// Whether the caller may retry the failed unit of work as-is.
    pub fn is_retryable(&self) -> bool {
        match self {
            CubeError::TransientIo(_) => true,
            CubeError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for CubeError {
    fn from(e: serde_json::Error) -> Self {
        CubeError::InvalidFormat(e.to_string())
    }
}

/// Result type for data cube operations
pub type CubeResult<T> = Result<T, CubeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_windows_cover_raster() {
        let windows = block_windows(5, 3, (2, 2));
        assert_eq!(windows.len(), 6);
        assert_eq!(windows[2], Window::new(4, 0, 1, 2));
        assert_eq!(windows[5], Window::new(4, 2, 1, 1));

        let covered: usize = windows.iter().map(|w| w.width * w.height).sum();
        assert_eq!(covered, 15);
    }

    #[test]
    fn test_coerce_truncates_and_saturates() {
        assert_eq!(DataType::UInt16.coerce(2904.35), 2904.0);
        assert_eq!(DataType::Int16.coerce(-3.9), -3.0);
        assert_eq!(DataType::UInt8.coerce(300.0), 255.0);
        assert_eq!(DataType::UInt16.coerce(-5.0), 0.0);
        assert_eq!(DataType::Float64.coerce(1.25), 1.25);
    }

    #[test]
    fn test_period_parsing() {
        let period = Period::parse("2020-01-01_2020-01-16").unwrap();
        assert_eq!(period.start_compact(), "20200101");
        assert_eq!(period.compact(), "20200101_20200116");
        assert_eq!(period.to_string(), "2020-01-01_2020-01-16");

        let single = Period::parse("2020-02-29").unwrap();
        assert!(single.end.is_none());

        assert!(Period::parse("2020-01-16_2020-01-01").is_err());
        assert!(Period::parse("20200101").is_err());
    }

    #[test]
    fn test_geotransform_pixel_roundtrip() {
        let gt = GeoTransform::north_up(1000.0, 2000.0, 30.0, 30.0);
        let (x, y) = gt.pixel_center(2, 3);
        assert_eq!((x, y), (1075.0, 1895.0));
        let (col, row) = gt.to_pixel(x, y);
        assert_eq!((col, row), (2.5, 3.5));
    }

    #[test]
    fn test_retryable_errors() {
        assert!(CubeError::TransientIo("refused".into()).is_retryable());
        assert!(!CubeError::Configuration("nodata".into()).is_retryable());
        assert!(!CubeError::Access("403".into()).is_retryable());
    }
}
