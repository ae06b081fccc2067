//! Reprojection of source scenes onto the target grid of a tile.
//!
//! Target pixel centres are mapped into the source coordinate system and the
//! source raster is sampled there. Coordinate mapping runs sequentially (GDAL
//! transforms are not thread safe), sampling runs in parallel when the
//! `parallel` feature is enabled.

use crate::types::{
    BoundingBox, CubeError, CubeResult, DataType, GeoTransform, Pixel, RasterImage, RasterProfile,
};
use gdal::spatial_ref::{CoordTransform, SpatialRef};
use ndarray::{Array2, ArrayView2, Zip};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Resampling kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resampling {
    Nearest,
    Bilinear,
    Cubic,
}

impl Resampling {
    pub fn from_name(name: &str) -> CubeResult<Self> {
        match name.to_lowercase().as_str() {
            "nearest" => Ok(Resampling::Nearest),
            "bilinear" => Ok(Resampling::Bilinear),
            "cubic" => Ok(Resampling::Cubic),
            other => Err(CubeError::Configuration(format!(
                "Unknown resampling method: {}",
                other
            ))),
        }
    }
}

impl FromStr for Resampling {
    type Err = CubeError;

    fn from_str(s: &str) -> CubeResult<Self> {
        Self::from_name(s)
    }
}

/// Where the target grid geometry came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridSource {
    /// Sources are already on the grid and only read
    Shape,
    /// Tile geometry from the grid reference system
    Native,
    /// Bounding box and resolution arithmetic
    Bounds,
}

/// Geometry of a tile in its grid reference system
#[derive(Debug, Clone, PartialEq)]
pub struct TileGeometry {
    pub bounds: BoundingBox,
    pub crs: String,
}

/// Catalog lookup of native tile geometries
pub trait TileGeometryLookup: Send + Sync {
    fn tile_geometry(&self, tile_id: &str) -> CubeResult<Option<TileGeometry>>;
}

/// Grid request of a merge.
///
/// Exactly one source determines the grid: an explicit pixel shape wins over
/// the native tile geometry, which wins over bbox/resolution arithmetic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GridSpec {
    /// (rows, cols)
    #[serde(default)]
    pub shape: Option<(usize, usize)>,
    #[serde(default)]
    pub native_grid: bool,
    #[serde(default)]
    pub tile_id: Option<String>,
    #[serde(default)]
    pub bounds: Option<BoundingBox>,
    #[serde(default)]
    pub crs: String,
    pub resolution: (f64, f64),
}

/// Fully resolved output grid
#[derive(Debug, Clone, PartialEq)]
pub struct TargetGrid {
    pub width: usize,
    pub height: usize,
    pub transform: GeoTransform,
    pub crs: String,
    pub source: GridSource,
}

impl TargetGrid {
    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    pub fn profile(&self, dtype: DataType, nodata: Option<Pixel>, block_size: (usize, usize)) -> RasterProfile {
        RasterProfile {
            width: self.width,
            height: self.height,
            dtype,
            nodata,
            transform: self.transform,
            crs: self.crs.clone(),
            block_size,
            tags: Default::default(),
        }
    }
}

impl GridSpec {
    fn check_resolution(&self) -> CubeResult<(f64, f64)> {
        let (resx, resy) = self.resolution;
        if !(resx > 0.0 && resy > 0.0) {
            return Err(CubeError::Configuration(format!(
                "Invalid grid resolution ({}, {})",
                resx, resy
            )));
        }
        Ok((resx, resy))
    }

    /// Resolve the output grid.
    ///
    /// `reference` is the profile of the first source asset; it supplies the
    /// geometry when the grid is given as an explicit shape.
    pub fn resolve(
        &self,
        lookup: Option<&dyn TileGeometryLookup>,
        reference: Option<&RasterProfile>,
    ) -> CubeResult<TargetGrid> {
        if let Some((rows, cols)) = self.shape {
            let reference = reference.ok_or_else(|| {
                CubeError::Configuration("Explicit grid shape requires a source asset".to_string())
            })?;
            return Ok(TargetGrid {
                width: cols,
                height: rows,
                transform: reference.transform,
                crs: reference.crs.clone(),
                source: GridSource::Shape,
            });
        }

        let (resx, resy) = self.check_resolution()?;

        if self.native_grid {
            let tile_id = self.tile_id.as_deref().ok_or_else(|| {
                CubeError::Configuration("Native grid requested without a tile id".to_string())
            })?;
            let lookup = lookup.ok_or_else(|| {
                CubeError::Configuration(format!("No tile geometry lookup for tile {}", tile_id))
            })?;
            let geometry = lookup
                .tile_geometry(tile_id)?
                .ok_or_else(|| CubeError::Configuration(format!("Tile {} not found", tile_id)))?;

            let b = geometry.bounds;
            return Ok(TargetGrid {
                width: ((b.max_x - b.min_x) / resx) as usize,
                height: ((b.max_y - b.min_y) / resy) as usize,
                transform: GeoTransform::north_up(b.min_x, b.max_y, resx, resy),
                crs: geometry.crs,
                source: GridSource::Native,
            });
        }

        let b = self.bounds.ok_or_else(|| {
            CubeError::Configuration("Target grid has no shape, native tile or bounds".to_string())
        })?;
        let (dist_x, dist_y) = (b.max_x - b.min_x, b.max_y - b.min_y);
        let cols = (dist_x / resx).round() as usize;
        let rows = (dist_y / resy).round() as usize;
        if cols == 0 || rows == 0 {
            return Err(CubeError::Configuration(format!(
                "Bounds {:?} are smaller than one pixel",
                b
            )));
        }

        Ok(TargetGrid {
            width: cols,
            height: rows,
            transform: GeoTransform::north_up(b.min_x, b.max_y, dist_x / cols as f64, dist_y / rows as f64),
            crs: self.crs.clone(),
            source: GridSource::Bounds,
        })
    }
}

/// Maps target map coordinates into the source CRS, in place
pub trait CoordinateMapper {
    fn map(&self, xs: &mut [f64], ys: &mut [f64]) -> CubeResult<()>;
}

pub struct IdentityMapper;

impl CoordinateMapper for IdentityMapper {
    fn map(&self, _xs: &mut [f64], _ys: &mut [f64]) -> CubeResult<()> {
        Ok(())
    }
}

pub struct GdalMapper {
    transform: CoordTransform,
}

impl GdalMapper {
    pub fn new(from_crs: &str, to_crs: &str) -> CubeResult<Self> {
        let from = SpatialRef::from_definition(from_crs)?;
        let to = SpatialRef::from_definition(to_crs)?;
        // x/y (easting/northing, lon/lat) order regardless of authority axis order
        from.set_axis_mapping_strategy(gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER);
        to.set_axis_mapping_strategy(gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER);

        let transform = CoordTransform::new(&from, &to)?;
        Ok(Self { transform })
    }
}

impl CoordinateMapper for GdalMapper {
    fn map(&self, xs: &mut [f64], ys: &mut [f64]) -> CubeResult<()> {
        let mut zs = vec![0.0; xs.len()];
        self.transform.transform_coords(xs, ys, &mut zs)?;
        Ok(())
    }
}

/// Mapper from `target_crs` coordinates into `source_crs` coordinates
pub fn mapper_for(target_crs: &str, source_crs: &str) -> CubeResult<Box<dyn CoordinateMapper>> {
    if target_crs.is_empty() || source_crs.is_empty() || target_crs == source_crs {
        return Ok(Box::new(IdentityMapper));
    }
    Ok(Box::new(GdalMapper::new(target_crs, source_crs)?))
}

/// A source raster with its geometry
pub struct SourceRaster<'a> {
    pub data: ArrayView2<'a, Pixel>,
    pub transform: GeoTransform,
    pub crs: &'a str,
    pub nodata: Option<Pixel>,
}

impl SourceRaster<'_> {
    fn is_valid(&self, value: Pixel) -> bool {
        !value.is_nan() && self.nodata.map_or(true, |nodata| value != nodata)
    }

    fn value(&self, row: isize, col: isize) -> Option<Pixel> {
        let (height, width) = self.data.dim();
        if row < 0 || col < 0 || row as usize >= height || col as usize >= width {
            return None;
        }
        let value = self.data[[row as usize, col as usize]];
        self.is_valid(value).then_some(value)
    }

    /// Value at a clamped position, `None` when nodata
    fn clamped(&self, row: isize, col: isize) -> Option<Pixel> {
        let (height, width) = self.data.dim();
        let row = row.clamp(0, height as isize - 1);
        let col = col.clamp(0, width as isize - 1);
        self.value(row, col)
    }

    fn contains(&self, x: f64, y: f64) -> bool {
        let (height, width) = self.data.dim();
        x >= 0.0 && y >= 0.0 && x < width as f64 && y < height as f64
    }
}

/// Nearest source pixel; `x`/`y` are fractional pixel coordinates with
/// pixel `i` covering `[i, i + 1)`.
fn sample_nearest(source: &SourceRaster, x: f64, y: f64) -> Option<Pixel> {
    if !source.contains(x, y) {
        return None;
    }
    source.value(y.floor() as isize, x.floor() as isize)
}

/// Bilinear interpolation renormalised over the valid neighbours
fn sample_bilinear(source: &SourceRaster, x: f64, y: f64) -> Option<Pixel> {
    if !source.contains(x, y) {
        return None;
    }

    let u = x - 0.5;
    let v = y - 0.5;
    let c0 = u.floor() as isize;
    let r0 = v.floor() as isize;
    let fx = u - c0 as f64;
    let fy = v - r0 as f64;

    let neighbours = [
        (r0, c0, (1.0 - fx) * (1.0 - fy)),
        (r0, c0 + 1, fx * (1.0 - fy)),
        (r0 + 1, c0, (1.0 - fx) * fy),
        (r0 + 1, c0 + 1, fx * fy),
    ];

    let mut sum = 0.0;
    let mut weights = 0.0;
    for (row, col, weight) in neighbours {
        if weight <= 0.0 {
            continue;
        }
        if let Some(value) = source.clamped(row, col) {
            sum += value * weight;
            weights += weight;
        }
    }

    if weights > 0.0 {
        Some(sum / weights)
    } else {
        None
    }
}

/// 1D cubic interpolation using Catmull-Rom spline
fn cubic_1d(p0: f64, p1: f64, p2: f64, p3: f64, t: f64) -> f64 {
    let t2 = t * t;
    let t3 = t2 * t;

    let a = -0.5 * p0 + 1.5 * p1 - 1.5 * p2 + 0.5 * p3;
    let b = p0 - 2.5 * p1 + 2.0 * p2 - 0.5 * p3;
    let c = -0.5 * p0 + 0.5 * p2;

    a * t3 + b * t2 + c * t + p1
}

/// Bicubic interpolation over the 4x4 neighbourhood, bilinear near nodata
fn sample_cubic(source: &SourceRaster, x: f64, y: f64) -> Option<Pixel> {
    if !source.contains(x, y) {
        return None;
    }

    let u = x - 0.5;
    let v = y - 0.5;
    let c0 = u.floor() as isize;
    let r0 = v.floor() as isize;
    let fx = u - c0 as f64;
    let fy = v - r0 as f64;

    let mut rows = [0.0; 4];
    for (j, row_value) in rows.iter_mut().enumerate() {
        let row = r0 + j as isize - 1;
        let mut values = [0.0; 4];
        for (i, value) in values.iter_mut().enumerate() {
            match source.clamped(row, c0 + i as isize - 1) {
                Some(v) => *value = v,
                None => return sample_bilinear(source, x, y),
            }
        }
        *row_value = cubic_1d(values[0], values[1], values[2], values[3], fx);
    }

    Some(cubic_1d(rows[0], rows[1], rows[2], rows[3], fy))
}

fn sample(source: &SourceRaster, x: f64, y: f64, method: Resampling) -> Option<Pixel> {
    match method {
        Resampling::Nearest => sample_nearest(source, x, y),
        Resampling::Bilinear => sample_bilinear(source, x, y),
        Resampling::Cubic => sample_cubic(source, x, y),
    }
}

/// Source pixel coordinates of every target pixel centre
fn source_coordinates(source: &SourceRaster, grid: &TargetGrid) -> CubeResult<Array2<(f64, f64)>> {
    if !source.transform.is_north_up() {
        return Err(CubeError::Configuration(
            "Rotated source geotransforms are not supported".to_string(),
        ));
    }

    let mapper = mapper_for(&grid.crs, source.crs)?;
    let mut coords = Array2::from_elem(grid.shape(), (f64::NAN, f64::NAN));

    let mut xs = vec![0.0; grid.width];
    let mut ys = vec![0.0; grid.width];

    for (row, mut line) in coords.outer_iter_mut().enumerate() {
        for col in 0..grid.width {
            let (x, y) = grid.transform.pixel_center(col, row);
            xs[col] = x;
            ys[col] = y;
        }

        mapper.map(&mut xs, &mut ys)?;

        for (col, cell) in line.iter_mut().enumerate() {
            *cell = source.transform.to_pixel(xs[col], ys[col]);
        }
    }

    Ok(coords)
}

/// Resample `source` onto `grid`.
///
/// Samples outside the source or without valid neighbours become
/// `dst_nodata`. Integer outputs are rounded to the nearest value before
/// being coerced to `dtype`.
pub fn reproject(
    source: &SourceRaster,
    grid: &TargetGrid,
    dst_nodata: Pixel,
    method: Resampling,
    dtype: DataType,
) -> CubeResult<RasterImage> {
    log::debug!(
        "Reprojecting {:?} raster onto {}x{} grid ({:?})",
        source.data.dim(),
        grid.width,
        grid.height,
        method
    );

    let coords = source_coordinates(source, grid)?;

    let resample = |&(x, y): &(f64, f64)| match sample(source, x, y, method) {
        Some(value) if dtype.is_integer() => dtype.coerce(value.round()),
        Some(value) => dtype.coerce(value),
        None => dst_nodata,
    };

    #[cfg(feature = "parallel")]
    let output = Zip::from(&coords).par_map_collect(resample);

    #[cfg(not(feature = "parallel"))]
    let output = Zip::from(&coords).map_collect(resample);

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    struct FixedTiles;

    impl TileGeometryLookup for FixedTiles {
        fn tile_geometry(&self, tile_id: &str) -> CubeResult<Option<TileGeometry>> {
            Ok((tile_id == "003004").then(|| TileGeometry {
                bounds: BoundingBox {
                    min_x: 0.0,
                    min_y: 0.0,
                    max_x: 95.0,
                    max_y: 60.0,
                },
                crs: "EPSG:32723".to_string(),
            }))
        }
    }

    fn bounds_spec() -> GridSpec {
        GridSpec {
            bounds: Some(BoundingBox {
                min_x: 0.0,
                min_y: 0.0,
                max_x: 100.0,
                max_y: 50.0,
            }),
            crs: "EPSG:32723".to_string(),
            resolution: (30.0, 30.0),
            ..GridSpec::default()
        }
    }

    #[test]
    fn test_bounds_grid_adjusts_resolution() {
        let grid = bounds_spec().resolve(None, None).unwrap();
        assert_eq!(grid.source, GridSource::Bounds);
        assert_eq!((grid.width, grid.height), (3, 2));
        assert_abs_diff_eq!(grid.transform.pixel_width, 100.0 / 3.0);
        assert_abs_diff_eq!(grid.transform.pixel_height, -25.0);
    }

    #[test]
    fn test_grid_precedence() {
        let mut spec = bounds_spec();
        spec.native_grid = true;
        spec.tile_id = Some("003004".to_string());

        let native = spec.resolve(Some(&FixedTiles), None).unwrap();
        assert_eq!(native.source, GridSource::Native);
        assert_eq!((native.width, native.height), (3, 2));

        let reference = native.profile(DataType::Int16, Some(-9999.0), (16, 16));
        spec.shape = Some((7, 5));
        let shaped = spec.resolve(Some(&FixedTiles), Some(&reference)).unwrap();
        assert_eq!(shaped.source, GridSource::Shape);
        assert_eq!(shaped.shape(), (7, 5));
    }

    #[test]
    fn test_unknown_tile_is_configuration_error() {
        let mut spec = bounds_spec();
        spec.native_grid = true;
        spec.tile_id = Some("999999".to_string());
        assert!(matches!(
            spec.resolve(Some(&FixedTiles), None),
            Err(CubeError::Configuration(_))
        ));
    }

    #[test]
    fn test_resampling_names() {
        assert_eq!("Bilinear".parse::<Resampling>().unwrap(), Resampling::Bilinear);
        assert!(Resampling::from_name("lanczos").is_err());
    }

    #[test]
    fn test_identity_reprojection_is_lossless() {
        let data = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let transform = GeoTransform::north_up(0.0, 20.0, 10.0, 10.0);
        let source = SourceRaster {
            data: data.view(),
            transform,
            crs: "EPSG:32723",
            nodata: None,
        };
        let grid = TargetGrid {
            width: 3,
            height: 2,
            transform,
            crs: "EPSG:32723".to_string(),
            source: GridSource::Bounds,
        };

        for method in [Resampling::Nearest, Resampling::Bilinear, Resampling::Cubic] {
            let out = reproject(&source, &grid, -1.0, method, DataType::Float32).unwrap();
            assert_eq!(out, data);
        }
    }

    #[test]
    fn test_nodata_outside_and_on_gaps() {
        let data = array![[10.0, 0.0], [30.0, 40.0]];
        let source = SourceRaster {
            data: data.view(),
            transform: GeoTransform::north_up(0.0, 20.0, 10.0, 10.0),
            crs: "",
            nodata: Some(0.0),
        };
        // 3x3 grid of 10m pixels, the last column and row fall outside
        let grid = TargetGrid {
            width: 3,
            height: 3,
            transform: GeoTransform::north_up(0.0, 20.0, 10.0, 10.0),
            crs: String::new(),
            source: GridSource::Bounds,
        };

        let out = reproject(&source, &grid, -9999.0, Resampling::Nearest, DataType::Int16).unwrap();
        assert_eq!(
            out,
            array![[10.0, -9999.0, -9999.0], [30.0, 40.0, -9999.0], [-9999.0, -9999.0, -9999.0]]
        );
    }

    #[test]
    fn test_bilinear_downsample_rounds_integers() {
        let data = array![[1.0, 2.0], [3.0, 4.0]];
        let source = SourceRaster {
            data: data.view(),
            transform: GeoTransform::north_up(0.0, 20.0, 10.0, 10.0),
            crs: "",
            nodata: None,
        };
        let grid = TargetGrid {
            width: 1,
            height: 1,
            transform: GeoTransform::north_up(0.0, 20.0, 20.0, 20.0),
            crs: String::new(),
            source: GridSource::Bounds,
        };

        let float = reproject(&source, &grid, -1.0, Resampling::Bilinear, DataType::Float64).unwrap();
        assert_abs_diff_eq!(float[[0, 0]], 2.5);

        let int = reproject(&source, &grid, -1.0, Resampling::Bilinear, DataType::Int16).unwrap();
        assert_eq!(int[[0, 0]], 3.0);
    }
}
