use crate::types::{CubeError, CubeResult, DataType, Pixel, RasterImage};
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

/// Caller supplied scale factors replacing the band's own ones
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScaleOverride {
    pub mult: f64,
    #[serde(default)]
    pub add: Option<f64>,
}

/// Rescale raw sensor values into the cube's scale.
///
/// Every pixel different from `nodata` becomes
/// `(value * multiplier + additive) / new_scale`, cast to `dtype`.
/// Nodata pixels are left untouched.
pub fn rescale(
    raster: ArrayView2<Pixel>,
    nodata: Pixel,
    multiplier: f64,
    new_scale: f64,
    additive: f64,
    dtype: DataType,
) -> CubeResult<RasterImage> {
    if new_scale == 0.0 || !new_scale.is_finite() {
        return Err(CubeError::Configuration(format!(
            "Invalid target scale {}",
            new_scale
        )));
    }

    Ok(raster.mapv(|value| {
        if value == nodata {
            value
        } else {
            dtype.coerce((value * multiplier + additive) / new_scale)
        }
    }))
}
