use crate::core::quality_mask::{MaskClassification, QualityMaskSpec};
use crate::io::raster_store::RasterStore;
use crate::types::{CubeResult, Pixel};
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Clear/not-clear accounting of one quality raster.
///
/// `efficacy` is the percentage of clear pixels over every pixel of the
/// raster; `cloud_ratio` the percentage of not-clear pixels over valid
/// (clear + not-clear) pixels, 100 when there are none.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityStatistics {
    pub efficacy: f64,
    pub cloud_ratio: f64,
    pub clear_pixels: usize,
    pub not_clear_pixels: usize,
    pub total_pixels: usize,
}

impl QualityStatistics {
    pub fn from_classification(classes: &MaskClassification) -> Self {
        let total_pixels = classes.clear.len();
        let clear_pixels = classes.clear_count();
        // nodata pixels are never part of not_clear, in bit mode included
        let not_clear_pixels = classes.not_clear_count();

        let image_area = clear_pixels + not_clear_pixels;
        let cloud_ratio = if image_area == 0 {
            100.0
        } else {
            round2(100.0 * not_clear_pixels as f64 / image_area as f64)
        };
        let efficacy = if total_pixels == 0 {
            0.0
        } else {
            round2(100.0 * clear_pixels as f64 / total_pixels as f64)
        };

        Self {
            efficacy,
            cloud_ratio,
            clear_pixels,
            not_clear_pixels,
            total_pixels,
        }
    }

    /// Reported values of a band that is not the quality band
    pub fn not_applicable() -> Self {
        Self {
            efficacy: 0.0,
            cloud_ratio: 100.0,
            clear_pixels: 0,
            not_clear_pixels: 0,
            total_pixels: 0,
        }
    }

    pub fn as_tuple(&self) -> (f64, f64) {
        (self.efficacy, self.cloud_ratio)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Efficacy and cloud ratio of a quality raster
pub fn statistics(raster: ArrayView2<Pixel>, mask: &QualityMaskSpec) -> QualityStatistics {
    statistics_with_sensor_mask(raster, mask, None)
}

/// Same as [`statistics`] with a per-pixel OLI indicator for the cirrus
/// confidence rule.
pub fn statistics_with_sensor_mask(
    raster: ArrayView2<Pixel>,
    mask: &QualityMaskSpec,
    oli: Option<ArrayView2<bool>>,
) -> QualityStatistics {
    let classes = mask.classify(raster, oli);
    QualityStatistics::from_classification(&classes)
}

/// Statistics of a quality raster persisted in a store
pub fn dataset_statistics(
    store: &dyn RasterStore,
    path: &Path,
    mask: &QualityMaskSpec,
) -> CubeResult<QualityStatistics> {
    let raster = store.read(path)?;
    let stats = statistics(raster.view(), mask);

    log::debug!(
        "Statistics of {}: efficacy {:.2}%, cloud ratio {:.2}%",
        path.display(),
        stats.efficacy,
        stats.cloud_ratio
    );

    Ok(stats)
}
