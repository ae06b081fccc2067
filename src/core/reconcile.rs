use crate::io::raster_store::RasterStore;
use crate::types::{is_derived_band, CubeError, CubeResult, Pixel, RasterImage};
use ndarray::{s, Array2, Zip};
use std::path::{Path, PathBuf};

/// A spectral band merged on the same date as the quality band
#[derive(Debug, Clone)]
pub struct ContributingBand {
    pub name: String,
    pub nodata: Pixel,
    pub file: PathBuf,
}

/// Value written into the quality band where a spectral band has a gap.
/// Sentinel-2 masks reserve 1 (saturated or defective); everything else
/// reuses the quality nodata.
pub fn invalid_value(datasets: &[String], quality_nodata: Pixel) -> Pixel {
    let sentinel = datasets.iter().any(|dataset| {
        let lower = dataset.to_lowercase();
        lower.starts_with("s2") || lower.starts_with("sentinel")
    });

    if sentinel {
        log::info!("Using saturated value 1 for Sentinel-2");
        1.0
    } else {
        quality_nodata
    }
}

/// Marks quality pixels invalid wherever any spectral band of the same
/// merge is nodata, so gaps are never read as clear downstream.
pub struct NodataReconciler<'a> {
    store: &'a dyn RasterStore,
}

impl<'a> NodataReconciler<'a> {
    pub fn new(store: &'a dyn RasterStore) -> Self {
        Self { store }
    }

    /// Patch `quality_file` in place and return the patched raster.
    ///
    /// `quality_nodata` is used when the quality raster declares no nodata.
    /// Derived bands and the quality band itself are ignored.
    pub fn reconcile(
        &self,
        quality_file: &Path,
        quality_band: &str,
        quality_nodata: Option<Pixel>,
        bands: &[ContributingBand],
        datasets: &[String],
    ) -> CubeResult<RasterImage> {
        log::info!("Reconciling nodata of {}", quality_file.display());

        let profile = self.store.info(quality_file)?;
        let nodata = profile.nodata.or(quality_nodata).ok_or_else(|| {
            CubeError::Configuration(format!(
                "Quality raster {} has no nodata value",
                quality_file.display()
            ))
        })?;
        let mut quality = self.store.read(quality_file)?;

        let spectral: Vec<&ContributingBand> = bands
            .iter()
            .filter(|band| band.name != quality_band && !is_derived_band(&band.name))
            .collect();

        for band in &spectral {
            let shape = self.store.info(&band.file)?.shape();
            if shape != profile.shape() {
                return Err(CubeError::Configuration(format!(
                    "Band {} has shape {:?}, quality raster {} has {:?}",
                    band.name,
                    shape,
                    quality_file.display(),
                    profile.shape()
                )));
            }
        }

        let invalid = invalid_value(datasets, nodata);

        let mut patched = 0usize;
        for window in profile.windows() {
            let mut gaps = Array2::from_elem(window.shape(), false);

            for band in &spectral {
                let raster = self.store.read_window(&band.file, window)?;
                Zip::from(&mut gaps).and(&raster).for_each(|gap, &value| {
                    *gap |= value == band.nodata;
                });
            }

            let mut block = quality.slice_mut(s![window.rows(), window.cols()]);
            Zip::from(&mut block).and(&gaps).for_each(|value, &gap| {
                // own nodata stays nodata
                if gap && *value != nodata {
                    *value = invalid;
                    patched += 1;
                }
            });
        }

        log::debug!("Marked {} quality pixels invalid", patched);

        self.store.write(quality_file, &quality, &profile)?;
        Ok(quality)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_value_precedence() {
        assert_eq!(invalid_value(&["S2_L2A-1".to_string()], 0.0), 1.0);
        assert_eq!(invalid_value(&["sentinel-2".to_string()], 0.0), 1.0);
        assert_eq!(invalid_value(&["LC8_SR".to_string(), "CBERS4".to_string()], 255.0), 255.0);
        assert_eq!(invalid_value(&[], 255.0), 255.0);
    }
}
