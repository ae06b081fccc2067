//! Per-date mosaic of every scene covering one tile, for one band.
//!
//! Sources are reprojected onto the tile grid in request order. With more
//! than one contributing dataset (or platform, when combining is requested)
//! the first valid source wins every pixel; otherwise each valid pixel of a
//! later source overwrites the buffer.

use crate::config::EngineConfig;
use crate::core::quality_mask::QualityMaskSpec;
use crate::core::rescale::{rescale, ScaleOverride};
use crate::core::statistics::{statistics_with_sensor_mask, QualityStatistics};
use crate::core::warp::{reproject, GridSource, GridSpec, Resampling, SourceRaster, TileGeometryLookup};
use crate::io::raster_store::RasterStore;
use crate::io::remote::{check_access, AccessTokenScope};
use crate::types::{
    BandSpec, CubeError, CubeResult, DataType, MaskImage, Pixel, RasterImage, RasterProfile,
    DATASOURCE_NAME,
};
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// One contributing observation of a merge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceAsset {
    /// Local path or http(s) URL of the band raster
    pub link: String,
    pub dataset: String,
    #[serde(default)]
    pub platform: Option<String>,
    /// Nodata declared by the catalog, used when the raster has none
    #[serde(default)]
    pub nodata: Option<Pixel>,
}

/// Merge of one band on one date
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRequest {
    pub assets: Vec<SourceAsset>,
    pub band: BandSpec,
    pub quality_band: String,
    pub mask: QualityMaskSpec,
    pub grid: GridSpec,
    #[serde(default)]
    pub resampling: Option<Resampling>,
    /// Contributing datasets, in precedence order. Derived from the assets when empty.
    #[serde(default)]
    pub datasets: Vec<String>,
    #[serde(default)]
    pub platforms: Vec<String>,
    #[serde(default)]
    pub combined: bool,
    #[serde(default)]
    pub build_provenance: bool,
    /// Convert values to the band scale
    #[serde(default)]
    pub rescale: bool,
    #[serde(default)]
    pub scale_override: Option<ScaleOverride>,
    #[serde(default)]
    pub token: Option<String>,
    pub output: PathBuf,
}

impl MergeRequest {
    fn is_quality(&self) -> bool {
        self.band.name == self.quality_band
    }

    fn datasets(&self) -> Vec<String> {
        if !self.datasets.is_empty() {
            return self.datasets.clone();
        }
        let mut datasets: Vec<String> = Vec::new();
        for asset in &self.assets {
            if !datasets.contains(&asset.dataset) {
                datasets.push(asset.dataset.clone());
            }
        }
        datasets
    }

    /// Names the provenance codes index: datasets when several contribute,
    /// platforms otherwise.
    fn provenance_entries(&self, datasets: &[String]) -> Vec<String> {
        if datasets.len() > 1 || self.platforms.is_empty() {
            datasets.to_vec()
        } else {
            self.platforms.clone()
        }
    }

    /// Quality bands keep their categorical codes: nearest neighbour only.
    fn resampling(&self) -> Resampling {
        if self.is_quality() {
            Resampling::Nearest
        } else if let Some(method) = self.resampling {
            method
        } else if self.mask.saturated_band() == Some(self.band.name.as_str()) {
            Resampling::Nearest
        } else {
            Resampling::Bilinear
        }
    }
}

/// Output of one merge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeResult {
    pub file: PathBuf,
    pub efficacy: f64,
    pub cloud_ratio: f64,
    pub nodata: Pixel,
    pub resolution: f64,
    /// Last dataset merged
    pub dataset: Option<String>,
    pub platforms_used: Vec<String>,
    /// Per-pixel dataset provenance raster
    pub datasource: Option<PathBuf>,
    /// Names of the provenance codes, indexed by code
    pub provenance_entries: Vec<String>,
}

/// Landsat platforms after Landsat-7 carry the OLI sensor
pub fn is_oli_platform(platform: &str) -> bool {
    let lower = platform.to_lowercase();
    if !lower.contains("landsat") {
        return false;
    }
    let separator = if lower.contains('-') { '-' } else { '_' };
    lower
        .rsplit(separator)
        .next()
        .and_then(|generation| generation.parse::<u32>().ok())
        .map_or(false, |generation| generation > 7)
}

/// Nodata of a source raster when its metadata declares none.
///
/// Some legacy surface reflectance products were published without nodata:
/// Landsat-8 SR (0, or the band nodata for int16 files) and CBERS (band nodata).
fn legacy_nodata(dataset: &str, dtype: DataType, band_nodata: Pixel) -> Option<Pixel> {
    if dataset.contains("LC8SR") || dataset.contains("LC8_SR") {
        Some(if dtype == DataType::Int16 { band_nodata } else { 0.0 })
    } else if dataset.contains("CBERS") {
        Some(band_nodata)
    } else {
        None
    }
}

/// Path of the provenance raster written next to a quality band merge
pub fn datasource_path(merge_file: &Path, band: &str) -> PathBuf {
    let name = merge_file
        .file_name()
        .map(|n| n.to_string_lossy().replace(band, DATASOURCE_NAME))
        .unwrap_or_else(|| DATASOURCE_NAME.to_string());
    merge_file.with_file_name(name)
}

/// Buffers owned by one merge call
struct MergeBuffers {
    raster: RasterImage,
    provenance: Option<RasterImage>,
    oli: Option<MaskImage>,
}

/// Mosaics source scenes into per-date tile rasters
pub struct MergeEngine<'a> {
    store: &'a dyn RasterStore,
    tiles: Option<&'a dyn TileGeometryLookup>,
    block_size: (usize, usize),
}

impl<'a> MergeEngine<'a> {
    pub fn new(store: &'a dyn RasterStore, config: &EngineConfig) -> Self {
        Self {
            store,
            tiles: None,
            block_size: config.block_shape(),
        }
    }

    pub fn with_tile_lookup(mut self, tiles: &'a dyn TileGeometryLookup) -> Self {
        self.tiles = Some(tiles);
        self
    }

    pub fn merge(&self, request: &MergeRequest) -> CubeResult<MergeResult> {
        let band = &request.band;
        log::info!(
            "Merging band {} from {} assets into {}",
            band.name,
            request.assets.len(),
            request.output.display()
        );

        if request.assets.is_empty() {
            return Err(CubeError::Configuration(format!(
                "No assets to merge for {}",
                request.output.display()
            )));
        }

        let is_quality = request.is_quality();
        let nodata = if is_quality { request.mask.nodata() } else { band.nodata };
        let datasets = request.datasets();
        let entries = request.provenance_entries(&datasets);
        let combined = datasets.len() > 1 || (request.platforms.len() > 1 && request.combined);
        let method = request.resampling();

        let scale = if request.rescale && !is_quality {
            let new_scale = band.scale.ok_or_else(|| {
                CubeError::Configuration(format!("Band {} has no scale to rescale to", band.name))
            })?;
            let (multiplier, additive) = match request.scale_override {
                Some(over) => (over.mult, over.add.unwrap_or(0.0)),
                None => (new_scale, band.scale_add.unwrap_or(0.0)),
            };
            Some((multiplier, new_scale, additive))
        } else {
            None
        };

        let _token = AccessTokenScope::new(request.token.as_deref())?;

        // an explicit shape takes its geometry from the first asset
        let reference = match request.grid.shape {
            Some(_) => {
                let first = &request.assets[0];
                check_access(&first.link, request.token.as_deref())?;
                Some(self.store.info(Path::new(&first.link))?)
            }
            None => None,
        };
        let grid = request.grid.resolve(self.tiles, reference.as_ref())?;

        let by_dataset = datasets.len() > 1 || request.platforms.is_empty();
        let track_oli = request.mask.is_bit_encoded()
            && request.mask.confidence().is_some()
            && request.assets.iter().any(|a| a.platform.is_some());

        let mut buffers = MergeBuffers {
            raster: Array2::from_elem(grid.shape(), nodata),
            provenance: request
                .build_provenance
                .then(|| Array2::from_elem(grid.shape(), DataType::for_code_count(entries.len()).1)),
            oli: track_oli.then(|| Array2::from_elem(grid.shape(), false)),
        };
        let mut platforms_used = BTreeSet::new();

        for asset in &request.assets {
            log::debug!("Merging asset {} ({})", asset.link, asset.dataset);

            check_access(&asset.link, request.token.as_deref())?;
            if let Some(platform) = &asset.platform {
                platforms_used.insert(platform.clone());
            }

            let path = Path::new(&asset.link);
            let profile = self.store.info(path)?;

            let source_nodata = profile
                .nodata
                .or(if is_quality { Some(request.mask.nodata()) } else { None })
                .or_else(|| legacy_nodata(&asset.dataset, profile.dtype, band.nodata))
                .or(asset.nodata)
                .unwrap_or(band.nodata);

            let data = self.store.read(path)?;
            let mut raster = match grid.source {
                GridSource::Shape => {
                    if data.dim() != grid.shape() {
                        return Err(CubeError::Configuration(format!(
                            "Asset {} has shape {:?}, expected {:?}",
                            asset.link,
                            data.dim(),
                            grid.shape()
                        )));
                    }
                    data.mapv(|v| if v == source_nodata { nodata } else { band.dtype.coerce(v) })
                }
                _ => {
                    let source = SourceRaster {
                        data: data.view(),
                        transform: profile.transform,
                        crs: &profile.crs,
                        nodata: Some(source_nodata),
                    };
                    reproject(&source, &grid, nodata, method, band.dtype)?
                }
            };

            if let Some((multiplier, new_scale, additive)) = scale {
                raster = rescale(raster.view(), nodata, multiplier, new_scale, additive, band.dtype)?;
            }

            let key = if by_dataset { Some(&asset.dataset) } else { asset.platform.as_ref() };
            let code = key
                .and_then(|key| entries.iter().position(|entry| entry == key))
                .map(|index| index as Pixel);
            if request.build_provenance && code.is_none() {
                return Err(CubeError::Configuration(format!(
                    "Asset {} is not part of the provenance entries {:?}",
                    asset.link, entries
                )));
            }
            let is_oli = asset.platform.as_deref().map_or(false, is_oli_platform);

            Self::accumulate(&mut buffers, &raster, nodata, combined, code, is_oli);
        }

        let stats = if is_quality {
            statistics_with_sensor_mask(buffers.raster.view(), &request.mask, buffers.oli.as_ref().map(|m| m.view()))
        } else {
            QualityStatistics::not_applicable()
        };

        let profile = grid.profile(band.dtype, Some(nodata), self.block_size);

        let datasource = match &buffers.provenance {
            Some(provenance) if is_quality => {
                let path = datasource_path(&request.output, &band.name);
                let (dtype, code_nodata) = DataType::for_code_count(entries.len());
                let tags: BTreeMap<String, String> = entries
                    .iter()
                    .enumerate()
                    .map(|(code, name)| (name.clone(), code.to_string()))
                    .collect();
                let provenance_profile = profile
                    .clone()
                    .with_dtype(dtype)
                    .with_nodata(Some(code_nodata))
                    .with_tags(tags);

                self.store.write(&path, provenance, &provenance_profile)?;
                Some(path)
            }
            _ => None,
        };

        self.store.write(&request.output, &buffers.raster, &profile)?;

        log::info!(
            "Merge {} done: efficacy {:.2}%, cloud ratio {:.2}%",
            request.output.display(),
            stats.efficacy,
            stats.cloud_ratio
        );

        Ok(MergeResult {
            file: request.output.clone(),
            efficacy: stats.efficacy,
            cloud_ratio: stats.cloud_ratio,
            nodata,
            resolution: merge_resolution(&request.grid, &profile),
            dataset: request.assets.last().map(|a| a.dataset.clone()),
            platforms_used: platforms_used.into_iter().collect(),
            datasource,
            provenance_entries: if request.build_provenance { entries } else { Vec::new() },
        })
    }

    /// Fold one reprojected asset into the merge buffers.
    fn accumulate(
        buffers: &mut MergeBuffers,
        raster: &RasterImage,
        nodata: Pixel,
        combined: bool,
        code: Option<Pixel>,
        is_oli: bool,
    ) {
        let MergeBuffers { raster: merged, provenance, oli } = buffers;

        Zip::indexed(raster).for_each(|idx, &value| {
            if value == nodata {
                return;
            }
            // combined collections: first valid source wins
            if combined && merged[idx] != nodata {
                return;
            }

            merged[idx] = value;
            if let (Some(provenance), Some(code)) = (provenance.as_mut(), code) {
                provenance[idx] = code;
            }
            if let Some(oli) = oli.as_mut() {
                oli[idx] = is_oli;
            }
        });
    }
}

fn merge_resolution(grid: &GridSpec, profile: &RasterProfile) -> f64 {
    if grid.resolution.0 > 0.0 {
        grid.resolution.0
    } else {
        profile.transform.pixel_width.abs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oli_platforms() {
        assert!(is_oli_platform("LANDSAT-8"));
        assert!(is_oli_platform("landsat_9"));
        assert!(!is_oli_platform("LANDSAT-7"));
        assert!(!is_oli_platform("landsat-5"));
        assert!(!is_oli_platform("Sentinel-2A"));
        assert!(!is_oli_platform("landsat"));
    }

    #[test]
    fn test_legacy_nodata() {
        assert_eq!(legacy_nodata("LC8SR-1", DataType::Int16, -9999.0), Some(-9999.0));
        assert_eq!(legacy_nodata("LC8_SR", DataType::UInt16, -9999.0), Some(0.0));
        assert_eq!(legacy_nodata("CBERS4_AWFI_L4_SR", DataType::Int16, -9999.0), Some(-9999.0));
        assert_eq!(legacy_nodata("S2_L2A", DataType::Int16, -9999.0), None);
    }

    #[test]
    fn test_datasource_path_replaces_band() {
        let path = datasource_path(Path::new("/cube/LC8_30_V1_089098_20200101_Fmask4.tif"), "Fmask4");
        assert_eq!(path, PathBuf::from("/cube/LC8_30_V1_089098_20200101_DATASOURCE.tif"));
    }
}
