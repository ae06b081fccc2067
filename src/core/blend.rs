//! Temporal compositing of a period's per-date merges.
//!
//! Scenes are ranked by `100 * efficacy / resolution` (ties keep input
//! order). Block by block, the best ranked clear observation of each pixel
//! wins the best-pixel stack; pixels nobody observes clearly still receive
//! the first non-nodata value found, cloudy or not.

use crate::core::merge::{is_oli_platform, MergeResult};
use crate::core::quality_mask::QualityMaskSpec;
use crate::core::statistics::statistics;
use crate::io::cube_path::{CubeKey, CubePaths};
use crate::io::raster_store::RasterStore;
use crate::io::remote::AccessTokenScope;
use crate::types::{
    BandSpec, CubeError, CubeResult, DataType, MaskImage, Period, Pixel, RasterImage,
    RasterProfile, Window, CLEAR_OBSERVATION_NAME, DATASOURCE_NAME, PROVENANCE_NAME,
    PROVENANCE_NODATA, TOTAL_OBSERVATION_NAME,
};
use chrono::{Datelike, NaiveDate};
use ndarray::{s, Array2, Zip};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Temporal composite function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CompositeFunction {
    /// Best pixel (`STK`)
    Stack,
    /// Per-pixel median of clear observations (`MED`)
    Median,
    /// Best pixel, always with day-of-year provenance (`LCF`)
    LeastCloudFirst,
}

impl CompositeFunction {
    pub fn code(&self) -> &'static str {
        match self {
            CompositeFunction::Stack => "STK",
            CompositeFunction::Median => "MED",
            CompositeFunction::LeastCloudFirst => "LCF",
        }
    }

    /// Whether the day-of-year provenance raster is produced
    pub fn emits_provenance(&self, build_clear_observation: bool) -> bool {
        match self {
            CompositeFunction::Stack => build_clear_observation,
            CompositeFunction::Median => false,
            CompositeFunction::LeastCloudFirst => true,
        }
    }

    fn keeps_observations(&self) -> bool {
        matches!(self, CompositeFunction::Median)
    }

    /// Primary output of one block
    fn compose(&self, block: &BlockStack) -> RasterImage {
        match self {
            CompositeFunction::Stack | CompositeFunction::LeastCloudFirst => block.best.clone(),
            CompositeFunction::Median => block.median(),
        }
    }
}

impl FromStr for CompositeFunction {
    type Err = CubeError;

    fn from_str(s: &str) -> CubeResult<Self> {
        match s.to_uppercase().as_str() {
            "STK" => Ok(CompositeFunction::Stack),
            "MED" => Ok(CompositeFunction::Median),
            "LCF" => Ok(CompositeFunction::LeastCloudFirst),
            other => Err(CubeError::Configuration(format!(
                "Unknown composite function: {}",
                other
            ))),
        }
    }
}

impl TryFrom<String> for CompositeFunction {
    type Error = CubeError;

    fn try_from(value: String) -> CubeResult<Self> {
        value.parse()
    }
}

impl From<CompositeFunction> for String {
    fn from(function: CompositeFunction) -> Self {
        function.code().to_string()
    }
}

impl std::fmt::Display for CompositeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Per-date merge files of one scene, keyed by band name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlendScene {
    pub date: NaiveDate,
    pub efficacy: f64,
    pub resolution: f64,
    pub files: BTreeMap<String, PathBuf>,
}

impl BlendScene {
    pub fn new(date: NaiveDate, efficacy: f64, resolution: f64) -> Self {
        Self {
            date,
            efficacy,
            resolution,
            files: BTreeMap::new(),
        }
    }

    pub fn with_file<P: AsRef<Path>>(mut self, band: &str, path: P) -> Self {
        self.files.insert(band.to_string(), path.as_ref().to_path_buf());
        self
    }

    /// Scene from the merge results of one date. Efficacy and the dataset
    /// provenance raster come from the quality band merge.
    pub fn from_merges(
        date: NaiveDate,
        merges: &BTreeMap<String, MergeResult>,
        quality_band: &str,
    ) -> CubeResult<Self> {
        let quality = merges.get(quality_band).ok_or_else(|| {
            CubeError::Configuration(format!("No {} merge for {}", quality_band, date))
        })?;

        let mut scene = Self::new(date, quality.efficacy, quality.resolution);
        for (band, merge) in merges {
            scene.files.insert(band.clone(), merge.file.clone());
        }
        if let Some(datasource) = &quality.datasource {
            scene.files.insert(DATASOURCE_NAME.to_string(), datasource.clone());
        }
        Ok(scene)
    }

    fn file(&self, band: &str) -> CubeResult<&Path> {
        self.files.get(band).map(|p| p.as_path()).ok_or_else(|| {
            CubeError::Configuration(format!("Missing merge of band {} for {}", band, self.date))
        })
    }

    /// Resolution-normalised quality score used for ranking
    pub fn score(&self) -> CubeResult<f64> {
        if !(self.resolution > 0.0) {
            return Err(CubeError::Configuration(format!(
                "Scene {} has invalid resolution {}",
                self.date, self.resolution
            )));
        }
        Ok(100.0 * self.efficacy / self.resolution)
    }
}

/// Publish a composite under another cube identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReuseCube {
    pub name: String,
    pub version: u32,
}

/// The compositing unit: one band of one tile over one period
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlendActivity {
    pub cube: String,
    pub version: u32,
    pub tile_id: String,
    #[serde(with = "period_format")]
    pub period: Period,
    pub band: BandSpec,
    pub quality_band: String,
    pub function: CompositeFunction,
    pub mask: QualityMaskSpec,
    pub scenes: Vec<BlendScene>,
    #[serde(default)]
    pub datasets: Vec<String>,
    #[serde(default)]
    pub platforms: Vec<String>,
    #[serde(default)]
    pub combined: bool,
    #[serde(default)]
    pub build_clear_observation: bool,
    #[serde(default)]
    pub apply_valid_range: bool,
    #[serde(default)]
    pub reuse_cube: Option<ReuseCube>,
    /// Bearer token attached to remote reads of the merges
    #[serde(default)]
    pub token: Option<String>,
}

mod period_format {
    use crate::types::Period;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(period: &Period, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&period.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Period, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Period::parse(&raw).map_err(serde::de::Error::custom)
    }
}

impl BlendActivity {
    fn is_combined(&self) -> bool {
        self.datasets.len() > 1 || (self.platforms.len() > 1 && self.combined)
    }

    /// Names of the dataset provenance codes, the same entries the merge
    /// step indexed its provenance rasters with
    fn provenance_entries(&self) -> &[String] {
        if self.datasets.len() > 1 || self.platforms.is_empty() {
            &self.datasets
        } else {
            &self.platforms
        }
    }

    fn nodata(&self) -> Pixel {
        if self.band.name == self.quality_band {
            self.mask.nodata()
        } else {
            self.band.nodata
        }
    }

    fn key(&self) -> CubeKey {
        match &self.reuse_cube {
            Some(reuse) => CubeKey::new(&reuse.name, reuse.version, &self.tile_id, self.period),
            None => CubeKey::new(&self.cube, self.version, &self.tile_id, self.period),
        }
    }
}

/// Files and statistics produced by one blend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeOutput {
    pub function: CompositeFunction,
    pub file: PathBuf,
    pub clear_observation: Option<PathBuf>,
    pub total_observation: Option<PathBuf>,
    pub provenance: Option<PathBuf>,
    pub datasource: Option<PathBuf>,
    pub efficacy: f64,
    pub cloud_ratio: f64,
}

/// Scene order of a blend: descending score, ties in input order
pub fn rank_scenes(scenes: &[BlendScene]) -> CubeResult<Vec<usize>> {
    let scores = scenes
        .iter()
        .map(|scene| scene.score())
        .collect::<CubeResult<Vec<f64>>>()?;

    let mut order: Vec<usize> = (0..scenes.len()).collect();
    order.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(order)
}

/// Median of the values, mean of the two middle ones for even counts
fn median(values: &mut [Pixel]) -> Option<Pixel> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        Some(values[mid])
    } else {
        Some((values[mid - 1] + values[mid]) / 2.0)
    }
}

/// State of one block after every ranked scene was folded in
struct BlockStack {
    best: RasterImage,
    /// (values, usable) per ranked scene; only kept for the median
    observations: Vec<(RasterImage, MaskImage)>,
    nodata: Pixel,
    dtype: DataType,
}

impl BlockStack {
    fn median_at(&self, idx: (usize, usize), values: &mut Vec<Pixel>) -> Pixel {
        values.clear();
        values.extend(
            self.observations
                .iter()
                .filter(|(_, usable)| usable[idx])
                .map(|(raster, _)| raster[idx]),
        );
        median(values).map_or(self.nodata, |m| self.dtype.coerce(m))
    }

    #[cfg(feature = "parallel")]
    fn median(&self) -> RasterImage {
        use rayon::prelude::*;

        let (height, width) = self.best.dim();
        let medians: Vec<Pixel> = (0..height * width)
            .into_par_iter()
            .map_init(Vec::new, |values, i| self.median_at((i / width, i % width), values))
            .collect();

        let mut output = Array2::from_elem((height, width), self.nodata);
        for (out, value) in output.iter_mut().zip(medians) {
            *out = value;
        }
        output
    }

    #[cfg(not(feature = "parallel"))]
    fn median(&self) -> RasterImage {
        let mut values = Vec::with_capacity(self.observations.len());
        Array2::from_shape_fn(self.best.dim(), |idx| self.median_at(idx, &mut values))
    }
}

/// Whole-raster accumulators of one blend call
struct BlendBuffers {
    output: RasterImage,
    best: RasterImage,
    day_of_year: RasterImage,
    total_observation: RasterImage,
    clear_observation: RasterImage,
    datasource: Option<RasterImage>,
}

/// Opened inputs of one ranked scene
struct RankedScene<'s> {
    scene: &'s BlendScene,
    band: &'s Path,
    quality: &'s Path,
    saturation: Option<&'s Path>,
    datasource: Option<&'s Path>,
    day_of_year: Pixel,
}

/// Builds temporal composites from per-date merges
pub struct TemporalCompositor<'a> {
    store: &'a dyn RasterStore,
    paths: &'a CubePaths,
}

impl<'a> TemporalCompositor<'a> {
    pub fn new(store: &'a dyn RasterStore, paths: &'a CubePaths) -> Self {
        Self { store, paths }
    }

    /// Output paths of an activity, whether or not they exist yet
    pub fn composite_file(&self, activity: &BlendActivity) -> CubeResult<PathBuf> {
        self.paths.composite_file(&activity.key(), &activity.band.name)
    }

    /// True when the primary composite of `activity` was already written
    pub fn is_computed(&self, activity: &BlendActivity) -> CubeResult<bool> {
        let file = self.composite_file(activity)?;
        Ok(self.paths.is_computed(self.store, &file))
    }

    fn ranked<'s>(&self, activity: &'s BlendActivity) -> CubeResult<Vec<RankedScene<'s>>> {
        let with_datasource = activity.build_clear_observation && activity.is_combined();

        rank_scenes(&activity.scenes)?
            .into_iter()
            .map(|index| {
                let scene = &activity.scenes[index];
                Ok(RankedScene {
                    scene,
                    band: scene.file(&activity.band.name)?,
                    quality: scene.file(&activity.quality_band)?,
                    saturation: match activity.mask.saturated_band() {
                        Some(band) => Some(scene.file(band)?),
                        None => None,
                    },
                    // every ranked scene feeds the provenance raster in lockstep
                    datasource: if with_datasource {
                        Some(scene.file(DATASOURCE_NAME)?)
                    } else {
                        None
                    },
                    day_of_year: scene.date.ordinal() as Pixel,
                })
            })
            .collect()
    }

    /// Every input must exist and share the geometry of the first band file.
    fn check_inputs(&self, ranked: &[RankedScene]) -> CubeResult<RasterProfile> {
        let first = ranked.first().ok_or_else(|| {
            CubeError::Configuration("Blend activity has no scenes".to_string())
        })?;
        let profile = self.store.info(first.band)?;

        for scene in ranked {
            let files = [Some(scene.band), Some(scene.quality), scene.saturation, scene.datasource];
            for file in files.into_iter().flatten() {
                let info = self.store.info(file)?;
                if info.shape() != profile.shape() {
                    return Err(CubeError::Configuration(format!(
                        "Raster {} of {} has shape {:?}, expected {:?}",
                        file.display(),
                        scene.scene.date,
                        info.shape(),
                        profile.shape()
                    )));
                }
            }
        }

        Ok(profile)
    }

    pub fn blend(&self, activity: &BlendActivity) -> CubeResult<CompositeOutput> {
        log::info!(
            "Blending {} {} of tile {} for {} ({} scenes)",
            activity.function,
            activity.band.name,
            activity.tile_id,
            activity.period,
            activity.scenes.len()
        );

        let _token = AccessTokenScope::new(activity.token.as_deref())?;

        let ranked = self.ranked(activity)?;
        let profile = self.check_inputs(&ranked)?;
        let nodata = activity.nodata();
        let dtype = activity.band.dtype;
        let shape = profile.shape();

        let oli_codes: BTreeSet<usize> = activity
            .provenance_entries()
            .iter()
            .enumerate()
            .filter(|(_, entry)| is_oli_platform(entry))
            .map(|(code, _)| code)
            .collect();
        let (datasource_dtype, datasource_nodata) =
            DataType::for_code_count(activity.provenance_entries().len());
        let with_datasource = ranked.iter().any(|scene| scene.datasource.is_some());

        let mut buffers = BlendBuffers {
            output: Array2::from_elem(shape, nodata),
            best: Array2::from_elem(shape, nodata),
            day_of_year: Array2::from_elem(shape, PROVENANCE_NODATA),
            total_observation: Array2::zeros(shape),
            clear_observation: Array2::zeros(shape),
            datasource: with_datasource.then(|| Array2::from_elem(shape, datasource_nodata)),
        };

        for window in profile.windows() {
            let block = self.blend_block(activity, &ranked, window, &mut buffers, &oli_codes)?;
            let composed = activity.function.compose(&block);
            buffers
                .output
                .slice_mut(s![window.rows(), window.cols()])
                .assign(&composed);
        }

        // Period statistics always describe the best-pixel stack
        let stats = statistics(buffers.best.view(), &activity.mask);
        let output = self.write_outputs(activity, &profile, &buffers, datasource_dtype, datasource_nodata, stats.as_tuple())?;

        log::info!(
            "Blend {} done: efficacy {:.2}%, cloud ratio {:.2}%",
            output.file.display(),
            output.efficacy,
            output.cloud_ratio
        );

        Ok(output)
    }

    fn blend_block(
        &self,
        activity: &BlendActivity,
        ranked: &[RankedScene],
        window: Window,
        buffers: &mut BlendBuffers,
        oli_codes: &BTreeSet<usize>,
    ) -> CubeResult<BlockStack> {
        log::debug!("Blending block {:?}", window);

        let nodata = activity.nodata();
        let mask = &activity.mask;
        let valid_range = activity
            .band
            .valid_range()
            .filter(|_| activity.apply_valid_range);
        let keep = activity.function.keeps_observations();

        let rows = window.rows();
        let cols = window.cols();
        let mut best = buffers.best.slice_mut(s![rows.clone(), cols.clone()]);
        let mut day_of_year = buffers.day_of_year.slice_mut(s![rows.clone(), cols.clone()]);
        let mut total = buffers.total_observation.slice_mut(s![rows.clone(), cols.clone()]);
        let mut clear = buffers.clear_observation.slice_mut(s![rows.clone(), cols.clone()]);
        let mut datasource = buffers
            .datasource
            .as_mut()
            .map(|d| d.slice_mut(s![rows.clone(), cols.clone()]));

        let mut not_done = Array2::from_elem(window.shape(), true);
        let mut observations = Vec::new();

        for scene in ranked {
            let raster = self.store.read_window(scene.band, window)?;
            let quality = self.store.read_window(scene.quality, window)?;
            let source_block = match scene.datasource {
                Some(path) => Some(self.store.read_window(path, window)?),
                None => None,
            };

            let oli = match (&source_block, mask.confidence()) {
                (Some(codes), Some(_)) if mask.is_bit_encoded() => Some(codes.mapv(|code| {
                    code >= 0.0 && oli_codes.contains(&(code as usize))
                })),
                _ => None,
            };

            let mut classes = mask.classify(quality.view(), oli.as_ref().map(|m| m.view()));
            if let Some(path) = scene.saturation {
                let saturation = self.store.read_window(path, window)?;
                classes.apply_saturation(saturation.view());
            }

            let mut usable = mask.usable_for_composite(&classes, raster.view(), nodata);
            if let Some((min, max)) = valid_range {
                Zip::from(&mut usable).and(&raster).for_each(|usable, &value| {
                    *usable &= value >= min && value <= max;
                });
            }

            Zip::indexed(&raster).for_each(|idx, &value| {
                let observed = value != nodata;
                if observed {
                    total[idx] += 1.0;
                }

                // cloudy values still beat an empty pixel
                let fill = observed && best[idx] == nodata;
                let take = not_done[idx] && usable[idx];
                if fill || take {
                    best[idx] = value;
                    day_of_year[idx] = scene.day_of_year;
                    if let (Some(datasource), Some(codes)) = (datasource.as_mut(), source_block.as_ref()) {
                        datasource[idx] = codes[idx];
                    }
                }

                if usable[idx] {
                    clear[idx] += 1.0;
                    not_done[idx] = false;
                }
            });

            if keep {
                observations.push((raster, usable));
            }
        }

        Ok(BlockStack {
            best: best.to_owned(),
            observations,
            nodata,
            dtype: activity.band.dtype,
        })
    }

    fn write_outputs(
        &self,
        activity: &BlendActivity,
        profile: &RasterProfile,
        buffers: &BlendBuffers,
        datasource_dtype: DataType,
        datasource_nodata: Pixel,
        (efficacy, cloud_ratio): (f64, f64),
    ) -> CubeResult<CompositeOutput> {
        let key = activity.key();
        let base = profile.clone().with_tags(BTreeMap::new());
        let band_profile = base.clone().with_dtype(activity.band.dtype).with_nodata(Some(activity.nodata()));
        let counts_profile = base.clone().with_dtype(DataType::UInt8).with_nodata(None);

        let file = self.paths.composite_file(&key, &activity.band.name)?;
        self.store.write(&file, &buffers.output, &band_profile)?;

        let mut output = CompositeOutput {
            function: activity.function,
            file,
            clear_observation: None,
            total_observation: None,
            provenance: None,
            datasource: None,
            efficacy,
            cloud_ratio,
        };

        if activity.build_clear_observation {
            let clear_file = self.paths.composite_file(&key, CLEAR_OBSERVATION_NAME)?;
            self.store.write(&clear_file, &buffers.clear_observation, &counts_profile)?;
            output.clear_observation = Some(clear_file);

            let total_file = self.paths.composite_file(&key, TOTAL_OBSERVATION_NAME)?;
            self.store.write(&total_file, &buffers.total_observation, &counts_profile)?;
            output.total_observation = Some(total_file);
        }

        if activity.function.emits_provenance(activity.build_clear_observation) {
            let provenance_file = self.paths.composite_file(&key, PROVENANCE_NAME)?;
            let provenance_profile = base.clone().with_dtype(DataType::Int16).with_nodata(Some(PROVENANCE_NODATA));
            self.store.write(&provenance_file, &buffers.day_of_year, &provenance_profile)?;
            output.provenance = Some(provenance_file);
        }

        if let Some(datasource) = buffers.datasource.as_ref().filter(|_| activity.function != CompositeFunction::Median) {
            let tags = activity
                .provenance_entries()
                .iter()
                .enumerate()
                .map(|(code, name)| (name.clone(), code.to_string()))
                .collect();
            let datasource_file = self.paths.composite_file(&key, DATASOURCE_NAME)?;
            let datasource_profile = base
                .with_dtype(datasource_dtype)
                .with_nodata(Some(datasource_nodata))
                .with_tags(tags);
            self.store.write(&datasource_file, datasource, &datasource_profile)?;
            output.datasource = Some(datasource_file);
        }

        Ok(output)
    }
}
