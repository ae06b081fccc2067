use crate::types::{CubeError, CubeResult, MaskImage, Pixel};
use ndarray::{Array2, ArrayView2, Zip};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// First bit and bit count of the radiometric saturation flags in a
/// saturation (RADSAT) band
pub const SATURATION_BITS: (u32, u32) = (1, 7);

/// Unsigned integer formed by `count` bits of `value` starting at `offset`
pub fn extract_bits(value: u64, offset: u32, count: u32) -> u64 {
    if count == 0 || offset >= 64 {
        return 0;
    }
    let shifted = value >> offset;
    if count >= 64 {
        shifted
    } else {
        shifted & ((1u64 << count) - 1)
    }
}

/// The bit at `position` kept in place (`value & (1 << position)`)
pub fn extract_qa_bit(value: u64, position: u32) -> u64 {
    if position >= 64 {
        return 0;
    }
    value & (1u64 << position)
}

/// Raster values are integral codes; anything else never matches a code.
fn as_code(value: Pixel) -> Option<i64> {
    if value.is_finite() && value.fract() == 0.0 {
        Some(value as i64)
    } else {
        None
    }
}

fn as_bits(value: Pixel) -> u64 {
    match as_code(value) {
        Some(code) if code >= 0 => code as u64,
        _ => 0,
    }
}

/// Confidence threshold of a 2-bit QA confidence field
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    Low = 1,
    Medium = 2,
    High = 3,
}

/// Bit offsets of the 2-bit confidence fields.
/// Defaults follow the Landsat Collection 2 QA_PIXEL layout.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceOffsets {
    pub cloud: u32,
    pub cloud_shadow: u32,
    pub snow: u32,
    pub cirrus: u32,
}

impl Default for ConfidenceOffsets {
    fn default() -> Self {
        Self {
            cloud: 8,
            cloud_shadow: 10,
            snow: 12,
            cirrus: 14,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Confidence refinement of a bit-encoded mask
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceSpec {
    #[serde(default)]
    pub cloud: Option<ConfidenceLevel>,
    #[serde(default)]
    pub cloud_shadow: Option<ConfidenceLevel>,
    #[serde(default)]
    pub snow: Option<ConfidenceLevel>,
    /// Only authoritative for OLI-family sensors
    #[serde(default)]
    pub cirrus: Option<ConfidenceLevel>,
    /// Treat every pixel as OLI when no per-pixel sensor mask is available
    #[serde(default = "default_true")]
    pub oli: bool,
    #[serde(default)]
    pub offsets: ConfidenceOffsets,
}

impl Default for ConfidenceSpec {
    fn default() -> Self {
        Self {
            cloud: None,
            cloud_shadow: None,
            snow: None,
            cirrus: None,
            oli: true,
            offsets: ConfidenceOffsets::default(),
        }
    }
}

impl ConfidenceSpec {
    fn flags(&self, bits: u64, is_oli: bool) -> bool {
        let hit = |level: Option<ConfidenceLevel>, offset: u32| {
            level.map_or(false, |level| extract_bits(bits, offset, 2) >= level as u64)
        };

        hit(self.cloud, self.offsets.cloud)
            || hit(self.cloud_shadow, self.offsets.cloud_shadow)
            || hit(self.snow, self.offsets.snow)
            || (is_oli && hit(self.cirrus, self.offsets.cirrus))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawMaskSpec {
    clear_data: Vec<i64>,
    #[serde(default)]
    not_clear_data: Vec<i64>,
    #[serde(default)]
    saturated_data: Vec<i64>,
    #[serde(default)]
    nodata: Option<Pixel>,
    #[serde(default)]
    bits: bool,
    #[serde(default)]
    saturated_band: Option<String>,
    #[serde(default)]
    confidence: Option<ConfidenceSpec>,
}

/// How a quality band is interpreted.
///
/// Constructed (and validated) once per activity. In bit-encoded mode the
/// clear and not-clear entries are bit positions rather than codes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMaskSpec", into = "RawMaskSpec")]
pub struct QualityMaskSpec {
    clear: BTreeSet<i64>,
    not_clear: BTreeSet<i64>,
    saturated: BTreeSet<i64>,
    nodata: Pixel,
    bits: bool,
    saturated_band: Option<String>,
    confidence: Option<ConfidenceSpec>,
}

impl TryFrom<RawMaskSpec> for QualityMaskSpec {
    type Error = CubeError;

    fn try_from(raw: RawMaskSpec) -> CubeResult<Self> {
        let spec = if raw.bits {
            Self::bit_encoded(&raw.clear_data, &raw.not_clear_data, raw.nodata)?
        } else {
            Self::categorical(&raw.clear_data, &raw.not_clear_data, raw.nodata)?
        };

        let mut spec = spec.with_saturated_values(&raw.saturated_data);
        if let Some(band) = raw.saturated_band {
            spec = spec.with_saturated_band(&band);
        }
        if let Some(confidence) = raw.confidence {
            spec = spec.with_confidence(confidence);
        }
        Ok(spec)
    }
}

impl From<QualityMaskSpec> for RawMaskSpec {
    fn from(spec: QualityMaskSpec) -> Self {
        Self {
            clear_data: spec.clear.into_iter().collect(),
            not_clear_data: spec.not_clear.into_iter().collect(),
            saturated_data: spec.saturated.into_iter().collect(),
            nodata: Some(spec.nodata),
            bits: spec.bits,
            saturated_band: spec.saturated_band,
            confidence: spec.confidence,
        }
    }
}

impl QualityMaskSpec {
    /// Categorical mask: clear/not-clear are whole-value codes
    pub fn categorical(clear: &[i64], not_clear: &[i64], nodata: Option<Pixel>) -> CubeResult<Self> {
        Self::build(clear, not_clear, nodata, false)
    }

    /// Bit-encoded mask: clear/not-clear are bit positions
    pub fn bit_encoded(clear_bits: &[i64], not_clear_bits: &[i64], nodata: Option<Pixel>) -> CubeResult<Self> {
        if let Some(bit) = clear_bits.iter().chain(not_clear_bits).find(|&&b| !(0..64).contains(&b)) {
            return Err(CubeError::Configuration(format!(
                "Bit position {} is outside 0..64",
                bit
            )));
        }
        Self::build(clear_bits, not_clear_bits, nodata, true)
    }

    fn build(clear: &[i64], not_clear: &[i64], nodata: Option<Pixel>, bits: bool) -> CubeResult<Self> {
        let nodata = nodata.ok_or_else(|| {
            CubeError::Configuration(
                "Expected nodata value set to compute data set statistics.".to_string(),
            )
        })?;

        let clear: BTreeSet<i64> = clear.iter().copied().collect();
        let not_clear: BTreeSet<i64> = not_clear.iter().copied().collect();

        let overlap: Vec<i64> = clear.intersection(&not_clear).copied().collect();
        if !overlap.is_empty() {
            return Err(CubeError::Configuration(format!(
                "Values {:?} are declared both clear and not clear",
                overlap
            )));
        }

        if !bits {
            if let Some(code) = as_code(nodata).filter(|c| clear.contains(c) || not_clear.contains(c)) {
                return Err(CubeError::Configuration(format!(
                    "Nodata {} is also declared as a clear/not-clear code",
                    code
                )));
            }
        }

        Ok(Self {
            clear,
            not_clear,
            saturated: BTreeSet::new(),
            nodata,
            bits,
            saturated_band: None,
            confidence: None,
        })
    }

    pub fn with_saturated_values(mut self, values: &[i64]) -> Self {
        self.saturated = values.iter().copied().collect();
        self
    }

    pub fn with_saturated_band(mut self, band: &str) -> Self {
        self.saturated_band = Some(band.to_string());
        self
    }

    pub fn with_confidence(mut self, confidence: ConfidenceSpec) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn nodata(&self) -> Pixel {
        self.nodata
    }

    pub fn is_bit_encoded(&self) -> bool {
        self.bits
    }

    pub fn saturated_band(&self) -> Option<&str> {
        self.saturated_band.as_deref()
    }

    pub fn confidence(&self) -> Option<&ConfidenceSpec> {
        self.confidence.as_ref()
    }

    /// Classify every pixel of a quality raster.
    ///
    /// `oli` marks pixels observed by an OLI-family sensor; when absent the
    /// confidence spec's `oli` flag applies to the whole raster.
    pub fn classify(&self, raster: ArrayView2<Pixel>, oli: Option<ArrayView2<bool>>) -> MaskClassification {
        let mut classes = MaskClassification::empty(raster.dim());

        Zip::indexed(raster).for_each(|idx, &value| {
            if value == self.nodata {
                classes.nodata[idx] = true;
                return;
            }

            if self.bits {
                let bits = as_bits(value);
                let is_oli = match oli {
                    Some(mask) => mask[idx],
                    None => self.confidence.as_ref().map_or(true, |c| c.oli),
                };
                let flagged = self.not_clear.iter().any(|&b| extract_qa_bit(bits, b as u32) != 0)
                    || self.confidence.as_ref().map_or(false, |c| c.flags(bits, is_oli));
                let clear = !flagged
                    && (self.clear.is_empty()
                        || self.clear.iter().any(|&b| extract_qa_bit(bits, b as u32) != 0));

                classes.clear[idx] = clear;
                classes.not_clear[idx] = !clear;
            } else if let Some(code) = as_code(value) {
                classes.clear[idx] = self.clear.contains(&code);
                classes.not_clear[idx] = self.not_clear.contains(&code);
                classes.saturated[idx] = self.saturated.contains(&code);
            }
        });

        classes
    }

    /// Pixels a composite may take as clear observations.
    ///
    /// Categorical masks only exclude what is explicitly not usable (quality
    /// nodata, not-clear and saturated codes), and a clear code always wins.
    /// Bit-encoded masks only accept clear pixels. Band nodata is never usable.
    pub fn usable_for_composite(
        &self,
        classes: &MaskClassification,
        band: ArrayView2<Pixel>,
        band_nodata: Pixel,
    ) -> MaskImage {
        let mut usable = Array2::from_elem(band.dim(), false);
        Zip::from(&mut usable)
            .and(&classes.clear)
            .and(&classes.not_clear)
            .and(&classes.saturated)
            .and(&classes.nodata)
            .and(band)
            .for_each(|usable, &clear, &not_clear, &saturated, &nodata, &value| {
                let accepted = if self.bits {
                    clear
                } else {
                    clear || !(nodata || not_clear || saturated)
                };
                *usable = accepted && value != band_nodata;
            });
        usable
    }
}

/// Per-pixel classes of a quality raster. `clear` and `not_clear` never
/// overlap and are both false on nodata pixels.
#[derive(Debug, Clone)]
pub struct MaskClassification {
    pub clear: MaskImage,
    pub not_clear: MaskImage,
    pub saturated: MaskImage,
    pub nodata: MaskImage,
}

impl MaskClassification {
    fn empty(shape: (usize, usize)) -> Self {
        Self {
            clear: Array2::from_elem(shape, false),
            not_clear: Array2::from_elem(shape, false),
            saturated: Array2::from_elem(shape, false),
            nodata: Array2::from_elem(shape, false),
        }
    }

    /// Force radiometrically saturated pixels (RADSAT bits 1..=7) into not-clear
    pub fn apply_saturation(&mut self, saturation: ArrayView2<Pixel>) {
        let (offset, count) = SATURATION_BITS;

        Zip::indexed(saturation).for_each(|idx, &value| {
            if self.nodata[idx] || extract_bits(as_bits(value), offset, count) == 0 {
                return;
            }
            self.clear[idx] = false;
            self.not_clear[idx] = true;
            self.saturated[idx] = true;
        });
    }

    pub fn clear_count(&self) -> usize {
        self.clear.iter().filter(|&&v| v).count()
    }

    pub fn not_clear_count(&self) -> usize {
        self.not_clear.iter().filter(|&&v| v).count()
    }
}
