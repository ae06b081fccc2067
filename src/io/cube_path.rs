//! Deterministic file paths and item identifiers for cube products.
//!
//! Paths are pure functions of (cube, version, tile, period, band) so merge
//! and blend steps can be re-run without any lookup table or cleanup.

use crate::io::raster_store::RasterStore;
use crate::types::{CubeError, CubeResult, Period};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// Cube names keep their case and item ids carry the whole period.
pub const DEFAULT_PATH_FORMAT: &str =
    "{prefix}/{folder}/{datacube}/{version}/{path}/{row}/{year}/{month}/{day}/{filename}";
pub const DEFAULT_ITEM_FORMAT: &str = "{datacube}_V{version}_{tile_id}_{period_id}";

static PLACEHOLDER: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();

fn placeholder() -> CubeResult<&'static Regex> {
    PLACEHOLDER
        .get_or_init(|| Regex::new(r"\{(\w+)(?::(\w+))?\}"))
        .as_ref()
        .map_err(|e| CubeError::Processing(format!("Regex error: {}", e)))
}

/// Substitute `{name}`, `{name:upper}` and `{name:lower}` placeholders.
pub fn render_template(template: &str, vars: &BTreeMap<&str, String>) -> CubeResult<String> {
    let placeholder = placeholder()?;

    let mut output = String::with_capacity(template.len() * 2);
    let mut last = 0;

    for caps in placeholder.captures_iter(template) {
        let whole = caps.get(0).map(|m| m.range()).unwrap_or(0..0);
        let name = &caps[1];

        let value = vars.get(name).ok_or_else(|| {
            CubeError::InvalidFormat(format!("Unknown variable '{}' in template '{}'", name, template))
        })?;

        let value = match caps.get(2).map(|m| m.as_str()) {
            None => value.clone(),
            Some("upper") => value.to_uppercase(),
            Some("lower") => value.to_lowercase(),
            Some(other) => {
                return Err(CubeError::InvalidFormat(format!(
                    "Unknown format modifier '{}' in template '{}'",
                    other, template
                )))
            }
        };

        output.push_str(&template[last..whole.start]);
        output.push_str(&value);
        last = whole.end;
    }

    output.push_str(&template[last..]);
    Ok(output)
}

/// Identity of one cube product, independent of band
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CubeKey {
    pub cube: String,
    pub version: u32,
    pub tile_id: String,
    pub period: Period,
}

impl CubeKey {
    pub fn new(cube: &str, version: u32, tile_id: &str, period: Period) -> Self {
        Self {
            cube: cube.to_string(),
            version,
            tile_id: tile_id.to_string(),
            period,
        }
    }

    /// Orbit path/row encoded as the first and last three tile id characters
    fn path_row(&self) -> (String, String) {
        let chars: Vec<char> = self.tile_id.chars().collect();
        let head = chars.iter().take(3).collect();
        let tail = chars[chars.len().saturating_sub(3)..].iter().collect();
        (head, tail)
    }
}

/// Resolves cube file paths and catalog item ids from caller-overridable templates.
#[derive(Debug, Clone)]
pub struct CubePaths {
    prefix: PathBuf,
    path_format: String,
    item_format: String,
}

impl CubePaths {
    pub fn new<P: AsRef<Path>>(prefix: P) -> Self {
        Self {
            prefix: prefix.as_ref().to_path_buf(),
            path_format: DEFAULT_PATH_FORMAT.to_string(),
            item_format: DEFAULT_ITEM_FORMAT.to_string(),
        }
    }

    pub fn with_path_format(mut self, format: &str) -> Self {
        self.path_format = format.to_string();
        self
    }

    pub fn with_item_format(mut self, format: &str) -> Self {
        self.item_format = format.to_string();
        self
    }

    /// Catalog item identifier
    pub fn item_id(&self, key: &CubeKey) -> CubeResult<String> {
        let mut vars = BTreeMap::new();
        vars.insert("datacube", key.cube.clone());
        vars.insert("version", key.version.to_string());
        vars.insert("version_legacy", format!("{:03}", key.version));
        vars.insert("tile_id", key.tile_id.clone());
        vars.insert("date", key.period.to_string());
        vars.insert("start_date", key.period.start_compact());
        vars.insert("period_id", key.period.compact());

        render_template(&self.item_format, &vars)
    }

    /// Path of a cube file. `band = None` addresses band-less artifacts
    /// such as quick looks; `composed` separates composites from per-date merges.
    pub fn file(
        &self,
        key: &CubeKey,
        band: Option<&str>,
        suffix: Option<&str>,
        composed: bool,
    ) -> CubeResult<PathBuf> {
        let mut filename = self.item_id(key)?;
        if let Some(band) = band {
            filename.push('_');
            filename.push_str(band);
        }
        filename.push_str(suffix.unwrap_or(""));

        let (path, row) = key.path_row();
        let start = key.period.start;

        let mut vars = BTreeMap::new();
        vars.insert("datacube", key.cube.clone());
        vars.insert("prefix", self.prefix.to_string_lossy().trim_end_matches('/').to_string());
        vars.insert("folder", if composed { "composed" } else { "identity" }.to_string());
        vars.insert("path", path);
        vars.insert("row", row);
        vars.insert("tile_id", key.tile_id.clone());
        vars.insert("year", start.format("%Y").to_string());
        vars.insert("month", start.format("%m").to_string());
        vars.insert("day", start.format("%d").to_string());
        vars.insert("version", format!("v{}", key.version));
        vars.insert("version_legacy", format!("v{:03}", key.version));
        vars.insert("period", key.period.to_string());
        vars.insert("filename", filename);

        Ok(PathBuf::from(render_template(&self.path_format, &vars)?))
    }

    /// Per-date merge raster
    pub fn merge_file(&self, key: &CubeKey, band: &str) -> CubeResult<PathBuf> {
        self.file(key, Some(band), Some(".tif"), false)
    }

    /// Composite raster of a period
    pub fn composite_file(&self, key: &CubeKey, band: &str) -> CubeResult<PathBuf> {
        self.file(key, Some(band), Some(".tif"), true)
    }

    /// Explicit idempotency check: the product addressed by `path` was already written.
    pub fn is_computed(&self, store: &dyn RasterStore, path: &Path) -> bool {
        store.exists(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn key(cube: &str, tile: &str, period: &str) -> CubeKey {
        CubeKey::new(cube, 1, tile, Period::parse(period).unwrap())
    }

    #[test]
    fn test_default_item_id() {
        let paths = CubePaths::new("/work");
        let id = paths.item_id(&key("LC8_30_16D_STK", "089098", "2020-01-01_2020-01-16")).unwrap();
        assert_eq!(id, "LC8_30_16D_STK_V1_089098_20200101_20200116");

        let single = paths.item_id(&key("LC8_30", "089098", "2020-01-05")).unwrap();
        assert_eq!(single, "LC8_30_V1_089098_20200105");
    }

    #[test]
    fn test_default_path_layout() {
        let paths = CubePaths::new("/work/");
        let file = paths
            .composite_file(&key("LC8_30_16D_STK", "089098", "2020-01-01_2020-01-16"), "NIR")
            .unwrap();
        assert_eq!(
            file,
            PathBuf::from(
                "/work/composed/LC8_30_16D_STK/v1/089/098/2020/01/01/LC8_30_16D_STK_V1_089098_20200101_20200116_NIR.tif"
            )
        );

        let merge = paths
            .merge_file(&key("LC8_30", "089098", "2020-01-05"), "Fmask4")
            .unwrap();
        assert!(merge.starts_with("/work/identity/LC8_30/v1"));
    }

    #[test]
    fn test_paths_are_stable_and_distinct() {
        let paths = CubePaths::new("/work");
        let base = key("S2_10", "032027", "2021-03-01");
        let a = paths.merge_file(&base, "B04").unwrap();
        assert_eq!(a, paths.merge_file(&base, "B04").unwrap());

        let others = [
            paths.merge_file(&base, "B08").unwrap(),
            paths.merge_file(&key("S2_20", "032027", "2021-03-01"), "B04").unwrap(),
            paths.merge_file(&key("S2_10", "032028", "2021-03-01"), "B04").unwrap(),
            paths.merge_file(&key("S2_10", "032027", "2021-03-02"), "B04").unwrap(),
            paths.merge_file(&CubeKey { version: 2, ..base.clone() }, "B04").unwrap(),
            paths.composite_file(&base, "B04").unwrap(),
        ];
        for other in &others {
            assert_ne!(&a, other);
        }
    }

    #[test]
    fn test_periods_sharing_a_start_do_not_collide() {
        let paths = CubePaths::new("/work");
        let half = key("LC8_30_1M_STK", "089098", "2020-01-01_2020-01-16");
        let month = key("LC8_30_1M_STK", "089098", "2020-01-01_2020-01-31");
        let day = key("LC8_30_1M_STK", "089098", "2020-01-01");

        let files = [
            paths.composite_file(&half, "NIR").unwrap(),
            paths.composite_file(&month, "NIR").unwrap(),
            paths.composite_file(&day, "NIR").unwrap(),
        ];
        assert_ne!(files[0], files[1]);
        assert_ne!(files[0], files[2]);
        assert_ne!(files[1], files[2]);
    }

    #[test]
    fn test_cube_names_keep_their_case() {
        let paths = CubePaths::new("/work");
        let lower = paths.merge_file(&key("lc8_30", "089098", "2020-01-05"), "NIR").unwrap();
        let upper = paths.merge_file(&key("LC8_30", "089098", "2020-01-05"), "NIR").unwrap();
        assert_ne!(lower, upper);
        assert_ne!(
            paths.item_id(&key("lc8_30", "089098", "2020-01-05")).unwrap(),
            paths.item_id(&key("LC8_30", "089098", "2020-01-05")).unwrap()
        );
    }

    #[test]
    fn test_custom_templates() {
        let paths = CubePaths::new("/data")
            .with_path_format("{prefix}/{datacube:lower}/{version_legacy}/{tile_id}/{period}/{filename}")
            .with_item_format("{datacube}_{tile_id}_{date}");
        let period = Period::single(NaiveDate::from_ymd_opt(2020, 2, 3).unwrap());
        let file = paths
            .merge_file(&CubeKey::new("CB4_64", 3, "022024", period), "BAND13")
            .unwrap();
        assert_eq!(
            file,
            PathBuf::from("/data/cb4_64/v003/022024/2020-02-03/CB4_64_022024_2020-02-03_BAND13.tif")
        );
    }

    #[test]
    fn test_unknown_placeholders_are_rejected() {
        let paths = CubePaths::new("/data").with_item_format("{datacube}_{sensor}");
        assert!(matches!(
            paths.item_id(&key("X", "000000", "2020-01-01")),
            Err(CubeError::InvalidFormat(_))
        ));

        let vars = BTreeMap::from([("name", "Value".to_string())]);
        assert!(render_template("{name:title}", &vars).is_err());
        assert_eq!(render_template("a-{name:lower}-b", &vars).unwrap(), "a-value-b");
    }
}
