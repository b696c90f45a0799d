//! Processing configuration for one glacier run.
//!
//! Every tunable of the correction engine lives here. Values default to those of the
//! production Sentinel-2 run and can be overridden from a TOML file.

use crate::types::{BoundingBox, FlowError, FlowResult};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Replaced by the glacier name in every input path
pub const GLACIER_PLACEHOLDER: &str = "{glacier}";

/// Where the area of interest comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AoiSource {
    /// First layer of an OGR-readable vector file (GeoPackage, shapefile, ...).
    ///
    /// With `attribute` set, only the features whose attribute equals the glacier name
    /// are used; otherwise the extent of the whole layer.
    Vector {
        path: PathBuf,
        #[serde(default)]
        attribute: Option<String>,
    },
    /// Explicit projected bounds
    Bounds {
        xmin: f64,
        ymin: f64,
        xmax: f64,
        ymax: f64,
    },
}

/// Decision thresholds of the correction engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Minimum number of fields an orbit pair needs before an offset is estimated
    pub min_pair_samples: usize,
    /// Maximum deviation (degrees) from the reference flow direction over ice
    pub max_flow_deviation_deg: f32,
    /// Minimum fraction of ice pixels that must stay valid after filtering
    pub min_ice_coverage: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_pair_samples: 5,
            max_flow_deviation_deg: 20.0,
            min_ice_coverage: 0.01,
        }
    }
}

/// Tiled external ice/ocean masks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskTileConfig {
    pub tile_dir: PathBuf,
    /// Ice tiles are named `<ice_prefix><tile code>.tif`
    pub ice_prefix: String,
    /// Ocean tiles are named `<ocean_prefix><tile code>.tif`
    pub ocean_prefix: String,
}

impl Default for MaskTileConfig {
    fn default() -> Self {
        Self {
            tile_dir: PathBuf::from("masks"),
            ice_prefix: "GimpIceMask_15m_tile".to_string(),
            ocean_prefix: "GimpOceanMask_15m_tile".to_string(),
        }
    }
}

/// Descriptive block copied verbatim into every metadata document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectInfo {
    pub project: String,
    pub dataset: String,
    pub institution: String,
    pub contact: String,
    pub software: String,
    pub funding_acknowledgement: String,
    /// Satellite data provider named in the acknowledgement line
    pub data_provider: String,
    pub projection_name: String,
}

impl Default for ProjectInfo {
    fn default() -> Self {
        Self {
            project: "Glacier surface velocity".to_string(),
            dataset: "Orbit-corrected glacier velocity maps from Sentinel-2 imagery".to_string(),
            institution: String::new(),
            contact: String::new(),
            software: "Feature tracking by SETSM SDM; orbital correction by glacierflow".to_string(),
            funding_acknowledgement: String::new(),
            data_provider: "Copernicus Sentinel".to_string(),
            projection_name: "WGS 84 / NSIDC Sea Ice Polar Stereographic North".to_string(),
        }
    }
}

/// Complete configuration of one glacier run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Glacier / region name, used in every output filename
    pub glacier: String,
    /// First day of data (exclusive), `YYYYMMDD`
    pub start_date: String,
    /// Last day of data (exclusive), `YYYYMMDD`
    pub end_date: String,
    /// Directory of clipped mosaic scenes (`S2*.tif`).
    ///
    /// This, `velocity_dir`, `grid_template`, the AOI path and `masks.tile_dir` may contain
    /// `{glacier}`, resolved per glacier by [`ProcessingConfig::resolved`].
    pub image_dir: PathBuf,
    /// Directory holding one sub-directory per velocity field and the `list_good_*.txt` manifests
    pub velocity_dir: PathBuf,
    /// Root of all outputs; each glacier writes below `<output_root>/<glacier>`
    pub output_root: PathBuf,
    pub aoi: AoiSource,
    /// Raster whose pixel size defines the working grid (defaults to the first raw dmag raster)
    pub grid_template: Option<PathBuf>,
    pub epsg: u32,
    pub masks: MaskTileConfig,
    pub thresholds: Thresholds,
    /// 3x3 median despeckle of every input field before stacking
    pub despeckle_inputs: bool,
    /// 3x3 median despeckle of the reference median itself
    pub despeckle_reference: bool,
    /// Raw raster values treated as no-data on load
    pub velocity_nodata: Vec<f32>,
    /// No-data value written into every output raster
    pub output_nodata: f32,
    /// Prefix of corrected product ids, e.g. `S2`
    pub product_prefix: String,
    /// Dataset version written into filenames and metadata
    pub version: String,
    pub write_plots: bool,
    /// Glacier-level worker count (0 = one per CPU)
    pub workers: usize,
    /// Correct the records of one glacier in parallel
    pub parallel_records: bool,
    pub project: ProjectInfo,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            glacier: String::new(),
            start_date: "20240101".to_string(),
            end_date: "20241231".to_string(),
            image_dir: PathBuf::from("clipped"),
            velocity_dir: PathBuf::from("velocities"),
            output_root: PathBuf::from("output"),
            aoi: AoiSource::Bounds {
                xmin: 0.0,
                ymin: 0.0,
                xmax: 0.0,
                ymax: 0.0,
            },
            grid_template: None,
            epsg: 3413,
            masks: MaskTileConfig::default(),
            thresholds: Thresholds::default(),
            despeckle_inputs: true,
            despeckle_reference: true,
            velocity_nodata: vec![0.0, -9999.0],
            output_nodata: -9999.0,
            product_prefix: "S2".to_string(),
            version: "01.1".to_string(),
            write_plots: true,
            workers: 0,
            parallel_records: true,
            project: ProjectInfo::default(),
        }
    }
}

impl ProcessingConfig {
    /// Load and validate a configuration from a TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> FlowResult<Self> {
        log::info!("Reading configuration: {}", path.as_ref().display());
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> FlowResult<Self> {
        let config: ProcessingConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Same configuration for another glacier. Path placeholders stay unresolved.
    pub fn for_glacier(&self, glacier: &str) -> Self {
        Self {
            glacier: glacier.to_string(),
            ..self.clone()
        }
    }

    /// Input paths with `{glacier}` replaced by this configuration's glacier
    pub fn resolved(&self) -> Self {
        let resolve = |path: &Path| -> PathBuf {
            PathBuf::from(
                path.to_string_lossy()
                    .replace(GLACIER_PLACEHOLDER, &self.glacier),
            )
        };
        let mut config = self.clone();
        config.image_dir = resolve(&self.image_dir);
        config.velocity_dir = resolve(&self.velocity_dir);
        config.grid_template = self.grid_template.as_deref().map(resolve);
        config.masks.tile_dir = resolve(&self.masks.tile_dir);
        if let AoiSource::Vector { path, .. } = &mut config.aoi {
            *path = resolve(path);
        }
        config
    }

    pub fn validate(&self) -> FlowResult<()> {
        if self.glacier.trim().is_empty() {
            return Err(FlowError::Config("Glacier name is empty".to_string()));
        }
        let (start, end) = self.date_range()?;
        if start >= end {
            return Err(FlowError::Config(format!(
                "start_date {} is not before end_date {}",
                self.start_date, self.end_date
            )));
        }
        if self.thresholds.min_pair_samples == 0 {
            return Err(FlowError::Config(
                "min_pair_samples must be at least 1".to_string(),
            ));
        }
        if !(self.thresholds.max_flow_deviation_deg > 0.0
            && self.thresholds.max_flow_deviation_deg <= 180.0)
        {
            return Err(FlowError::Config(format!(
                "max_flow_deviation_deg must be in (0, 180], got {}",
                self.thresholds.max_flow_deviation_deg
            )));
        }
        if !(self.thresholds.min_ice_coverage > 0.0 && self.thresholds.min_ice_coverage <= 1.0) {
            return Err(FlowError::Config(format!(
                "min_ice_coverage must be in (0, 1], got {}",
                self.thresholds.min_ice_coverage
            )));
        }
        if let AoiSource::Bounds { xmin, ymin, xmax, ymax } = self.aoi {
            BoundingBox::new(xmin, ymin, xmax, ymax)?;
        }
        Ok(())
    }

    /// Parsed (start, end) dates
    pub fn date_range(&self) -> FlowResult<(NaiveDate, NaiveDate)> {
        Ok((parse_yyyymmdd(&self.start_date)?, parse_yyyymmdd(&self.end_date)?))
    }

    pub fn glacier_dir(&self) -> PathBuf {
        self.output_root.join(&self.glacier)
    }

    /// Catalog, pair table, reference and offset products
    pub fn orbits_dir(&self) -> PathBuf {
        self.glacier_dir().join("orbits")
    }

    pub fn masks_dir(&self) -> PathBuf {
        self.glacier_dir().join("masks")
    }

    pub fn corrected_dir(&self) -> PathBuf {
        self.glacier_dir().join("velocities")
    }

    pub fn previews_dir(&self) -> PathBuf {
        self.corrected_dir().join("previews")
    }
}

pub fn parse_yyyymmdd(value: &str) -> FlowResult<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y%m%d")
        .map_err(|e| FlowError::Config(format!("Invalid date '{}': {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_production_thresholds() {
        let t = Thresholds::default();
        assert_eq!(t.min_pair_samples, 5);
        assert_eq!(t.max_flow_deviation_deg, 20.0);
        assert_eq!(t.min_ice_coverage, 0.01);
    }

    #[test]
    fn test_toml_overrides() {
        let text = r#"
            glacier = "192_CH_Ostenfeld"
            start_date = "20220101"
            end_date = "20221231"
            velocity_dir = "/data/vel"

            [aoi]
            kind = "bounds"
            xmin = 0.0
            ymin = 0.0
            xmax = 1000.0
            ymax = 500.0

            [thresholds]
            min_pair_samples = 3
        "#;
        let config = ProcessingConfig::from_toml_str(text).unwrap();
        assert_eq!(config.glacier, "192_CH_Ostenfeld");
        assert_eq!(config.thresholds.min_pair_samples, 3);
        assert_eq!(config.thresholds.max_flow_deviation_deg, 20.0);
        assert_eq!(config.velocity_dir, PathBuf::from("/data/vel"));
        assert_eq!(config.orbits_dir(), PathBuf::from("output/192_CH_Ostenfeld/orbits"));
    }

    #[test]
    fn test_glacier_placeholder_resolution() {
        let text = r#"
            glacier = "template"
            image_dir = "/data/{glacier}/clipped"
            velocity_dir = "/data/{glacier}/velocities"
            grid_template = "/data/{glacier}/template.tif"

            [aoi]
            kind = "vector"
            path = "/data/aoi_{glacier}.gpkg"
            attribute = "region"

            [masks]
            tile_dir = "/masks"
        "#;
        let template = ProcessingConfig::from_toml_str(text).unwrap();
        let config = template.for_glacier("192_CH_Ostenfeld");
        assert_eq!(config.image_dir, PathBuf::from("/data/{glacier}/clipped"));

        let config = config.resolved();
        assert_eq!(config.image_dir, PathBuf::from("/data/192_CH_Ostenfeld/clipped"));
        assert_eq!(config.velocity_dir, PathBuf::from("/data/192_CH_Ostenfeld/velocities"));
        assert_eq!(
            config.grid_template,
            Some(PathBuf::from("/data/192_CH_Ostenfeld/template.tif"))
        );
        assert_eq!(config.masks.tile_dir, PathBuf::from("/masks"));
        assert_eq!(
            config.aoi,
            AoiSource::Vector {
                path: PathBuf::from("/data/aoi_192_CH_Ostenfeld.gpkg"),
                attribute: Some("region".to_string()),
            }
        );
        assert_eq!(config.orbits_dir(), PathBuf::from("output/192_CH_Ostenfeld/orbits"));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = ProcessingConfig {
            glacier: "g".to_string(),
            aoi: AoiSource::Bounds { xmin: 0.0, ymin: 0.0, xmax: 10.0, ymax: 10.0 },
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        config.start_date = "20250101".to_string();
        assert!(config.validate().is_err());

        config.start_date = "20240101".to_string();
        config.thresholds.min_ice_coverage = 0.0;
        assert!(config.validate().is_err());
    }
}
