//! JSON metadata document written next to every corrected velocity field.

use crate::config::ProjectInfo;
use crate::core::pair_table::VelocityFieldRecord;
use crate::core::uncertainty::{OffIceUncertainty, RockStatistics};
use crate::types::{FlowResult, GridContext};
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

const DATETIME_FORMAT: &str = "%Y-%m-%d T%H:%M:%S";

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn round2_opt(v: Option<f64>) -> Option<f64> {
    v.map(round2)
}

fn format_datetime(t: &DateTime<Utc>) -> String {
    t.format(DATETIME_FORMAT).to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub id: String,
    pub glacier_id: String,
    pub data: String,
    pub units: String,
    pub source_id: String,
    pub scene_1_satellite: String,
    pub scene_2_satellite: String,
    pub scene_1_datetime: String,
    pub scene_2_datetime: String,
    pub midpoint_datetime: String,
    pub baseline_days: f64,
    pub scene_1_orbit: String,
    pub scene_2_orbit: String,
    pub scene_1_processing_baseline: String,
    pub scene_2_processing_baseline: String,
    pub percent_ice_area_notnull: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VelocityErrors {
    pub mag_rmse: Option<f64>,
    pub dx_mean: Option<f64>,
    pub dx_sd: Option<f64>,
    pub dy_mean: Option<f64>,
    pub dy_sd: Option<f64>,
}

impl From<&RockStatistics> for VelocityErrors {
    fn from(s: &RockStatistics) -> Self {
        Self {
            mag_rmse: round2_opt(s.mag_rmse),
            dx_mean: round2_opt(s.dx_mean),
            dx_sd: round2_opt(s.dx_sd),
            dy_mean: round2_opt(s.dy_mean),
            dy_sd: round2_opt(s.dy_sd),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplacementErrors {
    pub mag_displacement_rmse: Option<f64>,
    pub dx_displacement_mean: Option<f64>,
    pub dx_displacement_sd: Option<f64>,
    pub dy_displacement_mean: Option<f64>,
    pub dy_displacement_sd: Option<f64>,
}

impl From<&RockStatistics> for DisplacementErrors {
    fn from(s: &RockStatistics) -> Self {
        Self {
            mag_displacement_rmse: round2_opt(s.mag_rmse),
            dx_displacement_mean: round2_opt(s.dx_mean),
            dx_displacement_sd: round2_opt(s.dx_sd),
            dy_displacement_mean: round2_opt(s.dy_mean),
            dy_displacement_sd: round2_opt(s.dy_sd),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extent {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeospatialInfo {
    pub projection: String,
    pub epsg: String,
    pub coordinate_unit: String,
    pub data_format: String,
    pub x_resolution: f64,
    pub y_resolution: f64,
    pub extent: Extent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectBlock {
    pub project: String,
    pub dataset: String,
    pub version: String,
    pub institution: String,
    pub contact: String,
    pub software: String,
    pub funding_acknowledgement: String,
    pub data_acknowledgement: String,
}

/// Complete metadata document of one corrected field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMetadata {
    pub field_info: FieldInfo,
    pub error_units_velocity: VelocityErrors,
    pub error_units_displacement: DisplacementErrors,
    pub geospatial_info: GeospatialInfo,
    pub project_info: ProjectBlock,
}

/// Everything the document is assembled from
pub struct MetadataInputs<'a> {
    pub product_id: &'a str,
    pub glacier: &'a str,
    pub version: &'a str,
    pub record: &'a VelocityFieldRecord,
    pub uncertainty: &'a OffIceUncertainty,
    pub ice_coverage: f64,
    pub grid: &'a GridContext,
    pub project: &'a ProjectInfo,
}

impl FieldMetadata {
    pub fn new(inputs: &MetadataInputs<'_>) -> Self {
        let record = inputs.record;
        let bounds = &inputs.grid.bounds;
        let project = inputs.project;

        Self {
            field_info: FieldInfo {
                id: inputs.product_id.to_string(),
                glacier_id: inputs.glacier.to_string(),
                data: "ice surface velocity".to_string(),
                units: "m d^{-1}".to_string(),
                source_id: record.id.clone(),
                scene_1_satellite: record.satellite1.clone(),
                scene_2_satellite: record.satellite2.clone(),
                scene_1_datetime: format_datetime(&record.datetime_1),
                scene_2_datetime: format_datetime(&record.datetime_2),
                midpoint_datetime: format_datetime(&record.midpoint),
                baseline_days: round2(record.baseline),
                scene_1_orbit: record.orbit_pair.first.to_string(),
                scene_2_orbit: record.orbit_pair.second.to_string(),
                scene_1_processing_baseline: record.processing_baseline1.clone(),
                scene_2_processing_baseline: record.processing_baseline2.clone(),
                percent_ice_area_notnull: round2(inputs.ice_coverage * 100.0),
            },
            error_units_velocity: VelocityErrors::from(&inputs.uncertainty.velocity),
            error_units_displacement: DisplacementErrors::from(&inputs.uncertainty.displacement),
            geospatial_info: GeospatialInfo {
                projection: project.projection_name.clone(),
                epsg: inputs.grid.epsg.to_string(),
                coordinate_unit: "m".to_string(),
                data_format: "GeoTiff".to_string(),
                x_resolution: inputs.grid.pixel_size,
                y_resolution: inputs.grid.pixel_size,
                extent: Extent {
                    xmin: bounds.min_x,
                    ymin: bounds.min_y,
                    xmax: bounds.max_x,
                    ymax: bounds.max_y,
                },
            },
            project_info: ProjectBlock {
                project: project.project.clone(),
                dataset: project.dataset.clone(),
                version: inputs.version.to_string(),
                institution: project.institution.clone(),
                contact: project.contact.clone(),
                software: project.software.clone(),
                funding_acknowledgement: project.funding_acknowledgement.clone(),
                data_acknowledgement: format!(
                    "Contains modified {} data [{}].",
                    project.data_provider,
                    record.midpoint.year()
                ),
            },
        }
    }

    /// Write as 4-space indented JSON
    pub fn write<P: AsRef<Path>>(&self, path: P) -> FlowResult<()> {
        let file = std::fs::File::create(path.as_ref())?;
        let mut writer = std::io::BufWriter::new(file);
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut writer, formatter);
        self.serialize(&mut serializer)?;
        writer.flush()?;
        log::debug!("Wrote metadata: {}", path.as_ref().display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, OrbitId, OrbitPair};
    use chrono::TimeZone;
    use std::path::PathBuf;

    fn record() -> VelocityFieldRecord {
        let t1 = Utc.with_ymd_and_hms(2020, 7, 1, 15, 9, 11).unwrap();
        let t2 = Utc.with_ymd_and_hms(2020, 7, 11, 15, 9, 11).unwrap();
        VelocityFieldRecord {
            id: "vmap_20200701T15_20200711T15".to_string(),
            dir: PathBuf::from("/vel/vmap_20200701T15_20200711T15"),
            date1: t1,
            date2: t2,
            datetime_1: t1,
            datetime_2: t2,
            day_sep: 10.0,
            year: 2020,
            midpoint: Utc.with_ymd_and_hms(2020, 7, 6, 15, 9, 11).unwrap(),
            baseline: 10.0,
            halfbaseline: 5.0,
            satellite1: "S2A".to_string(),
            satellite2: "S2B".to_string(),
            processing_baseline1: "0214".to_string(),
            processing_baseline2: "0214".to_string(),
            orbit_pair: OrbitPair::new(OrbitId::new("096").unwrap(), OrbitId::new("053").unwrap()),
        }
    }

    #[test]
    fn test_metadata_schema() {
        let grid = GridContext::new(BoundingBox::new(0.0, 0.0, 1000.0, 500.0).unwrap(), 100.0, 3413).unwrap();
        let uncertainty = OffIceUncertainty {
            velocity: RockStatistics {
                mag_rmse: Some(0.123_456),
                dx_mean: Some(-0.005),
                dx_sd: None,
                dy_mean: Some(1.0),
                dy_sd: Some(2.0),
            },
            displacement: RockStatistics::default(),
        };
        let record = record();
        let meta = FieldMetadata::new(&MetadataInputs {
            product_id: "S2_g_20200701T150911_20200711T150911",
            glacier: "g",
            version: "01.1",
            record: &record,
            uncertainty: &uncertainty,
            ice_coverage: 0.87654,
            grid: &grid,
            project: &ProjectInfo::default(),
        });

        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["field_info"]["scene_1_datetime"], "2020-07-01 T15:09:11");
        assert_eq!(value["field_info"]["percent_ice_area_notnull"], 87.65);
        assert_eq!(value["field_info"]["scene_2_orbit"], "053");
        assert_eq!(value["error_units_velocity"]["mag_rmse"], 0.12);
        assert!(value["error_units_velocity"]["dx_sd"].is_null());
        assert!(value["error_units_displacement"]["mag_displacement_rmse"].is_null());
        assert_eq!(value["geospatial_info"]["epsg"], "3413");
        assert_eq!(value["geospatial_info"]["extent"]["xmax"], 1000.0);
        assert_eq!(
            value["project_info"]["data_acknowledgement"],
            "Contains modified Copernicus Sentinel data [2020]."
        );
    }
}
