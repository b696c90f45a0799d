//! Per-record orbital bias correction, directional filtering and coverage check.

use crate::config::{ProcessingConfig, Thresholds};
use crate::core::masks::MaskSet;
use crate::core::metadata::{FieldMetadata, MetadataInputs};
use crate::core::offset::OffsetTable;
use crate::core::pair_table::VelocityFieldRecord;
use crate::core::plot;
use crate::core::reference::{angle_difference, flow_direction_deg, ReferenceField};
use crate::core::uncertainty::{off_ice_uncertainty, OffIceUncertainty};
use crate::core::velocity_stack::FieldLoader;
use crate::io::raster::write_float_geotiff;
use crate::types::{FlowError, FlowResult, GridContext, MaskImage, SkipReason, VelocityComponent, VelocityImage};
use ndarray::{Array2, Zip};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Terminal state of one record
#[derive(Debug, Clone, PartialEq)]
pub enum FieldOutcome {
    Corrected(CorrectedField),
    AlreadyExists,
    Skipped(SkipReason),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CorrectedField {
    pub product_id: String,
    pub dir: PathBuf,
    /// Fraction of ice pixels with a valid corrected velocity
    pub ice_coverage: f64,
}

/// Corrected rasters of one record before they are written
#[derive(Debug, Clone)]
pub struct Correction {
    pub dx: VelocityImage,
    pub dy: VelocityImage,
    pub magnitude: VelocityImage,
    pub ice_coverage: f64,
    pub uncertainty: OffIceUncertainty,
}

/// `<prefix>_<glacier>_<datetime 1>_<datetime 2>`
pub fn product_id(prefix: &str, glacier: &str, record: &VelocityFieldRecord) -> String {
    format!(
        "{}_{}_{}_{}",
        prefix,
        glacier,
        record.datetime_1.format("%Y%m%dT%H%M%S"),
        record.datetime_2.format("%Y%m%dT%H%M%S")
    )
}

/// Output files of one corrected record
#[derive(Debug, Clone)]
pub struct ProductPaths {
    pub dir: PathBuf,
    pub vx: PathBuf,
    pub vy: PathBuf,
    pub vv: PathBuf,
    pub metadata: PathBuf,
    pub preview: PathBuf,
    pub preview_copy: PathBuf,
}

impl ProductPaths {
    pub fn new(corrected_dir: &Path, previews_dir: &Path, product_id: &str, version: &str) -> Self {
        let dir = corrected_dir.join(product_id);
        let file = |suffix: String| dir.join(format!("{}{}", product_id, suffix));
        Self {
            vx: file(format!("_vx_v{}.tif", version)),
            vy: file(format!("_vy_v{}.tif", version)),
            vv: file(format!("_vv_v{}.tif", version)),
            metadata: file(format!("_v{}_metadata.json", version)),
            preview: file(format!("_vv_v{}_preview.png", version)),
            preview_copy: previews_dir.join(format!("{}_vv_v{}_preview.png", product_id, version)),
            dir,
        }
    }
}

/// Apply the pair offset to raw rates, then filter by flow direction and ice coverage.
///
/// Uncertainty is measured over rock before the directional filter runs.
#[allow(clippy::too_many_arguments)]
pub fn apply_correction(
    raw_dx: &VelocityImage,
    raw_dy: &VelocityImage,
    offset_dx: &VelocityImage,
    offset_dy: &VelocityImage,
    day_sep: f64,
    reference_flowdir: &VelocityImage,
    rock: &MaskImage,
    ice: &MaskImage,
    thresholds: &Thresholds,
) -> Result<Correction, SkipReason> {
    if day_sep == 0.0 {
        return Err(SkipReason::ZeroDaySeparation);
    }
    let day_sep_f32 = day_sep as f32;

    let mut dx = raw_dx.clone();
    Zip::from(&mut dx)
        .and(offset_dx)
        .par_for_each(|v, &o| *v += o / day_sep_f32);
    let mut dy = raw_dy.clone();
    Zip::from(&mut dy)
        .and(offset_dy)
        .par_for_each(|v, &o| *v += o / day_sep_f32);

    let uncertainty = off_ice_uncertainty(&dx, &dy, rock, day_sep);

    let max_deviation = thresholds.max_flow_deviation_deg;
    Zip::from(&mut dx)
        .and(&dy)
        .and(reference_flowdir)
        .and(ice)
        .par_for_each(|x, &y, &reference, &i| {
            if i == 1 && angle_difference(reference, flow_direction_deg(*x, y)) > max_deviation {
                *x = f32::NAN;
            }
        });

    let ice_pixels = ice.iter().filter(|&&i| i == 1).count();
    let valid_ice = Zip::from(&dx)
        .and(ice)
        .fold(0usize, |n, &x, &i| if i == 1 && x.is_finite() { n + 1 } else { n });
    let ice_coverage = if ice_pixels > 0 {
        valid_ice as f64 / ice_pixels as f64
    } else {
        0.0
    };
    if valid_ice == 0 || ice_coverage < thresholds.min_ice_coverage {
        return Err(SkipReason::InsufficientCoverage {
            fraction: ice_coverage,
            minimum: thresholds.min_ice_coverage,
        });
    }

    Zip::from(&mut dy).and(&dx).for_each(|y, &x| {
        if x.is_nan() {
            *y = f32::NAN;
        }
    });
    let mut magnitude = Array2::from_elem(dx.dim(), f32::NAN);
    Zip::from(&mut magnitude)
        .and(&dx)
        .and(&dy)
        .par_for_each(|m, &x, &y| *m = (x * x + y * y).sqrt());

    Ok(Correction {
        dx,
        dy,
        magnitude,
        ice_coverage,
        uncertainty,
    })
}

/// Read-only inputs shared by every record of one glacier
pub struct FieldCorrector<'a> {
    config: &'a ProcessingConfig,
    grid: &'a GridContext,
    loader: FieldLoader<'a>,
    reference: &'a ReferenceField,
    offsets: &'a OffsetTable,
    masks: &'a MaskSet,
    preview_vmax: f32,
}

/// Record-level failures become skips; anything else stops the glacier
fn skip_for(path: &Path, err: FlowError) -> FlowResult<SkipReason> {
    if err.is_fatal_for_glacier() {
        return Err(err);
    }
    let path = path.display().to_string();
    Ok(match err {
        FlowError::NoOverlap(_) => SkipReason::NoOverlap { path },
        FlowError::Raster(message) => SkipReason::UnreadableRaster { path, message },
        other => SkipReason::UnreadableRaster {
            path,
            message: other.to_string(),
        },
    })
}

/// Records whose product id was already claimed by an earlier record.
///
/// Two ids built from the same scene pair map onto one product directory; only the first
/// in record order is corrected.
pub fn duplicate_products(prefix: &str, glacier: &str, records: &[VelocityFieldRecord]) -> Vec<Option<SkipReason>> {
    let mut owners: HashMap<String, &str> = HashMap::new();
    records
        .iter()
        .map(|r| {
            let id = product_id(prefix, glacier, r);
            match owners.get(id.as_str()) {
                Some(&kept) => Some(SkipReason::DuplicateProduct {
                    product_id: id,
                    kept: kept.to_string(),
                }),
                None => {
                    owners.insert(id, r.id.as_str());
                    None
                }
            }
        })
        .collect()
}

impl<'a> FieldCorrector<'a> {
    pub fn new(
        config: &'a ProcessingConfig,
        grid: &'a GridContext,
        reference: &'a ReferenceField,
        offsets: &'a OffsetTable,
        masks: &'a MaskSet,
    ) -> Self {
        Self {
            config,
            grid,
            loader: FieldLoader::new(grid, &config.velocity_nodata, false),
            reference,
            offsets,
            masks,
            preview_vmax: reference.preview_vmax(),
        }
    }

    fn load_raw(&self, record: &VelocityFieldRecord, component: VelocityComponent) -> FlowResult<Result<VelocityImage, SkipReason>> {
        let path = match record.raw_raster(component) {
            Ok(path) => path,
            Err(e) => return skip_for(&record.dir, e).map(Err),
        };
        match self.loader.load_path(&path) {
            Ok(image) => Ok(Ok(image)),
            Err(e) => skip_for(&path, e).map(Err),
        }
    }

    /// Run one record through the correction state machine
    pub fn correct(&self, record: &VelocityFieldRecord) -> FlowResult<FieldOutcome> {
        let id = product_id(&self.config.product_prefix, &self.config.glacier, record);
        let paths = ProductPaths::new(
            &self.config.corrected_dir(),
            &self.config.previews_dir(),
            &id,
            &self.config.version,
        );

        if paths.vv.exists() {
            log::info!("Skipping {}: already exists", id);
            return Ok(FieldOutcome::AlreadyExists);
        }

        let pair = &record.orbit_pair;
        let (offset_dx, offset_dy) = match self.offsets.get(pair) {
            Some(offsets) => offsets,
            None => {
                let reason = SkipReason::NoOffset { pair: pair.key() };
                log::info!("Skipping {} ({}): {}", record.id, pair, reason);
                return Ok(FieldOutcome::Skipped(reason));
            }
        };

        if record.day_sep == 0.0 {
            log::warn!("Skipping {} ({}): {}", record.id, pair, SkipReason::ZeroDaySeparation);
            return Ok(FieldOutcome::Skipped(SkipReason::ZeroDaySeparation));
        }

        let raw_dx = match self.load_raw(record, VelocityComponent::Dx)? {
            Ok(image) => image,
            Err(reason) => {
                log::warn!("Skipping {} ({}): {}", record.id, pair, reason);
                return Ok(FieldOutcome::Skipped(reason));
            }
        };
        let raw_dy = match self.load_raw(record, VelocityComponent::Dy)? {
            Ok(image) => image,
            Err(reason) => {
                log::warn!("Skipping {} ({}): {}", record.id, pair, reason);
                return Ok(FieldOutcome::Skipped(reason));
            }
        };

        let correction = match apply_correction(
            &raw_dx,
            &raw_dy,
            offset_dx,
            offset_dy,
            record.day_sep,
            &self.reference.flow_direction,
            &self.masks.rock,
            &self.masks.ice,
            &self.config.thresholds,
        ) {
            Ok(correction) => correction,
            Err(reason) => {
                log::info!("Skipping {} ({}): {}", record.id, pair, reason);
                return Ok(FieldOutcome::Skipped(reason));
            }
        };

        self.write_products(record, &id, &paths, &correction)?;
        log::info!(
            "Corrected {} ({}, {:.2}% of ice area valid)",
            id,
            pair,
            correction.ice_coverage * 100.0
        );

        Ok(FieldOutcome::Corrected(CorrectedField {
            product_id: id,
            dir: paths.dir,
            ice_coverage: correction.ice_coverage,
        }))
    }

    fn write_products(
        &self,
        record: &VelocityFieldRecord,
        id: &str,
        paths: &ProductPaths,
        correction: &Correction,
    ) -> FlowResult<()> {
        std::fs::create_dir_all(&paths.dir)?;
        let transform = self.grid.geo_transform();
        let nodata = self.config.output_nodata;
        let epsg = self.grid.epsg;

        write_float_geotiff(&paths.vx, &correction.dx, &transform, epsg, nodata)?;
        write_float_geotiff(&paths.vy, &correction.dy, &transform, epsg, nodata)?;

        let metadata = FieldMetadata::new(&MetadataInputs {
            product_id: id,
            glacier: &self.config.glacier,
            version: &self.config.version,
            record,
            uncertainty: &correction.uncertainty,
            ice_coverage: correction.ice_coverage,
            grid: self.grid,
            project: &self.config.project,
        });
        metadata.write(&paths.metadata)?;

        // Magnitude last: its presence marks the record as done
        write_float_geotiff(&paths.vv, &correction.magnitude, &transform, epsg, nodata)?;

        if self.config.write_plots {
            plot::try_plot(std::fs::create_dir_all(self.config.previews_dir()).map_err(FlowError::from).and_then(|_| {
                plot::plot_velocity_map(
                    &correction.magnitude,
                    self.grid,
                    self.preview_vmax,
                    id,
                    &[paths.preview.as_path(), paths.preview_copy.as_path()],
                )
            }));
        }
        Ok(())
    }

    /// Correct every record, in parallel when enabled.
    ///
    /// Outcomes come back in record order. Records sharing a product id with an earlier
    /// record are skipped before dispatch. The first glacier-fatal error is returned.
    pub fn correct_all(&self, records: &[VelocityFieldRecord]) -> FlowResult<Vec<(String, FieldOutcome)>> {
        let duplicates = duplicate_products(&self.config.product_prefix, &self.config.glacier, records);
        let unique: Vec<&VelocityFieldRecord> = records
            .iter()
            .zip(&duplicates)
            .filter(|(_, dup)| dup.is_none())
            .map(|(r, _)| r)
            .collect();

        let results = if self.config.parallel_records {
            self.correct_records_parallel(&unique)
        } else {
            unique.iter().map(|&r| self.correct(r)).collect()
        };
        let mut results = results.into_iter();

        let mut outcomes = Vec::with_capacity(records.len());
        for (record, duplicate) in records.iter().zip(duplicates) {
            let outcome = match duplicate {
                Some(reason) => {
                    log::warn!("Skipping {} ({}): {}", record.id, record.orbit_pair, reason);
                    FieldOutcome::Skipped(reason)
                }
                None => results.next().ok_or_else(|| {
                    FlowError::Processing(format!("No correction result for {}", record.id))
                })??,
            };
            outcomes.push((record.id.clone(), outcome));
        }
        Ok(outcomes)
    }

    #[cfg(feature = "parallel")]
    fn correct_records_parallel(&self, records: &[&VelocityFieldRecord]) -> Vec<FlowResult<FieldOutcome>> {
        use rayon::prelude::*;
        records.par_iter().map(|&r| self.correct(r)).collect()
    }

    #[cfg(not(feature = "parallel"))]
    fn correct_records_parallel(&self, records: &[&VelocityFieldRecord]) -> Vec<FlowResult<FieldOutcome>> {
        records.iter().map(|&r| self.correct(r)).collect()
    }
}
