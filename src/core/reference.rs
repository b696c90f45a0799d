//! A priori velocity field: per-pixel median of all repeat-track fields.

use crate::core::despeckle::{despeckle, nanmedian_stack};
use crate::core::pair_table::PairTable;
use crate::core::plot;
use crate::core::velocity_stack::FieldLoader;
use crate::io::raster::{write_float_geotiff, Raster};
use crate::types::{FlowError, FlowResult, GridContext, VelocityComponent, VelocityImage};
use ndarray::{Array2, Zip};
use std::path::{Path, PathBuf};

/// Colour-scale maximum of the reference magnitude map
const REFERENCE_MAP_VMAX: f32 = 30.0;

/// Flow direction in degrees anticlockwise from the x axis, in (-180, 180].
///
/// `atan(dy/dx)` shifted by 180 where `dx <= 0` (or NaN), then wrapped.
pub fn flow_direction_deg(dx: f32, dy: f32) -> f32 {
    let mut angle = (dy / dx).atan().to_degrees();
    if !(dx > 0.0) {
        angle += 180.0;
    }
    if angle > 180.0 {
        angle -= 360.0;
    }
    angle
}

pub fn flow_direction(dx: &VelocityImage, dy: &VelocityImage) -> VelocityImage {
    let mut angle = Array2::from_elem(dx.dim(), f32::NAN);
    Zip::from(&mut angle)
        .and(dx)
        .and(dy)
        .par_for_each(|a, &x, &y| *a = flow_direction_deg(x, y));
    angle
}

/// Absolute difference of two directions in degrees, wrapped into [0, 180]
pub fn angle_difference(reference: f32, angle: f32) -> f32 {
    let diff = (reference - angle).abs();
    if diff > 180.0 {
        360.0 - diff
    } else {
        diff
    }
}

/// Percentile of the finite values with linear interpolation between ranks
pub fn nanpercentile(image: &VelocityImage, q: f64) -> Option<f32> {
    let mut values: Vec<f32> = image.iter().cloned().filter(|v| v.is_finite()).collect();
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = q.clamp(0.0, 100.0) / 100.0 * (values.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = (rank - lo as f64) as f32;
    Some(values[lo] + (values[hi] - values[lo]) * frac)
}

/// Persisted reference products of one glacier
#[derive(Debug, Clone)]
pub struct ReferencePaths {
    pub dx: PathBuf,
    pub dy: PathBuf,
    pub dmag: PathBuf,
    pub flowdir: PathBuf,
    pub map: PathBuf,
}

impl ReferencePaths {
    pub fn new(orbits_dir: &Path, glacier: &str) -> Self {
        let file = |suffix: &str| orbits_dir.join(format!("{}_median_orbitmatch_{}", glacier, suffix));
        Self {
            dx: file("dx.tif"),
            dy: file("dy.tif"),
            dmag: file("dmag.tif"),
            flowdir: file("flowdir.tif"),
            map: file("map.png"),
        }
    }

    pub fn component(&self, component: VelocityComponent) -> &Path {
        match component {
            VelocityComponent::Dx => &self.dx,
            VelocityComponent::Dy => &self.dy,
            VelocityComponent::Dmag => &self.dmag,
        }
    }

    pub fn all_exist(&self) -> bool {
        [&self.dx, &self.dy, &self.dmag, &self.flowdir]
            .iter()
            .all(|p| p.exists())
    }
}

/// Median repeat-track field on the working grid
#[derive(Debug, Clone)]
pub struct ReferenceField {
    pub dx: VelocityImage,
    pub dy: VelocityImage,
    pub dmag: VelocityImage,
    pub flow_direction: VelocityImage,
}

impl ReferenceField {
    pub fn component(&self, component: VelocityComponent) -> &VelocityImage {
        match component {
            VelocityComponent::Dx => &self.dx,
            VelocityComponent::Dy => &self.dy,
            VelocityComponent::Dmag => &self.dmag,
        }
    }

    /// Read persisted reference rasters; they are already on the grid
    pub fn load(paths: &ReferencePaths, grid: &GridContext) -> FlowResult<Self> {
        let read = |path: &Path| -> FlowResult<VelocityImage> {
            if !path.exists() {
                return Err(FlowError::MissingReference(path.display().to_string()));
            }
            let raster = Raster::read(path, &[])?;
            grid.check_shape(&raster.data, &path.display().to_string())?;
            Ok(raster.data)
        };
        Ok(Self {
            dx: read(&paths.dx)?,
            dy: read(&paths.dy)?,
            dmag: read(&paths.dmag)?,
            flow_direction: read(&paths.flowdir)?,
        })
    }

    /// Colour-scale maximum for velocity previews: p95 of the reference magnitude,
    /// rounded up to the next multiple of ten
    pub fn preview_vmax(&self) -> f32 {
        nanpercentile(&self.dmag, 95.0)
            .map(|p| ((p / 10.0).ceil() * 10.0).max(10.0))
            .unwrap_or(REFERENCE_MAP_VMAX)
    }
}

/// Builds (or reuses) the reference field of one glacier
pub struct ReferenceBuilder<'a> {
    loader: FieldLoader<'a>,
    despeckle_reference: bool,
    output_nodata: f32,
    write_plots: bool,
}

impl<'a> ReferenceBuilder<'a> {
    pub fn new(loader: FieldLoader<'a>, despeckle_reference: bool, output_nodata: f32, write_plots: bool) -> Self {
        Self {
            loader,
            despeckle_reference,
            output_nodata,
            write_plots,
        }
    }

    /// Build every missing reference raster from the repeat-track records.
    ///
    /// When all rasters are already on disk nothing is recomputed and no velocity raster is
    /// read. An empty repeat-track set is fatal.
    pub fn build(&self, table: &PairTable, paths: &ReferencePaths, glacier: &str) -> FlowResult<ReferenceField> {
        let grid = self.loader.grid();
        if paths.all_exist() {
            log::info!("Reference field for {} already exists; reusing it", glacier);
            return ReferenceField::load(paths, grid);
        }

        let repeat = table.repeat_track();
        if repeat.is_empty() {
            return Err(FlowError::NoRepeatTrack(glacier.to_string()));
        }
        log::info!("Building reference field from {} repeat-track fields", repeat.len());

        let transform = grid.geo_transform();
        let mut built_dmag = None;
        for component in [VelocityComponent::Dmag, VelocityComponent::Dx, VelocityComponent::Dy] {
            let out_path = paths.component(component);
            if out_path.exists() {
                log::info!("{} already exists. Skipping.", out_path.display());
                continue;
            }

            let stack: Vec<VelocityImage> = self
                .loader
                .load_stack(&repeat, component)?
                .into_iter()
                .map(|(_, image)| image)
                .collect();
            if stack.is_empty() {
                return Err(FlowError::MissingReference(format!(
                    "no readable repeat-track {} rasters for {}",
                    component, glacier
                )));
            }
            log::info!("Merging {} {} rasters", stack.len(), component);
            let mut median = nanmedian_stack(&stack)?;
            drop(stack);
            if self.despeckle_reference {
                median = despeckle(&median)?;
            }
            write_float_geotiff(out_path, &median, &transform, grid.epsg, self.output_nodata)?;

            if component == VelocityComponent::Dmag {
                built_dmag = Some(median);
            }
        }

        if let Some(dmag) = built_dmag.filter(|_| self.write_plots) {
            plot::try_plot(plot::plot_velocity_map(
                &dmag,
                grid,
                REFERENCE_MAP_VMAX,
                &format!("{} repeat-track median", glacier),
                &[paths.map.as_path()],
            ));
        }

        if !paths.flowdir.exists() {
            log::info!("Calculating flow direction of the reference field");
            let dx = Raster::read(&paths.dx, &[])?.data;
            let dy = Raster::read(&paths.dy, &[])?.data;
            let angle = flow_direction(&dx, &dy);
            write_float_geotiff(&paths.flowdir, &angle, &transform, grid.epsg, self.output_nodata)?;
        }

        ReferenceField::load(paths, grid)
    }
}
