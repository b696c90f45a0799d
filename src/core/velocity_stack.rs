//! Loading raw velocity rasters of one or many records onto the working grid.

use crate::core::despeckle::despeckle;
use crate::core::pair_table::VelocityFieldRecord;
use crate::io::raster::{load_mask_onto_grid, load_onto_grid, Resampling};
use crate::types::{FlowResult, GridContext, VelocityComponent, VelocityImage};
use rayon::prelude::*;
use std::path::{Path, PathBuf};

/// Validity mask stored next to a raw raster: `<name up to last '_'>_mask.tif`
pub fn validity_mask_path(raster: &Path) -> Option<PathBuf> {
    let name = raster.file_name()?.to_string_lossy().to_string();
    let (prefix, _) = name.rsplit_once('_')?;
    Some(raster.with_file_name(format!("{}_mask.tif", prefix)))
}

/// Reads record rasters onto one grid, applying validity masks and optional despeckle
#[derive(Debug, Clone)]
pub struct FieldLoader<'a> {
    grid: &'a GridContext,
    nodata_values: &'a [f32],
    despeckle: bool,
}

impl<'a> FieldLoader<'a> {
    pub fn new(grid: &'a GridContext, nodata_values: &'a [f32], despeckle: bool) -> Self {
        Self {
            grid,
            nodata_values,
            despeckle,
        }
    }

    /// Same loader with despeckle switched on or off
    pub fn with_despeckle(&self, despeckle: bool) -> Self {
        Self { despeckle, ..self.clone() }
    }

    pub fn grid(&self) -> &GridContext {
        self.grid
    }

    /// Load one raster file, masked by its sibling validity mask if present
    pub fn load_path(&self, path: &Path) -> FlowResult<VelocityImage> {
        let mut image = load_onto_grid(path, self.grid, Resampling::Bilinear, self.nodata_values)?;
        self.grid.check_shape(&image, &path.display().to_string())?;

        if let Some(mask_path) = validity_mask_path(path).filter(|p| p.exists()) {
            log::debug!("Applying validity mask {}", mask_path.display());
            let valid = load_mask_onto_grid(&mask_path, self.grid)?;
            // Pixels outside the mask footprint load as 0 and are masked too
            image.zip_mut_with(&valid, |v, &m| {
                if m == 0 {
                    *v = f32::NAN;
                }
            });
        }

        if self.despeckle {
            image = despeckle(&image)?;
        }
        Ok(image)
    }

    pub fn load(&self, record: &VelocityFieldRecord, component: VelocityComponent) -> FlowResult<VelocityImage> {
        let path = record.raw_raster(component)?;
        self.load_path(&path)
    }

    /// Load `component` of every record in parallel, keeping each image with its record.
    ///
    /// Records whose raster cannot be read or does not overlap the grid are left out with a
    /// warning; any glacier-fatal error, such as a raster landing on a different shape,
    /// aborts the stack.
    pub fn load_stack<'r>(
        &self,
        records: &[&'r VelocityFieldRecord],
        component: VelocityComponent,
    ) -> FlowResult<Vec<(&'r VelocityFieldRecord, VelocityImage)>> {
        let loaded: Vec<(&'r VelocityFieldRecord, FlowResult<VelocityImage>)> = records
            .par_iter()
            .map(|&r| (r, self.load(r, component)))
            .collect();

        let mut stack = Vec::with_capacity(loaded.len());
        for (record, result) in loaded {
            match result {
                Ok(image) => stack.push((record, image)),
                Err(e) if e.is_fatal_for_glacier() => return Err(e),
                Err(e) => log::warn!("Leaving {} {} out of the stack: {}", record.id, component, e),
            }
        }
        log::debug!("Loaded {} of {} {} rasters", stack.len(), records.len(), component);
        Ok(stack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validity_mask_path() {
        let p = Path::new("/vel/vmap_20200701T15_20200711T15/vmap_20200701T15_20200711T15_dx.tif");
        assert_eq!(
            validity_mask_path(p).unwrap(),
            PathBuf::from("/vel/vmap_20200701T15_20200711T15/vmap_20200701T15_20200711T15_mask.tif")
        );
        assert!(validity_mask_path(Path::new("/vel/nounderscore.tif")).is_none());
    }
}
