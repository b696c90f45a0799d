//! Per-orbit-pair systematic offset relative to the reference field.
//!
//! Each contributing field's difference from the reference is scaled by its own day
//! separation before the median is taken, so the stored offset is a displacement
//! equivalent. The corrector divides it by the day separation of the field it corrects.

use crate::core::despeckle::nanmedian_stack;
use crate::core::pair_table::{PairTable, VelocityFieldRecord};
use crate::core::plot;
use crate::core::reference::ReferenceField;
use crate::core::velocity_stack::FieldLoader;
use crate::io::raster::{write_float_geotiff, Raster};
use crate::types::{FlowResult, GridContext, OrbitPair, VelocityComponent, VelocityImage};
use ndarray::Zip;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Colour-scale maximum of the offset magnitude map (m)
const OFFSET_MAP_VMAX: f32 = 70.0;

/// Why no offset was produced for an orbit pair
#[derive(Debug, Clone, PartialEq)]
pub enum PairSkip {
    TooFewSamples { count: usize, minimum: usize },
    NoReadableRasters { component: VelocityComponent },
}

impl fmt::Display for PairSkip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairSkip::TooFewSamples { count, minimum } => write!(
                f,
                "insufficient velocity fields to construct median ({} fields, threshold {})",
                count, minimum
            ),
            PairSkip::NoReadableRasters { component } => {
                write!(f, "no readable {} rasters", component)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OffsetOutcome {
    Computed,
    AlreadyPresent,
    Skipped(PairSkip),
}

/// Offset products of one orbit pair
#[derive(Debug, Clone)]
pub struct OffsetPaths {
    pub dx: PathBuf,
    pub dy: PathBuf,
    pub map: PathBuf,
}

impl OffsetPaths {
    pub fn new(orbits_dir: &Path, glacier: &str, pair: &OrbitPair) -> Self {
        let file = |suffix: &str| orbits_dir.join(format!("{}_median_offset_{}_{}", glacier, pair, suffix));
        Self {
            dx: file("dx.tif"),
            dy: file("dy.tif"),
            map: file("map.png"),
        }
    }
}

/// Displacement-equivalent offset `(reference - raw) * day_sep`
pub fn displacement_offset(reference: &VelocityImage, raw: &VelocityImage, day_sep: f64) -> VelocityImage {
    let mut offset = raw.clone();
    let day_sep = day_sep as f32;
    Zip::from(&mut offset)
        .and(reference)
        .par_for_each(|o, &r| *o = (r - *o) * day_sep);
    offset
}

/// Estimates the offset field of every orbit pair with enough samples
pub struct OffsetBuilder<'a> {
    loader: FieldLoader<'a>,
    reference: &'a ReferenceField,
    min_pair_samples: usize,
    output_nodata: f32,
    write_plots: bool,
}

impl<'a> OffsetBuilder<'a> {
    pub fn new(
        loader: FieldLoader<'a>,
        reference: &'a ReferenceField,
        min_pair_samples: usize,
        output_nodata: f32,
        write_plots: bool,
    ) -> Self {
        Self {
            loader,
            reference,
            min_pair_samples,
            output_nodata,
            write_plots,
        }
    }

    /// Median displacement offset of one component over the pair's records
    fn median_offset(
        &self,
        records: &[&VelocityFieldRecord],
        component: VelocityComponent,
    ) -> FlowResult<Option<VelocityImage>> {
        let reference = self.reference.component(component);
        let stack = self.loader.load_stack(records, component)?;
        if stack.is_empty() {
            return Ok(None);
        }
        log::info!("Merging {} {} rasters", stack.len(), component);
        let offsets: Vec<VelocityImage> = stack
            .iter()
            .map(|(record, raw)| displacement_offset(reference, raw, record.day_sep))
            .collect();
        drop(stack);
        Ok(Some(nanmedian_stack(&offsets)?))
    }

    /// Offset of one orbit pair. Existing rasters are kept.
    pub fn build_pair(
        &self,
        pair: &OrbitPair,
        records: &[&VelocityFieldRecord],
        paths: &OffsetPaths,
    ) -> FlowResult<OffsetOutcome> {
        log::info!("Finding average offsets for orbit pair {}", pair);

        if records.len() < self.min_pair_samples {
            let skip = PairSkip::TooFewSamples {
                count: records.len(),
                minimum: self.min_pair_samples,
            };
            log::info!("Skipping orbit pair {}: {}", pair, skip);
            return Ok(OffsetOutcome::Skipped(skip));
        }

        if paths.dx.exists() && paths.dy.exists() {
            log::info!("Offsets for {} already exist. Skipping.", pair);
            return Ok(OffsetOutcome::AlreadyPresent);
        }

        let grid = self.loader.grid();
        let transform = grid.geo_transform();
        let mut computed = BTreeMap::new();
        for (component, out_path) in [
            (VelocityComponent::Dx, &paths.dx),
            (VelocityComponent::Dy, &paths.dy),
        ] {
            if out_path.exists() {
                log::info!("{} already exists. Skipping.", out_path.display());
                continue;
            }
            let offset = match self.median_offset(records, component)? {
                Some(offset) => offset,
                None => {
                    let skip = PairSkip::NoReadableRasters { component };
                    log::warn!("Skipping orbit pair {}: {}", pair, skip);
                    return Ok(OffsetOutcome::Skipped(skip));
                }
            };
            write_float_geotiff(out_path, &offset, &transform, grid.epsg, self.output_nodata)?;
            computed.insert(component.tag(), offset);
        }

        if self.write_plots {
            if let (Some(dx), Some(dy)) = (computed.get("dx"), computed.get("dy")) {
                let magnitude = magnitude(dx, dy);
                plot::try_plot(plot::plot_offset_map(
                    &magnitude,
                    grid,
                    OFFSET_MAP_VMAX,
                    &format!("Offset {}", pair),
                    &[paths.map.as_path()],
                ));
            }
        }

        Ok(OffsetOutcome::Computed)
    }

    /// Run every orbit pair of the table, in pair order
    pub fn build_all(
        &self,
        table: &PairTable,
        orbits_dir: &Path,
        glacier: &str,
    ) -> FlowResult<BTreeMap<OrbitPair, OffsetOutcome>> {
        let mut outcomes = BTreeMap::new();
        for (pair, records) in table.by_pair() {
            let paths = OffsetPaths::new(orbits_dir, glacier, &pair);
            let outcome = self.build_pair(&pair, &records, &paths)?;
            outcomes.insert(pair, outcome);
        }
        Ok(outcomes)
    }
}

pub fn magnitude(dx: &VelocityImage, dy: &VelocityImage) -> VelocityImage {
    let mut mag = dx.clone();
    Zip::from(&mut mag).and(dy).for_each(|m, &y| *m = (*m * *m + y * y).sqrt());
    mag
}

/// Offset fields available to the corrector, keyed by orbit pair
#[derive(Debug, Clone, Default)]
pub struct OffsetTable {
    offsets: BTreeMap<OrbitPair, (VelocityImage, VelocityImage)>,
}

impl OffsetTable {
    /// Load every pair whose dx and dy offsets are both on disk
    pub fn load<'p, I>(pairs: I, orbits_dir: &Path, glacier: &str, grid: &GridContext) -> FlowResult<Self>
    where
        I: IntoIterator<Item = &'p OrbitPair>,
    {
        let mut offsets = BTreeMap::new();
        for pair in pairs {
            let paths = OffsetPaths::new(orbits_dir, glacier, pair);
            if !(paths.dx.exists() && paths.dy.exists()) {
                continue;
            }
            let dx = Raster::read(&paths.dx, &[])?.data;
            let dy = Raster::read(&paths.dy, &[])?.data;
            grid.check_shape(&dx, &paths.dx.display().to_string())?;
            grid.check_shape(&dy, &paths.dy.display().to_string())?;
            offsets.insert(pair.clone(), (dx, dy));
        }
        log::info!("Loaded offset fields for {} orbit pairs", offsets.len());
        Ok(Self { offsets })
    }

    pub fn insert(&mut self, pair: &OrbitPair, dx: VelocityImage, dy: VelocityImage) {
        self.offsets.insert(pair.clone(), (dx, dy));
    }

    /// (dx, dy) offsets for `pair`, if the pair had enough samples
    pub fn get(&self, pair: &OrbitPair) -> Option<(&VelocityImage, &VelocityImage)> {
        self.offsets.get(pair).map(|(dx, dy)| (dx, dy))
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrbitId;
    use ndarray::array;

    #[test]
    fn test_displacement_offset_scales_by_day_sep() {
        let reference = array![[3.0, 1.0], [f32::NAN, 2.0]];
        let raw = array![[2.5, 1.5], [1.0, f32::NAN]];
        let offset = displacement_offset(&reference, &raw, 10.0);
        assert_eq!(offset[[0, 0]], 5.0);
        assert_eq!(offset[[0, 1]], -5.0);
        assert!(offset[[1, 0]].is_nan());
        assert!(offset[[1, 1]].is_nan());
    }

    #[test]
    fn test_median_of_displacement_offsets() {
        let reference = array![[2.0]];
        // Same velocity bias at different separations gives the same displacement only
        // after scaling by each field's own day separation
        let offsets = vec![
            displacement_offset(&reference, &array![[1.5]], 10.0),
            displacement_offset(&reference, &array![[1.0]], 5.0),
            displacement_offset(&reference, &array![[1.75]], 20.0),
        ];
        let median = nanmedian_stack(&offsets).unwrap();
        assert_eq!(median[[0, 0]], 5.0);
    }

    #[test]
    fn test_offset_paths_and_lookup() {
        let pair = OrbitPair::new(OrbitId::new("096").unwrap(), OrbitId::new("053").unwrap());
        let paths = OffsetPaths::new(Path::new("/o"), "g", &pair);
        assert_eq!(paths.dx, PathBuf::from("/o/g_median_offset_R096_R053_dx.tif"));
        assert_eq!(paths.map, PathBuf::from("/o/g_median_offset_R096_R053_map.png"));

        let mut table = OffsetTable::default();
        table.insert(&pair, array![[1.0]], array![[2.0]]);
        assert!(table.get(&pair).is_some());
        let reversed = OrbitPair::new(pair.second.clone(), pair.first.clone());
        assert!(table.get(&reversed).is_none());
    }

    #[test]
    fn test_magnitude() {
        let m = magnitude(&array![[3.0, f32::NAN]], &array![[4.0, 1.0]]);
        assert_eq!(m[[0, 0]], 5.0);
        assert!(m[[0, 1]].is_nan());
    }

    #[test]
    fn test_pair_skip_message_names_count() {
        let skip = PairSkip::TooFewSamples { count: 3, minimum: 5 };
        assert!(skip.to_string().contains("3 fields"));
    }
}
