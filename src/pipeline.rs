//! Per-glacier correction pipeline and the glacier worker pool.

use crate::config::{AoiSource, ProcessingConfig};
use crate::core::correct::{FieldCorrector, FieldOutcome};
use crate::core::masks::{MaskBuilder, MaskPaths, MaskSet};
use crate::core::offset::{OffsetBuilder, OffsetOutcome, OffsetTable};
use crate::core::pair_table::PairTable;
use crate::core::plot;
use crate::core::reference::{ReferenceBuilder, ReferencePaths};
use crate::core::velocity_stack::FieldLoader;
use crate::io::manifest::read_all_manifests;
use crate::io::orbit_catalog::OrbitCatalog;
use crate::io::raster::{raster_footprint, read_aoi_bounds};
use crate::types::{BoundingBox, FlowError, FlowResult, GridContext, VelocityComponent};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Counts describing one finished glacier
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlacierSummary {
    pub glacier: String,
    pub scenes: usize,
    pub records: usize,
    pub repeat_track_records: usize,
    pub offsets_computed: usize,
    pub offsets_present: usize,
    pub pairs_skipped: usize,
    pub corrected: usize,
    pub already_present: usize,
    pub skipped: usize,
    /// Outcome of every record, by record id
    pub outcomes: BTreeMap<String, FieldOutcome>,
}

/// Result of one glacier, fatal errors included
#[derive(Debug)]
pub struct GlacierReport {
    pub glacier: String,
    pub result: FlowResult<GlacierSummary>,
}

impl GlacierReport {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Runs every stage of one glacier in order
pub struct GlacierPipeline {
    config: ProcessingConfig,
}

impl GlacierPipeline {
    /// Pipeline over `config` with its `{glacier}` path placeholders resolved
    pub fn new(config: ProcessingConfig) -> Self {
        Self {
            config: config.resolved(),
        }
    }

    pub fn config(&self) -> &ProcessingConfig {
        &self.config
    }

    fn aoi_bounds(&self) -> FlowResult<BoundingBox> {
        match &self.config.aoi {
            AoiSource::Vector { path, attribute } => read_aoi_bounds(
                path,
                attribute.as_deref().map(|a| (a, self.config.glacier.as_str())),
            ),
            AoiSource::Bounds { xmin, ymin, xmax, ymax } => BoundingBox::new(*xmin, *ymin, *xmax, *ymax),
        }
    }

    /// Working grid: AOI bounds at the template raster's pixel size
    fn working_grid(&self, table: &PairTable) -> FlowResult<GridContext> {
        let aoi = self.aoi_bounds()?;
        let template: PathBuf = match &self.config.grid_template {
            Some(path) => path.clone(),
            None => table
                .records()
                .iter()
                .find_map(|r| r.raw_raster(VelocityComponent::Dmag).ok())
                .ok_or_else(|| {
                    FlowError::Config(format!(
                        "No grid_template configured and no dmag raster found for {}",
                        self.config.glacier
                    ))
                })?,
        };
        log::info!("Working grid template: {}", template.display());
        let (transform, _) = raster_footprint(&template)?;
        let grid = GridContext::from_transform(aoi, &transform, self.config.epsg)?;
        log::info!(
            "Working grid: {} x {} pixels at {} m",
            grid.width,
            grid.height,
            grid.pixel_size
        );
        Ok(grid)
    }

    /// Catalog, manifests and pair table, with their CSV and chart outputs
    pub fn build_pair_table(&self) -> FlowResult<(OrbitCatalog, PairTable)> {
        let config = &self.config;
        let glacier = &config.glacier;
        let orbits_dir = config.orbits_dir();
        let (start, end) = config.date_range()?;

        let catalog = OrbitCatalog::from_directory(&config.image_dir, start, end)?;
        if catalog.is_empty() {
            return Err(FlowError::EmptyCatalog(format!(
                "no scenes in {} between {} and {}",
                config.image_dir.display(),
                config.start_date,
                config.end_date
            )));
        }
        catalog.write_csv(orbits_dir.join(format!("{}_orbits.csv", glacier)))?;

        let entries = read_all_manifests(&config.velocity_dir, glacier)?;
        let table = PairTable::build(&entries, &catalog, &config.velocity_dir, start, end)?;
        table.write_csv(orbits_dir.join(format!("{}_orbit_pairs.csv", glacier)))?;
        if config.write_plots {
            plot::try_plot(plot::plot_pair_counts(
                &table.pair_counts(),
                &orbits_dir.join(format!("{}_orbit_pairs.png", glacier)),
            ));
        }
        Ok((catalog, table))
    }

    /// Run the glacier end to end
    pub fn run(&self) -> FlowResult<GlacierSummary> {
        let config = &self.config;
        let glacier = config.glacier.as_str();
        log::info!("Processing glacier {}", glacier);

        let orbits_dir = config.orbits_dir();
        for dir in [&orbits_dir, &config.masks_dir(), &config.corrected_dir()] {
            std::fs::create_dir_all(dir)?;
        }

        let (catalog, table) = self.build_pair_table()?;
        let grid = self.working_grid(&table)?;

        let mask_paths = MaskPaths::new(&config.masks_dir());
        MaskBuilder::new(&config.masks, config.epsg).build(&grid.bounds, &mask_paths)?;
        let masks = MaskSet::load(&mask_paths, &grid)?;
        log::info!("Ice mask covers {} pixels", masks.ice_pixel_count());

        let loader = FieldLoader::new(&grid, &config.velocity_nodata, config.despeckle_inputs);
        let reference = ReferenceBuilder::new(
            loader.clone(),
            config.despeckle_reference,
            config.output_nodata,
            config.write_plots,
        )
        .build(&table, &ReferencePaths::new(&orbits_dir, glacier), glacier)?;

        let offset_outcomes = OffsetBuilder::new(
            loader,
            &reference,
            config.thresholds.min_pair_samples,
            config.output_nodata,
            config.write_plots,
        )
        .build_all(&table, &orbits_dir, glacier)?;

        let pairs = table.by_pair();
        let offsets = OffsetTable::load(pairs.keys(), &orbits_dir, glacier, &grid)?;

        let corrector = FieldCorrector::new(config, &grid, &reference, &offsets, &masks);
        let outcomes = corrector.correct_all(table.records())?;

        let mut summary = GlacierSummary {
            glacier: glacier.to_string(),
            scenes: catalog.len(),
            records: table.len(),
            repeat_track_records: table.repeat_track().len(),
            ..Default::default()
        };
        for outcome in offset_outcomes.values() {
            match outcome {
                OffsetOutcome::Computed => summary.offsets_computed += 1,
                OffsetOutcome::AlreadyPresent => summary.offsets_present += 1,
                OffsetOutcome::Skipped(_) => summary.pairs_skipped += 1,
            }
        }
        for (id, outcome) in outcomes {
            match &outcome {
                FieldOutcome::Corrected(_) => summary.corrected += 1,
                FieldOutcome::AlreadyExists => summary.already_present += 1,
                FieldOutcome::Skipped(_) => summary.skipped += 1,
            }
            summary.outcomes.insert(id, outcome);
        }

        log::info!(
            "Finished {}: {} corrected, {} already present, {} skipped of {} records",
            glacier,
            summary.corrected,
            summary.already_present,
            summary.skipped,
            summary.records
        );
        Ok(summary)
    }
}

fn run_one(config: ProcessingConfig) -> GlacierReport {
    let glacier = config.glacier.clone();
    let result = GlacierPipeline::new(config).run();
    if let Err(e) = &result {
        log::error!("Glacier {} failed: {}", glacier, e);
    }
    GlacierReport { glacier, result }
}

/// Process independent glaciers on a pool of `workers` threads (0 = one per CPU).
///
/// A failed glacier is reported in its `GlacierReport` and never stops the others.
#[cfg(feature = "parallel")]
pub fn process_glaciers(configs: Vec<ProcessingConfig>, workers: usize) -> FlowResult<Vec<GlacierReport>> {
    use rayon::prelude::*;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|e| FlowError::Processing(format!("Failed to start worker pool: {}", e)))?;
    log::info!(
        "Processing {} glaciers on {} workers",
        configs.len(),
        pool.current_num_threads()
    );
    Ok(pool.install(|| configs.into_par_iter().map(run_one).collect()))
}

#[cfg(not(feature = "parallel"))]
pub fn process_glaciers(configs: Vec<ProcessingConfig>, _workers: usize) -> FlowResult<Vec<GlacierReport>> {
    Ok(configs.into_iter().map(run_one).collect())
}
