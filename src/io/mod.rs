//! I/O modules for reading scene catalogs, QA manifests and rasters

pub mod manifest;
pub mod orbit_catalog;
pub mod raster;

pub use manifest::{read_all_manifests, ManifestEntry};
pub use orbit_catalog::{OrbitCatalog, OrbitRecord};
pub use raster::{
    load_mask_onto_grid, load_onto_grid, raster_footprint, read_aoi_bounds, write_float_geotiff,
    write_mask_geotiff, Raster, Resampling,
};
