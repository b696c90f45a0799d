//! Fixed rock / ice / ocean masks of one glacier, cut from tiled external masks.

use crate::config::MaskTileConfig;
use crate::io::raster::{load_mask_onto_grid, raster_footprint, write_mask_geotiff, Raster, Resampling};
use crate::types::{BoundingBox, FlowError, FlowResult, GridContext, MaskImage};
use ndarray::{Array2, Zip};
use std::path::{Path, PathBuf};

/// Mask rasters in the glacier's `masks/` directory
#[derive(Debug, Clone)]
pub struct MaskPaths {
    pub rock: PathBuf,
    pub ice: PathBuf,
    pub ocean: PathBuf,
}

impl MaskPaths {
    pub fn new(masks_dir: &Path) -> Self {
        Self {
            rock: masks_dir.join("mask_rock.tif"),
            ice: masks_dir.join("mask_ice.tif"),
            ocean: masks_dir.join("mask_ocean.tif"),
        }
    }

    pub fn all_exist(&self) -> bool {
        self.rock.exists() && self.ice.exists() && self.ocean.exists()
    }
}

/// Masks resampled onto the working grid (1 = member)
#[derive(Debug, Clone)]
pub struct MaskSet {
    pub rock: MaskImage,
    pub ice: MaskImage,
    pub ocean: MaskImage,
}

impl MaskSet {
    /// Nearest-neighbour load of the persisted masks onto `grid`
    pub fn load(paths: &MaskPaths, grid: &GridContext) -> FlowResult<Self> {
        Ok(Self {
            rock: load_mask_onto_grid(&paths.rock, grid)?,
            ice: load_mask_onto_grid(&paths.ice, grid)?,
            ocean: load_mask_onto_grid(&paths.ocean, grid)?,
        })
    }

    pub fn ice_pixel_count(&self) -> usize {
        self.ice.iter().filter(|&&v| v == 1).count()
    }
}

/// `1` where a pixel is neither ice nor ocean
pub fn rock_mask(ice: &MaskImage, ocean: &MaskImage) -> MaskImage {
    let mut rock = Array2::zeros(ice.dim());
    Zip::from(&mut rock)
        .and(ice)
        .and(ocean)
        .for_each(|r, &i, &o| *r = u8::from(i == 0 && o == 0));
    rock
}

/// Builds the mask set of one AOI from the tile directory
pub struct MaskBuilder<'a> {
    tiles: &'a MaskTileConfig,
    epsg: u32,
}

impl<'a> MaskBuilder<'a> {
    pub fn new(tiles: &'a MaskTileConfig, epsg: u32) -> Self {
        Self { tiles, epsg }
    }

    fn tile_path(&self, prefix: &str, code: &str) -> PathBuf {
        self.tiles.tile_dir.join(format!("{}{}.tif", prefix, code))
    }

    /// Codes of the ocean tiles whose footprint intersects `aoi`, sorted
    pub fn find_tiles(&self, aoi: &BoundingBox) -> FlowResult<Vec<String>> {
        let mut codes = Vec::new();
        for entry in std::fs::read_dir(&self.tiles.tile_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let code = match name
                .strip_prefix(self.tiles.ocean_prefix.as_str())
                .and_then(|rest| rest.strip_suffix(".tif"))
            {
                Some(code) => code.to_string(),
                None => continue,
            };
            let (_, footprint) = raster_footprint(entry.path())?;
            if footprint.intersects(aoi) {
                codes.push(code);
            }
        }
        codes.sort();
        Ok(codes)
    }

    /// Merge tiles over their combined extent at the first tile's resolution
    fn mosaic(&self, paths: &[PathBuf]) -> FlowResult<Raster> {
        let tiles: Vec<Raster> = paths
            .iter()
            .map(|p| Raster::read(p, &[]))
            .collect::<FlowResult<_>>()?;
        let first = tiles
            .first()
            .ok_or_else(|| FlowError::Processing("No mask tiles to merge".to_string()))?;
        if tiles.len() == 1 {
            return Ok(first.clone());
        }

        let extent = tiles
            .iter()
            .skip(1)
            .fold(first.bounds(), |acc, t| acc.union(&t.bounds()));
        let grid = GridContext::new(extent, first.transform.pixel_width.abs(), self.epsg)?;

        let mut merged = Array2::from_elem(grid.shape(), f32::NAN);
        for tile in &tiles {
            let warped = tile.resample_to_grid(&grid, Resampling::Nearest)?;
            Zip::from(&mut merged).and(&warped).for_each(|m, &w| {
                if m.is_nan() && w.is_finite() {
                    *m = w;
                }
            });
        }

        Ok(Raster {
            data: merged,
            transform: grid.geo_transform(),
            projection: first.projection.clone(),
        })
    }

    fn merged_crop(&self, prefix: &str, codes: &[String], aoi: &BoundingBox) -> FlowResult<Raster> {
        let paths: Vec<PathBuf> = codes.iter().map(|c| self.tile_path(prefix, c)).collect();
        for p in &paths {
            if !p.exists() {
                return Err(FlowError::Processing(format!("Cannot find mask tile {}", p.display())));
            }
        }
        self.mosaic(&paths)?.crop(aoi)
    }

    /// Write rock/ice/ocean masks for `aoi` unless they already exist
    pub fn build(&self, aoi: &BoundingBox, paths: &MaskPaths) -> FlowResult<()> {
        if paths.all_exist() {
            log::info!("Masks already exist in {}", paths.rock.parent().unwrap_or(Path::new(".")).display());
            return Ok(());
        }

        let codes = self.find_tiles(aoi)?;
        if codes.is_empty() {
            return Err(FlowError::Processing(format!(
                "No mask tiles in {} intersect the AOI {:?}",
                self.tiles.tile_dir.display(),
                aoi
            )));
        }
        log::info!("Building masks from tiles {:?}", codes);

        let ocean = self.merged_crop(&self.tiles.ocean_prefix, &codes, aoi)?;
        let ice = self.merged_crop(&self.tiles.ice_prefix, &codes, aoi)?;
        if ocean.shape() != ice.shape() {
            return Err(FlowError::GridMismatch(format!(
                "ice mask {:?} vs ocean mask {:?}",
                ice.shape(),
                ocean.shape()
            )));
        }

        let to_mask = |r: &Raster| -> MaskImage { r.data.mapv(|v| u8::from(v == 1.0)) };
        let ice_mask = to_mask(&ice);
        let ocean_mask = to_mask(&ocean);
        let rock = rock_mask(&ice_mask, &ocean_mask);

        write_mask_geotiff(&paths.ice, &ice_mask, &ice.transform, self.epsg)?;
        write_mask_geotiff(&paths.ocean, &ocean_mask, &ice.transform, self.epsg)?;
        write_mask_geotiff(&paths.rock, &rock, &ice.transform, self.epsg)?;
        log::info!("Wrote rock, ice and ocean masks ({} x {})", ice.shape().1, ice.shape().0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_rock_is_neither_ice_nor_ocean() {
        let ice = array![[1u8, 0, 0], [0, 1, 0]];
        let ocean = array![[0u8, 1, 0], [0, 0, 1]];
        assert_eq!(rock_mask(&ice, &ocean), array![[0u8, 0, 1], [1, 0, 0]]);
    }

    #[test]
    fn test_mask_paths() {
        let paths = MaskPaths::new(Path::new("/out/g/masks"));
        assert_eq!(paths.rock, PathBuf::from("/out/g/masks/mask_rock.tif"));
        assert!(!paths.all_exist());
    }
}
