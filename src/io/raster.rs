use crate::types::{BoundingBox, FlowError, FlowResult, GeoTransform, GridContext, MaskImage, VelocityImage};
use gdal::raster::Buffer;
use gdal::spatial_ref::SpatialRef;
use gdal::vector::LayerAccess;
use gdal::{Dataset, DriverManager};
use ndarray::{Array2, Zip};
use std::path::Path;

/// Resampling used when warping a raster onto the working grid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resampling {
    /// Categorical data (masks)
    Nearest,
    /// Continuous data (velocities); no-data neighbours are dropped from the weights
    Bilinear,
}

/// Single-band raster held in memory together with its georeferencing
#[derive(Debug, Clone)]
pub struct Raster {
    pub data: VelocityImage,
    pub transform: GeoTransform,
    /// WKT of the source projection, empty if unknown
    pub projection: String,
}

impl Raster {
    /// Read band 1 of a GDAL-readable raster as `f32`.
    ///
    /// The band's own no-data value and every value in `nodata_values` become NaN.
    pub fn read<P: AsRef<Path>>(path: P, nodata_values: &[f32]) -> FlowResult<Self> {
        log::debug!("Reading raster: {}", path.as_ref().display());

        let dataset = Dataset::open(path.as_ref())?;
        let transform = GeoTransform::from_gdal(dataset.geo_transform()?);
        let projection = dataset.projection();
        let (width, height) = dataset.raster_size();

        let rasterband = dataset.rasterband(1)?;
        let band_nodata = rasterband.no_data_value();
        let band_data = rasterband.read_as::<f32>((0, 0), (width, height), (width, height), None)?;

        let mut data = Array2::from_shape_vec((height, width), band_data.data).map_err(|e| {
            FlowError::Raster(format!(
                "Failed to reshape {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        data.mapv_inplace(|v| {
            let is_band_nodata = band_nodata.map_or(false, |nd| (v as f64) == nd);
            if is_band_nodata || nodata_values.iter().any(|&nd| v == nd) {
                f32::NAN
            } else {
                v
            }
        });

        Ok(Self { data, transform, projection })
    }

    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    pub fn bounds(&self) -> BoundingBox {
        self.transform.bounds(self.shape())
    }

    /// Cut out the pixels covering `bounds`, keeping this raster's own pixel grid
    pub fn crop(&self, bounds: &BoundingBox) -> FlowResult<Raster> {
        if !self.bounds().intersects(bounds) {
            return Err(FlowError::NoOverlap(format!(
                "raster {:?} vs bounds {:?}",
                self.bounds(),
                bounds
            )));
        }
        let (rows, cols) = self.shape();
        let gt = &self.transform;

        let (c0, r0) = gt.map_to_pixel(bounds.min_x, bounds.max_y);
        let (c1, r1) = gt.map_to_pixel(bounds.max_x, bounds.min_y);
        let col_start = c0.min(c1).floor().max(0.0) as usize;
        let col_end = (c0.max(c1).ceil() as usize).min(cols);
        let row_start = r0.min(r1).floor().max(0.0) as usize;
        let row_end = (r0.max(r1).ceil() as usize).min(rows);

        if col_start >= col_end || row_start >= row_end {
            return Err(FlowError::NoOverlap(format!("empty crop window for {:?}", bounds)));
        }

        let data = self
            .data
            .slice(ndarray::s![row_start..row_end, col_start..col_end])
            .to_owned();
        let transform = GeoTransform {
            top_left_x: gt.top_left_x + col_start as f64 * gt.pixel_width,
            top_left_y: gt.top_left_y + row_start as f64 * gt.pixel_height,
            ..*gt
        };

        Ok(Raster {
            data,
            transform,
            projection: self.projection.clone(),
        })
    }

    /// Warp this raster onto `grid`. Pixels outside the source footprint are NaN.
    pub fn resample_to_grid(&self, grid: &GridContext, method: Resampling) -> FlowResult<VelocityImage> {
        if !self.bounds().intersects(&grid.bounds) {
            return Err(FlowError::NoOverlap(format!(
                "raster {:?} does not intersect grid {:?}",
                self.bounds(),
                grid.bounds
            )));
        }

        let (src_rows, src_cols) = self.shape();
        let mut resampled = Array2::from_elem(grid.shape(), f32::NAN);

        Zip::indexed(&mut resampled).par_for_each(|(row, col), value| {
            let (x, y) = grid.pixel_center(row, col);
            let (src_col, src_row) = self.transform.map_to_pixel(x, y);

            if src_col < 0.0
                || src_row < 0.0
                || src_col >= src_cols as f64
                || src_row >= src_rows as f64
            {
                return;
            }

            *value = match method {
                Resampling::Nearest => self.data[[src_row as usize, src_col as usize]],
                Resampling::Bilinear => bilinear_sample(&self.data, src_col - 0.5, src_row - 0.5),
            };
        });

        Ok(resampled)
    }
}

/// Bilinear interpolation at a pixel-centre based coordinate.
/// Non-finite neighbours are excluded and the remaining weights renormalised.
fn bilinear_sample(image: &Array2<f32>, col: f64, row: f64) -> f32 {
    let (rows, cols) = image.dim();
    let col = col.clamp(0.0, (cols - 1) as f64);
    let row = row.clamp(0.0, (rows - 1) as f64);

    let x1 = col.floor() as usize;
    let y1 = row.floor() as usize;
    let x2 = (x1 + 1).min(cols - 1);
    let y2 = (y1 + 1).min(rows - 1);
    let dx = col - x1 as f64;
    let dy = row - y1 as f64;

    let samples = [
        (image[[y1, x1]], (1.0 - dx) * (1.0 - dy)),
        (image[[y1, x2]], dx * (1.0 - dy)),
        (image[[y2, x1]], (1.0 - dx) * dy),
        (image[[y2, x2]], dx * dy),
    ];

    let mut sum = 0.0;
    let mut weight = 0.0;
    for (v, w) in samples {
        if v.is_finite() && w > 0.0 {
            sum += v as f64 * w;
            weight += w;
        }
    }

    if weight > 0.0 {
        (sum / weight) as f32
    } else {
        f32::NAN
    }
}

/// Read a raster and warp it onto the working grid in one go
pub fn load_onto_grid<P: AsRef<Path>>(
    path: P,
    grid: &GridContext,
    method: Resampling,
    nodata_values: &[f32],
) -> FlowResult<VelocityImage> {
    let raster = Raster::read(path.as_ref(), nodata_values)?;
    raster.resample_to_grid(grid, method)
}

/// Read a categorical mask onto the working grid (nearest neighbour, value 1 = member)
pub fn load_mask_onto_grid<P: AsRef<Path>>(path: P, grid: &GridContext) -> FlowResult<MaskImage> {
    let resampled = load_onto_grid(path, grid, Resampling::Nearest, &[])?;
    Ok(resampled.mapv(|v| u8::from(v == 1.0)))
}

fn assign_crs(dataset: &mut Dataset, epsg: u32) {
    match SpatialRef::from_epsg(epsg).and_then(|srs| dataset.set_spatial_ref(&srs)) {
        Ok(()) => {}
        Err(e) => log::warn!("Could not assign EPSG:{} to output raster: {}", epsg, e),
    }
}

/// Save a float raster as single-band GeoTIFF; NaN is written as `nodata`
pub fn write_float_geotiff<P: AsRef<Path>>(
    path: P,
    image: &Array2<f32>,
    transform: &GeoTransform,
    epsg: u32,
    nodata: f32,
) -> FlowResult<()> {
    log::debug!("Writing GeoTIFF: {}", path.as_ref().display());

    let driver = DriverManager::get_driver_by_name("GTiff")?;
    let (height, width) = image.dim();

    let mut dataset = driver.create_with_band_type::<f32, _>(
        path.as_ref(),
        width as isize,
        height as isize,
        1,
    )?;
    dataset.set_geo_transform(&transform.to_gdal())?;
    assign_crs(&mut dataset, epsg);

    let mut rasterband = dataset.rasterband(1)?;
    let flat_data: Vec<f32> = image
        .iter()
        .map(|&v| if v.is_finite() { v } else { nodata })
        .collect();
    let buffer = Buffer::new((width, height), flat_data);
    rasterband.write((0, 0), (width, height), &buffer)?;
    rasterband.set_no_data_value(Some(nodata as f64))?;

    Ok(())
}

/// Save a categorical mask as single-band byte GeoTIFF
pub fn write_mask_geotiff<P: AsRef<Path>>(
    path: P,
    mask: &MaskImage,
    transform: &GeoTransform,
    epsg: u32,
) -> FlowResult<()> {
    log::debug!("Writing mask GeoTIFF: {}", path.as_ref().display());

    let driver = DriverManager::get_driver_by_name("GTiff")?;
    let (height, width) = mask.dim();

    let mut dataset = driver.create_with_band_type::<u8, _>(
        path.as_ref(),
        width as isize,
        height as isize,
        1,
    )?;
    dataset.set_geo_transform(&transform.to_gdal())?;
    assign_crs(&mut dataset, epsg);

    let mut rasterband = dataset.rasterband(1)?;
    let flat_data: Vec<u8> = mask.iter().cloned().collect();
    let buffer = Buffer::new((width, height), flat_data);
    rasterband.write((0, 0), (width, height), &buffer)?;

    Ok(())
}

/// Pixel transform and bounds of a raster without reading its pixels
pub fn raster_footprint<P: AsRef<Path>>(path: P) -> FlowResult<(GeoTransform, BoundingBox)> {
    let dataset = Dataset::open(path.as_ref())?;
    let transform = GeoTransform::from_gdal(dataset.geo_transform()?);
    let (width, height) = dataset.raster_size();
    Ok((transform, transform.bounds((height, width))))
}

/// Extent of the AOI polygon in the first layer of a vector file.
///
/// `select` is an `(attribute, value)` pair; when given, only features whose attribute
/// equals `value` contribute to the extent. Otherwise the whole layer does.
pub fn read_aoi_bounds<P: AsRef<Path>>(path: P, select: Option<(&str, &str)>) -> FlowResult<BoundingBox> {
    log::info!("Reading AOI polygon: {}", path.as_ref().display());

    let dataset = Dataset::open(path.as_ref())?;
    let mut layer = dataset.layer(0)?;
    let feature_count = layer.feature_count();
    if feature_count == 0 {
        return Err(FlowError::Config(format!(
            "AOI layer in {} has no features",
            path.as_ref().display()
        )));
    }

    let (attribute, value) = match select {
        Some(select) => select,
        None => {
            if feature_count > 1 {
                log::warn!(
                    "AOI layer has {} features; using the extent of all of them",
                    feature_count
                );
            }
            let envelope = layer.get_extent()?;
            return BoundingBox::new(envelope.MinX, envelope.MinY, envelope.MaxX, envelope.MaxY);
        }
    };

    let mut extent: Option<BoundingBox> = None;
    for feature in layer.features() {
        if feature.field_as_string_by_name(attribute)?.as_deref() != Some(value) {
            continue;
        }
        let envelope = feature.geometry_by_index(0)?.envelope();
        let bounds = BoundingBox {
            min_x: envelope.MinX,
            min_y: envelope.MinY,
            max_x: envelope.MaxX,
            max_y: envelope.MaxY,
        };
        extent = Some(match extent {
            Some(acc) => acc.union(&bounds),
            None => bounds,
        });
    }

    let extent = extent.ok_or_else(|| {
        FlowError::Config(format!(
            "No AOI feature with {} = '{}' in {}",
            attribute,
            value,
            path.as_ref().display()
        ))
    })?;
    BoundingBox::new(extent.min_x, extent.min_y, extent.max_x, extent.max_y)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bilinear_skips_nan_neighbours() {
        let image = Array2::from_shape_vec((2, 2), vec![1.0, f32::NAN, 3.0, 5.0]).unwrap();
        // Centre of the four pixels: NaN neighbour dropped, mean of the other three
        let v = bilinear_sample(&image, 0.5, 0.5);
        assert!((v - 3.0).abs() < 1e-6);
        // Exactly on a pixel centre returns that pixel
        assert_eq!(bilinear_sample(&image, 0.0, 1.0), 3.0);
    }

    #[test]
    fn test_resample_identity_and_shift() {
        let bounds = BoundingBox::new(0.0, 0.0, 40.0, 30.0).unwrap();
        let grid = GridContext::new(bounds, 10.0, 3413).unwrap();
        let data = Array2::from_shape_fn((3, 4), |(r, c)| (r * 4 + c) as f32);
        let raster = Raster {
            data: data.clone(),
            transform: grid.geo_transform(),
            projection: String::new(),
        };

        let same = raster.resample_to_grid(&grid, Resampling::Bilinear).unwrap();
        assert_eq!(same, data);
        let nearest = raster.resample_to_grid(&grid, Resampling::Nearest).unwrap();
        assert_eq!(nearest, data);

        // Grid shifted one pixel east: last column falls outside the source
        let shifted = GridContext::new(BoundingBox::new(10.0, 0.0, 50.0, 30.0).unwrap(), 10.0, 3413).unwrap();
        let out = raster.resample_to_grid(&shifted, Resampling::Nearest).unwrap();
        assert_eq!(out[[0, 0]], 1.0);
        assert!(out[[0, 3]].is_nan());
    }

    #[test]
    fn test_no_overlap_is_reported() {
        let grid = GridContext::new(BoundingBox::new(0.0, 0.0, 40.0, 30.0).unwrap(), 10.0, 3413).unwrap();
        let raster = Raster {
            data: Array2::zeros((2, 2)),
            transform: GeoTransform::from_gdal([1000.0, 10.0, 0.0, 1000.0, 0.0, -10.0]),
            projection: String::new(),
        };
        let err = raster.resample_to_grid(&grid, Resampling::Nearest).unwrap_err();
        assert!(matches!(err, FlowError::NoOverlap(_)));
    }

    #[test]
    fn test_crop_keeps_source_grid() {
        let raster = Raster {
            data: Array2::from_shape_fn((10, 10), |(r, c)| (r * 10 + c) as f32),
            transform: GeoTransform::from_gdal([0.0, 15.0, 0.0, 150.0, 0.0, -15.0]),
            projection: String::new(),
        };
        let cropped = raster.crop(&BoundingBox::new(20.0, 50.0, 70.0, 120.0).unwrap()).unwrap();
        // cols 1..5 (15..75 m), rows 2..7 (120..45 m)
        assert_eq!(cropped.shape(), (5, 4));
        assert_eq!(cropped.transform.top_left_x, 15.0);
        assert_eq!(cropped.transform.top_left_y, 120.0);
        assert_eq!(cropped.data[[0, 0]], 21.0);
    }
}
