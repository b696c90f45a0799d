use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Real-valued velocity / displacement raster (rows x cols)
pub type VelocityImage = Array2<f32>;

/// Categorical mask raster (1 = member, 0 = not a member)
pub type MaskImage = Array2<u8>;

/// Velocity field component stored as its own raster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VelocityComponent {
    /// Displacement along the x axis
    Dx,
    /// Displacement along the y axis
    Dy,
    /// Displacement magnitude
    Dmag,
}

impl VelocityComponent {
    /// Filename suffix used by the feature-tracking output, e.g. `dx.tif`
    pub fn raw_suffix(&self) -> &'static str {
        match self {
            VelocityComponent::Dx => "dx.tif",
            VelocityComponent::Dy => "dy.tif",
            VelocityComponent::Dmag => "dmag.tif",
        }
    }

    /// Short tag used in derived product names
    pub fn tag(&self) -> &'static str {
        match self {
            VelocityComponent::Dx => "dx",
            VelocityComponent::Dy => "dy",
            VelocityComponent::Dmag => "dmag",
        }
    }
}

impl fmt::Display for VelocityComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// Relative orbit (Sentinel-2) or path/row (Landsat) identifier of one scene
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrbitId(String);

impl OrbitId {
    pub fn new(id: impl Into<String>) -> FlowResult<Self> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nan") {
            return Err(FlowError::FilenameParse(format!(
                "Undefined orbit identifier: '{}'",
                id
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrbitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordered pair of orbit identifiers for the two scenes of a velocity field.
///
/// Ordering matters: `R096_R053` and `R053_R096` are distinct pairs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrbitPair {
    pub first: OrbitId,
    pub second: OrbitId,
}

impl OrbitPair {
    pub fn new(first: OrbitId, second: OrbitId) -> Self {
        Self { first, second }
    }

    /// Both scenes were acquired from the same relative orbit
    pub fn is_repeat_track(&self) -> bool {
        self.first == self.second
    }

    /// Normalized key, e.g. `R096_R053`
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for OrbitPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}_R{}", self.first, self.second)
    }
}

impl FromStr for OrbitPair {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (a, b) = s
            .split_once('_')
            .ok_or_else(|| FlowError::FilenameParse(format!("Invalid orbit pair key: '{}'", s)))?;
        let strip = |part: &str| -> FlowResult<OrbitId> {
            let id = part.strip_prefix('R').ok_or_else(|| {
                FlowError::FilenameParse(format!("Invalid orbit pair key: '{}'", s))
            })?;
            OrbitId::new(id)
        };
        Ok(Self::new(strip(a)?, strip(b)?))
    }
}

/// Projected bounding box (map units, usually metres)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> FlowResult<Self> {
        if !(min_x < max_x && min_y < max_y) {
            return Err(FlowError::Config(format!(
                "Degenerate bounding box: ({}, {}, {}, {})",
                min_x, min_y, max_x, max_y
            )));
        }
        Ok(Self { min_x, min_y, max_x, max_y })
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// Bounding-box intersection test (touching edges do not count)
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_x < other.max_x
            && other.min_x < self.max_x
            && self.min_y < other.max_y
            && other.min_y < self.max_y
    }

    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }
}

/// Geospatial transformation parameters (GDAL ordering)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    /// Footprint of a raster of `(rows, cols)` pixels under this transform
    pub fn bounds(&self, shape: (usize, usize)) -> BoundingBox {
        let (rows, cols) = shape;
        let x0 = self.top_left_x;
        let x1 = self.top_left_x + cols as f64 * self.pixel_width;
        let y0 = self.top_left_y;
        let y1 = self.top_left_y + rows as f64 * self.pixel_height;
        BoundingBox {
            min_x: x0.min(x1),
            min_y: y0.min(y1),
            max_x: x0.max(x1),
            max_y: y0.max(y1),
        }
    }

    /// Fractional (col, row) pixel coordinate of a map coordinate
    pub fn map_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.top_left_x) / self.pixel_width,
            (y - self.top_left_y) / self.pixel_height,
        )
    }
}

/// The single working grid every per-pixel computation of one glacier runs on.
///
/// Constructed once per glacier and passed by reference; nothing mutates it afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridContext {
    pub bounds: BoundingBox,
    pub pixel_size: f64,
    pub width: usize,
    pub height: usize,
    pub epsg: u32,
}

impl GridContext {
    /// Grid covering `bounds` at an isotropic `pixel_size`.
    ///
    /// Width and height are rounded to whole pixels; the bounds are then snapped so that
    /// `max = min + n * pixel_size` holds exactly.
    pub fn new(bounds: BoundingBox, pixel_size: f64, epsg: u32) -> FlowResult<Self> {
        if !(pixel_size.is_finite() && pixel_size > 0.0) {
            return Err(FlowError::Config(format!(
                "Pixel size must be positive, got {}",
                pixel_size
            )));
        }
        let width = (bounds.width() / pixel_size).round() as usize;
        let height = (bounds.height() / pixel_size).round() as usize;
        if width == 0 || height == 0 {
            return Err(FlowError::Config(format!(
                "AOI {:?} is smaller than one {} m pixel",
                bounds, pixel_size
            )));
        }
        let snapped = BoundingBox {
            min_x: bounds.min_x,
            min_y: bounds.max_y - height as f64 * pixel_size,
            max_x: bounds.min_x + width as f64 * pixel_size,
            max_y: bounds.max_y,
        };
        Ok(Self {
            bounds: snapped,
            pixel_size,
            width,
            height,
            epsg,
        })
    }

    /// Build a grid from a raster's transform, rejecting anisotropic pixels.
    pub fn from_transform(
        bounds: BoundingBox,
        transform: &GeoTransform,
        epsg: u32,
    ) -> FlowResult<Self> {
        let res_x = round_to_hundredth(transform.pixel_width.abs());
        let res_y = round_to_hundredth(transform.pixel_height.abs());
        if (res_x - res_y).abs() > f64::EPSILON {
            return Err(FlowError::Config(format!(
                "Pixel resolution is not equal in x and y ({} vs {})",
                transform.pixel_width, transform.pixel_height
            )));
        }
        Self::new(bounds, res_x, epsg)
    }

    /// (rows, cols), matching `ndarray` dimension order
    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    pub fn geo_transform(&self) -> GeoTransform {
        GeoTransform {
            top_left_x: self.bounds.min_x,
            pixel_width: self.pixel_size,
            rotation_x: 0.0,
            top_left_y: self.bounds.max_y,
            rotation_y: 0.0,
            pixel_height: -self.pixel_size,
        }
    }

    /// Map coordinate of the centre of pixel (row, col)
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        (
            self.bounds.min_x + (col as f64 + 0.5) * self.pixel_size,
            self.bounds.max_y - (row as f64 + 0.5) * self.pixel_size,
        )
    }

    /// Error out unless `array` has exactly this grid's shape
    pub fn check_shape<T>(&self, array: &Array2<T>, what: &str) -> FlowResult<()> {
        if array.dim() != self.shape() {
            return Err(FlowError::GridMismatch(format!(
                "{} has shape {:?}, expected {:?}",
                what,
                array.dim(),
                self.shape()
            )));
        }
        Ok(())
    }
}

fn round_to_hundredth(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Why a velocity field was not corrected
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SkipReason {
    /// No offset field exists for the record's orbit pair
    NoOffset { pair: String },
    /// Too little of the ice area survived filtering
    InsufficientCoverage { fraction: f64, minimum: f64 },
    /// A source raster could not be opened or decoded
    UnreadableRaster { path: String, message: String },
    /// The source raster does not overlap the AOI
    NoOverlap { path: String },
    /// Both scenes share a timestamp, so no per-day rate exists
    ZeroDaySeparation,
    /// Another record of the same scene pair already owns this product
    DuplicateProduct { product_id: String, kept: String },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoOffset { pair } => write!(f, "no offset field for orbit pair {}", pair),
            SkipReason::InsufficientCoverage { fraction, minimum } => write!(
                f,
                "ice-area coverage {:.2}% below minimum {:.2}%",
                fraction * 100.0,
                minimum * 100.0
            ),
            SkipReason::UnreadableRaster { path, message } => {
                write!(f, "unreadable raster {}: {}", path, message)
            }
            SkipReason::NoOverlap { path } => write!(f, "raster {} does not overlap the AOI", path),
            SkipReason::ZeroDaySeparation => write!(f, "zero day separation"),
            SkipReason::DuplicateProduct { product_id, kept } => {
                write!(f, "product {} is already produced from {}", product_id, kept)
            }
        }
    }
}

/// Error types for velocity-field correction
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration file error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Date parsing error: {0}")]
    Date(#[from] chrono::ParseError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Filename parsing error: {0}")]
    FilenameParse(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("No scenes in the orbit catalog for {0}")]
    EmptyCatalog(String),

    #[error("No non-empty quality manifests for {0}")]
    NoManifests(String),

    #[error("No repeat-track velocity fields for {0}")]
    NoRepeatTrack(String),

    #[error("Reference field missing: {0}")]
    MissingReference(String),

    #[error("Raster stack is not grid-aligned: {0}")]
    GridMismatch(String),

    #[error("Raster error: {0}")]
    Raster(String),

    #[error("No overlap with AOI: {0}")]
    NoOverlap(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Plotting error: {0}")]
    Plot(String),
}

impl FlowError {
    /// Whether an error raised while reading one record's inputs stops the glacier.
    ///
    /// Unreadable or non-overlapping rasters only cost that record; a stack that lands on
    /// the wrong grid, or anything outside raster access, is fatal.
    pub fn is_fatal_for_glacier(&self) -> bool {
        !matches!(
            self,
            FlowError::Io(_)
                | FlowError::Gdal(_)
                | FlowError::Raster(_)
                | FlowError::NoOverlap(_)
                | FlowError::Plot(_)
        )
    }
}

/// Result type for correction operations
pub type FlowResult<T> = Result<T, FlowError>;
