//! Synthetic glacier on disk: scenes, quality manifests, raw velocity rasters and masks.
//!
//! Grid: 10 x 10 pixels of 10 m over x, y in [0, 100]. Ice covers columns 0..8, rock the last
//! two columns, no ocean.

#![allow(dead_code)]

use glacierflow::config::{AoiSource, ProcessingConfig};
use glacierflow::io::raster::{write_float_geotiff, write_mask_geotiff};
use glacierflow::types::{GeoTransform, MaskImage};
use ndarray::Array2;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const GLACIER: &str = "testglacier";
pub const SIZE: usize = 10;
pub const PIXEL: f64 = 10.0;
pub const ICE_COLUMNS: usize = 8;

/// Reference (repeat-track) velocity
pub const REF_DX: f32 = 3.0;
pub const REF_DY: f32 = 1.0;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn transform() -> GeoTransform {
    GeoTransform::from_gdal([0.0, PIXEL, 0.0, SIZE as f64 * PIXEL, 0.0, -PIXEL])
}

/// One raw velocity field to put on disk
pub struct FieldSpec {
    pub first: &'static str,
    pub second: &'static str,
    pub dx: f32,
    pub dy: f32,
}

impl FieldSpec {
    pub fn id(&self) -> String {
        format!("vmap_{}_{}", self.first, self.second)
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub config: ProcessingConfig,
}

impl Fixture {
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn velocity_dir(&self) -> PathBuf {
        self.config.velocity_dir.clone()
    }

    pub fn record_dir(&self, id: &str) -> PathBuf {
        self.config.velocity_dir.join(id)
    }

    pub fn orbits_dir(&self) -> PathBuf {
        self.config.orbits_dir()
    }
}

/// Scene filenames of the synthetic catalog: `(datehour, minutes+seconds, satellite, orbit)`
const SCENES: &[(&str, &str, &str, &str)] = &[
    // R096, every 10 days
    ("20200701T15", "0911", "S2A", "096"),
    ("20200711T15", "0911", "S2A", "096"),
    ("20200721T15", "0911", "S2A", "096"),
    ("20200731T15", "0911", "S2A", "096"),
    ("20200810T15", "0911", "S2A", "096"),
    ("20200820T15", "0911", "S2A", "096"),
    ("20200830T15", "0911", "S2A", "096"),
    // R053, one hour later on the R096 days
    ("20200711T16", "0911", "S2B", "053"),
    ("20200721T16", "0911", "S2B", "053"),
    ("20200731T16", "0911", "S2B", "053"),
    ("20200810T16", "0911", "S2B", "053"),
    ("20200820T16", "0911", "S2B", "053"),
    // R104 / R061
    ("20200705T14", "0000", "S2A", "104"),
    ("20200715T14", "0000", "S2A", "104"),
    ("20200725T14", "0000", "S2A", "104"),
    ("20200708T13", "0000", "S2B", "061"),
    ("20200718T13", "0000", "S2B", "061"),
    ("20200728T13", "0000", "S2B", "061"),
];

fn scene_filename(datehour: &str, minsec: &str, satellite: &str, orbit: &str) -> String {
    format!("{}_MSIL2A_{}{}_N0214_R{}.tif", satellite, datehour, minsec, orbit)
}

/// 6 repeat-track fields (R096_R096), 5 cross-track fields (R096_R053), 3 R104_R061 fields.
///
/// The R096_R053 fields are biased: three read dx = 2.5, one reads dx = 2.0 and one flows
/// backwards (dx = -3.0). Their median displacement offset is `0.5 * day_sep`.
pub fn standard_fields() -> Vec<FieldSpec> {
    let repeat = [
        ("20200701T15", "20200711T15"),
        ("20200711T15", "20200721T15"),
        ("20200721T15", "20200731T15"),
        ("20200731T15", "20200810T15"),
        ("20200810T15", "20200820T15"),
        ("20200820T15", "20200830T15"),
    ];
    let mut fields: Vec<FieldSpec> = repeat
        .iter()
        .map(|&(first, second)| FieldSpec {
            first,
            second,
            dx: REF_DX,
            dy: REF_DY,
        })
        .collect();

    let cross = [
        ("20200701T15", "20200711T16", 2.5),
        ("20200711T15", "20200721T16", 2.5),
        ("20200721T15", "20200731T16", 2.5),
        ("20200731T15", "20200810T16", 2.0),
        ("20200810T15", "20200820T16", -3.0),
    ];
    fields.extend(cross.iter().map(|&(first, second, dx)| FieldSpec {
        first,
        second,
        dx,
        dy: REF_DY,
    }));

    let sparse = [
        ("20200705T14", "20200708T13"),
        ("20200715T14", "20200718T13"),
        ("20200725T14", "20200728T13"),
    ];
    fields.extend(sparse.iter().map(|&(first, second)| FieldSpec {
        first,
        second,
        dx: REF_DX,
        dy: REF_DY,
    }));
    fields
}

pub fn write_field(velocity_dir: &Path, field: &FieldSpec) {
    write_field_as(velocity_dir, &field.id(), field);
}

/// Write `field` under another id, e.g. a second processing of the same scene pair
pub fn write_field_as(velocity_dir: &Path, id: &str, field: &FieldSpec) {
    let dir = velocity_dir.join(id);
    std::fs::create_dir_all(&dir).expect("create record dir");
    let gt = transform();
    let dmag = (field.dx * field.dx + field.dy * field.dy).sqrt();
    for (suffix, value) in [("dx", field.dx), ("dy", field.dy), ("dmag", dmag)] {
        let image = Array2::from_elem((SIZE, SIZE), value);
        write_float_geotiff(dir.join(format!("{}_{}.tif", id, suffix)), &image, &gt, 3413, -9999.0)
            .expect("write raw raster");
    }
}

pub fn ice_mask() -> MaskImage {
    Array2::from_shape_fn((SIZE, SIZE), |(_, c)| u8::from(c < ICE_COLUMNS))
}

/// Build the fixture with the standard fields
pub fn fixture() -> Fixture {
    fixture_with(&standard_fields())
}

pub fn fixture_with(fields: &[FieldSpec]) -> Fixture {
    init_logging();
    let dir = TempDir::new().expect("temp dir");
    let root = dir.path();

    let image_dir = root.join("clipped");
    std::fs::create_dir_all(&image_dir).expect("create image dir");
    for &(datehour, minsec, satellite, orbit) in SCENES {
        std::fs::write(image_dir.join(scene_filename(datehour, minsec, satellite, orbit)), b"")
            .expect("write scene");
    }

    let velocity_dir = root.join("velocities");
    std::fs::create_dir_all(&velocity_dir).expect("create velocity dir");
    let mut manifest = String::new();
    for field in fields {
        write_field(&velocity_dir, field);
        manifest.push_str(&format!("{}\t0.91\t0.87\n", field.id()));
    }
    std::fs::write(velocity_dir.join("list_good_2020.txt"), manifest).expect("write manifest");
    std::fs::write(velocity_dir.join("list_good_2021.txt"), b"").expect("write empty manifest");

    let config = ProcessingConfig {
        glacier: GLACIER.to_string(),
        start_date: "20200101".to_string(),
        end_date: "20201231".to_string(),
        image_dir,
        velocity_dir,
        output_root: root.join("output"),
        aoi: AoiSource::Bounds {
            xmin: 0.0,
            ymin: 0.0,
            xmax: SIZE as f64 * PIXEL,
            ymax: SIZE as f64 * PIXEL,
        },
        write_plots: false,
        ..ProcessingConfig::default()
    };

    // Masks are supplied pre-cut, so no tile directory is needed
    let masks_dir = config.masks_dir();
    std::fs::create_dir_all(&masks_dir).expect("create masks dir");
    let ice = ice_mask();
    let ocean = Array2::<u8>::zeros((SIZE, SIZE));
    let rock = ice.mapv(|i| 1 - i);
    for (name, mask) in [("mask_ice.tif", &ice), ("mask_ocean.tif", &ocean), ("mask_rock.tif", &rock)] {
        write_mask_geotiff(masks_dir.join(name), mask, &transform(), 3413).expect("write mask");
    }

    Fixture { dir, config }
}
