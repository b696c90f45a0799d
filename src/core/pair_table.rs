//! Velocity-field records annotated with the orbit pair that produced them.

use crate::io::manifest::ManifestEntry;
use crate::io::orbit_catalog::OrbitCatalog;
use crate::types::{FlowError, FlowResult, OrbitPair, VelocityComponent};
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

const SECONDS_PER_DAY: f64 = 86_400.0;

/// One quality-accepted velocity field joined to the orbit metadata of both scenes
#[derive(Debug, Clone, PartialEq)]
pub struct VelocityFieldRecord {
    pub id: String,
    /// Directory holding the field's dx/dy/dmag rasters
    pub dir: PathBuf,
    /// Scene datehours from the id, truncated to the hour
    pub date1: DateTime<Utc>,
    pub date2: DateTime<Utc>,
    /// Full acquisition datetimes from the catalog
    pub datetime_1: DateTime<Utc>,
    pub datetime_2: DateTime<Utc>,
    /// Signed separation `datetime_2 - datetime_1` in fractional days
    pub day_sep: f64,
    pub year: i32,
    pub midpoint: DateTime<Utc>,
    /// Temporal baseline in days
    pub baseline: f64,
    pub halfbaseline: f64,
    pub satellite1: String,
    pub satellite2: String,
    pub processing_baseline1: String,
    pub processing_baseline2: String,
    pub orbit_pair: OrbitPair,
}

impl VelocityFieldRecord {
    pub fn is_repeat_track(&self) -> bool {
        self.orbit_pair.is_repeat_track()
    }

    /// Path of the raw raster for `component` (`*dx.tif`, `*dy.tif`, `*dmag.tif`)
    pub fn raw_raster(&self, component: VelocityComponent) -> FlowResult<PathBuf> {
        find_raster_with_suffix(&self.dir, component.raw_suffix())
    }
}

fn find_raster_with_suffix(dir: &Path, suffix: &str) -> FlowResult<PathBuf> {
    let mut matches = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(suffix) {
            matches.push(entry.path());
        }
    }
    matches.sort();
    matches.into_iter().next().ok_or_else(|| {
        FlowError::Raster(format!("No *{} raster in {}", suffix, dir.display()))
    })
}

fn parse_datehour(datehour: &str) -> FlowResult<DateTime<Utc>> {
    let bad = || FlowError::FilenameParse(format!("Invalid datehour '{}'", datehour));
    let (day, hour) = datehour.get(..8).zip(datehour.get(9..11)).ok_or_else(bad)?;
    let date = NaiveDate::parse_from_str(day, "%Y%m%d")?;
    let hour: u32 = hour.parse().map_err(|_| bad())?;
    let naive = date.and_hms_opt(hour, 0, 0).ok_or_else(bad)?;
    Ok(Utc.from_utc_datetime(&naive))
}

fn fractional_days(delta: Duration) -> f64 {
    delta.num_milliseconds() as f64 / 1000.0 / SECONDS_PER_DAY
}

#[derive(Serialize)]
struct PairRow<'a> {
    id: &'a str,
    dir: String,
    date1: String,
    date2: String,
    datetime_1: String,
    datetime_2: String,
    day_sep: f64,
    year: i32,
    midpoint: String,
    baseline: f64,
    halfbaseline: f64,
    satellite1: &'a str,
    satellite2: &'a str,
    orbit1: &'a str,
    processingbaseline1: &'a str,
    orbit2: &'a str,
    processingbaseline2: &'a str,
    orbit_pair: String,
    orbit_match: u8,
}

fn csv_time(t: &DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// All velocity-field records of one glacier
#[derive(Debug, Clone, Default)]
pub struct PairTable {
    records: Vec<VelocityFieldRecord>,
}

impl PairTable {
    /// Join manifest rows against the catalog.
    ///
    /// Rows whose scene datehours are not catalogued, or whose scenes fall outside
    /// `[start, end]`, are dropped. So are ids listed more than once and ids without two
    /// valid scene datehours.
    pub fn build(
        entries: &[ManifestEntry],
        catalog: &OrbitCatalog,
        velocity_dir: &Path,
        start: NaiveDate,
        end: NaiveDate,
    ) -> FlowResult<Self> {
        let mut records = Vec::with_capacity(entries.len());
        let mut seen = HashSet::new();
        let mut repeated = 0;
        let mut malformed = 0;
        let mut outside_range = 0;
        let mut not_catalogued = 0;

        for entry in entries {
            if !seen.insert(entry.id.as_str()) {
                log::warn!("Dropping {}: listed more than once", entry.id);
                repeated += 1;
                continue;
            }

            let parsed = entry.scene_datehours().and_then(|(dh1, dh2)| {
                Ok((dh1, dh2, parse_datehour(dh1)?, parse_datehour(dh2)?))
            });
            let (dh1, dh2, date1, date2) = match parsed {
                Ok(parsed) => parsed,
                Err(e) => {
                    log::warn!("Dropping {}: {}", entry.id, e);
                    malformed += 1;
                    continue;
                }
            };
            if date1.date_naive() < start || date2.date_naive() > end {
                outside_range += 1;
                continue;
            }

            let (scene1, scene2) = match (catalog.get(dh1), catalog.get(dh2)) {
                (Some(a), Some(b)) => (a, b),
                _ => {
                    log::debug!("Dropping {}: scene datehour not catalogued", entry.id);
                    not_catalogued += 1;
                    continue;
                }
            };

            let datetime_1 = scene1.datetime;
            let datetime_2 = scene2.datetime;
            let separation = datetime_2 - datetime_1;
            let day_sep = fractional_days(separation);
            let midpoint = datetime_1 + separation / 2;

            records.push(VelocityFieldRecord {
                id: entry.id.clone(),
                dir: velocity_dir.join(&entry.id),
                date1,
                date2,
                datetime_1,
                datetime_2,
                day_sep,
                year: date1.year(),
                midpoint,
                baseline: day_sep.abs(),
                halfbaseline: fractional_days(datetime_2 - midpoint),
                satellite1: scene1.satellite.clone(),
                satellite2: scene2.satellite.clone(),
                processing_baseline1: scene1.processing_baseline.clone(),
                processing_baseline2: scene2.processing_baseline.clone(),
                orbit_pair: OrbitPair::new(scene1.orbit.clone(), scene2.orbit.clone()),
            });
        }

        log::info!(
            "Pair table: {} records ({} outside date range, {} without catalogued scenes, {} malformed, {} repeated)",
            records.len(),
            outside_range,
            not_catalogued,
            malformed,
            repeated
        );
        Ok(Self { records })
    }

    pub fn from_records(records: Vec<VelocityFieldRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[VelocityFieldRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn repeat_track(&self) -> Vec<&VelocityFieldRecord> {
        self.records.iter().filter(|r| r.is_repeat_track()).collect()
    }

    /// Records grouped by orbit pair, in pair order
    pub fn by_pair(&self) -> BTreeMap<OrbitPair, Vec<&VelocityFieldRecord>> {
        let mut groups: BTreeMap<OrbitPair, Vec<&VelocityFieldRecord>> = BTreeMap::new();
        for r in &self.records {
            groups.entry(r.orbit_pair.clone()).or_default().push(r);
        }
        groups
    }

    /// Number of records per orbit pair, in pair order
    pub fn pair_counts(&self) -> BTreeMap<OrbitPair, usize> {
        let mut counts = BTreeMap::new();
        for r in &self.records {
            *counts.entry(r.orbit_pair.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Write `<glacier>_orbit_pairs.csv`
    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> FlowResult<()> {
        let mut writer = csv::Writer::from_path(path.as_ref())?;
        for r in &self.records {
            writer.serialize(PairRow {
                id: &r.id,
                dir: r.dir.display().to_string(),
                date1: csv_time(&r.date1),
                date2: csv_time(&r.date2),
                datetime_1: csv_time(&r.datetime_1),
                datetime_2: csv_time(&r.datetime_2),
                day_sep: r.day_sep,
                year: r.year,
                midpoint: csv_time(&r.midpoint),
                baseline: r.baseline,
                halfbaseline: r.halfbaseline,
                satellite1: &r.satellite1,
                satellite2: &r.satellite2,
                orbit1: r.orbit_pair.first.as_str(),
                processingbaseline1: &r.processing_baseline1,
                orbit2: r.orbit_pair.second.as_str(),
                processingbaseline2: &r.processing_baseline2,
                orbit_pair: r.orbit_pair.key(),
                orbit_match: u8::from(r.is_repeat_track()),
            })?;
        }
        writer.flush()?;
        log::info!("Wrote pair table: {}", path.as_ref().display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> OrbitCatalog {
        let names = [
            "S2A_MSIL2A_20200701T150911_N0214_R096.tif",
            "S2B_MSIL2A_20200711T150911_N0214_R096.tif",
            "S2A_MSIL2A_20200713T160931_N0214_R053.tif",
        ];
        let d = |s| NaiveDate::parse_from_str(s, "%Y%m%d").unwrap();
        OrbitCatalog::from_filenames(names, d("20200101"), d("20201231")).unwrap()
    }

    fn entry(id: &str) -> ManifestEntry {
        ManifestEntry {
            id: id.to_string(),
            filter_ratio_1: 1.0,
            filter_ratio_2: 1.0,
        }
    }

    #[test]
    fn test_join_and_temporal_attributes() {
        let entries = [
            entry("vmap_20200701T15_20200711T15"),
            entry("vmap_20200701T15_20200713T16"),
            entry("vmap_20200701T15_20200801T15"),
        ];
        let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2020, 12, 31).unwrap();
        let table = PairTable::build(&entries, &catalog(), Path::new("/vel"), start, end).unwrap();

        // The third id references an uncatalogued scene
        assert_eq!(table.len(), 2);

        let repeat = &table.records()[0];
        assert!(repeat.is_repeat_track());
        assert_eq!(repeat.orbit_pair.key(), "R096_R096");
        assert_eq!(repeat.day_sep, 10.0);
        assert_eq!(repeat.halfbaseline, 5.0);
        assert_eq!(repeat.year, 2020);
        assert_eq!(repeat.dir, PathBuf::from("/vel/vmap_20200701T15_20200711T15"));
        assert_eq!(csv_time(&repeat.midpoint), "2020-07-06 15:09:11");

        let cross = &table.records()[1];
        assert!(!cross.is_repeat_track());
        assert_eq!(cross.orbit_pair.key(), "R096_R053");
        let expected = 12.0 + 1.0 / 24.0 + 20.0 / 86_400.0;
        assert!((cross.day_sep - expected).abs() < 1e-9);
    }

    #[test]
    fn test_date_range_is_inclusive_on_dates() {
        let entries = [entry("vmap_20200701T15_20200711T15")];
        let start = NaiveDate::from_ymd_opt(2020, 7, 2).unwrap();
        let end = NaiveDate::from_ymd_opt(2020, 12, 31).unwrap();
        let table = PairTable::build(&entries, &catalog(), Path::new("/vel"), start, end).unwrap();
        assert!(table.is_empty());

        let start = NaiveDate::from_ymd_opt(2020, 7, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2020, 7, 11).unwrap();
        let table = PairTable::build(&entries, &catalog(), Path::new("/vel"), start, end).unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_pair_counts_sorted_by_key() {
        let entries = [
            entry("vmap_20200711T15_20200713T16"),
            entry("vmap_20200701T15_20200711T15"),
            entry("vmap_20200701T15_20200713T16"),
        ];
        let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2020, 12, 31).unwrap();
        let table = PairTable::build(&entries, &catalog(), Path::new("/vel"), start, end).unwrap();
        let counts: Vec<(String, usize)> = table
            .pair_counts()
            .into_iter()
            .map(|(pair, n)| (pair.key(), n))
            .collect();
        assert_eq!(
            counts,
            vec![("R096_R053".to_string(), 2), ("R096_R096".to_string(), 1)]
        );
        assert_eq!(table.repeat_track().len(), 1);
        let cross: OrbitPair = "R096_R053".parse().unwrap();
        assert_eq!(table.by_pair()[&cross].len(), 2);
    }

    #[test]
    fn test_malformed_ids_are_dropped() {
        let entries = [
            entry("vmap_badid"),
            entry("vmap_20200732T15_20200711T15"),
            entry("vmap_20200701T15_20200711T15"),
            entry("vmap_20200701T99_20200711T15"),
        ];
        let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2020, 12, 31).unwrap();
        let table = PairTable::build(&entries, &catalog(), Path::new("/vel"), start, end)
            .expect("bad rows must not fail the table");
        assert_eq!(table.len(), 1);
        assert_eq!(table.records()[0].id, "vmap_20200701T15_20200711T15");
    }

    #[test]
    fn test_repeated_ids_are_kept_once() {
        // The same field accepted in two yearly manifests
        let entries = [
            entry("vmap_20200701T15_20200711T15"),
            entry("vmap_20200701T15_20200713T16"),
            entry("vmap_20200701T15_20200711T15"),
        ];
        let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2020, 12, 31).unwrap();
        let table = PairTable::build(&entries, &catalog(), Path::new("/vel"), start, end).unwrap();
        let ids: Vec<&str> = table.records().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(
            ids,
            ["vmap_20200701T15_20200711T15", "vmap_20200701T15_20200713T16"]
        );
    }
}
