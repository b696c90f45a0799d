//! Scene catalog: orbit metadata parsed from clipped-mosaic filenames.
//!
//! Filenames follow `S2B_MSIL2A_20200716T162839_N0214_R083.tif`: satellite, product level,
//! acquisition datetime, processing baseline (`_N`) and relative orbit (`_R`).

use crate::types::{FlowError, FlowResult, OrbitId};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

/// Acquisition datetime, `YYYYMMDDTHHMMSS`
fn datetime_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{8})(\D)(\d{2})(\d{4})").expect("static regex"))
}

/// Orbit metadata of one clipped scene
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrbitRecord {
    /// `YYYYMMDDTHHMMSS` as found in the filename
    pub datetime_str: String,
    /// `YYYYMMDDTHH`, the key velocity-field ids are joined on
    pub datehour: String,
    pub datetime: DateTime<Utc>,
    pub satellite: String,
    pub orbit: OrbitId,
    pub processing_baseline: String,
}

impl OrbitRecord {
    /// Parse one scene filename. Malformed names are errors.
    pub fn from_filename(fname: &str) -> FlowResult<Self> {
        let bad = |what: &str| FlowError::FilenameParse(format!("{} in '{}'", what, fname));

        let satellite: String = fname.chars().take(3).collect();
        if satellite.len() < 3 {
            return Err(bad("Missing satellite code"));
        }

        let caps = datetime_regex()
            .captures(fname)
            .ok_or_else(|| bad("Missing acquisition datetime"))?;
        let (day, sep, hour, minsec) = (&caps[1], &caps[2], &caps[3], &caps[4]);
        let datetime_str = caps[0].to_string();
        let datehour = format!("{}{}{}", day, sep, hour);
        let naive = NaiveDateTime::parse_from_str(
            &format!("{}{}{}", day, hour, minsec),
            "%Y%m%d%H%M%S",
        )
        .map_err(|e| bad(&format!("Invalid acquisition datetime ({})", e)))?;
        let datetime = Utc.from_utc_datetime(&naive);

        let orbit = fname
            .split_once("_R")
            .map(|(_, rest)| rest)
            .and_then(|rest| rest.get(..3))
            .ok_or_else(|| bad("Missing relative orbit"))?;
        if !orbit.chars().all(|c| c.is_ascii_digit()) {
            return Err(bad("Non-numeric relative orbit"));
        }

        let processing_baseline = fname
            .split_once("_N")
            .map(|(_, rest)| rest)
            .and_then(|rest| rest.get(..4))
            .ok_or_else(|| bad("Missing processing baseline"))?
            .to_string();

        Ok(Self {
            datetime_str,
            datehour,
            datetime,
            satellite,
            orbit: OrbitId::new(orbit)?,
            processing_baseline,
        })
    }

    fn date(&self) -> NaiveDate {
        self.datetime.date_naive()
    }
}

/// All scenes of one glacier, keyed by datehour
#[derive(Debug, Clone, Default)]
pub struct OrbitCatalog {
    records: Vec<OrbitRecord>,
    by_datehour: HashMap<String, usize>,
}

#[derive(Serialize)]
struct CatalogRow<'a> {
    datetime: &'a str,
    datehour: &'a str,
    satellite: &'a str,
    orbits: &'a str,
    processing_baselines: &'a str,
}

impl OrbitCatalog {
    /// Build from filenames, keeping scenes strictly between `start` and `end` (by date).
    /// Any malformed filename aborts the whole catalog.
    pub fn from_filenames<I, S>(filenames: I, start: NaiveDate, end: NaiveDate) -> FlowResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut records = Vec::new();
        for fname in filenames {
            let record = OrbitRecord::from_filename(fname.as_ref())?;
            if record.date() > start && record.date() < end {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.datetime_str.cmp(&b.datetime_str));

        let mut by_datehour: HashMap<String, usize> = HashMap::with_capacity(records.len());
        for (i, record) in records.iter().enumerate() {
            if by_datehour.contains_key(&record.datehour) {
                log::debug!("Duplicate datehour {}; keeping first scene", record.datehour);
                continue;
            }
            by_datehour.insert(record.datehour.clone(), i);
        }

        Ok(Self { records, by_datehour })
    }

    /// Scan `image_dir` for clipped mosaics (`S2*.tif`)
    pub fn from_directory<P: AsRef<Path>>(
        image_dir: P,
        start: NaiveDate,
        end: NaiveDate,
    ) -> FlowResult<Self> {
        log::info!("Collecting orbital metadata from {}", image_dir.as_ref().display());

        let mut filenames = Vec::new();
        for entry in std::fs::read_dir(image_dir.as_ref())? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("S2") && name.ends_with(".tif") {
                filenames.push(name);
            }
        }
        filenames.sort();

        let catalog = Self::from_filenames(&filenames, start, end)?;
        log::info!(
            "Catalogued {} of {} scenes inside the date range",
            catalog.len(),
            filenames.len()
        );
        Ok(catalog)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[OrbitRecord] {
        &self.records
    }

    pub fn get(&self, datehour: &str) -> Option<&OrbitRecord> {
        self.by_datehour.get(datehour).map(|&i| &self.records[i])
    }

    pub fn contains(&self, datehour: &str) -> bool {
        self.by_datehour.contains_key(datehour)
    }

    /// Write `<glacier>_orbits.csv`
    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> FlowResult<()> {
        let mut writer = csv::Writer::from_path(path.as_ref())?;
        for r in &self.records {
            writer.serialize(CatalogRow {
                datetime: &r.datetime_str,
                datehour: &r.datehour,
                satellite: &r.satellite,
                orbits: r.orbit.as_str(),
                processing_baselines: &r.processing_baseline,
            })?;
        }
        writer.flush()?;
        log::info!("Wrote orbit catalog: {}", path.as_ref().display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y%m%d").unwrap()
    }

    #[test]
    fn test_parse_sentinel2_filename() {
        let r = OrbitRecord::from_filename("S2B_MSIL2A_20200716T162839_N0214_R083.tif").unwrap();
        assert_eq!(r.satellite, "S2B");
        assert_eq!(r.datetime_str, "20200716T162839");
        assert_eq!(r.datehour, "20200716T16");
        assert_eq!(r.orbit.as_str(), "083");
        assert_eq!(r.processing_baseline, "0214");
        assert_eq!(r.datetime.to_rfc3339(), "2020-07-16T16:28:39+00:00");
    }

    #[test]
    fn test_malformed_filename_aborts_catalog() {
        let names = [
            "S2B_MSIL2A_20200716T162839_N0214_R083.tif",
            "S2A_MSIL2A_2020071_N0214_R083.tif",
        ];
        let err = OrbitCatalog::from_filenames(names, date("20200101"), date("20201231")).unwrap_err();
        assert!(matches!(err, FlowError::FilenameParse(_)));

        assert!(OrbitRecord::from_filename("S2A_MSIL2A_20200716T162839_N0214.tif").is_err());
        assert!(OrbitRecord::from_filename("S2A_MSIL2A_20200716T162839_R083.tif").is_err());
    }

    #[test]
    fn test_date_filter_is_strict() {
        let names = [
            "S2A_MSIL2A_20200101T150000_N0214_R096.tif",
            "S2A_MSIL2A_20200102T150000_N0214_R096.tif",
            "S2B_MSIL2A_20200110T150000_N0214_R053.tif",
        ];
        let catalog = OrbitCatalog::from_filenames(names, date("20200101"), date("20200110")).unwrap();
        assert_eq!(catalog.len(), 1);
        assert!(catalog.contains("20200102T15"));
        assert!(!catalog.contains("20200101T15"));
        assert!(!catalog.contains("20200110T15"));
    }
}
