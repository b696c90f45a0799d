//! "Accepted quality" manifests written by the feature-tracking QA step.
//!
//! One tab-separated file per year (`list_good_2021.txt`), no header, three columns:
//! velocity-field id and two filter ratios.

use crate::types::{FlowError, FlowResult};
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

fn manifest_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^list_good_20\d{2}\.txt$").expect("static regex"))
}

fn datehour_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{8}\D\d{2}").expect("static regex"))
}

/// One accepted velocity field
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ManifestEntry {
    pub id: String,
    pub filter_ratio_1: f64,
    pub filter_ratio_2: f64,
}

impl ManifestEntry {
    /// `YYYYMMDDTHH` substrings of the id that are not embedded in a longer digit run.
    /// Velocity-field ids carry exactly two: the first and second scene.
    pub fn datehours(&self) -> Vec<&str> {
        standalone_datehours(&self.id)
    }

    /// Datehours of the first and second scene
    pub fn scene_datehours(&self) -> FlowResult<(&str, &str)> {
        let found = self.datehours();
        match found.as_slice() {
            [first, second, ..] => Ok((first, second)),
            _ => Err(FlowError::Manifest(format!(
                "Velocity field id '{}' does not contain two scene datehours",
                self.id
            ))),
        }
    }
}

/// Scan for datehour tokens with non-digit (or string boundary) neighbours on both sides
pub fn standalone_datehours(id: &str) -> Vec<&str> {
    let mut found = Vec::new();
    let mut prev_is_digit = false;
    let mut skip_until = 0;

    for (i, c) in id.char_indices() {
        if i >= skip_until && !prev_is_digit {
            if let Some(m) = datehour_regex().find(&id[i..]) {
                let end = i + m.end();
                let next_is_digit = id[end..].chars().next().map_or(false, |n| n.is_ascii_digit());
                if !next_is_digit {
                    found.push(&id[i..end]);
                    skip_until = end;
                }
            }
        }
        prev_is_digit = c.is_ascii_digit();
    }
    found
}

/// All yearly manifests in `velocity_dir`, sorted by name
pub fn find_manifests<P: AsRef<Path>>(velocity_dir: P) -> FlowResult<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(velocity_dir.as_ref())? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if manifest_name_regex().is_match(&name) {
            paths.push(entry.path());
        }
    }
    paths.sort();
    Ok(paths)
}

/// Parse one manifest file
pub fn read_manifest<P: AsRef<Path>>(path: P) -> FlowResult<Vec<ManifestEntry>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_path(path.as_ref())?;

    let mut entries = Vec::new();
    for row in reader.deserialize() {
        let entry: ManifestEntry = row?;
        entries.push(entry);
    }
    Ok(entries)
}

/// Read every non-empty manifest in `velocity_dir`.
///
/// Empty or unreadable files are skipped with a warning. Having no usable manifest at all
/// is fatal for the glacier.
pub fn read_all_manifests<P: AsRef<Path>>(velocity_dir: P, glacier: &str) -> FlowResult<Vec<ManifestEntry>> {
    let paths = find_manifests(velocity_dir.as_ref())?;
    log::info!(
        "Found {} quality manifests in {}",
        paths.len(),
        velocity_dir.as_ref().display()
    );

    let mut entries = Vec::new();
    let mut usable = 0;
    for path in &paths {
        let is_empty = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
        if is_empty {
            log::warn!("Skipping empty manifest {}", path.display());
            continue;
        }
        match read_manifest(path) {
            Ok(rows) if rows.is_empty() => {
                log::warn!("Skipping manifest without rows {}", path.display());
            }
            Ok(rows) => {
                log::debug!("{}: {} accepted fields", path.display(), rows.len());
                usable += 1;
                entries.extend(rows);
            }
            Err(e) => log::warn!("Skipping unreadable manifest {}: {}", path.display(), e),
        }
    }

    if usable == 0 {
        return Err(FlowError::NoManifests(glacier.to_string()));
    }
    Ok(entries)
}
