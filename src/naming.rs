//! Output file naming.
//!
//! Measurement files are never overwritten. When a name is taken, a suffix is bumped
//! until a free name is found:
//!
//! ```text
//! scan -> scan_2 -> scan_3 -> ... -> scan_9 -> scan_10 -> scan_111 -> scan_1112
//! ```
//!
//! The first collision appends `_2`; every later one replaces the *last character* of
//! the previous candidate with the next number. Existing data sets on disk were named
//! this way, so the rule is kept as is, including the jump after `_10`.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{AppResult, DaqError};

/// Finds a file name in `directory` that does not exist yet.
#[derive(Debug, Clone)]
pub struct FileNamingResolver {
    directory: PathBuf,
    extension: Option<String>,
}

impl FileNamingResolver {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            extension: None,
        }
    }

    /// Candidates are checked as `{name}.{extension}`; the suffix goes on the stem.
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Full path for `name`, with the extension if one is configured.
    pub fn path_for(&self, name: &str) -> PathBuf {
        match &self.extension {
            Some(ext) => self.directory.join(format!("{name}.{ext}")),
            None => self.directory.join(name),
        }
    }

    /// Returns `base` if free, otherwise the first free bumped name.
    pub fn resolve(&self, base: &str) -> AppResult<String> {
        // Every collision needs an existing entry, so this many attempts always suffice.
        let limit = self.entry_count()? + 2;

        let mut candidate = base.to_string();
        let mut num = 2usize;
        for _ in 0..limit {
            if !self.path_for(&candidate).exists() {
                if candidate != base {
                    debug!(base, resolved = %candidate, "Output name taken, using bumped name");
                }
                return Ok(candidate);
            }
            candidate = if num == 2 {
                format!("{candidate}_{num}")
            } else {
                format!("{}{num}", drop_last_char(&candidate))
            };
            num += 1;
        }

        Err(DaqError::NamingExhausted {
            base: base.to_string(),
            directory: self.directory.clone(),
        })
    }

    fn entry_count(&self) -> AppResult<usize> {
        match fs::read_dir(&self.directory) {
            Ok(entries) => Ok(entries.count()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(err) => Err(err.into()),
        }
    }
}

fn drop_last_char(s: &str) -> &str {
    match s.char_indices().last() {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// `{name}_({start}-{stop}nm_{step}nm_{amp}x)`, or with `{filter}Filter_` before the
/// range inside a composite scan. Numbers are truncated to integers.
pub fn measurement_file_name(
    name: &str,
    start: f64,
    stop: f64,
    step: f64,
    amplification: f64,
    filter: Option<&str>,
) -> String {
    let range = format!(
        "({}-{}nm_{}nm_{}x)",
        start.trunc() as i64,
        stop.trunc() as i64,
        step.trunc() as i64,
        amplification.trunc() as i64
    );
    match filter {
        Some(filter) => format!("{name}_{filter}Filter_{range}"),
        None => format!("{name}_{range}"),
    }
}

/// Label of the external filter in composite-scan file names.
pub fn filter_label(cuton_nm: Option<f64>) -> String {
    match cuton_nm {
        Some(cuton) => format!("{}", cuton.trunc() as i64),
        None => "no".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), b"").unwrap();
    }

    #[test]
    fn free_name_is_returned_unchanged() {
        let dir = tempdir().unwrap();
        let resolver = FileNamingResolver::new(dir.path());
        assert_eq!(resolver.resolve("scan").unwrap(), "scan");
    }

    #[test]
    fn collisions_bump_the_suffix() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "scan");
        touch(dir.path(), "scan_2");
        let resolver = FileNamingResolver::new(dir.path());
        assert_eq!(resolver.resolve("scan").unwrap(), "scan_3");
        // Deterministic.
        assert_eq!(resolver.resolve("scan").unwrap(), "scan_3");
    }

    #[test]
    fn suffix_replaces_last_character_past_nine() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "scan");
        for n in 2..=10 {
            touch(dir.path(), &format!("scan_{n}"));
        }
        let resolver = FileNamingResolver::new(dir.path());
        assert_eq!(resolver.resolve("scan").unwrap(), "scan_111");
    }

    #[test]
    fn extension_is_kept_outside_the_suffix() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "run.csv");
        let resolver = FileNamingResolver::new(dir.path()).with_extension("csv");
        let name = resolver.resolve("run").unwrap();
        assert_eq!(name, "run_2");
        assert_eq!(resolver.path_for(&name), dir.path().join("run_2.csv"));
    }

    #[test]
    fn missing_directory_has_no_collisions() {
        let dir = tempdir().unwrap();
        let resolver = FileNamingResolver::new(dir.path().join("not_yet"));
        assert_eq!(resolver.resolve("scan").unwrap(), "scan");
    }

    #[test]
    fn file_names_follow_the_measurement_layout() {
        assert_eq!(
            measurement_file_name("P3HT", 350.0, 1050.5, 5.0, 1e6, None),
            "P3HT_(350-1050nm_5nm_1000000x)"
        );
        assert_eq!(
            measurement_file_name("P3HT", 550.0, 1000.0, 2.0, 1e4, Some(&filter_label(Some(550.0)))),
            "P3HT_550Filter_(550-1000nm_2nm_10000x)"
        );
        assert_eq!(filter_label(None), "no");
    }
}
