//! Data set discovery and the shape of a reconstruction run.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use rc_types::{ConfigError, GaMethod, RcResult, RecConfig};

pub const PHASING_DATA_DIR: &str = "phasing_data";
pub const DATA_FILE: &str = "data.tif";
pub const SCAN_PREFIX: &str = "scan";

/// One independent input: a data file and the directory its results go under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSet {
    pub datafile: PathBuf,
    pub dir: PathBuf,
}

/// Find the data sets of an experiment.
///
/// In separate scans mode every `scan*` directory holding
/// `phasing_data/data.tif` is one data set, in name order. Otherwise the
/// single data file lives in `data_dir`, or `<experiment>/phasing_data`.
pub fn discover_data_sets(experiment_dir: &Path, config: &RecConfig) -> RcResult<Vec<DataSet>> {
    let mut data_sets = Vec::new();
    if config.is_separate() {
        let mut scan_dirs = Vec::new();
        for entry in std::fs::read_dir(experiment_dir)? {
            let entry = entry?;
            let is_scan = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(SCAN_PREFIX));
            if is_scan && entry.file_type()?.is_dir() {
                scan_dirs.push(entry.path());
            }
        }
        scan_dirs.sort();
        for dir in scan_dirs {
            let datafile = dir.join(PHASING_DATA_DIR).join(DATA_FILE);
            if datafile.is_file() {
                data_sets.push(DataSet { datafile, dir });
            }
        }
    } else {
        let data_dir = config
            .data_dir
            .clone()
            .unwrap_or_else(|| experiment_dir.join(PHASING_DATA_DIR));
        let datafile = data_dir.join(DATA_FILE);
        if datafile.is_file() {
            data_sets.push(DataSet {
                datafile,
                dir: experiment_dir.to_path_buf(),
            });
        }
    }

    if data_sets.is_empty() {
        return Err(ConfigError::NoDataSets {
            path: experiment_dir.display().to_string(),
        }
        .into());
    }
    debug!(experiment = ?experiment_dir, data_sets = data_sets.len(), "Discovered data sets");
    Ok(data_sets)
}

/// How much work a run holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub data_sets: Vec<DataSet>,
    pub reconstructions: usize,
    pub ga: Option<GaMethod>,
}

impl Topology {
    pub fn new(data_sets: Vec<DataSet>, config: &RecConfig) -> Self {
        Self {
            data_sets,
            reconstructions: config.reconstructions,
            ga: config.ga_method(),
        }
    }

    /// Device slots needed to run everything at once.
    pub fn wanted(&self) -> usize {
        self.data_sets.len() * self.reconstructions
    }

    /// Data sets that fit side by side in `available` slots, at least one.
    pub fn parallel(&self, available: usize) -> usize {
        if available >= self.wanted() {
            self.data_sets.len()
        } else {
            (available / self.reconstructions.max(1)).max(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn add_scan(root: &Path, name: &str, with_data: bool) {
        let data_dir = root.join(name).join(PHASING_DATA_DIR);
        fs::create_dir_all(&data_dir).unwrap();
        if with_data {
            fs::write(data_dir.join(DATA_FILE), b"data").unwrap();
        }
    }

    #[test]
    fn separate_scans_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        add_scan(dir.path(), "scan_20", true);
        add_scan(dir.path(), "scan_10", true);
        add_scan(dir.path(), "scan_30", false);
        add_scan(dir.path(), "other", true);

        let mut config = RecConfig::default();
        config.separate_scans = true;
        let data_sets = discover_data_sets(dir.path(), &config).unwrap();
        let dirs: Vec<_> = data_sets.iter().map(|d| d.dir.clone()).collect();
        assert_eq!(dirs, vec![dir.path().join("scan_10"), dir.path().join("scan_20")]);
    }

    #[test]
    fn single_data_set() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join(PHASING_DATA_DIR);
        fs::create_dir_all(&data_dir).unwrap();
        fs::write(data_dir.join(DATA_FILE), b"data").unwrap();

        let data_sets = discover_data_sets(dir.path(), &RecConfig::default()).unwrap();
        assert_eq!(data_sets.len(), 1);
        assert_eq!(data_sets[0].dir, dir.path());
    }

    #[test]
    fn missing_data_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = discover_data_sets(dir.path(), &RecConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            rc_types::RcError::Config(ConfigError::NoDataSets { .. })
        ));
    }

    #[test]
    fn parallel_data_sets() {
        let data_sets = (0..5)
            .map(|i| DataSet {
                datafile: PathBuf::from(format!("scan_{i}/phasing_data/data.tif")),
                dir: PathBuf::from(format!("scan_{i}")),
            })
            .collect();
        let topology = Topology::new(data_sets, &RecConfig::default().with_reconstructions(2));
        assert_eq!(topology.wanted(), 10);
        assert_eq!(topology.parallel(10), 5);
        assert_eq!(topology.parallel(5), 2);
        assert_eq!(topology.parallel(1), 1);
    }
}
