//! Cluster host descriptors: text files with one `<hostname>:<count>` line per host.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::debug;

use rc_types::{config_error, internal_error, RcResult};

use crate::allocation::HostPartition;

/// Parsed host descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostDescriptor {
    pub entries: Vec<(String, usize)>,
}

impl HostDescriptor {
    pub fn from_partition(partition: &HostPartition) -> Self {
        Self {
            entries: partition
                .iter()
                .map(|share| (share.host.clone(), share.devices.len()))
                .collect(),
        }
    }

    pub fn parse(text: &str) -> RcResult<Self> {
        let mut entries = Vec::new();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (host, count) = line
                .rsplit_once(':')
                .ok_or_else(|| config_error!("malformed host descriptor line '{line}'"))?;
            let count = count
                .trim()
                .parse::<usize>()
                .map_err(|e| config_error!("bad device count in '{line}': {e}"))?;
            entries.push((host.trim().to_string(), count));
        }
        Ok(Self { entries })
    }

    pub fn read(path: &Path) -> RcResult<Self> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    pub fn render(&self) -> String {
        let mut text = String::new();
        for (host, count) in &self.entries {
            let _ = writeln!(text, "{host}:{count}");
        }
        text
    }

    pub fn write(&self, path: &Path) -> RcResult<()> {
        std::fs::write(path, self.render())?;
        debug!(path = ?path, hosts = self.entries.len(), "Wrote host descriptor");
        Ok(())
    }

    pub fn total(&self) -> usize {
        self.entries.iter().map(|(_, n)| n).sum()
    }

    /// Carve `sets` descriptors of `per_set` devices each, consuming hosts in order.
    pub fn split(&self, per_set: usize, sets: usize) -> RcResult<Vec<HostDescriptor>> {
        if per_set * sets > self.total() {
            return Err(internal_error!(
                "host descriptor holds {} devices, {} x {} requested",
                self.total(),
                sets,
                per_set
            ));
        }

        let mut remaining = self.entries.clone();
        let mut host_idx = 0;
        let mut parts = Vec::with_capacity(sets);
        for _ in 0..sets {
            let mut part = HostDescriptor::default();
            let mut need = per_set;
            while need > 0 {
                let (host, free) = &mut remaining[host_idx];
                let assigned = need.min(*free);
                if assigned > 0 {
                    part.entries.push((host.clone(), assigned));
                }
                need -= assigned;
                *free -= assigned;
                if *free == 0 {
                    host_idx += 1;
                }
            }
            parts.push(part);
        }
        Ok(parts)
    }
}

/// Split the descriptor at `path` into `<path><i>` files, one per concurrent data set.
pub fn split_descriptor(path: &Path, per_set: usize, sets: usize) -> RcResult<Vec<PathBuf>> {
    let descriptor = HostDescriptor::read(path)?;
    let mut paths = Vec::with_capacity(sets);
    for (i, part) in descriptor.split(per_set, sets)?.into_iter().enumerate() {
        let mut name = path.as_os_str().to_owned();
        name.push(i.to_string());
        let split_path = PathBuf::from(name);
        part.write(&split_path)?;
        paths.push(split_path);
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::HostShare;
    use rc_types::Device;

    #[test]
    fn parse_and_render() {
        let descriptor = HostDescriptor::parse("node1:4\nnode2:2\n\n").unwrap();
        assert_eq!(
            descriptor.entries,
            vec![("node1".to_string(), 4), ("node2".to_string(), 2)]
        );
        assert_eq!(descriptor.render(), "node1:4\nnode2:2\n");
        assert_eq!(descriptor.total(), 6);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(HostDescriptor::parse("node1").is_err());
        assert!(HostDescriptor::parse("node1:many").is_err());
    }

    #[test]
    fn from_partition_counts_devices() {
        let partition = vec![
            HostShare {
                host: "a".into(),
                devices: vec![Device::gpu(0, 0).on_host("a"), Device::gpu(1, 0).on_host("a")],
            },
            HostShare {
                host: "b".into(),
                devices: vec![Device::gpu(0, 0).on_host("b")],
            },
        ];
        let descriptor = HostDescriptor::from_partition(&partition);
        assert_eq!(descriptor.render(), "a:2\nb:1\n");
    }

    #[test]
    fn split_spans_hosts() {
        let descriptor = HostDescriptor::parse("a:3\nb:3").unwrap();
        let parts = descriptor.split(2, 3).unwrap();
        assert_eq!(parts[0].render(), "a:2\n");
        assert_eq!(parts[1].render(), "a:1\nb:1\n");
        assert_eq!(parts[2].render(), "b:2\n");
    }

    #[test]
    fn split_rejects_oversubscription() {
        let descriptor = HostDescriptor::parse("a:2").unwrap();
        assert!(descriptor.split(2, 2).is_err());
    }

    #[test]
    fn split_descriptor_writes_numbered_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hostfile_run");
        std::fs::write(&path, "a:2\nb:2\n").unwrap();

        let paths = split_descriptor(&path, 2, 2).unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths[0].ends_with("hostfile_run0"));
        assert_eq!(std::fs::read_to_string(&paths[1]).unwrap(), "b:2\n");
    }
}
