//! Compute devices and device requests.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Index used on the wire and in configuration for "CPU only".
pub const CPU_INDEX: i64 = -1;

/// What kind of compute a device lease refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceKind {
    Gpu(u32),
    Cpu,
}

/// An exclusive unit of compute bound to one trial at a time.
///
/// A GPU with enough free memory for several jobs is handed out several
/// times, each with its own `slot`. Exclusivity is tracked per
/// `(host, kind, slot)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Device {
    pub kind: DeviceKind,
    pub slot: usize,
    pub host: Option<String>,
}

impl Device {
    pub fn gpu(index: u32, slot: usize) -> Self {
        Self {
            kind: DeviceKind::Gpu(index),
            slot,
            host: None,
        }
    }

    pub fn cpu(slot: usize) -> Self {
        Self {
            kind: DeviceKind::Cpu,
            slot,
            host: None,
        }
    }

    pub fn on_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Device index as understood by the optimizer backend, -1 for CPU.
    pub fn index(&self) -> i64 {
        match self.kind {
            DeviceKind::Gpu(index) => index as i64,
            DeviceKind::Cpu => CPU_INDEX,
        }
    }

    pub fn is_cpu(&self) -> bool {
        self.kind == DeviceKind::Cpu
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(host) = &self.host {
            write!(f, "{host}/")?;
        }
        match self.kind {
            DeviceKind::Gpu(index) => write!(f, "gpu:{index}#{}", self.slot),
            DeviceKind::Cpu => write!(f, "cpu#{}", self.slot),
        }
    }
}

/// Devices a host contributes in a cluster request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostDevices {
    All,
    List(Vec<u32>),
}

impl HostDevices {
    pub fn includes(&self, index: u32) -> bool {
        match self {
            Self::All => true,
            Self::List(ids) => ids.contains(&index),
        }
    }
}

/// The configured `device` parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawDevices", into = "RawDevices")]
pub enum DeviceRequest {
    /// Run on CPU only (`[-1]`).
    Cpu,
    /// Every GPU on the local host (`"all"`).
    All,
    /// Explicit local GPU indices.
    List(Vec<u32>),
    /// Per-host GPU selection for cluster runs.
    Cluster(BTreeMap<String, HostDevices>),
}

impl Default for DeviceRequest {
    fn default() -> Self {
        Self::Cpu
    }
}

impl DeviceRequest {
    pub fn is_cpu(&self) -> bool {
        matches!(self, Self::Cpu)
    }

    pub fn is_cluster(&self) -> bool {
        matches!(self, Self::Cluster(_))
    }

    /// First explicitly configured device, used by the single inline trial.
    pub fn first_explicit(&self) -> Option<Device> {
        match self {
            Self::Cpu => Some(Device::cpu(0)),
            Self::List(ids) => ids.first().map(|index| Device::gpu(*index, 0)),
            Self::All | Self::Cluster(_) => None,
        }
    }
}

impl fmt::Display for DeviceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "[-1]"),
            Self::All => write!(f, "all"),
            Self::List(ids) => write!(f, "{ids:?}"),
            Self::Cluster(hosts) => {
                let names: Vec<&str> = hosts.keys().map(String::as_str).collect();
                write!(f, "cluster({})", names.join(","))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawHostDevices {
    Keyword(String),
    List(Vec<u32>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawDevices {
    Keyword(String),
    List(Vec<i64>),
    Cluster(BTreeMap<String, RawHostDevices>),
}

impl TryFrom<RawDevices> for DeviceRequest {
    type Error = String;

    fn try_from(raw: RawDevices) -> Result<Self, Self::Error> {
        match raw {
            RawDevices::Keyword(word) if word == "all" => Ok(Self::All),
            RawDevices::Keyword(word) if word == "cpu" => Ok(Self::Cpu),
            RawDevices::Keyword(word) => Err(format!("unsupported device keyword '{word}'")),
            RawDevices::List(ids) => {
                if ids.is_empty() || ids.iter().any(|id| *id == CPU_INDEX) {
                    return Ok(Self::Cpu);
                }
                let ids = ids
                    .into_iter()
                    .map(|id| u32::try_from(id).map_err(|_| format!("invalid device index {id}")))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self::List(ids))
            }
            RawDevices::Cluster(hosts) => {
                let hosts = hosts
                    .into_iter()
                    .map(|(host, devices)| {
                        let devices = match devices {
                            RawHostDevices::Keyword(word) if word == "all" => HostDevices::All,
                            RawHostDevices::Keyword(word) => {
                                return Err(format!("unsupported device keyword '{word}' for {host}"))
                            }
                            RawHostDevices::List(ids) => HostDevices::List(ids),
                        };
                        Ok((host, devices))
                    })
                    .collect::<Result<BTreeMap<_, _>, _>>()?;
                Ok(Self::Cluster(hosts))
            }
        }
    }
}

impl From<DeviceRequest> for RawDevices {
    fn from(request: DeviceRequest) -> Self {
        match request {
            DeviceRequest::Cpu => RawDevices::List(vec![CPU_INDEX]),
            DeviceRequest::All => RawDevices::Keyword("all".to_string()),
            DeviceRequest::List(ids) => RawDevices::List(ids.into_iter().map(i64::from).collect()),
            DeviceRequest::Cluster(hosts) => RawDevices::Cluster(
                hosts
                    .into_iter()
                    .map(|(host, devices)| {
                        let devices = match devices {
                            HostDevices::All => RawHostDevices::Keyword("all".to_string()),
                            HostDevices::List(ids) => RawHostDevices::List(ids),
                        };
                        (host, devices)
                    })
                    .collect(),
            ),
        }
    }
}
