//! Device allocation: turns a device request and a job size into concrete
//! device leases.
//!
//! Probing the hardware stays outside of this crate; allocators consume a
//! [`DeviceInventory`] that reports free memory per GPU.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

use rc_types::{Device, DeviceRequest, HostDevices, RcResult, ResourceError};

/// Free memory of one GPU as reported by the inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuStatus {
    pub index: u32,
    pub free_memory_mb: f64,
}

/// Source of GPU availability. Implementations query local or remote hosts.
pub trait DeviceInventory: Send + Sync {
    /// GPUs of `host`, or of the local machine when `host` is `None`.
    fn gpus(&self, host: Option<&str>) -> RcResult<Vec<GpuStatus>>;
}

/// Fixed inventory, loaded from JSON or built in code.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StaticInventory {
    #[serde(default)]
    pub local: Vec<GpuStatus>,
    #[serde(default)]
    pub hosts: BTreeMap<String, Vec<GpuStatus>>,
}

impl StaticInventory {
    pub fn local(gpus: Vec<GpuStatus>) -> Self {
        Self {
            local: gpus,
            hosts: BTreeMap::new(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>, gpus: Vec<GpuStatus>) -> Self {
        self.hosts.insert(host.into(), gpus);
        self
    }

    /// Read an inventory snapshot such as
    /// `{"local": [{"index": 0, "free_memory_mb": 8000.0}], "hosts": {}}`.
    pub fn load(path: &Path) -> RcResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let inventory: Self = serde_json::from_str(&text)?;
        debug!(
            path = ?path,
            local = inventory.local.len(),
            hosts = inventory.hosts.len(),
            "Loaded device inventory"
        );
        Ok(inventory)
    }
}

impl DeviceInventory for StaticInventory {
    fn gpus(&self, host: Option<&str>) -> RcResult<Vec<GpuStatus>> {
        Ok(match host {
            None => self.local.clone(),
            Some(host) => self.hosts.get(host).cloned().unwrap_or_default(),
        })
    }
}

/// Devices picked on one host of a cluster run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostShare {
    pub host: String,
    pub devices: Vec<Device>,
}

/// Per-host grouping of the picked devices.
pub type HostPartition = Vec<HostShare>;

/// Result of an allocation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    /// Picked device slots, grouped by GPU.
    pub devices: Vec<Device>,
    /// Number of jobs that can run at once, never above the wanted count.
    pub available: usize,
    /// Set for cluster requests.
    pub hosts: Option<HostPartition>,
}

/// Contract consumed by the scheduler.
pub trait DeviceAllocator: Send + Sync {
    fn allocate(
        &self,
        requested: &DeviceRequest,
        wanted: usize,
        job_size_mb: f64,
    ) -> RcResult<Allocation>;

    /// The configured device with the most free memory.
    fn most_free_device(&self, requested: &DeviceRequest) -> RcResult<Device>;
}

/// Allocator that spreads jobs over GPUs in proportion to free memory.
#[derive(Debug, Clone)]
pub struct BalancedAllocator<I: DeviceInventory> {
    inventory: I,
}

/// Identifies a GPU across hosts while balancing.
type GpuKey = (Option<String>, u32);

impl<I: DeviceInventory> BalancedAllocator<I> {
    pub fn new(inventory: I) -> Self {
        Self { inventory }
    }

    /// Number of `job_size_mb` jobs each selected GPU can hold, in inventory order.
    fn capacities(&self, requested: &DeviceRequest, job_size_mb: f64) -> RcResult<Vec<(GpuKey, usize)>> {
        let per_gpu = |gpu: &GpuStatus| -> usize {
            if job_size_mb <= 0.0 {
                0
            } else {
                (gpu.free_memory_mb / job_size_mb).floor().max(0.0) as usize
            }
        };

        let mut capacities = Vec::new();
        match requested {
            DeviceRequest::Cpu => {}
            DeviceRequest::All | DeviceRequest::List(_) => {
                for gpu in self.inventory.gpus(None)? {
                    let selected = match requested {
                        DeviceRequest::List(ids) => ids.contains(&gpu.index),
                        _ => true,
                    };
                    if selected {
                        capacities.push(((None, gpu.index), per_gpu(&gpu)));
                    }
                }
            }
            DeviceRequest::Cluster(hosts) => {
                for (host, selection) in hosts {
                    for gpu in self.inventory.gpus(Some(host))? {
                        if selection.includes(gpu.index) {
                            capacities.push(((Some(host.clone()), gpu.index), per_gpu(&gpu)));
                        }
                    }
                }
            }
        }
        Ok(capacities)
    }
}

impl<I: DeviceInventory> DeviceAllocator for BalancedAllocator<I> {
    fn allocate(
        &self,
        requested: &DeviceRequest,
        wanted: usize,
        job_size_mb: f64,
    ) -> RcResult<Allocation> {
        if requested.is_cpu() {
            debug!(wanted, "Allocating CPU slots");
            return Ok(Allocation {
                devices: (0..wanted).map(Device::cpu).collect(),
                available: wanted,
                hosts: None,
            });
        }

        let capacities = self.capacities(requested, job_size_mb)?;
        let (load, total) = balanced_load(&capacities, wanted);
        if total == 0 {
            return Err(ResourceError::NoDevices { job_size_mb }.into());
        }

        let devices = unpack_load(&load);
        let hosts = if requested.is_cluster() {
            let mut partition: HostPartition = Vec::new();
            for device in &devices {
                let host = device.host.clone().unwrap_or_default();
                match partition.iter_mut().find(|share| share.host == host) {
                    Some(share) => share.devices.push(device.clone()),
                    None => partition.push(HostShare {
                        host,
                        devices: vec![device.clone()],
                    }),
                }
            }
            Some(partition)
        } else {
            None
        };

        let available = total.min(wanted);
        info!(
            wanted,
            available,
            job_size_mb,
            devices = devices.len(),
            "Allocated devices"
        );

        Ok(Allocation {
            devices,
            available,
            hosts,
        })
    }

    fn most_free_device(&self, requested: &DeviceRequest) -> RcResult<Device> {
        let candidates = match requested {
            DeviceRequest::Cpu => return Ok(Device::cpu(0)),
            DeviceRequest::All => self.inventory.gpus(None)?,
            DeviceRequest::List(ids) => self
                .inventory
                .gpus(None)?
                .into_iter()
                .filter(|gpu| ids.contains(&gpu.index))
                .collect(),
            // Only the local host's share of a cluster request is usable here
            DeviceRequest::Cluster(hosts) => {
                let local = hosts
                    .iter()
                    .find(|(host, _)| host.as_str() == "localhost")
                    .map(|(_, selection)| selection.clone())
                    .unwrap_or(HostDevices::List(Vec::new()));
                self.inventory
                    .gpus(None)?
                    .into_iter()
                    .filter(|gpu| local.includes(gpu.index))
                    .collect()
            }
        };

        candidates
            .into_iter()
            .filter(|gpu| gpu.free_memory_mb > 0.0)
            .max_by(|a, b| a.free_memory_mb.total_cmp(&b.free_memory_mb))
            .map(|gpu| Device::gpu(gpu.index, 0))
            .ok_or_else(|| ResourceError::NoDevices { job_size_mb: 0.0 }.into())
    }
}

/// Distribute `wanted` jobs over GPUs proportionally to their capacity.
///
/// Returns the per-GPU load and the number of jobs placed. When the total
/// capacity does not exceed `wanted`, every slot is used.
pub fn balanced_load<K: Clone>(capacities: &[(K, usize)], wanted: usize) -> (Vec<(K, usize)>, usize) {
    if wanted == 0 {
        return (Vec::new(), 0);
    }
    let total: usize = capacities.iter().map(|(_, cap)| cap).sum();
    if total <= wanted {
        return (capacities.to_vec(), total);
    }

    let mut remaining: Vec<usize> = capacities.iter().map(|(_, cap)| *cap).collect();
    let mut load = vec![0usize; capacities.len()];
    let mut need = wanted;
    let mut available = total;

    // One job on every GPU that can take one
    for i in 0..capacities.len() {
        if remaining[i] > 0 {
            load[i] = 1;
            remaining[i] -= 1;
            need -= 1;
            available -= 1;
            if need == 0 {
                return (zip_load(capacities, &load), wanted);
            }
        }
    }

    // Share the rest proportionally to what is left
    let ratio = need as f64 / available as f64;
    let mut distributed = 0;
    for i in 0..capacities.len() {
        if remaining[i] > 0 {
            let share = (remaining[i] as f64 * ratio).floor() as usize;
            load[i] += share;
            remaining[i] -= share;
            distributed += share;
        }
    }
    need -= distributed;

    // Hand out leftovers one at a time
    for i in 0..capacities.len() {
        if need == 0 {
            break;
        }
        if remaining[i] > 0 {
            load[i] += 1;
            remaining[i] -= 1;
            need -= 1;
        }
    }

    (zip_load(capacities, &load), wanted)
}

fn zip_load<K: Clone>(capacities: &[(K, usize)], load: &[usize]) -> Vec<(K, usize)> {
    capacities
        .iter()
        .zip(load)
        .map(|((key, _), n)| (key.clone(), *n))
        .collect()
}

/// Expand a per-GPU load into one device slot per job.
fn unpack_load(load: &[(GpuKey, usize)]) -> Vec<Device> {
    let mut devices = Vec::new();
    for ((host, index), n) in load {
        for slot in 0..*n {
            let device = Device::gpu(*index, slot);
            devices.push(match host {
                Some(host) => device.on_host(host.clone()),
                None => device,
            });
        }
    }
    devices
}
