//! # rc-balancer
//!
//! Device allocation for reconstruction runs: memory-based job sizing,
//! balanced placement of jobs on GPUs and cluster host descriptors.

pub mod allocation;
pub mod hostfile;
pub mod sizing;

pub use allocation::{
    balanced_load, Allocation, BalancedAllocator, DeviceAllocator, DeviceInventory, GpuStatus,
    HostPartition, HostShare, StaticInventory,
};
pub use hostfile::{split_descriptor, HostDescriptor};
pub use sizing::{estimate, AlgorithmClass};
