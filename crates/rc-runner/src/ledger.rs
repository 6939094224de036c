//! Exclusive device leases with an audit trail.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use rc_types::{Device, RcResult, ResourceError, TrialId};

/// One lease of a device by a trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseEvent {
    pub device: Device,
    pub trial: TrialId,
    pub acquired_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct LedgerState {
    held: HashMap<Device, (TrialId, usize)>,
    events: Vec<LeaseEvent>,
}

/// Tracks which trial holds which device slot.
#[derive(Debug, Default)]
pub struct DeviceLedger {
    state: Mutex<LedgerState>,
}

impl DeviceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lease `device` to `trial` until the returned guard is dropped.
    pub fn acquire(self: &Arc<Self>, device: &Device, trial: TrialId) -> RcResult<Lease> {
        let mut state = self.state.lock();
        if let Some((holder, _)) = state.held.get(device) {
            return Err(ResourceError::DeviceBusy {
                device: device.clone(),
                holder: *holder,
            }
            .into());
        }

        let event = state.events.len();
        state.events.push(LeaseEvent {
            device: device.clone(),
            trial,
            acquired_at: Utc::now(),
            released_at: None,
        });
        state.held.insert(device.clone(), (trial, event));
        debug!(device = %device, trial, "Device leased");

        Ok(Lease {
            ledger: Arc::clone(self),
            device: device.clone(),
            trial,
        })
    }

    fn release(&self, device: &Device) {
        let mut state = self.state.lock();
        if let Some((trial, event)) = state.held.remove(device) {
            if let Some(record) = state.events.get_mut(event) {
                record.released_at = Some(Utc::now());
            }
            debug!(device = %device, trial, "Device released");
        }
    }

    pub fn holder(&self, device: &Device) -> Option<TrialId> {
        self.state.lock().held.get(device).map(|(trial, _)| *trial)
    }

    pub fn held_count(&self) -> usize {
        self.state.lock().held.len()
    }

    /// Every lease taken so far, in acquisition order.
    pub fn events(&self) -> Vec<LeaseEvent> {
        self.state.lock().events.clone()
    }
}

/// RAII guard over a device lease.
#[derive(Debug)]
pub struct Lease {
    ledger: Arc<DeviceLedger>,
    device: Device,
    trial: TrialId,
}

impl Lease {
    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn trial(&self) -> TrialId {
        self.trial
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.ledger.release(&self.device);
    }
}

/// True when no two leases of the same device overlap in time.
pub fn leases_are_exclusive(events: &[LeaseEvent]) -> bool {
    let mut by_device: HashMap<&Device, Vec<&LeaseEvent>> = HashMap::new();
    for event in events {
        by_device.entry(&event.device).or_default().push(event);
    }

    by_device.values().all(|leases| {
        leases.windows(2).all(|pair| match pair[0].released_at {
            Some(released) => released <= pair[1].acquired_at,
            None => false,
        })
    })
}
