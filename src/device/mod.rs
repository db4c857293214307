//! Per-node device-name allocation.
//!
//! EC2 attach calls need a device name that is unused on the target
//! instance. The allocator keeps a node-keyed table of reservations and
//! fuses it with the device names the last DescribeInstances call reported,
//! so racing publishes on one node always receive distinct names. The table
//! is process-local; a restart rebuilds it from describe output.

pub mod discovery;

use std::{
    collections::{BTreeMap, HashMap},
    sync::Mutex,
};

use crate::errors::{Error, Result};

/// Slot lifecycle: reserved at publish start, confirmed once the cloud
/// reports the attachment, released on detach or on failed publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Reserved,
    Confirmed,
}

#[derive(Debug, Clone)]
struct Slot {
    state: SlotState,
    volume_id: String,
}

/// Device-name scheme of the node platform.
#[derive(Debug, Clone)]
pub enum DeviceNaming {
    /// `/dev/xvdba` .. `/dev/xvdcz`. The first-letter set stays clear of
    /// the root-device prefixes used across instance families.
    Linux,
    /// Integer slots `0..slots`.
    Windows { slots: usize },
}

impl DeviceNaming {
    fn candidates(&self) -> Vec<String> {
        match self {
            DeviceNaming::Linux => {
                let mut names = Vec::with_capacity(52);
                for first in ['b', 'c'] {
                    for second in b'a'..=b'z' {
                        names.push(format!("/dev/xvd{}{}", first, second as char));
                    }
                }
                names
            }
            DeviceNaming::Windows { slots } => (0..*slots).map(|i| i.to_string()).collect(),
        }
    }
}

#[derive(Default)]
struct NodeSlots {
    slots: BTreeMap<String, Slot>,
}

pub struct DeviceAllocator {
    naming: DeviceNaming,
    candidates: Vec<String>,
    nodes: Mutex<HashMap<String, NodeSlots>>,
}

impl DeviceAllocator {
    pub fn new(naming: DeviceNaming) -> Self {
        let candidates = naming.candidates();
        Self {
            naming,
            candidates,
            nodes: Mutex::new(HashMap::new()),
        }
    }

    /// Reserves the first free device name on "node_id" for "volume_id".
    ///
    /// "in_use" carries the device names the latest describe-instances
    /// output reported for the node; they are skipped even when no local
    /// reservation exists. Re-reserving for a volume that already holds a
    /// slot on the node returns the same name.
    pub fn reserve(&self, node_id: &str, volume_id: &str, in_use: &[String]) -> Result<String> {
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes.entry(node_id.to_string()).or_default();

        if let Some((name, _)) = node
            .slots
            .iter()
            .find(|(_, slot)| slot.volume_id == volume_id)
        {
            return Ok(name.clone());
        }

        for name in &self.candidates {
            if node.slots.contains_key(name) {
                continue;
            }
            if in_use.iter().any(|d| d == name) {
                continue;
            }
            node.slots.insert(
                name.clone(),
                Slot {
                    state: SlotState::Reserved,
                    volume_id: volume_id.to_string(),
                },
            );
            log::debug!(
                "reserved device '{}' for '{}' on node '{}'",
                name,
                volume_id,
                node_id
            );
            return Ok(name.clone());
        }

        Err(Error::ResourceExhausted {
            message: format!(
                "no free device name on node '{}' ({} candidates, scheme {:?})",
                node_id,
                self.candidates.len(),
                self.naming
            ),
        })
    }

    /// Promotes a reservation after the cloud reports the attachment.
    pub fn confirm(&self, node_id: &str, name: &str) {
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(slot) = nodes
            .get_mut(node_id)
            .and_then(|node| node.slots.get_mut(name))
        {
            slot.state = SlotState::Confirmed;
        }
    }

    /// Frees a slot on detach or on a failed publish. Unknown names are
    /// ignored so release stays idempotent.
    pub fn release(&self, node_id: &str, name: &str) {
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(node) = nodes.get_mut(node_id) {
            if node.slots.remove(name).is_some() {
                log::debug!("released device '{}' on node '{}'", name, node_id);
            }
            if node.slots.is_empty() {
                nodes.remove(node_id);
            }
        }
    }

    /// Returns the slot currently held by "volume_id" on the node, if any.
    pub fn device_for_volume(&self, node_id: &str, volume_id: &str) -> Option<String> {
        let nodes = self.nodes.lock().unwrap();
        nodes.get(node_id).and_then(|node| {
            node.slots
                .iter()
                .find(|(_, slot)| slot.volume_id == volume_id)
                .map(|(name, _)| name.clone())
        })
    }

    /// Count of reserved+confirmed slots on the node.
    pub fn occupied(&self, node_id: &str) -> usize {
        let nodes = self.nodes.lock().unwrap();
        nodes.get(node_id).map(|n| n.slots.len()).unwrap_or(0)
    }
}
