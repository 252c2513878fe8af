//! ANA log page model and the group-descriptor walk that applies states
//! to namespaces.

use serde::Serialize;
use strum_macros::Display;

/// Asymmetric namespace access states from the log page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[strum(serialize_all = "snake_case")]
pub enum AnaState {
    Optimized,
    NonOptimized,
    Inaccessible,
    PersistentLoss,
    Change,
}

impl AnaState {
    /// Whether I/O may be dispatched to a namespace in this state.
    pub fn is_accessible(&self) -> bool {
        matches!(self, AnaState::Optimized | AnaState::NonOptimized)
    }

    /// States that keep the anatt transition timer running.
    pub fn in_transition(&self) -> bool {
        matches!(self, AnaState::Inaccessible | AnaState::Change)
    }
}

/// One group descriptor from the log page.
#[derive(Debug, Clone)]
pub struct AnaGroupDescriptor {
    pub group_id: u32,
    pub state: AnaState,
    pub nsids: Vec<u32>,
}

/// The parsed ANA log page.
#[derive(Debug, Clone, Default)]
pub struct AnaLogPage {
    pub groups: Vec<AnaGroupDescriptor>,
}

impl AnaLogPage {
    /// Walk the descriptors invoking `f` per (group, state, nsid).
    pub fn for_each_nsid(&self, mut f: impl FnMut(u32, AnaState, u32)) {
        for desc in &self.groups {
            for nsid in &desc.nsids {
                f(desc.group_id, desc.state, *nsid);
            }
        }
    }
}
