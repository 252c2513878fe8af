//! Module claims: reservations that keep conflicting descriptors or other
//! modules away from a bdev. v1 is the whole-bdev exclusive writer claim;
//! v2 claims are per-descriptor records that share a list on the bdev.

use std::sync::Weak;

use serde::Serialize;

use super::desc::BdevDesc;

/// Claim types, from strongest to most permissive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ClaimType {
    None,
    /// v1: exclusive writer at bdev level, collides with everything.
    ExclWrite,
    /// At most one writable descriptor may be open.
    ReadManyWriteOne,
    /// No writable descriptor may be open.
    ReadManyWriteNone,
    /// Multiple writable descriptors allowed iff their keys match.
    ReadManyWriteShared,
}

impl ClaimType {
    /// Whether holding this claim implies writer semantics for the
    /// claiming descriptor.
    pub fn implies_writer(&self) -> bool {
        matches!(
            self,
            ClaimType::ExclWrite
                | ClaimType::ReadManyWriteOne
                | ClaimType::ReadManyWriteShared
        )
    }

    pub fn is_v2(&self) -> bool {
        matches!(
            self,
            ClaimType::ReadManyWriteOne
                | ClaimType::ReadManyWriteNone
                | ClaimType::ReadManyWriteShared
        )
    }
}

/// Options for taking a claim.
#[derive(Debug, Default, Clone)]
pub struct ClaimOpts {
    /// Key for `ReadManyWriteShared`; must be non-zero and equal across
    /// claimants.
    pub shared_claim_key: u64,
    /// Human readable tag recorded with the claim.
    pub name: Option<String>,
}

/// One claim record. During examine, records may briefly exist without a
/// module; those are purged when examine completes.
pub(crate) struct ClaimRecord {
    pub module: Option<String>,
    pub desc: Weak<BdevDesc>,
    pub key: u64,
    #[allow(dead_code)]
    pub name: Option<String>,
}

/// Claim state kept under the bdev lock.
#[derive(Default)]
pub(crate) struct ClaimState {
    pub claim_type: Option<ClaimType>,
    pub records: Vec<ClaimRecord>,
}

impl ClaimState {
    pub fn claim_type(&self) -> ClaimType {
        self.claim_type.unwrap_or(ClaimType::None)
    }

    /// Drop records whose descriptor is gone, clearing the claim type when
    /// the list empties.
    pub fn prune(&mut self) {
        self.records.retain(|r| r.desc.strong_count() > 0);
        if self.records.is_empty() {
            self.claim_type = None;
        }
    }

    /// Purge vestigial (module-less) records left behind by examine.
    pub fn purge_vestigial(&mut self) {
        self.records.retain(|r| r.module.is_some());
        if self.records.is_empty() {
            self.claim_type = None;
        }
    }
}
