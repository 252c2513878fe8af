//! Transport identifiers and the per-controller failover path list.

use serde::{Deserialize, Serialize};

/// Transport identifier: enough to address one controller endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransportId {
    pub trtype: String,
    pub traddr: String,
    pub trsvcid: String,
    pub subnqn: String,
    pub hostnqn: String,
}

impl TransportId {
    pub fn tcp(traddr: &str, trsvcid: &str, subnqn: &str) -> Self {
        Self {
            trtype: "tcp".to_string(),
            traddr: traddr.to_string(),
            trsvcid: trsvcid.to_string(),
            subnqn: subnqn.to_string(),
            hostnqn: String::new(),
        }
    }

    pub fn is_fabrics(&self) -> bool {
        self.trtype != "pcie"
    }
}

impl std::fmt::Display for TransportId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.trtype, self.traddr, self.trsvcid)
    }
}

/// One entry in a controller's ordered trid list. The head is always the
/// active path; `last_failed_tsc == 0` means the path never failed (or
/// has recovered).
#[derive(Debug, Clone)]
pub struct NvmePathId {
    pub trid: TransportId,
    pub host_id: String,
    pub last_failed_tsc: u64,
}

impl NvmePathId {
    pub fn new(trid: TransportId) -> Self {
        Self {
            trid,
            host_id: String::new(),
            last_failed_tsc: 0,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.last_failed_tsc != 0
    }
}
