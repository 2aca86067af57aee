use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Active,
    /// No heartbeat within the dead threshold; flips back on the next one.
    Inactive,
    /// Removed by admin action; never reactivated or targeted again.
    Decommissioned,
}

/// One registered storage worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub rack: Option<String>,
    pub free_space: u64,
    pub total_space: u64,
    pub chunk_count: u64,
    pub last_heartbeat: i64,
    pub state: NodeState,
}

impl NodeRecord {
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn is_active(&self) -> bool {
        self.state == NodeState::Active
    }

    /// Fraction of the mount that is still free.
    pub fn free_ratio(&self) -> f64 {
        if self.total_space == 0 {
            return 0.0;
        }
        self.free_space as f64 / self.total_space as f64
    }
}
