use serde::{Deserialize, Serialize};

pub mod api {
    use super::*;

    /// Response of `GET /api/status` on an agent.
    /// `status` is "online" on a healthy agent; anything else is treated as
    /// a failed liveness check by the panel.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct AgentStatus {
        pub status: String,
        pub server_id: String,
        pub version: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub uptime: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub last_update: Option<String>,
    }

    /// Response of `GET /api/stats` on an agent.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct AgentStats {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub timestamp: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub server_id: Option<String>,
        pub cpu: CpuStats,
        pub memory: MemoryStats,
        pub disk: DiskStats,
        pub network: NetworkStats,
        pub uptime: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub agent_version: Option<String>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct CpuStats {
        pub percent: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub count: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub load_avg: Option<Vec<f64>>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct MemoryStats {
        pub percent: f64,
        #[serde(default)]
        pub total: u64,
        #[serde(default)]
        pub used: u64,
        #[serde(default)]
        pub available: u64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct DiskStats {
        pub percent: f64,
        #[serde(default)]
        pub total: u64,
        #[serde(default)]
        pub used: u64,
        #[serde(default)]
        pub free: u64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct NetworkStats {
        #[serde(default)]
        pub bytes_sent: u64,
        #[serde(default)]
        pub bytes_recv: u64,
        #[serde(default)]
        pub packets_sent: u64,
        #[serde(default)]
        pub packets_recv: u64,
    }

    /// Body of `POST /api/execute`.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ExecuteRequest {
        pub command: String,
    }

    /// Result of `POST /api/execute`. Shell failures are reported in-band
    /// (`returncode` -1 on timeout/spawn failure), never as an HTTP error.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct ExecuteResult {
        pub success: bool,
        pub stdout: String,
        pub stderr: String,
        pub returncode: i32,
    }
}
