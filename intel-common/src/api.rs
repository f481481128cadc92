//! JSON types for the collector's management API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Well-known machine metadata keys populated by the agent at connect time.
/// Cohort filters may match on these or on any user-supplied key.
pub mod metadata_keys {
    pub const OPERATING_SYSTEM: &str = "operating_system";
    pub const OPERATING_SYSTEM_PLATFORM: &str = "operating_system_platform";
    pub const OPERATING_SYSTEM_VERSION: &str = "operating_system_version";
    pub const ARCHITECTURE: &str = "architecture";
    pub const HOSTNAME: &str = "hostname";
    pub const CPU_CORES: &str = "cpu_cores";
    pub const MEMORY_MB_TOTAL: &str = "memory_mb_total";
}

/// Generic error body returned by the management API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// A named, organization-scoped machine selector plus the executables to
/// track on matched machines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntelCohort {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub name: String,
    pub icon: String,
    pub description: String,
    pub tracked_executables: Vec<String>,
    /// Metadata key to regex source. Empty matches every machine.
    pub metadata_match: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CreateIntelCohortRequest {
    pub name: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tracked_executables: Option<Vec<String>>,
    /// Absent means "match all machines".
    #[serde(default)]
    pub metadata_match: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntelMachine {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub instance_id: String,
    pub metadata: HashMap<String, String>,
    pub ip_address: String,
    pub daemon_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntelMachinesResponse {
    pub intel_machines: Vec<IntelMachine>,
    /// Total matches before pagination.
    pub count: usize,
}

/// One time-bucketed aggregation of raw invocations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntelInvocationSummary {
    pub id: Uuid,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub binary_name: String,
    pub binary_args: Vec<String>,
    pub exit_codes: BTreeMap<i32, i64>,
    pub git_remote_urls: BTreeMap<String, i64>,
    pub working_directories: BTreeMap<String, i64>,
    pub binary_paths: BTreeMap<String, i64>,
    pub machine_metadata: BTreeMap<String, BTreeMap<String, i64>>,
    pub unique_machines: i64,
    pub total_invocations: i64,
    pub median_duration_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntelReport {
    pub invocations: i64,
    /// Git remote URL to the external-auth provider able to serve it, by
    /// first configured regex match. Unmatched URLs map to `None`.
    pub git_auth_providers: HashMap<String, Option<String>>,
    pub intervals: Vec<IntelInvocationSummary>,
}
