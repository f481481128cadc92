//! Storage interface for the collector.
//!
//! The core only depends on this trait; the bundled implementation is the
//! in-memory [`mem::MemStore`]. A relational implementation must provide the
//! same semantics, most importantly the `(instance_id, organization_id)`
//! upsert key for machines and the distinguishable name-conflict error for
//! cohorts.

pub mod mem;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use intel_common::api::{IntelCohort, IntelInvocationSummary, IntelMachine};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Unique-constraint conflict, e.g. a cohort name already taken within
    /// the organization.
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid regex for {key}: {source}")]
    InvalidRegex {
        key: String,
        #[source]
        source: regex::Error,
    },
    #[error("store failure: {0}")]
    Internal(String),
}

#[derive(Debug, Clone)]
pub struct UpsertIntelMachineParams {
    pub instance_id: String,
    pub organization_id: Uuid,
    pub user_id: Uuid,
    pub ip_address: String,
    pub daemon_version: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct UpsertIntelCohortParams {
    pub organization_id: Uuid,
    pub created_by: Uuid,
    pub name: String,
    pub icon: String,
    pub description: String,
    pub tracked_executables: Vec<String>,
    /// Metadata key to regex source. Validated before storage.
    pub metadata_match: HashMap<String, String>,
}

/// Columnar invocation batch, one element per row across every column.
#[derive(Debug, Clone, Default)]
pub struct InsertIntelInvocationsParams {
    pub ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub machine_id: Uuid,
    pub user_id: Uuid,
    pub binary_name: Vec<String>,
    pub binary_hash: Vec<String>,
    pub binary_path: Vec<String>,
    pub binary_args: Vec<Vec<String>>,
    pub binary_version: Vec<String>,
    pub working_directory: Vec<String>,
    pub git_remote_url: Vec<String>,
    pub exit_code: Vec<i32>,
    pub duration_ms: Vec<i64>,
}

impl InsertIntelInvocationsParams {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// A cohort matched to a specific machine.
#[derive(Debug, Clone)]
pub struct MachineCohortMatch {
    pub machine_id: Uuid,
    pub cohort: IntelCohort,
}

#[derive(Debug, Clone, Default)]
pub struct GetIntelMachinesParams {
    pub organization_id: Uuid,
    /// Metadata key to regex source; every entry must match.
    pub metadata_match: HashMap<String, String>,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone)]
pub struct GetIntelInvocationSummariesParams {
    pub organization_id: Uuid,
    pub starts_at: Option<DateTime<Utc>>,
    /// Restrict to invocations from machines matching all regexes. Empty
    /// matches every machine.
    pub metadata_match: HashMap<String, String>,
}

#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Create or update a machine, keyed by `(instance_id, organization_id)`.
    async fn upsert_intel_machine(
        &self,
        params: UpsertIntelMachineParams,
    ) -> Result<IntelMachine, StoreError>;

    /// Cohorts of an organization, optionally restricted to one name.
    async fn get_intel_cohorts_by_organization_id(
        &self,
        organization_id: Uuid,
        name: Option<&str>,
    ) -> Result<Vec<IntelCohort>, StoreError>;

    /// For each machine, the cohorts whose `metadata_match` it satisfies.
    async fn get_intel_cohorts_matched_by_machine_ids(
        &self,
        machine_ids: &[Uuid],
    ) -> Result<Vec<MachineCohortMatch>, StoreError>;

    /// Paginated machine listing; returns the page plus the total count.
    async fn get_intel_machines_matching_filters(
        &self,
        params: GetIntelMachinesParams,
    ) -> Result<(Vec<IntelMachine>, usize), StoreError>;

    /// Create or update a cohort. Conflict on `(organization_id, name)`
    /// surfaces [`StoreError::AlreadyExists`].
    async fn upsert_intel_cohort(
        &self,
        params: UpsertIntelCohortParams,
    ) -> Result<IntelCohort, StoreError>;

    /// Bulk-insert one flushed batch of invocations.
    async fn insert_intel_invocations(
        &self,
        params: InsertIntelInvocationsParams,
    ) -> Result<(), StoreError>;

    /// Fold raw invocations recorded since the last refresh into summary
    /// buckets.
    async fn upsert_intel_invocation_summaries(&self) -> Result<(), StoreError>;

    async fn get_intel_invocation_summaries(
        &self,
        params: GetIntelInvocationSummariesParams,
    ) -> Result<Vec<IntelInvocationSummary>, StoreError>;
}

/// Validate that every value in a metadata-match map compiles as a regex.
pub fn validate_metadata_match(
    metadata_match: &HashMap<String, String>,
) -> Result<(), StoreError> {
    for (key, source) in metadata_match {
        regex::Regex::new(source).map_err(|err| StoreError::InvalidRegex {
            key: key.clone(),
            source: err,
        })?;
    }
    Ok(())
}
