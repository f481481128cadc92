//! In-memory store implementation.
//!
//! Backs the dev collector and the test suite. Raw invocations are the
//! source of truth; the refresh operation folds them into per-machine
//! summary shards which reads merge under the caller's metadata filter, so
//! a filter never sees partial contributions from non-matching machines.

use super::{
    GetIntelInvocationSummariesParams, GetIntelMachinesParams, InsertIntelInvocationsParams,
    MachineCohortMatch, Store, StoreError, UpsertIntelCohortParams, UpsertIntelMachineParams,
};
use crate::cohorts::MetadataMatcher;
use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Utc};
use intel_common::api::{IntelCohort, IntelInvocationSummary, IntelMachine};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Width of a summary bucket.
const BUCKET_WIDTH_HOURS: i64 = 1;

#[derive(Debug, Clone)]
struct InvocationRow {
    #[allow(dead_code)]
    id: Uuid,
    created_at: DateTime<Utc>,
    machine_id: Uuid,
    organization_id: Uuid,
    binary_name: String,
    binary_path: String,
    binary_args: Vec<String>,
    working_directory: String,
    git_remote_url: String,
    exit_code: i32,
    duration_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    organization_id: Uuid,
    starts_at: DateTime<Utc>,
    binary_name: String,
    binary_args: Vec<String>,
}

/// One machine's contribution to a bucket.
#[derive(Debug, Clone, Default)]
struct MachineShard {
    exit_codes: BTreeMap<i32, i64>,
    git_remote_urls: BTreeMap<String, i64>,
    working_directories: BTreeMap<String, i64>,
    binary_paths: BTreeMap<String, i64>,
    durations_ms: Vec<i64>,
    invocations: i64,
}

#[derive(Default)]
struct State {
    machines: Vec<IntelMachine>,
    cohorts: Vec<IntelCohort>,
    invocations: Vec<InvocationRow>,
    /// Index of the first invocation not yet folded into shards.
    folded: usize,
    shards: HashMap<BucketKey, HashMap<Uuid, MachineShard>>,
}

#[derive(Default)]
pub struct MemStore {
    state: RwLock<State>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn upsert_intel_machine(
        &self,
        params: UpsertIntelMachineParams,
    ) -> Result<IntelMachine, StoreError> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        if let Some(machine) = state.machines.iter_mut().find(|m| {
            m.instance_id == params.instance_id && m.organization_id == params.organization_id
        }) {
            machine.user_id = params.user_id;
            machine.metadata = params.metadata;
            machine.ip_address = params.ip_address;
            machine.daemon_version = params.daemon_version;
            machine.updated_at = now;
            return Ok(machine.clone());
        }
        let machine = IntelMachine {
            id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            user_id: params.user_id,
            organization_id: params.organization_id,
            instance_id: params.instance_id,
            metadata: params.metadata,
            ip_address: params.ip_address,
            daemon_version: params.daemon_version,
        };
        state.machines.push(machine.clone());
        Ok(machine)
    }

    async fn get_intel_cohorts_by_organization_id(
        &self,
        organization_id: Uuid,
        name: Option<&str>,
    ) -> Result<Vec<IntelCohort>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .cohorts
            .iter()
            .filter(|c| c.organization_id == organization_id)
            .filter(|c| name.map(|n| c.name == n).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn get_intel_cohorts_matched_by_machine_ids(
        &self,
        machine_ids: &[Uuid],
    ) -> Result<Vec<MachineCohortMatch>, StoreError> {
        let state = self.state.read().await;
        let mut matches = Vec::new();
        for machine_id in machine_ids {
            let Some(machine) = state.machines.iter().find(|m| m.id == *machine_id) else {
                continue;
            };
            for cohort in state
                .cohorts
                .iter()
                .filter(|c| c.organization_id == machine.organization_id)
            {
                let matcher = MetadataMatcher::compile(&cohort.metadata_match).map_err(|err| {
                    StoreError::Internal(format!(
                        "cohort {} has an invalid stored regex: {err}",
                        cohort.id
                    ))
                })?;
                if matcher.matches(&machine.metadata) {
                    matches.push(MachineCohortMatch {
                        machine_id: machine.id,
                        cohort: cohort.clone(),
                    });
                }
            }
        }
        Ok(matches)
    }

    async fn get_intel_machines_matching_filters(
        &self,
        params: GetIntelMachinesParams,
    ) -> Result<(Vec<IntelMachine>, usize), StoreError> {
        super::validate_metadata_match(&params.metadata_match)?;
        let matcher = MetadataMatcher::compile(&params.metadata_match)
            .map_err(|err| StoreError::Internal(err.to_string()))?;
        let state = self.state.read().await;
        let matching: Vec<&IntelMachine> = state
            .machines
            .iter()
            .filter(|m| m.organization_id == params.organization_id)
            .filter(|m| matcher.matches(&m.metadata))
            .collect();
        let count = matching.len();
        let page: Vec<IntelMachine> = matching
            .into_iter()
            .skip(params.offset)
            .take(if params.limit == 0 {
                usize::MAX
            } else {
                params.limit
            })
            .cloned()
            .collect();
        Ok((page, count))
    }

    async fn upsert_intel_cohort(
        &self,
        params: UpsertIntelCohortParams,
    ) -> Result<IntelCohort, StoreError> {
        super::validate_metadata_match(&params.metadata_match)?;
        let mut state = self.state.write().await;
        if state
            .cohorts
            .iter()
            .any(|c| c.organization_id == params.organization_id && c.name == params.name)
        {
            return Err(StoreError::AlreadyExists(format!(
                "cohort {:?}",
                params.name
            )));
        }
        let now = Utc::now();
        let cohort = IntelCohort {
            id: Uuid::new_v4(),
            organization_id: params.organization_id,
            created_by: params.created_by,
            created_at: now,
            updated_at: now,
            name: params.name,
            icon: params.icon,
            description: params.description,
            tracked_executables: params.tracked_executables,
            metadata_match: params.metadata_match,
        };
        state.cohorts.push(cohort.clone());
        Ok(cohort)
    }

    async fn insert_intel_invocations(
        &self,
        params: InsertIntelInvocationsParams,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let organization_id = state
            .machines
            .iter()
            .find(|m| m.id == params.machine_id)
            .map(|m| m.organization_id)
            .ok_or_else(|| StoreError::NotFound(format!("machine {}", params.machine_id)))?;
        for i in 0..params.len() {
            state.invocations.push(InvocationRow {
                id: params.ids[i],
                created_at: params.created_at,
                machine_id: params.machine_id,
                organization_id,
                binary_name: params.binary_name[i].clone(),
                binary_path: params.binary_path[i].clone(),
                binary_args: params.binary_args[i].clone(),
                working_directory: params.working_directory[i].clone(),
                git_remote_url: params.git_remote_url[i].clone(),
                exit_code: params.exit_code[i],
                duration_ms: params.duration_ms[i],
            });
        }
        Ok(())
    }

    async fn upsert_intel_invocation_summaries(&self) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let start = state.folded;
        for index in start..state.invocations.len() {
            let row = state.invocations[index].clone();
            let starts_at = row
                .created_at
                .duration_trunc(Duration::hours(BUCKET_WIDTH_HOURS))
                .map_err(|err| StoreError::Internal(err.to_string()))?;
            let key = BucketKey {
                organization_id: row.organization_id,
                starts_at,
                binary_name: row.binary_name.clone(),
                binary_args: row.binary_args.clone(),
            };
            let shard = state
                .shards
                .entry(key)
                .or_default()
                .entry(row.machine_id)
                .or_default();
            *shard.exit_codes.entry(row.exit_code).or_default() += 1;
            if !row.git_remote_url.is_empty() {
                *shard.git_remote_urls.entry(row.git_remote_url).or_default() += 1;
            }
            if !row.working_directory.is_empty() {
                *shard
                    .working_directories
                    .entry(row.working_directory)
                    .or_default() += 1;
            }
            if !row.binary_path.is_empty() {
                *shard.binary_paths.entry(row.binary_path).or_default() += 1;
            }
            shard.durations_ms.push(row.duration_ms);
            shard.invocations += 1;
        }
        let folded = state.invocations.len() - start;
        state.folded = state.invocations.len();
        debug!(count = folded, "folded invocations into summary shards");
        Ok(())
    }

    async fn get_intel_invocation_summaries(
        &self,
        params: GetIntelInvocationSummariesParams,
    ) -> Result<Vec<IntelInvocationSummary>, StoreError> {
        super::validate_metadata_match(&params.metadata_match)?;
        let matcher = MetadataMatcher::compile(&params.metadata_match)
            .map_err(|err| StoreError::Internal(err.to_string()))?;
        let state = self.state.read().await;

        let mut summaries = Vec::new();
        for (key, machine_shards) in &state.shards {
            if key.organization_id != params.organization_id {
                continue;
            }
            if let Some(starts_at) = params.starts_at {
                if key.starts_at < starts_at {
                    continue;
                }
            }
            let summary = merge_shards(&state.machines, &matcher, key, machine_shards);
            if let Some(summary) = summary {
                summaries.push(summary);
            }
        }
        summaries.sort_by(|a, b| {
            (a.starts_at, &a.binary_name, &a.binary_args)
                .cmp(&(b.starts_at, &b.binary_name, &b.binary_args))
        });
        Ok(summaries)
    }
}

/// Merge the shards of filter-matching machines into one summary bucket.
/// `None` when no contributing machine matches.
fn merge_shards(
    machines: &[IntelMachine],
    matcher: &MetadataMatcher,
    key: &BucketKey,
    machine_shards: &HashMap<Uuid, MachineShard>,
) -> Option<IntelInvocationSummary> {
    let mut exit_codes = BTreeMap::new();
    let mut git_remote_urls = BTreeMap::new();
    let mut working_directories = BTreeMap::new();
    let mut binary_paths = BTreeMap::new();
    let mut machine_metadata: BTreeMap<String, BTreeMap<String, i64>> = BTreeMap::new();
    let mut durations = Vec::new();
    let mut total = 0i64;
    let mut unique_machines = 0i64;

    for (machine_id, shard) in machine_shards {
        let metadata = machines
            .iter()
            .find(|m| m.id == *machine_id)
            .map(|m| &m.metadata);
        let Some(metadata) = metadata else {
            continue;
        };
        if !matcher.matches(metadata) {
            continue;
        }
        unique_machines += 1;
        total += shard.invocations;
        merge_counts(&mut exit_codes, &shard.exit_codes);
        merge_counts(&mut git_remote_urls, &shard.git_remote_urls);
        merge_counts(&mut working_directories, &shard.working_directories);
        merge_counts(&mut binary_paths, &shard.binary_paths);
        durations.extend_from_slice(&shard.durations_ms);
        for (meta_key, meta_value) in metadata {
            *machine_metadata
                .entry(meta_key.clone())
                .or_default()
                .entry(meta_value.clone())
                .or_default() += shard.invocations;
        }
    }

    if unique_machines == 0 {
        return None;
    }

    Some(IntelInvocationSummary {
        id: Uuid::new_v4(),
        starts_at: key.starts_at,
        ends_at: key.starts_at + Duration::hours(BUCKET_WIDTH_HOURS),
        binary_name: key.binary_name.clone(),
        binary_args: key.binary_args.clone(),
        exit_codes,
        git_remote_urls,
        working_directories,
        binary_paths,
        machine_metadata,
        unique_machines,
        total_invocations: total,
        median_duration_ms: median(&mut durations),
    })
}

fn merge_counts<K: Ord + Clone>(into: &mut BTreeMap<K, i64>, from: &BTreeMap<K, i64>) {
    for (key, count) in from {
        *into.entry(key.clone()).or_default() += count;
    }
}

fn median(durations: &mut Vec<i64>) -> f64 {
    if durations.is_empty() {
        return 0.0;
    }
    durations.sort_unstable();
    let mid = durations.len() / 2;
    if durations.len() % 2 == 1 {
        durations[mid] as f64
    } else {
        (durations[mid - 1] + durations[mid]) as f64 / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine_params(instance: &str, org: Uuid, os: &str) -> UpsertIntelMachineParams {
        UpsertIntelMachineParams {
            instance_id: instance.to_string(),
            organization_id: org,
            user_id: Uuid::new_v4(),
            ip_address: "127.0.0.1".to_string(),
            daemon_version: "0.1.0".to_string(),
            metadata: HashMap::from([("operating_system".to_string(), os.to_string())]),
        }
    }

    fn invocation_batch(machine: &IntelMachine, binary: &str, duration_ms: i64) -> InsertIntelInvocationsParams {
        InsertIntelInvocationsParams {
            ids: vec![Uuid::new_v4()],
            created_at: Utc::now(),
            machine_id: machine.id,
            user_id: machine.user_id,
            binary_name: vec![binary.to_string()],
            binary_hash: vec!["hash".to_string()],
            binary_path: vec![format!("/usr/bin/{binary}")],
            binary_args: vec![vec!["run".to_string()]],
            binary_version: vec![String::new()],
            working_directory: vec!["/home/coder".to_string()],
            git_remote_url: vec!["https://github.com/example/x".to_string()],
            exit_code: vec![0],
            duration_ms: vec![duration_ms],
        }
    }

    #[tokio::test]
    async fn machine_upsert_updates_in_place() {
        let store = MemStore::new();
        let org = Uuid::new_v4();
        let first = store
            .upsert_intel_machine(machine_params("instance-1", org, "linux"))
            .await
            .unwrap();
        let second = store
            .upsert_intel_machine(machine_params("instance-1", org, "darwin"))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.metadata.get("operating_system").unwrap(), "darwin");

        // Same instance in another organization is a different machine.
        let other = store
            .upsert_intel_machine(machine_params("instance-1", Uuid::new_v4(), "linux"))
            .await
            .unwrap();
        assert_ne!(first.id, other.id);
    }

    #[tokio::test]
    async fn cohort_name_conflict_is_distinguishable() {
        let store = MemStore::new();
        let org = Uuid::new_v4();
        let params = UpsertIntelCohortParams {
            organization_id: org,
            created_by: Uuid::new_v4(),
            name: "backend".to_string(),
            icon: String::new(),
            description: String::new(),
            tracked_executables: vec!["go".to_string()],
            metadata_match: HashMap::new(),
        };
        store.upsert_intel_cohort(params.clone()).await.unwrap();
        let err = store.upsert_intel_cohort(params.clone()).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));

        // Same name in another organization is fine.
        let mut other = params;
        other.organization_id = Uuid::new_v4();
        store.upsert_intel_cohort(other).await.unwrap();
    }

    #[tokio::test]
    async fn machines_filter_by_metadata_regex() {
        let store = MemStore::new();
        let org = Uuid::new_v4();
        store
            .upsert_intel_machine(machine_params("a", org, "linux"))
            .await
            .unwrap();
        store
            .upsert_intel_machine(machine_params("b", org, "windows"))
            .await
            .unwrap();

        let (page, count) = store
            .get_intel_machines_matching_filters(GetIntelMachinesParams {
                organization_id: org,
                metadata_match: HashMap::from([(
                    "operating_system".to_string(),
                    "windows".to_string(),
                )]),
                limit: 0,
                offset: 0,
            })
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(page[0].metadata.get("operating_system").unwrap(), "windows");
    }

    #[tokio::test]
    async fn summaries_fold_and_filter() {
        let store = MemStore::new();
        let org = Uuid::new_v4();
        let linux = store
            .upsert_intel_machine(machine_params("a", org, "linux"))
            .await
            .unwrap();
        let windows = store
            .upsert_intel_machine(machine_params("b", org, "windows"))
            .await
            .unwrap();
        store
            .insert_intel_invocations(invocation_batch(&linux, "go", 100))
            .await
            .unwrap();
        store
            .insert_intel_invocations(invocation_batch(&linux, "go", 300))
            .await
            .unwrap();
        store
            .insert_intel_invocations(invocation_batch(&windows, "go", 500))
            .await
            .unwrap();
        store.upsert_intel_invocation_summaries().await.unwrap();

        let all = store
            .get_intel_invocation_summaries(GetIntelInvocationSummariesParams {
                organization_id: org,
                starts_at: None,
                metadata_match: HashMap::new(),
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        let bucket = &all[0];
        assert_eq!(bucket.binary_name, "go");
        assert_eq!(bucket.total_invocations, 3);
        assert_eq!(bucket.unique_machines, 2);
        assert_eq!(bucket.median_duration_ms, 300.0);
        assert_eq!(*bucket.exit_codes.get(&0).unwrap(), 3);
        assert_eq!(
            *bucket
                .git_remote_urls
                .get("https://github.com/example/x")
                .unwrap(),
            3
        );
        assert_eq!(
            *bucket
                .machine_metadata
                .get("operating_system")
                .unwrap()
                .get("linux")
                .unwrap(),
            2
        );

        let filtered = store
            .get_intel_invocation_summaries(GetIntelInvocationSummariesParams {
                organization_id: org,
                starts_at: None,
                metadata_match: HashMap::from([(
                    "operating_system".to_string(),
                    "^linux$".to_string(),
                )]),
            })
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].total_invocations, 2);
        assert_eq!(filtered[0].unique_machines, 1);
        assert_eq!(filtered[0].median_duration_ms, 200.0);
    }

    #[tokio::test]
    async fn refresh_is_incremental() {
        let store = MemStore::new();
        let org = Uuid::new_v4();
        let machine = store
            .upsert_intel_machine(machine_params("a", org, "linux"))
            .await
            .unwrap();
        store
            .insert_intel_invocations(invocation_batch(&machine, "go", 100))
            .await
            .unwrap();
        store.upsert_intel_invocation_summaries().await.unwrap();
        // A second refresh with no new invocations must not double-count.
        store.upsert_intel_invocation_summaries().await.unwrap();

        let all = store
            .get_intel_invocation_summaries(GetIntelInvocationSummariesParams {
                organization_id: org,
                starts_at: None,
                metadata_match: HashMap::new(),
            })
            .await
            .unwrap();
        assert_eq!(all[0].total_invocations, 1);
    }

    #[tokio::test]
    async fn cohort_matching_by_machine_id() {
        let store = MemStore::new();
        let org = Uuid::new_v4();
        let machine = store
            .upsert_intel_machine(machine_params("a", org, "linux"))
            .await
            .unwrap();
        store
            .upsert_intel_cohort(UpsertIntelCohortParams {
                organization_id: org,
                created_by: Uuid::new_v4(),
                name: "linux-only".to_string(),
                icon: String::new(),
                description: String::new(),
                tracked_executables: vec!["go".to_string()],
                metadata_match: HashMap::from([(
                    "operating_system".to_string(),
                    "^linux$".to_string(),
                )]),
            })
            .await
            .unwrap();
        store
            .upsert_intel_cohort(UpsertIntelCohortParams {
                organization_id: org,
                created_by: Uuid::new_v4(),
                name: "arm-only".to_string(),
                icon: String::new(),
                description: String::new(),
                tracked_executables: vec!["node".to_string()],
                metadata_match: HashMap::from([(
                    "architecture".to_string(),
                    "^arm.*".to_string(),
                )]),
            })
            .await
            .unwrap();

        let matches = store
            .get_intel_cohorts_matched_by_machine_ids(&[machine.id])
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].cohort.name, "linux-only");
    }
}
