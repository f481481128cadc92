//! Report assembly over summary buckets.

use crate::store::{GetIntelInvocationSummariesParams, Store, StoreError};
use chrono::{DateTime, Utc};
use intel_common::api::IntelReport;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// An external git auth provider, matched against remote URLs by regex.
/// Configuration order is significant: first match wins.
#[derive(Debug, Clone)]
pub struct GitAuthProvider {
    pub id: String,
    pub pattern: Regex,
}

impl GitAuthProvider {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let (id, pattern) = raw
            .split_once('=')
            .ok_or_else(|| format!("expected <id>=<regex>, got {raw:?}"))?;
        Ok(Self {
            id: id.to_string(),
            pattern: Regex::new(pattern).map_err(|err| err.to_string())?,
        })
    }
}

/// Assemble the invocation report for an organization.
pub async fn build(
    store: &Arc<dyn Store>,
    organization_id: Uuid,
    starts_at: Option<DateTime<Utc>>,
    metadata_match: HashMap<String, String>,
    providers: &[GitAuthProvider],
) -> Result<IntelReport, StoreError> {
    let intervals = store
        .get_intel_invocation_summaries(GetIntelInvocationSummariesParams {
            organization_id,
            starts_at,
            metadata_match,
        })
        .await?;

    let mut git_auth_providers: HashMap<String, Option<String>> = HashMap::new();
    let mut invocations = 0i64;
    for interval in &intervals {
        invocations += interval.total_invocations;
        for url in interval.git_remote_urls.keys() {
            git_auth_providers
                .entry(url.clone())
                .or_insert_with(|| resolve_provider(providers, url));
        }
    }

    Ok(IntelReport {
        invocations,
        git_auth_providers,
        intervals,
    })
}

fn resolve_provider(providers: &[GitAuthProvider], url: &str) -> Option<String> {
    providers
        .iter()
        .find(|provider| provider.pattern.is_match(url))
        .map(|provider| provider.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mem::MemStore;
    use crate::store::{InsertIntelInvocationsParams, UpsertIntelMachineParams};

    fn providers() -> Vec<GitAuthProvider> {
        vec![
            GitAuthProvider::parse("github=github\\.com").unwrap(),
            GitAuthProvider::parse("github-backup=github").unwrap(),
            GitAuthProvider::parse("gitlab=gitlab\\.com").unwrap(),
        ]
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!(GitAuthProvider::parse("no-equals").is_err());
        assert!(GitAuthProvider::parse("id=(bad").is_err());
    }

    #[test]
    fn first_configured_match_wins() {
        let providers = providers();
        assert_eq!(
            resolve_provider(&providers, "https://github.com/example/x"),
            Some("github".to_string())
        );
        assert_eq!(
            resolve_provider(&providers, "https://gitlab.com/example/x"),
            Some("gitlab".to_string())
        );
        assert_eq!(
            resolve_provider(&providers, "https://bitbucket.org/example/x"),
            None
        );
    }

    #[tokio::test]
    async fn report_totals_and_provider_map() {
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let org = Uuid::new_v4();
        let machine = store
            .upsert_intel_machine(UpsertIntelMachineParams {
                instance_id: "i".into(),
                organization_id: org,
                user_id: Uuid::new_v4(),
                ip_address: String::new(),
                daemon_version: String::new(),
                metadata: HashMap::new(),
            })
            .await
            .unwrap();
        store
            .insert_intel_invocations(InsertIntelInvocationsParams {
                ids: vec![Uuid::new_v4(), Uuid::new_v4()],
                created_at: Utc::now(),
                machine_id: machine.id,
                user_id: machine.user_id,
                binary_name: vec!["go".into(), "go".into()],
                binary_hash: vec!["h".into(), "h".into()],
                binary_path: vec!["/usr/bin/go".into(), "/usr/bin/go".into()],
                binary_args: vec![vec!["build".into()], vec!["build".into()]],
                binary_version: vec![String::new(), String::new()],
                working_directory: vec!["/w".into(), "/w".into()],
                git_remote_url: vec![
                    "https://github.com/example/x".into(),
                    "https://bitbucket.org/example/y".into(),
                ],
                exit_code: vec![0, 1],
                duration_ms: vec![10, 20],
            })
            .await
            .unwrap();
        store.upsert_intel_invocation_summaries().await.unwrap();

        let report = build(&store, org, None, HashMap::new(), &providers())
            .await
            .unwrap();
        assert_eq!(report.invocations, 2);
        assert_eq!(report.intervals.len(), 1);
        assert_eq!(
            report.git_auth_providers.get("https://github.com/example/x"),
            Some(&Some("github".to_string()))
        );
        assert_eq!(
            report
                .git_auth_providers
                .get("https://bitbucket.org/example/y"),
            Some(&None)
        );
    }
}
