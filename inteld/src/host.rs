//! Host identity and metadata gathered at connect time.

use intel_common::api::metadata_keys;
use std::collections::HashMap;
use sysinfo::System;
use uuid::Uuid;

/// Metadata reported with every connection. Cohort filters match on these
/// keys plus anything the operator supplies.
pub fn gather_metadata(extra: &HashMap<String, String>) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    metadata.insert(
        metadata_keys::OPERATING_SYSTEM.to_string(),
        std::env::consts::OS.to_string(),
    );
    metadata.insert(
        metadata_keys::ARCHITECTURE.to_string(),
        std::env::consts::ARCH.to_string(),
    );
    if let Some(version) = System::os_version() {
        metadata.insert(metadata_keys::OPERATING_SYSTEM_VERSION.to_string(), version);
    }
    metadata.insert(
        metadata_keys::OPERATING_SYSTEM_PLATFORM.to_string(),
        System::distribution_id(),
    );
    if let Some(hostname) = System::host_name() {
        metadata.insert(metadata_keys::HOSTNAME.to_string(), hostname);
    }
    metadata.insert(
        metadata_keys::CPU_CORES.to_string(),
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .to_string(),
    );
    let mut sys = System::new();
    sys.refresh_memory();
    metadata.insert(
        metadata_keys::MEMORY_MB_TOTAL.to_string(),
        (sys.total_memory() / 1024 / 1024).to_string(),
    );
    for (key, value) in extra {
        metadata.insert(key.clone(), value.clone());
    }
    metadata
}

/// Stable per-machine identifier: the OS unique id where available, then
/// the hostname, then a random UUID as a last resort.
pub fn default_instance_id() -> String {
    #[cfg(unix)]
    if let Ok(machine_id) = std::fs::read_to_string("/etc/machine-id") {
        let machine_id = machine_id.trim();
        if !machine_id.is_empty() {
            return machine_id.to_string();
        }
    }
    if let Some(hostname) = System::host_name() {
        return hostname;
    }
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_has_required_keys() {
        let metadata = gather_metadata(&HashMap::new());
        for key in [
            metadata_keys::OPERATING_SYSTEM,
            metadata_keys::ARCHITECTURE,
            metadata_keys::CPU_CORES,
            metadata_keys::MEMORY_MB_TOTAL,
        ] {
            assert!(metadata.contains_key(key), "missing {key}");
        }
    }

    #[test]
    fn extra_metadata_overrides_defaults() {
        let extra = HashMap::from([(
            metadata_keys::OPERATING_SYSTEM.to_string(),
            "museum-piece".to_string(),
        )]);
        let metadata = gather_metadata(&extra);
        assert_eq!(
            metadata.get(metadata_keys::OPERATING_SYSTEM).unwrap(),
            "museum-piece"
        );
    }

    #[test]
    fn instance_id_is_nonempty_and_stable() {
        let a = default_instance_id();
        let b = default_instance_id();
        assert!(!a.is_empty());
        // Only the random-UUID fallback is unstable, and that fires only
        // when the host has neither a machine id nor a hostname.
        if a != b {
            assert!(Uuid::parse_str(&a).is_ok());
        }
    }
}
