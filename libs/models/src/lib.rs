//! # loft-models
//!
//! Shared data model for the loft platform.
//!
//! The central type is [`DesiredWorkload`]: a declarative record describing a
//! long-running workload that should run somewhere in the cluster. Desired
//! workloads are produced by the upstream placement authority and consumed by
//! cell agents; agents only ever read them. A record is immutable once
//! emitted — a change to the same guid arrives as a new event.

use serde::{Deserialize, Serialize};

/// A long-running workload desired somewhere in the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredWorkload {
    /// Workload identity, unique cluster-wide.
    pub guid: String,

    /// Capability class required to run this workload. A cell only runs
    /// workloads whose stack matches its own.
    pub stack: String,

    /// Required memory in megabytes.
    pub memory_mb: u64,

    /// Required disk in megabytes.
    pub disk_mb: u64,

    /// Ordered action sequence the execution backend runs for this workload.
    #[serde(default)]
    pub actions: Vec<WorkloadAction>,

    /// Log routing metadata.
    pub log: LogConfig,
}

/// One step of a workload's action sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WorkloadAction {
    /// Fetch an artifact into the container filesystem.
    Download {
        from: String,
        to: String,
        extract: bool,
        cache_key: String,
    },

    /// Run a script with environment and resource limits.
    RunScript {
        script: String,
        #[serde(default)]
        env: Vec<EnvironmentVariable>,
        #[serde(default)]
        timeout_secs: Option<u64>,
        #[serde(default)]
        resource_limits: ResourceLimits,
    },
}

/// A key/value pair injected into a script's environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentVariable {
    pub key: String,
    pub value: String,
}

/// Kernel resource limits applied to a running script.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Open file descriptor limit.
    #[serde(default)]
    pub nofile: Option<u64>,
}

/// Log routing metadata for a workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Guid log lines are attributed to (typically the application guid).
    pub guid: String,

    /// Source tag attached to emitted log lines.
    pub source_name: String,

    /// Instance index for multi-instance workloads.
    #[serde(default)]
    pub index: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_workload() -> DesiredWorkload {
        DesiredWorkload {
            guid: "app-guid-app-version".to_string(),
            stack: "lucid64".to_string(),
            memory_mb: 128,
            disk_mb: 1024,
            actions: vec![
                WorkloadAction::Download {
                    from: "http://droplet.url".to_string(),
                    to: "/app".to_string(),
                    extract: true,
                    cache_key: "droplet-app-guid-app-version".to_string(),
                },
                WorkloadAction::RunScript {
                    script: "./start".to_string(),
                    env: vec![EnvironmentVariable {
                        key: "PORT".to_string(),
                        value: "8080".to_string(),
                    }],
                    timeout_secs: Some(1),
                    resource_limits: ResourceLimits { nofile: Some(16) },
                },
            ],
            log: LogConfig {
                guid: "app-guid".to_string(),
                source_name: "APP".to_string(),
                index: Some(0),
            },
        }
    }

    #[test]
    fn workload_round_trips_through_json() {
        let workload = sample_workload();
        let json = serde_json::to_string(&workload).unwrap();
        let parsed: DesiredWorkload = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, workload);
    }

    #[test]
    fn actions_are_tagged_snake_case() {
        let workload = sample_workload();
        let json = serde_json::to_string(&workload).unwrap();
        assert!(json.contains("\"action\":\"download\""));
        assert!(json.contains("\"action\":\"run_script\""));
        assert!(json.contains("\"cache_key\":\"droplet-app-guid-app-version\""));
    }

    #[test]
    fn optional_fields_default_on_deserialize() {
        let json = r#"{
            "guid": "g",
            "stack": "lucid64",
            "memory_mb": 64,
            "disk_mb": 256,
            "log": {"guid": "g", "source_name": "APP"}
        }"#;

        let workload: DesiredWorkload = serde_json::from_str(json).unwrap();
        assert!(workload.actions.is_empty());
        assert_eq!(workload.log.index, None);
    }

    #[test]
    fn run_script_defaults() {
        let json = r#"{"action": "run_script", "script": "the-script"}"#;
        let action: WorkloadAction = serde_json::from_str(json).unwrap();
        match action {
            WorkloadAction::RunScript {
                script,
                env,
                timeout_secs,
                resource_limits,
            } => {
                assert_eq!(script, "the-script");
                assert!(env.is_empty());
                assert_eq!(timeout_secs, None);
                assert_eq!(resource_limits.nofile, None);
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }
}
