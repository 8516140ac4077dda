/*
 * Copyright (C) 2024 The Nanochaos Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Status collector: observes chaos resource transitions and maintains the
//! Event and Archive records the external dashboard store consumes.
//! Running creates an event keyed by (namespace, experiment, startTime);
//! Finished/Paused closes it; deletion archives the final document.

use crate::nanochaos::chaos::status::{ExperimentPhase, PodRecord};
use crate::nanochaos::k8s::pod::ObjectMeta;
use crate::nanochaos::logger::{log_info, log_warn};
use crate::nanochaos::util::error::with_context;
use crate::nanochaos::util::{is_missing_value_error, Keyspace, KeyspaceEvent};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::error::Error;

type DynError = Box<dyn Error + Send + Sync>;

const COLLECTOR_KEYSPACE: Keyspace = Keyspace::new("collector");
const EVENT_PREFIX: &str = "/events";
const ARCHIVE_PREFIX: &str = "/archives";
const COMPONENT: &str = "collector";

/// One experiment run, from Apply to Recover.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExperimentEvent {
    pub experiment: String,
    pub namespace: String,
    pub kind: String,
    #[serde(rename = "startTime")]
    pub start_time: DateTime<Utc>,
    #[serde(rename = "finishTime", skip_serializing_if = "Option::is_none")]
    pub finish_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pods: Vec<PodRecord>,
}

/// The final document of a deleted experiment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArchivedExperiment {
    pub namespace: String,
    pub name: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub action: String,
    #[serde(rename = "startTime", skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(rename = "finishTime", skip_serializing_if = "Option::is_none")]
    pub finish_time: Option<DateTime<Utc>>,
    /// The serialized resource as it looked when deleted.
    pub experiment: String,
}

fn event_key(namespace: &str, experiment: &str, start_time: &DateTime<Utc>) -> String {
    format!(
        "{}/{}/{}/{}",
        EVENT_PREFIX,
        namespace,
        experiment,
        start_time.timestamp()
    )
}

fn archive_key(uid: &str) -> String {
    format!("{}/{}", ARCHIVE_PREFIX, uid)
}

/// Feeds one watch event from a chaos kind prefix into the collector. The
/// value is inspected generically; malformed documents are logged and
/// skipped rather than wedging the watcher.
pub fn observe(event: &KeyspaceEvent) {
    let raw = match &event.value {
        Some(raw) => raw,
        None => return,
    };

    if let Err(err) = observe_raw(raw) {
        log_warn(
            COMPONENT,
            "failed to collect chaos transition",
            &[("key", event.key.as_str()), ("error", &err.to_string())],
        );
    }
}

fn observe_raw(raw: &str) -> Result<(), DynError> {
    let document: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| with_context(e, "Failed to parse watched chaos document"))?;

    let kind = document
        .get("kind")
        .and_then(|kind| kind.as_str())
        .unwrap_or_default()
        .to_string();
    let metadata: ObjectMeta = serde_json::from_value(
        document.get("metadata").cloned().unwrap_or_default(),
    )
    .map_err(|e| with_context(e, "Failed to parse chaos metadata"))?;
    let namespace = metadata.namespace.clone().unwrap_or_else(|| "default".to_string());
    let name = metadata.name.clone().unwrap_or_default();

    let status = document.get("status").cloned().unwrap_or_default();
    let experiment = status.get("experiment").cloned().unwrap_or_default();
    let phase: ExperimentPhase =
        serde_json::from_value(experiment.get("phase").cloned().unwrap_or_default())
            .unwrap_or_default();
    let start_time: Option<DateTime<Utc>> =
        serde_json::from_value(experiment.get("startTime").cloned().unwrap_or_default())
            .unwrap_or_default();
    let end_time: Option<DateTime<Utc>> =
        serde_json::from_value(experiment.get("endTime").cloned().unwrap_or_default())
            .unwrap_or_default();
    let pods: Vec<PodRecord> =
        serde_json::from_value(experiment.get("podRecords").cloned().unwrap_or_default())
            .unwrap_or_default();
    let action = document
        .get("spec")
        .and_then(|spec| spec.get("action"))
        .and_then(|action| action.as_str())
        .unwrap_or_default()
        .to_string();

    if metadata.is_deleted() {
        archive(&metadata, &kind, &action, raw)?;
        return Ok(());
    }

    let start_time = match start_time {
        Some(start_time) => start_time,
        None => return Ok(()),
    };

    match phase {
        ExperimentPhase::Running => {
            record_running(&namespace, &name, &kind, start_time, pods)?;
        }
        ExperimentPhase::Finished | ExperimentPhase::Paused => {
            record_finished(&namespace, &name, &kind, start_time, end_time, pods)?;
        }
        _ => {}
    }

    Ok(())
}

fn record_running(
    namespace: &str,
    experiment: &str,
    kind: &str,
    start_time: DateTime<Utc>,
    pods: Vec<PodRecord>,
) -> Result<(), DynError> {
    let key = event_key(namespace, experiment, &start_time);
    let record = ExperimentEvent {
        experiment: experiment.to_string(),
        namespace: namespace.to_string(),
        kind: kind.to_string(),
        start_time,
        finish_time: None,
        pods,
    };
    let raw = serde_json::to_string(&record)
        .map_err(|e| with_context(e, "Failed to serialize experiment event"))?;
    COLLECTOR_KEYSPACE.put(&key, &raw)?;
    Ok(())
}

fn record_finished(
    namespace: &str,
    experiment: &str,
    kind: &str,
    start_time: DateTime<Utc>,
    finish_time: Option<DateTime<Utc>>,
    pods: Vec<PodRecord>,
) -> Result<(), DynError> {
    let key = event_key(namespace, experiment, &start_time);
    let mut record = match COLLECTOR_KEYSPACE.get(&key) {
        Ok(raw) => serde_json::from_str::<ExperimentEvent>(&raw)
            .map_err(|e| with_context(e, "Failed to parse stored experiment event"))?,
        Err(err) if is_missing_value_error(err.as_ref()) => ExperimentEvent {
            experiment: experiment.to_string(),
            namespace: namespace.to_string(),
            kind: kind.to_string(),
            start_time,
            finish_time: None,
            pods: pods.clone(),
        },
        Err(err) => return Err(err),
    };

    record.finish_time = finish_time.or_else(|| Some(Utc::now()));
    if record.pods.is_empty() {
        record.pods = pods;
    }
    let raw = serde_json::to_string(&record)
        .map_err(|e| with_context(e, "Failed to serialize experiment event"))?;
    COLLECTOR_KEYSPACE.put(&key, &raw)?;
    Ok(())
}

fn archive(
    metadata: &ObjectMeta,
    kind: &str,
    action: &str,
    raw_document: &str,
) -> Result<(), DynError> {
    let namespace = metadata.namespace.clone().unwrap_or_else(|| "default".to_string());
    let name = metadata.name.clone().unwrap_or_default();
    let uid = metadata
        .uid
        .clone()
        .unwrap_or_else(|| format!("{}.{}.{}", kind, namespace, name));

    let record = ArchivedExperiment {
        namespace: namespace.clone(),
        name: name.clone(),
        kind: kind.to_string(),
        action: action.to_string(),
        start_time: metadata.creation_timestamp,
        finish_time: metadata.deletion_timestamp,
        experiment: raw_document.to_string(),
    };
    let raw = serde_json::to_string(&record)
        .map_err(|e| with_context(e, "Failed to serialize archive"))?;
    COLLECTOR_KEYSPACE.put(&archive_key(&uid), &raw)?;
    log_info(
        COMPONENT,
        "archived experiment",
        &[("kind", kind), ("namespace", &namespace), ("name", &name)],
    );
    Ok(())
}

/// Lists events, optionally for one namespace.
pub fn list_events(namespace: Option<&str>) -> Result<Vec<ExperimentEvent>, DynError> {
    let prefix = match namespace {
        Some(ns) => format!("{}/{}", EVENT_PREFIX, ns),
        None => EVENT_PREFIX.to_string(),
    };
    let mut events = Vec::new();
    for (key, raw, _) in COLLECTOR_KEYSPACE.list(&prefix)? {
        let event: ExperimentEvent = serde_json::from_str(&raw)
            .map_err(|e| with_context(e, format!("Failed to parse event '{}'", key)))?;
        events.push(event);
    }
    Ok(events)
}

pub fn list_archives() -> Result<Vec<ArchivedExperiment>, DynError> {
    let mut archives = Vec::new();
    for (key, raw, _) in COLLECTOR_KEYSPACE.list(ARCHIVE_PREFIX)? {
        let archive: ArchivedExperiment = serde_json::from_str(&raw)
            .map_err(|e| with_context(e, format!("Failed to parse archive '{}'", key)))?;
        archives.push(archive);
    }
    Ok(archives)
}

/// Boot-time cleanup: events left open by a previous controller get a
/// finish time so the dashboard never shows phantom running experiments.
pub fn clean_incomplete_events() -> Result<usize, DynError> {
    let mut cleaned = 0;
    for (key, raw, _) in COLLECTOR_KEYSPACE.list(EVENT_PREFIX)? {
        let mut event: ExperimentEvent = match serde_json::from_str(&raw) {
            Ok(event) => event,
            Err(_) => continue,
        };
        if event.finish_time.is_some() {
            continue;
        }
        event.finish_time = Some(Utc::now());
        let updated = serde_json::to_string(&event)
            .map_err(|e| with_context(e, "Failed to serialize cleaned event"))?;
        COLLECTOR_KEYSPACE.put(&key, &updated)?;
        cleaned += 1;
    }
    Ok(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nanochaos::test_support::{keyspace_env, keyspace_lock};
    use crate::nanochaos::util::KeyspaceEventType;
    use serde_json::json;
    use serial_test::serial;

    fn watch_event(value: serde_json::Value) -> KeyspaceEvent {
        KeyspaceEvent {
            event_type: KeyspaceEventType::Modified,
            key: "/podchaos/default/kill-demo".to_string(),
            value: Some(value.to_string()),
            resource_version: 1,
        }
    }

    fn running_document(start: &str) -> serde_json::Value {
        json!({
            "apiVersion": "chaos-mesh.org/v1alpha1",
            "kind": "PodChaos",
            "metadata": {"name": "kill-demo", "namespace": "default", "uid": "uid-1"},
            "spec": {"action": "pod-kill", "mode": "one", "selector": {}},
            "status": {
                "experiment": {
                    "phase": "Running",
                    "startTime": start,
                    "podRecords": [
                        {"namespace": "default", "name": "web-0", "action": "pod-kill", "message": "delete pod"}
                    ]
                },
                "scheduler": {}
            }
        })
    }

    #[test]
    #[serial]
    fn running_then_finished_closes_the_event() {
        let _guard = keyspace_lock().lock();
        let _env = keyspace_env();

        let start = "2024-04-01T10:00:00Z";
        observe(&watch_event(running_document(start)));

        let events = list_events(Some("default")).expect("list");
        assert_eq!(events.len(), 1);
        assert!(events[0].finish_time.is_none());
        assert_eq!(events[0].pods[0].message, "delete pod");

        let mut finished = running_document(start);
        finished["status"]["experiment"]["phase"] = json!("Finished");
        finished["status"]["experiment"]["endTime"] = json!("2024-04-01T10:05:00Z");
        observe(&watch_event(finished));

        let events = list_events(Some("default")).expect("list");
        assert_eq!(events.len(), 1);
        assert!(events[0].finish_time.is_some());
    }

    #[test]
    #[serial]
    fn deletion_archives_the_document() {
        let _guard = keyspace_lock().lock();
        let _env = keyspace_env();

        let mut deleted = running_document("2024-04-01T10:00:00Z");
        deleted["metadata"]["deletionTimestamp"] = json!("2024-04-01T10:06:00Z");
        observe(&watch_event(deleted));

        let archives = list_archives().expect("list");
        assert_eq!(archives.len(), 1);
        assert_eq!(archives[0].kind, "PodChaos");
        assert_eq!(archives[0].action, "pod-kill");
        assert!(archives[0].finish_time.is_some());
        assert!(archives[0].experiment.contains("pod-kill"));
    }

    #[test]
    #[serial]
    fn boot_cleanup_closes_open_events() {
        let _guard = keyspace_lock().lock();
        let _env = keyspace_env();

        observe(&watch_event(running_document("2024-04-01T10:00:00Z")));
        let cleaned = clean_incomplete_events().expect("clean");
        assert_eq!(cleaned, 1);

        let events = list_events(None).expect("list");
        assert!(events[0].finish_time.is_some());

        // Idempotent on the second pass.
        assert_eq!(clean_incomplete_events().expect("clean"), 0);
    }
}
