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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Current status of a chaos experiment round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ExperimentPhase {
    #[default]
    Waiting,
    Running,
    Paused,
    Failed,
    Finished,
}

impl ExperimentPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentPhase::Waiting => "Waiting",
            ExperimentPhase::Running => "Running",
            ExperimentPhase::Paused => "Paused",
            ExperimentPhase::Failed => "Failed",
            ExperimentPhase::Finished => "Finished",
        }
    }
}

/// One entry per injected pod, surfaced on the resource status and copied
/// into collector events.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PodRecord {
    pub namespace: String,
    pub name: String,
    #[serde(rename = "hostIP", default, skip_serializing_if = "String::is_empty")]
    pub host_ip: String,
    #[serde(rename = "podIP", default, skip_serializing_if = "String::is_empty")]
    pub pod_ip: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub action: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExperimentStatus {
    #[serde(default)]
    pub phase: ExperimentPhase,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(rename = "startTime", skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(rename = "endTime", skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Cumulative duration of the current run, as a human string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(rename = "podRecords", default, skip_serializing_if = "Vec::is_empty")]
    pub pod_records: Vec<PodRecord>,
}

/// nextStart/nextRecover bookkeeping maintained by the two-phase
/// reconciler. `next_recover <= next_start` whenever both are set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SchedulerStatus {
    #[serde(rename = "nextStart", skip_serializing_if = "Option::is_none")]
    pub next_start: Option<DateTime<Utc>>,
    #[serde(rename = "nextRecover", skip_serializing_if = "Option::is_none")]
    pub next_recover: Option<DateTime<Utc>>,
}

/// One running fault instance on a target (stress-ng process uid and its
/// start time), keyed by `<namespace>/<name>` of the pod.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FaultInstance {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    #[serde(rename = "startTime", default)]
    pub start_time: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChaosStatus {
    #[serde(default)]
    pub experiment: ExperimentStatus,
    #[serde(default)]
    pub scheduler: SchedulerStatus,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub instances: HashMap<String, FaultInstance>,
}
