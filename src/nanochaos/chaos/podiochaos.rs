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

//! PodIoChaos aggregates the filesystem fault actions of every IoChaos
//! resource targeting one pod, using the same source-tagged merge as
//! PodNetworkChaos. The daemon forwards the JSON-serialized action list to
//! the chaosfs sidecar, which installs it atomically.

use crate::nanochaos::chaos::iochaos::IoChaosAction as IoChaosActionType;
use crate::nanochaos::k8s::pod::ObjectMeta;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const POD_IO_CHAOS_KIND: &str = "PodIoChaos";

/// Path/method/probability filter deciding which filesystem calls a fault
/// applies to.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IoFilter {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
    #[serde(default)]
    pub percent: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IoFault {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errno: Option<String>,
    #[serde(default)]
    pub weight: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IoChaosAction {
    #[serde(rename = "type")]
    pub action_type: IoChaosActionType,
    pub filter: IoFilter,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub faults: Vec<IoFault>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<String>,
    #[serde(rename = "attr", default, skip_serializing_if = "Option::is_none")]
    pub attr_override: Option<HashMap<String, serde_json::Value>>,
    pub source: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PodIoChaosSpec {
    /// Mount path of the volume the sidecar interposes on.
    #[serde(rename = "volumeMountPath", default)]
    pub volume_mount_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<IoChaosAction>,
    /// Sidecar instance (its pid) reported back by the daemon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i64>,
    #[serde(rename = "startTime", default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
}

impl PodIoChaosSpec {
    pub fn remove_source(&mut self, source: &str) {
        self.actions.retain(|action| action.source != source);
    }

    pub fn sources(&self) -> Vec<String> {
        let mut sources: Vec<String> = self
            .actions
            .iter()
            .map(|action| action.source.clone())
            .collect();
        sources.sort();
        sources.dedup();
        sources
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PodIoChaos {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodIoChaosSpec,
}

impl PodIoChaos {
    pub fn new(metadata: ObjectMeta) -> Self {
        Self {
            api_version: super::object::API_VERSION.to_string(),
            kind: POD_IO_CHAOS_KIND.to_string(),
            metadata,
            spec: PodIoChaosSpec::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_merge_semantics() {
        let mut spec = PodIoChaosSpec {
            volume_mount_path: "/var/run/data".to_string(),
            actions: vec![
                IoChaosAction {
                    action_type: IoChaosActionType::Delay,
                    filter: IoFilter {
                        path: ".*".to_string(),
                        methods: vec!["write".to_string()],
                        percent: 100,
                    },
                    faults: vec![],
                    latency: Some("1s".to_string()),
                    attr_override: None,
                    source: "default/io-a".to_string(),
                },
                IoChaosAction {
                    action_type: IoChaosActionType::Errno,
                    filter: IoFilter::default(),
                    faults: vec![IoFault {
                        errno: Some("2".to_string()),
                        weight: 1,
                    }],
                    latency: None,
                    attr_override: None,
                    source: "default/io-b".to_string(),
                },
            ],
            ..Default::default()
        };

        assert_eq!(spec.sources(), vec!["default/io-a", "default/io-b"]);
        spec.remove_source("default/io-a");
        assert_eq!(spec.actions.len(), 1);
        assert_eq!(spec.sources(), vec!["default/io-b"]);
    }
}
