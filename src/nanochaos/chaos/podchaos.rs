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

use crate::nanochaos::chaos::object::{ChaosObject, ChaosSpec, SchedulerSpec};
use crate::nanochaos::chaos::selector::{PodMode, SelectorSpec};
use crate::nanochaos::chaos::KIND_POD_CHAOS;

use serde::{Deserialize, Serialize};

/// Image every container is rewritten to during pod-failure. It exits
/// immediately, which keeps the pod object alive but non-functional.
pub const PAUSE_IMAGE: &str = "gcr.io/google-containers/pause:latest";

/// Annotation prefix stashing the original image per container during
/// pod-failure (audit trail, not used for in-place restore).
pub const PODFAILURE_IMAGE_ANNOTATION_PREFIX: &str = "chaos-mesh.org/podfailure-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodChaosAction {
    #[serde(rename = "pod-kill")]
    PodKill,
    #[serde(rename = "pod-failure")]
    PodFailure,
    #[serde(rename = "container-kill")]
    ContainerKill,
}

impl Default for PodChaosAction {
    fn default() -> Self {
        PodChaosAction::PodKill
    }
}

impl PodChaosAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PodChaosAction::PodKill => "pod-kill",
            PodChaosAction::PodFailure => "pod-failure",
            PodChaosAction::ContainerKill => "container-kill",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PodChaosSpec {
    pub action: PodChaosAction,
    #[serde(default)]
    pub mode: PodMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default)]
    pub selector: SelectorSpec,
    /// Required for container-kill: the named container to kill.
    #[serde(rename = "containerName", default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<SchedulerSpec>,
}

impl ChaosSpec for PodChaosSpec {
    const KIND: &'static str = KIND_POD_CHAOS;

    fn selector(&self) -> &SelectorSpec {
        &self.selector
    }

    fn mode(&self) -> PodMode {
        self.mode
    }

    fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    fn duration_text(&self) -> Option<&str> {
        self.duration.as_deref()
    }

    fn scheduler(&self) -> Option<&SchedulerSpec> {
        self.scheduler.as_ref()
    }

    fn action_name(&self) -> String {
        self.action.as_str().to_string()
    }
}

pub type PodChaos = ChaosObject<PodChaosSpec>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_use_wire_names() {
        let raw = r#"{
            "action": "container-kill",
            "mode": "one",
            "containerName": "app",
            "selector": {"namespaces": ["default"]}
        }"#;
        let spec: PodChaosSpec = serde_json::from_str(raw).expect("deserialize");
        assert_eq!(spec.action, PodChaosAction::ContainerKill);
        assert_eq!(spec.container_name.as_deref(), Some("app"));
        assert_eq!(spec.action_name(), "container-kill");
    }
}
