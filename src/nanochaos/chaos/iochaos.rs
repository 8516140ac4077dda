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
use crate::nanochaos::chaos::KIND_IO_CHAOS;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoChaosAction {
    /// Sleep before the filesystem call proceeds.
    #[serde(rename = "delay")]
    Delay,
    /// Fail the call with the configured errno.
    #[serde(rename = "errno")]
    Errno,
    /// Both: sleep, then fail.
    #[serde(rename = "mixed")]
    Mixed,
}

impl Default for IoChaosAction {
    fn default() -> Self {
        IoChaosAction::Delay
    }
}

impl IoChaosAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            IoChaosAction::Delay => "delay",
            IoChaosAction::Errno => "errno",
            IoChaosAction::Mixed => "mixed",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IoChaosSpec {
    pub action: IoChaosAction,
    #[serde(default)]
    pub mode: PodMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default)]
    pub selector: SelectorSpec,
    /// Mount path of the chaos-managed volume inside the container.
    #[serde(rename = "volumePath")]
    pub volume_path: String,
    /// Path filter regex relative to the volume; empty matches everything.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    /// Filesystem methods to intercept (`read`, `write`, `open`, ...).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
    /// Probability of injecting per matching call, 0..=100.
    #[serde(default = "default_percent")]
    pub percent: u32,
    /// Injected latency for delay/mixed, a duration string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<String>,
    /// Errno number for errno/mixed (`2` for ENOENT).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errno: Option<String>,
    /// Attribute overrides applied to stat results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attr: Option<HashMap<String, serde_json::Value>>,
    #[serde(
        rename = "containerName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub container_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<SchedulerSpec>,
}

fn default_percent() -> u32 {
    100
}

impl ChaosSpec for IoChaosSpec {
    const KIND: &'static str = KIND_IO_CHAOS;

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

pub type IoChaos = ChaosObject<IoChaosSpec>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_defaults_to_one_hundred() {
        let raw = r#"{
            "action": "delay",
            "mode": "one",
            "selector": {},
            "volumePath": "/var/run/data",
            "delay": "1s"
        }"#;
        let spec: IoChaosSpec = serde_json::from_str(raw).expect("deserialize");
        assert_eq!(spec.percent, 100);
        assert_eq!(spec.volume_path, "/var/run/data");
        assert_eq!(spec.action_name(), "delay");
    }
}
