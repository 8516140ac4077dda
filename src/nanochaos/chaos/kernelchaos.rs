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
use crate::nanochaos::chaos::KIND_KERNEL_CHAOS;

use serde::{Deserialize, Serialize};

/// Which kernel allocation path gets its return value overridden.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FailType {
    Slab,
    Page,
    Bio,
}

impl Default for FailType {
    fn default() -> Self {
        FailType::Slab
    }
}

/// A frame predicate restricting the callchain the fault applies to.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    pub funcname: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parameters: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub predicate: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FailKernRequest {
    #[serde(rename = "failtype", default)]
    pub fail_type: FailType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub callchain: Vec<Frame>,
    /// Fault probability in percent, 0..=100.
    #[serde(default)]
    pub probability: u32,
    /// Number of times the fault may fire; 0 means unlimited.
    #[serde(default)]
    pub times: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct KernelChaosSpec {
    #[serde(default)]
    pub mode: PodMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default)]
    pub selector: SelectorSpec,
    #[serde(rename = "failKernRequest")]
    pub fail_kern_request: FailKernRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<SchedulerSpec>,
}

impl ChaosSpec for KernelChaosSpec {
    const KIND: &'static str = KIND_KERNEL_CHAOS;

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
}

pub type KernelChaos = ChaosObject<KernelChaosSpec>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fail_request_deserializes_callchain() {
        let raw = r#"{
            "mode": "one",
            "selector": {},
            "failKernRequest": {
                "failtype": "SLAB",
                "headers": ["linux/mm.h"],
                "callchain": [{"funcname": "__x64_sys_mount"}],
                "probability": 50,
                "times": 3
            }
        }"#;
        let spec: KernelChaosSpec = serde_json::from_str(raw).expect("deserialize");
        assert_eq!(spec.fail_kern_request.fail_type, FailType::Slab);
        assert_eq!(spec.fail_kern_request.callchain[0].funcname, "__x64_sys_mount");
        assert_eq!(spec.fail_kern_request.probability, 50);
    }
}
