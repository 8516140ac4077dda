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

//! DNSChaos is declared with a wire-stable spec but is not wired to an
//! injector; the scheduled injector set covers pod, network, time, io,
//! kernel and stress kinds.

use crate::nanochaos::chaos::object::{ChaosObject, ChaosSpec, SchedulerSpec};
use crate::nanochaos::chaos::selector::{PodMode, SelectorSpec};
use crate::nanochaos::chaos::KIND_DNS_CHAOS;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DnsChaosAction {
    /// Resolve matching names to an error.
    #[serde(rename = "error")]
    Error,
    /// Resolve matching names to a random address.
    #[serde(rename = "random")]
    Random,
}

impl Default for DnsChaosAction {
    fn default() -> Self {
        DnsChaosAction::Error
    }
}

impl DnsChaosAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DnsChaosAction::Error => "error",
            DnsChaosAction::Random => "random",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DnsChaosSpec {
    pub action: DnsChaosAction,
    #[serde(default)]
    pub mode: PodMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default)]
    pub selector: SelectorSpec,
    /// Glob patterns of the domain names affected; empty matches all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patterns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<SchedulerSpec>,
}

impl ChaosSpec for DnsChaosSpec {
    const KIND: &'static str = KIND_DNS_CHAOS;

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

pub type DnsChaos = ChaosObject<DnsChaosSpec>;
