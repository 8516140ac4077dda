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
use crate::nanochaos::chaos::KIND_NETWORK_CHAOS;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkChaosAction {
    #[serde(rename = "netem")]
    Netem,
    #[serde(rename = "delay")]
    Delay,
    #[serde(rename = "loss")]
    Loss,
    #[serde(rename = "duplicate")]
    Duplicate,
    #[serde(rename = "corrupt")]
    Corrupt,
    #[serde(rename = "bandwidth")]
    Bandwidth,
    #[serde(rename = "partition")]
    Partition,
}

impl NetworkChaosAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkChaosAction::Netem => "netem",
            NetworkChaosAction::Delay => "delay",
            NetworkChaosAction::Loss => "loss",
            NetworkChaosAction::Duplicate => "duplicate",
            NetworkChaosAction::Corrupt => "corrupt",
            NetworkChaosAction::Bandwidth => "bandwidth",
            NetworkChaosAction::Partition => "partition",
        }
    }

    /// True for the actions materialized as a netem qdisc.
    pub fn is_netem(&self) -> bool {
        matches!(
            self,
            NetworkChaosAction::Netem
                | NetworkChaosAction::Delay
                | NetworkChaosAction::Loss
                | NetworkChaosAction::Duplicate
                | NetworkChaosAction::Corrupt
        )
    }
}

/// Which side of the connection the fault applies to, relative to the
/// selected (source) pods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "to")]
    To,
    #[serde(rename = "from")]
    From,
    #[serde(rename = "both")]
    Both,
}

impl Default for Direction {
    fn default() -> Self {
        Direction::To
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DelaySpec {
    /// Base latency, a duration string (`200ms`).
    pub latency: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub correlation: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub jitter: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reorder: Option<ReorderSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReorderSpec {
    /// Percentage of packets sent immediately (the rest are delayed).
    pub reorder: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub correlation: String,
    #[serde(default)]
    pub gap: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LossSpec {
    pub loss: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub correlation: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DuplicateSpec {
    pub duplicate: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub correlation: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CorruptSpec {
    pub corrupt: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub correlation: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BandwidthSpec {
    /// Rate string such as `1mbps`.
    pub rate: String,
    /// Queue limit in bytes.
    #[serde(default)]
    pub limit: u32,
    /// Burst bucket size in bytes.
    #[serde(default)]
    pub buffer: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peakrate: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minburst: Option<u32>,
}

/// The emulation primitives a single source may combine; they merge
/// additively into one netem qdisc.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TcParameter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<DelaySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss: Option<LossSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate: Option<DuplicateSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrupt: Option<CorruptSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<BandwidthSpec>,
}

impl TcParameter {
    pub fn has_netem(&self) -> bool {
        self.delay.is_some()
            || self.loss.is_some()
            || self.duplicate.is_some()
            || self.corrupt.is_some()
    }
}

/// A nested selector+mode describing the other side of the fault.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NetworkTarget {
    #[serde(default)]
    pub selector: SelectorSpec,
    #[serde(default)]
    pub mode: PodMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NetworkChaosSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<NetworkChaosAction>,
    #[serde(default)]
    pub mode: PodMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default)]
    pub selector: SelectorSpec,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Box<NetworkTarget>>,
    /// Literal CIDRs, IPs or hostnames resolved once at the controller and
    /// added to the target ipset.
    #[serde(
        rename = "externalTargets",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub external_targets: Vec<String>,
    #[serde(flatten)]
    pub tc_parameter: TcParameter,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<SchedulerSpec>,
}

impl ChaosSpec for NetworkChaosSpec {
    const KIND: &'static str = KIND_NETWORK_CHAOS;

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
        self.action
            .map(|action| action.as_str().to_string())
            .unwrap_or_default()
    }
}

pub type NetworkChaos = ChaosObject<NetworkChaosSpec>;
