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

//! PodNetworkChaos is the per-pod aggregate of every concurrent
//! network-chaos intent targeting that pod. Each record carries the
//! originating chaos resource's `<ns>/<name>` in `source`, the merge key:
//! a committing source first drops every record it owns, then appends its
//! fresh intents, leaving other sources' records untouched.

use crate::nanochaos::chaos::networkchaos::TcParameter;
use crate::nanochaos::k8s::pod::ObjectMeta;

use serde::{Deserialize, Serialize};

pub const POD_NETWORK_CHAOS_KIND: &str = "PodNetworkChaos";

/// A named hash:net ipset and its member CIDRs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RawIpset {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cidrs: Vec<String>,
    pub source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainDirection {
    #[serde(rename = "INPUT")]
    Input,
    #[serde(rename = "OUTPUT")]
    Output,
}

impl ChainDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainDirection::Input => "INPUT",
            ChainDirection::Output => "OUTPUT",
        }
    }
}

/// A packet-filter child chain dropping traffic matching its ipsets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawIptables {
    pub name: String,
    pub direction: ChainDirection,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ipsets: Vec<String>,
    pub source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TcType {
    Netem,
    Bandwidth,
}

/// One traffic-control intent; with an ipset it becomes a classifier-fed
/// band of the PRIO qdisc, without one it joins the global qdisc tower.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawTrafficControl {
    #[serde(rename = "type")]
    pub tc_type: TcType,
    #[serde(flatten)]
    pub parameter: TcParameter,
    #[serde(rename = "ipset", default, skip_serializing_if = "Option::is_none")]
    pub ipset_name: Option<String>,
    pub source: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PodNetworkChaosSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ipsets: Vec<RawIpset>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub iptables: Vec<RawIptables>,
    #[serde(rename = "tcs", default, skip_serializing_if = "Vec::is_empty")]
    pub traffic_controls: Vec<RawTrafficControl>,
}

impl PodNetworkChaosSpec {
    pub fn is_empty(&self) -> bool {
        self.ipsets.is_empty() && self.iptables.is_empty() && self.traffic_controls.is_empty()
    }

    /// Drops every record owned by `source`; the first half of a commit.
    pub fn remove_source(&mut self, source: &str) {
        self.ipsets.retain(|ipset| ipset.source != source);
        self.iptables.retain(|chain| chain.source != source);
        self.traffic_controls.retain(|tc| tc.source != source);
    }

    /// The distinct sources currently contributing records.
    pub fn sources(&self) -> Vec<String> {
        let mut sources: Vec<String> = self
            .ipsets
            .iter()
            .map(|ipset| ipset.source.clone())
            .chain(self.iptables.iter().map(|chain| chain.source.clone()))
            .chain(self.traffic_controls.iter().map(|tc| tc.source.clone()))
            .collect();
        sources.sort();
        sources.dedup();
        sources
    }
}

/// The aggregate resource, owned by its pod via owner reference so it is
/// garbage-collected with the pod (and never forms a cycle with chaos
/// resources, which reference pods only logically through selectors).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PodNetworkChaos {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodNetworkChaosSpec,
}

impl PodNetworkChaos {
    pub fn new(metadata: ObjectMeta) -> Self {
        Self {
            api_version: super::object::API_VERSION.to_string(),
            kind: POD_NETWORK_CHAOS_KIND.to_string(),
            metadata,
            spec: PodNetworkChaosSpec::default(),
        }
    }
}
