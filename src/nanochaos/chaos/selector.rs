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

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Declarative predicate over pods. An empty selector matches every pod
/// in scope.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SelectorSpec {
    /// Namespaces the targeted pods may belong to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,

    /// Node names the targeted pods must be scheduled to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<String>,

    /// Explicit candidates: namespace to set of pod names. When non-empty
    /// the candidate set is exactly these pods; other predicates still
    /// apply as filters.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub pods: HashMap<String, Vec<String>>,

    /// Label selector over nodes; pods must run on a matching node.
    #[serde(
        rename = "nodeSelectors",
        default,
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub node_selectors: HashMap<String, String>,

    /// Field selector over pods (`metadata.name`, `spec.nodeName`, ...).
    #[serde(
        rename = "fieldSelectors",
        default,
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub field_selectors: HashMap<String, String>,

    /// Label selector over pods. Values of the form `re:<pattern>` are
    /// treated as regular expressions.
    #[serde(
        rename = "labelSelectors",
        default,
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub label_selectors: HashMap<String, String>,

    /// Annotation selector over pods, same match forms as labels.
    #[serde(
        rename = "annotationSelectors",
        default,
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub annotation_selectors: HashMap<String, String>,

    /// Pod phases the targets must be in (Pending / Running / Succeeded /
    /// Failed / Unknown).
    #[serde(
        rename = "podPhaseSelectors",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub pod_phase_selectors: Vec<String>,
}

impl SelectorSpec {
    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
            && self.nodes.is_empty()
            && self.pods.is_empty()
            && self.node_selectors.is_empty()
            && self.field_selectors.is_empty()
            && self.label_selectors.is_empty()
            && self.annotation_selectors.is_empty()
            && self.pod_phase_selectors.is_empty()
    }
}

/// Sampling policy applied to the filtered candidate set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodMode {
    /// One pod selected uniformly at random.
    #[serde(rename = "one")]
    One,
    /// Every candidate, regardless of readiness.
    #[serde(rename = "all")]
    All,
    /// A fixed number of pods (`value` = N).
    #[serde(rename = "fixed")]
    Fixed,
    /// A fixed percentage of pods (`value` = P, 0..=100, rounded up).
    #[serde(rename = "fixed-percent")]
    FixedPercent,
    /// Up to P percent: a uniform roll K in [0, floor(len*P/100)], then K
    /// distinct pods.
    #[serde(rename = "random-max-percent")]
    RandomMaxPercent,
}

impl Default for PodMode {
    fn default() -> Self {
        PodMode::One
    }
}

impl PodMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PodMode::One => "one",
            PodMode::All => "all",
            PodMode::Fixed => "fixed",
            PodMode::FixedPercent => "fixed-percent",
            PodMode::RandomMaxPercent => "random-max-percent",
        }
    }

    pub fn requires_value(&self) -> bool {
        matches!(
            self,
            PodMode::Fixed | PodMode::FixedPercent | PodMode::RandomMaxPercent
        )
    }
}

impl fmt::Display for PodMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_wire_names_are_stable() {
        let json = serde_json::to_string(&PodMode::RandomMaxPercent).expect("serialize");
        assert_eq!(json, "\"random-max-percent\"");
        let back: PodMode = serde_json::from_str("\"fixed-percent\"").expect("deserialize");
        assert_eq!(back, PodMode::FixedPercent);
    }

    #[test]
    fn selector_wire_names_are_stable() {
        let raw = r#"{
            "namespaces": ["default"],
            "labelSelectors": {"app": "nginx"},
            "podPhaseSelectors": ["Running"]
        }"#;
        let selector: SelectorSpec = serde_json::from_str(raw).expect("deserialize");
        assert_eq!(selector.namespaces, vec!["default"]);
        assert_eq!(selector.label_selectors.get("app").unwrap(), "nginx");
        assert!(!selector.is_empty());
        assert!(SelectorSpec::default().is_empty());
    }
}
