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

//! Target resolution: a selector plus a sampling mode becomes a concrete,
//! sorted list of pods. Sampling is a pure function of (candidates, mode,
//! value, RNG state); with a seeded RNG the result is deterministic.

use crate::nanochaos::chaos::object::ChaosSpec;
use crate::nanochaos::chaos::selector::{PodMode, SelectorSpec};
use crate::nanochaos::config::ControllerConfig;
use crate::nanochaos::k8s::pod::Pod;
use crate::nanochaos::k8s::store::{get_pod, list_nodes, list_pods};
use crate::nanochaos::util::error::{new_error, with_context};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::sync::{Mutex, OnceLock};

type DynError = Box<dyn Error + Send + Sync>;

const REGEX_VALUE_PREFIX: &str = "re:";

/// Process-wide PRNG for mode sampling, seeded from entropy at boot.
fn global_rng() -> &'static Mutex<StdRng> {
    static RNG: OnceLock<Mutex<StdRng>> = OnceLock::new();
    RNG.get_or_init(|| Mutex::new(StdRng::from_entropy()))
}

/// Resolves the targets of a chaos spec using the process-wide PRNG.
pub fn select_and_filter_pods<S: ChaosSpec>(
    chaos_namespace: &str,
    spec: &S,
    cfg: &ControllerConfig,
) -> Result<Vec<Pod>, DynError> {
    let mut rng = global_rng().lock().expect("selector rng lock poisoned");
    select_pods_with_rng(
        chaos_namespace,
        spec.selector(),
        spec.mode(),
        spec.value(),
        cfg,
        &mut rng,
    )
}

/// Resolves an arbitrary selector+mode sub-spec (network-chaos targets).
pub fn select_target_pods(
    chaos_namespace: &str,
    selector: &SelectorSpec,
    mode: PodMode,
    value: Option<&str>,
    cfg: &ControllerConfig,
) -> Result<Vec<Pod>, DynError> {
    let mut rng = global_rng().lock().expect("selector rng lock poisoned");
    select_pods_with_rng(chaos_namespace, selector, mode, value, cfg, &mut rng)
}

/// The full pipeline with an explicit RNG, the deterministic entry point
/// tests use.
pub fn select_pods_with_rng(
    chaos_namespace: &str,
    selector: &SelectorSpec,
    mode: PodMode,
    value: Option<&str>,
    cfg: &ControllerConfig,
    rng: &mut StdRng,
) -> Result<Vec<Pod>, DynError> {
    let candidates = resolve_candidates(chaos_namespace, selector, cfg)?;
    let filtered = apply_filters(candidates, selector, cfg)?;
    sample_by_mode(filtered, mode, value, rng)
}

fn resolve_candidates(
    chaos_namespace: &str,
    selector: &SelectorSpec,
    cfg: &ControllerConfig,
) -> Result<Vec<Pod>, DynError> {
    let mut pods = Vec::new();

    if !selector.pods.is_empty() {
        // Explicit candidate list: fetch each pod individually; the other
        // predicates still apply as filters afterwards.
        for (namespace, names) in &selector.pods {
            if !cfg.within_scope(namespace) {
                continue;
            }
            for name in names {
                if let Some(pod) = get_pod(Some(namespace), name)? {
                    pods.push(pod);
                }
            }
        }
    } else {
        let namespaces: Vec<String> = if selector.namespaces.is_empty() {
            vec![chaos_namespace.to_string()]
        } else {
            selector.namespaces.clone()
        };

        for namespace in namespaces {
            if !cfg.within_scope(&namespace) {
                continue;
            }
            pods.extend(list_pods(Some(&namespace))?);
        }
    }

    pods.sort_by(|a, b| (a.namespace(), a.name()).cmp(&(b.namespace(), b.name())));
    pods.dedup_by(|a, b| a.key() == b.key());
    Ok(pods)
}

fn apply_filters(
    pods: Vec<Pod>,
    selector: &SelectorSpec,
    cfg: &ControllerConfig,
) -> Result<Vec<Pod>, DynError> {
    let mut filtered = Vec::with_capacity(pods.len());

    let allowed_nodes = resolve_node_filter(selector)?;

    for pod in pods {
        if !selector.namespaces.is_empty()
            && !selector.namespaces.iter().any(|ns| ns == pod.namespace())
        {
            continue;
        }

        if !matches_map(&pod.metadata.labels, &selector.label_selectors)? {
            continue;
        }
        if !matches_map(&pod.metadata.annotations, &selector.annotation_selectors)? {
            continue;
        }

        if let Some(nodes) = &allowed_nodes {
            match pod.spec.node_name.as_deref() {
                Some(node) if nodes.contains(node) => {}
                _ => continue,
            }
        }

        if !matches_fields(&pod, &selector.field_selectors) {
            continue;
        }

        if !selector.pod_phase_selectors.is_empty()
            && !selector
                .pod_phase_selectors
                .iter()
                .any(|phase| phase == pod.phase())
        {
            continue;
        }

        // Controller-wide allow/ignore gate, the final filter.
        if !cfg.namespace_permitted(pod.namespace()) {
            continue;
        }

        filtered.push(pod);
    }

    Ok(filtered)
}

/// Resolves `nodes` + `nodeSelectors` into the set of node names pods may
/// be scheduled to; `None` when no node predicate was given.
fn resolve_node_filter(selector: &SelectorSpec) -> Result<Option<HashSet<String>>, DynError> {
    if selector.nodes.is_empty() && selector.node_selectors.is_empty() {
        return Ok(None);
    }

    let mut allowed: HashSet<String> = selector.nodes.iter().cloned().collect();
    if !selector.node_selectors.is_empty() {
        for node in list_nodes()? {
            if node.matches_labels(&selector.node_selectors) {
                allowed.insert(node.name().to_string());
            }
        }
    }
    Ok(Some(allowed))
}

fn matches_map(
    actual: &HashMap<String, String>,
    expected: &HashMap<String, String>,
) -> Result<bool, DynError> {
    for (key, wanted) in expected {
        let found = match actual.get(key) {
            Some(found) => found,
            None => return Ok(false),
        };
        if let Some(pattern) = wanted.strip_prefix(REGEX_VALUE_PREFIX) {
            let regex = Regex::new(pattern)
                .map_err(|e| with_context(e, format!("Invalid selector pattern '{}'", wanted)))?;
            if !regex.is_match(found) {
                return Ok(false);
            }
        } else if found != wanted {
            return Ok(false);
        }
    }
    Ok(true)
}

fn matches_fields(pod: &Pod, fields: &HashMap<String, String>) -> bool {
    for (field, wanted) in fields {
        let actual = match field.as_str() {
            "metadata.name" => Some(pod.name().to_string()),
            "metadata.namespace" => Some(pod.namespace().to_string()),
            "spec.nodeName" => pod.spec.node_name.clone(),
            "status.podIP" => pod.pod_ip().map(|ip| ip.to_string()),
            "status.phase" => Some(pod.phase().to_string()),
            _ => None,
        };
        if actual.as_deref() != Some(wanted.as_str()) {
            return false;
        }
    }
    true
}

fn sample_by_mode(
    mut pods: Vec<Pod>,
    mode: PodMode,
    value: Option<&str>,
    rng: &mut StdRng,
) -> Result<Vec<Pod>, DynError> {
    if pods.is_empty() {
        return Err(new_error("no pods are selected by the provided selector"));
    }

    let mut selected = match mode {
        PodMode::All => pods,
        PodMode::One => sample(&mut pods, 1, rng),
        PodMode::Fixed => {
            let count = parse_value(mode, value)?;
            if count == 0 {
                return Err(new_error("value must be greater than 0 for mode 'fixed'"));
            }
            sample(&mut pods, count, rng)
        }
        PodMode::FixedPercent => {
            let percent = parse_percent(mode, value)?;
            let count = (pods.len() * percent).div_ceil(100);
            sample(&mut pods, count, rng)
        }
        PodMode::RandomMaxPercent => {
            let percent = parse_percent(mode, value)?;
            let max = pods.len() * percent / 100;
            let count = rng.gen_range(0..=max);
            sample(&mut pods, count, rng)
        }
    };

    selected.sort_by(|a, b| (a.namespace(), a.name()).cmp(&(b.namespace(), b.name())));
    Ok(selected)
}

fn parse_value(mode: PodMode, value: Option<&str>) -> Result<usize, DynError> {
    let raw =
        value.ok_or_else(|| new_error(format!("value is required when mode is '{}'", mode)))?;
    raw.parse::<usize>()
        .map_err(|e| with_context(e, format!("Invalid value '{}' for mode '{}'", raw, mode)))
}

fn parse_percent(mode: PodMode, value: Option<&str>) -> Result<usize, DynError> {
    let percent = parse_value(mode, value)?;
    if percent > 100 {
        return Err(new_error(format!(
            "value must be within 0..=100 for mode '{}'",
            mode
        )));
    }
    Ok(percent)
}

/// Uniform partial Fisher-Yates: the first `count` slots end up holding a
/// uniform random subset.
fn sample(pods: &mut Vec<Pod>, count: usize, rng: &mut StdRng) -> Vec<Pod> {
    let count = count.min(pods.len());
    for index in 0..count {
        let swap_with = rng.gen_range(index..pods.len());
        pods.swap(index, swap_with);
    }
    pods.truncate(count);
    std::mem::take(pods)
}
