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

//! Per-kind injectors: the Apply/Recover implementations the two-phase
//! reconciler drives. Apply fans out per target and fails fast; Recover
//! walks the per-target finalizer checklist and keeps going past
//! individual failures, accumulating them into one error.

pub mod iochaos;
pub mod kernelchaos;
pub mod networkchaos;
pub mod podchaos;
pub mod stresschaos;
pub mod timechaos;

use crate::nanochaos::chaos::object::{ChaosObject, ChaosSpec};
use crate::nanochaos::chaos::status::PodRecord;
use crate::nanochaos::k8s::pod::Pod;
use crate::nanochaos::k8s::store::get_pod;
use crate::nanochaos::logger::log_info;
use crate::nanochaos::util::error::{new_error, ErrorList};

use std::error::Error;
use std::future::Future;

type DynError = Box<dyn Error + Send + Sync>;

/// Splits a `<namespace>/<name>` finalizer key.
pub fn split_finalizer_key(key: &str) -> Result<(String, String), DynError> {
    match key.split_once('/') {
        Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => {
            Ok((namespace.to_string(), name.to_string()))
        }
        _ => Err(new_error(format!("malformed finalizer key '{}'", key))),
    }
}

/// Builds the status record for one injected pod.
pub fn pod_record<S: ChaosSpec>(pod: &Pod, spec: &S, message: String) -> PodRecord {
    PodRecord {
        namespace: pod.namespace().to_string(),
        name: pod.name().to_string(),
        host_ip: pod.host_ip().unwrap_or_default().to_string(),
        pod_ip: pod.pod_ip().unwrap_or_default().to_string(),
        action: spec.action_name(),
        message,
    }
}

/// Walks the finalizer checklist during Recover. Each entry is removed
/// only after its cleanup succeeds; pods that no longer exist are
/// considered clean. Errors accumulate instead of aborting, and the forced
/// cleanup annotation clears whatever is left.
pub async fn clean_finalizers_and_recover<S, F, Fut>(
    chaos: &mut ChaosObject<S>,
    recover_pod: F,
) -> Result<(), DynError>
where
    S: ChaosSpec,
    F: Fn(Pod) -> Fut,
    Fut: Future<Output = Result<(), DynError>>,
{
    let mut errors = ErrorList::new();

    for key in chaos.metadata.finalizers.clone() {
        let (namespace, name) = match split_finalizer_key(&key) {
            Ok(parsed) => parsed,
            Err(err) => {
                errors.push(err);
                continue;
            }
        };

        let pod = match get_pod(Some(&namespace), &name) {
            Ok(Some(pod)) => pod,
            Ok(None) => {
                log_info(
                    "injector",
                    "pod not found, dropping finalizer",
                    &[("namespace", namespace.as_str()), ("name", name.as_str())],
                );
                chaos.remove_finalizer(&key);
                continue;
            }
            Err(err) => {
                errors.push(err);
                continue;
            }
        };

        match recover_pod(pod).await {
            Ok(()) => chaos.remove_finalizer(&key),
            Err(err) => errors.push(err),
        }
    }

    if chaos.is_forced_cleanup() {
        log_info(
            "injector",
            "forced finalizer cleanup, accepting partial recovery",
            &[("chaos", &chaos.source_key())],
        );
        chaos.metadata.finalizers.clear();
        return Ok(());
    }

    errors.into_result()
}
