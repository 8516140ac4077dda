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

//! Pod-failure pause/resume: the pause annotation recovers the current
//! round, removing it re-applies with the remaining duration.

use crate::support::{fresh_cluster, labels, seed_pod};

use nanochaos::nanochaos::chaos::object::{ChaosObject, SchedulerSpec};
use nanochaos::nanochaos::chaos::podchaos::{PodChaosAction, PodChaosSpec, PAUSE_IMAGE};
use nanochaos::nanochaos::chaos::selector::{PodMode, SelectorSpec};
use nanochaos::nanochaos::chaos::status::ExperimentPhase;
use nanochaos::nanochaos::chaos::store::{get_chaos, put_chaos, update_chaos_with};
use nanochaos::nanochaos::chaos::PAUSE_ANNOTATION_KEY;
use nanochaos::nanochaos::controller::twophase::TwoPhaseReconciler;
use nanochaos::nanochaos::controller::ControllerContext;
use nanochaos::nanochaos::injector::podchaos::PodChaosInjector;
use nanochaos::nanochaos::k8s::pod::ObjectMeta;
use nanochaos::nanochaos::k8s::store::get_pod;

use serial_test::serial;
use std::sync::Arc;

fn failure_chaos() -> ChaosObject<PodChaosSpec> {
    ChaosObject::new(
        ObjectMeta {
            name: Some("fail-timer".to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        PodChaosSpec {
            action: PodChaosAction::PodFailure,
            mode: PodMode::One,
            selector: SelectorSpec {
                namespaces: vec!["default".to_string()],
                label_selectors: labels(&[("app", "timer")]),
                ..Default::default()
            },
            duration: Some("9m".to_string()),
            scheduler: Some(SchedulerSpec {
                cron: "@every 10m".to_string(),
            }),
            ..Default::default()
        },
    )
}

#[tokio::test]
#[serial]
async fn pause_recovers_and_resume_reapplies_the_failure() {
    let _cluster = fresh_cluster();
    seed_pod("default", "timer-0", &[("app", "timer")], "10.0.0.7");

    let ctx = ControllerContext::new(Default::default());
    let reconciler: TwoPhaseReconciler<PodChaosSpec> =
        TwoPhaseReconciler::new(Arc::new(PodChaosInjector));
    let mut chaos = failure_chaos();
    put_chaos(&mut chaos).expect("create chaos");

    reconciler
        .reconcile(&ctx, "default", "fail-timer")
        .await
        .expect("apply");
    let pod = get_pod(Some("default"), "timer-0")
        .expect("get")
        .expect("present");
    assert_eq!(pod.spec.containers[0].image.as_deref(), Some(PAUSE_IMAGE));
    assert_eq!(
        pod.metadata
            .annotations
            .get("chaos-mesh.org/podfailure-app")
            .map(String::as_str),
        Some("nginx:1.25"),
        "original image stashed for audit"
    );

    // Pause: the round is recovered, the broken replica deleted so its
    // owner can recreate it.
    update_chaos_with::<PodChaosSpec, _>(Some("default"), "fail-timer", |chaos| {
        chaos
            .metadata
            .annotations
            .insert(PAUSE_ANNOTATION_KEY.to_string(), "true".to_string());
    })
    .expect("annotate pause");
    reconciler
        .reconcile(&ctx, "default", "fail-timer")
        .await
        .expect("pause");

    let stored = get_chaos::<PodChaosSpec>(Some("default"), "fail-timer")
        .expect("get")
        .expect("present");
    assert_eq!(stored.status.experiment.phase, ExperimentPhase::Paused);
    assert!(stored.metadata.finalizers.is_empty());
    assert!(
        get_pod(Some("default"), "timer-0").expect("get").is_none(),
        "recover deletes the failed replica"
    );

    // The workload controller recreates a healthy replica.
    seed_pod("default", "timer-0", &[("app", "timer")], "10.0.0.7");

    // Resume inside the open round: the failure comes back.
    update_chaos_with::<PodChaosSpec, _>(Some("default"), "fail-timer", |chaos| {
        chaos.metadata.annotations.remove(PAUSE_ANNOTATION_KEY);
    })
    .expect("remove pause");
    reconciler
        .reconcile(&ctx, "default", "fail-timer")
        .await
        .expect("resume");

    let stored = get_chaos::<PodChaosSpec>(Some("default"), "fail-timer")
        .expect("get")
        .expect("present");
    assert_eq!(stored.status.experiment.phase, ExperimentPhase::Running);
    let pod = get_pod(Some("default"), "timer-0")
        .expect("get")
        .expect("present");
    assert_eq!(pod.spec.containers[0].image.as_deref(), Some(PAUSE_IMAGE));
}
