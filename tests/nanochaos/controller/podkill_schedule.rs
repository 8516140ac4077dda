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

//! Scheduled pod-kill end to end: every cycle kills one pod, deleting the
//! chaos resource recovers and stops the killing.

use crate::support::{fresh_cluster, labels, seed_pod};

use nanochaos::nanochaos::chaos::object::{ChaosObject, SchedulerSpec};
use nanochaos::nanochaos::chaos::podchaos::{PodChaosAction, PodChaosSpec};
use nanochaos::nanochaos::chaos::selector::{PodMode, SelectorSpec};
use nanochaos::nanochaos::chaos::status::ExperimentPhase;
use nanochaos::nanochaos::chaos::store::{get_chaos, mark_chaos_deleted, put_chaos};
use nanochaos::nanochaos::controller::twophase::TwoPhaseReconciler;
use nanochaos::nanochaos::controller::ControllerContext;
use nanochaos::nanochaos::injector::podchaos::PodChaosInjector;
use nanochaos::nanochaos::k8s::pod::ObjectMeta;
use nanochaos::nanochaos::k8s::store::list_pods;

use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;

fn kill_chaos() -> ChaosObject<PodChaosSpec> {
    ChaosObject::new(
        ObjectMeta {
            name: Some("kill-nginx".to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        PodChaosSpec {
            action: PodChaosAction::PodKill,
            mode: PodMode::One,
            selector: SelectorSpec {
                namespaces: vec!["default".to_string()],
                label_selectors: labels(&[("app", "nginx")]),
                ..Default::default()
            },
            duration: Some("500ms".to_string()),
            scheduler: Some(SchedulerSpec {
                cron: "@every 1s".to_string(),
            }),
            ..Default::default()
        },
    )
}

#[tokio::test]
#[serial]
async fn scheduled_pod_kill_removes_a_pod_per_cycle() {
    let _cluster = fresh_cluster();
    for index in 0..3 {
        seed_pod(
            "default",
            &format!("nginx-{index}"),
            &[("app", "nginx")],
            &format!("10.0.0.{index}"),
        );
    }

    let ctx = ControllerContext::new(Default::default());
    let reconciler: TwoPhaseReconciler<PodChaosSpec> =
        TwoPhaseReconciler::new(Arc::new(PodChaosInjector));
    let mut chaos = kill_chaos();
    put_chaos(&mut chaos).expect("create chaos");

    // First cycle: Apply kills one pod and schedules the round.
    reconciler
        .reconcile(&ctx, "default", "kill-nginx")
        .await
        .expect("first reconcile");
    assert_eq!(list_pods(Some("default")).expect("list").len(), 2);

    let stored = get_chaos::<PodChaosSpec>(Some("default"), "kill-nginx")
        .expect("get")
        .expect("present");
    assert_eq!(stored.status.experiment.phase, ExperimentPhase::Running);
    let next_start = stored.next_start().expect("next start");
    let next_recover = stored.next_recover().expect("next recover");
    assert!(next_recover <= next_start, "schedule invariant");

    // Let the round expire, recover, then start the next cycle.
    tokio::time::sleep(Duration::from_millis(600)).await;
    reconciler
        .reconcile(&ctx, "default", "kill-nginx")
        .await
        .expect("recover reconcile");
    let stored = get_chaos::<PodChaosSpec>(Some("default"), "kill-nginx")
        .expect("get")
        .expect("present");
    assert_eq!(stored.status.experiment.phase, ExperimentPhase::Waiting);

    tokio::time::sleep(Duration::from_millis(500)).await;
    reconciler
        .reconcile(&ctx, "default", "kill-nginx")
        .await
        .expect("second apply");
    assert_eq!(
        list_pods(Some("default")).expect("list").len(),
        1,
        "a second cycle killed another pod"
    );

    // Deleting the chaos stops the experiment and removes the object.
    mark_chaos_deleted::<PodChaosSpec>(Some("default"), "kill-nginx").expect("delete");
    reconciler
        .reconcile(&ctx, "default", "kill-nginx")
        .await
        .expect("final reconcile");
    assert!(get_chaos::<PodChaosSpec>(Some("default"), "kill-nginx")
        .expect("get")
        .is_none());

    // No further deletions occur once the resource is gone.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(list_pods(Some("default")).expect("list").len(), 1);
}
