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

use crate::nanochaos::chaos::object::ChaosObject;
use crate::nanochaos::chaos::timechaos::{encode_clock_ids, TimeChaosSpec};
use crate::nanochaos::chaos::KIND_TIME_CHAOS;
use crate::nanochaos::controller::twophase::KindInjector;
use crate::nanochaos::controller::ControllerContext;
use crate::nanochaos::injector::{clean_finalizers_and_recover, pod_record};
use crate::nanochaos::k8s::event::{
    record_chaos_event, EVENT_TYPE_NORMAL, REASON_CHAOS_INJECTED, REASON_CHAOS_RECOVERED,
};
use crate::nanochaos::logger::log_info;
use crate::nanochaos::selector::select_and_filter_pods;
use crate::nanochaos::util::error::new_error;
use crate::nanochaos::util::parse_signed_duration;

use async_trait::async_trait;
use std::error::Error;

type DynError = Box<dyn Error + Send + Sync>;

const COMPONENT: &str = "timechaos";
const TIME_CHAOS_MSG: &str = "time is shifted with %v";

/// Splits the signed offset into the `(sec, nsec)` pair the daemon's
/// clock_gettime shim consumes.
fn sec_and_nsec(offset: &str) -> Result<(i64, i64), DynError> {
    let (negative, duration) = parse_signed_duration(offset)?;
    let total = i64::try_from(duration.as_nanos())
        .map_err(|e| new_error(format!("time offset '{}' is out of range: {}", offset, e)))?;
    let total = if negative { -total } else { total };
    let sec = total / 1_000_000_000;
    let nsec = total - sec * 1_000_000_000;
    Ok((sec, nsec))
}

pub struct TimeChaosInjector;

#[async_trait]
impl KindInjector<TimeChaosSpec> for TimeChaosInjector {
    async fn apply(
        &self,
        ctx: &ControllerContext,
        chaos: &mut ChaosObject<TimeChaosSpec>,
    ) -> Result<(), DynError> {
        let pods = select_and_filter_pods(chaos.namespace(), &chaos.spec, &ctx.cfg)?;

        let (sec, nsec) = sec_and_nsec(&chaos.spec.time_offset)?;
        let mask = encode_clock_ids(&chaos.spec.effective_clock_ids())?;
        let container_names = chaos.spec.container_names.clone();

        for pod in &pods {
            chaos.insert_finalizer(&pod.key());
        }

        for pod in &pods {
            let client = ctx.daemon.client_for(pod).await?;
            let containers = pod.containers_matching(&container_names);
            if containers.is_empty() {
                return Err(new_error(format!(
                    "{} can't get the state of container",
                    pod.key()
                )));
            }

            for container in containers {
                let container_id = container.container_id.as_deref().ok_or_else(|| {
                    new_error(format!(
                        "container {} in pod {} has no runtime id",
                        container.name,
                        pod.key()
                    ))
                })?;
                log_info(
                    COMPONENT,
                    "shifting time on container",
                    &[
                        ("container", container_id),
                        ("sec", &sec.to_string()),
                        ("mask", &mask.to_string()),
                    ],
                );
                client
                    .set_time_offset(container_id, sec, nsec, mask)
                    .await?;
            }
        }

        chaos.status.experiment.pod_records = pods
            .iter()
            .map(|pod| {
                pod_record(
                    pod,
                    &chaos.spec,
                    TIME_CHAOS_MSG.replace("%v", &chaos.spec.time_offset),
                )
            })
            .collect();

        record_chaos_event(
            KIND_TIME_CHAOS,
            chaos.namespace(),
            chaos.name(),
            EVENT_TYPE_NORMAL,
            REASON_CHAOS_INJECTED,
            "",
        )
        .await;
        Ok(())
    }

    async fn recover(
        &self,
        ctx: &ControllerContext,
        chaos: &mut ChaosObject<TimeChaosSpec>,
    ) -> Result<(), DynError> {
        let container_names = chaos.spec.container_names.clone();
        let daemon = ctx.daemon.clone();

        clean_finalizers_and_recover(chaos, |pod| {
            let container_names = container_names.clone();
            let daemon = daemon.clone();
            async move {
                let client = daemon.client_for(&pod).await?;
                for container in pod.containers_matching(&container_names) {
                    if let Some(container_id) = container.container_id.as_deref() {
                        client.recover_time_offset(container_id).await?;
                    }
                }
                Ok(())
            }
        })
        .await?;

        record_chaos_event(
            KIND_TIME_CHAOS,
            chaos.namespace(),
            chaos.name(),
            EVENT_TYPE_NORMAL,
            REASON_CHAOS_RECOVERED,
            "",
        )
        .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nanochaos::bpfki::testing::RecordingKernel;
    use crate::nanochaos::chaos::selector::{PodMode, SelectorSpec};
    use crate::nanochaos::daemon::client::testing::{DaemonCall, RecordingDaemon, RecordingProvider};
    use crate::nanochaos::k8s::pod::{
        ContainerSpec, ContainerStatus, ObjectMeta, Pod, PodSpec, PodStatus,
    };
    use crate::nanochaos::k8s::store::put_pod;
    use crate::nanochaos::test_support::{keyspace_env, keyspace_lock};
    use serial_test::serial;
    use std::sync::Arc;

    #[test]
    fn offsets_split_into_sec_and_nsec() {
        assert_eq!(sec_and_nsec("1s 500ms").expect("positive"), (1, 500_000_000));
        assert_eq!(sec_and_nsec("-1h").expect("negative"), (-3600, 0));
        let (sec, nsec) = sec_and_nsec("-1s 200ms").expect("mixed");
        assert_eq!(sec, -1);
        assert_eq!(nsec, -200_000_000);
        assert!(sec_and_nsec("later").is_err());
    }

    fn seed_pod(name: &str) {
        let mut pod = Pod::new(
            ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            PodSpec {
                containers: vec![
                    ContainerSpec {
                        name: "app".to_string(),
                        image: Some("timer:v1".to_string()),
                    },
                    ContainerSpec {
                        name: "sidecar".to_string(),
                        image: Some("envoy:v1".to_string()),
                    },
                ],
                ..Default::default()
            },
        );
        pod.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            host_ip: Some("192.168.0.10".to_string()),
            container_statuses: vec![
                ContainerStatus {
                    name: "app".to_string(),
                    container_id: Some(format!("docker://{name}-app")),
                    ..Default::default()
                },
                ContainerStatus {
                    name: "sidecar".to_string(),
                    container_id: Some(format!("docker://{name}-sidecar")),
                    ..Default::default()
                },
            ],
            ..Default::default()
        });
        put_pod(&pod).expect("seed pod");
    }

    fn sample_chaos(container_names: Vec<String>) -> ChaosObject<TimeChaosSpec> {
        ChaosObject::new(
            ObjectMeta {
                name: Some("clock-demo".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            TimeChaosSpec {
                mode: PodMode::All,
                selector: SelectorSpec {
                    namespaces: vec!["default".to_string()],
                    ..Default::default()
                },
                time_offset: "-1h".to_string(),
                container_names,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    #[serial]
    async fn apply_skews_every_container_by_default() {
        let _guard = keyspace_lock().lock();
        let _env = keyspace_env();
        seed_pod("timer-0");

        let daemon = RecordingDaemon::new();
        let ctx = ControllerContext::for_tests_with(
            Arc::new(RecordingProvider(daemon.clone())),
            Arc::new(RecordingKernel::default()),
        );
        let mut chaos = sample_chaos(vec![]);
        TimeChaosInjector.apply(&ctx, &mut chaos).await.expect("apply");

        let calls = daemon.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|call| matches!(
            call,
            DaemonCall::SetTimeOffset(_, -3600, 0, 1)
        )));
        assert_eq!(chaos.metadata.finalizers, vec!["default/timer-0"]);
        assert!(chaos.status.experiment.pod_records[0]
            .message
            .contains("-1h"));
    }

    #[tokio::test]
    #[serial]
    async fn recover_restores_named_containers_and_drains_finalizers() {
        let _guard = keyspace_lock().lock();
        let _env = keyspace_env();
        seed_pod("timer-0");

        let daemon = RecordingDaemon::new();
        let ctx = ControllerContext::for_tests_with(
            Arc::new(RecordingProvider(daemon.clone())),
            Arc::new(RecordingKernel::default()),
        );
        let mut chaos = sample_chaos(vec!["app".to_string()]);
        TimeChaosInjector.apply(&ctx, &mut chaos).await.expect("apply");
        TimeChaosInjector
            .recover(&ctx, &mut chaos)
            .await
            .expect("recover");

        let calls = daemon.calls();
        assert!(calls.contains(&DaemonCall::RecoverTimeOffset(
            "docker://timer-0-app".to_string()
        )));
        assert!(!calls
            .iter()
            .any(|call| matches!(call, DaemonCall::RecoverTimeOffset(id) if id.contains("sidecar"))));
        assert!(chaos.metadata.finalizers.is_empty());
    }
}
