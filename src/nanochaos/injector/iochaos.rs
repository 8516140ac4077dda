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

//! IoChaos flows through the per-pod PodIoChaos aggregate: the injector
//! rewrites its actions under its source tag, and the aggregate watcher
//! forwards the JSON-serialized action list to the chaosfs sidecar via the
//! node agent (atomic replace per pod).

use crate::nanochaos::chaos::iochaos::IoChaosSpec;
use crate::nanochaos::chaos::object::ChaosObject;
use crate::nanochaos::chaos::podiochaos::{IoChaosAction, IoFault, IoFilter};
use crate::nanochaos::chaos::store::{get_pod_io_chaos, put_pod_io_chaos_if_version};
use crate::nanochaos::chaos::KIND_IO_CHAOS;
use crate::nanochaos::controller::twophase::KindInjector;
use crate::nanochaos::controller::ControllerContext;
use crate::nanochaos::daemon::client::DaemonProvider;
use crate::nanochaos::injector::{pod_record, split_finalizer_key};
use crate::nanochaos::k8s::event::{
    record_chaos_event, EVENT_TYPE_NORMAL, REASON_CHAOS_INJECTED, REASON_CHAOS_RECOVERED,
};
use crate::nanochaos::k8s::store::get_pod;
use crate::nanochaos::logger::log_info;
use crate::nanochaos::network::manager::PodIoManager;
use crate::nanochaos::selector::select_and_filter_pods;
use crate::nanochaos::util::error::{new_error, ErrorList};

use async_trait::async_trait;
use std::error::Error;

type DynError = Box<dyn Error + Send + Sync>;

const COMPONENT: &str = "iochaos";
const IO_CHAOS_MSG: &str = "io chaos action duration %s";

pub struct IoChaosInjector;

#[async_trait]
impl KindInjector<IoChaosSpec> for IoChaosInjector {
    async fn apply(
        &self,
        ctx: &ControllerContext,
        chaos: &mut ChaosObject<IoChaosSpec>,
    ) -> Result<(), DynError> {
        let pods = select_and_filter_pods(chaos.namespace(), &chaos.spec, &ctx.cfg)?;

        let mut manager = PodIoManager::new(chaos.source_key());
        for pod in &pods {
            chaos.insert_finalizer(&pod.key());
            let transaction = manager.with_init(pod.namespace(), pod.name());
            transaction.set_volume_path(&chaos.spec.volume_path);
            transaction.set_container(chaos.spec.container_name.clone());
            transaction.append(IoChaosAction {
                action_type: chaos.spec.action,
                filter: IoFilter {
                    path: chaos.spec.path.clone(),
                    methods: chaos.spec.methods.clone(),
                    percent: chaos.spec.percent,
                },
                faults: chaos
                    .spec
                    .errno
                    .iter()
                    .map(|errno| IoFault {
                        errno: Some(errno.clone()),
                        weight: 1,
                    })
                    .collect(),
                latency: chaos.spec.delay.clone(),
                attr_override: chaos.spec.attr.clone(),
                source: chaos.source_key(),
            });
        }

        manager.commit().await?;

        chaos.status.experiment.pod_records = pods
            .iter()
            .map(|pod| {
                let message = chaos
                    .spec
                    .duration
                    .as_deref()
                    .map(|duration| IO_CHAOS_MSG.replace("%s", duration))
                    .unwrap_or_default();
                pod_record(pod, &chaos.spec, message)
            })
            .collect();

        record_chaos_event(
            KIND_IO_CHAOS,
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
        _ctx: &ControllerContext,
        chaos: &mut ChaosObject<IoChaosSpec>,
    ) -> Result<(), DynError> {
        let mut errors = ErrorList::new();

        for key in chaos.metadata.finalizers.clone() {
            let (namespace, name) = match split_finalizer_key(&key) {
                Ok(parsed) => parsed,
                Err(err) => {
                    errors.push(err);
                    continue;
                }
            };

            let mut manager = PodIoManager::new(chaos.source_key());
            manager.with_init(&namespace, &name);
            match manager.commit().await {
                Ok(()) => chaos.remove_finalizer(&key),
                Err(err) => errors.push(err),
            }
        }

        if chaos.is_forced_cleanup() {
            log_info(
                COMPONENT,
                "forced finalizer cleanup, accepting partial recovery",
                &[("chaos", &chaos.source_key())],
            );
            chaos.metadata.finalizers.clear();
        } else {
            errors.into_result()?;
        }

        record_chaos_event(
            KIND_IO_CHAOS,
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

/// Pushes a pod's io aggregate to the chaosfs sidecar through the node
/// agent and records the sidecar instance back on the aggregate.
pub async fn apply_io_aggregate(
    namespace: &str,
    name: &str,
    provider: &dyn DaemonProvider,
) -> Result<(), DynError> {
    let (mut aggregate, version) = match get_pod_io_chaos(Some(namespace), name)? {
        Some(found) => found,
        None => return Ok(()),
    };

    let pod = match get_pod(Some(namespace), name)? {
        Some(pod) => pod,
        None => return Ok(()),
    };

    let container_id = match &aggregate.spec.container {
        Some(container_name) => pod
            .containers_matching(std::slice::from_ref(container_name))
            .first()
            .and_then(|status| status.container_id.clone()),
        None => pod.first_container_id().map(|id| id.to_string()),
    }
    .ok_or_else(|| new_error(format!("pod {} has no matching container", pod.key())))?;

    let actions_json = serde_json::to_string(&aggregate.spec.actions)
        .map_err(|e| new_error(format!("failed to serialize io actions: {}", e)))?;

    let client = provider.client_for(&pod).await?;
    let (instance, start_time) = client
        .apply_io_chaos(
            &container_id,
            &aggregate.spec.volume_mount_path,
            &actions_json,
            aggregate.spec.pid.unwrap_or(0),
            aggregate.spec.start_time.unwrap_or(0),
        )
        .await?;

    aggregate.spec.pid = Some(instance);
    aggregate.spec.start_time = Some(start_time);
    put_pod_io_chaos_if_version(&aggregate, Some(version))?;

    log_info(
        COMPONENT,
        "applied io aggregate",
        &[("pod", &pod.key()), ("instance", &instance.to_string())],
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nanochaos::bpfki::testing::RecordingKernel;
    use crate::nanochaos::chaos::iochaos::IoChaosAction as IoActionKind;
    use crate::nanochaos::chaos::selector::{PodMode, SelectorSpec};
    use crate::nanochaos::daemon::client::testing::{DaemonCall, RecordingDaemon, RecordingProvider};
    use crate::nanochaos::k8s::pod::{
        ContainerSpec, ContainerStatus, ObjectMeta, Pod, PodSpec, PodStatus,
    };
    use crate::nanochaos::k8s::store::put_pod;
    use crate::nanochaos::test_support::{keyspace_env, keyspace_lock};
    use serial_test::serial;
    use std::sync::Arc;

    fn seed_pod(name: &str) {
        let mut pod = Pod::new(
            ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some(format!("uid-{name}")),
                ..Default::default()
            },
            PodSpec {
                containers: vec![ContainerSpec {
                    name: "app".to_string(),
                    image: Some("db:v1".to_string()),
                }],
                ..Default::default()
            },
        );
        pod.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            host_ip: Some("192.168.0.10".to_string()),
            container_statuses: vec![ContainerStatus {
                name: "app".to_string(),
                container_id: Some(format!("docker://{name}")),
                ..Default::default()
            }],
            ..Default::default()
        });
        put_pod(&pod).expect("seed pod");
    }

    fn sample_chaos() -> ChaosObject<IoChaosSpec> {
        ChaosObject::new(
            ObjectMeta {
                name: Some("io-demo".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            IoChaosSpec {
                action: IoActionKind::Delay,
                mode: PodMode::All,
                selector: SelectorSpec {
                    namespaces: vec!["default".to_string()],
                    ..Default::default()
                },
                volume_path: "/var/run/data".to_string(),
                methods: vec!["write".to_string()],
                percent: 100,
                delay: Some("1s".to_string()),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    #[serial]
    async fn apply_builds_aggregate_and_materializer_forwards_json() {
        let _guard = keyspace_lock().lock();
        let _env = keyspace_env();
        seed_pod("db-0");

        let daemon = RecordingDaemon::new();
        let ctx = ControllerContext::for_tests_with(
            Arc::new(RecordingProvider(daemon.clone())),
            Arc::new(RecordingKernel::default()),
        );
        let mut chaos = sample_chaos();
        IoChaosInjector.apply(&ctx, &mut chaos).await.expect("apply");

        let (aggregate, _) = get_pod_io_chaos(Some("default"), "db-0")
            .expect("get")
            .expect("present");
        assert_eq!(aggregate.spec.volume_mount_path, "/var/run/data");
        assert_eq!(aggregate.spec.actions.len(), 1);
        assert_eq!(aggregate.spec.actions[0].filter.percent, 100);

        let provider = RecordingProvider(daemon.clone());
        apply_io_aggregate("default", "db-0", &provider)
            .await
            .expect("materialize");

        let calls = daemon.calls();
        let forwarded = calls
            .iter()
            .find_map(|call| match call {
                DaemonCall::ApplyIoChaos(container, volume, actions) => {
                    Some((container.clone(), volume.clone(), actions.clone()))
                }
                _ => None,
            })
            .expect("io chaos forwarded");
        assert_eq!(forwarded.0, "docker://db-0");
        assert_eq!(forwarded.1, "/var/run/data");
        assert!(forwarded.2.contains("\"latency\":\"1s\""), "{}", forwarded.2);

        // The sidecar instance is recorded back onto the aggregate.
        let (aggregate, _) = get_pod_io_chaos(Some("default"), "db-0")
            .expect("get")
            .expect("present");
        assert_eq!(aggregate.spec.pid, Some(9999));
    }

    #[tokio::test]
    #[serial]
    async fn recover_empties_this_sources_actions() {
        let _guard = keyspace_lock().lock();
        let _env = keyspace_env();
        seed_pod("db-0");

        let ctx = ControllerContext::for_tests();
        let mut chaos = sample_chaos();
        IoChaosInjector.apply(&ctx, &mut chaos).await.expect("apply");
        IoChaosInjector
            .recover(&ctx, &mut chaos)
            .await
            .expect("recover");

        let (aggregate, _) = get_pod_io_chaos(Some("default"), "db-0")
            .expect("get")
            .expect("present");
        assert!(aggregate.spec.actions.is_empty());
        assert!(chaos.metadata.finalizers.is_empty());
    }
}
