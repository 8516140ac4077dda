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
use crate::nanochaos::chaos::podchaos::{
    PodChaosAction, PodChaosSpec, PAUSE_IMAGE, PODFAILURE_IMAGE_ANNOTATION_PREFIX,
};
use crate::nanochaos::chaos::KIND_POD_CHAOS;
use crate::nanochaos::controller::twophase::KindInjector;
use crate::nanochaos::controller::ControllerContext;
use crate::nanochaos::injector::{clean_finalizers_and_recover, pod_record};
use crate::nanochaos::k8s::event::{
    record_chaos_event, EVENT_TYPE_NORMAL, REASON_CHAOS_INJECTED, REASON_CHAOS_RECOVERED,
};
use crate::nanochaos::k8s::pod::Pod;
use crate::nanochaos::k8s::store::{delete_pod, update_pod_with};
use crate::nanochaos::logger::log_info;
use crate::nanochaos::selector::select_and_filter_pods;
use crate::nanochaos::util::error::new_error;

use async_trait::async_trait;
use std::error::Error;

type DynError = Box<dyn Error + Send + Sync>;

const COMPONENT: &str = "podchaos";
const POD_KILL_MSG: &str = "delete pod";
const POD_FAILURE_MSG: &str = "pod failure duration %s";

pub struct PodChaosInjector;

#[async_trait]
impl KindInjector<PodChaosSpec> for PodChaosInjector {
    async fn apply(
        &self,
        ctx: &ControllerContext,
        chaos: &mut ChaosObject<PodChaosSpec>,
    ) -> Result<(), DynError> {
        let pods = select_and_filter_pods(chaos.namespace(), &chaos.spec, &ctx.cfg)?;

        match chaos.spec.action {
            PodChaosAction::PodKill => apply_pod_kill(chaos, &pods)?,
            PodChaosAction::PodFailure => apply_pod_failure(chaos, &pods)?,
            PodChaosAction::ContainerKill => apply_container_kill(ctx, chaos, &pods).await?,
        }

        record_chaos_event(
            KIND_POD_CHAOS,
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
        chaos: &mut ChaosObject<PodChaosSpec>,
    ) -> Result<(), DynError> {
        match chaos.spec.action {
            // Killed pods and containers come back on their own; there is
            // nothing to undo.
            PodChaosAction::PodKill | PodChaosAction::ContainerKill => {
                chaos.metadata.finalizers.clear();
            }
            PodChaosAction::PodFailure => {
                clean_finalizers_and_recover(chaos, |pod| async move {
                    // Deleting the broken replica lets the owning workload
                    // controller recreate it from the original template.
                    log_info(
                        COMPONENT,
                        "deleting pod to restore original containers",
                        &[("pod", &pod.key())],
                    );
                    delete_pod(Some(pod.namespace()), pod.name())
                })
                .await?;
            }
        }

        record_chaos_event(
            KIND_POD_CHAOS,
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

fn apply_pod_kill(
    chaos: &mut ChaosObject<PodChaosSpec>,
    pods: &[Pod],
) -> Result<(), DynError> {
    chaos.status.experiment.pod_records = Vec::with_capacity(pods.len());
    for pod in pods {
        log_info(COMPONENT, "killing pod", &[("pod", &pod.key())]);
        delete_pod(Some(pod.namespace()), pod.name())?;
        chaos
            .status
            .experiment
            .pod_records
            .push(pod_record(pod, &chaos.spec, POD_KILL_MSG.to_string()));
    }
    Ok(())
}

fn apply_pod_failure(
    chaos: &mut ChaosObject<PodChaosSpec>,
    pods: &[Pod],
) -> Result<(), DynError> {
    chaos.status.experiment.pod_records = Vec::with_capacity(pods.len());
    for pod in pods {
        chaos.insert_finalizer(&pod.key());
    }

    for pod in pods {
        log_info(COMPONENT, "failing pod", &[("pod", &pod.key())]);
        update_pod_with(Some(pod.namespace()), pod.name(), |stored| {
            for container in stored
                .spec
                .init_containers
                .iter_mut()
                .chain(stored.spec.containers.iter_mut())
            {
                if let Some(image) = container.image.take() {
                    if image != PAUSE_IMAGE {
                        stored.metadata.annotations.insert(
                            format!("{}{}", PODFAILURE_IMAGE_ANNOTATION_PREFIX, container.name),
                            image,
                        );
                    }
                }
                container.image = Some(PAUSE_IMAGE.to_string());
            }
        })?;

        let message = chaos
            .spec
            .duration
            .as_deref()
            .map(|duration| POD_FAILURE_MSG.replace("%s", duration))
            .unwrap_or_default();
        chaos
            .status
            .experiment
            .pod_records
            .push(pod_record(pod, &chaos.spec, message));
    }
    Ok(())
}

async fn apply_container_kill(
    ctx: &ControllerContext,
    chaos: &mut ChaosObject<PodChaosSpec>,
    pods: &[Pod],
) -> Result<(), DynError> {
    let container_name = chaos
        .spec
        .container_name
        .clone()
        .ok_or_else(|| new_error("containerName is required for container-kill"))?;

    chaos.status.experiment.pod_records = Vec::with_capacity(pods.len());
    for pod in pods {
        let names = [container_name.clone()];
        let statuses = pod.containers_matching(&names);
        let container_id = statuses
            .first()
            .and_then(|status| status.container_id.as_deref())
            .ok_or_else(|| {
                new_error(format!(
                    "container {} not found in pod {}",
                    container_name,
                    pod.key()
                ))
            })?;

        let client = ctx.daemon.client_for(pod).await?;
        log_info(
            COMPONENT,
            "killing container",
            &[("pod", &pod.key()), ("container", container_id)],
        );
        client.container_kill(container_id).await?;

        let message = format!("kill container {}", container_name);
        chaos
            .status
            .experiment
            .pod_records
            .push(pod_record(pod, &chaos.spec, message));
    }
    Ok(())
}
