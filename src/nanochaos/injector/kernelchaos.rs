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

use crate::nanochaos::chaos::kernelchaos::KernelChaosSpec;
use crate::nanochaos::chaos::object::ChaosObject;
use crate::nanochaos::chaos::KIND_KERNEL_CHAOS;
use crate::nanochaos::controller::twophase::KindInjector;
use crate::nanochaos::controller::ControllerContext;
use crate::nanochaos::injector::{clean_finalizers_and_recover, pod_record};
use crate::nanochaos::k8s::event::{
    record_chaos_event, EVENT_TYPE_NORMAL, REASON_CHAOS_INJECTED, REASON_CHAOS_RECOVERED,
};
use crate::nanochaos::logger::log_info;
use crate::nanochaos::selector::select_and_filter_pods;
use crate::nanochaos::util::error::new_error;

use async_trait::async_trait;
use std::error::Error;

type DynError = Box<dyn Error + Send + Sync>;

const COMPONENT: &str = "kernelchaos";
const KERNEL_CHAOS_MSG: &str = "kernel is injected with %v";

pub struct KernelChaosInjector;

#[async_trait]
impl KindInjector<KernelChaosSpec> for KernelChaosInjector {
    async fn apply(
        &self,
        ctx: &ControllerContext,
        chaos: &mut ChaosObject<KernelChaosSpec>,
    ) -> Result<(), DynError> {
        let pods = select_and_filter_pods(chaos.namespace(), &chaos.spec, &ctx.cfg)?;

        for pod in &pods {
            chaos.insert_finalizer(&pod.key());
        }

        for pod in &pods {
            let container_id = pod.first_container_id().ok_or_else(|| {
                new_error(format!("{} can't get the state of container", pod.key()))
            })?;
            let node_ip = pod
                .host_ip()
                .ok_or_else(|| new_error(format!("pod {} has no host IP yet", pod.key())))?
                .to_string();

            // The daemon resolves the PID; the fault itself is attached by
            // the BPFKI service on the same node.
            let client = ctx.daemon.client_for(pod).await?;
            let pid = client.container_get_pid(container_id).await?;
            log_info(
                COMPONENT,
                "injecting kernel fault",
                &[("pod", &pod.key()), ("pid", &pid.to_string())],
            );
            ctx.kernel
                .fail_kernel(&node_ip, pid, &chaos.spec.fail_kern_request)
                .await?;
        }

        chaos.status.experiment.pod_records = pods
            .iter()
            .map(|pod| {
                pod_record(
                    pod,
                    &chaos.spec,
                    KERNEL_CHAOS_MSG.replace(
                        "%v",
                        &format!("{:?}", chaos.spec.fail_kern_request.fail_type),
                    ),
                )
            })
            .collect();

        record_chaos_event(
            KIND_KERNEL_CHAOS,
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
        chaos: &mut ChaosObject<KernelChaosSpec>,
    ) -> Result<(), DynError> {
        let request = chaos.spec.fail_kern_request.clone();
        let daemon = ctx.daemon.clone();
        let kernel = ctx.kernel.clone();

        clean_finalizers_and_recover(chaos, |pod| {
            let request = request.clone();
            let daemon = daemon.clone();
            let kernel = kernel.clone();
            async move {
                let container_id = pod.first_container_id().ok_or_else(|| {
                    new_error(format!("{} can't get the state of container", pod.key()))
                })?;
                let node_ip = pod
                    .host_ip()
                    .ok_or_else(|| new_error(format!("pod {} has no host IP yet", pod.key())))?
                    .to_string();

                let client = daemon.client_for(&pod).await?;
                let pid = client.container_get_pid(container_id).await?;
                kernel.recover_kernel(&node_ip, pid, &request).await
            }
        })
        .await?;

        record_chaos_event(
            KIND_KERNEL_CHAOS,
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
