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
use crate::nanochaos::chaos::status::FaultInstance;
use crate::nanochaos::chaos::stresschaos::StressChaosSpec;
use crate::nanochaos::chaos::KIND_STRESS_CHAOS;
use crate::nanochaos::controller::twophase::KindInjector;
use crate::nanochaos::controller::ControllerContext;
use crate::nanochaos::injector::{pod_record, split_finalizer_key};
use crate::nanochaos::k8s::event::{
    record_chaos_event, EVENT_TYPE_NORMAL, REASON_CHAOS_INJECTED, REASON_CHAOS_RECOVERED,
};
use crate::nanochaos::k8s::store::get_pod;
use crate::nanochaos::logger::log_info;
use crate::nanochaos::selector::select_and_filter_pods;
use crate::nanochaos::util::error::{new_error, ErrorList};

use async_trait::async_trait;
use std::error::Error;

type DynError = Box<dyn Error + Send + Sync>;

const COMPONENT: &str = "stresschaos";

pub struct StressChaosInjector;

#[async_trait]
impl KindInjector<StressChaosSpec> for StressChaosInjector {
    async fn apply(
        &self,
        ctx: &ControllerContext,
        chaos: &mut ChaosObject<StressChaosSpec>,
    ) -> Result<(), DynError> {
        let pods = select_and_filter_pods(chaos.namespace(), &chaos.spec, &ctx.cfg)?;
        let stressors = chaos.spec.effective_stressors()?;

        for pod in &pods {
            chaos.insert_finalizer(&pod.key());
        }

        for pod in &pods {
            // A target that already carries an instance keeps it; repeated
            // Apply must not fork a second stress-ng.
            if chaos.status.instances.contains_key(&pod.key()) {
                continue;
            }

            let container_id = pod.first_container_id().ok_or_else(|| {
                new_error(format!("{} can't get the state of container", pod.key()))
            })?;

            let client = ctx.daemon.client_for(pod).await?;
            log_info(
                COMPONENT,
                "executing stressors",
                &[("pod", &pod.key()), ("stressors", &stressors)],
            );
            let (uid, start_time) = client.exec_stressors(container_id, &stressors).await?;
            chaos
                .status
                .instances
                .insert(pod.key(), FaultInstance { uid, start_time });
        }

        chaos.status.experiment.pod_records = pods
            .iter()
            .map(|pod| pod_record(pod, &chaos.spec, format!("stress-ng {}", stressors)))
            .collect();

        record_chaos_event(
            KIND_STRESS_CHAOS,
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
        chaos: &mut ChaosObject<StressChaosSpec>,
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

            let instance = match chaos.status.instances.get(&key) {
                Some(instance) => instance.clone(),
                // Nothing was started on this target; the checklist entry
                // is already clean.
                None => {
                    chaos.remove_finalizer(&key);
                    continue;
                }
            };

            let pod = match get_pod(Some(&namespace), &name) {
                Ok(Some(pod)) => pod,
                Ok(None) => {
                    chaos.status.instances.remove(&key);
                    chaos.remove_finalizer(&key);
                    continue;
                }
                Err(err) => {
                    errors.push(err);
                    continue;
                }
            };

            let cancel = async {
                let client = ctx.daemon.client_for(&pod).await?;
                client
                    .cancel_stressors(&instance.uid, instance.start_time)
                    .await
            };
            match cancel.await {
                Ok(()) => {
                    chaos.status.instances.remove(&key);
                    chaos.remove_finalizer(&key);
                }
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
            KIND_STRESS_CHAOS,
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
