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

//! Network chaos never talks to the node agent directly: every action is
//! rewritten into per-pod aggregate intents and committed through the
//! pod-network manager; the aggregate watcher materializes the result.

use crate::nanochaos::chaos::networkchaos::{
    Direction, NetworkChaosAction, NetworkChaosSpec, TcParameter,
};
use crate::nanochaos::chaos::object::ChaosObject;
use crate::nanochaos::chaos::podnetworkchaos::{ChainDirection, RawTrafficControl, TcType};
use crate::nanochaos::chaos::KIND_NETWORK_CHAOS;
use crate::nanochaos::controller::twophase::KindInjector;
use crate::nanochaos::controller::ControllerContext;
use crate::nanochaos::injector::{pod_record, split_finalizer_key};
use crate::nanochaos::k8s::event::{
    record_chaos_event, EVENT_TYPE_NORMAL, REASON_CHAOS_INJECTED, REASON_CHAOS_RECOVERED,
};
use crate::nanochaos::k8s::pod::Pod;
use crate::nanochaos::logger::log_info;
use crate::nanochaos::network::ipset::{
    build_ipset, SOURCE_IPSET_POSTFIX, TARGET_IPSET_POSTFIX,
};
use crate::nanochaos::network::iptables::build_chain;
use crate::nanochaos::network::manager::PodNetworkManager;
use crate::nanochaos::network::netutils::resolve_cidrs;
use crate::nanochaos::selector::{select_and_filter_pods, select_target_pods};
use crate::nanochaos::util::error::{new_error, ErrorList};

use async_trait::async_trait;
use std::error::Error;

type DynError = Box<dyn Error + Send + Sync>;

const COMPONENT: &str = "networkchaos";
const NETWORK_TC_MSG: &str = "network traffic control action duration %s";
const NETWORK_PARTITION_MSG: &str = "partition network duration %s";

pub struct NetworkChaosInjector;

#[async_trait]
impl KindInjector<NetworkChaosSpec> for NetworkChaosInjector {
    async fn apply(
        &self,
        ctx: &ControllerContext,
        chaos: &mut ChaosObject<NetworkChaosSpec>,
    ) -> Result<(), DynError> {
        let action = chaos
            .spec
            .action
            .ok_or_else(|| new_error("action is required for NetworkChaos"))?;

        let sources = select_and_filter_pods(chaos.namespace(), &chaos.spec, &ctx.cfg)?;
        let targets = match &chaos.spec.target {
            Some(target) => select_target_pods(
                chaos.namespace(),
                &target.selector,
                target.mode,
                target.value.as_deref(),
                &ctx.cfg,
            )?,
            None => Vec::new(),
        };
        let external_cidrs = resolve_cidrs(&chaos.spec.external_targets).await?;

        let mut manager = PodNetworkManager::new(chaos.source_key());
        let recorded: Vec<Pod> = sources.iter().chain(targets.iter()).cloned().collect();

        if action == NetworkChaosAction::Partition {
            apply_partition(&mut manager, chaos, &sources, &targets, external_cidrs)?;
        } else {
            apply_traffic_control(
                &mut manager,
                chaos,
                action,
                &sources,
                &targets,
                external_cidrs,
            )?;
        }

        manager.commit().await?;

        let message_template = if action == NetworkChaosAction::Partition {
            NETWORK_PARTITION_MSG
        } else {
            NETWORK_TC_MSG
        };
        chaos.status.experiment.pod_records = recorded
            .iter()
            .map(|pod| {
                let message = chaos
                    .spec
                    .duration
                    .as_deref()
                    .map(|duration| message_template.replace("%s", duration))
                    .unwrap_or_default();
                pod_record(pod, &chaos.spec, message)
            })
            .collect();

        record_chaos_event(
            KIND_NETWORK_CHAOS,
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
        chaos: &mut ChaosObject<NetworkChaosSpec>,
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

            // An empty transaction drops every record this source owns on
            // that pod; records from concurrent chaos stay behind.
            let mut manager = PodNetworkManager::new(chaos.source_key());
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
            KIND_NETWORK_CHAOS,
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

/// Traffic-control actions install qdiscs on the side chosen by
/// `direction`; with targets or external CIDRs the qdisc is steered by a
/// destination ipset, otherwise it shapes all egress traffic.
fn apply_traffic_control(
    manager: &mut PodNetworkManager,
    chaos: &mut ChaosObject<NetworkChaosSpec>,
    action: NetworkChaosAction,
    sources: &[Pod],
    targets: &[Pod],
    external_cidrs: Vec<String>,
) -> Result<(), DynError> {
    let tc_type = if action == NetworkChaosAction::Bandwidth {
        TcType::Bandwidth
    } else {
        TcType::Netem
    };

    match chaos.spec.direction {
        Direction::To => {
            install_tc(manager, chaos, tc_type, sources, targets, external_cidrs)
        }
        Direction::From => install_tc(manager, chaos, tc_type, targets, sources, Vec::new()),
        Direction::Both => {
            let union: Vec<Pod> = sources.iter().chain(targets.iter()).cloned().collect();
            install_tc(manager, chaos, tc_type, &union, &union, external_cidrs)
        }
    }
}

fn install_tc(
    manager: &mut PodNetworkManager,
    chaos: &mut ChaosObject<NetworkChaosSpec>,
    tc_type: TcType,
    shaped: &[Pod],
    destinations: &[Pod],
    external_cidrs: Vec<String>,
) -> Result<(), DynError> {
    for pod in shaped {
        chaos.insert_finalizer(&pod.key());
    }

    let parameter = strip_foreign_parameters(&chaos.spec.tc_parameter, tc_type);

    if destinations.is_empty() && external_cidrs.is_empty() {
        log_info(
            COMPONENT,
            "applying traffic control on all egress traffic",
            &[("chaos", &chaos.source_key())],
        );
        for pod in shaped {
            manager
                .with_init(pod.namespace(), pod.name())
                .append_tc(RawTrafficControl {
                    tc_type,
                    parameter: parameter.clone(),
                    ipset_name: None,
                    source: chaos.source_key(),
                });
        }
        return Ok(());
    }

    let postfix = tc_type_postfix(tc_type);
    let dst_ipset = build_ipset(
        destinations,
        external_cidrs,
        chaos.name(),
        postfix,
        &chaos.source_key(),
    );
    log_info(
        COMPONENT,
        "applying traffic control with filter",
        &[("chaos", &chaos.source_key()), ("ipset", &dst_ipset.name)],
    );

    for pod in shaped {
        let transaction = manager.with_init(pod.namespace(), pod.name());
        transaction.append_ipset(dst_ipset.clone());
        transaction.append_tc(RawTrafficControl {
            tc_type,
            parameter: parameter.clone(),
            ipset_name: Some(dst_ipset.name.clone()),
            source: chaos.source_key(),
        });
    }
    Ok(())
}

/// Keeps only the parameters the qdisc type consumes, so a netem record
/// never smuggles tbf settings and vice versa.
fn strip_foreign_parameters(parameter: &TcParameter, tc_type: TcType) -> TcParameter {
    let mut cleaned = parameter.clone();
    match tc_type {
        TcType::Netem => cleaned.bandwidth = None,
        TcType::Bandwidth => {
            cleaned.delay = None;
            cleaned.loss = None;
            cleaned.duplicate = None;
            cleaned.corrupt = None;
        }
    }
    cleaned
}

/// The five-character type tag used in the filter ipset name.
fn tc_type_postfix(tc_type: TcType) -> &'static str {
    match tc_type {
        TcType::Netem => "netem",
        TcType::Bandwidth => "bandw",
    }
}

/// Partition produces only filter chains: both sides get the two ipsets,
/// and DROP chains are installed according to the direction.
fn apply_partition(
    manager: &mut PodNetworkManager,
    chaos: &mut ChaosObject<NetworkChaosSpec>,
    sources: &[Pod],
    targets: &[Pod],
    external_cidrs: Vec<String>,
) -> Result<(), DynError> {
    let source_set = build_ipset(
        sources,
        Vec::new(),
        chaos.name(),
        SOURCE_IPSET_POSTFIX,
        &chaos.source_key(),
    );
    let target_set = build_ipset(
        targets,
        external_cidrs,
        chaos.name(),
        TARGET_IPSET_POSTFIX,
        &chaos.source_key(),
    );

    for pod in sources.iter().chain(targets.iter()) {
        chaos.insert_finalizer(&pod.key());
        let transaction = manager.with_init(pod.namespace(), pod.name());
        transaction.append_ipset(source_set.clone());
        transaction.append_ipset(target_set.clone());
    }

    let direction = chaos.spec.direction;
    if matches!(direction, Direction::To | Direction::Both) {
        for pod in sources {
            manager.with_init(pod.namespace(), pod.name()).append_chain(build_chain(
                ChainDirection::Output,
                chaos.name(),
                vec![target_set.name.clone()],
                &chaos.source_key(),
            ));
        }
        for pod in targets {
            manager.with_init(pod.namespace(), pod.name()).append_chain(build_chain(
                ChainDirection::Input,
                chaos.name(),
                vec![source_set.name.clone()],
                &chaos.source_key(),
            ));
        }
    }

    if matches!(direction, Direction::From | Direction::Both) {
        for pod in sources {
            manager.with_init(pod.namespace(), pod.name()).append_chain(build_chain(
                ChainDirection::Input,
                chaos.name(),
                vec![target_set.name.clone()],
                &chaos.source_key(),
            ));
        }
        for pod in targets {
            manager.with_init(pod.namespace(), pod.name()).append_chain(build_chain(
                ChainDirection::Output,
                chaos.name(),
                vec![source_set.name.clone()],
                &chaos.source_key(),
            ));
        }
    }

    Ok(())
}
