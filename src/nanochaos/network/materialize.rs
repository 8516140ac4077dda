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

//! Materializes a pod's network aggregate into kernel state through the
//! node agent, in fixed order: ipsets, then filter chains, then the qdisc
//! tree. The daemon rebuilds the tree from scratch on every call, so the
//! whole pipeline is idempotent.

use crate::nanochaos::chaos::podnetworkchaos::{ChainDirection, PodNetworkChaos, TcType};
use crate::nanochaos::daemon::client::DaemonProvider;
use crate::nanochaos::k8s::store::get_pod;
use crate::nanochaos::logger::log_info;
use crate::nanochaos::network::netem::{merge_netem, to_tbf};
use crate::nanochaos::pb;
use crate::nanochaos::util::error::new_error;

use std::error::Error;

type DynError = Box<dyn Error + Send + Sync>;

const COMPONENT: &str = "podnetwork-materializer";

/// Pushes the aggregate's desired state down to the pod's node agent.
pub async fn apply_aggregate(
    aggregate: &PodNetworkChaos,
    provider: &dyn DaemonProvider,
) -> Result<(), DynError> {
    let namespace = aggregate.metadata.namespace.as_deref();
    let name = aggregate.metadata.name.as_deref().unwrap_or_default();

    let pod = match get_pod(namespace, name)? {
        Some(pod) => pod,
        // Pod churned away; its netns is gone and took the state with it.
        None => return Ok(()),
    };
    let container_id = pod
        .first_container_id()
        .ok_or_else(|| new_error(format!("pod {} has no container status yet", pod.key())))?
        .to_string();

    let client = provider.client_for(&pod).await?;

    let ipsets: Vec<pb::IpSet> = aggregate
        .spec
        .ipsets
        .iter()
        .map(|ipset| pb::IpSet {
            name: ipset.name.clone(),
            cidrs: ipset.cidrs.clone(),
        })
        .collect();
    client.flush_ipsets(&container_id, ipsets).await?;

    let chains: Vec<pb::Chain> = aggregate
        .spec
        .iptables
        .iter()
        .map(|chain| pb::Chain {
            name: chain.name.clone(),
            ipsets: chain.ipsets.clone(),
            direction: match chain.direction {
                ChainDirection::Input => pb::chain::Direction::Input as i32,
                ChainDirection::Output => pb::chain::Direction::Output as i32,
            },
        })
        .collect();
    client.set_iptables_chains(&container_id, chains).await?;

    let mut tcs = Vec::with_capacity(aggregate.spec.traffic_controls.len());
    for tc in &aggregate.spec.traffic_controls {
        tcs.push(to_pb_tc(tc)?);
    }
    client.set_tcs(&container_id, tcs).await?;

    log_info(
        COMPONENT,
        "materialized pod network aggregate",
        &[
            ("pod", &pod.key()),
            (
                "sources",
                &aggregate.spec.sources().join(","),
            ),
        ],
    );

    Ok(())
}

fn to_pb_tc(
    tc: &crate::nanochaos::chaos::podnetworkchaos::RawTrafficControl,
) -> Result<pb::Tc, DynError> {
    let mut message = pb::Tc {
        ipset: tc.ipset_name.clone().unwrap_or_default(),
        ..Default::default()
    };
    match tc.tc_type {
        TcType::Netem => {
            message.r#type = pb::tc::Type::Netem as i32;
            message.netem = Some(merge_netem(&tc.parameter)?);
        }
        TcType::Bandwidth => {
            message.r#type = pb::tc::Type::Bandwidth as i32;
            let bandwidth = tc
                .parameter
                .bandwidth
                .as_ref()
                .ok_or_else(|| new_error("bandwidth record carries no tbf parameters"))?;
            message.tbf = Some(to_tbf(bandwidth)?);
        }
    }
    Ok(message)
}
