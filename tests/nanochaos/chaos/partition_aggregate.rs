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

//! Aggregation invariant: the set of source tags on a pod's network
//! aggregate always equals the set of network chaos resources currently
//! applied to that pod, across overlapping apply/recover cycles.

use crate::support::{fresh_cluster, labels, seed_pod};

use nanochaos::nanochaos::chaos::networkchaos::{
    DelaySpec, Direction, NetworkChaosAction, NetworkChaosSpec, NetworkTarget, TcParameter,
};
use nanochaos::nanochaos::chaos::object::ChaosObject;
use nanochaos::nanochaos::chaos::podnetworkchaos::ChainDirection;
use nanochaos::nanochaos::chaos::selector::{PodMode, SelectorSpec};
use nanochaos::nanochaos::chaos::store::get_pod_network_chaos;
use nanochaos::nanochaos::controller::twophase::KindInjector;
use nanochaos::nanochaos::controller::ControllerContext;
use nanochaos::nanochaos::injector::networkchaos::NetworkChaosInjector;
use nanochaos::nanochaos::k8s::pod::ObjectMeta;

use serial_test::serial;

fn partition(name: &str, direction: Direction) -> ChaosObject<NetworkChaosSpec> {
    ChaosObject::new(
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        NetworkChaosSpec {
            action: Some(NetworkChaosAction::Partition),
            mode: PodMode::All,
            selector: SelectorSpec {
                namespaces: vec!["default".to_string()],
                label_selectors: labels(&[("partition", "0")]),
                ..Default::default()
            },
            direction,
            target: Some(Box::new(NetworkTarget {
                selector: SelectorSpec {
                    namespaces: vec!["default".to_string()],
                    label_selectors: labels(&[("partition", "1")]),
                    ..Default::default()
                },
                mode: PodMode::All,
                value: None,
            })),
            ..Default::default()
        },
    )
}

fn delay(name: &str) -> ChaosObject<NetworkChaosSpec> {
    let mut chaos = partition(name, Direction::To);
    chaos.spec.action = Some(NetworkChaosAction::Delay);
    chaos.spec.target = None;
    chaos.spec.tc_parameter = TcParameter {
        delay: Some(DelaySpec {
            latency: "200ms".to_string(),
            ..Default::default()
        }),
        ..Default::default()
    };
    chaos
}

fn seed_peers() {
    seed_pod("default", "peer-0", &[("partition", "0")], "10.0.0.10");
    seed_pod("default", "peer-1", &[("partition", "1")], "10.0.0.11");
}

#[tokio::test]
#[serial]
async fn directional_partition_flips_chain_sides() {
    let _cluster = fresh_cluster();
    seed_peers();
    let ctx = ControllerContext::new(Default::default());

    // direction=to: peer-0 drops output to peer-1, peer-1 drops input.
    let mut chaos = partition("part-demo", Direction::To);
    NetworkChaosInjector
        .apply(&ctx, &mut chaos)
        .await
        .expect("apply to");

    let (source_side, _) = get_pod_network_chaos(Some("default"), "peer-0")
        .expect("get")
        .expect("present");
    assert_eq!(source_side.spec.iptables.len(), 1);
    assert_eq!(source_side.spec.iptables[0].direction, ChainDirection::Output);

    let (target_side, _) = get_pod_network_chaos(Some("default"), "peer-1")
        .expect("get")
        .expect("present");
    assert_eq!(target_side.spec.iptables.len(), 1);
    assert_eq!(target_side.spec.iptables[0].direction, ChainDirection::Input);

    // Flip to both: four chains in total across the two pods.
    chaos.spec.direction = Direction::Both;
    NetworkChaosInjector
        .apply(&ctx, &mut chaos)
        .await
        .expect("apply both");
    let (source_side, _) = get_pod_network_chaos(Some("default"), "peer-0")
        .expect("get")
        .expect("present");
    assert_eq!(source_side.spec.iptables.len(), 2);

    // Flip to from: only the reverse path is dropped.
    chaos.spec.direction = Direction::From;
    NetworkChaosInjector
        .apply(&ctx, &mut chaos)
        .await
        .expect("apply from");
    let (source_side, _) = get_pod_network_chaos(Some("default"), "peer-0")
        .expect("get")
        .expect("present");
    assert_eq!(source_side.spec.iptables.len(), 1);
    assert_eq!(source_side.spec.iptables[0].direction, ChainDirection::Input);
}

#[tokio::test]
#[serial]
async fn aggregate_sources_track_running_chaos_exactly() {
    let _cluster = fresh_cluster();
    seed_peers();
    let ctx = ControllerContext::new(Default::default());

    let mut partition_chaos = partition("part-demo", Direction::Both);
    let mut delay_chaos = delay("delay-demo");

    NetworkChaosInjector
        .apply(&ctx, &mut partition_chaos)
        .await
        .expect("apply partition");
    NetworkChaosInjector
        .apply(&ctx, &mut delay_chaos)
        .await
        .expect("apply delay");

    let (aggregate, _) = get_pod_network_chaos(Some("default"), "peer-0")
        .expect("get")
        .expect("present");
    assert_eq!(
        aggregate.spec.sources(),
        vec!["default/delay-demo", "default/part-demo"]
    );

    NetworkChaosInjector
        .recover(&ctx, &mut partition_chaos)
        .await
        .expect("recover partition");

    let (aggregate, _) = get_pod_network_chaos(Some("default"), "peer-0")
        .expect("get")
        .expect("present");
    assert_eq!(aggregate.spec.sources(), vec!["default/delay-demo"]);
    assert!(aggregate.spec.iptables.is_empty(), "partition chains are gone");
    assert_eq!(aggregate.spec.traffic_controls.len(), 1);

    NetworkChaosInjector
        .recover(&ctx, &mut delay_chaos)
        .await
        .expect("recover delay");
    let (aggregate, _) = get_pod_network_chaos(Some("default"), "peer-0")
        .expect("get")
        .expect("present");
    assert!(aggregate.spec.is_empty(), "no running chaos, no records");
}
