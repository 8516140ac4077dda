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

use crate::support::fresh_cluster;

use nanochaos::nanochaos::chaos::networkchaos::NetworkChaosSpec;
use nanochaos::nanochaos::chaos::object::ChaosObject;
use nanochaos::nanochaos::chaos::store::{get_chaos, put_chaos};
use nanochaos::nanochaos::chaos::validation::validate_kind;
use nanochaos::nanochaos::chaos::{KIND_NETWORK_CHAOS, KIND_POD_CHAOS, KIND_TIME_CHAOS};

use serde_json::json;
use serial_test::serial;

#[test]
#[serial]
fn admitted_network_chaos_round_trips_field_for_field() {
    let _cluster = fresh_cluster();

    let spec_json = json!({
        "action": "delay",
        "mode": "fixed-percent",
        "value": "50",
        "selector": {
            "namespaces": ["default"],
            "labelSelectors": {"app": "web"},
            "podPhaseSelectors": ["Running"]
        },
        "direction": "to",
        "delay": {"latency": "200ms", "jitter": "10ms", "correlation": "25"},
        "target": {
            "selector": {"labelSelectors": {"app": "db"}},
            "mode": "all"
        },
        "externalTargets": ["10.1.0.0/24"],
        "duration": "5m",
        "scheduler": {"cron": "@every 10m"}
    });

    validate_kind(KIND_NETWORK_CHAOS, &spec_json).expect("admission accepts the spec");

    let document = json!({
        "apiVersion": "chaos-mesh.org/v1alpha1",
        "kind": "NetworkChaos",
        "metadata": {"name": "delay-demo", "namespace": "chaos-testing"},
        "spec": spec_json,
        "status": {"experiment": {}, "scheduler": {}}
    });
    let mut chaos: ChaosObject<NetworkChaosSpec> =
        serde_json::from_value(document).expect("parse admitted document");

    put_chaos(&mut chaos).expect("store");
    let read_back = get_chaos::<NetworkChaosSpec>(Some("chaos-testing"), "delay-demo")
        .expect("get")
        .expect("present");

    assert_eq!(read_back.spec, chaos.spec, "spec fields survive the store");
    assert_eq!(read_back.metadata.name, chaos.metadata.name);
    assert_eq!(
        serde_json::to_value(&read_back.spec).expect("serialize"),
        serde_json::to_value(&chaos.spec).expect("serialize"),
    );
}

#[test]
#[serial]
fn jitter_without_delay_is_rejected_at_admission() {
    let spec = json!({
        "action": "delay",
        "mode": "one",
        "selector": {},
        "delay": {"latency": "", "jitter": "0ms"}
    });
    assert!(validate_kind(KIND_NETWORK_CHAOS, &spec).is_err());
}

#[test]
#[serial]
fn scheduler_and_duration_must_come_together() {
    let missing_duration = json!({
        "action": "pod-kill",
        "mode": "one",
        "selector": {},
        "scheduler": {"cron": "@every 10s"}
    });
    assert!(validate_kind(KIND_POD_CHAOS, &missing_duration).is_err());

    let both = json!({
        "action": "pod-kill",
        "mode": "one",
        "selector": {},
        "duration": "5s",
        "scheduler": {"cron": "@every 10s"}
    });
    assert!(validate_kind(KIND_POD_CHAOS, &both).is_ok());
}

#[test]
#[serial]
fn unknown_clock_names_are_rejected() {
    let spec = json!({
        "mode": "one",
        "selector": {},
        "timeOffset": "-1h",
        "clockIds": ["CLOCK_WALL"]
    });
    assert!(validate_kind(KIND_TIME_CHAOS, &spec).is_err());
}
