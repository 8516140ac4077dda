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

use crate::nanochaos::chaos::object::{ChaosObject, ChaosSpec, SchedulerSpec};
use crate::nanochaos::chaos::selector::{PodMode, SelectorSpec};
use crate::nanochaos::chaos::KIND_TIME_CHAOS;
use crate::nanochaos::util::error::new_error;

use serde::{Deserialize, Serialize};
use std::error::Error;

/// Clock names accepted in `clockIds`, in clock-id order. The daemon
/// receives them encoded as a bit mask (`1 << id`).
const CLOCK_NAMES: &[&str] = &[
    "CLOCK_REALTIME",
    "CLOCK_MONOTONIC",
    "CLOCK_PROCESS_CPUTIME_ID",
    "CLOCK_THREAD_CPUTIME_ID",
    "CLOCK_MONOTONIC_RAW",
    "CLOCK_REALTIME_COARSE",
    "CLOCK_MONOTONIC_COARSE",
    "CLOCK_BOOTTIME",
    "CLOCK_REALTIME_ALARM",
    "CLOCK_BOOTTIME_ALARM",
    "CLOCK_SGI_CYCLE",
    "CLOCK_TAI",
];

/// Encodes a set of clock names into the daemon's clock-id bit mask.
pub fn encode_clock_ids(names: &[String]) -> Result<u64, Box<dyn Error + Send + Sync>> {
    let mut mask = 0u64;
    for name in names {
        let id = CLOCK_NAMES
            .iter()
            .position(|candidate| candidate == name)
            .ok_or_else(|| new_error(format!("Unknown clock id '{}'", name)))?;
        mask |= 1 << id;
    }
    Ok(mask)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TimeChaosSpec {
    #[serde(default)]
    pub mode: PodMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default)]
    pub selector: SelectorSpec,
    /// Signed human duration (`-1h`, `30m`) the container clocks drift by.
    #[serde(rename = "timeOffset")]
    pub time_offset: String,
    /// Clocks to skew; defaults to `[CLOCK_REALTIME]`.
    #[serde(rename = "clockIds", default, skip_serializing_if = "Vec::is_empty")]
    pub clock_ids: Vec<String>,
    /// Containers to skew; empty means every container in the pod.
    #[serde(
        rename = "containerNames",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub container_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<SchedulerSpec>,
}

impl TimeChaosSpec {
    /// Fills in the default clock set; called before Apply.
    pub fn effective_clock_ids(&self) -> Vec<String> {
        if self.clock_ids.is_empty() {
            vec!["CLOCK_REALTIME".to_string()]
        } else {
            self.clock_ids.clone()
        }
    }
}

impl ChaosSpec for TimeChaosSpec {
    const KIND: &'static str = KIND_TIME_CHAOS;

    fn selector(&self) -> &SelectorSpec {
        &self.selector
    }

    fn mode(&self) -> PodMode {
        self.mode
    }

    fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    fn duration_text(&self) -> Option<&str> {
        self.duration.as_deref()
    }

    fn scheduler(&self) -> Option<&SchedulerSpec> {
        self.scheduler.as_ref()
    }
}

pub type TimeChaos = ChaosObject<TimeChaosSpec>;
