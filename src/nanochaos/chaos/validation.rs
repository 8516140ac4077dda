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

//! Admission-side validation. Invalid specs are rejected before a resource
//! is stored; nothing here is retried, the user gets the failure back
//! directly.

use crate::nanochaos::chaos::dnschaos::DnsChaosSpec;
use crate::nanochaos::chaos::httpchaos::HttpChaosSpec;
use crate::nanochaos::chaos::iochaos::{IoChaosAction, IoChaosSpec};
use crate::nanochaos::chaos::kernelchaos::KernelChaosSpec;
use crate::nanochaos::chaos::networkchaos::{NetworkChaosAction, NetworkChaosSpec};
use crate::nanochaos::chaos::object::ChaosSpec;
use crate::nanochaos::chaos::podchaos::{PodChaosAction, PodChaosSpec};
use crate::nanochaos::chaos::selector::PodMode;
use crate::nanochaos::chaos::stresschaos::StressChaosSpec;
use crate::nanochaos::chaos::timechaos::{encode_clock_ids, TimeChaosSpec};
use crate::nanochaos::chaos::{
    KIND_DNS_CHAOS, KIND_HTTP_CHAOS, KIND_IO_CHAOS, KIND_KERNEL_CHAOS, KIND_NETWORK_CHAOS,
    KIND_POD_CHAOS, KIND_STRESS_CHAOS, KIND_TIME_CHAOS,
};
use crate::nanochaos::scheduler::ChaosSchedule;
use crate::nanochaos::util::error::{new_error, with_context};
use crate::nanochaos::util::parse_signed_duration;

use std::error::Error;

type ValidationResult = Result<(), Box<dyn Error + Send + Sync>>;

/// Checks shared by every kind: duration/scheduler pairing, cron syntax
/// and mode/value consistency.
pub fn validate_common<S: ChaosSpec>(spec: &S) -> ValidationResult {
    match (spec.duration_text(), spec.scheduler()) {
        (Some(_), None) => {
            return Err(new_error(
                "duration and scheduler must be set together: scheduler is missing",
            ))
        }
        (None, Some(_)) => {
            return Err(new_error(
                "duration and scheduler must be set together: duration is missing",
            ))
        }
        (Some(duration), Some(scheduler)) => {
            parse_signed_duration(duration)?;
            ChaosSchedule::parse(&scheduler.cron)?;
        }
        (None, None) => {}
    }

    validate_mode_value(spec.mode(), spec.value())
}

fn validate_mode_value(mode: PodMode, value: Option<&str>) -> ValidationResult {
    if !mode.requires_value() {
        return Ok(());
    }

    let raw = value.ok_or_else(|| {
        new_error(format!("value is required when mode is '{}'", mode))
    })?;
    let parsed: i64 = raw
        .parse()
        .map_err(|e| with_context(e, format!("Invalid value '{}' for mode '{}'", raw, mode)))?;

    match mode {
        PodMode::Fixed => {
            if parsed <= 0 {
                return Err(new_error("value must be greater than 0 for mode 'fixed'"));
            }
        }
        PodMode::FixedPercent | PodMode::RandomMaxPercent => {
            if !(0..=100).contains(&parsed) {
                return Err(new_error(format!(
                    "value must be within 0..=100 for mode '{}'",
                    mode
                )));
            }
        }
        _ => {}
    }

    Ok(())
}

pub fn validate_pod_chaos(spec: &PodChaosSpec) -> ValidationResult {
    validate_common(spec)?;
    if spec.action == PodChaosAction::ContainerKill && spec.container_name.is_none() {
        return Err(new_error("containerName is required for container-kill"));
    }
    Ok(())
}

pub fn validate_network_chaos(spec: &NetworkChaosSpec) -> ValidationResult {
    validate_common(spec)?;

    let action = spec
        .action
        .ok_or_else(|| new_error("action is required for NetworkChaos"))?;

    if let Some(target) = &spec.target {
        validate_mode_value(target.mode, target.value.as_deref())?;
    }

    if action.is_netem() {
        if !spec.tc_parameter.has_netem() {
            return Err(new_error(
                "invalid spec for netem action, at least one is required from delay, loss, duplicate, corrupt",
            ));
        }
        if let Some(delay) = &spec.tc_parameter.delay {
            if delay.latency.is_empty() {
                return Err(new_error("delay.latency is required"));
            }
            parse_signed_duration(&delay.latency)?;
            if !delay.jitter.is_empty() {
                parse_signed_duration(&delay.jitter)?;
            }
        }
    }

    if action == NetworkChaosAction::Bandwidth {
        let bandwidth = spec
            .tc_parameter
            .bandwidth
            .as_ref()
            .ok_or_else(|| new_error("bandwidth block is required for the bandwidth action"))?;
        if bandwidth.rate.is_empty() {
            return Err(new_error("bandwidth.rate is required"));
        }
        crate::nanochaos::network::netem::parse_rate(&bandwidth.rate)?;
    }

    Ok(())
}

pub fn validate_time_chaos(spec: &TimeChaosSpec) -> ValidationResult {
    validate_common(spec)?;
    parse_signed_duration(&spec.time_offset)?;
    encode_clock_ids(&spec.effective_clock_ids())?;
    Ok(())
}

pub fn validate_io_chaos(spec: &IoChaosSpec) -> ValidationResult {
    validate_common(spec)?;
    if spec.volume_path.is_empty() {
        return Err(new_error("volumePath is required for IoChaos"));
    }
    if spec.percent > 100 {
        return Err(new_error("percent must be within 0..=100"));
    }
    match spec.action {
        IoChaosAction::Delay => {
            let delay = spec
                .delay
                .as_deref()
                .ok_or_else(|| new_error("delay is required for the delay action"))?;
            parse_signed_duration(delay)?;
        }
        IoChaosAction::Errno => {
            spec.errno
                .as_deref()
                .ok_or_else(|| new_error("errno is required for the errno action"))?;
        }
        IoChaosAction::Mixed => {
            let delay = spec
                .delay
                .as_deref()
                .ok_or_else(|| new_error("delay is required for the mixed action"))?;
            parse_signed_duration(delay)?;
            spec.errno
                .as_deref()
                .ok_or_else(|| new_error("errno is required for the mixed action"))?;
        }
    }
    Ok(())
}

pub fn validate_kernel_chaos(spec: &KernelChaosSpec) -> ValidationResult {
    validate_common(spec)?;
    if spec.fail_kern_request.probability > 100 {
        return Err(new_error("probability must be within 0..=100"));
    }
    if spec.fail_kern_request.callchain.is_empty() {
        return Err(new_error("callchain must carry at least one frame"));
    }
    Ok(())
}

pub fn validate_stress_chaos(spec: &StressChaosSpec) -> ValidationResult {
    validate_common(spec)?;
    spec.effective_stressors()?;
    Ok(())
}

pub fn validate_dns_chaos(spec: &DnsChaosSpec) -> ValidationResult {
    validate_common(spec)
}

pub fn validate_http_chaos(spec: &HttpChaosSpec) -> ValidationResult {
    validate_common(spec)?;
    if let Some(delay) = spec.delay.as_deref() {
        parse_signed_duration(delay)?;
    }
    Ok(())
}

/// Validates a raw spec document for the given kind; the entry point used
/// by the admission surface.
pub fn validate_kind(kind: &str, spec: &serde_json::Value) -> ValidationResult {
    match kind {
        KIND_POD_CHAOS => validate_pod_chaos(&parse_spec(kind, spec)?),
        KIND_NETWORK_CHAOS => validate_network_chaos(&parse_spec(kind, spec)?),
        KIND_TIME_CHAOS => validate_time_chaos(&parse_spec(kind, spec)?),
        KIND_IO_CHAOS => validate_io_chaos(&parse_spec(kind, spec)?),
        KIND_KERNEL_CHAOS => validate_kernel_chaos(&parse_spec(kind, spec)?),
        KIND_STRESS_CHAOS => validate_stress_chaos(&parse_spec(kind, spec)?),
        KIND_DNS_CHAOS => validate_dns_chaos(&parse_spec(kind, spec)?),
        KIND_HTTP_CHAOS => validate_http_chaos(&parse_spec(kind, spec)?),
        other => Err(new_error(format!("unknown chaos kind '{}'", other))),
    }
}

fn parse_spec<T: serde::de::DeserializeOwned>(
    kind: &str,
    spec: &serde_json::Value,
) -> Result<T, Box<dyn Error + Send + Sync>> {
    serde_json::from_value(spec.clone())
        .map_err(|e| with_context(e, format!("Failed to parse {} spec", kind)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nanochaos::chaos::networkchaos::{BandwidthSpec, DelaySpec, TcParameter};
    use crate::nanochaos::chaos::object::SchedulerSpec;
    use serde_json::json;

    #[test]
    fn duration_and_scheduler_must_pair() {
        let mut spec = PodChaosSpec {
            duration: Some("30s".to_string()),
            ..Default::default()
        };
        assert!(validate_pod_chaos(&spec).is_err());

        spec.scheduler = Some(SchedulerSpec {
            cron: "@every 1m".to_string(),
        });
        assert!(validate_pod_chaos(&spec).is_ok());

        spec.duration = None;
        assert!(validate_pod_chaos(&spec).is_err());
    }

    #[test]
    fn fixed_modes_require_sane_values() {
        let mut spec = PodChaosSpec {
            mode: PodMode::Fixed,
            ..Default::default()
        };
        assert!(validate_pod_chaos(&spec).is_err());

        spec.value = Some("3".to_string());
        assert!(validate_pod_chaos(&spec).is_ok());

        spec.mode = PodMode::FixedPercent;
        spec.value = Some("150".to_string());
        assert!(validate_pod_chaos(&spec).is_err());
    }

    #[test]
    fn container_kill_requires_container_name() {
        let spec = PodChaosSpec {
            action: PodChaosAction::ContainerKill,
            ..Default::default()
        };
        assert!(validate_pod_chaos(&spec).is_err());
    }

    #[test]
    fn netem_requires_a_primitive_and_valid_latency() {
        let mut spec = NetworkChaosSpec {
            action: Some(NetworkChaosAction::Delay),
            ..Default::default()
        };
        assert!(validate_network_chaos(&spec).is_err());

        spec.tc_parameter = TcParameter {
            delay: Some(DelaySpec {
                latency: String::new(),
                jitter: "0ms".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(
            validate_network_chaos(&spec).is_err(),
            "jitter without delay latency must be rejected"
        );

        spec.tc_parameter.delay.as_mut().unwrap().latency = "200ms".to_string();
        assert!(validate_network_chaos(&spec).is_ok());
    }

    #[test]
    fn bandwidth_requires_a_parseable_rate() {
        let mut spec = NetworkChaosSpec {
            action: Some(NetworkChaosAction::Bandwidth),
            ..Default::default()
        };
        assert!(validate_network_chaos(&spec).is_err());

        spec.tc_parameter.bandwidth = Some(BandwidthSpec {
            rate: "1mbps".to_string(),
            limit: 20971520,
            buffer: 10000,
            ..Default::default()
        });
        assert!(validate_network_chaos(&spec).is_ok());

        spec.tc_parameter.bandwidth.as_mut().unwrap().rate = "fast".to_string();
        assert!(validate_network_chaos(&spec).is_err());
    }

    #[test]
    fn validate_kind_dispatches_from_json() {
        let spec = json!({
            "action": "pod-kill",
            "mode": "one",
            "selector": {"namespaces": ["default"]}
        });
        assert!(validate_kind(KIND_POD_CHAOS, &spec).is_ok());

        let invalid = json!({
            "timeOffset": "sideways",
            "mode": "one",
            "selector": {}
        });
        assert!(validate_kind(KIND_TIME_CHAOS, &invalid).is_err());
        assert!(validate_kind("NoSuchChaos", &spec).is_err());
    }
}
