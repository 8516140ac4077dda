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

//! Forwarding of filesystem fault actions to the chaosfs sidecar. The
//! sidecar listens on a well-known port inside the pod; the agent resolves
//! the pod IP from the container's net namespace and replaces the fault
//! map atomically with one request.

use crate::nanochaos::daemon::exec::{CommandRunner, NsKind};
use crate::nanochaos::util::error::{new_error, with_context};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::time::Duration;

type DynError = Box<dyn Error + Send + Sync>;

/// Port the chaosfs sidecar listens on inside the pod.
const SIDECAR_PORT: u16 = 65534;
const SIDECAR_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct SidecarUpdate<'a> {
    volume: &'a str,
    /// JSON-encoded action list, installed as one atomic replacement.
    actions: &'a str,
    instance: i64,
    #[serde(rename = "startTime")]
    start_time: i64,
}

#[derive(Debug, Deserialize)]
struct SidecarResponse {
    instance: i64,
    #[serde(rename = "startTime")]
    start_time: i64,
}

/// Resolves the pod's eth0 address from inside its net namespace.
pub fn resolve_pod_ip(runner: &CommandRunner, ns_path: &str) -> Result<String, DynError> {
    let result = runner.run_in_ns(
        NsKind::Net,
        ns_path,
        "ip",
        &["-j".to_string(), "addr".to_string(), "show".to_string(), "eth0".to_string()],
    )?;
    result.ensure_success("failed to inspect eth0")?;
    parse_pod_ip(&result.output)
}

fn parse_pod_ip(raw: &str) -> Result<String, DynError> {
    let links: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| with_context(e, "Failed to parse ip addr output"))?;
    links
        .as_array()
        .and_then(|links| links.first())
        .and_then(|link| link.get("addr_info"))
        .and_then(|addrs| addrs.as_array())
        .and_then(|addrs| {
            addrs
                .iter()
                .find(|addr| addr.get("family").and_then(|f| f.as_str()) == Some("inet"))
        })
        .and_then(|addr| addr.get("local"))
        .and_then(|local| local.as_str())
        .map(|ip| ip.to_string())
        .ok_or_else(|| new_error("eth0 carries no inet address"))
}

pub fn sidecar_url(pod_ip: &str) -> String {
    format!("http://{}:{}/update", pod_ip, SIDECAR_PORT)
}

/// Pushes the action list to the sidecar and returns `(instance,
/// startTime)` as reported back.
pub async fn apply_io_chaos(
    runner: &CommandRunner,
    ns_path: &str,
    volume: &str,
    actions_json: &str,
    instance: i64,
    start_time: i64,
) -> Result<(i64, i64), DynError> {
    if runner.recording() {
        // Record mode never reaches a live sidecar; log the intent the
        // same way command execution is logged.
        runner.note(&format!("chaosfs update volume={} actions={}", volume, actions_json))?;
        let start = if start_time > 0 {
            start_time
        } else {
            Utc::now().timestamp()
        };
        return Ok((instance.max(1), start));
    }

    let pod_ip = resolve_pod_ip(runner, ns_path)?;
    let update = SidecarUpdate {
        volume,
        actions: actions_json,
        instance,
        start_time,
    };

    let client = reqwest::Client::builder()
        .timeout(SIDECAR_TIMEOUT)
        .build()
        .map_err(|e| with_context(e, "Failed to build sidecar HTTP client"))?;
    let response = client
        .put(sidecar_url(&pod_ip))
        .json(&update)
        .send()
        .await
        .map_err(|e| with_context(e, "chaosfs sidecar unreachable"))?;

    if !response.status().is_success() {
        return Err(new_error(format!(
            "chaosfs sidecar rejected the update: {}",
            response.status()
        )));
    }

    let body: SidecarResponse = response
        .json()
        .await
        .map_err(|e| with_context(e, "Failed to parse sidecar response"))?;
    Ok((body.instance, body.start_time))
}
