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

use crate::nanochaos::chaos::podnetworkchaos::RawIpset;
use crate::nanochaos::k8s::pod::Pod;
use crate::nanochaos::network::netutils::{compress_name, ip_to_cidr};

/// ipset names fit the kernel's 31-byte limit with room for the postfix.
const IPSET_NAME_LENGTH: usize = 27;

pub const SOURCE_IPSET_POSTFIX: &str = "src";
pub const TARGET_IPSET_POSTFIX: &str = "tgt";

/// Derives the deterministic ipset name for a chaos resource: the
/// compressed name plus the postfix never exceeds the 27-byte budget.
pub fn generate_ipset_name(chaos_name: &str, postfix: &str) -> String {
    let budget = IPSET_NAME_LENGTH.saturating_sub(postfix.len() + 1);
    compress_name(chaos_name, budget, postfix)
}

/// Builds an ipset record from pod IPs plus pre-resolved external CIDRs.
pub fn build_ipset(
    pods: &[Pod],
    external_cidrs: Vec<String>,
    chaos_name: &str,
    postfix: &str,
    source: &str,
) -> RawIpset {
    let mut cidrs = external_cidrs;
    for pod in pods {
        if let Some(ip) = pod.pod_ip() {
            if !ip.is_empty() {
                cidrs.push(ip_to_cidr(ip));
            }
        }
    }

    RawIpset {
        name: generate_ipset_name(chaos_name, postfix),
        cidrs,
        source: source.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nanochaos::k8s::pod::{ObjectMeta, Pod, PodSpec, PodStatus};

    fn pod_with_ip(name: &str, ip: Option<&str>) -> Pod {
        let mut pod = Pod::new(
            ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            PodSpec::default(),
        );
        pod.status = Some(PodStatus {
            pod_ip: ip.map(|ip| ip.to_string()),
            ..Default::default()
        });
        pod
    }

    #[test]
    fn ipset_collects_pod_ips_after_externals() {
        let pods = vec![
            pod_with_ip("web-0", Some("10.0.0.5")),
            pod_with_ip("web-1", None),
            pod_with_ip("web-2", Some("10.0.0.7")),
        ];
        let ipset = build_ipset(
            &pods,
            vec!["10.1.0.0/24".to_string()],
            "partition-demo",
            TARGET_IPSET_POSTFIX,
            "default/partition-demo",
        );
        assert_eq!(ipset.name, "partition-demo_tgt");
        assert_eq!(
            ipset.cidrs,
            vec!["10.1.0.0/24", "10.0.0.5/32", "10.0.0.7/32"]
        );
        assert_eq!(ipset.source, "default/partition-demo");
    }

    #[test]
    fn ipset_names_stay_within_the_kernel_limit() {
        let name = generate_ipset_name(
            "an-extremely-long-chaos-resource-name-for-netem",
            "netem",
        );
        assert!(name.len() <= 31, "{name} is {} bytes", name.len());
    }
}
