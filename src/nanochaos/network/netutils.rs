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

use crate::nanochaos::util::error::with_context;

use sha1::{Digest, Sha1};
use std::error::Error;
use std::net::IpAddr;

/// Converts an IP to a full-mask CIDR. IPv4 only, matching the injection
/// path.
pub fn ip_to_cidr(ip: &str) -> String {
    format!("{}/32", ip)
}

/// Resolves a literal CIDR, IP or hostname into a CIDR. Hostnames are
/// resolved once at the controller; the first address wins.
pub async fn resolve_cidr(name: &str) -> Result<String, Box<dyn Error + Send + Sync>> {
    if let Some((addr, prefix)) = name.split_once('/') {
        let addr = addr
            .parse::<IpAddr>()
            .map_err(|e| with_context(e, format!("Invalid CIDR '{}'", name)))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|e| with_context(e, format!("Invalid prefix length in '{}'", name)))?;
        return Ok(format!("{}/{}", addr, prefix));
    }

    if name.parse::<IpAddr>().is_ok() {
        return Ok(ip_to_cidr(name));
    }

    let mut addrs = tokio::net::lookup_host(format!("{}:0", name))
        .await
        .map_err(|e| with_context(e, format!("Failed to resolve '{}'", name)))?;
    let addr = addrs
        .next()
        .ok_or_else(|| {
            crate::nanochaos::util::error::new_error(format!("'{}' resolved to no address", name))
        })?
        .ip();
    Ok(ip_to_cidr(&addr.to_string()))
}

/// Resolves every external target into a CIDR.
pub async fn resolve_cidrs(names: &[String]) -> Result<Vec<String>, Box<dyn Error + Send + Sync>> {
    let mut cidrs = Vec::with_capacity(names.len());
    for name in names {
        cidrs.push(resolve_cidr(name).await?);
    }
    Ok(cidrs)
}

/// Compresses a chaos resource name into at most `target_length` bytes
/// plus an optional postfix. Names that do not fit are truncated to
/// `target_length - 6` bytes and tagged with five hash characters of the
/// removed rest, so distinct long names stay distinct.
pub fn compress_name(original: &str, target_length: usize, postfix: &str) -> String {
    let mut name = original.to_string();
    if original.len() > target_length.saturating_sub(6) {
        let split = target_length.saturating_sub(6);
        let (prefix, rest) = original.split_at(split);
        let mut hasher = Sha1::new();
        hasher.update(rest.as_bytes());
        let digest = hex::encode(hasher.finalize());
        name = format!("{}_{}", prefix, &digest[..5]);
    }

    if postfix.is_empty() {
        name
    } else {
        format!("{}_{}", name, postfix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_names_pass_through() {
        assert_eq!(compress_name("demo", 27, "src"), "demo_src");
        assert_eq!(compress_name("demo", 21, ""), "demo");
    }

    #[test]
    fn long_names_are_truncated_and_tagged() {
        let long = "a-very-long-network-chaos-resource-name";
        let compressed = compress_name(long, 27, "tgt");
        assert!(compressed.len() <= 27 + 4, "{compressed}");
        assert!(compressed.starts_with("a-very-long-network-c_"), "{compressed}");
        assert!(compressed.ends_with("_tgt"), "{compressed}");

        // Distinct tails produce distinct tags.
        let other = compress_name("a-very-long-network-chaos-resource-other", 27, "tgt");
        assert_ne!(compressed, other);

        // Equal inputs are deterministic.
        assert_eq!(compressed, compress_name(long, 27, "tgt"));
    }

    #[tokio::test]
    async fn literal_addresses_resolve_without_dns() {
        assert_eq!(resolve_cidr("10.0.0.5").await.expect("ip"), "10.0.0.5/32");
        assert_eq!(
            resolve_cidr("10.1.0.0/24").await.expect("cidr"),
            "10.1.0.0/24"
        );
        assert!(resolve_cidr("10.1.0.0/not-a-prefix").await.is_err());
    }
}
