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

//! Translation from declarative tc parameters to the daemon's wire types.
//! Emulation primitives merge additively into one netem qdisc; the daemon
//! renders the argument string.

use crate::nanochaos::chaos::networkchaos::{BandwidthSpec, TcParameter};
use crate::nanochaos::pb;
use crate::nanochaos::util::error::{new_error, with_context};
use crate::nanochaos::util::parse_signed_duration;

use std::error::Error;

type DynError = Box<dyn Error + Send + Sync>;

/// Parses a latency string into netem's microsecond unit.
fn parse_latency_us(text: &str) -> Result<u32, DynError> {
    let (negative, duration) = parse_signed_duration(text)?;
    if negative {
        return Err(new_error(format!(
            "netem durations must not be negative: '{}'",
            text
        )));
    }
    u32::try_from(duration.as_micros())
        .map_err(|e| with_context(e, format!("netem duration '{}' is out of range", text)))
}

fn parse_percent(text: &str) -> Result<f32, DynError> {
    let value: f32 = text
        .parse()
        .map_err(|e| with_context(e, format!("Invalid percentage '{}'", text)))?;
    if !(0.0..=100.0).contains(&value) {
        return Err(new_error(format!(
            "percentage '{}' must be within 0..=100",
            text
        )));
    }
    Ok(value)
}

fn parse_correlation(text: &str) -> Result<f32, DynError> {
    if text.is_empty() {
        return Ok(0.0);
    }
    parse_percent(text)
}

/// Rate strings use `bps` (bytes per second) with binary `k`/`m`/`g`/`t`
/// multipliers, matching the tc convention.
pub fn parse_rate(text: &str) -> Result<u64, DynError> {
    let trimmed = text.trim().to_lowercase();
    let (number, multiplier) = if let Some(number) = trimmed.strip_suffix("tbps") {
        (number, 1u64 << 40)
    } else if let Some(number) = trimmed.strip_suffix("gbps") {
        (number, 1u64 << 30)
    } else if let Some(number) = trimmed.strip_suffix("mbps") {
        (number, 1u64 << 20)
    } else if let Some(number) = trimmed.strip_suffix("kbps") {
        (number, 1u64 << 10)
    } else if let Some(number) = trimmed.strip_suffix("bps") {
        (number, 1)
    } else {
        return Err(new_error(format!(
            "Invalid rate '{}': expected a bps/kbps/mbps/gbps/tbps suffix",
            text
        )));
    };

    let value: u64 = number
        .trim()
        .parse()
        .map_err(|e| with_context(e, format!("Invalid rate '{}'", text)))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| new_error(format!("Rate '{}' overflows", text)))
}

/// Merges every present emulation primitive into one netem message.
pub fn merge_netem(parameter: &TcParameter) -> Result<pb::Netem, DynError> {
    if !parameter.has_netem() {
        return Err(new_error(
            "invalid spec for netem action, at least one is required from delay, loss, duplicate, corrupt",
        ));
    }

    let mut netem = pb::Netem::default();

    if let Some(delay) = &parameter.delay {
        netem.time = parse_latency_us(&delay.latency)?;
        if !delay.jitter.is_empty() {
            netem.jitter = parse_latency_us(&delay.jitter)?;
        }
        netem.delay_corr = parse_correlation(&delay.correlation)?;
        if let Some(reorder) = &delay.reorder {
            netem.reorder = parse_percent(&reorder.reorder)?;
            netem.reorder_corr = parse_correlation(&reorder.correlation)?;
            netem.gap = reorder.gap;
        }
    }

    if let Some(loss) = &parameter.loss {
        netem.loss = parse_percent(&loss.loss)?;
        netem.loss_corr = parse_correlation(&loss.correlation)?;
    }

    if let Some(duplicate) = &parameter.duplicate {
        netem.duplicate = parse_percent(&duplicate.duplicate)?;
        netem.duplicate_corr = parse_correlation(&duplicate.correlation)?;
    }

    if let Some(corrupt) = &parameter.corrupt {
        netem.corrupt = parse_percent(&corrupt.corrupt)?;
        netem.corrupt_corr = parse_correlation(&corrupt.correlation)?;
    }

    Ok(netem)
}

pub fn to_tbf(bandwidth: &BandwidthSpec) -> Result<pb::Tbf, DynError> {
    Ok(pb::Tbf {
        rate: parse_rate(&bandwidth.rate)?,
        limit: bandwidth.limit,
        buffer: bandwidth.buffer,
        peak_rate: bandwidth.peakrate.unwrap_or(0),
        min_burst: bandwidth.minburst.unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nanochaos::chaos::networkchaos::{
        CorruptSpec, DelaySpec, DuplicateSpec, LossSpec, ReorderSpec,
    };

    #[test]
    fn rates_scale_binary() {
        assert_eq!(parse_rate("10bps").expect("bps"), 10);
        assert_eq!(parse_rate("1kbps").expect("kbps"), 1024);
        assert_eq!(parse_rate("1mbps").expect("mbps"), 1 << 20);
        assert_eq!(parse_rate("2gbps").expect("gbps"), 2u64 << 30);
        assert!(parse_rate("fast").is_err());
        assert!(parse_rate("10").is_err());
    }

    #[test]
    fn all_primitives_merge_into_one_netem() {
        let parameter = TcParameter {
            delay: Some(DelaySpec {
                latency: "200ms".to_string(),
                jitter: "10ms".to_string(),
                correlation: "25".to_string(),
                reorder: Some(ReorderSpec {
                    reorder: "5".to_string(),
                    correlation: "50".to_string(),
                    gap: 3,
                }),
            }),
            loss: Some(LossSpec {
                loss: "1.5".to_string(),
                correlation: String::new(),
            }),
            duplicate: Some(DuplicateSpec {
                duplicate: "2".to_string(),
                correlation: String::new(),
            }),
            corrupt: Some(CorruptSpec {
                corrupt: "0.5".to_string(),
                correlation: String::new(),
            }),
            bandwidth: None,
        };

        let netem = merge_netem(&parameter).expect("merge");
        assert_eq!(netem.time, 200_000);
        assert_eq!(netem.jitter, 10_000);
        assert_eq!(netem.delay_corr, 25.0);
        assert_eq!(netem.reorder, 5.0);
        assert_eq!(netem.gap, 3);
        assert_eq!(netem.loss, 1.5);
        assert_eq!(netem.duplicate, 2.0);
        assert_eq!(netem.corrupt, 0.5);
    }

    #[test]
    fn negative_latency_is_rejected() {
        let parameter = TcParameter {
            delay: Some(DelaySpec {
                latency: "-10ms".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(merge_netem(&parameter).is_err());
    }

    #[test]
    fn empty_parameter_is_rejected() {
        assert!(merge_netem(&TcParameter::default()).is_err());
    }

    #[test]
    fn tbf_carries_peakrate_pair() {
        let tbf = to_tbf(&BandwidthSpec {
            rate: "1mbps".to_string(),
            limit: 20_971_520,
            buffer: 10_000,
            peakrate: Some(2 << 20),
            minburst: Some(1600),
        })
        .expect("tbf");
        assert_eq!(tbf.rate, 1 << 20);
        assert_eq!(tbf.peak_rate, 2 << 20);
        assert_eq!(tbf.min_burst, 1600);
    }
}
