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

pub mod error;
pub mod keyspace;

pub use keyspace::{
    is_missing_value_error, Keyspace, KeyspaceEvent, KeyspaceEventType, KeyspaceWatchStream,
};

use std::error::Error;
use std::time::Duration;

/// Parses a duration that may carry a sign prefix (`-1h`, `+30m`, `300ms`).
/// Plain durations go through humantime unchanged.
pub fn parse_signed_duration(input: &str) -> Result<(bool, Duration), Box<dyn Error + Send + Sync>> {
    let trimmed = input.trim();
    let (negative, rest) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let duration = humantime::parse_duration(rest)
        .map_err(|e| error::with_context(e, format!("Invalid duration '{}'", input)))?;
    Ok((negative, duration))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_durations_parse_both_ways() {
        let (neg, d) = parse_signed_duration("-1h").expect("negative");
        assert!(neg);
        assert_eq!(d, Duration::from_secs(3600));

        let (neg, d) = parse_signed_duration("90s").expect("plain");
        assert!(!neg);
        assert_eq!(d, Duration::from_secs(90));

        let (neg, d) = parse_signed_duration("+250ms").expect("positive");
        assert!(!neg);
        assert_eq!(d, Duration::from_millis(250));

        assert!(parse_signed_duration("soon").is_err());
    }
}
