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

use crate::nanochaos::chaos::podnetworkchaos::{ChainDirection, RawIptables};
use crate::nanochaos::network::netutils::compress_name;

/// Child chains are named `INPUT/<name>` or `OUTPUT/<name>`; the budgets
/// keep the full chain name within iptables' 28-byte limit.
const INPUT_CHAIN_NAME_LENGTH: usize = 21;
const OUTPUT_CHAIN_NAME_LENGTH: usize = 20;

/// Derives the aggregate child-chain name for a chaos resource.
pub fn generate_chain_name(direction: ChainDirection, chaos_name: &str) -> String {
    match direction {
        ChainDirection::Input => {
            format!(
                "INPUT/{}",
                compress_name(chaos_name, INPUT_CHAIN_NAME_LENGTH, "")
            )
        }
        ChainDirection::Output => {
            format!(
                "OUTPUT/{}",
                compress_name(chaos_name, OUTPUT_CHAIN_NAME_LENGTH, "")
            )
        }
    }
}

/// Builds a drop chain matching the given ipsets in one direction.
pub fn build_chain(
    direction: ChainDirection,
    chaos_name: &str,
    ipsets: Vec<String>,
    source: &str,
) -> RawIptables {
    RawIptables {
        name: generate_chain_name(direction, chaos_name),
        direction,
        ipsets,
        source: source.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_names_carry_direction_prefix() {
        assert_eq!(
            generate_chain_name(ChainDirection::Input, "partition-demo"),
            "INPUT/partition-demo"
        );
        assert_eq!(
            generate_chain_name(ChainDirection::Output, "partition-demo"),
            "OUTPUT/partition-demo"
        );
    }

    #[test]
    fn long_chain_names_fit_the_iptables_limit() {
        let name = generate_chain_name(
            ChainDirection::Input,
            "an-extremely-long-network-chaos-name",
        );
        assert!(name.len() <= 28, "{name} is {} bytes", name.len());

        let output = generate_chain_name(
            ChainDirection::Output,
            "an-extremely-long-network-chaos-name",
        );
        assert!(output.len() <= 28, "{output} is {} bytes", output.len());
    }

    #[test]
    fn chains_record_their_ipsets_and_source() {
        let chain = build_chain(
            ChainDirection::Output,
            "partition-demo",
            vec!["partition-demo_tgt".to_string()],
            "default/partition-demo",
        );
        assert_eq!(chain.direction, ChainDirection::Output);
        assert_eq!(chain.ipsets, vec!["partition-demo_tgt"]);
        assert_eq!(chain.source, "default/partition-demo");
    }
}
