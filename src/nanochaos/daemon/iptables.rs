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

//! Packet-filter chain materialization: two top-level CHAOS chains hooked
//! from INPUT/OUTPUT, one child chain per aggregate record with DROP rules
//! matching its ipsets. Child chains are flushed and rewritten on every
//! call; creation is idempotent.

use crate::nanochaos::daemon::exec::{CommandRunner, NsKind};
use crate::nanochaos::pb;
use crate::nanochaos::util::error::new_error;

use std::error::Error;

type DynError = Box<dyn Error + Send + Sync>;

const CHAIN_ALREADY_EXIST_ERR: &str = "iptables: Chain already exists.";

pub struct IptablesClient<'a> {
    runner: &'a CommandRunner,
    ns_path: String,
}

impl<'a> IptablesClient<'a> {
    pub fn new(runner: &'a CommandRunner, ns_path: &str) -> Self {
        Self {
            runner,
            ns_path: ns_path.to_string(),
        }
    }

    fn iptables(
        &self,
        args: &[String],
    ) -> Result<crate::nanochaos::daemon::exec::CommandResult, DynError> {
        self.runner
            .run_in_ns(NsKind::Net, &self.ns_path, "iptables", args)
    }

    /// Ensures the CHAOS-INPUT/CHAOS-OUTPUT chains exist and are hooked
    /// from the stock INPUT/OUTPUT chains.
    pub fn initialize_env(&self) -> Result<(), DynError> {
        for direction in ["INPUT", "OUTPUT"] {
            let chain = format!("CHAOS-{}", direction);
            self.create_chain(&chain)?;
            self.ensure_rule(direction, &format!("-A {} -j {}", direction, chain))?;
        }
        Ok(())
    }

    /// Materializes the chain tree for an aggregate's records.
    pub fn set_chains(&self, chains: &[pb::Chain]) -> Result<(), DynError> {
        self.initialize_env()?;
        for chain in chains {
            self.set_chain(chain)?;
        }
        Ok(())
    }

    fn set_chain(&self, chain: &pb::Chain) -> Result<(), DynError> {
        let match_part = if chain.direction == pb::chain::Direction::Input as i32 {
            "src"
        } else if chain.direction == pb::chain::Direction::Output as i32 {
            "dst"
        } else {
            return Err(new_error(format!(
                "unknown chain direction {}",
                chain.direction
            )));
        };

        self.create_chain(&chain.name)?;
        self.flush_chain(&chain.name)?;
        for ipset in &chain.ipsets {
            // -w 5 retries the xtables lock instead of failing under
            // concurrent writers.
            let rule = format!(
                "-A {} -m set --match-set {} {} -j DROP -w 5",
                chain.name, ipset, match_part
            );
            self.append_rule(&rule)?;
        }

        let hook = if chain.direction == pb::chain::Direction::Input as i32 {
            "CHAOS-INPUT"
        } else {
            "CHAOS-OUTPUT"
        };
        self.ensure_rule(hook, &format!("-A {} -j {}", hook, chain.name))
    }

    fn create_chain(&self, name: &str) -> Result<(), DynError> {
        let result = self.iptables(&["-N".to_string(), name.to_string()])?;
        if result.success || result.output.contains(CHAIN_ALREADY_EXIST_ERR) {
            return Ok(());
        }
        result.ensure_success(&format!("failed to create chain {}", name))
    }

    fn flush_chain(&self, name: &str) -> Result<(), DynError> {
        self.iptables(&["-F".to_string(), name.to_string()])?
            .ensure_success(&format!("failed to flush chain {}", name))
    }

    fn append_rule(&self, rule: &str) -> Result<(), DynError> {
        let args: Vec<String> = rule.split(' ').map(|part| part.to_string()).collect();
        self.iptables(&args)?
            .ensure_success(&format!("failed to append rule '{}'", rule))
    }

    /// Appends a rule only when the chain does not already carry it.
    fn ensure_rule(&self, chain: &str, rule: &str) -> Result<(), DynError> {
        let listing = self.iptables(&["-S".to_string(), chain.to_string()])?;
        listing.ensure_success(&format!("failed to list chain {}", chain))?;
        if listing.output.contains(rule) {
            return Ok(());
        }
        self.append_rule(rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nanochaos::daemon::exec::testing::RecordGuard;
    use crate::nanochaos::test_support::env_lock;
    use serial_test::serial;
    use std::fs;

    #[test]
    #[serial]
    fn chain_tree_is_materialized_in_order() {
        let _guard = env_lock().lock();
        let dir = tempfile::tempdir().expect("tempdir");
        let log_path = dir.path().join("iptables.log");
        let _record = RecordGuard::set(&log_path);

        let runner = CommandRunner::new();
        let client = IptablesClient::new(&runner, "/proc/4242/ns/net");
        client
            .set_chains(&[pb::Chain {
                name: "OUTPUT/partition-demo".to_string(),
                ipsets: vec!["partition-demo_tgt".to_string()],
                direction: pb::chain::Direction::Output as i32,
            }])
            .expect("set chains");

        let log = fs::read_to_string(&log_path).expect("read log");
        let lines: Vec<&str> = log
            .lines()
            .map(|line| {
                line.strip_prefix("nsenter --net=/proc/4242/ns/net -- ")
                    .unwrap_or(line)
            })
            .collect();

        assert_eq!(
            lines,
            vec![
                "iptables -N CHAOS-INPUT",
                "iptables -S INPUT",
                "iptables -A INPUT -j CHAOS-INPUT",
                "iptables -N CHAOS-OUTPUT",
                "iptables -S OUTPUT",
                "iptables -A OUTPUT -j CHAOS-OUTPUT",
                "iptables -N OUTPUT/partition-demo",
                "iptables -F OUTPUT/partition-demo",
                "iptables -A OUTPUT/partition-demo -m set --match-set partition-demo_tgt dst -j DROP -w 5",
                "iptables -S CHAOS-OUTPUT",
                "iptables -A CHAOS-OUTPUT -j OUTPUT/partition-demo",
            ]
        );
    }

    #[test]
    #[serial]
    fn input_chains_match_on_source() {
        let _guard = env_lock().lock();
        let dir = tempfile::tempdir().expect("tempdir");
        let log_path = dir.path().join("iptables.log");
        let _record = RecordGuard::set(&log_path);

        let runner = CommandRunner::new();
        let client = IptablesClient::new(&runner, "/proc/4242/ns/net");
        client
            .set_chains(&[pb::Chain {
                name: "INPUT/partition-demo".to_string(),
                ipsets: vec!["partition-demo_src".to_string()],
                direction: pb::chain::Direction::Input as i32,
            }])
            .expect("set chains");

        let log = fs::read_to_string(&log_path).expect("read log");
        assert!(
            log.contains("--match-set partition-demo_src src -j DROP -w 5"),
            "{log}"
        );
        assert!(log.contains("-A CHAOS-INPUT -j INPUT/partition-demo"), "{log}");
    }
}
