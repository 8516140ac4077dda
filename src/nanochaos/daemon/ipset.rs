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

//! ipset materialization: each set is rebuilt in a scratch set and swapped
//! in atomically, so concurrent packet matching never observes a
//! half-filled set.

use crate::nanochaos::daemon::exec::{CommandRunner, NsKind};
use crate::nanochaos::pb;

use std::error::Error;

type DynError = Box<dyn Error + Send + Sync>;

const IPSET_EXIST_ERR: &str = "set with the same name already exists";
const IP_EXIST_ERR: &str = "it's already added";

pub struct IpsetClient<'a> {
    runner: &'a CommandRunner,
    ns_path: String,
}

impl<'a> IpsetClient<'a> {
    pub fn new(runner: &'a CommandRunner, ns_path: &str) -> Self {
        Self {
            runner,
            ns_path: ns_path.to_string(),
        }
    }

    fn ipset(&self, args: &[String]) -> Result<crate::nanochaos::daemon::exec::CommandResult, DynError> {
        self.runner
            .run_in_ns(NsKind::Net, &self.ns_path, "ipset", args)
    }

    /// Creates a `hash:net` set, flushing instead when it already exists.
    fn create_or_flush(&self, name: &str) -> Result<(), DynError> {
        let result = self.ipset(&[
            "create".to_string(),
            name.to_string(),
            "hash:net".to_string(),
        ])?;
        if result.success {
            return Ok(());
        }
        if result.output.contains(IPSET_EXIST_ERR) {
            return self
                .ipset(&["flush".to_string(), name.to_string()])?
                .ensure_success(&format!("failed to flush existing ipset {}", name));
        }
        result.ensure_success(&format!("failed to create ipset {}", name))
    }

    fn add_cidrs(&self, name: &str, cidrs: &[String]) -> Result<(), DynError> {
        for cidr in cidrs {
            let result = self.ipset(&["add".to_string(), name.to_string(), cidr.clone()])?;
            if !result.success && !result.output.contains(IP_EXIST_ERR) {
                return result.ensure_success(&format!("failed to add {} to ipset {}", cidr, name));
            }
        }
        Ok(())
    }

    /// Atomic create-or-swap for every requested set.
    pub fn flush_ipsets(&self, ipsets: &[pb::IpSet]) -> Result<(), DynError> {
        for ipset in ipsets {
            let scratch = format!("{}_tmp", ipset.name);

            self.create_or_flush(&scratch)?;
            self.add_cidrs(&scratch, &ipset.cidrs)?;
            self.create_or_flush(&ipset.name)?;
            self.ipset(&[
                "swap".to_string(),
                scratch.clone(),
                ipset.name.clone(),
            ])?
            .ensure_success(&format!("failed to swap ipset {}", ipset.name))?;
            self.ipset(&["destroy".to_string(), scratch.clone()])?
                .ensure_success(&format!("failed to destroy scratch ipset {}", scratch))?;
        }
        Ok(())
    }
}
