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

//! Traffic-control materialization inside a container's net namespace.
//! The qdisc tree is always rebuilt from scratch: flush the root, chain
//! the unfiltered qdiscs root-to-leaf, then hang a PRIO qdisc with three
//! sfq passthrough bands plus one band per ipset-filtered qdisc.

use crate::nanochaos::daemon::exec::{CommandRunner, NsKind};
use crate::nanochaos::pb;
use crate::nanochaos::util::error::new_error;

use std::error::Error;

type DynError = Box<dyn Error + Send + Sync>;

// Kernel replies that mean "there was no qdisc to delete".
const RULE_NOT_EXIST: &str = "Cannot delete qdisc with handle of zero.";
const RULE_NOT_EXIST_LOWER_VERSION: &str = "RTNETLINK answers: No such file or directory";

const DEVICE: &str = "eth0";
const PRIOMAP: &str = "1 2 2 2 1 2 0 0 1 1 1 1 1 1 1 1";

pub struct TcClient<'a> {
    runner: &'a CommandRunner,
    ns_path: String,
}

impl<'a> TcClient<'a> {
    pub fn new(runner: &'a CommandRunner, ns_path: &str) -> Self {
        Self {
            runner,
            ns_path: ns_path.to_string(),
        }
    }

    fn tc(&self, args: Vec<String>) -> Result<crate::nanochaos::daemon::exec::CommandResult, DynError> {
        self.runner.run_in_ns(NsKind::Net, &self.ns_path, "tc", &args)
    }

    /// Deletes the root qdisc, tolerating the kernel's complaints when
    /// none is installed.
    pub fn flush(&self) -> Result<(), DynError> {
        let result = self.tc(string_args(&["qdisc", "del", "dev", DEVICE, "root"]))?;
        if !result.success
            && !result.output.contains(RULE_NOT_EXIST)
            && !result.output.contains(RULE_NOT_EXIST_LOWER_VERSION)
        {
            return result.ensure_success("failed to flush qdisc tree");
        }
        Ok(())
    }

    /// Rebuilds the whole qdisc tree from the ordered tc list.
    pub fn set_tcs(&self, tcs: &[pb::Tc]) -> Result<(), DynError> {
        self.flush()?;

        let mut global: Vec<&pb::Tc> = Vec::new();
        let mut filtered: Vec<(String, Vec<&pb::Tc>)> = Vec::new();
        for tc in tcs {
            if tc.ipset.is_empty() {
                global.push(tc);
            } else {
                match filtered.iter_mut().find(|(ipset, _)| *ipset == tc.ipset) {
                    Some((_, group)) => group.push(tc),
                    None => filtered.push((tc.ipset.clone(), vec![tc])),
                }
            }
        }

        if global.is_empty() && filtered.is_empty() {
            return Ok(());
        }

        for (index, tc) in global.iter().enumerate() {
            let parent_arg = if index == 0 {
                vec!["root".to_string()]
            } else {
                vec!["parent".to_string(), format!("{}:", index)]
            };
            let handle_arg = vec!["handle".to_string(), format!("{}:", index + 1)];
            self.add_tc(parent_arg, handle_arg, tc)?;
        }

        if filtered.is_empty() {
            return Ok(());
        }

        let parent = global.len();
        let bands = 3 + filtered.len();
        self.add_prio(parent, bands)?;

        let prio_handle = parent + 1;
        let mut current_handle = prio_handle + 3;
        for (index, (ipset, group)) in filtered.iter().enumerate() {
            for (position, tc) in group.iter().enumerate() {
                let parent_arg = if position == 0 {
                    vec![
                        "parent".to_string(),
                        format!("{}:{}", prio_handle, index + 4),
                    ]
                } else {
                    vec!["parent".to_string(), format!("{}:", current_handle)]
                };
                current_handle += 1;
                let handle_arg = vec!["handle".to_string(), format!("{}:", current_handle)];
                self.add_tc(parent_arg, handle_arg, tc)?;
            }

            self.add_filter(prio_handle, index + 4, ipset)?;
        }

        Ok(())
    }

    fn add_tc(
        &self,
        parent_arg: Vec<String>,
        handle_arg: Vec<String>,
        tc: &pb::Tc,
    ) -> Result<(), DynError> {
        match tc.r#type {
            t if t == pb::tc::Type::Netem as i32 => {
                let netem = tc
                    .netem
                    .as_ref()
                    .ok_or_else(|| new_error("netem is missing while type is NETEM"))?;
                self.add_netem(parent_arg, handle_arg, netem)
            }
            t if t == pb::tc::Type::Bandwidth as i32 => {
                let tbf = tc
                    .tbf
                    .as_ref()
                    .ok_or_else(|| new_error("tbf is missing while type is BANDWIDTH"))?;
                self.add_tbf(parent_arg, handle_arg, tbf)
            }
            other => Err(new_error(format!("unknown tc qdisc type {}", other))),
        }
    }

    fn add_netem(
        &self,
        parent_arg: Vec<String>,
        handle_arg: Vec<String>,
        netem: &pb::Netem,
    ) -> Result<(), DynError> {
        let mut args = string_args(&["qdisc", "add", "dev", DEVICE]);
        args.extend(parent_arg);
        args.extend(handle_arg);
        args.push("netem".to_string());
        args.extend(netem_to_args(netem));
        self.tc(args)?.ensure_success("failed to add netem qdisc")
    }

    fn add_tbf(
        &self,
        parent_arg: Vec<String>,
        handle_arg: Vec<String>,
        tbf: &pb::Tbf,
    ) -> Result<(), DynError> {
        let mut args = string_args(&["qdisc", "add", "dev", DEVICE]);
        args.extend(parent_arg);
        args.extend(handle_arg);
        args.push("tbf".to_string());
        args.extend(tbf_to_args(tbf));
        self.tc(args)?.ensure_success("failed to add tbf qdisc")
    }

    fn add_prio(&self, parent: usize, bands: usize) -> Result<(), DynError> {
        let mut args = string_args(&["qdisc", "add", "dev", DEVICE]);
        if parent == 0 {
            args.push("root".to_string());
        } else {
            args.push("parent".to_string());
            args.push(format!("{}:", parent));
        }
        args.push("handle".to_string());
        args.push(format!("{}:", parent + 1));
        args.push("prio".to_string());
        args.push("bands".to_string());
        args.push(bands.to_string());
        args.push("priomap".to_string());
        args.extend(PRIOMAP.split(' ').map(|part| part.to_string()));
        self.tc(args)?.ensure_success("failed to add prio qdisc")?;

        // Bands 1..=3 keep unfiltered traffic flowing through sfq.
        for band in 1..=3 {
            let args = string_args(&[
                "qdisc",
                "add",
                "dev",
                DEVICE,
                "parent",
                &format!("{}:{}", parent + 1, band),
                "handle",
                &format!("{}:", parent + 1 + band),
                "sfq",
            ]);
            self.tc(args)?.ensure_success("failed to add sfq qdisc")?;
        }

        Ok(())
    }

    fn add_filter(&self, prio_handle: usize, band: usize, ipset: &str) -> Result<(), DynError> {
        let args = string_args(&[
            "filter",
            "add",
            "dev",
            DEVICE,
            "parent",
            &format!("{}:", prio_handle),
            "basic",
            "match",
            &format!("ipset({} dst)", ipset),
            "classid",
            &format!("{}:{}", prio_handle, band),
        ]);
        self.tc(args)?.ensure_success("failed to add ematch filter")
    }
}

/// Renders the netem parameter list:
/// `delay T [jitter [corr]] [reorder R [corr] [gap G]] [limit L]
/// [loss P [corr]] [duplicate P [corr]] [corrupt P [corr]]`.
pub fn netem_to_args(netem: &pb::Netem) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();

    if netem.time > 0 {
        args.push("delay".to_string());
        args.push(netem.time.to_string());
        if netem.jitter > 0 {
            args.push(netem.jitter.to_string());
            if netem.delay_corr > 0.0 {
                args.push(format_float(netem.delay_corr));
            }
        }

        // Reordering is only meaningful alongside a delay.
        if netem.reorder > 0.0 {
            args.push("reorder".to_string());
            args.push(format_float(netem.reorder));
            if netem.reorder_corr > 0.0 {
                args.push(format_float(netem.reorder_corr));
            }
            if netem.gap > 0 {
                args.push("gap".to_string());
                args.push(netem.gap.to_string());
            }
        }
    }

    if netem.limit > 0 {
        args.push("limit".to_string());
        args.push(netem.limit.to_string());
    }

    if netem.loss > 0.0 {
        args.push("loss".to_string());
        args.push(format_float(netem.loss));
        if netem.loss_corr > 0.0 {
            args.push(format_float(netem.loss_corr));
        }
    }

    if netem.duplicate > 0.0 {
        args.push("duplicate".to_string());
        args.push(format_float(netem.duplicate));
        if netem.duplicate_corr > 0.0 {
            args.push(format_float(netem.duplicate_corr));
        }
    }

    if netem.corrupt > 0.0 {
        args.push("corrupt".to_string());
        args.push(format_float(netem.corrupt));
        if netem.corrupt_corr > 0.0 {
            args.push(format_float(netem.corrupt_corr));
        }
    }

    args
}

pub fn tbf_to_args(tbf: &pb::Tbf) -> Vec<String> {
    let mut args = vec![
        "rate".to_string(),
        tbf.rate.to_string(),
        "burst".to_string(),
        tbf.buffer.to_string(),
    ];
    if tbf.limit > 0 {
        args.push("limit".to_string());
        args.push(tbf.limit.to_string());
    }
    if tbf.peak_rate > 0 {
        args.push("peakrate".to_string());
        args.push(tbf.peak_rate.to_string());
        args.push("mtu".to_string());
        args.push(tbf.min_burst.to_string());
    }
    args
}

fn format_float(value: f32) -> String {
    format!("{:.2}", value)
}

fn string_args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nanochaos::daemon::exec::testing::RecordGuard;
    use crate::nanochaos::test_support::env_lock;
    use serial_test::serial;
    use std::fs;

    fn netem_delay(us: u32) -> pb::Tc {
        pb::Tc {
            r#type: pb::tc::Type::Netem as i32,
            netem: Some(pb::Netem {
                time: us,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn netem_with_ipset(us: u32, ipset: &str) -> pb::Tc {
        let mut tc = netem_delay(us);
        tc.ipset = ipset.to_string();
        tc
    }

    #[test]
    fn netem_args_compose_in_canonical_order() {
        let netem = pb::Netem {
            time: 200_000,
            jitter: 10_000,
            delay_corr: 25.0,
            reorder: 5.0,
            gap: 3,
            limit: 1000,
            loss: 1.5,
            duplicate: 2.0,
            corrupt: 0.5,
            ..Default::default()
        };
        assert_eq!(
            netem_to_args(&netem).join(" "),
            "delay 200000 10000 25.00 reorder 5.00 gap 3 limit 1000 loss 1.50 duplicate 2.00 corrupt 0.50"
        );
    }

    #[test]
    fn tbf_args_include_peakrate_pair() {
        let tbf = pb::Tbf {
            rate: 1 << 20,
            buffer: 10_000,
            limit: 20_971_520,
            peak_rate: 2 << 20,
            min_burst: 1600,
        };
        assert_eq!(
            tbf_to_args(&tbf).join(" "),
            "rate 1048576 burst 10000 limit 20971520 peakrate 2097152 mtu 1600"
        );
    }

    #[test]
    #[serial]
    fn set_tcs_builds_the_documented_tree() {
        let _guard = env_lock().lock();
        let dir = tempfile::tempdir().expect("tempdir");
        let log_path = dir.path().join("tc.log");
        let _record = RecordGuard::set(&log_path);

        let runner = CommandRunner::new();
        let client = TcClient::new(&runner, "/proc/4242/ns/net");
        client
            .set_tcs(&[
                netem_delay(50_000),
                netem_delay(100_000),
                netem_with_ipset(50_000, "set-a"),
                netem_with_ipset(100_000, "set-b"),
            ])
            .expect("set tcs");

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
                "tc qdisc del dev eth0 root",
                "tc qdisc add dev eth0 root handle 1: netem delay 50000",
                "tc qdisc add dev eth0 parent 1: handle 2: netem delay 100000",
                "tc qdisc add dev eth0 parent 2: handle 3: prio bands 5 priomap 1 2 2 2 1 2 0 0 1 1 1 1 1 1 1 1",
                "tc qdisc add dev eth0 parent 3:1 handle 4: sfq",
                "tc qdisc add dev eth0 parent 3:2 handle 5: sfq",
                "tc qdisc add dev eth0 parent 3:3 handle 6: sfq",
                "tc qdisc add dev eth0 parent 3:4 handle 7: netem delay 50000",
                "tc filter add dev eth0 parent 3: basic match ipset(set-a dst) classid 3:4",
                "tc qdisc add dev eth0 parent 3:5 handle 8: netem delay 100000",
                "tc filter add dev eth0 parent 3: basic match ipset(set-b dst) classid 3:5",
            ]
        );
    }

    #[test]
    #[serial]
    fn empty_tc_list_only_flushes() {
        let _guard = env_lock().lock();
        let dir = tempfile::tempdir().expect("tempdir");
        let log_path = dir.path().join("tc.log");
        let _record = RecordGuard::set(&log_path);

        let runner = CommandRunner::new();
        let client = TcClient::new(&runner, "/proc/4242/ns/net");
        client.set_tcs(&[]).expect("set tcs");

        let log = fs::read_to_string(&log_path).expect("read log");
        assert_eq!(log.lines().count(), 1);
        assert!(log.contains("qdisc del dev eth0 root"));
    }
}
