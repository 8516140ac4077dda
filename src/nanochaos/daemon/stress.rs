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

//! stress-ng execution inside a target's PID namespace. Instances are
//! tracked by an opaque uid so a later CancelStressors can kill exactly
//! the process this daemon forked, and nothing else.

use crate::nanochaos::daemon::exec::CommandRunner;
use crate::nanochaos::logger::log_info;
use crate::nanochaos::util::error::{new_error, with_context};

use chrono::Utc;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use rand::Rng;
use std::collections::HashMap;
use std::env;
use std::process::{Command, Stdio};
use std::sync::Mutex;

type DynError = Box<dyn std::error::Error + Send + Sync>;

const COMPONENT: &str = "daemon-stress";

pub struct StressManager {
    instances: Mutex<HashMap<String, Option<u32>>>,
}

impl Default for StressManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StressManager {
    pub fn new() -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Forks `stress-ng <stressors>` inside the PID namespace behind
    /// `ns_path`. Returns the instance uid and start timestamp.
    pub fn exec(
        &self,
        runner: &CommandRunner,
        ns_path: &str,
        stressors: &str,
    ) -> Result<(String, i64), DynError> {
        let uid = generate_uid();
        let start_time = Utc::now().timestamp();
        let args: Vec<String> = stressors
            .split_whitespace()
            .map(|part| part.to_string())
            .collect();

        if runner.recording() {
            runner.note(&format!(
                "nsenter --pid={} -- stress-ng {}",
                ns_path,
                args.join(" ")
            ))?;
            self.instances.lock().unwrap().insert(uid.clone(), None);
            return Ok((uid, start_time));
        }

        let nsenter = env::var("NANOCHAOS_NSENTER").unwrap_or_else(|_| "nsenter".to_string());
        let mut command = Command::new(nsenter);
        command
            .arg(format!("--pid={}", ns_path))
            .arg("--")
            .arg("stress-ng")
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let child = command
            .spawn()
            .map_err(|e| with_context(e, "Failed to fork stress-ng"))?;
        let pid = child.id();

        log_info(
            COMPONENT,
            "forked stress-ng",
            &[
                ("uid", uid.as_str()),
                ("pid", &pid.to_string()),
                ("stressors", stressors),
            ],
        );
        self.instances.lock().unwrap().insert(uid.clone(), Some(pid));
        Ok((uid, start_time))
    }

    /// Cancels a previously started instance. Unknown uids are treated as
    /// already cancelled so Recover stays idempotent.
    pub fn cancel(&self, uid: &str) -> Result<(), DynError> {
        let pid = match self.instances.lock().unwrap().remove(uid) {
            Some(pid) => pid,
            None => {
                log_info(COMPONENT, "stress instance already gone", &[("uid", uid)]);
                return Ok(());
            }
        };

        if let Some(pid) = pid {
            kill(Pid::from_raw(pid as i32), Signal::SIGKILL)
                .map_err(|e| new_error(format!("failed to kill stress-ng pid {}: {}", pid, e)))?;
            log_info(
                COMPONENT,
                "cancelled stress-ng",
                &[("uid", uid), ("pid", &pid.to_string())],
            );
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn tracked(&self) -> usize {
        self.instances.lock().unwrap().len()
    }
}

fn generate_uid() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 8] = rng.gen();
    hex::encode(bytes)
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
    fn exec_records_the_command_and_tracks_the_instance() {
        let _guard = env_lock().lock();
        let dir = tempfile::tempdir().expect("tempdir");
        let log_path = dir.path().join("stress.log");
        let _record = RecordGuard::set(&log_path);

        let runner = CommandRunner::new();
        let manager = StressManager::new();
        let (uid, start_time) = manager
            .exec(&runner, "/proc/4242/ns/pid", "--cpu 2 --cpu-load 50")
            .expect("exec");

        assert_eq!(uid.len(), 16);
        assert!(start_time > 0);
        assert_eq!(manager.tracked(), 1);

        let log = fs::read_to_string(&log_path).expect("read log");
        assert_eq!(
            log.trim(),
            "nsenter --pid=/proc/4242/ns/pid -- stress-ng --cpu 2 --cpu-load 50"
        );

        manager.cancel(&uid).expect("cancel");
        assert_eq!(manager.tracked(), 0);
        manager.cancel(&uid).expect("cancel twice is a no-op");
    }
}
