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

//! Privileged command execution for the node agent. Commands run inside a
//! target container's namespace via an nsenter argv prefix. When
//! `NANOCHAOS_CMD_RECORD` points at a file, command lines are appended
//! there instead of executed, which is how tests observe the agent without
//! touching kernel state.

use crate::nanochaos::logger::log_debug;
use crate::nanochaos::util::error::{new_error, with_context};

use std::env;
use std::error::Error;
use std::fs::OpenOptions;
use std::io::Write;
use std::process::Command;

type DynError = Box<dyn Error + Send + Sync>;

const RECORD_ENV: &str = "NANOCHAOS_CMD_RECORD";
const NSENTER_ENV: &str = "NANOCHAOS_NSENTER";
const COMPONENT: &str = "daemon-exec";

/// The namespaces the agent enters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NsKind {
    Net,
    Pid,
}

impl NsKind {
    fn proc_name(self) -> &'static str {
        match self {
            NsKind::Net => "net",
            NsKind::Pid => "pid",
        }
    }

    fn nsenter_flag(self) -> &'static str {
        match self {
            NsKind::Net => "--net",
            NsKind::Pid => "--pid",
        }
    }
}

/// Namespace handle of a resolved PID.
pub fn ns_path(pid: u32, kind: NsKind) -> String {
    format!("/proc/{}/ns/{}", pid, kind.proc_name())
}

/// Result of one command; callers inspect the combined output to tolerate
/// the kernel's benign complaints (missing qdisc, existing ipset, ...).
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub success: bool,
    pub output: String,
}

impl CommandResult {
    pub fn ensure_success(&self, context: &str) -> Result<(), DynError> {
        if self.success {
            Ok(())
        } else {
            Err(new_error(format!("{}: {}", context, self.output.trim())))
        }
    }
}

#[derive(Default)]
pub struct CommandRunner;

impl CommandRunner {
    pub fn new() -> Self {
        Self
    }

    fn record_path(&self) -> Option<String> {
        env::var(RECORD_ENV).ok().filter(|path| !path.is_empty())
    }

    pub fn recording(&self) -> bool {
        self.record_path().is_some()
    }

    /// Appends a line to the record log; used both for command lines and
    /// for non-exec intents (the chaosfs sidecar update).
    pub fn note(&self, line: &str) -> Result<(), DynError> {
        let path = match self.record_path() {
            Some(path) => path,
            None => return Ok(()),
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| with_context(e, "Failed to open command record log"))?;
        writeln!(file, "{}", line).map_err(|e| with_context(e, "Failed to write command record"))?;
        Ok(())
    }

    /// Runs a command on the host, capturing combined output.
    pub fn run(&self, program: &str, args: &[String]) -> Result<CommandResult, DynError> {
        if self.recording() {
            self.note(&format!("{} {}", program, args.join(" ")))?;
            return Ok(CommandResult {
                success: true,
                output: String::new(),
            });
        }

        log_debug(
            COMPONENT,
            "executing command",
            &[("program", program), ("args", &args.join(" "))],
        );

        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| with_context(e, format!("Failed to execute {}", program)))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(CommandResult {
            success: output.status.success(),
            output: combined,
        })
    }

    /// Runs a command inside the namespace behind `ns_path` via nsenter.
    pub fn run_in_ns(
        &self,
        kind: NsKind,
        ns_path: &str,
        program: &str,
        args: &[String],
    ) -> Result<CommandResult, DynError> {
        let nsenter = env::var(NSENTER_ENV).unwrap_or_else(|_| "nsenter".to_string());
        let mut full_args = vec![
            format!("{}={}", kind.nsenter_flag(), ns_path),
            "--".to_string(),
            program.to_string(),
        ];
        full_args.extend(args.iter().cloned());
        self.run(&nsenter, &full_args)
    }
}

#[cfg(test)]
pub mod testing {
    use std::env;
    use std::path::Path;

    pub struct RecordGuard {
        previous: Option<String>,
    }

    impl RecordGuard {
        /// Points the runner's record log at `path` for the duration of a
        /// test. Callers must hold the env lock.
        pub fn set(path: &Path) -> Self {
            let previous = env::var(super::RECORD_ENV).ok();
            env::set_var(super::RECORD_ENV, path);
            Self { previous }
        }
    }

    impl Drop for RecordGuard {
        fn drop(&mut self) {
            match self.previous.take() {
                Some(value) => env::set_var(super::RECORD_ENV, value),
                None => env::remove_var(super::RECORD_ENV),
            }
        }
    }
}
