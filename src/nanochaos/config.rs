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

use regex::Regex;
use std::env;
use std::error::Error;
use std::fs;
use std::path::{Component, PathBuf};
use std::time::Duration;

/// Enum for supported on-disk configuration parameters.
#[derive(Debug)]
pub enum Config {
    Keyspace,
    LockFile,
    TimeOffsets,
}

impl Config {
    /// Returns the associated environment variable for the config parameter.
    pub fn env_var(&self) -> &'static str {
        match self {
            Config::Keyspace => "NANOCHAOS_KEYSPACE",
            Config::LockFile => "NANOCHAOS_LOCK_FILE",
            Config::TimeOffsets => "NANOCHAOS_TIME_OFFSETS",
        }
    }

    /// Returns the default path used when the environment variable is unset.
    pub fn default_path(&self) -> &'static str {
        match self {
            Config::Keyspace => {
                #[cfg(test)]
                {
                    "/tmp/nanochaos-test/keyspace"
                }
                #[cfg(not(test))]
                {
                    "/var/lib/nanochaos.io/keyspace"
                }
            }
            Config::LockFile => {
                #[cfg(test)]
                {
                    "/tmp/nanochaos-test/keyspace/.lock"
                }
                #[cfg(not(test))]
                {
                    "/var/lib/nanochaos.io/keyspace/.lock"
                }
            }
            Config::TimeOffsets => {
                #[cfg(test)]
                {
                    "/tmp/nanochaos-test/time_offset"
                }
                #[cfg(not(test))]
                {
                    "/var/run/nanochaos/time_offset"
                }
            }
        }
    }

    /// Returns the effective value, either from environment or default.
    pub fn get_path(&self) -> PathBuf {
        env::var(self.env_var()).map_or_else(
            |_| Self::normalize_path(self.default_path()),
            |value| Self::normalize_path(&value),
        )
    }

    /// Create the directory if it is absent and return its path.
    pub fn ensure(&self) -> Result<PathBuf, Box<dyn Error + Send + Sync>> {
        let path = self.get_path();
        if !path.exists() {
            fs::create_dir_all(&path)
                .map_err(|e| with_context(e, format!("Failed to create '{}'", path.display())))?;
        }
        Ok(path)
    }

    /// Normalize a directory path by expanding ~, resolving ., .., and returning an absolute, cleaned path.
    fn normalize_path(input: &str) -> PathBuf {
        let path: PathBuf = match input {
            _ if input.starts_with("~/") => env::var("HOME")
                .ok()
                .map(|home| PathBuf::from(home).join(&input[2..])),
            _ if !input.starts_with('/') => env::current_dir().ok().map(|cwd| cwd.join(input)),
            _ => None,
        }
        .unwrap_or_else(|| PathBuf::from(input));

        path.components()
            .fold(PathBuf::new(), |mut normalized, component| {
                match component {
                    Component::CurDir => {}
                    Component::ParentDir => {
                        normalized.pop();
                    }
                    _ => normalized.push(component),
                }
                normalized
            })
    }
}

/// Controller-wide settings populated from the environment. This is the only
/// process-wide mutable state besides the logger (feature flags, namespace
/// gates and RPC ports all live here).
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Port the chaos daemon gRPC server listens on, on every node.
    pub chaos_daemon_port: u16,
    /// Port the BPFKI kernel fault-injection gRPC server listens on.
    pub bpfki_port: u16,
    /// Address the metric endpoint binds to.
    pub metrics_addr: String,
    /// Address the pprof endpoint binds to ("0" disables it).
    pub pprof_addr: String,
    /// Enables leader election for the controller manager.
    pub enable_leader_election: bool,
    /// Directory holding the webhook certificate pair.
    pub certs_dir: String,
    /// Namespaces matching this pattern may be targeted; empty means all.
    pub allowed_namespaces: Option<Regex>,
    /// Namespaces matching this pattern are never targeted.
    pub ignored_namespaces: Option<Regex>,
    /// Deadline for a single RPC between the controller and a node agent.
    pub rpc_timeout: Duration,
    /// When false, the controller only watches `target_namespace`.
    pub cluster_scoped: bool,
    /// Namespace restriction applied when not cluster scoped.
    pub target_namespace: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            chaos_daemon_port: 31767,
            bpfki_port: 50051,
            metrics_addr: ":10080".to_string(),
            pprof_addr: "0".to_string(),
            enable_leader_election: false,
            certs_dir: "/etc/webhook/certs".to_string(),
            allowed_namespaces: None,
            ignored_namespaces: None,
            rpc_timeout: Duration::from_secs(60),
            cluster_scoped: true,
            target_namespace: String::new(),
        }
    }
}

impl ControllerConfig {
    /// Reads the controller settings from the environment.
    pub fn from_env() -> Result<Self, Box<dyn Error + Send + Sync>> {
        let mut cfg = Self::default();

        if let Ok(value) = env::var("CHAOS_DAEMON_PORT") {
            cfg.chaos_daemon_port = value
                .parse()
                .map_err(|e| with_context(e, "Invalid CHAOS_DAEMON_PORT"))?;
        }
        if let Ok(value) = env::var("BPFKI_PORT") {
            cfg.bpfki_port = value
                .parse()
                .map_err(|e| with_context(e, "Invalid BPFKI_PORT"))?;
        }
        if let Ok(value) = env::var("METRICS_ADDR") {
            cfg.metrics_addr = value;
        }
        if let Ok(value) = env::var("PPROF_ADDR") {
            cfg.pprof_addr = value;
        }
        if let Ok(value) = env::var("ENABLE_LEADER_ELECTION") {
            cfg.enable_leader_election = value == "true" || value == "1";
        }
        if let Ok(value) = env::var("CERTS_DIR") {
            cfg.certs_dir = value;
        }
        if let Ok(value) = env::var("ALLOWED_NAMESPACES") {
            if !value.is_empty() {
                cfg.allowed_namespaces = Some(
                    Regex::new(&value)
                        .map_err(|e| with_context(e, "Invalid ALLOWED_NAMESPACES pattern"))?,
                );
            }
        }
        if let Ok(value) = env::var("IGNORED_NAMESPACES") {
            if !value.is_empty() {
                cfg.ignored_namespaces = Some(
                    Regex::new(&value)
                        .map_err(|e| with_context(e, "Invalid IGNORED_NAMESPACES pattern"))?,
                );
            }
        }
        if let Ok(value) = env::var("RPC_TIMEOUT") {
            cfg.rpc_timeout = humantime::parse_duration(&value)
                .map_err(|e| with_context(e, "Invalid RPC_TIMEOUT"))?;
        }
        if let Ok(value) = env::var("CLUSTER_SCOPED") {
            cfg.cluster_scoped = value != "false" && value != "0";
        }
        if let Ok(value) = env::var("TARGET_NAMESPACE") {
            cfg.target_namespace = value;
        }

        Ok(cfg)
    }

    /// Applies the controller-wide namespace gate: ignored first, allowed second.
    pub fn namespace_permitted(&self, namespace: &str) -> bool {
        if let Some(ignored) = &self.ignored_namespaces {
            if ignored.is_match(namespace) {
                return false;
            }
        }
        if let Some(allowed) = &self.allowed_namespaces {
            return allowed.is_match(namespace);
        }
        true
    }

    /// Returns whether a namespace is inside the controller's watch scope.
    pub fn within_scope(&self, namespace: &str) -> bool {
        if self.cluster_scoped {
            return true;
        }
        namespace == self.target_namespace
    }
}
