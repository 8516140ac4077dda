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

//! Container-runtime access for the node agent. A request's container id
//! is runtime-prefixed (`docker://<id>`); the agent rejects ids whose
//! prefix does not match the configured runtime, then resolves a PID once
//! per request through the runtime's own tooling.

use crate::nanochaos::daemon::exec::CommandRunner;
use crate::nanochaos::util::error::{new_error, with_context};

use std::error::Error;
use std::sync::Arc;

type DynError = Box<dyn Error + Send + Sync>;

pub const DOCKER_RUNTIME: &str = "docker";
pub const CONTAINERD_RUNTIME: &str = "containerd";

pub trait ContainerRuntime: Send + Sync {
    /// Runtime name as configured via `--runtime`.
    fn name(&self) -> &'static str;

    /// Resolves the init PID of a container (bare id, no prefix).
    fn get_pid(&self, container_id: &str) -> Result<u32, DynError>;

    /// Executes the runtime's kill verb against a container.
    fn kill(&self, container_id: &str) -> Result<(), DynError>;

    /// Strips and validates the runtime prefix of a request id. A wrong
    /// prefix is a protocol error, not a retryable one.
    fn parse_container_id(&self, raw: &str) -> Result<String, DynError> {
        let prefix = format!("{}://", self.name());
        match raw.strip_prefix(&prefix) {
            Some(id) if !id.is_empty() => Ok(id.to_string()),
            _ => Err(new_error(format!(
                "container id '{}' does not carry the expected '{}' prefix",
                raw, prefix
            ))),
        }
    }
}

/// Builds the runtime client configured with `--runtime`.
pub fn create_runtime(
    name: &str,
    runner: Arc<CommandRunner>,
) -> Result<Arc<dyn ContainerRuntime>, DynError> {
    match name {
        DOCKER_RUNTIME => Ok(Arc::new(DockerRuntime { runner })),
        CONTAINERD_RUNTIME => Ok(Arc::new(ContainerdRuntime { runner })),
        other => Err(new_error(format!("unsupported container runtime '{}'", other))),
    }
}

pub struct DockerRuntime {
    runner: Arc<CommandRunner>,
}

impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        DOCKER_RUNTIME
    }

    fn get_pid(&self, container_id: &str) -> Result<u32, DynError> {
        let result = self.runner.run(
            "docker",
            &[
                "inspect".to_string(),
                "--format".to_string(),
                "{{.State.Pid}}".to_string(),
                container_id.to_string(),
            ],
        )?;
        result.ensure_success(&format!("container {} not found", container_id))?;
        parse_pid(&result.output, container_id)
    }

    fn kill(&self, container_id: &str) -> Result<(), DynError> {
        let result = self
            .runner
            .run("docker", &["kill".to_string(), container_id.to_string()])?;
        result.ensure_success(&format!("failed to kill container {}", container_id))
    }
}

pub struct ContainerdRuntime {
    runner: Arc<CommandRunner>,
}

impl ContainerRuntime for ContainerdRuntime {
    fn name(&self) -> &'static str {
        CONTAINERD_RUNTIME
    }

    fn get_pid(&self, container_id: &str) -> Result<u32, DynError> {
        let result = self.runner.run(
            "crictl",
            &[
                "inspect".to_string(),
                "--output".to_string(),
                "go-template".to_string(),
                "--template".to_string(),
                "{{.info.pid}}".to_string(),
                container_id.to_string(),
            ],
        )?;
        result.ensure_success(&format!("container {} not found", container_id))?;
        parse_pid(&result.output, container_id)
    }

    fn kill(&self, container_id: &str) -> Result<(), DynError> {
        let result = self.runner.run(
            "crictl",
            &[
                "stop".to_string(),
                "--timeout".to_string(),
                "0".to_string(),
                container_id.to_string(),
            ],
        )?;
        result.ensure_success(&format!("failed to kill container {}", container_id))
    }
}

fn parse_pid(output: &str, container_id: &str) -> Result<u32, DynError> {
    output.trim().parse::<u32>().map_err(|e| {
        with_context(
            e,
            format!("invalid PID reported for container {}", container_id),
        )
    })
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_validation_is_strict() {
        let runtime = testing::MockRuntime::docker(4242);
        assert_eq!(
            runtime
                .parse_container_id("docker://abc123")
                .expect("parse"),
            "abc123"
        );
        assert!(runtime.parse_container_id("containerd://abc123").is_err());
        assert!(runtime.parse_container_id("docker://").is_err());
        assert!(runtime.parse_container_id("abc123").is_err());
    }

    #[test]
    fn unknown_runtimes_are_rejected() {
        let runner = Arc::new(CommandRunner::new());
        assert!(create_runtime("docker", runner.clone()).is_ok());
        assert!(create_runtime("containerd", runner.clone()).is_ok());
        assert!(create_runtime("podman", runner).is_err());
    }

    #[test]
    fn pid_parsing_rejects_garbage() {
        assert_eq!(parse_pid("4242\n", "abc").expect("pid"), 4242);
        assert!(parse_pid("not-a-pid", "abc").is_err());
    }
}
