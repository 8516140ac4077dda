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

pub mod router;
pub mod runtime;
pub mod twophase;
pub mod watch;

use crate::nanochaos::bpfki::{GrpcKernelGateway, KernelGateway};
use crate::nanochaos::config::ControllerConfig;
use crate::nanochaos::daemon::client::{DaemonProvider, GrpcDaemonProvider};

use std::sync::Arc;
use std::time::Duration;

/// Dependencies shared by every reconciler: the controller configuration
/// plus the gateways to the per-node services.
pub struct ControllerContext {
    pub cfg: ControllerConfig,
    pub daemon: Arc<dyn DaemonProvider>,
    pub kernel: Arc<dyn KernelGateway>,
}

impl ControllerContext {
    pub fn new(cfg: ControllerConfig) -> Self {
        let daemon = Arc::new(GrpcDaemonProvider::new(
            cfg.chaos_daemon_port,
            cfg.rpc_timeout,
        ));
        let kernel = Arc::new(GrpcKernelGateway::new(cfg.bpfki_port, cfg.rpc_timeout));
        Self {
            cfg,
            daemon,
            kernel,
        }
    }

    pub fn with_gateways(
        cfg: ControllerConfig,
        daemon: Arc<dyn DaemonProvider>,
        kernel: Arc<dyn KernelGateway>,
    ) -> Self {
        Self {
            cfg,
            daemon,
            kernel,
        }
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        use crate::nanochaos::bpfki::testing::RecordingKernel;
        use crate::nanochaos::daemon::client::testing::{RecordingDaemon, RecordingProvider};

        Self::with_gateways(
            ControllerConfig::default(),
            Arc::new(RecordingProvider(RecordingDaemon::new())),
            Arc::new(RecordingKernel::default()),
        )
    }

    #[cfg(test)]
    pub fn for_tests_with(
        daemon: Arc<dyn DaemonProvider>,
        kernel: Arc<dyn KernelGateway>,
    ) -> Self {
        Self::with_gateways(ControllerConfig::default(), daemon, kernel)
    }
}

/// What a reconcile asks the runtime to do next. Requeue-after is the only
/// scheduling primitive; no reconciler owns a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub requeue_after: Option<Duration>,
}

impl ReconcileOutcome {
    pub fn done() -> Self {
        Self {
            requeue_after: None,
        }
    }

    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue_after: Some(delay),
        }
    }
}
