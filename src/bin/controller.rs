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

use nanochaos::nanochaos::config::ControllerConfig;
use nanochaos::nanochaos::controller::router::InjectorRegistry;
use nanochaos::nanochaos::controller::runtime::ControllerRuntime;
use nanochaos::nanochaos::controller::ControllerContext;
use nanochaos::nanochaos::logger::{log_error, log_info, set_log_format, LogFormat};

use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};

const COMPONENT: &str = "controller-manager";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() {
    set_log_format(LogFormat::Text);

    let cfg = match ControllerConfig::from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            log_error(
                COMPONENT,
                "invalid controller configuration",
                &[("error", &err.to_string())],
            );
            process::exit(1);
        }
    };

    log_info(
        COMPONENT,
        "starting chaos controller",
        &[
            ("daemonPort", &cfg.chaos_daemon_port.to_string()),
            ("rpcTimeout", &format!("{:?}", cfg.rpc_timeout)),
        ],
    );

    let ctx = Arc::new(ControllerContext::new(cfg));
    let registry = Arc::new(InjectorRegistry::with_default_kinds());
    let runtime = ControllerRuntime::new(ctx, registry);
    let shutdown = runtime.shutdown_token();

    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                log_error(
                    COMPONENT,
                    "failed to install SIGTERM handler",
                    &[("error", &err.to_string())],
                );
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
        log_info(COMPONENT, "shutdown requested, draining reconciles", &[]);
        shutdown.cancel();
    });

    match run_until_drained(runtime).await {
        Ok(()) => log_info(COMPONENT, "controller stopped", &[]),
        Err(err) => {
            log_error(COMPONENT, "controller failed", &[("error", &err.to_string())]);
            process::exit(1);
        }
    }
}

async fn run_until_drained(
    runtime: ControllerRuntime,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let shutdown = runtime.shutdown_token();
    let run = runtime.run();
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => result,
        _ = shutdown.cancelled() => {
            // Give in-flight reconciles a bounded window to finish.
            match tokio::time::timeout(DRAIN_TIMEOUT, run).await {
                Ok(result) => result,
                Err(_) => {
                    log_error(COMPONENT, "drain window expired", &[]);
                    Ok(())
                }
            }
        }
    }
}
