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

use nanochaos::nanochaos::daemon::{start_server, DaemonConfig};
use nanochaos::nanochaos::logger::{log_error, log_info, set_log_format, LogFormat};

use std::env;
use std::process;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "chaos-daemon";

#[tokio::main]
async fn main() {
    set_log_format(LogFormat::Text);

    let args: Vec<String> = env::args().skip(1).collect();
    let cfg = match DaemonConfig::parse_flags(&args) {
        Ok(cfg) => cfg,
        Err(err) => {
            log_error(
                COMPONENT,
                "invalid daemon flags",
                &[("error", &err.to_string())],
            );
            process::exit(1);
        }
    };

    log_info(
        COMPONENT,
        "starting chaos daemon",
        &[
            ("grpcPort", &cfg.grpc_port.to_string()),
            ("httpPort", &cfg.http_port.to_string()),
            ("runtime", &cfg.runtime),
        ],
    );

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
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
        log_info(COMPONENT, "shutdown requested", &[]);
        signal_shutdown.cancel();
    });

    if let Err(err) = start_server(cfg, shutdown).await {
        log_error(COMPONENT, "daemon failed", &[("error", &err.to_string())]);
        process::exit(1);
    }

    log_info(COMPONENT, "daemon stopped", &[]);
}
