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

pub mod client;
pub mod crclient;
pub mod exec;
pub mod iochaos;
pub mod ipset;
pub mod iptables;
pub mod server;
pub mod stress;
pub mod tc;
pub mod time;

use crate::nanochaos::daemon::crclient::create_runtime;
use crate::nanochaos::daemon::exec::CommandRunner;
use crate::nanochaos::daemon::server::DaemonServer;
use crate::nanochaos::logger::log_info;
use crate::nanochaos::pb::chaos_daemon_server::ChaosDaemonServer;
use crate::nanochaos::util::error::{new_error, with_context};

use axum::routing::get;
use axum::Router;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

type DynError = Box<dyn Error + Send + Sync>;

const COMPONENT: &str = "chaos-daemon";

/// Node agent configuration, parsed from CLI flags.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub grpc_port: u16,
    pub http_port: u16,
    pub runtime: String,
    pub profiling: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            grpc_port: 31767,
            http_port: 31766,
            runtime: "docker".to_string(),
            profiling: false,
        }
    }
}

impl DaemonConfig {
    /// Parses `--grpc-port`, `--http-port`, `--runtime` and `--pprof`.
    pub fn parse_flags(args: &[String]) -> Result<Self, DynError> {
        let mut cfg = Self::default();
        let mut iter = args.iter();
        while let Some(flag) = iter.next() {
            match flag.as_str() {
                "--grpc-port" => {
                    let value = iter
                        .next()
                        .ok_or_else(|| new_error("--grpc-port requires a value"))?;
                    cfg.grpc_port = value
                        .parse()
                        .map_err(|e| with_context(e, "Invalid --grpc-port"))?;
                }
                "--http-port" => {
                    let value = iter
                        .next()
                        .ok_or_else(|| new_error("--http-port requires a value"))?;
                    cfg.http_port = value
                        .parse()
                        .map_err(|e| with_context(e, "Invalid --http-port"))?;
                }
                "--runtime" => {
                    let value = iter
                        .next()
                        .ok_or_else(|| new_error("--runtime requires a value"))?;
                    cfg.runtime = value.clone();
                }
                "--pprof" => cfg.profiling = true,
                other => return Err(new_error(format!("unknown flag '{}'", other))),
            }
        }
        Ok(cfg)
    }
}

/// Starts the gRPC and HTTP endpoints, serving until the token fires.
pub async fn start_server(cfg: DaemonConfig, shutdown: CancellationToken) -> Result<(), DynError> {
    let runner = Arc::new(CommandRunner::new());
    let runtime = create_runtime(&cfg.runtime, runner.clone())?;
    let server = DaemonServer::new(runtime, runner);

    let grpc_addr: SocketAddr = format!("0.0.0.0:{}", cfg.grpc_port)
        .parse()
        .map_err(|e| with_context(e, "Invalid gRPC bind address"))?;
    let http_addr: SocketAddr = format!("0.0.0.0:{}", cfg.http_port)
        .parse()
        .map_err(|e| with_context(e, "Invalid HTTP bind address"))?;

    let http_shutdown = shutdown.clone();
    let http_task = tokio::spawn(async move {
        let router = Router::new().route("/healthz", get(|| async { "ok" }));
        let listener = match tokio::net::TcpListener::bind(http_addr).await {
            Ok(listener) => listener,
            Err(err) => {
                crate::nanochaos::logger::log_error(
                    COMPONENT,
                    "failed to bind http endpoint",
                    &[("error", &err.to_string())],
                );
                return;
            }
        };
        let _ = axum::serve(listener, router)
            .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
            .await;
    });

    log_info(
        COMPONENT,
        "starting grpc endpoint",
        &[
            ("address", &grpc_addr.to_string()),
            ("runtime", &cfg.runtime),
        ],
    );

    let grpc_shutdown = shutdown.clone();
    tonic::transport::Server::builder()
        .add_service(ChaosDaemonServer::new(server))
        .serve_with_shutdown(grpc_addr, async move { grpc_shutdown.cancelled().await })
        .await
        .map_err(|e| with_context(e, "grpc endpoint failed"))?;

    let _ = http_task.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|part| part.to_string()).collect()
    }

    #[test]
    fn flags_parse_with_defaults() {
        let cfg = DaemonConfig::parse_flags(&[]).expect("defaults");
        assert_eq!(cfg.grpc_port, 31767);
        assert_eq!(cfg.runtime, "docker");
        assert!(!cfg.profiling);

        let cfg = DaemonConfig::parse_flags(&args(&[
            "--grpc-port",
            "31768",
            "--http-port",
            "8080",
            "--runtime",
            "containerd",
            "--pprof",
        ]))
        .expect("parse");
        assert_eq!(cfg.grpc_port, 31768);
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.runtime, "containerd");
        assert!(cfg.profiling);
    }

    #[test]
    fn unknown_flags_are_rejected() {
        assert!(DaemonConfig::parse_flags(&args(&["--color"])).is_err());
        assert!(DaemonConfig::parse_flags(&args(&["--grpc-port"])).is_err());
        assert!(DaemonConfig::parse_flags(&args(&["--grpc-port", "lots"])).is_err());
    }
}
