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

//! The gRPC surface of the node agent. Every request resolves its
//! container id to a PID exactly once, then executes inside the right
//! namespace. A runtime-prefix mismatch is a protocol error
//! (InvalidArgument); everything else surfaces as Internal and is retried
//! by the controller on its next cycle.

use crate::nanochaos::daemon::crclient::ContainerRuntime;
use crate::nanochaos::daemon::exec::{ns_path, CommandRunner, NsKind};
use crate::nanochaos::daemon::ipset::IpsetClient;
use crate::nanochaos::daemon::iptables::IptablesClient;
use crate::nanochaos::daemon::stress::StressManager;
use crate::nanochaos::daemon::tc::TcClient;
use crate::nanochaos::daemon::{iochaos, time};
use crate::nanochaos::logger::log_info;
use crate::nanochaos::pb;
use crate::nanochaos::pb::chaos_daemon_server::ChaosDaemon;

use std::sync::Arc;
use tonic::{Request, Response, Status};

const COMPONENT: &str = "chaos-daemon";

pub struct DaemonServer {
    runtime: Arc<dyn ContainerRuntime>,
    runner: Arc<CommandRunner>,
    stress: StressManager,
}

impl DaemonServer {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, runner: Arc<CommandRunner>) -> Self {
        Self {
            runtime,
            runner,
            stress: StressManager::new(),
        }
    }

    /// Validates the prefix and resolves the PID for a request.
    fn resolve_pid(&self, raw_container_id: &str) -> Result<u32, Status> {
        let container_id = self
            .runtime
            .parse_container_id(raw_container_id)
            .map_err(|err| Status::invalid_argument(err.to_string()))?;
        self.runtime
            .get_pid(&container_id)
            .map_err(|err| Status::not_found(err.to_string()))
    }
}

fn internal(err: Box<dyn std::error::Error + Send + Sync>) -> Status {
    Status::internal(err.to_string())
}

#[tonic::async_trait]
impl ChaosDaemon for DaemonServer {
    async fn container_get_pid(
        &self,
        request: Request<pb::ContainerRequest>,
    ) -> Result<Response<pb::ContainerResponse>, Status> {
        let request = request.into_inner();
        let pid = self.resolve_pid(&request.container_id)?;
        Ok(Response::new(pb::ContainerResponse { pid }))
    }

    async fn container_kill(
        &self,
        request: Request<pb::ContainerRequest>,
    ) -> Result<Response<pb::Empty>, Status> {
        let request = request.into_inner();

        let action = request
            .action
            .as_ref()
            .map(|action| action.action)
            .unwrap_or_default();
        if action != pb::container_action::Action::Kill as i32 {
            return Err(Status::invalid_argument(format!(
                "container action {} is not kill",
                action
            )));
        }

        let container_id = self
            .runtime
            .parse_container_id(&request.container_id)
            .map_err(|err| Status::invalid_argument(err.to_string()))?;
        log_info(COMPONENT, "killing container", &[("container", &container_id)]);
        self.runtime
            .kill(&container_id)
            .map_err(|err| Status::internal(err.to_string()))?;
        Ok(Response::new(pb::Empty {}))
    }

    async fn flush_ip_sets(
        &self,
        request: Request<pb::IpSetsRequest>,
    ) -> Result<Response<pb::Empty>, Status> {
        let request = request.into_inner();
        let pid = self.resolve_pid(&request.container_id)?;
        let ns = ns_path(pid, NsKind::Net);

        IpsetClient::new(&self.runner, &ns)
            .flush_ipsets(&request.ipsets)
            .map_err(internal)?;
        Ok(Response::new(pb::Empty {}))
    }

    async fn set_iptables_chains(
        &self,
        request: Request<pb::IptablesChainsRequest>,
    ) -> Result<Response<pb::Empty>, Status> {
        let request = request.into_inner();
        let pid = self.resolve_pid(&request.container_id)?;
        let ns = ns_path(pid, NsKind::Net);

        IptablesClient::new(&self.runner, &ns)
            .set_chains(&request.chains)
            .map_err(internal)?;
        Ok(Response::new(pb::Empty {}))
    }

    async fn set_tcs(
        &self,
        request: Request<pb::TcsRequest>,
    ) -> Result<Response<pb::Empty>, Status> {
        let request = request.into_inner();
        let pid = self.resolve_pid(&request.container_id)?;
        let ns = ns_path(pid, NsKind::Net);

        TcClient::new(&self.runner, &ns)
            .set_tcs(&request.tcs)
            .map_err(internal)?;
        Ok(Response::new(pb::Empty {}))
    }

    async fn set_time_offset(
        &self,
        request: Request<pb::TimeRequest>,
    ) -> Result<Response<pb::Empty>, Status> {
        let request = request.into_inner();
        let pid = self.resolve_pid(&request.container_id)?;
        time::set_time_offset(pid, request.sec, request.nsec, request.clk_ids_mask)
            .map_err(internal)?;
        Ok(Response::new(pb::Empty {}))
    }

    async fn recover_time_offset(
        &self,
        request: Request<pb::TimeRequest>,
    ) -> Result<Response<pb::Empty>, Status> {
        let request = request.into_inner();
        let pid = self.resolve_pid(&request.container_id)?;
        time::recover_time_offset(pid).map_err(internal)?;
        Ok(Response::new(pb::Empty {}))
    }

    async fn exec_stressors(
        &self,
        request: Request<pb::ExecStressRequest>,
    ) -> Result<Response<pb::ExecStressResponse>, Status> {
        let request = request.into_inner();
        let pid = self.resolve_pid(&request.container_id)?;
        let ns = ns_path(pid, NsKind::Pid);

        let (instance, start_time) = self
            .stress
            .exec(&self.runner, &ns, &request.stressors)
            .map_err(internal)?;
        Ok(Response::new(pb::ExecStressResponse {
            instance,
            start_time,
        }))
    }

    async fn cancel_stressors(
        &self,
        request: Request<pb::CancelStressRequest>,
    ) -> Result<Response<pb::Empty>, Status> {
        let request = request.into_inner();
        self.stress.cancel(&request.instance).map_err(internal)?;
        Ok(Response::new(pb::Empty {}))
    }

    async fn apply_io_chaos(
        &self,
        request: Request<pb::ApplyIoChaosRequest>,
    ) -> Result<Response<pb::ApplyIoChaosResponse>, Status> {
        let request = request.into_inner();
        let pid = self.resolve_pid(&request.container_id)?;
        let ns = ns_path(pid, NsKind::Net);

        let (instance, start_time) = iochaos::apply_io_chaos(
            &self.runner,
            &ns,
            &request.volume,
            &request.actions,
            request.instance,
            request.start_time,
        )
        .await
        .map_err(|err| Status::unavailable(err.to_string()))?;
        Ok(Response::new(pb::ApplyIoChaosResponse {
            instance,
            start_time,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nanochaos::daemon::crclient::testing::MockRuntime;
    use crate::nanochaos::daemon::exec::testing::RecordGuard;
    use crate::nanochaos::test_support::env_lock;
    use serial_test::serial;
    use std::fs;

    fn server(pid: u32) -> (DaemonServer, Arc<MockRuntime>) {
        let runtime = MockRuntime::docker(pid);
        let server = DaemonServer::new(runtime.clone(), Arc::new(CommandRunner::new()));
        (server, runtime)
    }

    #[tokio::test]
    #[serial]
    async fn get_pid_validates_the_runtime_prefix() {
        let _guard = env_lock().lock();
        let (server, _) = server(4242);

        let response = server
            .container_get_pid(Request::new(pb::ContainerRequest {
                action: Some(pb::ContainerAction {
                    action: pb::container_action::Action::Getpid as i32,
                }),
                container_id: "docker://abc123".to_string(),
            }))
            .await
            .expect("get pid");
        assert_eq!(response.into_inner().pid, 4242);

        let err = server
            .container_get_pid(Request::new(pb::ContainerRequest {
                action: None,
                container_id: "containerd://abc123".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    #[serial]
    async fn container_kill_requires_the_kill_action() {
        let _guard = env_lock().lock();
        let (server, runtime) = server(4242);

        let err = server
            .container_kill(Request::new(pb::ContainerRequest {
                action: Some(pb::ContainerAction {
                    action: pb::container_action::Action::Getpid as i32,
                }),
                container_id: "docker://abc123".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);

        server
            .container_kill(Request::new(pb::ContainerRequest {
                action: Some(pb::ContainerAction {
                    action: pb::container_action::Action::Kill as i32,
                }),
                container_id: "docker://abc123".to_string(),
            }))
            .await
            .expect("kill");
        assert_eq!(runtime.killed.lock().unwrap().as_slice(), ["abc123"]);
    }

    #[tokio::test]
    #[serial]
    async fn set_tcs_executes_in_the_resolved_namespace() {
        let _guard = env_lock().lock();
        let dir = tempfile::tempdir().expect("tempdir");
        let log_path = dir.path().join("daemon.log");
        let _record = RecordGuard::set(&log_path);

        let (server, _) = server(4242);
        server
            .set_tcs(Request::new(pb::TcsRequest {
                container_id: "docker://abc123".to_string(),
                tcs: vec![pb::Tc {
                    r#type: pb::tc::Type::Netem as i32,
                    netem: Some(pb::Netem {
                        time: 200_000,
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
            }))
            .await
            .expect("set tcs");

        let log = fs::read_to_string(&log_path).expect("read log");
        assert!(
            log.contains("nsenter --net=/proc/4242/ns/net -- tc qdisc add dev eth0 root handle 1: netem delay 200000"),
            "{log}"
        );
    }

    #[tokio::test]
    #[serial]
    async fn stress_roundtrip_via_rpc_surface() {
        let _guard = env_lock().lock();
        let dir = tempfile::tempdir().expect("tempdir");
        let log_path = dir.path().join("daemon.log");
        let _record = RecordGuard::set(&log_path);

        let (server, _) = server(4242);
        let response = server
            .exec_stressors(Request::new(pb::ExecStressRequest {
                container_id: "docker://abc123".to_string(),
                stressors: "--cpu 2".to_string(),
            }))
            .await
            .expect("exec")
            .into_inner();
        assert!(!response.instance.is_empty());

        server
            .cancel_stressors(Request::new(pb::CancelStressRequest {
                instance: response.instance,
                start_time: response.start_time,
            }))
            .await
            .expect("cancel");

        let log = fs::read_to_string(&log_path).expect("read log");
        assert!(
            log.contains("nsenter --pid=/proc/4242/ns/pid -- stress-ng --cpu 2"),
            "{log}"
        );
    }
}
