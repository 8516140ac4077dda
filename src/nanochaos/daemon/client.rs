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

//! Controller-side access to the node agents. Injectors and the aggregate
//! materializer only ever see the `DaemonGateway` trait; production wires
//! a gRPC client per target node, tests install a recording double.

use crate::nanochaos::k8s::pod::Pod;
use crate::nanochaos::pb;
use crate::nanochaos::pb::chaos_daemon_client::ChaosDaemonClient;
use crate::nanochaos::util::error::{new_error, with_context};

use async_trait::async_trait;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};

type DynError = Box<dyn Error + Send + Sync>;
type DynResult<T> = Result<T, DynError>;

/// The node-agent RPC surface as seen from the controller.
#[async_trait]
pub trait DaemonGateway: Send + Sync {
    async fn container_get_pid(&self, container_id: &str) -> DynResult<u32>;
    async fn container_kill(&self, container_id: &str) -> DynResult<()>;
    async fn flush_ipsets(&self, container_id: &str, ipsets: Vec<pb::IpSet>) -> DynResult<()>;
    async fn set_iptables_chains(
        &self,
        container_id: &str,
        chains: Vec<pb::Chain>,
    ) -> DynResult<()>;
    async fn set_tcs(&self, container_id: &str, tcs: Vec<pb::Tc>) -> DynResult<()>;
    async fn set_time_offset(
        &self,
        container_id: &str,
        sec: i64,
        nsec: i64,
        clk_ids_mask: u64,
    ) -> DynResult<()>;
    async fn recover_time_offset(&self, container_id: &str) -> DynResult<()>;
    async fn exec_stressors(&self, container_id: &str, stressors: &str) -> DynResult<(String, i64)>;
    async fn cancel_stressors(&self, instance: &str, start_time: i64) -> DynResult<()>;
    async fn apply_io_chaos(
        &self,
        container_id: &str,
        volume: &str,
        actions_json: &str,
        instance: i64,
        start_time: i64,
    ) -> DynResult<(i64, i64)>;
}

/// Resolves the daemon serving a given pod (by host IP).
#[async_trait]
pub trait DaemonProvider: Send + Sync {
    async fn client_for(&self, pod: &Pod) -> DynResult<Arc<dyn DaemonGateway>>;
}

pub struct GrpcDaemonProvider {
    port: u16,
    rpc_timeout: Duration,
}

impl GrpcDaemonProvider {
    pub fn new(port: u16, rpc_timeout: Duration) -> Self {
        Self { port, rpc_timeout }
    }
}

#[async_trait]
impl DaemonProvider for GrpcDaemonProvider {
    async fn client_for(&self, pod: &Pod) -> DynResult<Arc<dyn DaemonGateway>> {
        let host_ip = pod
            .host_ip()
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| new_error(format!("pod {} has no host IP yet", pod.key())))?;

        let endpoint = Endpoint::from_shared(format!("http://{}:{}", host_ip, self.port))
            .map_err(|e| with_context(e, format!("Invalid daemon address for {}", pod.key())))?
            .timeout(self.rpc_timeout)
            .connect_timeout(self.rpc_timeout);
        let channel = endpoint.connect().await.map_err(|e| {
            with_context(
                e,
                format!("Failed to reach chaos daemon on node {}", host_ip),
            )
        })?;

        Ok(Arc::new(GrpcDaemonGateway {
            client: ChaosDaemonClient::new(channel),
        }))
    }
}

struct GrpcDaemonGateway {
    client: ChaosDaemonClient<Channel>,
}

impl GrpcDaemonGateway {
    fn client(&self) -> ChaosDaemonClient<Channel> {
        self.client.clone()
    }
}

fn rpc_error(err: tonic::Status, what: &str) -> DynError {
    new_error(format!("{} failed: {}", what, err.message()))
}

#[async_trait]
impl DaemonGateway for GrpcDaemonGateway {
    async fn container_get_pid(&self, container_id: &str) -> DynResult<u32> {
        let response = self
            .client()
            .container_get_pid(pb::ContainerRequest {
                action: Some(pb::ContainerAction {
                    action: pb::container_action::Action::Getpid as i32,
                }),
                container_id: container_id.to_string(),
            })
            .await
            .map_err(|e| rpc_error(e, "ContainerGetPid"))?;
        Ok(response.into_inner().pid)
    }

    async fn container_kill(&self, container_id: &str) -> DynResult<()> {
        self.client()
            .container_kill(pb::ContainerRequest {
                action: Some(pb::ContainerAction {
                    action: pb::container_action::Action::Kill as i32,
                }),
                container_id: container_id.to_string(),
            })
            .await
            .map_err(|e| rpc_error(e, "ContainerKill"))?;
        Ok(())
    }

    async fn flush_ipsets(&self, container_id: &str, ipsets: Vec<pb::IpSet>) -> DynResult<()> {
        self.client()
            .flush_ip_sets(pb::IpSetsRequest {
                ipsets,
                container_id: container_id.to_string(),
            })
            .await
            .map_err(|e| rpc_error(e, "FlushIPSets"))?;
        Ok(())
    }

    async fn set_iptables_chains(
        &self,
        container_id: &str,
        chains: Vec<pb::Chain>,
    ) -> DynResult<()> {
        self.client()
            .set_iptables_chains(pb::IptablesChainsRequest {
                chains,
                container_id: container_id.to_string(),
            })
            .await
            .map_err(|e| rpc_error(e, "SetIptablesChains"))?;
        Ok(())
    }

    async fn set_tcs(&self, container_id: &str, tcs: Vec<pb::Tc>) -> DynResult<()> {
        self.client()
            .set_tcs(pb::TcsRequest {
                tcs,
                container_id: container_id.to_string(),
            })
            .await
            .map_err(|e| rpc_error(e, "SetTcs"))?;
        Ok(())
    }

    async fn set_time_offset(
        &self,
        container_id: &str,
        sec: i64,
        nsec: i64,
        clk_ids_mask: u64,
    ) -> DynResult<()> {
        self.client()
            .set_time_offset(pb::TimeRequest {
                container_id: container_id.to_string(),
                sec,
                nsec,
                clk_ids_mask,
            })
            .await
            .map_err(|e| rpc_error(e, "SetTimeOffset"))?;
        Ok(())
    }

    async fn recover_time_offset(&self, container_id: &str) -> DynResult<()> {
        self.client()
            .recover_time_offset(pb::TimeRequest {
                container_id: container_id.to_string(),
                sec: 0,
                nsec: 0,
                clk_ids_mask: 0,
            })
            .await
            .map_err(|e| rpc_error(e, "RecoverTimeOffset"))?;
        Ok(())
    }

    async fn exec_stressors(
        &self,
        container_id: &str,
        stressors: &str,
    ) -> DynResult<(String, i64)> {
        let response = self
            .client()
            .exec_stressors(pb::ExecStressRequest {
                container_id: container_id.to_string(),
                stressors: stressors.to_string(),
            })
            .await
            .map_err(|e| rpc_error(e, "ExecStressors"))?
            .into_inner();
        Ok((response.instance, response.start_time))
    }

    async fn cancel_stressors(&self, instance: &str, start_time: i64) -> DynResult<()> {
        self.client()
            .cancel_stressors(pb::CancelStressRequest {
                instance: instance.to_string(),
                start_time,
            })
            .await
            .map_err(|e| rpc_error(e, "CancelStressors"))?;
        Ok(())
    }

    async fn apply_io_chaos(
        &self,
        container_id: &str,
        volume: &str,
        actions_json: &str,
        instance: i64,
        start_time: i64,
    ) -> DynResult<(i64, i64)> {
        let response = self
            .client()
            .apply_io_chaos(pb::ApplyIoChaosRequest {
                actions: actions_json.to_string(),
                volume: volume.to_string(),
                container_id: container_id.to_string(),
                instance,
                start_time,
            })
            .await
            .map_err(|e| rpc_error(e, "ApplyIoChaos"))?
            .into_inner();
        Ok((response.instance, response.start_time))
    }
}

#[cfg(test)]
pub mod testing {
    //! Recording daemon double shared by injector and aggregator tests.

    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub enum DaemonCall {
        GetPid(String),
        Kill(String),
        FlushIpsets(String, Vec<pb::IpSet>),
        SetChains(String, Vec<pb::Chain>),
        SetTcs(String, Vec<pb::Tc>),
        SetTimeOffset(String, i64, i64, u64),
        RecoverTimeOffset(String),
        ExecStressors(String, String),
        CancelStressors(String),
        ApplyIoChaos(String, String, String),
    }

    #[derive(Default)]
    pub struct RecordingDaemon {
        pub calls: Mutex<Vec<DaemonCall>>,
        pub pid: u32,
        pub fail_container: Option<String>,
    }

    impl RecordingDaemon {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                pid: 4242,
                ..Default::default()
            })
        }

        pub fn failing_on(container_id: &str) -> Arc<Self> {
            Arc::new(Self {
                pid: 4242,
                fail_container: Some(container_id.to_string()),
                ..Default::default()
            })
        }

        pub fn calls(&self) -> Vec<DaemonCall> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, container_id: &str, call: DaemonCall) -> DynResult<()> {
            if self.fail_container.as_deref() == Some(container_id) {
                return Err(new_error(format!(
                    "injected daemon failure for {}",
                    container_id
                )));
            }
            self.calls.lock().unwrap().push(call);
            Ok(())
        }
    }

    #[async_trait]
    impl DaemonGateway for RecordingDaemon {
        async fn container_get_pid(&self, container_id: &str) -> DynResult<u32> {
            self.record(container_id, DaemonCall::GetPid(container_id.to_string()))?;
            Ok(self.pid)
        }

        async fn container_kill(&self, container_id: &str) -> DynResult<()> {
            self.record(container_id, DaemonCall::Kill(container_id.to_string()))
        }

        async fn flush_ipsets(&self, container_id: &str, ipsets: Vec<pb::IpSet>) -> DynResult<()> {
            self.record(
                container_id,
                DaemonCall::FlushIpsets(container_id.to_string(), ipsets),
            )
        }

        async fn set_iptables_chains(
            &self,
            container_id: &str,
            chains: Vec<pb::Chain>,
        ) -> DynResult<()> {
            self.record(
                container_id,
                DaemonCall::SetChains(container_id.to_string(), chains),
            )
        }

        async fn set_tcs(&self, container_id: &str, tcs: Vec<pb::Tc>) -> DynResult<()> {
            self.record(
                container_id,
                DaemonCall::SetTcs(container_id.to_string(), tcs),
            )
        }

        async fn set_time_offset(
            &self,
            container_id: &str,
            sec: i64,
            nsec: i64,
            clk_ids_mask: u64,
        ) -> DynResult<()> {
            self.record(
                container_id,
                DaemonCall::SetTimeOffset(container_id.to_string(), sec, nsec, clk_ids_mask),
            )
        }

        async fn recover_time_offset(&self, container_id: &str) -> DynResult<()> {
            self.record(
                container_id,
                DaemonCall::RecoverTimeOffset(container_id.to_string()),
            )
        }

        async fn exec_stressors(
            &self,
            container_id: &str,
            stressors: &str,
        ) -> DynResult<(String, i64)> {
            self.record(
                container_id,
                DaemonCall::ExecStressors(container_id.to_string(), stressors.to_string()),
            )?;
            Ok((format!("stress-{}", container_id), 1_700_000_000))
        }

        async fn cancel_stressors(&self, instance: &str, _start_time: i64) -> DynResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(DaemonCall::CancelStressors(instance.to_string()));
            Ok(())
        }

        async fn apply_io_chaos(
            &self,
            container_id: &str,
            volume: &str,
            actions_json: &str,
            _instance: i64,
            _start_time: i64,
        ) -> DynResult<(i64, i64)> {
            self.record(
                container_id,
                DaemonCall::ApplyIoChaos(
                    container_id.to_string(),
                    volume.to_string(),
                    actions_json.to_string(),
                ),
            )?;
            Ok((9999, 1_700_000_000))
        }
    }

    /// Provider handing out one shared recording daemon for every pod.
    pub struct RecordingProvider(pub Arc<RecordingDaemon>);

    #[async_trait]
    impl DaemonProvider for RecordingProvider {
        async fn client_for(&self, _pod: &Pod) -> DynResult<Arc<dyn DaemonGateway>> {
            Ok(self.0.clone())
        }
    }
}
