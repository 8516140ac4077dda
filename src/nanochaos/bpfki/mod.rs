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

//! Client for the kernel fault-injection service (BPFKI) colocated with
//! the node agent on a separate port. The controller resolves the target
//! PID through the daemon first, then asks BPFKI to attach the fault.

use crate::nanochaos::bpfki_pb;
use crate::nanochaos::bpfki_pb::bpfki_client::BpfkiClient;
use crate::nanochaos::chaos::kernelchaos::{FailKernRequest, FailType};
use crate::nanochaos::util::error::{new_error, with_context};

use async_trait::async_trait;
use std::error::Error;
use std::time::Duration;
use tonic::transport::Endpoint;

type DynError = Box<dyn Error + Send + Sync>;

/// The BPFKI surface as seen from the kernel-chaos injector.
#[async_trait]
pub trait KernelGateway: Send + Sync {
    async fn fail_kernel(
        &self,
        node_ip: &str,
        pid: u32,
        request: &FailKernRequest,
    ) -> Result<(), DynError>;

    async fn recover_kernel(
        &self,
        node_ip: &str,
        pid: u32,
        request: &FailKernRequest,
    ) -> Result<(), DynError>;
}

pub struct GrpcKernelGateway {
    port: u16,
    rpc_timeout: Duration,
}

impl GrpcKernelGateway {
    pub fn new(port: u16, rpc_timeout: Duration) -> Self {
        Self { port, rpc_timeout }
    }

    async fn client(&self, node_ip: &str) -> Result<BpfkiClient<tonic::transport::Channel>, DynError> {
        let endpoint = Endpoint::from_shared(format!("http://{}:{}", node_ip, self.port))
            .map_err(|e| with_context(e, format!("Invalid BPFKI address for node {}", node_ip)))?
            .timeout(self.rpc_timeout)
            .connect_timeout(self.rpc_timeout);
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| with_context(e, format!("Failed to reach BPFKI on node {}", node_ip)))?;
        Ok(BpfkiClient::new(channel))
    }
}

fn to_pb(pid: u32, request: &FailKernRequest) -> bpfki_pb::FailKernRequest {
    bpfki_pb::FailKernRequest {
        ftype: match request.fail_type {
            FailType::Slab => bpfki_pb::fail_kern_request::Failtype::Slab as i32,
            FailType::Page => bpfki_pb::fail_kern_request::Failtype::Page as i32,
            FailType::Bio => bpfki_pb::fail_kern_request::Failtype::Bio as i32,
        },
        pid,
        tid: 0,
        headers: request.headers.clone(),
        callchain: request
            .callchain
            .iter()
            .map(|frame| bpfki_pb::Frame {
                funcname: frame.funcname.clone(),
                parameters: frame.parameters.clone(),
                predicate: frame.predicate.clone(),
            })
            .collect(),
        probability: request.probability as f32 / 100.0,
        times: request.times,
    }
}

#[async_trait]
impl KernelGateway for GrpcKernelGateway {
    async fn fail_kernel(
        &self,
        node_ip: &str,
        pid: u32,
        request: &FailKernRequest,
    ) -> Result<(), DynError> {
        let response = self
            .client(node_ip)
            .await?
            .fail_mm_or_bio(to_pb(pid, request))
            .await
            .map_err(|e| new_error(format!("FailMMOrBIO failed: {}", e.message())))?
            .into_inner();
        if response.ret != 0 {
            return Err(new_error(format!(
                "FailMMOrBIO returned non-zero status {}",
                response.ret
            )));
        }
        Ok(())
    }

    async fn recover_kernel(
        &self,
        node_ip: &str,
        pid: u32,
        request: &FailKernRequest,
    ) -> Result<(), DynError> {
        let response = self
            .client(node_ip)
            .await?
            .recover_mm_or_bio(to_pb(pid, request))
            .await
            .map_err(|e| new_error(format!("RecoverMMOrBIO failed: {}", e.message())))?
            .into_inner();
        if response.ret != 0 {
            return Err(new_error(format!(
                "RecoverMMOrBIO returned non-zero status {}",
                response.ret
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub enum KernelCall {
        Fail(String, u32),
        Recover(String, u32),
    }

    #[derive(Default)]
    pub struct RecordingKernel {
        pub calls: Mutex<Vec<KernelCall>>,
    }

    impl RecordingKernel {
        pub fn calls(&self) -> Vec<KernelCall> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl KernelGateway for RecordingKernel {
        async fn fail_kernel(
            &self,
            node_ip: &str,
            pid: u32,
            _request: &FailKernRequest,
        ) -> Result<(), DynError> {
            self.calls
                .lock()
                .unwrap()
                .push(KernelCall::Fail(node_ip.to_string(), pid));
            Ok(())
        }

        async fn recover_kernel(
            &self,
            node_ip: &str,
            pid: u32,
            _request: &FailKernRequest,
        ) -> Result<(), DynError> {
            self.calls
                .lock()
                .unwrap()
                .push(KernelCall::Recover(node_ip.to_string(), pid));
            Ok(())
        }
    }
}
