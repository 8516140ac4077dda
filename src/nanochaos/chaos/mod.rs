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

pub mod dnschaos;
pub mod httpchaos;
pub mod iochaos;
pub mod kernelchaos;
pub mod networkchaos;
pub mod object;
pub mod podchaos;
pub mod podiochaos;
pub mod podnetworkchaos;
pub mod selector;
pub mod status;
pub mod store;
pub mod stresschaos;
pub mod timechaos;
pub mod validation;

/// Annotation that pauses a running experiment ("true"/"false").
pub const PAUSE_ANNOTATION_KEY: &str = "chaos-mesh.org/pause";

/// Annotation that permits unconditional finalizer clearing on Recover.
pub const CLEAN_FINALIZER_ANNOTATION_KEY: &str = "chaos-mesh.org/cleanFinalizer";
pub const CLEAN_FINALIZER_FORCED: &str = "forced";

pub const KIND_POD_CHAOS: &str = "PodChaos";
pub const KIND_NETWORK_CHAOS: &str = "NetworkChaos";
pub const KIND_IO_CHAOS: &str = "IoChaos";
pub const KIND_TIME_CHAOS: &str = "TimeChaos";
pub const KIND_KERNEL_CHAOS: &str = "KernelChaos";
pub const KIND_STRESS_CHAOS: &str = "StressChaos";
pub const KIND_DNS_CHAOS: &str = "DNSChaos";
pub const KIND_HTTP_CHAOS: &str = "HTTPChaos";

/// Every declared resource kind, in registration order.
pub const ALL_KINDS: &[&str] = &[
    KIND_POD_CHAOS,
    KIND_NETWORK_CHAOS,
    KIND_IO_CHAOS,
    KIND_TIME_CHAOS,
    KIND_KERNEL_CHAOS,
    KIND_STRESS_CHAOS,
    KIND_DNS_CHAOS,
    KIND_HTTP_CHAOS,
];
