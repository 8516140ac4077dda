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

pub mod bpfki;
pub mod chaos;
pub mod collector;
pub mod config;
pub mod controller;
pub mod daemon;
pub mod injector;
pub mod k8s;
pub mod logger;
pub mod network;
pub mod scheduler;
pub mod selector;
pub mod util;

pub mod pb {
    tonic::include_proto!("chaosdaemon");
}

pub mod bpfki_pb {
    tonic::include_proto!("bpfki");
}

pub use config::Config;

#[cfg(test)]
pub mod test_support;
