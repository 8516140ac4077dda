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

#![allow(dead_code)]

use nanochaos::nanochaos::k8s::pod::{
    ContainerSpec, ContainerStatus, ObjectMeta, Pod, PodSpec, PodStatus,
};
use nanochaos::nanochaos::k8s::store::put_pod;

use std::collections::HashMap;
use std::env;
use std::fs;
use tempfile::TempDir;

/// A throwaway cluster: the keyspace points at a fresh temp directory for
/// the lifetime of the value. Tests using it must be marked `#[serial]`.
pub struct TestCluster {
    _dir: TempDir,
    previous_keyspace: Option<String>,
    previous_lock: Option<String>,
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        restore_env("NANOCHAOS_KEYSPACE", self.previous_keyspace.take());
        restore_env("NANOCHAOS_LOCK_FILE", self.previous_lock.take());
    }
}

fn restore_env(key: &str, previous: Option<String>) {
    if let Some(value) = previous {
        env::set_var(key, value);
    } else {
        env::remove_var(key);
    }
}

pub fn fresh_cluster() -> TestCluster {
    let dir = tempfile::tempdir().expect("tempdir");
    let keyspace_dir = dir.path().join("keyspace");
    let lock_file = dir.path().join("keyspace.lock");
    fs::create_dir_all(&keyspace_dir).expect("keyspace dir");
    fs::File::create(&lock_file).expect("lock file");

    let previous_keyspace = env::var("NANOCHAOS_KEYSPACE").ok();
    let previous_lock = env::var("NANOCHAOS_LOCK_FILE").ok();
    env::set_var("NANOCHAOS_KEYSPACE", &keyspace_dir);
    env::set_var("NANOCHAOS_LOCK_FILE", &lock_file);

    TestCluster {
        _dir: dir,
        previous_keyspace,
        previous_lock,
    }
}

/// Seeds a running pod with one container and predictable addresses.
pub fn seed_pod(namespace: &str, name: &str, labels: &[(&str, &str)], ip: &str) {
    let mut pod = Pod::new(
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("uid-{name}")),
            labels: labels
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
            ..Default::default()
        },
        PodSpec {
            containers: vec![ContainerSpec {
                name: "app".to_string(),
                image: Some("nginx:1.25".to_string()),
            }],
            node_name: Some("node-a".to_string()),
            ..Default::default()
        },
    );
    pod.status = Some(PodStatus {
        phase: Some("Running".to_string()),
        pod_ip: Some(ip.to_string()),
        host_ip: Some("192.168.0.10".to_string()),
        container_statuses: vec![ContainerStatus {
            name: "app".to_string(),
            ready: true,
            container_id: Some(format!("docker://{name}")),
            ..Default::default()
        }],
        ..Default::default()
    });
    put_pod(&pod).expect("seed pod");
}

/// Label map helper for selector specs.
pub fn labels(entries: &[(&str, &str)]) -> HashMap<String, String> {
    entries
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}
