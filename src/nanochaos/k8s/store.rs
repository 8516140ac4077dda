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

//! Typed pod/node accessors over the keyspace. Writes go through
//! compare-and-swap against the version observed at read time; callers that
//! lose a race retry with a fresh read (`update_pod_with`).

use crate::nanochaos::k8s::node::Node;
use crate::nanochaos::k8s::pod::Pod;
use crate::nanochaos::util::error::{is_conflict_error, with_context};
use crate::nanochaos::util::{is_missing_value_error, Keyspace};

use std::error::Error;

const K8S_KEYSPACE: Keyspace = Keyspace::new("k8s");
const POD_PREFIX: &str = "/pods";
const NODE_PREFIX: &str = "/nodes";
const UPDATE_RETRY_LIMIT: usize = 5;

pub(crate) fn normalize_namespace(namespace: Option<&str>) -> String {
    namespace
        .filter(|ns| !ns.is_empty())
        .unwrap_or("default")
        .to_string()
}

fn make_pod_key(namespace: Option<&str>, name: &str) -> String {
    format!("{}/{}/{}", POD_PREFIX, normalize_namespace(namespace), name)
}

fn make_node_key(name: &str) -> String {
    format!("{}/{}", NODE_PREFIX, name)
}

/// Fetches a single pod; `Ok(None)` when it does not exist.
pub fn get_pod(
    namespace: Option<&str>,
    name: &str,
) -> Result<Option<Pod>, Box<dyn Error + Send + Sync>> {
    let key = make_pod_key(namespace, name);
    let raw = match K8S_KEYSPACE.get(&key) {
        Ok(raw) => raw,
        Err(err) if is_missing_value_error(err.as_ref()) => return Ok(None),
        Err(err) => return Err(with_context(err, format!("Failed to load pod '{}'", key))),
    };
    let pod: Pod = serde_json::from_str(&raw)
        .map_err(|err| with_context(err, format!("Failed to deserialize pod '{}'", key)))?;
    Ok(Some(pod))
}

/// Lists pods, optionally restricted to one namespace, sorted by
/// `(namespace, name)`.
pub fn list_pods(namespace: Option<&str>) -> Result<Vec<Pod>, Box<dyn Error + Send + Sync>> {
    let prefix = match namespace {
        Some(ns) => format!("{}/{}", POD_PREFIX, normalize_namespace(Some(ns))),
        None => POD_PREFIX.to_string(),
    };

    let mut pods = Vec::new();
    for (key, raw, _) in K8S_KEYSPACE.list(&prefix)? {
        let pod: Pod = serde_json::from_str(&raw)
            .map_err(|err| with_context(err, format!("Failed to deserialize pod '{}'", key)))?;
        pods.push(pod);
    }
    pods.sort_by(|a, b| {
        (a.namespace(), a.name()).cmp(&(b.namespace(), b.name()))
    });
    Ok(pods)
}

/// Stores a pod unconditionally (used by tests and by the pod-failure
/// injector after a read-modify-write cycle).
pub fn put_pod(pod: &Pod) -> Result<(), Box<dyn Error + Send + Sync>> {
    let key = make_pod_key(Some(pod.namespace()), pod.name());
    let raw = serde_json::to_string(pod)
        .map_err(|err| with_context(err, format!("Failed to serialize pod '{}'", key)))?;
    K8S_KEYSPACE.put(&key, &raw)?;
    Ok(())
}

/// Deletes a pod. Grace period zero: the entry is removed immediately and
/// the owning workload controller is expected to recreate it.
pub fn delete_pod(namespace: Option<&str>, name: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
    let key = make_pod_key(namespace, name);
    K8S_KEYSPACE
        .delete(&key)
        .map_err(|err| with_context(err, format!("Failed to delete pod '{}'", key)))
}

/// Read-modify-write with optimistic concurrency: re-reads and re-applies
/// the mutation when the version moved underneath us.
pub fn update_pod_with<F>(
    namespace: Option<&str>,
    name: &str,
    mut mutate: F,
) -> Result<Pod, Box<dyn Error + Send + Sync>>
where
    F: FnMut(&mut Pod),
{
    let key = make_pod_key(namespace, name);
    for _ in 0..UPDATE_RETRY_LIMIT {
        let (raw, version) = K8S_KEYSPACE
            .get_versioned(&key)
            .map_err(|err| with_context(err, format!("Failed to load pod '{}'", key)))?;
        let mut pod: Pod = serde_json::from_str(&raw)
            .map_err(|err| with_context(err, format!("Failed to deserialize pod '{}'", key)))?;

        mutate(&mut pod);

        let updated = serde_json::to_string(&pod)
            .map_err(|err| with_context(err, format!("Failed to serialize pod '{}'", key)))?;
        match K8S_KEYSPACE.put_if_version(&key, &updated, Some(version)) {
            Ok(_) => return Ok(pod),
            Err(err) if is_conflict_error(err.as_ref()) => continue,
            Err(err) => return Err(err),
        }
    }

    Err(crate::nanochaos::util::error::new_error(format!(
        "version conflict persisted after {} retries updating pod '{}'",
        UPDATE_RETRY_LIMIT, key
    )))
}

pub fn get_node(name: &str) -> Result<Option<Node>, Box<dyn Error + Send + Sync>> {
    let key = make_node_key(name);
    let raw = match K8S_KEYSPACE.get(&key) {
        Ok(raw) => raw,
        Err(err) if is_missing_value_error(err.as_ref()) => return Ok(None),
        Err(err) => return Err(with_context(err, format!("Failed to load node '{}'", key))),
    };
    let node: Node = serde_json::from_str(&raw)
        .map_err(|err| with_context(err, format!("Failed to deserialize node '{}'", key)))?;
    Ok(Some(node))
}

pub fn list_nodes() -> Result<Vec<Node>, Box<dyn Error + Send + Sync>> {
    let mut nodes = Vec::new();
    for (key, raw, _) in K8S_KEYSPACE.list(NODE_PREFIX)? {
        let node: Node = serde_json::from_str(&raw)
            .map_err(|err| with_context(err, format!("Failed to deserialize node '{}'", key)))?;
        nodes.push(node);
    }
    nodes.sort_by(|a, b| a.name().cmp(b.name()));
    Ok(nodes)
}

pub fn put_node(node: &Node) -> Result<(), Box<dyn Error + Send + Sync>> {
    let key = make_node_key(node.name());
    let raw = serde_json::to_string(node)
        .map_err(|err| with_context(err, format!("Failed to serialize node '{}'", key)))?;
    K8S_KEYSPACE.put(&key, &raw)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nanochaos::k8s::pod::{ContainerSpec, ObjectMeta, PodSpec};
    use crate::nanochaos::test_support::{keyspace_env, keyspace_lock};
    use serial_test::serial;

    fn make_pod(namespace: &str, name: &str) -> Pod {
        Pod::new(
            ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            PodSpec {
                containers: vec![ContainerSpec {
                    name: "app".to_string(),
                    image: Some("nginx:1.25".to_string()),
                }],
                ..Default::default()
            },
        )
    }

    #[test]
    #[serial]
    fn pods_roundtrip_and_list_sorted() {
        let _guard = keyspace_lock().lock();
        let _env = keyspace_env();

        put_pod(&make_pod("default", "web-1")).expect("put");
        put_pod(&make_pod("default", "web-0")).expect("put");
        put_pod(&make_pod("other", "api-0")).expect("put");

        let pods = list_pods(Some("default")).expect("list");
        let names: Vec<&str> = pods.iter().map(|pod| pod.name()).collect();
        assert_eq!(names, vec!["web-0", "web-1"]);

        let all = list_pods(None).expect("list all");
        assert_eq!(all.len(), 3);

        assert!(get_pod(Some("default"), "web-0").expect("get").is_some());
        assert!(get_pod(Some("default"), "missing").expect("get").is_none());
    }

    #[test]
    #[serial]
    fn update_pod_with_applies_mutation() {
        let _guard = keyspace_lock().lock();
        let _env = keyspace_env();

        put_pod(&make_pod("default", "web-0")).expect("put");
        let updated = update_pod_with(Some("default"), "web-0", |pod| {
            pod.metadata
                .annotations
                .insert("touched".to_string(), "true".to_string());
        })
        .expect("update");
        assert_eq!(updated.metadata.annotations.get("touched").unwrap(), "true");

        let reread = get_pod(Some("default"), "web-0")
            .expect("get")
            .expect("present");
        assert_eq!(reread.metadata.annotations.get("touched").unwrap(), "true");
    }

    #[test]
    #[serial]
    fn delete_pod_removes_entry() {
        let _guard = keyspace_lock().lock();
        let _env = keyspace_env();

        put_pod(&make_pod("default", "web-0")).expect("put");
        delete_pod(Some("default"), "web-0").expect("delete");
        assert!(get_pod(Some("default"), "web-0").expect("get").is_none());
    }
}
