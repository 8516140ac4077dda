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

//! Per-pod network aggregation manager. A network-chaos reconciler opens a
//! transaction per target pod, appends its intents, and commits: each
//! commit rewrites the pod's aggregate by dropping every record tagged
//! with this source and appending the fresh ones. Commits are serialized
//! per pod via compare-and-set with retry; other sources' records are
//! never touched.

use crate::nanochaos::chaos::podiochaos::{IoChaosAction, PodIoChaos};
use crate::nanochaos::chaos::podnetworkchaos::{
    PodNetworkChaos, RawIpset, RawIptables, RawTrafficControl,
};
use crate::nanochaos::chaos::store::{
    get_pod_io_chaos, get_pod_network_chaos, put_pod_io_chaos_if_version,
    put_pod_network_chaos_if_version,
};
use crate::nanochaos::k8s::pod::{ObjectMeta, OwnerReference, Pod};
use crate::nanochaos::k8s::store::get_pod;
use crate::nanochaos::logger::log_info;
use crate::nanochaos::util::error::{is_conflict_error, new_error};

use std::collections::BTreeMap;
use std::error::Error;
use std::time::Duration;

type DynError = Box<dyn Error + Send + Sync>;

const COMMIT_RETRY_LIMIT: usize = 5;
const COMMIT_BACKOFF_MS: u64 = 50;
const COMPONENT: &str = "podnetwork-manager";

#[derive(Debug, Default)]
pub struct PodNetworkTransaction {
    ipsets: Vec<RawIpset>,
    chains: Vec<RawIptables>,
    tcs: Vec<RawTrafficControl>,
}

impl PodNetworkTransaction {
    pub fn append_ipset(&mut self, ipset: RawIpset) -> &mut Self {
        self.ipsets.push(ipset);
        self
    }

    pub fn append_chain(&mut self, chain: RawIptables) -> &mut Self {
        self.chains.push(chain);
        self
    }

    pub fn append_tc(&mut self, tc: RawTrafficControl) -> &mut Self {
        self.tcs.push(tc);
        self
    }
}

pub struct PodNetworkManager {
    pub source: String,
    transactions: BTreeMap<(String, String), PodNetworkTransaction>,
}

impl PodNetworkManager {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            transactions: BTreeMap::new(),
        }
    }

    /// Opens (or reuses) the transaction for one pod. An empty transaction
    /// still commits, which is how Recover drops this source's records.
    pub fn with_init(&mut self, namespace: &str, name: &str) -> &mut PodNetworkTransaction {
        self.transactions
            .entry((namespace.to_string(), name.to_string()))
            .or_default()
    }

    /// Commits every transaction. Per pod: read the aggregate, drop this
    /// source's records, append the fresh intents, compare-and-set; lost
    /// races retry with backoff.
    pub async fn commit(&self) -> Result<(), DynError> {
        for ((namespace, name), transaction) in &self.transactions {
            self.commit_pod(namespace, name, transaction).await?;
        }
        Ok(())
    }

    async fn commit_pod(
        &self,
        namespace: &str,
        name: &str,
        transaction: &PodNetworkTransaction,
    ) -> Result<(), DynError> {
        for attempt in 0..COMMIT_RETRY_LIMIT {
            let existing = get_pod_network_chaos(Some(namespace), name)?;
            let (mut aggregate, version) = match existing {
                Some((aggregate, version)) => (aggregate, Some(version)),
                None => {
                    let pod = match get_pod(Some(namespace), name)? {
                        Some(pod) => pod,
                        // The pod is gone and no aggregate exists: nothing
                        // to rewrite, nothing to clean.
                        None => return Ok(()),
                    };
                    (PodNetworkChaos::new(aggregate_meta(&pod)), None)
                }
            };

            aggregate.spec.remove_source(&self.source);
            aggregate.spec.ipsets.extend(transaction.ipsets.clone());
            aggregate.spec.iptables.extend(transaction.chains.clone());
            aggregate
                .spec
                .traffic_controls
                .extend(transaction.tcs.clone());

            match put_pod_network_chaos_if_version(&aggregate, version) {
                Ok(_) => {
                    log_info(
                        COMPONENT,
                        "committed pod network aggregate",
                        &[
                            ("pod", &format!("{}/{}", namespace, name)),
                            ("source", &self.source),
                        ],
                    );
                    return Ok(());
                }
                Err(err) if is_conflict_error(err.as_ref()) => {
                    tokio::time::sleep(Duration::from_millis(
                        COMMIT_BACKOFF_MS * (attempt as u64 + 1),
                    ))
                    .await;
                    continue;
                }
                Err(err) => return Err(err),
            }
        }

        Err(new_error(format!(
            "aggregate commit for '{}/{}' kept losing version races",
            namespace, name
        )))
    }
}

/// Per-pod io aggregation manager; same source-tagged rewrite as the
/// network manager, over the pod's filesystem fault actions.
pub struct PodIoManager {
    pub source: String,
    transactions: BTreeMap<(String, String), PodIoTransaction>,
}

#[derive(Debug, Default)]
pub struct PodIoTransaction {
    volume_mount_path: Option<String>,
    container: Option<String>,
    actions: Vec<IoChaosAction>,
}

impl PodIoTransaction {
    pub fn set_volume_path(&mut self, path: &str) -> &mut Self {
        self.volume_mount_path = Some(path.to_string());
        self
    }

    pub fn set_container(&mut self, container: Option<String>) -> &mut Self {
        self.container = container;
        self
    }

    pub fn append(&mut self, action: IoChaosAction) -> &mut Self {
        self.actions.push(action);
        self
    }
}

impl PodIoManager {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            transactions: BTreeMap::new(),
        }
    }

    pub fn with_init(&mut self, namespace: &str, name: &str) -> &mut PodIoTransaction {
        self.transactions
            .entry((namespace.to_string(), name.to_string()))
            .or_default()
    }

    pub async fn commit(&self) -> Result<(), DynError> {
        for ((namespace, name), transaction) in &self.transactions {
            self.commit_pod(namespace, name, transaction).await?;
        }
        Ok(())
    }

    async fn commit_pod(
        &self,
        namespace: &str,
        name: &str,
        transaction: &PodIoTransaction,
    ) -> Result<(), DynError> {
        for attempt in 0..COMMIT_RETRY_LIMIT {
            let existing = get_pod_io_chaos(Some(namespace), name)?;
            let (mut aggregate, version) = match existing {
                Some((aggregate, version)) => (aggregate, Some(version)),
                None => {
                    let pod = match get_pod(Some(namespace), name)? {
                        Some(pod) => pod,
                        None => return Ok(()),
                    };
                    (PodIoChaos::new(aggregate_meta(&pod)), None)
                }
            };

            aggregate.spec.remove_source(&self.source);
            if let Some(path) = &transaction.volume_mount_path {
                aggregate.spec.volume_mount_path = path.clone();
            }
            if transaction.container.is_some() {
                aggregate.spec.container = transaction.container.clone();
            }
            aggregate.spec.actions.extend(transaction.actions.clone());

            match put_pod_io_chaos_if_version(&aggregate, version) {
                Ok(_) => return Ok(()),
                Err(err) if is_conflict_error(err.as_ref()) => {
                    tokio::time::sleep(Duration::from_millis(
                        COMMIT_BACKOFF_MS * (attempt as u64 + 1),
                    ))
                    .await;
                    continue;
                }
                Err(err) => return Err(err),
            }
        }

        Err(new_error(format!(
            "io aggregate commit for '{}/{}' kept losing version races",
            namespace, name
        )))
    }
}

/// The aggregate is owned by the pod: garbage-collected with it, and no
/// owner cycle with chaos resources is possible.
fn aggregate_meta(pod: &Pod) -> ObjectMeta {
    ObjectMeta {
        name: pod.metadata.name.clone(),
        namespace: pod.metadata.namespace.clone(),
        owner_references: vec![OwnerReference {
            api_version: pod.api_version.clone(),
            kind: pod.kind.clone(),
            name: pod.name().to_string(),
            uid: pod.metadata.uid.clone(),
        }],
        ..Default::default()
    }
}
