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

//! File-backed keyspace modelling the cluster manager's object store: a
//! watchable prefix store with per-key versions and compare-and-swap
//! writes. The controller never sees the cluster manager directly, only
//! this surface (get/list/put/delete/watch).

use crate::nanochaos::util::error::{new_error, with_context};
use crate::nanochaos::Config;

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::error::Error;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use tokio::sync::broadcast;

const VALUE_FILE_NAME: &str = "_value_";
const VERSION_FILE_NAME: &str = "_version_";
const MAX_KEY_DEPTH: usize = 16;
const MAX_KEY_LENGTH: usize = 512;
const WATCH_HISTORY_LIMIT: usize = 512;
const WATCH_CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum KeyspaceEventType {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyspaceEvent {
    #[serde(rename = "type")]
    pub event_type: KeyspaceEventType,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(rename = "resourceVersion")]
    pub resource_version: u64,
}

impl KeyspaceEvent {
    fn matches_prefix(&self, prefix: &str) -> bool {
        if prefix == "/" {
            true
        } else {
            self.key.starts_with(prefix)
        }
    }
}

struct PartitionWatch {
    sender: broadcast::Sender<KeyspaceEvent>,
    history: RwLock<VecDeque<KeyspaceEvent>>,
    version: AtomicU64,
}

impl PartitionWatch {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            sender,
            history: RwLock::new(VecDeque::new()),
            version: AtomicU64::new(0),
        }
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn record(&self, event: KeyspaceEvent) {
        {
            let mut history = self
                .history
                .write()
                .expect("keyspace watch history lock poisoned");
            history.push_back(event.clone());
            if history.len() > WATCH_HISTORY_LIMIT {
                history.pop_front();
            }
        }
        let _ = self.sender.send(event);
    }

    fn snapshot_since(&self, since: u64) -> VecDeque<KeyspaceEvent> {
        let history = self
            .history
            .read()
            .expect("keyspace watch history lock poisoned");
        history
            .iter()
            .filter(|event| event.resource_version > since)
            .cloned()
            .collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<KeyspaceEvent> {
        self.sender.subscribe()
    }
}

fn watch_registry() -> &'static Mutex<HashMap<&'static str, Arc<PartitionWatch>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<&'static str, Arc<PartitionWatch>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn get_partition_watch(partition: &'static str) -> Arc<PartitionWatch> {
    let registry = watch_registry();
    let mut guard = registry
        .lock()
        .expect("keyspace watch registry lock poisoned");
    guard
        .entry(partition)
        .or_insert_with(|| Arc::new(PartitionWatch::new()))
        .clone()
}

fn normalize_watch_prefix(prefix: &str) -> String {
    if prefix.is_empty() || prefix == "/" {
        "/".to_string()
    } else if prefix.starts_with('/') {
        prefix.to_string()
    } else {
        format!("/{}", prefix)
    }
}

fn publish_partition_event(
    partition: &'static str,
    key: String,
    value: Option<String>,
    event_type: KeyspaceEventType,
) {
    let watch = get_partition_watch(partition);
    let resource_version = watch.next_version();
    let event = KeyspaceEvent {
        event_type,
        key,
        value,
        resource_version,
    };
    watch.record(event);
}

pub struct KeyspaceWatchStream {
    prefix: String,
    receiver: broadcast::Receiver<KeyspaceEvent>,
    partition: Arc<PartitionWatch>,
    backlog: VecDeque<KeyspaceEvent>,
    last_version: u64,
}

impl KeyspaceWatchStream {
    fn new(partition: Arc<PartitionWatch>, prefix: String, since: u64) -> Self {
        let receiver = partition.subscribe();
        let mut stream = Self {
            prefix,
            receiver,
            partition,
            backlog: VecDeque::new(),
            last_version: since,
        };
        stream.refill_backlog();
        stream
    }

    fn refill_backlog(&mut self) {
        let events = self.partition.snapshot_since(self.last_version);
        for event in events {
            if event.matches_prefix(&self.prefix) {
                self.backlog.push_back(event);
            }
        }
    }

    pub async fn next(&mut self) -> Option<KeyspaceEvent> {
        if let Some(event) = self.backlog.pop_front() {
            self.last_version = event.resource_version;
            return Some(event);
        }

        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if event.resource_version <= self.last_version {
                        continue;
                    }

                    self.last_version = event.resource_version;
                    if event.matches_prefix(&self.prefix) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    self.refill_backlog();
                    if let Some(event) = self.backlog.pop_front() {
                        self.last_version = event.resource_version;
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// A file-based lock used for concurrent access control. Read paths acquire
/// the shared guard, writers take the exclusive guard.
struct FileLock {
    file: File,
}

impl FileLock {
    fn new(shared: bool) -> std::io::Result<Self> {
        let lockfile_path = Config::LockFile.get_path();
        if let Some(parent) = lockfile_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(lockfile_path)?;
        if shared {
            file.lock_shared()?;
        } else {
            file.lock_exclusive()?;
        }
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[derive(Clone, Copy)]
pub struct Keyspace {
    partition: &'static str,
}

impl Keyspace {
    pub const fn new(partition: &'static str) -> Keyspace {
        Keyspace { partition }
    }

    /// Returns a stream of keyspace events filtered by prefix starting after
    /// an optional resource version.
    pub fn watch(&self, prefix: &str, since: Option<u64>) -> KeyspaceWatchStream {
        let normalized = normalize_watch_prefix(prefix);
        let partition = get_partition_watch(self.partition);
        KeyspaceWatchStream::new(partition, normalized, since.unwrap_or(0))
    }

    /// Stores a value under the given key unconditionally.
    pub fn put(&self, key: &str, value: &str) -> Result<u64, Box<dyn Error + Send + Sync>> {
        let key_path = resolve_path(self.partition, key)?;
        let _lock = FileLock::new(false)
            .map_err(|e| with_context(e, "Failed to acquire exclusive keyspace lock"))?;
        self.write_value(key, &key_path, value, None)
    }

    /// Stores a value only when the key's current version matches the
    /// expectation (`None` requires the key to be absent). Lost races fail
    /// with a `version conflict` error, which callers retry after a fresh
    /// read.
    pub fn put_if_version(
        &self,
        key: &str,
        value: &str,
        expected: Option<u64>,
    ) -> Result<u64, Box<dyn Error + Send + Sync>> {
        let key_path = resolve_path(self.partition, key)?;
        let _lock = FileLock::new(false)
            .map_err(|e| with_context(e, "Failed to acquire exclusive keyspace lock"))?;

        let current = read_version(&key_path)?;
        if current != expected {
            return Err(new_error(format!(
                "version conflict on '{}': expected {:?}, found {:?}",
                key, expected, current
            )));
        }

        self.write_value(key, &key_path, value, current)
    }

    fn write_value(
        &self,
        key: &str,
        key_path: &Path,
        value: &str,
        current: Option<u64>,
    ) -> Result<u64, Box<dyn Error + Send + Sync>> {
        let current = match current {
            Some(version) => Some(version),
            None => read_version(key_path)?,
        };
        let next = current.unwrap_or(0) + 1;

        fs::create_dir_all(key_path).map_err(|e| {
            with_context(
                e,
                format!("Failed to create key directory '{}'", key_path.display()),
            )
        })?;
        persist_atomically(&key_path.join(VALUE_FILE_NAME), value.as_bytes())?;
        persist_atomically(
            &key_path.join(VERSION_FILE_NAME),
            next.to_string().as_bytes(),
        )?;

        publish_partition_event(
            self.partition,
            key.to_string(),
            Some(value.to_string()),
            if current.is_some() {
                KeyspaceEventType::Modified
            } else {
                KeyspaceEventType::Added
            },
        );

        Ok(next)
    }

    /// Retrieves the value associated with the given key.
    pub fn get(&self, key: &str) -> Result<String, Box<dyn Error + Send + Sync>> {
        self.get_versioned(key).map(|(value, _)| value)
    }

    /// Retrieves the value and its version.
    pub fn get_versioned(&self, key: &str) -> Result<(String, u64), Box<dyn Error + Send + Sync>> {
        let key_path = resolve_path(self.partition, key)?;
        let _lock = FileLock::new(true)
            .map_err(|e| with_context(e, "Failed to acquire shared keyspace lock"))?;

        let value_path = key_path.join(VALUE_FILE_NAME);
        let value = match read_if_exists(&value_path)? {
            Some(value) => value,
            None => {
                return Err(new_error(format!(
                    "Value file not found: {}",
                    value_path.display()
                )))
            }
        };
        let version = read_version(&key_path)?.unwrap_or(1);
        Ok((value, version))
    }

    /// Lists `(key, value, version)` triples for every key under the prefix,
    /// sorted by key.
    pub fn list(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, String, u64)>, Box<dyn Error + Send + Sync>> {
        let root = Config::Keyspace.get_path().join(self.partition);
        let normalized = normalize_watch_prefix(prefix);
        let start = root.join(normalized.trim_start_matches('/'));

        let _lock = FileLock::new(true)
            .map_err(|e| with_context(e, "Failed to acquire shared keyspace lock"))?;

        let mut entries = Vec::new();
        collect_values(&root, &start, &mut entries)?;
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    /// Deletes the value and associated directory for the given key.
    pub fn delete(&self, key: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
        let key_path = resolve_path(self.partition, key)?;
        let _lock = FileLock::new(false)
            .map_err(|e| with_context(e, "Failed to acquire exclusive keyspace lock"))?;

        let value_path = key_path.join(VALUE_FILE_NAME);
        if !value_path.exists() {
            return Err(new_error(format!(
                "Value file not found: {}",
                value_path.display()
            )));
        }

        fs::remove_file(&value_path).map_err(|e| {
            with_context(
                e,
                format!("Failed to remove value file '{}'", value_path.display()),
            )
        })?;
        let version_path = key_path.join(VERSION_FILE_NAME);
        if version_path.exists() {
            if let Err(e) = fs::remove_file(&version_path) {
                if e.kind() != ErrorKind::NotFound {
                    return Err(with_context(
                        e,
                        format!("Failed to remove version file '{}'", version_path.display()),
                    ));
                }
            }
        }
        cleanup_empty_dirs(self.partition, &key_path);

        publish_partition_event(
            self.partition,
            key.to_string(),
            None,
            KeyspaceEventType::Deleted,
        );

        Ok(())
    }
}

fn collect_values(
    root: &Path,
    dir: &Path,
    entries: &mut Vec<(String, String, u64)>,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let read_dir = match fs::read_dir(dir) {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(with_context(
                e,
                format!("Failed to read keyspace directory '{}'", dir.display()),
            ))
        }
    };

    let value_path = dir.join(VALUE_FILE_NAME);
    if let Some(value) = read_if_exists(&value_path)? {
        let version = read_version(dir)?.unwrap_or(1);
        let relative = dir
            .strip_prefix(root)
            .map_err(|e| with_context(e, "Keyspace entry escaped the partition root"))?;
        let key = format!("/{}", relative.to_string_lossy());
        entries.push((key, value, version));
    }

    for entry in read_dir {
        let entry = entry.map_err(|e| {
            with_context(
                e,
                format!("Failed to iterate keyspace directory '{}'", dir.display()),
            )
        })?;
        if entry
            .file_type()
            .map_err(|e| with_context(e, "Failed to inspect keyspace entry"))?
            .is_dir()
        {
            collect_values(root, &entry.path(), entries)?;
        }
    }

    Ok(())
}

fn read_version(key_path: &Path) -> Result<Option<u64>, Box<dyn Error + Send + Sync>> {
    let version_path = key_path.join(VERSION_FILE_NAME);
    if !key_path.join(VALUE_FILE_NAME).exists() {
        return Ok(None);
    }
    let contents = match read_if_exists(&version_path)? {
        Some(contents) => contents,
        None => return Ok(Some(1)),
    };
    let version = contents.trim().parse::<u64>().map_err(|e| {
        with_context(
            e,
            format!("Invalid version value in '{}'", version_path.display()),
        )
    })?;
    Ok(Some(version))
}

fn read_if_exists(path: &Path) -> Result<Option<String>, Box<dyn Error + Send + Sync>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(with_context(
            e,
            format!("Failed to read keyspace file '{}'", path.display()),
        )),
    }
}

fn resolve_path(partition: &str, key: &str) -> Result<PathBuf, Box<dyn Error + Send + Sync>> {
    if key.len() > MAX_KEY_LENGTH {
        return Err(new_error(format!(
            "Key exceeds maximum length of {} bytes",
            MAX_KEY_LENGTH
        )));
    }

    let trimmed = key.trim_matches('/');
    if trimmed.is_empty() {
        return Err(new_error("Key must not be empty"));
    }

    let mut path = Config::Keyspace.get_path().join(partition);
    let mut depth = 0;
    for segment in trimmed.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(new_error(format!("Invalid key segment in '{}'", key)));
        }
        if segment.starts_with('_') && segment.ends_with('_') {
            return Err(new_error(format!(
                "Key segment '{}' collides with keyspace internals",
                segment
            )));
        }
        depth += 1;
        if depth > MAX_KEY_DEPTH {
            return Err(new_error(format!(
                "Key exceeds maximum depth of {}",
                MAX_KEY_DEPTH
            )));
        }
        path.push(segment);
    }

    Ok(path)
}

fn cleanup_empty_dirs(partition: &str, key_path: &Path) {
    let data_root = Config::Keyspace.get_path().join(partition);
    let mut dir = key_path.to_path_buf();
    while dir != data_root && dir.starts_with(&data_root) {
        match fs::remove_dir(&dir) {
            Ok(_) => {
                if let Some(parent) = dir.parent() {
                    dir = parent.to_path_buf();
                } else {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}

fn persist_atomically(target: &Path, data: &[u8]) -> Result<(), Box<dyn Error + Send + Sync>> {
    let parent = target
        .parent()
        .ok_or_else(|| new_error(format!("Path '{}' has no parent", target.display())))?;
    let tmp = parent.join(format!(
        "{}.tmp",
        target
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "value".to_string())
    ));

    let mut file = File::create(&tmp)
        .map_err(|e| with_context(e, format!("Failed to create '{}'", tmp.display())))?;
    file.write_all(data)
        .map_err(|e| with_context(e, format!("Failed to write '{}'", tmp.display())))?;
    file.sync_all()
        .map_err(|e| with_context(e, format!("Failed to sync '{}'", tmp.display())))?;
    fs::rename(&tmp, target).map_err(|e| {
        with_context(
            e,
            format!(
                "Failed to move '{}' into place at '{}'",
                tmp.display(),
                target.display()
            ),
        )
    })?;
    Ok(())
}

/// Returns true when a keyspace error indicates a missing value file.
pub fn is_missing_value_error(err: &dyn Error) -> bool {
    let msg = err.to_string();
    msg.contains("No such file or directory") || msg.contains("Value file not found")
}
