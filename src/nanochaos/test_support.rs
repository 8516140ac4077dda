#![allow(dead_code)]

use std::env;
use std::fs;
use std::sync::{Mutex, MutexGuard, OnceLock};
use tempfile::TempDir;

pub struct TestLock {
    inner: Mutex<()>,
}

impl TestLock {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(()),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for TestLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Global mutex used by tests that manipulate the keyspace environment to
/// avoid interfering with each other when running in parallel.
pub fn keyspace_lock() -> &'static TestLock {
    static LOCK: OnceLock<TestLock> = OnceLock::new();
    LOCK.get_or_init(TestLock::new)
}

/// Global mutex for tests that mutate process environment variables.
pub fn env_lock() -> &'static TestLock {
    static LOCK: OnceLock<TestLock> = OnceLock::new();
    LOCK.get_or_init(TestLock::new)
}

pub struct KeyspaceEnv {
    _dir: TempDir,
    previous_keyspace: Option<String>,
    previous_lock: Option<String>,
}

impl Drop for KeyspaceEnv {
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

/// Points the keyspace at a fresh temporary directory for the duration of a
/// test. Callers must hold `keyspace_lock` first.
pub fn keyspace_env() -> KeyspaceEnv {
    let dir = tempfile::tempdir().expect("tempdir");
    let keyspace_dir = dir.path().join("keyspace");
    let lock_file = dir.path().join("keyspace.lock");
    fs::create_dir_all(&keyspace_dir).expect("keyspace dir");
    fs::File::create(&lock_file).expect("lock file");

    let previous_keyspace = env::var("NANOCHAOS_KEYSPACE").ok();
    let previous_lock = env::var("NANOCHAOS_LOCK_FILE").ok();
    env::set_var("NANOCHAOS_KEYSPACE", &keyspace_dir);
    env::set_var("NANOCHAOS_LOCK_FILE", &lock_file);

    KeyspaceEnv {
        _dir: dir,
        previous_keyspace,
        previous_lock,
    }
}
