use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Serializes kernel mutations per interface name across reconcilers.
#[derive(Clone, Debug, Default)]
pub struct InterfaceLocks {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl InterfaceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` while holding the lock for `name`.
    pub fn run<T>(&self, name: &str, f: impl FnOnce() -> T) -> T {
        let lock = {
            let mut locks = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(name.to_string()).or_default().clone()
        };
        // a panicking holder leaves no state behind the unit value
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }
}
