//! Reference-counted backend handles shared between resources.
//!
//! Several resources often talk to the same remote backend with the same
//! credentials (one testbed account, one SSH login). Drivers acquire a handle
//! keyed by a digest of those credentials; the first acquisition builds it,
//! later ones share it, and it is torn down when the last holder releases it.

use sha2::{Digest, Sha256};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::utils::lock_unpoisoned;

/// A backend connection that can be shared between resources
pub trait BackendHandle: Send + Sync + 'static {
    /// Called once when the last holder releases the handle
    fn teardown(&self) {}
}

struct Entry {
    handle: Arc<dyn Any + Send + Sync>,
    count: usize,
    teardown: Box<dyn Fn() + Send + Sync>,
}

#[derive(Default)]
pub struct SharedHandles {
    entries: Mutex<HashMap<String, Entry>>,
}

impl std::fmt::Debug for SharedHandles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedHandles")
            .field("handles", &self.len())
            .finish()
    }
}

/// Digest of the credential parts identifying a handle
pub fn handle_key<S: AsRef<str>>(parts: &[S]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref().as_bytes());
        hasher.update([0x1f]);
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

impl SharedHandles {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        lock_unpoisoned(&self.entries)
    }

    /// Get the handle for `parts`, building it with `factory` on first use
    pub fn acquire<H, F, S>(&self, parts: &[S], factory: F) -> anyhow::Result<Arc<H>>
    where
        H: BackendHandle,
        F: FnOnce() -> anyhow::Result<H>,
        S: AsRef<str>,
    {
        let key = handle_key(parts);
        let mut entries = self.entries();

        if let Some(entry) = entries.get_mut(&key) {
            let handle = Arc::clone(&entry.handle)
                .downcast::<H>()
                .map_err(|_| anyhow::anyhow!("shared handle {} has a different type", &key[..12]))?;
            entry.count += 1;
            debug!("Shared handle {} acquired (holders: {})", &key[..12], entry.count);
            return Ok(handle);
        }

        let handle = Arc::new(factory()?);
        let for_teardown = Arc::clone(&handle);
        entries.insert(
            key.clone(),
            Entry {
                handle: Arc::clone(&handle) as Arc<dyn Any + Send + Sync>,
                count: 1,
                teardown: Box::new(move || for_teardown.teardown()),
            },
        );
        debug!("Shared handle {} created", &key[..12]);
        Ok(handle)
    }

    /// Drop one reference. Returns `true` when this tore the handle down.
    pub fn release<S: AsRef<str>>(&self, parts: &[S]) -> bool {
        let key = handle_key(parts);
        let removed = {
            let mut entries = self.entries();
            let Some(entry) = entries.get_mut(&key) else {
                return false;
            };
            entry.count -= 1;
            if entry.count > 0 {
                debug!("Shared handle {} released (holders: {})", &key[..12], entry.count);
                return false;
            }
            entries.remove(&key)
        };

        match removed {
            Some(entry) => {
                (entry.teardown)();
                debug!("Shared handle {} torn down", &key[..12]);
                true
            }
            None => false,
        }
    }

    /// Number of holders of the handle for `parts`
    pub fn holders<S: AsRef<str>>(&self, parts: &[S]) -> usize {
        self.entries()
            .get(&handle_key(parts))
            .map_or(0, |entry| entry.count)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tear down whatever is still held
    pub fn teardown_all(&self) {
        let leftovers: Vec<Entry> = self.entries().drain().map(|(_, entry)| entry).collect();
        if !leftovers.is_empty() {
            warn!("Tearing down {} shared handles still held at shutdown", leftovers.len());
        }
        for entry in leftovers {
            (entry.teardown)();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Session {
        torn_down: Arc<AtomicUsize>,
    }

    impl BackendHandle for Session {
        fn teardown(&self) {
            self.torn_down.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_same_credentials_share_one_handle() {
        let handles = SharedHandles::new();
        let built = Arc::new(AtomicUsize::new(0));
        let torn_down = Arc::new(AtomicUsize::new(0));

        let make = || {
            built.fetch_add(1, Ordering::SeqCst);
            Ok(Session {
                torn_down: Arc::clone(&torn_down),
            })
        };

        let creds = ["testbed", "alice", "secret"];
        let first = handles.acquire(&creds, make).unwrap();
        let second = handles.acquire(&creds, make).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert_eq!(handles.holders(&creds), 2);

        assert!(!handles.release(&creds));
        assert_eq!(torn_down.load(Ordering::SeqCst), 0);
        assert!(handles.release(&creds));
        assert_eq!(torn_down.load(Ordering::SeqCst), 1);
        assert!(handles.is_empty());
    }

    #[test]
    fn test_different_credentials_get_different_handles() {
        let handles = SharedHandles::new();
        let torn_down = Arc::new(AtomicUsize::new(0));
        let a = handles
            .acquire(&["alice"], || Ok(Session { torn_down: Arc::clone(&torn_down) }))
            .unwrap();
        let b = handles
            .acquire(&["bob"], || Ok(Session { torn_down: Arc::clone(&torn_down) }))
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(handles.len(), 2);
    }

    #[test]
    fn test_registry_survives_panicking_factory() {
        let handles = SharedHandles::new();
        let torn_down = Arc::new(AtomicUsize::new(0));

        let crashed = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            handles.acquire(&["alice"], || -> anyhow::Result<Session> {
                panic!("backend unreachable")
            })
        }));
        assert!(crashed.is_err());
        assert!(handles.is_empty());

        handles
            .acquire(&["alice"], || Ok(Session { torn_down: Arc::clone(&torn_down) }))
            .unwrap();
        assert_eq!(handles.holders(&["alice"]), 1);
    }

    #[test]
    fn test_release_of_unknown_key() {
        let handles = SharedHandles::new();
        assert!(!handles.release(&["nobody"]));
    }

    #[test]
    fn test_key_is_not_ambiguous() {
        assert_ne!(handle_key(&["ab", "c"]), handle_key(&["a", "bc"]));
        assert_eq!(handle_key(&["a"]).len(), 64);
    }

    #[test]
    fn test_factory_error_leaves_no_entry() {
        let handles = SharedHandles::new();
        let result: anyhow::Result<Arc<Session>> =
            handles.acquire(&["x"], || anyhow::bail!("login refused"));
        assert!(result.is_err());
        assert!(handles.is_empty());
    }

    #[test]
    fn test_teardown_all() {
        let handles = SharedHandles::new();
        let torn_down = Arc::new(AtomicUsize::new(0));
        handles
            .acquire(&["leak"], || Ok(Session { torn_down: Arc::clone(&torn_down) }))
            .unwrap();
        handles.teardown_all();
        assert_eq!(torn_down.load(Ordering::SeqCst), 1);
        assert!(handles.is_empty());
    }
}
