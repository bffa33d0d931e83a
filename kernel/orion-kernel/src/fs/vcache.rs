//! The absolute-path resolution cache.
//!
//! Keyed by the full absolute path string, holding weak ventry
//! references so the cache never keeps names alive on its own. Hits are
//! validated by the resolver (the entry must still be linked); misses
//! and dead weak entries fall through to the full walk, which
//! re-populates intermediate components as it goes.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::{Arc, Weak};

use crate::sync::SpinMutex;

use super::ventry::{Ventry, VentryFlags};

static CACHE: SpinMutex<BTreeMap<String, Weak<Ventry>>> =
    SpinMutex::named("VCACHE", BTreeMap::new());

/// Looks up an absolute path, dropping dead entries on the way.
#[must_use]
pub fn lookup(path: &str) -> Option<Arc<Ventry>> {
    let mut cache = CACHE.lock();
    match cache.get(path) {
        Some(weak) => match weak.upgrade() {
            Some(ve) if ve.flags().contains(VentryFlags::LINKED) => Some(ve),
            _ => {
                cache.remove(path);
                None
            }
        },
        None => None,
    }
}

/// Inserts a resolved path.
pub fn insert(path: &str, ve: &Arc<Ventry>) {
    CACHE.lock().insert(String::from(path), Arc::downgrade(ve));
}

/// Drops one path.
pub fn invalidate(path: &str) {
    CACHE.lock().remove(path);
}

/// Drops every cached path under `prefix` (unmount, rename of a dir).
pub fn invalidate_prefix(prefix: &str) {
    let mut cache = CACHE.lock();
    cache.retain(|path, _| {
        !(path == prefix
            || (path.starts_with(prefix)
                && (prefix.ends_with('/') || path.as_bytes().get(prefix.len()) == Some(&b'/'))))
    });
}

/// Number of cached paths (diagnostic).
#[must_use]
pub fn len() -> usize {
    CACHE.lock().len()
}
