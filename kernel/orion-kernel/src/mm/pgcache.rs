//! Per-file page cache.
//!
//! A radix tree with fanout 64 keyed by byte offset (page-granular);
//! leaves hold refcounted pages shared with mappings and the I/O paths.
//! The cache object itself is shared (`Arc<PageCache>`) so several
//! mappings of one file use a single tree.

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;

use crate::addr::PAGE_SHIFT;
use crate::mm::frames::Page;
use crate::sync::SpinMutex;

/// log2 of the radix fanout.
const FANOUT_BITS: u32 = 6;
/// Children per node.
const FANOUT: usize = 1 << FANOUT_BITS;

enum Child {
    Node(Box<Node>),
    Leaf(Arc<Page>),
}

struct Node {
    children: [Option<Child>; FANOUT],
}

impl Node {
    fn new() -> Box<Self> {
        Box::new(Self { children: core::array::from_fn(|_| None) })
    }
}

struct CacheInner {
    root: Option<Box<Node>>,
    /// Levels of nodes; keys below `64^height` fit. 0 = empty tree.
    height: u32,
    count: usize,
}

/// A page cache: byte offset → page.
pub struct PageCache {
    inner: SpinMutex<CacheInner>,
}

impl PageCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: SpinMutex::named(
                "pgcache",
                CacheInner { root: None, height: 0, count: 0 },
            ),
        }
    }

    /// Number of cached pages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().count
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a counted reference to the page at `offset`, if cached.
    #[must_use]
    pub fn lookup(&self, offset: u64) -> Option<Arc<Page>> {
        let key = offset >> PAGE_SHIFT;
        let inner = self.inner.lock();
        if inner.height == 0 || key >= capacity(inner.height) {
            return None;
        }
        let mut node = inner.root.as_ref()?;
        for level in (1..inner.height).rev() {
            match node.children[digit(key, level)].as_ref()? {
                Child::Node(sub) => node = sub,
                Child::Leaf(_) => return None,
            }
        }
        match node.children[digit(key, 0)].as_ref()? {
            Child::Leaf(page) => Some(page.clone()),
            Child::Node(_) => None,
        }
    }

    /// Inserts `page` at `offset`, returning the page it replaced.
    pub fn insert(&self, offset: u64, page: Arc<Page>) -> Option<Arc<Page>> {
        let key = offset >> PAGE_SHIFT;
        let mut inner = self.inner.lock();

        if inner.root.is_none() {
            inner.root = Some(Node::new());
            inner.height = 1;
        }
        // Grow the tree until the key fits: the old root becomes child 0
        // of a taller root.
        while key >= capacity(inner.height) {
            let old_root = inner.root.take().expect("root exists");
            let mut new_root = Node::new();
            new_root.children[0] = Some(Child::Node(old_root));
            inner.root = Some(new_root);
            inner.height += 1;
        }

        let height = inner.height;
        let mut node = inner.root.as_mut().expect("root exists");
        for level in (1..height).rev() {
            let slot = &mut node.children[digit(key, level)];
            if slot.is_none() {
                *slot = Some(Child::Node(Node::new()));
            }
            match slot.as_mut().expect("slot just filled") {
                Child::Node(sub) => node = sub,
                Child::Leaf(_) => unreachable!("leaf above level 0"),
            }
        }

        let slot = &mut node.children[digit(key, 0)];
        let old = match slot.take() {
            Some(Child::Leaf(old)) => Some(old),
            _ => None,
        };
        *slot = Some(Child::Leaf(page));
        if old.is_none() {
            inner.count += 1;
        }
        old
    }

    /// Removes the page at `offset`, returning it.
    pub fn remove(&self, offset: u64) -> Option<Arc<Page>> {
        let key = offset >> PAGE_SHIFT;
        let mut inner = self.inner.lock();
        if inner.height == 0 || key >= capacity(inner.height) {
            return None;
        }
        let height = inner.height;
        let mut node = inner.root.as_mut()?;
        for level in (1..height).rev() {
            match node.children[digit(key, level)].as_mut()? {
                Child::Node(sub) => node = sub,
                Child::Leaf(_) => return None,
            }
        }
        match node.children[digit(key, 0)].take() {
            Some(Child::Leaf(page)) => {
                inner.count -= 1;
                Some(page)
            }
            other => {
                node.children[digit(key, 0)] = other;
                None
            }
        }
    }

    /// Visits cached pages with offsets in `[start, end)`, in order.
    pub fn visit_pages(&self, start: u64, end: u64, mut f: impl FnMut(u64, &Arc<Page>)) {
        let inner = self.inner.lock();
        let Some(root) = inner.root.as_ref() else {
            return;
        };
        let start_key = start >> PAGE_SHIFT;
        let end_key = end.div_ceil(1 << PAGE_SHIFT);
        visit_node(root, inner.height - 1, 0, start_key, end_key, &mut f);
    }

    /// Produces a new cache holding the same pages (refcounts bumped).
    #[must_use]
    pub fn clone_cache(&self) -> PageCache {
        let inner = self.inner.lock();
        let new = PageCache::new();
        {
            let mut dst = new.inner.lock();
            dst.height = inner.height;
            dst.count = inner.count;
            dst.root = inner.root.as_ref().map(|n| clone_node(n));
        }
        drop(inner);
        new
    }
}

impl Default for PageCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Capacity in keys of a tree of the given height.
fn capacity(height: u32) -> u64 {
    1u64.checked_shl(height * FANOUT_BITS).unwrap_or(u64::MAX)
}

/// The radix digit of `key` at `level`.
fn digit(key: u64, level: u32) -> usize {
    ((key >> (level * FANOUT_BITS)) & (FANOUT as u64 - 1)) as usize
}

fn visit_node(
    node: &Node,
    level: u32,
    prefix: u64,
    start_key: u64,
    end_key: u64,
    f: &mut impl FnMut(u64, &Arc<Page>),
) {
    for (i, slot) in node.children.iter().enumerate() {
        let Some(child) = slot else { continue };
        let sub_prefix = prefix | ((i as u64) << (level * FANOUT_BITS));
        match child {
            Child::Leaf(page) => {
                if sub_prefix >= start_key && sub_prefix < end_key {
                    f(sub_prefix << PAGE_SHIFT, page);
                }
            }
            Child::Node(sub) => {
                // Prune subtrees entirely outside the range.
                let span = capacity(level);
                if sub_prefix >= end_key || sub_prefix + span <= start_key {
                    continue;
                }
                visit_node(sub, level - 1, sub_prefix, start_key, end_key, f);
            }
        }
    }
}

fn clone_node(node: &Node) -> Box<Node> {
    let mut new = Node::new();
    for (i, slot) in node.children.iter().enumerate() {
        new.children[i] = slot.as_ref().map(|child| match child {
            Child::Leaf(page) => Child::Leaf(page.clone()),
            Child::Node(sub) => Child::Node(clone_node(sub)),
        });
    }
    new
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::PhysAddr;
    use crate::mm::PageSize;
    use crate::mm::frames::PhysAllocator;

    fn page(addr: u64) -> Arc<Page> {
        PhysAllocator::new()
            .alloc_nonowned_pages_at(PhysAddr::new(addr), 1, PageSize::Size4K)
            .unwrap()
            .pop()
            .unwrap()
    }

    #[test]
    fn insert_lookup_roundtrip() {
        let cache = PageCache::new();
        let p = page(0x7000);
        assert!(cache.insert(0x3000, p.clone()).is_none());
        let got = cache.lookup(0x3000).expect("hit");
        assert!(Arc::ptr_eq(&p, &got));
        assert!(cache.lookup(0x4000).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn insert_replaces_atomically() {
        let cache = PageCache::new();
        let a = page(0x7000);
        let b = page(0x8000);
        cache.insert(0x1000, a.clone());
        let old = cache.insert(0x1000, b.clone()).expect("replaced");
        assert!(Arc::ptr_eq(&old, &a));
        assert!(Arc::ptr_eq(&cache.lookup(0x1000).unwrap(), &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn remove_returns_page() {
        let cache = PageCache::new();
        let p = page(0x7000);
        cache.insert(0x2000, p.clone());
        let q = cache.remove(0x2000).expect("removed");
        assert!(Arc::ptr_eq(&p, &q));
        assert!(cache.lookup(0x2000).is_none());
        assert!(cache.remove(0x2000).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn large_offsets_grow_the_tree() {
        let cache = PageCache::new();
        // Offsets spanning several radix levels (fanout 64 → 6 bits/level).
        let offsets = [0u64, 0x1000, 63 << 12, 64 << 12, (64 * 64 + 7) << 12, 1 << 40];
        for (i, &off) in offsets.iter().enumerate() {
            cache.insert(off, page(0x10_0000 + (i as u64) * 0x1000));
        }
        assert_eq!(cache.len(), offsets.len());
        for (i, &off) in offsets.iter().enumerate() {
            let p = cache.lookup(off).expect("hit");
            assert_eq!(p.address().as_u64(), 0x10_0000 + (i as u64) * 0x1000);
        }
    }

    #[test]
    fn visit_walks_in_order_within_range() {
        let cache = PageCache::new();
        for i in 0..10u64 {
            cache.insert(i << 12, page(0x10_0000 + i * 0x1000));
        }
        let mut seen = Vec::new();
        cache.visit_pages(0x2000, 0x6000, |off, _| seen.push(off));
        assert_eq!(seen, vec![0x2000, 0x3000, 0x4000, 0x5000]);
    }

    #[test]
    fn visit_spans_levels() {
        let cache = PageCache::new();
        cache.insert(63 << 12, page(0x10_0000));
        cache.insert(64 << 12, page(0x10_1000));
        cache.insert(65 << 12, page(0x10_2000));
        let mut seen = Vec::new();
        cache.visit_pages(63 << 12, 66 << 12, |off, _| seen.push(off >> 12));
        assert_eq!(seen, vec![63, 64, 65]);
    }

    #[test]
    fn clone_shares_pages() {
        let cache = PageCache::new();
        let p = page(0x7000);
        cache.insert(0x1000, p.clone());
        let copy = cache.clone_cache();
        let got = copy.lookup(0x1000).expect("hit in clone");
        assert!(Arc::ptr_eq(&p, &got));
        // Refcount: p + original + clone.
        assert_eq!(Arc::strong_count(&p), 3);
        // The copies are independent trees.
        copy.remove(0x1000);
        assert!(cache.lookup(0x1000).is_some());
    }
}
