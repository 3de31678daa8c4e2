// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Concurrent linked list backing the pending-evidence scan.
//!
//! Elements are reference counted; a cursor holds an `Arc` to the element it
//! sits on, so eviction never invalidates it. `next_wait` resolves when a
//! successor is appended or the element itself is evicted; a consumer that
//! then observes `next() == None` restarts from the head.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Weak,
};

use parking_lot::Mutex;
use tokio::sync::Notify;

pub struct ListElement<T> {
    value: T,
    links: Mutex<Links<T>>,
    changed: Notify,
}

struct Links<T> {
    next: Option<Arc<ListElement<T>>>,
    prev: Weak<ListElement<T>>,
    removed: bool,
}

impl<T> ListElement<T> {
    pub fn value(&self) -> &T {
        &self.value
    }

    /// The successor, or None at the tail and on evicted elements.
    pub fn next(&self) -> Option<Arc<ListElement<T>>> {
        let links = self.links.lock();
        if links.removed {
            return None;
        }
        links.next.clone()
    }

    pub fn is_removed(&self) -> bool {
        self.links.lock().removed
    }

    /// Resolves once a successor exists or this element has been evicted.
    pub async fn next_wait(&self) {
        loop {
            let notified = self.changed.notified();
            {
                let links = self.links.lock();
                if links.removed || links.next.is_some() {
                    return;
                }
            }
            notified.await;
        }
    }
}

pub struct ConcurrentList<T> {
    inner: Mutex<ListInner<T>>,
    non_empty: Notify,
    len: AtomicUsize,
}

struct ListInner<T> {
    head: Option<Arc<ListElement<T>>>,
    tail: Option<Arc<ListElement<T>>>,
}

impl<T> Default for ConcurrentList<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(ListInner {
                head: None,
                tail: None,
            }),
            non_empty: Notify::new(),
            len: AtomicUsize::new(0),
        }
    }
}

impl<T> ConcurrentList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn front(&self) -> Option<Arc<ListElement<T>>> {
        self.inner.lock().head.clone()
    }

    /// Resolves once the list is non-empty.
    pub async fn wait_non_empty(&self) {
        loop {
            let notified = self.non_empty.notified();
            if self.inner.lock().head.is_some() {
                return;
            }
            notified.await;
        }
    }

    pub fn push_back(&self, value: T) -> Arc<ListElement<T>> {
        let element = Arc::new(ListElement {
            value,
            links: Mutex::new(Links {
                next: None,
                prev: Weak::new(),
                removed: false,
            }),
            changed: Notify::new(),
        });

        let mut inner = self.inner.lock();
        match inner.tail.take() {
            Some(tail) => {
                tail.links.lock().next = Some(element.clone());
                element.links.lock().prev = Arc::downgrade(&tail);
                inner.tail = Some(element.clone());
                drop(inner);
                tail.changed.notify_waiters();
            }
            None => {
                inner.head = Some(element.clone());
                inner.tail = Some(element.clone());
                drop(inner);
                self.non_empty.notify_waiters();
            }
        }
        self.len.fetch_add(1, Ordering::Release);
        element
    }

    /// Unlinks the element and wakes any cursor waiting on it. Removing an
    /// already-removed element is a no-op.
    pub fn remove(&self, element: &Arc<ListElement<T>>) {
        let mut inner = self.inner.lock();

        let (prev, next) = {
            let mut links = element.links.lock();
            if links.removed {
                return;
            }
            links.removed = true;
            let prev = links.prev.upgrade();
            links.prev = Weak::new();
            (prev, links.next.take())
        };

        match &prev {
            Some(prev) => prev.links.lock().next = next.clone(),
            None => inner.head = next.clone(),
        }
        match &next {
            Some(next) => {
                next.links.lock().prev = prev
                    .as_ref()
                    .map(Arc::downgrade)
                    .unwrap_or_else(Weak::new);
            }
            None => inner.tail = prev,
        }
        self.len.fetch_sub(1, Ordering::Release);
        drop(inner);
        element.changed.notify_waiters();
    }

    /// Clones out the current contents, head to tail.
    pub fn iter_values(&self) -> Vec<T>
    where
        T: Clone,
    {
        let mut values = Vec::with_capacity(self.len());
        let mut cursor = self.front();
        while let Some(element) = cursor {
            values.push(element.value().clone());
            cursor = element.next();
        }
        values
    }
}
