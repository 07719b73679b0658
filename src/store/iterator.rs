//! Paged record iteration
//!
//! The key list is fixed when the iterator is built; records are fetched
//! lazily one page (one MGET) at a time. Keys written afterwards are never
//! seen, and records deleted afterwards come back as `None`. A result cap
//! counts items actually yielded, so skipped records do not use it up.

use std::collections::VecDeque;

use super::async_store::AsyncObjectStore;
use super::object_store::ObjectStore;
use crate::error::Result;
use crate::record::StoredObject;

/// Page bookkeeping shared by the blocking and async iterators
#[derive(Debug)]
struct Pager<T> {
    keys: Vec<String>,
    page_size: usize,
    next: usize,
    buffer: VecDeque<Option<T>>,
    skip_missing: bool,
    failed: bool,
    max_results: Option<usize>,
    returned: usize,
}

impl<T> Pager<T> {
    fn new(keys: Vec<String>, page_size: usize, max_results: Option<usize>) -> Self {
        Self {
            keys,
            page_size: page_size.max(1),
            next: 0,
            buffer: VecDeque::new(),
            skip_missing: false,
            failed: false,
            max_results,
            returned: 0,
        }
    }

    fn exhausted(&self) -> bool {
        self.max_results.is_some_and(|max| self.returned >= max)
    }

    /// Next buffered item, honouring `skip_missing` and the result cap
    fn pop(&mut self) -> Option<Option<T>> {
        if self.exhausted() {
            return None;
        }
        while let Some(item) = self.buffer.pop_front() {
            if item.is_some() || !self.skip_missing {
                self.returned += 1;
                return Some(item);
            }
        }
        None
    }

    /// Keys of the next page to fetch, if any remain
    fn next_page(&mut self) -> Option<Vec<String>> {
        if self.failed || self.exhausted() || self.next >= self.keys.len() {
            return None;
        }
        let end = (self.next + self.page_size).min(self.keys.len());
        let page = self.keys[self.next..end].to_vec();
        self.next = end;
        Some(page)
    }

    fn rewind(&mut self) {
        self.next = 0;
        self.buffer.clear();
        self.failed = false;
        self.returned = 0;
    }
}

// =============================================================================
// Blocking iterator
// =============================================================================

/// Lazy paged iterator over a fixed snapshot of keys
pub struct ObjIter<T: StoredObject> {
    store: ObjectStore,
    pager: Pager<T>,
}

impl<T: StoredObject> ObjIter<T> {
    pub fn new(
        store: ObjectStore,
        keys: Vec<String>,
        page_size: usize,
        max_results: Option<usize>,
    ) -> Self {
        Self {
            store,
            pager: Pager::new(keys, page_size, max_results),
        }
    }

    /// Drop records that vanished since the snapshot instead of yielding `None`
    pub fn skip_missing(mut self) -> Self {
        self.pager.skip_missing = true;
        self
    }

    /// Start over from the first key of the snapshot
    pub fn rewind(&mut self) {
        self.pager.rewind();
    }

    pub fn keys(&self) -> &[String] {
        &self.pager.keys
    }
}

impl<T: StoredObject> Iterator for ObjIter<T> {
    type Item = Result<Option<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.pager.pop() {
                return Some(Ok(item));
            }
            let page = self.pager.next_page()?;
            match self.store.get_many_keys::<T>(page) {
                Ok(records) => self.pager.buffer.extend(records),
                Err(e) => {
                    self.pager.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

// =============================================================================
// Async cursor
// =============================================================================

/// Async counterpart of `ObjIter`; call `next().await` until `None`
pub struct AsyncObjIter<T: StoredObject> {
    store: AsyncObjectStore,
    pager: Pager<T>,
}

impl<T: StoredObject> AsyncObjIter<T> {
    pub fn new(
        store: AsyncObjectStore,
        keys: Vec<String>,
        page_size: usize,
        max_results: Option<usize>,
    ) -> Self {
        Self {
            store,
            pager: Pager::new(keys, page_size, max_results),
        }
    }

    pub fn skip_missing(mut self) -> Self {
        self.pager.skip_missing = true;
        self
    }

    pub fn rewind(&mut self) {
        self.pager.rewind();
    }

    pub fn keys(&self) -> &[String] {
        &self.pager.keys
    }

    pub async fn next(&mut self) -> Option<Result<Option<T>>> {
        loop {
            if let Some(item) = self.pager.pop() {
                return Some(Ok(item));
            }
            let page = self.pager.next_page()?;
            match self.store.get_many_keys::<T>(page).await {
                Ok(records) => self.pager.buffer.extend(records),
                Err(e) => {
                    self.pager.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }

    /// Drain the rest of the cursor
    pub async fn collect(mut self) -> Result<Vec<Option<T>>> {
        let mut out = Vec::new();
        while let Some(item) = self.next().await {
            out.push(item?);
        }
        Ok(out)
    }
}
