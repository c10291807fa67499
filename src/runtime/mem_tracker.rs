// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// A reservation that failed against the named tracker's limit.
#[derive(Debug, Clone)]
pub struct MemLimitExceeded {
    pub label: String,
    pub limit: i64,
    pub current: i64,
    pub requested: i64,
}

impl fmt::Display for MemLimitExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "memory limit exceeded on tracker '{}': limit={} current={} requested={}",
            self.label, self.limit, self.current, self.requested
        )
    }
}

impl std::error::Error for MemLimitExceeded {}

/// Bytes reserved against a tracker for a non-Arrow allocation
/// (selection vectors, encoded sort keys). Released on drop.
#[derive(Debug)]
pub struct TrackedBytes {
    bytes: i64,
    tracker: Arc<MemTracker>,
}

impl TrackedBytes {
    /// Unconditional reservation, for memory that already exists.
    pub fn new(bytes: usize, tracker: Arc<MemTracker>) -> Self {
        let bytes = i64::try_from(bytes).unwrap_or(i64::MAX);
        tracker.consume(bytes);
        Self { bytes, tracker }
    }

    /// Limit-checked reservation, for memory about to be allocated.
    pub fn try_new(bytes: usize, tracker: Arc<MemTracker>) -> Result<Self, MemLimitExceeded> {
        let bytes = i64::try_from(bytes).unwrap_or(i64::MAX);
        tracker.try_consume(bytes)?;
        Ok(Self { bytes, tracker })
    }

    pub fn bytes(&self) -> i64 {
        self.bytes
    }

    pub fn transfer_to(&mut self, tracker: Arc<MemTracker>) {
        if Arc::ptr_eq(&self.tracker, &tracker) {
            return;
        }
        self.tracker.release(self.bytes);
        tracker.consume(self.bytes);
        self.tracker = tracker;
    }
}

impl Drop for TrackedBytes {
    fn drop(&mut self) {
        self.tracker.release(self.bytes);
    }
}

/// Tracks logical memory usage for a component and its ancestors.
///
/// Only bytes explicitly reported by the caller are recorded; this is not RSS.
/// A negative limit means unlimited. `consume` never fails, `try_consume`
/// checks the limit of this tracker and every ancestor and leaves all of them
/// untouched on failure.
#[derive(Debug)]
pub struct MemTracker {
    label: String,
    limit: i64,
    parent: Option<Arc<MemTracker>>,
    current: AtomicI64,
    peak: AtomicI64,
    allocated: AtomicI64,
    deallocated: AtomicI64,
    children: Mutex<Vec<Weak<MemTracker>>>,
}

impl MemTracker {
    fn build(label: String, limit: i64, parent: Option<Arc<MemTracker>>) -> Arc<Self> {
        let tracker = Arc::new(Self {
            label,
            limit,
            parent,
            current: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            allocated: AtomicI64::new(0),
            deallocated: AtomicI64::new(0),
            children: Mutex::new(Vec::new()),
        });
        if let Some(parent) = tracker.parent.as_ref() {
            let mut children = parent.children.lock().unwrap_or_else(|e| e.into_inner());
            children.retain(|child| child.strong_count() > 0);
            children.push(Arc::downgrade(&tracker));
        }
        tracker
    }

    /// Create an unlimited root tracker.
    pub fn new_root(label: impl Into<String>) -> Arc<Self> {
        Self::build(label.into(), -1, None)
    }

    pub fn new_root_with_limit(label: impl Into<String>, limit: i64) -> Arc<Self> {
        Self::build(label.into(), limit, None)
    }

    /// Create an unlimited child tracker.
    pub fn new_child(label: impl Into<String>, parent: &Arc<MemTracker>) -> Arc<Self> {
        Self::build(label.into(), -1, Some(Arc::clone(parent)))
    }

    pub fn new_child_with_limit(
        label: impl Into<String>,
        limit: i64,
        parent: &Arc<MemTracker>,
    ) -> Arc<Self> {
        Self::build(label.into(), limit, Some(Arc::clone(parent)))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    pub fn has_limit(&self) -> bool {
        self.limit >= 0
    }

    pub fn parent(&self) -> Option<&Arc<MemTracker>> {
        self.parent.as_ref()
    }

    /// Limit of the closest limited ancestor (the enclosing context).
    pub fn nearest_ancestor_limit(&self) -> Option<i64> {
        let mut tracker = self.parent.as_deref();
        while let Some(current) = tracker {
            if current.has_limit() {
                return Some(current.limit);
            }
            tracker = current.parent.as_deref();
        }
        None
    }

    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> i64 {
        self.peak.load(Ordering::Relaxed)
    }

    pub fn allocated(&self) -> i64 {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn deallocated(&self) -> i64 {
        self.deallocated.load(Ordering::Relaxed)
    }

    pub fn children(&self) -> Vec<Arc<MemTracker>> {
        let mut guard = self.children.lock().unwrap_or_else(|e| e.into_inner());
        guard.retain(|child| child.strong_count() > 0);
        guard.iter().filter_map(Weak::upgrade).collect()
    }

    #[cfg(test)]
    fn registered_children(&self) -> usize {
        self.children.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Increase consumption for this tracker and all ancestors.
    pub fn consume(&self, bytes: i64) {
        if bytes <= 0 {
            return;
        }
        let mut tracker: Option<&MemTracker> = Some(self);
        while let Some(current) = tracker {
            let new_value = current.current.fetch_add(bytes, Ordering::AcqRel) + bytes;
            current.allocated.fetch_add(bytes, Ordering::AcqRel);
            current.update_peak(new_value);
            tracker = current.parent.as_deref();
        }
    }

    /// Increase consumption unless it would push this tracker or an ancestor
    /// over its limit.
    pub fn try_consume(&self, bytes: i64) -> Result<(), MemLimitExceeded> {
        if bytes <= 0 {
            return Ok(());
        }
        let mut charged: Vec<&MemTracker> = Vec::new();
        let mut tracker: Option<&MemTracker> = Some(self);
        while let Some(current) = tracker {
            let new_value = current.current.fetch_add(bytes, Ordering::AcqRel) + bytes;
            if current.has_limit() && new_value > current.limit {
                current.current.fetch_sub(bytes, Ordering::AcqRel);
                for done in charged {
                    done.current.fetch_sub(bytes, Ordering::AcqRel);
                }
                return Err(MemLimitExceeded {
                    label: current.label.clone(),
                    limit: current.limit,
                    current: new_value - bytes,
                    requested: bytes,
                });
            }
            charged.push(current);
            tracker = current.parent.as_deref();
        }
        for current in charged {
            current.allocated.fetch_add(bytes, Ordering::AcqRel);
            current.update_peak(current.current());
        }
        Ok(())
    }

    /// Decrease consumption for this tracker and all ancestors.
    pub fn release(&self, bytes: i64) {
        if bytes <= 0 {
            return;
        }
        let mut tracker: Option<&MemTracker> = Some(self);
        while let Some(current) = tracker {
            current.current.fetch_sub(bytes, Ordering::AcqRel);
            current.deallocated.fetch_add(bytes, Ordering::AcqRel);
            tracker = current.parent.as_deref();
        }
    }

    fn update_peak(&self, value: i64) {
        let mut prev = self.peak.load(Ordering::Relaxed);
        while value > prev {
            match self
                .peak
                .compare_exchange(prev, value, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => prev = actual,
            }
        }
    }
}

static PROCESS_TRACKER: OnceLock<Arc<MemTracker>> = OnceLock::new();

/// Global process-level logical memory tracker.
pub fn process_mem_tracker() -> Arc<MemTracker> {
    Arc::clone(PROCESS_TRACKER.get_or_init(|| MemTracker::new_root("process")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_propagates_to_ancestors() {
        let root = MemTracker::new_root("root");
        let child = MemTracker::new_child("child", &root);
        child.consume(100);
        assert_eq!(child.current(), 100);
        assert_eq!(root.current(), 100);
        child.release(40);
        assert_eq!(root.current(), 60);
        assert_eq!(root.peak(), 100);
        assert_eq!(root.children().len(), 1);
    }

    #[test]
    fn dropped_children_are_pruned() {
        let fragment = MemTracker::new_root("fragment");
        for i in 0..10 {
            let op = MemTracker::new_child(format!("op_{i}"), &fragment);
            op.consume(1);
            op.release(1);
        }
        assert!(fragment.registered_children() <= 1);
        let live = MemTracker::new_child("live", &fragment);
        assert_eq!(fragment.registered_children(), 1);
        assert_eq!(fragment.children().len(), 1);
        drop(live);
        assert!(fragment.children().is_empty());
        assert_eq!(fragment.registered_children(), 0);
    }

    #[test]
    fn try_consume_fails_on_ancestor_limit_without_side_effects() {
        let fragment = MemTracker::new_root_with_limit("fragment", 1000);
        let op = MemTracker::new_child_with_limit("op", 800, &fragment);
        let other = MemTracker::new_child("other", &fragment);
        other.consume(300);

        op.try_consume(600).expect("fits");
        let err = op.try_consume(150).expect_err("fragment limit");
        assert_eq!(err.label, "fragment");
        assert_eq!(op.current(), 600);
        assert_eq!(fragment.current(), 900);

        let err = op.try_consume(250).expect_err("op limit");
        assert_eq!(err.label, "op");
        assert_eq!(fragment.current(), 900);
    }

    #[test]
    fn nearest_ancestor_limit_skips_unlimited_levels() {
        let query = MemTracker::new_root_with_limit("query", 4096);
        let fragment = MemTracker::new_child("fragment", &query);
        let op = MemTracker::new_child_with_limit("op", 1024, &fragment);
        assert_eq!(op.nearest_ancestor_limit(), Some(4096));
        assert_eq!(query.nearest_ancestor_limit(), None);
    }

    #[test]
    fn tracked_bytes_release_on_drop_and_transfer() {
        let a = MemTracker::new_root("a");
        let b = MemTracker::new_root_with_limit("b", 10);
        let mut bytes = TrackedBytes::new(8, Arc::clone(&a));
        assert_eq!(a.current(), 8);
        bytes.transfer_to(Arc::clone(&b));
        assert_eq!(a.current(), 0);
        assert_eq!(b.current(), 8);
        assert!(TrackedBytes::try_new(4, Arc::clone(&b)).is_err());
        drop(bytes);
        assert_eq!(b.current(), 0);
    }
}
