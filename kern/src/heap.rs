//! Heap of garbage-collected arrays.
//!
//! Objects live in a slab indexed by opaque [`HeapHandle`]s and are
//! reclaimed by a stop-the-world mark-and-sweep pass. The heap never
//! decides when to collect: the dispatch core triggers a collection and
//! hands over the live prefix of the locals arena as the root set.

use std::fmt;

use log::debug;
use thiserror::Error;

use crate::Value;

/// Live-object count at which the first collection fires. The dispatch
/// core repaces the threshold after every collection.
pub const DEFAULT_COLLECT_THRESHOLD: usize = 256;

/// Opaque index into the heap's object table. Never a memory address.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HeapHandle(usize);

impl fmt::Display for HeapHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum HeapError {
    #[error("dead or invalid heap handle {handle}")]
    BadHandle { handle: HeapHandle },
    #[error("index {index} out of range for array {handle} of size {size}")]
    IndexOutOfBounds {
        handle: HeapHandle,
        index: i64,
        size: usize,
    },
}

#[derive(Debug, Default)]
pub struct HeapCreateInfo {
    pub collect_threshold: Option<usize>,
}

#[derive(Debug, Default, Copy, Clone)]
pub struct GarbageCollectionStats {
    pub collections: usize,
    pub objects_freed: usize,
}

#[derive(Debug)]
struct ArrayObject {
    marked: bool,
    items: Box<[Value]>,
}

#[derive(Debug)]
pub struct Heap {
    objects: Vec<Option<ArrayObject>>,
    free: Vec<usize>,
    live: usize,
    collect_threshold: usize,
    pub stats: GarbageCollectionStats,
}

impl Heap {
    #[must_use]
    pub fn new(info: HeapCreateInfo) -> Self {
        Self {
            objects: Vec::new(),
            free: Vec::new(),
            live: 0,
            collect_threshold: info
                .collect_threshold
                .unwrap_or(DEFAULT_COLLECT_THRESHOLD),
            stats: GarbageCollectionStats::default(),
        }
    }

    /// Allocates a fixed-length array with every slot zeroed.
    pub fn allocate(&mut self, capacity: usize) -> HeapHandle {
        let object = ArrayObject {
            marked: false,
            items: vec![Value::default(); capacity].into_boxed_slice(),
        };
        self.live += 1;

        match self.free.pop() {
            Some(index) => {
                self.objects[index] = Some(object);
                HeapHandle(index)
            }
            None => {
                self.objects.push(Some(object));
                HeapHandle(self.objects.len() - 1)
            }
        }
    }

    pub fn get(&self, handle: HeapHandle, index: usize) -> Result<Value, HeapError> {
        let object = self.object(handle)?;
        object
            .items
            .get(index)
            .copied()
            .ok_or(HeapError::IndexOutOfBounds {
                handle,
                index: index as i64,
                size: object.items.len(),
            })
    }

    pub fn set(
        &mut self,
        handle: HeapHandle,
        index: usize,
        value: Value,
    ) -> Result<(), HeapError> {
        let object = self.object_mut(handle)?;
        let size = object.items.len();
        let slot = object
            .items
            .get_mut(index)
            .ok_or(HeapError::IndexOutOfBounds {
                handle,
                index: index as i64,
                size,
            })?;
        *slot = value;
        Ok(())
    }

    pub fn size(&self, handle: HeapHandle) -> Result<usize, HeapError> {
        Ok(self.object(handle)?.items.len())
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live
    }

    #[must_use]
    pub fn collect_threshold(&self) -> usize {
        self.collect_threshold
    }

    pub fn set_collect_threshold(&mut self, threshold: usize) {
        self.collect_threshold = threshold;
    }

    /// Whether the next allocation point should trigger a collection.
    #[must_use]
    pub fn needs_collect(&self) -> bool {
        self.live >= self.collect_threshold
    }

    /// Stop-the-world mark and sweep. `roots` is the live prefix of the
    /// locals arena up to the current root boundary; everything
    /// reachable from it survives, everything else is reclaimed.
    pub fn collect(&mut self, roots: &[Value]) {
        let before = self.live;

        let mut worklist: Vec<usize> = Vec::new();
        for value in roots {
            if let Value::Array(HeapHandle(index)) = value {
                self.mark(*index, &mut worklist);
            }
        }
        while let Some(index) = worklist.pop() {
            let items: &[Value] = match &self.objects[index] {
                Some(object) => &object.items,
                None => continue,
            };
            let children: Vec<usize> = items
                .iter()
                .filter_map(|item| match item {
                    Value::Array(HeapHandle(child)) => Some(*child),
                    _ => None,
                })
                .collect();
            for child in children {
                self.mark(child, &mut worklist);
            }
        }

        for (index, slot) in self.objects.iter_mut().enumerate() {
            match slot {
                Some(object) if object.marked => object.marked = false,
                Some(_) => {
                    *slot = None;
                    self.free.push(index);
                    self.live -= 1;
                    self.stats.objects_freed += 1;
                }
                None => {}
            }
        }

        self.stats.collections += 1;
        debug!(
            "gc: {} -> {} live objects after collection {}",
            before, self.live, self.stats.collections
        );
    }

    fn mark(&mut self, index: usize, worklist: &mut Vec<usize>) {
        if let Some(Some(object)) = self.objects.get_mut(index) {
            if !object.marked {
                object.marked = true;
                worklist.push(index);
            }
        }
    }

    fn object(&self, handle: HeapHandle) -> Result<&ArrayObject, HeapError> {
        self.objects
            .get(handle.0)
            .and_then(Option::as_ref)
            .ok_or(HeapError::BadHandle { handle })
    }

    fn object_mut(&mut self, handle: HeapHandle) -> Result<&mut ArrayObject, HeapError> {
        self.objects
            .get_mut(handle.0)
            .and_then(Option::as_mut)
            .ok_or(HeapError::BadHandle { handle })
    }
}

#[cfg(test)]
mod heap_tests {
    use super::*;

    fn heap() -> Heap {
        Heap::new(HeapCreateInfo::default())
    }

    #[test]
    fn allocate_then_size_returns_requested_capacity() {
        let mut heap = heap();
        let handle = heap.allocate(5);
        assert_eq!(heap.size(handle), Ok(5));
        assert_eq!(heap.live_count(), 1);
    }

    #[test]
    fn set_then_get_round_trips_booleans_and_numbers() {
        let mut heap = heap();
        let handle = heap.allocate(2);
        heap.set(handle, 0, Value::Boolean(true)).unwrap();
        heap.set(handle, 1, Value::Number(2.5)).unwrap();
        assert_eq!(heap.get(handle, 0), Ok(Value::Boolean(true)));
        assert_eq!(heap.get(handle, 1), Ok(Value::Number(2.5)));
    }

    #[test]
    fn out_of_range_access_reports_handle_index_and_size() {
        let mut heap = heap();
        let handle = heap.allocate(2);
        assert_eq!(
            heap.get(handle, 2),
            Err(HeapError::IndexOutOfBounds {
                handle,
                index: 2,
                size: 2
            })
        );
        assert_eq!(
            heap.set(handle, 9, Value::Number(0.0)),
            Err(HeapError::IndexOutOfBounds {
                handle,
                index: 9,
                size: 2
            })
        );
    }

    #[test]
    fn collect_frees_unreachable_and_keeps_reachable() {
        let mut heap = heap();
        let kept = heap.allocate(1);
        let _dropped = heap.allocate(1);
        assert_eq!(heap.live_count(), 2);

        heap.collect(&[Value::Array(kept)]);

        assert_eq!(heap.live_count(), 1);
        assert_eq!(heap.stats.collections, 1);
        assert_eq!(heap.stats.objects_freed, 1);
        assert_eq!(heap.size(kept), Ok(1));
    }

    #[test]
    fn collect_follows_nested_references() {
        let mut heap = heap();
        let child = heap.allocate(1);
        let parent = heap.allocate(1);
        heap.set(parent, 0, Value::Array(child)).unwrap();

        heap.collect(&[Value::Array(parent)]);

        assert_eq!(heap.live_count(), 2);
        assert_eq!(heap.get(child, 0), Ok(Value::Number(0.0)));
    }

    #[test]
    fn collect_survives_cycles() {
        let mut heap = heap();
        let a = heap.allocate(1);
        let b = heap.allocate(1);
        heap.set(a, 0, Value::Array(b)).unwrap();
        heap.set(b, 0, Value::Array(a)).unwrap();

        heap.collect(&[Value::Array(a)]);
        assert_eq!(heap.live_count(), 2);

        heap.collect(&[]);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn dead_handle_is_reported_after_collection() {
        let mut heap = heap();
        let handle = heap.allocate(1);
        heap.collect(&[]);
        assert_eq!(heap.get(handle, 0), Err(HeapError::BadHandle { handle }));
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut heap = heap();
        let first = heap.allocate(1);
        heap.collect(&[]);
        let second = heap.allocate(1);
        assert_eq!(first, second, "slab slot should be recycled");
        assert_eq!(heap.live_count(), 1);
    }

    #[test]
    fn threshold_is_configurable_and_settable() {
        let mut heap = Heap::new(HeapCreateInfo {
            collect_threshold: Some(2),
        });
        assert!(!heap.needs_collect());
        heap.allocate(0);
        heap.allocate(0);
        assert!(heap.needs_collect());

        heap.set_collect_threshold(2 + heap.live_count() * 8);
        assert_eq!(heap.collect_threshold(), 18);
        assert!(!heap.needs_collect());
    }
}
