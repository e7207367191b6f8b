use std::cell::UnsafeCell;
use std::collections::{HashSet, VecDeque};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use thread_local::ThreadLocal;

/// A hazard-pointer based memory manager for lock-free structures.
///
/// This is an implementation of the scheme described in [Hazard Pointers:
/// Safe Memory Reclamation for Lock-Free Objects](https://ieeexplore.ieee.org/document/1291819).
/// Before dereferencing a shared pointer, a thread publishes it in one of its
/// hazard slots; `retire` defers the free until no published slot still
/// references the record, so a node is freed at most once and never while an
/// in-flight operation could dereference it.
pub struct HPBRManager<T: Send> {
    thread_info: ThreadLocal<UnsafeCell<ThreadLocalInfo<T>>>,
    head: AtomicPtr<HazardPointer<T>>,
    max_retired: usize,
    num_hp_per_thread: usize,
}

impl<T: Send> HPBRManager<T> {
    /// Create a new manager handing out `num_hp_per_thread` hazard slots per
    /// thread and scanning once a thread has `max_retired` records waiting.
    pub fn new(max_retired: usize, num_hp_per_thread: usize) -> Self {
        HPBRManager {
            thread_info: ThreadLocal::new(),
            head: AtomicPtr::default(),
            max_retired,
            num_hp_per_thread,
        }
    }

    /// Publish `record` in this thread's hazard slot `hazard_num`.
    ///
    /// The store is SeqCst so a concurrent scan cannot miss it. The caller
    /// must re-validate the source pointer after protecting: the record may
    /// already have been unlinked when the slot was written.
    pub fn protect(&self, record: *mut T, hazard_num: usize) {
        unsafe {
            let thread_info = self.get_mut_thread_info();
            thread_info.hazard(hazard_num).protected.store(record, Ordering::SeqCst);
        }
    }

    /// Clear this thread's hazard slot `hazard_num`.
    pub fn unprotect(&self, hazard_num: usize) {
        self.protect(ptr::null_mut(), hazard_num);
    }

    /// Mark `record` as logically removed. It is freed by a later scan, once
    /// no thread's published slots reference it.
    pub fn retire(&self, record: *mut T, hazard_num: usize) {
        unsafe {
            let thread_info = self.get_mut_thread_info();
            thread_info.hazard(hazard_num).protected.store(ptr::null_mut(), Ordering::SeqCst);
            thread_info.retired_list.push_back(record);
            thread_info.retired_number += 1;

            if thread_info.retired_number > self.max_retired {
                self.scan();
            }
        }
    }

    /// Free every record this thread has retired that no hazard slot of any
    /// thread currently protects.
    pub fn scan(&self) {
        let mut hazard_set: HashSet<*mut T> = HashSet::new();
        let mut current = self.head.load(Ordering::SeqCst);

        while !current.is_null() {
            unsafe {
                let hazard_pointer = &*current;
                let protected = hazard_pointer.protected.load(Ordering::SeqCst);
                if !protected.is_null() {
                    hazard_set.insert(protected);
                }
                current = hazard_pointer.next.load(Ordering::Acquire);
            }
        }

        let mut new_retired_list: VecDeque<*mut T> = VecDeque::new();
        unsafe {
            let thread_info = self.get_mut_thread_info();
            for ptr in thread_info.retired_list.drain(..) {
                if hazard_set.contains(&ptr) {
                    new_retired_list.push_back(ptr);
                } else {
                    Self::free(ptr);
                }
            }
            thread_info.retired_number = new_retired_list.len();
            thread_info.retired_list = new_retired_list;
        }
    }

    fn free(garbage: *mut T) {
        unsafe {
            drop(Box::from_raw(garbage));
        }
    }

    /// CAS-push a new hazard record onto the global list. Records are only
    /// removed when the manager itself is dropped.
    fn allocate_hp(&self) -> *mut HazardPointer<T> {
        let new_hp_ptr = Box::into_raw(Box::new(HazardPointer::new()));
        loop {
            let old_head = self.head.load(Ordering::Acquire);
            unsafe {
                (*new_hp_ptr).next.store(old_head, Ordering::Release);
            }
            if self
                .head
                .compare_exchange(old_head, new_hp_ptr, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        new_hp_ptr
    }

    /// Get the thread-local info as a mutable reference. On first access,
    /// allocates this thread's hazard slots and links them into the global
    /// list.
    unsafe fn get_mut_thread_info(&self) -> &mut ThreadLocalInfo<T> {
        let thread_info_ptr = self
            .thread_info
            .get_or(|| {
                let mut starting_hp: Vec<*mut HazardPointer<T>> = Vec::new();
                for _ in 0..self.num_hp_per_thread {
                    starting_hp.push(self.allocate_hp());
                }
                UnsafeCell::new(ThreadLocalInfo::new(starting_hp))
            })
            .get();

        &mut *thread_info_ptr
    }
}

impl<T: Send> Drop for HPBRManager<T> {
    fn drop(&mut self) {
        // No operation is in flight once the manager is dropped; the hazard
        // records can be freed sequentially. Retired records are freed by
        // each ThreadLocalInfo as the thread_local storage drops.
        let mut current = self.head.load(Ordering::Relaxed);
        while !current.is_null() {
            unsafe {
                let next = (*current).next.load(Ordering::Relaxed);
                drop(Box::from_raw(current));
                current = next;
            }
        }
    }
}

struct HazardPointer<T: Send> {
    protected: AtomicPtr<T>,
    next: AtomicPtr<HazardPointer<T>>,
}

impl<T: Send> HazardPointer<T> {
    fn new() -> Self {
        HazardPointer {
            protected: AtomicPtr::default(),
            next: AtomicPtr::default(),
        }
    }
}

unsafe impl<T: Send> Send for ThreadLocalInfo<T> {}

struct ThreadLocalInfo<T: Send> {
    local_hazards: Vec<*mut HazardPointer<T>>,
    retired_list: VecDeque<*mut T>,
    retired_number: usize,
}

impl<T: Send> ThreadLocalInfo<T> {
    fn new(starting_hazards: Vec<*mut HazardPointer<T>>) -> Self {
        ThreadLocalInfo {
            local_hazards: starting_hazards,
            retired_list: VecDeque::new(),
            retired_number: 0,
        }
    }

    unsafe fn hazard(&mut self, hazard_index: usize) -> &HazardPointer<T> {
        &*self.local_hazards[hazard_index]
    }
}

impl<T: Send> Drop for ThreadLocalInfo<T> {
    fn drop(&mut self) {
        // The hazard records in local_hazards belong to the manager's global
        // list; only the not-yet-freed retired records are owned here.
        for ptr in self.retired_list.drain(..) {
            unsafe {
                drop(Box::from_raw(ptr));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::HPBRManager;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Canary {
        drops: Arc<AtomicUsize>,
    }

    impl Drop for Canary {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_protected_record_survives_scan() {
        let drops = Arc::new(AtomicUsize::new(0));
        let manager: HPBRManager<Canary> = HPBRManager::new(100, 2);
        let record = Box::into_raw(Box::new(Canary { drops: drops.clone() }));

        manager.protect(record, 0);
        manager.protect(record, 1);
        // Retiring through slot 0 leaves slot 1 still covering the record.
        manager.retire(record, 0);
        manager.scan();
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        manager.unprotect(1);
        manager.scan();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unprotected_record_freed_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let manager: HPBRManager<Canary> = HPBRManager::new(100, 2);
        let record = Box::into_raw(Box::new(Canary { drops: drops.clone() }));

        manager.protect(record, 0);
        manager.retire(record, 0);
        manager.scan();
        manager.scan();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retired_records_freed_on_drop() {
        let drops = Arc::new(AtomicUsize::new(0));
        {
            let manager: HPBRManager<Canary> = HPBRManager::new(100, 2);
            let record = Box::into_raw(Box::new(Canary { drops: drops.clone() }));
            manager.protect(record, 0);
            manager.retire(record, 0);
            // No scan: the record is still queued when the manager drops.
        }
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_scan_triggered_by_retire_threshold() {
        let drops = Arc::new(AtomicUsize::new(0));
        let manager: HPBRManager<Canary> = HPBRManager::new(4, 1);
        for _ in 0..6 {
            let record = Box::into_raw(Box::new(Canary { drops: drops.clone() }));
            manager.retire(record, 0);
        }
        assert!(drops.load(Ordering::SeqCst) >= 5);
    }
}
