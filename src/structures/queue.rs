use crate::memory::HPBRManager;
use crate::structures::atomic_tagged::AtomicTaggedPtr;
use rand::Rng;
use std::cell::UnsafeCell;
use std::cmp;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

const MAX_BACKOFF: u32 = 2048;

/// A lock-free Michael-Scott queue.
///
/// This queue is an implementation of that described in [Simple, Fast, and Practical
/// Non-blocking and Blocking Concurrent Queue Algorithms](https://dl.acm.org/citation.cfm?id=248106).
/// It is implemented as a linked list of nodes starting at a permanent
/// sentinel, with `head` and `tail` held as tagged pointers. Unlinked nodes
/// are handed to a hazard-pointer manager rather than freed directly, so no
/// thread can observe a node after it has been reclaimed and no recycled
/// address can fool a compare-and-swap.
pub struct Queue<T: Send> {
    head: AtomicTaggedPtr<Node<T>>,
    tail: AtomicTaggedPtr<Node<T>>,
    manager: HPBRManager<Node<T>>,
}

unsafe impl<T: Send> Send for Queue<T> {}
unsafe impl<T: Send> Sync for Queue<T> {}

struct Node<T: Send> {
    next: AtomicTaggedPtr<Node<T>>,
    value: UnsafeCell<Option<T>>,
}

impl<T: Send> Queue<T> {
    /// Create a new Queue.
    /// # Examples
    /// ```
    /// use casqueue::structures::Queue;
    /// let queue: Queue<String> = Queue::new();
    /// ```
    pub fn new() -> Self {
        let sentinel = Box::into_raw(Box::new(Node::new_sentinel()));
        Queue {
            head: AtomicTaggedPtr::new(sentinel),
            tail: AtomicTaggedPtr::new(sentinel),
            manager: HPBRManager::new(100, 2),
        }
    }

    fn backoff(&self, max_backoff: u32) -> u32 {
        let backoff_time = rand::thread_rng().gen_range(0..max_backoff);
        thread::sleep(Duration::new(0, backoff_time * 10));
        cmp::min(max_backoff * 2, MAX_BACKOFF)
    }

    /// Add a new element to the back of the queue.
    /// # Examples
    /// ```
    /// use casqueue::structures::Queue;
    /// let queue: Queue<String> = Queue::new();
    /// queue.enqueue("hello".to_owned());
    /// ```
    pub fn enqueue(&self, val: T) {
        let mut backoff = 1;
        let mut node = Box::new(Node::new(val));
        loop {
            node = match self.try_enqueue(node) {
                // Linked: the enqueue is complete, do not keep looping.
                Ok(_) => return,
                Err(old_node) => old_node,
            };
            backoff = self.backoff(backoff);
        }
    }

    fn try_enqueue(&self, val: Box<Node<T>>) -> Result<(), Box<Node<T>>> {
        let tail = self.tail.load(Ordering::Acquire);
        self.manager.protect(tail.ptr(), 0);
        // Is the tail still consistent? Required for the hazard pointer to
        // work; the tagged compare also rejects a recycled address.
        if tail != self.tail.load(Ordering::Acquire) {
            return Err(val);
        }
        let next = unsafe { (*tail.ptr()).next.load(Ordering::Acquire) };

        // Is the tail actually the end of the queue?
        if !next.is_null() {
            // If it isn't, help by making next the end of the queue
            let _ = self
                .tail
                .compare_exchange(tail, next.ptr(), Ordering::Release, Ordering::Relaxed);
            return Err(val);
        }

        let node_ptr = Box::into_raw(val);
        // Try to CAS our node onto the end of the queue
        unsafe {
            match (*tail.ptr()).next.compare_exchange(
                next,
                node_ptr,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    // Success! Swing the tail to our node, best-effort:
                    // another thread may already have helped it forward.
                    let _ = self.tail.compare_exchange(
                        tail,
                        node_ptr,
                        Ordering::Release,
                        Ordering::Relaxed,
                    );
                    self.manager.unprotect(0);
                    Ok(())
                }
                Err(_) => Err(Box::from_raw(node_ptr)),
            }
        }
    }

    /// Take an element from the front of the queue, or return None if the
    /// queue is empty.
    /// # Examples
    /// ```
    /// use casqueue::structures::Queue;
    /// let queue: Queue<String> = Queue::new();
    /// queue.enqueue("hello".to_owned());
    /// assert_eq!(queue.dequeue(), Some("hello".to_owned()));
    /// ```
    pub fn dequeue(&self) -> Option<T> {
        let mut backoff = 1;
        loop {
            if let Ok(val) = self.try_dequeue() {
                return val;
            }
            backoff = self.backoff(backoff);
        }
    }

    fn try_dequeue(&self) -> Result<Option<T>, ()> {
        let head = self.head.load(Ordering::Acquire);
        self.manager.protect(head.ptr(), 0);
        if head != self.head.load(Ordering::Acquire) {
            return Err(());
        }

        let next = unsafe { (*head.ptr()).next.load(Ordering::Acquire) };
        self.manager.protect(next.ptr(), 1);
        if next != unsafe { (*head.ptr()).next.load(Ordering::Acquire) } {
            return Err(());
        }

        let tail = self.tail.load(Ordering::Acquire);

        if next.is_null() {
            // head is the sentinel and nothing is linked behind it
            self.manager.unprotect(0);
            self.manager.unprotect(1);
            return Ok(None);
        }

        if head.ptr() == tail.ptr() {
            // Something is linked but the tail has not been swung yet; help
            let _ = self
                .tail
                .compare_exchange(tail, next.ptr(), Ordering::Release, Ordering::Relaxed);
            return Err(());
        }

        match self
            .head
            .compare_exchange(head, next.ptr(), Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                // Winning the CAS makes this thread the only one entitled to
                // the value slot of the node that just became the sentinel.
                // The hazard pointer in slot 1 keeps that node alive here.
                let data = unsafe { (*(*next.ptr()).value.get()).take() };
                self.manager.retire(head.ptr(), 0);
                self.manager.unprotect(1);
                Ok(data)
            }
            Err(_) => Err(()),
        }
    }
}

impl<T: Send> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Drop for Queue<T> {
    fn drop(&mut self) {
        // Teardown is single-threaded: walk the list and free every node,
        // sentinel included. Retired nodes are freed by the manager.
        let mut current = self.head.load(Ordering::Relaxed).ptr();
        while !current.is_null() {
            unsafe {
                let next = (*current).next.load(Ordering::Relaxed).ptr();
                drop(Box::from_raw(current));
                current = next;
            }
        }
    }
}

impl<T: Send> Node<T> {
    fn new(value: T) -> Self {
        Node {
            next: AtomicTaggedPtr::default(),
            value: UnsafeCell::new(Some(value)),
        }
    }

    fn new_sentinel() -> Self {
        Node {
            next: AtomicTaggedPtr::default(),
            value: UnsafeCell::new(None),
        }
    }
}
