//! Chase-Lev dynamic circular work-stealing deque.
//!
//! The owner pushes and pops at the bottom with no CAS in the uncontended
//! case; thieves steal from the top with a CAS. Two atomic indices run
//! over a heap-allocated circular buffer of power-of-two capacity. Growth
//! allocates a doubled buffer, copies the live slots, publishes the new
//! pointer with a release store, and retires the old buffer to a
//! quiescence list owned by the deque; in-flight thieves may still be
//! reading it, so retired buffers are freed only when the deque drops.
//!
//! Memory ordering follows the established discipline: the owner's push
//! issues a release fence before publishing `bottom`; `pop` decrements
//! `bottom`, issues a sequentially consistent fence, then compares with
//! `top`, resorting to a CAS only for the single-element race; `steal`
//! acquires `top`, fences, acquires `bottom`, reads speculatively and
//! commits with a CAS on `top`. A failed CAS forgets the speculative
//! read; ownership never transferred.
//!
//! Owner discipline: `push` and `pop` must only ever be called from one
//! thread at a time (the worker that owns the deque); `steal` and `len`
//! are safe from any thread. The pool upholds this by construction.

use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{fence, AtomicIsize, AtomicPtr, Ordering};

const MIN_CAPACITY: usize = 2;

struct Buffer<T> {
    capacity: usize,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

impl<T> Buffer<T> {
    fn alloc(capacity: usize) -> Box<Self> {
        debug_assert!(capacity.is_power_of_two());
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Box::new(Self { capacity, slots })
    }

    #[inline]
    fn mask(&self) -> usize {
        self.capacity - 1
    }

    /// Read the slot at `index`, taking ownership of the bits.
    ///
    /// Safety: the caller must guarantee the slot holds an initialized
    /// value it is entitled to take (or will `forget` on a lost race).
    #[inline]
    unsafe fn read(&self, index: isize) -> T {
        let slot = &self.slots[index as usize & self.mask()];
        (*slot.get()).assume_init_read()
    }

    /// Write `value` into the slot at `index`.
    ///
    /// Safety: the caller must guarantee no concurrent reader considers
    /// this slot live.
    #[inline]
    unsafe fn write(&self, index: isize, value: T) {
        let slot = &self.slots[index as usize & self.mask()];
        (*slot.get()).write(value);
    }
}

/// Outcome of a steal attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Steal<T> {
    /// Took the oldest task.
    Success(T),
    /// Nothing to take.
    Empty,
    /// Lost a race; worth retrying.
    Retry,
}

/// The deque. Shared between its owner and any number of thieves via
/// `Arc`.
pub struct WorkStealingDeque<T> {
    bottom: AtomicIsize,
    top: AtomicIsize,
    buffer: AtomicPtr<Buffer<T>>,
    /// Buffers replaced by growth; freed at drop (quiescence).
    retired: Mutex<Vec<*mut Buffer<T>>>,
}

unsafe impl<T: Send> Send for WorkStealingDeque<T> {}
unsafe impl<T: Send> Sync for WorkStealingDeque<T> {}

impl<T> WorkStealingDeque<T> {
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two().max(MIN_CAPACITY);
        Self {
            bottom: AtomicIsize::new(0),
            top: AtomicIsize::new(0),
            buffer: AtomicPtr::new(Box::into_raw(Buffer::alloc(capacity))),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// Approximate number of queued tasks; exact when quiescent.
    pub fn len(&self) -> usize {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Relaxed);
        (b - t).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Owner-only: push at the bottom. Wait-free unless growth is
    /// needed.
    pub fn push(&self, value: T) {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);
        let mut buffer = self.buffer.load(Ordering::Relaxed);

        let capacity = unsafe { (*buffer).capacity };
        if b - t >= capacity as isize {
            buffer = self.grow(b, t, buffer);
        }

        unsafe { (*buffer).write(b, value) };
        fence(Ordering::Release);
        self.bottom.store(b + 1, Ordering::Relaxed);
    }

    /// Owner-only: pop at the bottom (LIFO). CAS only in the
    /// single-element race against thieves.
    pub fn pop(&self) -> Option<T> {
        let b = self.bottom.load(Ordering::Relaxed) - 1;
        let buffer = self.buffer.load(Ordering::Relaxed);
        self.bottom.store(b, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let t = self.top.load(Ordering::Relaxed);

        if t > b {
            // Already empty; restore.
            self.bottom.store(b + 1, Ordering::Relaxed);
            return None;
        }

        if t == b {
            // Last element: race thieves for it.
            let won = self
                .top
                .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok();
            self.bottom.store(b + 1, Ordering::Relaxed);
            return if won {
                Some(unsafe { (*buffer).read(b) })
            } else {
                None
            };
        }

        Some(unsafe { (*buffer).read(b) })
    }

    /// Thief: steal the oldest task from the top.
    pub fn steal(&self) -> Steal<T> {
        let t = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let b = self.bottom.load(Ordering::Acquire);

        if t >= b {
            return Steal::Empty;
        }

        let buffer = self.buffer.load(Ordering::Acquire);
        // Speculative read; committed only if the CAS wins.
        let value = unsafe { (*buffer).read(t) };
        if self
            .top
            .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            Steal::Success(value)
        } else {
            std::mem::forget(value);
            Steal::Retry
        }
    }

    /// Allocate a doubled buffer on the heap, copy live slots, publish
    /// it, and retire the old buffer until quiescence. The buffer is
    /// never stack-resident.
    fn grow(&self, b: isize, t: isize, old: *mut Buffer<T>) -> *mut Buffer<T> {
        let old_ref = unsafe { &*old };
        let new = Buffer::alloc(old_ref.capacity * 2);
        for i in t..b {
            unsafe {
                let slot = &old_ref.slots[i as usize & old_ref.mask()];
                let value = (*slot.get()).assume_init_read();
                new.write(i, value);
            }
        }
        let new_ptr = Box::into_raw(new);
        self.buffer.store(new_ptr, Ordering::Release);
        // In-flight thieves may still hold the old pointer; keep it
        // alive until the deque drops.
        self.retired.lock().push(old);
        tracing::trace!(capacity = old_ref.capacity * 2, "deque buffer grown");
        new_ptr
    }
}

impl<T> Default for WorkStealingDeque<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for WorkStealingDeque<T> {
    fn drop(&mut self) {
        let b = *self.bottom.get_mut();
        let t = *self.top.get_mut();
        let buffer = *self.buffer.get_mut();
        for i in t..b {
            unsafe {
                drop((*buffer).read(i));
            }
        }
        unsafe {
            drop(Box::from_raw(buffer));
        }
        for retired in self.retired.get_mut().drain(..) {
            unsafe {
                drop(Box::from_raw(retired));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn test_lifo_for_owner() {
        let deque = WorkStealingDeque::new();
        deque.push(1);
        deque.push(2);
        deque.push(3);
        assert_eq!(deque.pop(), Some(3));
        assert_eq!(deque.pop(), Some(2));
        assert_eq!(deque.pop(), Some(1));
        assert_eq!(deque.pop(), None);
    }

    #[test]
    fn test_steal_takes_oldest() {
        let deque = WorkStealingDeque::new();
        deque.push(1);
        deque.push(2);
        assert_eq!(deque.steal(), Steal::Success(1));
        assert_eq!(deque.pop(), Some(2));
        assert_eq!(deque.steal(), Steal::Empty);
    }

    #[test]
    fn test_capacity_two_push_three_grows() {
        let deque = WorkStealingDeque::with_capacity(2);
        deque.push(10);
        deque.push(20);
        deque.push(30);
        let mut got = vec![
            deque.pop().unwrap(),
            deque.pop().unwrap(),
            deque.pop().unwrap(),
        ];
        got.sort_unstable();
        assert_eq!(got, vec![10, 20, 30]);
        assert_eq!(deque.pop(), None);
    }

    #[test]
    fn test_len_tracks_operations() {
        let deque = WorkStealingDeque::new();
        assert!(deque.is_empty());
        deque.push(1);
        deque.push(2);
        assert_eq!(deque.len(), 2);
        deque.pop();
        assert_eq!(deque.len(), 1);
    }

    #[test]
    fn test_drop_releases_queued_items() {
        let deque = WorkStealingDeque::with_capacity(2);
        for i in 0..100 {
            deque.push(Arc::new(i));
        }
        // Growth retired several buffers; dropping must free them and
        // the 100 queued Arcs without double-free.
        drop(deque);
    }

    mod model {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Push(u32),
            Pop,
            Steal,
        }

        fn arb_ops() -> impl Strategy<Value = Vec<Op>> {
            prop::collection::vec(
                prop_oneof![
                    any::<u32>().prop_map(Op::Push),
                    Just(Op::Pop),
                    Just(Op::Steal),
                ],
                0..200,
            )
        }

        proptest! {
            /// Sequentially, the deque behaves exactly like a VecDeque:
            /// pop takes the back, steal takes the front, nothing is
            /// lost or duplicated.
            #[test]
            fn matches_reference_model(ops in arb_ops()) {
                let deque = WorkStealingDeque::with_capacity(2);
                let mut model: std::collections::VecDeque<u32> =
                    std::collections::VecDeque::new();

                for op in ops {
                    match op {
                        Op::Push(v) => {
                            deque.push(v);
                            model.push_back(v);
                        }
                        Op::Pop => {
                            prop_assert_eq!(deque.pop(), model.pop_back());
                        }
                        Op::Steal => {
                            let expected = model.pop_front();
                            match deque.steal() {
                                Steal::Success(v) => prop_assert_eq!(Some(v), expected),
                                Steal::Empty => prop_assert_eq!(None, expected),
                                Steal::Retry => prop_assert!(false, "spurious retry without contention"),
                            }
                        }
                    }
                    prop_assert_eq!(deque.len(), model.len());
                }
            }
        }
    }

    #[test]
    fn test_no_item_lost_or_duplicated_under_contention() {
        const ITEMS: usize = 20_000;
        const THIEVES: usize = 3;

        let deque = Arc::new(WorkStealingDeque::with_capacity(4));
        let done = Arc::new(AtomicBool::new(false));
        let mut thief_handles = Vec::new();

        for _ in 0..THIEVES {
            let deque = deque.clone();
            let done = done.clone();
            thief_handles.push(std::thread::spawn(move || {
                let mut stolen = Vec::new();
                loop {
                    match deque.steal() {
                        Steal::Success(v) => stolen.push(v),
                        Steal::Retry => {}
                        Steal::Empty => {
                            if done.load(Ordering::Acquire) && deque.is_empty() {
                                break;
                            }
                            std::hint::spin_loop();
                        }
                    }
                }
                stolen
            }));
        }

        let owner = {
            let deque = deque.clone();
            std::thread::spawn(move || {
                let mut popped = Vec::new();
                for i in 0..ITEMS {
                    deque.push(i);
                    if i % 3 == 0 {
                        if let Some(v) = deque.pop() {
                            popped.push(v);
                        }
                    }
                }
                while let Some(v) = deque.pop() {
                    popped.push(v);
                }
                popped
            })
        };

        let popped = owner.join().unwrap();
        done.store(true, Ordering::Release);

        let mut seen: Vec<usize> = popped;
        for handle in thief_handles {
            seen.extend(handle.join().unwrap());
        }

        assert_eq!(seen.len(), ITEMS, "an item was lost or duplicated");
        let unique: HashSet<usize> = seen.iter().copied().collect();
        assert_eq!(unique.len(), ITEMS, "an item was returned twice");
    }
}
