//! The cooperative scheduler hook (§4.9): a per-context, per-thread
//! preemption counter decremented on call/iteration opcodes, with a
//! scheduler-supplied queue the VM swaps a parked task out to when the
//! counter is exhausted.
//!
//! Grounded in §4.9/§5 directly: nothing elsewhere in the workspace runs
//! to completion in one call the way a `Vm` without a scheduler would;
//! the queue's locking shape follows §5's "each uses a test-and-set
//! spinlock around a short critical section", the same pattern
//! `generics::GenericInterner` and `method::MethodTable` already use for
//! their own shared caches.

use std::collections::VecDeque;

use parking_lot::Mutex;

use minilang_core::value::{CallResult, Caller, Step};
use std::rc::Rc;

/// One parked task: a caller to resume and the value to resume it with.
pub struct Parked {
    pub next: Rc<dyn Caller>,
    pub result: CallResult,
}

impl std::fmt::Debug for Parked {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parked").finish()
    }
}

/// The scheduler-supplied queue a preempted frame is swapped into.
/// Single-threaded embeddings get a trivial queue that drains inline
/// (`Scheduler::new(false)`); the `threaded` variant guards the same
/// queue with a `parking_lot::Mutex` for multi-VM embeddings (§5).
pub struct Scheduler {
    queue: Mutex<VecDeque<Parked>>,
    threaded: bool,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("threaded", &self.threaded)
            .field("queued", &self.queue.lock().len())
            .finish()
    }
}

impl Scheduler {
    pub fn new(threaded: bool) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            threaded,
        }
    }

    pub fn is_threaded(&self) -> bool {
        self.threaded
    }

    /// Enqueue a preempted task. FIFO order within one queue, per §5's
    /// "Across tasks sharing a scheduler queue, order is FIFO".
    pub fn park(&self, next: Rc<dyn Caller>, result: CallResult) {
        self.queue.lock().push_back(Parked { next, result });
    }

    /// Pop the next parked task, if any.
    pub fn pop(&self) -> Option<Parked> {
        self.queue.lock().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Drain every parked task to completion, in FIFO order. Single-
    /// threaded embeddings call this after the initiating call returns a
    /// `Step::Continue` into the queue rather than a final value,
    /// matching §4.9's "an outer driver picks the pair up and resumes".
    pub fn drain(&self) {
        while let Some(parked) = self.pop() {
            let mut step = parked.next.run(parked.result);
            loop {
                match step {
                    Step::Done(_) => break,
                    Step::Continue { next, result } => step = next.run(result),
                }
            }
        }
    }
}
