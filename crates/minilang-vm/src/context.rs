//! The execution context a frame resolves shared services through
//! (§3.4's `context` field): the type registry, the method table, and
//! the scheduler queue. One context is shared by every frame in a
//! single logical task; an embedding that wants isolated method
//! definitions constructs a fresh [`Context`] per call tree, the same
//! granularity `minilang_core::method::MethodTable`'s own docs call out.

use std::rc::Rc;

use minilang_core::method::MethodTable;
use minilang_core::types::TypeRegistry;

use crate::scheduler::Scheduler;

/// Shared services for one logical task. Cheap to clone (everything
/// inside is already `Rc`-shared); `Vm::spawn_context` is the usual way
/// to get one.
#[derive(Clone)]
pub struct Context {
    pub registry: Rc<TypeRegistry>,
    pub methods: Rc<MethodTable>,
    pub scheduler: Rc<Scheduler>,
    /// How many call/iteration opcodes a frame may execute before
    /// yielding to the scheduler (§4.9). Reset each time the scheduler
    /// resumes a parked task.
    pub preempt_quantum: u32,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").field("preempt_quantum", &self.preempt_quantum).finish()
    }
}

impl Context {
    pub fn new(registry: Rc<TypeRegistry>, methods: Rc<MethodTable>, scheduler: Rc<Scheduler>, preempt_quantum: u32) -> Rc<Self> {
        Rc::new(Self {
            registry,
            methods,
            scheduler,
            preempt_quantum,
        })
    }
}
