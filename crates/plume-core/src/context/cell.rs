//! Per-thread holder of the current request-scoped value.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

thread_local! {
    /// One slot per context type. Only `PropagationFrame` writes here, and it
    /// always restores the previous value on exit.
    static SLOTS: RefCell<HashMap<TypeId, Box<dyn Any>>> = RefCell::new(HashMap::new());
}

/// Handle to the current value of type `T` on this thread.
///
/// Reads are open to anyone; writes go through
/// [`PropagationFrame`](super::PropagationFrame), which makes every write
/// scoped. The value never leaves the thread that set it, so `T` does not
/// need to be `Send` or `Sync`.
pub struct ContextCell<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T: Clone + 'static> ContextCell<T> {
    pub const fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }

    /// Clone of the current value, if one is set on this thread
    pub fn current(&self) -> Option<T> {
        SLOTS.with(|slots| {
            slots
                .borrow()
                .get(&TypeId::of::<T>())
                .and_then(|value| value.downcast_ref::<T>())
                .cloned()
        })
    }

    pub fn is_set(&self) -> bool {
        SLOTS.with(|slots| slots.borrow().contains_key(&TypeId::of::<T>()))
    }

    /// Install `value` (or clear the slot) and return what was there before.
    pub(crate) fn get_and_set(&self, value: Option<T>) -> Option<T> {
        let previous = SLOTS.with(|slots| {
            let mut slots = slots.borrow_mut();
            match value {
                Some(value) => slots.insert(TypeId::of::<T>(), Box::new(value)),
                None => slots.remove(&TypeId::of::<T>()),
            }
        });
        // Dropped outside the borrow: the old value may itself touch a cell.
        previous.and_then(|value| value.downcast::<T>().ok().map(|value| *value))
    }
}

impl<T: Clone + 'static> Default for ContextCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for ContextCell<T> {
    fn clone(&self) -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Copy for ContextCell<T> {}

impl<T> fmt::Debug for ContextCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextCell")
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}
