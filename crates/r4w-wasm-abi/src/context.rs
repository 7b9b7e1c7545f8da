//! Thread-local execution context.
//!
//! Records which sandbox is active on the calling thread and which callback
//! slot fired most recently. Both values are set through guards that restore
//! the previous value when dropped, so nested host → sandbox → host chains
//! unwind to the right state on every exit path, panics included.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::sync::Arc;

use crate::model::MemoryModel;
use crate::sandbox::SandboxCore;

type ActiveSandbox = Arc<dyn Any + Send + Sync>;

thread_local! {
    static CURRENT: RefCell<Option<ActiveSandbox>> = const { RefCell::new(None) };
    static LAST_CALLBACK: Cell<Option<u32>> = const { Cell::new(None) };
}

/// Restores the previously active sandbox on drop.
pub(crate) struct ContextGuard {
    prev: Option<ActiveSandbox>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|c| *c.borrow_mut() = prev);
    }
}

/// Make `sandbox` the active sandbox until the guard drops.
pub(crate) fn enter<M: MemoryModel>(sandbox: Arc<SandboxCore<M>>) -> ContextGuard {
    let sandbox: ActiveSandbox = sandbox;
    let prev = CURRENT.with(|c| c.borrow_mut().replace(sandbox));
    ContextGuard { prev }
}

/// Restores the previous "last callback" slot on drop.
pub(crate) struct CallbackGuard {
    prev: Option<u32>,
}

impl Drop for CallbackGuard {
    fn drop(&mut self) {
        LAST_CALLBACK.with(|c| c.set(self.prev));
    }
}

/// Record `slot` as the executing callback until the guard drops.
pub(crate) fn enter_callback(slot: u32) -> CallbackGuard {
    let prev = LAST_CALLBACK.with(|c| c.replace(Some(slot)));
    CallbackGuard { prev }
}

/// The sandbox active on this thread, if it uses model `M`.
pub fn current_sandbox<M: MemoryModel>() -> Option<Arc<SandboxCore<M>>> {
    let active = CURRENT.with(|c| c.borrow().clone())?;
    active.downcast::<SandboxCore<M>>().ok()
}

/// Callback table index of the callback executing on this thread.
pub fn last_callback() -> Option<u32> {
    LAST_CALLBACK.with(Cell::get)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_callback_guard_restores() {
        assert_eq!(last_callback(), None);
        {
            let _outer = enter_callback(3);
            assert_eq!(last_callback(), Some(3));
            {
                let _inner = enter_callback(7);
                assert_eq!(last_callback(), Some(7));
            }
            assert_eq!(last_callback(), Some(3));
        }
        assert_eq!(last_callback(), None);
    }

    #[test]
    fn test_callback_guard_restores_on_panic() {
        let result = std::panic::catch_unwind(|| {
            let _guard = enter_callback(5);
            panic!("unwind");
        });
        assert!(result.is_err());
        assert_eq!(last_callback(), None);
    }
}
