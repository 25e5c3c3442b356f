//! Scoped binding of the active target specification.
//!
//! Passes and visitors that need to know the target read it from the
//! [`LoweringContext`] instead of taking it as a parameter. Entering the
//! context returns a [`LoweringGuard`]; the binding is removed when the guard
//! drops, on every exit path. Contexts nest and are per thread.
//!
//! ```
//! use tosalower_compiler::LoweringContext;
//!
//! assert!(LoweringContext::current().is_none());
//! {
//!     let _guard = LoweringContext::enter("TOSA-1.0+INT".parse().unwrap());
//!     assert_eq!(LoweringContext::current().unwrap().to_string(), "TOSA-1.0+INT");
//! }
//! assert!(LoweringContext::current().is_none());
//! ```

use std::cell::RefCell;
use std::marker::PhantomData;

use tosalower_ir::TosaSpecification;

use crate::error::{LoweringError, Result};

thread_local! {
    static ACTIVE: RefCell<Vec<TosaSpecification>> = const { RefCell::new(Vec::new()) };
}

pub struct LoweringContext;

impl LoweringContext {
    /// Bind `spec` for the current thread until the returned guard is dropped.
    pub fn enter(spec: TosaSpecification) -> LoweringGuard {
        tracing::trace!(%spec, "entering lowering context");
        let depth = ACTIVE.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.push(spec);
            stack.len() - 1
        });
        LoweringGuard {
            depth,
            _not_send: PhantomData,
        }
    }

    /// Innermost active specification.
    pub fn current() -> Option<TosaSpecification> {
        ACTIVE.with(|stack| stack.borrow().last().cloned())
    }

    pub fn require() -> Result<TosaSpecification> {
        Self::current().ok_or(LoweringError::NoActiveSpecification)
    }

    pub fn depth() -> usize {
        ACTIVE.with(|stack| stack.borrow().len())
    }
}

/// Keeps a specification bound. Not `Send`: the binding belongs to the
/// thread that created it.
///
/// Dropping a guard unbinds its own entry and every entry entered after it,
/// so an outer guard dropped early never leaves its specification behind.
#[must_use = "the context is exited as soon as the guard is dropped"]
pub struct LoweringGuard {
    /// Stack length before this guard's entry was pushed.
    depth: usize,
    _not_send: PhantomData<*const ()>,
}

impl Drop for LoweringGuard {
    fn drop(&mut self) {
        ACTIVE.with(|stack| stack.borrow_mut().truncate(self.depth));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(s: &str) -> TosaSpecification {
        s.parse().unwrap()
    }

    #[test]
    fn test_nesting_restores_outer() {
        let _outer = LoweringContext::enter(spec("TOSA-0.80+BI"));
        {
            let _inner = LoweringContext::enter(spec("TOSA-1.0+FP"));
            assert_eq!(LoweringContext::current(), Some(spec("TOSA-1.0+FP")));
            assert_eq!(LoweringContext::depth(), 2);
        }
        assert_eq!(LoweringContext::current(), Some(spec("TOSA-0.80+BI")));
    }

    #[test]
    fn test_out_of_order_drop_unbinds_outer() {
        let outer = LoweringContext::enter(spec("TOSA-0.80+BI"));
        let inner = LoweringContext::enter(spec("TOSA-1.0+FP"));
        drop(outer);
        assert!(LoweringContext::current().is_none());
        assert_eq!(LoweringContext::depth(), 0);
        drop(inner);
        assert_eq!(LoweringContext::depth(), 0);

        let _again = LoweringContext::enter(spec("TOSA-1.0+INT"));
        assert_eq!(LoweringContext::current(), Some(spec("TOSA-1.0+INT")));
    }

    #[test]
    fn test_require_without_context() {
        assert!(matches!(
            LoweringContext::require(),
            Err(LoweringError::NoActiveSpecification)
        ));
    }

    #[test]
    fn test_exit_on_error_path() {
        fn failing() -> Result<()> {
            let _guard = LoweringContext::enter("TOSA-1.0+INT".parse().unwrap());
            Err(LoweringError::NoActiveSpecification)
        }
        assert!(failing().is_err());
        assert!(LoweringContext::current().is_none());
    }

    #[test]
    fn test_exit_on_panic() {
        let result = std::panic::catch_unwind(|| {
            let _guard = LoweringContext::enter("TOSA-1.0+INT".parse().unwrap());
            panic!("pass blew up");
        });
        assert!(result.is_err());
        assert!(LoweringContext::current().is_none());
    }

    #[test]
    fn test_threads_are_isolated() {
        let _guard = LoweringContext::enter(spec("TOSA-1.0+INT"));
        let seen = std::thread::spawn(LoweringContext::current).join().unwrap();
        assert!(seen.is_none());
    }
}
