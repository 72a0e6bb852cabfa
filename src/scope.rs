use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread;

use pin_project::{pin_project, pinned_drop};

use crate::ctx::{self, TaskContext};
use crate::data::{Binding, Frame, ScopeState};
use crate::error::fatal;

/// Pops a pushed frame from the current stack when dropped.
struct Pushed(Option<Arc<Frame>>);

impl Pushed {
    fn push(binding: Binding, scope: Arc<ScopeState>) -> Pushed {
        Pushed(Some(ctx::with_current_stack(|stack, _| {
            stack.push(binding, scope)
        })))
    }

    fn pop(&mut self) -> Option<Arc<Frame>> {
        let frame = self.0.take()?;
        ctx::with_current_stack(|stack, _| stack.pop(&frame));
        Some(frame)
    }
}

impl Drop for Pushed {
    fn drop(&mut self) {
        if let Some(frame) = self.pop() {
            // only reached when unwinding; the misuse check would abort
            let _ = frame.scope().close();
        }
    }
}

pub(crate) fn with_value<F: FnOnce() -> R, R>(binding: Binding, f: F) -> R {
    let scope = ScopeState::new(&binding, TaskContext::current_id());
    let mut pushed = Pushed::push(binding, scope);
    let rv = f();
    if let Some(frame) = pushed.pop() {
        if let Err(err) = frame.scope().close() {
            fatal(err);
        }
    }
    rv
}

/// A future with a task-local binding in place.
///
/// Created by [`TaskLocal::with_value_async`](crate::TaskLocal::with_value_async).
/// The binding is pushed onto the polling task's stack before each poll of
/// the inner future and popped right after, so it follows the future across
/// suspension points without leaking to siblings polled by the same task.
#[pin_project(PinnedDrop)]
pub struct ScopedValue<F> {
    binding: Binding,
    scope: Option<Arc<ScopeState>>,
    done: bool,
    #[pin]
    future: F,
}

impl<F> ScopedValue<F> {
    pub(crate) fn new(binding: Binding, future: F) -> ScopedValue<F> {
        ScopedValue {
            binding,
            scope: None,
            done: false,
            future,
        }
    }
}

impl<F> fmt::Debug for ScopedValue<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ScopedValue")
            .field("key", &self.binding.key)
            .field("done", &self.done)
            .finish()
    }
}

impl<F: Future> Future for ScopedValue<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<F::Output> {
        let this = self.project();
        let binding: &Binding = this.binding;
        let scope = this
            .scope
            .get_or_insert_with(|| ScopeState::new(binding, TaskContext::current_id()))
            .clone();

        let rv = {
            let mut pushed = Pushed::push(binding.clone(), scope.clone());
            let rv = this.future.poll(cx);
            pushed.pop();
            rv
        };

        if rv.is_ready() {
            *this.done = true;
            if let Err(err) = scope.close() {
                fatal(err);
            }
        }
        rv
    }
}

#[pinned_drop]
impl<F> PinnedDrop for ScopedValue<F> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if *this.done {
            return;
        }
        // dropped before completion: the scope was cancelled
        if let Some(scope) = this.scope.take() {
            match scope.close() {
                Err(err) if !thread::panicking() => fatal(err),
                _ => {}
            }
        }
    }
}
