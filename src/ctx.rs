use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::panic;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use pin_project::pin_project;

use crate::data::{BindingStack, Opaque, Registration};
use crate::error::{fatal, ContextError};
use crate::key::KeyId;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_TASK: RefCell<Option<TaskNode>> = RefCell::new(None);
    static FALLBACK: RefCell<BindingStack> = RefCell::new(BindingStack::new());
}

/// Unique identifier of a task node.
///
/// Ids are handed out from a process wide counter and never reused.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> TaskId {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a task node was created and what it inherited.
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum TaskKind {
    /// A top level task without any inherited bindings.
    Root,
    /// A structured child reading its creator's bindings in place.
    Structured,
    /// Unstructured work that inherits nothing.
    Detached,
    /// Unstructured work carrying a copy of its creator's bindings.
    Continuing,
}

/// The runtime record of one unit of concurrent work.
///
/// While the task runs the node lives in the thread's `CURRENT_TASK` slot;
/// in between it is parked in its `TaskContext` or `TaskScope`.
pub(crate) struct TaskNode {
    id: TaskId,
    kind: TaskKind,
    parent: Option<TaskId>,
    ancestor: Option<TaskId>,
    stack: BindingStack,
    registration: Option<Registration>,
}

impl TaskNode {
    fn check(&self) -> Result<(), ContextError> {
        match self.registration {
            Some(ref registration) => registration.check(self.id),
            None => Ok(()),
        }
    }
}

/// Runs `f` against the binding stack of the current execution context.
///
/// That is the stack of the installed task if there is one, otherwise the
/// thread's fallback store.  `f` must not call back into user code.
pub(crate) fn with_current_stack<F, R>(f: F) -> R
where
    F: FnOnce(&mut BindingStack, Option<TaskId>) -> R,
{
    CURRENT_TASK.with(|task| {
        let mut task = task.borrow_mut();
        match *task {
            Some(ref mut node) => f(&mut node.stack, Some(node.id)),
            None => FALLBACK.with(|fallback| f(&mut fallback.borrow_mut(), None)),
        }
    })
}

/// Looks up the innermost visible binding of `key`.
pub(crate) fn lookup(key: KeyId) -> Option<Opaque> {
    with_current_stack(|stack, _| stack.lookup(key))
}

/// Swaps `node` into the current task slot and returns what was there.
fn install(node: Option<TaskNode>) -> Option<TaskNode> {
    CURRENT_TASK.with(|task| task.replace(node))
}

/// A task node that has been created but is not running yet.
///
/// A task context is what a runtime captures at spawn time.  It is `Send`
/// so it can be carried to whichever thread ends up running the work, where
/// [`run`](TaskContext::run) or [`scope`](TaskContext::scope) install it.
///
/// The flavour of the context decides what it inherits:
///
/// *   [`child`](TaskContext::child) reads the creator's bindings in place
///     and must be joined before the creator's scope exits.
/// *   [`continuing`](TaskContext::continuing) takes a copy of the bindings
///     and may outlive its creator.
/// *   [`detached`](TaskContext::detached) and [`root`](TaskContext::root)
///     start out empty.
///
/// Dropping a context without running it counts as the task having been
/// cancelled and joined.
pub struct TaskContext {
    node: TaskNode,
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("id", &self.node.id)
            .field("kind", &self.node.kind)
            .field("ancestor", &self.node.ancestor)
            .finish()
    }
}

impl TaskContext {
    fn create(
        id: TaskId,
        kind: TaskKind,
        parent: Option<TaskId>,
        stack: BindingStack,
        registration: Option<Registration>,
    ) -> TaskContext {
        let ancestor = stack.nearest_contributor();
        tracing::trace!(
            task = %id,
            kind = ?kind,
            parent = ?parent,
            ancestor = ?ancestor,
            "created task context"
        );
        TaskContext {
            node: TaskNode {
                id,
                kind,
                parent,
                ancestor,
                stack,
                registration,
            },
        }
    }

    /// Creates a new root task.
    ///
    /// Root tasks inherit nothing.  Runtimes use them for top level work so
    /// that everything spawned underneath can be structured.
    pub fn root() -> TaskContext {
        TaskContext::create(
            TaskId::next(),
            TaskKind::Root,
            None,
            BindingStack::new(),
            None,
        )
    }

    /// Creates a structured child of the current task.
    ///
    /// The child does not copy anything.  It keeps a reference to the
    /// bindings that are on top of the current stack right now and walks
    /// them on lookup.  Bindings the creator pushes later are not visible to
    /// the child.
    ///
    /// The child must be joined (run to completion or dropped) before the
    /// innermost scope it inherits from exits; otherwise that scope exit
    /// panics.
    ///
    /// When no task is installed on this thread the child is seeded from a
    /// copy of the fallback store instead, the same way a
    /// [`continuing`](TaskContext::continuing) task is.
    ///
    /// ## Example
    ///
    /// ```
    /// # use task_context::{TaskContext, TaskLocal};
    /// # use std::thread;
    /// let locale = TaskLocal::new("en_US");
    /// TaskContext::root().run(|| {
    ///     locale.with_value("de_DE", || {
    ///         let child = TaskContext::child();
    ///         let locale = &locale;
    ///         thread::scope(|s| {
    ///             s.spawn(move || child.run(|| assert_eq!(locale.get(), "de_DE")));
    ///         });
    ///     });
    /// });
    /// ```
    pub fn child() -> TaskContext {
        let id = TaskId::next();
        let (parent, stack, registration) = with_current_stack(|stack, current| match current {
            Some(_) => {
                let head = stack.head().cloned();
                let registration = head.as_ref().map(|frame| frame.scope().register_child());
                let inherited = BindingStack::inheriting(
                    head,
                    stack.snapshot().clone(),
                    stack.snapshot_owner(),
                );
                (current, inherited, registration)
            }
            None => (None, BindingStack::from_snapshot(stack.flatten(), None), None),
        });
        TaskContext::create(id, TaskKind::Structured, parent, stack, registration)
    }

    /// Creates a detached task that inherits no bindings at all.
    pub fn detached() -> TaskContext {
        TaskContext::create(
            TaskId::next(),
            TaskKind::Detached,
            TaskContext::current_id(),
            BindingStack::new(),
            None,
        )
    }

    /// Creates an unstructured task that carries a copy of the current
    /// bindings.
    ///
    /// The effective bindings are flattened once, right now.  After that
    /// the new task and its creator evolve independently, so the task may
    /// run long after the scopes that produced the bindings have exited.
    pub fn continuing() -> TaskContext {
        let id = TaskId::next();
        let (parent, snapshot) = with_current_stack(|stack, current| (current, stack.flatten()));
        tracing::debug!(task = %id, bindings = snapshot.len(), "copied bindings for continuing task");
        let stack = BindingStack::from_snapshot(snapshot, Some(id));
        TaskContext::create(id, TaskKind::Continuing, parent, stack, None)
    }

    /// Returns the id of the task currently installed on this thread.
    pub fn current_id() -> Option<TaskId> {
        CURRENT_TASK.with(|task| task.borrow().as_ref().map(|node| node.id))
    }

    /// Returns the nearest contributing ancestor of the current task.
    pub fn current_ancestor() -> Option<TaskId> {
        CURRENT_TASK.with(|task| task.borrow().as_ref().and_then(|node| node.ancestor))
    }

    /// Returns the id of this task.
    pub fn id(&self) -> TaskId {
        self.node.id
    }

    /// Returns how this task was created.
    pub fn kind(&self) -> TaskKind {
        self.node.kind
    }

    /// Returns the task that created this one, if any.
    pub fn parent(&self) -> Option<TaskId> {
        self.node.parent
    }

    /// Returns the closest ancestor that contributed bindings.
    ///
    /// This is fixed when the context is created.  Ancestors without any
    /// bindings at that point are skipped.
    pub fn ancestor(&self) -> Option<TaskId> {
        self.node.ancestor
    }

    /// Runs a function as this task.
    ///
    /// The task is installed as the current task of this thread for the
    /// duration of `f` and the previous one is restored afterwards, also
    /// when `f` panics.  Finishing the run joins the task.
    ///
    /// # Panics
    ///
    /// Panics if this is a structured child whose inherited scope has
    /// already exited.
    pub fn run<F: FnOnce() -> R, R>(self, f: F) -> R {
        match self.try_run(f) {
            Ok(rv) => rv,
            Err(err) => fatal(err),
        }
    }

    /// Like [`run`](TaskContext::run) but reports a dead inherited scope as
    /// an error instead of panicking.  `f` is not invoked in that case.
    pub fn try_run<F: FnOnce() -> R, R>(self, f: F) -> Result<R, ContextError> {
        self.node.check()?;
        let previous = install(Some(self.node));
        let rv = panic::catch_unwind(panic::AssertUnwindSafe(f));
        if let Some(node) = install(previous) {
            debug_assert!(node.stack.is_unwound(), "task finished with bindings left");
        }
        match rv {
            Err(err) => panic::resume_unwind(err),
            Ok(rv) => Ok(rv),
        }
    }

    /// Wraps a future so that every poll of it runs as this task.
    ///
    /// This is the hook for async runtimes: capture the context where the
    /// task is spawned and hand the returned future to the executor.
    pub fn scope<F: Future>(self, future: F) -> TaskScope<F> {
        TaskScope {
            node: Some(self.node),
            checked: false,
            future,
        }
    }
}

/// A future that runs as a particular task.
///
/// Created by [`TaskContext::scope`].  The task node is installed for each
/// poll of the inner future and released once it completes or the wrapper
/// is dropped.
#[pin_project]
pub struct TaskScope<F> {
    node: Option<TaskNode>,
    checked: bool,
    #[pin]
    future: F,
}

impl<F> fmt::Debug for TaskScope<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskScope")
            .field("task", &self.node.as_ref().map(|node| node.id))
            .finish()
    }
}

/// Restores the previous current task when dropped.
struct Installed<'a> {
    slot: &'a mut Option<TaskNode>,
    previous: Option<TaskNode>,
}

impl<'a> Installed<'a> {
    fn new(slot: &'a mut Option<TaskNode>) -> Installed<'a> {
        let previous = install(slot.take());
        Installed { slot, previous }
    }
}

impl<'a> Drop for Installed<'a> {
    fn drop(&mut self) {
        *self.slot = install(self.previous.take());
    }
}

impl<F: Future> Future for TaskScope<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<F::Output> {
        let this = self.project();
        if !*this.checked {
            if let Some(node) = this.node.as_ref() {
                if let Err(err) = node.check() {
                    fatal(err);
                }
            }
            *this.checked = true;
        }
        let rv = {
            let _installed = Installed::new(&mut *this.node);
            this.future.poll(cx)
        };
        if rv.is_ready() {
            this.node.take();
        }
        rv
    }
}
