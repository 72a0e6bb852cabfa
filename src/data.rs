use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use im::HashMap;

use crate::ctx::TaskId;
use crate::error::{ContextError, ScopeOwner};
use crate::key::KeyId;

/// A type-erased bound value.
pub(crate) type Opaque = Arc<dyn Any + Send + Sync>;

/// A flattened set of effective bindings.
///
/// This is what continuing tasks and tasks spawned from the fallback store
/// receive instead of a link into the creator's frames.  It is a persistent
/// map so handing it on to further children is a pointer copy.
pub(crate) type Snapshot = HashMap<KeyId, Opaque>;

/// A value about to be bound to a key.
#[derive(Clone)]
pub(crate) struct Binding {
    pub(crate) key: KeyId,
    pub(crate) name: Option<&'static str>,
    pub(crate) value: Opaque,
}

/// Bookkeeping for one `with_value` scope.
///
/// Structured children that inherit a frame of this scope register here and
/// deregister when they are joined or dropped.  The scope must not exit while
/// any are outstanding.
pub(crate) struct ScopeState {
    key: KeyId,
    name: Option<&'static str>,
    owner: Option<TaskId>,
    outstanding: AtomicUsize,
    exited: AtomicBool,
}

impl ScopeState {
    pub(crate) fn new(binding: &Binding, owner: Option<TaskId>) -> Arc<ScopeState> {
        Arc::new(ScopeState {
            key: binding.key,
            name: binding.name,
            owner,
            outstanding: AtomicUsize::new(0),
            exited: AtomicBool::new(false),
        })
    }

    fn key_label(&self) -> String {
        match self.name {
            Some(name) => format!("`{}` ({})", name, self.key),
            None => format!("key {}", self.key),
        }
    }

    pub(crate) fn register_child(self: &Arc<Self>) -> Registration {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        Registration {
            scope: self.clone(),
        }
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Marks the scope as exited and verifies no structured child still
    /// depends on it.
    pub(crate) fn close(&self) -> Result<(), ContextError> {
        self.exited.store(true, Ordering::Release);
        match self.outstanding() {
            0 => Ok(()),
            outstanding => Err(ContextError::ScopeOutlivedByChild {
                key: self.key_label(),
                owner: ScopeOwner::from_task(self.owner),
                outstanding,
            }),
        }
    }
}

/// A structured child's claim on the scope it inherits from.
///
/// Dropping the registration is what "joined" means to the scope.
pub(crate) struct Registration {
    scope: Arc<ScopeState>,
}

impl Registration {
    /// Fails if the scope this child inherits from is already gone.
    pub(crate) fn check(&self, child: TaskId) -> Result<(), ContextError> {
        if self.scope.exited.load(Ordering::Acquire) {
            Err(ContextError::InheritedScopeExited {
                child,
                key: self.scope.key_label(),
                owner: ScopeOwner::from_task(self.scope.owner),
            })
        } else {
            Ok(())
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.scope.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

/// One entry of a binding stack.
///
/// Frames are immutable once pushed and linked towards older bindings.  The
/// link of a task's bottom frame points at the frame its creator had on top
/// when the task was spawned, which makes the whole chain a walk over
/// contributing ancestors only.
pub(crate) struct Frame {
    key: KeyId,
    value: Opaque,
    next: Option<Arc<Frame>>,
    scope: Arc<ScopeState>,
}

impl Frame {
    pub(crate) fn scope(&self) -> &Arc<ScopeState> {
        &self.scope
    }
}

/// The LIFO binding stack of a task node or of the thread fallback store.
///
/// Only the owning flow of control pushes and pops.  Descendants hold
/// `Arc`s into the frame chain and read it without synchronization.
pub(crate) struct BindingStack {
    head: Option<Arc<Frame>>,
    base: Option<Arc<Frame>>,
    snapshot: Snapshot,
    snapshot_owner: Option<TaskId>,
    depth: usize,
}

impl BindingStack {
    pub(crate) fn new() -> BindingStack {
        BindingStack {
            head: None,
            base: None,
            snapshot: Snapshot::new(),
            snapshot_owner: None,
            depth: 0,
        }
    }

    /// A stack that continues from an ancestor's frame chain.
    pub(crate) fn inheriting(
        head: Option<Arc<Frame>>,
        snapshot: Snapshot,
        snapshot_owner: Option<TaskId>,
    ) -> BindingStack {
        BindingStack {
            head: head.clone(),
            base: head,
            snapshot,
            snapshot_owner,
            depth: 0,
        }
    }

    /// A stack seeded with a flattened copy of someone else's bindings.
    pub(crate) fn from_snapshot(snapshot: Snapshot, owner: Option<TaskId>) -> BindingStack {
        BindingStack {
            head: None,
            base: None,
            snapshot,
            snapshot_owner: owner,
            depth: 0,
        }
    }

    pub(crate) fn head(&self) -> Option<&Arc<Frame>> {
        self.head.as_ref()
    }

    pub(crate) fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub(crate) fn snapshot_owner(&self) -> Option<TaskId> {
        self.snapshot_owner
    }

    /// The task whose bindings a child spawned right now would read first,
    /// skipping every ancestor that contributes nothing.
    pub(crate) fn nearest_contributor(&self) -> Option<TaskId> {
        match self.head {
            Some(ref frame) => frame.scope.owner,
            None if !self.snapshot.is_empty() => self.snapshot_owner,
            None => None,
        }
    }

    pub(crate) fn push(&mut self, binding: Binding, scope: Arc<ScopeState>) -> Arc<Frame> {
        let frame = Arc::new(Frame {
            key: binding.key,
            value: binding.value,
            next: self.head.take(),
            scope,
        });
        self.head = Some(frame.clone());
        self.depth += 1;
        frame
    }

    /// Pops `frame`, which must be the top of this stack.
    pub(crate) fn pop(&mut self, frame: &Arc<Frame>) {
        debug_assert!(
            self.head.as_ref().map_or(false, |head| Arc::ptr_eq(head, frame)),
            "binding stack popped out of order"
        );
        debug_assert!(self.depth > 0, "popped an inherited binding");
        self.head = frame.next.clone();
        self.depth = self.depth.saturating_sub(1);
    }

    /// Most recent binding of `key` visible from this stack.
    pub(crate) fn lookup(&self, key: KeyId) -> Option<Opaque> {
        let mut current = self.head.as_ref();
        while let Some(frame) = current {
            if frame.key == key {
                return Some(frame.value.clone());
            }
            current = frame.next.as_ref();
        }
        self.snapshot.get(&key).cloned()
    }

    /// Collapses the whole effective view into a snapshot.
    ///
    /// Shadowed bindings are dropped; values are shared, not cloned.
    pub(crate) fn flatten(&self) -> Snapshot {
        let mut overlay = Snapshot::new();
        let mut current = self.head.as_ref();
        while let Some(frame) = current {
            if !overlay.contains_key(&frame.key) {
                overlay.insert(frame.key, frame.value.clone());
            }
            current = frame.next.as_ref();
        }
        overlay.union(self.snapshot.clone())
    }

    /// Whether every frame pushed on this stack has been popped again.
    pub(crate) fn is_unwound(&self) -> bool {
        match (&self.head, &self.base) {
            (None, None) => true,
            (Some(head), Some(base)) => Arc::ptr_eq(head, base),
            _ => false,
        }
    }
}
