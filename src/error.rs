use thiserror::Error;

use crate::ctx::TaskId;

/// Describes who owns a binding scope.
///
/// Bindings pushed while no task is installed belong to the thread's
/// fallback store and have no task owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeOwner {
    /// The scope was opened by a task.
    Task(TaskId),
    /// The scope was opened on the thread-local fallback store.
    Thread,
}

impl ScopeOwner {
    pub(crate) fn from_task(task: Option<TaskId>) -> ScopeOwner {
        match task {
            Some(id) => ScopeOwner::Task(id),
            None => ScopeOwner::Thread,
        }
    }
}

impl std::fmt::Display for ScopeOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match *self {
            ScopeOwner::Task(id) => write!(f, "task {}", id),
            ScopeOwner::Thread => write!(f, "the thread fallback store"),
        }
    }
}

/// Programmer errors detected by the context runtime.
///
/// Both variants describe a structured child task that outlives the
/// `with_value` scope it inherits from.  They are fatal: the scope exit and
/// task install points panic with this error's message.  Only
/// [`TaskContext::try_run`](crate::TaskContext::try_run) hands one back as a
/// value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContextError {
    /// A scope exited while structured children inheriting from it were
    /// still outstanding.
    #[error(
        "binding of {key} in {owner} exited while {outstanding} structured child task(s) \
         inheriting from it were still outstanding; wrap the whole spawn region in \
         with_value or bind the value inside the child"
    )]
    ScopeOutlivedByChild {
        key: String,
        owner: ScopeOwner,
        outstanding: usize,
    },

    /// A structured child started running after the scope it inherits from
    /// had already exited.
    #[error(
        "structured child task {child} started after the binding of {key} in {owner} it \
         inherits from had exited"
    )]
    InheritedScopeExited {
        child: TaskId,
        key: String,
        owner: ScopeOwner,
    },
}

/// Reports a misuse and halts the offending flow of control.
pub(crate) fn fatal(err: ContextError) -> ! {
    tracing::error!(error = %err, "task context misuse");
    panic!("{}", err)
}
