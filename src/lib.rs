//! This crate implements task-local values for structured concurrency.  A
//! task-local value is bound for the duration of a scope and is visible to
//! everything that runs inside that scope, including child tasks spawned
//! from it, without being passed around explicitly.
//!
//! The design follows the task-local value model of structured concurrency
//! runtimes:
//!
//! *   Bindings live on a per-task LIFO stack.  Binding is a pointer push;
//!     nothing is broadcast or copied to descendants.
//! *   Structured child tasks keep a reference to the bindings their creator
//!     had on top at spawn time and walk that chain on lookup.  Ancestors that
//!     bound nothing are skipped entirely.
//! *   Detached tasks inherit nothing.  Continuing tasks receive a flattened
//!     copy of the creator's bindings and may outlive it.
//! *   Code running outside of any task (for instance on a plain thread) uses
//!     a thread-local fallback stack with the same semantics.
//! *   A structured child that outlives the scope it inherits from is a
//!     programmer error and is reported by panicking instead of reading stale
//!     data.
//!
//! The crate does not schedule anything itself.  A runtime captures a
//! [`TaskContext`] where it spawns work and runs the work inside it, either
//! synchronously with [`TaskContext::run`] or as a future with
//! [`TaskContext::scope`].
//!
//! # Example Usage
//!
//! ```
//! #[macro_use]
//! extern crate task_context;
//!
//! use std::thread;
//! use task_context::TaskContext;
//!
//! task_local! {
//!     static REQUEST_ID: String = "none".to_string();
//! }
//!
//! fn main() {
//!     TaskContext::root().run(|| {
//!         println!("request id outside: {}", REQUEST_ID.get());
//!         REQUEST_ID.with_value("1234".into(), || {
//!             let child = TaskContext::child();
//!             thread::scope(|s| {
//!                 s.spawn(move || {
//!                     child.run(|| println!("request id in child: {}", REQUEST_ID.get()));
//!                 });
//!             });
//!         });
//!     });
//! }
//! ```
//!
//! This prints:
//!
//! ```plain
//! request id outside: none
//! request id in child: 1234
//! ```

#[doc(hidden)]
pub use lazy_static::lazy_static as __lazy_static;

mod ctx;
mod data;
mod error;
mod key;
mod scope;

pub use ctx::{TaskContext, TaskId, TaskKind, TaskScope};
pub use error::{ContextError, ScopeOwner};
pub use key::{KeyId, TaskLocal};
pub use scope::ScopedValue;
