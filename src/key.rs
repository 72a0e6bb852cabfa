use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::ctx;
use crate::data::Binding;
use crate::scope::{self, ScopedValue};

static NEXT_KEY_ID: AtomicU64 = AtomicU64::new(1);

/// The identity of a declared task-local key.
///
/// Two keys are the same slot only if their ids are equal; keys declared
/// separately never share an id, whatever their type or default.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(u64);

impl KeyId {
    pub(crate) fn next() -> KeyId {
        KeyId(NEXT_KEY_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A task-local key with a default value.
///
/// A key is a slot that can be bound for the duration of a scope with
/// [`with_value`](TaskLocal::with_value).  Bound values are visible to the
/// code running inside the scope and to all structured child tasks spawned
/// from it.  Everywhere else reads return the default.
///
/// Keys are usually declared as statics with the [`task_local!`] macro but
/// can also be created at runtime with [`TaskLocal::new`].  Every call
/// allocates a new identity.
///
/// ## Example
///
/// ```
/// # use task_context::TaskLocal;
/// let request_id = TaskLocal::new(String::from("none"));
/// assert_eq!(request_id.get(), "none");
/// request_id.with_value("1234".into(), || {
///     assert_eq!(request_id.get(), "1234");
/// });
/// assert_eq!(request_id.get(), "none");
/// ```
pub struct TaskLocal<T> {
    id: KeyId,
    name: Option<&'static str>,
    default: Arc<T>,
}

impl<T> fmt::Debug for TaskLocal<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskLocal")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl<T: Send + Sync + 'static> TaskLocal<T> {
    /// Declares a new key with the given default.
    pub fn new(default: T) -> TaskLocal<T> {
        TaskLocal {
            id: KeyId::next(),
            name: None,
            default: Arc::new(default),
        }
    }

    /// Declares a new key that carries a name for diagnostics.
    pub fn named(name: &'static str, default: T) -> TaskLocal<T> {
        TaskLocal {
            name: Some(name),
            ..TaskLocal::new(default)
        }
    }

    /// Returns the identity of this key.
    pub fn id(&self) -> KeyId {
        self.id
    }

    /// Returns the diagnostic name if the key has one.
    pub fn name(&self) -> Option<&'static str> {
        self.name
    }

    /// Returns the default value.
    pub fn default_value(&self) -> &T {
        &self.default
    }

    /// Invokes a closure with a reference to the current value.
    ///
    /// The current value is the innermost binding visible from the current
    /// task (or the thread fallback store) or the default if there is none.
    pub fn with<F: FnOnce(&T) -> R, R>(&self, f: F) -> R {
        match self.lookup() {
            Some(value) => f(&*value),
            None => f(&*self.default),
        }
    }

    /// Returns a clone of the current value.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.with(T::clone)
    }

    /// Returns the bound value or `None` if only the default applies.
    pub fn try_get(&self) -> Option<T>
    where
        T: Clone,
    {
        self.lookup().map(|value| (*value).clone())
    }

    /// Checks if any binding of this key is visible.
    pub fn is_bound(&self) -> bool {
        self.lookup().is_some()
    }

    /// Binds `value` for the duration of `f`.
    ///
    /// The binding is removed again however `f` exits, including by
    /// panicking.  Nested bindings of the same key shadow outer ones until
    /// they exit.
    ///
    /// # Panics
    ///
    /// Exiting the scope while a structured child spawned inside it (see
    /// [`TaskContext::child`](crate::TaskContext::child)) is still
    /// outstanding is a programmer error and panics.
    ///
    /// ## Example
    ///
    /// ```
    /// # use task_context::TaskLocal;
    /// let number = TaskLocal::new(0u32);
    /// number.with_value(1111, || {
    ///     assert_eq!(number.get(), 1111);
    ///     number.with_value(2222, || assert_eq!(number.get(), 2222));
    ///     assert_eq!(number.get(), 1111);
    /// });
    /// ```
    pub fn with_value<F: FnOnce() -> R, R>(&self, value: T, f: F) -> R {
        scope::with_value(self.binding(value), f)
    }

    /// Binds `value` while the given future runs.
    ///
    /// The binding stays visible to the future across suspension points and
    /// is never visible to anything else polled by the same task in between.
    pub fn with_value_async<F: Future>(&self, value: T, future: F) -> ScopedValue<F> {
        ScopedValue::new(self.binding(value), future)
    }

    fn binding(&self, value: T) -> Binding {
        Binding {
            key: self.id,
            name: self.name,
            value: Arc::new(value),
        }
    }

    fn lookup(&self) -> Option<Arc<T>> {
        ctx::lookup(self.id).and_then(|value| value.downcast::<T>().ok())
    }
}

/// Declares one or more static task-local keys.
///
/// Each key is initialized lazily on first use and is named after the static
/// for diagnostics.
///
/// ## Example
///
/// ```
/// # #[macro_use] extern crate task_context;
/// task_local! {
///     static REQUEST_ID: String = "none".to_string();
///     pub static ATTEMPT: u32 = 0;
/// }
///
/// # fn main() {
/// assert_eq!(REQUEST_ID.get(), "none");
/// assert_eq!(REQUEST_ID.name(), Some("REQUEST_ID"));
/// ATTEMPT.with_value(2, || assert_eq!(ATTEMPT.get(), 2));
/// # }
/// ```
#[macro_export]
macro_rules! task_local {
    () => {};
    ($(#[$attr:meta])* static $name:ident : $t:ty = $init:expr; $($rest:tt)*) => {
        $crate::__lazy_static! {
            $(#[$attr])* static ref $name: $crate::TaskLocal<$t> =
                $crate::TaskLocal::named(stringify!($name), $init);
        }
        $crate::task_local!($($rest)*);
    };
    ($(#[$attr:meta])* pub static $name:ident : $t:ty = $init:expr; $($rest:tt)*) => {
        $crate::__lazy_static! {
            $(#[$attr])* pub static ref $name: $crate::TaskLocal<$t> =
                $crate::TaskLocal::named(stringify!($name), $init);
        }
        $crate::task_local!($($rest)*);
    };
    ($(#[$attr:meta])* pub(crate) static $name:ident : $t:ty = $init:expr; $($rest:tt)*) => {
        $crate::__lazy_static! {
            $(#[$attr])* pub(crate) static ref $name: $crate::TaskLocal<$t> =
                $crate::TaskLocal::named(stringify!($name), $init);
        }
        $crate::task_local!($($rest)*);
    };
    ($(#[$attr:meta])* static $name:ident : $t:ty = $init:expr) => {
        $crate::task_local!($(#[$attr])* static $name: $t = $init;);
    };
    ($(#[$attr:meta])* pub static $name:ident : $t:ty = $init:expr) => {
        $crate::task_local!($(#[$attr])* pub static $name: $t = $init;);
    };
    ($(#[$attr:meta])* pub(crate) static $name:ident : $t:ty = $init:expr) => {
        $crate::task_local!($(#[$attr])* pub(crate) static $name: $t = $init;);
    };
}
