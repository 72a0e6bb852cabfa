#[macro_use]
extern crate task_context;

mod common;

use std::panic;
use std::thread;

use common::init_test_logging;
use task_context::{TaskContext, TaskKind, TaskLocal};

task_local! {
    static REQUEST_ID: String = "none".to_string();
    static NUMBER: u32 = 0;
    static PREF: &'static str = "default";
}

task_local!(pub(crate) static RETRIES: u32 = 1);

#[test]
fn test_default_outside_any_scope() {
    init_test_logging();
    assert_eq!(REQUEST_ID.get(), "none");
    assert!(!REQUEST_ID.is_bound());
    assert_eq!(REQUEST_ID.try_get(), None);
    TaskContext::root().run(|| {
        assert_eq!(REQUEST_ID.get(), "none");
    });
}

#[test]
fn test_request_id_scope() {
    REQUEST_ID.with_value("1234".into(), || {
        assert_eq!(REQUEST_ID.get(), "1234");
        assert_eq!(REQUEST_ID.try_get(), Some("1234".to_string()));
        assert!(REQUEST_ID.is_bound());
    });
    assert_eq!(REQUEST_ID.get(), "none");
}

#[test]
fn test_shadow_and_restore() {
    TaskContext::root().run(|| {
        NUMBER.with_value(1111, || {
            assert_eq!(NUMBER.get(), 1111);
            let inner = NUMBER.with_value(2222, || NUMBER.get());
            assert_eq!(inner, 2222);
            assert_eq!(NUMBER.get(), 1111);
        });
        assert_eq!(NUMBER.get(), 0);
    });
}

#[test]
fn test_keys_never_alias() {
    let a = TaskLocal::new(7u32);
    let b = TaskLocal::new(7u32);
    assert_ne!(a.id(), b.id());
    a.with_value(1, || {
        assert_eq!(a.get(), 1);
        assert_eq!(b.get(), 7);
    });
}

#[test]
fn test_declared_keys_are_named() {
    assert_eq!(REQUEST_ID.name(), Some("REQUEST_ID"));
    assert_eq!(TaskLocal::new(0u8).name(), None);
    assert_eq!(TaskLocal::named("attempt", 3u8).name(), Some("attempt"));
    assert_eq!(*NUMBER.default_value(), 0);
    assert_eq!(RETRIES.name(), Some("RETRIES"));
    RETRIES.with_value(4, || assert_eq!(RETRIES.get(), 4));
}

#[test]
fn test_with_borrows_without_clone() {
    let payload = TaskLocal::new(vec![1u8, 2, 3]);
    assert_eq!(payload.with(|v| v.len()), 3);
    payload.with_value(vec![9; 16], || {
        assert_eq!(payload.with(|v| v.len()), 16);
    });
}

#[test]
fn test_binding_popped_when_operation_panics() {
    TaskContext::root().run(|| {
        let rv = panic::catch_unwind(|| {
            NUMBER.with_value(5, || {
                assert_eq!(NUMBER.get(), 5);
                panic!("operation failed");
            })
        });
        assert!(rv.is_err());
        assert_eq!(NUMBER.get(), 0);
    });
}

#[test]
fn test_operation_error_propagates_unchanged() {
    let rv: Result<u32, String> = NUMBER.with_value(9, || Err(format!("failed at {}", NUMBER.get())));
    assert_eq!(rv, Err("failed at 9".to_string()));
    assert_eq!(NUMBER.get(), 0);
}

#[test]
fn test_structured_child_inherits() {
    init_test_logging();
    TaskContext::root().run(|| {
        REQUEST_ID.with_value("abc".into(), || {
            let child = TaskContext::child();
            assert_eq!(child.kind(), TaskKind::Structured);
            assert_eq!(child.parent(), TaskContext::current_id());
            thread::scope(|s| {
                let handle = s.spawn(move || child.run(|| REQUEST_ID.get()));
                assert_eq!(handle.join().unwrap(), "abc");
            });
        });
    });
}

#[test]
fn test_detached_does_not_inherit() {
    TaskContext::root().run(|| {
        REQUEST_ID.with_value("abc".into(), || {
            let detached = TaskContext::detached();
            assert_eq!(detached.ancestor(), None);
            let rv = thread::spawn(move || detached.run(|| REQUEST_ID.get()))
                .join()
                .unwrap();
            assert_eq!(rv, "none");
        });
    });
}

#[test]
fn test_continuing_copies_bindings() {
    TaskContext::root().run(|| {
        let continuing = NUMBER.with_value(1, || {
            NUMBER.with_value(42, || REQUEST_ID.with_value("r".into(), TaskContext::continuing))
        });
        // every scope has exited by now
        assert_eq!(NUMBER.get(), 0);
        assert_eq!(continuing.kind(), TaskKind::Continuing);
        let id = continuing.id();

        let (number, request, ancestor) = thread::spawn(move || {
            continuing.run(|| {
                let grandchild = TaskContext::child();
                (NUMBER.get(), REQUEST_ID.get(), grandchild.ancestor())
            })
        })
        .join()
        .unwrap();
        assert_eq!(number, 42);
        assert_eq!(request, "r");
        assert_eq!(ancestor, Some(id));
    });
}

#[test]
fn test_continuing_evolves_independently() {
    TaskContext::root().run(|| {
        NUMBER.with_value(1, || {
            let continuing = TaskContext::continuing();
            NUMBER.with_value(2, || {
                let seen = continuing.run(|| {
                    let rebound = NUMBER.with_value(3, || NUMBER.get());
                    (NUMBER.get(), rebound)
                });
                assert_eq!(seen, (1, 3));
                assert_eq!(NUMBER.get(), 2);
            });
        });
    });
}

#[test]
fn test_siblings_do_not_leak() {
    TaskContext::root().run(|| {
        PREF.with_value("A", || {
            let first = TaskContext::child();
            let second = TaskContext::child();
            thread::scope(|s| {
                let a = s.spawn(move || first.run(|| PREF.with_value("B", || PREF.get())));
                let b = s.spawn(move || second.run(|| PREF.get()));
                assert_eq!(a.join().unwrap(), "B");
                assert_eq!(b.join().unwrap(), "A");
            });
            assert_eq!(PREF.get(), "A");
        });
    });
}

#[test]
fn test_independent_branches() {
    TaskContext::root().run(|| {
        let (left, right) = thread::scope(|s| {
            let one = TaskContext::child();
            let two = TaskContext::child();
            let left = s.spawn(move || one.run(|| PREF.with_value("v1", || PREF.get())));
            let right = s.spawn(move || two.run(|| PREF.with_value("v2", || PREF.get())));
            (left.join().unwrap(), right.join().unwrap())
        });
        assert_eq!(left, "v1");
        assert_eq!(right, "v2");
        assert_eq!(PREF.get(), "default");
    });
}

#[test]
fn test_child_does_not_see_later_parent_bindings() {
    TaskContext::root().run(|| {
        NUMBER.with_value(1, || {
            let child = TaskContext::child();
            NUMBER.with_value(2, || {
                assert_eq!(child.run(|| NUMBER.get()), 1);
            });
        });
    });
}

#[test]
fn test_nearest_contributing_ancestor() {
    init_test_logging();
    let root = TaskContext::root();
    let root_id = root.id();
    root.run(|| {
        let empty = TaskContext::child();
        assert_eq!(empty.ancestor(), None);
        drop(empty);

        NUMBER.with_value(1, || {
            let mid = TaskContext::child();
            let mid_id = mid.id();
            assert_eq!(mid.ancestor(), Some(root_id));
            mid.run(|| {
                assert_eq!(TaskContext::current_id(), Some(mid_id));
                assert_eq!(TaskContext::current_ancestor(), Some(root_id));

                // mid has no bindings of its own yet, so it is skipped
                let grandchild = TaskContext::child();
                assert_eq!(grandchild.ancestor(), Some(root_id));

                REQUEST_ID.with_value("mid".into(), || {
                    let late = TaskContext::child();
                    assert_eq!(late.ancestor(), Some(mid_id));
                    assert_eq!(late.run(|| REQUEST_ID.get()), "mid");

                    // the earlier child was fixed at creation time
                    assert_eq!(grandchild.ancestor(), Some(root_id));
                });
                let seen = grandchild.run(|| (NUMBER.get(), REQUEST_ID.get()));
                assert_eq!(seen, (1, "none".to_string()));
            });
        });
    });
}

#[test]
fn test_run_restores_previous_task() {
    assert_eq!(TaskContext::current_id(), None);
    let root = TaskContext::root();
    let root_id = root.id();
    root.run(|| {
        let rv = panic::catch_unwind(|| {
            TaskContext::detached().run(|| panic!("child failed"));
        });
        assert!(rv.is_err());
        assert_eq!(TaskContext::current_id(), Some(root_id));
    });
    assert_eq!(TaskContext::current_id(), None);
}

#[test]
fn test_fallback_store_without_task() {
    assert_eq!(TaskContext::current_id(), None);
    let child = NUMBER.with_value(10, || {
        assert_eq!(NUMBER.get(), 10);
        NUMBER.with_value(11, || assert_eq!(NUMBER.get(), 11));
        TaskContext::child()
    });
    assert_eq!(NUMBER.get(), 0);
    assert_eq!(child.parent(), None);

    // spawned from the fallback store the child carries a copy
    let rv = thread::spawn(move || child.run(|| NUMBER.get()))
        .join()
        .unwrap();
    assert_eq!(rv, 10);
}

#[test]
fn test_continuing_from_fallback_store() {
    let continuing = NUMBER.with_value(9, TaskContext::continuing);
    assert_eq!(continuing.kind(), TaskKind::Continuing);
    let rv = thread::spawn(move || continuing.run(|| NUMBER.get()))
        .join()
        .unwrap();
    assert_eq!(rv, 9);
}

#[test]
fn test_fallback_store_is_not_visible_to_tasks() {
    NUMBER.with_value(10, || {
        assert_eq!(TaskContext::root().run(|| NUMBER.get()), 0);
        assert_eq!(TaskContext::detached().run(|| NUMBER.get()), 0);
        assert_eq!(NUMBER.get(), 10);
    });
}

#[test]
fn test_fallback_store_is_per_thread() {
    NUMBER.with_value(10, || {
        let rv = thread::spawn(|| NUMBER.get()).join().unwrap();
        assert_eq!(rv, 0);
    });
}
