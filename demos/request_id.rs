#[macro_use]
extern crate task_context;

use std::env;
use std::thread;

use task_context::TaskContext;

task_local!(static LOCALE: String = env::var("LANG").unwrap_or_else(|_| "en_US".into()));

fn main() {
    TaskContext::root().run(|| {
        println!("the current locale is {}", LOCALE.get());
        LOCALE.with_value("de_DE".into(), || {
            println!("changing locale to {}", LOCALE.get());

            let child = TaskContext::child();
            let detached = TaskContext::detached();
            thread::scope(|s| {
                s.spawn(move || {
                    child.run(|| {
                        println!("the locale in the child task is {}", LOCALE.get());
                        LOCALE.with_value("fr_FR".into(), || {
                            println!("the new locale in the child task is {}", LOCALE.get());
                        });
                    })
                });
                s.spawn(move || {
                    detached.run(|| {
                        println!("the locale in a detached task is {}", LOCALE.get());
                    })
                });
            });

            println!("the locale of the parent task is again {}", LOCALE.get());
        });
    });
}
