use std::future::Future;
use std::pin::Pin;
use std::sync::Once;
use std::task::{Context, Poll};

static INIT_LOGGING: Once = Once::new();

/// Routes `tracing` output of the crate into the test harness.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .with_thread_ids(true)
            .with_ansi(false)
            .try_init();
    });
}

/// A future that returns `Pending` once before completing.
#[allow(dead_code)]
pub struct YieldNow(bool);

#[allow(dead_code)]
pub fn yield_now() -> YieldNow {
    YieldNow(false)
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<()> {
        if self.0 {
            Poll::Ready(())
        } else {
            self.0 = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}
