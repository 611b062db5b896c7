use std::fmt;

use parking_lot::Mutex;

type Teardown = Box<dyn FnOnce() + Send + 'static>;

/// Handle returned by every subscribe operation. Calling [`cancel`] (or
/// dropping the handle) runs the teardown exactly once.
///
/// [`cancel`]: Unsubscribe::cancel
pub struct Unsubscribe {
    teardown: Mutex<Option<Teardown>>,
}

impl Unsubscribe {
    pub fn new(teardown: impl FnOnce() + Send + 'static) -> Self {
        Self {
            teardown: Mutex::new(Some(Box::new(teardown))),
        }
    }

    /// A handle with nothing to tear down.
    pub fn noop() -> Self {
        Self {
            teardown: Mutex::new(None),
        }
    }

    /// Run the teardown. Idempotent.
    pub fn cancel(&self) {
        let teardown = self.teardown.lock().take();
        if let Some(f) = teardown {
            f();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.teardown.lock().is_none()
    }

    /// One handle that cancels all of `handles` in order.
    pub fn combine(handles: Vec<Unsubscribe>) -> Self {
        Self::new(move || {
            for handle in handles {
                handle.cancel();
            }
        })
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        (hits, move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn cancel_runs_once() {
        let (hits, f) = counter();
        let unsub = Unsubscribe::new(f);
        unsub.cancel();
        unsub.cancel();
        drop(unsub);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_cancels() {
        let (hits, f) = counter();
        {
            let _unsub = Unsubscribe::new(f);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn combine_cancels_every_handle() {
        let (a, fa) = counter();
        let (b, fb) = counter();
        let all = Unsubscribe::combine(vec![Unsubscribe::new(fa), Unsubscribe::new(fb)]);
        assert!(!all.is_cancelled());
        all.cancel();
        assert!(all.is_cancelled());
        assert_eq!(a.load(Ordering::SeqCst) + b.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn noop_is_already_cancelled() {
        assert!(Unsubscribe::noop().is_cancelled());
    }
}
