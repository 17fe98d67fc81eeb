use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Counts the asynchronous operations that are still running against an object.
#[derive(Debug, Default)]
pub struct GuardCount {
    count: AtomicUsize,
    drained: Notify,
}

impl GuardCount {
    pub fn new() -> GuardCount {
        GuardCount::default()
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    fn acquire(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self) {
        let previous = self.count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "guard released more often than acquired");
        if previous == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Resolves once no guard is alive.
    pub async fn drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            // Register before checking, so a release in between is not missed.
            notified.as_mut().enable();

            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Objects whose in-flight operations are tracked with [`Guard`]s.
pub trait Guarded: Send + Sync + 'static {
    fn guard_count(&self) -> &GuardCount;
}

/// A token held by every in-flight operation (a pending connect, a pending write, the read loop,
/// an offloaded decode) and by every callback body while it runs.
///
/// The token owns a strong reference, so the guarded object stays alive for as long as the token
/// does. Cloning takes another token; dropping releases exactly one.
pub struct Guard<T: Guarded> {
    target: Arc<T>,
}

impl<T: Guarded> Guard<T> {
    pub fn new(target: &Arc<T>) -> Guard<T> {
        target.guard_count().acquire();
        Guard {
            target: target.clone(),
        }
    }

    pub fn target(&self) -> &Arc<T> {
        &self.target
    }
}

impl<T: Guarded> Clone for Guard<T> {
    fn clone(&self) -> Self {
        Guard::new(&self.target)
    }
}

impl<T: Guarded> Deref for Guard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.target
    }
}

impl<T: Guarded> Drop for Guard<T> {
    fn drop(&mut self) {
        self.target.guard_count().release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[derive(Default)]
    struct Target {
        guards: GuardCount,
    }

    impl Guarded for Target {
        fn guard_count(&self) -> &GuardCount {
            &self.guards
        }
    }

    #[test]
    fn acquire_and_release() {
        let target = Arc::new(Target::default());

        let guard = Guard::new(&target);
        assert_eq!(target.guards.count(), 1);

        let copy = guard.clone();
        assert_eq!(target.guards.count(), 2);

        drop(guard);
        assert_eq!(target.guards.count(), 1);

        drop(copy);
        assert_eq!(target.guards.count(), 0);
    }

    #[test]
    fn moving_does_not_release() {
        let target = Arc::new(Target::default());
        let guard = Guard::new(&target);

        let moved = guard;
        let boxed = Box::new(moved);

        assert_eq!(target.guards.count(), 1);
        drop(boxed);
        assert_eq!(target.guards.count(), 0);
    }

    #[test]
    fn guard_keeps_target_alive() {
        let target = Arc::new(Target::default());
        let guard = Guard::new(&target);
        let weak = Arc::downgrade(&target);

        drop(target);

        assert!(weak.upgrade().is_some());
        assert_eq!(guard.guards.count(), 1);

        drop(guard);
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test]
    async fn drained_waits_for_last_guard() {
        let target = Arc::new(Target::default());
        let guard = Guard::new(&target);

        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard);
        });

        timeout(Duration::from_secs(1), target.guards.drained())
            .await
            .expect("guards never drained");
        assert_eq!(target.guards.count(), 0);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn drained_without_guards() {
        let target = Target::default();

        timeout(Duration::from_millis(10), target.guards.drained())
            .await
            .unwrap();
    }
}
