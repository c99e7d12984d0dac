use std::ops::{Deref, DerefMut};

#[cfg(feature = "lock_tracking")]
mod tracking {
    use std::{
        collections::VecDeque,
        time::{Duration, Instant},
    };

    use tracing::warn;

    use super::*;

    const HISTORY: usize = 16;
    const SLOW: Duration = Duration::from_millis(1);

    #[derive(Debug)]
    struct Inner<T> {
        /// Most recent holders first
        holders: VecDeque<(&'static str, Duration)>,
        value: T,
    }

    /// A Mutex that warns when the client state is held or awaited for too long
    #[derive(Debug)]
    pub(crate) struct Mutex<T> {
        inner: std::sync::Mutex<Inner<T>>,
    }

    impl<T> Mutex<T> {
        pub(crate) fn new(value: T) -> Self {
            Self {
                inner: std::sync::Mutex::new(Inner {
                    holders: VecDeque::with_capacity(HISTORY),
                    value,
                }),
            }
        }

        /// Acquire the lock on behalf of `purpose`
        pub(crate) fn lock(&self, purpose: &'static str) -> MutexGuard<'_, T> {
            let requested = Instant::now();
            let guard = self.inner.lock().unwrap();
            let acquired = Instant::now();
            let waited = acquired - requested;
            if waited > SLOW {
                warn!(
                    purpose,
                    ?waited,
                    holders = ?guard.holders,
                    "slow to lock client state"
                );
            }
            MutexGuard {
                guard,
                acquired,
                purpose,
            }
        }
    }

    pub(crate) struct MutexGuard<'a, T> {
        guard: std::sync::MutexGuard<'a, Inner<T>>,
        acquired: Instant,
        purpose: &'static str,
    }

    impl<T> Drop for MutexGuard<'_, T> {
        fn drop(&mut self) {
            let held = self.acquired.elapsed();
            if held > SLOW {
                warn!(purpose = self.purpose, ?held, "client state held for long");
            }
            let holders = &mut self.guard.holders;
            if holders.len() == HISTORY {
                holders.pop_back();
            }
            holders.push_front((self.purpose, held));
        }
    }

    impl<T> Deref for MutexGuard<'_, T> {
        type Target = T;

        fn deref(&self) -> &T {
            &self.guard.value
        }
    }

    impl<T> DerefMut for MutexGuard<'_, T> {
        fn deref_mut(&mut self) -> &mut T {
            &mut self.guard.value
        }
    }
}

#[cfg(feature = "lock_tracking")]
pub(crate) use tracking::Mutex;

#[cfg(not(feature = "lock_tracking"))]
mod plain {
    use super::*;

    /// A Mutex whose lock sites name their purpose, for the `lock_tracking` feature
    #[derive(Debug)]
    pub(crate) struct Mutex<T> {
        inner: std::sync::Mutex<T>,
    }

    impl<T> Mutex<T> {
        pub(crate) fn new(value: T) -> Self {
            Self {
                inner: std::sync::Mutex::new(value),
            }
        }

        pub(crate) fn lock(&self, _purpose: &'static str) -> MutexGuard<'_, T> {
            MutexGuard(self.inner.lock().unwrap())
        }
    }

    pub(crate) struct MutexGuard<'a, T>(std::sync::MutexGuard<'a, T>);

    impl<T> Deref for MutexGuard<'_, T> {
        type Target = T;

        fn deref(&self) -> &T {
            &self.0
        }
    }

    impl<T> DerefMut for MutexGuard<'_, T> {
        fn deref_mut(&mut self) -> &mut T {
            &mut self.0
        }
    }
}

#[cfg(not(feature = "lock_tracking"))]
pub(crate) use plain::Mutex;
