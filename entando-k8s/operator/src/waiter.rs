//! Bridge from pushed status updates to a bounded wait on a condition.
//!
//! A feed (usually a watch on a single pod) pushes every observed value into a
//! [ConditionWaiter]. Callers register a condition and block until the latest
//! value satisfies it or their deadline passes.

use std::{fmt::Display, sync::Arc, sync::Mutex, time::Duration};

use thiserror::Error;
use tokio::{sync::oneshot, time::Instant};

use crate::util::lock;

/// Latest-value slot which evaluates registered conditions on every update
pub(crate) struct ConditionWaiter<T> {
    inner: Arc<Mutex<ConditionWaiterInner<T>>>,
}

impl<T> Clone for ConditionWaiter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for ConditionWaiter<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ConditionWaiterInner {
                latest: None,
                notifications: Vec::new(),
            })),
        }
    }
}

/// [ConditionWaiter] inner type
struct ConditionWaiterInner<T> {
    /// last value pushed by the feed, `None` until the first update
    latest: Option<T>,
    /// Conditions to be evaluated on updates and notified if satisfied
    notifications: Vec<Notification<T>>,
}

impl<T: Clone + 'static> ConditionWaiterInner<T> {
    /// Check all notifications and fire those with satisfied conditions
    fn fire_notifications(&mut self) {
        let Some(latest) = self.latest.as_ref() else {
            return;
        };
        self.notifications = self
            .notifications
            .drain(..)
            .filter_map(|x| x.check(latest))
            .collect();
    }
}

impl<T> ConditionWaiter<T>
where
    T: Clone + Send + 'static,
{
    /// Replace the latest value and fire every notification it satisfies
    pub(crate) fn update(&self, value: T) {
        let mut guard = lock(&self.inner);
        guard.latest = Some(value);
        guard.fire_notifications();
    }

    #[cfg(test)]
    pub(crate) fn latest(&self) -> Option<T> {
        lock(&self.inner).latest.clone()
    }

    /// Wait until the latest value satisfies `condition` and return that value.
    ///
    /// Returns immediately if the current value already satisfies it.
    pub(crate) async fn wait_for(
        &self,
        condition: impl Condition<T>,
        timeout: Duration,
        target: &WaitTarget,
    ) -> Result<T, WaitError> {
        let started = Instant::now();
        let on_complete = {
            let mut guard = lock(&self.inner);
            if let Some(latest) = guard.latest.as_ref() {
                if condition.evaluate(latest) {
                    return Ok(latest.clone());
                }
            }
            let (notification, on_complete) = Notification::new(condition);
            guard.notifications.push(notification);
            on_complete
        };

        match tokio::time::timeout(timeout, on_complete).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(WaitError::Closed {
                target: target.clone(),
            }),
            Err(_) => Err(WaitError::Timeout {
                target: target.clone(),
                elapsed_secs: started.elapsed().as_secs(),
            }),
        }
    }

    #[cfg(test)]
    fn pending_notifications(&self) -> usize {
        lock(&self.inner).notifications.len()
    }
}

/// A condition to evaluate and a oneshot to complete once it is satisfied
struct Notification<T> {
    condition: Box<dyn Condition<T>>,
    on_complete: oneshot::Sender<T>,
}

impl<T: Clone + 'static> Notification<T> {
    fn new(condition: impl Condition<T>) -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        let notification = Self {
            condition: Box::new(condition),
            on_complete: tx,
        };
        (notification, rx)
    }

    /// Fire the notification if its condition holds. Firing the notification
    /// destroys it, as does a receiver which stopped waiting.
    fn check(self, value: &T) -> Option<Self> {
        if self.on_complete.is_closed() {
            None
        } else if self.condition.evaluate(value) {
            // the receiver may have timed out in the meantime
            let _ = self.on_complete.send(value.clone());
            None
        } else {
            Some(self)
        }
    }
}

pub(crate) trait Condition<T>: Send + Sync + 'static {
    /// Once this returns true the waiting caller is released
    fn evaluate(&self, value: &T) -> bool;
}
impl<X, T> Condition<T> for X
where
    X: Fn(&T) -> bool + Send + Sync + 'static,
{
    fn evaluate(&self, value: &T) -> bool {
        self(value)
    }
}

/// The object a caller is waiting on, used to describe timeouts
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WaitTarget {
    pub(crate) namespace: String,
    pub(crate) name: String,
    /// what the caller waits for, e.g. "ready"
    pub(crate) state: &'static str,
}

impl WaitTarget {
    pub(crate) fn pod(namespace: &str, name: &str, state: &'static str) -> Self {
        Self {
            namespace: namespace.to_owned(),
            name: name.to_owned(),
            state,
        }
    }
}

impl Display for WaitTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pod {}/{} to be {}", self.namespace, self.name, self.state)
    }
}

#[derive(Debug, Error)]
pub(crate) enum WaitError {
    #[error("Timed out after {elapsed_secs}s waiting for {target}")]
    Timeout {
        target: WaitTarget,
        elapsed_secs: u64,
    },
    #[error("Update feed closed while waiting for {target}")]
    Closed { target: WaitTarget },
}
