//! Start/stop lifecycle for network components
//!
//! Every listener-owning component (broker, rendezvous server, host agent) owns a [`Lifecycle`].
//! It records an explicit [`WorkerState`], hands out the cancellation token that subordinate
//! tasks observe, and tracks every spawned task so that [`Lifecycle::shutdown`] only returns
//! once all of them have exited.

use async_trait::async_trait;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

/// Run state of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Faulted,
}

/// Events that move a component between states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Start,
    Started,
    Stop,
    Stopped,
    Faulted,
}

impl WorkerState {
    /// The state reached by applying `event`, or None if the transition is not allowed
    pub fn apply(self, event: LifecycleEvent) -> Option<WorkerState> {
        use LifecycleEvent as E;
        use WorkerState as S;

        match (self, event) {
            (S::Idle | S::Stopped | S::Faulted, E::Start) => Some(S::Starting),
            (S::Starting, E::Started) => Some(S::Running),
            (S::Starting | S::Running, E::Stop) => Some(S::Stopping),
            (S::Stopping, E::Stopped) => Some(S::Stopped),
            (S::Starting | S::Running | S::Stopping, E::Faulted) => Some(S::Faulted),
            _ => None,
        }
    }

    pub fn is_running(self) -> bool {
        self == WorkerState::Running
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("{name} is already running")]
    AlreadyRunning { name: String },

    #[error("{name} cannot handle {event:?} while {state:?}")]
    InvalidTransition {
        name: String,
        state: WorkerState,
        event: LifecycleEvent,
    },
}

struct Inner {
    state: WorkerState,
    token: CancellationToken,
    tracker: TaskTracker,
}

/// Explicit run state plus the cancellation token and task set of one component
pub struct Lifecycle {
    name: String,
    inner: Mutex<Inner>,
}

impl Lifecycle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                state: WorkerState::Idle,
                token: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkerState {
        self.lock().state
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, inner: &mut Inner, event: LifecycleEvent) -> Result<(), LifecycleError> {
        match inner.state.apply(event) {
            Some(next) => {
                debug!(worker = %self.name, from = ?inner.state, to = ?next, "State transition");
                inner.state = next;
                Ok(())
            }
            None if event == LifecycleEvent::Start => Err(LifecycleError::AlreadyRunning {
                name: self.name.clone(),
            }),
            None => Err(LifecycleError::InvalidTransition {
                name: self.name.clone(),
                state: inner.state,
                event,
            }),
        }
    }

    /// Enter `Starting` with a fresh token and task set
    ///
    /// The token is a child of `parent` when given, so cancelling the parent also stops
    /// this component's tasks.
    pub fn begin(
        &self,
        parent: Option<&CancellationToken>,
    ) -> Result<CancellationToken, LifecycleError> {
        let mut inner = self.lock();
        self.transition(&mut inner, LifecycleEvent::Start)?;
        inner.token = parent
            .map(CancellationToken::child_token)
            .unwrap_or_else(CancellationToken::new);
        inner.tracker = TaskTracker::new();
        Ok(inner.token.clone())
    }

    /// `Starting` -> `Running`, once the component is listening
    pub fn started(&self) -> Result<(), LifecycleError> {
        let mut inner = self.lock();
        self.transition(&mut inner, LifecycleEvent::Started)
    }

    /// Mark the component faulted and cancel its tasks
    pub fn fault(&self) {
        let mut inner = self.lock();
        if self.transition(&mut inner, LifecycleEvent::Faulted).is_ok() {
            inner.token.cancel();
        }
    }

    /// Token observed by this component's tasks
    pub fn token(&self) -> CancellationToken {
        self.lock().token.clone()
    }

    /// Spawn a task that `shutdown` will wait for
    pub fn spawn<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let tracker = self.lock().tracker.clone();
        tracker.spawn(task)
    }

    /// Task set of the current run, for tasks that spawn further tracked tasks
    pub fn tracker(&self) -> TaskTracker {
        self.lock().tracker.clone()
    }

    /// Number of tracked tasks still running
    pub fn active_tasks(&self) -> usize {
        self.lock().tracker.len()
    }

    /// Cancel every task and wait until all of them have exited
    ///
    /// Safe to call in any state and more than once; a faulted component stays `Faulted`.
    pub async fn shutdown(&self) {
        let (token, tracker) = {
            let mut inner = self.lock();
            // Idle, Stopped and Faulted have no transition; still drain below.
            let _ = self.transition(&mut inner, LifecycleEvent::Stop);
            (inner.token.clone(), inner.tracker.clone())
        };

        token.cancel();
        tracker.close();
        tracker.wait().await;

        let mut inner = self.lock();
        if inner.state == WorkerState::Stopping {
            let _ = self.transition(&mut inner, LifecycleEvent::Stopped);
        }
    }
}

/// Uniform start/stop contract of the network components
///
/// `start` returns once the component is listening (or connecting), not once it has
/// finished serving. `stop` cancels everything the component spawned and returns only
/// after all of it has exited and released its sockets.
#[async_trait]
pub trait Worker: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn state(&self) -> WorkerState;

    fn is_running(&self) -> bool {
        self.state().is_running()
    }

    async fn start(&self) -> Result<(), Self::Error>;

    async fn stop(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_state_transitions() {
        use LifecycleEvent as E;
        use WorkerState as S;

        assert_eq!(S::Idle.apply(E::Start), Some(S::Starting));
        assert_eq!(S::Starting.apply(E::Started), Some(S::Running));
        assert_eq!(S::Running.apply(E::Stop), Some(S::Stopping));
        assert_eq!(S::Stopping.apply(E::Stopped), Some(S::Stopped));
        assert_eq!(S::Stopped.apply(E::Start), Some(S::Starting));
        assert_eq!(S::Faulted.apply(E::Start), Some(S::Starting));

        assert_eq!(S::Running.apply(E::Start), None);
        assert_eq!(S::Idle.apply(E::Stopped), None);
        assert_eq!(S::Stopped.apply(E::Faulted), None);
    }

    #[test]
    fn test_begin_twice_fails() {
        let lifecycle = Lifecycle::new("test");
        lifecycle.begin(None).unwrap();
        lifecycle.started().unwrap();

        assert!(matches!(
            lifecycle.begin(None),
            Err(LifecycleError::AlreadyRunning { .. })
        ));
        assert_eq!(lifecycle.state(), WorkerState::Running);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_tasks() {
        let lifecycle = Lifecycle::new("test");
        let token = lifecycle.begin(None).unwrap();
        lifecycle.started().unwrap();

        let exited = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let token = token.clone();
            let exited = exited.clone();
            lifecycle.spawn(async move {
                token.cancelled().await;
                // Cleanup after cancellation still finishes before shutdown returns
                tokio::time::sleep(Duration::from_millis(20)).await;
                exited.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert_eq!(lifecycle.active_tasks(), 4);
        lifecycle.shutdown().await;

        assert_eq!(exited.load(Ordering::SeqCst), 4);
        assert_eq!(lifecycle.active_tasks(), 0);
        assert_eq!(lifecycle.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_restart_after_shutdown() {
        let lifecycle = Lifecycle::new("test");
        let first = lifecycle.begin(None).unwrap();
        lifecycle.started().unwrap();
        lifecycle.shutdown().await;
        assert!(first.is_cancelled());

        let second = lifecycle.begin(None).unwrap();
        lifecycle.started().unwrap();
        assert!(!second.is_cancelled());
        assert_eq!(lifecycle.state(), WorkerState::Running);
    }

    #[tokio::test]
    async fn test_parent_cancellation_propagates() {
        let parent = CancellationToken::new();
        let lifecycle = Lifecycle::new("child");
        let token = lifecycle.begin(Some(&parent)).unwrap();

        parent.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_fault_is_sticky() {
        let lifecycle = Lifecycle::new("test");
        let token = lifecycle.begin(None).unwrap();
        lifecycle.fault();

        assert!(token.is_cancelled());
        lifecycle.shutdown().await;
        assert_eq!(lifecycle.state(), WorkerState::Faulted);
    }
}
