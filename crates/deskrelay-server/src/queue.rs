//! FIFO rendezvous between pending host sessions and public clients
//!
//! A [`RendezvousQueue`] holds, for one receive port, the host sessions waiting for a client and
//! the public clients waiting for a host. Whichever side arrives second is matched with the
//! oldest live entry on the other side. All mutation happens under one lock, so a session that
//! leaves the queue is bound to exactly one client.

use crate::error::RendezvousError;
use crate::session::HostSession;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, trace};
use uuid::Uuid;

/// Relay activity of one port, used to decide idle retirement
#[derive(Debug)]
struct Activity {
    active: AtomicUsize,
    last_active: Mutex<Instant>,
}

impl Activity {
    fn touch(&self) {
        *self.last_active.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}

/// Counts one relay as active on its port until dropped
#[derive(Debug)]
pub struct RelayGuard {
    activity: Arc<Activity>,
}

impl RelayGuard {
    fn new(activity: Arc<Activity>) -> Self {
        activity.active.fetch_add(1, Ordering::SeqCst);
        Self { activity }
    }
}

impl Drop for RelayGuard {
    fn drop(&mut self) {
        self.activity.touch();
        self.activity.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A public client handed to a host session
#[derive(Debug)]
pub struct MatchedTarget<S> {
    pub stream: S,
    pub guard: RelayGuard,
}

/// Result of queueing a host session
pub enum Admission<S> {
    /// A client was already waiting
    Matched(MatchedTarget<S>),
    /// Queued; the receiver resolves once a client arrives
    Waiting(oneshot::Receiver<MatchedTarget<S>>),
}

/// Result of offering a public client
pub enum Offer {
    /// Handed to the oldest live session
    Matched(Uuid),
    /// Parked; the receiver resolves once a session claims the client
    Queued {
        client_id: u64,
        claimed: oneshot::Receiver<()>,
    },
    /// The queue no longer accepts clients; the stream was dropped
    Closed,
}

struct PendingSession<S> {
    session: Arc<HostSession>,
    target_tx: oneshot::Sender<MatchedTarget<S>>,
}

struct WaitingClient<S> {
    id: u64,
    stream: S,
    accepted_at: Instant,
    claimed_tx: oneshot::Sender<()>,
}

struct QueueState<S> {
    accepting: bool,
    sessions: VecDeque<PendingSession<S>>,
    clients: VecDeque<WaitingClient<S>>,
}

pub struct RendezvousQueue<S> {
    port: u16,
    match_window: Duration,
    state: Mutex<QueueState<S>>,
    activity: Arc<Activity>,
    next_client_id: AtomicU64,
}

impl<S: Send + 'static> RendezvousQueue<S> {
    pub fn new(port: u16, match_window: Duration) -> Self {
        Self {
            port,
            match_window,
            state: Mutex::new(QueueState {
                accepting: true,
                sessions: VecDeque::new(),
                clients: VecDeque::new(),
            }),
            activity: Arc::new(Activity {
                active: AtomicUsize::new(0),
                last_active: Mutex::new(Instant::now()),
            }),
            next_client_id: AtomicU64::new(1),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<S>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a host session, or match it at once with the oldest waiting client
    pub fn add_connection(
        &self,
        session: Arc<HostSession>,
    ) -> Result<Admission<S>, RendezvousError> {
        let mut state = self.lock();
        if !state.accepting {
            return Err(RendezvousError::Retired { port: self.port });
        }
        self.activity.touch();

        while let Some(client) = state.clients.pop_front() {
            if client.accepted_at.elapsed() > self.match_window {
                trace!(port = self.port, client_id = client.id, "Discarding expired client");
                continue;
            }
            // The accept task may already have given up on this client
            if client.claimed_tx.send(()).is_err() {
                continue;
            }
            debug!(
                port = self.port,
                session_id = %session.id(),
                client_id = client.id,
                "Session matched with waiting client"
            );
            return Ok(Admission::Matched(MatchedTarget {
                stream: client.stream,
                guard: RelayGuard::new(self.activity.clone()),
            }));
        }

        let (target_tx, target_rx) = oneshot::channel();
        state.sessions.push_back(PendingSession { session, target_tx });
        Ok(Admission::Waiting(target_rx))
    }

    /// Remove a session that left before being matched
    ///
    /// Returns false if the session was no longer queued.
    pub fn remove_connection(&self, session_id: Uuid) -> bool {
        let mut state = self.lock();
        match state
            .sessions
            .iter()
            .position(|pending| pending.session.id() == session_id)
        {
            Some(index) => {
                state.sessions.remove(index);
                self.activity.touch();
                true
            }
            None => false,
        }
    }

    /// Hand a public client to the oldest live session, or park it
    pub fn offer_client(&self, stream: S) -> Offer {
        let mut state = self.lock();
        if !state.accepting {
            return Offer::Closed;
        }
        self.activity.touch();

        let mut stream = stream;
        while let Some(pending) = state.sessions.pop_front() {
            if pending.target_tx.is_closed() {
                trace!(
                    port = self.port,
                    session_id = %pending.session.id(),
                    "Discarding dead session"
                );
                continue;
            }

            let target = MatchedTarget {
                stream,
                guard: RelayGuard::new(self.activity.clone()),
            };
            match pending.target_tx.send(target) {
                Ok(()) => return Offer::Matched(pending.session.id()),
                Err(returned) => {
                    // Receiver dropped between the check and the send
                    let MatchedTarget { stream: back, .. } = returned;
                    stream = back;
                }
            }
        }

        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let (claimed_tx, claimed) = oneshot::channel();
        state.clients.push_back(WaitingClient {
            id: client_id,
            stream,
            accepted_at: Instant::now(),
            claimed_tx,
        });
        Offer::Queued { client_id, claimed }
    }

    /// Take back a parked client whose window lapsed
    ///
    /// Returns None if a session already claimed it.
    pub fn withdraw_client(&self, client_id: u64) -> Option<S> {
        let mut state = self.lock();
        let index = state.clients.iter().position(|c| c.id == client_id)?;
        state.clients.remove(index).map(|client| client.stream)
    }

    /// Live pending sessions, oldest first
    pub fn pending_sessions(&self) -> Vec<Arc<HostSession>> {
        self.lock()
            .sessions
            .iter()
            .filter(|pending| !pending.target_tx.is_closed())
            .map(|pending| pending.session.clone())
            .collect()
    }

    pub fn pending_len(&self) -> usize {
        self.lock()
            .sessions
            .iter()
            .filter(|pending| !pending.target_tx.is_closed())
            .count()
    }

    pub fn waiting_clients(&self) -> usize {
        self.lock().clients.len()
    }

    pub fn active_relays(&self) -> usize {
        self.activity.active.load(Ordering::SeqCst)
    }

    pub fn is_accepting(&self) -> bool {
        self.lock().accepting
    }

    /// Stop accepting if the port has been completely idle for `idle`
    ///
    /// Checked under the queue lock, so a concurrent `add_connection` either lands first (and
    /// keeps the queue alive) or sees `Retired`.
    pub fn try_retire(&self, idle: Duration) -> bool {
        let mut state = self.lock();
        let idle_enough = state.accepting
            && state.sessions.iter().all(|p| p.target_tx.is_closed())
            && state.clients.is_empty()
            && self.activity.active.load(Ordering::SeqCst) == 0
            && self.activity.idle_for() >= idle;

        if idle_enough {
            state.accepting = false;
            state.sessions.clear();
        }
        idle_enough
    }

    /// Stop accepting and drop everything queued
    pub fn close(&self) -> usize {
        let mut state = self.lock();
        state.accepting = false;
        let dropped = state.sessions.len() + state.clients.len();
        state.sessions.clear();
        state.clients.clear();
        dropped
    }

    /// Accept again after `close`
    pub fn reopen(&self) {
        let mut state = self.lock();
        state.accepting = true;
        self.activity.touch();
    }
}
