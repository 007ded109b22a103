//! Live sessions, their ids and coordinated shutdown

use crate::connection::Connection;
use crate::protocol;
use crate::session::{Session, SessionId, SessionSnapshot, StateObserver};
use crate::virtual_controller::{ControllerFactory, Mode};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Lifecycle callback run with the session it concerns
pub type SessionCallback = Arc<dyn Fn(&mut Session) -> anyhow::Result<()> + Send + Sync>;

/// Receives session lifecycle and state events, e.g. the status window
pub trait SessionObserver: Send + Sync {
    fn session_added(&self, id: SessionId) -> anyhow::Result<()>;
    fn session_changed(&self, id: SessionId, snapshot: &SessionSnapshot) -> anyhow::Result<()>;
    fn session_removed(&self, id: SessionId) -> anyhow::Result<()>;
}

struct Inner {
    sessions: BTreeMap<SessionId, CancellationToken>,
    shut_down: bool,
}

pub struct Registry {
    inner: Mutex<Inner>,
    factory: Arc<dyn ControllerFactory>,
    default_mode: Mode,
    root: CancellationToken,
    live: watch::Sender<usize>,
    connect_observers: Mutex<Vec<SessionCallback>>,
    disconnect_observers: Mutex<Vec<SessionCallback>>,
}

// Frees the id even if the accept future is dropped halfway
struct Slot<'a> {
    registry: &'a Registry,
    id: SessionId,
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}

// Smallest id not in use
fn first_free(sessions: &BTreeMap<SessionId, CancellationToken>) -> SessionId {
    let mut candidate = 0;
    for &id in sessions.keys() {
        if id != candidate {
            break;
        }
        candidate += 1;
    }
    candidate
}

impl Registry {
    pub fn new(factory: Arc<dyn ControllerFactory>, default_mode: Mode) -> Self {
        let (live, _) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner {
                sessions: BTreeMap::new(),
                shut_down: false,
            }),
            factory,
            default_mode,
            root: CancellationToken::new(),
            live,
            connect_observers: Mutex::new(Vec::new()),
            disconnect_observers: Mutex::new(Vec::new()),
        }
    }

    pub fn default_mode(&self) -> Mode {
        self.default_mode
    }

    pub fn on_connect(&self, observer: SessionCallback) {
        lock(&self.connect_observers).push(observer);
    }

    pub fn on_disconnect(&self, observer: SessionCallback) {
        lock(&self.disconnect_observers).push(observer);
    }

    /// Forward lifecycle and state changes of every session to `observer`
    pub fn add_observer(&self, observer: Arc<dyn SessionObserver>) {
        let added = Arc::clone(&observer);
        self.on_connect(Arc::new(move |session: &mut Session| -> anyhow::Result<()> {
            let id = session.id();
            added.session_added(id)?;
            let changed = Arc::clone(&added);
            let state_observer: Arc<dyn StateObserver> =
                Arc::new(move |snapshot: &SessionSnapshot| {
                    changed.session_changed(snapshot.id, snapshot)
                });
            session.add_observer(state_observer);
            added.session_changed(id, &session.snapshot())
        }));
        self.on_disconnect(Arc::new(move |session: &mut Session| {
            observer.session_removed(session.id())
        }));
    }

    /// Ids of the live sessions in ascending order
    pub fn session_ids(&self) -> Vec<SessionId> {
        lock(&self.inner).sessions.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shut_down(&self) -> bool {
        lock(&self.inner).shut_down
    }

    /// Run one connection to completion and return the closed session.
    /// Returns `None` when the registry is already shut down; the connection is
    /// closed with the going-away code in that case.
    pub async fn accept(&self, mut connection: Box<dyn Connection>) -> Option<Session> {
        let slot = {
            let mut inner = lock(&self.inner);
            if inner.shut_down {
                None
            } else {
                let id = first_free(&inner.sessions);
                let cancel = self.root.child_token();
                inner.sessions.insert(id, cancel.clone());
                self.live.send_replace(inner.sessions.len());
                Some((id, cancel))
            }
        };
        let Some((id, cancel)) = slot else {
            log::info!("Refusing connection, server is shut down");
            if let Err(e) = connection
                .close(protocol::CLOSE_GOING_AWAY, protocol::SERVER_CLOSED_REASON)
                .await
            {
                log::debug!("Close of refused connection failed: {}", e);
            }
            return None;
        };

        let _slot = Slot { registry: self, id };
        let mut session = Session::new(
            id,
            self.default_mode,
            Arc::clone(&self.factory),
            connection,
            cancel,
        );

        if let Err(e) = session.start() {
            log::error!(
                "Session {} could not create a {} controller: {:#}",
                id,
                self.default_mode,
                e
            );
            session
                .close(
                    protocol::CLOSE_INTERNAL_ERROR,
                    protocol::DEVICE_UNAVAILABLE_REASON,
                )
                .await;
            session.finish();
            return Some(session);
        }

        log::info!("Session {} connected", id);
        self.notify(&self.connect_observers, &mut session, "connect");
        session.run().await;
        self.notify(&self.disconnect_observers, &mut session, "disconnect");
        session.finish();
        Some(session)
    }

    /// Close every live session with the going-away code and wait until all of
    /// them finished. Later calls return immediately.
    pub async fn shutdown(&self) {
        let first = {
            let mut inner = lock(&self.inner);
            let first = !inner.shut_down;
            inner.shut_down = true;
            first
        };
        if first {
            log::info!("Shutting down {} session(s)", self.len());
            self.root.cancel();
        }

        let mut live = self.live.subscribe();
        if live.wait_for(|count| *count == 0).await.is_err() {
            log::warn!("Session counter dropped during shutdown");
        }
    }

    fn release(&self, id: SessionId) {
        let mut inner = lock(&self.inner);
        if inner.sessions.remove(&id).is_some() {
            self.live.send_replace(inner.sessions.len());
            log::debug!("Session id {} freed", id);
        }
    }

    fn notify(&self, observers: &Mutex<Vec<SessionCallback>>, session: &mut Session, event: &str) {
        // Clone the list so an observer may register others without deadlocking
        let observers: Vec<SessionCallback> = lock(observers).clone();
        for observer in observers {
            let result =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| observer(session)));
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    log::error!(
                        "Session {} {} observer failed: {:#}",
                        session.id(),
                        event,
                        e
                    );
                }
                Err(_) => {
                    log::error!("Session {} {} observer panicked", session.id(), event);
                }
            }
        }
    }
}

// A poisoned lock only means an observer panicked; the data is still consistent
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
