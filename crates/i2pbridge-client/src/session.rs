//! Session/stream registry
//!
//! Concurrent requests for the same nickname share one negotiation; the
//! outcome is fanned out to every waiter. Sessions keep track of their open
//! streams and can close themselves once the last one goes away.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use i2pbridge_protocol::{I2pAddress, SamVersion};
use log::{debug, info};
use tokio::sync::oneshot;

use crate::error::{BridgeError, Result};
use crate::sam::sender::SessionStyle;

const LOG_TARGET: &str = "i2pbridge::session";

/// Identifies a stream within its session
pub type StreamId = u64;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything a session is built from once the router accepted it
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub nickname: String,
    pub version: SamVersion,
    pub style: SessionStyle,

    /// Public address; carries the session's local port if it has one
    pub address: I2pAddress,
    pub private_key: String,

    /// Close the session when its last stream is removed
    pub auto_close: bool,
}

#[derive(Debug, Default)]
struct SessionState {
    closed: bool,
    streams: Vec<StreamId>,

    /// Signals the control connection task to shut down
    control: Option<oneshot::Sender<()>>,
}

/// A live SAM session
#[derive(Debug)]
pub struct Session {
    params: SessionParams,
    state: Mutex<SessionState>,
    next_stream: AtomicU64,
    registry: Weak<SessionRegistry>,
}

impl Session {
    pub fn new(params: SessionParams, registry: Weak<SessionRegistry>) -> Self {
        Self {
            params,
            state: Mutex::new(SessionState::default()),
            next_stream: AtomicU64::new(1),
            registry,
        }
    }

    /// Hand over the shutdown signal of the session's control connection
    pub fn attach_control(&self, shutdown: oneshot::Sender<()>) {
        let mut state = lock(&self.state);
        if state.closed {
            let _ = shutdown.send(());
        } else {
            state.control = Some(shutdown);
        }
    }

    pub fn nickname(&self) -> &str {
        &self.params.nickname
    }

    pub fn version(&self) -> &SamVersion {
        &self.params.version
    }

    pub fn style(&self) -> SessionStyle {
        self.params.style
    }

    pub fn address(&self) -> &I2pAddress {
        &self.params.address
    }

    pub fn private_key(&self) -> &str {
        &self.params.private_key
    }

    pub fn auto_close(&self) -> bool {
        self.params.auto_close
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub fn stream_count(&self) -> usize {
        lock(&self.state).streams.len()
    }

    /// Register a new stream. Fails once the session is closed.
    pub fn add_stream(self: &Arc<Self>) -> Result<StreamRegistration> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(BridgeError::SessionClosed);
        }

        let id = self.next_stream.fetch_add(1, Ordering::Relaxed);
        state.streams.push(id);
        debug!(target: LOG_TARGET, "session {} stream {} added", self.params.nickname, id);

        Ok(StreamRegistration {
            session: Arc::clone(self),
            id,
        })
    }

    /// Unregister a stream.
    ///
    /// Unknown ids are ignored. Closes an auto-close session once no streams
    /// remain.
    pub fn remove_stream(&self, id: StreamId) -> Result<()> {
        let now_empty = {
            let mut state = lock(&self.state);
            if state.closed {
                return Err(BridgeError::SessionClosed);
            }

            let before = state.streams.len();
            state.streams.retain(|stream| *stream != id);
            before != state.streams.len() && state.streams.is_empty()
        };

        if now_empty && self.params.auto_close {
            debug!(target: LOG_TARGET, "session {} has no streams left", self.params.nickname);
            self.close()?;
        }
        Ok(())
    }

    /// Close the session and sever its control connection.
    ///
    /// Only the first call succeeds; later calls return `SessionClosed`.
    pub fn close(&self) -> Result<()> {
        let control = {
            let mut state = lock(&self.state);
            if state.closed {
                return Err(BridgeError::SessionClosed);
            }
            state.closed = true;
            state.streams.clear();
            state.control.take()
        };

        if let Some(control) = control {
            let _ = control.send(());
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.forget(self);
        }

        info!(target: LOG_TARGET, "session {} closed", self.params.nickname);
        Ok(())
    }

    /// The control connection went away underneath the session
    pub(crate) fn connection_lost(&self) {
        if self.close().is_ok() {
            debug!(
                target: LOG_TARGET,
                "session {} lost its control connection", self.params.nickname
            );
        }
    }
}

/// Keeps a stream registered with its session until dropped
#[derive(Debug)]
pub struct StreamRegistration {
    session: Arc<Session>,
    id: StreamId,
}

impl StreamRegistration {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for StreamRegistration {
    fn drop(&mut self) {
        // the session may already be closed, nothing left to undo then
        let _ = self.session.remove_stream(self.id);
    }
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Result<Arc<Session>>>,
}

enum Slot {
    Live(Arc<Session>),
    Pending(Vec<Waiter>),
}

/// Nickname to session table
#[derive(Default)]
pub struct SessionRegistry {
    slots: Mutex<HashMap<String, Slot>>,
    next_waiter: AtomicU64,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots = lock(&self.slots);
        f.debug_struct("SessionRegistry")
            .field("nicknames", &slots.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Live session registered under `nickname`
    pub fn get(&self, nickname: &str) -> Option<Arc<Session>> {
        match lock(&self.slots).get(nickname) {
            Some(Slot::Live(session)) => Some(Arc::clone(session)),
            _ => None,
        }
    }

    /// Whether a negotiation for `nickname` is in flight
    pub fn is_pending(&self, nickname: &str) -> bool {
        matches!(lock(&self.slots).get(nickname), Some(Slot::Pending(_)))
    }

    /// Return the session for `nickname`, running `create` only if neither a
    /// session nor a negotiation for it exists.
    ///
    /// Dropping the returned future cancels the wait. If the caller was the
    /// one running `create`, the negotiation is aborted and every other
    /// waiter fails with `Cancelled`.
    pub async fn get_or_create<F, Fut>(
        self: &Arc<Self>,
        nickname: &str,
        create: F,
    ) -> Result<Arc<Session>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<Session>>>,
    {
        let queued = {
            let mut slots = lock(&self.slots);
            match slots.get_mut(nickname) {
                Some(Slot::Live(session)) => return Ok(Arc::clone(session)),
                Some(Slot::Pending(waiters)) => {
                    let (tx, rx) = oneshot::channel();
                    let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
                    waiters.push(Waiter { id, tx });
                    Some((id, rx))
                }
                None => {
                    slots.insert(nickname.to_string(), Slot::Pending(Vec::new()));
                    None
                }
            }
        };

        if let Some((id, rx)) = queued {
            debug!(target: LOG_TARGET, "waiting for session {} negotiation", nickname);
            let mut guard = WaiterGuard {
                registry: self,
                nickname,
                id: Some(id),
            };
            let outcome = rx.await;
            guard.id = None;
            return outcome.unwrap_or(Err(BridgeError::Cancelled));
        }

        let mut guard = InitiatorGuard {
            registry: self,
            nickname: Some(nickname),
        };
        let outcome = create().await;
        guard.nickname = None;

        self.resolve(nickname, &outcome);
        outcome
    }

    fn resolve(&self, nickname: &str, outcome: &Result<Arc<Session>>) {
        let waiters = {
            let mut slots = lock(&self.slots);
            let waiters = match slots.remove(nickname) {
                Some(Slot::Pending(waiters)) => waiters,
                Some(live @ Slot::Live(_)) => {
                    slots.insert(nickname.to_string(), live);
                    Vec::new()
                }
                None => Vec::new(),
            };
            if let Ok(session) = outcome {
                if !session.is_closed() {
                    slots.insert(nickname.to_string(), Slot::Live(Arc::clone(session)));
                }
            }
            waiters
        };

        for waiter in waiters {
            let result = match outcome {
                Ok(session) => Ok(Arc::clone(session)),
                Err(e) => Err(e.replicate()),
            };
            let _ = waiter.tx.send(result);
        }
    }

    #[cfg(test)]
    fn waiters(&self, nickname: &str) -> usize {
        match lock(&self.slots).get(nickname) {
            Some(Slot::Pending(waiters)) => waiters.len(),
            _ => 0,
        }
    }

    /// Drop a closed session from the table
    fn forget(&self, session: &Session) {
        let mut slots = lock(&self.slots);
        if let Some(Slot::Live(live)) = slots.get(session.nickname()) {
            if std::ptr::eq(Arc::as_ptr(live), session) {
                slots.remove(session.nickname());
            }
        }
    }
}

/// Removes a queued waiter if its future is dropped early
struct WaiterGuard<'a> {
    registry: &'a SessionRegistry,
    nickname: &'a str,
    id: Option<u64>,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        let Some(id) = self.id else {
            return;
        };
        let mut slots = lock(&self.registry.slots);
        if let Some(Slot::Pending(waiters)) = slots.get_mut(self.nickname) {
            waiters.retain(|waiter| waiter.id != id);
        }
    }
}

/// Fails everyone queued behind an initiator that went away
struct InitiatorGuard<'a> {
    registry: &'a SessionRegistry,
    nickname: Option<&'a str>,
}

impl Drop for InitiatorGuard<'_> {
    fn drop(&mut self) {
        let Some(nickname) = self.nickname else {
            return;
        };

        let waiters = {
            let mut slots = lock(&self.registry.slots);
            match slots.remove(nickname) {
                Some(Slot::Pending(waiters)) => waiters,
                Some(live) => {
                    slots.insert(nickname.to_string(), live);
                    Vec::new()
                }
                None => Vec::new(),
            }
        };

        debug!(
            target: LOG_TARGET,
            "session {} negotiation cancelled, failing {} waiters",
            nickname,
            waiters.len()
        );
        for waiter in waiters {
            let _ = waiter.tx.send(Err(BridgeError::Cancelled));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    async fn until_waiting(registry: &SessionRegistry, count: usize) {
        while registry.waiters("spam") < count {
            tokio::task::yield_now().await;
        }
    }

    fn params(nickname: &str, auto_close: bool) -> SessionParams {
        SessionParams {
            nickname: nickname.to_string(),
            version: SamVersion::new(3, 1),
            style: SessionStyle::Stream,
            address: I2pAddress::new("spam", None),
            private_key: "privkey".to_string(),
            auto_close,
        }
    }

    fn session(registry: &Arc<SessionRegistry>, nickname: &str, auto_close: bool) -> Arc<Session> {
        Arc::new(Session::new(params(nickname, auto_close), Arc::downgrade(registry)))
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_negotiation() {
        let registry = SessionRegistry::new();
        let negotiations = Arc::new(AtomicUsize::new(0));
        let (release, released) = oneshot::channel::<()>();

        let first = {
            let registry = Arc::clone(&registry);
            let negotiations = Arc::clone(&negotiations);
            tokio::spawn(async move {
                let reg = Arc::clone(&registry);
                registry
                    .get_or_create("spam", || async move {
                        negotiations.fetch_add(1, Ordering::SeqCst);
                        let _ = released.await;
                        Ok(session(&reg, "spam", false))
                    })
                    .await
            })
        };
        while !registry.is_pending("spam") {
            tokio::task::yield_now().await;
        }

        let second = {
            let registry = Arc::clone(&registry);
            let negotiations = Arc::clone(&negotiations);
            tokio::spawn(async move {
                registry
                    .get_or_create("spam", || async move {
                        negotiations.fetch_add(1, Ordering::SeqCst);
                        Err(BridgeError::Protocol("second negotiation".to_string()))
                    })
                    .await
            })
        };
        until_waiting(&registry, 1).await;

        release.send(()).unwrap();
        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(negotiations.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&registry.get("spam").unwrap(), &first));

        // a later request resolves immediately
        let third = registry
            .get_or_create("spam", || async { Err(BridgeError::Cancelled) })
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&third, &first));
    }

    #[tokio::test]
    async fn test_failure_fans_out() {
        let registry = SessionRegistry::new();
        let (release, released) = oneshot::channel::<()>();

        let first = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                registry
                    .get_or_create("spam", || async move {
                        let _ = released.await;
                        Err(BridgeError::bob("Can't find destination"))
                    })
                    .await
            })
        };
        while !registry.is_pending("spam") {
            tokio::task::yield_now().await;
        }

        let second = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                registry
                    .get_or_create("spam", || async { Err(BridgeError::Protocol("raced".into())) })
                    .await
            })
        };
        until_waiting(&registry, 1).await;

        release.send(()).unwrap();
        assert!(matches!(first.await.unwrap(), Err(BridgeError::Router { .. })));
        assert!(matches!(second.await.unwrap(), Err(BridgeError::Router { .. })));
        assert!(!registry.is_pending("spam"));
        assert!(registry.get("spam").is_none());
    }

    #[tokio::test]
    async fn test_initiator_cancel_fails_waiters() {
        let registry = SessionRegistry::new();

        let first = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                registry
                    .get_or_create("spam", || async {
                        std::future::pending::<()>().await;
                        Err(BridgeError::Timeout)
                    })
                    .await
            })
        };
        while !registry.is_pending("spam") {
            tokio::task::yield_now().await;
        }

        let second = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                registry
                    .get_or_create("spam", || async { Err(BridgeError::Protocol("raced".into())) })
                    .await
            })
        };
        until_waiting(&registry, 1).await;

        first.abort();
        assert!(first.await.unwrap_err().is_cancelled());
        assert!(second.await.unwrap().unwrap_err().is_cancelled());
        assert!(!registry.is_pending("spam"));
    }

    #[tokio::test]
    async fn test_waiter_cancel_leaves_others() {
        let registry = SessionRegistry::new();
        let (release, released) = oneshot::channel::<()>();

        let first = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                let reg = Arc::clone(&registry);
                registry
                    .get_or_create("spam", || async move {
                        let _ = released.await;
                        Ok(session(&reg, "spam", false))
                    })
                    .await
            })
        };
        while !registry.is_pending("spam") {
            tokio::task::yield_now().await;
        }

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                registry
                    .get_or_create("spam", || async { Err(BridgeError::Protocol("raced".into())) })
                    .await
            })
        };
        until_waiting(&registry, 1).await;
        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());
        assert_eq!(registry.waiters("spam"), 0);

        release.send(()).unwrap();
        assert!(first.await.unwrap().is_ok());
    }

    #[test]
    fn test_auto_close_after_last_stream() {
        let registry = SessionRegistry::new();
        let session = session(&registry, "spam", true);
        let (shutdown, mut signal) = oneshot::channel();
        session.attach_control(shutdown);

        let a = session.add_stream().unwrap();
        let b = session.add_stream().unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(session.stream_count(), 2);

        drop(a);
        assert!(!session.is_closed());

        // unknown ids are a no-op
        session.remove_stream(999).unwrap();
        assert!(!session.is_closed());

        drop(b);
        assert!(session.is_closed());
        assert!(signal.try_recv().is_ok());
        assert!(matches!(session.add_stream(), Err(BridgeError::SessionClosed)));
    }

    #[test]
    fn test_without_auto_close_stays_open() {
        let registry = SessionRegistry::new();
        let session = session(&registry, "spam", false);

        drop(session.add_stream().unwrap());
        assert!(!session.is_closed());
        assert_eq!(session.stream_count(), 0);
    }

    #[tokio::test]
    async fn test_close_twice_and_unregisters() {
        let registry = SessionRegistry::new();
        let reg = Arc::clone(&registry);
        let session = registry
            .get_or_create("spam", || async move { Ok(session(&reg, "spam", false)) })
            .await
            .unwrap();
        assert!(registry.get("spam").is_some());

        session.close().unwrap();
        assert!(registry.get("spam").is_none());
        assert!(matches!(session.close(), Err(BridgeError::SessionClosed)));
        assert!(matches!(session.remove_stream(1), Err(BridgeError::SessionClosed)));
    }
}
