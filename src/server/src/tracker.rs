//! Connection lifecycle tracking for idle shutdown.
//!
//! The HTTP accept loop reports every connection's state transitions. A
//! connection is either *managed* (the loop still owns it, tracked by id) or
//! *hijacked* (a handler took the raw socket, tracked only by a counter since
//! the loop never hears about it again). The idle timer runs exactly while
//! `managed + hijacked == 0`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use podmux_core::event::{events, EventEmitter, MuxEvent};

/// Identity of one accepted connection.
pub type ConnId = u64;

/// Connection state reported by the accept loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    New,
    Active,
    Idle,
    Hijacked,
    Closed,
}

#[derive(Default)]
struct Inner {
    managed: HashSet<ConnId>,
    hijacked: usize,
    total: u64,
    timer_running: bool,
    timer: Option<JoinHandle<()>>,
}

impl Inner {
    fn active(&self) -> usize {
        self.managed.len() + self.hijacked
    }
}

/// Process-wide connection tracker.
pub struct ConnectionTracker {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
    idle_timeout: Option<Duration>,
    idle_tx: watch::Sender<bool>,
    events: EventEmitter,
}

impl ConnectionTracker {
    /// Create a tracker with zero connections; the idle timer starts
    /// immediately. `None` disables expiry but keeps the bookkeeping.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(idle_timeout: Option<Duration>, events: EventEmitter) -> Arc<Self> {
        let (idle_tx, _) = watch::channel(false);
        let tracker = Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            next_id: AtomicU64::new(1),
            idle_timeout,
            idle_tx,
            events,
        });
        {
            let mut inner = tracker.inner.lock();
            tracker.start_timer(&mut inner);
        }
        tracker
    }

    /// Allocate an id for a freshly accepted connection.
    pub fn next_conn_id(&self) -> ConnId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Apply a state transition reported by the accept loop.
    pub fn on_state(&self, conn: ConnId, state: ConnState) {
        let mut inner = self.inner.lock();
        let before = inner.active();

        match state {
            ConnState::New => {
                inner.total += 1;
                inner.managed.insert(conn);
            }
            ConnState::Active => {
                inner.managed.insert(conn);
            }
            ConnState::Idle => {
                // An idle keep-alive connection still counts as active.
                tracing::trace!(conn, "connection idle");
            }
            ConnState::Hijacked => {
                if !inner.managed.remove(&conn) {
                    tracing::debug!(conn, "hijack of untracked connection");
                }
                inner.hijacked += 1;
            }
            ConnState::Closed => {
                if !inner.managed.remove(&conn) {
                    // Hijacked connections end their serve future after the
                    // upgrade; their close comes from the handler instead.
                    tracing::trace!(conn, "close of unmanaged connection ignored");
                }
            }
        }

        self.sync_timer(&mut inner, before);
    }

    /// Mark `conn` hijacked and return a guard that reports the handler-side
    /// close when dropped.
    pub fn hijack(self: &Arc<Self>, conn: ConnId) -> HijackGuard {
        self.on_state(conn, ConnState::Hijacked);
        HijackGuard {
            tracker: Arc::clone(self),
            conn,
        }
    }

    /// Handler-side close of a hijacked connection. A close without a
    /// matching hijack is logged and ignored.
    pub fn close_hijacked(&self) {
        let mut inner = self.inner.lock();
        let before = inner.active();
        if inner.hijacked == 0 {
            tracing::warn!("hijacked connection closed twice");
            return;
        }
        inner.hijacked -= 1;
        self.sync_timer(&mut inner, before);
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().active()
    }

    pub fn managed_count(&self) -> usize {
        self.inner.lock().managed.len()
    }

    pub fn hijacked_count(&self) -> usize {
        self.inner.lock().hijacked
    }

    pub fn total_connections(&self) -> u64 {
        self.inner.lock().total
    }

    pub fn timer_running(&self) -> bool {
        self.inner.lock().timer_running
    }

    /// Flips to `true` when the idle timer expires.
    pub fn idle_signal(&self) -> watch::Receiver<bool> {
        self.idle_tx.subscribe()
    }

    /// Resolve once the idle timer has expired.
    pub async fn wait_idle(&self) {
        let mut rx = self.idle_signal();
        let _ = rx.wait_for(|idle| *idle).await;
    }

    fn sync_timer(&self, inner: &mut Inner, before: usize) {
        let after = inner.active();
        if before > 0 && after == 0 {
            self.start_timer(inner);
        } else if before == 0 && after > 0 {
            self.stop_timer(inner);
        }
    }

    fn start_timer(&self, inner: &mut Inner) {
        if let Some(handle) = inner.timer.take() {
            handle.abort();
        }
        inner.timer_running = true;
        tracing::debug!("idle timer started");

        let Some(timeout) = self.idle_timeout else {
            return;
        };
        let idle_tx = self.idle_tx.clone();
        let emitter = self.events.clone();
        inner.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            tracing::info!(timeout_secs = timeout.as_secs(), "server idle");
            emitter.emit(MuxEvent::new(events::SERVER_IDLE));
            idle_tx.send_replace(true);
        }));
    }

    fn stop_timer(&self, inner: &mut Inner) {
        if let Some(handle) = inner.timer.take() {
            handle.abort();
        }
        inner.timer_running = false;
        self.idle_tx.send_replace(false);
        tracing::debug!("idle timer stopped");
    }
}

impl Drop for ConnectionTracker {
    fn drop(&mut self) {
        if let Some(handle) = self.inner.get_mut().timer.take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for ConnectionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ConnectionTracker")
            .field("managed", &inner.managed.len())
            .field("hijacked", &inner.hijacked)
            .field("total", &inner.total)
            .field("timer_running", &inner.timer_running)
            .finish()
    }
}

/// Ownership of a hijacked connection. Dropping it reports the close.
pub struct HijackGuard {
    tracker: Arc<ConnectionTracker>,
    conn: ConnId,
}

impl HijackGuard {
    pub fn conn_id(&self) -> ConnId {
        self.conn
    }
}

impl Drop for HijackGuard {
    fn drop(&mut self) {
        tracing::debug!(conn = self.conn, "hijacked connection closed");
        self.tracker.close_hijacked();
    }
}

impl std::fmt::Debug for HijackGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HijackGuard").field("conn", &self.conn).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(timeout_secs: u64) -> Arc<ConnectionTracker> {
        ConnectionTracker::new(
            Some(Duration::from_secs(timeout_secs)),
            EventEmitter::default(),
        )
    }

    #[tokio::test]
    async fn test_starts_idle() {
        let t = tracker(10);
        assert_eq!(t.active_count(), 0);
        assert!(t.timer_running());
    }

    #[tokio::test]
    async fn test_hijack_then_handler_close() {
        let t = tracker(10);
        let id = t.next_conn_id();
        t.on_state(id, ConnState::New);
        assert!(!t.timer_running());

        let guard = t.hijack(id);
        assert_eq!(t.managed_count(), 0);
        assert_eq!(t.hijacked_count(), 1);
        assert!(!t.timer_running());

        // The serve future ending after the upgrade must not count twice.
        t.on_state(id, ConnState::Closed);
        assert_eq!(t.active_count(), 1);

        drop(guard);
        assert_eq!(t.active_count(), 0);
        assert!(t.timer_running());
        assert_eq!(t.total_connections(), 1);
    }

    #[tokio::test]
    async fn test_managed_close() {
        let t = tracker(10);
        let id = t.next_conn_id();
        t.on_state(id, ConnState::New);
        t.on_state(id, ConnState::Active);
        t.on_state(id, ConnState::Idle);
        assert!(!t.timer_running());
        t.on_state(id, ConnState::Closed);
        assert_eq!(t.active_count(), 0);
        assert!(t.timer_running());
    }

    #[tokio::test]
    async fn test_double_close_is_noop() {
        let t = tracker(10);
        t.close_hijacked();
        assert_eq!(t.hijacked_count(), 0);

        let id = t.next_conn_id();
        t.on_state(id, ConnState::Closed);
        t.on_state(id, ConnState::Closed);
        assert_eq!(t.active_count(), 0);
        assert!(t.timer_running());
    }

    #[tokio::test]
    async fn test_idle_state_does_not_touch_timer() {
        let t = tracker(10);
        let id = t.next_conn_id();
        t.on_state(id, ConnState::Idle);
        assert!(t.timer_running());
        t.on_state(id, ConnState::New);
        t.on_state(id, ConnState::Idle);
        assert!(!t.timer_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timer_fires() {
        let emitter = EventEmitter::default();
        let mut rx = emitter.subscribe();
        let t = ConnectionTracker::new(Some(Duration::from_secs(10)), emitter);

        tokio::time::timeout(Duration::from_secs(11), t.wait_idle())
            .await
            .expect("idle timer should fire");
        assert_eq!(rx.recv().await.unwrap().key, events::SERVER_IDLE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_resets_timer() {
        let t = tracker(10);
        let signal = t.idle_signal();

        tokio::time::sleep(Duration::from_secs(8)).await;
        let id = t.next_conn_id();
        t.on_state(id, ConnState::New);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!*signal.borrow());

        t.on_state(id, ConnState::Closed);
        tokio::time::sleep(Duration::from_secs(8)).await;
        assert!(!*signal.borrow());

        tokio::time::timeout(Duration::from_secs(3), t.wait_idle())
            .await
            .expect("timer restarted from zero");
    }

    #[tokio::test]
    async fn test_interleaved_connections() {
        let t = ConnectionTracker::new(None, EventEmitter::default());
        let mut open: Vec<ConnId> = Vec::new();
        let mut guards = Vec::new();

        for step in 0..400u64 {
            match step % 7 {
                0 | 3 | 5 => {
                    let id = t.next_conn_id();
                    t.on_state(id, ConnState::New);
                    open.push(id);
                }
                1 | 4 if !open.is_empty() => {
                    let id = open.remove((step as usize) % open.len());
                    guards.push(t.hijack(id));
                }
                2 if !open.is_empty() => {
                    let id = open.pop().unwrap();
                    t.on_state(id, ConnState::Closed);
                }
                6 if !guards.is_empty() => {
                    guards.remove(0);
                }
                _ => {}
            }
            let active = t.active_count();
            assert_eq!(active, t.managed_count() + t.hijacked_count());
            assert_eq!(t.timer_running(), active == 0);
        }

        for id in open.drain(..) {
            t.on_state(id, ConnState::Closed);
        }
        guards.clear();
        assert_eq!(t.active_count(), 0);
        assert!(t.timer_running());
    }
}
