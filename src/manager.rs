//! Session ownership, admission control and broadcast operations
//!
//! The manager strongly owns session handles in a mutex-guarded map;
//! sessions hold a weak reference back and remove themselves when fully
//! closed. Admission is unconditional below the soft limit, probabilistic
//! between soft and hard, and shed-or-reject at the hard limit.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rand::Rng;
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::anomaly::AnomalyEngine;
use crate::config::ConfigManager;
use crate::scheduler::Scheduler;
use crate::session::{Session, SessionHandle, SessionMsg};
use crate::types::ConfigLimits;

/// Owns every live session; keyed by monotone session id
pub struct SessionManager {
    engine: AnomalyEngine,
    config: Arc<ConfigManager>,
    scheduler: Scheduler,
    sessions: Mutex<HashMap<u64, Arc<SessionHandle>>>,
    next_session_id: AtomicU64,
    upstream: Mutex<Option<SocketAddr>>,
    max_sessions: usize,
    soft_limit: usize,
}

impl SessionManager {
    pub fn new(engine: AnomalyEngine, config: Arc<ConfigManager>, scheduler: Scheduler) -> Arc<Self> {
        Self::with_limits(engine, config, scheduler, ConfigLimits::MAX_SESSIONS)
    }

    /// Like [`SessionManager::new`] with a custom hard limit (soft limit
    /// follows at [`ConfigLimits::SOFT_LIMIT_PERCENT`])
    pub fn with_limits(
        engine: AnomalyEngine,
        config: Arc<ConfigManager>,
        scheduler: Scheduler,
        max_sessions: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            config,
            scheduler,
            sessions: Mutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
            upstream: Mutex::new(None),
            max_sessions,
            soft_limit: max_sessions * ConfigLimits::SOFT_LIMIT_PERCENT / 100,
        })
    }

    /// Where new sessions dial; injected by the proxy server at startup
    pub fn set_upstream(&self, addr: SocketAddr) {
        *self.upstream.lock().unwrap() = Some(addr);
    }

    pub fn upstream(&self) -> Option<SocketAddr> {
        *self.upstream.lock().unwrap()
    }

    /// Admit, construct and activate a session for an accepted client
    ///
    /// Returns `None` when admission is denied or no upstream is set;
    /// in both cases no session object exists afterwards.
    pub fn create_session(self: &Arc<Self>, client: TcpStream) -> Option<Arc<SessionHandle>> {
        let Some(upstream) = self.upstream() else {
            warn!("no_upstream_configured");
            return None;
        };

        if !self.try_admit() {
            warn!(count = self.session_count(), "admission_denied");
            return None;
        }

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let handle = Session::spawn(
            client,
            Arc::downgrade(self),
            self.scheduler.clone(),
            self.engine,
            Arc::clone(&self.config),
            session_id,
        );

        self.sessions
            .lock()
            .unwrap()
            .insert(session_id, Arc::clone(&handle));

        // post-construction activation on the session's own task
        handle.post(SessionMsg::Start(upstream));
        Some(handle)
    }

    /// Drop the map entry; called by sessions on themselves
    pub fn remove_session(&self, session_id: u64) {
        self.sessions.lock().unwrap().remove(&session_id);
    }

    pub fn get_session(&self, session_id: u64) -> Option<Arc<SessionHandle>> {
        self.sessions.lock().unwrap().get(&session_id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn session_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.sessions.lock().unwrap().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Ask every session to drain and close gracefully
    pub fn shutdown_all(&self) {
        for handle in self.snapshot() {
            handle.post(SessionMsg::Shutdown);
        }
    }

    /// Reset every session immediately
    pub fn force_close_all(&self) {
        for handle in self.snapshot() {
            handle.post(SessionMsg::ForceClose);
        }
    }

    fn snapshot(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions.lock().unwrap().values().cloned().collect()
    }

    /// The session idle the longest, if any
    pub fn find_oldest_idle(&self) -> Option<Arc<SessionHandle>> {
        self.snapshot()
            .into_iter()
            .max_by_key(|handle| handle.idle_time())
    }

    fn shed_oldest_idle(&self) {
        if let Some(oldest) = self.find_oldest_idle() {
            info!(sid = oldest.id(), "session_shed");
            oldest.post(SessionMsg::ForceClose);
        }
    }

    fn try_admit(&self) -> bool {
        let count = self.session_count();

        if count < self.soft_limit {
            return true;
        }
        if count >= self.max_sessions {
            // at the hard limit: shedding is posted, so it pays off for
            // later arrivals; this one is admitted only if room opened up
            self.shed_oldest_idle();
            return self.session_count() < self.max_sessions;
        }

        let probability = admission_probability(count, self.soft_limit, self.max_sessions);
        rand::thread_rng().gen::<f32>() < probability
    }
}

/// Admission probability between the soft and hard limits
///
/// 1.0 at the soft limit, falling linearly to 0.0 at the hard limit.
pub fn admission_probability(count: usize, soft: usize, hard: usize) -> f32 {
    if count < soft {
        return 1.0;
    }
    if count >= hard {
        return 0.0;
    }
    1.0 - (count - soft) as f32 / (hard - soft) as f32
}
