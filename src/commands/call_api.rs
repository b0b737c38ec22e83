use crate::config::RECENT_CALLS;
use crate::error::CallError;
use crate::peer::types::{IceCandidate, MediaKind, Role};
use crate::session::{Session, SessionContext};
use log::info;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Owns the sessions of one local user, keyed by remote peer.
///
/// At most one session is live at a time since capture devices are exclusive.
pub struct CallController {
    pub(super) local_id: String,
    pub(super) context: SessionContext,
    pub(super) sessions: Mutex<HashMap<String, Arc<Session>>>,
    /// Remote candidates that arrived before their offer, by call id.
    pub(super) early_candidates: Mutex<HashMap<String, Vec<IceCandidate>>>,
    /// Call ids that ended recently, oldest first.
    pub(super) recent_calls: Mutex<VecDeque<String>>,
}

impl CallController {
    pub fn new(local_id: impl Into<String>, context: SessionContext) -> Self {
        Self {
            local_id: local_id.into(),
            context,
            sessions: Mutex::new(HashMap::new()),
            early_candidates: Mutex::new(HashMap::new()),
            recent_calls: Mutex::new(VecDeque::new()),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Starts an outgoing call and returns once the offer is on its way.
    pub async fn start_call(&self, peer: &str, kind: MediaKind) -> Result<Arc<Session>, CallError> {
        let session = {
            let mut sessions = self.sessions.lock();
            if let Some(active) = sessions.values().find(|s| s.is_live()) {
                return Err(CallError::Busy(active.remote_peer().to_string()));
            }
            let session = Session::outgoing(&self.context, &self.local_id, peer, kind);
            sessions.insert(peer.to_string(), session.clone());
            session
        };
        info!("Calling {} ({:?}), call id {}", peer, kind, session.id());
        session.start().await?;
        Ok(session)
    }

    /// Accepts a ringing incoming call and answers it.
    pub async fn accept_incoming(&self, call_id: &str) -> Result<Arc<Session>, CallError> {
        let session = self
            .sessions
            .lock()
            .values()
            .find(|s| s.id() == call_id && s.role() == Role::Callee)
            .cloned()
            .ok_or_else(|| CallError::NotFound(call_id.to_string()))?;
        info!("Accepting call {} from {}", call_id, session.remote_peer());
        session.start().await?;
        Ok(session)
    }

    /// Hangs up (or declines, or acknowledges) the call with `peer`.
    pub async fn hang_up(&self, peer: &str) -> Result<(), CallError> {
        let session = self
            .sessions
            .lock()
            .remove(peer)
            .ok_or_else(|| CallError::NotFound(peer.to_string()))?;
        self.forget_call(session.id());
        session.hang_up().await;
        Ok(())
    }

    pub fn toggle_mic(&self) -> Result<bool, CallError> {
        self.require_active()?.toggle_mic()
    }

    pub fn toggle_camera(&self) -> Result<bool, CallError> {
        self.require_active()?.toggle_camera()
    }

    pub fn session(&self, peer: &str) -> Option<Arc<Session>> {
        self.sessions.lock().get(peer).cloned()
    }

    pub fn active_session(&self) -> Option<Arc<Session>> {
        self.sessions.lock().values().find(|s| s.is_live()).cloned()
    }

    pub fn is_connected(&self, peer: &str) -> bool {
        self.session(peer).is_some_and(|s| s.is_connected())
    }

    /// Drops anything still stashed for `call_id` and remembers it as ended.
    pub(super) fn forget_call(&self, call_id: &str) {
        self.early_candidates.lock().remove(call_id);
        let mut recent = self.recent_calls.lock();
        if recent.iter().any(|id| id == call_id) {
            return;
        }
        recent.push_back(call_id.to_string());
        if recent.len() > RECENT_CALLS {
            recent.pop_front();
        }
    }

    fn require_active(&self) -> Result<Arc<Session>, CallError> {
        self.active_session()
            .ok_or_else(|| CallError::NotFound("no active call".into()))
    }
}
