use super::call_api::CallController;
use crate::config::{MAX_EARLY_CALLS, MAX_EARLY_CANDIDATES};
use crate::error::CallError;
use crate::peer::types::{IceCandidate, MediaKind, SessionDescription};
use crate::session::Session;
use crate::signaling::{Envelope, SignalingMessage};
use log::{debug, info, warn};
use std::sync::Arc;

impl CallController {
    /// Routes one inbound signaling envelope to its session.
    ///
    /// Messages may arrive duplicated or out of order. Anything that does not
    /// match the current call with the sender is dropped.
    pub async fn handle_signal(&self, envelope: Envelope) -> Result<(), CallError> {
        if envelope.to != self.local_id {
            warn!(
                "Envelope for {} delivered to {}, ignoring",
                envelope.to, self.local_id
            );
            return Ok(());
        }
        debug!(
            "Signal {} from {} for call {}",
            envelope.message.name(),
            envelope.from,
            envelope.call_id
        );

        let Envelope {
            call_id,
            from,
            message,
            ..
        } = envelope;
        match message {
            SignalingMessage::Offer { sdp, media } => {
                self.on_offer(&call_id, &from, SessionDescription::offer(sdp), media)
                    .await
            }
            SignalingMessage::Answer { sdp } => match self.call(&from, &call_id) {
                Some(session) => session.handle_answer(SessionDescription::answer(sdp)).await,
                None => {
                    debug!("Answer for unknown call {} ignored", call_id);
                    Ok(())
                }
            },
            SignalingMessage::IceCandidate { candidate } => {
                match self.call(&from, &call_id) {
                    Some(session) => {
                        session.handle_candidate(candidate).await;
                    }
                    None => self.stash_candidate(&from, &call_id, candidate),
                }
                Ok(())
            }
            SignalingMessage::Hangup => {
                self.forget_call(&call_id);
                let session = {
                    let mut sessions = self.sessions.lock();
                    let current = sessions.get(&from).is_some_and(|s| s.id() == call_id);
                    if current {
                        sessions.remove(&from)
                    } else {
                        None
                    }
                };
                if let Some(session) = session {
                    session.remote_hang_up().await;
                }
                Ok(())
            }
        }
    }

    async fn on_offer(
        &self,
        call_id: &str,
        from: &str,
        offer: SessionDescription,
        media: MediaKind,
    ) -> Result<(), CallError> {
        let existing = self.sessions.lock().get(from).cloned();
        if let Some(existing) = existing {
            if existing.id() == call_id {
                return existing.handle_offer(offer).await;
            }
            if existing.is_live() {
                info!(
                    "Call {} from {} supersedes call {}",
                    call_id,
                    from,
                    existing.id()
                );
                existing.hang_up().await;
            }
            self.forget_call(existing.id());
            self.sessions.lock().remove(from);
        }

        let session = {
            let mut sessions = self.sessions.lock();
            let busy_with = sessions
                .values()
                .find(|s| s.is_live())
                .map(|s| s.remote_peer().to_string());
            if let Some(busy_with) = busy_with {
                drop(sessions);
                info!("Rejecting call {} from {}: busy with {}", call_id, from, busy_with);
                self.forget_call(call_id);
                let reply = Envelope::new(call_id, &self.local_id, from, SignalingMessage::Hangup);
                if let Err(e) = self.context.signaling.send(reply) {
                    warn!("Failed to send busy hangup to {}: {}", from, e);
                }
                return Err(CallError::Busy(busy_with));
            }
            let session =
                Session::incoming(&self.context, call_id, &self.local_id, from, media, offer);
            sessions.insert(from.to_string(), session.clone());
            session
        };

        let early = self
            .early_candidates
            .lock()
            .remove(call_id)
            .unwrap_or_default();
        if !early.is_empty() {
            debug!("Replaying {} early candidate(s) for {}", early.len(), call_id);
        }
        for candidate in early {
            session.handle_candidate(candidate).await;
        }

        info!("Incoming {:?} call {} from {}", media, call_id, from);
        self.context.observer.on_incoming_call(call_id, from, media);
        Ok(())
    }

    fn call(&self, peer: &str, call_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .get(peer)
            .filter(|s| s.id() == call_id)
            .cloned()
    }

    /// Keeps a candidate whose offer has not arrived yet.
    ///
    /// Nothing is kept for ended calls or while the sender already has a live
    /// call with us under another id.
    fn stash_candidate(&self, from: &str, call_id: &str, candidate: IceCandidate) {
        if self.sessions.lock().get(from).is_some_and(|s| s.is_live()) {
            debug!("Candidate for unknown call {} from {} dropped", call_id, from);
            return;
        }
        if self.recent_calls.lock().iter().any(|id| id == call_id) {
            debug!("Candidate for ended call {} dropped", call_id);
            return;
        }
        let mut early = self.early_candidates.lock();
        if !early.contains_key(call_id) && early.len() >= MAX_EARLY_CALLS {
            warn!("Too many pending calls, dropping candidate for {}", call_id);
            return;
        }
        let pending = early.entry(call_id.to_string()).or_default();
        if pending.len() >= MAX_EARLY_CANDIDATES {
            warn!("Too many early candidates from {} for {}, dropping", from, call_id);
            return;
        }
        pending.push(candidate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::state::SessionState;
    use crate::session::tests::Harness;

    fn envelope(call_id: &str, message: SignalingMessage) -> Envelope {
        Envelope::new(call_id, "alice", "bob", message)
    }

    fn offer(call_id: &str) -> Envelope {
        envelope(
            call_id,
            SignalingMessage::Offer {
                sdp: format!("offer-for-{call_id}"),
                media: MediaKind::Audio,
            },
        )
    }

    fn ice(call_id: &str, text: &str) -> Envelope {
        envelope(
            call_id,
            SignalingMessage::IceCandidate {
                candidate: IceCandidate {
                    candidate: text.to_string(),
                    sdp_mid: Some("0".into()),
                    sdp_mline_index: Some(0),
                    connection_id: call_id.to_string(),
                },
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn incoming_call_rings_then_answers() {
        let mut h = Harness::new(vec![]);
        let calls = CallController::new("bob", h.context.clone());

        calls.handle_signal(offer("c1")).await.unwrap();
        assert_eq!(
            *h.observer.incoming.lock(),
            vec![("c1".to_string(), "alice".to_string(), MediaKind::Audio)]
        );
        let session = calls.session("alice").unwrap();
        assert_eq!(session.state(), SessionState::Idle);

        calls.accept_incoming("c1").await.unwrap();
        assert_eq!(session.state(), SessionState::Negotiating);
        let sent = h.outbox.try_recv().unwrap();
        assert_eq!((sent.call_id.as_str(), sent.to.as_str()), ("c1", "alice"));
        assert!(matches!(sent.message, SignalingMessage::Answer { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn early_candidates_are_replayed_in_order() {
        let h = Harness::new(vec![]);
        let calls = CallController::new("bob", h.context.clone());

        calls.handle_signal(ice("c1", "early-1")).await.unwrap();
        calls.handle_signal(ice("c1", "early-2")).await.unwrap();
        calls.handle_signal(offer("c1")).await.unwrap();
        calls.handle_signal(ice("c1", "late-3")).await.unwrap();
        assert!(calls.early_candidates.lock().is_empty());

        calls.accept_incoming("c1").await.unwrap();
        assert_eq!(
            *h.factory.last().applied.lock(),
            vec!["early-1", "early-2", "late-3"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn early_candidates_are_capped() {
        let h = Harness::new(vec![]);
        let calls = CallController::new("bob", h.context.clone());
        for n in 0..MAX_EARLY_CANDIDATES + 5 {
            calls
                .handle_signal(ice("c1", &format!("c{n}")))
                .await
                .unwrap();
        }
        assert_eq!(calls.early_candidates.lock()["c1"].len(), MAX_EARLY_CANDIDATES);

        calls
            .handle_signal(envelope("c1", SignalingMessage::Hangup))
            .await
            .unwrap();
        assert!(calls.early_candidates.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn candidates_for_ended_calls_are_not_kept() {
        let h = Harness::new(vec![]);
        let calls = CallController::new("bob", h.context.clone());
        calls.handle_signal(offer("c1")).await.unwrap();
        calls.accept_incoming("c1").await.unwrap();
        calls
            .handle_signal(envelope("c1", SignalingMessage::Hangup))
            .await
            .unwrap();
        assert!(calls.session("alice").is_none());

        calls.handle_signal(ice("c1", "redelivered")).await.unwrap();
        assert!(calls.early_candidates.lock().is_empty());

        calls.handle_signal(offer("c2")).await.unwrap();
        calls.hang_up("alice").await.unwrap();
        calls.handle_signal(ice("c2", "late")).await.unwrap();
        assert!(calls.early_candidates.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn candidates_beside_a_live_call_are_not_kept() {
        let h = Harness::new(vec![]);
        let calls = CallController::new("bob", h.context.clone());
        calls.handle_signal(offer("c1")).await.unwrap();
        calls.handle_signal(ice("c9", "stray")).await.unwrap();
        assert!(calls.early_candidates.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pending_calls_are_bounded() {
        let h = Harness::new(vec![]);
        let calls = CallController::new("bob", h.context.clone());
        for _ in 0..1000 {
            let call_id = crate::utils::random_id();
            calls.handle_signal(ice(&call_id, "spray")).await.unwrap();
        }
        assert_eq!(calls.early_candidates.lock().len(), MAX_EARLY_CALLS);

        for n in 0..crate::config::RECENT_CALLS * 3 {
            calls
                .handle_signal(envelope(&format!("gone-{n}"), SignalingMessage::Hangup))
                .await
                .unwrap();
        }
        assert_eq!(calls.recent_calls.lock().len(), crate::config::RECENT_CALLS);
    }

    #[tokio::test(start_paused = true)]
    async fn redelivered_offer_rings_once() {
        let h = Harness::new(vec![]);
        let calls = CallController::new("bob", h.context.clone());
        calls.handle_signal(offer("c1")).await.unwrap();
        calls.handle_signal(offer("c1")).await.unwrap();
        assert_eq!(h.observer.incoming.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_callee_rejects_second_caller() {
        let mut h = Harness::new(vec![]);
        let calls = CallController::new("bob", h.context.clone());
        calls.handle_signal(offer("c1")).await.unwrap();

        let other = Envelope::new(
            "c2",
            "carol",
            "bob",
            SignalingMessage::Offer {
                sdp: "carol-offer".into(),
                media: MediaKind::AudioVideo,
            },
        );
        let err = calls.handle_signal(other).await.unwrap_err();
        assert!(matches!(err, CallError::Busy(peer) if peer == "alice"));

        let reply = h.outbox.try_recv().unwrap();
        assert_eq!(reply.to, "carol");
        assert_eq!(reply.call_id, "c2");
        assert_eq!(reply.message, SignalingMessage::Hangup);
        assert!(calls.session("carol").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn new_call_from_same_peer_supersedes_old() {
        let h = Harness::new(vec![]);
        let calls = CallController::new("bob", h.context.clone());
        calls.handle_signal(offer("c1")).await.unwrap();
        let old = calls.session("alice").unwrap();

        calls.handle_signal(offer("c2")).await.unwrap();
        assert_eq!(old.state(), SessionState::Closed);
        assert_eq!(calls.session("alice").unwrap().id(), "c2");
    }

    #[tokio::test(start_paused = true)]
    async fn remote_hangup_closes_matching_call_only() {
        let h = Harness::new(vec![]);
        let calls = CallController::new("bob", h.context.clone());
        calls.handle_signal(offer("c1")).await.unwrap();
        calls.accept_incoming("c1").await.unwrap();
        let session = calls.session("alice").unwrap();

        calls
            .handle_signal(envelope("stale", SignalingMessage::Hangup))
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Negotiating);

        calls
            .handle_signal(envelope("c1", SignalingMessage::Hangup))
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(calls.session("alice").is_none());
        assert_eq!(h.factory.last().closes.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn misaddressed_or_mismatched_messages_are_ignored() {
        let mut h = Harness::new(vec![]);
        let calls = CallController::new("alice", h.context.clone());
        let session = calls.start_call("bob", MediaKind::Audio).await.unwrap();
        h.sent();

        let wrong_call = Envelope::new(
            "other",
            "bob",
            "alice",
            SignalingMessage::Answer { sdp: "x".into() },
        );
        calls.handle_signal(wrong_call).await.unwrap();
        let wrong_peer = Envelope::new(
            session.id(),
            "bob",
            "dave",
            SignalingMessage::Answer { sdp: "x".into() },
        );
        calls.handle_signal(wrong_peer).await.unwrap();
        assert_eq!(h.factory.last().count("set_remote"), 0);

        let answer = Envelope::new(
            session.id(),
            "bob",
            "alice",
            SignalingMessage::Answer { sdp: "x".into() },
        );
        calls.handle_signal(answer).await.unwrap();
        assert_eq!(h.factory.last().count("set_remote"), 1);
    }
}
