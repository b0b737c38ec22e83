use crate::peer::types::LinkState;
use log::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorAction {
    None,
    /// Link reached connected/completed.
    Established,
    /// First failure of an episode: restart connectivity once.
    Restart,
    /// Failed again after the restart.
    GiveUp,
}

/// Tracks one failure episode at a time; a connected report ends it.
#[derive(Debug, Default)]
pub struct ConnectivityMonitor {
    restart_attempted: bool,
    last: Option<LinkState>,
}

impl ConnectivityMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_state(&self) -> Option<LinkState> {
        self.last
    }

    pub fn restart_attempted(&self) -> bool {
        self.restart_attempted
    }

    pub fn observe(&mut self, state: LinkState) -> MonitorAction {
        debug!("Link state {:?} -> {:?}", self.last, state);
        self.last = Some(state);

        match state {
            LinkState::Connected | LinkState::Completed => {
                if self.restart_attempted {
                    info!("Link recovered after restart");
                }
                self.restart_attempted = false;
                MonitorAction::Established
            }
            LinkState::Failed if self.restart_attempted => {
                warn!("Link failed again after restart, giving up");
                MonitorAction::GiveUp
            }
            LinkState::Failed => {
                warn!("Link failed, attempting connectivity restart");
                self.restart_attempted = true;
                MonitorAction::Restart
            }
            LinkState::Disconnected => {
                info!("Link disconnected, waiting for it to settle");
                MonitorAction::None
            }
            LinkState::New | LinkState::Checking | LinkState::Closed => MonitorAction::None,
        }
    }
}
