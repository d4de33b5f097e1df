use crate::control::ControlMessage;
use crate::stats::{inc, LinkStats};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const ACK_STATUS_OK: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerSaveState {
    Active,
    SuspendRequested,
    Suspended,
    ResumeRequested,
}

impl PowerSaveState {
    pub fn is_stable(self) -> bool {
        matches!(self, PowerSaveState::Active | PowerSaveState::Suspended)
    }
}

impl fmt::Display for PowerSaveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PowerSaveState::Active => "ACTIVE",
            PowerSaveState::SuspendRequested => "SUSPEND_REQUESTED",
            PowerSaveState::Suspended => "SUSPENDED",
            PowerSaveState::ResumeRequested => "RESUME_REQUESTED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transition {
    Suspend,
    Resume,
}

impl Transition {
    fn origin(self) -> PowerSaveState {
        match self {
            Transition::Suspend => PowerSaveState::Active,
            Transition::Resume => PowerSaveState::Suspended,
        }
    }

    fn pending(self) -> PowerSaveState {
        match self {
            Transition::Suspend => PowerSaveState::SuspendRequested,
            Transition::Resume => PowerSaveState::ResumeRequested,
        }
    }

    fn target(self) -> PowerSaveState {
        match self {
            Transition::Suspend => PowerSaveState::Suspended,
            Transition::Resume => PowerSaveState::Active,
        }
    }

    fn request(self) -> ControlMessage {
        match self {
            Transition::Suspend => ControlMessage::PowerSaveStart { status: None },
            Transition::Resume => ControlMessage::PowerSaveStop { status: None },
        }
    }
}

/// Result of a power-save request that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerSaveOutcome {
    Completed(PowerSaveState),
    /// A transition is already in flight; nothing was sent.
    AlreadyPending,
    /// Already in the requested state; nothing was sent.
    AlreadyInState,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PowerSaveError {
    #[error("no power-save acknowledgement within {0:?}, reverted to {1}")]
    AckTimeout(Duration, PowerSaveState),
    #[error("slave rejected power-save request with status {0}")]
    Rejected(u8),
    #[error("power-save request was abandoned in state {0}")]
    Abandoned(PowerSaveState),
}

/// What the caller must do after [`PowerSaveCoordinator::begin`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Begin {
    /// Put this request on the outbound bank, then wait for the ack.
    Send(ControlMessage),
    Done(PowerSaveOutcome),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Status {
    state: PowerSaveState,
    rejected: Option<u8>,
}

/// Host side of the suspend/resume exchange.
pub struct PowerSaveCoordinator {
    status: watch::Sender<Status>,
    ack_timeout: Duration,
    stats: Arc<LinkStats>,
}

impl PowerSaveCoordinator {
    pub fn new(ack_timeout: Duration, stats: Arc<LinkStats>) -> Self {
        let (status, _) = watch::channel(Status {
            state: PowerSaveState::Active,
            rejected: None,
        });
        Self {
            status,
            ack_timeout,
            stats,
        }
    }

    pub fn state(&self) -> PowerSaveState {
        self.status.borrow().state
    }

    /// Move to the pending state if the transition is allowed from here.
    pub fn begin(&self, transition: Transition) -> Begin {
        let mut outcome = Begin::Send(transition.request());
        self.status.send_if_modified(|status| {
            if status.state == transition.origin() {
                status.state = transition.pending();
                status.rejected = None;
                true
            } else {
                outcome = if status.state == transition.target() {
                    Begin::Done(PowerSaveOutcome::AlreadyInState)
                } else {
                    Begin::Done(PowerSaveOutcome::AlreadyPending)
                };
                false
            }
        });
        if let Begin::Send(_) = outcome {
            debug!(?transition, "power-save request started");
        }
        outcome
    }

    /// Return to the prior stable state if `transition` is still pending,
    /// e.g. when its request could not be queued.
    pub fn abort(&self, transition: Transition) {
        self.status.send_if_modified(|status| {
            if status.state == transition.pending() {
                status.state = transition.origin();
                true
            } else {
                false
            }
        });
    }

    /// Wait for the slave's acknowledgement of `transition`.
    pub async fn wait_ack(&self, transition: Transition) -> Result<PowerSaveOutcome, PowerSaveError> {
        let pending = transition.pending();
        let mut rx = self.status.subscribe();
        let settled = tokio::time::timeout(self.ack_timeout, async {
            rx.wait_for(|status| status.state != pending).await.map(|status| *status).ok()
        })
        .await;

        match settled {
            Ok(Some(status)) => Self::settle(transition, status),
            Ok(None) => Err(PowerSaveError::Abandoned(self.state())),
            Err(_) => {
                let reverted = self.status.send_if_modified(|status| {
                    if status.state == pending {
                        status.state = transition.origin();
                        true
                    } else {
                        false
                    }
                });
                if reverted {
                    inc(&self.stats.power_save_timeouts);
                    warn!(?transition, timeout = ?self.ack_timeout, "power-save ack timed out");
                    Err(PowerSaveError::AckTimeout(self.ack_timeout, transition.origin()))
                } else {
                    // The ack raced the timeout.
                    let status = *self.status.borrow();
                    Self::settle(transition, status)
                }
            }
        }
    }

    fn settle(transition: Transition, status: Status) -> Result<PowerSaveOutcome, PowerSaveError> {
        if status.state == transition.target() {
            Ok(PowerSaveOutcome::Completed(status.state))
        } else if let Some(code) = status.rejected {
            Err(PowerSaveError::Rejected(code))
        } else {
            Err(PowerSaveError::Abandoned(status.state))
        }
    }

    /// Feed a power-save acknowledgement from the private-control path.
    /// Returns `false` when no matching request was pending.
    pub fn on_ack(&self, message: &ControlMessage) -> bool {
        let (transition, status_code) = match message {
            ControlMessage::PowerSaveStart { status: Some(code) } => (Transition::Suspend, *code),
            ControlMessage::PowerSaveStop { status: Some(code) } => (Transition::Resume, *code),
            // A status-less message is a request, never an acknowledgement.
            _ => return false,
        };

        let accepted = self.status.send_if_modified(|status| {
            if status.state != transition.pending() {
                return false;
            }
            if status_code == ACK_STATUS_OK {
                status.state = transition.target();
            } else {
                status.state = transition.origin();
                status.rejected = Some(status_code);
            }
            true
        });

        if accepted {
            info!(state = %self.state(), status = status_code, "power-save ack");
        } else {
            debug!(?transition, state = %self.state(), "unexpected power-save ack");
        }
        accepted
    }

    /// Forget any transition in flight and return to ACTIVE.
    pub fn reset(&self) {
        self.status.send_replace(Status {
            state: PowerSaveState::Active,
            rejected: None,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator(timeout_ms: u64) -> Arc<PowerSaveCoordinator> {
        Arc::new(PowerSaveCoordinator::new(
            Duration::from_millis(timeout_ms),
            Arc::new(LinkStats::default()),
        ))
    }

    #[test]
    fn test_begin_rules() {
        let ps = coordinator(100);
        assert_eq!(ps.begin(Transition::Resume), Begin::Done(PowerSaveOutcome::AlreadyInState));
        assert!(matches!(ps.begin(Transition::Suspend), Begin::Send(ControlMessage::PowerSaveStart { status: None })));
        assert_eq!(ps.state(), PowerSaveState::SuspendRequested);
        assert_eq!(ps.begin(Transition::Suspend), Begin::Done(PowerSaveOutcome::AlreadyPending));
        assert_eq!(ps.begin(Transition::Resume), Begin::Done(PowerSaveOutcome::AlreadyPending));
    }

    #[tokio::test]
    async fn test_suspend_and_resume_with_acks() {
        let ps = coordinator(500);
        assert!(matches!(ps.begin(Transition::Suspend), Begin::Send(_)));

        let acker = Arc::clone(&ps);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert!(acker.on_ack(&ControlMessage::PowerSaveStart { status: Some(0) }));
        });
        assert_eq!(
            ps.wait_ack(Transition::Suspend).await,
            Ok(PowerSaveOutcome::Completed(PowerSaveState::Suspended))
        );

        assert!(matches!(ps.begin(Transition::Resume), Begin::Send(_)));
        assert!(ps.on_ack(&ControlMessage::PowerSaveStop { status: Some(0) }));
        assert_eq!(
            ps.wait_ack(Transition::Resume).await,
            Ok(PowerSaveOutcome::Completed(PowerSaveState::Active))
        );
    }

    #[tokio::test]
    async fn test_timeout_reverts_and_counts() {
        let stats = Arc::new(LinkStats::default());
        let ps = PowerSaveCoordinator::new(Duration::from_millis(10), Arc::clone(&stats));
        assert!(matches!(ps.begin(Transition::Suspend), Begin::Send(_)));

        let result = ps.wait_ack(Transition::Suspend).await;
        assert_eq!(
            result,
            Err(PowerSaveError::AckTimeout(Duration::from_millis(10), PowerSaveState::Active))
        );
        assert_eq!(ps.state(), PowerSaveState::Active);
        assert_eq!(stats.snapshot().power_save_timeouts, 1);
    }

    #[tokio::test]
    async fn test_rejected_ack_reverts() {
        let ps = coordinator(100);
        assert!(matches!(ps.begin(Transition::Suspend), Begin::Send(_)));
        assert!(ps.on_ack(&ControlMessage::PowerSaveStart { status: Some(3) }));
        assert_eq!(ps.wait_ack(Transition::Suspend).await, Err(PowerSaveError::Rejected(3)));
        assert_eq!(ps.state(), PowerSaveState::Active);
    }

    #[test]
    fn test_stray_ack_is_ignored() {
        let ps = coordinator(100);
        assert!(!ps.on_ack(&ControlMessage::PowerSaveStart { status: Some(0) }));
        assert!(!ps.on_ack(&ControlMessage::QueueLoad { percent: 10 }));
        assert_eq!(ps.state(), PowerSaveState::Active);
    }

    #[test]
    fn test_reflected_request_does_not_complete_transition() {
        let ps = coordinator(100);
        assert!(matches!(ps.begin(Transition::Suspend), Begin::Send(_)));
        assert!(!ps.on_ack(&ControlMessage::PowerSaveStart { status: None }));
        assert_eq!(ps.state(), PowerSaveState::SuspendRequested);
    }

    #[test]
    fn test_abort_restores_prior_state() {
        let ps = coordinator(100);
        assert!(matches!(ps.begin(Transition::Suspend), Begin::Send(_)));
        ps.abort(Transition::Suspend);
        assert_eq!(ps.state(), PowerSaveState::Active);
    }
}
