use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::UploadId;

/// Lifecycle of a remote multipart upload.
///
/// `Pending -> Uploading -> {Completed | Aborted | Failed}`. The three
/// right-hand states are terminal and absorb every further event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Completed,
    Aborted,
    Failed { reason: String },
}

/// Something that happened to an upload session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    /// The store accepted the multipart session
    Started,
    /// The store acknowledged every part and assembled the object
    AllPartsAcknowledged,
    /// The caller's stream went away before completion
    CallerClosed,
    /// Non-recoverable transport or protocol error
    Failed(String),
}

/// Work the upload task owes after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadEffect {
    None,
    /// Discard the parts held by the store
    AbortRemote,
    /// End the caller-facing stream
    EndStream,
}

impl UploadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Failed { .. })
    }

    /// The only place upload state changes are decided.
    pub fn transition(&self, event: UploadEvent) -> (UploadStatus, UploadEffect) {
        use UploadEffect as E;
        use UploadEvent as Ev;
        use UploadStatus as S;

        match (self, event) {
            (S::Pending, Ev::Started) => (S::Uploading, E::None),
            // No remote session exists yet, so there is nothing to abort
            (S::Pending, Ev::CallerClosed) => (S::Aborted, E::None),
            (S::Pending, Ev::Failed(reason)) => (S::Failed { reason }, E::None),

            (S::Uploading, Ev::AllPartsAcknowledged) => (S::Completed, E::EndStream),
            (S::Uploading, Ev::CallerClosed) => (S::Aborted, E::AbortRemote),
            (S::Uploading, Ev::Failed(reason)) => (S::Failed { reason }, E::AbortRemote),

            (current, _) => (current.clone(), E::None),
        }
    }
}

/// Snapshot of an upload session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub key: String,
    pub upload_id: Option<UploadId>,
    pub status: UploadStatus,
    pub bytes_received: u64,
    pub bytes_uploaded: u64,
    pub parts_acknowledged: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn new<S: Into<String>>(key: S) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            upload_id: None,
            status: UploadStatus::Pending,
            bytes_received: 0,
            bytes_uploaded: 0,
            parts_acknowledged: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Shared view of one upload session.
///
/// The upload task applies events; writers and handles observe the result
/// through the underlying watch channel.
#[derive(Debug)]
pub struct UploadTracker {
    session: watch::Sender<UploadSession>,
}

impl UploadTracker {
    pub fn new<S: Into<String>>(key: S) -> Self {
        let (session, _) = watch::channel(UploadSession::new(key));
        Self { session }
    }

    /// Apply `event` atomically and return the effect the caller must carry out
    pub fn apply(&self, event: UploadEvent) -> UploadEffect {
        let mut effect = UploadEffect::None;
        self.session.send_if_modified(|session| {
            let (next, e) = session.status.transition(event);
            effect = e;
            if next == session.status {
                return false;
            }
            session.status = next;
            session.updated_at = Utc::now();
            true
        });
        effect
    }

    pub(crate) fn set_upload_id(&self, upload_id: UploadId) {
        self.session.send_modify(|session| {
            session.upload_id = Some(upload_id);
            session.updated_at = Utc::now();
        });
    }

    pub(crate) fn record_received(&self, bytes: u64) {
        self.session.send_modify(|session| session.bytes_received += bytes);
    }

    pub(crate) fn record_part(&self, bytes: u64) {
        self.session.send_modify(|session| {
            session.parts_acknowledged += 1;
            session.bytes_uploaded += bytes;
            session.updated_at = Utc::now();
        });
    }

    pub fn status(&self) -> UploadStatus {
        self.session.borrow().status.clone()
    }

    pub fn snapshot(&self) -> UploadSession {
        self.session.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<UploadSession> {
        self.session.subscribe()
    }

    /// Resolve once the session reaches a terminal state
    pub async fn wait_terminal(&self) -> UploadStatus {
        let mut rx = self.session.subscribe();
        rx.wait_for(|session| session.status.is_terminal())
            .await
            .map(|session| session.status.clone())
            .unwrap_or_else(|_| self.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn happy_path() {
        let (s, e) = UploadStatus::Pending.transition(UploadEvent::Started);
        assert_eq!((s.clone(), e), (UploadStatus::Uploading, UploadEffect::None));

        let (s, e) = s.transition(UploadEvent::AllPartsAcknowledged);
        assert_eq!((s, e), (UploadStatus::Completed, UploadEffect::EndStream));
    }

    #[test]
    fn closing_while_uploading_aborts_remote() {
        let (s, e) = UploadStatus::Uploading.transition(UploadEvent::CallerClosed);
        assert_eq!((s, e), (UploadStatus::Aborted, UploadEffect::AbortRemote));
    }

    #[test]
    fn failure_while_uploading_still_aborts_remote() {
        let (s, e) = UploadStatus::Uploading.transition(UploadEvent::Failed("timeout".into()));
        assert_eq!(
            (s, e),
            (
                UploadStatus::Failed {
                    reason: "timeout".into()
                },
                UploadEffect::AbortRemote
            )
        );
    }

    #[test]
    fn pending_sessions_have_nothing_to_abort() {
        assert_eq!(
            UploadStatus::Pending.transition(UploadEvent::CallerClosed),
            (UploadStatus::Aborted, UploadEffect::None)
        );
        assert_eq!(
            UploadStatus::Pending.transition(UploadEvent::AllPartsAcknowledged),
            (UploadStatus::Pending, UploadEffect::None)
        );
    }

    #[test]
    fn terminal_states_absorb_events() {
        let terminal = [
            UploadStatus::Completed,
            UploadStatus::Aborted,
            UploadStatus::Failed { reason: "x".into() },
        ];
        let events = [
            UploadEvent::Started,
            UploadEvent::AllPartsAcknowledged,
            UploadEvent::CallerClosed,
            UploadEvent::Failed("late".into()),
        ];
        for status in &terminal {
            for event in &events {
                assert_eq!(
                    status.transition(event.clone()),
                    (status.clone(), UploadEffect::None),
                    "{status:?} + {event:?}"
                );
            }
        }
    }

    #[test]
    fn second_abort_is_a_no_op() {
        let tracker = UploadTracker::new("photo1.jpg");
        tracker.apply(UploadEvent::Started);

        assert_eq!(tracker.apply(UploadEvent::CallerClosed), UploadEffect::AbortRemote);
        assert_eq!(tracker.apply(UploadEvent::CallerClosed), UploadEffect::None);
        assert_eq!(tracker.status(), UploadStatus::Aborted);
    }

    #[test]
    fn completion_wins_over_late_close() {
        let tracker = UploadTracker::new("photo1.jpg");
        tracker.apply(UploadEvent::Started);
        assert_eq!(tracker.apply(UploadEvent::AllPartsAcknowledged), UploadEffect::EndStream);
        assert_eq!(tracker.apply(UploadEvent::CallerClosed), UploadEffect::None);
        assert_eq!(tracker.status(), UploadStatus::Completed);
    }

    #[test]
    fn snapshot_serializes_status() {
        let tracker = UploadTracker::new("a/b.bin");
        tracker.set_upload_id(UploadId::from_string("abc".into()));
        tracker.apply(UploadEvent::Started);
        tracker.record_received(10);
        tracker.record_part(10);

        let json = serde_json::to_value(tracker.snapshot()).unwrap();
        assert_eq!(json["status"]["state"], "uploading");
        assert_eq!(json["upload_id"], "abc");
        assert_eq!(json["parts_acknowledged"], 1);
    }

    #[tokio::test]
    async fn wait_terminal_observes_completion() {
        let tracker = Arc::new(UploadTracker::new("a.bin"));
        tracker.apply(UploadEvent::Started);

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_terminal().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        tracker.apply(UploadEvent::AllPartsAcknowledged);

        let status = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter timed out")
            .unwrap();
        assert_eq!(status, UploadStatus::Completed);
    }
}
