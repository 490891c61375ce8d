//! User-facing failure notices.
//!
//! The scheduler never waits on a sink: notices are fire-and-forget, and a
//! full channel drops the notice rather than stalling a tick.

use crossbeam_channel::{Receiver, Sender, bounded};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoticeKind {
    FetchFailed,
    LoadFailed,
    TeleportFailed,
    RealmChangeFailed,
}

/// A human-readable failure report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
}

impl Notice {
    pub fn new(kind: NoticeKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)
    }
}

/// Receives failure notices for display.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Sink that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, notice: Notice) {
        tracing::warn!(kind = ?notice.kind, "{}", notice.message);
    }
}

/// Bounded notice queue drained by the UI between frames.
pub struct NoticeBuffer {
    sender: Sender<Notice>,
    receiver: Receiver<Notice>,
}

impl NoticeBuffer {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);
        Self { sender, receiver }
    }

    /// A sink feeding this buffer.
    pub fn sink(&self) -> ChannelSink {
        ChannelSink {
            sender: self.sender.clone(),
        }
    }

    /// Take every pending notice.
    pub fn drain(&self) -> Vec<Notice> {
        self.receiver.try_iter().collect()
    }

    pub fn pending_count(&self) -> usize {
        self.receiver.len()
    }
}

/// Sending half of a [`NoticeBuffer`].
#[derive(Clone)]
pub struct ChannelSink {
    sender: Sender<Notice>,
}

impl NotificationSink for ChannelSink {
    fn notify(&self, notice: Notice) {
        tracing::debug!(%notice, "notice");
        if self.sender.try_send(notice).is_err() {
            tracing::warn!("notice buffer full, dropping notice");
        }
    }
}
