//! Progress narration.
//!
//! A run reports progress as an ordered stream of events on a bounded channel.
//! Every run ends with exactly one `sql_generated` or `error` event followed by
//! `close`. Dropping the receiver abandons the run: the next emit fails and the
//! pipeline stops.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// One progress event. Serializes as `{"event": "<kind>", "data": "<text>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ProgressEvent {
    Status(String),
    Warning(String),
    SqlGenerated(String),
    Error(String),
    Close(String),
}

impl ProgressEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ProgressEvent::Status(_) => "status",
            ProgressEvent::Warning(_) => "warning",
            ProgressEvent::SqlGenerated(_) => "sql_generated",
            ProgressEvent::Error(_) => "error",
            ProgressEvent::Close(_) => "close",
        }
    }

    pub fn data(&self) -> &str {
        match self {
            ProgressEvent::Status(text)
            | ProgressEvent::Warning(text)
            | ProgressEvent::SqlGenerated(text)
            | ProgressEvent::Error(text)
            | ProgressEvent::Close(text) => text,
        }
    }

    /// `sql_generated` or `error`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::SqlGenerated(_) | ProgressEvent::Error(_))
    }
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind(), self.data())
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NarrationError {
    #[error("progress receiver dropped, run abandoned")]
    Abandoned,

    #[error("a terminal event was already emitted")]
    AlreadyTerminated,
}

pub type NarrationResult = std::result::Result<(), NarrationError>;

/// Sending half of a run's event stream.
#[derive(Debug)]
pub struct Narrator {
    tx: mpsc::Sender<ProgressEvent>,
    warnings: Vec<String>,
    terminated: bool,
    closed: bool,
}

impl Narrator {
    pub fn new(tx: mpsc::Sender<ProgressEvent>) -> Self {
        Self {
            tx,
            warnings: Vec::new(),
            terminated: false,
            closed: false,
        }
    }

    /// Narrator plus the receiver for its events.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    /// After a terminal event only `close` goes through.
    async fn emit(&mut self, event: ProgressEvent) -> NarrationResult {
        let after_terminal = self.terminated && !matches!(event, ProgressEvent::Close(_));
        if self.closed || after_terminal {
            return Err(NarrationError::AlreadyTerminated);
        }
        debug!("progress {}", event);
        self.tx
            .send(event)
            .await
            .map_err(|_| NarrationError::Abandoned)
    }

    pub async fn status(&mut self, message: impl Into<String>) -> NarrationResult {
        self.emit(ProgressEvent::Status(message.into())).await
    }

    pub async fn warning(&mut self, message: impl Into<String>) -> NarrationResult {
        let message = message.into();
        warn!("{}", message);
        self.emit(ProgressEvent::Warning(message.clone())).await?;
        self.warnings.push(message);
        Ok(())
    }

    pub async fn sql_generated(&mut self, sql: impl Into<String>) -> NarrationResult {
        self.terminate(ProgressEvent::SqlGenerated(sql.into())).await
    }

    pub async fn error(&mut self, message: impl Into<String>) -> NarrationResult {
        self.terminate(ProgressEvent::Error(message.into())).await
    }

    async fn terminate(&mut self, event: ProgressEvent) -> NarrationResult {
        if self.terminated || self.closed {
            return Err(NarrationError::AlreadyTerminated);
        }
        let result = self.emit(event).await;
        self.terminated = true;
        result
    }

    /// Always the last event. Later emits fail with `AlreadyTerminated`.
    pub async fn close(&mut self, message: impl Into<String>) -> NarrationResult {
        let result = self.emit(ProgressEvent::Close(message.into())).await;
        self.closed = true;
        result
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn warning_count(&self) -> usize {
        self.warnings.len()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let json = serde_json::to_string(&ProgressEvent::SqlGenerated("SELECT 1".into())).unwrap();
        assert_eq!(json, r#"{"event":"sql_generated","data":"SELECT 1"}"#);

        let back: ProgressEvent = serde_json::from_str(r#"{"event":"close","data":"done"}"#).unwrap();
        assert_eq!(back, ProgressEvent::Close("done".into()));
    }

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (mut narrator, mut rx) = Narrator::channel(8);
        narrator.status("one").await.unwrap();
        narrator.warning("two").await.unwrap();
        narrator.error("three").await.unwrap();
        narrator.close("four").await.unwrap();
        drop(narrator);

        let mut kinds = Vec::new();
        while let Some(event) = rx.recv().await {
            kinds.push(event.kind());
        }
        assert_eq!(kinds, vec!["status", "warning", "error", "close"]);
    }

    #[tokio::test]
    async fn test_single_terminal_event() {
        let (mut narrator, _rx) = Narrator::channel(8);
        narrator.sql_generated("SELECT 1").await.unwrap();
        assert_eq!(
            narrator.error("late").await,
            Err(NarrationError::AlreadyTerminated)
        );
        narrator.close("done").await.unwrap();
        assert_eq!(
            narrator.status("after close").await,
            Err(NarrationError::AlreadyTerminated)
        );
    }

    #[tokio::test]
    async fn test_only_close_follows_terminal_event() {
        let (mut narrator, mut rx) = Narrator::channel(8);
        narrator.error("broken").await.unwrap();
        assert_eq!(
            narrator.status("late status").await,
            Err(NarrationError::AlreadyTerminated)
        );
        assert_eq!(
            narrator.warning("late warning").await,
            Err(NarrationError::AlreadyTerminated)
        );
        assert_eq!(narrator.warning_count(), 0);
        narrator.close("done").await.unwrap();
        drop(narrator);

        let mut kinds = Vec::new();
        while let Some(event) = rx.recv().await {
            kinds.push(event.kind());
        }
        assert_eq!(kinds, vec!["error", "close"]);
    }

    #[tokio::test]
    async fn test_dropped_receiver_abandons() {
        let (mut narrator, rx) = Narrator::channel(8);
        drop(rx);
        assert_eq!(narrator.status("anyone?").await, Err(NarrationError::Abandoned));
    }

    #[tokio::test]
    async fn test_warnings_are_counted() {
        let (mut narrator, _rx) = Narrator::channel(8);
        narrator.warning("cycle").await.unwrap();
        narrator.status("fine").await.unwrap();
        assert_eq!(narrator.warning_count(), 1);
        assert_eq!(narrator.warnings(), &["cycle".to_string()]);
    }
}
