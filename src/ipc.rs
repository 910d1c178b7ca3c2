//! Message channel between the UI and testrack.
//!
//! Both directions use newline-delimited JSON. Every line is an object of the
//! form `{"event": <name>, "payload": <value>}`; events without data omit
//! `payload`. Inbound lines decode to `Request`, outbound messages are
//! `Message` values queued on an `Outbox` and written by a single writer task.

use std::io::BufRead;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::events::Event;
use crate::project::{Project, TestResults};

/// Requests sent by the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum Request {
    #[serde(rename = "initialize-app")]
    Initialize,
    #[serde(rename = "watch directory")]
    WatchDirectory(PathBuf),
    #[serde(rename = "execute test")]
    ExecuteTest(PathBuf),
    #[serde(rename = "remove-project")]
    RemoveProject(PathBuf),
    #[serde(rename = "quit")]
    Quit,
}

/// Messages pushed to the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum Message {
    #[serde(rename = "set-projects")]
    SetProjects(Vec<Project>),
    #[serde(rename = "test-start")]
    TestStart(PathBuf),
    #[serde(rename = "test error")]
    TestError { error: String, path: PathBuf },
    #[serde(rename = "test results")]
    TestResults(TestResults),
    #[serde(rename = "project-removed", rename_all = "camelCase")]
    ProjectRemoved { path: PathBuf, was_removed: bool },
    #[serde(rename = "watch-error")]
    WatchError { path: PathBuf, error: String },
}

/// Decodes one inbound line.
pub fn decode_request(line: &str) -> serde_json::Result<Request> {
    serde_json::from_str(line.trim())
}

/// Encodes one outbound message as a single line, without the trailing newline.
pub fn encode_message(message: &Message) -> serde_json::Result<String> {
    serde_json::to_string(message)
}

/// Cloneable handle for pushing messages to the UI.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Message>,
}

impl Outbox {
    /// Creates an outbox and the receiving end the writer task drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn send(&self, message: Message) {
        if self.tx.send(message).await.is_err() {
            debug!("UI channel closed, dropping message");
        }
    }
}

/// Reads requests line by line on a dedicated thread and forwards them to
/// the event loop.
///
/// Undecodable lines, including ones that are not UTF-8, are logged and
/// skipped. When the reader hits end of input or an I/O error,
/// `Event::WindowsClosed` is sent and the thread ends. A plain thread is used
/// so a pending read never holds up runtime shutdown.
pub fn spawn_request_reader<R>(mut reader: R, tx: mpsc::Sender<Event>) -> std::thread::JoinHandle<()>
where
    R: BufRead + Send + 'static,
{
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => {
                    error!(%err, "failed to read from UI channel");
                    break;
                }
            }
            let line = match std::str::from_utf8(&buf) {
                Ok(line) => line,
                Err(err) => {
                    warn!(%err, "ignoring request that is not valid UTF-8");
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match decode_request(line) {
                Ok(request) => {
                    debug!(?request, "request received");
                    if tx.blocking_send(Event::Request(request)).is_err() {
                        return;
                    }
                }
                Err(err) => warn!(%err, line = %line, "ignoring malformed request"),
            }
        }
        let _ = tx.blocking_send(Event::WindowsClosed);
    })
}

/// Writes queued messages to `writer`, one JSON object per line.
pub fn spawn_message_writer<W>(mut writer: W, mut rx: mpsc::Receiver<Message>) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let mut line = match encode_message(&message) {
                Ok(line) => line,
                Err(err) => {
                    error!(%err, "failed to encode message");
                    continue;
                }
            };
            line.push('\n');
            if let Err(err) = writer.write_all(line.as_bytes()).await {
                error!(%err, "failed to write to UI channel");
                break;
            }
            if let Err(err) = writer.flush().await {
                error!(%err, "failed to flush UI channel");
                break;
            }
        }
    })
}
