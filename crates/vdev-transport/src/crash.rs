//! Crash-log subscription channel.
//!
//! A subscription is a single outbound command that never completes: its
//! pending entry is exempt from remove-on-terminal logic and every inbound
//! frame on the id is an independent event. Each event names an artifact
//! path; the watcher downloads the artifact over the same dispatcher,
//! deletes it remotely, and only then yields the contents.
//!
//! Because the subscription permanently occupies one request id and the
//! subscriber's workflow is typically sequential, run it on its own
//! [`AgentClient`] when you also need ordinary blocking commands.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures_util::Stream;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    codec::Frame,
    connection::AgentClient,
    error::{AgentError, AgentResult},
    pending::{Completion, FrameHandler},
};

/// One retrieved crash artifact.
#[derive(Clone, Debug)]
pub struct CrashReport {
    /// Remote path the artifact was fetched from (deleted remotely by the
    /// time the report is yielded).
    pub path: String,
    /// Full artifact contents.
    pub contents: Bytes,
}

/// Stream of crash reports from one subscription.
///
/// Yields indefinitely; an `Err` item means the subscription itself died
/// (connection loss or a server-side error) and no further items follow.
pub struct CrashStream {
    rx: mpsc::UnboundedReceiver<AgentResult<CrashReport>>,
}

impl CrashStream {
    /// Receive the next crash report.
    pub async fn next(&mut self) -> Option<AgentResult<CrashReport>> {
        self.rx.recv().await
    }
}

impl Stream for CrashStream {
    type Item = AgentResult<CrashReport>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl AgentClient {
    /// Subscribe to crash logs matching `filter` (typically a bundle
    /// identifier).
    pub async fn watch_crashes(&self, filter: &str) -> AgentResult<CrashStream> {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        self.send(
            json!({"type": "crash", "op": "subscribe", "filter": filter}),
            subscription_handler(event_tx),
        )
        .await?;

        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let client = self.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                let value = match event {
                    Ok(value) => value,
                    Err(err) => {
                        let _ = report_tx.send(Err(err));
                        break;
                    }
                };
                let Some(path) = value.get("file").and_then(Value::as_str).map(str::to_owned)
                else {
                    debug!("crash event without artifact reference");
                    continue;
                };
                if report_tx.send(fetch_artifact(&client, path).await).is_err() {
                    break;
                }
            }
        });

        Ok(CrashStream { rx: report_rx })
    }
}

/// Download the artifact and delete it remotely before handing it over.
async fn fetch_artifact(client: &AgentClient, path: String) -> AgentResult<CrashReport> {
    let contents = client.download(&path).await?.read_to_end().await?;
    if let Err(err) = client.file_delete(&path).await {
        warn!(error = %err, path = %path, "failed to delete crash artifact");
    }
    Ok(CrashReport { path, contents })
}

/// Handler for the long-lived subscription entry: every frame is forwarded
/// as a fresh event and the entry is never completed by inbound traffic.
fn subscription_handler(event_tx: mpsc::UnboundedSender<AgentResult<Value>>) -> FrameHandler {
    Box::new(move |event| match event {
        Err(err) => {
            let _ = event_tx.send(Err(err.clone()));
            Completion::Failed(err)
        }
        Ok(Frame::Control(value)) => {
            if let Some(error) = value.get("error") {
                let err = AgentError::Command(error.clone());
                let _ = event_tx.send(Err(err.clone()));
                Completion::Failed(err)
            } else {
                let _ = event_tx.send(Ok(value));
                Completion::Pending
            }
        }
        Ok(Frame::Binary { .. }) => Completion::Pending,
    })
}
