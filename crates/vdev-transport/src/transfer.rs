//! Byte-stream transfers and the command vocabulary veneer.
//!
//! Uploads and downloads ride on the dispatcher's per-id binary frames: the
//! announcing control command claims an id, data chunks are tagged with it,
//! and an empty chunk ends the stream. There is no protocol-level
//! backpressure; flow control is whatever the byte source or consumer
//! provides.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};

use crate::{
    codec::Frame,
    connection::AgentClient,
    error::{AgentError, AgentResult},
    pending::{Completion, FrameHandler},
};

/// Lazily produced, finite, non-restartable byte stream for one download.
///
/// Chunks arrive as the server sends them; nothing beyond undelivered chunks
/// is buffered. Dropping the stream abandons the remaining data.
pub struct DownloadStream {
    rx: mpsc::UnboundedReceiver<AgentResult<Bytes>>,
}

impl DownloadStream {
    /// Receive the next chunk; `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<AgentResult<Bytes>> {
        self.rx.recv().await
    }

    /// Collect the remaining chunks into one buffer.
    pub async fn read_to_end(mut self) -> AgentResult<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.rx.recv().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl Stream for DownloadStream {
    type Item = AgentResult<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl AgentClient {
    /// Upload `source` to `path` on the device.
    ///
    /// The announcing command and the data share one request id; the data is
    /// terminated by an empty binary frame. Resolves once the source is
    /// fully forwarded and the server's terminal frame has arrived — the ack
    /// may come before or after the drain, depending on server buffering.
    pub async fn upload<S>(&self, path: &str, mut source: S) -> AgentResult<()>
    where
        S: Stream<Item = AgentResult<Bytes>> + Send + Unpin,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let (id, epoch) = self
            .send_with_epoch(
                json!({"type": "file", "op": "upload", "path": path}),
                ack_handler(reply_tx),
            )
            .await?;

        while let Some(chunk) = source.next().await {
            let chunk = chunk?;
            if chunk.is_empty() {
                // an empty chunk would terminate the stream on the wire
                continue;
            }
            self.send_chunk(id, chunk, epoch).await?;
        }
        self.send_chunk(id, Bytes::new(), epoch).await?;

        reply_rx
            .await
            .map_err(|_| AgentError::internal("response channel dropped"))??;
        Ok(())
    }

    /// Upload an in-memory buffer to `path`.
    pub async fn upload_bytes(&self, path: &str, data: impl Into<Bytes>) -> AgentResult<()> {
        let chunk: AgentResult<Bytes> = Ok(data.into());
        self.upload(path, futures_util::stream::iter([chunk])).await
    }

    /// Download `path` from the device as an incrementally produced byte
    /// stream.
    pub async fn download(&self, path: &str) -> AgentResult<DownloadStream> {
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        self.send(
            json!({"type": "file", "op": "download", "path": path}),
            download_handler(chunk_tx),
        )
        .await?;
        Ok(DownloadStream { rx: chunk_rx })
    }

    /// Install the package staged at `path`, reporting interleaved progress
    /// frames to `on_progress` until the terminal frame arrives.
    pub async fn install<F>(&self, path: &str, on_progress: F) -> AgentResult<()>
    where
        F: FnMut(Value) + Send + Sync + 'static,
    {
        self.command_with_progress("app", "install", json!({"path": path}), on_progress)
            .await?;
        Ok(())
    }

    /// Uninstall an application, reporting progress like
    /// [`install`](Self::install).
    pub async fn uninstall<F>(&self, bundle_id: &str, on_progress: F) -> AgentResult<()>
    where
        F: FnMut(Value) + Send + Sync + 'static,
    {
        self.command_with_progress("app", "uninstall", json!({"bundleID": bundle_id}), on_progress)
            .await?;
        Ok(())
    }

    /// Ask the device for a fresh scratch file path.
    pub async fn temp_file(&self) -> AgentResult<String> {
        let value = self.command("file", "temp", Value::Null).await?;
        value
            .get("path")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| AgentError::protocol("file.temp response missing path"))
    }

    /// Stat a remote path.
    pub async fn file_stat(&self, path: &str) -> AgentResult<Value> {
        self.command("file", "stat", json!({"path": path})).await
    }

    /// Delete a remote path.
    pub async fn file_delete(&self, path: &str) -> AgentResult<()> {
        self.command("file", "delete", json!({"path": path})).await?;
        Ok(())
    }

    /// List installed applications.
    pub async fn app_list(&self) -> AgentResult<Value> {
        self.command("app", "list", Value::Null).await
    }

    /// Launch an application by bundle identifier.
    pub async fn app_run(&self, bundle_id: &str) -> AgentResult<()> {
        self.command("app", "run", json!({"bundleID": bundle_id}))
            .await?;
        Ok(())
    }

    /// Lock the device screen.
    pub async fn system_lock(&self) -> AgentResult<()> {
        self.command("system", "lock", Value::Null).await?;
        Ok(())
    }

    /// Unlock the device screen.
    pub async fn system_unlock(&self) -> AgentResult<()> {
        self.command("system", "unlock", Value::Null).await?;
        Ok(())
    }
}

/// Upload acknowledgement handler: `error` rejects, `success` resolves,
/// anything else is ignored while the data drains.
fn ack_handler(reply_tx: oneshot::Sender<AgentResult<Value>>) -> FrameHandler {
    let mut reply_tx = Some(reply_tx);
    Box::new(move |event| match event {
        Err(err) => {
            if let Some(tx) = reply_tx.take() {
                let _ = tx.send(Err(err.clone()));
            }
            Completion::Failed(err)
        }
        Ok(Frame::Control(value)) => {
            if let Some(error) = value.get("error") {
                let err = AgentError::Command(error.clone());
                if let Some(tx) = reply_tx.take() {
                    let _ = tx.send(Err(err.clone()));
                }
                Completion::Failed(err)
            } else if value.get("success").is_some() {
                if let Some(tx) = reply_tx.take() {
                    let _ = tx.send(Ok(value.clone()));
                }
                Completion::Done(value)
            } else {
                Completion::Pending
            }
        }
        Ok(Frame::Binary { .. }) => Completion::Pending,
    })
}

/// Download handler: binary frames are pushed to the consumer, the empty
/// frame ends the stream, an `error` control frame rejects it.
fn download_handler(chunk_tx: mpsc::UnboundedSender<AgentResult<Bytes>>) -> FrameHandler {
    let mut chunk_tx = Some(chunk_tx);
    Box::new(move |event| match event {
        Err(err) => {
            if let Some(tx) = chunk_tx.take() {
                let _ = tx.send(Err(err.clone()));
            }
            Completion::Failed(err)
        }
        Ok(Frame::Binary { payload, .. }) => {
            if payload.is_empty() {
                // dropping the sender ends the consumer's stream cleanly
                chunk_tx = None;
                Completion::Done(Value::Null)
            } else {
                if let Some(tx) = chunk_tx.as_ref()
                    && tx.send(Ok(payload)).is_err()
                {
                    // consumer dropped the stream; swallow the rest
                    chunk_tx = None;
                }
                Completion::Pending
            }
        }
        Ok(Frame::Control(value)) => {
            if let Some(error) = value.get("error") {
                let err = AgentError::Command(error.clone());
                if let Some(tx) = chunk_tx.take() {
                    let _ = tx.send(Err(err.clone()));
                }
                Completion::Failed(err)
            } else {
                // acknowledgement frames carry no payload
                Completion::Pending
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_ack_handler_waits_for_success() {
        let (reply_tx, reply_rx) = oneshot::channel();
        let mut handler = ack_handler(reply_tx);

        // a status frame without success/error keeps the upload pending
        let completion = handler(Ok(Frame::Control(json!({"id": 4, "status": "receiving"}))));
        assert!(matches!(completion, Completion::Pending));

        let completion = handler(Ok(Frame::Control(json!({"id": 4, "success": true}))));
        assert!(matches!(completion, Completion::Done(_)));
        assert!(reply_rx.await.expect("reply").is_ok());
    }

    #[tokio::test]
    async fn test_ack_handler_error_frame() {
        let (reply_tx, reply_rx) = oneshot::channel();
        let mut handler = ack_handler(reply_tx);

        let completion = handler(Ok(Frame::Control(
            json!({"id": 4, "error": {"message": "disk full"}}),
        )));
        assert!(matches!(completion, Completion::Failed(_)));
        assert!(matches!(
            reply_rx.await.expect("reply"),
            Err(AgentError::Command(_))
        ));
    }

    #[tokio::test]
    async fn test_download_handler_streams_until_terminator() {
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel();
        let mut handler = download_handler(chunk_tx);

        let completion = handler(Ok(Frame::Binary {
            id: 2,
            payload: Bytes::from_static(b"hello "),
        }));
        assert!(matches!(completion, Completion::Pending));

        let completion = handler(Ok(Frame::Binary {
            id: 2,
            payload: Bytes::from_static(b"world"),
        }));
        assert!(matches!(completion, Completion::Pending));

        let completion = handler(Ok(Frame::Binary {
            id: 2,
            payload: Bytes::new(),
        }));
        assert!(matches!(completion, Completion::Done(_)));

        let mut collected = Vec::new();
        while let Some(chunk) = chunk_rx.recv().await {
            collected.extend_from_slice(&chunk.expect("chunk"));
        }
        assert_eq!(collected, b"hello world");
    }

    #[tokio::test]
    async fn test_download_handler_propagates_errors() {
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel();
        let mut handler = download_handler(chunk_tx);

        let completion = handler(Ok(Frame::Control(
            json!({"id": 2, "error": {"message": "no such file"}}),
        )));
        assert!(matches!(completion, Completion::Failed(_)));

        let received = chunk_rx.recv().await.expect("error delivered");
        assert!(matches!(received, Err(AgentError::Command(_))));
        assert!(chunk_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_download_handler_connection_loss() {
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel();
        let mut handler = download_handler(chunk_tx);

        let completion = handler(Err(AgentError::connection("socket reset")));
        assert!(matches!(completion, Completion::Failed(_)));

        let received = chunk_rx.recv().await.expect("error delivered");
        assert!(matches!(received, Err(AgentError::Connection { .. })));
    }
}
