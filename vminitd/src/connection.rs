//! Per-connection frame loop (spec §6 "Control channel"): reads frames off
//! one accepted socket, routes `RequestChunk`/`RequestChunkEnd` frames to
//! whichever in-flight request they belong to, serializes every outbound
//! frame through a single writer task, and aborts a handler on `Cancel`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};
use vminit_protocol::{read_frame, write_frame, Frame, RequestId, Response};

use crate::dispatcher::Dispatcher;
use crate::transfer::{ChunkReader, ChunkWriter};

/// One in-flight request: its handler task (abortable on `Cancel`) and,
/// when the verb streams request data, the channel feeding it chunk frames.
struct PendingRequest {
    abort: AbortHandle,
    chunk_tx: Option<mpsc::Sender<Frame>>,
}

#[derive(Default)]
struct PendingRequests {
    inner: Mutex<HashMap<RequestId, PendingRequest>>,
}

impl PendingRequests {
    fn insert(&self, id: RequestId, pending: PendingRequest) {
        self.inner.lock().unwrap().insert(id, pending);
    }

    fn remove(&self, id: RequestId) {
        self.inner.lock().unwrap().remove(&id);
    }

    fn route_chunk(&self, frame: Frame) {
        let id = frame.id();
        let chunk_tx = self.inner.lock().unwrap().get(&id).and_then(|p| p.chunk_tx.clone());
        match chunk_tx {
            Some(tx) => {
                if tx.try_send(frame).is_err() {
                    debug!(id, "dropping chunk frame for a request whose reader already finished");
                }
            }
            None => debug!(id, "chunk frame for unknown or non-streaming request"),
        }
    }

    fn cancel(&self, id: RequestId) {
        if let Some(pending) = self.inner.lock().unwrap().get(&id) {
            pending.abort.abort();
        }
    }
}

/// Verbs whose request body streams in as `RequestChunk` frames after the
/// initial `Request` frame (spec §4.10 "Filesystem utilities").
fn wants_request_stream(request: &vminit_protocol::Request) -> bool {
    matches!(
        request,
        vminit_protocol::Request::WriteFile { .. }
            | vminit_protocol::Request::CopyFileIn { .. }
            | vminit_protocol::Request::CopyDirIn { .. }
    )
}

/// Verbs whose response body streams out as `ResponseChunk` frames after
/// the initial `Response` frame.
fn wants_response_stream(request: &vminit_protocol::Request) -> bool {
    matches!(
        request,
        vminit_protocol::Request::CopyFileOut { .. } | vminit_protocol::Request::CopyDirOut { .. }
    )
}

/// Serve one accepted connection until the peer disconnects. Runs the read
/// loop directly; a single writer task drains `outbound` so every response
/// and chunk frame is written in the order it was produced.
pub async fn handle_connection<S>(stream: S, dispatcher: Arc<Dispatcher>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut read_half, write_half) = tokio::io::split(stream);
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Frame>();
    let writer_task = tokio::spawn(run_writer(write_half, outbound_rx));

    let pending = Arc::new(PendingRequests::default());

    loop {
        let frame = match read_frame(&mut read_half).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                warn!("connection read error: {e}");
                break;
            }
        };

        match frame {
            Frame::Request { id, request } => {
                spawn_request(id, request, dispatcher.clone(), pending.clone(), outbound_tx.clone());
            }
            Frame::RequestChunk { .. } | Frame::RequestChunkEnd { .. } => {
                pending.route_chunk(frame);
            }
            Frame::Cancel { id } => {
                pending.cancel(id);
            }
            Frame::Response { .. } | Frame::ResponseChunk { .. } | Frame::ResponseChunkEnd { .. } => {
                warn!("ignoring unexpected response-direction frame from peer");
            }
        }
    }

    drop(outbound_tx);
    let _ = writer_task.await;
}

fn spawn_request(
    id: RequestId,
    request: vminit_protocol::Request,
    dispatcher: Arc<Dispatcher>,
    pending: Arc<PendingRequests>,
    outbound_tx: mpsc::UnboundedSender<Frame>,
) {
    if wants_request_stream(&request) {
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(run_request(id, request, dispatcher, Some(ChunkReader::new(rx)), outbound_tx, pending.clone()));
        pending.insert(id, PendingRequest { abort: handle.abort_handle(), chunk_tx: Some(tx) });
        return;
    }

    let handle = tokio::spawn(run_request(id, request, dispatcher, None, outbound_tx, pending.clone()));
    pending.insert(id, PendingRequest { abort: handle.abort_handle(), chunk_tx: None });
}

async fn run_request(
    id: RequestId,
    request: vminit_protocol::Request,
    dispatcher: Arc<Dispatcher>,
    mut reader: Option<ChunkReader>,
    outbound_tx: mpsc::UnboundedSender<Frame>,
    pending: Arc<PendingRequests>,
) {
    let streams_response = wants_response_stream(&request);
    let writer = streams_response.then(|| ChunkWriter::new(id, outbound_tx.clone()));

    let result = dispatcher.dispatch(request, reader.as_mut(), writer.as_ref()).await;
    let response = match result {
        Ok(response) => response,
        Err(e) => Response::error(e),
    };

    let _ = outbound_tx.send(Frame::Response { id, response });
    pending.remove(id);
}

async fn run_writer<W>(mut writer: W, mut outbound_rx: mpsc::UnboundedReceiver<Frame>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = outbound_rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            warn!("connection write error: {e}");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vminit_protocol::Request;

    #[test]
    fn write_file_and_copy_in_verbs_stream_their_request_body() {
        assert!(wants_request_stream(&Request::WriteFile {
            path: "/tmp/x".into(),
            mode: 0o644,
            flags: Default::default(),
        }));
        assert!(wants_request_stream(&Request::CopyFileIn { path: "/tmp/x".into(), mode: 0o644, create_parents: false }));
        assert!(!wants_request_stream(&Request::Sync));
    }

    #[test]
    fn copy_out_verbs_stream_their_response_body() {
        assert!(wants_response_stream(&Request::CopyFileOut { path: "/tmp/x".into() }));
        assert!(wants_response_stream(&Request::CopyDirOut { path: "/tmp".into() }));
        assert!(!wants_response_stream(&Request::CopyFileIn { path: "/tmp/x".into(), mode: 0o644, create_parents: false }));
    }
}
