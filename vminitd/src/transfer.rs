//! Chunked file/directory copy (spec §4.10 "Filesystem utilities": "stream-
//! copy files in... and out...", "Directory copy is tar-based"). Works in
//! terms of the `*Chunk`/`*ChunkEnd` frames [`crate::connection`] routes to
//! and from one in-flight request, independent of the framing/dispatch
//! plumbing itself.

use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use vminit_common::{AgentError, ErrorKind};
use vminit_protocol::{Frame, RequestId};

use crate::fsutil;

/// Spec §4.10: "Chunk size is one mebibyte."
const CHUNK_SIZE: usize = 1024 * 1024;

/// The receiving half of one request's inbound data chunks, fed by
/// [`crate::connection`] as `RequestChunk`/`RequestChunkEnd` frames arrive
/// for this request's id.
pub struct ChunkReader {
    rx: mpsc::Receiver<Frame>,
}

impl ChunkReader {
    pub fn new(rx: mpsc::Receiver<Frame>) -> Self {
        Self { rx }
    }

    /// Drain every remaining chunk into one buffer (used by `WriteFile`,
    /// whose whole body arrives as a chunk stream rather than a single
    /// frame field).
    pub async fn collect_all(&mut self) -> Result<Vec<u8>, AgentError> {
        let mut buf = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            buf.extend(chunk);
        }
        Ok(buf)
    }

    /// The next data chunk, or `None` once the terminating `ChunkEnd`
    /// arrives or the connection drops the sender.
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, AgentError> {
        match self.rx.recv().await {
            Some(Frame::RequestChunk { data, .. }) => Ok(Some(data)),
            Some(Frame::RequestChunkEnd { .. }) | None => Ok(None),
            Some(other) => Err(AgentError::new(
                ErrorKind::InvalidArgument,
                "ChunkReader::next_chunk",
                format!("unexpected frame {other:?} while streaming request chunks"),
            )),
        }
    }
}

/// The sending half of one request's outbound data chunks.
#[derive(Clone)]
pub struct ChunkWriter {
    id: RequestId,
    tx: mpsc::UnboundedSender<Frame>,
}

impl ChunkWriter {
    pub fn new(id: RequestId, tx: mpsc::UnboundedSender<Frame>) -> Self {
        Self { id, tx }
    }

    fn send_chunk(&self, data: Vec<u8>) -> Result<(), AgentError> {
        self.tx
            .send(Frame::ResponseChunk { id: self.id, data })
            .map_err(|_| AgentError::new(ErrorKind::Internal, "ChunkWriter::send_chunk", "connection writer gone"))
    }

    pub fn finish(&self) -> Result<(), AgentError> {
        self.tx
            .send(Frame::ResponseChunkEnd { id: self.id })
            .map_err(|_| AgentError::new(ErrorKind::Internal, "ChunkWriter::finish", "connection writer gone"))
    }
}

/// Receive a single file's bytes from a chunk stream and write it to
/// `path` (spec §4.10: "init chunk declares path, mode, create-parents;
/// data chunks follow").
pub async fn receive_file(path: &Path, mode: u32, create_parents: bool, reader: &mut ChunkReader) -> Result<(), AgentError> {
    if create_parents {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| AgentError::from_errno("transfer::receive_file", e))?;
        }
    }

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .await
        .map_err(|e| AgentError::from_errno("transfer::receive_file", e))?;

    while let Some(chunk) = reader.next_chunk().await? {
        file.write_all(&chunk).await.map_err(|e| AgentError::from_errno("transfer::receive_file", e))?;
    }
    file.flush().await.map_err(|e| AgentError::from_errno("transfer::receive_file", e))?;
    drop(file);

    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(|e| AgentError::from_errno("transfer::receive_file", e))
}

/// Stream `path`'s bytes out in mebibyte chunks, returning the total byte
/// count reported up front in the `FileSize` response (spec §4.10: "out
/// (init chunk declares total size)").
pub async fn send_file(path: &Path, writer: &ChunkWriter) -> Result<u64, AgentError> {
    let mut file = tokio::fs::File::open(path).await.map_err(|e| AgentError::from_errno("transfer::send_file", e))?;
    let total = file.metadata().await.map_err(|e| AgentError::from_errno("transfer::send_file", e))?.len();

    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await.map_err(|e| AgentError::from_errno("transfer::send_file", e))?;
        if n == 0 {
            break;
        }
        writer.send_chunk(buf[..n].to_vec())?;
    }
    writer.finish()?;
    Ok(total)
}

/// Receive a tar stream into a temp file, then extract it into `dest_dir`
/// (spec §4.10: "in-copy assembles a temp archive then extracts").
pub async fn receive_directory(dest_dir: &Path, reader: &mut ChunkReader) -> Result<(), AgentError> {
    let temp = tempfile::NamedTempFile::new().map_err(|e| AgentError::from_errno("transfer::receive_directory", e))?;
    let mut file = tokio::fs::File::from_std(temp.reopen().map_err(|e| AgentError::from_errno("transfer::receive_directory", e))?);

    while let Some(chunk) = reader.next_chunk().await? {
        file.write_all(&chunk).await.map_err(|e| AgentError::from_errno("transfer::receive_directory", e))?;
    }
    file.flush().await.map_err(|e| AgentError::from_errno("transfer::receive_directory", e))?;
    drop(file);

    fsutil::untar_directory(temp.path().to_path_buf(), dest_dir.to_path_buf()).await
}

/// Tar `source_dir` into a temp file, then stream its bytes out (spec
/// §4.10: "out-copy tars the source then streams the bytes").
pub async fn send_directory(source_dir: &Path, writer: &ChunkWriter) -> Result<u64, AgentError> {
    let archive = fsutil::tar_directory(source_dir.to_path_buf()).await?;
    send_file(archive.path(), writer).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_pair(id: RequestId) -> (mpsc::Sender<Frame>, ChunkReader, mpsc::UnboundedReceiver<Frame>, ChunkWriter) {
        let (req_tx, req_rx) = mpsc::channel(8);
        let (resp_tx, resp_rx) = mpsc::unbounded_channel();
        (req_tx, ChunkReader::new(req_rx), resp_rx, ChunkWriter::new(id, resp_tx))
    }

    #[tokio::test]
    async fn receive_file_writes_all_chunks_until_end() {
        let (tx, mut reader, _resp_rx, _writer) = chunk_pair(1);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");

        let handle = tokio::spawn(async move { receive_file(&path, 0o644, false, &mut reader).await.map(|_| path) });

        tx.send(Frame::RequestChunk { id: 1, data: b"hello ".to_vec() }).await.unwrap();
        tx.send(Frame::RequestChunk { id: 1, data: b"world".to_vec() }).await.unwrap();
        tx.send(Frame::RequestChunkEnd { id: 1 }).await.unwrap();

        let path = handle.await.unwrap().unwrap();
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, "hello world");
    }

    #[tokio::test]
    async fn collect_all_concatenates_chunks_in_order() {
        let (tx, mut reader, _resp_rx, _writer) = chunk_pair(2);
        tx.send(Frame::RequestChunk { id: 2, data: b"ab".to_vec() }).await.unwrap();
        tx.send(Frame::RequestChunk { id: 2, data: b"cd".to_vec() }).await.unwrap();
        tx.send(Frame::RequestChunkEnd { id: 2 }).await.unwrap();
        assert_eq!(reader.collect_all().await.unwrap(), b"abcd".to_vec());
    }

    #[tokio::test]
    async fn send_file_reports_total_then_chunks_then_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.bin");
        tokio::fs::write(&path, b"some bytes").await.unwrap();

        let (_tx, _reader, mut resp_rx, writer) = chunk_pair(7);
        let total = send_file(&path, &writer).await.unwrap();
        assert_eq!(total, 10);

        match resp_rx.recv().await.unwrap() {
            Frame::ResponseChunk { id, data } => {
                assert_eq!(id, 7);
                assert_eq!(data, b"some bytes");
            }
            other => panic!("unexpected frame {other:?}"),
        }
        assert!(matches!(resp_rx.recv().await.unwrap(), Frame::ResponseChunkEnd { id: 7 }));
    }

    #[tokio::test]
    async fn directory_round_trips_through_tar_chunks() {
        let src = tempfile::tempdir().unwrap();
        tokio::fs::create_dir(src.path().join("sub")).await.unwrap();
        tokio::fs::write(src.path().join("sub/a.txt"), b"data").await.unwrap();

        let (_tx, _reader, mut resp_rx, writer) = chunk_pair(3);
        send_directory(src.path(), &writer).await.unwrap();

        let mut archive_bytes = Vec::new();
        while let Some(frame) = resp_rx.recv().await {
            match frame {
                Frame::ResponseChunk { data, .. } => archive_bytes.extend(data),
                Frame::ResponseChunkEnd { .. } => break,
                other => panic!("unexpected frame {other:?}"),
            }
        }

        let archive_path = src.path().join("reassembled.tar");
        tokio::fs::write(&archive_path, &archive_bytes).await.unwrap();
        let dest = tempfile::tempdir().unwrap();
        fsutil::untar_directory(archive_path, dest.path().to_path_buf()).await.unwrap();
        let round_tripped = tokio::fs::read_to_string(dest.path().join("sub/a.txt")).await.unwrap();
        assert_eq!(round_tripped, "data");
    }
}
