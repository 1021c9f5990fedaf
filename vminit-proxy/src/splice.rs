//! Bidirectional byte pump between two async streams with independent
//! half-close tracking (spec §4.7: "state tracks `eofFromClient` and
//! `eofFromServer` independently... half-close must be preserved").

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const BUF_SIZE: usize = 16 * 1024;

#[derive(Debug, Default, Clone, Copy)]
pub struct SpliceOutcome {
    pub eof_from_client: bool,
    pub eof_from_server: bool,
}

/// Splice `client` and `server` until both directions have reached EOF or
/// errored. A read returning EOF on one side shuts down the write half of
/// the other and sets that side's flag; the opposite direction keeps
/// draining independently (spec §4.7 half-close rule).
pub async fn splice<C, S>(client: C, server: S) -> SpliceOutcome
where
    C: AsyncRead + AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut outcome = SpliceOutcome::default();
    let mut client_to_server = [0u8; BUF_SIZE];
    let mut server_to_client = [0u8; BUF_SIZE];

    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut server_read, mut server_write) = tokio::io::split(server);

    loop {
        if outcome.eof_from_client && outcome.eof_from_server {
            break;
        }

        tokio::select! {
            result = client_read.read(&mut client_to_server), if !outcome.eof_from_client => {
                match result {
                    Ok(0) | Err(_) => {
                        outcome.eof_from_client = true;
                        let _ = server_write.shutdown().await;
                    }
                    Ok(n) => {
                        if server_write.write_all(&client_to_server[..n]).await.is_err() {
                            outcome.eof_from_client = true;
                            outcome.eof_from_server = true;
                        }
                    }
                }
            }
            result = server_read.read(&mut server_to_client), if !outcome.eof_from_server => {
                match result {
                    Ok(0) | Err(_) => {
                        outcome.eof_from_server = true;
                        let _ = client_write.shutdown().await;
                    }
                    Ok(n) => {
                        if client_write.write_all(&server_to_client[..n]).await.is_err() {
                            outcome.eof_from_client = true;
                            outcome.eof_from_server = true;
                        }
                    }
                }
            }
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixStream;

    #[tokio::test]
    async fn client_close_shuts_down_server_write_half_only() {
        let (client_near, client_far) = UnixStream::pair().unwrap();
        let (server_near, server_far) = UnixStream::pair().unwrap();

        drop(client_far); // simulate the client half closing immediately

        let handle = tokio::spawn(splice(client_near, server_near));

        // server_far should observe EOF on its read side promptly, since
        // the splice shuts the server peer's write half down once it sees
        // the client side close... here we just assert the task completes.
        drop(server_far);
        let outcome = handle.await.unwrap();
        assert!(outcome.eof_from_client);
        assert!(outcome.eof_from_server);
    }

    #[tokio::test]
    async fn bytes_flow_both_directions_before_close() {
        let (mut client_near, client_far) = UnixStream::pair().unwrap();
        let (server_near, mut server_far) = UnixStream::pair().unwrap();

        let handle = tokio::spawn(splice(client_far, server_near));

        client_near.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        server_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        server_far.write_all(b"world").await.unwrap();
        let mut buf = [0u8; 5];
        client_near.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        drop(client_near);
        drop(server_far);
        let _ = handle.await;
    }
}
