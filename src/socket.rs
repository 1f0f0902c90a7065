//! Transport plumbing for session pipelines
//!
//! A session splits each `TcpStream` into an owned read half driven by
//! [`read_loop`] and an owned write half driven by [`write_loop`]. The
//! loops own the blocking awaits; the session task only sees completion
//! events. Reads are pull-based: one permit buys one read, so a paused
//! direction simply stops receiving permits.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

/// Scratch size for a single read
pub const READ_CHUNK: usize = 32 * 1024;

/// Completion of one permitted read
#[derive(Debug)]
pub enum ReadEvent {
    Data(Vec<u8>),
    Eof,
    Error(io::Error),
}

/// Work for a write loop
#[derive(Debug)]
pub enum WriteJob {
    /// Write the whole payload or fail
    Data(Vec<u8>),
    /// Send FIN and stop
    Shutdown,
}

/// Arm SO_LINGER(0) so the eventual close emits RST instead of FIN
pub fn force_reset(stream: &TcpStream) {
    let _ = stream.set_linger(Some(Duration::ZERO));
}

/// Drive reads for one transport half
///
/// Waits for a permit, performs one read into a fresh scratch, emits the
/// completion, repeats. Exits on EOF, error, closed permit channel, or
/// the cancel signal (which also interrupts an in-flight read).
pub async fn read_loop<F>(
    mut rd: OwnedReadHalf,
    mut permits: mpsc::UnboundedReceiver<()>,
    mut cancel: watch::Receiver<bool>,
    emit: F,
) where
    F: Fn(ReadEvent) + Send + 'static,
{
    let mut scratch = vec![0u8; READ_CHUNK];
    loop {
        tokio::select! {
            permit = permits.recv() => {
                if permit.is_none() {
                    return;
                }
            }
            _ = cancel.wait_for(|c| *c) => return,
        }

        tokio::select! {
            res = rd.read(&mut scratch) => match res {
                Ok(0) => {
                    emit(ReadEvent::Eof);
                    return;
                }
                Ok(n) => emit(ReadEvent::Data(scratch[..n].to_vec())),
                Err(e) => {
                    emit(ReadEvent::Error(e));
                    return;
                }
            },
            _ = cancel.wait_for(|c| *c) => return,
        }
    }
}

/// Drive writes for one transport half
///
/// One job at a time; `Data` writes the full payload (`write_all`) and
/// emits the byte count or the error. The reset signal preempts queued
/// work, arms SO_LINGER(0) and forgets the half so no FIN is sent.
pub async fn write_loop<F>(
    mut wr: OwnedWriteHalf,
    mut jobs: mpsc::UnboundedReceiver<WriteJob>,
    mut reset: watch::Receiver<bool>,
    emit: F,
) where
    F: Fn(io::Result<usize>) + Send + 'static,
{
    enum Woken {
        Reset(Result<(), watch::error::RecvError>),
        Job(Option<WriteJob>),
    }

    loop {
        let woken = tokio::select! {
            res = reset.wait_for(|r| *r) => Woken::Reset(res.map(|_| ())),
            job = jobs.recv() => Woken::Job(job),
        };
        match woken {
            Woken::Reset(res) => {
                if res.is_ok() {
                    force_reset(wr.as_ref());
                    wr.forget();
                }
                return;
            }
            Woken::Job(Some(WriteJob::Data(data))) => {
                let res = tokio::select! {
                    r = reset.wait_for(|r| *r) => {
                        if r.is_ok() {
                            force_reset(wr.as_ref());
                            wr.forget();
                        }
                        return;
                    }
                    w = wr.write_all(&data) => w,
                };
                let failed = res.is_err();
                emit(res.map(|_| data.len()));
                if failed {
                    return;
                }
            }
            Woken::Job(Some(WriteJob::Shutdown)) => {
                let _ = wr.shutdown().await;
                return;
            }
            Woken::Job(None) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_read_loop_waits_for_permits() {
        let (client, server) = socket_pair().await;
        let (rd, _wr) = server.into_split();
        let (permit_tx, permit_rx) = mpsc::unbounded_channel();
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();

        tokio::spawn(read_loop(rd, permit_rx, cancel_rx, move |ev| {
            let _ = event_tx.send(ev);
        }));

        let mut client = client;
        client.write_all(b"hello").await.unwrap();

        // nothing is read until a permit is granted
        assert!(
            tokio::time::timeout(Duration::from_millis(50), event_rx.recv())
                .await
                .is_err()
        );

        permit_tx.send(()).unwrap();
        match event_rx.recv().await.unwrap() {
            ReadEvent::Data(d) => assert_eq!(d, b"hello"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_read_loop_reports_eof() {
        let (client, server) = socket_pair().await;
        let (rd, _wr) = server.into_split();
        let (permit_tx, permit_rx) = mpsc::unbounded_channel();
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();

        tokio::spawn(read_loop(rd, permit_rx, cancel_rx, move |ev| {
            let _ = event_tx.send(ev);
        }));

        permit_tx.send(()).unwrap();
        drop(client);
        assert!(matches!(event_rx.recv().await.unwrap(), ReadEvent::Eof));
    }

    #[tokio::test]
    async fn test_write_loop_writes_and_shuts_down() {
        let (mut client, server) = socket_pair().await;
        let (_rd, wr) = server.into_split();
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let (_reset_tx, reset_rx) = watch::channel(false);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(wr, job_rx, reset_rx, move |res| {
            let _ = done_tx.send(res);
        }));

        job_tx.send(WriteJob::Data(b"WORLD".to_vec())).unwrap();
        assert_eq!(done_rx.recv().await.unwrap().unwrap(), 5);

        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"WORLD");

        job_tx.send(WriteJob::Shutdown).unwrap();
        // FIN arrives as EOF on the peer
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_write_loop_reset_preempts() {
        let (mut client, server) = socket_pair().await;
        let (rd, wr) = server.into_split();
        let (_job_tx, job_rx) = mpsc::unbounded_channel::<WriteJob>();
        let (reset_tx, reset_rx) = watch::channel(false);

        let handle = tokio::spawn(write_loop(wr, job_rx, reset_rx, |_res| {}));
        reset_tx.send(true).unwrap();
        handle.await.unwrap();

        // dropping the read half closes the lingered socket
        drop(rd);
        let mut buf = [0u8; 1];
        match client.read(&mut buf).await {
            Ok(0) | Err(_) => {}
            Ok(n) => panic!("unexpected {n} bytes after reset"),
        }
    }
}
