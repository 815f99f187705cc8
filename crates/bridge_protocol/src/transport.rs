//! Frame transports between the two contexts.
//!
//! A transport is nothing more than an ordered, reliable pipe of text frames
//! in each direction. Three are provided:
//!
//! * [`duplex`] – two in-process endpoints wired back to back
//! * [`stdio`]  – newline-delimited frames on stdin / stdout (worker process)
//! * [`spawn_child`] – launch a worker binary and talk to its stdio

use std::ffi::OsStr;
use std::process::Stdio;

use anyhow::anyhow;
use tokio::io::{self, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::BusError;

/// Outbound half of a channel. Cheap to clone; sending never blocks.
#[derive(Clone, Debug)]
pub struct FrameSender {
    tx: mpsc::UnboundedSender<String>,
}

impl FrameSender {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }

    pub fn send(&self, frame: String) -> Result<(), BusError> {
        self.tx.send(frame).map_err(|_| BusError::ChannelClosed)
    }
}

/// One side of a channel.
#[derive(Debug)]
pub struct Endpoint {
    pub sender: FrameSender,
    pub receiver: mpsc::UnboundedReceiver<String>,
}

/// Two endpoints wired to each other inside one process.
pub fn duplex() -> (Endpoint, Endpoint) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        Endpoint { sender: FrameSender::new(b_tx), receiver: a_rx },
        Endpoint { sender: FrameSender::new(a_tx), receiver: b_rx },
    )
}

/// Wrap any byte stream pair as a line-framed endpoint. Spawns one writer and
/// one reader task; must be called from within a Tokio runtime.
pub fn lines<R, W>(reader: R, writer: W) -> Endpoint
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let mut w = BufWriter::new(writer);
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = w.write_all(frame.as_bytes()).await {
                error!("frame write error: {e}");
                break;
            }
            if w.write_all(b"\n").await.is_err() || w.flush().await.is_err() {
                error!("frame flush error");
                break;
            }
        }
    });

    let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let mut rdr = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match rdr.read_until(b'\n', &mut buf).await {
                Ok(0) => {
                    debug!("frame reader reached EOF");
                    break;
                }
                Ok(_) => {
                    let line = match std::str::from_utf8(&buf) {
                        Ok(line) => line.trim(),
                        Err(e) => {
                            debug!("dropping frame that is not UTF-8: {e}");
                            continue;
                        }
                    };
                    if line.is_empty() {
                        continue;
                    }
                    if in_tx.send(line.to_owned()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!("frame read error: {e}");
                    break;
                }
            }
        }
    });

    Endpoint { sender: FrameSender::new(out_tx), receiver: in_rx }
}

/// Frames on this process's stdin / stdout. Nothing else may write to stdout.
pub fn stdio() -> Endpoint {
    lines(io::stdin(), io::stdout())
}

/// Launch `program` with piped stdio and return the endpoint talking to it.
/// The child is killed when the returned handle is dropped.
pub fn spawn_child<I, S>(program: impl AsRef<OsStr>, args: I) -> anyhow::Result<(Endpoint, Child)>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;

    let stdin = child.stdin.take().ok_or_else(|| anyhow!("child stdin unavailable"))?;
    let stdout = child.stdout.take().ok_or_else(|| anyhow!("child stdout unavailable"))?;
    Ok((lines(stdout, stdin), child))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{Duration, timeout};

    #[tokio::test]
    async fn duplex_endpoints_see_each_others_frames_in_order() {
        let (mut ui, mut worker) = duplex();
        ui.sender.send("one".into()).unwrap();
        ui.sender.send("two".into()).unwrap();
        worker.sender.send("back".into()).unwrap();

        assert_eq!(worker.receiver.recv().await.unwrap(), "one");
        assert_eq!(worker.receiver.recv().await.unwrap(), "two");
        assert_eq!(ui.receiver.recv().await.unwrap(), "back");
    }

    #[tokio::test]
    async fn send_after_peer_dropped_reports_closed() {
        let (ui, worker) = duplex();
        drop(worker);
        assert_eq!(ui.sender.send("x".into()).unwrap_err(), BusError::ChannelClosed);
    }

    #[tokio::test]
    async fn line_transport_frames_by_newline() {
        let (near, far) = tokio::io::duplex(1024);
        let (near_r, near_w) = tokio::io::split(near);
        let (far_r, far_w) = tokio::io::split(far);
        let a = lines(near_r, near_w);
        let mut b = lines(far_r, far_w);

        a.sender.send(r#"{"status":"lock"}"#.into()).unwrap();
        a.sender.send(r#"{"status":"unlock"}"#.into()).unwrap();

        let first = timeout(Duration::from_secs(1), b.receiver.recv()).await.unwrap();
        let second = timeout(Duration::from_secs(1), b.receiver.recv()).await.unwrap();
        assert_eq!(first.as_deref(), Some(r#"{"status":"lock"}"#));
        assert_eq!(second.as_deref(), Some(r#"{"status":"unlock"}"#));
    }

    #[tokio::test]
    async fn line_transport_skips_non_utf8_lines() {
        let (near, far) = tokio::io::duplex(1024);
        let (far_r, far_w) = tokio::io::split(far);
        let mut b = lines(far_r, far_w);

        let (_near_r, mut near_w) = tokio::io::split(near);
        near_w.write_all(b"\xff\xfe\n").await.unwrap();
        near_w.write_all(b"\n{\"status\":\"lock\"}\r\n").await.unwrap();
        near_w.flush().await.unwrap();

        let frame = timeout(Duration::from_secs(1), b.receiver.recv()).await.unwrap();
        assert_eq!(frame.as_deref(), Some(r#"{"status":"lock"}"#));
    }
}
