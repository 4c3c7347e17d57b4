//! Agent side of one multiplexed stream.
//!
//! The stream is dialled lazily when the relay sends its first frame. Bytes
//! the relay sends while the dial is still retrying queue up and are written
//! in order once the local service accepts.

use crate::config::DialPolicy;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use wgt_common::envelope::DataFrame;
use wgt_common::{ControlMessage, FrameCipher, StreamId};

/// Chunk size for reads from the local service.
const READ_CHUNK: usize = 16 * 1024;

/// Queue depth between the session loop and one stream task.
pub const STREAM_QUEUE: usize = 1024;

/// Dials `target`, retrying only while the service refuses connections.
///
/// # Errors
///
/// Returns the last error once attempts are exhausted, or the first error
/// that is not `ConnectionRefused`.
pub async fn dial(target: &str, policy: DialPolicy) -> io::Result<TcpStream> {
    let mut attempt = 1;
    loop {
        match TcpStream::connect(target).await {
            Ok(stream) => return Ok(stream),
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused && attempt < policy.max_attempts => {
                debug!(target, attempt, "local service refused, retrying");
                attempt += 1;
                tokio::time::sleep(policy.retry_delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Runs one stream until either side ends it.
///
/// `inbound` carries decrypted bytes from the relay; it closing means the
/// relay (or the session) already dropped the stream. Every other exit tells
/// the relay with a `close` envelope.
pub async fn run_stream(
    id: StreamId,
    target: String,
    policy: DialPolicy,
    cipher: Arc<FrameCipher>,
    mut inbound: mpsc::Receiver<Vec<u8>>,
    outbound: mpsc::Sender<ControlMessage>,
) {
    let stream = match dial(&target, policy).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(stream_id = id, target = %target, error = %e, "local dial failed, dropping stream");
            let _ = outbound.send(ControlMessage::Close { id }).await;
            return;
        }
    };
    debug!(stream_id = id, target = %target, "local connection established");

    let (mut reader, mut writer) = stream.into_split();
    let mut buf = vec![0u8; READ_CHUNK];

    let notify_relay = loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => break true,
                Ok(n) => {
                    let frame = match cipher.encrypt(&buf[..n]) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(stream_id = id, error = %e, "encryption failed");
                            break true;
                        }
                    };
                    let msg = ControlMessage::Data(DataFrame::new(id, &frame));
                    if outbound.send(msg).await.is_err() {
                        break false;
                    }
                }
                Err(e) => {
                    debug!(stream_id = id, error = %e, "local read failed");
                    break true;
                }
            },
            msg = inbound.recv() => match msg {
                Some(bytes) => {
                    if let Err(e) = writer.write_all(&bytes).await {
                        debug!(stream_id = id, error = %e, "local write failed");
                        break true;
                    }
                }
                None => break false,
            },
        }
    };

    let _ = writer.shutdown().await;
    if notify_relay {
        let _ = outbound.send(ControlMessage::Close { id }).await;
    }
    debug!(stream_id = id, "stream closed");
}
