//! Stream multiplexer.
//!
//! Owns the registry of forwarded public connections. Each registered stream
//! runs in its own task that buffers the first burst of bytes, then turns
//! every local read into one encrypted [`DataFrame`] for the agent and writes
//! frames coming back from the agent to the local connection in order.
//!
//! Removing a stream's registry entry drops its inbound sender; the task
//! drains what was already queued, then closes the local connection. That is
//! the only teardown path, so timers can never fire against a removed stream.

use crate::config::StreamPolicy;
use crate::error::RelayError;
use crate::metrics::{counters, gauges};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use wgt_common::envelope::DataFrame;
use wgt_common::{ControlMessage, FrameCipher, StreamId};

/// Frames queued towards one local connection before it counts as stalled.
const INBOUND_QUEUE: usize = 1024;

#[derive(Debug)]
struct StreamHandle {
    tx: mpsc::Sender<Vec<u8>>,
    opened_at: Instant,
}

/// Why a stream task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    LocalEof,
    LocalError,
    Overflow,
    Idle,
    Removed,
    ChannelGone,
    Encryption,
}

impl StreamEnd {
    const fn reason(self) -> &'static str {
        match self {
            Self::LocalEof => "local_eof",
            Self::LocalError => "local_error",
            Self::Overflow => "overflow",
            Self::Idle => "idle",
            Self::Removed => "removed",
            Self::ChannelGone => "channel_gone",
            Self::Encryption => "encryption",
        }
    }

    /// The agent only learns about ends it could not have caused itself.
    const fn notifies_agent(self) -> bool {
        matches!(
            self,
            Self::LocalEof | Self::LocalError | Self::Idle | Self::Encryption
        )
    }
}

/// Registry of forwarded connections multiplexed over the control channel.
#[derive(Debug)]
pub struct StreamMux {
    streams: DashMap<StreamId, StreamHandle>,
    next_id: AtomicU32,
    policy: StreamPolicy,
    cipher: Arc<FrameCipher>,
}

impl StreamMux {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(policy: StreamPolicy, cipher: Arc<FrameCipher>) -> Self {
        Self {
            streams: DashMap::new(),
            next_id: AtomicU32::new(1),
            policy,
            cipher,
        }
    }

    /// Registers `local` as a new stream and starts forwarding it.
    ///
    /// `initial` holds the bytes already read from the connection; they are
    /// buffered together with anything else arriving within the flush delay
    /// and sent as the stream's first frame.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InitBufferOverflow`] if `initial` alone exceeds
    /// the buffering ceiling. The connection is dropped without registration.
    pub fn open_stream<S>(
        self: &Arc<Self>,
        local: S,
        initial: Vec<u8>,
        outbound: mpsc::Sender<ControlMessage>,
    ) -> Result<StreamId, RelayError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if initial.len() > self.policy.max_init_buffer {
            counters::streams_closed_total(StreamEnd::Overflow.reason());
            return Err(RelayError::InitBufferOverflow {
                id: 0,
                limit: self.policy.max_init_buffer,
            });
        }

        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        let opened_at = Instant::now();
        let id = self.allocate(&tx, opened_at);

        counters::streams_opened_total();
        gauges::set_streams_active(self.streams.len());
        tracing::debug!(stream_id = id, initial = initial.len(), "stream opened");

        let mux = Arc::clone(self);
        tokio::spawn(async move {
            mux.run_stream(id, local, initial, rx, outbound, opened_at)
                .await;
        });
        Ok(id)
    }

    // Ids wrap around; 0 is reserved as "no stream" and live ids are skipped.
    fn allocate(&self, tx: &mpsc::Sender<Vec<u8>>, opened_at: Instant) -> StreamId {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id == 0 {
                continue;
            }
            if let Entry::Vacant(slot) = self.streams.entry(id) {
                slot.insert(StreamHandle {
                    tx: tx.clone(),
                    opened_at,
                });
                return id;
            }
        }
    }

    async fn run_stream<S>(
        self: Arc<Self>,
        id: StreamId,
        local: S,
        initial: Vec<u8>,
        mut inbound: mpsc::Receiver<Vec<u8>>,
        outbound: mpsc::Sender<ControlMessage>,
        opened_at: Instant,
    ) where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(local);
        let mut pending = Some(initial);
        let mut sent_any = false;
        let mut idle_armed = true;
        let mut buf = vec![0u8; self.policy.read_chunk];

        let flush = tokio::time::sleep(self.policy.flush_delay);
        let idle = tokio::time::sleep(self.policy.idle_timeout);
        tokio::pin!(flush);
        tokio::pin!(idle);

        let end = loop {
            tokio::select! {
                () = &mut flush, if pending.is_some() => {
                    if let Some(bytes) = pending.take() {
                        if let Err(end) = self.send_frame(id, &bytes, &outbound).await {
                            break end;
                        }
                        sent_any = true;
                    }
                }
                () = &mut idle, if idle_armed => break StreamEnd::Idle,
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        if let Some(bytes) = pending.take() {
                            if self.send_frame(id, &bytes, &outbound).await.is_ok() {
                                sent_any = true;
                            }
                        }
                        break StreamEnd::LocalEof;
                    }
                    Ok(n) => {
                        idle_armed = false;
                        if let Some(buffered) = pending.as_mut() {
                            if buffered.len() + n > self.policy.max_init_buffer {
                                tracing::warn!(
                                    stream_id = id,
                                    limit = self.policy.max_init_buffer,
                                    "initial buffer overflow"
                                );
                                break StreamEnd::Overflow;
                            }
                            buffered.extend_from_slice(&buf[..n]);
                        } else {
                            if let Err(end) = self.send_frame(id, &buf[..n], &outbound).await {
                                break end;
                            }
                            sent_any = true;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(stream_id = id, error = %e, "local read failed");
                        break StreamEnd::LocalError;
                    }
                },
                msg = inbound.recv() => match msg {
                    Some(bytes) => {
                        idle_armed = false;
                        if let Err(e) = writer.write_all(&bytes).await {
                            tracing::debug!(stream_id = id, error = %e, "local write failed");
                            break StreamEnd::LocalError;
                        }
                    }
                    None => break StreamEnd::Removed,
                },
            }
        };

        let _ = writer.shutdown().await;
        self.streams.remove_if(&id, |_, h| h.opened_at == opened_at);
        if end.notifies_agent() && sent_any {
            // Best effort: a full or closed channel has nobody to tell.
            let _ = outbound.try_send(ControlMessage::Close { id });
        }

        counters::streams_closed_total(end.reason());
        gauges::set_streams_active(self.streams.len());
        tracing::debug!(stream_id = id, reason = end.reason(), "stream closed");
    }

    async fn send_frame(
        &self,
        id: StreamId,
        bytes: &[u8],
        outbound: &mpsc::Sender<ControlMessage>,
    ) -> Result<(), StreamEnd> {
        let frame = self.cipher.encrypt(bytes).map_err(|e| {
            tracing::warn!(stream_id = id, error = %e, "frame encryption failed");
            StreamEnd::Encryption
        })?;
        counters::frames_total("out");
        counters::payload_bytes_total("out", bytes.len() as u64);
        outbound
            .send(ControlMessage::Data(DataFrame::new(id, &frame)))
            .await
            .map_err(|_| StreamEnd::ChannelGone)
    }

    /// Opens an encrypted frame from the agent and delivers it to its stream.
    ///
    /// Frames for id `0` or for streams that are no longer registered are
    /// dropped silently.
    ///
    /// # Errors
    ///
    /// A frame that cannot be decoded or authenticated terminates its stream
    /// and is reported as [`RelayError::Envelope`] or [`RelayError::Cipher`];
    /// the caller should tell the agent the stream is gone.
    pub fn on_remote_frame(&self, data: &DataFrame) -> Result<(), RelayError> {
        if data.id == 0 || !self.contains(data.id) {
            counters::frames_dropped_total("unknown_stream");
            return Ok(());
        }
        counters::frames_total("in");

        let plaintext = data
            .frame()
            .map_err(RelayError::from)
            .and_then(|frame| self.cipher.decrypt(&frame).map_err(RelayError::from));

        match plaintext {
            Ok(bytes) => {
                self.on_remote_data(data.id, bytes);
                Ok(())
            }
            Err(e) => {
                counters::auth_failures_total();
                tracing::warn!(stream_id = data.id, error = %e, "rejecting frame, closing stream");
                self.close_stream(data.id);
                Err(e)
            }
        }
    }

    /// Queues plaintext bytes for a stream's local connection.
    ///
    /// Returns `false` if the stream is unknown or was torn down because its
    /// local side stopped consuming.
    pub fn on_remote_data(&self, id: StreamId, bytes: Vec<u8>) -> bool {
        let Some(tx) = self.streams.get(&id).map(|h| h.tx.clone()) else {
            return false;
        };
        let len = bytes.len() as u64;
        match tx.try_send(bytes) {
            Ok(()) => {
                counters::payload_bytes_total("in", len);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(stream_id = id, "local connection stalled, closing stream");
                counters::frames_dropped_total("stalled");
                self.close_stream(id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Removes a stream; its task closes the local connection after writing
    /// whatever was already queued. Returns `false` for unknown ids.
    pub fn close_stream(&self, id: StreamId) -> bool {
        self.streams.remove(&id).is_some()
    }

    /// Removes every stream. Returns how many were registered.
    pub fn close_all(&self) -> usize {
        let count = self.streams.len();
        self.streams.clear();
        gauges::set_streams_active(0);
        count
    }

    /// Number of registered streams.
    #[must_use]
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Returns `true` if no stream is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Returns `true` if `id` is registered.
    #[must_use]
    pub fn contains(&self, id: StreamId) -> bool {
        self.streams.contains_key(&id)
    }
}
