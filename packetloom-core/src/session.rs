//! Per-remote-endpoint state: key schedule, stream registry, dispatch.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, Notify};
use tracing::{debug, trace};

use crate::crypto::{derive_public_key, Aead256, KEY_LEN};
use crate::error::{Error, Result};
use crate::frame::{Frame, Handshake};
use crate::mux::MuxInner;
use crate::packet::{Packet, PacketType, MAX_PACKET_SIZE};
use crate::stream::Stream;

impl SessionInner {
    fn next_sequence(&self) -> Result<u32> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::AcqRel);
        if sequence == u32::MAX {
            self.terminated.store(true, Ordering::Release);
            return Err(Error::SequenceExhausted);
        }
        Ok(sequence)
    }

    async fn write_datagram(&self, buf: &[u8]) -> Result<()> {
        let mux = self.mux.upgrade().ok_or(Error::MuxClosed)?;
        mux.write_to(self.remote_addr, buf).await
    }

    /// Atomically assigns the next sequence, encrypts `frame` into an
    /// opaque `Crypto` body, wraps it in a `Stream`-type packet, and
    /// writes one datagram.
    pub(crate) async fn send(&self, frame: Frame) -> Result<()> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(Error::SessionClosed);
        }

        let sequence = self.next_sequence()?;
        let plaintext = frame.encode_tagged()?;
        let ciphertext = self.aead.seal(sequence, &plaintext)?;

        let packet = Packet::new(PacketType::Stream, self.connection_id, sequence, Some(Frame::Crypto(ciphertext)));
        let buf = packet.encode()?;
        self.write_datagram(&buf).await
    }

    /// Increments the owning Mux's `streams_active` gauge. Called once per
    /// stream registered into `self.streams`.
    pub(crate) fn note_stream_added(&self) {
        if let Some(mux) = self.mux.upgrade() {
            mux.metrics().streams_active.inc();
        }
    }

    /// Decrements the owning Mux's `streams_active` gauge. Called once per
    /// stream removed from `self.streams`, mirroring `note_stream_added`.
    pub(crate) fn note_stream_removed(&self) {
        if let Some(mux) = self.mux.upgrade() {
            mux.metrics().streams_active.dec();
        }
    }
}

/// Reserved, never allocated to an application stream.
const RESERVED_STREAM_ID: u32 = 0;

pub(crate) struct SessionInner {
    connection_id: u64,
    remote_addr: SocketAddr,
    aead: Aead256,
    next_sequence: AtomicU32,
    /// Even ids for the session initiator, odd for the acceptor.
    next_local_stream_id: AtomicU32,
    pub(crate) streams: RwLock<HashMap<u32, Stream>>,
    pending_opens: Mutex<HashMap<u32, oneshot::Sender<Stream>>>,
    accept_tx: mpsc::UnboundedSender<Stream>,
    accept_rx: AsyncMutex<mpsc::UnboundedReceiver<Stream>>,
    terminated: AtomicBool,
    mux: Weak<MuxInner>,
    buffer_capacity: u64,
    /// Safe per-chunk payload size for new streams. Starts at a value that
    /// is safe against `MAX_PACKET_SIZE`-sized datagrams and is narrowed
    /// down once the peer's Handshake is observed.
    peer_max_frame_size: AtomicUsize,
    retransmit_timeout: Duration,
    shutdown: Notify,
}

/// A per-remote-endpoint logical connection, multiplexed over a [`Mux`]'s
/// shared socket.
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<SessionInner>,
}

impl Session {
    pub(crate) fn new(
        connection_id: u64,
        remote_addr: SocketAddr,
        key: &[u8; KEY_LEN],
        is_initiator: bool,
        buffer_capacity: u64,
        retransmit_timeout: Duration,
        mux: Weak<MuxInner>,
    ) -> Self {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(SessionInner {
                connection_id,
                remote_addr,
                aead: Aead256::new(key),
                next_sequence: AtomicU32::new(0),
                next_local_stream_id: AtomicU32::new(if is_initiator { 2 } else { 1 }),
                streams: RwLock::new(HashMap::new()),
                pending_opens: Mutex::new(HashMap::new()),
                accept_tx,
                accept_rx: AsyncMutex::new(accept_rx),
                terminated: AtomicBool::new(false),
                mux,
                buffer_capacity,
                peer_max_frame_size: AtomicUsize::new(MAX_PACKET_SIZE),
                retransmit_timeout,
                shutdown: Notify::new(),
            }),
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.inner.connection_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    pub fn is_closed(&self) -> bool {
        self.inner.terminated.load(Ordering::Acquire)
    }

    /// Builds and sends this session's own Handshake frame, advertising
    /// `buffer_capacity` and the (unmixed) X25519 public key derived from
    /// the pre-shared key. See DESIGN.md for why the public key is never
    /// folded into the AEAD key.
    pub(crate) async fn send_handshake(&self, key: &[u8; KEY_LEN]) -> Result<()> {
        let public_key = derive_public_key(key);
        let handshake = Handshake::new(self.inner.buffer_capacity, public_key);
        let sequence = self.next_sequence()?;
        let packet = Packet::new(
            PacketType::Handshake,
            self.inner.connection_id,
            sequence,
            Some(Frame::Handshake(handshake)),
        );
        let buf = packet.encode()?;
        self.write_datagram(&buf).await
    }

    /// Records a peer's advertised handshake. Only `max_frame_size` (the
    /// observed padding length) feeds the chunk-size calculation for
    /// streams opened from this point on; earlier streams keep whatever
    /// chunk size they were constructed with.
    pub(crate) fn observe_handshake(&self, handshake: &Handshake) {
        if let Some(peer_max) = handshake.max_frame_size {
            let candidate = peer_max.min(MAX_PACKET_SIZE);
            self.inner.peer_max_frame_size.fetch_min(candidate.max(1), Ordering::AcqRel);
            trace!(connection_id = self.inner.connection_id, peer_max, "observed peer handshake");
        }
    }

    fn alloc_local_stream_id(&self) -> Result<u32> {
        let id = self.inner.next_local_stream_id.fetch_add(2, Ordering::AcqRel);
        if id == RESERVED_STREAM_ID || id > u32::MAX - 2 {
            self.inner.terminated.store(true, Ordering::Release);
            return Err(Error::StreamsExhausted);
        }
        Ok(id)
    }

    fn next_sequence(&self) -> Result<u32> {
        self.inner.next_sequence()
    }

    async fn write_datagram(&self, buf: &[u8]) -> Result<()> {
        self.inner.write_datagram(buf).await
    }

    /// Atomically assigns the next sequence, encrypts `frame` into an
    /// opaque `Crypto` body, wraps it in a `Stream`-type packet, and
    /// writes one datagram.
    pub(crate) async fn send(&self, frame: Frame) -> Result<()> {
        self.inner.send(frame).await
    }

    /// Decrypts a `Crypto` frame's ciphertext body using this session's
    /// AEAD and sequence-derived nonce, returning the inner frame.
    pub(crate) fn decrypt(&self, sequence: u32, ciphertext: &[u8]) -> Result<Frame> {
        let plaintext = self.inner.aead.open(sequence, ciphertext)?;
        Frame::decode_tagged(&plaintext)
    }

    fn max_frame_size(&self) -> usize {
        self.inner.peer_max_frame_size.load(Ordering::Acquire)
    }

    fn make_stream(&self, id: u32) -> Stream {
        Stream::new(
            id,
            Arc::downgrade(&self.inner),
            self.inner.buffer_capacity as usize,
            self.max_frame_size(),
            self.inner.retransmit_timeout,
        )
    }

    /// Opens a new stream: allocates a local id, registers a one-shot
    /// waiter, emits `StreamOpen`, and blocks until the peer's `StreamAck`
    /// arrives or the session closes.
    pub async fn open_stream(&self) -> Result<Stream> {
        if self.inner.terminated.load(Ordering::Acquire) {
            return Err(Error::SessionClosed);
        }

        let stream_id = self.alloc_local_stream_id()?;
        let (tx, rx) = oneshot::channel();
        self.inner.pending_opens.lock().insert(stream_id, tx);

        if let Err(err) = self.send(Frame::StreamOpen { stream_id }).await {
            self.inner.pending_opens.lock().remove(&stream_id);
            return Err(err);
        }

        tokio::select! {
            biased;
            _ = self.inner.shutdown.notified() => {
                self.inner.pending_opens.lock().remove(&stream_id);
                Err(Error::Interrupted)
            }
            result = rx => result.map_err(|_| Error::Interrupted),
        }
    }

    /// Blocks until an inbound `StreamOpen` produces a new stream, or the
    /// session closes.
    pub async fn accept_stream(&self) -> Result<Stream> {
        let mut accept_rx = self.inner.accept_rx.lock().await;
        tokio::select! {
            biased;
            _ = self.inner.shutdown.notified() => Err(Error::Interrupted),
            item = accept_rx.recv() => item.ok_or(Error::SessionClosed),
        }
    }

    /// Dispatches a decrypted inbound frame by variant. Called only by the
    /// owning [`Mux`](crate::mux::Mux)'s receive loop.
    pub(crate) async fn dispatch(&self, frame: Frame) {
        match frame {
            Frame::StreamOpen { stream_id } => {
                if self.inner.streams.read().contains_key(&stream_id) {
                    return;
                }
                let stream = self.make_stream(stream_id);
                self.inner.streams.write().insert(stream_id, stream.clone());
                self.inner.note_stream_added();
                if self.inner.accept_tx.send(stream).is_err() {
                    debug!(stream_id, "accept queue closed, dropping inbound stream open");
                    return;
                }
                if let Err(err) = self.send(Frame::StreamAck { stream_id }).await {
                    debug!(stream_id, %err, "failed to ack inbound stream open");
                }
            }
            Frame::StreamAck { stream_id } => {
                let waiter = self.inner.pending_opens.lock().remove(&stream_id);
                match waiter {
                    Some(tx) => {
                        let stream = self.make_stream(stream_id);
                        self.inner.streams.write().insert(stream_id, stream.clone());
                        self.inner.note_stream_added();
                        let _ = tx.send(stream);
                    }
                    None => {
                        // Both sides opened the same session concurrently; treat
                        // this ack as an inbound open if we don't know the id yet.
                        if self.inner.streams.read().contains_key(&stream_id) {
                            return;
                        }
                        let stream = self.make_stream(stream_id);
                        self.inner.streams.write().insert(stream_id, stream.clone());
                        self.inner.note_stream_added();
                        let _ = self.inner.accept_tx.send(stream);
                    }
                }
            }
            Frame::StreamClose { stream_id } => {
                if let Some(stream) = self.inner.streams.write().remove(&stream_id) {
                    self.inner.note_stream_removed();
                    stream.force_close(false);
                }
            }
            Frame::StreamReset { stream_id } => {
                if let Some(stream) = self.inner.streams.write().remove(&stream_id) {
                    self.inner.note_stream_removed();
                    stream.force_close(true);
                }
            }
            Frame::StreamDataInit { stream_id, .. }
            | Frame::StreamData { stream_id, .. }
            | Frame::StreamDataAck { stream_id, .. } => {
                let stream = self.inner.streams.read().get(&stream_id).cloned();
                if let Some(stream) = stream {
                    stream.deliver(frame);
                } else {
                    trace!(stream_id, "dropping frame for unknown stream");
                }
            }
            Frame::Handshake(_) | Frame::Crypto(_) => {
                debug!("unexpected frame variant reached session dispatch");
            }
        }
    }

    /// Closes every owned stream, emits a Terminate packet, and detaches
    /// from the Mux. Idempotent: a second call returns `SessionClosed`.
    pub async fn close(&self) -> Result<()> {
        if self.inner.terminated.swap(true, Ordering::AcqRel) {
            return Err(Error::SessionClosed);
        }
        self.inner.shutdown.notify_waiters();

        let streams: Vec<Stream> = self.inner.streams.write().drain().map(|(_, s)| s).collect();
        for stream in &streams {
            self.inner.note_stream_removed();
            stream.force_close_interrupted();
        }

        if let Ok(sequence) = self.next_sequence() {
            let packet = Packet::new(PacketType::Terminate, self.inner.connection_id, sequence, None);
            if let Ok(buf) = packet.encode() {
                let _ = self.write_datagram(&buf).await;
            }
        }

        if let Some(mux) = self.inner.mux.upgrade() {
            mux.remove_session(self.inner.connection_id);
        }

        Ok(())
    }

    /// Tears this session down in response to an inbound Terminate packet
    /// or a Mux-wide shutdown: no Terminate packet is sent back out, and
    /// pending operations wake with `Interrupted` rather than end-of-stream.
    pub(crate) fn force_close(&self) {
        if self.inner.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.notify_waiters();
        for (_, stream) in self.inner.streams.write().drain() {
            self.inner.note_stream_removed();
            stream.force_close_interrupted();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> [u8; KEY_LEN] {
        [byte; KEY_LEN]
    }

    fn session(is_initiator: bool) -> Session {
        Session::new(
            1,
            "127.0.0.1:9000".parse().unwrap(),
            &key(1),
            is_initiator,
            1 << 16,
            Duration::from_secs(15),
            Weak::new(),
        )
    }

    #[test]
    fn test_stream_id_parity_initiator_is_even() {
        let session = session(true);
        assert_eq!(session.alloc_local_stream_id().unwrap(), 2);
        assert_eq!(session.alloc_local_stream_id().unwrap(), 4);
    }

    #[test]
    fn test_stream_id_parity_acceptor_is_odd() {
        let session = session(false);
        assert_eq!(session.alloc_local_stream_id().unwrap(), 1);
        assert_eq!(session.alloc_local_stream_id().unwrap(), 3);
    }

    #[test]
    fn test_send_recv_roundtrip_through_aead() {
        let sender = session(true);
        let receiver = Session::new(
            1,
            "127.0.0.1:9000".parse().unwrap(),
            &key(1),
            false,
            1 << 16,
            Duration::from_secs(15),
            Weak::new(),
        );

        let frame = Frame::StreamOpen { stream_id: 2 };
        let plaintext = frame.encode_tagged().unwrap();
        let sequence = sender.next_sequence().unwrap();
        let ciphertext = sender.inner.aead.seal(sequence, &plaintext).unwrap();

        let decoded = receiver.decrypt(sequence, &ciphertext).unwrap();
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let session = session(true);
        assert!(session.close().await.is_ok());
        assert!(matches!(session.close().await, Err(Error::SessionClosed)));
    }

    #[tokio::test]
    async fn test_open_stream_fails_once_closed() {
        let session = session(true);
        session.close().await.unwrap();
        assert!(matches!(session.open_stream().await, Err(Error::SessionClosed)));
    }
}
