//! Reliable chunked transfer state machine multiplexed within a session.
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::session::SessionInner;

/// AEAD tag plus worst-case varint/header overhead subtracted from a peer's
/// advertised `max_frame_size` to get a safe per-chunk payload size.
const CHUNK_OVERHEAD: usize = 13 /* packet header */
    + 1 /* outer frame_type byte */
    + 4 /* worst-case varint length prefix */
    + 16 /* AEAD tag */
    + 1 /* inner frame_type byte */
    + 4 /* stream_id */
    + 4 /* offset */;

pub(crate) fn chunk_size(max_frame_size: usize) -> usize {
    max_frame_size.saturating_sub(CHUNK_OVERHEAD).max(1)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CloseReason {
    Plain,
    Reset,
    Interrupted,
    TooLarge,
}

impl CloseReason {
    fn into_error(self) -> Error {
        match self {
            Self::Plain => Error::StreamClosed,
            Self::Reset => Error::StreamReset,
            Self::Interrupted => Error::Interrupted,
            Self::TooLarge => Error::TooLarge,
        }
    }
}

enum ReadState {
    Idle,
    Leftover { data: Vec<u8>, offset: usize },
}

struct Inbox {
    queue: Mutex<VecDeque<Frame>>,
    notify: Notify,
}

impl Inbox {
    fn new() -> Self {
        Self { queue: Mutex::new(VecDeque::new()), notify: Notify::new() }
    }

    fn push(&self, frame: Frame) {
        self.queue.lock().push_back(frame);
        self.notify.notify_waiters();
    }

    /// Removes and returns the first queued frame matching `pred`, waiting
    /// for new arrivals otherwise. Frames that don't match stay in the
    /// queue for whichever other consumer (Read looking for data, Write
    /// looking for acks) is waiting on them.
    async fn pop_matching(
        &self,
        stream: &StreamInner,
        pred: impl Fn(&Frame) -> bool,
        deadline: Option<Instant>,
    ) -> PopOutcome {
        loop {
            {
                let mut queue = self.queue.lock();
                if let Some(pos) = queue.iter().position(|f| pred(f)) {
                    return PopOutcome::Frame(queue.remove(pos).unwrap());
                }
            }

            if stream.closed.load(Ordering::Acquire) {
                return PopOutcome::Closed;
            }

            match deadline {
                Some(deadline) => {
                    let notified = self.notify.notified();
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                            return PopOutcome::TimedOut;
                        }
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }
}

enum PopOutcome {
    Frame(Frame),
    TimedOut,
    Closed,
}

pub(crate) struct StreamInner {
    pub(crate) id: u32,
    session: Weak<SessionInner>,
    inbox: Inbox,
    closed: AtomicBool,
    close_reason: AtomicU8,
    read_state: Mutex<ReadState>,
    buffer_capacity: usize,
    chunk_size: usize,
    retransmit_timeout: Duration,
    read_deadline: Mutex<Option<Instant>>,
    write_deadline: Mutex<Option<Instant>>,
}

const REASON_NONE: u8 = 0;
const REASON_PLAIN: u8 = 1;
const REASON_RESET: u8 = 2;
const REASON_INTERRUPTED: u8 = 3;
const REASON_TOO_LARGE: u8 = 4;

impl StreamInner {
    fn store_reason(&self, reason: CloseReason) {
        let code = match reason {
            CloseReason::Plain => REASON_PLAIN,
            CloseReason::Reset => REASON_RESET,
            CloseReason::Interrupted => REASON_INTERRUPTED,
            CloseReason::TooLarge => REASON_TOO_LARGE,
        };
        self.close_reason.store(code, Ordering::Release);
    }

    fn load_reason(&self) -> Option<CloseReason> {
        match self.close_reason.load(Ordering::Acquire) {
            REASON_PLAIN => Some(CloseReason::Plain),
            REASON_RESET => Some(CloseReason::Reset),
            REASON_INTERRUPTED => Some(CloseReason::Interrupted),
            REASON_TOO_LARGE => Some(CloseReason::TooLarge),
            _ => None,
        }
    }
}

/// A bidirectional, reliable message channel multiplexed within a
/// [`Session`](crate::session::Session).
#[derive(Clone)]
pub struct Stream {
    pub(crate) inner: Arc<StreamInner>,
}

impl Stream {
    pub(crate) fn new(
        id: u32,
        session: Weak<SessionInner>,
        buffer_capacity: usize,
        max_frame_size: usize,
        retransmit_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                id,
                session,
                inbox: Inbox::new(),
                closed: AtomicBool::new(false),
                close_reason: AtomicU8::new(REASON_NONE),
                read_state: Mutex::new(ReadState::Idle),
                buffer_capacity,
                chunk_size: chunk_size(max_frame_size),
                retransmit_timeout,
                read_deadline: Mutex::new(None),
                write_deadline: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        *self.inner.read_deadline.lock() = deadline;
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        *self.inner.write_deadline.lock() = deadline;
    }

    /// Delivers a decrypted `StreamDataInit`/`StreamData`/`StreamDataAck`
    /// frame into this stream's inbox. Called only by `Session::dispatch`.
    pub(crate) fn deliver(&self, frame: Frame) {
        self.inner.inbox.push(frame);
    }

    /// Closes the stream as a result of a remote `StreamClose` (reason
    /// `None`, surfaced as end-of-stream) or `StreamReset` (surfaced as
    /// `StreamReset`), or because the owning session is shutting down
    /// (surfaced as `Interrupted`). Idempotent: a second call is a no-op.
    pub(crate) fn force_close(&self, remote_reset: bool) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.store_reason(if remote_reset { CloseReason::Reset } else { CloseReason::Plain });
        self.inner.inbox.notify.notify_waiters();
    }

    pub(crate) fn force_close_interrupted(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.store_reason(CloseReason::Interrupted);
        self.inner.inbox.notify.notify_waiters();
    }

    async fn reset_locally(&self, reason: CloseReason) -> Error {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            self.inner.store_reason(reason);
            self.inner.inbox.notify.notify_waiters();
            if let Some(session) = self.inner.session.upgrade() {
                let _ = session.send(Frame::StreamReset { stream_id: self.inner.id }).await;
                if session.streams.write().remove(&self.inner.id).is_some() {
                    session.note_stream_removed();
                }
            }
        }
        reason.into_error()
    }

    /// Closes the stream, announcing it to the peer. Returns
    /// `AlreadyClosed` if the stream was already closed (locally or
    /// remotely).
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyClosed);
        }
        self.inner.store_reason(CloseReason::Plain);
        self.inner.inbox.notify.notify_waiters();

        if let Some(session) = self.inner.session.upgrade() {
            let _ = session.send(Frame::StreamClose { stream_id: self.inner.id }).await;
            if session.streams.write().remove(&self.inner.id).is_some() {
                session.note_stream_removed();
            }
        }

        Ok(())
    }

    /// Reads one message into `buf`, returning the number of bytes copied.
    /// Returns `Ok(0)` once the stream has been plainly closed and any
    /// buffered bytes have been drained.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        {
            let mut state = self.inner.read_state.lock();
            if let ReadState::Leftover { data, offset } = &mut *state {
                let remaining = &data[*offset..];
                let n = remaining.len().min(buf.len());
                buf[..n].copy_from_slice(&remaining[..n]);
                *offset += n;
                if *offset >= data.len() {
                    *state = ReadState::Idle;
                }
                return Ok(n);
            }
        }

        if self.is_closed() {
            return match self.inner.load_reason() {
                Some(CloseReason::Plain) | None => Ok(0),
                Some(reason) => Err(reason.into_error()),
            };
        }

        let mut known_length: Option<u64> = None;
        let mut assembly: Vec<u8> = Vec::new();
        let mut seen_offsets: HashSet<u32> = HashSet::new();
        let mut received: u64 = 0;

        loop {
            if let Some(known) = known_length {
                if received >= known {
                    break;
                }
            }

            let deadline = *self.inner.read_deadline.lock();
            let outcome = self
                .inner
                .inbox
                .pop_matching(
                    &self.inner,
                    |f| matches!(f, Frame::StreamDataInit { .. } | Frame::StreamData { .. }),
                    deadline,
                )
                .await;

            match outcome {
                PopOutcome::TimedOut => return Err(Error::ReadTimeout),
                PopOutcome::Closed => {
                    return match self.inner.load_reason() {
                        Some(CloseReason::Plain) | None => Ok(0),
                        Some(reason) => Err(reason.into_error()),
                    };
                }
                PopOutcome::Frame(Frame::StreamDataInit { total_length, .. }) => {
                    if total_length as usize > self.inner.buffer_capacity {
                        return Err(self.reset_locally(CloseReason::TooLarge).await);
                    }
                    known_length = Some(total_length);
                    if assembly.len() < total_length as usize {
                        assembly.resize(total_length as usize, 0);
                    }
                }
                PopOutcome::Frame(Frame::StreamData { offset, payload, .. }) => {
                    let end = offset as u64 + payload.len() as u64;
                    let cap = known_length.unwrap_or(self.inner.buffer_capacity as u64);
                    if end > cap {
                        return Err(self.reset_locally(CloseReason::TooLarge).await);
                    }
                    if assembly.len() < end as usize {
                        assembly.resize(end as usize, 0);
                    }
                    assembly[offset as usize..end as usize].copy_from_slice(&payload);
                    if seen_offsets.insert(offset) {
                        received += payload.len() as u64;
                    }
                    if let Some(session) = self.inner.session.upgrade() {
                        let _ = session.send(Frame::StreamDataAck { stream_id: self.inner.id, offset }).await;
                    }
                }
                PopOutcome::Frame(_) => unreachable!("inbox only carries data-path frames"),
            }
        }

        let n = assembly.len().min(buf.len());
        buf[..n].copy_from_slice(&assembly[..n]);
        if n < assembly.len() {
            *self.inner.read_state.lock() = ReadState::Leftover { data: assembly, offset: n };
        }
        Ok(n)
    }

    /// Sends one message, chunked and acknowledged per `StreamData` offset,
    /// retransmitting unacknowledged chunks on a per-chunk timeout.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(self.inner.load_reason().unwrap_or(CloseReason::Plain).into_error());
        }

        let session = self.inner.session.upgrade().ok_or(Error::SessionClosed)?;

        let l = data.len().min(self.inner.buffer_capacity);
        let data = &data[..l];
        let chunk_size = self.inner.chunk_size;

        let mut pending: HashSet<u32> = HashSet::new();
        let mut offset = 0usize;
        while offset < l {
            let end = (offset + chunk_size).min(l);
            session
                .send(Frame::StreamData {
                    stream_id: self.inner.id,
                    offset: offset as u32,
                    payload: data[offset..end].to_vec(),
                })
                .await?;
            pending.insert(offset as u32);
            offset = end;
        }

        session
            .send(Frame::StreamDataInit { stream_id: self.inner.id, total_length: l as u64 })
            .await?;

        while !pending.is_empty() {
            if self.is_closed() {
                return Err(self.inner.load_reason().unwrap_or(CloseReason::Plain).into_error());
            }

            if let Some(deadline) = *self.inner.write_deadline.lock() {
                if Instant::now() >= deadline {
                    return Err(Error::WriteTimeout);
                }
            }

            let retransmit_at = Instant::now() + self.inner.retransmit_timeout;
            let outcome = self
                .inner
                .inbox
                .pop_matching(&self.inner, |f| matches!(f, Frame::StreamDataAck { .. }), Some(retransmit_at))
                .await;

            match outcome {
                PopOutcome::Frame(Frame::StreamDataAck { offset, .. }) => {
                    pending.remove(&offset);
                }
                PopOutcome::Frame(_) => unreachable!("inbox only carries data-path frames"),
                PopOutcome::Closed => {
                    return Err(self.inner.load_reason().unwrap_or(CloseReason::Plain).into_error());
                }
                PopOutcome::TimedOut => {
                    for &off in &pending {
                        let end = (off as usize + chunk_size).min(l);
                        session
                            .send(Frame::StreamData {
                                stream_id: self.inner.id,
                                offset: off,
                                payload: data[off as usize..end].to_vec(),
                            })
                            .await?;
                    }
                }
            }
        }

        Ok(l)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_size_is_conservative() {
        assert!(chunk_size(1232) < 1232);
        assert!(chunk_size(1232) > 0);
        assert_eq!(chunk_size(0), 1);
    }

    #[test]
    fn test_close_reason_mapping() {
        assert!(matches!(CloseReason::Plain.into_error(), Error::StreamClosed));
        assert!(matches!(CloseReason::Reset.into_error(), Error::StreamReset));
        assert!(matches!(CloseReason::Interrupted.into_error(), Error::Interrupted));
        assert!(matches!(CloseReason::TooLarge.into_error(), Error::TooLarge));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let stream = Stream::new(2, Weak::new(), 1024, 1232, Duration::from_secs(15));
        assert!(stream.close().await.is_ok());
        assert!(matches!(stream.close().await, Err(Error::AlreadyClosed)));
    }

    #[tokio::test]
    async fn test_write_to_closed_stream_fails() {
        let stream = Stream::new(2, Weak::new(), 1024, 1232, Duration::from_secs(15));
        stream.close().await.unwrap();
        let err = stream.write(b"hello").await.unwrap_err();
        assert!(matches!(err, Error::StreamClosed));
    }

    #[tokio::test]
    async fn test_read_after_plain_close_drains_then_eof() {
        let stream = Stream::new(2, Weak::new(), 1024, 1232, Duration::from_secs(15));
        *stream.inner.read_state.lock() = ReadState::Leftover { data: vec![1, 2, 3], offset: 0 };
        stream.force_close(false);

        let mut buf = [0u8; 8];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);

        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_read_reassembles_out_of_order_chunks() {
        let stream = Stream::new(2, Weak::new(), 8192, 1232, Duration::from_secs(15));

        let message: Vec<u8> = (0..4000u32).map(|i| (i % 256) as u8).collect();
        stream.deliver(Frame::StreamDataInit { stream_id: 2, total_length: 4000 });
        for chunk_index in [3usize, 1, 2, 0] {
            let offset = chunk_index * 1000;
            stream.deliver(Frame::StreamData {
                stream_id: 2,
                offset: offset as u32,
                payload: message[offset..offset + 1000].to_vec(),
            });
        }

        let mut buf = vec![0u8; 4000];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(n, 4000);
        assert_eq!(buf, message);
    }

    #[tokio::test]
    async fn test_read_rejects_oversize_init() {
        let stream = Stream::new(2, Weak::new(), 1024, 1232, Duration::from_secs(15));
        stream.deliver(Frame::StreamDataInit { stream_id: 2, total_length: 1025 });

        let mut buf = [0u8; 2048];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert!(matches!(err, Error::TooLarge));
        assert!(stream.is_closed());
    }

    #[tokio::test]
    async fn test_read_rejects_chunk_exceeding_known_length() {
        let stream = Stream::new(2, Weak::new(), 4096, 1232, Duration::from_secs(15));
        stream.deliver(Frame::StreamDataInit { stream_id: 2, total_length: 10 });
        stream.deliver(Frame::StreamData { stream_id: 2, offset: 5, payload: vec![0u8; 10] });

        let mut buf = [0u8; 64];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert!(matches!(err, Error::TooLarge));
    }

    #[tokio::test]
    async fn test_duplicate_chunk_is_not_double_counted() {
        // A retransmitted duplicate of offset 0 must not make `received`
        // reach `known_length` before the still-missing offset 5 chunk
        // arrives.
        let stream = Stream::new(2, Weak::new(), 4096, 1232, Duration::from_secs(15));
        stream.deliver(Frame::StreamDataInit { stream_id: 2, total_length: 10 });
        stream.deliver(Frame::StreamData { stream_id: 2, offset: 0, payload: b"hello".to_vec() });
        stream.deliver(Frame::StreamData { stream_id: 2, offset: 0, payload: b"hello".to_vec() });
        stream.deliver(Frame::StreamData { stream_id: 2, offset: 5, payload: b"world".to_vec() });

        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"helloworld");
    }
}
