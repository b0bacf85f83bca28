use crate::config::Config;
use crate::error::{QmuxError, Result};
use crate::stream::Stream;
use crate::stream_id::{classify, validate_incoming, Classification, Role, StreamId, StreamIdAllocator};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

/// Stream carrying handshake/crypto data. Always scheduled first.
pub const CRYPTO_STREAM_ID: StreamId = 1;
/// Stream carrying header/control data. Scheduled right after crypto.
pub const HEADERS_STREAM_ID: StreamId = 3;

/// Non-rotating priority prefix visited before every round-robin pass.
/// Kept as an ordered list so further priority classes slot in without
/// restructuring the rotation.
const PRIORITY_STREAMS: [StreamId; 2] = [CRYPTO_STREAM_ID, HEADERS_STREAM_ID];

/// Builds a stream wired to its own flow controller. Supplied by the
/// connection layer.
pub type StreamFactory = Box<dyn Fn(StreamId) -> Arc<Stream> + Send + Sync>;

/// Everything guarded by the table lock: the stream map, the ordered open
/// list mirroring its keys, the direction counters, the scheduling cursor
/// and the wait bookkeeping.
struct MapState {
    streams: HashMap<StreamId, Arc<Stream>>,
    /// Open stream IDs, ascending. Always mirrors the keys of `streams`.
    open_streams: Vec<StreamId>,
    round_robin_index: usize,
    num_peer_streams: usize,
    num_self_streams: usize,
    /// Finite once the peer's transport parameters arrive.
    max_self_streams: Option<usize>,
    allocator: StreamIdAllocator,
    highest_peer_id: Option<StreamId>,
    /// Peer streams opened but not yet handed to an accept call, ascending.
    accept_queue: VecDeque<StreamId>,
    /// FIFO tickets of suspended `open_stream_sync` callers.
    open_wait_queue: VecDeque<u64>,
    next_ticket: u64,
    /// Terminal error; set at most once, fanned out to every waiter.
    close_err: Option<QmuxError>,
}

impl MapState {
    fn has_self_capacity(&self) -> bool {
        match self.max_self_streams {
            Some(max) => self.num_self_streams < max,
            None => false,
        }
    }

    /// Insert into both structures at once, keeping the ordered list
    /// ascending and the cursor on the stream it pointed to before.
    fn insert_stream(&mut self, id: StreamId, stream: Arc<Stream>) {
        let pos = self.open_streams.binary_search(&id).unwrap_or_else(|p| p);
        if !self.open_streams.is_empty() && pos <= self.round_robin_index {
            self.round_robin_index += 1;
        }
        self.open_streams.insert(pos, id);
        self.streams.insert(id, stream);
    }
}

/// The stream table of one connection: creates, stores, hands out, iterates
/// and garbage-collects streams.
///
/// All state lives under a single lock. Suspending operations
/// (`open_stream_sync`, `accept_stream`) park on a broadcast [`Notify`] and
/// re-validate their condition under the lock on every wakeup. The only way
/// to cancel a suspended call is to close the whole table via
/// `close_with_error`.
pub struct StreamsMap {
    role: Role,
    config: Config,
    new_stream: StreamFactory,
    state: Mutex<MapState>,
    wakeup: Notify,
}

/// Removes an abandoned `open_stream_sync` ticket so later waiters are not
/// stuck behind it.
struct WaitTicket<'a> {
    map: &'a StreamsMap,
    ticket: u64,
    armed: bool,
}

impl Drop for WaitTicket<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut st = self.map.state();
            st.open_wait_queue.retain(|&t| t != self.ticket);
            drop(st);
            self.map.wakeup.notify_waiters();
        }
    }
}

impl StreamsMap {
    pub fn new(role: Role, config: Config, new_stream: StreamFactory) -> Self {
        Self {
            role,
            new_stream,
            state: Mutex::new(MapState {
                streams: HashMap::new(),
                open_streams: Vec::new(),
                round_robin_index: 0,
                num_peer_streams: 0,
                num_self_streams: 0,
                max_self_streams: None,
                allocator: StreamIdAllocator::new(role),
                highest_peer_id: None,
                accept_queue: VecDeque::new(),
                open_wait_queue: VecDeque::new(),
                next_ticket: 0,
                close_err: None,
            }),
            wakeup: Notify::new(),
            config,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Number of currently open streams.
    pub fn len(&self) -> usize {
        self.state().streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up the stream for an incoming frame, implicitly opening skipped
    /// peer-initiated streams up to `id`.
    ///
    /// Returns `Ok(None)` for an ID that was already opened and reclaimed —
    /// late frames for a retired stream are tolerated, never a protocol
    /// error. A wrong-parity or out-of-order ID is `InvalidStreamId`;
    /// exceeding the peer-stream limit opens nothing and fails with
    /// `TooManyOpenStreams`.
    pub fn get_or_open_stream(&self, id: StreamId) -> Result<Option<Arc<Stream>>> {
        let requested = {
            let mut st = self.state();
            if let Some(err) = &st.close_err {
                return Err(err.clone());
            }
            if let Some(stream) = st.streams.get(&id) {
                return Ok(Some(Arc::clone(stream)));
            }
            match classify(id, self.role) {
                Classification::Invalid => return Err(QmuxError::InvalidStreamId(id)),
                Classification::SelfInitiated => {
                    // Our own ID: retired if we ever allocated it, otherwise
                    // the peer has no business opening it.
                    if st.allocator.already_allocated(id) {
                        return Ok(None);
                    }
                    return Err(QmuxError::InvalidStreamId(id));
                }
                Classification::PeerInitiated => {
                    if let Some(highest) = st.highest_peer_id {
                        if id <= highest {
                            return Ok(None);
                        }
                    }
                    validate_incoming(id, self.role, st.highest_peer_id)?;

                    let first = match st.highest_peer_id {
                        Some(highest) => highest + 2,
                        None => self.role.peer().first_stream_id(),
                    };
                    // All-or-nothing: check the whole sweep against the
                    // limit before opening any stream.
                    let count = ((id - first) / 2 + 1) as usize;
                    if st.num_peer_streams + count > self.config.max_peer_streams {
                        return Err(QmuxError::TooManyOpenStreams);
                    }

                    let mut requested = None;
                    let mut opened = first;
                    while opened <= id {
                        let stream = (self.new_stream)(opened);
                        st.insert_stream(opened, Arc::clone(&stream));
                        st.num_peer_streams += 1;
                        st.accept_queue.push_back(opened);
                        requested = Some(stream);
                        opened += 2;
                    }
                    st.highest_peer_id = Some(id);
                    tracing::debug!(
                        stream_id = id,
                        implicitly_opened = count - 1,
                        "opened peer-initiated stream"
                    );
                    requested
                }
            }
        };
        // New peer streams may satisfy suspended acceptors.
        self.wakeup.notify_waiters();
        Ok(requested)
    }

    /// Open the next self-initiated stream. Never suspends; fails with
    /// `TooManyOpenStreams` while the negotiated limit is exhausted (or
    /// still unknown).
    pub fn open_stream(&self) -> Result<Arc<Stream>> {
        let mut st = self.state();
        if let Some(err) = &st.close_err {
            return Err(err.clone());
        }
        self.try_open(&mut st)
    }

    /// Like `open_stream`, but suspends while the limit is exhausted and
    /// retries once capacity frees up. Concurrent callers are served in
    /// FIFO order of arrival, one freed slot each.
    pub async fn open_stream_sync(&self) -> Result<Arc<Stream>> {
        let ticket = {
            let mut st = self.state();
            if let Some(err) = &st.close_err {
                return Err(err.clone());
            }
            if st.open_wait_queue.is_empty() && st.has_self_capacity() {
                return self.try_open(&mut st);
            }
            let ticket = st.next_ticket;
            st.next_ticket += 1;
            st.open_wait_queue.push_back(ticket);
            ticket
        };
        let mut guard = WaitTicket {
            map: self,
            ticket,
            armed: true,
        };
        loop {
            let notified = self.wakeup.notified();
            tokio::pin!(notified);
            // Register before re-checking so a state change between the
            // check and the await is not lost.
            notified.as_mut().enable();
            {
                let mut st = self.state();
                if let Some(err) = &st.close_err {
                    let err = err.clone();
                    st.open_wait_queue.retain(|&t| t != ticket);
                    guard.armed = false;
                    return Err(err);
                }
                if st.open_wait_queue.front() == Some(&ticket) && st.has_self_capacity() {
                    st.open_wait_queue.pop_front();
                    guard.armed = false;
                    let result = self.try_open(&mut st);
                    drop(st);
                    // The next ticket holder may also have capacity.
                    self.wakeup.notify_waiters();
                    return result;
                }
            }
            notified.await;
        }
    }

    /// Hand out the lowest-ID peer-initiated stream not yet accepted,
    /// suspending while none is pending. No stream is handed to more than
    /// one caller.
    pub async fn accept_stream(&self) -> Result<Arc<Stream>> {
        loop {
            let notified = self.wakeup.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.state();
                if let Some(err) = &st.close_err {
                    return Err(err.clone());
                }
                if let Some(id) = st.accept_queue.pop_front() {
                    let stream = st.streams.get(&id).cloned().ok_or_else(|| {
                        QmuxError::Internal(format!(
                            "stream {id} pending accept but missing from the table"
                        ))
                    })?;
                    tracing::debug!(stream_id = id, "stream accepted");
                    return Ok(stream);
                }
            }
            notified.await;
        }
    }

    /// Register the terminal error. The first call wins; every suspended
    /// and every future open/accept call observes exactly this error.
    pub fn close_with_error(&self, err: QmuxError) {
        {
            let mut st = self.state();
            if st.close_err.is_some() {
                return;
            }
            tracing::debug!(%err, "stream table closed");
            st.close_err = Some(err);
        }
        self.wakeup.notify_waiters();
    }

    /// The peer's transport parameters arrived: the self-initiated stream
    /// limit becomes finite and suspended openers get another chance.
    pub fn update_transport_parameters(&self, max_self_streams: usize) {
        {
            let mut st = self.state();
            st.max_self_streams = Some(max_self_streams);
        }
        self.wakeup.notify_waiters();
    }

    /// Sweep out every stream that reports itself finished, retire its ID
    /// and re-derive the scheduling cursor from the count of removed
    /// entries strictly before it.
    pub fn delete_closed_streams(&self) -> Result<()> {
        {
            let mut st = self.state();

            let mut removed: Vec<(usize, StreamId)> = Vec::new();
            for (idx, &id) in st.open_streams.iter().enumerate() {
                let stream = st.streams.get(&id).ok_or_else(|| {
                    QmuxError::Internal(format!("stream {id} in open list but not in the table"))
                })?;
                if stream.finished() {
                    removed.push((idx, id));
                }
            }
            if removed.is_empty() {
                return Ok(());
            }

            for &(_, id) in &removed {
                st.streams.remove(&id);
                match classify(id, self.role) {
                    Classification::PeerInitiated => st.num_peer_streams -= 1,
                    Classification::SelfInitiated => st.num_self_streams -= 1,
                    Classification::Invalid => {}
                }
            }
            st.open_streams
                .retain(|id| !removed.iter().any(|&(_, r)| r == *id));

            // The cursor tracks a logical successor stream, not a raw index.
            let shift = removed
                .iter()
                .filter(|&&(idx, _)| idx < st.round_robin_index)
                .count();
            st.round_robin_index -= shift;
            if st.open_streams.is_empty() {
                st.round_robin_index = 0;
            } else {
                st.round_robin_index %= st.open_streams.len();
            }

            let MapState {
                accept_queue,
                streams,
                ..
            } = &mut *st;
            accept_queue.retain(|id| streams.contains_key(id));

            tracing::debug!(count = removed.len(), "deleted closed streams");
        }
        // Freed capacity may satisfy suspended openers.
        self.wakeup.notify_waiters();
        Ok(())
    }

    /// Ask each open stream, in fairness order, whether it contributes to
    /// the next outbound packet.
    ///
    /// The reserved crypto/header streams are visited first on every pass,
    /// outside the rotation. The remaining open streams are visited exactly
    /// once each, ascending with wraparound from the cursor. `visit`
    /// returning `false` ends the pass with the cursor one past the last
    /// visited stream; an error aborts the pass and propagates. `visit`
    /// runs under the table lock and must not call back into the table.
    pub fn round_robin_iterate<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(&Arc<Stream>) -> Result<bool>,
    {
        let mut st = self.state();

        for id in PRIORITY_STREAMS {
            if let Some(stream) = st.streams.get(&id) {
                let stream = Arc::clone(stream);
                if !visit(&stream)? {
                    return Ok(());
                }
            }
        }

        let num_streams = st.open_streams.len();
        if num_streams == 0 {
            return Ok(());
        }
        let start = st.round_robin_index;
        for i in 0..num_streams {
            let id = st.open_streams[(start + i) % num_streams];
            if PRIORITY_STREAMS.contains(&id) {
                st.round_robin_index = (st.round_robin_index + 1) % num_streams;
                continue;
            }
            let stream = Arc::clone(st.streams.get(&id).ok_or_else(|| {
                QmuxError::Internal(format!("stream {id} in open list but not in the table"))
            })?);
            let cont = visit(&stream)?;
            st.round_robin_index = (st.round_robin_index + 1) % num_streams;
            if !cont {
                break;
            }
        }
        Ok(())
    }

    fn try_open(&self, st: &mut MapState) -> Result<Arc<Stream>> {
        if !st.has_self_capacity() {
            return Err(QmuxError::TooManyOpenStreams);
        }
        let id = st.allocator.next()?;
        let stream = (self.new_stream)(id);
        st.insert_stream(id, Arc::clone(&stream));
        st.num_self_streams += 1;
        tracing::debug!(stream_id = id, "opened self-initiated stream");
        Ok(stream)
    }

    fn state(&self) -> MutexGuard<'_, MapState> {
        self.state.lock().expect("streams map lock poisoned")
    }
}
