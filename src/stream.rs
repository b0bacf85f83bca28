use crate::error::{QmuxError, Result};
use crate::flow_control::StreamFlowControl;
use crate::stream_id::StreamId;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct SendBuffer {
    queue: VecDeque<Bytes>,
    closed: bool,
}

/// One logical byte stream multiplexed over a connection.
///
/// The stream owns a minimal send queue and delegates all byte accounting
/// to its flow controller. A stream is `finished` once both directions are
/// done (or it was cancelled outright) and all received data has been
/// consumed; finished streams are reclaimed by
/// `StreamsMap::delete_closed_streams`.
#[derive(Debug)]
pub struct Stream {
    id: StreamId,
    flow: StreamFlowControl,
    send: Mutex<SendBuffer>,
    cancelled: AtomicBool,
}

impl Stream {
    pub fn new(id: StreamId, flow: StreamFlowControl) -> Self {
        Self {
            id,
            flow,
            send: Mutex::new(SendBuffer::default()),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn flow_control(&self) -> &StreamFlowControl {
        &self.flow
    }

    /// Queue data for sending. Flow control is applied when the scheduler
    /// drains the queue, not here.
    pub fn write(&self, data: Bytes) -> Result<()> {
        if self.cancelled.load(Ordering::Relaxed) {
            return Err(QmuxError::SendClosed(self.id));
        }
        let mut send = self.send_buffer();
        if send.closed {
            return Err(QmuxError::SendClosed(self.id));
        }
        send.queue.push_back(data);
        Ok(())
    }

    /// Hand at most `max_bytes` of queued data to the scheduler, bounded by
    /// the current send window, and account it as sent.
    pub fn pop_send_data(&self, max_bytes: usize) -> Result<Option<Bytes>> {
        let allowed = (max_bytes as u64).min(self.flow.send_window_size()) as usize;
        if allowed == 0 {
            return Ok(None);
        }
        let chunk = {
            let mut send = self.send_buffer();
            let Some(mut chunk) = send.queue.pop_front() else {
                return Ok(None);
            };
            if chunk.len() > allowed {
                let rest = chunk.split_off(allowed);
                send.queue.push_front(rest);
            }
            chunk
        };
        self.flow.add_bytes_sent(chunk.len() as u64)?;
        Ok(Some(chunk))
    }

    pub fn has_data_to_send(&self) -> bool {
        !self.send_buffer().queue.is_empty()
    }

    /// Close the send side. Queued data still drains; further writes fail.
    pub fn close(&self) {
        self.send_buffer().closed = true;
    }

    /// Abandon both directions at once. The stream immediately reports
    /// itself finished and becomes eligible for garbage collection.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::Relaxed) {
            let mut send = self.send_buffer();
            send.closed = true;
            send.queue.clear();
            tracing::debug!(stream_id = self.id, "stream cancelled");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Record the highest offset the peer claims for this stream.
    pub fn update_highest_received(&self, offset: u64, is_final: bool) -> Result<()> {
        self.flow.update_highest_received(offset, is_final)
    }

    /// Account bytes the local application consumed from the receive buffer.
    pub fn add_bytes_read(&self, n: u64) {
        self.flow.add_bytes_read(n);
    }

    pub fn update_send_window(&self, new_limit: u64) {
        self.flow.update_send_window(new_limit);
    }

    pub fn get_window_update(&self) -> u64 {
        self.flow.get_window_update()
    }

    pub fn is_blocked(&self) -> bool {
        self.flow.is_blocked()
    }

    /// Whether this stream may be removed from the table: cancelled, or both
    /// sides done with all received data consumed by the owner.
    pub fn finished(&self) -> bool {
        if self.cancelled.load(Ordering::Relaxed) {
            return true;
        }
        let send_done = {
            let send = self.send_buffer();
            send.closed && send.queue.is_empty()
        };
        if !send_done {
            return false;
        }
        match self.flow.final_offset() {
            Some(final_offset) => self.flow.bytes_read() >= final_offset,
            None => false,
        }
    }

    fn send_buffer(&self) -> std::sync::MutexGuard<'_, SendBuffer> {
        self.send.lock().expect("stream send buffer lock poisoned")
    }
}
