use crate::config::Config;
use crate::error::{QmuxError, Result};
use crate::stream_id::StreamId;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// The connection-level window is kept this much larger than the biggest
/// stream window increment, so a single stream can always make progress.
const CONNECTION_WINDOW_MULTIPLIER: f64 = 1.5;

/// Send/receive byte budget bookkeeping shared by the stream-level and
/// connection-level controllers.
#[derive(Debug)]
struct WindowBook {
    // Send side: budget granted by the peer.
    send_window: u64,
    bytes_sent: u64,

    // Receive side: budget we grant to the peer.
    bytes_read: u64,
    highest_received: u64,
    receive_window: u64,
    receive_window_increment: u64,
    max_receive_window_increment: u64,
    last_window_update: Option<Instant>,
    rtt: Duration,
}

impl WindowBook {
    fn new(initial_receive_window: u64, max_receive_window_increment: u64, rtt: Duration) -> Self {
        Self {
            send_window: 0,
            bytes_sent: 0,
            bytes_read: 0,
            highest_received: 0,
            receive_window: initial_receive_window,
            receive_window_increment: initial_receive_window,
            max_receive_window_increment,
            last_window_update: None,
            rtt,
        }
    }

    fn send_window_size(&self) -> u64 {
        self.send_window.saturating_sub(self.bytes_sent)
    }

    /// Windows only ever grow; a lower limit from the peer is ignored.
    fn update_send_window(&mut self, new_limit: u64) -> bool {
        if new_limit > self.send_window {
            self.send_window = new_limit;
            return true;
        }
        false
    }

    fn add_bytes_sent(&mut self, n: u64) -> Result<()> {
        let sent = self.bytes_sent.saturating_add(n);
        if sent > self.send_window {
            return Err(QmuxError::SendBudgetExceeded {
                sent,
                window: self.send_window,
            });
        }
        self.bytes_sent = sent;
        Ok(())
    }

    fn add_bytes_read(&mut self, n: u64) {
        self.bytes_read = self.bytes_read.saturating_add(n);
    }

    /// Compute a new window value to advertise, or 0 when no update is due.
    ///
    /// An update is due once more than half of the current increment has
    /// been consumed. Updates requested faster than twice the round-trip
    /// time double the increment, up to the configured maximum; returns the
    /// increment actually applied alongside the window value.
    fn get_window_update(&mut self, now: Instant) -> (u64, u64) {
        let remaining = self.receive_window.saturating_sub(self.bytes_read);
        if remaining >= self.receive_window_increment / 2 {
            return (0, self.receive_window_increment);
        }
        self.maybe_adjust_window_increment(now);
        self.last_window_update = Some(now);
        self.receive_window = self.bytes_read + self.receive_window_increment;
        (self.receive_window, self.receive_window_increment)
    }

    fn maybe_adjust_window_increment(&mut self, now: Instant) {
        let Some(last) = self.last_window_update else {
            return;
        };
        if self.rtt.is_zero() {
            return;
        }
        if now.duration_since(last) < 2 * self.rtt {
            self.receive_window_increment = (2 * self.receive_window_increment)
                .min(self.max_receive_window_increment);
        }
    }

    fn ensure_minimum_window_increment(&mut self, increment: u64) {
        if increment > self.receive_window_increment {
            self.receive_window_increment =
                increment.min(self.max_receive_window_increment);
        }
    }
}

/// Flow controller for the aggregate byte budget across all streams of one
/// connection. Shared by every stream, so all mutation goes through an
/// internal lock.
#[derive(Debug)]
pub struct ConnectionFlowControl {
    book: Mutex<WindowBook>,
}

impl ConnectionFlowControl {
    pub fn new(config: &Config) -> Self {
        Self {
            book: Mutex::new(WindowBook::new(
                config.initial_connection_receive_window,
                config.max_connection_receive_window,
                config.expected_rtt,
            )),
        }
    }

    /// Unused send allowance: granted window minus bytes already sent.
    pub fn send_window_size(&self) -> u64 {
        self.book().send_window_size()
    }

    pub fn is_blocked(&self) -> bool {
        self.send_window_size() == 0
    }

    pub fn update_send_window(&self, new_limit: u64) {
        self.book().update_send_window(new_limit);
    }

    pub fn add_bytes_sent(&self, n: u64) -> Result<()> {
        self.book().add_bytes_sent(n)
    }

    pub fn add_bytes_read(&self, n: u64) {
        self.book().add_bytes_read(n);
    }

    /// New connection window to advertise to the peer, or 0 when none is due.
    pub fn get_window_update(&self) -> u64 {
        let (window, _) = self.book().get_window_update(Instant::now());
        window
    }

    /// Advance the aggregate highest-received counter by `delta`.
    ///
    /// Called by stream controllers when their own highest offset grows, so
    /// no single stream can evade the connection-wide budget.
    pub fn increment_highest_received(&self, delta: u64) -> Result<()> {
        let mut book = self.book();
        book.highest_received = book.highest_received.saturating_add(delta);
        if book.highest_received > book.receive_window {
            return Err(QmuxError::FlowControl(format!(
                "connection received {} bytes, window is {}",
                book.highest_received, book.receive_window
            )));
        }
        Ok(())
    }

    /// Keep the connection increment at least as large as `increment`, so
    /// the aggregate window does not fall behind growing stream windows.
    pub fn ensure_minimum_window_increment(&self, increment: u64) {
        self.book().ensure_minimum_window_increment(increment);
    }

    /// Feed a measured round-trip time into the window auto-tuner.
    pub fn update_rtt(&self, rtt: Duration) {
        self.book().rtt = rtt;
    }

    fn book(&self) -> std::sync::MutexGuard<'_, WindowBook> {
        self.book.lock().expect("connection flow control lock poisoned")
    }
}

#[derive(Debug)]
struct StreamWindow {
    book: WindowBook,
    final_offset: Option<u64>,
}

/// Flow controller for a single stream. Forwards highest-offset deltas to
/// the shared connection controller.
#[derive(Debug)]
pub struct StreamFlowControl {
    stream_id: StreamId,
    /// Reserved control streams are exempt from the connection budget.
    contributes_to_connection: bool,
    connection: Arc<ConnectionFlowControl>,
    window: Mutex<StreamWindow>,
}

impl StreamFlowControl {
    pub fn new(
        stream_id: StreamId,
        config: &Config,
        connection: Arc<ConnectionFlowControl>,
        contributes_to_connection: bool,
    ) -> Self {
        Self {
            stream_id,
            contributes_to_connection,
            connection,
            window: Mutex::new(StreamWindow {
                book: WindowBook::new(
                    config.initial_stream_receive_window,
                    config.max_stream_receive_window,
                    config.expected_rtt,
                ),
                final_offset: None,
            }),
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn send_window_size(&self) -> u64 {
        self.window().book.send_window_size()
    }

    pub fn is_blocked(&self) -> bool {
        self.send_window_size() == 0
    }

    pub fn update_send_window(&self, new_limit: u64) {
        if self.window().book.update_send_window(new_limit) {
            tracing::trace!(
                stream_id = self.stream_id,
                new_limit,
                "send window raised"
            );
        }
    }

    pub fn add_bytes_sent(&self, n: u64) -> Result<()> {
        self.window().book.add_bytes_sent(n)
    }

    pub fn add_bytes_read(&self, n: u64) {
        self.window().book.add_bytes_read(n);
        if self.contributes_to_connection {
            self.connection.add_bytes_read(n);
        }
    }

    /// New stream window to advertise to the peer, or 0 when none is due.
    ///
    /// When the auto-tuner grows this stream's increment, the connection
    /// window increment is forced to keep pace.
    pub fn get_window_update(&self) -> u64 {
        let (window, increment) = {
            let mut w = self.window();
            let before = w.book.receive_window_increment;
            let (window, increment) = w.book.get_window_update(Instant::now());
            if increment == before {
                (window, None)
            } else {
                (window, Some(increment))
            }
        };
        if let Some(increment) = increment {
            tracing::debug!(
                stream_id = self.stream_id,
                increment,
                "stream window increment grew"
            );
            self.connection.ensure_minimum_window_increment(
                (increment as f64 * CONNECTION_WINDOW_MULTIPLIER) as u64,
            );
        }
        window
    }

    /// Record the highest byte offset the peer claims to have sent.
    ///
    /// Rejects inconsistent final offsets and receive-window overruns; on a
    /// growing offset the delta is charged against the connection budget.
    /// Duplicate or reordered announcements below the current highest are
    /// tolerated as no-ops.
    pub fn update_highest_received(&self, offset: u64, is_final: bool) -> Result<()> {
        let delta = {
            let mut w = self.window();
            if let Some(final_offset) = w.final_offset {
                if is_final && offset != final_offset {
                    return Err(QmuxError::FlowControl(format!(
                        "stream {}: final offset {} conflicts with recorded final offset {}",
                        self.stream_id, offset, final_offset
                    )));
                }
                if offset > final_offset {
                    return Err(QmuxError::FlowControl(format!(
                        "stream {}: offset {} past final offset {}",
                        self.stream_id, offset, final_offset
                    )));
                }
            }
            if is_final {
                if offset < w.book.highest_received {
                    return Err(QmuxError::FlowControl(format!(
                        "stream {}: final offset {} below received data at {}",
                        self.stream_id, offset, w.book.highest_received
                    )));
                }
                w.final_offset = Some(offset);
            }
            if offset <= w.book.highest_received {
                return Ok(());
            }
            let delta = offset - w.book.highest_received;
            w.book.highest_received = offset;
            if w.book.highest_received > w.book.receive_window {
                return Err(QmuxError::FlowControl(format!(
                    "stream {}: received up to offset {}, window is {}",
                    self.stream_id, w.book.highest_received, w.book.receive_window
                )));
            }
            delta
        };
        if self.contributes_to_connection {
            self.connection.increment_highest_received(delta)?;
        }
        Ok(())
    }

    /// The final offset announced by the peer, once known.
    pub fn final_offset(&self) -> Option<u64> {
        self.window().final_offset
    }

    /// Bytes consumed by the local application so far.
    pub fn bytes_read(&self) -> u64 {
        self.window().book.bytes_read
    }

    pub fn update_rtt(&self, rtt: Duration) {
        self.window().book.rtt = rtt;
    }

    fn window(&self) -> std::sync::MutexGuard<'_, StreamWindow> {
        self.window.lock().expect("stream flow control lock poisoned")
    }
}
