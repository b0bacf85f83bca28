use crate::error::{QmuxError, Result};
use std::time::Duration;

/// Configuration for a qmux connection core.
///
/// `Config` contains the tunable parameters of the stream table and the
/// flow controllers: stream-count limits and the receive-window geometry
/// used by window auto-tuning.
///
/// # Examples
///
/// ## Using default configuration
///
/// ```rust
/// use qmux::Config;
///
/// let config = Config::default();
/// assert_eq!(config.max_peer_streams, 100);
/// ```
///
/// ## Creating custom configuration
///
/// ```rust
/// use qmux::ConfigBuilder;
/// use std::time::Duration;
///
/// let config = ConfigBuilder::new()
///     .max_peer_streams(32)
///     .initial_stream_receive_window(128 * 1024)
///     .initial_connection_receive_window(256 * 1024)
///     .expected_rtt(Duration::from_millis(50))
///     .build()
///     .expect("Valid configuration");
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// How many peer-initiated streams may be open at once.
    pub max_peer_streams: usize,
    /// Receive window initially granted to the peer on every new stream.
    pub initial_stream_receive_window: u64,
    /// Upper bound the stream window auto-tuner may grow the increment to.
    pub max_stream_receive_window: u64,
    /// Receive window initially granted for the whole connection.
    pub initial_connection_receive_window: u64,
    /// Upper bound for the connection window increment.
    pub max_connection_receive_window: u64,
    /// Round-trip estimate the window auto-tuner scales its threshold by,
    /// until the transport supplies a measured value.
    pub expected_rtt: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_peer_streams: 100,
            initial_stream_receive_window: 64 * 1024,        // 64KB
            max_stream_receive_window: 6 * 1024 * 1024,      // 6MB
            initial_connection_receive_window: 96 * 1024,    // 1.5x stream window
            max_connection_receive_window: 15 * 1024 * 1024, // 15MB
            expected_rtt: Duration::from_millis(100),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.max_peer_streams == 0 {
            return Err(QmuxError::Config(
                "Max peer streams cannot be 0".to_string(),
            ));
        }

        if self.initial_stream_receive_window == 0 {
            return Err(QmuxError::Config(
                "Initial stream receive window cannot be 0".to_string(),
            ));
        }

        if self.max_stream_receive_window < self.initial_stream_receive_window {
            return Err(QmuxError::Config(
                "Max stream receive window must be at least the initial window".to_string(),
            ));
        }

        if self.initial_connection_receive_window < self.initial_stream_receive_window {
            return Err(QmuxError::Config(
                "Connection receive window must be at least as large as one stream window"
                    .to_string(),
            ));
        }

        if self.max_connection_receive_window < self.initial_connection_receive_window {
            return Err(QmuxError::Config(
                "Max connection receive window must be at least the initial window".to_string(),
            ));
        }

        if self.expected_rtt.is_zero() {
            return Err(QmuxError::Config(
                "Expected RTT cannot be zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for creating custom `Config` instances.
///
/// Starts from default values and allows selective overriding of specific
/// settings; `build` validates the result.
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn max_peer_streams(mut self, max: usize) -> Self {
        self.config.max_peer_streams = max;
        self
    }

    pub fn initial_stream_receive_window(mut self, window: u64) -> Self {
        self.config.initial_stream_receive_window = window;
        self
    }

    pub fn max_stream_receive_window(mut self, window: u64) -> Self {
        self.config.max_stream_receive_window = window;
        self
    }

    pub fn initial_connection_receive_window(mut self, window: u64) -> Self {
        self.config.initial_connection_receive_window = window;
        self
    }

    pub fn max_connection_receive_window(mut self, window: u64) -> Self {
        self.config.max_connection_receive_window = window;
        self
    }

    pub fn expected_rtt(mut self, rtt: Duration) -> Self {
        self.config.expected_rtt = rtt;
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
