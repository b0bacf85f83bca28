pub mod config;
pub mod error;
pub mod flow_control;
pub mod stream;
pub mod stream_id;
pub mod streams_map;

pub use config::{Config, ConfigBuilder};
pub use error::{QmuxError, Result};
pub use flow_control::{ConnectionFlowControl, StreamFlowControl};
pub use stream::Stream;
pub use stream_id::{classify, Classification, Role, StreamId, StreamIdAllocator};
pub use streams_map::{StreamFactory, StreamsMap, CRYPTO_STREAM_ID, HEADERS_STREAM_ID};
