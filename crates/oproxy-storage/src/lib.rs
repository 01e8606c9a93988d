pub mod memory;
pub mod mirror;
pub mod replay;
pub mod stream_log;

pub use memory::MemoryStreamLog;
pub use mirror::{mirror_sse_stream, mirror_sse_stream_default};
pub use replay::{
    REPLAY_BLOCK_MS, REPLAY_COUNT, REPLAY_START_ID, replay_stream, replay_stream_default,
};
pub use stream_log::{RedisStreamLog, StreamEntry, StreamLog, StreamLogError, TERMINAL_MAXLEN};
