//! Sessions react to incoming RTMP messages (encoded as RTMP chunks) with packets to be sent
//! as a response, and raise events that applications can perform custom logic on.

mod live;
mod server;

pub use self::live::{LiveStream, LiveStreamError, StreamRegistry, Subscriber};
pub use self::server::{
    PlaySource, PlayStartValue, PublishMode, ServerSession, ServerSessionConfig, ServerSessionError,
    ServerSessionEvent, ServerSessionResult,
};
