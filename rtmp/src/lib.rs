//! RTMP chunk stream codec and server session with paced playback of seekable media.
//!
//! The crate does no IO.  Bytes received from a client go into a `ServerSession`, and
//! everything the session wants sent back comes out as packets that must be written in
//! order.  Recorded media is read from a `MediaSource` and paced by a `PlaybackPublisher`
//! so the player's buffer stays about `buffer_duration_ms` ahead of what it is showing.
//!
//! Handshaking is left to the application and must be complete before any bytes are
//! handed to the session.


pub mod chunk_io;
pub mod media;
pub mod messages;
pub mod playback;
pub mod sessions;
