//! Paces recorded media out to a player.
//!
//! A `PlaybackPublisher` does no IO of its own.  Each call returns the actions its owner
//! must carry out (write a message, arm a timer) and the owner reports back when a write
//! completes or a timer fires.  Every start, pause and stop begins a new conversation, and
//! events tagged with an older conversation id are ignored, so a timer or write completion
//! left over from before a seek can never drive the new playback.

mod clock;
mod config;
mod errors;
mod publisher;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::config::PlaybackConfig;
pub use self::errors::PlaybackError;
pub use self::publisher::{DeliveryTicket, PlaybackAction, PlaybackEvent, PlaybackPublisher};
