pub mod amf0;
pub mod media;
pub mod protocol_control;
pub mod user_control;
