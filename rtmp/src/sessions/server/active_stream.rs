use super::PublishMode;

pub enum StreamState {
    Created,

    Publishing {
        stream_key: String,
        mode: PublishMode,
    },

    Playing {
        stream_key: String,
        is_live: bool,
    },
}

pub struct ActiveStream {
    pub current_state: StreamState,
}

impl ActiveStream {
    pub fn new() -> ActiveStream {
        ActiveStream {
            current_state: StreamState::Created,
        }
    }
}
