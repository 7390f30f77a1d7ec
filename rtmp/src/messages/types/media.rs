//! Inspection of the first bytes of audio and video payloads.  The layout is the FLV
//! audio/video tag body, which RTMP media messages carry unchanged.

const VIDEO_FRAME_TYPE_KEYFRAME: u8 = 1;
const VIDEO_CODEC_AVC: u8 = 7;
const AUDIO_FORMAT_AAC: u8 = 10;

/// True when the video payload starts a keyframe, the only place playback may begin
pub fn is_video_keyframe(data: &[u8]) -> bool {
    match data.first() {
        Some(byte) => byte >> 4 == VIDEO_FRAME_TYPE_KEYFRAME,
        None => false,
    }
}

/// True for an AVC decoder configuration record, which players need before any frame
pub fn is_video_sequence_header(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] & 0x0F == VIDEO_CODEC_AVC && data[1] == 0
}

/// True for an AAC audio specific config
pub fn is_audio_sequence_header(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] >> 4 == AUDIO_FORMAT_AAC && data[1] == 0
}
