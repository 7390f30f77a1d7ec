use super::events::ServerSessionEvent;
use crate::chunk_io::Packet;
use crate::messages::MessagePayload;
use crate::playback::DeliveryTicket;

/// One step of work the caller performs for a session, in order
#[derive(PartialEq, Debug)]
pub enum ServerSessionResult {
    /// Bytes for the peer.  Chunk headers are compressed against earlier packets, so
    /// write them in the order returned.
    OutboundResponse(Packet),

    /// A packet of paced media.  Once it has been written the ticket must be handed back
    /// through `ServerSession::delivery_completed` for playback to continue.
    OutboundMedia { packet: Packet, ticket: DeliveryTicket },

    /// Playback continues after a delay.  When it passes, call
    /// `ServerSession::deliver_timer_event` with the conversation id.
    ScheduleDelivery { conversation_id: u32, delay_ms: u32 },

    /// See `ServerSessionEvent`
    RaisedEvent(ServerSessionEvent),

    /// A message the session ignores, such as shared object traffic
    UnhandleableMessageReceived(MessagePayload),
}
