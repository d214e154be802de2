//! Inbound frame dispatcher for one channel.
//!
//! A single task owns the channel's event stream. `Ack` frames settle the
//! sender's [`AckTracker`]; every other frame feeds the [`Receiver`]. The
//! task ends when the channel closes or errors and yields everything that
//! was received.

use super::ack::AckTracker;
use super::frame::{decode, ControlMessage, Frame};
use super::receiver::{ReceiveSummary, Receiver};
use super::{notify, EventSender, TransferEvent, TransferStatus};
use crate::core::channel::{ChannelEvent, ChannelEvents};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct PeerLink;

impl PeerLink {
    pub fn spawn(
        events: ChannelEvents,
        receiver: Receiver,
        acks: AckTracker,
        status: Option<EventSender>,
    ) -> JoinHandle<ReceiveSummary> {
        tokio::spawn(run(events, receiver, acks, status))
    }
}

async fn run(
    mut events: ChannelEvents,
    mut receiver: Receiver,
    acks: AckTracker,
    status: Option<EventSender>,
) -> ReceiveSummary {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Open => {
                info!(event = "channel_open", "Data channel open");
                notify(&status, TransferEvent::Status(TransferStatus::ChannelOpen));
            }
            ChannelEvent::Message(data) => match decode(data) {
                Ok(Frame::Control(ControlMessage::Ack { file_id })) => {
                    debug!(%file_id, "Ack received");
                    acks.acknowledge(file_id);
                }
                Ok(frame) => {
                    if let Err(e) = receiver.handle_frame(frame).await {
                        warn!(event = "frame_handling_failure", error = %e, "Failed to handle frame");
                    }
                }
                Err(e) => {
                    warn!(event = "frame_decode_failure", error = %e, "Dropping undecodable frame");
                }
            },
            ChannelEvent::Error(reason) => {
                warn!(event = "channel_error", %reason, "Data channel error");
                receiver.on_channel_lost();
                notify(&status, TransferEvent::Status(TransferStatus::ChannelError(reason)));
                break;
            }
            ChannelEvent::Close => {
                info!(event = "channel_closed", "Data channel closed");
                receiver.on_channel_lost();
                notify(&status, TransferEvent::Status(TransferStatus::ChannelClosed));
                break;
            }
        }
    }
    receiver.on_channel_lost();
    receiver.into_summary().await
}
