use super::info::PeerConnectionInfo;
use super::message::{Message, Request};
use crate::data_structures::ID;
use crate::peers::peer::Peer;
use crate::piece_store::BlockRequest;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

pub const MESSAGE_CHANNEL_BUFFER: usize = 1 << 7;

/// Cheap, cloneable way into a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub peer: Peer,
    pub remote_id: ID,
    pub info: PeerConnectionInfo,
    tx: mpsc::Sender<Message>,
    kill: Arc<Notify>,
}

impl SessionHandle {
    pub fn new(peer: Peer, remote_id: ID, info: PeerConnectionInfo, tx: mpsc::Sender<Message>) -> Self {
        Self {
            peer,
            remote_id,
            info,
            tx,
            kill: Arc::new(Notify::new()),
        }
    }

    /// Handle with nothing behind it but its outbound queue.
    #[cfg(test)]
    pub fn detached(peer: Peer, remote_id: ID) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(MESSAGE_CHANNEL_BUFFER);
        (Self::new(peer, remote_id, PeerConnectionInfo::new(), tx), rx)
    }

    pub fn id(&self) -> ID {
        self.peer.id()
    }

    /// Queues without waiting. A full queue means the peer is not reading,
    /// the message is dropped.
    pub fn try_send(&self, message: Message) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(message)) => {
                debug!(peer = %self.peer, ?message, "outbound queue full, dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!(peer = %self.peer, "session already closed");
                false
            }
        }
    }

    pub fn request(&self, block: &BlockRequest) -> bool {
        self.try_send(Message::Request(Request::from(block)))
    }

    /// Asks the session to tear itself down.
    pub fn close(&self) {
        self.kill.notify_one();
    }

    pub async fn closed(&self) {
        self.kill.notified().await
    }
}
