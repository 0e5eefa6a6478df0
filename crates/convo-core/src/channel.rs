//! Plumbing between frontends and the sync runtime.
//!
//! Commands are queued in order on a bounded mpsc; every frontend gets its
//! own copy of each event through a broadcast.

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::types::{SyncCommand, SyncEvent};

/// What a frontend reads runtime output from.
pub type EventStream = broadcast::Receiver<SyncEvent>;

#[derive(Debug, Error)]
pub enum SyncChannelError {
    /// The runtime has stopped reading commands.
    #[error("sync runtime is no longer accepting commands")]
    CommandChannelClosed,
}

/// Shared sending side of a runtime's command queue and event fan-out.
#[derive(Clone, Debug)]
pub struct SyncChannels {
    command_tx: mpsc::Sender<SyncCommand>,
    event_tx: broadcast::Sender<SyncEvent>,
}

impl SyncChannels {
    /// Build the queues. The returned receiver belongs to the runtime loop.
    ///
    /// Zero capacities are raised to one.
    pub fn new(command_buffer: usize, event_buffer: usize) -> (Self, mpsc::Receiver<SyncCommand>) {
        let (command_tx, command_rx) = mpsc::channel(command_buffer.max(1));
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));

        (
            Self {
                command_tx,
                event_tx,
            },
            command_rx,
        )
    }

    /// Events emitted from now on. Earlier events are not replayed.
    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Queue a command, waiting while the queue is full.
    pub async fn send_command(&self, command: SyncCommand) -> Result<(), SyncChannelError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| SyncChannelError::CommandChannelClosed)
    }

    /// Publish to every current subscriber. With no subscribers the event
    /// is dropped; a subscriber that falls behind sees `Lagged`.
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.event_tx.send(event);
    }
}
