//! Cross-thread message injection.

use std::{fmt, sync::Arc};

use tokio::sync::mpsc::UnboundedSender;

use crate::{error::BroadcastError, net::Wake};

/// Handle for injecting messages into a running [`Manager`](crate::Manager)
/// from any thread.
///
/// Each message is delivered as [`Event::Broadcast`](crate::Event::Broadcast)
/// to every live connection during the next poll pass. Sending wakes a
/// blocked [`Manager::poll`](crate::Manager::poll).
#[derive(Clone)]
pub struct Broadcaster {
    tx: UnboundedSender<Vec<u8>>,
    waker: Option<Arc<dyn Wake>>,
    max: usize,
}

impl fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broadcaster")
            .field("max", &self.max)
            .field("closed", &self.tx.is_closed())
            .finish_non_exhaustive()
    }
}

impl Broadcaster {
    pub(crate) fn new(
        tx: UnboundedSender<Vec<u8>>,
        waker: Option<Arc<dyn Wake>>,
        max: usize,
    ) -> Self {
        Self { tx, waker, max }
    }

    /// Queue `msg` for delivery to every connection.
    ///
    /// # Errors
    ///
    /// Returns [`BroadcastError::TooLarge`] for oversized payloads,
    /// [`BroadcastError::Closed`] once the manager is dropped and
    /// [`BroadcastError::Wake`] when the reactor could not be woken.
    pub fn send(&self, msg: &[u8]) -> Result<(), BroadcastError> {
        if msg.len() > self.max {
            return Err(BroadcastError::TooLarge {
                size: msg.len(),
                max: self.max,
            });
        }
        self.tx
            .send(msg.to_vec())
            .map_err(|_| BroadcastError::Closed)?;
        if let Some(waker) = &self.waker {
            waker.wake().map_err(|e| BroadcastError::Wake(e.kind()))?;
        }
        Ok(())
    }
}
