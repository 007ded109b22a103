//! Hand-off of device feedback into the owning session's task.
//!
//! Backends report rumble and LED changes from their own threads (the ViGEm
//! notification thread, the uinput force-feedback poller). Those threads only ever
//! enqueue; the session task drains the queue between commands and is the single
//! writer of its feedback state.

use crate::virtual_controller::Feedback;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy)]
struct FeedbackEvent {
    generation: u64,
    feedback: Feedback,
}

/// Thread-safe, non-blocking producer half handed to a virtual controller
#[derive(Debug, Clone)]
pub struct FeedbackSender {
    generation: u64,
    tx: mpsc::UnboundedSender<FeedbackEvent>,
}

impl FeedbackSender {
    /// Queue a notification. Returns `false` once the session is gone, in which case
    /// the notification is dropped.
    pub fn notify(&self, feedback: Feedback) -> bool {
        self.tx
            .send(FeedbackEvent {
                generation: self.generation,
                feedback,
            })
            .is_ok()
    }

    /// A sender that is not connected to any session
    pub fn detached() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { generation: 0, tx }
    }
}

/// Consumer half, owned by a session
#[derive(Debug)]
pub struct FeedbackBridge {
    generation: u64,
    tx: mpsc::UnboundedSender<FeedbackEvent>,
    rx: mpsc::UnboundedReceiver<FeedbackEvent>,
}

impl FeedbackBridge {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            generation: 0,
            tx,
            rx,
        }
    }

    /// Sender for a freshly created device. Notifications from senders issued
    /// earlier are discarded from now on.
    pub fn next_sender(&mut self) -> FeedbackSender {
        self.generation += 1;
        FeedbackSender {
            generation: self.generation,
            tx: self.tx.clone(),
        }
    }

    /// Wait for the next notification from the current device. Cancel safe.
    pub async fn recv(&mut self) -> Option<Feedback> {
        loop {
            let event = self.rx.recv().await?;
            if event.generation == self.generation {
                return Some(event.feedback);
            }
            log::trace!(
                "Dropping feedback from replaced device (generation {} != {})",
                event.generation,
                self.generation
            );
        }
    }

    /// Non-blocking variant of [`FeedbackBridge::recv`]
    pub fn try_recv(&mut self) -> Option<Feedback> {
        while let Ok(event) = self.rx.try_recv() {
            if event.generation == self.generation {
                return Some(event.feedback);
            }
        }
        None
    }
}

impl Default for FeedbackBridge {
    fn default() -> Self {
        Self::new()
    }
}
