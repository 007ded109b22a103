//! In-process loopback controller. Nothing is exposed to the OS; the last committed
//! report is kept so it can be inspected, and feedback can be injected from any thread.

use super::{ControllerFactory, Feedback, Mode, PadReport, VirtualController};
use crate::bridge::FeedbackSender;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct Shared {
    report: PadReport,
    commits: usize,
    released: bool,
}

pub struct MemoryController {
    mode: Mode,
    shared: Arc<Mutex<Shared>>,
}

impl VirtualController for MemoryController {
    fn mode(&self) -> Mode {
        self.mode
    }

    fn update(&mut self, report: &PadReport) -> anyhow::Result<()> {
        let mut shared = self
            .shared
            .lock()
            .map_err(|_| anyhow::anyhow!("Memory controller state poisoned"))?;
        shared.report = report.clone();
        shared.commits += 1;
        log::trace!("Memory {} controller report: {:?}", self.mode, report);
        Ok(())
    }
}

impl Drop for MemoryController {
    fn drop(&mut self) {
        if let Ok(mut shared) = self.shared.lock() {
            shared.released = true;
        }
        log::debug!("Memory {} controller released", self.mode);
    }
}

/// Observer side of a [`MemoryController`]
#[derive(Clone)]
pub struct MemoryHandle {
    mode: Mode,
    shared: Arc<Mutex<Shared>>,
    feedback: FeedbackSender,
}

impl MemoryHandle {
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Last report the controller committed
    pub fn report(&self) -> PadReport {
        self.shared
            .lock()
            .map(|shared| shared.report.clone())
            .unwrap_or_default()
    }

    pub fn commits(&self) -> usize {
        self.shared.lock().map(|shared| shared.commits).unwrap_or(0)
    }

    pub fn is_released(&self) -> bool {
        self.shared.lock().map(|shared| shared.released).unwrap_or(true)
    }

    /// Simulate the host sending rumble or LED data to this controller
    pub fn inject_feedback(&self, feedback: Feedback) -> bool {
        self.feedback.notify(feedback)
    }
}

/// Factory that keeps a handle to its controllers, oldest first. Handles of released
/// controllers are dropped on the next `create`.
#[derive(Clone, Default)]
pub struct MemoryFactory {
    created: Arc<Mutex<Vec<MemoryHandle>>>,
}

impl MemoryFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handles(&self) -> Vec<MemoryHandle> {
        self.created
            .lock()
            .map(|created| created.clone())
            .unwrap_or_default()
    }

    pub fn last(&self) -> Option<MemoryHandle> {
        self.handles().pop()
    }

    /// Controllers that have not been released yet
    pub fn live(&self) -> Vec<MemoryHandle> {
        self.handles()
            .into_iter()
            .filter(|handle| !handle.is_released())
            .collect()
    }
}

impl ControllerFactory for MemoryFactory {
    fn create(
        &self,
        mode: Mode,
        feedback: FeedbackSender,
    ) -> anyhow::Result<Box<dyn VirtualController>> {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let handle = MemoryHandle {
            mode,
            shared: Arc::clone(&shared),
            feedback,
        };
        let mut created = self
            .created
            .lock()
            .map_err(|_| anyhow::anyhow!("Memory factory state poisoned"))?;
        created.retain(|existing| !existing.is_released());
        created.push(handle);
        drop(created);
        log::info!("Memory {} controller created", mode);
        Ok(Box::new(MemoryController { mode, shared }))
    }
}
