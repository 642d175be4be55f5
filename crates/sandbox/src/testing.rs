use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::Level;

use crate::api::SandboxApi;

/// Captures what resources tell the sandbox owner.
#[derive(Default)]
pub(crate) struct RecordingApi {
    pub logs: Mutex<Vec<(Level, String)>>,
    killed: AtomicBool,
}

impl RecordingApi {
    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

impl SandboxApi for RecordingApi {
    fn sandbox_id(&self) -> &str {
        "sandbox1"
    }

    fn log(&self, level: Level, message: &str) {
        self.logs.lock().unwrap().push((level, message.to_string()));
    }

    fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }
}
