//! Progress handle shared by the components reporting what the agent is doing

use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Default)]
struct Progress {
    current: Option<String>,
    saved: Option<String>,
}

/// Cloneable handle to the current activity message.
#[derive(Debug, Clone)]
pub struct ProgressHandle {
    inner: Arc<Mutex<Progress>>,
}

impl Default for ProgressHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Progress::default())),
        }
    }

    pub fn update(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(progress = %message);
        self.inner.lock().current = Some(message);
    }

    pub fn current(&self) -> Option<String> {
        self.inner.lock().current.clone()
    }

    /// Remember the current message so a temporary one can be shown.
    pub fn save(&self) {
        let mut progress = self.inner.lock();
        progress.saved = progress.current.clone();
    }

    pub fn restore(&self) {
        let mut progress = self.inner.lock();
        progress.current = progress.saved.take();
    }

    pub fn clear(&self) {
        let mut progress = self.inner.lock();
        progress.current = None;
        progress.saved = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_restore() {
        let progress = ProgressHandle::new();
        progress.update("Updating packages");
        progress.save();

        let clone = progress.clone();
        clone.update("Waiting for dpkg lock");
        assert_eq!(progress.current().as_deref(), Some("Waiting for dpkg lock"));

        progress.restore();
        assert_eq!(progress.current().as_deref(), Some("Updating packages"));
        progress.clear();
        assert!(progress.current().is_none());
    }
}
