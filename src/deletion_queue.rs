// Deletion queue - deferred teardown in reverse registration order

/// Cleanup actions run last-in, first-out on `flush`
#[derive(Default)]
pub struct DeletionQueue {
    actions: Vec<Box<dyn FnOnce() + Send>>,
}

impl DeletionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: impl FnOnce() + Send + 'static) {
        self.actions.push(Box::new(action));
    }

    /// Run every queued action, newest first, and empty the queue
    pub fn flush(&mut self) {
        while let Some(action) = self.actions.pop() {
            action();
        }
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl Drop for DeletionQueue {
    fn drop(&mut self) {
        if !self.actions.is_empty() {
            log::warn!(
                "Deletion queue dropped with {} pending actions, flushing",
                self.actions.len()
            );
            self.flush();
        }
    }
}
