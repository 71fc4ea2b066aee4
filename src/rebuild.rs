// Rebuild notifications
//
// Dependents holding per-image resources register one "before" and one
// "after" handler under a stable name. Handlers run in name order.

use crate::backend::Swapchain;
use std::collections::BTreeMap;

pub type RebuildCallback = Box<dyn FnMut(&Swapchain) + Send>;

#[derive(Default)]
pub struct RebuildCallbacks {
    before: BTreeMap<String, RebuildCallback>,
    after: BTreeMap<String, RebuildCallback>,
}

impl RebuildCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with the old swapchain while it is still fully valid.
    /// Registering again under the same name replaces the handler.
    pub fn register_before(&mut self, name: impl Into<String>, callback: RebuildCallback) {
        self.before.insert(name.into(), callback);
    }

    /// Called with the new swapchain once it is ready for use
    pub fn register_after(&mut self, name: impl Into<String>, callback: RebuildCallback) {
        self.after.insert(name.into(), callback);
    }

    /// Drop both handlers registered under `name`; returns whether any existed
    pub fn unregister(&mut self, name: &str) -> bool {
        let before = self.before.remove(name).is_some();
        let after = self.after.remove(name).is_some();
        before || after
    }

    pub fn notify_before(&mut self, swapchain: &Swapchain) {
        for (name, callback) in self.before.iter_mut() {
            log::debug!("Before-rebuild: {}", name);
            callback(swapchain);
        }
    }

    pub fn notify_after(&mut self, swapchain: &Swapchain) {
        for (name, callback) in self.after.iter_mut() {
            log::debug!("After-rebuild: {}", name);
            callback(swapchain);
        }
    }

    pub fn len(&self) -> usize {
        self.before.len() + self.after.len()
    }

    pub fn is_empty(&self) -> bool {
        self.before.is_empty() && self.after.is_empty()
    }
}
