//! Resources held by one stream session.

use crate::client::{ClientView, Unsubscribe};

/// Listener and view acquired for a stream, released exactly once.
pub(crate) struct StreamSession {
    label: &'static str,
    remove_listener: Option<Unsubscribe>,
    view: Option<Box<dyn ClientView>>,
}

impl StreamSession {
    pub(crate) fn new(
        label: &'static str,
        remove_listener: Unsubscribe,
        view: Option<Box<dyn ClientView>>,
    ) -> Self {
        Self {
            label,
            remove_listener: Some(remove_listener),
            view,
        }
    }

    /// Remove the listener and destroy the view. Later calls do nothing.
    pub(crate) fn release(&mut self) {
        let remove = self.remove_listener.take();
        let view = self.view.take();
        if remove.is_none() && view.is_none() {
            return;
        }

        if let Some(remove) = remove {
            remove();
        }
        if let Some(view) = view {
            view.destroy();
        }
        tracing::trace!(stream = self.label, "stream session released");
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.release();
    }
}
