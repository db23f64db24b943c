//! Host environment observables.
//!
//! The engine never looks at a real window or network stack. The host
//! reports focus, visibility and connectivity here and the refetch
//! schedulers of every query on the client react to it.

use quarry_core::constants::DEFAULT_FOCUS_EVENT_CAPACITY;
use quarry_core::{Signal, SignalReader};
use tokio::sync::broadcast;

/// A focus-related event reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusEvent {
    /// The window gained focus.
    Focus,
    /// The document visibility changed.
    VisibilityChange { visible: bool },
}

/// Shared online and focus state for one client.
///
/// Clones share the same signals and event stream.
#[derive(Debug, Clone)]
pub struct Environment {
    online: Signal<bool>,
    focused: Signal<bool>,
    focus_tx: broadcast::Sender<FocusEvent>,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new(true, true)
    }
}

impl Environment {
    pub fn new(online: bool, focused: bool) -> Self {
        let (focus_tx, _rx) = broadcast::channel(DEFAULT_FOCUS_EVENT_CAPACITY);
        Self {
            online: Signal::new(online),
            focused: Signal::new(focused),
            focus_tx,
        }
    }

    // === Connectivity ===

    pub fn is_online(&self) -> bool {
        self.online.get()
    }

    /// Report connectivity. Returns true if the value changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.online.set_if_changed(online);
        if changed {
            tracing::debug!(online, "Connectivity changed");
        }
        changed
    }

    pub fn online(&self) -> SignalReader<bool> {
        self.online.subscribe()
    }

    // === Focus ===

    pub fn has_focus(&self) -> bool {
        self.focused.get()
    }

    /// The window gained focus.
    pub fn focus(&self) {
        self.focused.set_if_changed(true);
        self.emit(FocusEvent::Focus);
    }

    /// The window lost focus. No event is emitted.
    pub fn blur(&self) {
        self.focused.set_if_changed(false);
    }

    /// The document became visible or hidden.
    pub fn set_visible(&self, visible: bool) {
        self.focused.set_if_changed(visible);
        self.emit(FocusEvent::VisibilityChange { visible });
    }

    pub fn focus_events(&self) -> broadcast::Receiver<FocusEvent> {
        self.focus_tx.subscribe()
    }

    fn emit(&self, event: FocusEvent) {
        // No receivers just means no query listens for focus.
        let _ = self.focus_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_online_changes_are_reported_once() {
        let env = Environment::default();
        assert!(env.is_online());
        assert!(!env.set_online(true));
        assert!(env.set_online(false));
        assert!(!env.is_online());
    }

    #[tokio::test]
    async fn test_focus_events_reach_subscribers() {
        let env = Environment::new(true, false);
        let mut rx = env.focus_events();

        env.focus();
        env.set_visible(false);

        assert_eq!(rx.recv().await.unwrap(), FocusEvent::Focus);
        assert_eq!(
            rx.recv().await.unwrap(),
            FocusEvent::VisibilityChange { visible: false }
        );
        assert!(!env.has_focus());
    }

    #[tokio::test]
    async fn test_online_reader_sees_reconnect() {
        let env = Environment::new(false, true);
        let mut reader = env.online();
        env.set_online(true);
        assert!(reader.changed().await);
        assert!(reader.get());
    }
}
