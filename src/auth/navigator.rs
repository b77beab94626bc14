//! Login surface collaborator, signalled on forced logout

use std::sync::atomic::{AtomicBool, Ordering};

/// Presents the login surface when the session ends.
pub trait Navigator: Send + Sync {
    /// Whether the login surface is already showing.
    fn on_login_surface(&self) -> bool;

    /// Switch to the login surface.
    fn show_login(&self);

    /// Called after a successful login.
    fn leave_login(&self) {}

    /// Show the login surface unless it is already up.
    fn navigate_to_login(&self) {
        if !self.on_login_surface() {
            self.show_login();
        }
    }
}

/// Terminal navigator: tells the user to log in again, once.
#[derive(Debug, Default)]
pub struct ConsoleNavigator {
    shown: AtomicBool,
}

impl ConsoleNavigator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Navigator for ConsoleNavigator {
    fn on_login_surface(&self) -> bool {
        self.shown.load(Ordering::SeqCst)
    }

    fn show_login(&self) {
        if !self.shown.swap(true, Ordering::SeqCst) {
            eprintln!("Session ended. Run 'marketlink login' to sign in again.");
        }
    }

    fn leave_login(&self) {
        self.shown.store(false, Ordering::SeqCst);
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingNavigator;
    use super::*;

    #[test]
    fn test_navigation_is_idempotent() {
        let nav = RecordingNavigator::default();
        nav.navigate_to_login();
        nav.navigate_to_login();
        assert_eq!(nav.count(), 1);
    }

    #[test]
    fn test_console_navigator_resets() {
        let nav = ConsoleNavigator::new();
        assert!(!nav.on_login_surface());
        nav.navigate_to_login();
        assert!(nav.on_login_surface());
        nav.leave_login();
        assert!(!nav.on_login_surface());
    }
}
