// src/utils/notify.rs
//! Persistent user-visible notifications
//!
//! The engine raises notifications for migration-in-progress, migration
//! failure and connection failure. The hub frontend supplies its own
//! implementation; the default logs through tracing so a headless engine
//! still surfaces the condition.

use tracing::{info, warn};

/// Notification ids raised by the engine
pub const NOTIFY_MIGRATION_IN_PROGRESS: &str = "recorder_migration_in_progress";
pub const NOTIFY_MIGRATION_FAILED: &str = "recorder_migration_failed";
pub const NOTIFY_CONNECTION_FAILED: &str = "recorder_connection_failed";
pub const NOTIFY_BACKUP_UNTRUSTWORTHY: &str = "recorder_backup_untrustworthy";

/// Sink for persistent user-visible notifications
pub trait Notifier: Send + Sync {
    /// Create or replace a persistent notification
    fn create(&self, notification_id: &str, title: &str, message: &str);

    /// Dismiss a previously created notification; unknown ids are a no-op
    fn dismiss(&self, notification_id: &str);
}

/// Default notifier: logs instead of rendering
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn create(&self, notification_id: &str, title: &str, message: &str) {
        warn!(id = notification_id, title, "{}", message);
    }

    fn dismiss(&self, notification_id: &str) {
        info!(id = notification_id, "notification dismissed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Captures notifications for assertions
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub created: Mutex<Vec<String>>,
        pub dismissed: Mutex<Vec<String>>,
    }

    impl Notifier for RecordingNotifier {
        fn create(&self, notification_id: &str, _title: &str, _message: &str) {
            self.created.lock().push(notification_id.to_string());
        }

        fn dismiss(&self, notification_id: &str) {
            self.dismissed.lock().push(notification_id.to_string());
        }
    }

    #[test]
    fn test_log_notifier_does_not_panic() {
        let notifier = LogNotifier;
        notifier.create(NOTIFY_CONNECTION_FAILED, "title", "message");
        notifier.dismiss(NOTIFY_CONNECTION_FAILED);
    }

    #[test]
    fn test_recording_notifier_captures() {
        let notifier = RecordingNotifier::default();
        notifier.create(NOTIFY_MIGRATION_IN_PROGRESS, "t", "m");
        notifier.dismiss(NOTIFY_MIGRATION_IN_PROGRESS);
        assert_eq!(notifier.created.lock().len(), 1);
        assert_eq!(notifier.dismissed.lock().len(), 1);
    }
}
