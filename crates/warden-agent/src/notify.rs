/// Abstract notification capability. The core decides *when* to alert
/// (process started/stopped, update started/finished, errors); delivery
/// (email, Discord, plugins) lives behind this seam and is out of scope.
pub trait AlertSink: Send + Sync {
    fn notify(&self, subject: &str, body: &str, attach_log: bool);
}

/// Default sink: structured log lines only.
#[derive(Debug, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn notify(&self, subject: &str, body: &str, attach_log: bool) {
        tracing::info!(subject, attach_log, "alert: {body}");
    }
}
