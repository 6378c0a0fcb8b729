//! Notification actions bound to run events.

use crate::definition::{NotificationAction, NotifyLevel};
use crate::events::SharedEventSink;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};

/// One occurrence of a notifiable event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    /// Event name, e.g. `stage.failed`.
    pub event: String,
    /// Run id.
    pub run_id: String,
    /// Run topic.
    pub topic: String,
    /// Pipeline name.
    pub pipeline: String,
    /// Stage the event is about.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Failure reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Notification {
    /// Fills `{{event}}`, `{{stage}}`, `{{run_id}}`, `{{topic}}`,
    /// `{{pipeline}}` and `{{error}}` in a template.
    #[must_use]
    pub fn render(&self, template: &str) -> String {
        template
            .replace("{{event}}", &self.event)
            .replace("{{stage}}", self.stage.as_deref().unwrap_or(""))
            .replace("{{run_id}}", &self.run_id)
            .replace("{{topic}}", &self.topic)
            .replace("{{pipeline}}", &self.pipeline)
            .replace("{{error}}", self.error.as_deref().unwrap_or(""))
    }
}

/// Runs the configured actions for each event.
pub struct Notifier {
    actions: BTreeMap<String, Vec<NotificationAction>>,
    sink: SharedEventSink,
}

impl Notifier {
    /// Creates a notifier over a pipeline's `notifications` table.
    #[must_use]
    pub fn new(actions: BTreeMap<String, Vec<NotificationAction>>, sink: SharedEventSink) -> Self {
        Self { actions, sink }
    }

    /// Runs every action bound to `notification.event`.
    pub async fn notify(&self, notification: &Notification) {
        let Some(actions) = self.actions.get(&notification.event) else {
            return;
        };

        for action in actions {
            match action {
                NotificationAction::Log { message, level } => {
                    let text = notification.render(message);
                    match level {
                        NotifyLevel::Debug => debug!(event = %notification.event, run_id = %notification.run_id, "{}", text),
                        NotifyLevel::Info => info!(event = %notification.event, run_id = %notification.run_id, "{}", text),
                        NotifyLevel::Warn => warn!(event = %notification.event, run_id = %notification.run_id, "{}", text),
                        NotifyLevel::Error => error!(event = %notification.event, run_id = %notification.run_id, "{}", text),
                    }
                }
                NotificationAction::Emit { event } => {
                    let event_type = event
                        .clone()
                        .unwrap_or_else(|| format!("notification.{}", notification.event));
                    let data = serde_json::to_value(notification).unwrap_or(Value::Null);
                    self.sink.emit(&event_type, Some(data)).await;
                }
            }
        }
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("events", &self.actions.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use serde_json::json;
    use std::sync::Arc;

    fn notification(event: &str) -> Notification {
        Notification {
            event: event.into(),
            run_id: "r1".into(),
            topic: "rust".into(),
            pipeline: "book".into(),
            stage: Some("write".into()),
            error: Some("boom".into()),
        }
    }

    #[test]
    fn test_render() {
        let text = notification("stage.failed")
            .render("{{event}} in {{stage}} of {{run_id}} ({{pipeline}}/{{topic}}): {{error}}");
        assert_eq!(text, "stage.failed in write of r1 (book/rust): boom");
    }

    #[tokio::test]
    async fn test_emit_actions() {
        let sink = Arc::new(CollectingEventSink::new());
        let mut actions = BTreeMap::new();
        actions.insert(
            "stage.failed".to_string(),
            vec![
                NotificationAction::Log {
                    message: "{{stage}} failed".into(),
                    level: NotifyLevel::Warn,
                },
                NotificationAction::Emit { event: None },
                NotificationAction::Emit {
                    event: Some("alerts.page".into()),
                },
            ],
        );
        let notifier = Notifier::new(actions, sink.clone());

        notifier.notify(&notification("stage.failed")).await;
        notifier.notify(&notification("run.completed")).await;

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, "notification.stage.failed");
        assert_eq!(events[1].0, "alerts.page");
        assert_eq!(events[1].1.as_ref().unwrap()["stage"], json!("write"));
    }
}
