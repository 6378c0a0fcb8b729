//! Built-in processors registered by the command-line binary.

use super::processor::{ProcessorContext, StageProcessor};
use crate::core::AgentOutput;
use crate::errors::AgentError;
use async_trait::async_trait;
use serde_json::{json, Value};

/// Returns its payload under `echo`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoProcessor;

#[async_trait]
impl StageProcessor for EchoProcessor {
    async fn execute(&self, payload: Value, ctx: ProcessorContext) -> Result<AgentOutput, AgentError> {
        ctx.report_progress(100, None);
        Ok(AgentOutput::ok_value("echo", payload).with_field("attempt", json!(ctx.attempt)))
    }
}

/// Always fails, with a message taken from the payload's `message` field.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailProcessor {
    /// Report `success: false` instead of returning an error.
    pub soft: bool,
}

#[async_trait]
impl StageProcessor for FailProcessor {
    async fn execute(&self, payload: Value, _ctx: ProcessorContext) -> Result<AgentOutput, AgentError> {
        let message = payload
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("demo failure")
            .to_string();
        if self.soft {
            Ok(AgentOutput::failed(message))
        } else {
            Err(AgentError::new(message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::Services;

    #[tokio::test]
    async fn test_echo_and_fail() {
        let ctx = ProcessorContext::direct(None, 1, Services::default());

        let echoed = EchoProcessor.execute(json!({"x": 1}), ctx.clone()).await.unwrap();
        assert_eq!(echoed.get("echo"), Some(&json!({"x": 1})));

        let err = FailProcessor::default()
            .execute(json!({"message": "nope"}), ctx.clone())
            .await
            .unwrap_err();
        assert_eq!(err.message, "nope");

        let soft = FailProcessor { soft: true }.execute(json!({}), ctx).await.unwrap();
        assert!(!soft.success);
        assert_eq!(soft.error(), Some("demo failure"));
    }
}
