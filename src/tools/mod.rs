//! Tool dispatch for assistant-requested calls
//!
//! The assistant requests a tool over the event channel; the dispatcher
//! validates the arguments, runs the backend call, and always yields an
//! output payload — backend failures become a serialized failure indication
//! so the conversation can react verbally instead of stalling.

mod pubmed;

pub use pubmed::{FullTextQuery, FullTextResult, Paper, PubmedClient, PubmedQuery};

use crate::session::PendingToolCall;
use crate::{Error, Result};

/// Executes assistant-requested tool calls against the backend
pub struct ToolDispatcher {
    pubmed: PubmedClient,
}

impl ToolDispatcher {
    /// Create a dispatcher against the given backend base URL
    #[must_use]
    pub fn new(api_base: &str) -> Self {
        Self {
            pubmed: PubmedClient::new(api_base),
        }
    }

    /// Run a tool call and produce its output payload.
    ///
    /// Never fails: argument and backend errors are folded into a failure
    /// payload tagged for the same call.
    pub async fn dispatch(&self, call: &PendingToolCall) -> String {
        match self.run(call).await {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(name = %call.name, call_id = %call.call_id, error = %e, "tool call failed");
                serde_json::json!({
                    "success": false,
                    "error": e.to_string(),
                })
                .to_string()
            }
        }
    }

    async fn run(&self, call: &PendingToolCall) -> Result<String> {
        match call.name.as_str() {
            "search_pubmed" => {
                let query: PubmedQuery = parse_arguments(&call.arguments)?;
                let papers = self.pubmed.search(&query).await?;
                Ok(serde_json::to_string(&papers)?)
            }
            "get_full_text" => {
                let query: FullTextQuery = parse_arguments(&call.arguments)?;
                let result = self.pubmed.full_text(&query).await?;
                Ok(serde_json::to_string(&result)?)
            }
            other => Err(Error::ToolBackendFailure(format!("unknown tool: {other}"))),
        }
    }
}

/// Parse the JSON argument string the protocol delivers
fn parse_arguments<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| Error::MalformedEvent(format!("tool arguments: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, arguments: &str) -> PendingToolCall {
        PendingToolCall {
            call_id: "call_1".to_string(),
            name: name.to_string(),
            arguments: arguments.to_string(),
        }
    }

    #[test]
    fn arguments_parse_into_typed_query() {
        let query: PubmedQuery =
            parse_arguments(r#"{"query":"sarcopenia","retmax":5}"#).unwrap();
        assert_eq!(query.query, "sarcopenia");
        assert_eq!(query.retmax, Some(5));
        assert_eq!(query.mindate, None);
    }

    #[test]
    fn bad_arguments_are_malformed() {
        let result: Result<PubmedQuery> = parse_arguments("not json");
        assert!(matches!(result, Err(Error::MalformedEvent(_))));

        // Missing required field
        let result: Result<FullTextQuery> = parse_arguments("{}");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn unknown_tool_yields_failure_payload() {
        let dispatcher = ToolDispatcher::new("http://localhost:8000");
        let output = dispatcher.dispatch(&call("make_coffee", "{}")).await;

        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["success"], false);
        assert!(
            value["error"]
                .as_str()
                .unwrap()
                .contains("unknown tool: make_coffee")
        );
    }

    #[tokio::test]
    async fn invalid_arguments_yield_failure_payload_without_network() {
        let dispatcher = ToolDispatcher::new("http://localhost:8000");
        let output = dispatcher.dispatch(&call("search_pubmed", "{}")).await;

        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["success"], false);
    }
}
