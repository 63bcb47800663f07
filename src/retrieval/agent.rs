//! Bounded tool-use loop that drafts a status update.
//!
//! The generator is prompted to reply with either a JSON tool call for
//! `member_activity` or a plain-text final answer. Each round executes at
//! most one tool call and feeds the result back; the loop is single-threaded
//! and stops at `max_rounds` so a looping model cannot burn unbounded spend.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, instrument, warn};

use super::{ActivitySource, MemberActivityQuery, RetrievalError};
use crate::ai::{AiError, TextGenerator};

const SYSTEM_PROMPT: &str = "\
You draft concise status updates from a team's recorded activity. \
You have one tool, member_activity, which returns enriched activity summaries. \
To call it, reply with only a JSON object: \
{\"tool\": \"member_activity\", \"arguments\": {\"organization_id\": \"<uuid>\", \
\"member_id\": \"<uuid>\", \"provider\": \"github|discord|figma\", \
\"from\": \"<rfc3339>\", \"to\": \"<rfc3339>\", \"entity_external_id\": null}}. \
When you have enough information, reply with the status update as plain text \
instead of JSON.";

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("generation failed: {0}")]
    Generation(#[from] AiError),
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),
    #[error("no final answer after {0} rounds")]
    RoundLimit(u32),
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    tool: String,
    #[serde(default)]
    arguments: JsonValue,
}

pub struct StatusAgent {
    generator: Arc<dyn TextGenerator>,
    source: Arc<dyn ActivitySource>,
    max_rounds: u32,
}

impl StatusAgent {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        source: Arc<dyn ActivitySource>,
        max_rounds: u32,
    ) -> Self {
        Self {
            generator,
            source,
            max_rounds,
        }
    }

    /// Drive the loop until the generator produces a plain-text answer or the
    /// round ceiling is hit.
    #[instrument(skip(self, request))]
    pub async fn compose_status_update(&self, request: &str) -> Result<String, AgentError> {
        let mut transcript = request.to_string();

        for round in 1..=self.max_rounds {
            let reply = self.generator.generate(SYSTEM_PROMPT, &transcript).await?;

            let Some(call) = parse_tool_call(&reply) else {
                debug!(round, "agent produced final answer");
                return Ok(reply.trim().to_string());
            };

            let observation = self.execute(&call).await?;
            debug!(round, tool = %call.tool, "agent executed tool");
            transcript.push_str(&format!(
                "\n\nResult of {}:\n{}\n\nContinue.",
                call.tool, observation
            ));
        }

        Err(AgentError::RoundLimit(self.max_rounds))
    }

    /// Execute one tool call. Bad tool names or arguments are reported back
    /// to the generator as the observation, giving it a chance to correct
    /// itself within the round budget.
    async fn execute(&self, call: &ToolCall) -> Result<String, AgentError> {
        if call.tool != "member_activity" {
            warn!(tool = %call.tool, "agent requested unknown tool");
            return Ok(format!(
                "error: unknown tool {}, only member_activity is available",
                call.tool
            ));
        }

        let query: MemberActivityQuery = match serde_json::from_value(call.arguments.clone()) {
            Ok(query) => query,
            Err(e) => return Ok(format!("error: invalid member_activity arguments: {}", e)),
        };

        let activity = self.source.member_activity(&query).await?;
        if activity.is_empty() {
            return Ok("no recorded activity in this window".to_string());
        }

        let lines: Vec<String> = activity
            .iter()
            .map(|item| {
                format!(
                    "- [{}] {} {}: {}",
                    item.occurred_at.to_rfc3339(),
                    item.kind,
                    item.entity_external_id.as_deref().unwrap_or("-"),
                    item.summary
                )
            })
            .collect();
        Ok(lines.join("\n"))
    }
}

/// A reply is a tool call when it parses as a JSON object with a `tool`
/// field, allowing for a markdown code fence around the JSON.
fn parse_tool_call(reply: &str) -> Option<ToolCall> {
    let trimmed = reply.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    if !body.starts_with('{') {
        return None;
    }
    serde_json::from_str(body).ok()
}
