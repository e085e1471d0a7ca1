//! Critic: quality-gate reviews delegated to a sub-agent
//!
//! The critic spawns a "Critic" sub-agent with a strict review prompt and
//! polls its record until a verdict comes back. Anything that goes wrong
//! (spawn failure, timeout, malformed verdict) is treated as a failing
//! review so the runtime keeps its retry bookkeeping simple.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::runtime::{Judge, Verdict};
use crate::subagent::{AgentSpawner, SubAgentStatus};

/// Interval between record polls
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Hard ceiling on one review
const REVIEW_TIMEOUT: Duration = Duration::from_secs(120);

const CRITIC_AGENT_NAME: &str = "Critic";

pub struct Critic {
    spawner: Arc<dyn AgentSpawner>,
}

impl Critic {
    pub fn new(spawner: Arc<dyn AgentSpawner>) -> Self {
        Self { spawner }
    }

    fn fail(feedback: impl Into<String>) -> Verdict {
        Verdict {
            status: "fail".to_string(),
            feedback: feedback.into(),
        }
    }
}

#[async_trait]
impl Judge for Critic {
    async fn review(&self, goal: &str, content: &str, cancel: CancellationToken) -> Verdict {
        let prompt = review_prompt(goal, content);

        let id = match self
            .spawner
            .spawn(&prompt, &[], Some(CRITIC_AGENT_NAME))
            .await
        {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!("failed to spawn critic: {}", e);
                return Self::fail(format!("review unavailable: {}", e));
            }
        };

        let deadline = tokio::time::Instant::now() + REVIEW_TIMEOUT;

        loop {
            let Some(record) = self.spawner.get(&id) else {
                tracing::warn!("critic record {} disappeared", id);
                return Self::fail("review record lost");
            };

            match record.status {
                SubAgentStatus::Done => return parse_verdict(&record.output),
                SubAgentStatus::Failed | SubAgentStatus::Cancelled => {
                    return Self::fail(format!("reviewer did not finish: {:?}", record.status));
                }
                SubAgentStatus::Running => {}
            }

            if tokio::time::Instant::now() >= deadline {
                self.spawner.cancel(&id);
                tracing::warn!("critic {} timed out after {:?}", id, REVIEW_TIMEOUT);
                return Self::fail("review timed out");
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.spawner.cancel(&id);
                    return Self::fail("review cancelled");
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }
}

fn review_prompt(goal: &str, content: &str) -> String {
    format!(
        "You are a strict reviewer. Judge whether the response below fully \
         accomplishes the stated goal.\n\n\
         Goal:\n{}\n\n\
         Response:\n{}\n\n\
         Reply with a single JSON object and nothing else:\n\
         {{\"status\": \"pass\" or \"fail\", \"feedback\": \"what is missing or wrong, \
         empty if passing\"}}",
        goal, content
    )
}

/// Parse the critic's output, tolerating Markdown code fences around the
/// JSON. Anything unparseable is a failing verdict.
fn parse_verdict(raw: &str) -> Verdict {
    let stripped = strip_fences(raw);
    match serde_json::from_str::<Verdict>(stripped) {
        Ok(verdict) => verdict,
        Err(e) => {
            tracing::warn!("critic returned a malformed verdict ({}): {raw:?}", e);
            Critic::fail("reviewer returned an unreadable verdict")
        }
    }
}

/// Strip a leading/trailing Markdown code fence, with or without a language
/// tag.
fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the language tag line if present
    let body = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => rest,
    };
    body.strip_suffix("```").unwrap_or(body).trim()
}
