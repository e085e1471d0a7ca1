//! Failure catalogue: instructional nudges for self-correction
//!
//! When a tool call fails in a recognisable way, a short hint is appended
//! to the error so the model can correct itself on the next turn. The
//! catalogue is an injected service so tests stay hermetic.

/// Maps recognisable failure text to a corrective hint
pub trait FailureCatalogue: Send + Sync {
    /// Return a hint for this error, if one applies
    fn nudge(&self, error: &str) -> Option<String>;

    /// Append the hint to the error text when one applies
    fn apply(&self, error: &str) -> String {
        match self.nudge(error) {
            Some(hint) => format!("{}\nHint: {}", error, hint),
            None => error.to_string(),
        }
    }
}

/// Misspelled tool-name fragments and the tool the model probably meant
const TOOL_ALIASES: &[(&str, &str)] = &[
    ("fetch", "web_fetch"),
    ("crawl", "web_crawl"),
    ("write", "file_write"),
    ("read", "file_read"),
];

/// The built-in catalogue of common failures
#[derive(Debug, Default)]
pub struct CommonFailures;

impl FailureCatalogue for CommonFailures {
    fn nudge(&self, error: &str) -> Option<String> {
        let lower = error.to_lowercase();

        if lower.contains("unknown tool") {
            for (fragment, tool) in TOOL_ALIASES {
                if lower.contains(fragment) {
                    return Some(format!("did you mean the '{}' tool?", tool));
                }
            }
            return None;
        }

        if lower.contains("invalid json") {
            return Some(
                "tool arguments must be a single valid JSON object; \
                 check quoting, braces, and escaped characters"
                    .to_string(),
            );
        }

        None
    }
}
