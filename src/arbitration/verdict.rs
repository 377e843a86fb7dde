//! Final verdict extraction from free-form model output.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionStatus {
    ResolvedTrue,
    ResolvedFalse,
    Unresolvable,
}

impl ResolutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStatus::ResolvedTrue => "RESOLVED_TRUE",
            ResolutionStatus::ResolvedFalse => "RESOLVED_FALSE",
            ResolutionStatus::Unresolvable => "UNRESOLVABLE",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictReasoning {
    #[serde(default)]
    pub analysis: String,
    #[serde(default)]
    pub evidence: String,
    #[serde(default)]
    pub conclusion: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ReasoningField {
    Structured(VerdictReasoning),
    Plain(String),
}

#[derive(Debug, Clone, Deserialize)]
struct RawVerdict {
    resolution_status: ResolutionStatus,
    #[serde(default)]
    reasoning: Option<ReasoningField>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerdictPayload {
    pub resolution_status: ResolutionStatus,
    pub reasoning: VerdictReasoning,
}

impl VerdictPayload {
    /// Stand-in when the model's answer could not be read.
    pub fn parse_failure() -> Self {
        Self {
            resolution_status: ResolutionStatus::Unresolvable,
            reasoning: VerdictReasoning {
                analysis: "Unable to parse AI decision".to_string(),
                evidence: "Technical error in response parsing".to_string(),
                conclusion: "System error prevented proper resolution".to_string(),
            },
        }
    }

    pub fn reasoning_text(&self, search_count: usize) -> String {
        format!(
            "{}\n\nEvidence: {}\n\nConclusion: {}\n\nSources consulted: {} web searches performed",
            self.reasoning.analysis, self.reasoning.evidence, self.reasoning.conclusion, search_count
        )
    }
}

/// First well-formed JSON object in `text` that carries a known
/// `resolution_status`.
pub fn parse_verdict(text: &str) -> Option<VerdictPayload> {
    text.match_indices('{').find_map(|(start, _)| {
        let value = serde_json::Deserializer::from_str(&text[start..])
            .into_iter::<Value>()
            .next()?
            .ok()?;
        if value.get("resolution_status").is_none() {
            return None;
        }
        let raw: RawVerdict = serde_json::from_value(value).ok()?;
        let reasoning = match raw.reasoning {
            Some(ReasoningField::Structured(r)) => r,
            Some(ReasoningField::Plain(conclusion)) => VerdictReasoning {
                conclusion,
                ..VerdictReasoning::default()
            },
            None => VerdictReasoning::default(),
        };
        Some(VerdictPayload {
            resolution_status: raw.resolution_status,
            reasoning,
        })
    })
}

/// [`parse_verdict`], falling back to an `UNRESOLVABLE` stand-in.
pub fn verdict_or_unresolvable(text: Option<&str>) -> (VerdictPayload, bool) {
    match text.and_then(parse_verdict) {
        Some(v) => (v, true),
        None => (VerdictPayload::parse_failure(), false),
    }
}
