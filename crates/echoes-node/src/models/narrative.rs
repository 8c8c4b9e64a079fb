//! Narrative model - the prose attached to a closed epoch.

use serde::{Deserialize, Serialize};

/// Prose rendering of an epoch's statistics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Narrative {
    /// One or two sentences
    pub short_summary: String,

    /// Long-form text
    pub detailed_manifesto: String,

    /// Dominant mood
    pub emotional_tone: String,

    /// Recurring subjects
    pub key_themes: Vec<String>,

    /// Optional image for the epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metaphor: Option<String>,

    /// Optional final line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closing_verse: Option<String>,
}

/// Who produced a stored narrative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NarrativeSource {
    /// The external narrative service
    Generated,
    /// The deterministic template
    Fallback,
    /// Supplied by an administrator
    Manual { by: String },
}

/// An unchecked narrative, as submitted by an administrator or returned by
/// the external service.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NarrativeDraft {
    #[serde(default)]
    pub short_summary: Option<String>,
    #[serde(default)]
    pub detailed_manifesto: Option<String>,
    #[serde(default)]
    pub emotional_tone: Option<String>,
    #[serde(default)]
    pub key_themes: Option<Vec<String>>,
    #[serde(default)]
    pub metaphor: Option<String>,
    #[serde(default)]
    pub closing_verse: Option<String>,
}

impl NarrativeDraft {
    /// Check required fields, returning the camelCase names of the missing ones.
    pub fn validate(self) -> Result<Narrative, Vec<&'static str>> {
        fn present(value: Option<String>) -> Option<String> {
            value.filter(|v| !v.trim().is_empty())
        }

        let short_summary = present(self.short_summary);
        let detailed_manifesto = present(self.detailed_manifesto);
        let emotional_tone = present(self.emotional_tone);
        let key_themes = self.key_themes.filter(|themes| !themes.is_empty());

        let mut missing = Vec::new();
        if short_summary.is_none() {
            missing.push("shortSummary");
        }
        if detailed_manifesto.is_none() {
            missing.push("detailedManifesto");
        }
        if emotional_tone.is_none() {
            missing.push("emotionalTone");
        }
        if key_themes.is_none() {
            missing.push("keyThemes");
        }

        match (short_summary, detailed_manifesto, emotional_tone, key_themes) {
            (Some(short_summary), Some(detailed_manifesto), Some(emotional_tone), Some(key_themes)) => {
                Ok(Narrative {
                    short_summary,
                    detailed_manifesto,
                    emotional_tone,
                    key_themes,
                    metaphor: present(self.metaphor),
                    closing_verse: present(self.closing_verse),
                })
            }
            _ => Err(missing),
        }
    }
}
