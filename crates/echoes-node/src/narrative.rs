//! Narrative generation for closed epochs and layer moments.
//!
//! [`NarrativeService`] is the seam. [`HttpNarrator`] calls an
//! OpenAI-compatible chat completion endpoint, [`TemplateNarrator`] renders a
//! deterministic narrative from the aggregate alone, and [`Narrator`] puts a
//! hard timeout around the first with the second as fallback.

use crate::models::{EpochAggregate, Narrative, NarrativeDraft, NarrativeSource};
use async_trait::async_trait;
use echoes_layers::LayerIndex;
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Default upper bound on a narrative call.
pub const DEFAULT_NARRATIVE_TIMEOUT: Duration = Duration::from_secs(8);

/// Why a narrative could not be produced.
#[derive(Debug, Error)]
pub enum NarrativeError {
    #[error("narrative service timed out after {0:?}")]
    Timeout(Duration),

    #[error("narrative request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("narrative response malformed: {0}")]
    Malformed(String),
}

/// Turns aggregated statistics into prose.
#[async_trait]
pub trait NarrativeService: Send + Sync {
    async fn generate_narrative(
        &self,
        aggregate: &EpochAggregate,
    ) -> Result<Narrative, NarrativeError>;

    /// Narrative for an epoch that just reached `aggregate.final_layer`.
    async fn generate_layer_narrative(
        &self,
        aggregate: &EpochAggregate,
    ) -> Result<Narrative, NarrativeError> {
        self.generate_narrative(aggregate).await
    }
}

// --- Template ---

/// Deterministic narrative built from the aggregate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateNarrator;

fn tone_for(mood: Option<&str>) -> &'static str {
    match mood {
        Some("melancholy") => "melancholic",
        Some("hope") => "hopeful",
        Some("joy") => "joyful",
        Some("nihilism") => "nihilistic",
        _ => "quiet",
    }
}

fn lines_for(tone: &str) -> &'static [&'static str] {
    match tone {
        "melancholic" => &[
            "This age chose silence over noise.",
            "The echoes faded into the dark.",
            "Loneliness was the word repeated most.",
        ],
        "hopeful" => &[
            "Hope echoed between the layers.",
            "The future shone through every line.",
            "This age chose the light.",
        ],
        "joyful" => &[
            "Joy spread quietly through the rooms.",
            "Laughter carried from layer to layer.",
            "This age remembered how to smile.",
        ],
        "nihilistic" => &[
            "Emptiness covered every layer.",
            "The void was the deepest echo.",
            "Nothing was said loudest of all.",
        ],
        _ => &[
            "Voices gathered without a single mood.",
            "The library listened and kept everything.",
            "An ordinary age, written line by line.",
        ],
    }
}

fn themes(aggregate: &EpochAggregate) -> Vec<String> {
    if aggregate.top_words.is_empty() {
        vec!["silence".to_string()]
    } else {
        aggregate
            .top_words
            .iter()
            .take(5)
            .map(|w| w.word.clone())
            .collect()
    }
}

fn returning_words(aggregate: &EpochAggregate) -> Option<String> {
    if aggregate.top_words.is_empty() {
        return None;
    }
    let words: Vec<String> = aggregate
        .top_words
        .iter()
        .take(5)
        .map(|w| format!("\"{}\" ({})", w.word, w.count))
        .collect();
    Some(words.join(", "))
}

impl TemplateNarrator {
    /// Render synchronously; never fails.
    pub fn render(&self, aggregate: &EpochAggregate) -> Narrative {
        let tone = tone_for(aggregate.emotions.dominant());
        let lines = lines_for(tone);
        let line = lines[(aggregate.total_messages as usize) % lines.len()];
        let key_themes = themes(aggregate);

        let short_summary = format!(
            "{} {} voices, {} of them echoes.",
            line, aggregate.total_messages, aggregate.echo_count
        );

        let mut manifesto = vec![format!(
            "{} closed after {} messages, {} of them unique ({:.1}% diversity). \
             It reached the layer {} after {} days.",
            aggregate.epoch_name,
            aggregate.total_messages,
            aggregate.unique_messages,
            aggregate.diversity * 100.0,
            aggregate.final_layer_name,
            aggregate.duration_days,
        )];
        if let Some(words) = returning_words(aggregate) {
            manifesto.push(format!("The words that returned most were {}.", words));
        }
        if let Some(sentence) = aggregate.top_sentences.first() {
            manifesto.push(format!(
                "One line was written {} times: \"{}\".",
                sentence.count, sentence.text
            ));
        }
        if let Some(hour) = aggregate.temporal.peak_hour {
            manifesto.push(format!(
                "Most voices arrived around {:02}:00, and {:.0}% of them came at night.",
                hour,
                aggregate.temporal.night_ratio * 100.0
            ));
        }
        manifesto.push(line.to_string());

        Narrative {
            short_summary,
            detailed_manifesto: manifesto.join("\n\n"),
            emotional_tone: tone.to_string(),
            key_themes,
            metaphor: None,
            closing_verse: Some(line.to_string()),
        }
    }

    /// Render the moment an epoch reached its current layer.
    pub fn render_layer(&self, aggregate: &EpochAggregate) -> Narrative {
        let mut manifesto = vec![format!(
            "{} messages carried {} into {}, {} of them unique. The collective voice keeps widening.",
            aggregate.total_messages,
            aggregate.epoch_name,
            aggregate.final_layer_name,
            aggregate.unique_messages,
        )];
        if let Some(words) = returning_words(aggregate) {
            manifesto.push(format!("At this threshold the library hears {}.", words));
        }

        Narrative {
            short_summary: format!(
                "{} has reached {}.",
                aggregate.epoch_name, aggregate.final_layer_name
            ),
            detailed_manifesto: manifesto.join("\n\n"),
            emotional_tone: "dynamic".to_string(),
            key_themes: themes(aggregate),
            metaphor: None,
            closing_verse: None,
        }
    }
}

#[async_trait]
impl NarrativeService for TemplateNarrator {
    async fn generate_narrative(
        &self,
        aggregate: &EpochAggregate,
    ) -> Result<Narrative, NarrativeError> {
        Ok(self.render(aggregate))
    }

    async fn generate_layer_narrative(
        &self,
        aggregate: &EpochAggregate,
    ) -> Result<Narrative, NarrativeError> {
        Ok(self.render_layer(aggregate))
    }
}

// --- HTTP ---

/// Settings for [`HttpNarrator`].
#[derive(Debug, Clone)]
pub struct HttpNarratorConfig {
    /// Chat completion endpoint
    pub endpoint: String,

    /// Bearer key
    pub api_key: Option<String>,

    /// Model name
    pub model: String,
}

/// OpenAI-compatible chat completion client.
#[derive(Debug, Clone)]
pub struct HttpNarrator {
    http: reqwest::Client,
    config: HttpNarratorConfig,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

const SYSTEM_PROMPT: &str = "You are a JSON-only API. Respond with a single JSON object and nothing else.";

impl HttpNarrator {
    pub fn new(config: HttpNarratorConfig, timeout: Duration) -> Result<Self, NarrativeError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, config })
    }

    fn prompt(aggregate: &EpochAggregate) -> String {
        format!(
            "You are the archivist of the Library of Echoes, an anonymous collective message board. \
             Write the mythology of the age that just closed.\n\n\
             AGE: {name}\n\
             Messages: {total}\nUnique: {unique}\nEchoes: {echoes}\nDiversity: {diversity:.3}\n\
             Final layer: {layer}\nDuration: {days} days\n\
             Peak hour: {peak:?}\nNight share: {night:.1}%\nWeekend share: {weekend:.1}%\n\n\
             Most echoed words:\n{words}\n\nMost repeated sentences:\n{sentences}\n\n\
             Respond with JSON: {{\"shortSummary\": string, \"detailedManifesto\": string, \
             \"emotionalTone\": string, \"keyThemes\": [string], \"metaphor\": string, \
             \"closingVerse\": string}}",
            name = aggregate.epoch_name,
            total = aggregate.total_messages,
            unique = aggregate.unique_messages,
            echoes = aggregate.echo_count,
            diversity = aggregate.diversity,
            layer = aggregate.final_layer_name,
            days = aggregate.duration_days,
            peak = aggregate.temporal.peak_hour,
            night = aggregate.temporal.night_ratio * 100.0,
            weekend = aggregate.temporal.weekend_ratio * 100.0,
            words = ranked_words(aggregate, usize::MAX),
            sentences = ranked_sentences(aggregate, usize::MAX),
        )
    }

    fn layer_prompt(aggregate: &EpochAggregate) -> String {
        // the first layer is small enough to send whole
        let (word_limit, sentence_limit) = if aggregate.final_layer <= LayerIndex(1) {
            (usize::MAX, usize::MAX)
        } else {
            (10, 5)
        };
        let echo_rate = if aggregate.total_messages == 0 {
            0.0
        } else {
            aggregate.echo_count as f64 / aggregate.total_messages as f64 * 100.0
        };

        format!(
            "You are the layer analyst of the Library of Echoes. The collective has just \
             reached a new layer; read this moment in short, poetic, mythological language.\n\n\
             AGE: {name}\nLAYER: {layer} ({index})\n\
             Messages: {total}\nUnique: {unique}\nEcho rate: {echo_rate:.1}%\n\n\
             Most echoed words:\n{words}\n\nMost repeated sentences:\n{sentences}\n\n\
             Respond with JSON: {{\"shortSummary\": string, \"detailedManifesto\": string, \
             \"emotionalTone\": string, \"keyThemes\": [string], \"metaphor\": string}}",
            name = aggregate.epoch_name,
            layer = aggregate.final_layer_name,
            index = aggregate.final_layer,
            total = aggregate.total_messages,
            unique = aggregate.unique_messages,
            echo_rate = echo_rate,
            words = ranked_words(aggregate, word_limit),
            sentences = ranked_sentences(aggregate, sentence_limit),
        )
    }

    async fn complete(&self, prompt: String) -> Result<Narrative, NarrativeError> {
        let body = json!({
            "model": self.config.model,
            "temperature": 0.7,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": prompt },
            ],
        });

        let mut request = self.http.post(&self.config.endpoint).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }
        let completion: ChatCompletion = request.send().await?.error_for_status()?.json().await?;

        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| NarrativeError::Malformed("no content".into()))?;
        let json = extract_json(&content)
            .ok_or_else(|| NarrativeError::Malformed("no JSON object in reply".into()))?;
        let draft: NarrativeDraft =
            serde_json::from_str(json).map_err(|e| NarrativeError::Malformed(e.to_string()))?;
        draft.validate().map_err(|missing| {
            NarrativeError::Malformed(format!("missing fields: {}", missing.join(", ")))
        })
    }
}

fn ranked_words(aggregate: &EpochAggregate, limit: usize) -> String {
    aggregate
        .top_words
        .iter()
        .take(limit)
        .enumerate()
        .map(|(i, w)| format!("{}. \"{}\" x{}", i + 1, w.word, w.count))
        .collect::<Vec<_>>()
        .join("\n")
}

fn ranked_sentences(aggregate: &EpochAggregate, limit: usize) -> String {
    aggregate
        .top_sentences
        .iter()
        .take(limit)
        .enumerate()
        .map(|(i, s)| format!("{}. \"{}\" x{}", i + 1, s.text, s.count))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Pull the JSON object out of a model reply that may carry fences or chatter.
fn extract_json(reply: &str) -> Option<&str> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    (end > start).then(|| &reply[start..=end])
}

#[async_trait]
impl NarrativeService for HttpNarrator {
    async fn generate_narrative(
        &self,
        aggregate: &EpochAggregate,
    ) -> Result<Narrative, NarrativeError> {
        self.complete(Self::prompt(aggregate)).await
    }

    async fn generate_layer_narrative(
        &self,
        aggregate: &EpochAggregate,
    ) -> Result<Narrative, NarrativeError> {
        self.complete(Self::layer_prompt(aggregate)).await
    }
}

// --- Timeout + fallback ---

/// The narrative service the node uses: primary with a hard timeout, template fallback.
pub struct Narrator {
    primary: Option<Arc<dyn NarrativeService>>,
    fallback: TemplateNarrator,
    timeout: Duration,
}

impl Narrator {
    pub fn new(primary: Option<Arc<dyn NarrativeService>>, timeout: Duration) -> Self {
        Self {
            primary,
            fallback: TemplateNarrator,
            timeout,
        }
    }

    /// Only the deterministic template.
    pub fn template_only() -> Self {
        Self::new(None, DEFAULT_NARRATIVE_TIMEOUT)
    }

    /// Produce a narrative and record which implementation served it.
    pub async fn narrate(&self, aggregate: &EpochAggregate) -> (Narrative, NarrativeSource) {
        let generated = match &self.primary {
            Some(primary) => self.bounded(aggregate, primary.generate_narrative(aggregate)).await,
            None => None,
        };
        match generated {
            Some(narrative) => (narrative, NarrativeSource::Generated),
            None => (self.fallback.render(aggregate), NarrativeSource::Fallback),
        }
    }

    /// Like [`Narrator::narrate`], for the moment an epoch reaches a layer.
    pub async fn narrate_layer(&self, aggregate: &EpochAggregate) -> (Narrative, NarrativeSource) {
        let generated = match &self.primary {
            Some(primary) => {
                self.bounded(aggregate, primary.generate_layer_narrative(aggregate))
                    .await
            }
            None => None,
        };
        match generated {
            Some(narrative) => (narrative, NarrativeSource::Generated),
            None => (self.fallback.render_layer(aggregate), NarrativeSource::Fallback),
        }
    }

    async fn bounded<F>(&self, aggregate: &EpochAggregate, call: F) -> Option<Narrative>
    where
        F: Future<Output = Result<Narrative, NarrativeError>>,
    {
        let outcome = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(NarrativeError::Timeout(self.timeout)),
        };
        match outcome {
            Ok(narrative) => Some(narrative),
            Err(e) => {
                tracing::warn!(
                    epoch = %aggregate.epoch_name,
                    layer = %aggregate.final_layer,
                    "Narrative service failed, using template: {}",
                    e
                );
                None
            }
        }
    }
}

#[async_trait]
impl NarrativeService for Narrator {
    async fn generate_narrative(
        &self,
        aggregate: &EpochAggregate,
    ) -> Result<Narrative, NarrativeError> {
        Ok(self.narrate(aggregate).await.0)
    }

    async fn generate_layer_narrative(
        &self,
        aggregate: &EpochAggregate,
    ) -> Result<Narrative, NarrativeError> {
        Ok(self.narrate_layer(aggregate).await.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Epoch, Message, MessageDraft};
    use crate::stats::{Aggregator, AggregatorConfig};
    use chrono::{TimeZone, Utc};
    use echoes_layers::{LayerIndex, LayerTable, RoomIndex};

    fn aggregate(texts: &[&str]) -> EpochAggregate {
        let start = Utc.with_ymd_and_hms(2025, 2, 3, 12, 0, 0).unwrap();
        let epoch = Epoch::new(4, start);
        let messages: Vec<Message> = texts
            .iter()
            .enumerate()
            .map(|(i, text)| {
                let draft = MessageDraft::new(text, start);
                Message {
                    id: Message::generate_id(4, i as u64, &draft.normalized_text),
                    epoch_id: 4,
                    sequence: i as u64,
                    layer_index: LayerIndex(1),
                    room_index: RoomIndex(0),
                    text: draft.text,
                    normalized_text: draft.normalized_text,
                    created_at: start,
                }
            })
            .collect();
        Aggregator::new(AggregatorConfig::default(), Arc::new(LayerTable::standard()))
            .aggregate(&epoch, &messages)
    }

    struct Slow;

    #[async_trait]
    impl NarrativeService for Slow {
        async fn generate_narrative(
            &self,
            _aggregate: &EpochAggregate,
        ) -> Result<Narrative, NarrativeError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(NarrativeError::Malformed("unreachable".into()))
        }
    }

    struct Fixed(Narrative);

    #[async_trait]
    impl NarrativeService for Fixed {
        async fn generate_narrative(
            &self,
            _aggregate: &EpochAggregate,
        ) -> Result<Narrative, NarrativeError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn template_is_deterministic() {
        let agg = aggregate(&["so alone tonight", "alone again", "so alone tonight"]);
        let a = TemplateNarrator.render(&agg);
        let b = TemplateNarrator.render(&agg);
        assert_eq!(a, b);
        assert_eq!(a.emotional_tone, "melancholic");
        assert!(a.detailed_manifesto.contains("Age 4"));
        assert!(a.key_themes.contains(&"alone".to_string()));
    }

    #[test]
    fn template_handles_empty_epoch() {
        let agg = aggregate(&[]);
        let narrative = TemplateNarrator.render(&agg);
        assert_eq!(narrative.emotional_tone, "quiet");
        assert_eq!(narrative.key_themes, vec!["silence"]);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_falls_back_to_template() {
        let agg = aggregate(&["hope is here"]);
        let narrator = Narrator::new(Some(Arc::new(Slow)), Duration::from_secs(8));
        let (narrative, source) = narrator.narrate(&agg).await;
        assert_eq!(source, NarrativeSource::Fallback);
        assert_eq!(narrative, TemplateNarrator.render(&agg));
    }

    #[tokio::test]
    async fn primary_is_used_when_it_answers() {
        let agg = aggregate(&["hope is here"]);
        let fixed = Narrative {
            short_summary: "s".into(),
            detailed_manifesto: "d".into(),
            emotional_tone: "t".into(),
            key_themes: vec!["k".into()],
            metaphor: None,
            closing_verse: None,
        };
        let narrator = Narrator::new(Some(Arc::new(Fixed(fixed.clone()))), Duration::from_secs(8));
        let (narrative, source) = narrator.narrate(&agg).await;
        assert_eq!(source, NarrativeSource::Generated);
        assert_eq!(narrative, fixed);
    }

    #[tokio::test]
    async fn unreachable_endpoint_falls_back() {
        let agg = aggregate(&["hope is here"]);
        let http = HttpNarrator::new(
            HttpNarratorConfig {
                endpoint: "http://127.0.0.1:9/v1/chat/completions".into(),
                api_key: None,
                model: "test".into(),
            },
            Duration::from_secs(2),
        )
        .unwrap();
        let narrator = Narrator::new(Some(Arc::new(http)), Duration::from_secs(4));
        let (_, source) = narrator.narrate(&agg).await;
        assert_eq!(source, NarrativeSource::Fallback);
    }

    #[test]
    fn layer_template_names_the_layer() {
        let agg = aggregate(&["hope is here", "hope is here", "waiting for spring"]);
        let narrative = TemplateNarrator.render_layer(&agg);
        assert_eq!(narrative.short_summary, "Age 4 has reached Void.");
        assert_eq!(narrative.emotional_tone, "dynamic");
        assert!(narrative.detailed_manifesto.starts_with("3 messages carried Age 4 into Void"));
        assert_eq!(narrative, TemplateNarrator.render_layer(&agg));
    }

    #[tokio::test(start_paused = true)]
    async fn layer_timeout_falls_back_to_layer_template() {
        let agg = aggregate(&["hope is here"]);
        let narrator = Narrator::new(Some(Arc::new(Slow)), Duration::from_secs(8));
        let (narrative, source) = narrator.narrate_layer(&agg).await;
        assert_eq!(source, NarrativeSource::Fallback);
        assert_eq!(narrative, TemplateNarrator.render_layer(&agg));
    }

    #[test]
    fn layer_prompt_trims_rankings_past_the_first_layer() {
        let texts: Vec<String> = (0..12)
            .flat_map(|i| {
                let line = format!("recurring word{:02} again", i);
                [line.clone(), line]
            })
            .collect();
        let texts: Vec<&str> = texts.iter().map(String::as_str).collect();
        let mut agg = aggregate(&texts);
        assert!(agg.top_words.len() > 10);

        // "again" and "recurring" lead, then word00..word11
        let first = HttpNarrator::layer_prompt(&agg);
        assert!(first.contains("14. \"word11\" x2"));

        agg.final_layer = LayerIndex(3);
        let later = HttpNarrator::layer_prompt(&agg);
        assert!(later.contains("10. "));
        assert!(!later.contains("11. "));
        assert!(later.contains("5. \"recurring word"));
        assert!(!later.contains("6. \"recurring word"));
    }

    #[test]
    fn extracts_fenced_json() {
        assert_eq!(extract_json("```json\n{\"a\":1}\n```"), Some("{\"a\":1}"));
        assert_eq!(extract_json("no json here"), None);
    }
}
