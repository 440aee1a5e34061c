//! Triage: a cheap upfront decision about which lane a request takes.
//!
//! A missing classifier, a failing one, and a slow one all mean the same
//! thing: the request goes to the full lane. Triage never fails a request.

use async_trait::async_trait;
use regex_lite::Regex;
use serde::Serialize;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};
use vigil_core::error::TriageError;

use crate::lane::LaneKind;

/// Default time a classifier gets before the request goes to the full lane.
pub const DEFAULT_TRIAGE_TIMEOUT: Duration = Duration::from_millis(1_500);

/// Messages longer than this are treated as complex.
const LONG_MESSAGE_CHARS: usize = 200;

/// Messages shorter than this are treated as trivial.
const SHORT_MESSAGE_CHARS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriageDecision {
    pub lane: LaneKind,
    /// 0.0 for fallbacks
    pub confidence: f32,
    pub rationale: String,
}

impl TriageDecision {
    pub fn new(lane: LaneKind, confidence: f32, rationale: impl Into<String>) -> Self {
        Self {
            lane,
            confidence,
            rationale: rationale.into(),
        }
    }

    /// The full-lane fallback used whenever classification is unavailable.
    pub fn unavailable(reason: impl std::fmt::Display) -> Self {
        Self::new(
            LaneKind::Full,
            0.0,
            format!("classification unavailable: {reason}"),
        )
    }

    pub fn is_fallback(&self) -> bool {
        self.rationale.starts_with("classification unavailable")
    }
}

#[async_trait]
pub trait Classifier: Send + Sync {
    fn name(&self) -> &str;

    async fn classify(&self, content: &str) -> Result<TriageDecision, TriageError>;
}

/// Run the classifier under `limit`, falling back to the full lane on any
/// failure.
pub async fn triage(
    classifier: Option<&Arc<dyn Classifier>>,
    content: &str,
    limit: Duration,
) -> TriageDecision {
    let Some(classifier) = classifier else {
        return TriageDecision::unavailable("no classifier configured");
    };

    match timeout(limit, classifier.classify(content)).await {
        Ok(Ok(decision)) => {
            debug!(
                classifier = classifier.name(),
                lane = %decision.lane,
                rationale = %decision.rationale,
                "Triaged"
            );
            decision
        }
        Ok(Err(e)) => {
            warn!(classifier = classifier.name(), error = %e, "Triage failed; using full lane");
            TriageDecision::unavailable(e)
        }
        Err(_) => {
            let ms = limit.as_millis();
            warn!(
                classifier = classifier.name(),
                timeout_ms = ms as u64,
                "Triage timed out; using full lane"
            );
            TriageDecision::unavailable(format!("timed out after {ms}ms"))
        }
    }
}

static SIMPLE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?i)^(hi|hey|hello|yo|嗨|哈囉|你好|早安|午安|晚安|安安)\s*[!！.。]?\s*$",
        r"(?i)^(thanks|謝謝|感謝|ok|好的|了解|收到|good|nice)\s*[!！.。]?\s*$",
        r"(?i)^(你好嗎|how are you|what's up|還好嗎|在嗎)\s*[?？]?\s*$",
        r"(?i)^/?(status|health|ping)\s*$",
    ])
});

static COMPLEX_SIGNALS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?i)\b(寫|建立|修改|刪除|部署|安裝|create|build|deploy|fix|write|update|delete|refactor)\b",
        r"(?i)\b(程式|code|script|file|api|server|database)\b",
        r"```",
        r"\[TASK\]|\[REMEMBER\]|\[ACTION\]",
    ])
});

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("triage pattern should compile"))
        .collect()
}

/// Rule-based classifier: greetings, acknowledgements and status pings are
/// fast; code and action words, fenced code and long messages are full.
/// Anything else that is short goes fast.
#[derive(Debug, Default, Clone, Copy)]
pub struct PatternClassifier;

impl PatternClassifier {
    pub fn decide(content: &str) -> TriageDecision {
        let trimmed = content.trim();
        let chars = trimmed.chars().count();

        if chars < SHORT_MESSAGE_CHARS {
            return TriageDecision::new(LaneKind::Fast, 0.8, "very-short");
        }
        if SIMPLE_PATTERNS.iter().any(|re| re.is_match(trimmed)) {
            return TriageDecision::new(LaneKind::Fast, 0.9, "simple-pattern");
        }
        if COMPLEX_SIGNALS.iter().any(|re| re.is_match(trimmed)) {
            return TriageDecision::new(LaneKind::Full, 0.85, "complex-signal");
        }
        if chars > LONG_MESSAGE_CHARS {
            return TriageDecision::new(LaneKind::Full, 0.7, "long-message");
        }
        TriageDecision::new(LaneKind::Fast, 0.6, "default-short")
    }
}

#[async_trait]
impl Classifier for PatternClassifier {
    fn name(&self) -> &str {
        "pattern"
    }

    async fn classify(&self, content: &str) -> Result<TriageDecision, TriageError> {
        Ok(Self::decide(content))
    }
}
