//! Action tags in brain replies.
//!
//! A reply may ask for background work with
//! `<delegate max_turns="3" deadline_ms="60000">prompt</delegate>` and for
//! something to be remembered with `<remember section="...">fact</remember>`.
//! Tags are removed from the text the caller sees.

use regex_lite::{Captures, Regex};
use std::collections::HashMap;
use std::sync::LazyLock;
use vigil_delegation::TaskSpec;

static DELEGATE_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<delegate\b([^>]*)>(.*?)</delegate>")
        .expect("delegate tag regex should compile")
});

static REMEMBER_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<remember\b([^>]*)>(.*?)</remember>")
        .expect("remember tag regex should compile")
});

static ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(\w+)\s*=\s*"([^"]*)""#).expect("attribute regex should compile")
});

static BLANK_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("blank line regex should compile"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegateTag {
    pub prompt: String,
    pub max_turns: Option<u32>,
    pub deadline_ms: Option<u64>,
    pub workdir: Option<String>,
}

impl DelegateTag {
    pub fn to_spec(&self) -> TaskSpec {
        let mut spec = TaskSpec::new(&self.prompt);
        spec.max_turns = self.max_turns;
        spec.deadline_ms = self.deadline_ms;
        spec.workdir = self.workdir.as_ref().map(Into::into);
        spec
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RememberTag {
    pub content: String,
    pub section: Option<String>,
}

/// A reply split into user-facing text and the actions it requested.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedReply {
    pub content: String,
    pub delegations: Vec<DelegateTag>,
    pub memories: Vec<RememberTag>,
}

fn attributes(raw: &str) -> HashMap<String, String> {
    ATTRIBUTE
        .captures_iter(raw)
        .map(|c| (c[1].to_string(), c[2].to_string()))
        .collect()
}

fn body(captures: &Captures<'_>) -> String {
    captures
        .get(2)
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default()
}

pub fn parse_reply(text: &str) -> ParsedReply {
    let delegations = DELEGATE_TAG
        .captures_iter(text)
        .filter_map(|c| {
            let prompt = body(&c);
            if prompt.is_empty() {
                return None;
            }
            let attrs = attributes(&c[1]);
            Some(DelegateTag {
                prompt,
                max_turns: attrs.get("max_turns").and_then(|v| v.parse().ok()),
                deadline_ms: attrs.get("deadline_ms").and_then(|v| v.parse().ok()),
                workdir: attrs.get("workdir").cloned(),
            })
        })
        .collect();

    let memories = REMEMBER_TAG
        .captures_iter(text)
        .filter_map(|c| {
            let content = body(&c);
            if content.is_empty() {
                return None;
            }
            Some(RememberTag {
                content,
                section: attributes(&c[1]).remove("section"),
            })
        })
        .collect();

    let stripped = DELEGATE_TAG.replace_all(text, "");
    let stripped = REMEMBER_TAG.replace_all(&stripped, "");
    let content = BLANK_RUNS.replace_all(&stripped, "\n\n").trim().to_string();

    ParsedReply {
        content,
        delegations,
        memories,
    }
}
