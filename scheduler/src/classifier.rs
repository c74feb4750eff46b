//! Name-based model capability classification.
//!
//! Backends rarely say what a model is for, so the scheduler infers it from
//! the model name with an ordered table of pattern groups. Vision is checked
//! first because many vision model names also match generic chat or
//! embedding patterns.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub is_chat: bool,
    pub is_embedding: bool,
    pub is_vision: bool,
    pub confidence: Confidence,
}

impl Classification {
    const fn vision(confidence: Confidence) -> Self {
        Self {
            is_chat: true,
            is_embedding: false,
            is_vision: true,
            confidence,
        }
    }

    const fn embedding(confidence: Confidence) -> Self {
        Self {
            is_chat: false,
            is_embedding: true,
            is_vision: false,
            confidence,
        }
    }

    const fn chat(confidence: Confidence) -> Self {
        Self {
            is_chat: true,
            is_embedding: false,
            is_vision: false,
            confidence,
        }
    }

    /// Shape of the work a request against this model performs.
    pub fn workload(&self) -> Workload {
        if self.is_vision {
            Workload::Vision
        } else if self.is_embedding {
            Workload::Embedding
        } else {
            Workload::Chat
        }
    }
}

/// Request shape used to estimate per-request memory cost.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Workload {
    Vision,
    Chat,
    Embedding,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Chat,
    Embedding,
    Vision,
    Ocr,
    Code,
}

struct Pattern {
    matches: Regex,
    unless: Option<Regex>,
}

impl Pattern {
    fn is_match(&self, name: &str) -> bool {
        self.matches.is_match(name) && !self.unless.as_ref().is_some_and(|u| u.is_match(name))
    }
}

struct Rule {
    class: Classification,
    patterns: Vec<Pattern>,
}

fn rule(class: Classification, patterns: &[&str]) -> Rule {
    Rule {
        class,
        patterns: patterns.iter().map(|p| pattern(p, None)).collect(),
    }
}

fn pattern(re: &str, unless: Option<&str>) -> Pattern {
    Pattern {
        matches: Regex::new(re).expect("classifier pattern"),
        unless: unless.map(|u| Regex::new(u).expect("classifier pattern")),
    }
}

static RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    let mut strong_vision = rule(
        Classification::vision(Confidence::High),
        &[
            r"^qwen.*vl",
            r"^qwen.*omni",
            r"^gemma3",
            r"^llama3\.2.*vision",
            r"^llama4.*vision",
            r"^llava",
            r"^minicpm-v",
            r"^internvl",
            r"^cogvlm",
            r"^pixtral",
            r"^mistral-small",
            r"^granite.*vision",
            r"^moondream",
            r"^deepseek.*janus",
            r"janus-pro",
            r"^yi.*vl",
            r"^glm.*v[-\d]",
            r"^falcon.*vlm",
            r"^phi-4-multimodal",
            r"^gpt-4o",
            r"^gpt-5",
            r"^gpt-4\.1",
            r"^gpt-4-turbo",
            r"^o3",
            r"^o4",
            r"vision",
        ],
    );
    // o1 proper accepts images; its preview and mini siblings do not.
    strong_vision
        .patterns
        .push(pattern(r"^o1($|:|-)", Some(r"^o1-(preview|mini)")));

    vec![
        strong_vision,
        rule(
            Classification::embedding(Confidence::High),
            &[
                r"^nomic-embed",
                r"^mxbai-embed",
                r"^bge-",
                r"^e5-",
                r"text-embedding-3",
                r"text-embedding-ada",
                r"^all-minilm",
                r"^embeddinggemma",
                r"^snowflake-arctic-embed",
                r"^qwen.*embedding",
                r"^granite-embedding",
            ],
        ),
        rule(
            Classification::chat(Confidence::High),
            &[
                r"^llama",
                r"^mistral",
                r"^mixtral",
                r"^codellama",
                r"^qwen",
                r"^gemma",
                r"^deepseek",
                r"^granite",
                r"^glm",
                r"^falcon",
                r"^yi",
                r"^jamba",
                r"^nemotron",
                r"^dolphin",
                r"^vicuna",
                r"^alpaca",
                r"^chat",
                r"^gpt-5",
                r"^gpt-4",
                r"^gpt-3\.5-turbo",
                r"^o1-(preview|mini)$",
                r"^o[134]($|-|:)",
                r"instruct",
            ],
        ),
        rule(
            Classification::vision(Confidence::Medium),
            &[r"^phi.*vision", r"vl$", r"-v\d", r"multimodal"],
        ),
        rule(
            Classification::embedding(Confidence::Medium),
            &[r"embed", r"sentence", r"paraphrase"],
        ),
        rule(
            Classification::chat(Confidence::Medium),
            &[r"^phi", r"^tinyllama", r"^neural"],
        ),
    ]
});

/// Classify a model by name. Unknown names default to low-confidence chat.
pub fn classify(model_name: &str) -> Classification {
    let name = model_name.to_lowercase();
    RULES
        .iter()
        .find(|rule| rule.patterns.iter().any(|p| p.is_match(&name)))
        .map(|rule| rule.class)
        .unwrap_or(Classification::chat(Confidence::Low))
}

/// Capabilities advertised for a model in status listings.
pub fn capabilities(model_name: &str) -> Vec<Capability> {
    let class = classify(model_name);
    let mut caps = Vec::new();
    if class.is_chat {
        caps.push(Capability::Chat);
    }
    if class.is_embedding {
        caps.push(Capability::Embedding);
    }
    if class.is_vision {
        caps.push(Capability::Vision);
        caps.push(Capability::Ocr);
    }
    // "coder" and "starcoder" are covered by the substring.
    if model_name.to_lowercase().contains("code") {
        caps.push(Capability::Code);
    }
    caps
}
