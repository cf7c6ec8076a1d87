//! Scripted completion backend for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::LlmError;
use crate::features::types::{RawResponse, ResponseFeatures};
use crate::llm::prompts::{
    FEATURE_INSTRUCTIONS, QUESTION_INSIGHT_INSTRUCTIONS, RESPONSE_TEXT_MARKER,
    STRATEGIC_INSTRUCTIONS,
};
use crate::llm::{CompletionBackend, CompletionRequest, CompletionResponse, TokenUsage};

type Responder = Box<dyn Fn(&CompletionRequest, usize) -> Result<String, LlmError> + Send + Sync>;

pub struct ScriptedBackend {
    model: String,
    calls: AtomicUsize,
    responder: Responder,
}

impl ScriptedBackend {
    /// `responder` receives the request and the 0-based call index.
    pub fn new<F>(model: &str, responder: F) -> Self
    where
        F: Fn(&CompletionRequest, usize) -> Result<String, LlmError> + Send + Sync + 'static,
    {
        Self {
            model: model.to_string(),
            calls: AtomicUsize::new(0),
            responder: Box::new(responder),
        }
    }

    pub fn fixed(content: Value) -> Self {
        let text = content.to_string();
        Self::new("gpt-4.1", move |_, _| Ok(text.clone()))
    }

    /// Answers every prompt the pipeline issues, deriving features from the
    /// directives embedded in each synthetic response (see [`response_text`]).
    pub fn survey() -> Self {
        Self::survey_with_model("gpt-4.1")
    }

    pub fn survey_with_model(model: &str) -> Self {
        Self::new(model, |req, _| survey_reply(req))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Remote calls made with the feature-extraction instructions.
    pub fn is_feature_request(req: &CompletionRequest) -> bool {
        req.system_content() == FEATURE_INSTRUCTIONS
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let content = (self.responder)(request, call)?;
        Ok(CompletionResponse {
            content,
            usage: Some(TokenUsage {
                input: 20,
                output: 10,
                total: 30,
            }),
        })
    }
}

/// Synthetic response body: `directives` is a `key=value;` list understood
/// by [`ScriptedBackend::survey`] (`themes=a|b`, `sentiment`, `urgency`,
/// `stakeholder`, `fail`), followed by free prose.
pub fn response_text(directives: &str, prose: &str) -> String {
    format!("[{}] {}", directives, prose)
}

pub fn raw(id: &str, question_id: &str, question_text: &str, text: &str) -> RawResponse {
    RawResponse {
        id: id.to_string(),
        text: text.to_string(),
        question_id: question_id.to_string(),
        question_text: question_text.to_string(),
        source: "test".to_string(),
    }
}

pub fn features_json(sentiment: &str, themes: &[&str], urgency: &str, stakeholder: &str) -> Value {
    json!({
        "sentiment": sentiment,
        "sentiment_confidence": 0.9,
        "themes": themes,
        "urgency": urgency,
        "stakeholder_type": stakeholder,
        "stakeholder_confidence": 0.8,
        "key_phrases": themes.iter().map(|t| format!("about {}", t)).collect::<Vec<_>>(),
        "intent": "problem_identification",
        "contains_actionable_feedback": urgency == "high",
        "mentioned_programs": [],
        "barriers_identified": [],
        "solutions_proposed": [],
    })
}

fn survey_reply(req: &CompletionRequest) -> Result<String, LlmError> {
    let system = req.system_content();
    let reply = if system == FEATURE_INSTRUCTIONS {
        return feature_reply(req.user_content());
    } else if system == QUESTION_INSIGHT_INSTRUCTIONS {
        json!({
            "key_insights": ["Funding is the dominant concern"],
            "recommendations": ["Expand grant capacity"],
        })
    } else if system == STRATEGIC_INSTRUCTIONS {
        json!({ "strategic_insights": ["Address funding across programs"] })
    } else {
        json!({
            "strengths": ["Responsive staff"],
            "improvement_areas": ["Application length"],
            "specific_requests": ["Rolling deadlines"],
            "impact_statements": ["Kept my studio open"],
            "accessibility_issues": ["Online-only portal"],
        })
    };
    Ok(reply.to_string())
}

fn feature_reply(user: &str) -> Result<String, LlmError> {
    let body = user
        .split(RESPONSE_TEXT_MARKER)
        .nth(1)
        .and_then(|rest| rest.split("\n\n").next())
        .unwrap_or("");
    let directives = body
        .strip_prefix('[')
        .and_then(|rest| rest.split(']').next())
        .unwrap_or("");

    let mut sentiment = "neutral";
    let mut urgency = "low";
    let mut stakeholder = "resident";
    let mut themes: Vec<&str> = vec!["general"];
    for part in directives.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let (k, v) = part.split_once('=').unwrap_or((part, ""));
        match k {
            "fail" => return Err(LlmError::transport("injected failure")),
            "sentiment" => sentiment = v,
            "urgency" => urgency = v,
            "stakeholder" => stakeholder = v,
            "themes" => themes = v.split('|').filter(|t| !t.is_empty()).collect(),
            _ => {}
        }
    }
    Ok(features_json(sentiment, &themes, urgency, stakeholder).to_string())
}

pub fn features(
    sentiment: &str,
    themes: &[&str],
    urgency: &str,
    stakeholder: &str,
) -> ResponseFeatures {
    serde_json::from_value(features_json(sentiment, themes, urgency, stakeholder))
        .expect("test features decode")
}
