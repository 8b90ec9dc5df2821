// src/classifier/http.rs
//! OpenAI-compatible chat-completions backend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::ClassifierBackend;
use crate::error::ClassifyError;

const SYSTEM_PROMPT: &str = "You triage news for an infrastructure incident desk \
(water supply, heating, sewage, industrial plants). Read the article and reply with \
ONE JSON object only, no markdown: \
{\"relevance\": number 0..1, \"urgency\": integer 1..5, \
\"category\": \"accident\"|\"outage\"|\"repair\"|\"other\", \
\"object\": \"water\"|\"heat\"|\"industrial\"|\"unknown\", \
\"why\": short reason, \"action\": \"call\"|\"watch\"|\"ignore\"}.";

const RETRY_NOTE: &str =
    "\n\nNOTE: the previous reply was not valid JSON for the schema. Return ONLY the raw JSON object.";

pub struct HttpBackend {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpBackend {
    pub fn new(
        base_url: &str,
        api_key: &str,
        model: &str,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("incident-signals/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }
}

#[derive(Serialize)]
struct Msg<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct Req<'a> {
    model: &'a str,
    messages: Vec<Msg<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct Resp {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMsg,
}

#[derive(Deserialize)]
struct ChoiceMsg {
    #[serde(default)]
    content: String,
}

#[async_trait]
impl ClassifierBackend for HttpBackend {
    async fn classify_raw(&self, text: &str, attempt: u32) -> Result<String, ClassifyError> {
        let user = if attempt > 0 {
            format!("{text}{RETRY_NOTE}")
        } else {
            text.to_string()
        };
        let req = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                Msg {
                    role: "user",
                    content: &user,
                },
            ],
            temperature: 0.0,
            max_tokens: 300,
        };

        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .map_err(map_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ClassifyError::Http {
                status: status.as_u16(),
            });
        }

        let body: Resp = resp
            .json()
            .await
            .map_err(|e| ClassifyError::Invalid(format!("envelope: {e}")))?;
        body.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ClassifyError::Invalid("empty completion".into()))
    }

    fn name(&self) -> &'static str {
        "openai-compatible"
    }
}

fn map_reqwest(e: reqwest::Error) -> ClassifyError {
    if e.is_timeout() {
        ClassifyError::Timeout
    } else {
        ClassifyError::Transport(e.to_string())
    }
}
