//! Manim code generation via Gemini.
//!
//! A thin pass-through: the description is wrapped in a fixed prompt, the
//! model's answer is unwrapped from markdown fences and returned as-is.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ApiError, ApiResult};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_MODELS: &[&str] = &["gemini-2.5-flash", "gemini-2.5-flash-lite"];

static SCENE_CLASS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*class\s+([A-Za-z_][A-Za-z0-9_]*)\s*\(([^)]*)\)\s*:")
        .expect("scene class pattern is valid")
});

/// Generates render source code from a natural-language description.
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate(&self, description: &str) -> ApiResult<String>;
}

/// Gemini API client for code generation.
pub struct GeminiClient {
    api_key: String,
    models: Vec<String>,
    base_url: String,
    client: Client,
}

/// Gemini API request.
#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<Content>,
}

#[derive(Debug, Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct Part {
    text: String,
}

/// Gemini API response.
#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: ResponseContent,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: String,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>, models: Vec<String>, base_url: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            models,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    /// Build a client from `GEMINI_API_KEY`, `GEMINI_MODELS` and
    /// `GEMINI_BASE_URL`. Returns `None` when no key is configured.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())?;

        let models = std::env::var("GEMINI_MODELS")
            .map(|s| {
                s.split(',')
                    .map(|m| m.trim().to_string())
                    .filter(|m| !m.is_empty())
                    .collect::<Vec<_>>()
            })
            .ok()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| DEFAULT_MODELS.iter().map(|m| m.to_string()).collect());

        let base_url =
            std::env::var("GEMINI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());

        Some(Self::new(api_key, models, base_url))
    }

    pub fn models(&self) -> &[String] {
        &self.models
    }

    /// Call Gemini API.
    async fn call_gemini_api(&self, model: &str, prompt: &str) -> ApiResult<String> {
        let url = format!("{}/v1beta/models/{}:generateContent", self.base_url, model);

        let request = GeminiRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: prompt.to_string(),
                }],
            }],
        };

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ApiError::upstream(format!("Gemini API request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ApiError::upstream(format!(
                "Gemini API returned {}: {}",
                status, error_text
            )));
        }

        let gemini_response: GeminiResponse = response.json().await.map_err(|e| {
            ApiError::upstream(format!("Failed to parse Gemini response: {}", e))
        })?;

        let text: String = gemini_response
            .candidates
            .first()
            .map(|c| c.content.parts.iter().map(|p| p.text.as_str()).collect())
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(ApiError::upstream("No content in Gemini response"));
        }
        Ok(text)
    }
}

#[async_trait]
impl CodeGenerator for GeminiClient {
    async fn generate(&self, description: &str) -> ApiResult<String> {
        let prompt = format!("Generate Manim code based on this description: {}", description);
        let mut last_error = None;

        for model in &self.models {
            info!("Attempting Gemini API with model: {}", model);
            match self.call_gemini_api(model, &prompt).await {
                Ok(text) => {
                    info!("Generated code with {}", model);
                    return Ok(strip_code_fences(&text).to_string());
                }
                Err(e) => {
                    warn!("Failed with model {}: {}", model, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ApiError::upstream("No Gemini models configured")))
    }
}

/// Remove a surrounding markdown code fence (```` ```python ... ``` ````).
pub fn strip_code_fences(text: &str) -> &str {
    let text = text.trim();
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the info string ("python", "py", ...) on the opening line.
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    body.strip_suffix("```").unwrap_or(body).trim()
}

/// Names of classes deriving from a `*Scene` base, in source order.
pub fn detect_scene_names(code: &str) -> Vec<String> {
    SCENE_CLASS_RE
        .captures_iter(code)
        .filter(|caps| caps[2].split(',').any(|base| base.trim().ends_with("Scene")))
        .map(|caps| caps[1].to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn reply(text: &str) -> serde_json::Value {
        serde_json::json!({
            "candidates": [{ "content": { "parts": [{ "text": text }] } }]
        })
    }

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("```python\nx = 1\n```"), "x = 1");
        assert_eq!(strip_code_fences("```\nx = 1\n```\n"), "x = 1");
        assert_eq!(strip_code_fences("  x = 1  "), "x = 1");
    }

    #[test]
    fn test_detect_scene_names() {
        let code = r#"
from manim import *

class Helper:
    pass

class MyScene(Scene):
    def construct(self):
        pass

class Orbit(ThreeDScene):
    pass

class Panning(MovingCameraScene, Mixin):
    pass
"#;
        assert_eq!(detect_scene_names(code), vec!["MyScene", "Orbit", "Panning"]);
        assert!(detect_scene_names("print('no scenes')").is_empty());
    }

    #[tokio::test]
    async fn test_generate_falls_back_to_next_model() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1beta/models/primary:generateContent"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/fallback:generateContent"))
            .and(header("x-goog-api-key", "test-key"))
            .and(body_string_contains(
                "Generate Manim code based on this description: a blue circle",
            ))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(reply("```python\nclass Blue(Scene):\n    pass\n```")),
            )
            .mount(&server)
            .await;

        let client = GeminiClient::new(
            "test-key",
            vec!["primary".to_string(), "fallback".to_string()],
            server.uri(),
        );
        let code = client.generate("a blue circle").await.unwrap();

        assert_eq!(code, "class Blue(Scene):\n    pass");
    }

    #[tokio::test]
    async fn test_generate_reports_upstream_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let client = GeminiClient::new("k", vec!["only".to_string()], server.uri());
        let err = client.generate("anything").await.unwrap_err();
        assert!(matches!(err, ApiError::UpstreamGeneration(_)));
    }
}
