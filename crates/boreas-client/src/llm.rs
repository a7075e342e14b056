use std::time::Duration;

use async_trait::async_trait;
use boreas_core::error::AppError;
use boreas_core::models::TrendSource;
use boreas_core::traits::{Generator, Parser, QualityScorer, QualityScores};
use reqwest::Client;
use serde::{Deserialize, Serialize};

const DEFAULT_MAX_TOKENS: u32 = 2048;

/// OpenAI-compatible chat-completion client.
///
/// Works with any OpenAI-compatible API (OpenAI, Zhipu, DeepSeek, Ollama's
/// compatibility endpoint, ...). One instance is one (base_url, model) pair;
/// primary/fallback pairs are composed by the generation stage, not here.
#[derive(Clone)]
pub struct ChatGenerator {
    client: Client,
    backend: String,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
}

impl ChatGenerator {
    pub fn new(
        backend: impl Into<String>,
        base_url: &str,
        api_key: &str,
        model: &str,
    ) -> Result<Self, AppError> {
        let client = Client::builder()
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;
        Ok(Self {
            client,
            backend: backend.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            temperature: 0.7,
        })
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

// ---- OpenAI API types ----

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[async_trait]
impl Generator for ChatGenerator {
    fn backend(&self) -> &str {
        &self.backend
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        prompt: &str,
        max_tokens: u32,
        budget: Duration,
    ) -> Result<String, AppError> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            temperature: self.temperature,
            max_tokens: if max_tokens == 0 {
                DEFAULT_MAX_TOKENS
            } else {
                max_tokens
            },
        };

        let response = self
            .client
            .post(&url)
            .timeout(budget)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Timeout(budget.as_secs())
                } else if e.is_connect() {
                    AppError::NetworkError(format!("Connection failed: {e}"))
                } else {
                    AppError::HttpError(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let status_code = status.as_u16();
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiError>(&body)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| format!("HTTP {status_code}: {body}"));

            if status_code == 429 {
                return Err(AppError::RateLimitExceeded);
            }
            return Err(AppError::LlmError {
                message,
                status_code,
                retryable: status_code >= 500,
            });
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to parse LLM response: {e}")))?;

        let content = chat_response
            .choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .ok_or_else(|| AppError::LlmError {
                message: "Empty response from LLM".into(),
                status_code: 200,
                retryable: false,
            })?;

        Ok(strip_think_blocks(content).to_string())
    }
}

/// Strip `<think>...</think>` blocks emitted by reasoning-tuned models.
fn strip_think_blocks(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("<think>")
        && let Some(end) = rest.find("</think>")
    {
        return rest[end + "</think>".len()..].trim();
    }
    trimmed
}

/// Model-backed parser: prompts a [`Generator`] for strict contract JSON and
/// classifies its failures for the parse router.
pub struct LlmParser<G: Generator> {
    generator: G,
    max_tokens: u32,
    budget: Duration,
}

impl<G: Generator> LlmParser<G> {
    pub fn new(generator: G) -> Self {
        Self {
            generator,
            max_tokens: 900,
            budget: Duration::from_secs(60),
        }
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    fn build_prompt(source: &TrendSource) -> String {
        format!(
            "You are a parser. Return STRICT JSON object only, no markdown.\n\
             Required schema:\n\
             {{\n\
               \"schema_version\":\"v1\",\n\
               \"source_platform\":\"string\",\n\
               \"source_id\":\"string\",\n\
               \"title\":\"string\",\n\
               \"summary\":\"string\",\n\
               \"key_points\":[\"string\"],\n\
               \"keywords\":[\"string\"],\n\
               \"sentiment\":\"positive|neutral|negative\",\n\
               \"language\":\"string\",\n\
               \"confidence_model\":0.0\n\
             }}\n\n\
             source_platform={}\n\
             source_id={}\n\
             language={}\n\
             title={}\n\
             description={}\n",
            source.source_platform,
            source.source_id,
            source.language,
            source.title,
            source.description,
        )
    }
}

#[async_trait]
impl<G: Generator> Parser for LlmParser<G> {
    async fn parse(&self, source: &TrendSource) -> Result<serde_json::Value, AppError> {
        let prompt = Self::build_prompt(source);
        let text = self
            .generator
            .generate(&prompt, self.max_tokens, self.budget)
            .await
            .map_err(|e| match e {
                // Transport-level trouble will pass; prompt-level trouble won't.
                AppError::Timeout(_) | AppError::NetworkError(_) | AppError::RateLimitExceeded => {
                    AppError::RecoverableParse {
                        code: "llm_retryable".to_string(),
                        message: e.to_string(),
                    }
                }
                AppError::LlmError {
                    retryable: true, ..
                } => AppError::RecoverableParse {
                    code: "llm_retryable".to_string(),
                    message: e.to_string(),
                },
                other => AppError::UnrecoverableParse {
                    code: "llm_unrecoverable".to_string(),
                    message: other.to_string(),
                },
            })?;

        let trimmed = text.trim();
        let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) else {
            return Err(AppError::RecoverableParse {
                code: "llm_output_format".to_string(),
                message: "llm output is not a json object".to_string(),
            });
        };
        if end < start {
            return Err(AppError::RecoverableParse {
                code: "llm_output_format".to_string(),
                message: "llm output is not a json object".to_string(),
            });
        }
        let value: serde_json::Value =
            serde_json::from_str(&trimmed[start..=end]).map_err(|e| AppError::RecoverableParse {
                code: "llm_output_json".to_string(),
                message: e.to_string(),
            })?;
        if !value.is_object() {
            return Err(AppError::RecoverableParse {
                code: "llm_output_json_type".to_string(),
                message: "llm output json must be an object".to_string(),
            });
        }
        Ok(value)
    }
}

/// Model-backed draft reviewer implementing the quality-scoring capability.
pub struct LlmQualityScorer<G: Generator> {
    generator: G,
    budget: Duration,
}

impl<G: Generator> LlmQualityScorer<G> {
    pub fn new(generator: G) -> Self {
        Self {
            generator,
            budget: Duration::from_secs(30),
        }
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }
}

#[async_trait]
impl<G: Generator> QualityScorer for LlmQualityScorer<G> {
    async fn score(&self, text: &str) -> Result<QualityScores, AppError> {
        let prompt = format!(
            "Review the following social media draft. Return STRICT JSON only:\n\
             {{\"quality\":0.0,\"compliance\":0.0,\"repetition\":0.0}}\n\
             quality and compliance are 0..1 (higher is better); repetition is \
             0..1 (higher means more repetitive/derivative).\n\n{text}"
        );
        let response = self.generator.generate(&prompt, 256, self.budget).await?;

        let trimmed = response.trim();
        let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) else {
            return Err(AppError::LlmError {
                message: "quality review output is not a json object".to_string(),
                status_code: 200,
                retryable: false,
            });
        };
        let scores: QualityScores = serde_json::from_str(&trimmed[start..=end])?;
        Ok(QualityScores {
            quality: scores.quality.clamp(0.0, 1.0),
            compliance: scores.compliance.clamp(0.0, 1.0),
            repetition: scores.repetition.clamp(0.0, 1.0),
        })
    }
}
