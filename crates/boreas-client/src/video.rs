use std::time::Duration;

use async_trait::async_trait;
use boreas_core::error::AppError;
use boreas_core::traits::{VideoProvider, VideoStatus};
use reqwest::Client;
use serde::{Deserialize, Serialize};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Generic submit-then-poll AIGC video provider client.
///
/// Providers expose `POST {base}/generations` returning a task id and
/// `GET {base}/generations/{id}` returning status plus the finished URL.
#[derive(Clone)]
pub struct HttpVideoProvider {
    client: Client,
    name: String,
    base_url: String,
    api_key: String,
}

#[derive(Serialize)]
struct SubmitRequest<'a> {
    prompt: &'a str,
}

#[derive(Deserialize)]
struct SubmitResponse {
    task_id: String,
}

#[derive(Deserialize)]
struct PollResponse {
    status: String,
    #[serde(default)]
    video_url: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl HttpVideoProvider {
    pub fn new(name: impl Into<String>, base_url: &str, api_key: &str) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;
        Ok(Self {
            client,
            name: name.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn map_request_error(e: reqwest::Error) -> AppError {
        if e.is_timeout() {
            AppError::Timeout(DEFAULT_REQUEST_TIMEOUT.as_secs())
        } else if e.is_connect() {
            AppError::NetworkError(format!("Connection failed: {e}"))
        } else {
            AppError::HttpError(e.to_string())
        }
    }
}

#[async_trait]
impl VideoProvider for HttpVideoProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, prompt: &str) -> Result<String, AppError> {
        let url = format!("{}/generations", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&SubmitRequest { prompt })
            .send()
            .await
            .map_err(Self::map_request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::HttpError(format!(
                "video submit failed (HTTP {}): {}",
                status.as_u16(),
                body
            )));
        }

        let submit: SubmitResponse = response
            .json()
            .await
            .map_err(|e| AppError::HttpError(format!("bad submit response: {e}")))?;
        tracing::info!(provider = %self.name, task_id = %submit.task_id, "video job submitted");
        Ok(submit.task_id)
    }

    async fn poll(&self, job_id: &str) -> Result<VideoStatus, AppError> {
        let url = format!("{}/generations/{job_id}", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(Self::map_request_error)?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Err(AppError::NotFound(format!("video job {job_id}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::HttpError(format!(
                "video poll failed (HTTP {}): {}",
                status.as_u16(),
                body
            )));
        }

        let poll: PollResponse = response
            .json()
            .await
            .map_err(|e| AppError::HttpError(format!("bad poll response: {e}")))?;

        Ok(match poll.status.to_lowercase().as_str() {
            "pending" | "queued" => VideoStatus::Pending,
            "processing" | "running" => VideoStatus::Processing,
            "completed" | "succeeded" => match poll.video_url {
                Some(url) => VideoStatus::Completed { url },
                None => VideoStatus::Failed {
                    reason: "completed without a video url".to_string(),
                },
            },
            other => VideoStatus::Failed {
                reason: poll
                    .error
                    .unwrap_or_else(|| format!("provider status '{other}'")),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_submit_then_poll_to_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/generations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"task_id": "task-9"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/generations/task-9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "completed",
                "video_url": "https://cdn.example/v.mp4"
            })))
            .mount(&server)
            .await;

        let provider = HttpVideoProvider::new("keling", &server.uri(), "key").unwrap();
        let job_id = provider.submit("a short clip about rust").await.unwrap();
        assert_eq!(job_id, "task-9");

        let status = provider.poll(&job_id).await.unwrap();
        assert_eq!(
            status,
            VideoStatus::Completed {
                url: "https://cdn.example/v.mp4".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_poll_maps_processing_and_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/generations/busy"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "processing"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/generations/broken"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "failed",
                "error": "content policy"
            })))
            .mount(&server)
            .await;

        let provider = HttpVideoProvider::new("pika", &server.uri(), "key").unwrap();
        assert_eq!(
            provider.poll("busy").await.unwrap(),
            VideoStatus::Processing
        );
        assert_eq!(
            provider.poll("broken").await.unwrap(),
            VideoStatus::Failed {
                reason: "content policy".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_poll_unknown_job_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/generations/ghost"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let provider = HttpVideoProvider::new("runway", &server.uri(), "key").unwrap();
        let err = provider.poll("ghost").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_submit_rejection_is_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/generations"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad prompt"))
            .mount(&server)
            .await;

        let provider = HttpVideoProvider::new("keling", &server.uri(), "key").unwrap();
        let err = provider.submit("nope").await.unwrap_err();
        assert!(matches!(err, AppError::HttpError(_)));
    }
}
