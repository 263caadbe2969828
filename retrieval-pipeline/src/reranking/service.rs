use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use common::{error::AppError, utils::config::AppConfig};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{BlockingRerankService, RerankScore, RerankService};

#[derive(Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [String],
    top_n: usize,
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankScore>,
}

fn endpoint(base_url: &str) -> String {
    format!("{}/v1/rerank", base_url.trim_end_matches('/'))
}

fn failure(err: &anyhow::Error) -> AppError {
    AppError::RerankServiceFailure(format!("{err:#}"))
}

/// Client for a remote `/v1/rerank` endpoint.
pub struct HttpRerankService {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl HttpRerankService {
    pub fn new(
        base_url: &str,
        model: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint(base_url),
            model: model.into(),
            api_key,
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        Self::new(
            &config.rerank_service_url,
            config.rerank_model.clone(),
            config.rerank_api_key.clone(),
            Duration::from_secs(config.rerank_timeout_secs),
        )
    }

    async fn post(
        &self,
        query: &str,
        documents: &[String],
        top_n: usize,
    ) -> anyhow::Result<RerankResponse> {
        let mut request = self.client.post(&self.endpoint).json(&RerankRequest {
            model: &self.model,
            query,
            documents,
            top_n,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("sending rerank request to {}", self.endpoint))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("rerank service answered {status}: {body}");
        }
        response
            .json::<RerankResponse>()
            .await
            .context("decoding rerank response")
    }
}

#[async_trait]
impl RerankService for HttpRerankService {
    async fn score(
        &self,
        query: &str,
        documents: Vec<String>,
        top_n: usize,
    ) -> Result<Vec<RerankScore>, AppError> {
        let response = self
            .post(query, &documents, top_n)
            .await
            .map_err(|err| failure(&err))?;
        debug!(
            documents = documents.len(),
            results = response.results.len(),
            "Rerank service responded"
        );
        Ok(response.results)
    }
}

/// Blocking client for the same endpoint. Must not be created or used on an async worker thread.
pub struct BlockingHttpRerankService {
    client: reqwest::blocking::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl BlockingHttpRerankService {
    pub fn new(
        base_url: &str,
        model: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint(base_url),
            model: model.into(),
            api_key,
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        Self::new(
            &config.rerank_service_url,
            config.rerank_model.clone(),
            config.rerank_api_key.clone(),
            Duration::from_secs(config.rerank_timeout_secs),
        )
    }

    fn post(
        &self,
        query: &str,
        documents: &[String],
        top_n: usize,
    ) -> anyhow::Result<RerankResponse> {
        let mut request = self.client.post(&self.endpoint).json(&RerankRequest {
            model: &self.model,
            query,
            documents,
            top_n,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .with_context(|| format!("sending rerank request to {}", self.endpoint))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!("rerank service answered {status}: {body}");
        }
        response
            .json::<RerankResponse>()
            .context("decoding rerank response")
    }
}

impl BlockingRerankService for BlockingHttpRerankService {
    fn score_blocking(
        &self,
        query: &str,
        documents: Vec<String>,
        top_n: usize,
    ) -> Result<Vec<RerankScore>, AppError> {
        self.post(query, &documents, top_n)
            .map(|response| response.results)
            .map_err(|err| failure(&err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::HeaderMap, http::StatusCode, routing::post, Json, Router};
    use serde_json::{json, Value};
    use std::{net::SocketAddr, sync::Arc};
    use tokio::sync::Mutex;

    #[derive(Clone, Default)]
    struct Seen {
        bodies: Arc<Mutex<Vec<Value>>>,
        auth: Arc<Mutex<Vec<Option<String>>>>,
    }

    async fn score_by_length(
        State(seen): State<Seen>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        seen.auth.lock().await.push(
            headers
                .get("authorization")
                .and_then(|value| value.to_str().ok())
                .map(str::to_string),
        );
        let top_n = body["top_n"].as_u64().unwrap_or(0) as usize;
        let mut results: Vec<(usize, f64)> = body["documents"]
            .as_array()
            .map(|documents| {
                documents
                    .iter()
                    .enumerate()
                    .map(|(index, text)| (index, text.as_str().map_or(0, str::len) as f64))
                    .collect()
            })
            .unwrap_or_default();
        seen.bodies.lock().await.push(body);
        results.sort_by(|a, b| b.1.total_cmp(&a.1));
        results.truncate(top_n);

        Json(json!({
            "id": "stub",
            "results": results
                .into_iter()
                .map(|(index, score)| json!({"index": index, "relevance_score": score}))
                .collect::<Vec<_>>(),
        }))
    }

    async fn unavailable() -> (StatusCode, &'static str) {
        (StatusCode::SERVICE_UNAVAILABLE, "model warming up")
    }

    async fn spawn_stub(seen: Seen) -> SocketAddr {
        let app = Router::new()
            .route("/v1/rerank", post(score_by_length))
            .route("/down/v1/rerank", post(unavailable))
            .with_state(seen);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub");
        let addr = listener.local_addr().expect("stub addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve stub");
        });
        addr
    }

    fn documents() -> Vec<String> {
        vec!["mid text".into(), "a".into(), "the longest text".into()]
    }

    #[test]
    fn test_endpoint_tolerates_trailing_slash() {
        assert_eq!(endpoint("http://x:1/"), "http://x:1/v1/rerank");
        assert_eq!(endpoint("http://x:1"), "http://x:1/v1/rerank");
    }

    #[tokio::test]
    async fn test_async_client_posts_protocol_body() {
        let seen = Seen::default();
        let addr = spawn_stub(seen.clone()).await;
        let service = HttpRerankService::new(
            &format!("http://{addr}/"),
            "rerank-test",
            Some("secret".into()),
            Duration::from_secs(5),
        )
        .expect("client");

        let scores = service
            .score("which is longest", documents(), 2)
            .await
            .expect("score");
        assert_eq!(
            scores.iter().map(|score| score.index).collect::<Vec<_>>(),
            vec![2, 0]
        );
        assert!((scores[0].relevance_score - 16.0).abs() < f32::EPSILON);

        let bodies = seen.bodies.lock().await;
        assert_eq!(bodies[0]["model"], "rerank-test");
        assert_eq!(bodies[0]["query"], "which is longest");
        assert_eq!(bodies[0]["top_n"], 2);
        assert_eq!(bodies[0]["documents"].as_array().map(Vec::len), Some(3));
        assert_eq!(
            seen.auth.lock().await[0].as_deref(),
            Some("Bearer secret")
        );
    }

    #[tokio::test]
    async fn test_error_status_becomes_rerank_failure() {
        let addr = spawn_stub(Seen::default()).await;
        let service = HttpRerankService::new(
            &format!("http://{addr}/down"),
            "rerank-test",
            None,
            Duration::from_secs(5),
        )
        .expect("client");

        match service.score("q", documents(), 1).await {
            Err(AppError::RerankServiceFailure(message)) => {
                assert!(message.contains("503"), "{message}");
                assert!(message.contains("model warming up"), "{message}");
            }
            other => panic!("expected rerank failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_service_becomes_rerank_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let service = HttpRerankService::new(
            &format!("http://{addr}"),
            "rerank-test",
            None,
            Duration::from_secs(2),
        )
        .expect("client");
        assert!(matches!(
            service.score("q", documents(), 1).await,
            Err(AppError::RerankServiceFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_blocking_client_matches_async_client() {
        let seen = Seen::default();
        let addr = spawn_stub(seen.clone()).await;
        let base = format!("http://{addr}");

        let scores = tokio::task::spawn_blocking(move || {
            let service =
                BlockingHttpRerankService::new(&base, "rerank-test", None, Duration::from_secs(5))
                    .expect("client");
            service.score_blocking("q", documents(), 3)
        })
        .await
        .expect("join")
        .expect("score");

        assert_eq!(
            scores.iter().map(|score| score.index).collect::<Vec<_>>(),
            vec![2, 0, 1]
        );
        assert_eq!(seen.auth.lock().await[0], None);
    }
}
