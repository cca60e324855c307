//! Client HTTP API.
//!
//! - `GET /`        service status
//! - `POST /speak`  `{"room_id": "...", "phrases": ["..."]}`
//! - `POST /listen` `{"room_id": "..."}`
//!
//! Requests only validate and queue a [`Job`]; jobs run in the background.

use std::convert::Infallible;
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

use super::{listen::run_listen, speak::run_speak, ClientConfig, SpeechProvider};
use crate::signaling::build_response;

/// API request errors
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("room_id is required")]
    MissingRoomId,

    #[error("phrases array cannot be empty")]
    EmptyPhrases,

    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("job queue is closed")]
    QueueClosed,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::QueueClosed => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// Background work requested through the API
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    Speak { room_id: String, phrases: Vec<String> },
    Listen { room_id: String },
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SpeakRequest {
    room_id: String,
    phrases: Vec<String>,
}

impl SpeakRequest {
    fn into_job(self) -> Result<Job, ApiError> {
        if self.room_id.is_empty() {
            return Err(ApiError::MissingRoomId);
        }
        if self.phrases.is_empty() {
            return Err(ApiError::EmptyPhrases);
        }
        Ok(Job::Speak {
            room_id: self.room_id,
            phrases: self.phrases,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ListenRequest {
    room_id: String,
}

impl ListenRequest {
    fn into_job(self) -> Result<Job, ApiError> {
        if self.room_id.is_empty() {
            return Err(ApiError::MissingRoomId);
        }
        Ok(Job::Listen { room_id: self.room_id })
    }
}

#[derive(Serialize)]
struct JobAccepted<'a> {
    success: bool,
    room_id: &'a str,
    message: String,
}

#[derive(Serialize)]
struct ServiceStatus {
    service: &'static str,
    status: &'static str,
}

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Listen address (default 0.0.0.0:8081)
    pub bind_addr: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
        }
    }
}

/// Client HTTP server
pub struct ClientApi {
    config: ApiConfig,
    jobs: mpsc::UnboundedSender<Job>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl ClientApi {
    pub fn new(config: ApiConfig, jobs: mpsc::UnboundedSender<Job>) -> Self {
        Self {
            config,
            jobs,
            shutdown_tx: None,
        }
    }

    /// Start serving. Returns the bound address.
    pub async fn start(&mut self) -> Result<SocketAddr, std::io::Error> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        self.shutdown_tx = Some(shutdown_tx);

        let jobs = self.jobs.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, remote)) => {
                                let io = TokioIo::new(stream);
                                let jobs = jobs.clone();

                                tokio::spawn(async move {
                                    let service = service_fn(move |req| {
                                        let jobs = jobs.clone();
                                        async move { handle_request(req, &jobs).await }
                                    });

                                    if let Err(e) = http1::Builder::new()
                                        .serve_connection(io, service)
                                        .await
                                    {
                                        log::warn!("[API] Connection error from {}: {}", remote, e);
                                    }
                                });
                            }
                            Err(e) => {
                                log::error!("[API] Accept error: {}", e);
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }
            log::info!("[API] Server stopped");
        });

        log::info!("[API] Listening on http://{}", local_addr);
        Ok(local_addr)
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ClientApi {
    fn drop(&mut self) {
        self.stop();
    }
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => build_response(status, &[(CONTENT_TYPE, "application/json")], body),
        Err(e) => build_response(StatusCode::INTERNAL_SERVER_ERROR, &[], e.to_string()),
    }
}

async fn read_json<B, T>(req: Request<B>) -> Result<T, ApiError>
where
    B: Body,
    B::Error: Display,
    T: DeserializeOwned,
{
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| ApiError::InvalidJson(e.to_string()))?
        .to_bytes();
    serde_json::from_slice(&body).map_err(|e| ApiError::InvalidJson(e.to_string()))
}

/// Validate, queue and acknowledge one job request
async fn accept_job<B>(req: Request<B>, jobs: &mpsc::UnboundedSender<Job>) -> Result<Response<Full<Bytes>>, ApiError>
where
    B: Body,
    B::Error: Display,
{
    let job = match req.uri().path() {
        "/speak" => read_json::<_, SpeakRequest>(req).await?.into_job()?,
        _ => read_json::<_, ListenRequest>(req).await?.into_job()?,
    };

    let (room_id, message) = match &job {
        Job::Speak { room_id, phrases } => (room_id.clone(), format!("Processing {} phrases", phrases.len())),
        Job::Listen { room_id } => (room_id.clone(), "Listening for audio".to_string()),
    };

    jobs.send(job).map_err(|_| ApiError::QueueClosed)?;
    log::info!("[API] Queued job for room '{}': {}", room_id, message);

    Ok(json_response(
        StatusCode::OK,
        &JobAccepted {
            success: true,
            room_id: &room_id,
            message,
        },
    ))
}

/// Route one API request
pub async fn handle_request<B>(
    req: Request<B>,
    jobs: &mpsc::UnboundedSender<Job>,
) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: Body,
    B::Error: Display,
{
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    let response = match (path.as_str(), method) {
        ("/", Method::GET) => json_response(
            StatusCode::OK,
            &ServiceStatus {
                service: "voice-relay client",
                status: "running",
            },
        ),
        ("/speak" | "/listen", Method::POST) => match accept_job(req, jobs).await {
            Ok(response) => response,
            Err(e) => {
                log::warn!("[API] {} rejected: {}", path, e);
                build_response(e.status(), &[], e.to_string())
            }
        },
        ("/" | "/speak" | "/listen", _) => build_response(StatusCode::METHOD_NOT_ALLOWED, &[], "Method not allowed"),
        _ => build_response(StatusCode::NOT_FOUND, &[], "Not Found"),
    };

    Ok(response)
}

/// Run queued jobs until the queue closes. Each job gets its own task.
pub async fn run_jobs(
    mut jobs: mpsc::UnboundedReceiver<Job>,
    config: Arc<ClientConfig>,
    provider: Arc<SpeechProvider>,
) {
    while let Some(job) = jobs.recv().await {
        let config = config.clone();
        let provider = provider.clone();
        tokio::spawn(async move {
            match job {
                Job::Speak { room_id, phrases } => {
                    if let Err(e) = run_speak(config, provider, room_id.clone(), phrases).await {
                        log::error!("[Speak] Job for room '{}' failed: {}", room_id, e);
                    }
                }
                Job::Listen { room_id } => {
                    if let Err(e) = run_listen(config, provider, room_id.clone()).await {
                        log::error!("[Listen] Job for room '{}' failed: {}", room_id, e);
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: Method, uri: &str, body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    async fn body_json(response: Response<Full<Bytes>>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn body_string(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_status_page() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let response = handle_request(request(Method::GET, "/", ""), &tx).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
        let json = body_json(response).await;
        assert_eq!(json["service"], "voice-relay client");
        assert_eq!(json["status"], "running");
    }

    #[tokio::test]
    async fn test_speak_queues_job() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let body = r#"{"room_id": "sala1", "phrases": ["Olá", "Tudo bem?"]}"#;
        let response = handle_request(request(Method::POST, "/speak", body), &tx)
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["room_id"], "sala1");
        assert_eq!(json["message"], "Processing 2 phrases");

        assert_eq!(
            rx.try_recv().unwrap(),
            Job::Speak {
                room_id: "sala1".to_string(),
                phrases: vec!["Olá".to_string(), "Tudo bem?".to_string()],
            }
        );
    }

    #[tokio::test]
    async fn test_listen_queues_job() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let response = handle_request(request(Method::POST, "/listen", r#"{"room_id": "sala1"}"#), &tx)
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["message"], "Listening for audio");
        assert_eq!(rx.try_recv().unwrap(), Job::Listen { room_id: "sala1".to_string() });
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let response = handle_request(request(Method::POST, "/speak", r#"{"phrases": ["x"]}"#), &tx)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_string(response).await, "room_id is required");

        let response = handle_request(request(Method::POST, "/speak", r#"{"room_id": "r", "phrases": []}"#), &tx)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_string(response).await, "phrases array cannot be empty");

        let response = handle_request(request(Method::POST, "/listen", "{not json"), &tx)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_method_and_path_routing() {
        let (tx, _rx) = mpsc::unbounded_channel();

        let response = handle_request(request(Method::GET, "/speak", ""), &tx).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        let response = handle_request(request(Method::POST, "/", ""), &tx).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        let response = handle_request(request(Method::POST, "/nope", ""), &tx).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_closed_queue_is_unavailable() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let response = handle_request(request(Method::POST, "/listen", r#"{"room_id": "r"}"#), &tx)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_server_round_trip() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut api = ClientApi::new(
            ApiConfig {
                bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            },
            tx,
        );
        let addr = api.start().await.unwrap();

        let response = reqwest::Client::new()
            .post(format!("http://{}/listen", addr))
            .body(r#"{"room_id": "net"}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(rx.recv().await, Some(Job::Listen { room_id: "net".to_string() }));

        api.stop();
    }
}
