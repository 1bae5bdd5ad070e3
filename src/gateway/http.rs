//! HTTP surface and the per-request orchestration state machine.
//!
//! One `Orchestrator` per in-flight request drives admission → routing →
//! skeleton journal → the nested retry-then-fallback attempt loop →
//! response delivery. Buffered responses are journaled before the body is
//! flushed; streaming responses commit to the first target that produces a
//! chunk and never fall back afterwards.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::providers::{ChunkSource, ErrorSource, Provider, ProviderRegistry};
use crate::types::{ChatChunk, ChatRequest, ChatResponse};
use crate::RelayError;

use super::config::{Route, Target};
use super::limits::AdmissionControl;
use super::router::{is_retryable, Router as RouteTable};
use super::token_count;
use super::usage::{AttemptRecord, UsageRecord, UsageStore};

const SSE_DONE_FRAME: &[u8] = b"data: [DONE]\n\n";
const FRAME_CHANNEL_CAPACITY: usize = 32;

/// Shared across requests: route table and provider registry are read-only
/// after init, the store and limiter synchronize internally.
#[derive(Clone)]
pub struct GatewayState {
    route_table: Arc<RouteTable>,
    registry: Arc<ProviderRegistry>,
    store: UsageStore,
    limiter: Arc<dyn AdmissionControl>,
}

impl GatewayState {
    pub fn new(
        route_table: RouteTable,
        registry: ProviderRegistry,
        store: UsageStore,
        limiter: Arc<dyn AdmissionControl>,
    ) -> Self {
        Self {
            route_table: Arc::new(route_table),
            registry: Arc::new(registry),
            store,
            limiter,
        }
    }
}

pub fn router(state: GatewayState) -> axum::Router {
    axum::Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn chat_completions(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    let request_id = request_id_from(&headers);

    let request: ChatRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            tracing::warn!(%request_id, error = %err, "rejecting malformed request body");
            return error_response(StatusCode::BAD_REQUEST, "invalid request body", &request_id);
        }
    };

    Orchestrator {
        state,
        request,
        request_id,
        started,
    }
    .run()
    .await
}

fn request_id_from(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

struct Orchestrator {
    state: GatewayState,
    request: ChatRequest,
    request_id: String,
    started: Instant,
}

enum StreamAttempt {
    Committed(Response),
    Failed(RelayError),
}

enum FirstEvent {
    Chunk(ChatChunk),
    Closed,
    Error(RelayError),
}

impl Orchestrator {
    async fn run(self) -> Response {
        let tenant = self.request.tenant().to_string();
        let use_case = self.request.use_case().to_string();
        tracing::info!(
            request_id = %self.request_id,
            %tenant,
            %use_case,
            stream = self.request.stream,
            "chat completion ingress"
        );

        // Admission against the tenant's sliding-window token budget. An
        // unreachable limiter store admits the request: availability over
        // enforcement, logged so the degradation is visible.
        let estimate = token_count::approximate_tokens(&token_count::serialize_messages(
            &self.request.messages,
        ));
        match self.state.limiter.allow(&tenant, estimate).await {
            Ok(true) => {}
            Ok(false) => {
                self.journal(UsageRecord {
                    request_id: self.request_id.clone(),
                    tenant: tenant.clone(),
                    use_case: use_case.clone(),
                    status_code: StatusCode::TOO_MANY_REQUESTS.as_u16(),
                    error_message: "rate limited".to_string(),
                    ..UsageRecord::default()
                })
                .await;
                return error_response(
                    StatusCode::TOO_MANY_REQUESTS,
                    "rate limited",
                    &self.request_id,
                );
            }
            Err(err) => {
                tracing::warn!(
                    request_id = %self.request_id,
                    %tenant,
                    error = %err,
                    "rate limiter unreachable, admitting request"
                );
            }
        }

        let route = self.state.route_table.route(&use_case);
        if route.name.is_empty() {
            let message = format!("no route configured for use case {use_case:?}");
            self.journal(UsageRecord {
                request_id: self.request_id.clone(),
                tenant: tenant.clone(),
                use_case: use_case.clone(),
                status_code: StatusCode::BAD_GATEWAY.as_u16(),
                error_message: message.clone(),
                latency_ms: self.started.elapsed().as_millis() as u64,
                ..UsageRecord::default()
            })
            .await;
            return error_response(StatusCode::BAD_GATEWAY, &message, &self.request_id);
        }

        // Skeleton row first: attempt rows resolve their foreign key
        // against it.
        self.journal(UsageRecord {
            request_id: self.request_id.clone(),
            tenant: tenant.clone(),
            use_case: use_case.clone(),
            route_name: route.name.clone(),
            ..UsageRecord::default()
        })
        .await;

        self.attempt_loop(&tenant, &use_case, &route).await
    }

    /// The two-level state machine: `(target_index, retry_count)` advancing
    /// deterministically. One monotone attempt counter spans all targets
    /// and is never reset.
    async fn attempt_loop(&self, tenant: &str, use_case: &str, route: &Route) -> Response {
        let targets = route.targets();
        let mut attempt_no: u32 = 1;
        let mut last_error: Option<RelayError> = None;

        'targets: for target in &targets {
            let mut retry: u32 = 0;
            loop {
                let Some(provider) = self.state.registry.get(&target.provider) else {
                    let err = RelayError::ProviderNotFound(target.provider.clone());
                    self.journal_attempt(attempt_no, target, 0, &err).await;
                    attempt_no += 1;
                    last_error = Some(err);
                    continue 'targets;
                };

                // The route's target decides the model, not the client.
                let mut provider_request = self.request.clone();
                provider_request.model = target.model.clone();

                if self.request.stream {
                    match self
                        .commit_stream(
                            provider,
                            provider_request,
                            tenant,
                            use_case,
                            route,
                            target,
                            attempt_no,
                        )
                        .await
                    {
                        StreamAttempt::Committed(response) => return response,
                        StreamAttempt::Failed(err) => {
                            attempt_no += 1;
                            let retryable = is_retryable(&err);
                            last_error = Some(err);
                            if retryable && retry < route.retries {
                                retry += 1;
                                continue;
                            }
                            continue 'targets;
                        }
                    }
                }

                let attempt_started = Instant::now();
                let result = self
                    .call_buffered(provider.as_ref(), &provider_request, route.timeout_ms)
                    .await;
                let latency_ms = attempt_started.elapsed().as_millis() as u64;

                match result {
                    Ok(response) => {
                        self.journal_attempt_success(attempt_no, target, latency_ms)
                            .await;
                        // Journal-first, respond-second: downstream analytics
                        // must never see a response the journal missed.
                        self.journal(UsageRecord {
                            request_id: self.request_id.clone(),
                            tenant: tenant.to_string(),
                            use_case: use_case.to_string(),
                            route_name: route.name.clone(),
                            provider: target.provider.clone(),
                            model: target.model.clone(),
                            prompt_tokens: response.usage.prompt_tokens,
                            completion_tokens: response.usage.completion_tokens,
                            total_tokens: response.usage.total_tokens,
                            latency_ms: self.started.elapsed().as_millis() as u64,
                            status_code: StatusCode::OK.as_u16(),
                            error_message: String::new(),
                        })
                        .await;
                        tracing::info!(
                            request_id = %self.request_id,
                            route = %route.name,
                            provider = %target.provider,
                            model = %target.model,
                            attempt_no,
                            "chat completion served"
                        );
                        return self.success_response(route, target, response);
                    }
                    Err(err) => {
                        tracing::warn!(
                            request_id = %self.request_id,
                            provider = %target.provider,
                            model = %target.model,
                            attempt_no,
                            error = %err,
                            "provider attempt failed"
                        );
                        self.journal_attempt(attempt_no, target, latency_ms, &err)
                            .await;
                        attempt_no += 1;
                        let retryable = is_retryable(&err);
                        last_error = Some(err);
                        if retryable && retry < route.retries {
                            retry += 1;
                            continue;
                        }
                        continue 'targets;
                    }
                }
            }
        }

        let message = last_error
            .map(|err| err.to_string())
            .unwrap_or_else(|| "no targets available".to_string());
        self.journal(UsageRecord {
            request_id: self.request_id.clone(),
            tenant: tenant.to_string(),
            use_case: use_case.to_string(),
            route_name: route.name.clone(),
            latency_ms: self.started.elapsed().as_millis() as u64,
            status_code: StatusCode::BAD_GATEWAY.as_u16(),
            error_message: message.clone(),
            ..UsageRecord::default()
        })
        .await;
        error_response(StatusCode::BAD_GATEWAY, &message, &self.request_id)
    }

    async fn call_buffered(
        &self,
        provider: &dyn Provider,
        request: &ChatRequest,
        timeout_ms: u64,
    ) -> crate::Result<ChatResponse> {
        if timeout_ms == 0 {
            return provider.chat(request).await;
        }
        match tokio::time::timeout(Duration::from_millis(timeout_ms), provider.chat(request)).await
        {
            Ok(result) => result,
            Err(_) => Err(RelayError::Timeout {
                after_ms: timeout_ms,
            }),
        }
    }

    /// Streaming dispatch. The attempt commits once the adapter produces a
    /// first chunk (or closes cleanly without one); a failure before that
    /// still participates in retry/fallback. After commit the headers are
    /// on the wire and no further target is tried.
    #[allow(clippy::too_many_arguments)]
    async fn commit_stream(
        &self,
        provider: Arc<dyn Provider>,
        request: ChatRequest,
        tenant: &str,
        use_case: &str,
        route: &Route,
        target: &Target,
        attempt_no: u32,
    ) -> StreamAttempt {
        let attempt_started = Instant::now();
        let (mut chunk_rx, mut err_rx) = provider.chat_stream(&request);

        let first = if route.timeout_ms > 0 {
            match tokio::time::timeout(
                Duration::from_millis(route.timeout_ms),
                first_event(&mut chunk_rx, &mut err_rx),
            )
            .await
            {
                Ok(event) => event,
                Err(_) => FirstEvent::Error(RelayError::Timeout {
                    after_ms: route.timeout_ms,
                }),
            }
        } else {
            first_event(&mut chunk_rx, &mut err_rx).await
        };

        let first_chunk = match first {
            FirstEvent::Chunk(chunk) => Some(chunk),
            FirstEvent::Closed => None,
            FirstEvent::Error(err) => {
                tracing::warn!(
                    request_id = %self.request_id,
                    provider = %target.provider,
                    model = %target.model,
                    attempt_no,
                    error = %err,
                    "stream attempt failed before first chunk"
                );
                let latency_ms = attempt_started.elapsed().as_millis() as u64;
                self.journal_attempt(attempt_no, target, latency_ms, &err)
                    .await;
                return StreamAttempt::Failed(err);
            }
        };

        let (frame_tx, frame_rx) = mpsc::channel::<Bytes>(FRAME_CHANNEL_CAPACITY);
        let pump = StreamPump {
            store: self.state.store.clone(),
            request_id: self.request_id.clone(),
            tenant: tenant.to_string(),
            use_case: use_case.to_string(),
            route_name: route.name.clone(),
            target: target.clone(),
            attempt_no,
            serialized_messages: token_count::serialize_messages(&self.request.messages),
            request_started: self.started,
            attempt_started,
        };
        tokio::spawn(pump.run(first_chunk, chunk_rx, err_rx, frame_tx));

        let body = Body::from_stream(
            ReceiverStream::new(frame_rx).map(Ok::<_, Infallible>),
        );
        let mut response = Response::new(body);
        let headers = response.headers_mut();
        insert_header(headers, "content-type", "text/event-stream");
        insert_header(headers, "cache-control", "no-cache");
        insert_header(headers, "connection", "keep-alive");
        insert_header(headers, "x-request-id", &self.request_id);
        insert_header(headers, "x-gw-route", &route.name);
        insert_header(headers, "x-gw-provider", &target.provider);
        insert_header(headers, "x-gw-model", &target.model);
        StreamAttempt::Committed(response)
    }

    fn success_response(&self, route: &Route, target: &Target, payload: ChatResponse) -> Response {
        let mut response = Json(payload).into_response();
        let headers = response.headers_mut();
        insert_header(headers, "x-request-id", &self.request_id);
        insert_header(headers, "x-gw-route", &route.name);
        insert_header(headers, "x-gw-provider", &target.provider);
        insert_header(headers, "x-gw-model", &target.model);
        response
    }

    async fn journal(&self, record: UsageRecord) {
        if let Err(err) = self.state.store.log(record).await {
            tracing::error!(
                request_id = %self.request_id,
                error = %err,
                "usage journal write failed"
            );
        }
    }

    async fn journal_attempt(
        &self,
        attempt_no: u32,
        target: &Target,
        latency_ms: u64,
        error: &RelayError,
    ) {
        let attempt = AttemptRecord {
            attempt_no,
            provider: target.provider.clone(),
            model: target.model.clone(),
            latency_ms,
            status_code: StatusCode::BAD_GATEWAY.as_u16(),
            error_message: error.to_string(),
        };
        if let Err(err) = self.state.store.log_attempt(&self.request_id, attempt).await {
            tracing::error!(
                request_id = %self.request_id,
                error = %err,
                "attempt journal write failed"
            );
        }
    }

    async fn journal_attempt_success(&self, attempt_no: u32, target: &Target, latency_ms: u64) {
        let attempt = AttemptRecord {
            attempt_no,
            provider: target.provider.clone(),
            model: target.model.clone(),
            latency_ms,
            status_code: StatusCode::OK.as_u16(),
            error_message: String::new(),
        };
        if let Err(err) = self.state.store.log_attempt(&self.request_id, attempt).await {
            tracing::error!(
                request_id = %self.request_id,
                error = %err,
                "attempt journal write failed"
            );
        }
    }
}

/// Waits for the adapter's first sign of life, racing the chunk and error
/// sources. A closed error source alone is not an outcome; the chunk side
/// still decides between data and clean end-of-stream.
async fn first_event(chunk_rx: &mut ChunkSource, err_rx: &mut ErrorSource) -> FirstEvent {
    let mut err_closed = false;
    loop {
        tokio::select! {
            // Data is drained ahead of the terminal error so chunks keep the
            // order the provider produced them in.
            biased;
            chunk = chunk_rx.recv() => {
                return match chunk {
                    Some(chunk) => FirstEvent::Chunk(chunk),
                    // A buffered error outranks the close it arrived with.
                    None => match err_rx.try_recv() {
                        Ok(err) => FirstEvent::Error(err),
                        Err(_) => FirstEvent::Closed,
                    },
                };
            }
            err = err_rx.recv(), if !err_closed => {
                match err {
                    Some(err) => return FirstEvent::Error(err),
                    None => err_closed = true,
                }
            }
        }
    }
}

/// Consumes the committed stream on its own task, forwarding SSE frames to
/// the response body. Client disconnect surfaces as a failed frame send and
/// stops the pump with no further journal writes.
struct StreamPump {
    store: UsageStore,
    request_id: String,
    tenant: String,
    use_case: String,
    route_name: String,
    target: Target,
    attempt_no: u32,
    serialized_messages: String,
    request_started: Instant,
    attempt_started: Instant,
}

impl StreamPump {
    async fn run(
        self,
        first_chunk: Option<ChatChunk>,
        mut chunk_rx: ChunkSource,
        mut err_rx: ErrorSource,
        frame_tx: mpsc::Sender<Bytes>,
    ) {
        let mut content = String::new();

        match first_chunk {
            Some(chunk) => {
                content.push_str(chunk.delta_content());
                if send_chunk_frame(&frame_tx, &chunk).await.is_err() {
                    return;
                }
            }
            None => {
                // Clean close with zero chunks is still a completed stream.
                self.finish(&frame_tx, &content).await;
                return;
            }
        }

        let mut err_closed = false;
        loop {
            tokio::select! {
                biased;
                chunk = chunk_rx.recv() => match chunk {
                    Some(chunk) => {
                        content.push_str(chunk.delta_content());
                        if send_chunk_frame(&frame_tx, &chunk).await.is_err() {
                            return;
                        }
                    }
                    None => {
                        match err_rx.try_recv() {
                            Ok(err) => self.fail(&frame_tx, err).await,
                            Err(_) => self.finish(&frame_tx, &content).await,
                        }
                        return;
                    }
                },
                err = err_rx.recv(), if !err_closed => match err {
                    Some(err) => {
                        self.fail(&frame_tx, err).await;
                        return;
                    }
                    None => err_closed = true,
                },
            }
        }
    }

    async fn finish(&self, frame_tx: &mpsc::Sender<Bytes>, content: &str) {
        let prompt_tokens = token_count::approximate_tokens(&self.serialized_messages);
        let completion_tokens = token_count::approximate_tokens(content);

        let attempt = AttemptRecord {
            attempt_no: self.attempt_no,
            provider: self.target.provider.clone(),
            model: self.target.model.clone(),
            latency_ms: self.attempt_started.elapsed().as_millis() as u64,
            status_code: StatusCode::OK.as_u16(),
            error_message: String::new(),
        };
        if let Err(err) = self.store.log_attempt(&self.request_id, attempt).await {
            tracing::error!(
                request_id = %self.request_id,
                error = %err,
                "attempt journal write failed"
            );
        }

        // Usage comes from the approximator: the stream path has no usage
        // block to lean on.
        let record = UsageRecord {
            request_id: self.request_id.clone(),
            tenant: self.tenant.clone(),
            use_case: self.use_case.clone(),
            route_name: self.route_name.clone(),
            provider: self.target.provider.clone(),
            model: self.target.model.clone(),
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            latency_ms: self.request_started.elapsed().as_millis() as u64,
            status_code: StatusCode::OK.as_u16(),
            error_message: String::new(),
        };
        if let Err(err) = self.store.log(record).await {
            tracing::error!(
                request_id = %self.request_id,
                error = %err,
                "usage journal write failed"
            );
        }

        let _ = frame_tx.send(Bytes::from_static(SSE_DONE_FRAME)).await;
    }

    async fn fail(&self, frame_tx: &mpsc::Sender<Bytes>, error: RelayError) {
        tracing::warn!(
            request_id = %self.request_id,
            provider = %self.target.provider,
            error = %error,
            "mid-stream provider error, closing stream"
        );
        let attempt = AttemptRecord {
            attempt_no: self.attempt_no,
            provider: self.target.provider.clone(),
            model: self.target.model.clone(),
            latency_ms: self.attempt_started.elapsed().as_millis() as u64,
            status_code: StatusCode::BAD_GATEWAY.as_u16(),
            error_message: error.to_string(),
        };
        if let Err(err) = self.store.log_attempt(&self.request_id, attempt).await {
            tracing::error!(
                request_id = %self.request_id,
                error = %err,
                "attempt journal write failed"
            );
        }

        let payload = serde_json::json!({"error": {"message": error.to_string()}});
        let _ = frame_tx.send(sse_frame(&payload)).await;
    }
}

async fn send_chunk_frame(
    frame_tx: &mpsc::Sender<Bytes>,
    chunk: &ChatChunk,
) -> Result<(), mpsc::error::SendError<Bytes>> {
    match serde_json::to_value(chunk) {
        Ok(payload) => frame_tx.send(sse_frame(&payload)).await,
        Err(err) => {
            tracing::error!(error = %err, "failed to encode stream chunk");
            Ok(())
        }
    }
}

fn sse_frame(payload: &serde_json::Value) -> Bytes {
    Bytes::from(format!("data: {payload}\n\n"))
}

fn error_response(status: StatusCode, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {"message": message, "request_id": request_id}
    });
    let mut response = (status, Json(body)).into_response();
    insert_header(response.headers_mut(), "x-request-id", request_id);
    response
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}
