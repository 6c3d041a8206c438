//! Connection orchestration: resolve the model, drive the transport, decode
//! and forward fragments, and apply the continuation retry policy.

use crate::models::{ChatCompletion, ChatRequest, ModelSpec, ResponseFragment, Usage};
use crate::providers::error::{is_stale_continuation_message, ProviderError};
use crate::providers::registry::ResolvedModel;
use crate::providers::streaming::Reassembler;
use crate::providers::transport::Transport;
use crate::providers::{ChatProvider, ProviderPayload, ProviderRegistry};
use crate::usage::{UsageContext, UsageSink};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Name used in error messages raised before any backend is selected
const RELAY_NAME: &str = "relay";

/// How a request ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Failed(String),
    /// The caller stopped listening before the terminal fragment
    Aborted,
}

/// Summary of one orchestrated request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamReport {
    /// Fragments delivered to the caller
    pub fragments: usize,
    /// A stale continuation was dropped and the request re-sent
    pub retried: bool,
    pub aborted_by_client: bool,
    pub outcome: StreamOutcome,
}

/// Receiver of the fragment channel was dropped
struct ClientGone;

enum Attempt {
    Finished(StreamOutcome),
    StaleContinuation,
}

/// Releases fragments to the caller and records usage once per request
struct Emitter<'a> {
    tx: &'a mpsc::Sender<ResponseFragment>,
    sink: &'a dyn UsageSink,
    context: &'a UsageContext,
    sent: usize,
    usage: Option<Usage>,
}

impl Emitter<'_> {
    async fn send(&mut self, mut fragment: ResponseFragment) -> Result<(), ClientGone> {
        if let Some(usage) = fragment.usage {
            if self.usage.is_some() {
                debug!("Dropping repeated usage {:?}", usage);
                fragment.usage = None;
            } else {
                self.sink.record(&usage, self.context);
                self.usage = Some(usage);
            }
        }

        self.tx.send(fragment).await.map_err(|_| ClientGone)?;
        self.sent += 1;
        Ok(())
    }

    async fn fail(&mut self, message: String) -> Result<StreamOutcome, ClientGone> {
        error!("❌ {}", message);
        self.send(ResponseFragment::failure(message.clone())).await?;
        Ok(StreamOutcome::Failed(message))
    }

    /// Release a terminal fragment and report how the request ended
    async fn finish(&mut self, terminal: ResponseFragment) -> Result<StreamOutcome, ClientGone> {
        let outcome = match &terminal.error {
            Some(message) => {
                error!("❌ {}", message);
                StreamOutcome::Failed(message.clone())
            }
            None => StreamOutcome::Completed,
        };
        self.send(terminal).await?;
        Ok(outcome)
    }
}

enum Flow {
    Continue,
    Stop,
    StaleContinuation,
}

/// Per-attempt fragment bookkeeping for a streamed response
struct StreamState {
    /// Fragments pass straight through once the retry window has closed
    gate_open: bool,
    held: Vec<ResponseFragment>,
    /// Terminal fragment waiting for trailing metadata
    terminal: Option<ResponseFragment>,
}

impl StreamState {
    fn new(retry_possible: bool) -> Self {
        Self {
            gate_open: !retry_possible,
            held: Vec::new(),
            terminal: None,
        }
    }

    async fn accept(
        &mut self,
        mut fragment: ResponseFragment,
        emitter: &mut Emitter<'_>,
    ) -> Result<Flow, ClientGone> {
        if fragment.is_noop() {
            return Ok(Flow::Continue);
        }

        if !self.gate_open {
            if fragment
                .error
                .as_deref()
                .is_some_and(is_stale_continuation_message)
            {
                return Ok(Flow::StaleContinuation);
            }
            if fragment.text.is_empty() && !fragment.is_done {
                self.held.push(fragment);
                return Ok(Flow::Continue);
            }
            self.gate_open = true;
            for held in std::mem::take(&mut self.held) {
                emitter.send(held).await?;
            }
        }

        if let Some(terminal) = self.terminal.as_mut() {
            if !fragment.text.is_empty() {
                let text = std::mem::take(&mut fragment.text);
                if terminal.text.is_empty() {
                    emitter.send(ResponseFragment::delta(text)).await?;
                } else {
                    terminal.text.push_str(&text);
                }
            }
            terminal.absorb_metadata(fragment);
            return Ok(Flow::Continue);
        }

        if fragment.is_done {
            let failed = fragment.error.is_some();
            self.terminal = Some(fragment);
            return Ok(if failed { Flow::Stop } else { Flow::Continue });
        }

        emitter.send(fragment).await?;
        Ok(Flow::Continue)
    }

    async fn flush_held(&mut self, emitter: &mut Emitter<'_>) -> Result<(), ClientGone> {
        for held in std::mem::take(&mut self.held) {
            emitter.send(held).await?;
        }
        Ok(())
    }
}

/// Runs chat requests against the configured backends
pub struct ChatService {
    registry: Arc<ProviderRegistry>,
    transport: Arc<dyn Transport>,
    usage_sink: Arc<dyn UsageSink>,
}

impl ChatService {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        transport: Arc<dyn Transport>,
        usage_sink: Arc<dyn UsageSink>,
    ) -> Self {
        Self {
            registry,
            transport,
            usage_sink,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Validate the request and resolve its model without dispatching it
    pub fn check(&self, request: &ChatRequest) -> Result<ResolvedModel, ProviderError> {
        request.validate().map_err(ProviderError::InvalidRequest)?;
        self.registry.resolve(&request.model)
    }

    /// Run a request, delivering fragments on `tx`. Exactly one fragment
    /// with `is_done` is sent unless the receiver goes away first.
    pub async fn stream(
        &self,
        request: &ChatRequest,
        context: &UsageContext,
        tx: mpsc::Sender<ResponseFragment>,
    ) -> StreamReport {
        let span = info_span!(
            "chat",
            request_id = %Uuid::new_v4(),
            model = %request.model,
            provider = tracing::field::Empty,
        );
        self.run(request, context, &tx).instrument(span).await
    }

    /// Run a request and aggregate every fragment into one completion
    pub async fn complete(&self, request: &ChatRequest, context: &UsageContext) -> ChatCompletion {
        let (tx, mut rx) = mpsc::channel::<ResponseFragment>(64);
        let collect = async move {
            let mut completion = ChatCompletion::default();
            while let Some(fragment) = rx.recv().await {
                completion.text.push_str(&fragment.text);
                if fragment.usage.is_some() {
                    completion.usage = fragment.usage;
                }
                if fragment.citations.is_some() {
                    completion.citations = fragment.citations;
                }
                if fragment.continuation_token.is_some() {
                    completion.continuation_token = fragment.continuation_token;
                }
                if fragment.tool_calls.is_some() {
                    completion.tool_calls = fragment.tool_calls;
                }
                // Earlier auxiliaries are progress notices
                if fragment.is_done {
                    completion.auxiliary = fragment.auxiliary;
                }
                if fragment.error.is_some() {
                    completion.error = fragment.error;
                }
            }
            completion
        };

        let (_, completion) = tokio::join!(self.stream(request, context, tx), collect);
        completion
    }

    async fn run(
        &self,
        request: &ChatRequest,
        context: &UsageContext,
        tx: &mpsc::Sender<ResponseFragment>,
    ) -> StreamReport {
        let started = Instant::now();
        let mut emitter = Emitter {
            tx,
            sink: self.usage_sink.as_ref(),
            context,
            sent: 0,
            usage: None,
        };
        let mut retried = false;

        let result = self.dispatch(request, &mut emitter, &mut retried).await;
        let (outcome, aborted_by_client) = match result {
            Ok(outcome) => (outcome, false),
            Err(ClientGone) => {
                info!("🔌 Client went away, backend stream closed");
                (StreamOutcome::Aborted, true)
            }
        };

        let usage = emitter.usage.unwrap_or_default();
        info!(
            latency_ms = started.elapsed().as_millis() as u64,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            fragments = emitter.sent,
            retried,
            "✅ Request finished: {:?}",
            outcome
        );

        StreamReport {
            fragments: emitter.sent,
            retried,
            aborted_by_client,
            outcome,
        }
    }

    async fn dispatch(
        &self,
        request: &ChatRequest,
        emitter: &mut Emitter<'_>,
        retried: &mut bool,
    ) -> Result<StreamOutcome, ClientGone> {
        let resolved = match self.check(request) {
            Ok(resolved) => resolved,
            Err(e) => return emitter.fail(e.describe(RELAY_NAME)).await,
        };
        let provider = resolved.provider.as_ref();
        let spec = &resolved.spec;
        tracing::Span::current().record("provider", provider.name());

        let streaming = request.stream && spec.capabilities.streaming;
        if request.stream && !streaming {
            warn!(
                "Model '{}' does not support streaming, using a buffered call",
                resolved.name
            );
        }

        let mut payload = match provider.format_payload(request, spec, streaming) {
            Ok(payload) => payload,
            Err(e) => return emitter.fail(e.describe(provider.name())).await,
        };

        info!(
            "📡 {} → {} ({}, {})",
            resolved.name,
            provider.name(),
            spec.upstream_model,
            if streaming { "stream" } else { "buffered" }
        );

        loop {
            let retry_possible = !*retried && payload.has_continuation();
            let attempt = if streaming {
                self.stream_attempt(provider, spec, &payload, retry_possible, emitter)
                    .await?
            } else {
                self.buffered_attempt(provider, spec, &payload, retry_possible, emitter)
                    .await?
            };

            match attempt {
                Attempt::Finished(outcome) => return Ok(outcome),
                Attempt::StaleContinuation => {
                    warn!(
                        "🔄 {} rejected the continuation reference, retrying without it",
                        provider.name()
                    );
                    *retried = true;
                    payload = payload.without_continuation();
                }
            }
        }
    }

    async fn buffered_attempt(
        &self,
        provider: &dyn ChatProvider,
        spec: &ModelSpec,
        payload: &ProviderPayload,
        retry_possible: bool,
        emitter: &mut Emitter<'_>,
    ) -> Result<Attempt, ClientGone> {
        let name = provider.name();
        let http = match provider.build_request(spec, payload, false) {
            Ok(http) => http,
            Err(e) => return emitter.fail(e.describe(name)).await.map(Attempt::Finished),
        };

        let response = tokio::select! {
            biased;
            _ = emitter.tx.closed() => return Err(ClientGone),
            response = self.transport.execute(&http) => response,
        };
        let raw = match response {
            Ok(raw) => raw,
            Err(e) => return emitter.fail(e.describe(name)).await.map(Attempt::Finished),
        };

        if !raw.is_success() {
            let err = raw.into_error();
            if retry_possible && err.is_stale_continuation() {
                return Ok(Attempt::StaleContinuation);
            }
            return emitter.fail(err.describe(name)).await.map(Attempt::Finished);
        }

        let mut fragment = match provider.decode_buffered(&raw.body) {
            Ok(fragment) => fragment,
            Err(e) => return emitter.fail(e.describe(name)).await.map(Attempt::Finished),
        };

        if retry_possible
            && fragment
                .error
                .as_deref()
                .is_some_and(is_stale_continuation_message)
        {
            return Ok(Attempt::StaleContinuation);
        }

        fragment.is_done = true;
        emitter.finish(fragment).await.map(Attempt::Finished)
    }

    async fn stream_attempt(
        &self,
        provider: &dyn ChatProvider,
        spec: &ModelSpec,
        payload: &ProviderPayload,
        retry_possible: bool,
        emitter: &mut Emitter<'_>,
    ) -> Result<Attempt, ClientGone> {
        let name = provider.name();
        let http = match provider.build_request(spec, payload, true) {
            Ok(http) => http,
            Err(e) => return emitter.fail(e.describe(name)).await.map(Attempt::Finished),
        };

        let tx = emitter.tx;
        let opened = tokio::select! {
            biased;
            _ = tx.closed() => return Err(ClientGone),
            opened = self.transport.open_stream(&http) => opened,
        };
        let mut body = match opened {
            Ok(body) => body,
            Err(e) if retry_possible && e.is_stale_continuation() => {
                return Ok(Attempt::StaleContinuation);
            }
            Err(e) => return emitter.fail(e.describe(name)).await.map(Attempt::Finished),
        };

        let mut reassembler = Reassembler::new(provider.framing());
        let mut decoder = provider.stream_decoder();
        let mut state = StreamState::new(retry_possible);
        let mut transport_error = None;

        'read: loop {
            // A vanished caller must not wait on a quiet backend
            let next = tokio::select! {
                biased;
                _ = tx.closed() => return Err(ClientGone),
                next = body.next() => next,
            };
            let (frames, at_eof) = match next {
                Some(Ok(bytes)) => (reassembler.feed(&bytes), false),
                Some(Err(e)) => {
                    transport_error = Some(e);
                    break 'read;
                }
                None => (reassembler.finish(), true),
            };

            for frame in frames {
                let fragment = match decoder.decode(&frame) {
                    Ok(fragment) => fragment,
                    Err(e) => {
                        warn!("⚠️ Skipping malformed unit from {}: {}", name, e);
                        continue;
                    }
                };
                match state.accept(fragment, emitter).await? {
                    Flow::Continue => {}
                    Flow::Stop => break 'read,
                    Flow::StaleContinuation => return Ok(Attempt::StaleContinuation),
                }
            }

            if at_eof || (state.terminal.is_some() && reassembler.saw_terminal_marker()) {
                break;
            }
        }
        drop(body);

        if reassembler.cap_hits() > 0 {
            debug!("Reassembler cap hit {} times", reassembler.cap_hits());
        }

        state.flush_held(emitter).await?;
        let outcome = match (state.terminal.take(), transport_error) {
            (Some(terminal), _) => emitter.finish(terminal).await?,
            (None, Some(e)) => emitter.fail(e.describe(name)).await?,
            (None, None) => {
                emitter
                    .fail(format!(
                        "{} protocol error: stream closed without a terminal unit",
                        name
                    ))
                    .await?
            }
        };
        Ok(Attempt::Finished(outcome))
    }
}
