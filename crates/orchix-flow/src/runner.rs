use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::api::Backend;
use crate::stream::EventStreamReader;
use crate::wire::{
    ErrorOrigin, OperationFailure, OperationRequest, ProgressEvent, StreamEvent, TerminalEvent,
};

/// Receives progress synchronously, in stream order.
pub trait ProgressSink: Send {
    fn progress(&mut self, event: &ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: FnMut(&ProgressEvent) + Send,
{
    fn progress(&mut self, event: &ProgressEvent) {
        self(event)
    }
}

/// Drives one backend operation from request to terminal event.
pub struct OperationRunner<B> {
    backend: Arc<B>,
}

impl<B> Clone for OperationRunner<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: Backend> OperationRunner<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Issues exactly one request and returns its terminal event. Transport
    /// problems are folded into an `Error` terminal; this never fails.
    pub async fn run<S>(&self, request: &OperationRequest, sink: &mut S) -> TerminalEvent
    where
        S: ProgressSink + ?Sized,
    {
        let kind = request.kind();
        let target = request.target_id();
        info!("{kind} started for {target}");
        orchix_telemetry::event(
            "operation.start",
            &[("kind", kind.as_str()), ("target", target)],
        );

        let terminal = match self.backend.open_operation(request).await {
            Ok(body) => {
                let mut reader = EventStreamReader::new(body);
                let mut terminal = None;
                while let Some(event) = reader.next_event().await {
                    match event {
                        StreamEvent::Progress(progress) => {
                            debug!("{kind} {target}: {}% {}", progress.percent, progress.status_text);
                            sink.progress(&progress);
                        }
                        StreamEvent::Terminal(event) => {
                            terminal = Some(event);
                            break;
                        }
                    }
                }
                // The reader always ends with a terminal event.
                terminal.unwrap_or_else(|| {
                    TerminalEvent::Error(OperationFailure::transport(
                        crate::stream::STREAM_TRUNCATED,
                    ))
                })
            }
            Err(err) => {
                warn!("{kind} request for {target} failed: {err}");
                TerminalEvent::Error(OperationFailure::transport(err.to_string()))
            }
        };

        let terminal = match terminal {
            TerminalEvent::Error(failure) if failure.origin == ErrorOrigin::Transport => {
                TerminalEvent::Error(OperationFailure::transport(format!(
                    "{} failed: {}",
                    kind.noun(),
                    failure.message
                )))
            }
            other => other,
        };

        let outcome = match &terminal {
            TerminalEvent::Success(_) => "success",
            TerminalEvent::Error(failure) => match failure.origin {
                ErrorOrigin::Operation => "error",
                ErrorOrigin::Transport => "transport_error",
            },
        };
        match &terminal {
            TerminalEvent::Success(_) => info!("{kind} finished for {target}"),
            TerminalEvent::Error(failure) => warn!("{kind} failed for {target}: {}", failure.message),
        }
        orchix_telemetry::event(
            "operation.finish",
            &[("kind", kind.as_str()), ("target", target), ("outcome", outcome)],
        );
        terminal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBackend;
    use crate::wire::UpdateType;

    const SCENARIO_A: &str = "{\"progress\":10,\"status\":\"pulling\"}\n\
        {\"progress\":100,\"status\":\"done\"}\n\
        {\"success\":true,\"access_info\":{\"type\":\"web\",\"url\":\"http://x\"}}\n";

    #[tokio::test]
    async fn forwards_progress_in_order_then_returns_terminal() {
        let backend = Arc::new(MockBackend::default());
        backend.script_operation(vec![SCENARIO_A.as_bytes().to_vec()]);
        let runner = OperationRunner::new(Arc::clone(&backend));

        let mut seen = Vec::new();
        let mut sink = |event: &ProgressEvent| seen.push(event.percent);
        let request = OperationRequest::install("n8n", "n8n", &Default::default());
        let terminal = runner.run(&request, &mut sink).await;

        assert_eq!(seen, vec![10, 100]);
        match terminal {
            TerminalEvent::Success(payload) => {
                assert_eq!(
                    payload.access_info().and_then(|info| info.url),
                    Some("http://x".to_string())
                );
            }
            other => panic!("unexpected terminal {other:?}"),
        }
        assert_eq!(backend.operations(), vec![request]);
    }

    #[tokio::test]
    async fn transport_failures_name_the_operation() {
        let backend = Arc::new(MockBackend::default());
        backend.script_operation(vec![b"{\"progress\":5}\n".to_vec()]);
        let runner = OperationRunner::new(Arc::clone(&backend));

        let request = OperationRequest::install("n8n", "n8n", &Default::default());
        let terminal = runner.run(&request, &mut |_: &ProgressEvent| {}).await;
        assert_eq!(
            terminal,
            TerminalEvent::Error(OperationFailure::transport(
                "Installation failed: stream ended before a result was reported"
            ))
        );
    }

    #[tokio::test]
    async fn unreachable_backend_becomes_error_terminal() {
        let backend = Arc::new(MockBackend::default());
        backend.fail_next_operation(crate::FlowError::Unauthorized);
        let runner = OperationRunner::new(Arc::clone(&backend));

        let request = OperationRequest::update("redis", UpdateType::VersionUpdate);
        let terminal = runner.run(&request, &mut |_: &ProgressEvent| {}).await;
        assert_eq!(
            terminal,
            TerminalEvent::Error(OperationFailure::transport(
                "Update failed: session expired; sign in again"
            ))
        );
    }

    #[tokio::test]
    async fn backend_errors_keep_their_message() {
        let backend = Arc::new(MockBackend::default());
        backend.script_operation(vec![b"data: {\"error\":\"image not found\"}\n".to_vec()]);
        let runner = OperationRunner::new(Arc::clone(&backend));

        let request = OperationRequest::uninstall("redis");
        let terminal = runner.run(&request, &mut |_: &ProgressEvent| {}).await;
        assert_eq!(
            terminal,
            TerminalEvent::Error(OperationFailure::operation("image not found"))
        );
    }
}
