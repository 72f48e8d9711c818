use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::api::Backend;
use crate::error::FlowError;
use crate::runner::{OperationRunner, ProgressSink};
use crate::wire::{validate_container_name, OperationRequest, TerminalEvent, UpdateAction, UpdateType};

/// Update and uninstall for existing containers. Runs one modal operation
/// at a time.
pub struct ContainerActions<B> {
    runner: OperationRunner<B>,
    running: Mutex<Option<String>>,
}

struct RunningGuard<'a> {
    slot: &'a Mutex<Option<String>>,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl<B: Backend> ContainerActions<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            runner: OperationRunner::new(backend),
            running: Mutex::new(None),
        }
    }

    /// Update actions the backend offers for `name`. Keys outside the
    /// known update types are dropped.
    pub async fn update_actions(
        &self,
        name: &str,
    ) -> Result<Vec<(UpdateType, UpdateAction)>, FlowError> {
        validate_container_name(name)?;
        let reply = self.runner.backend().update_actions(name).await?;
        Ok(reply
            .actions
            .into_iter()
            .filter_map(|action| match action.update_type() {
                Some(kind) => Some((kind, action)),
                None => {
                    debug!("ignoring unknown update action {}", action.key);
                    None
                }
            })
            .collect())
    }

    pub async fn update<S>(
        &self,
        name: &str,
        update_type: UpdateType,
        sink: &mut S,
    ) -> Result<TerminalEvent, FlowError>
    where
        S: ProgressSink + ?Sized,
    {
        validate_container_name(name)?;
        self.run(&OperationRequest::update(name, update_type), sink)
            .await
    }

    pub async fn uninstall<S>(&self, name: &str, sink: &mut S) -> Result<TerminalEvent, FlowError>
    where
        S: ProgressSink + ?Sized,
    {
        validate_container_name(name)?;
        self.run(&OperationRequest::uninstall(name), sink).await
    }

    async fn run<S>(&self, request: &OperationRequest, sink: &mut S) -> Result<TerminalEvent, FlowError>
    where
        S: ProgressSink + ?Sized,
    {
        let _guard = self.claim(request.target_id())?;
        Ok(self.runner.run(request, sink).await)
    }

    fn claim(&self, target: &str) -> Result<RunningGuard<'_>, FlowError> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = running.as_ref() {
            return Err(FlowError::Busy(current.clone()));
        }
        *running = Some(target.to_string());
        Ok(RunningGuard {
            slot: &self.running,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBackend;
    use crate::wire::{ProgressEvent, UpdateActions};
    use std::time::Duration;

    #[tokio::test]
    async fn update_posts_whitelisted_type() {
        let backend = Arc::new(MockBackend::default());
        backend.script_operation(vec![
            b"data: {\"progress\":50,\"status\":\"pulling\"}\n".to_vec(),
            b"data: {\"success\":true,\"message\":\"redis updated\"}\n".to_vec(),
        ]);
        let actions = ContainerActions::new(Arc::clone(&backend));

        let mut seen = Vec::new();
        let terminal = actions
            .update("redis", UpdateType::ConfigUpdate, &mut |event: &ProgressEvent| {
                seen.push(event.status_text.clone())
            })
            .await
            .unwrap();

        assert!(terminal.is_success());
        assert_eq!(seen, vec!["pulling".to_string()]);
        assert_eq!(
            backend.operations(),
            vec![OperationRequest::update("redis", UpdateType::ConfigUpdate)]
        );
    }

    #[tokio::test]
    async fn invalid_names_never_reach_backend() {
        let backend = Arc::new(MockBackend::default());
        let actions = ContainerActions::new(Arc::clone(&backend));

        let err = actions
            .uninstall("../etc", &mut |_: &ProgressEvent| {})
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid container name: ../etc");
        assert!(backend.operations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn second_operation_while_running_is_busy() {
        let backend = Arc::new(MockBackend::default());
        backend.set_operation_latency(Duration::from_millis(200));
        backend.script_operation(vec![b"{\"success\":true}".to_vec()]);
        let actions = ContainerActions::new(Arc::clone(&backend));

        let mut first_sink = |_: &ProgressEvent| {};
        let mut second_sink = |_: &ProgressEvent| {};
        let (first, second) = tokio::join!(
            actions.uninstall("redis", &mut first_sink),
            actions.uninstall("postgres", &mut second_sink),
        );

        assert!(first.unwrap().is_success());
        assert!(matches!(second, Err(FlowError::Busy(name)) if name == "redis"));

        let third = actions
            .uninstall("postgres", &mut |_: &ProgressEvent| {})
            .await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn unknown_update_keys_are_dropped() {
        let backend = Arc::new(MockBackend::default());
        backend.set_update_actions(UpdateActions {
            actions: vec![
                UpdateAction {
                    key: "version_update".into(),
                    label: "Update to Latest (Stable)".into(),
                },
                UpdateAction {
                    key: "rebuild_everything".into(),
                    label: "Rebuild".into(),
                },
            ],
        });
        let actions = ContainerActions::new(Arc::clone(&backend));

        let offered = actions.update_actions("n8n").await.unwrap();
        assert_eq!(offered.len(), 1);
        assert_eq!(offered[0].0, UpdateType::VersionUpdate);
    }
}
