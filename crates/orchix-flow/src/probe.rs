//! Debounced name/port conflict checking for the install dialog.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::api::Backend;
use crate::wire::ConflictCheckResult;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct ProbeInput {
    name: String,
    port: String,
}

/// Latest conflict verdict together with the input it was computed for.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConflictState {
    pub name: String,
    pub port: String,
    pub result: ConflictCheckResult,
    /// False until the first check completes.
    pub checked: bool,
}

impl ConflictState {
    pub fn name_warning(&self) -> Option<String> {
        self.result
            .name_conflict
            .then(|| format!("Container \"{}\" already exists", self.name))
    }

    pub fn port_warning(&self) -> Option<String> {
        self.result
            .port_conflict
            .then(|| format!("Port {} is already in use", self.port))
    }

    pub fn warnings(&self) -> Vec<String> {
        self.name_warning()
            .into_iter()
            .chain(self.port_warning())
            .collect()
    }

    pub fn confirm_enabled(&self) -> bool {
        !self.result.any()
    }
}

/// Owns one debounce worker. Every [`ConflictProbe::check`] restarts the
/// quiet window; when it elapses a single request goes out for the latest
/// input. Dropping the probe stops the worker.
pub struct ConflictProbe {
    input: watch::Sender<ProbeInput>,
    state: watch::Receiver<ConflictState>,
    worker: JoinHandle<()>,
}

impl ConflictProbe {
    pub fn spawn<B: Backend>(backend: Arc<B>, window: Duration) -> Self {
        let (input_tx, input_rx) = watch::channel(ProbeInput::default());
        let (state_tx, state_rx) = watch::channel(ConflictState::default());
        let worker = tokio::spawn(probe_loop(backend, window, input_rx, state_tx));
        Self {
            input: input_tx,
            state: state_rx,
            worker,
        }
    }

    pub fn check(&self, name: &str, port: &str) {
        self.input.send_replace(ProbeInput {
            name: name.to_string(),
            port: port.to_string(),
        });
    }

    pub fn latest(&self) -> ConflictState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConflictState> {
        self.state.clone()
    }
}

impl Drop for ConflictProbe {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn probe_loop<B: Backend>(
    backend: Arc<B>,
    window: Duration,
    mut input: watch::Receiver<ProbeInput>,
    state: watch::Sender<ConflictState>,
) {
    // Set from the most recent keystroke; `None` while idle.
    let mut deadline: Option<Instant> = None;
    loop {
        if deadline.is_none() {
            if input.changed().await.is_err() {
                return;
            }
            deadline = Some(Instant::now() + window);
        }
        while let Some(at) = deadline {
            tokio::select! {
                _ = tokio::time::sleep_until(at) => break,
                changed = input.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    deadline = Some(Instant::now() + window);
                }
            }
        }
        deadline = None;

        let query = input.borrow_and_update().clone();
        let name = non_blank(&query.name);
        let port = non_blank(&query.port);
        if name.is_none() && port.is_none() {
            continue;
        }

        let request = backend.check_conflicts(name, port);
        tokio::pin!(request);
        let result = loop {
            tokio::select! {
                result = &mut request => break result,
                changed = input.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    deadline = Some(Instant::now() + window);
                }
            }
        };
        if deadline.is_some() {
            debug!("discarding conflict result for superseded input");
            continue;
        }

        match result {
            Ok(result) => {
                state.send_replace(ConflictState {
                    name: query.name.trim().to_string(),
                    port: query.port.trim().to_string(),
                    result,
                    checked: true,
                });
            }
            Err(err) => warn!("conflict check failed: {err}"),
        }
    }
}

fn non_blank(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}
