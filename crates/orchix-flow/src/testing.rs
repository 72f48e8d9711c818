//! Recording backend and scripted views shared by the unit tests.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use futures_util::{stream, StreamExt};

use crate::api::{Backend, ByteStream};
use crate::entitlement::SelectionDraft;
use crate::error::FlowError;
use crate::install::{DismissHandle, Dismissal};
use crate::view::{
    AbandonChoice, Dialog, FlowView, Notify, PasswordPrompt, SelectionAction, SelectionView, Toast,
};
use crate::wire::{
    AccessInfo, ActionReply, ConfigSchema, ConflictCheckResult, LicenseInfo, OperationRequest,
    ProgressEvent, SelectionCandidates, SelectionNeeded, UpdateActions,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap()
}

fn ok_reply() -> ActionReply {
    ActionReply {
        success: true,
        message: String::new(),
    }
}

#[derive(Default)]
struct BackendState {
    bodies: VecDeque<Vec<Vec<u8>>>,
    operation_error: Option<FlowError>,
    operation_latency: Duration,
    operations: Vec<OperationRequest>,
    taken_names: Vec<String>,
    taken_ports: Vec<String>,
    conflict_latency: Duration,
    conflicts_fail: bool,
    conflict_calls: Vec<(Option<String>, Option<String>)>,
    passwords: Vec<(String, String)>,
    update_actions: UpdateActions,
    license: LicenseInfo,
    activated: Vec<String>,
    selection_needed: SelectionNeeded,
    candidates: SelectionCandidates,
    selection_rejections: VecDeque<String>,
    saved: Vec<Vec<String>>,
}

/// Backend fake: operations replay scripted bodies in order, every call is
/// recorded.
#[derive(Default)]
pub struct MockBackend {
    state: Mutex<BackendState>,
}

impl MockBackend {
    /// Queues one response body, delivered as the given chunks.
    pub fn script_operation(&self, chunks: Vec<Vec<u8>>) {
        lock(&self.state).bodies.push_back(chunks);
    }

    pub fn fail_next_operation(&self, err: FlowError) {
        lock(&self.state).operation_error = Some(err);
    }

    pub fn set_operation_latency(&self, latency: Duration) {
        lock(&self.state).operation_latency = latency;
    }

    pub fn operations(&self) -> Vec<OperationRequest> {
        lock(&self.state).operations.clone()
    }

    pub fn take_name(&self, name: &str) {
        lock(&self.state).taken_names.push(name.to_string());
    }

    pub fn take_port(&self, port: &str) {
        lock(&self.state).taken_ports.push(port.to_string());
    }

    pub fn set_conflict_latency(&self, latency: Duration) {
        lock(&self.state).conflict_latency = latency;
    }

    pub fn fail_conflict_checks(&self, fail: bool) {
        lock(&self.state).conflicts_fail = fail;
    }

    pub fn conflict_calls(&self) -> Vec<(Option<String>, Option<String>)> {
        lock(&self.state).conflict_calls.clone()
    }

    pub fn passwords(&self) -> Vec<(String, String)> {
        lock(&self.state).passwords.clone()
    }

    pub fn set_update_actions(&self, actions: UpdateActions) {
        lock(&self.state).update_actions = actions;
    }

    pub fn set_license(&self, license: LicenseInfo) {
        lock(&self.state).license = license;
    }

    pub fn activated_keys(&self) -> Vec<String> {
        lock(&self.state).activated.clone()
    }

    pub fn set_selection(&self, needed: SelectionNeeded, candidates: SelectionCandidates) {
        let mut state = lock(&self.state);
        state.selection_needed = needed;
        state.candidates = candidates;
    }

    pub fn reject_next_selection(&self, message: &str) {
        lock(&self.state)
            .selection_rejections
            .push_back(message.to_string());
    }

    /// Every submitted selection, accepted or not.
    pub fn saved_selections(&self) -> Vec<Vec<String>> {
        lock(&self.state).saved.clone()
    }
}

impl Backend for MockBackend {
    async fn open_operation(&self, request: &OperationRequest) -> Result<ByteStream, FlowError> {
        let (latency, body) = {
            let mut state = lock(&self.state);
            state.operations.push(request.clone());
            let body = match state.operation_error.take() {
                Some(err) => Err(err),
                None => Ok(state.bodies.pop_front().unwrap_or_default()),
            };
            (state.operation_latency, body)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let chunks = body?;
        Ok(stream::iter(chunks.into_iter().map(Ok)).boxed())
    }

    async fn check_conflicts(
        &self,
        name: Option<&str>,
        port: Option<&str>,
    ) -> Result<ConflictCheckResult, FlowError> {
        let (latency, result) = {
            let mut state = lock(&self.state);
            state
                .conflict_calls
                .push((name.map(str::to_string), port.map(str::to_string)));
            let result = if state.conflicts_fail {
                Err(FlowError::Transport("conflict check unavailable".into()))
            } else {
                Ok(ConflictCheckResult {
                    name_conflict: name
                        .map(|name| state.taken_names.iter().any(|taken| taken == name))
                        .unwrap_or(false),
                    port_conflict: port
                        .map(|port| state.taken_ports.iter().any(|taken| taken == port))
                        .unwrap_or(false),
                })
            };
            (state.conflict_latency, result)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        result
    }

    async fn set_password(
        &self,
        container_name: &str,
        password: &str,
    ) -> Result<ActionReply, FlowError> {
        lock(&self.state)
            .passwords
            .push((container_name.to_string(), password.to_string()));
        Ok(ok_reply())
    }

    async fn config_schema(&self, _app_name: &str) -> Result<ConfigSchema, FlowError> {
        Ok(ConfigSchema::default())
    }

    async fn update_actions(&self, _container_name: &str) -> Result<UpdateActions, FlowError> {
        Ok(lock(&self.state).update_actions.clone())
    }

    async fn license(&self) -> Result<LicenseInfo, FlowError> {
        Ok(lock(&self.state).license.clone())
    }

    async fn activate_license(&self, license_key: &str) -> Result<ActionReply, FlowError> {
        lock(&self.state).activated.push(license_key.to_string());
        Ok(ok_reply())
    }

    async fn deactivate_license(&self) -> Result<ActionReply, FlowError> {
        Ok(ok_reply())
    }

    async fn selection_needed(&self) -> Result<SelectionNeeded, FlowError> {
        Ok(lock(&self.state).selection_needed.clone())
    }

    async fn selection_candidates(&self) -> Result<SelectionCandidates, FlowError> {
        Ok(lock(&self.state).candidates.clone())
    }

    async fn save_selection(&self, selected: &[String]) -> Result<ActionReply, FlowError> {
        let mut state = lock(&self.state);
        state.saved.push(selected.to_vec());
        Ok(match state.selection_rejections.pop_front() {
            Some(message) => ActionReply {
                success: false,
                message,
            },
            None => ok_reply(),
        })
    }
}

/// Flow view answering dialogs from queues. Access dialogs are acknowledged
/// when nothing is queued; other unscripted dialogs panic.
#[derive(Default)]
pub struct ScriptedFlowView {
    toasts: Mutex<Vec<Toast>>,
    progress: Mutex<Vec<(String, ProgressEvent)>>,
    passwords: Mutex<VecDeque<Dialog<String>>>,
    password_errors: Mutex<Vec<Option<String>>>,
    access: Mutex<VecDeque<Dialog<()>>>,
    access_shown: Mutex<Vec<AccessInfo>>,
    abandon: Mutex<VecDeque<AbandonChoice>>,
    dismiss_on_progress: Mutex<Option<DismissHandle>>,
    dismissals: Mutex<Vec<Dismissal>>,
}

impl ScriptedFlowView {
    pub fn push_password(&self, answer: Dialog<String>) {
        lock(&self.passwords).push_back(answer);
    }

    pub fn push_access(&self, answer: Dialog<()>) {
        lock(&self.access).push_back(answer);
    }

    pub fn push_abandon(&self, choice: AbandonChoice) {
        lock(&self.abandon).push_back(choice);
    }

    /// Presses "close" on the first progress update.
    pub fn dismiss_during_install(&self, handle: DismissHandle) {
        *lock(&self.dismiss_on_progress) = Some(handle);
    }

    pub fn toasts(&self) -> Vec<Toast> {
        lock(&self.toasts).clone()
    }

    pub fn progress(&self) -> Vec<(String, ProgressEvent)> {
        lock(&self.progress).clone()
    }

    pub fn password_errors(&self) -> Vec<Option<String>> {
        lock(&self.password_errors).clone()
    }

    pub fn access_shown(&self) -> Vec<AccessInfo> {
        lock(&self.access_shown).clone()
    }

    pub fn dismissals(&self) -> Vec<Dismissal> {
        lock(&self.dismissals).clone()
    }
}

impl Notify for ScriptedFlowView {
    fn notify(&self, toast: Toast) {
        lock(&self.toasts).push(toast);
    }
}

impl FlowView for ScriptedFlowView {
    fn show_progress(&self, title: &str, event: &ProgressEvent) {
        lock(&self.progress).push((title.to_string(), event.clone()));
        let handle = lock(&self.dismiss_on_progress).take();
        if let Some(handle) = handle {
            let dismissal = handle.request_dismiss();
            lock(&self.dismissals).push(dismissal);
        }
    }

    async fn prompt_password(&self, prompt: PasswordPrompt<'_>) -> Dialog<String> {
        lock(&self.password_errors).push(prompt.error.map(str::to_string));
        lock(&self.passwords)
            .pop_front()
            .expect("unscripted password prompt")
    }

    async fn show_access_info(&self, _target: &str, info: &AccessInfo) -> Dialog<()> {
        lock(&self.access_shown).push(info.clone());
        lock(&self.access)
            .pop_front()
            .unwrap_or(Dialog::Submitted(()))
    }

    async fn confirm_abandon(&self, _target: &str) -> AbandonChoice {
        lock(&self.abandon)
            .pop_front()
            .expect("unscripted abandon confirmation")
    }
}

/// Selection view replaying a fixed list of user actions.
pub struct ScriptedSelectionView {
    actions: Mutex<VecDeque<SelectionAction>>,
    errors: Mutex<Vec<Option<String>>>,
    toasts: Mutex<Vec<Toast>>,
    rerenders: Mutex<usize>,
}

impl ScriptedSelectionView {
    pub fn new(actions: Vec<SelectionAction>) -> Self {
        Self {
            actions: Mutex::new(actions.into()),
            errors: Mutex::new(Vec::new()),
            toasts: Mutex::new(Vec::new()),
            rerenders: Mutex::new(0),
        }
    }

    /// Inline error shown with each presentation, in order.
    pub fn errors(&self) -> Vec<Option<String>> {
        lock(&self.errors).clone()
    }

    pub fn toasts(&self) -> Vec<Toast> {
        lock(&self.toasts).clone()
    }

    pub fn rerenders(&self) -> usize {
        *lock(&self.rerenders)
    }
}

impl Notify for ScriptedSelectionView {
    fn notify(&self, toast: Toast) {
        lock(&self.toasts).push(toast);
    }
}

impl SelectionView for ScriptedSelectionView {
    async fn present(&self, _draft: &SelectionDraft, error: Option<&str>) -> SelectionAction {
        lock(&self.errors).push(error.map(str::to_string));
        lock(&self.actions)
            .pop_front()
            .expect("selection dialog presented after script ended")
    }

    fn rerender(&self) {
        *lock(&self.rerenders) += 1;
    }
}
