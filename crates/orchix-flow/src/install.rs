//! Install dialog state machine with compensating rollback.
//!
//! One [`InstallSession`] may exist at a time. It is created when the install
//! dialog opens and destroyed when the flow returns to [`InstallPhase::Idle`].
//! The controller drives the session; a [`DismissHandle`] lets the frontend
//! ask to close whatever is on screen without racing the controller.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::Backend;
use crate::error::FlowError;
use crate::form::InstallForm;
use crate::probe::{ConflictProbe, ConflictState};
use crate::runner::OperationRunner;
use crate::view::{AbandonChoice, Dialog, FlowView, PasswordPrompt, Toast};
use crate::wire::{
    AccessInfo, OperationFailure, OperationKind, OperationRequest, PostInstallAction,
    ProgressEvent, SuccessPayload, TerminalEvent,
};

pub const PASSWORD_REQUIRED: &str = "Password is required!";
const PASSWORD_SET: &str = "Password set successfully";
const PASSWORD_FAILED: &str = "Failed to set password";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PostInstallStep {
    SetPassword,
    ShowAccess,
    Done,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InstallPhase {
    #[default]
    Idle,
    AwaitingConflictCheck,
    Installing,
    PostInstall(PostInstallStep),
    CancelRequested,
    RollingBack,
}

impl InstallPhase {
    pub fn can_transition_to(self, next: InstallPhase) -> bool {
        use InstallPhase::*;
        matches!(
            (self, next),
            (Idle, AwaitingConflictCheck)
                | (AwaitingConflictCheck, Idle)
                | (AwaitingConflictCheck, Installing)
                | (Installing, PostInstall(_))
                | (Installing, CancelRequested)
                | (Installing, Idle)
                | (CancelRequested, PostInstall(_))
                | (CancelRequested, RollingBack)
                | (CancelRequested, Idle)
                | (PostInstall(_), PostInstall(_))
                | (PostInstall(_), RollingBack)
                | (PostInstall(_), Idle)
                | (RollingBack, Idle)
        )
    }
}

impl fmt::Display for InstallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallPhase::Idle => f.write_str("idle"),
            InstallPhase::AwaitingConflictCheck => f.write_str("awaiting-conflict-check"),
            InstallPhase::Installing => f.write_str("installing"),
            InstallPhase::PostInstall(step) => write!(f, "post-install({step:?})"),
            InstallPhase::CancelRequested => f.write_str("cancel-requested"),
            InstallPhase::RollingBack => f.write_str("rolling-back"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstallSession {
    pub session_id: Uuid,
    pub target_id: String,
    pub phase: InstallPhase,
    /// Set when the user asked to leave while the install was running.
    pub rollback_pending: bool,
    /// Post-install dialog to redraw if the user backs out of cancelling.
    pub restore_view: Option<PostInstallStep>,
}

impl InstallSession {
    fn new(target_id: &str) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            target_id: target_id.to_string(),
            phase: InstallPhase::AwaitingConflictCheck,
            rollback_pending: false,
            restore_view: None,
        }
    }
}

/// What the frontend should do after [`DismissHandle::request_dismiss`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Dismissal {
    /// Nothing in flight; the dialog is closed.
    Close,
    /// The install keeps running; the user is asked about it once it ends.
    Deferred { target: String },
    /// A post-install or rollback step owns the screen; ignore the request.
    Intercepted,
}

#[derive(Clone, Debug, PartialEq)]
pub enum InstallOutcome {
    Completed { target: String },
    Failed(OperationFailure),
    RolledBack { target: String },
    RollbackFailed { target: String, failure: OperationFailure },
}

struct Shared {
    slot: Mutex<Option<InstallSession>>,
    probe: Mutex<Option<ConflictProbe>>,
    phase: watch::Sender<InstallPhase>,
}

impl Shared {
    fn slot(&self) -> MutexGuard<'_, Option<InstallSession>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn probe(&self) -> MutexGuard<'_, Option<ConflictProbe>> {
        self.probe.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, next: InstallPhase) -> Result<(), FlowError> {
        let mut slot = self.slot();
        let current = slot
            .as_ref()
            .map(|session| session.phase)
            .unwrap_or_default();
        if !current.can_transition_to(next) {
            return Err(FlowError::InvalidTransition {
                from: current.to_string(),
                to: next.to_string(),
            });
        }
        match slot.as_mut() {
            Some(session) if next != InstallPhase::Idle => session.phase = next,
            _ => *slot = None,
        }
        drop(slot);
        debug!("install flow {current} -> {next}");
        self.phase.send_replace(next);
        Ok(())
    }

    /// Unconditional return to idle after a failure.
    fn reset(&self) {
        self.slot().take();
        self.probe().take();
        self.phase.send_replace(InstallPhase::Idle);
    }

    fn close_preflight(&self) -> bool {
        let mut slot = self.slot();
        match slot.as_ref().map(|session| session.phase) {
            Some(InstallPhase::AwaitingConflictCheck) => {
                slot.take();
                drop(slot);
                self.probe().take();
                self.phase.send_replace(InstallPhase::Idle);
                debug!("install dialog closed before confirm");
                true
            }
            _ => false,
        }
    }
}

/// Cloneable handle for the frontend's close/escape action.
#[derive(Clone)]
pub struct DismissHandle {
    shared: Arc<Shared>,
}

impl DismissHandle {
    pub fn request_dismiss(&self) -> Dismissal {
        if self.shared.close_preflight() {
            return Dismissal::Close;
        }
        let mut slot = self.shared.slot();
        let Some(session) = slot.as_mut() else {
            return Dismissal::Close;
        };
        match session.phase {
            InstallPhase::Installing => {
                session.rollback_pending = true;
                session.phase = InstallPhase::CancelRequested;
                let target = session.target_id.clone();
                drop(slot);
                info!("cancel requested while installing {target}; waiting for result");
                self.shared.phase.send_replace(InstallPhase::CancelRequested);
                Dismissal::Deferred { target }
            }
            InstallPhase::Idle | InstallPhase::AwaitingConflictCheck => Dismissal::Close,
            InstallPhase::CancelRequested
            | InstallPhase::PostInstall(_)
            | InstallPhase::RollingBack => Dismissal::Intercepted,
        }
    }
}

enum StepResult {
    Next,
    Abandon,
}

pub struct InstallFlowController<B, V> {
    backend: Arc<B>,
    runner: OperationRunner<B>,
    view: Arc<V>,
    shared: Arc<Shared>,
    probe_window: Duration,
}

impl<B: Backend, V: FlowView> InstallFlowController<B, V> {
    pub fn new(backend: Arc<B>, view: Arc<V>, probe_window: Duration) -> Self {
        let (phase, _) = watch::channel(InstallPhase::Idle);
        Self {
            runner: OperationRunner::new(Arc::clone(&backend)),
            backend,
            view,
            shared: Arc::new(Shared {
                slot: Mutex::new(None),
                probe: Mutex::new(None),
                phase,
            }),
            probe_window,
        }
    }

    pub fn phase(&self) -> InstallPhase {
        *self.shared.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<InstallPhase> {
        self.shared.phase.subscribe()
    }

    pub fn session(&self) -> Option<InstallSession> {
        self.shared.slot().clone()
    }

    pub fn dismiss_handle(&self) -> DismissHandle {
        DismissHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Opens the install dialog for `form` and starts conflict probing with
    /// its initial name and port. Must run inside a tokio runtime.
    pub fn open_dialog(&self, form: &InstallForm) -> Result<Uuid, FlowError> {
        let session = InstallSession::new(form.instance_name());
        let session_id = session.session_id;
        {
            let mut slot = self.shared.slot();
            if let Some(existing) = slot.as_ref() {
                return Err(FlowError::SessionActive(existing.target_id.clone()));
            }
            *slot = Some(session);
        }
        let probe = ConflictProbe::spawn(Arc::clone(&self.backend), self.probe_window);
        probe.check(form.instance_name(), form.port());
        *self.shared.probe() = Some(probe);
        self.shared
            .phase
            .send_replace(InstallPhase::AwaitingConflictCheck);
        debug!("install dialog opened for {} ({session_id})", form.app_name());
        Ok(session_id)
    }

    pub fn edit(&self, name: &str, port: &str) -> Result<(), FlowError> {
        match self.shared.probe().as_ref() {
            Some(probe) => {
                probe.check(name, port);
                Ok(())
            }
            None => Err(FlowError::validation("no install dialog is open")),
        }
    }

    pub fn conflicts(&self) -> ConflictState {
        self.shared
            .probe()
            .as_ref()
            .map(ConflictProbe::latest)
            .unwrap_or_default()
    }

    pub fn subscribe_conflicts(&self) -> Option<watch::Receiver<ConflictState>> {
        self.shared.probe().as_ref().map(ConflictProbe::subscribe)
    }

    /// Cancels before anything was submitted. Sends nothing.
    pub fn close_dialog(&self) -> Result<(), FlowError> {
        if self.shared.close_preflight() {
            Ok(())
        } else {
            Err(FlowError::InvalidTransition {
                from: self.phase().to_string(),
                to: InstallPhase::Idle.to_string(),
            })
        }
    }

    /// Submits the install and drives it through post-install steps or
    /// rollback. Returns once the flow is idle again.
    pub async fn confirm(&self, request: OperationRequest) -> Result<InstallOutcome, FlowError> {
        if request.kind() != OperationKind::Install {
            return Err(FlowError::validation(format!(
                "expected an install request, got {}",
                request.kind()
            )));
        }
        let conflicts = self.conflicts();
        if !conflicts.confirm_enabled() {
            return Err(FlowError::Conflict(conflicts.result));
        }

        self.shared.transition(InstallPhase::Installing)?;
        self.shared.probe().take();
        if let Some(session) = self.shared.slot().as_mut() {
            session.target_id = request.target_id().to_string();
        }

        let result = self.drive(&request).await;
        if result.is_err() {
            self.shared.reset();
        }
        result
    }

    async fn drive(&self, request: &OperationRequest) -> Result<InstallOutcome, FlowError> {
        let target = request.target_id();
        let terminal = self.stream(request).await;
        match terminal {
            TerminalEvent::Error(failure) => {
                self.view.notify(Toast::error(failure.message.clone()));
                self.shared.transition(InstallPhase::Idle)?;
                Ok(InstallOutcome::Failed(failure))
            }
            TerminalEvent::Success(payload) => self.after_success(target, payload).await,
        }
    }

    async fn stream(&self, request: &OperationRequest) -> TerminalEvent {
        let title = request.kind().progress_title(request.target_id());
        let view = Arc::clone(&self.view);
        let mut sink = move |event: &ProgressEvent| view.show_progress(&title, event);
        self.runner.run(request, &mut sink).await
    }

    async fn after_success(
        &self,
        target: &str,
        payload: SuccessPayload,
    ) -> Result<InstallOutcome, FlowError> {
        let password = payload
            .post_install_action()
            .filter(PostInstallAction::requires_password);
        let access = payload.access_info();
        let first = if password.is_some() {
            PostInstallStep::SetPassword
        } else if access.is_some() {
            PostInstallStep::ShowAccess
        } else {
            PostInstallStep::Done
        };

        let cancel_pending = {
            let mut slot = self.shared.slot();
            match slot.as_mut() {
                Some(session) => {
                    session.restore_view = Some(first);
                    session.rollback_pending
                }
                None => false,
            }
        };
        if cancel_pending {
            match self.view.confirm_abandon(target).await {
                AbandonChoice::RemoveAndCancel => return self.roll_back(target).await,
                AbandonChoice::Back => {
                    if let Some(session) = self.shared.slot().as_mut() {
                        session.rollback_pending = false;
                    }
                }
            }
        }

        let mut step = first;
        loop {
            self.shared.transition(InstallPhase::PostInstall(step))?;
            if let Some(session) = self.shared.slot().as_mut() {
                session.restore_view = Some(step);
            }
            match step {
                PostInstallStep::SetPassword => {
                    let Some(action) = password.as_ref() else {
                        step = PostInstallStep::ShowAccess;
                        continue;
                    };
                    match self.set_password(target, action).await {
                        StepResult::Next if access.is_some() => step = PostInstallStep::ShowAccess,
                        StepResult::Next => step = PostInstallStep::Done,
                        StepResult::Abandon => return self.roll_back(target).await,
                    }
                }
                PostInstallStep::ShowAccess => {
                    let Some(info) = access.as_ref() else {
                        step = PostInstallStep::Done;
                        continue;
                    };
                    match self.show_access(target, info).await {
                        StepResult::Next => step = PostInstallStep::Done,
                        StepResult::Abandon => return self.roll_back(target).await,
                    }
                }
                PostInstallStep::Done => {
                    if first == PostInstallStep::Done {
                        let message = payload
                            .message()
                            .map(str::to_string)
                            .unwrap_or_else(|| format!("{target} installed successfully"));
                        self.view.notify(Toast::success(message));
                    }
                    self.shared.transition(InstallPhase::Idle)?;
                    info!("install of {target} completed");
                    return Ok(InstallOutcome::Completed {
                        target: target.to_string(),
                    });
                }
            }
        }
    }

    async fn set_password(&self, target: &str, action: &PostInstallAction) -> StepResult {
        let container = if action.container_name.trim().is_empty() {
            target
        } else {
            action.container_name.as_str()
        };
        let mut error = None;
        loop {
            let prompt = PasswordPrompt {
                target,
                prompt: &action.prompt,
                error,
            };
            match self.view.prompt_password(prompt).await {
                Dialog::Submitted(password) => {
                    let password = password.trim();
                    if password.is_empty() {
                        error = Some(PASSWORD_REQUIRED);
                        continue;
                    }
                    let toast = match self.backend.set_password(container, password).await {
                        Ok(reply) if reply.success => Toast::success(PASSWORD_SET),
                        Ok(reply) => Toast::error(reply.message_or(PASSWORD_FAILED)),
                        Err(err) => {
                            warn!("set password for {container} failed: {err}");
                            Toast::error(PASSWORD_FAILED)
                        }
                    };
                    self.view.notify(toast);
                    return StepResult::Next;
                }
                Dialog::Dismissed => match self.view.confirm_abandon(target).await {
                    AbandonChoice::Back => error = None,
                    AbandonChoice::RemoveAndCancel => return StepResult::Abandon,
                },
            }
        }
    }

    async fn show_access(&self, target: &str, info: &AccessInfo) -> StepResult {
        loop {
            match self.view.show_access_info(target, info).await {
                Dialog::Submitted(()) => return StepResult::Next,
                Dialog::Dismissed => match self.view.confirm_abandon(target).await {
                    AbandonChoice::Back => continue,
                    AbandonChoice::RemoveAndCancel => return StepResult::Abandon,
                },
            }
        }
    }

    /// Issues exactly one uninstall for `target`.
    async fn roll_back(&self, target: &str) -> Result<InstallOutcome, FlowError> {
        self.shared.transition(InstallPhase::RollingBack)?;
        info!("rolling back install of {target}");
        orchix_telemetry::event("install.rollback", &[("target", target)]);

        let terminal = self.stream(&OperationRequest::uninstall(target)).await;
        let outcome = match terminal {
            TerminalEvent::Success(payload) => {
                let message = payload
                    .message()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{target} removed"));
                self.view.notify(Toast::success(message));
                InstallOutcome::RolledBack {
                    target: target.to_string(),
                }
            }
            TerminalEvent::Error(failure) => {
                self.view.notify(Toast::error(failure.message.clone()));
                InstallOutcome::RollbackFailed {
                    target: target.to_string(),
                    failure,
                }
            }
        };
        self.shared.transition(InstallPhase::Idle)?;
        Ok(outcome)
    }
}
