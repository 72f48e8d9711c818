//! License-tier limits and the selection dialog that enforces them.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::Backend;
use crate::error::FlowError;
use crate::view::{SelectionAction, SelectionView, Toast};
use crate::wire::{ActionReply, LicenseInfo, ManagedResource};

pub const SELECT_AT_LEAST_ONE: &str = "Select at least one container";
const LICENSE_KEY_REQUIRED: &str = "Please enter a license key";
const NOTHING_TO_SELECT: &str = "No containers are available to keep under the current limit";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Tier {
    #[default]
    Free,
    Pro,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EntitlementState {
    pub tier: Tier,
    pub resource_limit: u32,
    pub current_count: u32,
}

impl EntitlementState {
    pub fn from_license(info: &LicenseInfo) -> Self {
        let resource_limit = if info.container_status.limit > 0 {
            info.container_status.limit
        } else {
            info.features.max_containers
        };
        Self {
            tier: if info.is_pro { Tier::Pro } else { Tier::Free },
            resource_limit,
            current_count: info.container_status.current,
        }
    }

    pub fn requires_selection(&self) -> bool {
        self.tier == Tier::Free && self.current_count > self.resource_limit
    }
}

/// Checked set of the selection dialog.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectionDraft {
    candidates: Vec<ManagedResource>,
    selected: BTreeSet<String>,
    limit: u32,
}

impl SelectionDraft {
    pub fn new(candidates: Vec<ManagedResource>, limit: u32) -> Self {
        Self {
            candidates,
            selected: BTreeSet::new(),
            limit,
        }
    }

    pub fn candidates(&self) -> &[ManagedResource] {
        &self.candidates
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn is_selected(&self, name: &str) -> bool {
        self.selected.contains(name)
    }

    /// Unchecked boxes are disabled once the limit is reached.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.is_selected(name) || self.count() < self.limit as usize
    }

    pub fn count(&self) -> usize {
        self.selected.len()
    }

    pub fn counter_label(&self) -> String {
        format!("{} / {} selected", self.count(), self.limit)
    }

    /// Returns false when the toggle was refused.
    pub fn toggle(&mut self, name: &str) -> bool {
        if self.selected.remove(name) {
            return true;
        }
        if !self.is_candidate(name) || !self.is_enabled(name) {
            return false;
        }
        self.selected.insert(name.to_string())
    }

    /// Replaces the checked set wholesale. Unknown names are dropped; the
    /// limit is checked on submit.
    pub fn replace(&mut self, names: Vec<String>) {
        self.selected = names
            .into_iter()
            .filter(|name| self.is_candidate(name))
            .collect();
    }

    /// Selected names in candidate order, or the inline error to show.
    pub fn validate(&self) -> Result<Vec<String>, FlowError> {
        if self.selected.is_empty() {
            return Err(FlowError::validation(SELECT_AT_LEAST_ONE));
        }
        if self.count() > self.limit as usize {
            return Err(FlowError::validation(format!(
                "Maximum {} containers allowed",
                self.limit
            )));
        }
        Ok(self
            .candidates
            .iter()
            .filter(|candidate| self.selected.contains(&candidate.name))
            .map(|candidate| candidate.name.clone())
            .collect())
    }

    fn is_candidate(&self, name: &str) -> bool {
        self.candidates.iter().any(|candidate| candidate.name == name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnforceOutcome {
    WithinLimit,
    Selected(Vec<String>),
}

pub struct EntitlementEnforcer<B, V> {
    backend: Arc<B>,
    view: Arc<V>,
    state: watch::Sender<EntitlementState>,
}

impl<B: Backend, V: SelectionView> EntitlementEnforcer<B, V> {
    pub fn new(backend: Arc<B>, view: Arc<V>) -> Self {
        let (state, _) = watch::channel(EntitlementState::default());
        Self {
            backend,
            view,
            state,
        }
    }

    pub fn state(&self) -> EntitlementState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<EntitlementState> {
        self.state.subscribe()
    }

    /// Replaces the entitlement state with the backend's current view.
    pub async fn refresh(&self) -> Result<LicenseInfo, FlowError> {
        let info = self.backend.license().await?;
        let state = EntitlementState::from_license(&info);
        debug!(
            "entitlement: {:?} {}/{}",
            state.tier, state.current_count, state.resource_limit
        );
        self.state.send_replace(state);
        Ok(info)
    }

    /// Shows the selection dialog when the free tier is over its limit.
    /// The dialog only closes after a valid selection is saved.
    pub async fn enforce(&self) -> Result<EnforceOutcome, FlowError> {
        self.refresh().await?;
        let state = self.state();
        if !state.requires_selection() {
            return Ok(EnforceOutcome::WithinLimit);
        }
        let needed = self.backend.selection_needed().await?;
        if !needed.needed {
            debug!("backend reports no selection needed");
            return Ok(EnforceOutcome::WithinLimit);
        }
        let candidates = self.backend.selection_candidates().await?;
        let limit = [candidates.limit, needed.limit, state.resource_limit]
            .into_iter()
            .find(|limit| *limit > 0)
            .unwrap_or_default();
        if limit == 0 || candidates.containers.is_empty() {
            warn!(
                "selection required but limit is {limit} with {} candidates",
                candidates.containers.len()
            );
            return Err(FlowError::validation(NOTHING_TO_SELECT));
        }
        info!(
            "{} containers exceed the limit of {limit}; selection required",
            state.current_count
        );
        orchix_telemetry::event("entitlement.selection_required", &[]);
        self.select(SelectionDraft::new(candidates.containers, limit))
            .await
    }

    async fn select(&self, mut draft: SelectionDraft) -> Result<EnforceOutcome, FlowError> {
        let mut error: Option<String> = None;
        loop {
            let action = self.view.present(&draft, error.as_deref()).await;
            match action {
                SelectionAction::Toggle(name) => {
                    if !draft.toggle(&name) {
                        debug!("selection of {name} refused at limit {}", draft.limit());
                    }
                    error = None;
                }
                SelectionAction::Replace(names) => {
                    draft.replace(names);
                    error = None;
                }
                SelectionAction::Dismiss => {
                    info!("selection dialog cannot be dismissed while over the limit");
                }
                SelectionAction::Submit => {
                    let selected = match draft.validate() {
                        Ok(selected) => selected,
                        Err(err) => {
                            error = Some(err.to_string());
                            continue;
                        }
                    };
                    match self.backend.save_selection(&selected).await {
                        Ok(reply) if reply.success => {
                            self.view
                                .notify(Toast::success(reply.message_or("Container selection saved")));
                            if let Err(err) = self.refresh().await {
                                warn!("failed to refresh license after selection: {err}");
                            }
                            self.view.rerender();
                            return Ok(EnforceOutcome::Selected(selected));
                        }
                        Ok(reply) => {
                            error = Some(reply.message_or("Failed to save selection").to_string());
                        }
                        Err(err) => {
                            warn!("saving container selection failed: {err}");
                            error = Some(err.to_string());
                        }
                    }
                }
            }
        }
    }

    pub async fn activate_license(&self, license_key: &str) -> Result<ActionReply, FlowError> {
        let key = license_key.trim();
        if key.is_empty() {
            self.view.notify(Toast::error(LICENSE_KEY_REQUIRED));
            return Err(FlowError::validation(LICENSE_KEY_REQUIRED));
        }
        let reply = self.backend.activate_license(key).await?;
        if reply.success {
            self.view.notify(Toast::success("PRO license activated!"));
            self.refresh().await?;
        } else {
            self.view
                .notify(Toast::error(reply.message_or("Activation failed")));
        }
        Ok(reply)
    }

    /// Deactivates and re-runs enforcement, since the downgrade may put the
    /// installation over the free limit.
    pub async fn deactivate_license(&self) -> Result<ActionReply, FlowError> {
        let reply = self.backend.deactivate_license().await?;
        if reply.success {
            self.view.notify(Toast::success("License deactivated"));
            self.enforce().await?;
        } else {
            self.view
                .notify(Toast::error(reply.message_or("Deactivation failed")));
        }
        Ok(reply)
    }
}
