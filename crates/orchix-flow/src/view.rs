//! What a frontend must provide to host the workflow layer.
//!
//! The controllers never query a view for state; they push progress, toasts
//! and dialogs to it and await the user's answer.

use std::future::Future;

use crate::entitlement::SelectionDraft;
use crate::wire::{AccessInfo, ProgressEvent};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToastLevel {
    Success,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Toast {
    pub level: ToastLevel,
    pub message: String,
}

impl Toast {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            level: ToastLevel::Success,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: ToastLevel::Error,
            message: message.into(),
        }
    }
}

/// Outcome of a modal dialog: the user either submitted it or tried to close it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Dialog<T> {
    Submitted(T),
    Dismissed,
}

/// Answer to "<target> has already been installed".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbandonChoice {
    Back,
    RemoveAndCancel,
}

#[derive(Clone, Copy, Debug)]
pub struct PasswordPrompt<'a> {
    pub target: &'a str,
    pub prompt: &'a str,
    /// Inline error from the previous attempt.
    pub error: Option<&'a str>,
}

pub trait Notify: Send + Sync + 'static {
    fn notify(&self, toast: Toast);
}

pub trait FlowView: Notify {
    fn show_progress(&self, title: &str, event: &ProgressEvent);

    fn prompt_password(
        &self,
        prompt: PasswordPrompt<'_>,
    ) -> impl Future<Output = Dialog<String>> + Send;

    fn show_access_info(
        &self,
        target: &str,
        info: &AccessInfo,
    ) -> impl Future<Output = Dialog<()>> + Send;

    fn confirm_abandon(&self, target: &str) -> impl Future<Output = AbandonChoice> + Send;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SelectionAction {
    Toggle(String),
    /// Replaces the whole checked set, e.g. restoring a saved form.
    Replace(Vec<String>),
    Submit,
    Dismiss,
}

pub trait SelectionView: Notify {
    fn present(
        &self,
        draft: &SelectionDraft,
        error: Option<&str>,
    ) -> impl Future<Output = SelectionAction> + Send;

    /// Redraw whatever screen triggered enforcement.
    fn rerender(&self);
}
