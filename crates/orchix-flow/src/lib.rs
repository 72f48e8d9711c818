//! Asynchronous operation workflow layer of the ORCHIX control client.

pub mod actions;
pub mod api;
pub mod config;
pub mod entitlement;
pub mod error;
pub mod form;
pub mod install;
pub mod probe;
pub mod runner;
pub mod stream;
pub mod view;
pub mod wire;

#[cfg(test)]
mod testing;

pub use actions::ContainerActions;
pub use api::{Backend, HttpBackend};
pub use config::ClientConfig;
pub use entitlement::{EnforceOutcome, EntitlementEnforcer, EntitlementState, SelectionDraft, Tier};
pub use error::{ErrorClass, FlowError};
pub use form::InstallForm;
pub use install::{DismissHandle, Dismissal, InstallFlowController, InstallOutcome, InstallPhase};
pub use probe::{ConflictProbe, ConflictState};
pub use runner::{OperationRunner, ProgressSink};
pub use stream::EventStreamReader;
