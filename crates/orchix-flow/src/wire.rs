//! Request and response shapes exchanged with the container backend.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::FlowError;

pub const APP_NAME_PARAM: &str = "app_name";
pub const UPDATE_TYPE_PARAM: &str = "update_type";
const CONFIG_PREFIX: &str = "config.";
const MAX_CONTAINER_NAME: usize = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Install,
    Update,
    Uninstall,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Install => "install",
            OperationKind::Update => "update",
            OperationKind::Uninstall => "uninstall",
        }
    }

    /// Noun used in user-facing failure messages ("Installation failed").
    pub fn noun(self) -> &'static str {
        match self {
            OperationKind::Install => "Installation",
            OperationKind::Update => "Update",
            OperationKind::Uninstall => "Uninstall",
        }
    }

    pub fn progress_title(self, target: &str) -> String {
        match self {
            OperationKind::Install => format!("Installing {target}"),
            OperationKind::Update => format!("Updating {target}"),
            OperationKind::Uninstall => format!("Uninstalling {target}"),
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One long-running backend action. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationRequest {
    kind: OperationKind,
    target_id: String,
    parameters: BTreeMap<String, String>,
}

impl OperationRequest {
    pub fn install(
        app_name: &str,
        instance_name: &str,
        config: &BTreeMap<String, String>,
    ) -> Self {
        let mut parameters = BTreeMap::new();
        parameters.insert(APP_NAME_PARAM.to_string(), app_name.to_string());
        for (key, value) in config {
            parameters.insert(format!("{CONFIG_PREFIX}{key}"), value.clone());
        }
        Self {
            kind: OperationKind::Install,
            target_id: instance_name.to_string(),
            parameters,
        }
    }

    pub fn update(container_name: &str, update_type: UpdateType) -> Self {
        Self {
            kind: OperationKind::Update,
            target_id: container_name.to_string(),
            parameters: BTreeMap::from([(
                UPDATE_TYPE_PARAM.to_string(),
                update_type.as_str().to_string(),
            )]),
        }
    }

    pub fn uninstall(container_name: &str) -> Self {
        Self {
            kind: OperationKind::Uninstall,
            target_id: container_name.to_string(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    pub fn config(&self) -> impl Iterator<Item = (&str, &str)> {
        self.parameters.iter().filter_map(|(key, value)| {
            key.strip_prefix(CONFIG_PREFIX)
                .map(|key| (key, value.as_str()))
        })
    }

    /// API path the request is POSTed to.
    pub fn path(&self) -> String {
        match self.kind {
            OperationKind::Install => "/api/apps/install-stream".to_string(),
            OperationKind::Update => "/api/apps/update".to_string(),
            OperationKind::Uninstall => format!("/api/containers/{}/uninstall", self.target_id),
        }
    }

    /// JSON body for [`OperationRequest::path`].
    pub fn body(&self) -> Value {
        match self.kind {
            OperationKind::Install => {
                let mut config = Map::new();
                for (key, value) in self.config() {
                    config.insert(key.to_string(), config_value(key, value));
                }
                serde_json::json!({
                    "app_name": self.parameters.get(APP_NAME_PARAM).cloned().unwrap_or_default(),
                    "instance_name": self.target_id,
                    "config": config,
                })
            }
            OperationKind::Update => serde_json::json!({
                "container_name": self.target_id,
                "update_type": self
                    .parameters
                    .get(UPDATE_TYPE_PARAM)
                    .cloned()
                    .unwrap_or_else(|| UpdateType::default().as_str().to_string()),
            }),
            OperationKind::Uninstall => Value::Object(Map::new()),
        }
    }
}

fn config_value(key: &str, value: &str) -> Value {
    if key == "port" {
        if let Ok(port) = value.trim().parse::<u16>() {
            return Value::from(port);
        }
    }
    Value::from(value)
}

/// Container names follow Docker's convention; anything else is rejected
/// before it can be spliced into an API path.
pub fn validate_container_name(name: &str) -> Result<(), FlowError> {
    let mut chars = name.chars();
    let first_ok = chars
        .next()
        .map(|c| c.is_ascii_alphanumeric())
        .unwrap_or(false);
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if first_ok && rest_ok && name.len() <= MAX_CONTAINER_NAME {
        Ok(())
    } else {
        Err(FlowError::validation(format!(
            "Invalid container name: {name}"
        )))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateType {
    #[default]
    VersionUpdate,
    ConfigUpdate,
    BetaUpdate,
    NextUpdate,
}

impl UpdateType {
    pub const ALL: [UpdateType; 4] = [
        UpdateType::VersionUpdate,
        UpdateType::ConfigUpdate,
        UpdateType::BetaUpdate,
        UpdateType::NextUpdate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            UpdateType::VersionUpdate => "version_update",
            UpdateType::ConfigUpdate => "config_update",
            UpdateType::BetaUpdate => "beta_update",
            UpdateType::NextUpdate => "next_update",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            UpdateType::VersionUpdate => "Update to Latest (Stable)",
            UpdateType::ConfigUpdate => "Configuration Update",
            UpdateType::BetaUpdate => "Update to Beta",
            UpdateType::NextUpdate => "Update to Next",
        }
    }
}

impl FromStr for UpdateType {
    type Err = FlowError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        UpdateType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == raw)
            .ok_or_else(|| FlowError::validation(format!("Unknown update type: {raw}")))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgressEvent {
    pub percent: u8,
    pub status_text: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorOrigin {
    /// The backend reported the failure in-band.
    Operation,
    /// The stream broke or never produced a result.
    Transport,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationFailure {
    pub message: String,
    pub origin: ErrorOrigin,
}

impl OperationFailure {
    pub fn operation(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            origin: ErrorOrigin::Operation,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            origin: ErrorOrigin::Transport,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TerminalEvent {
    Success(SuccessPayload),
    Error(OperationFailure),
}

impl TerminalEvent {
    pub fn is_success(&self) -> bool {
        matches!(self, TerminalEvent::Success(_))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    Progress(ProgressEvent),
    Terminal(TerminalEvent),
}

/// The full `success` object as sent by the backend, with typed views over
/// the fields the install flow branches on.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SuccessPayload {
    fields: Map<String, Value>,
}

impl SuccessPayload {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn message(&self) -> Option<&str> {
        self.fields
            .get("message")
            .and_then(Value::as_str)
            .filter(|message| !message.trim().is_empty())
    }

    pub fn access_info(&self) -> Option<AccessInfo> {
        self.typed("access_info")
    }

    pub fn post_install_action(&self) -> Option<PostInstallAction> {
        self.typed("post_install_action")
    }

    fn typed<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Option<T> {
        let value = self.fields.get(key)?;
        if value.is_null() {
            return None;
        }
        match serde_json::from_value(value.clone()) {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                tracing::debug!("ignoring malformed {key} in success payload: {err}");
                None
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessKind {
    #[serde(rename = "web")]
    Web,
    #[serde(rename = "cli")]
    Cli,
    #[default]
    #[serde(rename = "none")]
    Background,
    #[serde(other)]
    Other,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessInfo {
    #[serde(rename = "type")]
    pub kind: AccessKind,
    pub url: Option<String>,
    pub command: Option<String>,
    pub host: Option<String>,
    pub note: Option<String>,
    pub credentials: Vec<Credential>,
    pub setup_hint: Option<SetupHint>,
}

impl AccessInfo {
    /// Labelled lines describing how to reach the installed resource.
    pub fn entry_points(&self) -> Vec<(&'static str, &str)> {
        let mut lines = Vec::new();
        match self.kind {
            AccessKind::Web => {
                if let Some(url) = self.url.as_deref() {
                    lines.push(("Access URL", url));
                }
            }
            AccessKind::Cli => {
                if let Some(command) = self.command.as_deref() {
                    lines.push(("CLI Command", command));
                    if let Some(host) = self.host.as_deref() {
                        lines.push(("Host", host));
                    }
                }
            }
            AccessKind::Background => {
                if let Some(note) = self.note.as_deref() {
                    lines.push(("Note", note));
                }
            }
            AccessKind::Other => {}
        }
        lines
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Credential {
    pub label: String,
    pub value: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SetupHint {
    pub title: String,
    pub command: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostInstallAction {
    #[serde(rename = "type")]
    pub kind: String,
    pub prompt: String,
    pub container_name: String,
}

impl PostInstallAction {
    pub fn requires_password(&self) -> bool {
        self.kind == "set_password"
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictCheckResult {
    pub name_conflict: bool,
    pub port_conflict: bool,
}

impl ConflictCheckResult {
    pub fn any(&self) -> bool {
        self.name_conflict || self.port_conflict
    }
}

/// Generic `{success, message}` reply of non-streaming endpoints.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionReply {
    pub success: bool,
    pub message: String,
}

impl ActionReply {
    pub fn message_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        if self.message.trim().is_empty() {
            fallback
        } else {
            &self.message
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LicenseInfo {
    pub tier: String,
    pub tier_display: String,
    pub is_pro: bool,
    pub days_remaining: Option<i64>,
    pub features: LicenseFeatures,
    pub container_status: ContainerStatus,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LicenseFeatures {
    pub max_containers: u32,
    pub backup_restore: bool,
    pub multi_instance: bool,
    pub migration: bool,
    pub audit_log: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerStatus {
    pub current: u32,
    pub limit: u32,
    pub remaining: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionNeeded {
    pub needed: bool,
    pub limit: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagedResource {
    pub name: String,
    pub status: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionCandidates {
    pub containers: Vec<ManagedResource>,
    pub limit: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateAction {
    pub key: String,
    pub label: String,
}

impl UpdateAction {
    pub fn update_type(&self) -> Option<UpdateType> {
        self.key.parse().ok()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateActions {
    pub actions: Vec<UpdateAction>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigField {
    pub key: String,
    pub label: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub default: Value,
    pub required: bool,
    pub generate: bool,
    pub options: Vec<String>,
}

impl ConfigField {
    pub fn default_text(&self) -> String {
        match &self.default {
            Value::Null => String::new(),
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }

    pub fn is_select(&self) -> bool {
        self.kind == "select" && !self.options.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigSchema {
    pub fields: Vec<ConfigField>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_body_nests_config_and_numeric_port() {
        let config = BTreeMap::from([
            ("port".to_string(), "8080".to_string()),
            ("ADMIN_USER".to_string(), "root".to_string()),
        ]);
        let request = OperationRequest::install("n8n", "n8n-prod", &config);

        assert_eq!(request.path(), "/api/apps/install-stream");
        assert_eq!(
            request.body(),
            serde_json::json!({
                "app_name": "n8n",
                "instance_name": "n8n-prod",
                "config": {"port": 8080, "ADMIN_USER": "root"},
            })
        );
    }

    #[test]
    fn update_and_uninstall_routes() {
        let update = OperationRequest::update("redis", UpdateType::BetaUpdate);
        assert_eq!(update.path(), "/api/apps/update");
        assert_eq!(
            update.body(),
            serde_json::json!({"container_name": "redis", "update_type": "beta_update"})
        );

        let uninstall = OperationRequest::uninstall("redis");
        assert_eq!(uninstall.path(), "/api/containers/redis/uninstall");
        assert_eq!(uninstall.body(), serde_json::json!({}));
    }

    #[test]
    fn container_names_follow_docker_rules() {
        assert!(validate_container_name("n8n-prod_1.a").is_ok());
        assert!(validate_container_name("").is_err());
        assert!(validate_container_name("-leading").is_err());
        assert!(validate_container_name("a/../b").is_err());
        assert!(validate_container_name(&"a".repeat(129)).is_err());
    }

    #[test]
    fn update_type_parses_whitelist_only() {
        assert_eq!(
            "config_update".parse::<UpdateType>().unwrap(),
            UpdateType::ConfigUpdate
        );
        assert!("rm_rf".parse::<UpdateType>().is_err());
    }

    #[test]
    fn access_info_tolerates_unknown_type_and_fields() {
        let info: AccessInfo = serde_json::from_value(serde_json::json!({
            "type": "grpc",
            "url": "http://x",
            "extra": 1,
        }))
        .unwrap();
        assert_eq!(info.kind, AccessKind::Other);
        assert!(info.entry_points().is_empty());
    }

    #[test]
    fn cli_access_lists_command_then_host() {
        let info = AccessInfo {
            kind: AccessKind::Cli,
            command: Some("docker exec -it redis redis-cli".into()),
            host: Some("localhost:6379".into()),
            ..AccessInfo::default()
        };
        assert_eq!(
            info.entry_points(),
            vec![
                ("CLI Command", "docker exec -it redis redis-cli"),
                ("Host", "localhost:6379"),
            ]
        );
    }

    #[test]
    fn success_payload_exposes_typed_views() {
        let payload = SuccessPayload::new(
            serde_json::json!({
                "success": true,
                "message": "vaultwarden installed successfully",
                "post_install_action": {
                    "type": "set_password",
                    "prompt": "Admin token",
                    "container_name": "vaultwarden"
                }
            })
            .as_object()
            .cloned()
            .unwrap(),
        );
        let action = payload.post_install_action().unwrap();
        assert!(action.requires_password());
        assert_eq!(action.container_name, "vaultwarden");
        assert!(payload.access_info().is_none());
        assert_eq!(payload.message(), Some("vaultwarden installed successfully"));
    }

    #[test]
    fn config_field_default_accepts_numbers() {
        let field: ConfigField = serde_json::from_value(serde_json::json!({
            "key": "port", "label": "Port", "type": "number", "default": 5432
        }))
        .unwrap();
        assert_eq!(field.default_text(), "5432");
        assert!(!field.is_select());
    }
}
