use std::collections::BTreeMap;

use crate::error::FlowError;
use crate::wire::{validate_container_name, ConfigField, ConfigSchema, OperationRequest};

pub const FALLBACK_PORT: u16 = 5678;
pub const MULTI_INSTANCE_LOCKED: &str = "Multi-Instance requires PRO license";

/// Editable install dialog contents for one app.
#[derive(Clone, Debug)]
pub struct InstallForm {
    app_name: String,
    instance_name: String,
    instance_locked: bool,
    port: String,
    fields: Vec<ConfigField>,
    values: BTreeMap<String, String>,
}

impl InstallForm {
    /// Without the multi-instance feature the instance name is pinned to
    /// the app name.
    pub fn new(
        app_name: &str,
        default_ports: &[u16],
        schema: ConfigSchema,
        multi_instance: bool,
    ) -> Self {
        let port = default_ports.first().copied().unwrap_or(FALLBACK_PORT);
        let values = schema
            .fields
            .iter()
            .filter(|field| !field.generate)
            .map(|field| (field.key.clone(), field.default_text()))
            .collect();
        Self {
            app_name: app_name.to_string(),
            instance_name: app_name.to_string(),
            instance_locked: !multi_instance,
            port: port.to_string(),
            fields: schema.fields,
            values,
        }
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    pub fn instance_locked(&self) -> bool {
        self.instance_locked
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn fields(&self) -> &[ConfigField] {
        &self.fields
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set_instance_name(&mut self, name: &str) -> Result<(), FlowError> {
        let name = name.trim();
        if self.instance_locked && name != self.app_name {
            return Err(FlowError::validation(MULTI_INSTANCE_LOCKED));
        }
        self.instance_name = name.to_string();
        Ok(())
    }

    pub fn set_port(&mut self, port: &str) {
        self.port = port.trim().to_string();
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<(), FlowError> {
        let field = self
            .fields
            .iter()
            .find(|field| field.key == key)
            .ok_or_else(|| FlowError::validation(format!("Unknown setting: {key}")))?;
        if field.generate {
            return Err(FlowError::validation(format!(
                "{} is generated automatically",
                field.label
            )));
        }
        if field.is_select() && !field.options.iter().any(|option| option == value) {
            return Err(FlowError::validation(format!(
                "{} must be one of: {}",
                field.label,
                field.options.join(", ")
            )));
        }
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Validates locally and builds the install request. Nothing here
    /// touches the network.
    pub fn to_request(&self) -> Result<OperationRequest, FlowError> {
        validate_container_name(&self.instance_name)?;
        let port = parse_port(&self.port)?;

        let mut config = BTreeMap::new();
        config.insert("port".to_string(), port.to_string());
        for field in self.fields.iter().filter(|field| !field.generate) {
            let value = self
                .values
                .get(&field.key)
                .map(|value| value.trim())
                .unwrap_or_default();
            if field.required && value.is_empty() {
                return Err(FlowError::validation(format!("{} is required", field.label)));
            }
            config.insert(field.key.clone(), value.to_string());
        }
        Ok(OperationRequest::install(
            &self.app_name,
            &self.instance_name,
            &config,
        ))
    }
}

fn parse_port(raw: &str) -> Result<u16, FlowError> {
    match raw.trim().parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(FlowError::validation(format!("Invalid port: {raw}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;

    fn schema() -> ConfigSchema {
        serde_json::from_value(serde_json::json!({
            "fields": [
                {"key": "ADMIN_USER", "label": "Admin user", "type": "text", "default": "admin", "required": true},
                {"key": "SECRET_KEY", "label": "Secret key", "type": "password", "generate": true},
                {"key": "MODE", "label": "Mode", "type": "select", "default": "prod", "options": ["prod", "dev"]}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn defaults_follow_schema_and_ports() {
        let form = InstallForm::new("n8n", &[], schema(), false);
        assert_eq!(form.port(), "5678");
        assert_eq!(form.instance_name(), "n8n");
        assert_eq!(form.value("ADMIN_USER"), Some("admin"));
        assert_eq!(form.value("SECRET_KEY"), None);

        let form = InstallForm::new("postgres", &[5432, 5433], ConfigSchema::default(), true);
        assert_eq!(form.port(), "5432");
    }

    #[test]
    fn free_tier_pins_instance_name() {
        let mut form = InstallForm::new("n8n", &[], schema(), false);
        let err = form.set_instance_name("n8n-2").unwrap_err();
        assert_eq!(err.to_string(), MULTI_INSTANCE_LOCKED);
        assert!(form.set_instance_name("n8n").is_ok());

        let mut form = InstallForm::new("n8n", &[], schema(), true);
        form.set_instance_name("n8n-2").unwrap();
        assert_eq!(form.to_request().unwrap().target_id(), "n8n-2");
    }

    #[test]
    fn request_skips_generated_fields() {
        let mut form = InstallForm::new("n8n", &[8080], schema(), false);
        form.set("MODE", "dev").unwrap();
        let request = form.to_request().unwrap();
        let config: Vec<_> = request.config().collect();
        assert_eq!(
            config,
            vec![("ADMIN_USER", "admin"), ("MODE", "dev"), ("port", "8080")]
        );
    }

    #[test]
    fn local_validation_rejects_bad_input() {
        let mut form = InstallForm::new("n8n", &[], schema(), false);
        assert!(form.set("MODE", "staging").is_err());
        assert!(form.set("SECRET_KEY", "x").is_err());

        form.set("ADMIN_USER", "  ").unwrap();
        let err = form.to_request().unwrap_err();
        assert_eq!(err.class(), ErrorClass::Validation);
        assert_eq!(err.to_string(), "Admin user is required");

        form.set("ADMIN_USER", "root").unwrap();
        form.set_port("70000");
        assert!(form.to_request().is_err());
    }
}
