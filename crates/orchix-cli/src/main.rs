mod terminal;

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use orchix_flow::install::{Dismissal, InstallOutcome};
use orchix_flow::probe::ConflictState;
use orchix_flow::wire::{ProgressEvent, TerminalEvent, UpdateType};
use orchix_flow::{
    Backend, ClientConfig, ContainerActions, EnforceOutcome, EntitlementEnforcer, FlowError,
    HttpBackend, InstallFlowController, InstallForm,
};
use tracing::warn;

use terminal::TerminalView;

/// Extra wait on top of the debounce window for the first conflict result.
const CONFLICT_WAIT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "orchix", version, about = "ORCHIX container control client")]
struct Cli {
    /// Backend URL (overrides ORCHIX_URL and the saved config)
    #[arg(long, global = true)]
    url: Option<String>,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Install an app and stream its progress
    Install {
        app: String,
        /// Instance name (multi-instance requires PRO)
        #[arg(long)]
        instance: Option<String>,
        #[arg(long)]
        port: Option<String>,
        /// App setting as KEY=VALUE; repeatable
        #[arg(long = "set", value_parser = parse_key_val)]
        settings: Vec<(String, String)>,
    },
    /// Uninstall a container
    Uninstall { name: String },
    /// Update a container
    Update {
        name: String,
        #[arg(long = "type", default_value = "version_update")]
        update_type: String,
    },
    /// List update actions offered for a container
    UpdateActions { name: String },
    /// Check whether an instance name or port is taken
    CheckConflicts {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        port: Option<String>,
    },
    /// License commands
    License {
        #[command(subcommand)]
        cmd: LicenseCmd,
    },
    /// Run the free-tier container selection if over the limit
    Enforce,
    /// Client configuration
    Config {
        #[command(subcommand)]
        cmd: ConfigCmd,
    },
}

#[derive(Subcommand)]
enum LicenseCmd {
    /// Show tier and container usage
    Status,
    /// Activate a PRO license key
    Activate { key: String },
    /// Deactivate the PRO license
    Deactivate,
}

#[derive(Subcommand)]
enum ConfigCmd {
    /// Print the effective configuration
    Show,
    /// Save the backend URL
    SetUrl { url: String },
    /// Save the session token, and optionally the CSRF token
    SetToken {
        token: String,
        #[arg(long)]
        csrf: Option<String>,
    },
}

impl Cmd {
    fn name(&self) -> &'static str {
        match self {
            Cmd::Install { .. } => "install",
            Cmd::Uninstall { .. } => "uninstall",
            Cmd::Update { .. } => "update",
            Cmd::UpdateActions { .. } => "update-actions",
            Cmd::CheckConflicts { .. } => "check-conflicts",
            Cmd::License { .. } => "license",
            Cmd::Enforce => "enforce",
            Cmd::Config { .. } => "config",
        }
    }

    /// Commands that act on containers wait until the free-tier selection
    /// is resolved.
    fn requires_entitlement(&self) -> bool {
        match self {
            Cmd::Install { .. } | Cmd::Uninstall { .. } | Cmd::Update { .. } => true,
            Cmd::License { cmd } => matches!(cmd, LicenseCmd::Status),
            Cmd::UpdateActions { .. }
            | Cmd::CheckConflicts { .. }
            | Cmd::Enforce
            | Cmd::Config { .. } => false,
        }
    }
}

fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got {raw}")),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    orchix_util::init_tracing()?;
    let cli = Cli::parse();
    orchix_util::init_cli_telemetry("orchix-cli", env!("CARGO_PKG_VERSION"), cli.cmd.name());

    let mut cfg = ClientConfig::load();
    if let Some(url) = cli.url {
        cfg.base_url = url;
    }
    let view = Arc::new(TerminalView::new());
    if cli.cmd.requires_entitlement() {
        let backend = Arc::new(HttpBackend::new(&cfg)?);
        enforce_limit(&EntitlementEnforcer::new(backend, Arc::clone(&view))).await?;
    }

    match cli.cmd {
        Cmd::Config { cmd } => config_command(cmd, &cfg)?,
        Cmd::Install {
            app,
            instance,
            port,
            settings,
        } => install(&cfg, view, &app, instance, port, settings).await?,
        Cmd::Uninstall { name } => {
            let backend = Arc::new(HttpBackend::new(&cfg)?);
            let actions = ContainerActions::new(backend);
            let mut sink = progress_printer(format!("Uninstalling {name}"));
            report(actions.uninstall(&name, &mut sink).await?, "Uninstall complete")?;
        }
        Cmd::Update { name, update_type } => {
            let update_type: UpdateType = update_type.parse()?;
            let backend = Arc::new(HttpBackend::new(&cfg)?);
            let actions = ContainerActions::new(backend);
            let mut sink = progress_printer(format!("Updating {name}"));
            report(
                actions.update(&name, update_type, &mut sink).await?,
                "Update complete",
            )?;
        }
        Cmd::UpdateActions { name } => {
            let backend = Arc::new(HttpBackend::new(&cfg)?);
            let actions = ContainerActions::new(backend);
            for (update_type, action) in actions.update_actions(&name).await? {
                println!("{}\t{}", update_type.as_str(), action.label);
            }
        }
        Cmd::CheckConflicts { name, port } => {
            let backend = HttpBackend::new(&cfg)?;
            let name = name.unwrap_or_default();
            let port = port.unwrap_or_default();
            let result = backend
                .check_conflicts(non_blank(&name), non_blank(&port))
                .await?;
            let state = ConflictState {
                name: name.trim().to_string(),
                port: port.trim().to_string(),
                result,
                checked: true,
            };
            let warnings = state.warnings();
            if warnings.is_empty() {
                println!("no conflicts");
            }
            for warning in warnings {
                println!("{warning}");
            }
        }
        Cmd::License { cmd } => license_command(cmd, &cfg, view).await?,
        Cmd::Enforce => {
            let backend = Arc::new(HttpBackend::new(&cfg)?);
            let enforcer = EntitlementEnforcer::new(backend, view);
            match enforcer.enforce().await? {
                EnforceOutcome::WithinLimit => println!("within container limit"),
                EnforceOutcome::Selected(names) => println!("managed: {}", names.join(", ")),
            }
        }
    }

    Ok(())
}

fn config_command(cmd: ConfigCmd, effective: &ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    match cmd {
        ConfigCmd::Show => {
            let shown = serde_json::json!({
                "base_url": effective.base_url,
                "session_token": mask(&effective.session_token),
                "csrf_token": mask(&effective.csrf_token),
                "probe_debounce_ms": effective.probe_debounce_ms,
                "path": orchix_flow::config::client_config_path().display().to_string(),
            });
            println!("{}", serde_json::to_string_pretty(&shown)?);
        }
        ConfigCmd::SetUrl { url } => {
            let mut saved = ClientConfig::load_saved();
            saved.base_url = url.trim().to_string();
            saved.save()?;
            println!("base_url={}", saved.base_url);
        }
        ConfigCmd::SetToken { token, csrf } => {
            let mut saved = ClientConfig::load_saved();
            saved.session_token = token.trim().to_string();
            if let Some(csrf) = csrf {
                saved.csrf_token = csrf.trim().to_string();
            }
            saved.save()?;
            println!("session token saved");
        }
    }
    Ok(())
}

async fn license_command(
    cmd: LicenseCmd,
    cfg: &ClientConfig,
    view: Arc<TerminalView>,
) -> Result<(), Box<dyn std::error::Error>> {
    let backend = Arc::new(HttpBackend::new(cfg)?);
    let enforcer = EntitlementEnforcer::new(backend, view);
    match cmd {
        LicenseCmd::Status => {
            let info = enforcer.refresh().await?;
            let tier = if info.tier_display.is_empty() {
                info.tier.as_str()
            } else {
                info.tier_display.as_str()
            };
            println!("tier={tier}");
            println!(
                "containers={}/{}",
                info.container_status.current, info.container_status.limit
            );
            if let Some(days) = info.days_remaining {
                println!("days_remaining={days}");
            }
            if enforcer.state().requires_selection() {
                println!("over the free-tier limit; run `orchix enforce`");
            }
        }
        LicenseCmd::Activate { key } => {
            enforcer.activate_license(&key).await?;
        }
        LicenseCmd::Deactivate => {
            enforcer.deactivate_license().await?;
        }
    }
    Ok(())
}

async fn install(
    cfg: &ClientConfig,
    view: Arc<TerminalView>,
    app: &str,
    instance: Option<String>,
    port: Option<String>,
    settings: Vec<(String, String)>,
) -> Result<(), Box<dyn std::error::Error>> {
    let backend = Arc::new(HttpBackend::new(cfg)?);
    let license = backend.license().await?;
    let schema = backend.config_schema(app).await?;

    let mut form = InstallForm::new(app, &[], schema, license.features.multi_instance);
    if let Some(instance) = instance {
        form.set_instance_name(&instance)?;
    }
    if let Some(port) = port {
        form.set_port(&port);
    }
    for (key, value) in &settings {
        form.set(key, value)?;
    }
    let request = form.to_request()?;

    let controller = InstallFlowController::new(backend, view, cfg.probe_debounce());
    controller.open_dialog(&form)?;

    if let Some(mut conflicts) = controller.subscribe_conflicts() {
        let wait = cfg.probe_debounce() + CONFLICT_WAIT;
        if tokio::time::timeout(wait, conflicts.changed()).await.is_err() {
            warn!("conflict check did not finish; continuing");
        }
    }
    let state = controller.conflicts();
    if !state.confirm_enabled() {
        for warning in state.warnings() {
            eprintln!("{warning}");
        }
        controller.close_dialog()?;
        return Err(FlowError::Conflict(state.result).into());
    }

    let dismiss = controller.dismiss_handle();
    let interrupts = tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            match dismiss.request_dismiss() {
                Dismissal::Close => std::process::exit(130),
                Dismissal::Deferred { target } => {
                    eprintln!("{target} keeps installing; you will be asked what to do once it finishes")
                }
                Dismissal::Intercepted => {}
            }
        }
    });
    let outcome = controller.confirm(request).await;
    interrupts.abort();

    match outcome? {
        InstallOutcome::Completed { target } => println!("{target} installed"),
        InstallOutcome::RolledBack { target } => println!("{target} removed"),
        InstallOutcome::Failed(failure) => return Err(FlowError::from(failure).into()),
        InstallOutcome::RollbackFailed { target, failure } => {
            return Err(format!("{target} is still installed: {}", failure.message).into())
        }
    }
    Ok(())
}

/// Runs the free-tier selection before anything else touches containers.
async fn enforce_limit(
    enforcer: &EntitlementEnforcer<HttpBackend, TerminalView>,
) -> Result<(), FlowError> {
    if let EnforceOutcome::Selected(names) = enforcer.enforce().await? {
        println!("managed: {}", names.join(", "));
    }
    Ok(())
}

fn progress_printer(title: String) -> impl FnMut(&ProgressEvent) + Send {
    move |event: &ProgressEvent| terminal::print_progress(&title, event)
}

fn report(terminal: TerminalEvent, fallback: &str) -> Result<(), Box<dyn std::error::Error>> {
    match terminal {
        TerminalEvent::Success(payload) => {
            println!("{}", payload.message().unwrap_or(fallback));
            Ok(())
        }
        TerminalEvent::Error(failure) => Err(FlowError::from(failure).into()),
    }
}

fn non_blank(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

fn mask(secret: &str) -> &'static str {
    if secret.is_empty() {
        ""
    } else {
        "********"
    }
}
