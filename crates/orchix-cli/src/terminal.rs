//! Line-oriented terminal frontend for the workflow dialogs.

use std::io::{IsTerminal, Write};

use dialoguer::Password;
use orchix_flow::entitlement::SelectionDraft;
use orchix_flow::view::{
    AbandonChoice, Dialog, FlowView, Notify, PasswordPrompt, SelectionAction, SelectionView,
    Toast, ToastLevel,
};
use orchix_flow::wire::{AccessInfo, ProgressEvent};
use tokio::io::{AsyncBufReadExt, BufReader, Stdin};
use tokio::sync::Mutex;
use tracing::warn;

/// Exit status when stdin closes while a dialog still needs an answer.
const EXIT_INPUT_CLOSED: i32 = 2;

pub fn print_progress(title: &str, event: &ProgressEvent) {
    eprintln!("{title}: {:>3}% {}", event.percent, event.status_text);
}

pub struct TerminalView {
    input: Mutex<BufReader<Stdin>>,
}

impl TerminalView {
    pub fn new() -> Self {
        Self {
            input: Mutex::new(BufReader::new(tokio::io::stdin())),
        }
    }

    async fn read_line(&self, prompt: &str) -> Option<String> {
        eprint!("{prompt}");
        let _ = std::io::stderr().flush();
        let mut line = String::new();
        match self.input.lock().await.read_line(&mut line).await {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim_end_matches(&['\r', '\n'][..]).to_string()),
        }
    }

    async fn required_line(&self, prompt: &str) -> String {
        match self.read_line(prompt).await {
            Some(line) => line,
            None => input_closed(),
        }
    }

    /// Reads without echo when attached to a terminal; piped input is read
    /// line by line.
    async fn required_secret(&self, prompt: String) -> String {
        if !std::io::stdin().is_terminal() {
            return self.required_line(&format!("{prompt}: ")).await;
        }
        let _input = self.input.lock().await;
        let read = tokio::task::spawn_blocking(move || {
            Password::new()
                .with_prompt(prompt)
                .allow_empty_password(true)
                .interact()
        })
        .await;
        match read {
            Ok(Ok(secret)) => secret,
            Ok(Err(err)) => {
                warn!("password prompt failed: {err}");
                input_closed()
            }
            Err(err) => {
                warn!("password prompt task failed: {err}");
                input_closed()
            }
        }
    }
}

fn input_closed() -> ! {
    eprintln!();
    eprintln!("input closed while a required dialog was open");
    std::process::exit(EXIT_INPUT_CLOSED);
}

impl Notify for TerminalView {
    fn notify(&self, toast: Toast) {
        match toast.level {
            ToastLevel::Success => eprintln!("ok: {}", toast.message),
            ToastLevel::Error => eprintln!("error: {}", toast.message),
        }
    }
}

impl FlowView for TerminalView {
    fn show_progress(&self, title: &str, event: &ProgressEvent) {
        print_progress(title, event);
    }

    async fn prompt_password(&self, prompt: PasswordPrompt<'_>) -> Dialog<String> {
        if prompt.error.is_none() {
            println!("{} installed successfully", prompt.target);
        }
        if let Some(error) = prompt.error {
            eprintln!("{error}");
        }
        let line = self
            .required_secret(format!("{} (:q to close)", prompt.prompt))
            .await;
        if line.trim() == ":q" {
            Dialog::Dismissed
        } else {
            Dialog::Submitted(line)
        }
    }

    async fn show_access_info(&self, target: &str, info: &AccessInfo) -> Dialog<()> {
        println!("{target} Ready");
        for (label, value) in info.entry_points() {
            println!("  {label}: {value}");
        }
        if !info.credentials.is_empty() {
            println!("  Credentials:");
            for credential in &info.credentials {
                println!("    {}: {}", credential.label, credential.value);
            }
        }
        if let Some(hint) = &info.setup_hint {
            println!("  {}", hint.title);
            println!("    {}", hint.command);
        }
        match self.read_line("Press Enter to finish (:q to close): ").await {
            Some(line) if line.trim() == ":q" => Dialog::Dismissed,
            _ => Dialog::Submitted(()),
        }
    }

    async fn confirm_abandon(&self, target: &str) -> AbandonChoice {
        println!("{target} has already been installed.");
        loop {
            let line = self
                .required_line("[b]ack or [r]emove & cancel? ")
                .await;
            match line.trim().to_ascii_lowercase().as_str() {
                "b" | "back" => return AbandonChoice::Back,
                "r" | "remove" => return AbandonChoice::RemoveAndCancel,
                _ => {}
            }
        }
    }
}

impl SelectionView for TerminalView {
    async fn present(&self, draft: &SelectionDraft, error: Option<&str>) -> SelectionAction {
        println!(
            "Free tier allows {} containers. Choose which ones stay managed ({}):",
            draft.limit(),
            draft.counter_label()
        );
        for (index, candidate) in draft.candidates().iter().enumerate() {
            let mark = if draft.is_selected(&candidate.name) {
                "[x]"
            } else if draft.is_enabled(&candidate.name) {
                "[ ]"
            } else {
                "[-]"
            };
            println!("  {:>2}. {mark} {} ({})", index + 1, candidate.name, candidate.status);
        }
        if let Some(error) = error {
            eprintln!("{error}");
        }

        let line = self
            .required_line("number to toggle, list like 1,3 to replace, Enter to save: ")
            .await;
        parse_selection(draft, line.trim())
    }

    fn rerender(&self) {
        println!("Container selection updated.");
    }
}

fn parse_selection(draft: &SelectionDraft, line: &str) -> SelectionAction {
    if line.is_empty() {
        return SelectionAction::Submit;
    }
    if line == ":q" {
        return SelectionAction::Dismiss;
    }
    let names: Vec<String> = line
        .split(',')
        .filter_map(|part| part.trim().parse::<usize>().ok())
        .filter_map(|index| index.checked_sub(1))
        .filter_map(|index| draft.candidates().get(index))
        .map(|candidate| candidate.name.clone())
        .collect();
    match names.as_slice() {
        [name] if !line.contains(',') => SelectionAction::Toggle(name.clone()),
        _ => SelectionAction::Replace(names),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchix_flow::wire::ManagedResource;

    fn draft() -> SelectionDraft {
        SelectionDraft::new(
            ["web", "db", "cache"]
                .iter()
                .map(|name| ManagedResource {
                    name: name.to_string(),
                    status: "running".into(),
                })
                .collect(),
            2,
        )
    }

    #[test]
    fn selection_input_maps_to_actions() {
        let draft = draft();
        assert_eq!(parse_selection(&draft, ""), SelectionAction::Submit);
        assert_eq!(parse_selection(&draft, ":q"), SelectionAction::Dismiss);
        assert_eq!(
            parse_selection(&draft, "2"),
            SelectionAction::Toggle("db".into())
        );
        assert_eq!(
            parse_selection(&draft, "1, 3"),
            SelectionAction::Replace(vec!["web".into(), "cache".into()])
        );
        assert_eq!(
            parse_selection(&draft, "0,9"),
            SelectionAction::Replace(Vec::new())
        );
    }
}
