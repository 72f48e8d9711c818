use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

const QUEUE_CAPACITY: usize = 128;
const ROTATE_AT_BYTES: u64 = 2 * 1024 * 1024;
const JOURNAL_FILE: &str = "events.jsonl";

/// Usage-event journal for the control client.
///
/// Events are queued to a writer thread and appended to
/// `<data dir>/telemetry/<app>/events.jsonl`. Nothing is recorded unless
/// the journal was enabled at init time.
pub struct Journal {
    app: String,
    version: String,
    session: String,
    enabled: AtomicBool,
    sender: SyncSender<Record>,
}

#[derive(Serialize)]
struct Record {
    event: String,
    at_unix_millis: i64,
    app: String,
    version: String,
    session: String,
    props: BTreeMap<String, String>,
}

static JOURNAL: OnceLock<Arc<Journal>> = OnceLock::new();

pub fn init(app: &'static str, version: &'static str, enabled: bool) -> Arc<Journal> {
    if let Some(existing) = JOURNAL.get() {
        existing.enabled.store(enabled, Ordering::Relaxed);
        return Arc::clone(existing);
    }

    let (sender, receiver) = sync_channel(QUEUE_CAPACITY);
    let journal = Arc::new(Journal {
        app: app.to_string(),
        version: version.to_string(),
        session: session_token(),
        enabled: AtomicBool::new(enabled),
        sender,
    });
    spawn_writer(journal_dir(app), receiver);

    let _ = JOURNAL.set(Arc::clone(&journal));
    journal
}

/// Initializes the journal from `ORCHIX_TELEMETRY` (`1`, `true`, `yes`, `on`).
pub fn init_with_env(app: &'static str, version: &'static str) -> Arc<Journal> {
    init(app, version, env_flag("ORCHIX_TELEMETRY"))
}

/// Records an event if the journal is initialized and enabled. Never blocks:
/// a full queue drops the event.
pub fn event(name: &str, props: &[(&str, &str)]) {
    if let Some(journal) = JOURNAL.get() {
        journal.record(name, props);
    }
}

impl Journal {
    fn record(&self, name: &str, props: &[(&str, &str)]) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        let props = props
            .iter()
            .filter(|(key, _)| !key.trim().is_empty())
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        let record = Record {
            event: name.to_string(),
            at_unix_millis: now_millis(),
            app: self.app.clone(),
            version: self.version.clone(),
            session: self.session.clone(),
            props,
        };
        if let Err(TrySendError::Disconnected(_)) = self.sender.try_send(record) {
            self.enabled.store(false, Ordering::Relaxed);
        }
    }
}

fn spawn_writer(dir: PathBuf, receiver: Receiver<Record>) {
    std::thread::spawn(move || {
        while let Ok(record) = receiver.recv() {
            if let Err(err) = append(&dir, &record) {
                eprintln!("telemetry: failed to write {}: {err}", dir.display());
            }
        }
    });
}

fn append(dir: &Path, record: &Record) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    let path = dir.join(JOURNAL_FILE);
    rotate(&path)?;
    let line = serde_json::to_string(record).map_err(std::io::Error::other)?;
    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    writeln!(file, "{line}")
}

fn rotate(path: &Path) -> std::io::Result<()> {
    match fs::metadata(path) {
        Ok(meta) if meta.len() >= ROTATE_AT_BYTES => {
            let rotated = path.with_extension("jsonl.1");
            let _ = fs::remove_file(&rotated);
            fs::rename(path, rotated)
        }
        _ => Ok(()),
    }
}

fn journal_dir(app: &str) -> PathBuf {
    let base = match std::env::var("HOME") {
        Ok(home) => PathBuf::from(home).join(".local/share/orchix"),
        Err(_) => PathBuf::from("/tmp/orchix"),
    };
    base.join("telemetry").join(app)
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|value| {
            matches!(
                value.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(false)
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn session_token() -> String {
    format!("{:x}-{:x}", now_millis(), std::process::id())
}
