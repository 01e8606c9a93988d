use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::mpsc;
use tracing::Level;

/// One structured action record: who did what with which outcome.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub level: Level,
    pub module: &'static str,
    pub action: &'static str,
    pub result: &'static str,
    pub details: Vec<(&'static str, String)>,
}

impl LogEvent {
    pub fn new(module: &'static str, action: &'static str, result: &'static str) -> Self {
        Self {
            level: Level::INFO,
            module,
            action,
            result,
            details: Vec::new(),
        }
    }

    pub fn level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn detail(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.details.push((key, value.into()));
        self
    }
}

enum Msg {
    Event(LogEvent),
    Shutdown,
}

/// Bounded queue in front of the log transport. Producers never block: on a
/// full queue the event is written synchronously with a `dropped` mark.
#[derive(Clone)]
pub struct ActionLog {
    tx: mpsc::Sender<Msg>,
}

pub struct ActionLogWorker {
    rx: mpsc::Receiver<Msg>,
}

impl ActionLog {
    pub fn new(capacity: usize) -> (Self, ActionLogWorker) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, ActionLogWorker { rx })
    }

    pub fn emit(&self, event: LogEvent) {
        if let Err(mpsc::error::TrySendError::Full(Msg::Event(event))) =
            self.tx.try_send(Msg::Event(event))
        {
            tracing::warn!("{}", format_line(&event, true));
        }
    }

    /// Asks the worker to stop once the queue is drained. Call before joining
    /// the worker task at shutdown.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Msg::Shutdown).await;
    }
}

impl ActionLogWorker {
    pub async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            match msg {
                Msg::Event(event) => write_line(&event),
                Msg::Shutdown => return,
            }
        }
    }
}

fn write_line(event: &LogEvent) {
    let line = format_line(event, false);
    if event.level == Level::ERROR {
        tracing::error!("{line}");
    } else if event.level == Level::WARN {
        tracing::warn!("{line}");
    } else if event.level == Level::DEBUG {
        tracing::debug!("{line}");
    } else if event.level == Level::TRACE {
        tracing::trace!("{line}");
    } else {
        tracing::info!("{line}");
    }
}

fn format_line(event: &LogEvent, dropped: bool) -> String {
    let ts = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default();
    let mut line = format!(
        "datetime={} module={} action={} result={}",
        safe_value(&ts),
        event.module,
        event.action,
        event.result
    );
    for (key, value) in &event.details {
        line.push(' ');
        line.push_str(key);
        line.push('=');
        line.push_str(&safe_value(value));
    }
    if dropped {
        line.push_str(" warning=log_queue_full");
    }
    line
}

fn safe_value(value: &str) -> String {
    let text = value.replace('\n', " ");
    let text = text.trim();
    if text.is_empty() || text.contains(' ') || text.contains('=') {
        format!("\"{text}\"")
    } else {
        text.to_string()
    }
}
