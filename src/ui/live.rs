//! Live terminal view of a running phase.
//!
//! [`LiveDisplay`] is a plain consumer of [`OrchestratorEvent`]s: one spinner
//! per agent showing its latest activity, with tool calls and errors printed
//! above the bars. Messages from different agents arrive interleaved and are
//! shown in arrival order.

use std::collections::HashMap;
use std::time::Duration;

use console::{Color, style};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use crate::agent::RunStatus;
use crate::orchestrator::{ChannelSink, OrchestratorEvent};
use crate::parsers::{MessageKind, NormalizedMessage};
use crate::ui::icons::{CHECK, CROSS, PHASE, STOP, THINKING, TOOL, WARN};
use crate::util::truncate_str;

const SNIPPET_LEN: usize = 100;

struct AgentLine {
    bar: ProgressBar,
    label: String,
    color: Color,
}

pub struct LiveDisplay {
    multi: MultiProgress,
    agents: HashMap<String, AgentLine>,
    verbose: bool,
}

impl LiveDisplay {
    pub fn new(verbose: bool) -> Self {
        Self {
            multi: MultiProgress::new(),
            agents: HashMap::new(),
            verbose,
        }
    }

    /// Start a display task fed by the returned sink.
    pub fn spawn(verbose: bool) -> (ChannelSink, JoinHandle<()>) {
        let (sink, rx) = ChannelSink::new();
        let handle = tokio::spawn(Self::new(verbose).consume(rx));
        (sink, handle)
    }

    /// Render events until every sender is dropped.
    pub async fn consume(mut self, mut rx: UnboundedReceiver<OrchestratorEvent>) {
        while let Some(event) = rx.recv().await {
            self.handle(&event);
        }
        self.clear();
    }

    pub fn handle(&mut self, event: &OrchestratorEvent) {
        match event {
            OrchestratorEvent::PhaseStarted {
                task_id,
                phase,
                label,
                agents,
            } => {
                self.clear();
                self.print_line(format!(
                    "{}{} {} {}",
                    PHASE,
                    style(format!("[{}] phase {}", task_id, phase)).bold(),
                    style(label).yellow(),
                    style(format!("({} agents)", agents.len())).dim()
                ));
            }
            OrchestratorEvent::AgentStarted {
                agent_id,
                label,
                color,
                log_path,
            } => {
                let bar = self.multi.add(ProgressBar::new_spinner());
                if let Ok(spinner) = ProgressStyle::default_spinner().template("{prefix} {spinner} {msg}") {
                    bar.set_style(spinner);
                }
                let color = color_for(color);
                bar.set_prefix(style(format!("{:>12}", label)).fg(color).bold().to_string());
                bar.set_message(style("starting...").dim().to_string());
                bar.enable_steady_tick(Duration::from_millis(120));
                if self.verbose {
                    self.print_line(format!(
                        "  {} {}",
                        style(label).fg(color),
                        style(format!("log: {}", log_path.display())).dim()
                    ));
                }
                self.agents.insert(
                    agent_id.clone(),
                    AgentLine {
                        bar,
                        label: label.clone(),
                        color,
                    },
                );
            }
            OrchestratorEvent::Message { agent_id, message } => {
                let Some(line) = self.agents.get(agent_id) else {
                    return;
                };
                if let Some(status) = status_text(message) {
                    line.bar.set_message(status);
                }
                if let Some(text) = format_message(&line.label, line.color, message, self.verbose) {
                    self.print_line(text);
                }
            }
            OrchestratorEvent::AgentFinished {
                agent_id,
                status,
                detail,
            } => {
                if let Some(line) = self.agents.remove(agent_id) {
                    let summary = match (status, detail) {
                        (RunStatus::Succeeded, _) => format!("{}{}", CHECK, style("done").green()),
                        (_, Some(detail)) => format!("{}{}", CROSS, style(truncate_str(detail, SNIPPET_LEN)).red()),
                        (status, None) => format!("{}{}", CROSS, style(status).red()),
                    };
                    line.bar.finish_and_clear();
                    self.print_line(format!("  {} {}", style(&line.label).fg(line.color).bold(), summary));
                }
            }
            OrchestratorEvent::PhaseFinished {
                phase,
                succeeded,
                failed,
            } => {
                self.clear();
                let counts = if *failed == 0 {
                    style(format!("{} succeeded", succeeded)).green()
                } else {
                    style(format!("{} succeeded, {} failed", succeeded, failed)).yellow()
                };
                self.print_line(format!("  phase {} finished: {}", phase, counts));
            }
            OrchestratorEvent::PhaseCancelled { phase } => {
                self.clear();
                self.print_line(format!("{}{}", STOP, style(format!("phase {} cancelled", phase)).red().bold()));
            }
        }
    }

    fn clear(&mut self) {
        for (_, line) in self.agents.drain() {
            line.bar.finish_and_clear();
        }
    }

    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }
}

/// Spinner text for a message, if it changes what the agent is "doing".
fn status_text(message: &NormalizedMessage) -> Option<String> {
    let snippet = first_line(&message.content);
    match message.kind {
        MessageKind::ToolCall => Some(format!("{}{}", TOOL, style(snippet).yellow())),
        MessageKind::Thinking => Some(format!("{}{}", THINKING, style(snippet).dim())),
        MessageKind::Output => Some(snippet),
        MessageKind::Error | MessageKind::SessionId => None,
    }
}

/// Line to print above the bars for a message. Tool calls and errors are
/// always shown; output and thinking only when verbose.
pub fn format_message(label: &str, color: Color, message: &NormalizedMessage, verbose: bool) -> Option<String> {
    let prefix = style(label).fg(color).bold();
    let snippet = first_line(&message.content);
    match message.kind {
        MessageKind::ToolCall => Some(format!("  {} {}{}", prefix, TOOL, style(snippet).yellow())),
        MessageKind::Error => Some(format!("  {} {}{}", prefix, WARN, style(snippet).red())),
        MessageKind::Output if verbose => Some(format!("  {} {}", prefix, snippet)),
        MessageKind::Thinking if verbose => Some(format!("  {} {}{}", prefix, THINKING, style(snippet).dim())),
        MessageKind::SessionId if verbose => message
            .session_id
            .as_deref()
            .map(|id| format!("  {} {}", prefix, style(format!("session {}", id)).dim())),
        _ => None,
    }
}

fn first_line(text: &str) -> String {
    let line = text.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or_default();
    truncate_str(line, SNIPPET_LEN)
}

/// Terminal colour for a configured colour name; unknown names are white.
pub fn color_for(name: &str) -> Color {
    match name.trim().to_ascii_lowercase().as_str() {
        "black" => Color::Black,
        "red" => Color::Red,
        "green" => Color::Green,
        "yellow" => Color::Yellow,
        "blue" => Color::Blue,
        "magenta" | "purple" => Color::Magenta,
        "cyan" => Color::Cyan,
        _ => Color::White,
    }
}
