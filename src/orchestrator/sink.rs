//! Where the orchestrator reports progress.

use std::path::PathBuf;

use tokio::sync::mpsc;

use crate::agent::RunStatus;
use crate::parsers::NormalizedMessage;

/// Progress of a phase, in the order it happens.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    PhaseStarted {
        task_id: String,
        phase: u32,
        label: String,
        agents: Vec<String>,
    },
    AgentStarted {
        agent_id: String,
        label: String,
        color: String,
        log_path: PathBuf,
    },
    Message {
        agent_id: String,
        message: NormalizedMessage,
    },
    AgentFinished {
        agent_id: String,
        status: RunStatus,
        detail: Option<String>,
    },
    PhaseFinished {
        phase: u32,
        succeeded: usize,
        failed: usize,
    },
    PhaseCancelled {
        phase: u32,
    },
}

pub trait MessageSink: Send + Sync {
    fn emit(&self, event: OrchestratorEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MessageSink for NullSink {
    fn emit(&self, _event: OrchestratorEvent) {}
}

/// Forwards events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<OrchestratorEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OrchestratorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl MessageSink for ChannelSink {
    fn emit(&self, event: OrchestratorEvent) {
        // A closed receiver just means nobody is watching.
        let _ = self.tx.send(event);
    }
}
