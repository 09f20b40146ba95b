pub mod adapters;
pub mod agent;
pub mod config;
pub mod decision;
pub mod errors;
pub mod logging;
pub mod orchestrator;
pub mod parsers;
pub mod session;
pub mod ui;
pub mod util;
pub mod workflow;
pub mod worktree;
