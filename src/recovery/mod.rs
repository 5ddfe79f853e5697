pub mod confirm;
pub mod data;
pub mod orchestrator;
pub mod services;

pub use confirm::{Confirmation, TerminalPrompt, UserPrompt};
pub use orchestrator::{Outcome, RecoveryOrchestrator, State};
pub use services::{BootService, PartitionService, SystemServices, bind_installer_media};
