use thiserror::Error;

/// Failures the orchestrator needs to tell apart.
///
/// Everything else travels as a plain `anyhow::Error` with context attached.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("partition with label {label} not found")]
    Discovery { label: String },

    #[error("expected exactly one {pattern} in {dir}, found {found}")]
    LayoutAmbiguity {
        pattern: String,
        dir: String,
        found: usize,
    },

    #[error("command `{command}` exited with status {code}")]
    ExternalTool { command: String, code: i32 },

    #[error("lost system-boot, cannot know proper location")]
    LostSystemBoot,

    /// Not a failure: the firmware boot entries were rewritten and the
    /// device has to restart before recovery can continue.
    #[error("boot entries repaired, restart required")]
    BootEntriesRepaired,
}

impl RecoveryError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn is_repaired(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<RecoveryError>(),
            Some(RecoveryError::BootEntriesRepaired)
        )
    }
}
