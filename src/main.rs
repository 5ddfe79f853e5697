use anyhow::Result;
use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;

use recovery_agent::config::{RecoveryConfig, RecoveryOs, RecoveryType};
use recovery_agent::host::SystemHost;
use recovery_agent::logging;
use recovery_agent::paths::RecoveryPaths;
use recovery_agent::recovery::{
    Outcome, RecoveryOrchestrator, SystemServices, TerminalPrompt, bind_installer_media,
};

#[derive(Parser)]
#[command(name = "recovery-agent")]
#[command(about = "Factory install and restore from the recovery partition", long_about = None)]
struct Cli {
    /// Configuration file, defaults to the one on the recovery partition
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// What to do: factory_install, factory_restore or headless_installer
    #[arg(value_enum)]
    recovery_type: RecoveryType,

    /// Filesystem label of the recovery partition
    recovery_label: String,

    /// Flavor of the system to install
    #[arg(value_enum)]
    recovery_os: RecoveryOs,
}

fn main() -> ExitCode {
    logging::init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(outcome) => {
            info!("recovery finished: {outcome:?}");
            ExitCode::from(outcome.exit_code() as u8)
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<Outcome> {
    info!("RECOVERY_TYPE: {}", cli.recovery_type);
    info!("RECOVERY_LABEL: {}", cli.recovery_label);
    info!("RECOVERY_OS: {}", cli.recovery_os);

    let host = SystemHost;
    let paths = RecoveryPaths::default();

    let _media = if cli.recovery_os.is_curtin() {
        info!("Recovery in ubuntu classic curtin mode");
        Some(bind_installer_media(&host, &paths)?)
    } else {
        None
    };

    let config_path = cli.config.unwrap_or_else(|| paths.config_file());
    let config = RecoveryConfig::load_from_file(&config_path)?.with_label(&cli.recovery_label);
    config.validate()?;

    let services = SystemServices::new(&host, &config, &paths);
    RecoveryOrchestrator::new(
        &services,
        TerminalPrompt::default(),
        &config,
        cli.recovery_type,
        cli.recovery_os,
    )
    .run()
}
