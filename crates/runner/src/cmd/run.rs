use std::path::PathBuf;
use std::process::ExitCode;

use clap::Args;
use tracing::info;

use crate::config;
use crate::error::RunnerResult;
use crate::worker::Worker;

#[derive(Args)]
pub struct RunArgs {
    /// Path to the runner YAML config
    #[arg(long, env = "SANDBOX_CONFIG")]
    pub config: PathBuf,
    /// Override the configured sandbox id
    #[arg(long)]
    pub sandbox_id: Option<String>,
}

pub async fn run_sandbox(args: RunArgs) -> RunnerResult<ExitCode> {
    let mut config = config::load(&args.config).await?;
    if let Some(sandbox_id) = args.sandbox_id {
        config.sandbox_id = sandbox_id;
        config.validate()?;
    }
    let initial = config.initial_command()?;

    let mut catalog = sandbox::builtin_catalog();
    sandbox_kv::register(&mut catalog);
    let worker = Worker::from_catalog(config, &catalog)?;

    Ok(match worker.run(initial).await? {
        Some(code) => {
            info!(code, "sandbox finished");
            ExitCode::from(u8::try_from(code).unwrap_or(u8::MAX))
        }
        None => ExitCode::FAILURE,
    })
}
