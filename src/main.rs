//! Binary entry point for the nodekeeper CLI.

use std::io::{self, Write};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use shell_escape::unix::escape;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use nodekeeper::{
    AzureConfig, AzureProvisioner, Broker, BrokerError, CacheError, CommandResult, ConfigError,
    ConnectionConfig, FileCache, NodePool, ProvisionCache, ProvisionError, ProvisionRequest,
    Provisioner, RequestError, ScopeError, SessionConfig, SessionScope, TeardownController,
    TeardownError,
};

mod cli;

use cli::{Cli, RequestArgs, RunCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("connection configuration error: {0}")]
    Connection(#[from] BrokerError),
    #[error("invalid request: {0}")]
    Request(#[from] RequestError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("provider error: {0}")]
    Provision(#[from] ProvisionError),
    #[error("session error: {0}")]
    Scope(#[from] ScopeError),
    #[error("teardown error: {0}")]
    Teardown(#[from] TeardownError),
    #[error("no cached node for {0}")]
    NoCachedNode(String),
    #[error("remote command terminated without an exit status")]
    MissingExitCode,
    #[error("invalid command argument: {0}")]
    InvalidCommand(String),
    #[error("failed to render output: {0}")]
    Render(String),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .compact()
        .init();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Run(command) => run_command(command).await,
        Cli::Teardown(args) => teardown_command(&args).await,
        Cli::BootLog(args) => boot_log_command(&args).await,
        Cli::List => list_command(),
    }
}

fn build_request(azure: &AzureConfig, args: &RequestArgs) -> Result<ProvisionRequest, CliError> {
    Ok(azure.request_with(
        args.location.as_deref(),
        args.image.as_deref(),
        args.size.as_deref(),
        args.setup.as_deref(),
        args.networking.as_deref(),
    )?)
}

fn load_session_config() -> Result<SessionConfig, CliError> {
    let session = SessionConfig::load_without_cli_args()?;
    session.validate()?;
    Ok(session)
}

async fn run_command(args: RunCommand) -> Result<i32, CliError> {
    validate_command_args(&args.command)?;
    let remote_command = render_remote_command(&args.command);

    let azure = AzureConfig::load_without_cli_args()?;
    let connection = ConnectionConfig::load_without_cli_args()?;
    let mut session = load_session_config()?;
    if args.keep {
        session.keep_resources = Some(true);
    }
    let request = build_request(&azure, &args.request)?;

    let provisioner = Arc::new(AzureProvisioner::with_process_runner(azure)?);
    let cache = Arc::new(FileCache::new(session.cache_path())?);
    let pool = Arc::new(NodePool::new(
        provisioner,
        cache,
        session.lock_poll_interval(),
    ));
    let broker = Arc::new(
        Broker::with_process_runner(connection)?.with_retry_policy(session.retry_policy()),
    );
    let scope = SessionScope::new(request, session, pool, broker);

    let timeout = args.timeout_secs.map(Duration::from_secs);
    let outcome = match scope.node().await {
        Ok(node) => node.run(&remote_command, timeout).await.map_err(CliError::from),
        Err(err) => Err(CliError::from(err)),
    };
    let closed = scope.close().await;

    let result = outcome?;
    write_result(&result);
    closed?;
    result.exit_code.ok_or(CliError::MissingExitCode)
}

async fn teardown_command(args: &RequestArgs) -> Result<i32, CliError> {
    let azure = AzureConfig::load_without_cli_args()?;
    let session = load_session_config()?;
    let key = build_request(&azure, args)?.key()?;
    let cache = FileCache::new(session.cache_path())?;

    let Some(handle) = cache.lookup(&key)? else {
        writeln!(io::stdout(), "no cached node for {key}").ok();
        return Ok(0);
    };

    let provisioner = AzureProvisioner::with_process_runner(azure)?;
    let outcome = TeardownController::new(provisioner, cache)
        .teardown(&key, &handle, false)
        .await?;
    writeln!(
        io::stdout(),
        "{key}: {} ({outcome:?})",
        handle.resource_group_name
    )
    .ok();
    Ok(0)
}

async fn boot_log_command(args: &RequestArgs) -> Result<i32, CliError> {
    let azure = AzureConfig::load_without_cli_args()?;
    let session = load_session_config()?;
    let key = build_request(&azure, args)?.key()?;
    let cache = FileCache::new(session.cache_path())?;
    let handle = cache
        .lookup(&key)?
        .ok_or_else(|| CliError::NoCachedNode(key.to_string()))?;

    let provisioner = AzureProvisioner::with_process_runner(azure)?;
    let output = provisioner.boot_log(&handle).await?;
    write!(io::stdout(), "{}", output.stdout).ok();
    Ok(0)
}

fn list_command() -> Result<i32, CliError> {
    let session = load_session_config()?;
    let cache = FileCache::new(session.cache_path())?;
    let entries = cache.entries()?;
    let rendered =
        serde_json::to_string_pretty(&entries).map_err(|err| CliError::Render(err.to_string()))?;
    writeln!(io::stdout(), "{rendered}").ok();
    Ok(0)
}

fn write_result(result: &CommandResult) {
    write!(io::stdout(), "{}", result.stdout).ok();
    write!(io::stderr(), "{}", result.stderr).ok();
}

fn render_remote_command(args: &[String]) -> String {
    args.iter()
        .map(|arg| escape(arg.as_str().into()).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn validate_command_args(args: &[String]) -> Result<(), CliError> {
    for arg in args {
        if arg
            .chars()
            .any(|ch| matches!(ch, '\u{0000}'..='\u{001F}' | '\u{007F}'))
        {
            return Err(CliError::InvalidCommand(String::from(concat!(
                "command arguments must not contain control characters (ASCII ",
                "0x00-0x1F or 0x7F, e.g. newline, carriage return, tab, NUL)"
            ))));
        }
    }
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;
