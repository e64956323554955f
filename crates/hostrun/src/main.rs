//! hostrun CLI
//!
//! Runs command sequences on remote hosts over persistent SSH shells

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use eyre::{WrapErr, eyre};
use hostrun_core::{
    ExecService, ExtractRequest, ExtractableCommand, FileCredentialStore, MapExpander,
    OpenSessionRequest, RunFailure, RunRequest, RunResponse, Scheme, SessionRegistry, Target,
};
use hostrun_exec::{ReplayConnector, ReplayScript};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "hostrun")]
#[command(about = "Run command sequences over persistent remote shells", long_about = None)]
struct Cli {
    /// Configuration file (defaults to HOSTRUN_CONFIG or the standard locations)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    /// Template variable expanded in commands as $KEY or ${KEY} (repeatable)
    #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_var, global = true)]
    vars: Vec<(String, String)>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct TargetArgs {
    /// Configured target name or URL (ssh://host[:port]/dir, file:///dir)
    #[arg(short, long)]
    target: String,

    /// Credential reference overriding the configured one
    #[arg(long)]
    credentials: Option<String>,

    /// Serve the session from <DIR>/replay.json instead of connecting
    #[arg(long, value_name = "DIR", conflicts_with = "record")]
    replay: Option<PathBuf>,

    /// Record the session into <DIR>/replay.json
    #[arg(long, value_name = "DIR")]
    record: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run plain commands
    Run {
        #[command(flatten)]
        target: TargetArgs,

        /// Run elevated with sudo
        #[arg(long)]
        sudo: bool,

        /// Per-command timeout in milliseconds
        #[arg(long, default_value_t = 0)]
        timeout_ms: u64,

        /// Commands to run, in order
        #[arg(required = true, last = true)]
        commands: Vec<String>,
    },

    /// Run a sequence with extraction rules read from a JSON file
    Extract {
        #[command(flatten)]
        target: TargetArgs,

        /// Run elevated with sudo
        #[arg(long)]
        sudo: bool,

        /// Sequence file (options and executions)
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Show operating system facts for a target
    Os {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Show the service manager of a target
    Daemon {
        #[command(flatten)]
        target: TargetArgs,
    },
}

impl Commands {
    fn target_args(&self) -> &TargetArgs {
        match self {
            Commands::Run { target, .. }
            | Commands::Extract { target, .. }
            | Commands::Os { target }
            | Commands::Daemon { target } => target,
        }
    }
}

fn parse_var(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got `{raw}`")),
    }
}

fn init_tracing(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn build_service(
    config: &Config,
    target: &Target,
    args: &TargetArgs,
    vars: &[(String, String)],
) -> Result<ExecService> {
    let engine = &config.engine.engine;
    let registry = match &args.replay {
        Some(dir) => {
            let script = ReplayScript::from_dir(dir).wrap_err("failed to load replay script")?;
            let host = target.address()?.host;
            info!(host = %host, dir = %dir.display(), "replaying session");
            let connector = Arc::new(ReplayConnector::new().with_script(host, script));
            SessionRegistry::empty()
                .with_connector(Scheme::Ssh, connector.clone())
                .with_connector(Scheme::Local, connector)
        }
        None => SessionRegistry::new(),
    };
    let expander = MapExpander::new(vars.iter().cloned().collect());
    Ok(ExecService::with_parts(
        engine,
        Arc::new(registry.with_internal_timeout(engine.internal_timeout())),
        Arc::new(FileCredentialStore::new(&engine.secret_dir)),
        Arc::new(expander),
    ))
}

fn print_response(result: std::result::Result<RunResponse, RunFailure>) -> Result<()> {
    match result {
        Ok(response) => {
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
        Err(failure) => {
            println!("{}", serde_json::to_string_pretty(&failure.response)?);
            Err(eyre!(failure.error))
        }
    }
}

async fn dispatch(service: &ExecService, target: Target, command: Commands) -> Result<()> {
    match command {
        Commands::Run {
            sudo,
            timeout_ms,
            commands,
            ..
        } => {
            let mut request = RunRequest::new(target, commands);
            request.superuser = sudo;
            request.timeout_ms = timeout_ms;
            print_response(service.run(&request).await)
        }
        Commands::Extract { sudo, file, .. } => {
            let content = std::fs::read_to_string(&file)
                .wrap_err_with(|| format!("failed to read {}", file.display()))?;
            let sequence: ExtractableCommand = serde_json::from_str(&content)
                .wrap_err_with(|| format!("failed to parse {}", file.display()))?;
            let mut request = ExtractRequest::new(target, sequence);
            request.superuser = sudo;
            print_response(service.extract(&request).await)
        }
        Commands::Os { .. } => {
            let os = service.operating_system(&target).await?;
            println!("{}", serde_json::to_string_pretty(&os)?);
            Ok(())
        }
        Commands::Daemon { .. } => {
            let daemon = service.daemon_type(&target).await?;
            println!("{daemon}");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    init_tracing(&config.engine.log_level, cli.json_logs);

    let args = cli.command.target_args();
    let target = config.target(&args.target, args.credentials.clone());
    let service = build_service(&config, &target, args, &cli.vars)?;

    if let Some(dir) = &args.record {
        std::fs::create_dir_all(dir)?;
        let request = OpenSessionRequest::new(target.clone()).with_basedir(dir);
        let opened = service.open(&request).await?;
        debug!(session = %opened.session_id, "recording session opened");
    }

    let result = dispatch(&service, target, cli.command).await;
    service.teardown().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_var() {
        assert_eq!(
            parse_var("GOPATH=/go=x").unwrap(),
            ("GOPATH".to_string(), "/go=x".to_string())
        );
        assert_eq!(parse_var("EMPTY=").unwrap(), ("EMPTY".to_string(), String::new()));
        assert!(parse_var("novalue").is_err());
        assert!(parse_var("=x").is_err());
    }

    #[test]
    fn test_vars_flag_collects_pairs() {
        let cli = Cli::try_parse_from([
            "hostrun",
            "--var",
            "app=billing",
            "--var",
            "env=prod",
            "run",
            "--target",
            "ssh://web",
            "--",
            "echo $app",
        ])
        .unwrap();
        assert_eq!(
            cli.vars,
            vec![
                ("app".to_string(), "billing".to_string()),
                ("env".to_string(), "prod".to_string()),
            ]
        );
    }
}
