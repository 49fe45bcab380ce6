use anyhow::{bail, Context};
use clap::{Arg, ArgAction, Command};
use ide_prober::cancellation::CancellationToken;
use ide_prober::constants::LOG_ENV_VAR;
use ide_prober::languages::LanguageRegistry;
use ide_prober::runner::discover_fixtures;
use ide_prober::{ConfigManager, ProcessLauncher, Runner};
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("ide-prober")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Runs annotated IDE probe fixtures against a language server")
        .arg_required_else_help(true)
        .arg(
            Arg::new("fixtures")
                .help("Fixture files, directories or glob patterns")
                .required(true)
                .num_args(1..)
                .index(1),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .help("Config file (defaults to ./prober.toml when present)"),
        )
        .arg(
            Arg::new("format")
                .long("format")
                .short('f')
                .help("Report format")
                .value_parser(["text", "json"])
                .default_value("text"),
        )
        .arg(
            Arg::new("jobs")
                .long("jobs")
                .short('j')
                .help("Fixtures run in parallel (0 = one per CPU)")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("backend")
                .long("backend")
                .help("Language server executable"),
        )
        .arg(
            Arg::new("backend-arg")
                .long("backend-arg")
                .help("Extra argument for the language server (repeatable)")
                .action(ArgAction::Append)
                .allow_hyphen_values(true),
        )
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("ide_prober=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

async fn run() -> anyhow::Result<u8> {
    let matches = cli().get_matches();

    let mut overrides = json!({});
    if let Some(command) = matches.get_one::<String>("backend") {
        overrides["backend"]["command"] = json!(command);
    }
    if let Some(args) = matches.get_many::<String>("backend-arg") {
        overrides["backend"]["args"] = json!(args.collect::<Vec<_>>());
    }
    if let Some(jobs) = matches.get_one::<usize>("jobs") {
        overrides["run"]["jobs"] = json!(jobs);
    }

    let mut config_manager = ConfigManager::new();
    config_manager.set_overrides(overrides);
    let config = match matches.get_one::<String>("config") {
        Some(path) => config_manager.load_from_file(&PathBuf::from(path)),
        None => {
            let cwd = std::env::current_dir().context("Cannot determine the current directory")?;
            config_manager.load_from_dir(&cwd)
        }
    }
    .map_err(anyhow::Error::msg)
    .context("Failed to load configuration")?;

    let inputs: Vec<String> = matches
        .get_many::<String>("fixtures")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();
    let fixtures = discover_fixtures(&inputs, &LanguageRegistry::new()).map_err(anyhow::Error::msg)?;
    if fixtures.is_empty() {
        bail!("No fixtures found");
    }

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_token.cancel();
        }
    });

    let config = Arc::new(config);
    let launcher = Arc::new(ProcessLauncher::new(Arc::clone(&config)));
    let report = Runner::new(config, launcher, token).run(fixtures).await;

    match matches.get_one::<String>("format").map(String::as_str) {
        Some("json") => println!("{}", report.to_json().context("Failed to serialize report")?),
        _ => print!("{}", report.render_text()),
    }
    Ok(report.exit_code())
}
