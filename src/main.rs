use std::{env, path::Path, process::ExitCode};

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand, command};
use sqconn::Connection;
use tracing_subscriber::{EnvFilter, fmt::format::FmtSpan};

use crate::config::Config;

mod config;

#[derive(Debug, Parser)]
struct ExecOpts {
    /// The SQL batch to execute.
    #[arg(trailing_var_arg = true, required = true)]
    sql: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Opens the data source and reports on it.
    #[command(alias = "p")]
    Probe,

    /// Executes a batch of statements.
    #[command(alias = "e")]
    Exec(ExecOpts),

    /// Runs an integrity check.
    #[command(alias = "c")]
    Check,

    /// Lists the configured profiles.
    Profiles,
}

/// sqconn - SQLite connection probe
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Opts {
    /// Name of the connection profile to load.
    profile: Option<String>,

    /// Connection string to use instead of a profile.
    #[arg(short, long, global = true)]
    connection_string: Option<String>,

    #[command(subcommand)]
    command: Command,

    /// Enable debug output.
    #[arg(short, global = true, action = clap::ArgAction::Count)]
    debug: u8,
}

fn connection_string(config: &Config, opts: &Opts) -> anyhow::Result<String> {
    if let Some(raw) = &opts.connection_string {
        return Ok(raw.clone());
    }

    let profile = config.profile(opts.profile.as_deref().unwrap_or("default"))?;
    Ok(profile.connection_string.clone())
}

#[tracing::instrument(skip_all, err)]
fn probe(raw: String) -> anyhow::Result<()> {
    let mut conn = Connection::with_connection_string(raw);
    conn.scoped(|conn| {
        println!("data source: {}", conn.data_source().unwrap_or_default());
        println!("engine:      SQLite {}", conn.server_version());
        println!("state:       {}", conn.state());
        Ok(())
    })?;
    println!("closed:      {}", conn.state());
    Ok(())
}

#[tracing::instrument(skip_all, err)]
fn exec(raw: String, exec_opts: &ExecOpts) -> anyhow::Result<()> {
    let sql = exec_opts.sql.join(" ");
    let mut conn = Connection::with_connection_string(raw);
    let in_transaction = conn
        .scoped(|conn| {
            conn.execute_batch(&sql)?;
            Ok(conn.in_transaction())
        })
        .context("batch failed")?;

    if in_transaction {
        tracing::warn!("batch left a transaction open; it was rolled back on close");
    }
    println!("ok");
    Ok(())
}

#[tracing::instrument(skip_all, err)]
fn check(raw: String) -> anyhow::Result<()> {
    let mut conn = Connection::with_connection_string(raw);
    let report = conn.scoped(|conn| conn.check_integrity())?;
    println!("{}", report);
    if report != "ok" {
        return Err(anyhow!("integrity check failed"));
    }
    Ok(())
}

fn profiles(config: &Config) {
    for profile in config.profiles.values() {
        println!("{}\t{}", profile.name, profile.connection_string);
    }
}

fn run(opts: Opts) -> anyhow::Result<()> {
    let cfg = config::load().context("unable to load configuration")?;

    match &opts.command {
        Command::Probe => probe(connection_string(&cfg, &opts)?)?,
        Command::Exec(exec_opts) => exec(connection_string(&cfg, &opts)?, exec_opts)?,
        Command::Check => check(connection_string(&cfg, &opts)?)?,
        Command::Profiles => profiles(&cfg),
    }

    Ok(())
}

/// Installs the log subscriber. Each `-d` raises the crate's verbosity; without one, `SQCONN_LOG`
/// may hold a filter directive.
fn init_tracing(debug: u8) -> anyhow::Result<()> {
    let filter = match debug {
        0 => match env::var("SQCONN_LOG") {
            Ok(directive) => EnvFilter::try_new(directive)?,
            Err(_) => return Ok(()),
        },
        1 => EnvFilter::new("sqconn=debug"),
        _ => EnvFilter::new("sqconn=trace"),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow!("{}", err))
}

fn main() -> ExitCode {
    let proc_name = env::args()
        .next()
        .as_deref()
        .map(Path::new)
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| String::from("sqconn"));
    let opts = Opts::parse();

    if let Err(err) = init_tracing(opts.debug) {
        eprintln!("{}: logging disabled: {:#}", proc_name, err);
    }

    match run(opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}: {:#}", proc_name, err);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;
    use test_log::test;

    #[test]
    fn test_cli_definition() {
        Opts::command().debug_assert();
    }

    #[test]
    fn test_connection_string_resolution() {
        let config = Config::default();

        let opts = Opts::try_parse_from(["sqconn", "-c", "Data Source=x.db", "probe"]).unwrap();
        assert_eq!("Data Source=x.db", connection_string(&config, &opts).unwrap());

        let opts = Opts::try_parse_from(["sqconn", "probe"]).unwrap();
        assert_eq!("Data Source=:memory:", connection_string(&config, &opts).unwrap());

        let opts = Opts::try_parse_from(["sqconn", "missing", "check"]).unwrap();
        assert!(connection_string(&config, &opts).is_err());

        let opts = Opts::try_parse_from(["sqconn", "missing", "-c", "Data Source=y.db", "c"]).unwrap();
        assert!(matches!(opts.command, Command::Check));
        assert_eq!("Data Source=y.db", connection_string(&config, &opts).unwrap());
    }

    #[test]
    fn test_debug_count() {
        let opts = Opts::try_parse_from(["sqconn", "-dd", "profiles"]).unwrap();
        assert_eq!(2, opts.debug);
    }
}
