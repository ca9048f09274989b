// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! gmp-diag entry point - inspect configuration and run instrumented statements.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use tokio_util::sync::CancellationToken;

use gmp_diag::config::{self, keys, ConfigSnapshot};
use gmp_diag::db::{self, parse_data_source, signature_of, BuildProfile, SqlParam};
use gmp_diag::telemetry::{init_logging, redact_connection_string, ExceptionInfo, LoggingConfig};
use gmp_diag::{DiagnosticContext, Diagnostics, Result, VERSION};

/// gmp-diag - diagnostics and write verification for GMP applications.
#[derive(Parser)]
#[command(name = "gmp-diag")]
#[command(author, version, about = "Diagnostics and write verification", long_about = None)]
struct Cli {
    /// Configuration file to use instead of the default search locations
    #[arg(short, long, env = "GMP_DIAG_CONFIG")]
    config: Option<PathBuf>,

    /// Show debug output from the tool itself
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Subcommands for gmp-diag.
#[derive(Subcommand)]
enum Commands {
    /// Show resolved diagnostics settings
    Config {
        /// Print as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Mask credentials in a connection string
    Redact {
        /// Connection string to redact
        text: String,
    },

    /// Print the normalized signature of a statement
    Signature {
        /// Statement text
        sql: String,
    },

    /// Run a statement through the instrumented gateway
    Exec {
        /// Database file or connection string
        #[arg(long)]
        db: String,

        /// Shadow database to replay writes against
        #[arg(long)]
        shadow: Option<PathBuf>,

        /// Verify a table after writes, as `table=pk_column`
        #[arg(long = "verify", value_name = "TABLE=PK")]
        verify: Vec<String>,

        /// Statement text
        #[arg(long)]
        sql: String,

        /// Bound parameter, as `@name=value`
        #[arg(short, long = "param", value_name = "@NAME=VALUE")]
        params: Vec<String>,

        /// How to run the statement; inferred from its verb when omitted
        #[arg(long, value_enum)]
        mode: Option<ExecMode>,

        /// Build profile for sampling and shadow replay
        #[arg(long, value_enum)]
        profile: Option<Profile>,
    },

    /// Run the database self-tests
    Selftest {
        /// Database file or connection string
        #[arg(long)]
        db: String,
    },

    /// Write a crash bundle without crashing
    Bundle {
        /// Reason recorded in the bundle
        #[arg(long, default_value = "manual")]
        reason: String,
    },

    /// Show version information
    Version,
}

/// How `exec` runs its statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ExecMode {
    NonQuery,
    Scalar,
    Select,
}

impl ExecMode {
    fn infer(sql: &str) -> Self {
        match db::shadow::sql_verb(sql).as_str() {
            "select" | "with" | "pragma" | "explain" | "values" => Self::Select,
            _ => Self::NonQuery,
        }
    }
}

/// Build profile override for `exec`.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Profile {
    Development,
    Release,
}

impl From<Profile> for BuildProfile {
    fn from(profile: Profile) -> Self {
        match profile {
            Profile::Development => BuildProfile::Development,
            Profile::Release => BuildProfile::Release,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let logging = if cli.debug {
        LoggingConfig::verbose()
    } else {
        LoggingConfig::default()
    };
    let _guard = init_logging(&logging)?;

    let snapshot = match &cli.config {
        Some(path) => config::load_config_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => config::load_config()?,
    };

    match cli.command {
        Commands::Config { json } => show_config(snapshot, json)?,
        Commands::Redact { text } => println!("{}", redact_connection_string(&text)),
        Commands::Signature { sql } => println!("{}", signature_of(&sql)),
        Commands::Exec {
            db,
            shadow,
            verify,
            sql,
            params,
            mode,
            profile,
        } => {
            let request = ExecRequest {
                db,
                shadow,
                verify,
                sql,
                params,
                mode,
                profile: profile.map(Into::into).unwrap_or_else(BuildProfile::current),
            };
            run_exec(snapshot, request).await?;
        }
        Commands::Selftest { db } => run_self_test(snapshot, &db).await?,
        Commands::Bundle { reason } => write_bundle(snapshot, &reason).await?,
        Commands::Version => {
            println!("gmp-diag {}", VERSION);
            println!("build profile: {:?}", BuildProfile::current());
        }
    }
    Ok(())
}

fn show_config(snapshot: ConfigSnapshot, json: bool) -> Result<()> {
    let sources: Vec<String> = snapshot
        .sources()
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    let ctx = DiagnosticContext::from_process(snapshot);
    let remote = ctx.remote_settings();
    let remote_url = remote.url.as_deref().map(redact_connection_string);

    if json {
        let info = serde_json::json!({
            "sources": sources,
            "enabled": ctx.enabled(),
            "level": ctx.min_level(),
            "sinks": ctx.sinks(),
            "redactionEnabled": ctx.redaction_enabled(),
            "slowQueryMs": ctx.slow_query_ms(),
            "rollingMaxMb": ctx.rolling_max_mb(),
            "rollingMaxDays": ctx.rolling_max_days(),
            "topNRelease": ctx.top_n_release(),
            "randomPercentRelease": ctx.random_percent_release(),
            "queue": {
                "capacity": ctx.queue_capacity(),
                "drainBatch": ctx.queue_drain_batch(),
                "drainIntervalMs": ctx.queue_drain_interval_ms(),
            },
            "logDirectory": ctx.log_directory(),
            "crashDirectory": ctx.crash_directory(),
            "selfTestOnOpen": ctx.self_test_on_open(),
            "shadow": {
                "path": ctx.shadow_path(),
                "verifyTables": ctx.shadow_verify_tables(),
            },
            "remote": {
                "url": remote_url,
                "index": remote.index,
                "apiKey": remote.api_key.is_some(),
                "bearerToken": remote.bearer_token.is_some(),
                "headers": remote.headers.keys().collect::<Vec<_>>(),
            },
        });
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("{}", "Diagnostics configuration".bright_blue().bold());
    if sources.is_empty() {
        println!("Sources: {}", "defaults only".dimmed());
    } else {
        for source in &sources {
            println!("Source: {}", source.bright_white());
        }
    }
    println!("Enabled: {}", ctx.enabled());
    println!("Level: {}", ctx.min_level().as_str().bright_magenta());
    println!("Sinks: {}", ctx.sinks().join(", "));
    println!("Redaction: {}", ctx.redaction_enabled());
    println!("Slow query threshold: {} ms", ctx.slow_query_ms());
    println!(
        "Release sampling: top {} / {}%",
        ctx.top_n_release(),
        ctx.random_percent_release()
    );
    println!(
        "Queue: capacity {}, batch {}, every {} ms",
        ctx.queue_capacity(),
        ctx.queue_drain_batch(),
        ctx.queue_drain_interval_ms()
    );
    println!("Log directory: {}", ctx.log_directory().display());
    println!("Crash directory: {}", ctx.crash_directory().display());
    match ctx.shadow_path() {
        Some(path) => {
            println!("Shadow: {}", path.display().to_string().bright_yellow());
            for (table, pk) in ctx.shadow_verify_tables() {
                println!("  verify {}.{}", table, pk);
            }
        }
        None => println!("Shadow: {}", "disabled".dimmed()),
    }
    if let Some(url) = remote_url {
        println!("Remote: {}", url.bright_blue());
    }
    println!(
        "\n{}",
        format!("Override any key with {}", keys::env_var_name("Diagnostics:<Key>")).dimmed()
    );
    Ok(())
}

struct ExecRequest {
    db: String,
    shadow: Option<PathBuf>,
    verify: Vec<String>,
    sql: String,
    params: Vec<String>,
    mode: Option<ExecMode>,
    profile: BuildProfile,
}

async fn run_exec(mut snapshot: ConfigSnapshot, request: ExecRequest) -> Result<()> {
    let Some(path) = parse_data_source(&request.db) else {
        bail!("No database path in {}", redact_connection_string(&request.db));
    };

    let mut params = Vec::with_capacity(request.params.len());
    for raw in &request.params {
        match SqlParam::parse(raw) {
            Some(param) => params.push(param),
            None => bail!("Invalid parameter {raw:?}, expected @name=value"),
        }
    }

    if let Some(shadow) = &request.shadow {
        snapshot.set(keys::KEY_SHADOW_ENABLED, "true");
        snapshot.set(keys::KEY_SHADOW_PATH, shadow.display().to_string());
    }
    for entry in &request.verify {
        let Some((table, pk)) = entry.split_once('=') else {
            bail!("Invalid --verify {entry:?}, expected table=pk");
        };
        snapshot.set(format!("{}{}", keys::KEY_SHADOW_VERIFY_TABLES, table.trim()), pk.trim());
    }

    let diagnostics = Diagnostics::start_with_profile(snapshot, request.profile);
    diagnostics.register_crash_handler();
    let result = exec_statement(&diagnostics, &path, &request, params).await;
    diagnostics.shutdown().await;
    result
}

async fn exec_statement(
    diagnostics: &Diagnostics,
    path: &std::path::Path,
    request: &ExecRequest,
    params: Vec<SqlParam>,
) -> Result<()> {
    let cancel = cancel_on_ctrl_c();
    let database = diagnostics.connect(path, &cancel).await?;

    let sql = request.sql.as_str();
    match request.mode.unwrap_or_else(|| ExecMode::infer(sql)) {
        ExecMode::Select => {
            let table = database.execute_select(sql, params, &cancel).await?;
            println!("{}", serde_json::to_string_pretty(&table.to_json())?);
        }
        ExecMode::Scalar => {
            let value = database.execute_scalar(sql, params, &cancel).await?;
            let json = value.as_ref().map(db::value_to_json);
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        ExecMode::NonQuery => {
            let outcome = database.execute_write(sql, params, &cancel).await?;
            println!("{} {} row(s) affected", "✓".green(), outcome.rows);
            if let Some(handle) = outcome.shadow {
                let report = handle.await?;
                let status = if report.rows_match() == Some(true) {
                    "match".green()
                } else {
                    "mismatch".red()
                };
                println!(
                    "Shadow: {} (primary={}, shadow={})",
                    status,
                    report.primary_rows,
                    report
                        .shadow_rows
                        .map(|n| n.to_string())
                        .unwrap_or_else(|| "error".to_string())
                );
                println!("Verification: {:?}", report.verification);
            }
        }
    }
    Ok(())
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });
    cancel
}

async fn run_self_test(snapshot: ConfigSnapshot, source: &str) -> Result<()> {
    let Some(path) = parse_data_source(source) else {
        bail!("No database path in {}", redact_connection_string(source));
    };
    let diagnostics = Diagnostics::start(snapshot);
    let cancel = cancel_on_ctrl_c();
    let report = match diagnostics.open_database(&path) {
        Ok(database) => Ok(diagnostics.self_test(&database, &cancel).await),
        Err(e) => Err(e),
    };
    diagnostics.shutdown().await;
    let report = report?;

    for check in &report.checks {
        let mark = if check.passed { "✓".green() } else { "✗".red() };
        println!("{} {}: {}", mark, check.name, check.detail);
    }
    if report.cancelled {
        bail!("Self-tests cancelled");
    }
    if !report.is_ok() {
        bail!("{} self-test(s) failed", report.failed());
    }
    println!("{} {} checks passed", "✓".green(), report.passed());
    Ok(())
}

async fn write_bundle(snapshot: ConfigSnapshot, reason: &str) -> Result<()> {
    let diagnostics = Diagnostics::start(snapshot);
    let exception = ExceptionInfo::new("ManualBundle", reason);
    let result = diagnostics.crash_handler().report(reason, &exception);
    diagnostics.shutdown().await;
    let path = result?;
    println!("{} {}", "Crash bundle written:".green(), path.display());
    Ok(())
}
