//! Purpose: `pollflag` CLI entry point.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Commands emit one JSON document (or JSON lines for `watch`) on stdout.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: Local commands share the same file flag store as `pollflag serve`.
#![allow(clippy::result_large_err)]
use std::ffi::OsString;
use std::io::{self, IsTerminal};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::{
    Args, CommandFactory, Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind,
};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use std::error::Error as StdError;

mod command_dispatch;
mod serve;
mod store_paths;
mod watch;

use pollflag::api::{
    DEFAULT_FLAG_TTL, Error, ErrorKind, FileFlagStore, NEW_ORDER_CHANNEL, Notifier, RemoteClient,
    WaitOptions, to_exit_code,
};
use pollflag::notice::CheckFailed;
use store_paths::default_store_dir;

const DEFAULT_BIND: &str = "127.0.0.1:9711";
const DEFAULT_FLAG_TTL_SECS: u64 = DEFAULT_FLAG_TTL.as_secs();
const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 15;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 1;
const DEFAULT_MAX_WAIT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_MAX_CONCURRENT_WAITS: usize = 256;
const DEFAULT_WATCH_RETRY_DELAY_MS: u64 = 1000;

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse_from(std::env::args_os().collect::<Vec<OsString>>()) {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint(clap_error_hint(&err)));
            }
        },
    };

    let store_dir = cli.dir.unwrap_or_else(default_store_dir);

    command_dispatch::dispatch_command(cli.command, store_dir)
        .map_err(add_io_hint)
        .map_err(add_internal_hint)
}

#[derive(Parser)]
#[command(
    name = "pollflag",
    version,
    about = "Bounded long-poll change notifications",
    long_about = r#"Signal and await per-channel pending flags shared across processes.

A signal sets a flag with a time-to-live; a wait consumes it (clear-on-read) or
times out. `pollflag serve` exposes the same operations over HTTP, including the
new-order long-poll endpoint used by order dashboards."#,
    after_help = r#"EXAMPLES
  $ pollflag serve
  $ pollflag signal new_order_notification
  $ pollflag wait new_order_notification --timeout-secs 15
  $ pollflag watch http://127.0.0.1:9711

  $ pollflag <command> --help"#,
    arg_required_else_help = true,
    disable_help_subcommand = false
)]
struct Cli {
    #[arg(
        long,
        help = "Flag store directory (default: ~/.pollflag/flags)",
        value_hint = ValueHint::DirPath
    )]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(
        about = "Serve long-poll notifications over HTTP (loopback default)",
        after_help = r#"EXAMPLES
  $ pollflag serve
  $ pollflag serve --bind 127.0.0.1:9712 --token devtoken
  $ pollflag serve --cors-origin https://shop.example.com
  $ pollflag serve check
  $ pollflag serve --bind 0.0.0.0:9711 --allow-non-loopback --token-file token check

NOTES
  - GET /v1/check-new-orders-for-notification long-polls the new-order channel
  - POST /v1/orders/created signals the new-order channel
  - Use Authorization: Bearer <token> when --token or --token-file is set
  - Non-loopback binds require --allow-non-loopback and --token-file"#
    )]
    Serve {
        #[command(subcommand)]
        subcommand: Option<ServeSubcommand>,
        #[command(flatten)]
        run: ServeRunArgs,
    },
    #[command(
        arg_required_else_help = true,
        about = "Mark a channel as pending (renews the TTL if already set)",
        after_help = r#"EXAMPLES
  $ pollflag signal new_order_notification
  $ pollflag signal refunds --ttl-secs 60"#
    )]
    Signal {
        #[arg(help = "Channel name")]
        channel: String,
        #[arg(long, default_value_t = DEFAULT_FLAG_TTL_SECS, help = "Seconds before an unobserved signal expires")]
        ttl_secs: u64,
    },
    #[command(
        arg_required_else_help = true,
        about = "Wait for a channel signal, consuming it, or time out",
        after_help = r#"EXAMPLES
  $ pollflag wait new_order_notification
  $ pollflag wait refunds --timeout-secs 3 --interval-secs 1"#
    )]
    Wait {
        #[arg(help = "Channel name")]
        channel: String,
        #[arg(long, default_value_t = DEFAULT_WAIT_TIMEOUT_SECS, help = "Give up after this many seconds")]
        timeout_secs: u64,
        #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL_SECS, help = "Seconds between checks")]
        interval_secs: u64,
    },
    #[command(
        arg_required_else_help = true,
        about = "Report whether a channel is pending without consuming it"
    )]
    Peek {
        #[arg(help = "Channel name")]
        channel: String,
    },
    #[command(
        arg_required_else_help = true,
        about = "Drop a pending signal without reporting it"
    )]
    Clear {
        #[arg(help = "Channel name")]
        channel: String,
    },
    #[command(
        arg_required_else_help = true,
        about = "Repeatedly long-poll a server's new-order endpoint",
        long_about = r#"Repeatedly long-poll a server's new-order endpoint.

Prints one JSON line per notification. Failed checks emit a notice on stderr
and the loop continues after a short delay."#,
        after_help = r#"EXAMPLES
  $ pollflag watch http://127.0.0.1:9711
  $ pollflag watch https://shop.example.com:9711 --token-file ~/.pollflag/token"#
    )]
    Watch {
        #[arg(help = "Server base URL (http(s)://host:port)")]
        url: String,
        #[arg(long, help = "Bearer token (dev-only; prefer --token-file)")]
        token: Option<String>,
        #[arg(long, value_name = "PATH", help = "Read bearer token from file", value_hint = ValueHint::FilePath)]
        token_file: Option<PathBuf>,
        #[arg(long, help = "Stop after this many checks (default: run forever)")]
        max_checks: Option<u64>,
        #[arg(long, default_value_t = DEFAULT_WATCH_RETRY_DELAY_MS, help = "Delay after a failed check in milliseconds")]
        retry_delay_ms: u64,
    },
    #[command(
        arg_required_else_help = true,
        about = "Generate shell completion scripts"
    )]
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
    #[command(about = "Print version info")]
    Version,
}

#[derive(Subcommand)]
enum ServeSubcommand {
    #[command(about = "Validate serve config and print effective endpoints without starting")]
    Check,
}

#[derive(Args)]
struct ServeRunArgs {
    #[arg(long, default_value = DEFAULT_BIND, help = "Bind address", help_heading = "Connection")]
    bind: String,
    #[arg(
        long = "cors-origin",
        value_name = "ORIGIN",
        help = "Allow browser requests from this origin (repeatable)",
        help_heading = "Connection"
    )]
    cors_origin: Vec<String>,
    #[arg(
        long,
        help = "Bearer token for auth (dev-only; prefer --token-file)",
        help_heading = "Authentication"
    )]
    token: Option<String>,
    #[arg(long, value_name = "PATH", help = "Read bearer token from file", value_hint = ValueHint::FilePath, help_heading = "Authentication")]
    token_file: Option<PathBuf>,
    #[arg(
        long,
        help = "Allow non-loopback binds (requires --token-file)",
        help_heading = "Safety"
    )]
    allow_non_loopback: bool,
    #[arg(
        long,
        default_value_t = DEFAULT_FLAG_TTL_SECS,
        help = "Seconds before an unobserved signal expires",
        help_heading = "Timing"
    )]
    flag_ttl_secs: u64,
    #[arg(
        long,
        default_value_t = DEFAULT_WAIT_TIMEOUT_SECS,
        help = "Default long-poll timeout in seconds",
        help_heading = "Timing"
    )]
    wait_timeout_secs: u64,
    #[arg(
        long,
        default_value_t = DEFAULT_POLL_INTERVAL_SECS,
        help = "Seconds between flag checks during a wait",
        help_heading = "Timing"
    )]
    poll_interval_secs: u64,
    #[arg(
        long,
        default_value_t = DEFAULT_MAX_WAIT_TIMEOUT_SECS,
        help = "Largest timeout a client may request",
        help_heading = "Safety"
    )]
    max_wait_timeout_secs: u64,
    #[arg(
        long,
        default_value_t = DEFAULT_MAX_CONCURRENT_WAITS,
        help = "Max concurrent open waits",
        help_heading = "Safety"
    )]
    max_concurrent_waits: usize,
}

fn local_notifier(store_dir: &Path) -> Notifier {
    Notifier::new(Arc::new(FileFlagStore::new(store_dir)))
}

fn serve_config_from_run_args(
    run: ServeRunArgs,
    store_dir: &Path,
) -> Result<serve::ServeConfig, Error> {
    let bind: SocketAddr = run.bind.parse().map_err(|_| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid bind address")
            .with_hint("Use a host:port value like 127.0.0.1:9711.")
    })?;
    let token_file_used = run.token_file.is_some();
    let token = resolve_token_value(run.token, run.token_file)?;
    Ok(serve::ServeConfig {
        bind,
        store_dir: store_dir.to_path_buf(),
        token,
        token_file_used,
        allow_non_loopback: run.allow_non_loopback,
        cors_origins: run.cors_origin,
        flag_ttl_secs: run.flag_ttl_secs,
        wait_timeout_secs: run.wait_timeout_secs,
        poll_interval_secs: run.poll_interval_secs,
        max_wait_timeout_secs: run.max_wait_timeout_secs,
        max_concurrent_waits: run.max_concurrent_waits,
    })
}

fn emit_serve_check_report(config: &serve::ServeConfig) {
    let base_url = format!("http://{}", config.bind);
    let auth_mode = match (&config.token, config.token_file_used) {
        (Some(_), true) => "bearer token (--token-file)",
        (Some(_), false) => "bearer token (--token)",
        (None, _) => "none",
    };
    emit_json(json!({
        "check": {
            "status": "valid",
            "listen": config.bind.to_string(),
            "store_dir": config.store_dir.display().to_string(),
            "endpoints": {
                "new_orders": format!("{base_url}/v1/check-new-orders-for-notification"),
                "order_created": format!("{base_url}/v1/orders/created"),
                "channel": format!("{base_url}/v1/channels/<channel>"),
            },
            "auth": auth_mode,
            "cors_allowed_origins": config.cors_origins,
            "timing": {
                "flag_ttl_secs": config.flag_ttl_secs,
                "wait_timeout_secs": config.wait_timeout_secs,
                "poll_interval_secs": config.poll_interval_secs,
            },
            "limits": {
                "max_wait_timeout_secs": config.max_wait_timeout_secs,
                "max_concurrent_waits": config.max_concurrent_waits,
            }
        }
    }));
}

fn read_token_file(path: &Path) -> Result<String, Error> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("failed to read token file")
            .with_path(path)
            .with_source(err)
    })?;
    let token = raw.trim().to_string();
    if token.is_empty() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("token file is empty")
            .with_path(path));
    }
    Ok(token)
}

fn resolve_token_value(
    token: Option<String>,
    token_file: Option<PathBuf>,
) -> Result<Option<String>, Error> {
    if token.is_some() && token_file.is_some() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--token cannot be combined with --token-file")
            .with_hint("Use --token-file for safer handling, or pass --token for local/dev use."));
    }
    if let Some(path) = token_file {
        return read_token_file(&path).map(Some);
    }
    Ok(token)
}

fn current_thread_runtime() -> Result<tokio::runtime::Runtime, Error> {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to start runtime")
                .with_source(err)
        })
}

fn add_io_hint(err: Error) -> Error {
    if err.hint().is_some() {
        return err;
    }
    match err.kind() {
        ErrorKind::Permission => err.with_hint(
            "Permission denied. Check directory permissions or use --dir to a writable location.",
        ),
        ErrorKind::Busy => err.with_hint("The flag store or server is busy. Retry with backoff."),
        ErrorKind::Io => err.with_hint("I/O error. Check the store directory or server address."),
        ErrorKind::Corrupt => err.with_hint(
            "A flag record is unreadable. Run `pollflag clear <channel>` or delete the .flag file.",
        ),
        _ => err,
    }
}

fn add_internal_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Internal || err.hint().is_some() {
        return err;
    }
    err.with_hint(
        "Unexpected internal failure. Retry with RUST_BACKTRACE=1 and share command/context if it persists.",
    )
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_json_line(value: Value) {
    let json = serde_json::to_string(&value)
        .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn time_now_rfc3339() -> Option<String> {
    use time::format_description::well_known::Rfc3339;
    let duration = SystemTime::now().duration_since(UNIX_EPOCH).ok()?;
    let ts = time::OffsetDateTime::from_unix_timestamp_nanos(duration.as_nanos() as i128).ok()?;
    ts.format(&Rfc3339).ok()
}

fn emit_notice(notice: &CheckFailed) {
    if io::stderr().is_terminal() {
        eprintln!("notice: {} (channel: {})", notice.message, notice.channel);
        return;
    }

    let value = notice.to_json();
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"notice\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::Busy => "busy".to_string(),
        ErrorKind::Permission => "permission denied".to_string(),
        ErrorKind::Corrupt => "corrupt flag record".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(channel) = err.channel() {
        inner.insert("channel".to_string(), json!(channel));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    if let Some(channel) = err.channel() {
        lines.push(format!("channel: {channel}"));
    }
    if let Some(path) = err.path() {
        lines.push(format!("path: {}", path.display()));
    }
    if let Some(cause) = error_causes(err).first() {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

fn clap_error_hint(err: &clap::Error) -> String {
    let rendered = err.to_string();
    let usage = rendered
        .lines()
        .find_map(|line| line.trim().strip_prefix("Usage: "))
        .map(str::trim);
    let Some(usage) = usage else {
        return "Try `pollflag --help`.".to_string();
    };

    let tokens: Vec<&str> = usage.split_whitespace().collect();
    let Some(pos) = tokens.iter().position(|t| *t == "pollflag") else {
        return "Try `pollflag --help`.".to_string();
    };
    let parts: Vec<&str> = tokens
        .iter()
        .skip(pos + 1)
        .take_while(|token| {
            !(token.starts_with('-') || token.starts_with('<') || token.starts_with('['))
        })
        .copied()
        .collect();
    if parts.is_empty() {
        return "Try `pollflag --help`.".to_string();
    }
    format!("Try `pollflag {} --help`.", parts.join(" "))
}
