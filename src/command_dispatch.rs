//! Purpose: Hold top-level CLI command dispatch for `pollflag`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: A wait that times out is a successful command (`"signaled": false`).
//! Invariants: Helpers in `main.rs` remain the source of output and error formatting.

use super::*;

pub(super) fn dispatch_command(command: Command, store_dir: PathBuf) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "pollflag", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Version => {
            emit_version_output();
            Ok(RunOutcome::ok())
        }
        Command::Serve { subcommand, run } => match subcommand {
            Some(ServeSubcommand::Check) => {
                let config = serve_config_from_run_args(run, &store_dir)?;
                serve::preflight_config(&config)?;
                emit_serve_check_report(&config);
                Ok(RunOutcome::ok())
            }
            None => {
                let config = serve_config_from_run_args(run, &store_dir)?;
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .enable_all()
                    .build()
                    .map_err(|err| {
                        Error::new(ErrorKind::Internal)
                            .with_message("failed to start runtime")
                            .with_source(err)
                    })?;
                runtime.block_on(serve::serve(config))?;
                Ok(RunOutcome::ok())
            }
        },
        Command::Signal { channel, ttl_secs } => {
            if ttl_secs == 0 {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("--ttl-secs must be positive")
                    .with_channel(&channel));
            }
            local_notifier(&store_dir)
                .with_ttl(Duration::from_secs(ttl_secs))
                .signal(&channel)?;
            emit_json(json!({ "channel": channel, "signaled": true }));
            Ok(RunOutcome::ok())
        }
        Command::Wait {
            channel,
            timeout_secs,
            interval_secs,
        } => {
            let notifier = local_notifier(&store_dir);
            let options = WaitOptions::from_secs(timeout_secs, interval_secs);
            let runtime = current_thread_runtime()?;
            let outcome = runtime.block_on(notifier.await_signal(&channel, options))?;
            emit_json(json!({ "channel": channel, "signaled": outcome.is_signaled() }));
            Ok(RunOutcome::ok())
        }
        Command::Peek { channel } => {
            let pending = local_notifier(&store_dir).pending(&channel)?;
            emit_json(json!({ "channel": channel, "pending": pending }));
            Ok(RunOutcome::ok())
        }
        Command::Clear { channel } => {
            local_notifier(&store_dir).clear(&channel)?;
            emit_json(json!({ "channel": channel, "cleared": true }));
            Ok(RunOutcome::ok())
        }
        Command::Watch {
            url,
            token,
            token_file,
            max_checks,
            retry_delay_ms,
        } => {
            let mut client = RemoteClient::new(url)?;
            if let Some(token) = resolve_token_value(token, token_file)? {
                client = client.with_token(token);
            }
            let config = watch::WatchConfig {
                max_checks,
                retry_delay: Duration::from_millis(retry_delay_ms),
            };
            let summary = watch::watch_loop(
                config,
                || client.check_new_orders(),
                |event| match event {
                    watch::WatchEvent::NewOrders => {
                        emit_json_line(json!({
                            "event": "new_orders",
                            "channel": NEW_ORDER_CHANNEL,
                            "time": time_now_rfc3339(),
                        }));
                    }
                    watch::WatchEvent::CheckFailed(err) => {
                        emit_notice(&CheckFailed::from_error(
                            &err,
                            "watch",
                            NEW_ORDER_CHANNEL,
                            time_now_rfc3339().unwrap_or_default(),
                        ));
                    }
                },
                std::thread::sleep,
            );
            emit_json_line(json!({
                "event": "watch_ended",
                "checks": summary.checks,
                "notifications": summary.notifications,
                "failures": summary.failures,
            }));
            Ok(RunOutcome::ok())
        }
    }
}

fn emit_version_output() {
    if io::stdout().is_terminal() {
        println!("pollflag {}", env!("CARGO_PKG_VERSION"));
    } else {
        emit_json(json!({
            "name": "pollflag",
            "version": env!("CARGO_PKG_VERSION"),
        }));
    }
}
