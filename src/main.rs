//! fwsim - Firewall Simulator
//!
//! Terminal front end for the simulator. Reads commands from stdin (or a
//! script file), runs them through the dispatcher against a single local
//! session and prints the output.
//!
//! # Usage
//!
//! ```bash
//! # Interactive shell on the default terminal
//! fwsim
//!
//! # Start on the DMZ terminal with debug logging
//! fwsim --verbose shell --terminal dmz
//!
//! # Replay a lab script without pacing delays
//! fwsim run lab1.txt --instant
//!
//! # Show (and optionally persist) the effective configuration
//! fwsim config --save
//! ```
//!
//! Inside the shell, prefix a line with `@<terminal>` to run it on another
//! terminal (`@dmz ping 192.168.10.10`), or enter `@<terminal>` alone to
//! switch. Ctrl-C cancels a running command; Ctrl-D exits.

use clap::{Parser, Subcommand};
use fwsim::command::split_terminal;
use fwsim::config::{self, PacingConfig, SimulatorConfig};
use fwsim::core::event_log::LogCategory;
use fwsim::core::events::{ChannelObserver, Notification};
use fwsim::core::network::Terminal;
use fwsim::core::session::{SessionId, SessionSettings, SessionStore};
use fwsim::dispatcher::{Dispatcher, Output, render_error};
use fwsim::utils;
use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::sync::mpsc::UnboundedReceiver;

/// The CLI drives exactly one client
const LOCAL_CLIENT: &str = "local";

#[derive(Parser)]
#[command(name = "fwsim")]
#[command(about = "Firewall simulator for learning iptables", long_about = None)]
struct Cli {
    /// Configuration file (default: XDG data dir)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive shell (default)
    Shell {
        /// Terminal to start on (insider, outsider, dmz, firewall)
        #[arg(short, long)]
        terminal: Option<Terminal>,
    },
    /// Run commands from a file, one per line
    Run {
        file: PathBuf,
        /// Skip pacing delays
        #[arg(long)]
        instant: bool,
    },
    /// Print the effective configuration as JSON
    Config {
        /// Also write it to the configuration file
        #[arg(long)]
        save: bool,
    },
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    if let Some(mut log_path) = utils::get_state_dir() {
        log_path.push(utils::LOG_FILE);
        if let Ok(file) = std::fs::File::create(log_path) {
            tracing_subscriber::fmt()
                .with_max_level(level)
                .with_ansi(false)
                .with_writer(file)
                .init();
            return;
        }
    }
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let _ = utils::ensure_dirs();
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn handle_cli(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &cli.config {
        Some(path) => config::load_config_from(path).await,
        None => config::load_config().await,
    };

    match cli.command.unwrap_or(Commands::Shell { terminal: None }) {
        Commands::Config { save } => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            if save {
                match &cli.config {
                    Some(path) => config::save_config_to(path, &config).await?,
                    None => config::save_config(&config).await?,
                }
            }
        }
        Commands::Shell { terminal } => {
            let terminal = terminal.unwrap_or(config.default_terminal);
            let stdin = BufReader::new(tokio::io::stdin());
            run_session(&config, config.pacing, stdin, terminal, true).await?;
        }
        Commands::Run { file, instant } => {
            let pacing = if instant {
                PacingConfig::instant()
            } else {
                config.pacing
            };
            let script = BufReader::new(tokio::fs::File::open(&file).await?);
            run_session(&config, pacing, script, config.default_terminal, false).await?;
        }
    }
    Ok(())
}

/// Feeds every line of `input` to the local client's session.
async fn run_session<R>(
    config: &SimulatorConfig,
    pacing: PacingConfig,
    input: R,
    mut terminal: Terminal,
    interactive: bool,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let (observer, notifications) = ChannelObserver::new();
    let store = Arc::new(SessionStore::new(
        SessionSettings::from(config),
        Arc::new(observer),
    ));
    let sweeper = store.spawn_sweeper(config.sweep_interval());
    let printer = tokio::spawn(print_notifications(notifications));
    let dispatcher = Dispatcher::new(pacing);

    let mut lines = input.lines();
    loop {
        if interactive {
            print!("{terminal}@fwsim:~$ ");
            std::io::stdout().flush()?;
        }
        let line = match next_input(&mut lines, tokio::signal::ctrl_c()).await? {
            Input::Line(line) => line,
            Input::Interrupted => {
                println!("^C");
                continue;
            }
            Input::Closed => break,
        };
        if !interactive {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            println!("{terminal}@fwsim:~$ {trimmed}");
        }

        let (target, command) = match split_terminal(&line) {
            Ok((Some(switch_to), "")) => {
                terminal = switch_to;
                continue;
            }
            Ok((target, command)) => (target.unwrap_or(terminal), command),
            Err(e) => {
                println!("{}", render_error(&e));
                continue;
            }
        };

        let output = tokio::select! {
            output = dispatcher.handle(&store, LOCAL_CLIENT, target, command) => output,
            _ = tokio::signal::ctrl_c() => {
                println!("^C");
                continue;
            }
        };

        match output {
            Some(Output::ClearScreen) => print!("\x1b[2J\x1b[H"),
            Some(Output::Text(text)) => print!("{text}"),
            None => {}
        }
        std::io::stdout().flush()?;
    }

    sweeper.abort();
    printer.abort();
    Ok(())
}

/// What the shell got while waiting at the prompt
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Line(String),
    Interrupted,
    Closed,
}

/// Reads the next line unless `interrupt` completes first.
async fn next_input<R, I>(lines: &mut Lines<R>, interrupt: I) -> std::io::Result<Input>
where
    R: AsyncBufRead + Unpin,
    I: Future,
{
    tokio::select! {
        line = lines.next_line() => Ok(line?.map_or(Input::Closed, Input::Line)),
        _ = interrupt => Ok(Input::Interrupted),
    }
}

/// Prints session events that the user would otherwise not see.
async fn print_notifications(mut rx: UnboundedReceiver<(SessionId, Notification)>) {
    while let Some((session, notification)) = rx.recv().await {
        match notification {
            Notification::SessionInitialized { idle_lifetime_secs } => {
                eprintln!(
                    "[fwsim] session {session} started (expires after {} min idle)",
                    idle_lifetime_secs / 60
                );
            }
            Notification::ConfigChanged {
                terminal,
                ip,
                network,
            } => {
                eprintln!("[fwsim] {terminal} is now {ip} on {network}");
            }
            Notification::LogAppended(entry) => {
                if entry.category == LogCategory::Warning
                    && let Some(warning) = entry.warning
                {
                    eprintln!("[fwsim] {warning}: {}", entry.details);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_interrupt_at_prompt_is_reported() {
        // Writer stays open, so the read never completes
        let (_writer, reader) = tokio::io::duplex(64);
        let mut lines = BufReader::new(reader).lines();

        let input = next_input(&mut lines, std::future::ready(())).await.unwrap();
        assert_eq!(input, Input::Interrupted);
    }

    #[tokio::test]
    async fn test_lines_then_end_of_input() {
        let mut lines = BufReader::new(&b"whoami\n"[..]).lines();

        let first = next_input(&mut lines, std::future::pending::<()>()).await.unwrap();
        assert_eq!(first, Input::Line("whoami".to_string()));
        let second = next_input(&mut lines, std::future::pending::<()>()).await.unwrap();
        assert_eq!(second, Input::Closed);
    }
}
