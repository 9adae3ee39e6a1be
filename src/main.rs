use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::{mpsc, Notify};

use focus_guard::alert::DesktopNotifier;
use focus_guard::config::{DEFAULT_CONFIG_FILE, INIT_TEMPLATE};
use focus_guard::ipc::{self, IpcRequest, IpcResponse, LayerRow};
use focus_guard::layers::{Platform, SystemRunner};
use focus_guard::signals::spawn_signal_listener;
use focus_guard::{
    system_blocker, AnswerSource, ArithmeticLadder, Challenge, EngineEvent, EnforcementState,
    EventKind, FileStateStore, FocusConfig, FocusEngine, FocusError, InstanceLock, Result,
    SessionPhase,
};

#[derive(Parser)]
#[command(
    name = "focus-guard",
    about = "focus-guard: scheduled, tamper-resistant site blocking"
)]
struct Cli {
    /// Path to the config file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    file: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the enforcement engine in the foreground
    Run,
    /// Show the running engine's state
    Status,
    /// Turn focus mode on for a daily window
    Start {
        /// Window start, HH:MM (default: focus.default_start)
        #[arg(long)]
        from: Option<String>,
        /// Window end, HH:MM (default: focus.default_end)
        #[arg(long)]
        until: Option<String>,
        /// Challenge difficulty 1-5 (default: focus.default_difficulty)
        #[arg(short, long)]
        difficulty: Option<u8>,
    },
    /// Turn focus mode off and lift the block
    Stop,
    /// Apply the block now, regardless of the window
    Block,
    /// Lift the block now, regardless of the window
    Unblock,
    /// Ask the running engine to exit (gated like a signal)
    Quit,
    /// Follow the engine's event stream
    Events,
    /// Validate the config file without starting anything
    Validate,
    /// Generate a new config file
    Init,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if matches!(cli.command, Commands::Run) {
        std::fs::read_to_string(&cli.file)
            .ok()
            .and_then(|s| hcl::from_str::<FocusConfig>(&s).ok())
            .map(|c| c.guard.log_level)
            .unwrap_or_else(|| "info".into())
    } else {
        "warn".into()
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("{} {e}", "[focus-guard]".red().bold());
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Commands::Run => run_engine(&cli.file).await?,

        Commands::Status => {
            let cfg = control_config(&cli.file)?;
            match ipc::send(&cfg.socket_path(), &IpcRequest::Status).await? {
                IpcResponse::Status { state, phase } => print_status(&state, phase),
                other => return Err(unexpected(other)),
            }
        }

        Commands::Start {
            from,
            until,
            difficulty,
        } => {
            let cfg = control_config(&cli.file)?;
            let req = IpcRequest::Start {
                from: from.clone().unwrap_or_else(|| cfg.focus.default_start.clone()),
                until: until.clone().unwrap_or_else(|| cfg.focus.default_end.clone()),
                difficulty: difficulty.unwrap_or(cfg.focus.default_difficulty),
            };
            match ipc::send(&cfg.socket_path(), &req).await? {
                IpcResponse::Status { state, phase } => {
                    println!("{} focus mode on", "✓".green());
                    print_status(&state, phase);
                }
                other => return Err(unexpected(other)),
            }
        }

        Commands::Stop => {
            let cfg = control_config(&cli.file)?;
            match ipc::send(&cfg.socket_path(), &IpcRequest::Stop).await? {
                IpcResponse::Status { state, phase } => {
                    println!("{} focus mode off", "✓".green());
                    print_status(&state, phase);
                }
                other => return Err(unexpected(other)),
            }
        }

        Commands::Block | Commands::Unblock => {
            let cfg = control_config(&cli.file)?;
            let req = if matches!(cli.command, Commands::Block) {
                IpcRequest::Block
            } else {
                IpcRequest::Unblock
            };
            match ipc::send(&cfg.socket_path(), &req).await? {
                IpcResponse::Report {
                    action,
                    resource,
                    layers,
                } => print_report(&action, &resource, &layers),
                other => return Err(unexpected(other)),
            }
        }

        Commands::Quit => {
            let cfg = control_config(&cli.file)?;
            match ipc::send(&cfg.socket_path(), &IpcRequest::Quit).await? {
                IpcResponse::Ok => {
                    println!("{} exit requested", "→".cyan());
                    println!("  answer the challenge in the engine's terminal if it is blocking");
                }
                other => return Err(unexpected(other)),
            }
        }

        Commands::Events => {
            let cfg = control_config(&cli.file)?;
            ipc::follow(&cfg.socket_path(), print_event).await?;
        }

        Commands::Validate => {
            let cfg = FocusConfig::from_file(&cli.file)?;
            let policy = cfg.policy()?;
            println!(
                "{} {} is valid ({} categories, {} hostnames)",
                "✓".green(),
                cli.file.display(),
                cfg.block.len(),
                policy.entries().len()
            );
            for (name, category) in &cfg.block {
                println!("  {} {}", name.cyan(), category.domains.join(", ").dimmed());
            }
            let options = cfg.engine_options();
            let layers = [
                ("dns_flush", options.dns_flush_enabled),
                ("firewall", options.firewall_layer_enabled),
                ("browser_cache", options.browser_cache_enabled),
                ("browser_restart", options.browser_restart_enabled),
                ("notifications", options.notifications_enabled),
            ];
            let enabled: Vec<&str> = layers
                .iter()
                .filter(|(_, on)| *on)
                .map(|(name, _)| *name)
                .collect();
            println!("  layers: {}", enabled.join(", ").dimmed());
            println!(
                "  window {} at difficulty {}",
                cfg.default_window()?,
                cfg.focus.default_difficulty
            );
        }

        Commands::Init => {
            let path = &cli.file;
            if path.exists() {
                return Err(FocusError::Config(format!(
                    "{} already exists, delete it first or use a different path",
                    path.display()
                )));
            }
            std::fs::write(path, INIT_TEMPLATE)
                .map_err(|e| FocusError::Config(format!("write {}: {e}", path.display())))?;
            println!("{} created {}", "✓".green(), path.display().to_string().cyan());
            println!(
                "  edit {}, then run {} to start the engine",
                path.display().to_string().cyan(),
                "sudo focus-guard run".cyan()
            );
        }
    }

    Ok(())
}

async fn run_engine(file: &Path) -> Result<()> {
    let cfg = FocusConfig::from_file(file)?;
    let _lock = InstanceLock::acquire(cfg.lock_path())?;

    let options = cfg.engine_options();
    let blocker = system_blocker(&cfg.guard.hosts_file, &cfg.layers.browsers, &options);
    let engine = Arc::new(FocusEngine::new(
        cfg.policy()?,
        blocker,
        Arc::new(FileStateStore::new(cfg.state_path())),
        Arc::new(ArithmeticLadder),
        options.clone(),
    ));

    let _notifier = options.notifications_enabled.then(|| {
        DesktopNotifier::new(Arc::new(SystemRunner::default()), Platform::current())
            .spawn(engine.subscribe())
    });

    let (exit_tx, exit_rx) = mpsc::channel(8);
    let _signals = spawn_signal_listener(exit_tx.clone())?;

    let socket = cfg.socket_path();
    if options.ipc_enabled {
        let server = engine.clone();
        let path = socket.clone();
        tokio::spawn(async move {
            if let Err(e) = ipc::serve(server, &path, exit_tx).await {
                tracing::error!(error = %e, "Control socket unavailable");
            }
        });
        println!("{} control socket {}", "→".cyan(), socket.display());
    }

    println!(
        "{} guarding {} ({} hostnames)",
        "✓".green(),
        cfg.guard.hosts_file.display(),
        cfg.policy()?.entries().len()
    );
    println!("  run {} to begin a session", "focus-guard start".cyan());

    engine
        .clone()
        .run(exit_rx, Box::new(TerminalAnswers::stdin()))
        .await;

    println!("{} focus-guard stopped", "→".yellow());
    if options.ipc_enabled {
        let _ = std::fs::remove_file(&socket);
    }
    Ok(())
}

/// Config for control commands; a missing file means defaults
fn control_config(path: &Path) -> Result<FocusConfig> {
    if path.exists() {
        FocusConfig::from_file(path)
    } else {
        Ok(FocusConfig::default())
    }
}

fn unexpected(resp: IpcResponse) -> FocusError {
    match resp {
        IpcResponse::Error { msg } => FocusError::Ipc(msg),
        other => FocusError::Ipc(format!("unexpected response: {other:?}")),
    }
}

fn print_status(state: &EnforcementState, phase: SessionPhase) {
    let phase_colored = match phase {
        SessionPhase::Enforcing => phase.to_string().red().bold().to_string(),
        SessionPhase::Armed => phase.to_string().yellow().to_string(),
        SessionPhase::Inactive => phase.to_string().dimmed().to_string(),
    };
    let window = state
        .window
        .map(|w| w.to_string())
        .unwrap_or_else(|| "-".into());

    println!("{:<14} {}", "PHASE".bold(), phase_colored);
    println!(
        "{:<14} {}",
        "FOCUS".bold(),
        if state.focus_mode_enabled { "on" } else { "off" }
    );
    println!("{:<14} {}", "WINDOW".bold(), window);
    println!(
        "{:<14} {}",
        "BLOCKED".bold(),
        if state.blocked { "yes" } else { "no" }
    );
    println!("{:<14} {}", "APPLIED".bold(), state.block_application_count);
    println!("{:<14} {}", "BYPASSES".bold(), state.bypass_attempt_count);
    println!(
        "{:<14} {} ({} failed rounds)",
        "DIFFICULTY".bold(),
        state.difficulty_level,
        state.consecutive_challenge_failures
    );
    if let Some(at) = state.last_check {
        println!(
            "{:<14} {}",
            "LAST CHECK".bold(),
            at.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
                .dimmed()
        );
    }
}

fn print_report(action: &str, resource: &str, layers: &[LayerRow]) {
    println!("{} {action}: hosts file {resource}", "→".cyan());
    for row in layers {
        let status = match row.status.as_str() {
            "ok" => row.status.green().to_string(),
            "failed" => row.status.red().to_string(),
            _ => row.status.dimmed().to_string(),
        };
        let detail = row.detail.as_deref().unwrap_or_default();
        println!("  {:<18} {:<10} {}", row.layer, status, detail.dimmed());
    }
}

fn print_event(event: EngineEvent) {
    let kind = event.kind.name();
    let kind = match &event.kind {
        EventKind::TamperDetected { .. } | EventKind::ExitDenied | EventKind::ChallengeFailed => {
            kind.red().to_string()
        }
        EventKind::DifficultyEscalated { .. } => kind.yellow().to_string(),
        _ => kind.cyan().to_string(),
    };
    println!(
        "{} {:<22} applied={} bypasses={} difficulty={}",
        event
            .at
            .with_timezone(&chrono::Local)
            .format("%H:%M:%S")
            .to_string()
            .dimmed(),
        kind,
        event.counters.block_application_count,
        event.counters.bypass_attempt_count,
        event.counters.difficulty_level
    );
}

/// Challenge answers typed at the engine's terminal
///
/// An interrupt while a prompt is waiting abandons that attempt.
struct TerminalAnswers<R> {
    lines: Lines<R>,
    interrupt: Arc<Notify>,
}

impl TerminalAnswers<BufReader<Stdin>> {
    fn stdin() -> Self {
        let interrupt = Arc::new(Notify::new());
        let relay = interrupt.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                relay.notify_waiters();
            }
        });
        Self::new(BufReader::new(tokio::io::stdin()), interrupt)
    }
}

impl<R: AsyncBufRead + Unpin + Send> TerminalAnswers<R> {
    fn new(reader: R, interrupt: Arc<Notify>) -> Self {
        Self {
            lines: reader.lines(),
            interrupt,
        }
    }

    async fn read_answer(&mut self) -> Result<String> {
        let interrupted = self.interrupt.notified();
        tokio::select! {
            line = self.lines.next_line() => line?.ok_or(FocusError::ChallengeAbandoned),
            _ = interrupted => {
                eprintln!();
                Err(FocusError::ChallengeAbandoned)
            }
        }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> AnswerSource for TerminalAnswers<R> {
    async fn answer(&mut self, challenge: &Challenge, attempt: u32, max_attempts: u32) -> Result<String> {
        eprintln!(
            "{} exit is gated while blocking (attempt {attempt}/{max_attempts}, level {})",
            "!".yellow().bold(),
            challenge.difficulty_level
        );
        eprint!("  {} ", challenge.prompt.bold());
        std::io::Write::flush(&mut std::io::stderr()).ok();

        self.read_answer().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn challenge() -> Challenge {
        Challenge {
            prompt: "What is 6 * 7?".into(),
            expected_answer: 42,
            difficulty_level: 1,
        }
    }

    #[tokio::test]
    async fn test_terminal_answer_reads_a_line() {
        let mut answers = TerminalAnswers::new(&b"42\n"[..], Arc::new(Notify::new()));
        assert_eq!(answers.answer(&challenge(), 1, 3).await.unwrap(), "42");
        assert!(matches!(
            answers.answer(&challenge(), 2, 3).await,
            Err(FocusError::ChallengeAbandoned)
        ));
    }

    #[tokio::test]
    async fn test_interrupt_abandons_waiting_prompt() {
        // Keep the write half open so the read never completes
        let (_input, reader) = tokio::io::duplex(64);
        let interrupt = Arc::new(Notify::new());
        let mut answers = TerminalAnswers::new(BufReader::new(reader), interrupt.clone());

        let signal = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            interrupt.notify_waiters();
        };
        let challenge = challenge();
        let (answer, ()) = tokio::join!(answers.answer(&challenge, 1, 3), signal);
        assert!(matches!(answer, Err(FocusError::ChallengeAbandoned)));
    }
}
