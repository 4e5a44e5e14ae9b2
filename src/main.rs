//! Entry point: parse flags, merge configuration layers, and drive the
//! agent one-shot, as a line REPL, or on the scheduler.

use clap::Parser;
use colored::Colorize;
use std::io::Write;
use std::process::ExitCode;
use tokio::io::AsyncBufReadExt;

use krillclaw::agent::{Agent, LoopStatus};
use krillclaw::config::Config;
use krillclaw::llm::types::Provider;
use krillclaw::llm::LlmClient;
use krillclaw::scheduler::{Scheduler, SchedulerConfig, HEARTBEAT_PROMPT};
use krillclaw::tools::{Dispatcher, ToolContext};
use krillclaw::transport::TransportKind;
use krillclaw::ClientError;

#[derive(Parser)]
#[command(
    name = "krillclaw",
    version,
    about = "Minimal autonomous agent runtime",
    disable_version_flag = true
)]
struct Cli {
    /// Prompt to run one-shot (same as --prompt)
    #[arg(value_name = "PROMPT")]
    words: Vec<String>,

    /// Model to use
    #[arg(short, long)]
    model: Option<String>,

    /// Run one-shot with this prompt
    #[arg(short, long)]
    prompt: Option<String>,

    /// Provider: claude, openai, or ollama
    #[arg(long)]
    provider: Option<String>,

    /// Override the provider base URL
    #[arg(long)]
    base_url: Option<String>,

    /// Disable streaming output
    #[arg(long)]
    no_stream: bool,

    /// Carrier: http, ble, or serial
    #[arg(long)]
    transport: Option<String>,

    /// Serial port device (implies --transport serial)
    #[arg(long)]
    serial_port: Option<String>,

    /// BLE device address (implies --transport ble)
    #[arg(long)]
    ble_device: Option<String>,

    /// Seconds between scheduled agent runs (0 disables)
    #[arg(long, default_value_t = 0)]
    cron_interval: u64,

    /// Prompt for scheduled runs
    #[arg(long)]
    cron_prompt: Option<String>,

    /// Stop after this many scheduled runs (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    cron_max_runs: u64,

    /// Seconds between heartbeat check-ins (0 disables)
    #[arg(long, default_value_t = 0)]
    heartbeat: u64,

    /// Verbose logging
    #[arg(long)]
    verbose: bool,

    /// Print version
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: (),
}

impl Cli {
    fn merge_into(&self, config: &mut Config) -> Result<(), String> {
        if let Some(model) = &self.model {
            config.model = model.clone();
        }
        if let Some(provider) = &self.provider {
            config.provider = Provider::parse(provider)
                .ok_or_else(|| format!("unknown provider {provider:?}"))?;
        }
        if let Some(base_url) = &self.base_url {
            config.base_url = Some(base_url.clone());
        }
        if self.no_stream {
            config.streaming = false;
        }
        if let Some(transport) = &self.transport {
            config.transport = TransportKind::parse(transport)
                .ok_or_else(|| format!("unknown transport {transport:?}"))?;
        }
        if let Some(port) = &self.serial_port {
            config.serial_port = Some(port.clone());
            config.transport = TransportKind::Serial;
        }
        if let Some(device) = &self.ble_device {
            config.ble_device = Some(device.clone());
            config.transport = TransportKind::Ble;
        }
        Ok(())
    }

    fn one_shot_prompt(&self) -> Option<String> {
        if let Some(prompt) = &self.prompt {
            return Some(prompt.clone());
        }
        if self.words.is_empty() {
            None
        } else {
            Some(self.words.join(" "))
        }
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Warn
    };
    let _ = simplelog::TermLogger::init(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    );
}

fn report_error(err: &ClientError) {
    match err.hint() {
        Some(hint) => eprintln!("{} {err} ({hint})", "error:".red().bold()),
        None => eprintln!("{} {err}", "error:".red().bold()),
    }
}

fn print_delta(fragment: &str) {
    print!("{fragment}");
    let _ = std::io::stdout().flush();
}

async fn run_once(agent: &mut Agent, prompt: &str, stream_to_stdout: bool) -> bool {
    let mut on_delta: Box<dyn FnMut(&str)> = if stream_to_stdout {
        Box::new(print_delta)
    } else {
        Box::new(|_| {})
    };
    match agent.run(prompt, &mut on_delta).await {
        Ok(outcome) => {
            if stream_to_stdout {
                println!();
            }
            match outcome.status {
                LoopStatus::Done => {}
                LoopStatus::MaxTokens => {
                    eprintln!("{}", "response hit the token cap".yellow());
                }
                LoopStatus::IterationLimit => {
                    eprintln!("{}", "stopped: too many tool iterations".yellow());
                }
            }
            true
        }
        Err(err) => {
            report_error(&err);
            false
        }
    }
}

async fn repl(agent: &mut Agent) {
    println!(
        "{} {} [{} / {}]",
        "krillclaw".bold().cyan(),
        env!("CARGO_PKG_VERSION"),
        agent.client().provider(),
        agent.client().model().yellow(),
    );
    println!("Type a prompt, or 'exit' to quit.\n");

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    loop {
        print!("{} ", ">".green().bold());
        let _ = std::io::stdout().flush();
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) | Err(_) => break,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }
        run_once(agent, line, true).await;
        println!();
    }
}

async fn run_scheduler(agent: &mut Agent, config: SchedulerConfig) {
    let mut scheduler = Scheduler::new(config);
    log::info!(
        "scheduler started: interval={}s heartbeat={}s max_runs={}",
        scheduler.config().interval_s,
        scheduler.config().heartbeat_s,
        scheduler.config().max_runs,
    );
    loop {
        scheduler.sleep_until_next().await;
        if scheduler.should_run_agent() {
            let prompt = scheduler.config().prompt.clone();
            log::info!("cron run {} starting", scheduler.run_count());
            run_once(agent, &prompt, false).await;
        }
        if scheduler.should_heartbeat() {
            run_once(agent, HEARTBEAT_PROMPT, false).await;
        }
        if scheduler.finished() && scheduler.config().heartbeat_s == 0 {
            break;
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = Config::load();
    if let Err(err) = cli.merge_into(&mut config) {
        eprintln!("{} {err}", "error:".red().bold());
        return ExitCode::from(1);
    }
    if let Err(err) = config.finalize() {
        eprintln!("{} {err}", "error:".red().bold());
        return ExitCode::from(1);
    }

    let client = LlmClient::from_config(&config);
    let dispatcher = Dispatcher::new(ToolContext::from_config(&config));
    let mut agent = Agent::new(&config, client, dispatcher);

    let scheduler_config = SchedulerConfig {
        interval_s: cli.cron_interval,
        prompt: cli
            .cron_prompt
            .clone()
            .unwrap_or_else(|| "Check in and handle any pending work.".to_string()),
        heartbeat_s: cli.heartbeat,
        max_runs: cli.cron_max_runs,
    };

    if scheduler_config.enabled() {
        run_scheduler(&mut agent, scheduler_config).await;
    } else if let Some(prompt) = cli.one_shot_prompt() {
        // Loop failures print a hint but are not config errors.
        run_once(&mut agent, &prompt, true).await;
    } else {
        repl(&mut agent).await;
    }
    ExitCode::SUCCESS
}
