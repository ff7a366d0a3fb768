//! B2F CLI binary.
//!
//! Winlink B2 Forwarding Protocol client.
//!
//! # Commands
//!
//! - `connect` - Dial a station or CMS and run one exchange
//! - `listen` - Accept inbound connections and exchange as master
//! - `token` - Compute a secure login response
//! - `inspect` - Print a message file

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use b2f::{
    app::{
        CredentialResolver, DownloadApproval, ExchangeWorker, Exchanger, ListenerHub, MemoryMailbox,
        PromptEvent, PromptHub,
    },
    config::Config,
    protocol::{
        secure_login_response, Address, Capabilities, Direction, MailboxHandler, Message, Session,
        Status, StatusObserver, TrafficStats,
    },
    transport::{TelnetDialer, TelnetListener, TransportTable, CMS_TARGET_CALL},
    VERSION,
};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "b2f")]
#[command(version = VERSION)]
#[command(about = "B2F - Winlink B2 Forwarding Protocol client", long_about = None)]
struct Cli {
    /// Config file (default: <config dir>/b2f/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (protocol lines)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a station or CMS and exchange messages
    Connect {
        /// Connect URL or alias (e.g. telnet, telnet://host:8772/LA1B)
        target: String,

        /// Message file to send (repeatable)
        #[arg(short, long)]
        send: Vec<PathBuf>,

        /// Directory received messages are written to
        #[arg(short, long, default_value = ".")]
        inbox: PathBuf,
    },

    /// Listen for inbound connections
    Listen {
        /// Telnet listen address (overrides [listen] telnet)
        #[arg(short, long)]
        addr: Option<String>,

        /// Message file to send (repeatable)
        #[arg(short, long)]
        send: Vec<PathBuf>,

        /// Directory received messages are written to
        #[arg(short, long, default_value = ".")]
        inbox: PathBuf,
    },

    /// Compute the secure login response to a challenge
    Token {
        /// Challenge from the ;PQ line
        challenge: String,

        /// Account password
        password: String,
    },

    /// Print a message file
    Inspect {
        /// Message file (B2 wire format)
        file: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Token {
            challenge,
            password,
        } => {
            println!("{}", secure_login_response(&challenge, &password));
            Ok(())
        },

        Commands::Inspect { file, json } => cmd_inspect(&file, json),

        Commands::Connect {
            target,
            send,
            inbox,
        } => {
            init_logging(cli.verbose);
            let config = load_config(cli.config.as_deref())?;
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(cmd_connect(config, &target, &send, &inbox))
        },

        Commands::Listen { addr, send, inbox } => {
            init_logging(cli.verbose);
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(addr) = addr {
                config.listen.telnet = addr;
            }
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(cmd_listen(config, &send, &inbox))
        },
    }
}

fn init_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let config = Config::load(path)?;
    config.validate()?;
    Ok(config)
}

/// Everything one station needs to run exchanges
struct Station {
    mailbox: Arc<MemoryMailbox>,
    prompts: PromptHub,
    exchanger: Exchanger,
}

impl Station {
    async fn start(config: &Config, send: &[PathBuf]) -> anyhow::Result<Self> {
        let mailbox = Arc::new(MemoryMailbox::new());
        for path in send {
            let file = std::fs::File::open(path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            let msg = Message::read_from(file)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            tracing::info!("Queued {} for sending", msg.mid());
            mailbox.post(msg).await;
        }

        let prompts = PromptHub::new();
        spawn_stdin_prompter(&prompts).await;

        let station = &config.station;
        let timeout = config.exchange.prompt_timeout();
        let resolver = Arc::new(
            CredentialResolver::new(&station.mycall, station.secure_login_password.clone())
                .with_aux_addresses(station.aux_addrs.clone())
                .with_prompt_hub(prompts.clone())
                .with_prompt_timeout(timeout),
        );
        let handler: Arc<dyn MailboxHandler> = Arc::new(
            DownloadApproval::new(
                mailbox.clone(),
                prompts.clone(),
                config.exchange.auto_download_size_limit,
            )
            .with_prompt_timeout(timeout),
        );

        let mycall = station.mycall.clone();
        let locator = station.locator.clone();
        let motd = station.motd.clone();
        let aux: Vec<Address> = station
            .aux_addrs
            .iter()
            .map(|aux| Address::parse(&aux.address))
            .collect();
        let capabilities = Capabilities::new().with_gzip(config.exchange.gzip);

        let exchanger = ExchangeWorker::spawn(Arc::new(move |target: &str, master: bool| {
            Session::new(&mycall, target, &locator)
                .with_master(master)
                .with_motd(motd.clone())
                .with_capabilities(capabilities.clone())
                .with_aux_addresses(aux.clone())
                .with_mailbox(handler.clone())
                .with_secure_login_handler(resolver.clone())
                .with_status_observer(Arc::new(ProgressPrinter))
        }));

        Ok(Self {
            mailbox,
            prompts,
            exchanger,
        })
    }

    async fn save_inbox(&self, dir: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(dir)?;
        for msg in self.mailbox.inbox().await {
            let path = dir.join(format!("{}.b2f", msg.mid()));
            std::fs::write(&path, msg.bytes()?)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("Received {} -> {}", msg.mid(), path.display());
        }
        Ok(())
    }
}

async fn cmd_connect(config: Config, target: &str, send: &[PathBuf], inbox: &Path) -> anyhow::Result<()> {
    let station = Station::start(&config, send).await?;

    let mut transports = TransportTable::new();
    transports.register_dialer(Arc::new(TelnetDialer::new(&config.station.mycall)));

    let url = config.resolve_connect(target);
    let stream = transports.dial(&url).await?;
    let targetcall = stream.remote_call().unwrap_or(CMS_TARGET_CALL).to_string();

    let result = station.exchanger.exchange(stream, &targetcall, false).await;
    station.prompts.close().await;
    let stats = result?;

    print_stats(&stats);
    station.save_inbox(inbox).await
}

async fn cmd_listen(config: Config, send: &[PathBuf], inbox: &Path) -> anyhow::Result<()> {
    let station = Station::start(&config, send).await?;

    let hub = ListenerHub::new(station.exchanger.clone());
    hub.enable(Arc::new(TelnetListener::new(&config.listen.telnet))).await;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");
    hub.close().await;
    station.exchanger.abort();
    station.prompts.close().await;

    station.save_inbox(inbox).await
}

fn cmd_inspect(file: &Path, json: bool) -> anyhow::Result<()> {
    let reader = std::fs::File::open(file).with_context(|| format!("failed to open {}", file.display()))?;
    let msg = Message::read_from(reader)?;

    if json {
        let value = serde_json::json!({
            "mid": msg.mid(),
            "type": msg.msg_type(),
            "date": msg.date(),
            "from": msg.from().to_string(),
            "to": msg.to().iter().map(ToString::to_string).collect::<Vec<_>>(),
            "cc": msg.cc().iter().map(ToString::to_string).collect::<Vec<_>>(),
            "subject": msg.subject(),
            "body_size": msg.body_size(),
            "files": msg
                .files()
                .iter()
                .map(|f| serde_json::json!({ "name": f.name(), "size": f.size() }))
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        print!("{msg}");
    }
    Ok(())
}

fn print_stats(stats: &TrafficStats) {
    eprintln!();
    eprintln!("Exchange Statistics:");
    eprintln!("  Sent:      {}", stats.sent.len());
    for mid in &stats.sent {
        eprintln!("    {mid}");
    }
    eprintln!("  Received:  {}", stats.received.len());
    for mid in &stats.received {
        eprintln!("    {mid}");
    }
}

/// Prints transfer progress to stderr
struct ProgressPrinter;

impl StatusObserver for ProgressPrinter {
    fn update_status(&self, status: Status) {
        let arrow = match status.direction {
            Direction::Sending => ">>",
            Direction::Receiving => "<<",
        };
        let pct = if status.bytes_total > 0 {
            status.bytes_transferred * 100 / status.bytes_total
        } else {
            100
        };
        eprint!("\r{arrow} {} {:>3}% ({}/{})", status.mid, pct, status.bytes_transferred, status.bytes_total);
        if status.done {
            eprintln!();
        }
    }
}

/// Answer prompts from the terminal.
///
/// Each line typed answers the prompt currently shown. Cancelled prompts
/// are forgotten so stale input is not sent to them.
async fn spawn_stdin_prompter(prompts: &PromptHub) {
    let mut rx = prompts.add_prompter().await;
    let prompts = prompts.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut current: Option<u64> = None;
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(PromptEvent::Open(prompt)) => {
                        eprintln!("{}", prompt.message);
                        for opt in &prompt.options {
                            let mark = if opt.checked { "x" } else { " " };
                            eprintln!("  [{mark}] {}  {}", opt.value, opt.desc);
                        }
                        if !prompt.options.is_empty() {
                            eprint!("Comma separated selection: ");
                        }
                        current = Some(prompt.id);
                    },
                    Some(PromptEvent::Cancelled { id }) => {
                        if current == Some(id) {
                            eprintln!("Prompt aborted.");
                            current = None;
                        }
                    },
                    None => break,
                },
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        let Some(id) = current.take() else { continue };
                        if !prompts.respond(id, line.trim()).await {
                            eprintln!("Too late, the prompt has expired.");
                        }
                    },
                    _ => break,
                },
            }
        }
    });
}
