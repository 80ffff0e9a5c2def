//! # Inbox Ledger CLI (`ibl`)
//!
//! The `ibl` binary drives the whole pipeline: connecting mail accounts,
//! fetching alert emails, running the four parse modes, auditing, managing
//! rules and cards, and serving the HTTP API.
//!
//! ## Usage
//!
//! ```bash
//! ibl --config ./config/ledger.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ibl init` | Create the SQLite database and run schema migrations |
//! | `ibl account connect <id>` | Complete the OAuth handshake for an account |
//! | `ibl account list` | List accounts and their connection state |
//! | `ibl account label <id> [label]` | Set the mailbox label alerts come from |
//! | `ibl account disconnect <id>` | Discard an account's tokens |
//! | `ibl labels <id>` | List the labels of an account's mailbox |
//! | `ibl sync <id\|all>` | Fetch new mail, then quick-parse it |
//! | `ibl parse <id> --mode <mode>` | Run a parse mode over stored mail |
//! | `ibl dry-run <id>` | Parse without writing anything |
//! | `ibl audit <id>` | Integrity audit |
//! | `ibl rules list\|add\|import\|validate` | Rule management |
//! | `ibl cards add <suffix>` | Register a card and its owner |
//! | `ibl stats` | Database overview |
//! | `ibl serve` | Start the HTTP API |
//!
//! ## Examples
//!
//! ```bash
//! ibl init
//! ibl account connect work --email me@example.com \
//!     --code 4/0Ab... --redirect-uri http://localhost:8080/callback
//! ibl account label work Alerts
//! ibl rules import ./rules.toml
//! ibl sync work --limit 50
//! ibl parse work --mode smart-full
//! ibl audit work --json
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use inbox_ledger::config::{self, Config};
use inbox_ledger::ingest::{FetchScope, SyncOrchestrator};
use inbox_ledger::progress::{ProgressMode, SyncProgressReporter};
use inbox_ledger::{accounts, app, migrate, report, rules_cmd, server, stats};
use inbox_ledger_core::{LedgerError, ParseMode, Rule, RunSummary};

/// Inbox Ledger: turns bank and card alert emails into a ledger of
/// structured transactions.
#[derive(Parser)]
#[command(
    name = "ibl",
    about = "Inbox Ledger: turns bank and card alert emails into structured transactions",
    version,
    long_about = "Inbox Ledger pulls transaction alert emails from connected mail accounts, \
    matches them against user-defined rules, extracts amount, merchant, date and card, and \
    records transactions idempotently. Batches can be re-run in four modes to repair or rebuild \
    the ledger after rule changes."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ledger.toml")]
    config: PathBuf,

    /// Print results as JSON instead of text.
    #[arg(long, global = true)]
    json: bool,

    /// Progress output on stderr: auto, human, json, or off.
    #[arg(long, global = true, default_value = "auto")]
    progress: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it on an existing database is safe.
    Init,

    /// Manage connected mail accounts.
    Account {
        #[command(subcommand)]
        action: AccountAction,
    },

    /// List the labels of an account's mailbox.
    Labels {
        account: String,
    },

    /// Fetch new messages, then parse the unparsed backlog (quick mode).
    ///
    /// `all` syncs every connected account concurrently.
    Sync {
        /// Account id, or `all`.
        account: String,

        /// Store at most this many new messages (default: `[mailbox].fetch_cap`).
        #[arg(long, conflicts_with = "all_pages")]
        limit: Option<usize>,

        /// Page through the whole mailbox, as the scheduler does.
        #[arg(long)]
        all_pages: bool,
    },

    /// Parse stored messages.
    ///
    /// Modes: `quick` (unparsed only), `smart-full` (also repairs
    /// orphaned messages), `full-reparse` (everything, never duplicates),
    /// `force-full` (everything, may duplicate).
    Parse {
        account: String,

        #[arg(long, default_value = "quick")]
        mode: ParseMode,
    },

    /// Parse with the current rules without writing anything.
    DryRun {
        account: String,

        /// Restrict to these message ids (repeatable).
        #[arg(long = "message")]
        messages: Vec<String>,
    },

    /// Report orphaned, duplicated and broken records for an account.
    Audit {
        account: String,
    },

    /// Manage parsing rules.
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },

    /// Manage cards and their owners.
    Cards {
        #[command(subcommand)]
        action: CardsAction,
    },

    /// Show database statistics.
    Stats,

    /// Start the HTTP API on `[server].bind`.
    Serve,

    /// Generate shell completion scripts.
    Completions {
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum AccountAction {
    /// Exchange an authorization code for tokens. Creates the account on
    /// first connection.
    Connect {
        account: String,
        #[arg(long)]
        email: String,
        /// Authorization code returned to the redirect URI.
        #[arg(long)]
        code: String,
        #[arg(long)]
        redirect_uri: String,
        /// Mailbox label to pull alerts from.
        #[arg(long)]
        label: Option<String>,
    },
    List,
    /// Set the mailbox label; omit it to read the whole mailbox.
    Label {
        account: String,
        label: Option<String>,
    },
    /// Discard all tokens. The account's messages and transactions stay.
    Disconnect {
        account: String,
    },
}

#[derive(Subcommand)]
enum RulesAction {
    List,
    /// Add a single rule.
    Add {
        #[arg(long)]
        name: String,
        /// Pattern with one capture group for the amount.
        #[arg(long)]
        amount: String,
        #[arg(long, default_value_t = 0)]
        priority: i64,
        #[arg(long)]
        sender: Option<String>,
        #[arg(long)]
        subject: Option<String>,
        #[arg(long)]
        body: Option<String>,
        #[arg(long)]
        merchant: Option<String>,
        #[arg(long)]
        date: Option<String>,
        /// chrono format for the date capture, e.g. `%d/%m/%Y`.
        #[arg(long)]
        date_format: Option<String>,
        #[arg(long)]
        card: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// Store the rule inactive.
        #[arg(long)]
        inactive: bool,
    },
    /// Import `[[rules]]` from a TOML file.
    Import {
        path: PathBuf,
    },
    /// Compile every stored rule and list the ones that would be skipped.
    Validate,
}

#[derive(Subcommand)]
enum CardsAction {
    Add {
        /// Last digits printed on the card.
        suffix: String,
        #[arg(long)]
        owner: String,
        #[arg(long)]
        label: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        if let Some(LedgerError::ReauthorizationRequired { account_id, .. }) =
            LedgerError::find(&err)
        {
            eprintln!("Error: {:#}", err);
            eprintln!(
                "Reconnect with: ibl account connect {} --email <address> --code <code> --redirect-uri <uri>",
                account_id
            );
        } else {
            eprintln!("Error: {:#}", err);
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(shell, &mut cmd, "ibl", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;
    let json = cli.json;
    let progress = ProgressMode::from_flag(&cli.progress)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Serve => {
            let orchestrator = app::open(&cfg).await?;
            server::run_server(&cfg, orchestrator).await?;
        }
        Commands::Completions { .. } => {}
        command => {
            let orchestrator = app::open(&cfg).await?;
            run_with(&cfg, &orchestrator, command, json, progress).await?;
        }
    }

    Ok(())
}

/// Commands that operate through the orchestrator.
async fn run_with(
    cfg: &Config,
    orchestrator: &Arc<SyncOrchestrator>,
    command: Commands,
    json: bool,
    progress: ProgressMode,
) -> anyhow::Result<()> {
    let store = orchestrator.store().as_ref();

    match command {
        Commands::Account { action } => match action {
            AccountAction::Connect {
                account,
                email,
                code,
                redirect_uri,
                label,
            } => {
                let state =
                    accounts::connect(orchestrator, &account, &email, label, &code, &redirect_uri)
                        .await?;
                if json {
                    report::print_json(&state)?;
                } else {
                    println!("Connected {} ({}).", state.account_id, state.email);
                }
            }
            AccountAction::List => accounts::list_accounts(orchestrator, json).await?,
            AccountAction::Label { account, label } => {
                let state = accounts::set_label(orchestrator, &account, label).await?;
                match &state.label {
                    Some(l) => println!("{} now reads label '{}'.", account, l),
                    None => println!("{} now reads the whole mailbox.", account),
                }
            }
            AccountAction::Disconnect { account } => {
                orchestrator.vault().disconnect(&account).await?;
                println!("Disconnected {}.", account);
            }
        },
        Commands::Labels { account } => {
            let labels = accounts::list_labels(orchestrator, &account).await?;
            if json {
                report::print_json(&labels)?;
            } else {
                for label in &labels {
                    println!("{:<24} {}", label.id, label.name);
                }
            }
        }
        Commands::Sync {
            account,
            limit,
            all_pages,
        } => {
            let scope = if all_pages {
                FetchScope::AllPages
            } else {
                FetchScope::Capped(limit.unwrap_or(cfg.mailbox.fetch_cap))
            };
            let cancel = cancel_on_ctrl_c();
            let reporter: Arc<dyn SyncProgressReporter> = Arc::from(progress.reporter());

            let summaries = if account == "all" {
                orchestrator
                    .sync_all_connected(scope, cancel, reporter)
                    .await?
            } else {
                vec![
                    orchestrator
                        .sync(&account, scope, &cancel, reporter.as_ref())
                        .await?,
                ]
            };
            emit_summaries(&summaries, json)?;
        }
        Commands::Parse { account, mode } => {
            let cancel = cancel_on_ctrl_c();
            let reporter = progress.reporter();
            let summary = orchestrator
                .parse(&account, mode, &cancel, reporter.as_ref())
                .await?;
            emit_summaries(std::slice::from_ref(&summary), json)?;
        }
        Commands::DryRun { account, messages } => {
            let ids = if messages.is_empty() {
                None
            } else {
                Some(messages)
            };
            let report = orchestrator.dry_run(&account, ids).await?;
            if json {
                report::print_json(&report)?;
            } else {
                report::print_dry_run(&report);
            }
        }
        Commands::Audit { account } => {
            let report = orchestrator
                .audit(&account, cfg.audit.sample_limit)
                .await?;
            if json {
                report::print_json(&report)?;
            } else {
                report::print_audit(&report);
            }
        }
        Commands::Rules { action } => match action {
            RulesAction::List => rules_cmd::list_rules(store, json).await?,
            RulesAction::Add {
                name,
                amount,
                priority,
                sender,
                subject,
                body,
                merchant,
                date,
                date_format,
                card,
                description,
                inactive,
            } => {
                let mut rule = Rule::new(&name, &amount);
                rule.priority = priority;
                rule.is_active = !inactive;
                rule.sender_pattern = sender;
                rule.subject_pattern = subject;
                rule.body_pattern = body;
                rule.merchant_pattern = merchant;
                rule.date_pattern = date;
                rule.date_format = date_format;
                rule.card_pattern = card;
                rule.description_pattern = description;
                let stored = rules_cmd::add_rule(store, rule).await?;
                println!("Added rule {} ({}).", stored.name, stored.id);
            }
            RulesAction::Import { path } => {
                let stored = rules_cmd::import_rules(store, &path).await?;
                println!("Imported {} rules.", stored.len());
            }
            RulesAction::Validate => {
                let issues = rules_cmd::validate_stored(store).await?;
                rules_cmd::print_issues(&issues, json)?;
                if !issues.is_empty() {
                    anyhow::bail!("{} rules do not compile", issues.len());
                }
            }
        },
        Commands::Cards { action } => match action {
            CardsAction::Add {
                suffix,
                owner,
                label,
            } => {
                let card = rules_cmd::add_card(store, &suffix, &owner, label).await?;
                println!("Added card ending in {} for {}.", card.suffix, owner);
            }
        },
        Commands::Init | Commands::Stats | Commands::Serve | Commands::Completions { .. } => {}
    }

    Ok(())
}

/// Cancel the running batch on Ctrl-C. Work already committed stays.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current item");
            child.cancel();
        }
    });
    token
}

/// Print summaries, then fail the process when any account needs to be
/// reconnected so scripts notice.
fn emit_summaries(summaries: &[RunSummary], json: bool) -> anyhow::Result<()> {
    if json {
        report::print_json(&summaries)?;
    } else {
        for summary in summaries {
            report::print_summary(summary);
        }
    }

    if let Some(summary) = summaries.iter().find(|s| s.needs_reauthorization()) {
        return Err(LedgerError::ReauthorizationRequired {
            account_id: summary.account_id.clone(),
            reason: "access was revoked or has expired".to_string(),
        }
        .into());
    }
    Ok(())
}
