//! abstore CLI - inspect and edit address books from the command line

use std::path::{Path, PathBuf};

use abstore::config::{self, AbstoreConfig};
use abstore::ui::{self, Icons};
use abstore::{
    Card, CardScope, CorruptionReport, Error, Field, OpenOptions, Opened, RecoveryDecision,
    RecoveryHandler, RecoveryPolicy, Session, SessionManager,
};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "abstore")]
#[command(version)]
#[command(about = "Address-book storage - open, inspect and edit address books")]
#[command(long_about = r#"
abstore opens address books through a shared session layer, enabling:
  • Listing contacts and mailing lists
  • Walking list members in order
  • Adding contacts and lists
  • Recovering from corrupt or locked files

Example usage:
  abstore --create add-card --first Ada --last Lovelace --email ada@example.org
  abstore cards
  abstore --recover recreate stats
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Path to the address book (overrides the config)
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Create the address book if it does not exist
    #[arg(long, global = true)]
    create: bool,

    /// What to do with a corrupt address book (ask, recreate, abort)
    #[arg(long, global = true)]
    recover: Option<RecoveryPolicy>,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value_t = Format::Text)]
    format: Format,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a config file and create the address book
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// List contacts
    Cards {
        /// Include mailing lists
        #[arg(short, long)]
        all: bool,
    },

    /// List mailing lists
    Lists,

    /// List the members of a mailing list
    Members {
        /// Row id of the list
        list: u32,
    },

    /// Show every field of one row
    Show {
        /// Row id
        row: u32,

        /// The row is a mailing list
        #[arg(short, long)]
        list: bool,
    },

    /// Show card and list counts
    Stats,

    /// Add a contact
    AddCard {
        #[arg(long, default_value = "")]
        first: String,

        #[arg(long, default_value = "")]
        last: String,

        #[arg(long)]
        email: String,

        #[arg(long)]
        nick: Option<String>,

        #[arg(long)]
        notes: Option<String>,
    },

    /// Add a mailing list
    AddList {
        name: String,

        #[arg(long, default_value = "")]
        nick: String,

        #[arg(long, default_value = "")]
        description: String,

        /// Member row ids, in order
        #[arg(short, long, value_delimiter = ',')]
        members: Vec<u32>,
    },

    /// Recount a list's members and store the new total
    Retotal {
        /// Row id of the list
        list: u32,
    },
}

/// Asks on the terminal before moving a damaged file aside
struct PromptRecovery;

impl RecoveryHandler for PromptRecovery {
    fn on_corrupt(&self, report: &CorruptionReport) -> RecoveryDecision {
        let term = console::Term::stderr();
        if !term.is_term() {
            return RecoveryDecision::Abort;
        }

        ui::warn(&format!("{} is corrupt", report.path.display()));
        let prompt = format!(
            "Move it to {} and start a new address book? [y/N] ",
            report.backup_path.display()
        );
        if term.write_str(&prompt).is_err() {
            return RecoveryDecision::Abort;
        }
        match term.read_line() {
            Ok(answer) if matches!(answer.trim().to_lowercase().as_str(), "y" | "yes") => {
                RecoveryDecision::Recreate
            }
            _ => RecoveryDecision::Abort,
        }
    }
}

/// Settings after merging the command line over the config file
struct Resolved {
    database: PathBuf,
    create: bool,
    policy: RecoveryPolicy,
    format: Format,
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    if let Err(e) = run(cli) {
        report_error(&e);
        std::process::exit(1);
    }
}

fn report_error(e: &anyhow::Error) {
    match e.downcast_ref::<Error>() {
        Some(Error::Locked(path)) => {
            ui::warn(&format!(
                "{} {} is in use by another process; close it there and retry",
                Icons::LOCK,
                path.display()
            ));
        }
        Some(Error::Corrupt { path, backup_path }) => {
            ui::error(&format!("{} is corrupt", path.display()));
            ui::hint(&format!(
                "rerun with --recover recreate to move it to {}",
                backup_path.display()
            ));
        }
        Some(Error::NotFound(path)) => {
            ui::error(&format!("No address book at {}", path.display()));
            ui::hint("rerun with --create to start a new one");
        }
        _ => ui::error(&format!("{:#}", e)),
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let file_config = config::load_config(cli.config.as_deref())?.unwrap_or_default();
    let resolved = Resolved {
        database: cli
            .database
            .clone()
            .unwrap_or_else(|| file_config.database_path()),
        create: cli.create || file_config.create.unwrap_or(false),
        policy: cli.recover.or(file_config.recovery).unwrap_or_default(),
        format: cli.format,
    };

    if let Commands::Init { force } = cli.command {
        return run_init(cli.config.as_deref(), &resolved, force);
    }

    let manager = SessionManager::sqlite();
    let session = open(&manager, &resolved)?;
    let result = dispatch(&session, &resolved, cli.command);
    let closed = manager.close(&session, true);
    result?;
    closed?;
    Ok(())
}

fn open(manager: &SessionManager, resolved: &Resolved) -> anyhow::Result<Session> {
    let options = if resolved.create {
        OpenOptions::create()
    } else {
        OpenOptions::existing()
    };
    if resolved.create {
        config::ensure_db_dir(&resolved.database)?;
    }

    let opened = match resolved.policy {
        RecoveryPolicy::Ask => manager.open(&resolved.database, options, &PromptRecovery)?,
        policy => manager.open(&resolved.database, options, &policy)?,
    };

    if let Some(report) = opened.recovery() {
        ui::warn(&format!(
            "{} Recovered corrupt address book; the damaged file is at {}",
            Icons::WRENCH,
            report.backup_path.display()
        ));
    }
    if let Opened::Ready(session) = &opened {
        tracing::debug!("Using {} (refcount {})", session.path().display(), session.refcount());
    }
    Ok(opened.into_session())
}

fn run_init(config_path: Option<&Path>, resolved: &Resolved, force: bool) -> anyhow::Result<()> {
    let config_path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(config::default_config_path);
    let config = AbstoreConfig {
        database: Some(resolved.database.display().to_string()),
        create: Some(true),
        recovery: Some(resolved.policy),
    };
    config::write_config(&config_path, &config, force)?;
    config::ensure_db_dir(&resolved.database)?;

    let manager = SessionManager::sqlite();
    let opened = manager.open(&resolved.database, OpenOptions::create(), &resolved.policy)?;
    let session = opened.into_session();
    manager.close(&session, true)?;

    match resolved.format {
        Format::Json => emit_json(&serde_json::json!({
            "config": config_path.display().to_string(),
            "database": resolved.database.display().to_string(),
        }))?,
        Format::Text => {
            ui::header(Icons::BOOK, "Address book ready");
            ui::success(&format!("Wrote {}", config_path.display()));
            ui::info("Database", &resolved.database.display().to_string());
        }
    }
    Ok(())
}

fn dispatch(session: &Session, resolved: &Resolved, command: Commands) -> anyhow::Result<()> {
    let format = resolved.format;
    match command {
        Commands::Init { .. } => anyhow::bail!("init runs without an open session"),

        Commands::Cards { all } => {
            let scope = if all { CardScope::All } else { CardScope::Cards };
            let cards = session.enumerate_cards(scope).collect::<abstore::Result<Vec<_>>>()?;
            print_cards(format, Icons::PERSON, "Cards", &cards)?;
        }

        Commands::Lists => {
            let lists = session
                .enumerate_cards(CardScope::Lists)
                .collect::<abstore::Result<Vec<_>>>()?;
            print_cards(format, Icons::LIST, "Mailing lists", &lists)?;
        }

        Commands::Members { list } => {
            let members = session.enumerate_list_addresses(list)?;
            let total = members.total();
            let cards = members.collect::<abstore::Result<Vec<_>>>()?;
            if cards.len() < total as usize {
                tracing::warn!(
                    "List {} claims {} members but only {} could be read",
                    list,
                    total,
                    cards.len()
                );
            }
            print_cards(format, Icons::LIST, &format!("Members of list {}", list), &cards)?;
        }

        Commands::Show { row, list } => {
            let card = if list {
                session.get_list_by_row_id(row)?
            } else {
                session.get_card_by_row_id(row)?
            };
            match format {
                Format::Json => emit_json(&card)?,
                Format::Text => {
                    ui::header(
                        if card.is_mail_list { Icons::LIST } else { Icons::PERSON },
                        &format!("Row {}", card.row_id),
                    );
                    ui::section("Fields");
                    for (field, value) in card.values() {
                        ui::info(field.name(), &value.to_string());
                    }
                    if let Some(total) = card.list_total {
                        ui::info("Members", &total.to_string());
                    }
                }
            }
        }

        Commands::Stats => {
            let stats = session.stats()?;
            match format {
                Format::Json => emit_json(&stats)?,
                Format::Text => {
                    ui::header(Icons::STATS, "Address book statistics");
                    println!("{}", ui::stats_table(&stats));
                }
            }
        }

        Commands::AddCard {
            first,
            last,
            email,
            nick,
            notes,
        } => {
            if let Some(existing) = session.find_card_by_email(&email)? {
                ui::warn(&format!(
                    "{} already belongs to row {}",
                    email, existing.row_id
                ));
            }
            let mut card = Card::contact(first, last, email);
            if let Some(nick) = nick {
                card.set_text(Field::NickName, nick);
            }
            if let Some(notes) = notes {
                card.set_text(Field::Notes, notes);
            }
            let row_id = session.add_card(&card)?;
            report_added(format, "card", row_id)?;
        }

        Commands::AddList {
            name,
            nick,
            description,
            members,
        } => {
            for member in &members {
                session.get_card_by_row_id(*member)?;
            }
            let row_id = session.add_list(&name, &nick, &description, &members)?;
            report_added(format, "list", row_id)?;
        }

        Commands::Retotal { list } => {
            let previous = session.list_row(list)?.list_total()?;
            let total = session.write_list_total(list)?;
            match format {
                Format::Json => emit_json(&serde_json::json!({
                    "list": list,
                    "previous": previous,
                    "total": total,
                }))?,
                Format::Text => {
                    if previous == total {
                        ui::success(&format!("List {} already has {} member(s)", list, total));
                    } else {
                        ui::success(&format!(
                            "List {} total changed from {} to {}",
                            list, previous, total
                        ));
                    }
                }
            }
        }
    }
    Ok(())
}

fn print_cards(format: Format, icon: &str, title: &str, cards: &[Card]) -> anyhow::Result<()> {
    match format {
        Format::Json => emit_json(&cards)?,
        Format::Text => {
            ui::header(icon, &format!("{} ({})", title, cards.len()));
            if cards.is_empty() {
                println!("  (none)");
            } else {
                println!("{}", ui::card_table(cards));
            }
        }
    }
    Ok(())
}

fn report_added(format: Format, kind: &str, row_id: u32) -> anyhow::Result<()> {
    match format {
        Format::Json => emit_json(&serde_json::json!({ "added": kind, "row_id": row_id })),
        Format::Text => {
            ui::success(&format!("Added {} as row {}", kind, row_id));
            Ok(())
        }
    }
}

fn emit_json<T: serde::Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
