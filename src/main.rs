use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use dispatch::config::Config;
use dispatch::feed::{self, RefreshAll, RefreshGuard};
use dispatch::storage::{Database, FeedScope};

#[derive(Parser, Debug)]
#[command(name = "dispatch", about = "Self-hosted RSS/Atom feed reader")]
struct Args {
    /// Config file path (default: ~/.config/dispatch/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to a feed URL
    Add {
        /// URL of the RSS/Atom feed
        url: String,
    },
    /// Unsubscribe from a feed and delete its entries
    Remove { feed_id: i64 },
    /// List subscribed feeds with unread counts
    List,
    /// Fetch new entries for one feed or all feeds
    Refresh {
        /// Feed id, or "all"
        #[arg(default_value = "all")]
        target: String,

        /// Maximum concurrent fetches (overrides config)
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Show entries for one feed or all feeds
    Entries {
        /// Feed id, or "all"
        #[arg(default_value = "all")]
        target: String,

        #[arg(long, default_value_t = 1)]
        page: u32,
    },
    /// Print one entry and mark it read
    Show { entry_id: i64 },
    /// Mark every entry in a feed (or all feeds) as read
    MarkRead {
        /// Feed id, or "all"
        #[arg(default_value = "all")]
        target: String,
    },
    /// Set the feed list ordering ("title" or "recent")
    SetOrder { order: String },
    /// Pin a feed to the top of the list
    Pin {
        feed_id: i64,

        #[arg(long)]
        unpin: bool,
    },
    /// Re-resolve favicons for all feeds
    Favicons,
}

fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("dispatch"))
}

/// Parse a refresh/listing target: "all" or a numeric feed id.
fn parse_target(target: &str) -> Result<Option<i64>> {
    if target.eq_ignore_ascii_case("all") {
        return Ok(None);
    }
    let id = target
        .parse::<i64>()
        .with_context(|| format!("Invalid feed target '{}': expected a feed id or \"all\"", target))?;
    Ok(Some(id))
}

fn format_timestamp(ts: Option<i64>) -> String {
    match ts.and_then(|t| Utc.timestamp_opt(t, 0).single()) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M").to_string(),
        None => "never".to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
    }

    let config_path = args
        .config
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path).context("Failed to load configuration")?;

    let db_path = config
        .database_path
        .clone()
        .unwrap_or_else(|| config_dir.join("dispatch.db"));
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = Database::open(db_path_str)
        .await
        .context("Failed to open database")?;

    let client = reqwest::Client::builder()
        .user_agent(concat!("dispatch/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;

    match args.command {
        Command::Add { url } => {
            let feed_id = feed::subscribe(&db, &client, &url).await?;
            println!("Subscribed to {} (feed {})", url, feed_id);
        }

        Command::Remove { feed_id } => {
            let feed = db
                .get_feed(feed_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("No feed with id {}", feed_id))?;
            let removed = db.delete_feed(feed_id).await?;
            println!("Removed '{}' and {} entries", feed.title, removed);
        }

        Command::List => {
            let order = db.feed_order().await?;
            let aggregate = db.aggregate_summary().await?;
            println!(
                "{:>5}  {:>6}  {:<16}  {}",
                "id", "unread", "latest", "title"
            );
            println!(
                "{:>5}  {:>6}  {:<16}  All feeds",
                "-",
                aggregate.unread_count,
                format_timestamp(aggregate.last_new_entry)
            );
            for summary in db.list_feed_summaries(order).await? {
                let pin = if summary.feed.pinned { "*" } else { "" };
                println!(
                    "{:>5}  {:>6}  {:<16}  {}{}",
                    summary.feed.id,
                    summary.unread_count,
                    format_timestamp(summary.last_new_entry),
                    summary.feed.title,
                    pin
                );
                if let Some(error) = &summary.feed.last_error {
                    println!("       last error: {}", error);
                }
            }
        }

        Command::Refresh { target, workers } => {
            let guard = RefreshGuard::new();
            match parse_target(&target)? {
                Some(feed_id) => {
                    let outcome = feed::refresh_feed(&db, &client, &guard, feed_id).await;
                    println!("feed {}: {}", outcome.feed_id, outcome.status.message());
                }
                None => {
                    let workers = workers.unwrap_or(config.refresh_workers);
                    match feed::refresh_all(&db, &client, &guard, workers).await? {
                        RefreshAll::AlreadyRunning => {
                            println!("A full refresh is already running");
                        }
                        RefreshAll::Completed(outcomes) => {
                            for outcome in &outcomes {
                                println!(
                                    "feed {}: {}",
                                    outcome.feed_id,
                                    outcome.status.message()
                                );
                            }
                            let ok = outcomes.iter().filter(|o| o.status.is_success()).count();
                            println!("{}/{} feeds refreshed", ok, outcomes.len());
                        }
                    }
                }
            }
        }

        Command::Entries { target, page } => {
            let scope = match parse_target(&target)? {
                Some(feed_id) => FeedScope::Feed(feed_id),
                None => FeedScope::All,
            };
            let entries = db
                .entries_for_scope(scope, page, config.entries_per_page)
                .await?;
            if entries.is_empty() {
                println!("No entries on page {}", page);
            }
            for entry in entries {
                let marker = if entry.read { " " } else { "N" };
                println!(
                    "{} {:>6}  {:<16}  {}",
                    marker,
                    entry.id,
                    format_timestamp(Some(entry.published)),
                    if entry.title.is_empty() {
                        &entry.link
                    } else {
                        &entry.title
                    }
                );
            }
        }

        Command::Show { entry_id } => {
            let entry = db
                .get_entry(entry_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("No entry with id {}", entry_id))?;
            println!("{}", entry.title);
            if !entry.author.is_empty() {
                println!("by {}", entry.author);
            }
            println!("{}  {}", format_timestamp(Some(entry.published)), entry.link);
            println!();
            println!("{}", entry.content);
            db.set_entry_read(entry_id, true).await?;
        }

        Command::MarkRead { target } => {
            let scope = match parse_target(&target)? {
                Some(feed_id) => FeedScope::Feed(feed_id),
                None => FeedScope::All,
            };
            let changed = db.mark_scope_read(scope, true).await?;
            println!("Marked {} entries read", changed);
        }

        Command::SetOrder { order } => {
            let parsed = dispatch::storage::FeedOrder::parse(&order)
                .ok_or_else(|| anyhow::anyhow!("Unknown order '{}': use title or recent", order))?;
            db.set_setting(dispatch::storage::FEED_ORDER_KEY, parsed.as_str())
                .await?;
            println!("Feed list ordered by {}", parsed.as_str());
        }

        Command::Pin { feed_id, unpin } => {
            db.set_pinned(feed_id, !unpin).await?;
            println!(
                "Feed {} {}",
                feed_id,
                if unpin { "unpinned" } else { "pinned" }
            );
        }

        Command::Favicons => {
            let (updated, attempted) = feed::refresh_all_favicons(&db, &client).await;
            println!("Updated {} of {} favicons", updated, attempted);
        }
    }

    Ok(())
}
