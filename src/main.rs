mod agent;
mod channel;
mod cli;
mod client;
mod commitment;
mod config;
mod daemon;
mod db;
mod error;
mod firewall;
mod hosts;
mod killer;
mod materialize;
mod models;
mod reconcile;
mod recovery;
mod schedule;
mod server;
mod store;
mod timerange;
mod timerjob;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use tracing::info;

use crate::cli::{BundleCommands, Cli, Commands, ScheduleCommands};
use crate::client::DaemonClient;
use crate::config::{Config, load_config, validate_config};
use crate::error::{FenceError, FenceResult};
use crate::materialize::block_windows;
use crate::models::{BlockBundle, BlockEntry, BlockSettings, PRESET_COLORS, normalize_entries, parse_blocklist};
use crate::schedule::{ALL_DAYS, DayOfWeek, WeekStart, WeeklySchedule, offset_for_week_key};
use crate::store::ScheduleStore;
use crate::timerange::{DaySchedule, TimeRange};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config).with_context(|| format!("loading config from {}", cli.config.display()))?;

    // RUST_LOG wins over the config's log_level when set
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.fence.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(config_path = %cli.config.display(), "config loaded");

    validate_config(&config).context("configuration rejected")?;

    match cli.command {
        Some(Commands::Validate) => {
            println!("Configuration is valid.");
            Ok(())
        }
        Some(Commands::Agent) | None => agent::run(config).await,
        Some(Commands::Daemon) => daemon::run(config).await,
        Some(command) => {
            if let Err(e) = run_command(command, &config).await {
                eprintln!("error: {e}");
                std::process::exit(e.exit_code());
            }
            Ok(())
        }
    }
}

async fn run_command(command: Commands, config: &Config) -> FenceResult<()> {
    match command {
        Commands::Bundle { command } => run_bundle_command(command, config).await,
        Commands::Schedule { command } => run_schedule_command(command, config).await,

        Commands::Commit { end, next_week } => {
            let store = open_store(config).await?;
            let end_date = parse_end_date(&end)?;
            let committed = commitment::commit(&store, week_offset(next_week), end_date, Utc::now()).await?;
            println!(
                "Committed week {} until {}. Loosening is now rejected.",
                committed.week_key, committed.end_date
            );
            Ok(())
        }

        Commands::Unlock => {
            let store = open_store(config).await?;
            let remaining = commitment::emergency_unlock(&store, Utc::now()).await?;
            println!("Commitment removed. {remaining} emergency unlock credits left.");
            Ok(())
        }

        Commands::Commitments => {
            let store = open_store(config).await?;
            let now = Utc::now();
            let commitments = store.list_commitments().await?;
            if commitments.is_empty() {
                println!("No commitments.");
            }
            for commitment in commitments {
                let scope = match offset_for_week_key(config.timezone(), now, &commitment.week_key) {
                    Some(0) => "this week",
                    Some(_) => "next week",
                    None => "past",
                };
                let state = if commitment.end_date > now { "active" } else { "expired" };
                println!(
                    "week {} ({scope}): {state} until {} ({} bundles)",
                    commitment.week_key,
                    commitment.end_date,
                    commitment.snapshot.len()
                );
            }
            let credits = store.unlock_credits().await?;
            println!("{credits} emergency unlock credits remaining.");
            Ok(())
        }

        Commands::Start {
            blocklist_file,
            end,
            allowlist,
            test,
        } => {
            let content = std::fs::read_to_string(&blocklist_file)
                .map_err(|e| FenceError::Validation(format!("reading {}: {e}", blocklist_file.display())))?;
            let blocklist = parse_blocklist(&content)?;
            let end_date = parse_end_date(&end)?;

            let client = DaemonClient::from_config(config);
            client
                .start_block(
                    agent::current_uid(),
                    blocklist,
                    allowlist,
                    end_date,
                    BlockSettings::default(),
                    test,
                )
                .await?;
            println!("Block running until {end_date}.");
            Ok(())
        }

        Commands::StartScheduled { segment_id, end } => {
            let end_date = parse_end_date(&end)?;
            DaemonClient::from_config(config).start_scheduled(&segment_id, end_date).await?;
            println!("Scheduled block {segment_id} running until {end_date}.");
            Ok(())
        }

        Commands::BlockAdd { blocklist_file } => {
            let content = std::fs::read_to_string(&blocklist_file)
                .map_err(|e| FenceError::Validation(format!("reading {}: {e}", blocklist_file.display())))?;
            let additions = parse_blocklist(&content)?;

            let client = DaemonClient::from_config(config);
            let status = client.status().await?;
            if !status.is_running {
                return Err(FenceError::NotFound("no block is running".to_string()));
            }
            let mut combined = status.blocklist;
            combined.extend(additions);
            let combined = normalize_entries(combined);
            let added = combined.len() - status.entry_count;
            client.update_blocklist(combined).await?;
            println!("Added {added} entries to the running block.");
            Ok(())
        }

        Commands::Extend { end } => {
            let end_date = parse_end_date(&end)?;
            DaemonClient::from_config(config).update_end_date(end_date).await?;
            println!("Block extended until {end_date}.");
            Ok(())
        }

        Commands::StopTest => {
            DaemonClient::from_config(config).stop_test_block().await?;
            println!("Test block stopped.");
            Ok(())
        }

        Commands::ClearExpired => {
            DaemonClient::from_config(config).clear_expired_block().await?;
            println!("Expired block cleared.");
            Ok(())
        }

        Commands::Status => {
            let client = DaemonClient::from_config(config);
            let version = client.version().await?;
            let status = client.status().await?;
            println!("daemon version: {version}");
            if status.is_running {
                let kind = match (status.is_test, status.is_allowlist) {
                    (true, _) => "test block",
                    (false, true) => "allowlist block",
                    (false, false) => "block",
                };
                match status.end_date {
                    Some(end) => println!("{kind} running until {end} ({} entries)", status.entry_count),
                    None => println!("{kind} running ({} entries)", status.entry_count),
                }
            } else {
                println!("no block running");
            }
            println!(
                "channels: hosts={} firewall={} killer={}",
                status.hosts_active, status.firewall_active, status.killer_active
            );
            Ok(())
        }

        #[cfg(debug_assertions)]
        Commands::ClearDebug => {
            DaemonClient::from_config(config).clear_block_for_debug().await?;
            println!("Block cleared (debug).");
            Ok(())
        }

        // Handled in main before reaching here
        Commands::Validate | Commands::Agent | Commands::Daemon => Ok(()),
    }
}

async fn run_bundle_command(command: BundleCommands, config: &Config) -> FenceResult<()> {
    let store = open_store(config).await?;

    match command {
        BundleCommands::Add {
            name,
            color,
            entries,
            entries_file,
        } => {
            let mut parsed: Vec<BlockEntry> = Vec::new();
            for entry in &entries {
                parsed.push(BlockEntry::parse(entry)?);
            }
            if let Some(path) = entries_file {
                let content = std::fs::read_to_string(&path)
                    .map_err(|e| FenceError::Validation(format!("reading {}: {e}", path.display())))?;
                parsed.extend(parse_blocklist(&content)?);
            }

            let existing = store.list_bundles().await?;
            let color =
                color.unwrap_or_else(|| PRESET_COLORS[existing.len() % PRESET_COLORS.len()].to_string());

            let mut bundle = BlockBundle::new(&name, &color);
            bundle.entries = normalize_entries(parsed);
            bundle.display_order = existing.len() as i64;
            store.add_bundle(&bundle).await?;
            println!("Created bundle '{name}' ({}) with {} entries.", bundle.id, bundle.entries.len());
            Ok(())
        }

        BundleCommands::AddStarter => {
            let mut bundle = BlockBundle::distracting_sites();
            bundle.display_order = store.list_bundles().await?.len() as i64;
            store.add_bundle(&bundle).await?;
            println!("Created bundle '{}' ({}).", bundle.name, bundle.id);
            Ok(())
        }

        BundleCommands::List => {
            let bundles = store.list_bundles().await?;
            if bundles.is_empty() {
                println!("No bundles configured.");
                return Ok(());
            }
            for bundle in bundles {
                let sites = bundle.website_entries().count();
                let apps = bundle.app_entries().count();
                let state = if bundle.enabled { "" } else { " [disabled]" };
                println!("{}  {}  ({sites} sites, {apps} apps){state}", bundle.id, bundle.name);
            }
            Ok(())
        }

        BundleCommands::Remove { bundle_id } => {
            store.remove_bundle(bundle_id, Utc::now()).await?;
            println!("Removed bundle {bundle_id}.");
            Ok(())
        }

        BundleCommands::Reorder { bundle_ids } => {
            store.reorder_bundles(&bundle_ids).await?;
            println!("Reordered {} bundles.", bundle_ids.len());
            Ok(())
        }
    }
}

async fn run_schedule_command(command: ScheduleCommands, config: &Config) -> FenceResult<()> {
    let store = open_store(config).await?;
    let tz = config.timezone();
    let now = Utc::now();

    match command {
        ScheduleCommands::Show { bundle, next_week } => {
            let bundle = resolve_bundle(&store, &bundle).await?;
            let offset = week_offset(next_week);
            let schedule = store
                .get_schedule(bundle.id, offset, now)
                .await?
                .unwrap_or_else(|| WeeklySchedule::empty(bundle.id));

            let week_start = store
                .get_setting("week_start")
                .await?
                .and_then(|v| WeekStart::parse(&v).ok())
                .unwrap_or(WeekStart::Monday);

            println!("{} ({})", bundle.name, if next_week { "next week" } else { "this week" });
            for day in week_start.ordered_days() {
                if !schedule.has_allowed_windows(day) {
                    println!("  {}: blocked all day", day.short_name());
                } else {
                    let windows: Vec<String> = schedule.day(day).ranges().iter().map(|r| r.to_string()).collect();
                    println!(
                        "  {}: allowed {} ({} min)",
                        day.short_name(),
                        windows.join(", "),
                        schedule.total_allowed_minutes(day)
                    );
                }
            }

            let windows = block_windows(&schedule, offset, tz, now);
            if windows.is_empty() {
                println!("No upcoming block windows.");
            } else {
                println!("Upcoming block windows:");
                for window in &windows {
                    println!(
                        "  {} {} -> {} ({} min)",
                        window.day.short_name(),
                        window.start.with_timezone(&tz).format("%H:%M"),
                        window.end.with_timezone(&tz).format("%a %H:%M"),
                        window.duration_minutes()
                    );
                }
            }
            Ok(())
        }

        ScheduleCommands::Allow {
            bundle,
            day,
            start,
            end,
            next_week,
        } => {
            let bundle = resolve_bundle(&store, &bundle).await?;
            let day = parse_day(&day)?;
            let range = TimeRange::from_times(&start, &end)?;
            let offset = week_offset(next_week);

            let mut schedule = store
                .get_schedule(bundle.id, offset, now)
                .await?
                .unwrap_or_else(|| WeeklySchedule::empty(bundle.id));
            schedule.add_window(day, range)?;
            store.update_schedule(&schedule, offset, now).await?;
            println!("Allowed {} on {}.", range, day.display_name());
            Ok(())
        }

        ScheduleCommands::Disallow {
            bundle,
            day,
            start,
            end,
            next_week,
        } => {
            let bundle = resolve_bundle(&store, &bundle).await?;
            let day = parse_day(&day)?;
            let range = TimeRange::from_times(&start, &end)?;
            let offset = week_offset(next_week);

            let mut schedule = store
                .get_schedule(bundle.id, offset, now)
                .await?
                .ok_or_else(|| FenceError::NotFound(format!("no schedule for '{}'", bundle.name)))?;
            if !schedule.day(day).ranges().contains(&range) {
                return Err(FenceError::NotFound(format!(
                    "no {} window on {}",
                    range,
                    day.display_name()
                )));
            }
            let mut day_schedule = schedule.day(day).clone();
            day_schedule.remove(&range);
            schedule.set_day(day, day_schedule);
            store.update_schedule(&schedule, offset, now).await?;
            println!("Removed {} from {}.", range, day.display_name());
            Ok(())
        }

        ScheduleCommands::Clear { bundle, day, next_week } => {
            let bundle = resolve_bundle(&store, &bundle).await?;
            let day = parse_day(&day)?;
            let offset = week_offset(next_week);

            let mut schedule = store
                .get_schedule(bundle.id, offset, now)
                .await?
                .unwrap_or_else(|| WeeklySchedule::empty(bundle.id));
            schedule.clear_day(day);
            store.update_schedule(&schedule, offset, now).await?;
            println!("{} is now blocked all day.", day.display_name());
            Ok(())
        }

        ScheduleCommands::CopyDay {
            bundle,
            from,
            to,
            next_week,
        } => {
            let bundle = resolve_bundle(&store, &bundle).await?;
            let from = parse_day(&from)?;
            let to = parse_day(&to)?;
            let offset = week_offset(next_week);

            let mut schedule = store
                .get_schedule(bundle.id, offset, now)
                .await?
                .ok_or_else(|| FenceError::NotFound(format!("no schedule for '{}'", bundle.name)))?;
            schedule.copy_day(from, to);
            store.update_schedule(&schedule, offset, now).await?;
            println!("Copied {} to {}.", from.display_name(), to.display_name());
            Ok(())
        }

        ScheduleCommands::Preset {
            bundle,
            preset,
            weekend,
            next_week,
        } => {
            let bundle = resolve_bundle(&store, &bundle).await?;
            let range = parse_preset(&preset)?;
            let offset = week_offset(next_week);
            let day_schedule = DaySchedule::from_ranges(vec![range])?;

            let mut schedule = store
                .get_schedule(bundle.id, offset, now)
                .await?
                .unwrap_or_else(|| WeeklySchedule::empty(bundle.id));
            if weekend {
                schedule.apply_to_weekend(&day_schedule);
            } else {
                schedule.apply_to_weekdays(&day_schedule);
            }
            store.update_schedule(&schedule, offset, now).await?;
            println!(
                "Applied {range} to {}.",
                if weekend { "the weekend" } else { "weekdays" }
            );
            Ok(())
        }

        ScheduleCommands::Status { bundle } => {
            let bundle = resolve_bundle(&store, &bundle).await?;
            match store.get_schedule(bundle.id, 0, now).await? {
                Some(schedule) => println!("{}: {}", bundle.name, schedule.status_string(tz, now)),
                None => println!("{}: no schedule this week", bundle.name),
            }
            Ok(())
        }
    }
}

async fn open_store(config: &Config) -> FenceResult<ScheduleStore> {
    let pool = db::create_agent_pool(&config.agent_db_path())
        .await
        .map_err(|e| FenceError::Transient(format!("opening agent store: {e}")))?;
    Ok(ScheduleStore::new(pool, config.timezone()))
}

async fn resolve_bundle(store: &ScheduleStore, reference: &str) -> FenceResult<BlockBundle> {
    if let Ok(id) = reference.parse() {
        if let Some(bundle) = store.get_bundle(id).await? {
            return Ok(bundle);
        }
        return Err(FenceError::NotFound(format!("bundle {reference}")));
    }
    store
        .list_bundles()
        .await?
        .into_iter()
        .find(|b| b.name.eq_ignore_ascii_case(reference))
        .ok_or_else(|| FenceError::NotFound(format!("bundle '{reference}'")))
}

/// Accepts full day names, three-letter abbreviations, and the 0..=6
/// index (0 = Sunday).
fn parse_day(value: &str) -> FenceResult<DayOfWeek> {
    if let Ok(index) = value.parse::<usize>() {
        return DayOfWeek::from_index(index);
    }
    let lower = value.to_ascii_lowercase();
    ALL_DAYS
        .into_iter()
        .find(|d| d.key() == lower || d.key().starts_with(&lower) && lower.len() == 3)
        .ok_or_else(|| FenceError::Validation(format!("unknown day '{value}'")))
}

fn parse_preset(value: &str) -> FenceResult<TimeRange> {
    match value {
        "work-hours" => Ok(TimeRange::work_hours()),
        "extended-work" => Ok(TimeRange::extended_work()),
        "waking-hours" => Ok(TimeRange::waking_hours()),
        "all-day" => Ok(TimeRange::all_day()),
        other => Err(FenceError::Validation(format!(
            "unknown preset '{other}' (expected work-hours, extended-work, waking-hours, or all-day)"
        ))),
    }
}

fn week_offset(next_week: bool) -> u8 {
    if next_week { 1 } else { 0 }
}

fn parse_end_date(value: &str) -> FenceResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| FenceError::Validation(format!("invalid end date '{value}': {e}")))
}
