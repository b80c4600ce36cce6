use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "fence", about = "Focus enforcement — scheduled website and app blocking")]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, global = true, default_value = "config.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate the configuration file
    Validate,

    /// Run the user agent (schedule store, timer jobs, recovery)
    Agent,

    /// Run the privileged enforcement daemon
    Daemon,

    /// Manage block bundles
    Bundle {
        #[command(subcommand)]
        command: BundleCommands,
    },

    /// Edit weekly schedules
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommands,
    },

    /// Commit a week: the schedule may only tighten until the end date
    Commit {
        /// Commitment end, ISO-8601
        end: String,

        /// Commit next week instead of the current one
        #[arg(long)]
        next_week: bool,
    },

    /// Burn one emergency unlock credit to drop this week's commitment
    Unlock,

    /// List commitments and the weeks they cover
    Commitments,

    /// Start a block immediately from a blocklist file
    Start {
        /// Blocklist file, one entry per line
        blocklist_file: PathBuf,

        /// Block end, ISO-8601 (e.g. "2025-01-06T17:00:00+01:00")
        end: String,

        /// Enforce as an allowlist: only the listed entries stay reachable
        #[arg(long)]
        allowlist: bool,

        /// Short test block, stoppable without authorization
        #[arg(long)]
        test: bool,
    },

    /// Fire a pre-registered schedule (invoked by timer jobs)
    StartScheduled {
        /// Segment id registered with the daemon
        segment_id: String,

        /// Block end, ISO-8601
        end: String,
    },

    /// Add entries from a file to the running block (additive only)
    BlockAdd {
        /// Blocklist file, one entry per line
        blocklist_file: PathBuf,
    },

    /// Extend the running block's end date
    Extend {
        /// New end, ISO-8601; may only move forward
        end: String,
    },

    /// Stop a running test block
    StopTest,

    /// Clear a block whose end date has passed
    ClearExpired,

    /// Show daemon state
    Status,

    /// Force the daemon back to idle (debug builds only)
    #[cfg(debug_assertions)]
    ClearDebug,
}

#[derive(Subcommand)]
pub enum BundleCommands {
    /// Create a bundle from entries given inline or in a file
    Add {
        name: String,

        /// Hex color; defaults to cycling the preset palette
        #[arg(long)]
        color: Option<String>,

        /// Entry to block, repeatable (hostname, IP[/mask], app:<id>)
        #[arg(long = "entry")]
        entries: Vec<String>,

        /// Blocklist file to read entries from
        #[arg(long)]
        entries_file: Option<PathBuf>,
    },

    /// Create the starter "Distracting Sites" bundle
    AddStarter,

    /// List bundles with entry counts
    List,

    /// Remove a bundle (rejected while its week is committed)
    Remove { bundle_id: Uuid },

    /// Set bundle display order to the given id sequence
    Reorder { bundle_ids: Vec<Uuid> },
}

#[derive(Subcommand)]
pub enum ScheduleCommands {
    /// Show a bundle's week: allowed windows and the block windows they imply
    Show {
        /// Bundle name or id
        bundle: String,

        /// Operate on next week instead of the current one
        #[arg(long)]
        next_week: bool,
    },

    /// Add an allowed window to a day
    Allow {
        bundle: String,

        /// Day name (e.g. "monday")
        day: String,

        /// Window start, HH:MM
        start: String,

        /// Window end, HH:MM
        end: String,

        #[arg(long)]
        next_week: bool,
    },

    /// Remove one allowed window from a day (always permitted: tightening)
    Disallow {
        bundle: String,
        day: String,
        start: String,
        end: String,

        #[arg(long)]
        next_week: bool,
    },

    /// Clear a day entirely (blocked all day)
    Clear {
        bundle: String,
        day: String,

        #[arg(long)]
        next_week: bool,
    },

    /// Copy one day's windows to another day
    CopyDay {
        bundle: String,
        from: String,
        to: String,

        #[arg(long)]
        next_week: bool,
    },

    /// Apply a preset window set to weekdays or the weekend
    Preset {
        bundle: String,

        /// One of: work-hours, extended-work, waking-hours, all-day
        preset: String,

        /// Apply to Saturday and Sunday instead of Monday through Friday
        #[arg(long)]
        weekend: bool,

        #[arg(long)]
        next_week: bool,
    },

    /// Current allowed/blocked state for a bundle
    Status { bundle: String },
}
