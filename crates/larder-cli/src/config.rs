use clap::{Args, Parser, Subcommand};
use larder_core::{AppError, HarvestMode, PartnerEnvironment};
use std::path::PathBuf;
use std::sync::LazyLock;

static VERSION_INFO: LazyLock<String> = LazyLock::new(|| {
    let version = env!("CARGO_PKG_VERSION");

    let commit = option_env!("VERGEN_GIT_SHA")
        .map(|s| s.chars().take(7).collect::<String>())
        .unwrap_or_else(|| "unknown".to_string());
    let dirty = match option_env!("VERGEN_GIT_DIRTY") {
        Some("true") => " (dirty)",
        _ => "",
    };

    let built = option_env!("VERGEN_BUILD_DATE").unwrap_or("unknown");
    let target = option_env!("VERGEN_CARGO_TARGET_TRIPLE").unwrap_or("unknown");
    let rustc = option_env!("VERGEN_RUSTC_SEMVER").unwrap_or("unknown");

    format!("{version}\ncommit: {commit}{dirty}\nbuilt: {built}\ntarget: {target}\nrustc: {rustc}")
});

pub fn version_info() -> &'static str {
    &VERSION_INFO
}

/// CLI configuration parsed from command line arguments and environment variables
#[derive(Parser, Debug)]
#[command(name = "larder")]
#[command(
    author,
    version = version_info(),
    about = "Harvests MyFoodRepo intakes and rebuilds participants' meals"
)]
#[command(after_help = "Examples:
  larder users add 3f9c-k3y          # register a participant before syncing
  larder sync                        # last 3 days, full pipeline
  larder sync --full-sync            # every annotation ever recorded
  larder harvest --days 7            # refresh the record set only
  larder meals --participant 3f9c-k3y
  larder stats

Commands that reach MyFoodRepo need the deployment (--env or MFR_DATA_ENV)
and credentials from MFR_UID, MFR_CLIENT and MFR_ACCESS_TOKEN
(a .env file in the working directory is loaded first).")]
pub struct Config {
    /// SQLite database holding records, users and meals
    #[arg(long, env = "LARDER_DATABASE", default_value = "larder.db", global = true)]
    pub database: PathBuf,

    /// Pipeline tuning file (defaults to ~/.config/larder/larder.toml)
    #[arg(long, env = "LARDER_CONFIG", value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Cohort to harvest
    #[arg(long, env = "MFR_COHORT_ID", global = true)]
    pub cohort: Option<String>,

    /// MyFoodRepo deployment: local, staging or production
    #[arg(long = "env", env = "MFR_DATA_ENV", value_name = "ENV", global = true)]
    pub environment: Option<String>,

    /// Log debug output (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Config {
    /// The cohort id, required by every command that talks to the partner API.
    pub fn require_cohort(&self) -> anyhow::Result<&str> {
        self.cohort
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("No cohort given. Use --cohort or set MFR_COHORT_ID"))
    }

    /// The partner deployment. Absent or unknown values are a
    /// configuration error; nothing falls back to a default host.
    pub fn partner_environment(&self) -> Result<PartnerEnvironment, AppError> {
        PartnerEnvironment::resolve(self.environment.as_deref())
    }
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Harvest, reconcile, cluster and synchronize meals
    Sync(HarvestArgs),
    /// Harvest and reconcile only; meals are left untouched
    Harvest(HarvestArgs),
    /// Rebuild meals from the stored record set without network access
    #[command(after_help = "Examples:
  larder meals                         # every participant on record
  larder meals --participant k1 -p k2  # only these participants")]
    Meals {
        /// Participation key to rebuild (repeatable)
        #[arg(short, long = "participant", value_name = "KEY")]
        participants: Vec<String>,
    },
    /// Manage registered users
    Users {
        #[command(subcommand)]
        command: UsersCommand,
    },
    /// Manage cohort participations
    Participants {
        #[command(subcommand)]
        command: ParticipantsCommand,
    },
    /// Show record, user and meal counts
    Stats,
}

impl Command {
    /// Whether the command talks to the partner API.
    pub fn needs_partner_api(&self) -> bool {
        matches!(
            self,
            Command::Sync(_) | Command::Harvest(_) | Command::Participants { .. }
        )
    }
}

#[derive(Subcommand, Debug)]
pub enum UsersCommand {
    /// Register a user for a participation key
    Add {
        #[arg(value_name = "KEY")]
        participation_key: String,
    },
    /// List registered users
    List,
}

#[derive(Subcommand, Debug)]
pub enum ParticipantsCommand {
    /// Create a new participation in the cohort and print its key
    Create,
}

/// Harvest window selection shared by `sync` and `harvest`.
#[derive(Args, Debug, Clone, Default)]
pub struct HarvestArgs {
    /// Fetch every annotation instead of the recent window
    #[arg(long)]
    pub full_sync: bool,

    /// Look-back of a windowed harvest, in days
    #[arg(long, value_name = "N", conflicts_with = "full_sync")]
    pub days: Option<u32>,
}

impl HarvestArgs {
    /// Resolves the harvest mode; `default_days` comes from the pipeline config.
    pub fn mode(&self, default_days: u32) -> HarvestMode {
        if self.full_sync {
            HarvestMode::Full
        } else {
            HarvestMode::Windowed {
                days: self.days.unwrap_or(default_days),
            }
        }
    }
}
