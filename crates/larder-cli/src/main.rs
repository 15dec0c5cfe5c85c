use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use larder_cli::{Command, Config, ParticipantsCommand, UsersCommand};
use larder_client::MyFoodRepoClient;
use larder_core::{
    AppError, DbConfig, HarvestSummary, Harvester, HttpConfig, MealService, PartnerCredentials,
    PipelineConfig, PipelineService, PipelineSummary, StoreStats, TracingReporter,
    load_pipeline_config,
};
use larder_db::{MealRepository, RecordRepository};

const RULE: &str = "════════════════════════════════════════════════════════";
const THIN_RULE: &str = "────────────────────────────────────────────────────────";

#[tokio::main]
async fn main() {
    dotenv().ok();
    let config = Config::parse();

    if let Err(e) = init_tracing(config.verbose) {
        eprintln!("Failed to initialise logging: {e}");
    }

    if let Err(e) = run(config).await {
        match e.downcast_ref::<AppError>() {
            Some(app_error) => error!("{:#}\n   {}", e, app_error.user_message()),
            None => error!("{:#}", e),
        }
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) -> anyhow::Result<()> {
    let default_directive = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    if config.command.needs_partner_api() {
        config.partner_environment()?;
    }

    let pipeline_config = match load_pipeline_config(config.config.clone())
        .context("Failed to load pipeline configuration")?
    {
        Some(file) => file.apply(PipelineConfig::default())?,
        None => PipelineConfig::default(),
    };

    let pool = larder_db::connect(&config.database, &DbConfig::default())
        .await
        .with_context(|| format!("Failed to open database {}", config.database.display()))?;
    let records = RecordRepository::new(pool.clone());
    let meals = MealRepository::new(pool);

    let cancel = shutdown_token();

    match &config.command {
        Command::Sync(args) => {
            let cohort = config.require_cohort()?;
            let pipeline = PipelineService::with_config(
                partner_client(&config)?,
                records,
                meals,
                pipeline_config.clone(),
            );
            let mode = args.mode(pipeline_config.harvest.days_window);
            info!("Syncing cohort {} ({})", cohort, mode);

            let summary = pipeline
                .run_with_progress_cancellable(cohort, mode, &TracingReporter, &cancel)
                .await?;
            if let Some(harvest) = &summary.harvest {
                print_harvest_summary(cohort, harvest);
            }
            print_meal_summary(&summary);
        }
        Command::Harvest(args) => {
            let cohort = config.require_cohort()?;
            let pipeline = PipelineService::with_config(
                partner_client(&config)?,
                records,
                meals,
                pipeline_config.clone(),
            );
            let mode = args.mode(pipeline_config.harvest.days_window);
            info!("Harvesting cohort {} ({})", cohort, mode);

            let summary = pipeline
                .harvest_and_reconcile(cohort, mode, &TracingReporter, &cancel)
                .await?;
            print_harvest_summary(cohort, &summary);
        }
        Command::Meals { participants } => {
            let service = MealService::with_config(records, meals, pipeline_config.cluster);
            let only = (!participants.is_empty()).then_some(participants.as_slice());

            let summary = service
                .rebuild_meals(only, &TracingReporter, &cancel)
                .await?;
            print_meal_summary(&summary);
        }
        Command::Users { command } => match command {
            UsersCommand::Add { participation_key } => {
                let user = meals.register_user(participation_key).await?;
                println!("{}\t{}", user.id, user.participation_key);
            }
            UsersCommand::List => {
                for user in meals.list_users().await? {
                    let last = user
                        .last_meal_log
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!("{}\t{}\t{}", user.id, user.participation_key, last);
                }
            }
        },
        Command::Participants {
            command: ParticipantsCommand::Create,
        } => {
            let cohort = config.require_cohort()?;
            let harvester =
                Harvester::with_config(partner_client(&config)?, pipeline_config.harvest);
            let participant = harvester.create_participation(cohort).await?;
            info!("Created participation {} in cohort {}", participant.id, cohort);
            println!("{}", participant.key);
        }
        Command::Stats => {
            show_stats(&records.get_stats().await?);
        }
    }

    Ok(())
}

/// A token cancelled on the first Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current step");
            token.cancel();
        }
    });
    cancel
}

fn partner_client(config: &Config) -> anyhow::Result<MyFoodRepoClient> {
    let environment = config.partner_environment()?;
    let credentials =
        PartnerCredentials::from_env().context("Partner credentials are required")?;
    let client =
        MyFoodRepoClient::for_environment(environment, &credentials, &HttpConfig::default())?;
    info!("Using MyFoodRepo {} at {}", environment, client.base_url());
    Ok(client)
}

fn print_harvest_summary(cohort: &str, summary: &HarvestSummary) {
    info!("");
    info!("{}", RULE);
    info!("Harvest complete: cohort {}", cohort);
    info!("{}", RULE);
    info!("  Participants:        {}", summary.participants);
    info!("  Harvested:           {}", summary.harvested);
    info!("  Failed:              {}", summary.failed.len());
    if let Some(reconcile) = &summary.reconcile {
        info!("{}", THIN_RULE);
        info!("  Records merged:      {}", reconcile.records);
        info!("  = Unchanged:         {}", reconcile.stats.unchanged);
        info!("  ↑ Updated:           {}", reconcile.stats.updated);
        info!("  + Created:           {}", reconcile.stats.created);
    }
    if !summary.failed.is_empty() || !summary.truncated.is_empty() {
        info!("{}", THIN_RULE);
        for key in &summary.failed {
            error!("  - {}: harvest failed", key);
        }
        for (key, termination) in &summary.truncated {
            warn!("  - {}: pagination stopped early ({:?})", key, termination);
        }
    }
    if summary.cancelled {
        warn!("Harvest was cancelled; no records were merged");
    }
    info!("{}", RULE);
}

fn print_meal_summary(summary: &PipelineSummary) {
    let (created, updated) = summary.meals_written();
    let failed = summary.failed_users();

    info!("");
    info!("{}", RULE);
    info!("Meal synchronization complete");
    info!("{}", RULE);
    info!("  Users synced:        {}", summary.synced());
    info!("  Not registered:      {}", summary.unknown_users());
    info!("  Failed:              {}", failed.len());
    info!("{}", THIN_RULE);
    info!("  + Meals created:     {}", created);
    info!("  ↑ Meals updated:     {}", updated);
    for key in &failed {
        error!("  - {}: synchronization failed", key);
    }
    if summary.cancelled {
        warn!("Run was cancelled before every user was synchronized");
    }
    info!("{}", RULE);
}

fn show_stats(stats: &StoreStats) {
    println!("\nLarder Statistics\n");
    println!("  Intake records:        {}", stats.records);
    println!("  Participants:          {}", stats.participants);
    println!("  Registered users:      {}", stats.users);
    println!("  Meals:                 {}", stats.meals);
    if let Some(last_meal) = stats.last_meal {
        println!("  Latest meal:           {}", last_meal);
    }
    println!();
}
