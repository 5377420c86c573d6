use std::{process::ExitCode, sync::Arc, time::Duration};

use fedcache::{
    application::{
        DomainPolicy, Repositories,
        context::Context,
        dereferencing::{DerefSettings, Dereferencer, Federation, Freshness, Resolution},
        error::{AppError, ErrorReport},
        federation::TransportController,
        workers::WorkerQueue,
    },
    cache::{CacheConfig, Caches},
    config::{self, DomainCommand, ResolveArgs},
    domain::entities::{AccountRecord, ensure_fetchable_scheme, normalize_domain},
    infra::{
        convert::JsonConverter,
        db::PostgresStores,
        error::InfraError,
        media::{FsMediaManager, MediaSettings},
        memory::memory_stores,
        telemetry,
        transport::{HttpSettings, HttpTransportController},
        webfinger::WebFingerDiscovery,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;
use url::Url;

/// How long queued background work may keep the process alive after a command.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            report_application_error(&error);
            ExitCode::from(error.exit_code())
        }
    }
}

fn report_application_error(error: &AppError) {
    let report = ErrorReport::from_error("fedcache", error);
    if dispatcher::has_been_set() {
        error!(error = %report, source = report.source, "application error");
        return;
    }

    let subscriber = tracing_fmt()
        .with_max_level(Level::ERROR)
        .with_writer(std::io::stderr)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %report, source = report.source, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;
    telemetry::init(&settings.logging)?;

    match cli_args.command {
        config::Command::Resolve(args) => run_resolve(settings, args).await,
        config::Command::Plan => run_plan(&settings),
        config::Command::Domain(args) => run_domain(settings, args.command).await,
        config::Command::Migrate => run_migrate(&settings).await,
    }
}

fn run_plan(settings: &config::Settings) -> Result<(), AppError> {
    let caches = Caches::new(&CacheConfig::from(&settings.cache))?;
    println!("memory target: {} bytes", settings.cache.memory_target_bytes);
    for (name, capacity) in caches.plan().iter() {
        println!("{name:<24} {capacity}");
    }
    Ok(())
}

async fn run_migrate(settings: &config::Settings) -> Result<(), AppError> {
    let database_url = settings
        .database
        .url
        .as_ref()
        .ok_or_else(|| InfraError::configuration("database url is not configured"))?;
    let pool = PostgresStores::connect(database_url, settings.database.max_connections.get())
        .await
        .map_err(InfraError::from)?;
    PostgresStores::run_migrations(&pool)
        .await
        .map_err(InfraError::from)?;
    info!("migrations applied");
    Ok(())
}

async fn run_domain(settings: config::Settings, command: DomainCommand) -> Result<(), AppError> {
    let repositories = init_repositories(&settings).await?;
    let domains = &repositories.domains;

    match command {
        DomainCommand::Block(target) => {
            let record = domains.create_domain_block(&target.domain).await?;
            println!("blocked {}", record.domain);
        }
        DomainCommand::Allow(target) => {
            let record = domains.create_domain_allow(&target.domain).await?;
            println!("allowed {}", record.domain);
        }
        DomainCommand::Unblock(target) => {
            if !domains.delete_domain_block(&target.domain).await? {
                return Err(AppError::NotFound);
            }
            println!("unblocked {}", target.domain);
        }
        DomainCommand::Disallow(target) => {
            if !domains.delete_domain_allow(&target.domain).await? {
                return Err(AppError::NotFound);
            }
            println!("disallowed {}", target.domain);
        }
        DomainCommand::Check(target) => {
            let blocked = domains.is_domain_blocked(&target.domain).await?;
            println!(
                "{} is {} ({} mode)",
                target.domain,
                if blocked { "blocked" } else { "federating" },
                domains.mode().as_str()
            );
        }
    }
    Ok(())
}

/// What `resolve` was asked to look up.
#[derive(Debug, PartialEq, Eq)]
enum ResolveTarget {
    Uri(Url),
    Handle { username: String, domain: String },
}

fn parse_target(raw: &str) -> Result<ResolveTarget, AppError> {
    let raw = raw.trim();
    if raw.contains("://") {
        let uri = Url::parse(raw)
            .map_err(|err| AppError::validation(format!("invalid uri `{raw}`: {err}")))?;
        ensure_fetchable_scheme(&uri)?;
        return Ok(ResolveTarget::Uri(uri));
    }

    let handle = raw.strip_prefix('@').unwrap_or(raw);
    let (username, domain) = handle
        .split_once('@')
        .ok_or_else(|| AppError::validation(format!("expected @user@domain, got `{raw}`")))?;
    if username.is_empty() || domain.contains('@') {
        return Err(AppError::validation(format!(
            "expected @user@domain, got `{raw}`"
        )));
    }
    Ok(ResolveTarget::Handle {
        username: username.to_string(),
        domain: normalize_domain(domain)?,
    })
}

async fn run_resolve(settings: config::Settings, args: ResolveArgs) -> Result<(), AppError> {
    let target = parse_target(&args.target)?;
    let repositories = init_repositories(&settings).await?;

    let transports: Arc<dyn TransportController> =
        Arc::new(HttpTransportController::new(&HttpSettings {
            user_agent: settings.federation.user_agent.clone(),
            request_timeout: settings.federation.request_timeout,
            max_document_bytes: settings.federation.max_document_bytes.get(),
        })?);
    let media = FsMediaManager::new(
        &MediaSettings {
            root: settings.media.directory.clone(),
            public_base: settings.media.public_base.clone(),
            max_bytes: settings.media.max_bytes.get(),
        },
        repositories.media.clone(),
        repositories.emojis.clone(),
    )
    .map_err(InfraError::from)?;

    let workers = Arc::new(WorkerQueue::start(
        settings.workers.federator_concurrency.get() as usize,
        settings.workers.queue_capacity.get() as usize,
    ));

    let mut deref_settings = DerefSettings::new(
        settings.federation.host.clone(),
        settings.federation.account_domain.clone(),
    );
    deref_settings.freshness = settings.federation.freshness;
    deref_settings.forced_freshness = settings.federation.forced_freshness;

    let dereferencer = Dereferencer::new(
        &repositories,
        Federation {
            transports,
            discovery: Arc::new(WebFingerDiscovery::new()),
            converter: Arc::new(JsonConverter::new()),
            media: Arc::new(media),
        },
        workers.clone(),
        deref_settings,
    );

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted; cancelling resolution");
            interrupt.cancel();
        }
    });
    let cx = Context::with_cancellation(cancel);

    let result = resolve(&dereferencer, &cx, &args, target).await;

    if tokio::time::timeout(DRAIN_TIMEOUT, workers.wait_idle())
        .await
        .is_err()
    {
        warn!(pending = workers.pending(), "background work still pending at exit");
    }
    workers.shutdown().await;

    let resolution = result?;
    info!(
        uri = %resolution.entity.uri,
        refreshed = resolution.refreshed,
        "account resolved"
    );
    let rendered = serde_json::to_string_pretty(&resolution.entity)
        .map_err(|err| AppError::unexpected(format!("failed to render account: {err}")))?;
    println!("{rendered}");
    Ok(())
}

async fn resolve(
    dereferencer: &Arc<Dereferencer>,
    cx: &Context,
    args: &ResolveArgs,
    target: ResolveTarget,
) -> Result<Resolution<AccountRecord>, AppError> {
    let resolution = match target {
        ResolveTarget::Uri(uri) => {
            dereferencer
                .get_account_by_uri(cx, &args.requester, &uri)
                .await?
        }
        ResolveTarget::Handle { username, domain } => {
            dereferencer
                .get_account_by_username_domain(cx, &args.requester, &username, &domain)
                .await?
        }
    };

    if args.force && !resolution.refreshed {
        return Ok(dereferencer
            .refresh_account(cx, &args.requester, resolution.entity, None, Freshness::Forced)
            .await?);
    }
    Ok(resolution)
}

async fn init_repositories(settings: &config::Settings) -> Result<Repositories, AppError> {
    let caches = Caches::new(&CacheConfig::from(&settings.cache))?;

    let stores = match settings.database.url.as_ref() {
        Some(database_url) => {
            let pool =
                PostgresStores::connect(database_url, settings.database.max_connections.get())
                    .await
                    .map_err(InfraError::from)?;
            PostgresStores::run_migrations(&pool)
                .await
                .map_err(InfraError::from)?;
            PostgresStores::new(pool).stores()
        }
        None => {
            warn!("no database configured; state is kept in memory for this run");
            memory_stores()
        }
    };

    Ok(Repositories::new(
        caches,
        stores,
        DomainPolicy {
            mode: settings.federation.mode,
            host: settings.federation.host.clone(),
            account_domain: settings.federation.account_domain.clone(),
        },
    ))
}
