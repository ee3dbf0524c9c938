//! mcptap entry point: CLI parsing, tracing setup, and wiring of the
//! store, event bus, approval manager, and interceptor chain around the
//! streaming proxy.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use mcptap_core::approval::ApprovalManager;
use mcptap_core::bus::EventBus;
use mcptap_core::intercept::{
    ApprovalInterceptor, Interceptor, InterceptorChain, LoggingInterceptor, PolicyInterceptor,
    PruneConfig, ScrubInterceptor, ToolAnalyticsInterceptor,
};
use mcptap_core::policy::{self, Engine, PolicyConfig};
use mcptap_core::store::{
    ApprovalEvent, ApprovalEventKind, ApprovalRecord, MessageStore, SqliteStore, StoreConfig,
};

use mcptap::cli::Cli;
use mcptap::proxy::{Proxy, ProxyConfig};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    std::process::exit(run(cli, cancel).await);
}

async fn run(cli: Cli, cancel: CancellationToken) -> i32 {
    // Store open failure is fatal: without persistence there is no point
    // running the proxy at all.
    let store: Arc<dyn MessageStore> =
        match SqliteStore::open(&cli.db, StoreConfig::default()) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                tracing::error!(error = %e, "failed to initialize store");
                eprintln!("mcptap: {e}");
                return 1;
            }
        };

    let bus = EventBus::new(mcptap_core::bus::DEFAULT_BUFFER);

    let mut interceptors: Vec<Arc<dyn Interceptor>> = Vec::new();

    // Policy interceptor, only when a policy file is given.
    let mut policy_cfg: Option<PolicyConfig> = None;
    if let Some(path) = &cli.policy {
        match policy::loader::load(path) {
            Ok(cfg) => {
                tracing::info!(path = %path.display(), rules = cfg.rules.len(), "policy loaded");
                interceptors.push(Arc::new(PolicyInterceptor::new(Engine::new(
                    cfg.rules.clone(),
                ))));
                policy_cfg = Some(cfg);
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to load policy");
                eprintln!("mcptap: {e}");
                return 1;
            }
        }
    }

    // Scrubber: the CLI flag or the policy file enables it; custom patterns
    // come from the policy file.
    let scrub_enabled = cli.scrub_pii
        || policy_cfg
            .as_ref()
            .is_some_and(|cfg| cfg.scrubber.enabled);
    let custom_patterns = policy_cfg
        .map(|cfg| cfg.scrubber.custom_patterns)
        .unwrap_or_default();
    interceptors.push(Arc::new(ScrubInterceptor::new(
        scrub_enabled,
        &custom_patterns,
    )));

    // Approval manager; new tickets fan out to dashboard subscribers and
    // land in the audit trail.
    let manager = ApprovalManager::new(Duration::from_secs(cli.approval_timeout_secs));
    {
        let bus = bus.clone();
        let store = Arc::clone(&store);
        manager.set_hook(move |ticket| {
            let record = ApprovalRecord::from(ticket);
            if let Err(e) = store.log_approval(&record) {
                tracing::debug!(error = %e, "failed to record approval request");
            }
            bus.publish_approval(Arc::new(ApprovalEvent {
                kind: ApprovalEventKind::Requested,
                record,
            }));
        });
    }
    interceptors.push(Arc::new(ApprovalInterceptor::new(manager.clone())));

    // Tool analytics with optional pruning.
    interceptors.push(Arc::new(ToolAnalyticsInterceptor::new(
        Arc::clone(&store),
        PruneConfig {
            unused_sessions: cli.prune_unused,
            keep_top_k: cli.prune_keep_top,
            always_keep: cli.prune_keep_list(),
        },
    )));

    // Logger goes last so it records the final enriched state.
    interceptors.push(Arc::new(LoggingInterceptor::new(
        Arc::clone(&store),
        bus.clone(),
    )));

    let chain = Arc::new(InterceptorChain::new(interceptors));

    let command = cli.command[0].clone();
    let args = cli.command[1..].to_vec();
    let proxy = Proxy::new(
        ProxyConfig {
            command,
            args,
            session_id: cli.session_id,
            max_message_bytes: cli.max_message_bytes,
        },
        chain,
        Arc::clone(&store),
        bus,
    );

    tracing::info!(session = proxy.session_id(), "proxy starting");
    let code = match proxy.run(cancel).await {
        Ok(status) => status.code().unwrap_or(1),
        Err(e) => {
            tracing::error!(error = %e, "proxy exited");
            eprintln!("mcptap: {e}");
            1
        }
    };

    store.close();
    code
}

/// Bind the root cancellation token to SIGINT and SIGTERM.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = term.recv() => {}
                    }
                }
                Err(_) => {
                    let _ = ctrl_c.await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }

        tracing::info!("shutdown signal received");
        cancel.cancel();
    });
}

/// Tracing goes to stderr — stdout belongs to the JSON-RPC stream.
fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
