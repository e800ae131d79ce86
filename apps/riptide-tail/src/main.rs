mod telemetry;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use riptide_channel::WsChannel;
use riptide_sync::{
    handler, CacheChange, CacheChangeKind, ConnectionStatus, MemoryCache, RealtimeClient,
    RealtimeConfig, ResourceKey, SharedToken,
};
use serde_json::{json, Map, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use telemetry::init_tracing;

#[derive(Parser, Debug)]
#[command(
    name = "riptide-tail",
    version,
    about = "Follow resources on a push endpoint",
    long_about = "Follow resources on a push endpoint. Pushes merge into entities \
                  loaded with --seed; pushes for unseeded resources print as \
                  `invalidated` lines, meaning the resource needs a refetch."
)]
struct Cli {
    /// WebSocket endpoint; overrides RIPTIDE_URL.
    #[arg(long)]
    url: Option<String>,

    #[arg(long, env = "RIPTIDE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Resource to follow, as `kind:id`. Repeatable.
    #[arg(long = "subscribe", value_name = "KIND:ID")]
    subscribe: Vec<ResourceKey>,

    /// JSON file mapping `kind:id` to the entity to start from.
    #[arg(long, value_name = "PATH")]
    seed: Option<PathBuf>,

    /// Tracing filter; overrides RUST_LOG.
    #[arg(long)]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let mut config = RealtimeConfig::from_env();
    if let Some(url) = cli.url {
        config.url = url;
    }
    if let Some(filter) = cli.log {
        config.log_filter = filter;
    }
    init_tracing(&config.log_filter);

    let channel = WsChannel::with_capacity(&config.url, config.event_capacity)
        .with_context(|| format!("invalid push endpoint {}", config.url))?;
    let credentials = Arc::new(SharedToken::new());
    if let Some(token) = cli.token {
        credentials.set(token);
    }
    let cache = Arc::new(MemoryCache::new());

    info!(
        url = %config.url,
        subscriptions = cli.subscribe.len(),
        max_retries = config.max_retries,
        "starting riptide-tail"
    );

    let update_events = config.update_events.clone();
    let client = RealtimeClient::new(config, Arc::new(channel), credentials, cache.clone())
        .context("building realtime client")?;

    for event in &update_events {
        let name = event.clone();
        client.on(
            event,
            handler(move |payload| {
                debug!(event = %name, %payload, "push received");
                Ok(())
            }),
        );
    }
    if let Some(path) = &cli.seed {
        let seeded = seed(&client, path)?;
        info!(path = %path.display(), entities = seeded, "cache seeded");
    }
    for key in cli.subscribe {
        client.subscribe(key);
    }

    let status = client.watch();
    client.connect().context("connecting")?;
    let outcome = follow(&client, &cache, status).await;
    client.disconnect().await;
    outcome
}

/// Runs until Ctrl-C or a connection failure that needs a manual retry.
async fn follow(
    client: &RealtimeClient,
    cache: &MemoryCache,
    mut status: watch::Receiver<ConnectionStatus>,
) -> Result<()> {
    let mut changes = client.changes();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("interrupted; disconnecting");
                return Ok(());
            }
            changed = status.changed() => {
                if changed.is_err() {
                    bail!("connection manager stopped");
                }
                let current = status.borrow_and_update().clone();
                match &current.failure {
                    Some(failure) => warn!(
                        state = %current.state,
                        attempts = current.attempts,
                        failure = %failure,
                        "connection"
                    ),
                    None => info!(state = %current.state, attempts = current.attempts, "connection"),
                }
                if current.needs_manual_retry() {
                    match current.error() {
                        Some(err) => bail!("giving up: {err}"),
                        None => bail!("giving up"),
                    }
                }
            }
            change = changes.recv() => match change {
                Ok(change) => print_change(&change, cache),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "cache change stream lagged"),
                Err(RecvError::Closed) => bail!("cache change stream closed"),
            }
        }
    }
}

/// Loads entities the way a pull would, so later pushes have something to merge into.
fn seed(client: &RealtimeClient, path: &Path) -> Result<usize> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading seed file {}", path.display()))?;
    let entities: Map<String, Value> = serde_json::from_str(&text)
        .with_context(|| format!("parsing seed file {}", path.display()))?;

    let count = entities.len();
    for (key, entity) in entities {
        let key: ResourceKey = key
            .parse()
            .with_context(|| format!("seed key {key:?} is not kind:id"))?;
        let ticket = client.begin_fetch(&key);
        client.complete_fetch(ticket, entity);
    }
    Ok(count)
}

fn print_change(change: &CacheChange, cache: &MemoryCache) {
    let (kind, fields) = match &change.kind {
        CacheChangeKind::Patched { fields } => ("patched", fields.clone()),
        CacheChangeKind::Replaced => ("replaced", Vec::new()),
        CacheChangeKind::Invalidated => ("invalidated", Vec::new()),
        CacheChangeKind::Fetched => ("fetched", Vec::new()),
    };
    let line = json!({
        "key": change.key,
        "change": kind,
        "fields": fields,
        "value": cache.value(&change.key),
    });
    println!("{line}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use riptide_sync::{ApplyOutcome, LocalChannel};

    fn client(cache: &Arc<MemoryCache>) -> RealtimeClient {
        RealtimeClient::new(
            RealtimeConfig::default(),
            Arc::new(LocalChannel::new()),
            Arc::new(SharedToken::new()),
            cache.clone(),
        )
        .expect("client")
    }

    fn seed_file(name: &str, body: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "riptide-tail-{name}-{}.json",
            std::process::id()
        ));
        std::fs::write(&path, body).expect("write seed file");
        path
    }

    #[tokio::test]
    async fn seeded_entities_take_later_pushes() {
        let cache = Arc::new(MemoryCache::new());
        let client = client(&cache);
        let path = seed_file("ok", r#"{"ticket:X-1": {"id": "X-1", "status": "open"}}"#);

        let seeded = seed(&client, &path).expect("seed");
        let _ = std::fs::remove_file(&path);
        assert_eq!(seeded, 1);

        let key = ResourceKey::new("ticket", "X-1");
        assert_eq!(cache.value(&key), Some(json!({"id": "X-1", "status": "open"})));

        let outcome = client
            .reconciler()
            .apply_event(&json!({
                "resourceKey": "ticket:X-1",
                "fieldKey": "status",
                "updateId": "1",
                "payload": "closed"
            }))
            .expect("apply");
        assert!(matches!(outcome, ApplyOutcome::Patched { .. }));
        assert_eq!(cache.value(&key), Some(json!({"id": "X-1", "status": "closed"})));
    }

    #[tokio::test]
    async fn seed_rejects_keys_without_a_kind() {
        let cache = Arc::new(MemoryCache::new());
        let client = client(&cache);
        let path = seed_file("bad-key", r#"{"X-1": {"id": "X-1"}}"#);

        let result = seed(&client, &path);
        let _ = std::fs::remove_file(&path);
        assert!(result.is_err());
        assert!(cache.is_empty());
    }
}
