//! Metric provider service
//!
//! Hosts one provider behind an RPC server until interrupted.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | TAGMON_CONFIG_FILE | - | TOML service config, overridden by the variables below |
//! | TAGMON_LISTEN_ADDR | 0.0.0.0:7379 | Listen address |
//! | TAGMON_PROVIDER_ID | 1 | Provider id |
//! | TAGMON_TOKEN | - | Token required on every request |
//! | TAGMON_PROVIDER_CONFIG | - | Provider settings JSON |
//! | TAGMON_AGGREGATOR_ADDRESS_FILE | - | Aggregator address file |
//! | TAGMON_REDUCER_ADDRESS_FILE | - | Reducer address file |
//! | TAGMON_LOG_FORMAT | text | `json` for structured logs |
//! | RUST_LOG | info | Log filter |

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::sync::Arc;
use std::time::{Duration, Instant};
use tagmon::{MetricOptions, MetricType, Provider, ProviderArgs, RpcServer, ServiceConfig, TagList};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const UPTIME_PERIOD: Duration = Duration::from_secs(1);

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("TAGMON_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Seconds-since-start counter so a fresh provider has something to fetch
fn spawn_uptime_metric(provider: &Arc<Provider>) -> tagmon::Result<tokio::task::JoinHandle<()>> {
    let metric = provider.create_metric(
        "tagmon",
        "uptime_seconds",
        MetricType::Counter,
        TagList::from_slice(&["self"])?,
        MetricOptions::default().with_description("seconds since the provider started"),
    )?;
    info!(metric_id = %metric.id(), "uptime metric registered");

    let started = Instant::now();
    Ok(tokio::spawn(async move {
        let mut tick = tokio::time::interval(UPTIME_PERIOD);
        loop {
            tick.tick().await;
            if let Err(e) = metric.update(started.elapsed().as_secs_f64()) {
                warn!("uptime metric stopped: {}", e);
                break;
            }
        }
    }))
}

async fn run(config: ServiceConfig) -> tagmon::Result<()> {
    let args = ProviderArgs {
        push_finalize_callback: config.push_finalize_callback,
        token: config.token.clone(),
        config: config.provider_config.clone(),
        pool: None,
        aggregation: config.reduction_engine()?,
    };

    let server = RpcServer::bind(&config.listen_addr).await?;
    let provider = server.register_provider(config.provider_id, args)?;
    info!(
        provider_id = config.provider_id,
        address = %server.address(),
        sinks = provider.engine().sink_count(),
        reducer = provider.engine().has_reducer(),
        "provider ready"
    );

    let uptime = if config.demo_metric {
        Some(spawn_uptime_metric(&provider)?)
    } else {
        None
    };

    if let Err(e) = signal::ctrl_c().await {
        error!("failed to wait for ctrl-c: {}", e);
    }
    info!("shutting down");

    if let Some(task) = uptime {
        task.abort();
    }
    server.shutdown();
    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();

    let config = match ServiceConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {}", e);
            std::process::exit(2);
        }
    };

    if let Err(e) = run(config).await {
        error!("provider failed: {}", e);
        std::process::exit(1);
    }
}
