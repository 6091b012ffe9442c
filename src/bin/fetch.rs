//! Fetch samples from a remote provider
//!
//! Usage: tagmon-fetch <address> [provider_id] [max_ids] [count]
//!
//! Lists up to `max_ids` metrics on the provider and prints the newest
//! `count` samples of each. `TAGMON_TOKEN` is sent when set.

use tagmon::{Client, Result};
use tracing::error;
use tracing_subscriber::EnvFilter;

fn arg_or<T: std::str::FromStr>(index: usize, default: T) -> std::result::Result<T, String> {
    match std::env::args().nth(index) {
        Some(raw) => raw.parse().map_err(|_| format!("argument {} ('{}') is invalid", index, raw)),
        None => Ok(default),
    }
}

async fn run(address: &str, provider_id: u16, max_ids: u64, count: i64) -> Result<()> {
    let mut client = Client::new();
    if let Ok(token) = std::env::var("TAGMON_TOKEN") {
        client = client.with_token(token);
    }

    let ids = client.remote_list(address, provider_id, max_ids).await?;
    println!("{} metrics on provider {} at {}", ids.len(), provider_id, address);

    for id in ids {
        let handle = client.remote_handle_create(address, provider_id, id)?;
        let fetched = handle.remote_fetch(count).await;
        handle.release()?;
        let fetched = fetched?;

        println!("{}/{} ({}): {} samples", fetched.ns, fetched.name, id, fetched.actual_count);
        for sample in &fetched.samples {
            println!("  {:.6} {} (writer {:x})", sample.time, sample.value, sample.writer);
        }
    }

    client.finalize();
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let Some(address) = std::env::args().nth(1) else {
        eprintln!("usage: tagmon-fetch <address> [provider_id] [max_ids] [count]");
        std::process::exit(2);
    };
    let parsed = (|| Ok::<_, String>((arg_or(2, 1u16)?, arg_or(3, 100u64)?, arg_or(4, 10i64)?)))();
    let (provider_id, max_ids, count) = match parsed {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
    };

    if let Err(e) = run(&address, provider_id, max_ids, count).await {
        error!("fetch failed: {}", e);
        eprintln!("fetch failed: {}", e);
        std::process::exit(1);
    }
}
