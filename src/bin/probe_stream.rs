//! Probe: real-time feed
//!
//! Lists the matching rules currently registered on the account, opens the feed
//! connection, and prints every delivered item with its rule tags. Useful for checking
//! credentials and seeing which tags leftover rules still carry.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;

use feedwatch::config::{AppConfig, CONFIG_PATH};
use feedwatch::feed::{FeedSignal, FeedTransport, WsFeedTransport};

#[derive(Parser)]
#[command(name = "probe_stream", about = "Dump raw items from the real-time feed")]
struct Args {
    /// Seconds to listen before disconnecting
    #[arg(long, default_value_t = 30)]
    secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = AppConfig::load(Path::new(CONFIG_PATH))?;

    println!("=== Probe: real-time feed ===");
    println!("Rules URL:  {}", config.stream.rules_url);
    println!("Stream URL: {}", config.stream.stream_url);
    println!();

    let transport = WsFeedTransport::new(&config.stream, config.api.bearer_token.clone());

    println!("--- Registered rules ---");
    let rules = transport.list_rules().await?;
    if rules.is_empty() {
        println!("  (none: the feed will deliver nothing)");
    }
    for rule in &rules {
        println!("  {} [{}] {}", rule.id, rule.tag, rule.value);
    }
    println!();

    println!("--- Listening for {} seconds ---", args.secs);
    let mut signals = transport.open_connection().await?;
    let start = Instant::now();
    let timeout = Duration::from_secs(args.secs);
    let mut item_count = 0usize;
    let mut by_tag: BTreeMap<String, usize> = BTreeMap::new();

    loop {
        let remaining = timeout.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            break;
        }
        let elapsed = start.elapsed().as_secs_f64();
        match tokio::time::timeout(remaining, signals.recv()).await {
            Ok(Some(FeedSignal::Item(item))) => {
                item_count += 1;
                let tags = item.tags();
                for tag in &tags {
                    *by_tag.entry(tag.to_string()).or_default() += 1;
                }
                let text = item.data.get("text").and_then(|v| v.as_str()).unwrap_or("");
                let shown: String = text.chars().take(120).collect();
                println!("[{elapsed:.1}s] #{item_count} tags={tags:?}: {shown}");
            }
            Ok(Some(FeedSignal::Error(e))) => println!("[{elapsed:.1}s] Feed error: {e}"),
            Ok(Some(FeedSignal::Closed)) | Ok(None) => {
                println!("[{elapsed:.1}s] Connection closed");
                break;
            }
            Err(_) => break,
        }
    }
    transport.close_connection().await?;

    println!();
    println!("--- Summary ---");
    println!("Items received: {item_count}");
    println!("Duration: {:.1}s", start.elapsed().as_secs_f64());
    for (tag, count) in &by_tag {
        println!("  {tag}: {count}");
    }
    println!();
    println!("=== Probe complete ===");
    Ok(())
}
