//! cinder-cli: one-shot client for a cinder cluster.
//!
//! Builds a hash ring from the `--shards` list, routes the single
//! requested operation through the shard router, and prints the result.
//!
//! ```text
//! cinder-cli --shards s1=127.0.0.1:50051,s2=127.0.0.1:50052 set name Alice
//! cinder-cli get name
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use cinder_cluster::{HashRing, ShardRouter};
use colored::Colorize;

/// Command-line client for the cinder distributed key-value store.
#[derive(Parser)]
#[command(name = "cinder-cli", version, about)]
struct Args {
    /// Shards as comma-separated `id=host:port` pairs.
    #[arg(long, value_delimiter = ',', default_value = "shard-1=127.0.0.1:50051")]
    shards: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store a value under a key.
    Set { key: String, value: String },
    /// Fetch the value for a key.
    Get { key: String },
    /// Delete a key.
    Del { key: String },
    /// Check whether a key exists.
    Contains { key: String },
    /// Set a TTL in seconds on an existing key.
    Expire { key: String, seconds: i64 },
    /// Show the remaining TTL for a key.
    Ttl { key: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cinder=warn".into()),
        )
        .init();

    let args = Args::parse();

    let ring = Arc::new(HashRing::new());
    for pair in &args.shards {
        let Some((shard_id, address)) = pair.split_once('=') else {
            eprintln!(
                "{}",
                format!("invalid shard {pair:?}, expected id=host:port").red()
            );
            return ExitCode::FAILURE;
        };
        if !ring.add_shard(shard_id, address) {
            eprintln!("{}", format!("duplicate shard id {shard_id:?}").red());
            return ExitCode::FAILURE;
        }
    }

    let router = ShardRouter::new(ring);
    run(&router, args.command).await
}

async fn run(router: &ShardRouter, command: Command) -> ExitCode {
    match command {
        Command::Set { key, value } => {
            if router.set(&key, &value).await {
                println!("{}", "OK".green());
                ExitCode::SUCCESS
            } else {
                eprintln!("{}", "ERR set failed".red());
                ExitCode::FAILURE
            }
        }
        Command::Get { key } => match router.get(&key).await {
            Some(value) => {
                println!("{value}");
                ExitCode::SUCCESS
            }
            None => {
                println!("{}", "(nil)".dimmed());
                ExitCode::SUCCESS
            }
        },
        Command::Del { key } => {
            let found = router.delete(&key).await;
            println!("{}", if found { "1" } else { "0" });
            ExitCode::SUCCESS
        }
        Command::Contains { key } => {
            let exists = router.contains(&key).await;
            println!("{}", if exists { "true" } else { "false" });
            ExitCode::SUCCESS
        }
        Command::Expire { key, seconds } => {
            if router.expire(&key, seconds).await {
                println!("{}", "OK".green());
                ExitCode::SUCCESS
            } else {
                eprintln!("{}", "ERR expire failed".red());
                ExitCode::FAILURE
            }
        }
        Command::Ttl { key } => {
            println!("{}", router.ttl(&key).await);
            ExitCode::SUCCESS
        }
    }
}
