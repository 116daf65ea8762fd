//! Tour of the gateway against a real RouterOS device.
//!
//! Lists interfaces, addresses, blocks, bandwidth limits, the radio and
//! backups. With `--write` it also blocks and unblocks a test domain and
//! saves a backup into the current directory.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example router_tour -- --host 192.168.88.1 --user admin --password secret
//! cargo run --example router_tour -- --host 192.168.88.1 --user admin --key ~/.ssh/id_ed25519 --write
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use netez::{AuthMethod, BlockDuration, Gateway};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging (set RUST_LOG=debug for verbose output)
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let auth = if let Some(password) = &args.password {
        AuthMethod::password(password)
    } else if let Some(path) = &args.key {
        AuthMethod::PrivateKey {
            path: path.clone(),
            passphrase: None,
        }
    } else {
        eprintln!("Error: Must provide either --password or --key");
        std::process::exit(1);
    };

    let gateway = Gateway::builder()
        .connect_timeout(Duration::from_secs(args.timeout))
        .index_path("router_tour_blocks.json")
        .build();

    println!("Connecting to {}:{}...", args.host, args.port);
    let connected = gateway
        .connect(&args.host, args.port, &args.user, auth)
        .await?;
    println!("Connected as {} (epoch {})", connected.username, connected.epoch);

    println!("\nInterfaces");
    println!("{}", "-".repeat(50));
    for iface in gateway.list_interfaces().await? {
        println!(
            "{:<16} {:<10} enabled={} running={}",
            iface.name,
            iface.kind.as_deref().unwrap_or("-"),
            iface.enabled,
            iface.running
        );
    }

    println!("\nAddresses");
    println!("{}", "-".repeat(50));
    for address in gateway.list_addresses().await? {
        match (address.address, address.prefix_len) {
            (Some(ip), Some(len)) => println!(
                "{ip}/{len} on {}",
                address.interface.as_deref().unwrap_or("-")
            ),
            _ => println!("{} (unparsed)", address.reference.id),
        }
    }

    println!("\nBandwidth limits");
    println!("{}", "-".repeat(50));
    for limit in gateway.list_bandwidth_limits().await? {
        let rate = |t: Option<netez::resources::Throughput>| {
            t.map(|t| t.to_string()).unwrap_or_else(|| "-".into())
        };
        println!(
            "{:<24} up={} down={}",
            limit.name,
            rate(limit.upload),
            rate(limit.download)
        );
    }

    println!("\nWireless");
    println!("{}", "-".repeat(50));
    match gateway.list_wireless().await {
        Ok(radios) => {
            for radio in radios {
                println!(
                    "{:<10} ssid={}",
                    radio.name,
                    radio.ssid.as_deref().unwrap_or("-")
                );
            }
        }
        Err(e) => println!("no wireless package: {e}"),
    }

    if args.write {
        println!("\nBlocking example.com for one hour...");
        let block = gateway
            .block_domain("example.com", None, "1h".parse::<BlockDuration>()?)
            .await?;
        for view in gateway.list_blocks().await? {
            println!(
                "{:<24} filters={} enforced={}",
                view.domain, view.filter_count, view.enforced
            );
        }
        gateway.unblock_domain(&block).await?;
        println!("Unblocked.");

        println!("\nSaving backup...");
        let file = gateway.create_backup("router-tour").await?;
        let saved = gateway.fetch_backup_to(&file, Path::new(".")).await?;
        println!("Backup written to {}", saved.display());
    }

    println!("\nBackups: {:?}", gateway.list_backups().await?);

    println!("\nClosing connection...");
    gateway.disconnect().await?;
    println!("Done!");

    Ok(())
}

/// Simple argument parser (avoiding external dependencies)
struct Args {
    host: String,
    port: u16,
    user: String,
    password: Option<String>,
    key: Option<PathBuf>,
    timeout: u64,
    write: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = env::args().collect();
        let mut parsed = Self {
            host: "192.168.88.1".to_string(),
            port: 22,
            user: "admin".to_string(),
            password: None,
            key: None,
            timeout: 10,
            write: false,
        };

        let mut i = 1;
        while i < args.len() {
            let value = args.get(i + 1).cloned();
            match args[i].as_str() {
                "--host" | "-h" => {
                    parsed.host = value.unwrap_or(parsed.host);
                    i += 1;
                }
                "--port" | "-p" => {
                    parsed.port = value.and_then(|v| v.parse().ok()).unwrap_or(22);
                    i += 1;
                }
                "--user" | "-u" => {
                    parsed.user = value.unwrap_or(parsed.user);
                    i += 1;
                }
                "--password" | "-P" => {
                    parsed.password = value;
                    i += 1;
                }
                "--key" | "-k" => {
                    parsed.key = value.map(PathBuf::from);
                    i += 1;
                }
                "--timeout" | "-t" => {
                    parsed.timeout = value.and_then(|v| v.parse().ok()).unwrap_or(10);
                    i += 1;
                }
                "--write" => parsed.write = true,
                "--help" => {
                    println!(
                        "router_tour [--host H] [--port P] [--user U] (--password P | --key PATH) [--timeout SECS] [--write]"
                    );
                    std::process::exit(0);
                }
                other => eprintln!("Unknown argument: {other}"),
            }
            i += 1;
        }
        parsed
    }
}
