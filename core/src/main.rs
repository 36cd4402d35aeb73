//! FS2 command line
//!
//! Run either role of the peer-to-peer file sharing system:
//!
//!   fs2 --client --share name=/path [--indexnode URL]   # share and download
//!   fs2 --indexnode --port 42424                        # run an indexnode

use std::env;
use std::path::PathBuf;

use fs2_core::{ClientConfig, ClientNode, IndexNode, IndexnodeConfig};

fn print_usage() {
    println!("FS2 v0.1.0 - peer-to-peer file sharing");
    println!();
    println!("Usage:");
    println!("  fs2 --client [options]            Run the client role");
    println!("  fs2 --indexnode [options]         Run a dedicated indexnode");
    println!();
    println!("Client options:");
    println!("  --alias <NAME>                    Alias shown to peers");
    println!("  --port <PORT>                     Share server port (default 41234)");
    println!("  --share <NAME>=<PATH>             Export a directory (repeatable)");
    println!("  --indexnode-url <URL>             Register with this indexnode (repeatable)");
    println!("  --download-dir <PATH>             Where downloads land");
    println!("  --data-dir <PATH>                 State directory (queue, stats, file lists)");
    println!("  --upload-bps <N>                  Network budget in bytes/sec (0 = unlimited)");
    println!("  --auto-indexnode                  Participate in auto-indexnode election");
    println!();
    println!("Indexnode options:");
    println!("  --port <PORT>                     Listen port (default 42424)");
    println!("  --alias <NAME>                    Indexnode name");
    println!("  --no-advertise                    Do not broadcast adverts");
    println!();
    println!("Environment:");
    println!("  RUST_LOG                          Log level (e.g. info, debug)");
}

fn arg_value(args: &[String], name: &str) -> Option<String> {
    args.windows(2)
        .find(|w| w[0] == name)
        .map(|w| w[1].clone())
}

fn arg_values(args: &[String], name: &str) -> Vec<String> {
    args.windows(2)
        .filter(|w| w[0] == name)
        .map(|w| w[1].clone())
        .collect()
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let client_mode = args.iter().any(|a| a == "--client" || a == "-c");
    let indexnode_mode = args.iter().any(|a| a == "--indexnode" || a == "-i");

    if client_mode == indexnode_mode {
        print_usage();
        println!();
        println!("Pick exactly one of --client or --indexnode.");
        return;
    }

    if indexnode_mode {
        run_indexnode(&args).await;
    } else {
        run_client(&args).await;
    }
}

async fn run_indexnode(args: &[String]) {
    let mut config = IndexnodeConfig::new();
    if let Some(port) = arg_value(args, "--port").and_then(|p| p.parse().ok()) {
        config = config.with_port(port);
    }
    if let Some(alias) = arg_value(args, "--alias") {
        config = config.with_alias(alias);
    }
    if args.iter().any(|a| a == "--no-advertise") {
        config = config.without_adverts();
    }

    let node = match IndexNode::start(config).await {
        Ok(node) => node,
        Err(e) => {
            eprintln!("Failed to start indexnode: {}", e);
            std::process::exit(1);
        }
    };
    println!("Indexnode running on {}", node.local_addr());
    println!("Press Ctrl+C to stop...");

    let _ = tokio::signal::ctrl_c().await;
    println!("Shutting down...");
    node.shutdown().await;
}

async fn run_client(args: &[String]) {
    let mut config = ClientConfig::new();
    if let Some(alias) = arg_value(args, "--alias") {
        config = config.with_alias(alias);
    }
    if let Some(port) = arg_value(args, "--port").and_then(|p| p.parse().ok()) {
        config = config.with_port(port);
    }
    if let Some(dir) = arg_value(args, "--data-dir") {
        config = config.with_data_dir(PathBuf::from(dir));
    }
    if let Some(dir) = arg_value(args, "--download-dir") {
        config = config.with_download_dir(PathBuf::from(dir));
    }
    if let Some(bps) = arg_value(args, "--upload-bps").and_then(|v| v.parse().ok()) {
        config = config.with_network_bytes_per_sec(bps);
    }
    if args.iter().any(|a| a == "--auto-indexnode") {
        config = config.with_auto_indexnode(true);
    }
    for url in arg_values(args, "--indexnode-url") {
        config = config.with_indexnode(url);
    }

    let shares: Vec<(String, PathBuf)> = arg_values(args, "--share")
        .into_iter()
        .filter_map(|spec| {
            let (name, path) = spec.split_once('=')?;
            if name.is_empty() || path.is_empty() {
                eprintln!("Ignoring malformed --share '{}'", spec);
                return None;
            }
            Some((name.to_string(), PathBuf::from(path)))
        })
        .collect();

    let client = match ClientNode::start(config).await {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Failed to start client: {}", e);
            std::process::exit(1);
        }
    };

    for (name, path) in shares {
        if let Err(e) = client.add_share(&name, path.clone()).await {
            eprintln!("Could not share {} ({}): {}", name, path.display(), e);
        }
    }

    println!("Client '{}' running on port {}", client.alias(), client.port());
    println!("State: {}", client.data_dir().display());
    println!("Press Ctrl+C to stop...");

    let _ = tokio::signal::ctrl_c().await;
    println!("Shutting down...");
    client.shutdown().await;
}
