//! # Meshstore Node Entry Point
//!
//! Two modes:
//!
//! ```text
//! mesh-node <config.toml>   run one node from a TOML config (blocks)
//! mesh-node                 run the built-in three-node localhost demo
//! ```
//!
//! Config fields (all optional): `node_id`, `listen_addr`, `bootstrap`,
//! `storage_root`, `enc_key_hex`. Nodes that should replicate to each other
//! must be provisioned with the same `enc_key_hex`; without one the node
//! generates a key at startup.

use std::env;
use std::io::Read;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing::{info, Level};

use mesh_common::config;
use mesh_common::crypto::generate_key;
use mesh_node::{FileServer, FileServerOpts};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();
    match args.get(1) {
        Some(path) => run_from_config(path),
        None => run_demo(),
    }
}

fn run_from_config(path: &str) -> Result<()> {
    let cfg = config::load_from_file(path).map_err(|e| anyhow!("load config {}: {}", path, e))?;
    let enc_key = cfg
        .enc_key()
        .map_err(|e| anyhow!("bad enc_key_hex: {}", e))?
        .unwrap_or_else(generate_key);

    let server = FileServer::new(FileServerOpts {
        id: cfg.node_id.clone(),
        enc_key,
        storage_root: cfg.storage_root.clone().unwrap_or_else(|| "meshstore".to_string()).into(),
        listen_addr: cfg.listen_addr.clone().unwrap_or_else(|| "127.0.0.1:3000".to_string()),
        bootstrap: cfg.bootstrap.clone().unwrap_or_default(),
    });

    info!("═══════════════════════════════════════════════");
    info!("  meshstore node");
    info!("  id:      {}", server.id());
    info!("═══════════════════════════════════════════════");

    server.start().context("file server exited")?;
    Ok(())
}

/// Three nodes on localhost: s1 and s2 stand alone, s3 bootstraps to both,
/// then replicates twenty blobs through the network and reads them back
/// after deleting its local copies.
fn run_demo() -> Result<()> {
    let s1 = demo_server("127.0.0.1:3000", &[]);
    let s2 = demo_server("127.0.0.1:7000", &[]);
    let s3 = demo_server("127.0.0.1:5000", &["127.0.0.1:3000", "127.0.0.1:7000"]);

    spawn_start(&s1);
    thread::sleep(Duration::from_millis(500));
    spawn_start(&s2);
    thread::sleep(Duration::from_secs(2));
    spawn_start(&s3);
    thread::sleep(Duration::from_secs(2));

    for i in 0..20 {
        let key = format!("picture_{}.png", i);
        let data = b"my big data file here!";

        s3.put(&key, &mut data.as_slice())
            .with_context(|| format!("put {}", key))?;
        s3.delete(&key).with_context(|| format!("delete {}", key))?;

        let mut r = s3.get(&key).with_context(|| format!("get {}", key))?;
        let mut back = Vec::new();
        r.read_to_end(&mut back)?;
        info!("recovered {} => {}", key, String::from_utf8_lossy(&back));
    }

    s1.stop();
    s2.stop();
    s3.stop();
    Ok(())
}

fn demo_server(listen_addr: &str, bootstrap: &[&str]) -> Arc<FileServer> {
    Arc::new(FileServer::new(FileServerOpts {
        id: None,
        enc_key: generate_key(),
        storage_root: format!("{}_network", listen_addr.replace(':', "_")).into(),
        listen_addr: listen_addr.to_string(),
        bootstrap: bootstrap.iter().map(|s| s.to_string()).collect(),
    }))
}

fn spawn_start(server: &Arc<FileServer>) {
    let server = Arc::clone(server);
    thread::spawn(move || {
        if let Err(e) = server.start() {
            tracing::error!("server exited: {}", e);
        }
    });
}
