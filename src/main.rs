use anyhow::Result;
use siltdb::config::{Config, ReplicationRole};
use siltdb::engine::StorageEngine;
use siltdb::replication::{Backup, Primary};
use siltdb::server;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut config = Config::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--data-dir" => {
                config.data_dir = args.next().expect("--data-dir needs a path").into();
            }
            "--port" => {
                config.port = args.next().expect("--port needs a value").parse()?;
            }
            "--primary" => {
                let addr = args.next().expect("--primary needs backup host:port");
                config.replication = ReplicationRole::Primary {
                    backup_addr: addr.parse()?,
                };
            }
            "--backup" => {
                let addr = args.next().expect("--backup needs listen host:port");
                config.replication = ReplicationRole::Backup {
                    listen_addr: addr.parse()?,
                };
            }
            other => anyhow::bail!("unknown argument {other:?}"),
        }
    }

    let engine = StorageEngine::open(config.clone()).await?;
    tracing::info!(data_dir = ?config.data_dir, "siltdb started");

    let mut primary = None;
    let mut backup = None;
    match config.replication {
        ReplicationRole::Standalone => {}
        ReplicationRole::Primary { backup_addr } => {
            primary = Some(Primary::start(
                engine.commit_stream(),
                backup_addr,
                config.replication_reconnect_interval,
                config.replication_connect_timeout,
            ));
        }
        ReplicationRole::Backup { listen_addr } => {
            backup = Some(Backup::bind(Arc::clone(&engine), listen_addr).await?);
        }
    }

    let serve = server::start_server(Arc::clone(&engine));
    tokio::select! {
        result = serve => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
        }
    }

    if let Some(primary) = primary {
        primary.stop().await;
    }
    if let Some(backup) = backup {
        backup.stop().await;
    }
    engine.close().await?;
    Ok(())
}
