use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;

use wirekv::log_error;
use wirekv::log_info;
use wirekv::replication::follower;
use wirekv::server::config::Config;
use wirekv::server::connection_loop::handle_client;
use wirekv::server::data::Server;
use wirekv::server::metadata::ServerMetadata;
use wirekv::storage::snapshot;

const HOST: &str = "0.0.0.0";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::new();
    let metadata = ServerMetadata::generate(&config);
    let listening_port = metadata.listening_port;
    let master_address = config.master_address();

    let server = Server::new(metadata);
    load_snapshot_if_configured(&server);

    if let Some((host, port)) = master_address {
        let server = server.clone();
        tokio::spawn(async move { follower::run(host, port, listening_port, server).await });
    }

    let addr = (HOST, listening_port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}:{}", HOST, listening_port))?;
    log_info!("listening on {}:{}", HOST, listening_port);

    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let server = server.clone();
                tokio::spawn(async move { handle_client(stream, server).await });
            }
            Err(e) => log_error!("failed to accept incoming connection: {}", e),
        }
    }
}

/// Load the configured snapshot file, if any. A missing file or a parse error is logged and
/// otherwise ignored; the server always starts up, empty if nothing could be loaded.
fn load_snapshot_if_configured(server: &Arc<Server>) {
    let Some(rdb_config) = server.metadata.rdb_config.as_ref() else {
        return;
    };
    let path = Path::new(&rdb_config.dir).join(&rdb_config.dbfilename);
    match snapshot::load_file(&path) {
        Ok(loaded) => server.load_snapshot_entries(loaded.entries),
        Err(e) => log_info!("no snapshot loaded from {}: {}", path.display(), e),
    }
}
