//! Top-level server: wires configuration into a `Service` and drives the HTTP and gRPC
//! facades concurrently until a shutdown signal arrives.
//!
//! Grounded on the teacher's `kubernetes/server/mod.rs`: directories created up front,
//! signal racing via `tokio::select!` against the listening future(s).
//!
//! Deviation: axum (hyper 1.x) and tonic (its own, older hyper-based transport) cannot
//! share one TCP listener without a custom protocol multiplexer, so HTTP listens on
//! `server_port` and gRPC on `server_port + 1`; both are still raced from the same
//! `tokio::select!`.

use crate::{config::Config, logging, oci_runtime::OCIRuntimeBuilder, service::Service};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;

/// Server owns the configuration and drives startup/shutdown of both facades.
pub struct Server {
    config: Config,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run the server to completion: create working directories, bind both facades and
    /// race them against SIGINT/SIGTERM.
    pub async fn start(self) -> Result<()> {
        logging::init(&self.config).context("init logging")?;

        for dir in [
            self.config.images_dir(),
            self.config.overlayfs_dir(),
            self.config.storage_dir(),
            self.config.libcontainer_dir(),
            self.config.rootfs_dir(),
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create directory {}", dir.display()))?;
        }

        let runtime_binary =
            which::which("runc").context("locate runc binary on PATH")?;
        let runtime = OCIRuntimeBuilder::default()
            .binary(runtime_binary)
            .build()
            .context("build OCI runtime")?;

        let service = Arc::new(Service::new(&self.config, runtime));

        let http_addr = format!("0.0.0.0:{}", self.config.server_port());
        let http_listener = TcpListener::bind(&http_addr)
            .await
            .with_context(|| format!("bind HTTP listener on {}", http_addr))?;
        log::info!("HTTP facade listening on {}", http_addr);

        let grpc_addr: std::net::SocketAddr = format!("0.0.0.0:{}", self.config.server_port() + 1)
            .parse()
            .context("parse gRPC listen address")?;
        log::info!("gRPC facade listening on {}", grpc_addr);

        let http_server = axum::serve(http_listener, crate::service::http::router(service.clone()));

        let grpc_server = tonic::transport::Server::builder()
            .add_service(crate::castapi::exec_service_server::ExecServiceServer::new(
                service.clone(),
            ))
            .add_service(crate::castapi::done_service_server::DoneServiceServer::new(
                service.clone(),
            ))
            .serve(grpc_addr);

        let shutdown = service.shutdown_token();
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("install SIGTERM handler")?;

        tokio::select! {
            res = http_server => res.context("HTTP facade exited")?,
            res = grpc_server => res.context("gRPC facade exited")?,
            _ = tokio::signal::ctrl_c() => {
                log::info!("received SIGINT, cancelling in-flight sandboxes and shutting down");
                shutdown.cancel();
            }
            _ = sigterm.recv() => {
                log::info!("received SIGTERM, cancelling in-flight sandboxes and shutting down");
                shutdown.cancel();
            }
        }

        Ok(())
    }
}
