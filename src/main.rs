//! COSE signing service binary.
//!
//! Wires configuration, the identity store, the protocol coordinator, the
//! SKID reconciler, and the HTTP surface together, then serves until a
//! termination signal arrives. Shutdown is cooperative: the HTTP server
//! drains in-flight requests (bounded by a hard deadline), the reconciler
//! exits at its next wakeup, and the store is released last.
use anyhow::{Context, Result};
use cose_signer::app::{build_router, AppState};
use cose_signer::client::PkiClient;
use cose_signer::config::Config;
use cose_signer::cose::CoseSigner;
use cose_signer::crypto::EcdsaCrypto;
use cose_signer::identity::IdentityHandler;
use cose_signer::observability;
use cose_signer::protocol::Protocol;
use cose_signer::reconciler::{ReconcilerProfile, SkidReconciler};
use cose_signer::store::memory::InMemoryStore;
use cose_signer::store::postgres::PostgresStore;
use cose_signer::store::IdentityStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const SERVICE_NAME: &str = "cose-signer";

/// Time after which the server is shut down forcefully if graceful shutdown
/// did not complete before.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(25);

#[tokio::main]
async fn main() -> Result<()> {
    let metrics_handle = observability::init_observability();

    let version = env!("CARGO_PKG_VERSION");
    let server_id = format!("{SERVICE_NAME}/{version}");
    tracing::info!(version, "starting COSE signing service");

    let config = Config::from_env_or_file().context("unable to load configuration")?;

    let store: Arc<dyn IdentityStore> = match &config.postgres {
        Some(pg) => Arc::new(
            PostgresStore::connect(pg)
                .await
                .context("unable to initialize postgres store")?,
        ),
        None => {
            tracing::warn!("no postgres DSN configured, using non-durable in-memory store");
            Arc::new(InMemoryStore::new())
        }
    };
    tracing::info!(
        backend = store.backend_name(),
        durable = store.is_durable(),
        "identity store ready"
    );

    let crypto = Arc::new(EcdsaCrypto);
    let protocol = Arc::new(
        Protocol::new(store, crypto.clone(), &config.secret)
            .context("unable to initialize protocol")?,
    );

    let client = Arc::new(
        PkiClient::new(
            crypto,
            config.key_service.clone(),
            config.identity_service.clone(),
            config.certificate_server.clone(),
            config.certificate_server_pubkey.clone(),
        )
        .context("unable to initialize backend client")?,
    );

    let identity_handler = Arc::new(IdentityHandler::new(
        protocol.clone(),
        client.clone(),
        config.csr_country.clone(),
        config.csr_organization.clone(),
    ));

    if !config.tokens.is_empty() {
        identity_handler
            .init_identities(&config.tokens)
            .await
            .context("identity initialization failed")?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutting down");
        let _ = shutdown_tx.send(true);
    });

    let reconciler = SkidReconciler::new(
        protocol.clone(),
        client,
        ReconcilerProfile::new(config.reload_certs_every_minute),
    );
    let reconciler_handle = tokio::spawn(reconciler.run(shutdown_rx.clone()));

    tokio::spawn(observability::serve_metrics(
        metrics_handle,
        config.metrics_addr,
        shutdown_rx.clone(),
    ));

    if config.tls {
        tracing::info!(
            cert = %config.tls_cert_file,
            key = %config.tls_key_file,
            "TLS termination is delegated to the deployment"
        );
    }

    let state = AppState {
        signer: Arc::new(CoseSigner::new(protocol)),
        identity_handler,
        register_auth: config.register_auth.clone(),
        server_id,
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.tcp_addr)
        .await
        .with_context(|| format!("bind {}", config.tcp_addr))?;
    tracing::info!(addr = %config.tcp_addr, "ready");

    let drain_rx = shutdown_rx.clone();
    let serve = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(shutdown_rx));

    tokio::select! {
        result = serve => result.context("HTTP server error")?,
        _ = async {
            shutdown_signal(drain_rx).await;
            tokio::time::sleep(SHUTDOWN_TIMEOUT).await;
        } => {
            tracing::warn!("could not gracefully shut down server before the deadline");
        }
    }

    let _ = reconciler_handle.await;
    tracing::debug!("shut down");
    Ok(())
}

async fn shutdown_signal(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Block until SIGINT or SIGTERM.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
