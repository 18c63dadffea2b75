//! Serves the gateway's API over TLS.
//!
//! Connections may be upgraded after a `101 Switching Protocols` response, so
//! that `exec`, `attach` and `port-forward` streams reach the cluster.

use crate::core::http::BoxBody;
use anyhow::{anyhow, ensure, Context as _, Result};
use hyper::{body::Incoming, Request, Response};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
    service::TowerToHyperService,
};
use std::{
    convert::Infallible,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    net::{TcpListener, TcpStream},
    time::{self, Duration},
};
use tokio_rustls::{
    rustls::{
        self,
        pki_types::{CertificateDer, PrivateKeyDer},
    },
    TlsAcceptor,
};
use tracing::{debug, info, info_span, Instrument};

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, clap::Args)]
pub struct ServerArgs {
    /// The address on which API requests are served.
    #[clap(long, default_value = "0.0.0.0:8443")]
    server_addr: SocketAddr,

    /// The path to a PEM-encoded private key for the serving certificate.
    #[clap(long)]
    server_tls_key: PathBuf,

    /// The path to the PEM-encoded serving certificate chain.
    #[clap(long)]
    server_tls_certs: PathBuf,
}

/// A bound TLS listener.
pub struct Server {
    listener: TcpListener,
    tls: TlsAcceptor,
}

// === impl ServerArgs ===

impl ServerArgs {
    pub async fn bind(self) -> Result<Server> {
        let tls = load_tls(&self.server_tls_key, &self.server_tls_certs).await?;
        let listener = TcpListener::bind(self.server_addr)
            .await
            .with_context(|| format!("failed to bind {}", self.server_addr))?;
        Ok(Server::new(listener, tls))
    }
}

async fn load_tls(key: &Path, certs: &Path) -> Result<Arc<rustls::ServerConfig>> {
    let key_pem = tokio::fs::read(key)
        .await
        .with_context(|| format!("failed to read {}", key.display()))?;
    let certs_pem = tokio::fs::read(certs)
        .await
        .with_context(|| format!("failed to read {}", certs.display()))?;

    let key_der = rustls_pemfile::private_key(&mut key_pem.as_slice())?
        .ok_or_else(|| anyhow!("no private key in {}", key.display()))?;
    let certs_der = rustls_pemfile::certs(&mut certs_pem.as_slice()).collect::<Result<Vec<_>, _>>()?;
    ensure!(!certs_der.is_empty(), "no certificates in {}", certs.display());

    tls_config(certs_der, key_der)
}

/// Builds a server configuration that offers both HTTP/2 and HTTP/1.1.
pub fn tls_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<rustls::ServerConfig>> {
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

// === impl Server ===

impl Server {
    pub fn new(listener: TcpListener, tls: Arc<rustls::ServerConfig>) -> Self {
        Self {
            listener,
            tls: TlsAcceptor::from(tls),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves connections until `drain` is signaled, then waits for open
    /// connections to finish their in-flight requests.
    pub async fn serve<S>(self, service: S, drain: drain::Watch)
    where
        S: tower::Service<Request<Incoming>, Response = Response<BoxBody>, Error = Infallible>
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        let Self { listener, tls } = self;
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "Gateway server listening");
        }

        let signaled = drain.clone().signaled();
        tokio::pin!(signaled);
        loop {
            let (socket, client) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        tracing::warn!(%error, "Failed to accept connection");
                        continue;
                    }
                },
                _ = &mut signaled => {
                    debug!("No longer accepting connections");
                    return;
                }
            };
            tokio::spawn(
                serve_connection(socket, tls.clone(), service.clone(), drain.clone())
                    .instrument(info_span!("conn", %client)),
            );
        }
    }
}

async fn serve_connection<S>(socket: TcpStream, tls: TlsAcceptor, service: S, drain: drain::Watch)
where
    S: tower::Service<Request<Incoming>, Response = Response<BoxBody>, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    let _ = socket.set_nodelay(true);
    let stream = match time::timeout(TLS_HANDSHAKE_TIMEOUT, tls.accept(socket)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(error)) => {
            debug!(%error, "TLS handshake failed");
            return;
        }
        Err(_) => {
            debug!("TLS handshake timed out");
            return;
        }
    };

    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder
        .serve_connection_with_upgrades(TokioIo::new(stream), TowerToHyperService::new(service));
    tokio::pin!(conn);

    let res = tokio::select! {
        res = conn.as_mut() => res,
        handle = drain.signaled() => {
            conn.as_mut().graceful_shutdown();
            handle.release_after(conn).await
        }
    };
    match res {
        Ok(()) => debug!("Connection closed"),
        Err(error) => debug!(%error, "Connection failed"),
    }
}

#[cfg(test)]
mod tests;
