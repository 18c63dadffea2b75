use crate::{Connector, Error};
use bytes::Bytes;
use fleet_gateway_cache::ConnectionCache;
use fleet_gateway_core::{
    http::{status, BoxBody, BoxError},
    ClusterContext, KubeconfigSource, Registry, RegisterCleanuper, KUBERNETES_RUNTIME,
};
use futures::future::BoxFuture;
use http::{
    header::{self, HeaderMap, HeaderName, HeaderValue},
    uri::{Authority, PathAndQuery, Scheme},
    Request, Response, StatusCode, Uri, Version,
};
use http_body_util::BodyExt;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use std::{
    convert::Infallible,
    num::NonZeroUsize,
    sync::Arc,
    task::{Context, Poll},
};
use tokio::time::Duration;
use tracing::{info_span, Instrument};

/// Connectors to each cluster's API server, keyed by cluster name.
pub type Connectors = ConnectionCache<String, Arc<Connector>>;

#[derive(Clone, Debug)]
pub struct Config {
    pub capacity: NonZeroUsize,
    pub ttl: Duration,
    /// Whether connectors may negotiate HTTP/2 with API servers.
    pub http2: bool,
}

/// Routes each request to the API server of the cluster bound to it.
///
/// Failures are answered with a generic 502 and logged.
#[derive(Clone, Debug)]
pub struct Handler {
    connectors: Connectors,
}

const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");
const PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

const IMPERSONATE_PREFIX: &str = "impersonate-";

const HOP_BY_HOP: [HeaderName; 9] = [
    header::CONNECTION,
    KEEP_ALIVE,
    PROXY_CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

// === impl Handler ===

impl Handler {
    /// Builds a handler backed by the `kubernetes` runtime installed in
    /// `registry`.
    ///
    /// The handler's connector cache is registered with the runtime so that
    /// removed clusters' connectors are closed.
    pub fn from_registry(registry: &Registry, config: Config) -> anyhow::Result<Self> {
        let kubeconfigs = registry.lookup_interface::<dyn KubeconfigSource>(KUBERNETES_RUNTIME)?;
        let cleanup = registry.lookup_interface::<dyn RegisterCleanuper>(KUBERNETES_RUNTIME)?;

        let connectors = Self::connectors(kubeconfigs, config);
        cleanup.register_cleanuper(Arc::new(connectors.clone()));
        Ok(Self::new(connectors))
    }

    /// Builds a connector cache that reads each cluster's kubeconfig from
    /// `kubeconfigs`. Evicted connectors have all of their connections closed.
    pub fn connectors(kubeconfigs: Arc<dyn KubeconfigSource>, config: Config) -> Connectors {
        let Config {
            capacity,
            ttl,
            http2,
        } = config;
        ConnectionCache::builder(capacity, ttl)
            .on_release(|cluster, connector: Arc<Connector>, cause| {
                tracing::debug!(%cluster, ?cause, "Releasing connector");
                connector.release();
            })
            .build(move |cluster: String| {
                let kubeconfigs = kubeconfigs.clone();
                async move {
                    let kubeconfig = kubeconfigs.kubeconfig(&cluster).await?;
                    let connector = Connector::from_kubeconfig(&cluster, kubeconfig, http2).await?;
                    Ok(Arc::new(connector))
                }
            })
    }

    pub fn new(connectors: Connectors) -> Self {
        Self { connectors }
    }

    pub fn connectors_cache(&self) -> &Connectors {
        &self.connectors
    }
}

impl<B> tower::Service<Request<B>> for Handler
where
    B: http_body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    type Response = Response<BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Response<BoxBody>, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let connectors = self.connectors.clone();
        Box::pin(async move {
            let rsp = match proxy(&connectors, req).await {
                Ok(rsp) => rsp,
                Err(Error::MissingClusterContext) => {
                    tracing::error!("Request reached the proxy without a cluster context");
                    status(StatusCode::BAD_GATEWAY)
                }
                Err(error) => {
                    tracing::warn!(%error, "Failed to proxy request");
                    status(StatusCode::BAD_GATEWAY)
                }
            };
            Ok(rsp)
        })
    }
}

async fn proxy<B>(connectors: &Connectors, mut req: Request<B>) -> Result<Response<BoxBody>, Error>
where
    B: http_body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    let cluster = req
        .extensions()
        .get::<ClusterContext>()
        .ok_or(Error::MissingClusterContext)?
        .name()
        .to_string();
    let forward_error = |source: BoxError| Error::Forward {
        cluster: cluster.clone(),
        source,
    };

    let connector = connectors
        .get_or_create(cluster.clone())
        .await
        .map_err(|source| Error::Connector {
            cluster: cluster.clone(),
            source,
        })?;

    let upgrade = is_upgrade(req.headers());
    let inbound = upgrade.then(|| hyper::upgrade::on(&mut req));

    let (mut parts, body) = req.into_parts();
    parts.uri = rewrite_uri(parts.uri, connector.authority()).map_err(|e| forward_error(e.into()))?;
    parts.version = Version::HTTP_11;
    strip_hop_by_hop(&mut parts.headers, upgrade);
    parts.headers.remove(header::HOST);
    parts.headers.remove(header::AUTHORIZATION);
    if let Some(authorization) = connector.authorization() {
        parts.headers.insert(header::AUTHORIZATION, authorization.clone());
    }
    let body = body.map_err(Into::into).boxed_unsync();

    let mut rsp = connector
        .send(Request::from_parts(parts, body), upgrade)
        .await
        .map_err(|e| forward_error(e.into()))?;

    if rsp.status() == StatusCode::SWITCHING_PROTOCOLS {
        let inbound = inbound.ok_or_else(|| forward_error("unsolicited protocol switch".into()))?;
        let outbound = hyper::upgrade::on(&mut rsp);
        tokio::spawn(
            splice(inbound, outbound).instrument(info_span!("upgrade", %cluster)),
        );
    } else {
        strip_hop_by_hop(rsp.headers_mut(), false);
    }

    Ok(rsp.map(BodyExt::boxed_unsync))
}

/// Copies bytes between both upgraded connections until either side closes.
async fn splice(inbound: OnUpgrade, outbound: OnUpgrade) {
    let (inbound, outbound) = match tokio::try_join!(inbound, outbound) {
        Ok(upgraded) => upgraded,
        Err(error) => {
            tracing::info!(%error, "Connection upgrade failed");
            return;
        }
    };
    let mut inbound = TokioIo::new(inbound);
    let mut outbound = TokioIo::new(outbound);
    match tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await {
        Ok((sent, received)) => tracing::debug!(sent, received, "Upgraded connection closed"),
        Err(error) => tracing::debug!(%error, "Upgraded connection failed"),
    }
}

/// Points `uri` at the API server, keeping its path and query.
fn rewrite_uri(uri: Uri, authority: &Authority) -> Result<Uri, http::uri::InvalidUriParts> {
    let mut parts = uri.into_parts();
    parts.scheme = Some(Scheme::HTTPS);
    parts.authority = Some(authority.clone());
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some(PathAndQuery::from_static("/"));
    }
    Uri::from_parts(parts)
}

/// Returns true if the request asks to upgrade its connection.
fn is_upgrade(headers: &HeaderMap) -> bool {
    headers.contains_key(header::UPGRADE)
        && connection_tokens(headers).any(|token| token.eq_ignore_ascii_case("upgrade"))
}

/// Removes headers that apply only to a single connection.
///
/// When `upgrade` is set, `Upgrade` is kept and `Connection` is reduced to
/// `Upgrade` so the upgrade can be negotiated with the next hop. Identity headers are never removed on
/// behalf of `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap, upgrade: bool) {
    let named = connection_tokens(headers)
        .filter_map(|token| HeaderName::from_bytes(token.as_bytes()).ok())
        .filter(|name| !is_identity(name))
        .collect::<Vec<_>>();
    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        if !(upgrade && *name == header::UPGRADE) {
            headers.remove(name);
        }
    }
    if upgrade {
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    }
}

fn is_identity(name: &HeaderName) -> bool {
    *name == header::AUTHORIZATION || name.as_str().starts_with(IMPERSONATE_PREFIX)
}

fn connection_tokens(headers: &HeaderMap) -> impl Iterator<Item = &str> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}
