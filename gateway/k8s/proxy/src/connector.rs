use crate::{dialer::Dialer, Error};
use bytes::Bytes;
use fleet_gateway_core::{http::BoxError, Kubeconfig};
use http::{header::HeaderValue, uri::Authority, Request, Response};
use http_body_util::combinators::UnsyncBoxBody;
use hyper::body::Incoming;
use hyper_rustls::HttpsConnector;
use hyper_util::{client::legacy::Client, rt::TokioExecutor};
use kube::{client::ConfigExt, config::KubeConfigOptions};
use secrecy::ExposeSecret;
use std::fmt;

/// The body of requests forwarded to a cluster.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

type HttpsClient = Client<HttpsConnector<Dialer>, ProxyBody>;

/// Everything needed to forward requests to one cluster's API server.
///
/// Requests that upgrade the connection are sent over a separate HTTP/1-only
/// client, since upgrades cannot be carried over HTTP/2.
pub struct Connector {
    cluster: String,
    authority: Authority,
    authorization: Option<HeaderValue>,
    client: HttpsClient,
    upgrade_client: HttpsClient,
    dialer: Dialer,
}

// === impl Connector ===

impl Connector {
    /// Builds a connector from a cluster's kubeconfig.
    ///
    /// When `http2` is false, only HTTP/1.1 is negotiated with the cluster.
    pub async fn from_kubeconfig(
        cluster: &str,
        kubeconfig: Kubeconfig,
        http2: bool,
    ) -> Result<Self, Error> {
        let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|error| Error::Config(error.into()))?;

        if config.cluster_url.scheme() != Some(&http::uri::Scheme::HTTPS) {
            return Err(Error::Config(
                format!("cluster server {} must use https", config.cluster_url).into(),
            ));
        }
        let authority = config
            .cluster_url
            .authority()
            .cloned()
            .ok_or_else(|| Error::Config("cluster server has no host".into()))?;

        let authorization = match bearer_token(&config.auth_info).await? {
            Some(token) => {
                let mut value = HeaderValue::try_from(format!("Bearer {token}"))
                    .map_err(|error| Error::Config(error.into()))?;
                value.set_sensitive(true);
                Some(value)
            }
            None => None,
        };

        let mut tls = config
            .rustls_client_config()
            .map_err(|error| Error::Config(error.into()))?;
        // ALPN is configured by the connector builder.
        tls.alpn_protocols.clear();

        let dialer = Dialer::new(config.connect_timeout);
        let upgrade_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls.clone())
            .https_only()
            .enable_http1()
            .wrap_connector(dialer.clone());
        let connector = if http2 {
            hyper_rustls::HttpsConnectorBuilder::new()
                .with_tls_config(tls)
                .https_only()
                .enable_http1()
                .enable_http2()
                .wrap_connector(dialer.clone())
        } else {
            upgrade_connector.clone()
        };

        tracing::debug!(%cluster, %authority, http2, "Built connector");
        Ok(Self {
            cluster: cluster.to_string(),
            authority,
            authorization,
            client: Client::builder(TokioExecutor::new()).build(connector),
            upgrade_client: Client::builder(TokioExecutor::new()).build(upgrade_connector),
            dialer,
        })
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// The API server's host and port.
    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// The credentials the proxy presents to the API server, if the kubeconfig
    /// configures a bearer token.
    pub fn authorization(&self) -> Option<&HeaderValue> {
        self.authorization.as_ref()
    }

    pub(crate) async fn send(
        &self,
        req: Request<ProxyBody>,
        upgrade: bool,
    ) -> Result<Response<Incoming>, hyper_util::client::legacy::Error> {
        if upgrade {
            self.upgrade_client.request(req).await
        } else {
            self.client.request(req).await
        }
    }

    /// Closes every connection to the cluster, including idle pooled
    /// connections and upgraded streams.
    pub fn release(&self) {
        tracing::debug!(
            cluster = %self.cluster,
            connections = self.dialer.open_connections(),
            "Closing connections"
        );
        self.dialer.close_all();
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("cluster", &self.cluster)
            .field("authority", &self.authority)
            .finish_non_exhaustive()
    }
}

async fn bearer_token(auth: &kube::config::AuthInfo) -> Result<Option<String>, Error> {
    if let Some(token) = &auth.token {
        return Ok(Some(token.expose_secret().to_string()));
    }
    if let Some(path) = &auth.token_file {
        let token = tokio::fs::read_to_string(path)
            .await
            .map_err(|error| Error::Config(error.into()))?;
        return Ok(Some(token.trim().to_string()));
    }
    if auth.exec.is_some() || auth.auth_provider.is_some() {
        tracing::warn!("Ignoring unsupported kubeconfig credential plugin");
    }
    Ok(None)
}
