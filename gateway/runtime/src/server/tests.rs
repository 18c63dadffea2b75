use super::*;
use crate::{
    auth::{AuthMetrics, AuthorizeLayer, Claims, Verifier, ALGORITHM},
    core::{
        http::{empty, full},
        ClusterUuidResolver, DecodingKey, KeyLookup, Kubeconfig, KubeconfigSource,
    },
    proxy::{self, Handler},
};
use base64::Engine;
use bytes::Bytes;
use http::{header, HeaderMap, StatusCode, Uri};
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::http1::SendRequest;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::{
    rustls::pki_types::{PrivatePkcs8KeyDer, ServerName},
    TlsConnector,
};
use tower::Layer;

const KEY_1: &str = include_str!("../testdata/key-1.pem");
const KEY_1_PUB: &str = include_str!("../testdata/key-1.pub.pem");

/// The last request the cluster's API server received.
type Seen = Arc<Mutex<Option<(Uri, HeaderMap)>>>;

/// A running TLS server and the self-signed certificate it presents.
struct Served {
    addr: SocketAddr,
    cert: CertificateDer<'static>,
    cert_pem: String,
}

struct Keys;

struct Clusters;

/// Serves one kubeconfig for the cluster named "tenant".
struct Tenant(Kubeconfig);

#[async_trait::async_trait]
impl KeyLookup for Keys {
    async fn lookup_key(&self, kid: &str) -> Result<DecodingKey> {
        ensure!(kid == "1", "unknown key {kid}");
        Ok(DecodingKey::from_rsa_pem(KEY_1_PUB.as_bytes())?)
    }
}

#[async_trait::async_trait]
impl ClusterUuidResolver for Clusters {
    async fn cluster_uuid(&self, cluster: &str) -> Result<String> {
        ensure!(cluster == "tenant", "unknown cluster {cluster}");
        Ok("TENANT".to_string())
    }
}

#[async_trait::async_trait]
impl KubeconfigSource for Tenant {
    async fn kubeconfig(&self, cluster: &str) -> Result<Kubeconfig> {
        ensure!(cluster == "tenant", "unknown cluster {cluster}");
        Ok(self.0.clone())
    }
}

async fn serve<S>(service: S, drain: drain::Watch) -> Served
where
    S: tower::Service<Request<Incoming>, Response = Response<BoxBody>, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    proxy::install_tls_provider();
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    let tls = tls_config(vec![cert.der().clone()], key).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server = Server::new(listener, tls);
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve(service, drain));

    Served {
        addr,
        cert: cert.der().clone(),
        cert_pem: cert.pem(),
    }
}

/// A cluster API server that records each request. Upgrade requests are
/// switched to a stream that echoes everything it reads.
async fn cluster(seen: Seen, drain: drain::Watch) -> Served {
    let api = tower::service_fn(move |mut req: Request<Incoming>| {
        let seen = seen.clone();
        async move {
            *seen.lock() = Some((req.uri().clone(), req.headers().clone()));
            if !req.headers().contains_key(header::UPGRADE) {
                return Ok::<_, Infallible>(Response::new(full("ok")));
            }

            let upgrade = hyper::upgrade::on(&mut req);
            tokio::spawn(async move {
                if let Ok(upgraded) = upgrade.await {
                    let (mut rx, mut tx) = tokio::io::split(TokioIo::new(upgraded));
                    let _ = tokio::io::copy(&mut rx, &mut tx).await;
                }
            });
            let rsp = Response::builder()
                .status(StatusCode::SWITCHING_PROTOCOLS)
                .header(header::CONNECTION, "Upgrade")
                .header(header::UPGRADE, "SPDY/3.1")
                .body(empty())
                .unwrap();
            Ok(rsp)
        }
    });
    serve(api, drain).await
}

/// Runs the authenticating proxy in front of the API server at `server`.
async fn gateway(server: &str, ca_pem: &str, drain: drain::Watch) -> Served {
    let ca = base64::engine::general_purpose::STANDARD.encode(ca_pem);
    let kubeconfig = Kubeconfig::from_yaml(&format!(
        r#"
apiVersion: v1
kind: Config
clusters:
- name: tenant
  cluster:
    server: {server}
    certificate-authority-data: {ca}
contexts:
- name: tenant
  context:
    cluster: tenant
    user: tenant
current-context: tenant
users:
- name: tenant
  user:
    token: s3cr3t
"#
    ))
    .unwrap();

    let connectors = Handler::connectors(
        Arc::new(Tenant(kubeconfig)),
        proxy::Config {
            capacity: NonZeroUsize::new(4).unwrap(),
            ttl: Duration::from_secs(60),
            http2: false,
        },
    );
    let verifier = Verifier::new(Arc::new(Keys), Arc::new(Clusters));
    let service = AuthorizeLayer::new(verifier, AuthMetrics::default()).layer(Handler::new(connectors));
    serve(service, drain).await
}

async fn connect(server: &Served) -> SendRequest<Empty<Bytes>> {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(server.cert.clone()).unwrap();
    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    let tcp = TcpStream::connect(server.addr).await.unwrap();
    let tls = TlsConnector::from(Arc::new(config))
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await
        .unwrap();
    let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
        .await
        .unwrap();
    tokio::spawn(conn.with_upgrades());
    sender
}

fn token() -> String {
    let claims = Claims {
        sub: "user1".to_string(),
        groups: vec!["g1".to_string(), "g2".to_string()],
        exp: Some(jsonwebtoken::get_current_timestamp() + 3600),
        cluster: "tenant".to_string(),
        ..Default::default()
    };
    let header = jsonwebtoken::Header {
        kid: Some("1".to_string()),
        ..jsonwebtoken::Header::new(ALGORITHM)
    };
    let key = jsonwebtoken::EncodingKey::from_rsa_pem(KEY_1.as_bytes()).unwrap();
    jsonwebtoken::encode(&header, &claims, &key).unwrap()
}

fn request(uri: &str) -> http::request::Builder {
    Request::get(uri)
        .header(header::HOST, "gateway.local")
        .header(header::AUTHORIZATION, format!("Bearer {}", token()))
}

#[tokio::test]
async fn forwards_to_the_cluster_as_the_token_identity() {
    let (_signal, drain) = drain::channel();
    let seen = Seen::default();
    let api = cluster(seen.clone(), drain.clone()).await;
    let gw = gateway(
        &format!("https://localhost:{}", api.addr.port()),
        &api.cert_pem,
        drain,
    )
    .await;

    let req = request("/api/v1/pods?watch=1&limit=10")
        .header(header::CONNECTION, "impersonate-user, impersonate-group")
        .header("impersonate-user", "admin")
        .body(Empty::new())
        .unwrap();
    let rsp = connect(&gw).await.send_request(req).await.unwrap();
    assert_eq!(rsp.status(), StatusCode::OK);
    assert_eq!(rsp.into_body().collect().await.unwrap().to_bytes(), "ok");

    let (uri, headers) = seen.lock().take().expect("request must reach the cluster");
    assert_eq!(uri, "/api/v1/pods?watch=1&limit=10");
    assert_eq!(
        headers[header::HOST],
        format!("localhost:{}", api.addr.port())
    );
    assert_eq!(headers[header::AUTHORIZATION], "Bearer s3cr3t");
    assert_eq!(
        headers.get_all("impersonate-user").iter().collect::<Vec<_>>(),
        ["user1"]
    );
    assert_eq!(
        headers.get_all("impersonate-group").iter().collect::<Vec<_>>(),
        ["g1", "g2"]
    );
}

#[tokio::test]
async fn upgraded_connections_are_spliced_to_the_cluster() {
    let (_signal, drain) = drain::channel();
    let seen = Seen::default();
    let api = cluster(seen.clone(), drain.clone()).await;
    let gw = gateway(
        &format!("https://localhost:{}", api.addr.port()),
        &api.cert_pem,
        drain,
    )
    .await;

    let req = request("/api/v1/namespaces/default/pods/web/exec?command=sh")
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "SPDY/3.1")
        .body(Empty::new())
        .unwrap();
    let rsp = connect(&gw).await.send_request(req).await.unwrap();
    assert_eq!(rsp.status(), StatusCode::SWITCHING_PROTOCOLS);

    let upgraded = hyper::upgrade::on(rsp).await.expect("connection must upgrade");
    let mut io = TokioIo::new(upgraded);
    io.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    time::timeout(Duration::from_secs(5), io.read_exact(&mut echoed))
        .await
        .expect("stream must be echoed")
        .unwrap();
    assert_eq!(&echoed, b"ping");

    let (_, headers) = seen.lock().take().expect("request must reach the cluster");
    assert_eq!(headers[header::UPGRADE], "SPDY/3.1");
    assert_eq!(headers["impersonate-user"], "user1");
}

#[tokio::test]
async fn unreachable_clusters_are_a_bad_gateway() {
    let (_signal, drain) = drain::channel();
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let ca_pem = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .unwrap()
        .cert
        .pem();
    let gw = gateway(&format!("https://localhost:{port}"), &ca_pem, drain).await;

    let req = request("/api/v1/pods").body(Empty::new()).unwrap();
    let rsp = connect(&gw).await.send_request(req).await.unwrap();
    assert_eq!(rsp.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(
        rsp.into_body().collect().await.unwrap().to_bytes(),
        "Bad Gateway\n"
    );
}

#[tokio::test]
async fn requests_without_a_token_never_reach_the_cluster() {
    let (_signal, drain) = drain::channel();
    let seen = Seen::default();
    let api = cluster(seen.clone(), drain.clone()).await;
    let gw = gateway(
        &format!("https://localhost:{}", api.addr.port()),
        &api.cert_pem,
        drain,
    )
    .await;

    let req = Request::get("/api/v1/pods")
        .header(header::HOST, "gateway.local")
        .body(Empty::new())
        .unwrap();
    let rsp = connect(&gw).await.send_request(req).await.unwrap();
    assert_eq!(rsp.status(), StatusCode::UNAUTHORIZED);
    assert!(seen.lock().is_none());
}
