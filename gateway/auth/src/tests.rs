use super::*;
use fleet_gateway_core::{
    http::{empty, BoxBody},
    ClusterContext, ClusterUuidResolver, DecodingKey, KeyLookup,
};
use http::{header, HeaderMap, Request, Response, StatusCode};
use http_body_util::BodyExt;
use jsonwebtoken::{EncodingKey, Header};
use maplit::hashmap;
use parking_lot::Mutex;
use std::{collections::HashMap, convert::Infallible, sync::Arc};
use tower::{Layer, ServiceExt};

const KEY_1: &str = include_str!("testdata/key-1.pem");
const KEY_1_PUB: &str = include_str!("testdata/key-1.pub.pem");
const KEY_2: &str = include_str!("testdata/key-2.pem");

struct Keys(HashMap<String, DecodingKey>);

struct Clusters(HashMap<String, String>);

#[async_trait::async_trait]
impl KeyLookup for Keys {
    async fn lookup_key(&self, kid: &str) -> anyhow::Result<DecodingKey> {
        self.0
            .get(kid)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown key {kid}"))
    }
}

#[async_trait::async_trait]
impl ClusterUuidResolver for Clusters {
    async fn cluster_uuid(&self, cluster: &str) -> anyhow::Result<String> {
        self.0
            .get(cluster)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown cluster {cluster}"))
    }
}

/// A verifier that knows only key "1" and the cluster "cluster-1".
fn verifier() -> Verifier {
    let key = DecodingKey::from_rsa_pem(KEY_1_PUB.as_bytes()).expect("key must be valid");
    Verifier::new(
        Arc::new(Keys(hashmap! { "1".to_string() => key })),
        Arc::new(Clusters(hashmap! {
            "cluster-1".to_string() => "CLUSTER-1".to_string(),
            "c1".to_string() => "C1".to_string(),
        })),
    )
}

fn now() -> u64 {
    jsonwebtoken::get_current_timestamp()
}

fn claims() -> Claims {
    Claims {
        sub: "user1".to_string(),
        groups: vec!["g1".to_string(), "g2".to_string()],
        exp: Some(now() + 3600),
        nbf: None,
        cluster: "c1".to_string(),
        cluster_uuid: None,
    }
}

fn sign(kid: &str, pem: &str, claims: &impl serde::Serialize) -> String {
    let header = Header {
        kid: Some(kid.to_string()),
        ..Header::new(ALGORITHM)
    };
    let key = EncodingKey::from_rsa_pem(pem.as_bytes()).expect("key must be valid");
    jsonwebtoken::encode(&header, claims, &key).expect("token must encode")
}

// === Verifier ===

#[tokio::test]
async fn accepts_valid_token() {
    let claims = claims();
    let token = sign("1", KEY_1, &claims);
    let verified = verifier().verify(&token).await.expect("token must verify");
    assert_eq!(verified, claims);
}

#[tokio::test]
async fn rejects_unknown_key_id() {
    let token = sign("2", KEY_2, &claims());
    let error = verifier().verify(&token).await.unwrap_err();
    assert!(matches!(error, Error::KeyLookup { ref kid, .. } if kid == "2"), "{error}");
}

#[tokio::test]
async fn rejects_forged_signature() {
    // Signed with key 2 but claiming to be signed by key 1.
    let token = sign("1", KEY_2, &claims());
    let error = verifier().verify(&token).await.unwrap_err();
    assert!(matches!(error, Error::InvalidToken(_)), "{error}");
}

#[tokio::test]
async fn rejects_other_algorithms() {
    let header = Header {
        kid: Some("1".to_string()),
        ..Header::new(jsonwebtoken::Algorithm::HS256)
    };
    // A symmetric token keyed with the public key must not be accepted.
    let token = jsonwebtoken::encode(
        &header,
        &claims(),
        &EncodingKey::from_secret(KEY_1_PUB.as_bytes()),
    )
    .unwrap();
    let error = verifier().verify(&token).await.unwrap_err();
    assert!(
        matches!(error, Error::UnsupportedAlgorithm(jsonwebtoken::Algorithm::HS256)),
        "{error}"
    );
}

#[tokio::test]
async fn requires_key_id() {
    let key = EncodingKey::from_rsa_pem(KEY_1.as_bytes()).unwrap();
    let token = jsonwebtoken::encode(&Header::new(ALGORITHM), &claims(), &key).unwrap();
    let error = verifier().verify(&token).await.unwrap_err();
    assert!(matches!(error, Error::MissingKeyId), "{error}");
}

#[tokio::test]
async fn rejects_garbage() {
    let error = verifier().verify("not-a-token").await.unwrap_err();
    assert!(matches!(error, Error::InvalidToken(_)), "{error}");
}

#[tokio::test]
async fn rejects_expired_token() {
    let token = sign(
        "1",
        KEY_1,
        &Claims {
            exp: Some(now() - 60),
            ..claims()
        },
    );
    let error = verifier().verify(&token).await.unwrap_err();
    assert!(matches!(error, Error::Expired), "{error}");
}

#[tokio::test]
async fn names_missing_claims() {
    let token = sign(
        "1",
        KEY_1,
        &serde_json::json!({
            "sub": "user1",
            "groups": ["g1"],
            "exp": now() + 3600,
        }),
    );
    let error = verifier().verify(&token).await.unwrap_err();
    assert!(matches!(error, Error::MissingClaim("cluster")), "{error}");
}

#[tokio::test]
async fn checks_cluster_uuid() {
    let verifier = verifier();
    let with_uuid = |uuid: Option<&str>| Claims {
        cluster: "cluster-1".to_string(),
        cluster_uuid: uuid.map(str::to_string),
        ..claims()
    };

    let token = sign("1", KEY_1, &with_uuid(Some("CLUSTER-1")));
    verifier.verify(&token).await.expect("matching UUID must verify");

    let token = sign("1", KEY_1, &with_uuid(Some("CLUSTER-2")));
    let error = verifier.verify(&token).await.unwrap_err();
    assert!(matches!(error, Error::ClusterUuidMismatch { .. }), "{error}");

    let token = sign("1", KEY_1, &with_uuid(None));
    verifier.verify(&token).await.expect("legacy token must verify");
}

#[tokio::test]
async fn unresolvable_cluster_uuid_is_rejected() {
    let token = sign(
        "1",
        KEY_1,
        &Claims {
            cluster: "gone".to_string(),
            cluster_uuid: Some("GONE".to_string()),
            ..claims()
        },
    );
    let error = verifier().verify(&token).await.unwrap_err();
    assert!(matches!(error, Error::ClusterUuid { .. }), "{error}");
}

#[tokio::test]
async fn legacy_tokens_can_be_required_to_carry_uuid() {
    let verifier = verifier().require_cluster_uuid(true);

    let token = sign("1", KEY_1, &claims());
    let error = verifier.verify(&token).await.unwrap_err();
    assert!(matches!(error, Error::LegacyToken), "{error}");

    let token = sign(
        "1",
        KEY_1,
        &Claims {
            cluster_uuid: Some("C1".to_string()),
            ..claims()
        },
    );
    verifier.verify(&token).await.expect("token with UUID must verify");
}

// === Authorize ===

type Seen = Arc<Mutex<Option<(HeaderMap, Option<ClusterContext>)>>>;

/// Runs a request through the middleware and records what the inner service
/// received.
async fn authorize(req: Request<()>) -> (Response<BoxBody>, Seen) {
    let seen = Seen::default();
    let inner = tower::service_fn({
        let seen = seen.clone();
        move |req: Request<()>| {
            let seen = seen.clone();
            async move {
                let context = req.extensions().get::<ClusterContext>().cloned();
                *seen.lock() = Some((req.headers().clone(), context));
                Ok::<_, Infallible>(Response::new(empty()))
            }
        }
    });
    let rsp = AuthorizeLayer::new(verifier(), AuthMetrics::default())
        .layer(inner)
        .oneshot(req)
        .await
        .unwrap();
    (rsp, seen)
}

fn request(token: &str) -> http::request::Builder {
    Request::get("/api/v1/namespaces").header(header::AUTHORIZATION, format!("Bearer {token}"))
}

#[tokio::test]
async fn forwards_with_impersonation_headers() {
    let token = sign("1", KEY_1, &claims());
    let req = request(&token)
        .header("impersonate-user", "admin")
        .header("impersonate-group", "system:masters")
        .header("impersonate-uid", "0")
        .header("impersonate-extra-scopes", "all")
        .body(())
        .unwrap();

    let (rsp, seen) = authorize(req).await;
    assert_eq!(rsp.status(), StatusCode::OK);

    let (headers, context) = seen.lock().take().expect("request must be forwarded");
    assert_eq!(context, Some(ClusterContext::new("c1")));
    assert!(headers.get(header::AUTHORIZATION).is_none());
    assert_eq!(
        headers.get_all("impersonate-user").iter().collect::<Vec<_>>(),
        ["user1"]
    );
    assert_eq!(
        headers.get_all("impersonate-group").iter().collect::<Vec<_>>(),
        ["g1", "g2"]
    );
    assert!(headers.get("impersonate-uid").is_none());
    assert!(headers.get("impersonate-extra-scopes").is_none());
}

#[tokio::test]
async fn connection_header_cannot_drop_impersonation() {
    let token = sign("1", KEY_1, &claims());
    let req = request(&token)
        .header(header::CONNECTION, "impersonate-user, impersonate-group, x-trace")
        .header("x-trace", "1")
        .body(())
        .unwrap();

    let (rsp, seen) = authorize(req).await;
    assert_eq!(rsp.status(), StatusCode::OK);

    let (headers, _) = seen.lock().take().expect("request must be forwarded");
    assert_eq!(headers[header::CONNECTION], "x-trace");
    assert_eq!(headers["impersonate-user"], "user1");
    assert_eq!(
        headers.get_all("impersonate-group").iter().collect::<Vec<_>>(),
        ["g1", "g2"]
    );
}

#[tokio::test]
async fn rejects_token_signed_by_unknown_key() {
    let token = sign("2", KEY_2, &claims());
    let req = request(&token)
        .header("impersonate-user", "admin")
        .body(())
        .unwrap();

    let (rsp, seen) = authorize(req).await;
    assert_eq!(rsp.status(), StatusCode::UNAUTHORIZED);
    assert!(seen.lock().is_none(), "request must not be forwarded");

    // The cause is never revealed to the client.
    let body = rsp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body, "Unauthorized\n");
}

#[tokio::test]
async fn rejects_missing_authorization() {
    let req = Request::get("/api").body(()).unwrap();
    let (rsp, seen) = authorize(req).await;
    assert_eq!(rsp.status(), StatusCode::UNAUTHORIZED);
    assert!(seen.lock().is_none());
}

#[tokio::test]
async fn rejects_unrepresentable_identity() {
    let token = sign(
        "1",
        KEY_1,
        &Claims {
            sub: "user1\nimpersonate-user: admin".to_string(),
            ..claims()
        },
    );
    let (rsp, seen) = authorize(request(&token).body(()).unwrap()).await;
    assert_eq!(rsp.status(), StatusCode::UNAUTHORIZED);
    assert!(seen.lock().is_none());
}
