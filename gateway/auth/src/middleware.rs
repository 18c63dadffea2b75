use crate::{AuthMetrics, Claims, Error, Verifier};
use fleet_gateway_core::{
    http::{status, BoxBody},
    ClusterContext,
};
use futures::future::BoxFuture;
use http::{
    header::{self, HeaderMap, HeaderName, HeaderValue},
    Request, Response, StatusCode,
};
use std::{
    sync::Arc,
    task::{Context, Poll},
};
use tracing::{field, info_span, Instrument};

const IMPERSONATE_USER: HeaderName = HeaderName::from_static("impersonate-user");
const IMPERSONATE_GROUP: HeaderName = HeaderName::from_static("impersonate-group");
const IMPERSONATE_UID: HeaderName = HeaderName::from_static("impersonate-uid");
const IMPERSONATE_EXTRA_PREFIX: &str = "impersonate-extra-";

#[derive(Clone, Debug)]
pub struct AuthorizeLayer {
    verifier: Arc<Verifier>,
    metrics: AuthMetrics,
}

/// Authenticates each request before passing it to the inner service.
///
/// Unauthenticated requests are answered with a 401 and never reach the inner
/// service. Authenticated requests carry a [`ClusterContext`] extension and
/// impersonation headers for the token's subject and groups.
#[derive(Clone, Debug)]
pub struct Authorize<S> {
    inner: S,
    verifier: Arc<Verifier>,
    metrics: AuthMetrics,
}

// === impl AuthorizeLayer ===

impl AuthorizeLayer {
    pub fn new(verifier: Verifier, metrics: AuthMetrics) -> Self {
        Self {
            verifier: Arc::new(verifier),
            metrics,
        }
    }
}

impl<S> tower::Layer<S> for AuthorizeLayer {
    type Service = Authorize<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Authorize {
            inner,
            verifier: self.verifier.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

// === impl Authorize ===

impl<S, B> tower::Service<Request<B>> for Authorize<S>
where
    S: tower::Service<Request<B>, Response = Response<BoxBody>> + Clone + Send + 'static,
    S::Future: Send,
    B: Send + 'static,
{
    type Response = Response<BoxBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Response<BoxBody>, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), S::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        // The readied service handles this request; the clone is left behind
        // to be readied for the next one.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let verifier = self.verifier.clone();
        let metrics = self.metrics.clone();

        Box::pin(async move {
            let span = info_span!(
                "authorize",
                cluster = field::Empty,
                cluster_uuid = field::Empty,
                user = field::Empty,
                groups = field::Empty,
            );

            let claims = match authorize(&verifier, &mut req).instrument(span.clone()).await {
                Ok(claims) => claims,
                Err(error) => {
                    span.in_scope(|| tracing::info!(%error, "Unauthorized"));
                    metrics.rejected(&error);
                    return Ok(status(StatusCode::UNAUTHORIZED));
                }
            };

            metrics.accepted(claims.cluster_uuid().is_some());
            span.record("cluster", claims.cluster.as_str());
            if let Some(uuid) = claims.cluster_uuid() {
                span.record("cluster_uuid", uuid);
            }
            span.record("user", claims.sub.as_str());
            span.record("groups", field::debug(&claims.groups));

            inner.call(req).instrument(span).await
        })
    }
}

/// Verifies the request's token and rewrites the request to act on behalf of
/// the token's identity.
async fn authorize<B>(verifier: &Verifier, req: &mut Request<B>) -> Result<Claims, Error> {
    let token = bearer_token(req.headers())?.to_string();
    let claims = verifier.verify(&token).await?;

    let user = HeaderValue::from_str(&claims.sub).map_err(|_| Error::InvalidClaim("sub"))?;
    let groups = claims
        .groups
        .iter()
        .map(|group| HeaderValue::from_str(group).map_err(|_| Error::InvalidClaim("groups")))
        .collect::<Result<Vec<_>, _>>()?;

    let headers = req.headers_mut();
    strip_identity_headers(headers);
    protect_identity_headers(headers);
    headers.insert(IMPERSONATE_USER, user);
    for group in groups {
        headers.append(IMPERSONATE_GROUP, group);
    }

    req.extensions_mut()
        .insert(ClusterContext::new(claims.cluster.clone()));
    Ok(claims)
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, Error> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(Error::MissingHeader)?;
    let value = value.to_str().map_err(|_| Error::MalformedHeader)?;
    match value.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => {
            let token = token.trim();
            if token.is_empty() {
                return Err(Error::MalformedHeader);
            }
            Ok(token)
        }
        _ => Err(Error::MalformedHeader),
    }
}

/// Removes the client's credentials and any identity it asserted itself.
fn strip_identity_headers(headers: &mut HeaderMap) {
    headers.remove(header::AUTHORIZATION);
    headers.remove(&IMPERSONATE_USER);
    headers.remove(&IMPERSONATE_GROUP);
    headers.remove(&IMPERSONATE_UID);

    let extras = headers
        .keys()
        .filter(|name| name.as_str().starts_with(IMPERSONATE_EXTRA_PREFIX))
        .cloned()
        .collect::<Vec<_>>();
    for name in extras {
        headers.remove(name);
    }
}

/// Drops `Connection` options that name identity headers, so that no later hop
/// discards the identity set here as connection-specific.
fn protect_identity_headers(headers: &mut HeaderMap) {
    let options = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|option| !option.is_empty())
        .map(str::to_string)
        .collect::<Vec<_>>();
    if !options.iter().any(|option| is_identity_header(option)) {
        return;
    }

    let kept = options
        .into_iter()
        .filter(|option| !is_identity_header(option))
        .collect::<Vec<_>>()
        .join(", ");
    headers.remove(header::CONNECTION);
    if let Ok(value) = HeaderValue::from_str(&kept) {
        if !kept.is_empty() {
            headers.insert(header::CONNECTION, value);
        }
    }
}

fn is_identity_header(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name == header::AUTHORIZATION.as_str()
        || name == IMPERSONATE_USER.as_str()
        || name == IMPERSONATE_GROUP.as_str()
        || name == IMPERSONATE_UID.as_str()
        || name.starts_with(IMPERSONATE_EXTRA_PREFIX)
}
