use crate::Error;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct AuthMetrics {
    requests: Family<RequestLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct RequestLabels {
    result: &'static str,
    reason: &'static str,
}

// === impl AuthMetrics ===

impl AuthMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        reg.register(
            "requests",
            "Total number of requests authenticated, by result",
            metrics.requests.clone(),
        );
        metrics
    }

    /// Records an accepted request. Tokens accepted without a cluster UUID are
    /// counted separately so that remaining legacy tokens can be tracked.
    pub(crate) fn accepted(&self, has_cluster_uuid: bool) {
        let reason = if has_cluster_uuid {
            "cluster_uuid"
        } else {
            "legacy"
        };
        self.requests
            .get_or_create(&RequestLabels {
                result: "accepted",
                reason,
            })
            .inc();
    }

    pub(crate) fn rejected(&self, error: &Error) {
        self.requests
            .get_or_create(&RequestLabels {
                result: "rejected",
                reason: error.reason(),
            })
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn counts_requests_by_reason() {
        let mut prom = Registry::default();
        let metrics = AuthMetrics::register(prom.sub_registry_with_prefix("auth"));

        metrics.accepted(true);
        metrics.accepted(false);
        metrics.accepted(false);
        metrics.rejected(&Error::Expired);

        let mut text = String::new();
        encode(&mut text, &prom).unwrap();
        for line in [
            r#"auth_requests_total{result="accepted",reason="cluster_uuid"} 1"#,
            r#"auth_requests_total{result="accepted",reason="legacy"} 2"#,
            r#"auth_requests_total{result="rejected",reason="expired"} 1"#,
        ] {
            assert!(text.contains(line), "{line} not in:\n{text}");
        }
    }
}
