use prometheus::{Encoder, IntCounterVec, Registry, TextEncoder, opts};

/// Process wide counters, served in the text format on `/metrics`.
#[derive(Clone)]
pub struct OperatorMetrics {
    registry: Registry,
    reconcile_total: IntCounterVec,
    webhook_requests_total: IntCounterVec,
}

impl OperatorMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconcile_total = IntCounterVec::new(
            opts!(
                "risingwave_operator_reconcile_total",
                "Number of reconciles by controller and result"
            ),
            &["controller", "result"],
        )?;
        registry.register(Box::new(reconcile_total.clone()))?;

        let webhook_requests_total = IntCounterVec::new(
            opts!(
                "risingwave_operator_webhook_requests_total",
                "Number of admission requests by webhook and outcome"
            ),
            &["webhook", "allowed"],
        )?;
        registry.register(Box::new(webhook_requests_total.clone()))?;

        Ok(Self {
            registry,
            reconcile_total,
            webhook_requests_total,
        })
    }

    pub fn observe_reconcile(&self, controller: &str, success: bool) {
        let result = if success { "success" } else { "error" };
        self.reconcile_total
            .with_label_values(&[controller, result])
            .inc();
    }

    pub fn observe_webhook(&self, webhook: &str, allowed: bool) {
        self.webhook_requests_total
            .with_label_values(&[webhook, if allowed { "true" } else { "false" }])
            .inc();
    }

    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_exported() {
        let metrics = OperatorMetrics::new().unwrap();
        metrics.observe_reconcile("risingwave", true);
        metrics.observe_reconcile("risingwave", true);
        metrics.observe_webhook("validate-risingwave", false);

        let text = metrics.encode().unwrap();
        assert!(text.contains(
            r#"risingwave_operator_reconcile_total{controller="risingwave",result="success"} 2"#
        ));
        assert!(text.contains(
            r#"risingwave_operator_webhook_requests_total{allowed="false",webhook="validate-risingwave"} 1"#
        ));
    }
}
