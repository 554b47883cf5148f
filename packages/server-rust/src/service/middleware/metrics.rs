//! Metrics unit for calls.
//!
//! Records `rpc_server_requests_duration_ms{method}` for single-shot calls
//! and `rpc_server_requests_code_total{method,rpccode}` for both call kinds,
//! against the server's own [`MetricsRegistry`].

use std::time::Instant;

use async_trait::async_trait;
use tonic::Status;

use super::{Next, ServerMiddleware};
use crate::service::call::{StreamCall, UnaryCall, UnaryReply};
use crate::telemetry::MetricsRegistry;

pub const REQUEST_DURATION_MS: &str = "rpc_server_requests_duration_ms";
pub const REQUEST_CODE_TOTAL: &str = "rpc_server_requests_code_total";

/// Observes every call that enters the chain, including rejected ones.
#[derive(Debug, Clone)]
pub struct MetricsMiddleware {
    registry: MetricsRegistry,
}

impl MetricsMiddleware {
    #[must_use]
    pub fn new(registry: MetricsRegistry) -> Self {
        Self { registry }
    }

    fn count(&self, method: &str, code: tonic::Code) {
        let method = method.to_string();
        let code = format!("{code:?}");
        self.registry.record(|| {
            metrics::counter!(REQUEST_CODE_TOTAL, "method" => method, "rpccode" => code)
                .increment(1);
        });
    }
}

fn code_of<T>(result: &Result<T, Status>) -> tonic::Code {
    match result {
        Ok(_) => tonic::Code::Ok,
        Err(status) => status.code(),
    }
}

#[async_trait]
impl ServerMiddleware for MetricsMiddleware {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn unary(
        &self,
        call: UnaryCall,
        next: Next<UnaryCall, UnaryReply>,
    ) -> Result<UnaryReply, Status> {
        let method = call.method.full_method.clone();
        let start = Instant::now();
        let result = next.run(call).await;

        #[allow(clippy::cast_precision_loss)]
        let elapsed_ms = start.elapsed().as_micros() as f64 / 1000.0;
        let label = method.clone();
        self.registry.record(|| {
            metrics::histogram!(REQUEST_DURATION_MS, "method" => label).record(elapsed_ms);
        });
        self.count(&method, code_of(&result));
        result
    }

    async fn stream(&self, call: StreamCall, next: Next<StreamCall, ()>) -> Result<(), Status> {
        let method = call.method.full_method.clone();
        let result = next.run(call).await;
        self.count(&method, code_of(&result));
        result
    }
}
