/// Outbound gateway API surface used by the dispatcher and the job pipeline.
pub mod connection;

use async_trait::async_trait;
use serde_json::Value;
use tracing::error;

use jm_shared::errors::GatewayError;
use jm_shared::gateway_protocol::{group_text_params, ApiResponse};

/// Request/response calls over the gateway.
#[async_trait]
pub trait GatewayApi: Send + Sync {
    /// Issue `action` and wait for its response. Transport failures are
    /// retried inside; a failure status comes back as `Rejected`.
    async fn request(&self, action: &str, params: Value) -> Result<ApiResponse, GatewayError>;

    /// Like [`request`](Self::request) but collapses every failure into `None`.
    async fn call(&self, action: &str, params: Value) -> Option<ApiResponse> {
        match self.request(action, params).await {
            Ok(response) => Some(response),
            Err(e) => {
                error!("Gateway call {} failed: {}", action, e);
                None
            }
        }
    }

    /// Send a plain text message to a group.
    async fn send_group_text(&self, group_id: i64, text: &str) -> bool {
        self.call("send_msg", group_text_params(group_id, text))
            .await
            .is_some()
    }
}
