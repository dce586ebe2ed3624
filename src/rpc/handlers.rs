use axum::{Json, extract::Extension, http::StatusCode};
use std::sync::Arc;

use super::RequestHandler;
use super::protocol::{RpcEnvelope, RpcReply};

/// Inbound side of the HTTP transport.
///
/// Cache-level failures travel in the body; the status code only reports
/// whether the node could process the request at all.
pub async fn handle_rpc(
    Extension(handler): Extension<Arc<dyn RequestHandler>>,
    Json(envelope): Json<RpcEnvelope>,
) -> (StatusCode, Json<RpcReply>) {
    let command = envelope.command.name();
    let origin = envelope.origin.clone();
    let reply = handler.handle(envelope).await;
    if let Err(e) = &reply {
        tracing::debug!("{} from {} failed: {}", command, origin, e);
    }
    (StatusCode::OK, Json(reply))
}
