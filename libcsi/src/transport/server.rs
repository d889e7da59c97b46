//! QUIC server that runs next to a plugin and dispatches incoming CSI
//! requests to the appropriate trait implementations.

use std::net::SocketAddr;
use std::sync::Arc;

use quinn::crypto::rustls::QuicServerConfig;
use tracing::{debug, error, info, instrument, warn};

use crate::controller::CsiController;
use crate::error::CsiError;
use crate::message::CsiMessage;
use crate::node::CsiNode;

/// Upper bound on a single request body.
const MAX_REQUEST_BYTES: usize = 16 * 1024 * 1024;

/// A CSI server that accepts QUIC connections and dispatches
/// [`CsiMessage`] requests to a [`CsiNode`] + [`CsiController`]
/// implementation.
pub struct CsiServer<T> {
    endpoint: quinn::Endpoint,
    handler: Arc<T>,
}

impl<T> CsiServer<T>
where
    T: CsiNode + CsiController + 'static,
{
    /// Create a new server bound to `addr`.
    pub fn new(
        addr: SocketAddr,
        tls_config: rustls::ServerConfig,
        handler: Arc<T>,
    ) -> Result<Self, CsiError> {
        let quic_server_config = QuicServerConfig::try_from(tls_config)
            .map_err(|e| CsiError::TransportError(format!("invalid TLS config: {e}")))?;
        let server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_server_config));
        let endpoint = quinn::Endpoint::server(server_config, addr).map_err(CsiError::transport)?;
        info!(%addr, "CSI QUIC server listening");
        Ok(Self { endpoint, handler })
    }

    /// Accept connections in a loop until the endpoint is closed.
    ///
    /// Each accepted connection spawns a Tokio task, and each bi-stream
    /// within a connection is handled concurrently.
    pub async fn serve(&self) -> Result<(), CsiError> {
        while let Some(incoming) = self.endpoint.accept().await {
            let handler = Arc::clone(&self.handler);
            tokio::spawn(async move {
                match incoming.await {
                    Ok(conn) => {
                        let remote = conn.remote_address();
                        debug!(%remote, "CSI connection accepted");
                        if let Err(e) = Self::handle_connection(conn, handler).await {
                            warn!(%remote, error = %e, "CSI connection error");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "CSI incoming connection failed");
                    }
                }
            });
        }
        Ok(())
    }

    /// Handle all bi-streams on a single connection.
    async fn handle_connection(conn: quinn::Connection, handler: Arc<T>) -> Result<(), CsiError> {
        loop {
            let (send, recv) = match conn.accept_bi().await {
                Ok(stream) => stream,
                Err(quinn::ConnectionError::ApplicationClosed(_)) => return Ok(()),
                Err(e) => return Err(CsiError::transport(e)),
            };

            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                if let Err(e) = Self::handle_stream(send, recv, &handler).await {
                    error!(error = %e, "CSI stream handler error");
                }
            });
        }
    }

    /// Process a single bi-stream: read request → dispatch → write response.
    #[instrument(skip_all)]
    async fn handle_stream(
        mut send: quinn::SendStream,
        mut recv: quinn::RecvStream,
        handler: &T,
    ) -> Result<(), CsiError> {
        let buf = recv
            .read_to_end(MAX_REQUEST_BYTES)
            .await
            .map_err(CsiError::transport)?;

        let request: CsiMessage = serde_json::from_slice(&buf)
            .map_err(|e| CsiError::TransportError(format!("malformed request: {e}")))?;

        debug!(%request, "CSI request received");

        let response = dispatch(handler, request).await;

        let payload = serde_json::to_vec(&response).map_err(CsiError::internal)?;
        send.write_all(&payload)
            .await
            .map_err(CsiError::transport)?;
        send.finish().map_err(CsiError::transport)?;
        Ok(())
    }

    /// Return a reference to the underlying QUIC endpoint, useful for
    /// obtaining the local address or shutting down.
    pub fn endpoint(&self) -> &quinn::Endpoint {
        &self.endpoint
    }
}

/// Map a [`CsiMessage`] request to the correct trait method call and wrap
/// the result in a response [`CsiMessage`].
async fn dispatch<T>(handler: &T, request: CsiMessage) -> CsiMessage
where
    T: CsiNode + CsiController,
{
    let result = match request {
        CsiMessage::NodeDetachVolume(req) => handler.node_detach_volume(req).await,
        CsiMessage::ControllerDetachVolume(req) => handler.controller_detach_volume(req).await,
        // Response variants should never arrive as requests.
        other => {
            warn!(msg = %other, "unexpected message variant received as request");
            Err(CsiError::InvalidArgument(format!(
                "unexpected message: {other}"
            )))
        }
    };
    match result {
        Ok(()) => CsiMessage::Ok,
        Err(e) => CsiMessage::Error(e),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::types::{ControllerDetachVolumeRequest, NodeDetachVolumeRequest, VolumeId};

    #[derive(Default)]
    struct RecordingPlugin {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CsiNode for RecordingPlugin {
        async fn node_detach_volume(&self, req: NodeDetachVolumeRequest) -> Result<(), CsiError> {
            self.calls.lock().unwrap().push(format!("node:{}", req.alloc_id));
            Ok(())
        }
    }

    #[async_trait]
    impl CsiController for RecordingPlugin {
        async fn controller_detach_volume(
            &self,
            req: ControllerDetachVolumeRequest,
        ) -> Result<(), CsiError> {
            Err(CsiError::VolumeNotFound(req.volume_id.to_string()))
        }
    }

    #[tokio::test]
    async fn dispatch_routes_detach_requests() {
        let plugin = RecordingPlugin::default();

        let resp = dispatch(
            &plugin,
            CsiMessage::NodeDetachVolume(NodeDetachVolumeRequest {
                plugin_id: "p".into(),
                node_id: "node-01".into(),
                volume_id: VolumeId::from("vol-1"),
                external_id: "ext-1".into(),
                alloc_id: "alloc-1".into(),
                access_mode: Default::default(),
                read_only: false,
            }),
        )
        .await;
        assert!(matches!(resp, CsiMessage::Ok));
        assert_eq!(*plugin.calls.lock().unwrap(), vec!["node:alloc-1"]);

        let resp = dispatch(
            &plugin,
            CsiMessage::ControllerDetachVolume(ControllerDetachVolumeRequest {
                plugin_id: "p".into(),
                volume_id: VolumeId::from("ext-1"),
                node_id: "node-01".into(),
                alloc_id: "alloc-1".into(),
            }),
        )
        .await;
        assert!(matches!(resp, CsiMessage::Error(CsiError::VolumeNotFound(id)) if id == "ext-1"));
    }

    #[tokio::test]
    async fn dispatch_rejects_response_variants() {
        let plugin = RecordingPlugin::default();
        let resp = dispatch(&plugin, CsiMessage::Ok).await;
        assert!(matches!(resp, CsiMessage::Error(CsiError::InvalidArgument(_))));
        assert!(plugin.calls.lock().unwrap().is_empty());
    }
}
