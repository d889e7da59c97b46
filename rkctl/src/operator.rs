//! Operator API over QUIC.
//!
//! Same framing as the CSI transport: one JSON request and one JSON reply
//! per bi-directional stream.

use std::net::SocketAddr;
use std::sync::Arc;

use quinn::crypto::rustls::QuicClientConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

/// Upper bound on a single reply body.
const MAX_REPLY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OperatorMessage {
    /// Install a license blob, passed through unmodified.
    LicensePut(String),
    LicenseReply(LicenseReply),
    Error(String),
}

/// License the servers accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseReply {
    pub product: String,
    pub license_id: String,
    pub customer_id: String,
    pub issue_time: String,
    pub expiration_time: String,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Error)]
pub enum OperatorError {
    #[error("transport error: {0}")]
    Transport(String),

    /// The server rejected the request.
    #[error("{0}")]
    Server(String),

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

impl OperatorError {
    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        Self::Transport(e.to_string())
    }
}

pub struct OperatorClient {
    connection: quinn::Connection,
}

impl OperatorClient {
    pub async fn connect(
        addr: SocketAddr,
        server_name: &str,
        tls_config: rustls::ClientConfig,
    ) -> Result<Self, OperatorError> {
        let quic_client_config = QuicClientConfig::try_from(tls_config)
            .map_err(|e| OperatorError::Transport(format!("invalid TLS config: {e}")))?;
        let client_config = quinn::ClientConfig::new(Arc::new(quic_client_config));

        let mut endpoint = quinn::Endpoint::client(SocketAddr::from(([0, 0, 0, 0], 0)))
            .map_err(OperatorError::transport)?;
        endpoint.set_default_client_config(client_config);

        let connection = endpoint
            .connect(addr, server_name)
            .map_err(OperatorError::transport)?
            .await
            .map_err(OperatorError::transport)?;

        debug!(%addr, %server_name, "operator connection established");
        Ok(Self { connection })
    }

    #[instrument(skip_all)]
    pub async fn request(&self, msg: &OperatorMessage) -> Result<OperatorMessage, OperatorError> {
        let (mut send, mut recv) = self
            .connection
            .open_bi()
            .await
            .map_err(OperatorError::transport)?;

        let payload = serde_json::to_vec(msg).map_err(OperatorError::transport)?;
        send.write_all(&payload)
            .await
            .map_err(OperatorError::transport)?;
        send.finish().map_err(OperatorError::transport)?;

        let buf = recv
            .read_to_end(MAX_REPLY_BYTES)
            .await
            .map_err(OperatorError::transport)?;
        serde_json::from_slice(&buf).map_err(OperatorError::transport)
    }

    /// Install a new license on the servers.
    pub async fn license_put(&self, license: String) -> Result<LicenseReply, OperatorError> {
        match self.request(&OperatorMessage::LicensePut(license)).await? {
            OperatorMessage::LicenseReply(reply) => Ok(reply),
            OperatorMessage::Error(msg) => Err(OperatorError::Server(msg)),
            OperatorMessage::LicensePut(_) => {
                Err(OperatorError::UnexpectedReply("LicensePut".to_string()))
            }
        }
    }

    pub fn close(&self) {
        self.connection
            .close(quinn::VarInt::from_u32(0), b"client shutdown");
    }
}
