//! QUIC server that runs on each worker node and dispatches incoming CSI
//! requests to the node driver.

use std::net::SocketAddr;
use std::sync::Arc;

use quinn::crypto::rustls::QuicServerConfig;
use tracing::{debug, error, info, instrument, warn};

use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::message::CsiMessage;
use crate::node::CsiNode;
use crate::transport::MAX_MESSAGE_BYTES;

/// A CSI server that accepts QUIC connections and dispatches
/// [`CsiMessage`] requests to a [`CsiNode`] + [`CsiIdentity`]
/// implementation (one of the backend node drivers).
pub struct CsiServer<T> {
    endpoint: quinn::Endpoint,
    driver: Arc<T>,
}

impl<T> CsiServer<T>
where
    T: CsiNode + CsiIdentity + 'static,
{
    /// Create a new server bound to `addr`.
    pub fn new(
        addr: SocketAddr,
        tls_config: rustls::ServerConfig,
        driver: Arc<T>,
    ) -> Result<Self, CsiError> {
        let quic_server_config = QuicServerConfig::try_from(tls_config)
            .map_err(|e| CsiError::TransportError(format!("invalid TLS config: {e}")))?;
        let server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_server_config));
        let endpoint = quinn::Endpoint::server(server_config, addr).map_err(CsiError::transport)?;
        info!(%addr, "CSI QUIC server listening");
        Ok(Self { endpoint, driver })
    }

    /// Accept connections in a loop until the endpoint is closed.  Each
    /// connection and each bi-stream within it is handled concurrently.
    pub async fn serve(&self) -> Result<(), CsiError> {
        while let Some(incoming) = self.endpoint.accept().await {
            let driver = Arc::clone(&self.driver);
            tokio::spawn(async move {
                let conn = match incoming.await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "CSI incoming connection failed");
                        return;
                    }
                };
                let remote = conn.remote_address();
                debug!(%remote, "CSI connection accepted");
                if let Err(e) = Self::handle_connection(conn, driver).await {
                    warn!(%remote, error = %e, "CSI connection error");
                }
            });
        }
        Ok(())
    }

    async fn handle_connection(conn: quinn::Connection, driver: Arc<T>) -> Result<(), CsiError> {
        loop {
            let (send, recv) = match conn.accept_bi().await {
                Ok(stream) => stream,
                Err(quinn::ConnectionError::ApplicationClosed(_)) => return Ok(()),
                Err(e) => return Err(CsiError::transport(e)),
            };

            let driver = Arc::clone(&driver);
            tokio::spawn(async move {
                if let Err(e) = Self::handle_stream(send, recv, &driver).await {
                    error!(error = %e, "CSI stream handler error");
                }
            });
        }
    }

    /// Read one request, dispatch it, write the response.
    #[instrument(skip_all)]
    async fn handle_stream(
        mut send: quinn::SendStream,
        mut recv: quinn::RecvStream,
        driver: &T,
    ) -> Result<(), CsiError> {
        let buf = recv
            .read_to_end(MAX_MESSAGE_BYTES)
            .await
            .map_err(CsiError::transport)?;
        let request: CsiMessage = serde_json::from_slice(&buf)
            .map_err(|e| CsiError::TransportError(format!("malformed request: {e}")))?;
        debug!(%request, "CSI request received");

        let response = Self::dispatch(driver, request).await;

        let payload = serde_json::to_vec(&response).map_err(CsiError::internal)?;
        send.write_all(&payload)
            .await
            .map_err(CsiError::transport)?;
        send.finish().map_err(CsiError::transport)?;
        Ok(())
    }

    /// Map a request variant to the matching trait method and wrap the
    /// result.  Errors ride back as [`CsiMessage::Error`], carrying their
    /// status code with them.
    async fn dispatch(driver: &T, request: CsiMessage) -> CsiMessage {
        fn ack(result: Result<(), CsiError>) -> CsiMessage {
            match result {
                Ok(()) => CsiMessage::Ok,
                Err(e) => CsiMessage::Error(e),
            }
        }

        match request {
            // --- Node -------------------------------------------------------
            CsiMessage::StageVolume(req) => ack(driver.stage_volume(req).await),
            CsiMessage::UnstageVolume {
                volume_id,
                staging_target_path,
            } => ack(driver.unstage_volume(&volume_id, &staging_target_path).await),
            CsiMessage::PublishVolume(req) => ack(driver.publish_volume(req).await),
            CsiMessage::UnpublishVolume {
                volume_id,
                target_path,
            } => ack(driver.unpublish_volume(&volume_id, &target_path).await),
            CsiMessage::GetNodeInfo => match driver.get_info().await {
                Ok(info) => CsiMessage::NodeInfoResponse(info),
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::GetNodeCapabilities => match driver.get_capabilities().await {
                Ok(caps) => CsiMessage::NodeCapabilitiesResponse(caps),
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::GetVolumeStats { volume_id } => {
                match driver.get_volume_stats(&volume_id).await {
                    Ok(stats) => CsiMessage::VolumeStatsResponse(stats),
                    Err(e) => CsiMessage::Error(e),
                }
            }
            CsiMessage::ExpandVolume {
                volume_id,
                required_bytes,
            } => ack(driver.expand_volume(&volume_id, required_bytes).await),

            // --- Identity ---------------------------------------------------
            CsiMessage::Probe => match driver.probe().await {
                Ok(ok) => CsiMessage::ProbeResult(ok),
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::GetPluginInfo => match driver.get_plugin_info().await {
                Ok(info) => CsiMessage::PluginInfoResponse(info),
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::GetPluginCapabilities => match driver.get_plugin_capabilities().await {
                Ok(caps) => CsiMessage::PluginCapabilitiesResponse(caps),
                Err(e) => CsiMessage::Error(e),
            },

            // --- Response variants should never arrive as requests ----------
            other => {
                warn!(msg = %other, "unexpected message variant received as request");
                CsiMessage::Error(CsiError::InvalidArgument(format!(
                    "unexpected message: {other}"
                )))
            }
        }
    }

    /// The underlying QUIC endpoint, useful for obtaining the local address
    /// or shutting down.
    pub fn endpoint(&self) -> &quinn::Endpoint {
        &self.endpoint
    }
}
