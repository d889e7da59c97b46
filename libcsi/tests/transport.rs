use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use libcsi::{
    AccessMode, ControllerDetachVolumeRequest, CsiClient, CsiController, CsiError, CsiNode,
    CsiServer, NodeDetachVolumeRequest, VolumeId,
};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};

#[derive(Default)]
struct FakePlugin {
    node_detaches: Mutex<Vec<String>>,
}

#[async_trait]
impl CsiNode for FakePlugin {
    async fn node_detach_volume(&self, req: NodeDetachVolumeRequest) -> Result<(), CsiError> {
        self.node_detaches.lock().unwrap().push(req.alloc_id);
        Ok(())
    }
}

#[async_trait]
impl CsiController for FakePlugin {
    async fn controller_detach_volume(
        &self,
        req: ControllerDetachVolumeRequest,
    ) -> Result<(), CsiError> {
        Err(CsiError::Unavailable(format!("controller busy for {}", req.volume_id)))
    }
}

fn tls_pair() -> (rustls::ServerConfig, rustls::ClientConfig) {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_der: CertificateDer<'static> = cert.der().clone();
    let key_der = PrivatePkcs8KeyDer::from(key_pair.serialize_der());

    let server = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key_der.into())
        .unwrap();

    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert_der).unwrap();
    let client = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    (server, client)
}

#[tokio::test]
async fn detach_requests_round_trip_over_quic() {
    let (server_tls, client_tls) = tls_pair();
    let plugin = Arc::new(FakePlugin::default());

    let bind: SocketAddr = SocketAddr::from(([127, 0, 0, 1], 0));
    let server = Arc::new(CsiServer::new(bind, server_tls, Arc::clone(&plugin)).unwrap());
    let addr = server.endpoint().local_addr().unwrap();
    let serving = Arc::clone(&server);
    tokio::spawn(async move { serving.serve().await });

    let client = CsiClient::connect(addr, "localhost", client_tls)
        .await
        .unwrap();

    client
        .node_detach_volume(NodeDetachVolumeRequest {
            plugin_id: "rk8s.slayerfs.csi".into(),
            node_id: "node-01".into(),
            volume_id: VolumeId::from("vol-1"),
            external_id: "slayerfs-1".into(),
            alloc_id: "alloc-1".into(),
            access_mode: AccessMode::SingleNodeReader,
            read_only: true,
        })
        .await
        .unwrap();
    assert_eq!(*plugin.node_detaches.lock().unwrap(), vec!["alloc-1"]);

    let err = client
        .controller_detach_volume(ControllerDetachVolumeRequest {
            plugin_id: "rk8s.slayerfs.csi".into(),
            volume_id: VolumeId::from("slayerfs-1"),
            node_id: "node-01".into(),
            alloc_id: "alloc-1".into(),
        })
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(matches!(err, CsiError::Unavailable(_)));

    client.close();
    server.endpoint().close(quinn::VarInt::from_u32(0), b"test done");
}
