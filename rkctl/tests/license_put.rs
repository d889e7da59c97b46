use std::io::{Cursor, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use quinn::crypto::rustls::QuicServerConfig;
use rkctl::data_source::data_from_args;
use rkctl::operator::{LicenseReply, OperatorClient, OperatorError, OperatorMessage};
use rkctl::output::format_license_reply;
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};

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

/// Operator endpoint that records license blobs and rejects empty ones.
fn spawn_server(tls: rustls::ServerConfig) -> (quinn::Endpoint, Arc<Mutex<Vec<String>>>) {
    let crypto = QuicServerConfig::try_from(tls).unwrap();
    let config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    let endpoint =
        quinn::Endpoint::server(config, SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));

    let accepting = endpoint.clone();
    let seen = Arc::clone(&received);
    tokio::spawn(async move {
        while let Some(incoming) = accepting.accept().await {
            let conn = incoming.await.unwrap();
            while let Ok((mut send, mut recv)) = conn.accept_bi().await {
                let buf = recv.read_to_end(1024 * 1024).await.unwrap();
                let reply = match serde_json::from_slice(&buf).unwrap() {
                    OperatorMessage::LicensePut(blob) if blob.is_empty() => {
                        OperatorMessage::Error("license is empty".into())
                    }
                    OperatorMessage::LicensePut(blob) => {
                        seen.lock().unwrap().push(blob);
                        OperatorMessage::LicenseReply(LicenseReply {
                            product: "rk8s".into(),
                            license_id: "lic-1".into(),
                            customer_id: "acme".into(),
                            issue_time: "2026-01-01T00:00:00Z".into(),
                            expiration_time: "2027-01-01T00:00:00Z".into(),
                            features: vec!["audit".into()],
                            warnings: Vec::new(),
                        })
                    }
                    other => OperatorMessage::Error(format!("unsupported request {other:?}")),
                };
                send.write_all(&serde_json::to_vec(&reply).unwrap())
                    .await
                    .unwrap();
                send.finish().unwrap();
            }
        }
    });
    (endpoint, received)
}

#[tokio::test]
async fn license_from_file_is_sent_unmodified() {
    let (server_tls, client_tls) = tls_pair();
    let (endpoint, received) = spawn_server(server_tls);
    let addr = endpoint.local_addr().unwrap();

    let blob = "-----BEGIN LICENSE-----\nabc\n-----END LICENSE-----\n";
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(blob.as_bytes()).unwrap();
    let args = vec![format!("@{}", file.path().display())];
    let data = data_from_args(&args, Cursor::new(Vec::new())).unwrap();

    let client = OperatorClient::connect(addr, "localhost", client_tls)
        .await
        .unwrap();
    let reply = client.license_put(data).await.unwrap();
    assert_eq!(received.lock().unwrap().as_slice(), [blob.to_string()]);

    let out = format_license_reply(&reply);
    assert!(out.contains("License ID  = lic-1\n"));
    assert!(out.contains("Features    = audit\n"));

    client.close();
    endpoint.close(quinn::VarInt::from_u32(0), b"test done");
}

#[tokio::test]
async fn server_rejection_is_an_error() {
    let (server_tls, client_tls) = tls_pair();
    let (endpoint, received) = spawn_server(server_tls);
    let addr = endpoint.local_addr().unwrap();

    let data = data_from_args(&[String::new()], Cursor::new(Vec::new())).unwrap();
    let client = OperatorClient::connect(addr, "localhost", client_tls)
        .await
        .unwrap();
    let err = client.license_put(data).await.unwrap_err();
    assert!(matches!(err, OperatorError::Server(ref msg) if msg == "license is empty"));
    assert!(received.lock().unwrap().is_empty());

    client.close();
    endpoint.close(quinn::VarInt::from_u32(0), b"test done");
}
