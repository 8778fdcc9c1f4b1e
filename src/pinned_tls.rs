//! HTTPS transport pinned to the server entry's certificate
//!
//! The only certificate accepted is the one embedded in the entry: the
//! presented leaf must be alone (no intermediates) and its raw TBS bytes
//! must equal the pinned certificate's. No chain or hostname validation.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use http_body_util::{BodyExt, Full};
use hyper::{
    body::Bytes,
    client::conn::http1,
    header::{CONTENT_TYPE, HOST},
    Method, Request, StatusCode,
};
use hyper_util::rt::TokioIo;
use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider, WebPkiSupportedAlgorithms},
    pki_types::{CertificateDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, SignatureScheme,
};
use tokio::{net::TcpStream, time::timeout};
use tokio_rustls::TlsConnector;
use tracing::debug;
use x509_parser::prelude::*;

use crate::{
    error::ServerInterfaceError,
    server_entry::ServerEntry,
    server_interface::{ControlRequest, RequestMethod, RequestTransport},
};

/// Raw to-be-signed bytes of a DER certificate.
fn tbs_bytes(der: &[u8]) -> Result<Vec<u8>, String> {
    let (_, cert) = X509Certificate::from_der(der).map_err(|e| e.to_string())?;
    Ok(cert.tbs_certificate.as_ref().to_vec())
}

/// Accepts exactly one certificate
#[derive(Debug)]
pub struct PinnedCertVerifier {
    pinned_tbs: Vec<u8>,
    supported_algs: WebPkiSupportedAlgorithms,
}

impl PinnedCertVerifier {
    pub fn new(
        pinned_der: &[u8],
        supported_algs: WebPkiSupportedAlgorithms,
    ) -> Result<Self, ServerInterfaceError> {
        let pinned_tbs = tbs_bytes(pinned_der)
            .map_err(|e| ServerInterfaceError::Tls(format!("bad pinned certificate: {}", e)))?;
        Ok(Self {
            pinned_tbs,
            supported_algs,
        })
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if !intermediates.is_empty() {
            return Err(rustls::Error::General(format!(
                "expected a single certificate, got {} intermediates",
                intermediates.len()
            )));
        }

        let presented = tbs_bytes(end_entity.as_ref()).map_err(|_| {
            rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding)
        })?;

        if presented == self.pinned_tbs {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(
                "server certificate does not match the pinned certificate".to_string(),
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.supported_algs)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.supported_algs)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported_algs.supported_schemes()
    }
}

/// Control-channel transport: one pinned TLS connection per request
pub struct PinnedHttpsTransport {
    provider: Arc<CryptoProvider>,
    request_timeout: Duration,
}

impl PinnedHttpsTransport {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            provider: Arc::new(rustls::crypto::ring::default_provider()),
            request_timeout,
        }
    }

    /// Client config trusting only `entry`'s certificate.
    fn client_config(&self, entry: &ServerEntry) -> Result<ClientConfig, ServerInterfaceError> {
        let pinned_der = STANDARD
            .decode(entry.web_server_certificate.trim())
            .map_err(|e| ServerInterfaceError::Tls(format!("certificate is not base64: {}", e)))?;
        let verifier =
            PinnedCertVerifier::new(&pinned_der, self.provider.signature_verification_algorithms)?;

        let config = ClientConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| ServerInterfaceError::Tls(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();
        Ok(config)
    }

    async fn send(
        &self,
        entry: &ServerEntry,
        request: ControlRequest,
    ) -> Result<Vec<u8>, ServerInterfaceError> {
        let config = self.client_config(entry)?;
        let port = request.url.port_or_known_default().unwrap_or(443);

        let tcp = TcpStream::connect((entry.ip_address.as_str(), port)).await?;
        let server_name = ServerName::try_from(entry.ip_address.as_str())
            .map_err(|e| ServerInterfaceError::Tls(e.to_string()))?
            .to_owned();
        let tls = TlsConnector::from(Arc::new(config))
            .connect(server_name, tcp)
            .await?;

        let (mut sender, connection) = http1::handshake(TokioIo::new(tls)).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("control connection closed: {}", e);
            }
        });

        let method = match request.method {
            RequestMethod::Get => Method::GET,
            RequestMethod::Post => Method::POST,
        };
        let path = &request.url[url::Position::BeforePath..];
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(HOST, format!("{}:{}", entry.ip_address, port));
        if let Some(content_type) = request.content_type {
            builder = builder.header(CONTENT_TYPE, content_type);
        }
        let http_request = builder
            .body(Full::new(Bytes::from(request.body)))
            .map_err(|e| ServerInterfaceError::Http(e.to_string()))?;

        let response = sender.send_request(http_request).await?;
        if response.status() != StatusCode::OK {
            return Err(ServerInterfaceError::Status(response.status().as_u16()));
        }

        let body = response.into_body().collect().await?.to_bytes();
        Ok(body.to_vec())
    }
}

#[async_trait]
impl RequestTransport for PinnedHttpsTransport {
    async fn request(
        &self,
        entry: &ServerEntry,
        request: ControlRequest,
    ) -> Result<Vec<u8>, ServerInterfaceError> {
        timeout(self.request_timeout, self.send(entry, request))
            .await
            .map_err(|_| ServerInterfaceError::Timeout)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server_entry::tests::sample_entry;
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };
    use tokio_rustls::TlsAcceptor;

    /// Self-signed P-256 certificate, CN=relay
    const RELAY_CERT: &str = "MIIBdjCCAR2gAwIBAgIUVr+uM30R/AwsYsZaIn467y6RsX0wCgYIKoZIzj0EAwIwEDEOMAwGA1UEAwwFcmVsYXkwIBcNMjYxMDE4MTIxMTUyWhgPMjEyNjA5MjQxMjExNTJaMBAxDjAMBgNVBAMMBXJlbGF5MFkwEwYHKoZIzj0CAQYIKoZIzj0DAQcDQgAEk3DzN5n5hHVaxtMFK8vHXWiegoXr8q+vJnETKw1vcKcYSNcZcAwMqodm6HaM8FbbjbqxZ/Ptk20RWserMJp0caNTMFEwHQYDVR0OBBYEFEPaDl4Bi2GuGrbH8w4E5wSDv0pJMB8GA1UdIwQYMBaAFEPaDl4Bi2GuGrbH8w4E5wSDv0pJMA8GA1UdEwEB/wQFMAMBAf8wCgYIKoZIzj0EAwIDRwAwRAIgedrQh5XLjeqOl5KFJ26FiQ3+YYvQLOU94lk9ul2jDp4CIAolFE1R54LxPfiKmtxfPGzQbAjPqasyQRqXUEyirTRL";

    /// PKCS#8 key for `RELAY_CERT`
    const RELAY_KEY: &str = "MIGHAgEAMBMGByqGSM49AgEGCCqGSM49AwEHBG0wawIBAQQgnkEF7ynUO+7l3EatLYB0IlnBMH7B7D47UOQxE46RvyehRANCAASTcPM3mfmEdVrG0wUry8ddaJ6Chevyr68mcRMrDW9wpxhI1xlwDAyqh2bodozwVtuNurFn8+2TbRFax6swmnRx";

    /// Unrelated self-signed certificate, CN=other
    const OTHER_CERT: &str = "MIIBdjCCARygAwIBAgITT8pXGiy3hbs0SrkMiFGVmNNqbjAKBggqhkjOPQQDAjAQMQ4wDAYDVQQDDAVvdGhlcjAgFw0yNjEwMTgxMjExNTJaGA8yMTI2MDkyNDEyMTE1MlowEDEOMAwGA1UEAwwFb3RoZXIwWTATBgcqhkjOPQIBBggqhkjOPQMBBwNCAAQKAU7pUQa90FzKrS76sX3ePZwplwJ2fTBqYi5lmqFMU5VYBCWHWrQkBHfP0aUnDAEXIP+PkK8M4POrHSRKG06Oo1MwUTAdBgNVHQ4EFgQUjMBw/moK2nt0yC4UiZbyDzKeRKgwHwYDVR0jBBgwFoAUjMBw/moK2nt0yC4UiZbyDzKeRKgwDwYDVR0TAQH/BAUwAwEB/zAKBggqhkjOPQQDAgNIADBFAiEA5e8yNIAidxla8RTmjxjNHu/33ZINyJJ2E9RnQzMyw4ICIDxMnEDCLjBtXXpOszkWGhVGDMieHzmN+9Oy4nNq9/HZ";

    fn der(b64: &str) -> Vec<u8> {
        STANDARD.decode(b64).unwrap()
    }

    fn verifier(pinned: &str) -> PinnedCertVerifier {
        let algs = rustls::crypto::ring::default_provider().signature_verification_algorithms;
        PinnedCertVerifier::new(&der(pinned), algs).unwrap()
    }

    fn check(
        verifier: &PinnedCertVerifier,
        leaf: &str,
        intermediates: &[CertificateDer<'_>],
    ) -> Result<ServerCertVerified, rustls::Error> {
        let leaf = CertificateDer::from(der(leaf));
        let name = ServerName::try_from("127.0.0.1").unwrap();
        verifier.verify_server_cert(&leaf, intermediates, &name, &[], UnixTime::now())
    }

    /// TLS server answering every request with a fixed HTTP response.
    async fn spawn_server(response: &'static str) -> u16 {
        let config = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(
            vec![CertificateDer::from(der(RELAY_CERT))],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(der(RELAY_KEY))),
        )
        .unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let Ok(mut tls) = acceptor.accept(tcp).await else {
                        return;
                    };
                    let mut buf = vec![0u8; 4096];
                    let _ = tls.read(&mut buf).await;
                    let _ = tls.write_all(response.as_bytes()).await;
                    let _ = tls.shutdown().await;
                });
            }
        });
        port
    }

    fn entry_for(port: u16, cert: &str) -> ServerEntry {
        let mut entry = sample_entry("127.0.0.1");
        entry.web_server_port = port;
        entry.web_server_certificate = cert.to_string();
        entry
    }

    fn get(port: u16) -> ControlRequest {
        ControlRequest {
            method: RequestMethod::Get,
            url: url::Url::parse(&format!("https://127.0.0.1:{}/handshake?x=1", port)).unwrap(),
            body: Vec::new(),
            content_type: None,
        }
    }

    #[test]
    fn test_pinned_certificate_accepted() {
        assert!(check(&verifier(RELAY_CERT), RELAY_CERT, &[]).is_ok());
    }

    #[test]
    fn test_other_certificate_rejected() {
        assert!(check(&verifier(RELAY_CERT), OTHER_CERT, &[]).is_err());
    }

    #[test]
    fn test_intermediates_rejected() {
        let extra = [CertificateDer::from(der(OTHER_CERT))];
        assert!(check(&verifier(RELAY_CERT), RELAY_CERT, &extra).is_err());
    }

    #[test]
    fn test_garbage_certificates_rejected() {
        let algs = rustls::crypto::ring::default_provider().signature_verification_algorithms;
        assert!(PinnedCertVerifier::new(b"not a certificate", algs).is_err());

        let leaf = CertificateDer::from(b"junk".to_vec());
        let name = ServerName::try_from("127.0.0.1").unwrap();
        assert!(verifier(RELAY_CERT)
            .verify_server_cert(&leaf, &[], &name, &[], UnixTime::now())
            .is_err());
    }

    #[tokio::test]
    async fn test_request_over_pinned_tls() {
        let port = spawn_server(
            "HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
        )
        .await;
        let transport = PinnedHttpsTransport::new(Duration::from_secs(5));

        let body = transport
            .request(&entry_for(port, RELAY_CERT), get(port))
            .await
            .unwrap();
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn test_request_with_wrong_pin_fails() {
        let port = spawn_server(
            "HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
        )
        .await;
        let transport = PinnedHttpsTransport::new(Duration::from_secs(5));

        assert!(transport
            .request(&entry_for(port, OTHER_CERT), get(port))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_non_200_is_error() {
        let port = spawn_server(
            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let transport = PinnedHttpsTransport::new(Duration::from_secs(5));

        assert!(matches!(
            transport.request(&entry_for(port, RELAY_CERT), get(port)).await,
            Err(ServerInterfaceError::Status(404))
        ));
    }
}
