//! TLS utilities shared by the proxy, the backend fixtures and the client.
//!
//! All configurations are built against the ring provider explicitly so
//! that nothing depends on a process-wide default provider being installed.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

/// File name of the proxy certificate inside the confidential directory.
pub const CERT_FILE: &str = "tandem-ca-cert.pem";
/// File name of the proxy private key inside the confidential directory.
pub const KEY_FILE: &str = "tandem-ca-key.pem";

/// Names every generated certificate is valid for.
pub const DEFAULT_CERT_NAMES: [&str; 3] = ["localhost", "127.0.0.1", "::1"];

pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// No-op certificate verifier for self-signed upstreams.
///
/// # Warning
/// This disables all server certificate checks. The harness only ever talks
/// to its own fixtures.
#[derive(Debug)]
pub struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        supported_schemes()
    }
}

/// Client certificate verifier that asks for a certificate but accepts any
/// (or none). Backends use it to record whether one was presented.
#[derive(Debug)]
pub struct AnyClientCert;

impl ClientCertVerifier for AnyClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        supported_schemes()
    }
}

/// Every scheme the ring provider can verify.
fn supported_schemes() -> Vec<rustls::SignatureScheme> {
    crypto_provider()
        .signature_verification_algorithms
        .supported_schemes()
}

/// Paths of a certificate/key pair on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertMaterial {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl CertMaterial {
    pub fn cert_pem(&self) -> anyhow::Result<String> {
        fs::read_to_string(&self.cert_path)
            .with_context(|| format!("Failed to read certificate '{}'", self.cert_path.display()))
    }
}

/// Generate a self-signed certificate valid for `names` plus the defaults.
///
/// Returns `(certificate_pem, private_key_pem)`.
pub fn generate_pem(names: &[String]) -> anyhow::Result<(String, String)> {
    let mut all: Vec<String> = DEFAULT_CERT_NAMES.iter().map(|s| s.to_string()).collect();
    for name in names {
        if !all.contains(name) {
            all.push(name.clone());
        }
    }
    let certified = rcgen::generate_simple_self_signed(all)
        .context("Failed to generate self-signed certificate")?;
    Ok((certified.cert.pem(), certified.key_pair.serialize_pem()))
}

/// Ensure the proxy's certificate material exists in `dir`, generating it on
/// first use. Existing files are reused so every proxy sharing a
/// confidential directory presents the same certificate.
pub fn ensure_cert_material(dir: &Path, names: &[String]) -> anyhow::Result<CertMaterial> {
    let material = CertMaterial {
        cert_path: dir.join(CERT_FILE),
        key_path: dir.join(KEY_FILE),
    };
    if material.cert_path.is_file() && material.key_path.is_file() {
        return Ok(material);
    }

    let (cert_pem, key_pem) = generate_pem(names)?;
    fs::write(&material.cert_path, cert_pem)
        .with_context(|| format!("Failed to write '{}'", material.cert_path.display()))?;
    fs::write(&material.key_path, key_pem)
        .with_context(|| format!("Failed to write '{}'", material.key_path.display()))?;
    debug!("Generated certificate material in {}", dir.display());
    Ok(material)
}

pub fn load_certs(pem: &[u8]) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let mut reader = std::io::BufReader::new(pem);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificates: {e}"))?;
    if certs.is_empty() {
        anyhow::bail!("No certificates found");
    }
    Ok(certs)
}

pub fn load_key(pem: &[u8]) -> anyhow::Result<PrivateKeyDer<'static>> {
    let mut reader = std::io::BufReader::new(pem);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| anyhow::anyhow!("Failed to parse private key: {e}"))?
        .ok_or_else(|| anyhow::anyhow!("No private key found"))
}

/// Build a server configuration from PEM-encoded certificate and key.
///
/// With `request_client_cert` the server offers (but does not require)
/// client authentication.
pub fn server_config(
    cert_pem: &[u8],
    key_pem: &[u8],
    request_client_cert: bool,
) -> anyhow::Result<ServerConfig> {
    let certs = load_certs(cert_pem)?;
    let key = load_key(key_pem)?;

    let builder = ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| anyhow::anyhow!("Failed to select TLS versions: {e}"))?;
    let builder = if request_client_cert {
        builder.with_client_cert_verifier(Arc::new(AnyClientCert))
    } else {
        builder.with_no_client_auth()
    };
    builder
        .with_single_cert(certs, key)
        .map_err(|e| anyhow::anyhow!("Failed to build TLS configuration: {e}"))
}

/// Create a TLS acceptor from certificate material on disk.
pub fn create_tls_acceptor(material: &CertMaterial) -> anyhow::Result<TlsAcceptor> {
    let cert_pem = fs::read(&material.cert_path).with_context(|| {
        format!("Failed to open certificate file '{}'", material.cert_path.display())
    })?;
    let key_pem = fs::read(&material.key_path).with_context(|| {
        format!("Failed to open private key file '{}'", material.key_path.display())
    })?;
    let config = server_config(&cert_pem, &key_pem, false)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Client configuration that trusts any server certificate, optionally
/// presenting a client certificate read from a combined PEM file.
pub fn client_config(client_cert: Option<&Path>) -> anyhow::Result<ClientConfig> {
    let builder = ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| anyhow::anyhow!("Failed to select TLS versions: {e}"))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier));

    match client_cert {
        Some(path) => {
            let pem = fs::read(path)
                .with_context(|| format!("Failed to read client certificate '{}'", path.display()))?;
            let certs = load_certs(&pem)?;
            let key = load_key(&pem)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| anyhow::anyhow!("Invalid client certificate '{}': {e}", path.display()))
        }
        None => Ok(builder.with_no_client_auth()),
    }
}

/// Upstream TLS connectors, choosing a client certificate per host.
#[derive(Clone)]
pub struct UpstreamTls {
    default: TlsConnector,
    client_certs: Option<PathBuf>,
}

impl UpstreamTls {
    pub fn new(client_certs: Option<&Path>) -> anyhow::Result<Self> {
        Ok(Self {
            default: TlsConnector::from(Arc::new(client_config(None)?)),
            client_certs: client_certs.map(Path::to_path_buf),
        })
    }

    /// Connector for `host`: presents `<client_certs>/<host>.pem` when present.
    pub fn connector(&self, host: &str) -> anyhow::Result<TlsConnector> {
        let Some(ref dir) = self.client_certs else {
            return Ok(self.default.clone());
        };
        let path = dir.join(format!("{host}.pem"));
        if !path.is_file() {
            return Ok(self.default.clone());
        }
        debug!("Presenting client certificate {} to {}", path.display(), host);
        Ok(TlsConnector::from(Arc::new(client_config(Some(&path))?)))
    }
}

/// Server name for a handshake. IP literals yield no SNI extension.
pub fn server_name(name: &str) -> anyhow::Result<ServerName<'static>> {
    ServerName::try_from(name.to_string()).map_err(|e| anyhow::anyhow!("Invalid server name '{name}': {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_schemes() {
        let schemes = NoVerifier.supported_verify_schemes();
        assert!(schemes.contains(&rustls::SignatureScheme::ECDSA_NISTP256_SHA256));
        assert!(schemes.contains(&rustls::SignatureScheme::RSA_PSS_SHA256));
        assert!(schemes.contains(&rustls::SignatureScheme::RSA_PSS_SHA512));
        assert!(schemes.contains(&rustls::SignatureScheme::RSA_PKCS1_SHA512));
        assert_eq!(schemes, AnyClientCert.supported_verify_schemes());
    }

    #[test]
    fn test_any_client_cert_is_optional() {
        assert!(AnyClientCert.offer_client_auth());
        assert!(!AnyClientCert.client_auth_mandatory());
    }

    #[test]
    fn test_ensure_cert_material_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let first = ensure_cert_material(dir.path(), &[]).unwrap();
        let pem = first.cert_pem().unwrap();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));

        let second = ensure_cert_material(dir.path(), &["example.test".to_string()]).unwrap();
        assert_eq!(first, second);
        assert_eq!(second.cert_pem().unwrap(), pem);
    }

    #[test]
    fn test_acceptor_from_generated_material() {
        let dir = tempfile::tempdir().unwrap();
        let material = ensure_cert_material(dir.path(), &[]).unwrap();
        assert!(create_tls_acceptor(&material).is_ok());
    }

    #[test]
    fn test_server_config_with_client_auth() {
        let (cert, key) = generate_pem(&["backend.test".to_string()]).unwrap();
        assert!(server_config(cert.as_bytes(), key.as_bytes(), true).is_ok());
    }

    #[test]
    fn test_load_certs_rejects_garbage() {
        assert!(load_certs(b"not a pem").is_err());
        assert!(load_key(b"not a pem").is_err());
    }

    #[test]
    fn test_upstream_connector_picks_host_cert() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = generate_pem(&[]).unwrap();
        fs::write(dir.path().join("127.0.0.1.pem"), format!("{cert}{key}")).unwrap();

        let tls = UpstreamTls::new(Some(dir.path())).unwrap();
        assert!(tls.connector("127.0.0.1").is_ok());
        assert!(tls.connector("other.test").is_ok());
    }

    #[test]
    fn test_server_name_ip_and_dns() {
        assert!(matches!(
            server_name("127.0.0.1").unwrap(),
            ServerName::IpAddress(_)
        ));
        assert!(matches!(
            server_name("example.test").unwrap(),
            ServerName::DnsName(_)
        ));
    }
}
