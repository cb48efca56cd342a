//! TLS identity provisioning and rustls configuration for both roles.
//!
//! The server presents a self-signed certificate regenerated on every start.
//! The client's trust policy is explicit: skip verification (the historical
//! default), pin a CA file, or use the public webpki roots.

use std::{fs, io::Cursor, path::Path, path::PathBuf, sync::Arc};

use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SerialNumber,
};
use rustls::{
    RootCertStore,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
};

use crate::httptun::config::TlsConfig;
use crate::httptun::error::{Error, Result};

/// Lifetime of the generated server certificate.
const IDENTITY_LIFETIME: time::Duration = time::Duration::days(365);

const ALPN_HTTP11: &[u8] = b"http/1.1";

/// PEM-encoded certificate and private key.
#[derive(Clone)]
pub struct Identity {
    pub cert_pem: String,
    pub key_pem: String,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("cert_pem", &format!("<{} bytes>", self.cert_pem.len()))
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

/// Generates a self-signed certificate for `localhost` / `127.0.0.1`, valid
/// for one year from now.
pub fn generate_identity() -> Result<Identity> {
    let key_pair = KeyPair::generate().map_err(|e| Error::CertificateGeneration(e.to_string()))?;

    let mut params = CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()])
        .map_err(|e| Error::CertificateGeneration(e.to_string()))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "localhost");
    params.distinguished_name = dn;

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + IDENTITY_LIFETIME;

    params.serial_number = Some(SerialNumber::from(rand::random::<u64>()));
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| Error::CertificateGeneration(e.to_string()))?;

    Ok(Identity {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

/// Writes both PEM files, replacing whatever was there before.
pub fn write_identity(identity: &Identity, cert_path: &Path, key_path: &Path) -> Result<()> {
    for p in [cert_path, key_path] {
        if let Some(parent) = p.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
    }

    fs::write(cert_path, &identity.cert_pem)?;
    fs::write(key_path, &identity.key_pem)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(key_path, fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let data = fs::read(path)
        .map_err(|e| Error::Tls(format!("read certificate {}: {e}", path.display())))?;
    let certs = rustls_pemfile::certs(&mut Cursor::new(&data))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("parse certificate {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!("no certificate found in {}", path.display())));
    }
    Ok(certs)
}

pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let data =
        fs::read(path).map_err(|e| Error::Tls(format!("read key {}: {e}", path.display())))?;
    let key = rustls_pemfile::private_key(&mut Cursor::new(&data))
        .map_err(|e| Error::Tls(format!("parse key {}: {e}", path.display())))?;
    key.ok_or_else(|| Error::Tls(format!("no private key found in {}", path.display())))
}

/// Produces the terminator's rustls config.
///
/// With `generate` set, a fresh identity is written to the configured paths
/// first; either way the listener serves what is on disk.
pub fn provision_server_identity(cfg: &TlsConfig) -> Result<rustls::ServerConfig> {
    if cfg.generate {
        let identity = generate_identity()?;
        write_identity(&identity, &cfg.cert_file, &cfg.key_file)?;
        tracing::info!(
            cert_file = %cfg.cert_file.display(),
            key_file = %cfg.key_file.display(),
            "tls: generated self-signed identity"
        );
    }

    let certs = load_certs(&cfg.cert_file)?;
    let key = load_key(&cfg.key_file)?;
    server_config(certs, key)
}

pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<rustls::ServerConfig> {
    let mut cfg = rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(e.to_string()))?;
    cfg.alpn_protocols = vec![ALPN_HTTP11.to_vec()];
    Ok(cfg)
}

/// How the client decides whether to trust the server certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientTrust {
    /// Accept any certificate. Vulnerable to MITM.
    InsecureSkipVerify,
    /// Accept certificates chaining to the PEM anchors in this file.
    CaFile(PathBuf),
    /// Accept certificates chaining to the bundled public roots.
    WebPki,
}

impl ClientTrust {
    pub fn from_config(cfg: &TlsConfig) -> Self {
        if cfg.insecure_skip_verify {
            ClientTrust::InsecureSkipVerify
        } else if let Some(ca) = &cfg.ca_file {
            ClientTrust::CaFile(ca.clone())
        } else {
            ClientTrust::WebPki
        }
    }
}

pub fn client_config(trust: &ClientTrust) -> Result<rustls::ClientConfig> {
    let builder = rustls::ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(e.to_string()))?;

    let mut cfg = match trust {
        ClientTrust::InsecureSkipVerify => builder
            .dangerous()
            .with_custom_certificate_verifier(SkipServerVerification::new())
            .with_no_client_auth(),
        ClientTrust::CaFile(path) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(path)? {
                roots
                    .add(cert)
                    .map_err(|e| Error::Tls(format!("add trust anchor {}: {e}", path.display())))?;
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        }
        ClientTrust::WebPki => {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots).with_no_client_auth()
        }
    };
    cfg.alpn_protocols = vec![ALPN_HTTP11.to_vec()];
    Ok(cfg)
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Certificate verifier that treats any certificate as valid.
///
/// Signatures are still checked so the handshake itself stays sound.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self(crypto_provider()))
    }
}

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
