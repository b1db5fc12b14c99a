//! # Transport Cryptography
//!
//! TLS plumbing for the QUIC transport. Every node generates a self-signed
//! Ed25519 certificate from its keypair at boot; connections are encrypted,
//! but peer *admission* is decided at the message layer by proof-of-work
//! certificates, not by TLS identity. The client-side verifier therefore
//! only requires the presented certificate to be a structurally valid
//! self-signed Ed25519 certificate.
//!
//! The `dangerous()` API is used intentionally: there is no CA in the
//! overlay, so the default WebPKI verification cannot apply.

use std::sync::Arc;

use anyhow::{Context, Result};
use ed25519_dalek::VerifyingKey;
use quinn::ClientConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::identity::Keypair;

/// Lazily-initialized crypto provider for rustls, pinned to ring so builds
/// never depend on which provider other dependencies drag in.
static CRYPTO_PROVIDER: std::sync::LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    std::sync::LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// ALPN protocol identifier; prevents accidental cross-protocol connections.
pub const ALPN: &[u8] = b"sift";

/// SNI placeholder used when dialing. Peers are addressed by `host:port`, so
/// the name carries no identity; the verifier ignores it.
pub const TLS_SERVER_NAME: &str = "sift";

/// Build a self-signed certificate whose subject public key is the node's
/// Ed25519 key, plus the matching private key in PKCS#8 form.
pub fn generate_ed25519_cert(
    keypair: &Keypair,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let secret_key = keypair.secret_key_bytes();
    let public_key = keypair.public_key_bytes();

    // Minimal PKCS#8 v1 wrapping of a raw Ed25519 seed.
    const ED25519_OID: [u8; 5] = [0x06, 0x03, 0x2b, 0x65, 0x70];
    const PKCS8_VERSION: [u8; 3] = [0x02, 0x01, 0x00];

    let mut pkcs8 = Vec::with_capacity(48);
    pkcs8.extend_from_slice(&[0x30, 0x2e]);
    pkcs8.extend_from_slice(&PKCS8_VERSION);
    pkcs8.extend_from_slice(&[0x30, 0x05]);
    pkcs8.extend_from_slice(&ED25519_OID);
    pkcs8.extend_from_slice(&[0x04, 0x22, 0x04, 0x20]);
    pkcs8.extend_from_slice(&secret_key);

    let pkcs8_der = PrivatePkcs8KeyDer::from(pkcs8.clone());
    let key_pair = rcgen::KeyPair::try_from(&pkcs8_der)
        .context("failed to create Ed25519 key pair for certificate")?;

    let mut params = rcgen::CertificateParams::new(vec![TLS_SERVER_NAME.to_string()])
        .context("failed to create certificate params")?;
    params.distinguished_name.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String(hex::encode(public_key)),
    );

    let cert = params
        .self_signed(&key_pair)
        .context("failed to generate self-signed Ed25519 certificate")?;

    let key = PrivateKeyDer::Pkcs8(pkcs8.into());
    let cert_der = CertificateDer::from(cert.der().to_vec());

    Ok((vec![cert_der], key))
}

pub fn create_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<quinn::ServerConfig> {
    let mut server_crypto = rustls::ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 unavailable in the pinned provider")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("failed to create server TLS config")?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .context("failed to create QUIC server config")?,
    ));

    let transport_config = Arc::get_mut(&mut server_config.transport)
        .expect("transport config exclusively owned immediately after creation");
    transport_config.max_idle_timeout(Some(
        std::time::Duration::from_secs(60)
            .try_into()
            .expect("60 seconds is a valid VarInt duration"),
    ));
    transport_config.max_concurrent_bidi_streams(64u32.into());
    transport_config.max_concurrent_uni_streams(64u32.into());

    Ok(server_config)
}

pub fn create_client_config() -> Result<ClientConfig> {
    let mut client_crypto = rustls::ClientConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 unavailable in the pinned provider")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(Ed25519CertVerifier))
        .with_no_client_auth();
    client_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
            .context("failed to create QUIC client config")?,
    ));

    Ok(client_config)
}

/// Extract the raw 32-byte subject public key from a DER certificate,
/// if it has Ed25519 shape.
pub fn extract_public_key_from_cert(cert_der: &[u8]) -> Option<[u8; 32]> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;

    let spki = cert.public_key();
    let key_bytes = &spki.subject_public_key.data;

    if key_bytes.len() == 32 {
        let mut key = [0u8; 32];
        key.copy_from_slice(key_bytes);
        Some(key)
    } else {
        None
    }
}

/// Server-certificate verifier that accepts any structurally valid
/// self-signed Ed25519 certificate. Identity is not checked here: admission
/// is enforced per message by PoW certificates.
#[derive(Debug)]
struct Ed25519CertVerifier;

impl rustls::client::danger::ServerCertVerifier for Ed25519CertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let public_key = extract_public_key_from_cert(end_entity.as_ref()).ok_or(
            rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding),
        )?;

        if VerifyingKey::try_from(public_key.as_slice()).is_err() {
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ));
        }

        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }
}
