//! TLS configuration: server-side acceptor material for LDAPS/StartTLS
//! toward clients, client-side configs for StartTLS toward backends.

use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};

/// Build a rustls ServerConfig from PEM certificate and key file paths.
pub fn load_server_config_from_files(
    cert_file: &str,
    key_file: &str,
) -> Result<Arc<rustls::ServerConfig>> {
    let certs = load_certs_from_file(cert_file)?;
    let key = load_private_key_from_file(key_file)?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("build ServerConfig from cert and key")?;
    Ok(Arc::new(config))
}

fn load_certs_from_file(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = fs::File::open(path).with_context(|| format!("open cert file {}", path))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("parse PEM certificates")?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {}", path);
    }
    Ok(certs)
}

fn load_private_key_from_file(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = fs::File::open(path).with_context(|| format!("open key file {}", path))?;
    let mut reader = BufReader::new(file);
    let pkcs8: Vec<_> = pkcs8_private_keys(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("parse PEM PKCS8 keys")?;
    if let Some(key) = pkcs8.into_iter().next() {
        return Ok(key.into());
    }
    let file = fs::File::open(path).with_context(|| format!("open key file {}", path))?;
    let mut reader = BufReader::new(file);
    let rsa: Vec<_> = rsa_private_keys(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("parse PEM RSA keys")?;
    rsa.into_iter()
        .next()
        .map(Into::into)
        .ok_or_else(|| anyhow::anyhow!("no private key found in {}", path))
}

/// Check that cert and key files exist and parse, for startup validation.
pub fn validate_tls_files(cert_file: &str, key_file: &str, ca_file: Option<&str>) -> Result<()> {
    if !Path::new(cert_file).exists() {
        anyhow::bail!("TLS cert file not found: {}", cert_file);
    }
    if !Path::new(key_file).exists() {
        anyhow::bail!("TLS key file not found: {}", key_file);
    }
    if let Some(ca) = ca_file {
        if !Path::new(ca).exists() {
            anyhow::bail!("TLS CA file not found: {}", ca);
        }
    }
    load_server_config_from_files(cert_file, key_file)?;
    Ok(())
}

/// Build a client config for StartTLS toward a backend.
///
/// With `ca_file` the given bundle is trusted; otherwise the platform trust
/// store is used. `skip_verify` disables certificate verification entirely
/// and is only acceptable on closed test networks.
pub fn client_config(ca_file: Option<&str>, skip_verify: bool) -> Result<Arc<rustls::ClientConfig>> {
    if skip_verify {
        let config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification))
            .with_no_client_auth();
        return Ok(Arc::new(config));
    }
    let mut roots = rustls::RootCertStore::empty();
    if let Some(path) = ca_file {
        for cert in load_certs_from_file(path)? {
            roots.add(cert).context("add CA certificate to root store")?;
        }
    } else {
        let native = rustls_native_certs::load_native_certs();
        for cert in native.certs {
            let _ = roots.add(cert);
        }
        if roots.is_empty() {
            anyhow::bail!("no trusted roots available; set a CA file");
        }
    }
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Accept-anything certificate verifier backing `tls_skip_verify`.
#[derive(Debug)]
struct NoVerification;

impl ServerCertVerifier for NoVerification {
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

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_missing_files() {
        assert!(validate_tls_files("/nonexistent/cert.pem", "/nonexistent/key.pem", None).is_err());
    }

    #[test]
    fn test_skip_verify_config_builds() {
        let config = client_config(None, true).unwrap();
        // Verification is disabled, so the config carries our verifier and
        // builds without any root store.
        assert!(Arc::strong_count(&config) >= 1);
    }

    #[test]
    fn test_missing_ca_file_is_an_error() {
        assert!(client_config(Some("/nonexistent/ca.pem"), false).is_err());
    }
}
