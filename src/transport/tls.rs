use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::config::TlsOptions;
use crate::error::Error;

#[cfg(feature = "tls-rustls-ring")]
pub(crate) const BACKEND: &str = "rustls-ring";
#[cfg(all(not(feature = "tls-rustls-ring"), feature = "tls-rustls-aws-lc-rs"))]
pub(crate) const BACKEND: &str = "rustls-aws-lc-rs";

fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    #[cfg(feature = "tls-rustls-ring")]
    {
        Arc::new(rustls::crypto::ring::default_provider())
    }
    #[cfg(all(not(feature = "tls-rustls-ring"), feature = "tls-rustls-aws-lc-rs"))]
    {
        Arc::new(rustls::crypto::aws_lc_rs::default_provider())
    }
}

fn tls_config_error(message: impl Into<String>) -> Error {
    Error::TlsConfig {
        message: message.into(),
    }
}

fn root_store(options: &TlsOptions) -> crate::Result<rustls::RootCertStore> {
    let mut root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    for pem in &options.root_certificates_pem {
        let mut added = 0_usize;
        for item in CertificateDer::pem_slice_iter(pem) {
            let certificate = item.map_err(|source| {
                tls_config_error(format!("failed to parse root CA PEM: {source}"))
            })?;
            root_store.add(certificate).map_err(|source| {
                tls_config_error(format!("failed to add root CA certificate: {source}"))
            })?;
            added += 1;
        }
        if added == 0 {
            return Err(tls_config_error("root CA PEM contains no certificates"));
        }
    }
    Ok(root_store)
}

/// Builds the rustls client config: webpki roots plus any extra CAs, optional mTLS identity.
pub(crate) fn client_config(options: &TlsOptions) -> crate::Result<rustls::ClientConfig> {
    let root_store = root_store(options)?;
    let config_builder = rustls::ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|source| Error::TlsBackendInit {
            backend: BACKEND,
            message: source.to_string(),
        })?
        .with_root_certificates(root_store);

    let Some(identity) = &options.client_identity else {
        return Ok(config_builder.with_no_client_auth());
    };

    let mut cert_chain = Vec::new();
    for item in CertificateDer::pem_slice_iter(&identity.cert_chain_pem) {
        let certificate = item.map_err(|source| {
            tls_config_error(format!("failed to parse mTLS certificate chain PEM: {source}"))
        })?;
        cert_chain.push(certificate);
    }
    if cert_chain.is_empty() {
        return Err(tls_config_error(
            "mTLS certificate chain PEM is empty or invalid",
        ));
    }
    let private_key = PrivateKeyDer::from_pem_slice(&identity.private_key_pem).map_err(|source| {
        tls_config_error(format!("failed to parse mTLS private key PEM: {source}"))
    })?;
    config_builder
        .with_client_auth_cert(cert_chain, private_key)
        .map_err(|source| tls_config_error(format!("failed to configure mTLS identity: {source}")))
}
