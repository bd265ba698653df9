//! TLS configuration shared by QUIC and TCP+TLS links.
//!
//! Both modes speak TLS 1.3 with the `fleet/1` ALPN and the same trust
//! anchors, so a peer is authenticated identically whichever mode wins.

use std::sync::Arc;

use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use rustls::RootCertStore;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::core::TransportError;
use crate::core::constants::ALPN_PROTOCOL;

/// Crypto provider used for every config built here.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Trust store holding exactly `roots`.
pub fn root_store(roots: &[CertificateDer<'static>]) -> Result<RootCertStore, TransportError> {
    let mut store = RootCertStore::empty();
    for cert in roots {
        store
            .add(cert.clone())
            .map_err(|e| TransportError::Config(format!("invalid root certificate: {e}")))?;
    }
    Ok(store)
}

/// Client TLS config. `early_data` enables 0-RTT (QUIC only).
pub fn client_tls_config(
    roots: &[CertificateDer<'static>],
    early_data: bool,
) -> Result<rustls::ClientConfig, TransportError> {
    let mut config = rustls::ClientConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(tls_config_error)?
        .with_root_certificates(root_store(roots)?)
        .with_no_client_auth();
    config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];
    config.enable_early_data = early_data;
    Ok(config)
}

/// QUIC client config. The returned config keeps its session cache, so
/// reusing it across reconnections allows 0-RTT resumption.
pub fn quic_client_config(
    roots: &[CertificateDer<'static>],
    early_data: bool,
) -> Result<quinn::ClientConfig, TransportError> {
    let tls = client_tls_config(roots, early_data)?;
    let crypto = QuicClientConfig::try_from(tls)
        .map_err(|e| TransportError::Config(format!("QUIC client crypto: {e}")))?;
    Ok(quinn::ClientConfig::new(Arc::new(crypto)))
}

/// Server TLS config for the TCP listener.
pub fn server_tls_config(
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<rustls::ServerConfig, TransportError> {
    let mut config = rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(tls_config_error)?
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(tls_config_error)?;
    config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];
    Ok(config)
}

/// QUIC server config. `early_data` accepts 0-RTT from resuming clients.
pub fn quic_server_config(
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    early_data: bool,
) -> Result<quinn::ServerConfig, TransportError> {
    let mut tls = server_tls_config(chain, key)?;
    if early_data {
        // QUIC requires either 0 or u32::MAX here.
        tls.max_early_data_size = u32::MAX;
    }
    let crypto = QuicServerConfig::try_from(tls)
        .map_err(|e| TransportError::Config(format!("QUIC server crypto: {e}")))?;
    Ok(quinn::ServerConfig::with_crypto(Arc::new(crypto)))
}

fn tls_config_error(err: rustls::Error) -> TransportError {
    TransportError::Config(format!("TLS: {err}"))
}
