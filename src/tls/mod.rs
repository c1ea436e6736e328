//! TLS for `wss://` connections, backed by rustls.
//!
//! [`TcpDialer`](crate::connection::TcpDialer) uses the configuration from
//! [`Config::tls`](crate::Config) when set and falls back to
//! [`client_config_with_webpki_roots`] otherwise.

mod rustls_impl;

pub use rustls_impl::{TlsConnector, TlsError, TlsStream, load_certs_from_file};

use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls::{ClientConfig, RootCertStore};

/// Client configuration trusting the Mozilla root set.
pub fn client_config_with_webpki_roots() -> Result<Arc<ClientConfig>, TlsError> {
    let root_store = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Ok(client_config_with_roots(root_store))
}

/// Client configuration trusting exactly `roots`.
#[must_use]
pub fn client_config_with_roots(roots: RootCertStore) -> Arc<ClientConfig> {
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Arc::new(config)
}

/// Client configuration trusting the PEM certificates in `path`.
pub fn client_config_from_pem_file(path: &Path) -> Result<Arc<ClientConfig>, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs_from_file(path)? {
        roots
            .add(cert)
            .map_err(|e| TlsError::Configuration(e.to_string()))?;
    }
    Ok(client_config_with_roots(roots))
}
