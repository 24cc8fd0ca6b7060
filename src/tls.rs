//! TLS stream wrapping for client connections.
//!
//! Consumed opaquely by the connection layer: a raw stream goes in, a
//! secure stream with the same interface comes out. The rustls client
//! configuration is built lazily on first HTTPS use; a certificate store
//! or configuration error there is fatal for the request that triggered it
//! (and every later one; the failure is cached rather than retried).

use std::sync::Arc;
use std::sync::OnceLock;

use rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::trace;

use crate::error::Error;
use crate::transport::BoxIo;

/// Lazily-initialized TLS context shared by every connection of a client.
pub(crate) struct TlsContext {
    provided: Option<Arc<rustls::ClientConfig>>,
    connector: OnceLock<Result<TlsConnector, Error>>,
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("initialized", &self.connector.get().is_some())
            .finish()
    }
}

impl TlsContext {
    /// A context that will build a configuration from the platform
    /// certificate store on first use, or use `config` when provided.
    pub(crate) fn new(config: Option<Arc<rustls::ClientConfig>>) -> Self {
        Self {
            provided: config,
            connector: OnceLock::new(),
        }
    }

    fn connector(&self) -> Result<TlsConnector, Error> {
        self.connector
            .get_or_init(|| {
                let config = match &self.provided {
                    Some(config) => config.clone(),
                    None => Arc::new(native_config()?),
                };
                trace!("tls client configuration initialized");
                Ok(TlsConnector::from(config))
            })
            .clone()
    }

    /// Wrap `io` in a TLS session for `server_name`.
    pub(crate) async fn wrap(&self, io: BoxIo, server_name: &str) -> Result<BoxIo, Error> {
        let connector = self.connector()?;
        let name = ServerName::try_from(server_name.to_owned())
            .map_err(|_| Error::Tls(format!("invalid server name: {server_name}").into()))?;
        let stream = connector
            .connect(name, io)
            .await
            .map_err(|error| Error::Tls(error.to_string().into()))?;
        Ok(Box::new(stream))
    }
}

fn native_config() -> Result<rustls::ClientConfig, Error> {
    let mut roots = rustls::RootCertStore::empty();
    let loaded = rustls_native_certs::load_native_certs();
    for cert in loaded.certs {
        if let Err(error) = roots.add(cert) {
            trace!(%error, "skipping unusable native root certificate");
        }
    }
    if roots.is_empty() {
        let detail = loaded
            .errors
            .first()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no usable native root certificates".to_owned());
        return Err(Error::Tls(detail.into()));
    }

    Ok(rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}
