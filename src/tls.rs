use core::fmt;

use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};

use crate::error::{Code, Error, Result};

enum Mode {
    Client(Arc<ClientConfig>),
    Server(Arc<ServerConfig>),
}

/// TLS configuration for `tls+tcp://` endpoints, streams and `https://`
/// requests.
///
/// A configuration is owned by exactly one dialer, listener, stream or
/// request; it is moved in, never shared.
pub struct TlsConfig {
    mode: Mode,
}

impl TlsConfig {
    /// Client configuration trusting the bundled web PKI roots.
    pub fn client() -> Result<Self> {
        let roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };

        Self::client_with_roots(roots)
    }

    /// Client configuration trusting only the PEM certificates in `ca_pem`.
    pub fn client_with_ca(ca_pem: &[u8]) -> Result<Self> {
        let mut roots = RootCertStore::empty();

        for cert in certs(ca_pem)? {
            roots.add(cert)?;
        }

        Self::client_with_roots(roots)
    }

    /// Server configuration from a PEM certificate chain and private key.
    pub fn server(cert_chain_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let chain = certs(cert_chain_pem)?;
        let key = private_key(key_pem)?;

        let config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(chain, key)?;

        Ok(Self::from_server_config(Arc::new(config)))
    }

    pub fn from_client_config(config: Arc<ClientConfig>) -> Self {
        Self {
            mode: Mode::Client(config),
        }
    }

    pub fn from_server_config(config: Arc<ServerConfig>) -> Self {
        Self {
            mode: Mode::Server(config),
        }
    }

    pub fn is_client(&self) -> bool {
        matches!(self.mode, Mode::Client(_))
    }

    pub(crate) fn client_config(&self) -> Result<Arc<ClientConfig>> {
        match &self.mode {
            Mode::Client(config) => Ok(config.clone()),
            Mode::Server(_) => Err(Code::INVALID.into()),
        }
    }

    pub(crate) fn server_config(&self) -> Result<Arc<ServerConfig>> {
        match &self.mode {
            Mode::Server(config) => Ok(config.clone()),
            Mode::Client(_) => Err(Code::INVALID.into()),
        }
    }

    fn client_with_roots(roots: RootCertStore) -> Result<Self> {
        let config = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self::from_client_config(Arc::new(config)))
    }
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("client", &self.is_client())
            .finish()
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut &*pem).collect::<std::io::Result<Vec<_>>>()?;

    if certs.is_empty() {
        Err(Code::INVALID)?;
    }

    Ok(certs)
}

fn private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut &*pem)?.ok_or(Error::Transport(Code::INVALID))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_are_exclusive() {
        let client = TlsConfig::client().unwrap();

        assert!(client.is_client());
        assert!(client.client_config().is_ok());
        assert_eq!(
            client.server_config().map(|_| ()),
            Err(Error::Transport(Code::INVALID))
        );
    }

    #[test]
    fn server_from_generated_certificate() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();

        let server = TlsConfig::server(
            cert.cert.pem().as_bytes(),
            cert.key_pair.serialize_pem().as_bytes(),
        )
        .unwrap();
        assert!(!server.is_client());

        assert!(TlsConfig::client_with_ca(cert.cert.pem().as_bytes()).is_ok());
    }

    #[test]
    fn garbage_pem_is_invalid() {
        assert_eq!(
            TlsConfig::client_with_ca(b"not a certificate").map(|_| ()),
            Err(Error::Transport(Code::INVALID))
        );
    }
}
