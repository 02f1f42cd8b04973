//! TLS configuration and certificate loading.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, Once};
use std::time::Duration;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::{Error, Result};
use crate::net::stream::MaybeTlsStream;

/// Install `ring` as the process-wide rustls provider unless one is set.
///
/// Other crates in the dependency graph may compile in a second provider,
/// which leaves rustls unable to pick one on its own.
pub fn install_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        if CryptoProvider::get_default().is_none()
            && rustls::crypto::ring::default_provider().install_default().is_err()
        {
            tracing::debug!("Crypto provider installed concurrently");
        }
    });
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| Error::Tls(format!("Failed to open cert file {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("Failed to parse certs: {}", e)))
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| Error::Tls(format!("Failed to open key file {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::Tls(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| Error::Tls("No private key found".to_string()))
}

/// Build a TLS acceptor from certificate and key PEM files.
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    install_crypto_provider();
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(format!("Invalid certificate/key pair: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Client-side connector trusting the webpki root set.
pub fn client_connector() -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    install_crypto_provider();
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}

/// Dial `host:port`, optionally completing a TLS handshake for `server_name`.
pub async fn dial(
    host: &str,
    port: u16,
    tls: Option<(&TlsConnector, &str)>,
    connect_timeout: Duration,
) -> Result<MaybeTlsStream> {
    let tcp = tokio::time::timeout(connect_timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connect to {}:{} timed out", host, port),
            )
        })??;
    tcp.set_nodelay(true)?;

    match tls {
        None => Ok(MaybeTlsStream::Plain(tcp)),
        Some((connector, server_name)) => {
            let name = ServerName::try_from(server_name.to_string())
                .map_err(|e| Error::Tls(format!("Invalid server name '{}': {}", server_name, e)))?;
            let stream = connector.connect(name, tcp).await?;
            Ok(MaybeTlsStream::ClientTls(Box::new(stream)))
        }
    }
}
