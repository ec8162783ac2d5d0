use ddx_core::config::TlsConfig;
use ddx_core::errors::{DdxError, DdxResult};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

fn open(path: &Path) -> DdxResult<BufReader<File>> {
    let file = File::open(path)
        .map_err(|e| DdxError::TlsError(format!("Failed to open {}: {}", path.display(), e)))?;
    Ok(BufReader::new(file))
}

fn load_certs(path: &Path) -> DdxResult<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| DdxError::TlsError(format!("Invalid certificate in {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(DdxError::TlsError(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> DdxResult<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|e| DdxError::TlsError(format!("Invalid key in {}: {}", path.display(), e)))?
        .ok_or_else(|| DdxError::TlsError(format!("No private key found in {}", path.display())))
}

fn required<'a>(path: &'a Option<std::path::PathBuf>, what: &str) -> DdxResult<&'a Path> {
    path.as_deref()
        .ok_or_else(|| DdxError::TlsError(format!("TLS is enabled but {} is not set", what)))
}

/// Server side of the handshake, or `None` when TLS is disabled.
pub fn acceptor(config: &TlsConfig) -> DdxResult<Option<TlsAcceptor>> {
    if !config.enabled {
        return Ok(None);
    }
    let certs = load_certs(required(&config.cert_file, "cert_file")?)?;
    let key = load_key(required(&config.key_file, "key_file")?)?;
    let server = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| DdxError::TlsError(format!("Rejected certificate/key pair: {}", e)))?;
    Ok(Some(TlsAcceptor::from(Arc::new(server))))
}

/// Client side of the handshake for `host`, or `None` when TLS is disabled.
///
/// The daemon certificate is checked against `server_name` if set, else `host`.
pub fn connector(
    config: &TlsConfig,
    host: &str,
) -> DdxResult<Option<(TlsConnector, ServerName<'static>)>> {
    if !config.enabled {
        return Ok(None);
    }
    let mut roots = RootCertStore::empty();
    for cert in load_certs(required(&config.ca_file, "ca_file")?)? {
        roots
            .add(cert)
            .map_err(|e| DdxError::TlsError(format!("Unusable CA certificate: {}", e)))?;
    }
    let client = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let name = config.server_name.as_deref().unwrap_or(host).to_string();
    let server_name = ServerName::try_from(name.clone())
        .map_err(|e| DdxError::TlsError(format!("Invalid server name {}: {}", name, e)))?;
    Ok(Some((TlsConnector::from(Arc::new(client)), server_name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_disabled_tls_builds_nothing() {
        let config = TlsConfig::default();
        assert!(acceptor(&config).unwrap().is_none());
        assert!(connector(&config, "localhost").unwrap().is_none());
    }

    #[test]
    fn test_missing_files_are_tls_errors() {
        let dir = tempdir().unwrap();
        let config = TlsConfig {
            enabled: true,
            cert_file: Some(dir.path().join("cert.pem")),
            key_file: Some(dir.path().join("key.pem")),
            ca_file: Some(dir.path().join("ca.pem")),
            server_name: None,
        };
        assert!(matches!(acceptor(&config), Err(DdxError::TlsError(_))));
        assert!(matches!(connector(&config, "localhost"), Err(DdxError::TlsError(_))));
    }

    #[test]
    fn test_unset_paths_are_tls_errors() {
        let config = TlsConfig {
            enabled: true,
            ..Default::default()
        };
        assert!(matches!(acceptor(&config), Err(DdxError::TlsError(_))));
    }

    #[test]
    fn test_pem_without_certificates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ca.pem");
        fs::write(&path, "not a certificate\n").unwrap();
        let config = TlsConfig {
            enabled: true,
            ca_file: Some(path),
            ..Default::default()
        };
        assert!(matches!(connector(&config, "localhost"), Err(DdxError::TlsError(_))));
    }
}
