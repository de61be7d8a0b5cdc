use crate::config::TlsPaths;
use anyhow::{Context, Result, bail};
use rustls_pemfile::{certs, private_key};
use std::io::{BufReader, Cursor};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::rustls::pki_types::CertificateDer;

/// load_tls reads the PEM chain and key and builds the acceptor for an HTTPS listener
pub fn load_tls(paths: &TlsPaths) -> Result<TlsAcceptor> {
    let cert_file = std::fs::read(&paths.cert_file)
        .with_context(|| format!("[ERR] reading {}", paths.cert_file.display()))?;
    let cert_reader = &mut BufReader::new(Cursor::new(cert_file));
    let certs: Vec<CertificateDer> = certs(cert_reader).collect::<Result<Vec<_>, _>>()?;

    if certs.is_empty() {
        bail!("[ERR] no certificates found in {}", paths.cert_file.display());
    }

    // PKCS#1, PKCS#8 and SEC1 keys are all accepted
    let key_file = std::fs::read(&paths.key_file)
        .with_context(|| format!("[ERR] reading {}", paths.key_file.display()))?;
    let key_reader = &mut BufReader::new(Cursor::new(key_file));
    let Some(key) = private_key(key_reader)? else {
        bail!("[ERR] no private key found in {}", paths.key_file.display());
    };

    let tls_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}
