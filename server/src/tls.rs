use anyhow::{Context as _, Result};
use rustls::RootCertStore;
use rustls::server::WebPkiClientVerifier;
use rustls_pki_types::pem::PemObject as _;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::path::Path;
use std::sync::Arc;

/// Builds the rustls server configuration.
///
/// `cert` is the server certificate chain; the private key is read from
/// `key` if given, otherwise from the same file. A `ca_cert` switches on
/// mutual TLS: clients must then present a certificate signed by it.
pub fn server_config(
    cert: &Path,
    key: Option<&Path>,
    ca_cert: Option<&Path>,
) -> Result<Arc<rustls::ServerConfig>> {
    let certs = CertificateDer::pem_file_iter(cert)
        .with_context(|| format!("Failed to read certificates from `{}`", cert.display()))?
        .collect::<Result<Vec<_>, _>>()
        .context("Invalid certificate PEM")?;

    let key_path = key.unwrap_or(cert);
    let key = PrivateKeyDer::from_pem_file(key_path)
        .with_context(|| format!("Failed to read private key from `{}`", key_path.display()))?;

    let builder = match ca_cert {
        Some(ca_path) => {
            let mut roots = RootCertStore::empty();
            for ca in CertificateDer::pem_file_iter(ca_path)
                .with_context(|| format!("Failed to read CA from `{}`", ca_path.display()))?
            {
                roots.add(ca.context("Invalid CA PEM")?)?;
            }

            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .context("Failed to build client certificate verifier")?;

            rustls::ServerConfig::builder().with_client_cert_verifier(verifier)
        }
        None => rustls::ServerConfig::builder().with_no_client_auth(),
    };

    let mut config = builder
        .with_single_cert(certs, key)
        .context("Invalid certificate/key pair")?;

    config.alpn_protocols = vec![b"h2".to_vec()];

    Ok(Arc::new(config))
}
