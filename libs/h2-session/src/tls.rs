use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::pem::PemObject as _;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::path::Path;
use std::sync::Arc;

use crate::SessionError;

/// Builds the rustls client configuration for a session.
///
/// Without `ca_cert` the Mozilla root program is trusted; with it, only the
/// given CA. `client_cert` is a PEM bundle holding both the certificate
/// chain and the private key and enables mutual TLS.
pub(crate) fn client_config(
    ca_cert: Option<&Path>,
    client_cert: Option<&Path>,
) -> Result<Arc<ClientConfig>, SessionError> {
    let mut roots = RootCertStore::empty();

    match ca_cert {
        Some(path) => {
            for cert in CertificateDer::pem_file_iter(path).map_err(SessionError::ReadPem)? {
                roots
                    .add(cert.map_err(SessionError::ReadPem)?)
                    .map_err(SessionError::Tls)?;
            }
        }
        None => {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);

    let mut config = match client_cert {
        Some(path) => {
            let certs = CertificateDer::pem_file_iter(path)
                .map_err(SessionError::ReadPem)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(SessionError::ReadPem)?;
            let key = PrivateKeyDer::from_pem_file(path).map_err(SessionError::ReadPem)?;

            builder
                .with_client_auth_cert(certs, key)
                .map_err(SessionError::Tls)?
        }
        None => builder.with_no_client_auth(),
    };

    config.alpn_protocols = vec![b"h2".to_vec()];

    Ok(Arc::new(config))
}
