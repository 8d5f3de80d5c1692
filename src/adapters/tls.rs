//! Client-side TLS configuration for backend connections.
use std::{path::Path, sync::Arc};

use eyre::{Result, WrapErr, eyre};
use rustls::{
    ClientConfig, RootCertStore,
    pki_types::{CertificateDer, pem::PemObject},
};
use rustls_native_certs::load_native_certs;

use crate::{config::OutboundTlsConfig, core::rule::TlsContext};

/// Id of the TLS context used when a rule configures none.
pub const DEFAULT_TLS_CONTEXT: &str = "default";

/// Install aws-lc-rs as the process crypto provider. Later calls are no-ops.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Build a client config trusting the platform roots and/or a PEM bundle.
pub fn client_config(ca_file: Option<&Path>, native_roots: bool) -> Result<Arc<ClientConfig>> {
    install_crypto_provider();

    let mut roots = RootCertStore::empty();
    if native_roots {
        let native = load_native_certs();
        for cert in native.certs {
            if roots.add(cert).is_err() {
                tracing::warn!("Failed to add native certificate to rustls RootCertStore");
            }
        }
        if !native.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native.errors
            );
        }
    }

    if let Some(path) = ca_file {
        let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_file_iter(path)
            .wrap_err_with(|| format!("Failed to open CA bundle {}", path.display()))?
            .collect::<Result<_, _>>()
            .wrap_err_with(|| format!("Failed to parse CA bundle {}", path.display()))?;
        if certs.is_empty() {
            return Err(eyre!("CA bundle {} holds no certificates", path.display()));
        }
        let (added, ignored) = roots.add_parsable_certificates(certs);
        tracing::debug!(added, ignored, ca_file = %path.display(), "loaded CA bundle");
    }

    tracing::debug!(roots = roots.len(), "built TLS client config");
    Ok(Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    ))
}

/// TLS context of a rule; `id` keys the connection pool.
pub fn tls_context(id: impl Into<String>, config: &OutboundTlsConfig) -> Result<TlsContext> {
    let id = id.into();
    let client = client_config(config.ca_file.as_deref().map(Path::new), config.native_roots)
        .wrap_err_with(|| format!("Failed to build TLS context '{id}'"))?;
    Ok(TlsContext { id, config: client })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn builds_without_any_roots() {
        assert!(client_config(None, false).is_ok());
    }

    #[test]
    fn missing_ca_file_is_an_error() {
        let err = client_config(Some(Path::new("/nonexistent/ca.pem")), false).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/ca.pem"));
    }

    #[test]
    fn empty_ca_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();
        assert!(client_config(Some(file.path()), false).is_err());
    }

    #[test]
    fn context_keeps_its_id() {
        let context = tls_context(
            "rule:api",
            &OutboundTlsConfig {
                ca_file: None,
                native_roots: false,
            },
        )
        .unwrap();
        assert_eq!(context.id, "rule:api");
    }
}
