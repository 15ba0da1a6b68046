//! Loading of PEM material into rustls configurations.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use corelib::error::TransportError;
use corelib::topology::{TlsOptions, TlsPair};
use rustls::{Certificate, PrivateKey, RootCertStore, ServerName};

fn tls_err(what: &str, path: &Path, err: impl std::fmt::Display) -> TransportError {
    TransportError::Tls(format!("{what} {}: {err}", path.display()))
}

fn required<'a>(path: &'a Option<PathBuf>, field: &str) -> Result<&'a Path, TransportError> {
    path.as_deref()
        .ok_or_else(|| TransportError::Tls(format!("missing {field}")))
}

pub(crate) fn load_certs(path: &Path) -> Result<Vec<Certificate>, TransportError> {
    let file = File::open(path).map_err(|e| tls_err("cannot open", path, e))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .map_err(|e| tls_err("cannot parse certificates in", path, e))?;
    if certs.is_empty() {
        return Err(tls_err("no certificates in", path, "empty"));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

type KeyParser = fn(&mut dyn BufRead) -> io::Result<Vec<Vec<u8>>>;

const KEY_PARSERS: [KeyParser; 3] = [
    rustls_pemfile::pkcs8_private_keys,
    rustls_pemfile::rsa_private_keys,
    rustls_pemfile::ec_private_keys,
];

pub(crate) fn load_key(path: &Path) -> Result<PrivateKey, TransportError> {
    for parse in KEY_PARSERS {
        let file = File::open(path).map_err(|e| tls_err("cannot open", path, e))?;
        let keys = parse(&mut BufReader::new(file))
            .map_err(|e| tls_err("cannot parse key in", path, e))?;
        if let Some(key) = keys.into_iter().next() {
            return Ok(PrivateKey(key));
        }
    }
    Err(tls_err("no private key in", path, "empty"))
}

pub(crate) fn load_roots(path: &Path) -> Result<RootCertStore, TransportError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(&cert)
            .map_err(|e| tls_err("bad CA certificate in", path, e))?;
    }
    Ok(roots)
}

/// Name to verify the server certificate against.
pub(crate) fn server_name_str(opts: &TlsOptions, host: &str) -> String {
    if let Some(name) = &opts.server_name {
        return name.clone();
    }
    let name = host.rsplit_once(':').map_or(host, |(name, _port)| name);
    name.trim_start_matches('[').trim_end_matches(']').to_string()
}

pub(crate) fn server_name(opts: &TlsOptions, host: &str) -> Result<ServerName, TransportError> {
    let name = server_name_str(opts, host);
    ServerName::try_from(name.as_str())
        .map_err(|e| TransportError::Tls(format!("invalid server name {name:?}: {e}")))
}

pub(crate) fn client_config(opts: &TlsOptions) -> Result<rustls::ClientConfig, TransportError> {
    let roots = load_roots(required(&opts.ca_path, "client ca_path")?)?;
    let builder = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots);
    match (&opts.cert_path, &opts.key_path) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
            .map_err(|e| TransportError::Tls(e.to_string())),
        _ => Ok(builder.with_no_client_auth()),
    }
}

pub(crate) fn server_config(opts: &TlsOptions) -> Result<rustls::ServerConfig, TransportError> {
    let (certs, key) = server_identity(opts)?;
    let builder = rustls::ServerConfig::builder().with_safe_defaults();
    let builder = match &opts.ca_path {
        // A CA on the server side asks every client for a certificate.
        Some(ca) => builder.with_client_cert_verifier(
            rustls::server::AllowAnyAuthenticatedClient::new(load_roots(ca)?).boxed(),
        ),
        None => builder.with_no_client_auth(),
    };
    builder
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Tls(e.to_string()))
}

/// Certificate chain and key of a server, for backends that build their own
/// crypto config.
pub(crate) fn server_identity(
    opts: &TlsOptions,
) -> Result<(Vec<Certificate>, PrivateKey), TransportError> {
    let certs = load_certs(required(&opts.cert_path, "server cert_path")?)?;
    let key = load_key(required(&opts.key_path, "server key_path")?)?;
    Ok((certs, key))
}

pub(crate) fn client_roots(opts: &TlsOptions) -> Result<RootCertStore, TransportError> {
    load_roots(required(&opts.ca_path, "client ca_path")?)
}

/// Loads every file `tls` names and builds both configs, so unreadable or
/// malformed material is reported before any connection is attempted.
pub fn check_material(tls: &TlsPair) -> Result<(), TransportError> {
    client_config(&tls.client)?;
    server_config(&tls.server)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_name_from_host() {
        let opts = TlsOptions::default();
        assert_eq!(server_name_str(&opts, "node0.mesh:9000"), "node0.mesh");
        assert_eq!(server_name_str(&opts, "[::1]:9000"), "::1");
        assert_eq!(server_name_str(&opts, "localhost"), "localhost");

        let named = TlsOptions {
            server_name: Some("party.example".into()),
            ..Default::default()
        };
        assert_eq!(server_name_str(&named, "127.0.0.1:9000"), "party.example");
    }

    #[test]
    fn test_missing_files_are_tls_errors() {
        let err = load_certs(Path::new("/nonexistent/cert.pem")).unwrap_err();
        assert!(matches!(err, TransportError::Tls(_)));
    }
}
