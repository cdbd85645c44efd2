//! TLS credentials and handshake-time certificate selection
//! Credentials are decoded once at startup; the SNI resolver only reads them

use crate::config::SslPaths;
use crate::error::CredentialLoadError;
use crate::routes::RouteTable;
use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::InconsistentKeys;
use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Decoded private key, certificate chain and CA bundle for one hostname
#[derive(Debug)]
pub struct CredentialSet {
    certified: Arc<CertifiedKey>,
    ca_bundle: Vec<CertificateDer<'static>>,
}

impl CredentialSet {
    /// Read and decode the three PEM files
    pub fn load(paths: &SslPaths) -> Result<Self, CredentialLoadError> {
        let key_pem = read_file(&paths.key_path)?;
        let chain_pem = read_file(&paths.cert_path)?;
        let ca_pem = read_file(&paths.ca_path)?;

        let key = parse_private_key(&paths.key_path, &key_pem)?;
        let chain = parse_certificates(&paths.cert_path, &chain_pem)?;
        let ca_bundle = parse_certificates(&paths.ca_path, &ca_pem)?;

        Self::assemble(&paths.key_path, key, chain, ca_bundle)
    }

    /// Decode credentials from in-memory PEM data
    pub fn from_pem(key_pem: &[u8], chain_pem: &[u8], ca_pem: &[u8]) -> Result<Self, CredentialLoadError> {
        let origin = Path::new("<memory>");
        let key = parse_private_key(origin, key_pem)?;
        let chain = parse_certificates(origin, chain_pem)?;
        let ca_bundle = parse_certificates(origin, ca_pem)?;

        Self::assemble(origin, key, chain, ca_bundle)
    }

    fn assemble(
        key_origin: &Path,
        key: PrivateKeyDer<'static>,
        chain: Vec<CertificateDer<'static>>,
        ca_bundle: Vec<CertificateDer<'static>>,
    ) -> Result<Self, CredentialLoadError> {
        let signing_key = any_supported_type(&key).map_err(|source| CredentialLoadError::UnsupportedKey {
            path: key_origin.to_path_buf(),
            source,
        })?;

        // The CA bundle supplies intermediates missing from the chain
        let mut served = chain;
        for ca in &ca_bundle {
            if !served.contains(ca) {
                served.push(ca.clone());
            }
        }

        let certified = CertifiedKey::new(served, signing_key);
        match certified.keys_match() {
            // Keys that cannot report their public half are accepted as-is
            Ok(()) | Err(rustls::Error::InconsistentKeys(InconsistentKeys::Unknown)) => {}
            Err(source) => {
                return Err(CredentialLoadError::KeyMismatch {
                    path: key_origin.to_path_buf(),
                    source,
                })
            }
        }

        Ok(Self {
            certified: Arc::new(certified),
            ca_bundle,
        })
    }

    /// Key and chain offered during the handshake
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        self.certified.clone()
    }

    /// Certificates sent to the client, leaf first
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.certified.cert
    }

    pub fn ca_bundle(&self) -> &[CertificateDer<'static>] {
        &self.ca_bundle
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, CredentialLoadError> {
    fs::read(path).map_err(|source| CredentialLoadError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_certificates(path: &Path, pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, CredentialLoadError> {
    let mut reader = BufReader::new(pem);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| CredentialLoadError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    if certs.is_empty() {
        return Err(CredentialLoadError::NoCertificates {
            path: path.to_path_buf(),
        });
    }

    Ok(certs)
}

fn parse_private_key(path: &Path, pem: &[u8]) -> Result<PrivateKeyDer<'static>, CredentialLoadError> {
    let mut reader = BufReader::new(pem);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| CredentialLoadError::Parse {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| CredentialLoadError::NoPrivateKey {
            path: path.to_path_buf(),
        })
}

/// Per-hostname credentials plus the fallback used for unmatched names
#[derive(Debug)]
pub struct CredentialStore {
    routes: Arc<RouteTable>,
    default: Arc<CredentialSet>,
}

impl CredentialStore {
    pub fn new(routes: Arc<RouteTable>, default: Arc<CredentialSet>) -> Self {
        Self { routes, default }
    }

    /// Credential configured for `hostname`, if any
    pub fn get(&self, hostname: &str) -> Option<&Arc<CredentialSet>> {
        self.routes.get(hostname).map(|route| &route.credential)
    }

    pub fn default_credential(&self) -> &Arc<CredentialSet> {
        &self.default
    }
}

/// Chooses the certificate for a connection from the SNI name alone.
///
/// Runs inside the handshake, before any HTTP data exists, and never blocks:
/// every credential is already decoded in the store.
#[derive(Debug, Clone)]
pub struct SniResolver {
    store: Arc<CredentialStore>,
}

impl SniResolver {
    pub fn new(store: Arc<CredentialStore>) -> Self {
        Self { store }
    }

    /// Route credential for an exact hostname match, otherwise the default.
    pub fn resolve(&self, server_name: Option<&str>) -> Arc<CredentialSet> {
        let Some(name) = server_name else {
            debug!("No SNI provided, using default certificate");
            return self.store.default_credential().clone();
        };

        match self.store.get(name) {
            Some(credential) => {
                debug!(hostname = %name, "SNI matched configured domain");
                credential.clone()
            }
            None => {
                warn!(hostname = %name, "No SSL config found, using default certificate");
                self.store.default_credential().clone()
            }
        }
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(SniResolver::resolve(self, client_hello.server_name()).certified_key())
    }
}

/// Server TLS configuration whose certificate choice is delegated to `resolver`
pub fn server_tls_config(resolver: SniResolver) -> Result<rustls::ServerConfig, rustls::Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(resolver));

    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(config)
}
