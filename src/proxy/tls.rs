//! TLS material for both sides of an intercepted connection.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use secrecy::ExposeSecret;
use tracing::{debug, warn};

use crate::ca::CaData;
use crate::{Error, Result};

const HTTP1_ALPN: &[u8] = b"http/1.1";

/// Crypto provider used for every TLS config the proxy builds.
pub(crate) fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Parse every certificate in a PEM bundle.
pub(crate) fn parse_pem_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    CertificateDer::pem_slice_iter(pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Proxy(format!("invalid PEM certificate: {}", e)))
}

// ---------------------------------------------------------------------------
// Leaf certificates
// ---------------------------------------------------------------------------

/// Issues and caches per-host server configs signed by the CA.
pub(crate) struct LeafCertStore {
    issuer: Issuer<'static, KeyPair>,
    ca_der: CertificateDer<'static>,
    provider: Arc<CryptoProvider>,
    capacity: usize,
    cache: Mutex<LeafCache>,
}

#[derive(Default)]
struct LeafCache {
    configs: HashMap<String, Arc<ServerConfig>>,
    lru: VecDeque<String>,
}

impl LeafCertStore {
    pub(crate) fn new(ca: &CaData, capacity: usize) -> Result<Self> {
        let ca_key = KeyPair::from_pem(ca.key_pem.expose_secret())?;
        let issuer = Issuer::from_ca_cert_pem(&ca.cert_pem, ca_key)?;
        let ca_der = CertificateDer::from_pem_slice(ca.cert_pem.as_bytes())
            .map_err(|e| Error::Proxy(format!("invalid CA certificate: {}", e)))?;
        Ok(Self {
            issuer,
            ca_der,
            provider: provider(),
            capacity,
            cache: Mutex::new(LeafCache::default()),
        })
    }

    /// Server config presenting a leaf certificate for `host`.
    pub(crate) fn server_config_for(&self, host: &str) -> Result<Arc<ServerConfig>> {
        let host = normalize_host(host);
        {
            let mut cache = self.lock()?;
            if let Some(config) = cache.configs.get(&host).cloned() {
                touch(&mut cache.lru, &host);
                return Ok(config);
            }
        }

        // Signing happens outside the lock; a concurrent miss for the same
        // host just issues twice.
        let config = self.issue(&host)?;
        debug!(host = %host, "issued leaf certificate");

        if self.capacity > 0 {
            let mut cache = self.lock()?;
            if cache.configs.len() >= self.capacity && !cache.configs.contains_key(&host) {
                if let Some(oldest) = cache.lru.pop_front() {
                    cache.configs.remove(&oldest);
                }
            }
            cache.configs.insert(host.clone(), Arc::clone(&config));
            touch(&mut cache.lru, &host);
        }
        Ok(config)
    }

    fn issue(&self, host: &str) -> Result<Arc<ServerConfig>> {
        let key = KeyPair::generate()?;
        let key_der = PrivatePkcs8KeyDer::from(key.serialize_der());
        let cert = leaf_params(host)?.signed_by(&key, &self.issuer)?;

        let chain = vec![cert.der().clone(), self.ca_der.clone()];
        let mut config = ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(chain, PrivateKeyDer::from(key_der))?;
        config.alpn_protocols = vec![HTTP1_ALPN.to_vec()];
        Ok(Arc::new(config))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LeafCache>> {
        self.cache
            .lock()
            .map_err(|_| Error::Proxy("leaf certificate cache lock poisoned".into()))
    }

    #[cfg(test)]
    fn cached_hosts(&self) -> Vec<String> {
        self.cache.lock().unwrap().lru.iter().cloned().collect()
    }
}

fn leaf_params(host: &str) -> Result<CertificateParams> {
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.use_authority_key_identifier_extension = true;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host.to_string());
    params.distinguished_name = dn;

    match host.parse::<IpAddr>() {
        Ok(ip) => params.subject_alt_names.push(SanType::IpAddress(ip)),
        Err(_) => params
            .subject_alt_names
            .push(SanType::DnsName(host.try_into()?)),
    }
    Ok(params)
}

fn normalize_host(host: &str) -> String {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    match host.parse::<IpAddr>() {
        Ok(_) => host.to_string(),
        Err(_) => host.to_ascii_lowercase(),
    }
}

fn touch(lru: &mut VecDeque<String>, key: &str) {
    if let Some(pos) = lru.iter().position(|k| k == key) {
        lru.remove(pos);
    }
    lru.push_back(key.to_string());
}

// ---------------------------------------------------------------------------
// Outbound client config
// ---------------------------------------------------------------------------

/// Client config for connections to origin servers: webpki roots plus
/// `extra_roots`, or no verification at all when `insecure`.
pub(crate) fn client_config(
    extra_roots: &[CertificateDer<'static>],
    insecure: bool,
) -> Result<Arc<ClientConfig>> {
    let builder =
        ClientConfig::builder_with_provider(provider()).with_safe_default_protocol_versions()?;

    let mut config = if insecure {
        warn!("origin certificate verification is disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureSkipVerify))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let (added, ignored) = roots.add_parsable_certificates(extra_roots.iter().cloned());
        if ignored > 0 {
            warn!(added, ignored, "some extra trust roots could not be parsed");
        }
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    config.alpn_protocols = vec![HTTP1_ALPN.to_vec()];
    Ok(Arc::new(config))
}

#[derive(Debug)]
struct InsecureSkipVerify;

impl ServerCertVerifier for InsecureSkipVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::CaStore;

    fn store(capacity: usize) -> (tempfile::TempDir, LeafCertStore) {
        let dir = tempfile::tempdir().unwrap();
        let ca = CaStore::new(dir.path()).get_or_create().unwrap();
        let leaves = LeafCertStore::new(&ca, capacity).unwrap();
        (dir, leaves)
    }

    #[test]
    fn leaf_configs_are_cached_per_host() {
        let (_dir, leaves) = store(4);
        let a = leaves.server_config_for("API.example.com").unwrap();
        let b = leaves.server_config_for("api.example.com").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn cache_evicts_least_recently_used() {
        let (_dir, leaves) = store(2);
        leaves.server_config_for("a.test").unwrap();
        leaves.server_config_for("b.test").unwrap();
        leaves.server_config_for("a.test").unwrap();
        leaves.server_config_for("c.test").unwrap();
        assert_eq!(leaves.cached_hosts(), vec!["a.test", "c.test"]);
    }

    #[test]
    fn ip_hosts_get_ip_sans() {
        let (_dir, leaves) = store(0);
        leaves.server_config_for("127.0.0.1").unwrap();
        leaves.server_config_for("[::1]").unwrap();
        assert!(leaves.cached_hosts().is_empty());
    }

    #[test]
    fn pem_bundles_parse_all_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let one = CaStore::new(dir.path()).get_or_create().unwrap();
        let two = CaStore::new(dir.path()).get_or_create().unwrap();
        let bundle = format!("{}{}", one.cert_pem, two.cert_pem);
        assert_eq!(parse_pem_certs(bundle.as_bytes()).unwrap().len(), 2);
        assert!(parse_pem_certs(b"").unwrap().is_empty());
    }

    #[test]
    fn client_configs_build() {
        client_config(&[], false).unwrap();
        client_config(&[], true).unwrap();
    }
}
