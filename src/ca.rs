//! Self-signed root CA used to sign the proxy's per-host leaf certificates.
//!
//! A [`CaStore`] is created once per process and shared by reference. The
//! certificate is written to the cache directory so child processes can trust
//! it; the private key never leaves memory.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose,
};
use secrecy::SecretString;
use tracing::{debug, info, warn};

use crate::{Error, Result};

const CA_COMMON_NAME: &str = "toolgate local interception CA";
const CA_ORGANIZATION: &str = "toolgate";

/// CA material. Only `cert_pem` is ever written to disk.
#[derive(Debug)]
pub struct CaData {
    pub cert_pem: String,
    pub key_pem: SecretString,
    pub cert_file: PathBuf,
}

/// Owner of the process-wide CA.
///
/// Create, repair and cleanup all run under one mutex.
#[derive(Debug)]
pub struct CaStore {
    dir: PathBuf,
    state: Mutex<Option<Arc<CaData>>>,
}

impl CaStore {
    /// A store that persists its certificate under `dir`. Nothing is
    /// generated until [`get_or_create`](Self::get_or_create).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            state: Mutex::new(None),
        }
    }

    /// Return the CA, generating it on first use.
    ///
    /// If the certificate file was deleted behind our back it is rewritten
    /// from memory. A missing file with no PEM in memory is an error: a new
    /// CA would not be trusted by clients already configured with the old one.
    pub fn get_or_create(&self) -> Result<Arc<CaData>> {
        let mut state = self.lock()?;

        if let Some(ca) = state.as_ref() {
            if ca.cert_file.is_file() {
                return Ok(Arc::clone(ca));
            }
            if ca.cert_pem.trim().is_empty() {
                return Err(Error::CaInconsistency(format!(
                    "certificate file {} is missing and no certificate is held in memory",
                    ca.cert_file.display()
                )));
            }
            warn!(path = %ca.cert_file.display(), "CA certificate file disappeared, restoring it");
            write_cert(&ca.cert_file, &ca.cert_pem)?;
            return Ok(Arc::clone(ca));
        }

        let ca = Arc::new(generate(&self.dir)?);
        info!(path = %ca.cert_file.display(), "created interception CA");
        *state = Some(Arc::clone(&ca));
        Ok(ca)
    }

    /// The CA if one has been created.
    pub fn current(&self) -> Option<Arc<CaData>> {
        self.state.lock().ok().and_then(|s| s.clone())
    }

    /// Delete the certificate file and forget the CA. An already missing file
    /// is fine.
    pub fn cleanup(&self) -> Result<()> {
        let mut state = self.lock()?;
        let Some(ca) = state.take() else {
            return Ok(());
        };
        match fs::remove_file(&ca.cert_file) {
            Ok(()) => {
                debug!(path = %ca.cert_file.display(), "removed CA certificate");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(
                format!("remove CA certificate {}", ca.cert_file.display()),
                e,
            )),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<Arc<CaData>>>> {
        self.state
            .lock()
            .map_err(|_| Error::CaInconsistency("CA store lock poisoned".into()))
    }
}

fn generate(dir: &Path) -> Result<CaData> {
    let key = KeyPair::generate()?;
    let cert = ca_params().self_signed(&key)?;
    let cert_file = dir.join(format!("toolgate-ca-{}.crt", uuid::Uuid::now_v7().simple()));
    let cert_pem = cert.pem();
    write_cert(&cert_file, &cert_pem)?;
    Ok(CaData {
        cert_pem,
        key_pem: SecretString::from(key.serialize_pem()),
        cert_file,
    })
}

fn ca_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, CA_COMMON_NAME.to_string());
    dn.push(DnType::OrganizationName, CA_ORGANIZATION.to_string());
    params.distinguished_name = dn;
    params
}

fn write_cert(path: &Path, pem: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::io(format!("create {}", parent.display()), e))?;
    }
    fs::write(path, pem).map_err(|e| Error::io(format!("write {}", path.display()), e))
}
