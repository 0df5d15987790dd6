//! STARTTLS credentials with hot reload
//!
//! The certificate and key are re-read whenever either file's modification
//! time changes. Handshakes always use the most recently accepted pair.

use graph_smtpd_common::{Error, Result};
use rustls::crypto::ring::{default_provider, sign::any_supported_type};
use rustls::pki_types::CertificateDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime};
use tokio::time::MissedTickBehavior;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_RELOAD_INTERVAL: Duration = Duration::from_secs(5);

/// Serves the current certificate and swaps it when the files change
pub struct CertificateRotator {
    cert_path: PathBuf,
    key_path: PathBuf,
    interval: Duration,
    current: RwLock<Arc<CertifiedKey>>,
}

impl CertificateRotator {
    /// Load the initial pair. Fails if either file is missing or invalid.
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Result<Self> {
        let cert_path = cert_path.into();
        let key_path = key_path.into();
        let key = load_certified_key(&cert_path, &key_path)?;

        info!(
            "Loaded TLS certificate from {} ({} in chain)",
            cert_path.display(),
            key.cert.len()
        );

        Ok(Self {
            cert_path,
            key_path,
            interval: DEFAULT_RELOAD_INTERVAL,
            current: RwLock::new(key),
        })
    }

    /// How often the files are checked for changes
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn current(&self) -> Arc<CertifiedKey> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Re-read both files. On failure the previous pair stays in use.
    pub fn reload(&self) -> Result<()> {
        let key = load_certified_key(&self.cert_path, &self.key_path)?;
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = key;
        Ok(())
    }

    /// A TLS acceptor whose handshakes resolve through this rotator
    pub fn acceptor(self: &Arc<Self>) -> Result<TlsAcceptor> {
        let config = ServerConfig::builder_with_provider(Arc::new(default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Tls(format!("Failed to build TLS config: {}", e)))?
            .with_no_client_auth()
            .with_cert_resolver(self.clone());
        Ok(TlsAcceptor::from(Arc::new(config)))
    }

    /// Watch the files until `cancel` fires.
    ///
    /// Returns an error if the files can no longer be stat'ed.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut last = self.modified()?;

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Certificate watcher stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            let modified = self.modified()?;
            if modified == last {
                continue;
            }
            last = modified;

            match self.reload() {
                Ok(()) => info!("Reloaded TLS certificate from {}", self.cert_path.display()),
                Err(e) => warn!("Ignoring TLS certificate update, keeping previous: {}", e),
            }
        }
    }

    fn modified(&self) -> Result<(SystemTime, SystemTime)> {
        Ok((modified(&self.cert_path)?, modified(&self.key_path)?))
    }
}

impl std::fmt::Debug for CertificateRotator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateRotator")
            .field("cert_path", &self.cert_path)
            .field("key_path", &self.key_path)
            .field("interval", &self.interval)
            .finish()
    }
}

impl ResolvesServerCert for CertificateRotator {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.current())
    }
}

fn modified(path: &Path) -> Result<SystemTime> {
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map_err(|e| Error::Tls(format!("Failed to stat {}: {}", path.display(), e)))
}

fn load_certified_key(cert_path: &Path, key_path: &Path) -> Result<Arc<CertifiedKey>> {
    let cert_file = File::open(cert_path)
        .map_err(|e| Error::Tls(format!("Failed to open certificate file: {}", e)))?;
    let chain: Vec<CertificateDer<'static>> = certs(&mut BufReader::new(cert_file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("Failed to parse certificates: {}", e)))?;

    if chain.is_empty() {
        return Err(Error::Tls(format!(
            "No certificates found in {}",
            cert_path.display()
        )));
    }

    let key_file =
        File::open(key_path).map_err(|e| Error::Tls(format!("Failed to open key file: {}", e)))?;
    let key = private_key(&mut BufReader::new(key_file))
        .map_err(|e| Error::Tls(format!("Failed to read private key: {}", e)))?
        .ok_or_else(|| Error::Tls(format!("No private key found in {}", key_path.display())))?;

    let signing_key = any_supported_type(&key)
        .map_err(|e| Error::Tls(format!("Unsupported private key: {}", e)))?;

    let certified = CertifiedKey::new(chain, signing_key);
    certified.keys_match().map_err(|e| {
        Error::Tls(format!(
            "Private key {} does not match certificate {}: {}",
            key_path.display(),
            cert_path.display(),
            e
        ))
    })?;

    Ok(Arc::new(certified))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    struct Pair {
        cert_pem: String,
        key_pem: String,
        der: CertificateDer<'static>,
    }

    fn generate(name: &str) -> Pair {
        let generated = rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap();
        Pair {
            cert_pem: generated.cert.pem(),
            key_pem: generated.key_pair.serialize_pem(),
            der: generated.cert.der().clone(),
        }
    }

    fn write(dir: &TempDir, pair: &Pair) -> (PathBuf, PathBuf) {
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        fs::write(&cert, &pair.cert_pem).unwrap();
        fs::write(&key, &pair.key_pem).unwrap();
        (cert, key)
    }

    fn touch(path: &Path, offset: Duration) {
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + offset).unwrap();
    }

    #[test]
    fn test_load_and_resolve() {
        let dir = TempDir::new().unwrap();
        let pair = generate("localhost");
        let (cert, key) = write(&dir, &pair);

        let rotator = CertificateRotator::new(&cert, &key).unwrap();
        assert_eq!(rotator.current().cert, vec![pair.der]);
    }

    #[test]
    fn test_startup_failures() {
        let dir = TempDir::new().unwrap();
        let pair = generate("localhost");
        let (cert, key) = write(&dir, &pair);

        let missing = dir.path().join("missing.pem");
        assert!(matches!(CertificateRotator::new(&missing, &key), Err(Error::Tls(_))));

        let empty = dir.path().join("empty.pem");
        fs::write(&empty, "").unwrap();
        assert!(matches!(CertificateRotator::new(&empty, &key), Err(Error::Tls(_))));
        assert!(matches!(CertificateRotator::new(&cert, &empty), Err(Error::Tls(_))));
    }

    #[test]
    fn test_invalid_update_keeps_previous() {
        let dir = TempDir::new().unwrap();
        let pair = generate("localhost");
        let (cert, key) = write(&dir, &pair);
        let rotator = CertificateRotator::new(&cert, &key).unwrap();

        fs::write(&key, "not a key").unwrap();
        assert!(rotator.reload().is_err());
        assert_eq!(rotator.current().cert[0], pair.der);

        let next = generate("mail.example.com");
        write(&dir, &next);
        rotator.reload().unwrap();
        assert_eq!(rotator.current().cert[0], next.der);
    }

    #[test]
    fn test_mismatched_pair_is_rejected() {
        let dir = TempDir::new().unwrap();
        let first = generate("localhost");
        let other = generate("mail.example.com");

        let (cert, key) = write(&dir, &first);
        fs::write(&key, &other.key_pem).unwrap();
        assert!(matches!(CertificateRotator::new(&cert, &key), Err(Error::Tls(_))));

        fs::write(&key, &first.key_pem).unwrap();
        let rotator = CertificateRotator::new(&cert, &key).unwrap();

        fs::write(&key, &other.key_pem).unwrap();
        assert!(matches!(rotator.reload(), Err(Error::Tls(_))));
        assert_eq!(rotator.current().cert[0], first.der);

        fs::write(&cert, &other.cert_pem).unwrap();
        rotator.reload().unwrap();
        assert_eq!(rotator.current().cert[0], other.der);
    }

    #[test]
    fn test_acceptor_builds() {
        let dir = TempDir::new().unwrap();
        let (cert, key) = write(&dir, &generate("localhost"));
        let rotator = Arc::new(CertificateRotator::new(&cert, &key).unwrap());
        assert!(rotator.acceptor().is_ok());
    }

    #[tokio::test]
    async fn test_run_picks_up_changes() {
        let dir = TempDir::new().unwrap();
        let first = generate("localhost");
        let (cert, key) = write(&dir, &first);
        let rotator = Arc::new(
            CertificateRotator::new(&cert, &key)
                .unwrap()
                .with_interval(Duration::from_millis(20)),
        );

        let cancel = CancellationToken::new();
        let watcher = {
            let rotator = rotator.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { rotator.run(cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = generate("mail.example.com");
        write(&dir, &second);
        touch(&cert, Duration::from_secs(10));
        touch(&key, Duration::from_secs(10));

        let mut swapped = false;
        for _ in 0..100 {
            if rotator.current().cert[0] == second.der {
                swapped = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(swapped, "certificate was not reloaded");

        cancel.cancel();
        watcher.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_fails_when_files_disappear() {
        let dir = TempDir::new().unwrap();
        let pair = generate("localhost");
        let (cert, key) = write(&dir, &pair);
        let rotator = CertificateRotator::new(&cert, &key)
            .unwrap()
            .with_interval(Duration::from_millis(10));

        fs::remove_file(&cert).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), rotator.run(CancellationToken::new()))
            .await
            .unwrap();
        assert!(matches!(result, Err(Error::Tls(_))));
    }
}
