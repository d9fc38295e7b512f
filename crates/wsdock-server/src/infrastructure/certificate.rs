//! CertificateSource: turns a PKCS#12 bundle into a rustls server identity.
//!
//! # PKCS#12 (for beginners)
//!
//! A PKCS#12 file (`.p12` / `.pfx`) is a passphrase-protected container that
//! holds a private key together with its certificate chain.  rustls cannot
//! read the container itself, so the bundle is opened with `p12-keystore`
//! and the key and certificates are handed to rustls as DER bytes.
//!
//! # Embedded bundles
//!
//! A host application may compile its bundle in as text: standard or
//! URL-safe base64, written backwards.  Reversing the text is *not*
//! encryption and protects nothing; anyone holding the binary can recover
//! the bundle.  Treat an embedded bundle as public and keep real secrets in
//! proper secret storage.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use p12_keystore::KeyStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use thiserror::Error;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::domain::TlsMode;

/// Errors that can occur while building a TLS identity.
#[derive(Debug, Error)]
pub enum CertificateError {
    /// The bundle file could not be read.
    #[error("I/O error reading certificate bundle at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The embedded bundle text is not valid base64 once reversed.
    #[error("embedded certificate bundle is not valid base64: {0}")]
    Reveal(#[from] base64::DecodeError),

    /// The bytes are not a PKCS#12 bundle, or the passphrase is wrong.
    #[error("failed to decode PKCS#12 bundle: {0}")]
    Pkcs12(String),

    /// The bundle decoded but holds no private key with a certificate chain.
    #[error("PKCS#12 bundle contains no private key chain")]
    MissingKeyChain,

    /// rustls rejected the key or certificates.
    #[error("TLS configuration rejected the identity: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Where a PKCS#12 bundle comes from, plus its passphrase.
#[derive(Clone)]
pub enum CertificateSource {
    File { path: PathBuf, passphrase: String },
    Bytes { bundle: Vec<u8>, passphrase: String },
    Embedded { encoded: String, passphrase: String },
}

impl fmt::Debug for CertificateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertificateSource::File { path, .. } => {
                f.debug_struct("File").field("path", path).finish_non_exhaustive()
            }
            CertificateSource::Bytes { bundle, .. } => f
                .debug_struct("Bytes")
                .field("len", &bundle.len())
                .finish_non_exhaustive(),
            CertificateSource::Embedded { encoded, .. } => f
                .debug_struct("Embedded")
                .field("len", &encoded.len())
                .finish_non_exhaustive(),
        }
    }
}

impl CertificateSource {
    pub fn file(path: impl Into<PathBuf>, passphrase: impl Into<String>) -> Self {
        Self::File {
            path: path.into(),
            passphrase: passphrase.into(),
        }
    }

    pub fn bytes(bundle: Vec<u8>, passphrase: impl Into<String>) -> Self {
        Self::Bytes {
            bundle,
            passphrase: passphrase.into(),
        }
    }

    /// A bundle stored as reversed base64 text.  See the module docs: this is
    /// cosmetic only.
    pub fn embedded(encoded: impl Into<String>, passphrase: impl Into<String>) -> Self {
        Self::Embedded {
            encoded: encoded.into(),
            passphrase: passphrase.into(),
        }
    }

    /// The source described by `mode`, or `None` for plaintext.
    pub fn from_mode(mode: &TlsMode) -> Option<Self> {
        match mode {
            TlsMode::None => None,
            TlsMode::Pkcs12File { path, passphrase } => {
                Some(Self::file(path.clone(), passphrase.clone()))
            }
            TlsMode::Pkcs12Bytes { bundle, passphrase } => {
                Some(Self::bytes(bundle.clone(), passphrase.clone()))
            }
            TlsMode::Embedded {
                encoded,
                passphrase,
            } => Some(Self::embedded(encoded.clone(), passphrase.clone())),
        }
    }

    /// Loads and decodes the bundle.
    ///
    /// # Errors
    ///
    /// Any [`CertificateError`]; the engine treats every one of them as
    /// "serve plaintext instead".
    pub fn resolve(&self) -> Result<TlsIdentity, CertificateError> {
        match self {
            CertificateSource::File { path, passphrase } => {
                let bundle = read_bundle(path)?;
                TlsIdentity::from_pkcs12(&bundle, passphrase)
            }
            CertificateSource::Bytes { bundle, passphrase } => {
                TlsIdentity::from_pkcs12(bundle, passphrase)
            }
            CertificateSource::Embedded {
                encoded,
                passphrase,
            } => {
                let bundle = reveal_embedded(encoded)?;
                TlsIdentity::from_pkcs12(&bundle, passphrase)
            }
        }
    }
}

/// Certificate chain and private key, ready for rustls.
pub struct TlsIdentity {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("chain_len", &self.chain.len())
            .finish_non_exhaustive()
    }
}

impl TlsIdentity {
    /// Opens a PKCS#12 bundle with `passphrase`.
    pub fn from_pkcs12(bundle: &[u8], passphrase: &str) -> Result<Self, CertificateError> {
        let store = KeyStore::from_pkcs12(bundle, passphrase)
            .map_err(|e| CertificateError::Pkcs12(e.to_string()))?;
        let (alias, key_chain) = store
            .private_key_chain()
            .ok_or(CertificateError::MissingKeyChain)?;
        if key_chain.chain().is_empty() {
            return Err(CertificateError::MissingKeyChain);
        }
        debug!(
            "loaded PKCS#12 entry '{alias}' with {} certificate(s)",
            key_chain.chain().len()
        );

        let chain = key_chain
            .chain()
            .iter()
            .map(|cert| CertificateDer::from(cert.as_der().to_vec()))
            .collect();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_chain.key().to_vec()));
        Ok(Self { chain, key })
    }

    /// Builds a TLS 1.2/1.3 server config without client authentication.
    pub fn into_server_config(self) -> Result<Arc<rustls::ServerConfig>, CertificateError> {
        let config = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(self.chain, self.key)?;
        Ok(Arc::new(config))
    }

    pub fn into_acceptor(self) -> Result<TlsAcceptor, CertificateError> {
        Ok(TlsAcceptor::from(self.into_server_config()?))
    }
}

/// Undoes the embedded-bundle encoding: reverse, drop whitespace, accept the
/// URL-safe alphabet, restore padding, base64-decode.
pub fn reveal_embedded(encoded: &str) -> Result<Vec<u8>, CertificateError> {
    let mut text: String = encoded
        .chars()
        .rev()
        .filter(|c| !c.is_whitespace())
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();
    while text.len() % 4 != 0 {
        text.push('=');
    }
    Ok(STANDARD.decode(text)?)
}

/// Inverse of [`reveal_embedded`], for producing embedded bundles.
pub fn conceal_for_embedding(bundle: &[u8]) -> String {
    STANDARD.encode(bundle).chars().rev().collect()
}

fn read_bundle(path: &Path) -> Result<Vec<u8>, CertificateError> {
    std::fs::read(path).map_err(|source| CertificateError::Io {
        path: path.to_path_buf(),
        source,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
