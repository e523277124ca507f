//! Service-account credentials for talking to the cluster control plane.
//!
//! A pod gets a bearer token and the cluster CA bundle mounted at a well-known
//! location. Outside a cluster those files are absent, which is reported as
//! [`Credentials::NotInCluster`] rather than an error.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use http::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Certificate, Identity};
use tracing::{debug, info};

use crate::{Error, Result};

/// Directory where the service-account secret is mounted.
pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Where to find the credential files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialPaths {
    /// Bearer token file.
    pub token: PathBuf,
    /// PEM bundle with one or more certificates.
    pub certificates: PathBuf,
    /// Namespace file. Optional even in a cluster.
    pub namespace: PathBuf,
    /// PEM file with a client certificate and its private key.
    pub identity: Option<PathBuf>,
}

impl Default for CredentialPaths {
    fn default() -> Self {
        Self::in_dir(SERVICE_ACCOUNT_DIR)
    }
}

impl CredentialPaths {
    /// `token`, `ca.crt` and `namespace` inside `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            token: dir.join("token"),
            certificates: dir.join("ca.crt"),
            namespace: dir.join("namespace"),
            identity: None,
        }
    }

    /// Also present a client certificate loaded from `path`.
    pub fn with_identity(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity = Some(path.into());
        self
    }
}

/// Outcome of [`CredentialBundle::load`].
#[derive(Debug)]
pub enum Credentials {
    /// Credentials were found and parsed.
    Bundle(CredentialBundle),
    /// The credential files are absent: not running inside a cluster.
    NotInCluster,
}

impl Credentials {
    /// The bundle, if one was loaded.
    pub fn bundle(&self) -> Option<&CredentialBundle> {
        match self {
            Credentials::Bundle(bundle) => Some(bundle),
            Credentials::NotInCluster => None,
        }
    }

    /// Consume into the bundle, if one was loaded.
    pub fn into_bundle(self) -> Option<CredentialBundle> {
        match self {
            Credentials::Bundle(bundle) => Some(bundle),
            Credentials::NotInCluster => None,
        }
    }
}

/// Bearer token plus the certificates used to reach the control plane.
#[derive(Clone)]
pub struct CredentialBundle {
    token: String,
    certificates: Vec<Certificate>,
    identity_pem: Option<Vec<u8>>,
    namespace: Option<String>,
}

impl CredentialBundle {
    /// Load from `paths`.
    ///
    /// Returns [`Credentials::NotInCluster`] when the token or certificate
    /// file does not exist, and [`Error::CredentialLoad`] naming the file
    /// when one exists but cannot be parsed.
    pub fn load(paths: &CredentialPaths) -> Result<Credentials> {
        if !paths.token.exists() || !paths.certificates.exists() {
            debug!(
                token = %paths.token.display(),
                certificates = %paths.certificates.display(),
                "credential files absent, not in cluster"
            );
            return Ok(Credentials::NotInCluster);
        }

        let token = read_to_string(&paths.token)?;
        let pem = fs::read(&paths.certificates)
            .map_err(|e| Error::credential_load(&paths.certificates, e.to_string()))?;
        let mut bundle = Self::from_pem(&token, &pem).map_err(|e| match e {
            CredentialPart::Token(reason) => Error::credential_load(&paths.token, reason),
            CredentialPart::Certificates(reason) => {
                Error::credential_load(&paths.certificates, reason)
            }
        })?;

        if paths.namespace.exists() {
            let namespace = read_to_string(&paths.namespace)?;
            let namespace = namespace.trim();
            if !namespace.is_empty() {
                bundle.namespace = Some(namespace.to_string());
            }
        }

        if let Some(identity) = &paths.identity {
            let pem = fs::read(identity)
                .map_err(|e| Error::credential_load(identity, e.to_string()))?;
            Identity::from_pem(&pem).map_err(|e| Error::credential_load(identity, e.to_string()))?;
            bundle.identity_pem = Some(pem);
        }

        info!(
            certificates = bundle.certificates.len(),
            namespace = bundle.namespace.as_deref().unwrap_or("-"),
            client_identity = bundle.identity_pem.is_some(),
            "loaded cluster credentials"
        );
        Ok(Credentials::Bundle(bundle))
    }

    /// Build a bundle from in-memory token text and a PEM certificate bundle.
    pub fn from_parts(token: &str, certificates_pem: &[u8]) -> Result<Self> {
        Self::from_pem(token, certificates_pem).map_err(|e| match e {
            CredentialPart::Token(reason) => Error::credential_load("<token>", reason),
            CredentialPart::Certificates(reason) => Error::credential_load("<certificates>", reason),
        })
    }

    fn from_pem(token: &str, certificates_pem: &[u8]) -> std::result::Result<Self, CredentialPart> {
        let token = token.trim();
        if token.is_empty() {
            return Err(CredentialPart::Token("token is empty".into()));
        }
        HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| CredentialPart::Token("token contains invalid characters".into()))?;

        let certificates = Certificate::from_pem_bundle(certificates_pem)
            .map_err(|e| CredentialPart::Certificates(e.to_string()))?;
        if certificates.is_empty() {
            return Err(CredentialPart::Certificates("no PEM certificates found".into()));
        }

        Ok(Self {
            token: token.to_string(),
            certificates,
            identity_pem: None,
            namespace: None,
        })
    }

    /// The bearer token.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Every certificate from the bundle file, in file order.
    pub fn certificates(&self) -> &[Certificate] {
        &self.certificates
    }

    /// The first certificate of the bundle.
    pub fn trust_anchor(&self) -> &Certificate {
        // from_pem rejects empty bundles
        &self.certificates[0]
    }

    /// Whether a client certificate is presented.
    pub fn has_identity(&self) -> bool {
        self.identity_pem.is_some()
    }

    /// Namespace read from the service-account mount, if any.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Set the namespace, as if read from the mount.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// An HTTP client that trusts the bundle and sends the bearer token.
    pub fn http_client(&self, timeout: Duration) -> Result<reqwest::Client> {
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", self.token))
            .map_err(|e| Error::credential_load("<token>", e.to_string()))?;
        auth.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(concat!("cluster-relay/", env!("CARGO_PKG_VERSION")));
        for certificate in &self.certificates {
            builder = builder.add_root_certificate(certificate.clone());
        }
        if let Some(pem) = &self.identity_pem {
            builder = builder.identity(Identity::from_pem(pem)?);
        }
        Ok(builder.build()?)
    }
}

impl fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("token", &"<redacted>")
            .field("certificates", &self.certificates.len())
            .field("identity", &self.identity_pem.is_some())
            .field("namespace", &self.namespace)
            .finish()
    }
}

enum CredentialPart {
    Token(String),
    Certificates(String),
}

fn read_to_string(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| Error::credential_load(path, e.to_string()))
}
