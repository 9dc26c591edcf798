//! TLS configuration for the shared listening socket.
//!
//! Two server configs share one certificate resolver: the public config
//! (ALPN `h2`/`http/1.1`, no client auth) and the backend config (TLS 1.3
//! only, ALPN `bastion/0`, mandatory Ed25519 client certificate checked
//! against the allow-list during the handshake).
use std::{path::Path, sync::Arc};

use eyre::{Context, Result, eyre};
use futures_util::StreamExt;
use rustls::{
    CertificateError, DigitallySignedStruct, DistinguishedName, OtherError, ServerConfig,
    SignatureScheme,
    client::danger::HandshakeSignatureValid,
    crypto::{CryptoProvider, verify_tls13_signature},
    pki_types::{CertificateDer, UnixTime},
    server::{
        ClientHello, ResolvesServerCert,
        danger::{ClientCertVerified, ClientCertVerifier},
    },
    sign::CertifiedKey,
};

use crate::{
    config::models::{AcmeSettings, TlsConfig},
    core::identity::{AllowedSet, IdentityError},
};

/// ALPN protocol a backend offers to identify a control connection.
pub const BACKEND_ALPN: &[u8] = b"bastion/0";

/// ALPN protocol used by TLS-ALPN-01 ACME challenge handshakes.
pub const ACME_TLS_ALPN: &[u8] = b"acme-tls/1";

/// The crypto provider used for every TLS config the bastion builds.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Handshake-time client certificate check for backend connections.
///
/// Accepts a certificate only if its key is Ed25519 and the SHA-256 of the
/// raw key is in the allow-list. Chains and validity periods are ignored:
/// backends present self-signed certificates and are trusted by key alone.
#[derive(Debug)]
pub struct BackendIdentityVerifier {
    allowed: Arc<AllowedSet>,
    provider: Arc<CryptoProvider>,
}

impl BackendIdentityVerifier {
    pub fn new(allowed: Arc<AllowedSet>, provider: Arc<CryptoProvider>) -> Self {
        Self { allowed, provider }
    }
}

impl ClientCertVerifier for BackendIdentityVerifier {
    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        match self.allowed.verify(end_entity.as_ref()) {
            Ok(identity) => {
                tracing::debug!(backend = %identity, "Backend certificate accepted");
                Ok(ClientCertVerified::assertion())
            }
            Err(e) => {
                tracing::debug!("Backend certificate rejected: {}", e);
                Err(identity_error_to_tls(e))
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Err(rustls::Error::General(
            "backend connections require TLS 1.3".to_string(),
        ))
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![SignatureScheme::ED25519]
    }
}

fn identity_error_to_tls(e: IdentityError) -> rustls::Error {
    let cert_error = match e {
        IdentityError::UnrecognizedBackend(_) => CertificateError::ApplicationVerificationFailure,
        IdentityError::MalformedCertificate(_) => CertificateError::BadEncoding,
        other => CertificateError::Other(OtherError(Arc::new(other))),
    };
    rustls::Error::InvalidCertificate(cert_error)
}

/// Serves one fixed certificate chain for every handshake.
#[derive(Debug)]
pub struct StaticCertResolver(Arc<CertifiedKey>);

impl StaticCertResolver {
    /// Build from PEM-encoded chain and private key.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8], provider: &CryptoProvider) -> Result<Self> {
        let chain = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to parse certificate PEM")?;
        if chain.is_empty() {
            return Err(eyre!("No certificates found in PEM input"));
        }
        let key = rustls_pemfile::private_key(&mut &key_pem[..])
            .context("Failed to parse private key PEM")?
            .ok_or_else(|| eyre!("No private key found in PEM input"))?;
        let signing_key = provider
            .key_provider
            .load_private_key(key)
            .map_err(|e| eyre!("Unsupported private key: {}", e))?;
        Ok(Self(Arc::new(CertifiedKey::new(chain, signing_key))))
    }

    /// Load the chain and key from PEM files on disk.
    pub fn load(cert_path: &Path, key_path: &Path, provider: &CryptoProvider) -> Result<Self> {
        let cert_pem = read_pem(cert_path)?;
        let key_pem = read_pem(key_path)?;
        Self::from_pem(&cert_pem, &key_pem, provider)
            .with_context(|| format!("Invalid certificate pair {cert_path:?} / {key_path:?}"))
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
}

impl ResolvesServerCert for StaticCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

/// Where the bastion's own certificate comes from.
pub struct CertificateSource {
    pub resolver: Arc<dyn ResolvesServerCert>,
    /// Config completing TLS-ALPN-01 challenge handshakes, when ACME is in use.
    pub acme_challenge: Option<Arc<ServerConfig>>,
}

impl CertificateSource {
    pub fn from_static(resolver: StaticCertResolver) -> Self {
        Self {
            resolver: Arc::new(resolver),
            acme_challenge: None,
        }
    }

    /// Build the source described by the `[tls]` section.
    ///
    /// In ACME mode this spawns the certificate manager onto the current
    /// runtime; it keeps running for the life of the process.
    pub fn from_config(tls: &TlsConfig, provider: &CryptoProvider) -> Result<Self> {
        if let Some(acme) = &tls.acme {
            return Ok(Self::start_acme(acme));
        }
        match (&tls.cert_path, &tls.key_path) {
            (Some(cert), Some(key)) => {
                tracing::info!("Using static certificate {}", cert.display());
                Ok(Self::from_static(StaticCertResolver::load(
                    cert, key, provider,
                )?))
            }
            _ => Err(eyre!(
                "TLS requires either cert_path and key_path or an [tls.acme] section"
            )),
        }
    }

    fn start_acme(acme: &AcmeSettings) -> Self {
        use rustls_acme::{AcmeConfig, caches::DirCache};

        tracing::info!(
            domains = ?acme.domains,
            production = acme.production,
            "Provisioning certificates with ACME"
        );
        let mut state = AcmeConfig::new(acme.domains.clone())
            .contact([format!("mailto:{}", acme.email)])
            .cache_option(Some(DirCache::new(acme.cache_dir.clone())))
            .directory_lets_encrypt(acme.production)
            .state();

        let resolver = state.resolver();
        let challenge = state.challenge_rustls_config();

        tokio::spawn(async move {
            while let Some(event) = state.next().await {
                match event {
                    Ok(ok) => tracing::info!("ACME event: {:?}", ok),
                    Err(err) => tracing::error!("ACME error: {:?}", err),
                }
            }
        });

        Self {
            resolver,
            acme_challenge: Some(challenge),
        }
    }
}

/// The TLS configs selected between after reading the ClientHello.
#[derive(Clone)]
pub struct TlsConfigs {
    pub public: Arc<ServerConfig>,
    pub backend: Arc<ServerConfig>,
    pub acme_challenge: Option<Arc<ServerConfig>>,
}

impl TlsConfigs {
    pub fn new(
        source: CertificateSource,
        allowed: Arc<AllowedSet>,
        provider: Arc<CryptoProvider>,
    ) -> Result<Self> {
        let mut public = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .context("Crypto provider rejects default protocol versions")?
            .with_no_client_auth()
            .with_cert_resolver(source.resolver.clone());
        public.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        let verifier = Arc::new(BackendIdentityVerifier::new(allowed, provider.clone()));
        let mut backend = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13])
            .context("Crypto provider does not support TLS 1.3")?
            .with_client_cert_verifier(verifier)
            .with_cert_resolver(source.resolver);
        backend.alpn_protocols = vec![BACKEND_ALPN.to_vec()];

        Ok(Self {
            public: Arc::new(public),
            backend: Arc::new(backend),
            acme_challenge: source.acme_challenge,
        })
    }
}
