use lruttl::LruCacheWithTtl;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tokio_rustls::rustls::client::danger::ServerCertVerifier;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;

// Loading the system certificate store is not cheap, so the built
// ClientConfig is cached. The TTL gives us a chance to pick up certificate
// store updates within a reasonable window.
static CONFIG_CACHE: LazyLock<LruCacheWithTtl<bool, Arc<ClientConfig>>> =
    LazyLock::new(|| LruCacheWithTtl::new_named("smtp_probe_tls_config", 2));

#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Skip certificate verification. A verifier cares whether STARTTLS
    /// works at all, not whether the MX presents a valid chain, so
    /// operators commonly enable this.
    pub insecure: bool,
}

impl TlsOptions {
    pub fn build_tls_connector(&self) -> TlsConnector {
        if let Some(config) = CONFIG_CACHE.get(&self.insecure) {
            return TlsConnector::from(config);
        }

        let provider = Arc::new(tokio_rustls::rustls::crypto::aws_lc_rs::default_provider());

        let verifier: Arc<dyn ServerCertVerifier> = if self.insecure {
            Arc::new(danger::AcceptAnyServerCert::new(provider.clone()))
        } else {
            Arc::new(
                rustls_platform_verifier::Verifier::new()
                    .with_provider(provider.clone()),
            )
        };

        let config = Arc::new(
            ClientConfig::builder_with_provider(provider)
                .with_protocol_versions(tokio_rustls::rustls::DEFAULT_VERSIONS)
                .expect("inconsistent provider/versions selected")
                .dangerous()
                .with_custom_certificate_verifier(verifier)
                .with_no_client_auth(),
        );
        CONFIG_CACHE.insert(
            self.insecure,
            config.clone(),
            Instant::now() + Duration::from_secs(15 * 60),
        );

        TlsConnector::from(config)
    }
}

mod danger {
    use std::sync::Arc;
    use tokio_rustls::rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use tokio_rustls::rustls::crypto::{self, CryptoProvider};
    use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use tokio_rustls::rustls::{DigitallySignedStruct, Error, SignatureScheme};

    /// Waves through whatever certificate the peer presents.
    /// Handshake signatures are still verified against the provider's
    /// algorithms; only chain and name validation are disabled.
    #[derive(Debug)]
    pub struct AcceptAnyServerCert {
        provider: Arc<CryptoProvider>,
    }

    impl AcceptAnyServerCert {
        pub fn new(provider: Arc<CryptoProvider>) -> Self {
            Self { provider }
        }

        fn algorithms(&self) -> &crypto::WebPkiSupportedAlgorithms {
            &self.provider.signature_verification_algorithms
        }
    }

    impl ServerCertVerifier for AcceptAnyServerCert {
        fn verify_server_cert(
            &self,
            _cert: &CertificateDer<'_>,
            _chain: &[CertificateDer<'_>],
            _name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            crypto::verify_tls12_signature(message, cert, dss, self.algorithms())
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            crypto::verify_tls13_signature(message, cert, dss, self.algorithms())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.algorithms().supported_schemes()
        }
    }
}
