use std::sync::OnceLock;

/// Select the process-wide rustls `CryptoProvider` before the first TLS handshake.
///
/// rustls 0.23 panics when it cannot infer a default, which happens as soon as two
/// dependencies enable different providers. Safe to call from every connect.
pub fn install_rustls_crypto_provider() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        // Err means another component already installed one; either way a provider is set.
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
