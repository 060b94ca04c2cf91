//! HTTP index download.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{pem::PemObject, CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use catalog_core::{
    types::{IndexDocument, TlsPolicy},
    Credentials,
};

use crate::error::SyncError;

/// Upper bound on a downloaded `index.yaml`.
const MAX_INDEX_BYTES: u64 = 256 * 1024 * 1024;
const TIMEOUT: Duration = Duration::from_secs(60);
const MAX_REDIRECTS: usize = 10;

/// Downloads a repository's `index.yaml`.
pub trait IndexFetcher: Send + Sync {
    /// `Ok(None)` when the server has no index (404 or empty body).
    fn download_index(
        &self,
        credentials: Option<&Credentials>,
        url: &str,
        tls: &TlsPolicy,
        disable_same_origin_check: bool,
    ) -> Result<Option<IndexDocument>, SyncError>;
}

/// [`IndexFetcher`] backed by `ureq`.
#[derive(Debug, Default, Clone)]
pub struct HttpFetcher;

impl HttpFetcher {
    pub fn new() -> Self {
        Self
    }
}

impl IndexFetcher for HttpFetcher {
    fn download_index(
        &self,
        credentials: Option<&Credentials>,
        url: &str,
        tls: &TlsPolicy,
        disable_same_origin_check: bool,
    ) -> Result<Option<IndexDocument>, SyncError> {
        let index_url = index_url(url);
        let http_err = |message: String| SyncError::Http {
            url: index_url.clone(),
            message,
        };

        let mut builder = ureq::AgentBuilder::new().timeout(TIMEOUT).redirects(0);
        if tls.insecure_skip_tls_verify || tls.ca_bundle.is_some() {
            builder = builder.tls_config(Arc::new(client_config(tls)?));
        }
        let agent = builder.build();
        let authorization = credentials
            .and_then(|c| c.basic_auth())
            .map(|(user, pass)| basic_auth_header(user, pass));

        let mut current = index_url.clone();
        let mut hops = 0;
        let response = loop {
            let mut request = agent.get(&current);
            if let Some(header) = authorization.as_deref() {
                if disable_same_origin_check || same_origin(&index_url, &current) {
                    request = request.set("Authorization", header);
                }
            }

            let response = match request.call() {
                Ok(response) => response,
                Err(ureq::Error::Status(404, _)) => {
                    tracing::info!("no index at {current}");
                    return Ok(None);
                }
                Err(ureq::Error::Status(code, response)) => {
                    return Err(http_err(format!("{code} {}", response.status_text())));
                }
                Err(err) => return Err(http_err(err.to_string())),
            };
            if !is_redirect(response.status()) {
                break response;
            }

            let location = response
                .header("Location")
                .ok_or_else(|| http_err(format!("{} without Location", response.status())))?;
            hops += 1;
            if hops > MAX_REDIRECTS {
                return Err(http_err(format!("more than {MAX_REDIRECTS} redirects")));
            }
            let next = resolve_location(&current, location);
            tracing::debug!("redirect {current} -> {next}");
            current = next;
        };

        let mut body = Vec::new();
        response
            .into_reader()
            .take(MAX_INDEX_BYTES)
            .read_to_end(&mut body)
            .map_err(|e| http_err(e.to_string()))?;
        if body.iter().all(u8::is_ascii_whitespace) {
            tracing::info!("empty index at {index_url}");
            return Ok(None);
        }

        let doc = IndexDocument::from_yaml(&body).map_err(|source| SyncError::IndexParse {
            origin: index_url.clone(),
            source,
        })?;
        tracing::debug!("downloaded {index_url}: {} versions", doc.version_count());
        Ok(Some(doc))
    }
}

/// `<url>/index.yaml`, unless the url already names a yaml file.
pub fn index_url(url: &str) -> String {
    if url.ends_with(".yaml") || url.ends_with(".yml") {
        return url.to_string();
    }
    format!("{}/index.yaml", url.trim_end_matches('/'))
}

fn basic_auth_header(user: &str, pass: &str) -> String {
    let token = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
    format!("Basic {token}")
}

fn is_redirect(status: u16) -> bool {
    matches!(status, 301 | 302 | 303 | 307 | 308)
}

/// Scheme, lowercased host and effective port of an absolute url.
fn origin(url: &str) -> Option<(String, String, u16)> {
    let (scheme, rest) = url.split_once("://")?;
    let scheme = scheme.to_ascii_lowercase();
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let authority = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
    let default_port = match scheme.as_str() {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };
    // Bracketed IPv6 literals carry colons of their own.
    let (host, port) = match authority.rfind(':') {
        Some(idx) if !authority[idx..].contains(']') => {
            let port = authority[idx + 1..].parse().ok()?;
            (&authority[..idx], port)
        }
        _ => (authority, default_port),
    };
    if host.is_empty() {
        return None;
    }
    Some((scheme, host.to_ascii_lowercase(), port))
}

/// Whether `a` and `b` share scheme, host and port.
fn same_origin(a: &str, b: &str) -> bool {
    match (origin(a), origin(b)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Absolute form of a `Location` header relative to the url that returned it.
fn resolve_location(base: &str, location: &str) -> String {
    if location.contains("://") {
        return location.to_string();
    }
    let Some((scheme, rest)) = base.split_once("://") else {
        return location.to_string();
    };
    if let Some(network_path) = location.strip_prefix("//") {
        return format!("{scheme}://{network_path}");
    }
    let authority_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let (authority, path) = rest.split_at(authority_end);
    if location.starts_with('/') {
        return format!("{scheme}://{authority}{location}");
    }
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let dir = path.rfind('/').map_or("/", |idx| &path[..=idx]);
    format!("{scheme}://{authority}{dir}{location}")
}

// ---------------------------------------------------------------------------
// TLS
// ---------------------------------------------------------------------------

/// Client configuration honoring `tls`: web PKI roots plus any extra CA
/// bundle, or no verification at all when `insecure_skip_tls_verify` is set.
pub fn client_config(tls: &TlsPolicy) -> Result<ClientConfig, SyncError> {
    let provider = Arc::new(ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| SyncError::Tls(e.to_string()))?;

    if tls.insecure_skip_tls_verify {
        return Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
            .with_no_client_auth());
    }

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    if let Some(bundle) = tls.ca_bundle.as_deref() {
        let mut added = 0;
        for cert in CertificateDer::pem_slice_iter(bundle.as_bytes()) {
            let cert = cert.map_err(|e| SyncError::Tls(format!("bad CA bundle: {e}")))?;
            roots
                .add(cert)
                .map_err(|e| SyncError::Tls(format!("bad CA certificate: {e}")))?;
            added += 1;
        }
        if added == 0 {
            return Err(SyncError::Tls("CA bundle contains no certificates".to_string()));
        }
    }
    Ok(builder.with_root_certificates(roots).with_no_client_auth())
}

/// Accepts any server certificate; handshake signatures are still checked.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
