//! TLS frontend: static keypair or ACME issuance, plus the port-80
//! listener that permanently redirects to HTTPS.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::Request;
use axum::handler::HandlerWithoutStateExt;
use axum::http::{header, StatusCode, Uri};
use axum::response::Redirect;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use futures_util::StreamExt;
use rustls::ServerConfig;
use rustls_acme::caches::DirCache;
use rustls_acme::AcmeConfig;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::auth::CredentialStore;
use crate::config::Config;

/// Certificate policy: only the apex domain and names under it may obtain
/// a certificate; everything else fails the handshake.
pub fn host_allowed(host: &str, domain: &str) -> bool {
    let host = host.split(':').next().unwrap_or(host).to_ascii_lowercase();
    let domain = domain.to_ascii_lowercase();
    host == domain || host.ends_with(&format!(".{domain}"))
}

/// The issuance set: apex plus every configured hospital subdomain. Each
/// satisfies the host policy by the credential-store invariant; the gate
/// stays in place against config drift.
pub fn acme_domains(config: &Config, credentials: &CredentialStore) -> Vec<String> {
    let mut domains = vec![config.domain.clone()];
    domains.extend(credentials.subdomains().map(str::to_string));
    domains.retain(|d| host_allowed(d, &config.domain));
    domains
}

/// Build the TLS config for the primary listener.
///
/// Static mode loads the keypair once; ACME mode issues through the
/// directory cache and answers TLS-ALPN-01 challenges from the resolver.
/// The returned task drives ACME order progress and must stay alive for
/// the life of the listener.
pub async fn make_tls_config(
    config: &Config,
    credentials: &CredentialStore,
) -> anyhow::Result<(RustlsConfig, Option<JoinHandle<()>>)> {
    if config.tls_auto_cert {
        let email = config
            .acme_email
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("tls.acme_email is required when auto_cert is enabled"))?;
        let domains = acme_domains(config, credentials);
        info!(
            domains = domains.len(),
            cache = %config.acme_cache.display(),
            "TLS via ACME"
        );

        let mut state = AcmeConfig::new(domains)
            .contact([format!("mailto:{email}")])
            .cache(DirCache::new(config.acme_cache.clone()))
            .directory_lets_encrypt(!config.acme_staging)
            .state();

        let server_config = Arc::new(
            ServerConfig::builder()
                .with_no_client_auth()
                .with_cert_resolver(state.resolver()),
        );

        let driver = tokio::spawn(async move {
            loop {
                match state.next().await {
                    Some(Ok(event)) => info!(event = ?event, "acme event"),
                    Some(Err(err)) => error!(error = ?err, "acme error"),
                    None => break,
                }
            }
        });

        Ok((RustlsConfig::from_config(server_config), Some(driver)))
    } else {
        let (cert, key) = match (&config.tls_cert, &config.tls_key) {
            (Some(cert), Some(key)) => (cert, key),
            _ => anyhow::bail!(
                "tls.cert_file and tls.key_file are required when TLS is enabled without auto_cert"
            ),
        };
        info!(cert = %cert.display(), "TLS via static keypair");
        let rustls_config = RustlsConfig::from_pem_file(cert, key)
            .await
            .map_err(|e| anyhow::anyhow!("failed to load TLS key material: {e}"))?;
        Ok((rustls_config, None))
    }
}

/// Target for the permanent redirect, preserving path and query.
fn https_redirect_target(host: Option<&str>, uri: &Uri, fallback_host: &str) -> String {
    let host = host.unwrap_or(fallback_host);
    let host = host.split(':').next().unwrap_or(host);
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("https://{host}{path_and_query}")
}

/// Run the port-80 listener: permanent redirect to HTTPS.
pub async fn serve_redirect(addr: SocketAddr, domain: String, handle: Handle) -> anyhow::Result<()> {
    let redirect = move |req: Request| {
        let domain = domain.clone();
        async move {
            let host = req
                .headers()
                .get(header::HOST)
                .and_then(|v| v.to_str().ok());
            if host.is_none() && req.uri().authority().is_none() {
                return Err(StatusCode::BAD_REQUEST);
            }
            let target = https_redirect_target(host, req.uri(), &domain);
            Ok(Redirect::permanent(&target))
        }
    };

    info!(addr = %addr, "HTTP listener redirecting to HTTPS");
    axum_server::bind(addr)
        .handle(handle)
        .serve(redirect.into_make_service())
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_policy() {
        assert!(host_allowed("example.test", "example.test"));
        assert!(host_allowed("a.example.test", "example.test"));
        assert!(host_allowed("A.EXAMPLE.TEST:443", "example.test"));
        assert!(host_allowed("deep.a.example.test", "example.test"));
        assert!(!host_allowed("foreign.com", "example.test"));
        assert!(!host_allowed("examplextest", "example.test"));
        // suffix match must be on a label boundary
        assert!(!host_allowed("evil-example.test.attacker.com", "example.test"));
    }

    #[test]
    fn redirect_preserves_path_and_query() {
        let uri: Uri = "/studies/42?series=7&token=x".parse().unwrap();
        assert_eq!(
            https_redirect_target(Some("a.example.test:80"), &uri, "example.test"),
            "https://a.example.test/studies/42?series=7&token=x"
        );
        let bare: Uri = "/".parse().unwrap();
        assert_eq!(
            https_redirect_target(None, &bare, "example.test"),
            "https://example.test/"
        );
    }
}
