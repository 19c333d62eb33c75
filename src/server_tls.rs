//! TLS and mTLS front door.
//!
//! Same surface as the plain listener, wrapped in rustls. With
//! `MTLS_ENABLED` the acceptor additionally requires a client certificate
//! chaining to the configured CA. Certificate material is read once at
//! startup from the PEM files named by `TLS_PRIVATE_KEY`, `TLS_PUBLIC_KEY`
//! and `TLS_CA`; unreadable material is a fatal startup error.

use std::convert::Infallible;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls_pemfile::{certs, private_key};
use tokio::net::TcpListener;
use tokio_rustls::{TlsAcceptor, rustls::ServerConfig};

use crate::adapter::AdapterRuntime;
use crate::error::{AdapterError, ConfigError};
use crate::server;
use crate::shutdown::Shutdown;

/// Serves the front door over TLS until shutdown triggers.
pub async fn serve_tls(
    listener: TcpListener,
    runtime: Arc<AdapterRuntime>,
    shutdown: Shutdown,
) -> Result<(), AdapterError> {
    let acceptor = build_acceptor(&runtime)?;
    tracing::info!(
        addr = ?listener.local_addr().ok(),
        mtls = runtime.settings.server.mtls_enabled,
        "front door listening (tls)"
    );

    loop {
        let accepted = tokio::select! {
            _ = shutdown.wait() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, _addr) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let runtime = runtime.clone();

        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::debug!(error = %e, "tls handshake failed");
                    return;
                }
            };
            let io = TokioIo::new(tls_stream);
            let svc = service_fn(move |req: hyper::Request<Incoming>| {
                let runtime = runtime.clone();
                async move { Ok::<_, Infallible>(server::handle(runtime, req).await) }
            });

            let mut http = http1::Builder::new();
            http.keep_alive(true);
            if let Err(e) = http.serve_connection(io, svc).await {
                tracing::debug!(error = %e, "tls connection error");
            }
        });
    }

    tracing::info!("front door stopped");
    Ok(())
}

fn build_acceptor(runtime: &AdapterRuntime) -> Result<TlsAcceptor, AdapterError> {
    let server = &runtime.settings.server;
    if server.tls_passphrase.is_some() {
        tracing::warn!("TLS_PASSPHRASE is set but encrypted private keys are not supported");
    }

    let cert_path = server
        .tls_public_key
        .as_deref()
        .ok_or_else(|| config_error("TLS_PUBLIC_KEY is required"))?;
    let key_path = server
        .tls_private_key
        .as_deref()
        .ok_or_else(|| config_error("TLS_PRIVATE_KEY is required"))?;

    let cert_chain = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let config = if server.mtls_enabled {
        let ca_path = server
            .tls_ca
            .as_deref()
            .ok_or_else(|| config_error("TLS_CA is required when MTLS_ENABLED"))?;
        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_path)? {
            roots
                .add(cert)
                .map_err(|e| config_error(&format!("invalid CA certificate in {ca_path}: {e}")))?;
        }
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| config_error(&format!("client certificate verifier: {e}")))?;
        ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(cert_chain, key)
    } else {
        ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)
    }
    .map_err(|e| config_error(&format!("tls configuration rejected: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, AdapterError> {
    let file = File::open(path)
        .map_err(|e| config_error(&format!("cannot open certificate file {path}: {e}")))?;
    let mut reader = BufReader::new(file);
    let mut out = Vec::new();
    for cert in certs(&mut reader) {
        out.push(cert.map_err(|e| config_error(&format!("bad certificate in {path}: {e}")))?);
    }
    if out.is_empty() {
        return Err(config_error(&format!("no certificates found in {path}")));
    }
    Ok(out)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, AdapterError> {
    let file = File::open(path)
        .map_err(|e| config_error(&format!("cannot open private key file {path}: {e}")))?;
    let mut reader = BufReader::new(file);
    private_key(&mut reader)
        .map_err(|e| config_error(&format!("bad private key in {path}: {e}")))?
        .ok_or_else(|| config_error(&format!("no private key found in {path}")))
}

fn config_error(message: &str) -> AdapterError {
    AdapterError::Config(ConfigError::Invalid(message.to_string()))
}
