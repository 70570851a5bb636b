//! Abstraction over the MQTT wire client, so broker sessions can be tested
//! against a fake implementation instead of a live `rumqttc` connection.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, EventLoop, LastWill, MqttOptions, QoS, Transport};
use thiserror::Error;

use super::config::BrokerConfig;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("could not read ca cert file {path}: {source}")]
    CaCertIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("ca cert file contained no parseable certificates")]
    CaCertEmpty,

    #[error("publish failed: {0}")]
    Publish(#[from] rumqttc::ClientError),
}

fn qos_from(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// Builds the `rumqttc` client/event-loop pair for one broker, applying
/// credentials, last-will, and (optionally) TLS with hostname verification
/// disabled.
pub fn build_client(
    client_id: &str,
    cfg: &BrokerConfig,
    will_topic: String,
    channel_capacity: usize,
) -> Result<(AsyncClient, EventLoop), ClientError> {
    let mut opts = MqttOptions::new(client_id, cfg.host.clone(), cfg.port);
    opts.set_keep_alive(Duration::from_secs(30));

    if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
        opts.set_credentials(user.clone(), pass.clone());
    }

    if !cfg.will_message.is_empty() {
        opts.set_last_will(LastWill {
            topic: will_topic,
            message: cfg.will_message.clone().into(),
            qos: QoS::AtMostOnce,
            retain: true,
        });
    }

    if cfg.tls {
        let tls_config = build_tls_config(cfg.ca_cert_path.as_deref())?;
        opts.set_transport(Transport::tls_with_config(tls_config.into()));
    }

    Ok(AsyncClient::new(opts, channel_capacity))
}

fn build_tls_config(ca_cert_path: Option<&str>) -> Result<rustls::ClientConfig, ClientError> {
    let mut roots = rustls::RootCertStore::empty();
    if let Some(path) = ca_cert_path {
        let file = File::open(path).map_err(|source| ClientError::CaCertIo {
            path: path.to_string(),
            source,
        })?;
        let mut reader = BufReader::new(file);
        let certs = rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| ClientError::CaCertIo {
                path: path.to_string(),
                source,
            })?;
        if certs.is_empty() {
            return Err(ClientError::CaCertEmpty);
        }
        for cert in certs {
            let _ = roots.add(cert);
        }
    }

    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    // Brokers on private networks are often reached through self-signed or
    // IP-addressed certs that would otherwise fail hostname verification.
    config
        .dangerous()
        .set_certificate_verifier(Arc::new(NoHostnameVerification));

    Ok(config)
}

#[derive(Debug)]
struct NoHostnameVerification;

impl rustls::client::danger::ServerCertVerifier for NoHostnameVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
        .map(|_| rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
        .map(|_| rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

pub(super) use qos_from as to_qos;
