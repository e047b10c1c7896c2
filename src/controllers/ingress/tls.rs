use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use thiserror::Error;
use x509_parser::nom::Err as NomErr;
use x509_parser::pem::{parse_x509_pem, Pem};

pub const TLS_KEY: &str = "tls.key";
pub const TLS_CERT: &str = "tls.crt";

const CERTIFICATE_LABEL: &str = "CERTIFICATE";
const PRIVATE_KEY_LABEL: &str = "PRIVATE KEY";

/// A secret referenced by an ingress that the gateway could not load
#[derive(Error, Debug, PartialEq, Eq)]
#[error("TLS secret {secret} is invalid: {reason}")]
pub struct InvalidTlsSecret {
    pub secret: String,
    pub reason: TlsReason,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TlsReason {
    #[error("tls key not found in secret")]
    MissingKey,
    #[error("can not decode the tls key")]
    UndecodableKey,
    #[error("wrong tls key type {0}")]
    WrongKeyType(String),
    #[error("tls cert not found in secret")]
    MissingCertificate,
    #[error("can not decode the tls certificate")]
    UndecodableCertificate,
    #[error("wrong tls certificate type {0}")]
    WrongCertificateType(String),
    #[error("invalid X.509 certificate: {0}")]
    InvalidCertificate(String),
}

/// Check that a secret holds a PEM private key and a PEM X.509 certificate
pub fn validate_keypair(secret: &Secret) -> Result<(), InvalidTlsSecret> {
    check_keypair(secret).map_err(|reason| InvalidTlsSecret {
        secret: format!(
            "{}/{}",
            secret.namespace().unwrap_or_default(),
            secret.name_any()
        ),
        reason,
    })
}

fn check_keypair(secret: &Secret) -> Result<(), TlsReason> {
    let key = secret_bytes(secret, TLS_KEY).ok_or(TlsReason::MissingKey)?;
    let key = decode_pem(key).ok_or(TlsReason::UndecodableKey)?;
    if !key.label.contains(PRIVATE_KEY_LABEL) {
        return Err(TlsReason::WrongKeyType(key.label));
    }

    let cert = secret_bytes(secret, TLS_CERT).ok_or(TlsReason::MissingCertificate)?;
    let cert = decode_pem(cert).ok_or(TlsReason::UndecodableCertificate)?;
    if cert.label != CERTIFICATE_LABEL {
        return Err(TlsReason::WrongCertificateType(cert.label));
    }

    match cert.parse_x509() {
        Ok(_) => Ok(()),
        Err(NomErr::Error(e)) | Err(NomErr::Failure(e)) => {
            Err(TlsReason::InvalidCertificate(e.to_string()))
        }
        Err(NomErr::Incomplete(_)) => Err(TlsReason::InvalidCertificate(
            "truncated certificate".into(),
        )),
    }
}

fn secret_bytes<'a>(secret: &'a Secret, key: &str) -> Option<&'a [u8]> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|bytes| bytes.0.as_slice())
}

/// The first PEM block of `input`
fn decode_pem(input: &[u8]) -> Option<Pem> {
    parse_x509_pem(input).ok().map(|(_, pem)| pem)
}
