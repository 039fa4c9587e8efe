//! X.509 certificate inspection.
//!
//! The server derives its peer-verification identity from its own
//! certificate (the CN), renders validity dates for the stats surface, and
//! matches peer names against the expected hostname. Hostname matching
//! deliberately ignores the connection's endpoint name: cluster-bus peers
//! are addressed by IP, so a process-wide expected CN is authoritative.

use thiserror::Error;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

/// Upper bound on an extracted common name, matching the wire reality that
/// CNs are short; longer names are truncated rather than rejected.
pub const CERT_CNAME_MAX: usize = 256;

#[derive(Debug, Error)]
pub enum CertError {
    #[error("invalid PEM: {0}")]
    Pem(String),
    #[error("no CERTIFICATE block in PEM input")]
    NoCertificate,
    #[error("invalid X.509 certificate: {0}")]
    Parse(String),
    #[error("certificate has no common name")]
    NoCommonName,
    #[error("certificate serial number is zero")]
    ZeroSerial,
    #[error("certificate serial number does not fit in 64 bits")]
    SerialTooLarge,
}

/// Validity window and serial extracted from a certificate.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CertFacts {
    pub not_before: String,
    pub not_after: String,
    pub serial: u64,
}

/// First CERTIFICATE block of a PEM bundle, as DER.
fn first_certificate_der(pem: &str) -> Result<Vec<u8>, CertError> {
    for block in x509_parser::pem::Pem::iter_from_buffer(pem.as_bytes()) {
        let block = block.map_err(|e| CertError::Pem(e.to_string()))?;
        if block.label == "CERTIFICATE" {
            return Ok(block.contents);
        }
    }
    Err(CertError::NoCertificate)
}

/// Extract the subject common name from a PEM certificate.
pub fn extract_cn(pem: &str) -> Result<String, CertError> {
    let der = first_certificate_der(pem)?;
    let (_, x509) =
        X509Certificate::from_der(&der).map_err(|e| CertError::Parse(e.to_string()))?;
    let cn = x509
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .ok_or(CertError::NoCommonName)?;

    let mut cn = cn.to_string();
    if cn.len() >= CERT_CNAME_MAX {
        cn.truncate(CERT_CNAME_MAX - 1);
    }
    tracing::debug!(subject = %cn, "extracted subject name from certificate");
    Ok(cn)
}

/// Extract the validity window and serial number from a PEM certificate.
///
/// A zero serial is rejected. Real CAs never issue one, and the stats
/// surface uses zero as its "not loaded" sentinel, so a certificate that
/// legitimately carries serial 0 is treated as malformed.
pub fn extract_validity_and_serial(pem: &str) -> Result<CertFacts, CertError> {
    let der = first_certificate_der(pem)?;
    let (_, x509) =
        X509Certificate::from_der(&der).map_err(|e| CertError::Parse(e.to_string()))?;

    let not_before = format_asn1_time(&x509.validity().not_before);
    let not_after = format_asn1_time(&x509.validity().not_after);

    let digits = x509.tbs_certificate.serial.to_u64_digits();
    let serial = match digits.len() {
        0 => return Err(CertError::ZeroSerial),
        1 => digits[0],
        _ => return Err(CertError::SerialTooLarge),
    };

    tracing::debug!(%not_before, %not_after, serial,
        "extracted validity and serial from certificate");
    Ok(CertFacts {
        not_before,
        not_after,
        serial,
    })
}

/// Every identity a certificate claims: subject CN plus DNS SANs. Used by
/// the client-side verifier, which accepts a peer if any identity matches
/// the expected hostname.
pub fn identities_der(der: &[u8]) -> Result<Vec<String>, CertError> {
    let (_, x509) =
        X509Certificate::from_der(der).map_err(|e| CertError::Parse(e.to_string()))?;

    let mut names = Vec::new();
    for attr in x509.subject().iter_common_name() {
        if let Ok(cn) = attr.as_str() {
            names.push(cn.to_string());
        }
    }
    if let Ok(Some(san)) = x509.subject_alternative_name() {
        for general_name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = general_name {
                names.push((*dns).to_string());
            }
        }
    }
    Ok(names)
}

/// Match a peer-presented name against the expected hostname, per the
/// RFC 6125 §6.4 subset the server supports: a case-insensitive exact
/// match, or a single leading `*.` label whose suffix equals the expected
/// hostname's suffix from its first dot. A bare `*` or `*.` never matches,
/// and with no expected hostname nothing matches.
pub fn verify_host(peer_name: &str, expected: Option<&str>) -> bool {
    let Some(expected) = expected else {
        return false;
    };

    if expected.len() == peer_name.len() && expected.eq_ignore_ascii_case(peer_name) {
        return true;
    }

    let bytes = peer_name.as_bytes();
    if peer_name.len() > 2 && bytes[0] == b'*' && bytes[1] == b'.' {
        let Some(dot) = expected.find('.') else {
            return false;
        };
        let expected_suffix = &expected[dot..];
        let peer_suffix = &peer_name[1..];
        return expected_suffix.len() == peer_suffix.len()
            && expected_suffix.eq_ignore_ascii_case(peer_suffix);
    }

    false
}

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Render an ASN.1 time the way OpenSSL prints it: `Jun  5 17:20:31 2026 GMT`.
fn format_asn1_time(t: &x509_parser::time::ASN1Time) -> String {
    let dt = t.to_datetime();
    format!(
        "{} {:>2} {:02}:{:02}:{:02} {} GMT",
        MONTHS[dt.month() as usize - 1],
        dt.day(),
        dt.hour(),
        dt.minute(),
        dt.second(),
        dt.year()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cert_pem(cn: &str, serial: Vec<u8>) -> String {
        let mut params = rcgen::CertificateParams::new(vec![cn.to_string()]).unwrap();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, cn);
        params.serial_number = Some(rcgen::SerialNumber::from(serial));
        params.not_before = rcgen::date_time_ymd(2024, 1, 1);
        params.not_after = rcgen::date_time_ymd(2034, 6, 5);
        let key = rcgen::KeyPair::generate().unwrap();
        params.self_signed(&key).unwrap().pem()
    }

    #[test]
    fn extracts_common_name() {
        let pem = test_cert_pem("ferrite-1.example.com", vec![0x2a]);
        assert_eq!(extract_cn(&pem).unwrap(), "ferrite-1.example.com");
    }

    #[test]
    fn extracted_cn_verifies_against_itself() {
        let pem = test_cert_pem("ferrite-1.example.com", vec![0x2a]);
        let cn = extract_cn(&pem).unwrap();
        assert!(verify_host(&cn, Some(&cn)));
    }

    #[test]
    fn extracts_validity_and_serial() {
        let pem = test_cert_pem("ferrite-1.example.com", vec![0x1a, 0x2b]);
        let facts = extract_validity_and_serial(&pem).unwrap();
        assert_eq!(facts.not_before, "Jan  1 00:00:00 2024 GMT");
        assert_eq!(facts.not_after, "Jun  5 00:00:00 2034 GMT");
        assert_eq!(facts.serial, 0x1a2b);
    }

    #[test]
    fn zero_serial_is_rejected() {
        let pem = test_cert_pem("ferrite-1.example.com", vec![0]);
        assert!(matches!(
            extract_validity_and_serial(&pem),
            Err(CertError::ZeroSerial)
        ));
    }

    #[test]
    fn garbage_pem_is_rejected() {
        assert!(extract_cn("not a certificate").is_err());
        assert!(extract_validity_and_serial("-----BEGIN JUNK-----\n-----END JUNK-----").is_err());
    }

    #[test]
    fn identities_include_cn_and_sans() {
        let pem = test_cert_pem("ferrite-1.example.com", vec![0x2a]);
        let der = first_certificate_der(&pem).unwrap();
        let names = identities_der(&der).unwrap();
        assert!(names.contains(&"ferrite-1.example.com".to_string()));
    }

    #[test]
    fn host_verification_exact_and_wildcard() {
        let expected = Some("ferrite-7.example.com");
        assert!(verify_host("ferrite-7.example.com", expected));
        assert!(verify_host("ferrite-7.EXAMPLE.com", expected));
        assert!(verify_host("*.example.com", expected));
        assert!(!verify_host("*.other.com", expected));
        assert!(!verify_host("ferrite-8.example.com", expected));
    }

    #[test]
    fn host_verification_boundaries() {
        let expected = Some("ferrite-7.example.com");
        // degenerate wildcards never match
        assert!(!verify_host("*", expected));
        assert!(!verify_host("*.", expected));
        // only one wildcard level: the suffix comparison starts at the
        // expected name's first dot
        assert!(!verify_host("*.com", expected));
        // no expected hostname, no match
        assert!(!verify_host("ferrite-7.example.com", None));
        // expected name without any dot cannot wildcard-match
        assert!(!verify_host("*.example.com", Some("localhost")));
    }
}
