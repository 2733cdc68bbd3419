//! Certificates.
//!
//! This module provides [`Cert`], an owned wrapper around the DER encoding
//! of an X.509 certificate that keeps the handful of fields the validator
//! chain and the stores index by readily extracted. Parsing is delegated to
//! the _x509-parser_ crate; whenever a component needs the full certificate
//! structure – say, for signature checking – it re-parses the DER on demand
//! via [`Cert::x509`].

use std::{fmt, str};
use std::hash::{Hash, Hasher};
use asn1_rs::oid;
use bytes::Bytes;
use ring::digest;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::{
    DistributionPointName, GeneralName, ParsedExtension
};
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::FromDer;

/// The PEM armor opening a certificate.
pub const PEM_BEGIN: &str = "-----BEGIN CERTIFICATE-----";

/// The PEM armor closing a certificate.
pub const PEM_END: &str = "-----END CERTIFICATE-----";


//------------ Cert ----------------------------------------------------------

/// An owned X.509 certificate.
///
/// The type keeps the raw DER encoding plus pre-extracted copies of the
/// fields used for indexing and chain building. Equality and hashing are
/// over the DER encoding only.
#[derive(Clone, Debug)]
pub struct Cert {
    /// The raw DER encoding of the certificate.
    der: Bytes,

    /// The raw DER encoding of the subject name.
    subject: Bytes,

    /// The raw DER encoding of the issuer name.
    issuer: Bytes,

    /// The serial number as its raw big-endian content octets.
    serial: Bytes,

    /// The subject key identifier if the extension is present.
    ski: Option<Bytes>,

    /// The key identifier portion of the authority key identifier extension.
    aki: Option<Bytes>,

    /// The beginning of the validity period as a Unix timestamp.
    not_before: i64,

    /// The end of the validity period as a Unix timestamp.
    not_after: i64,

    /// The HTTP URIs of all CRL distribution points.
    crl_uris: Vec<String>,

    /// Whether a CRL distribution point extension was present but corrupt.
    crl_uris_broken: bool,

    /// The OCSP responder URI from the authority information access
    /// extension if present.
    ocsp_uri: Option<String>,

    /// Whether issuer and subject name are identical.
    self_signed: bool,
}

impl Cert {
    /// Decodes a certificate from its DER encoding.
    pub fn decode(der: Bytes) -> Result<Self, DecodeError> {
        let (_, cert) = X509Certificate::from_der(der.as_ref()).map_err(
            |err| DecodeError(format!("malformed certificate: {}", err))
        )?;

        let subject = Bytes::copy_from_slice(
            cert.tbs_certificate.subject.as_raw()
        );
        let issuer = Bytes::copy_from_slice(
            cert.tbs_certificate.issuer.as_raw()
        );
        let serial = Bytes::copy_from_slice(cert.tbs_certificate.raw_serial());
        let not_before = cert.validity().not_before.timestamp();
        let not_after = cert.validity().not_after.timestamp();

        let mut ski = None;
        let mut aki = None;
        let mut crl_uris = Vec::new();
        let mut crl_uris_broken = false;
        let mut ocsp_uri = None;
        for ext in cert.extensions() {
            match ext.parsed_extension() {
                ParsedExtension::SubjectKeyIdentifier(id) => {
                    ski = Some(Bytes::copy_from_slice(id.0));
                }
                ParsedExtension::AuthorityKeyIdentifier(id) => {
                    aki = id.key_identifier.as_ref().map(|id| {
                        Bytes::copy_from_slice(id.0)
                    });
                }
                ParsedExtension::CRLDistributionPoints(points) => {
                    for point in &points.points {
                        let names = match point.distribution_point {
                            Some(DistributionPointName::FullName(
                                ref names
                            )) => names,
                            _ => continue
                        };
                        for name in names {
                            if let GeneralName::URI(uri) = name {
                                crl_uris.push(String::from(*uri))
                            }
                        }
                    }
                }
                ParsedExtension::AuthorityInfoAccess(access) => {
                    for desc in &access.accessdescs {
                        if desc.access_method != oid!(1.3.6.1.5.5.7.48.1) {
                            continue
                        }
                        if let GeneralName::URI(uri) = &desc.access_location {
                            if ocsp_uri.is_none() {
                                ocsp_uri = Some(String::from(*uri))
                            }
                        }
                    }
                }
                _ => {
                    // A distribution point extension we failed to parse is
                    // remembered: the store-level selector must report it
                    // rather than treat the certificate as CRL-less.
                    if ext.oid == oid!(2.5.29.31) {
                        crl_uris_broken = true
                    }
                }
            }
        }

        let self_signed = subject == issuer;
        Ok(Cert {
            der, subject, issuer, serial, ski, aki,
            not_before, not_after,
            crl_uris, crl_uris_broken, ocsp_uri, self_signed,
        })
    }

    /// Decodes a certificate from a PEM-armored string.
    pub fn from_pem(pem: &str) -> Result<Self, DecodeError> {
        let (_, parsed) = parse_x509_pem(pem.as_bytes()).map_err(|err| {
            DecodeError(format!("malformed PEM: {}", err))
        })?;
        if parsed.label != "CERTIFICATE" {
            return Err(DecodeError(
                format!("unexpected PEM label '{}'", parsed.label)
            ))
        }
        Self::decode(parsed.contents.into())
    }

    /// Returns the PEM-armored encoding of the certificate.
    pub fn to_pem(&self) -> String {
        let mut res = String::with_capacity(self.der.len() * 2);
        res.push_str(PEM_BEGIN);
        let data = base64::encode(&self.der);
        for chunk in data.as_bytes().chunks(64) {
            res.push('\n');
            // Base64 output is always ASCII.
            res.push_str(str::from_utf8(chunk).expect("ASCII"));
        }
        res.push('\n');
        res.push_str(PEM_END);
        res
    }

    /// Parses the full certificate structure from the stored DER.
    ///
    /// This cannot fail since [`decode`][Self::decode] already parsed the
    /// very same data, but the error is passed on anyway to avoid a panic
    /// path.
    pub fn x509(&self) -> Result<X509Certificate, DecodeError> {
        X509Certificate::from_der(self.der.as_ref()).map(|(_, res)| res)
            .map_err(|err| {
                DecodeError(format!("malformed certificate: {}", err))
            })
    }

    /// Returns the raw DER encoding.
    pub fn der(&self) -> &Bytes {
        &self.der
    }

    /// Returns the raw subject name.
    pub fn subject(&self) -> &Bytes {
        &self.subject
    }

    /// Returns the raw issuer name.
    pub fn issuer(&self) -> &Bytes {
        &self.issuer
    }

    /// Returns the content octets of the serial number.
    pub fn serial(&self) -> &Bytes {
        &self.serial
    }

    /// Returns the subject key identifier if present.
    pub fn ski(&self) -> Option<&Bytes> {
        self.ski.as_ref()
    }

    /// Returns the authority key identifier if present.
    pub fn aki(&self) -> Option<&Bytes> {
        self.aki.as_ref()
    }

    /// Returns whether subject and issuer name are identical.
    pub fn is_self_signed(&self) -> bool {
        self.self_signed
    }

    /// Returns whether the certificate is valid at the given time.
    pub fn is_valid_at(&self, now: i64) -> bool {
        now >= self.not_before && now <= self.not_after
    }

    /// Returns whether the validity period has ended at the given time.
    pub fn is_expired_at(&self, now: i64) -> bool {
        now > self.not_after
    }

    /// Returns the HTTP URIs of all CRL distribution points.
    ///
    /// Returns an error if the certificate carries a distribution point
    /// extension that could not be decoded. This is different from a
    /// certificate without distribution points which simply produces an
    /// empty slice.
    pub fn crl_uris(&self) -> Result<&[String], DecodeError> {
        if self.crl_uris_broken {
            return Err(DecodeError(
                "corrupt CRL distribution points extension".into()
            ))
        }
        Ok(&self.crl_uris)
    }

    /// Returns the OCSP responder URI if the certificate carries one.
    pub fn ocsp_uri(&self) -> Option<&str> {
        self.ocsp_uri.as_deref()
    }
}


//--- PartialEq, Eq, and Hash

impl PartialEq for Cert {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

impl Eq for Cert { }

impl Hash for Cert {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.der.hash(state)
    }
}


//------------ chain_fingerprint ---------------------------------------------

/// Returns a fingerprint of a certificate chain’s content.
///
/// The fingerprint is the SHA-256 digest over the concatenation of the
/// length-prefixed DER encodings of all certificates. Only the chain
/// contents matter – the trust decision does not depend on anything else in
/// a request.
pub fn chain_fingerprint(chain: &[Cert]) -> Bytes {
    let mut context = digest::Context::new(&digest::SHA256);
    for cert in chain {
        context.update(
            &u32::try_from(cert.der().len()).unwrap_or(u32::MAX).to_be_bytes()
        );
        context.update(cert.der().as_ref());
    }
    Bytes::copy_from_slice(context.finish().as_ref())
}


//------------ DecodeError ---------------------------------------------------

/// A certificate or CRL failed to decode.
#[derive(Clone, Debug)]
pub struct DecodeError(String);

impl DecodeError {
    /// Creates an error with the given message.
    pub fn new(msg: impl Into<String>) -> Self {
        DecodeError(msg.into())
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for DecodeError { }


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::pki;

    #[test]
    fn decode_leaf() {
        let leaf = pki::leaf();
        assert!(!leaf.is_self_signed());
        assert_eq!(
            leaf.crl_uris().unwrap(),
            ["http://crl.example/test.crl"]
        );
        assert_eq!(leaf.ocsp_uri(), Some("http://ocsp.example/"));
        assert!(leaf.ski().is_some());
        assert_eq!(leaf.aki(), pki::int_a().ski());
    }

    #[test]
    fn decode_root() {
        let root = pki::root();
        assert!(root.is_self_signed());
        assert!(root.crl_uris().unwrap().is_empty());
        assert!(root.ocsp_uri().is_none());
    }

    #[test]
    fn pem_round_trip() {
        let leaf = pki::leaf();
        let pem = leaf.to_pem();
        assert!(pem.starts_with(PEM_BEGIN));
        assert!(pem.ends_with(PEM_END));
        assert_eq!(Cert::from_pem(&pem).unwrap(), leaf);
    }

    #[test]
    fn validity_window() {
        let now = chrono::Utc::now().timestamp();
        assert!(pki::leaf().is_valid_at(now));
        assert!(!pki::expired().is_valid_at(now));
        assert!(pki::expired().is_expired_at(now));
    }

    #[test]
    fn fingerprint_depends_on_chain_content() {
        let one = chain_fingerprint(&[pki::leaf()]);
        let two = chain_fingerprint(&[pki::leaf(), pki::int_a()]);
        let one_again = chain_fingerprint(&[pki::leaf()]);
        assert_eq!(one, one_again);
        assert_ne!(one, two);
    }
}
