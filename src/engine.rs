//! Path validation against a CA bundle.
//!
//! The validator chain talks to path validation through the [`PathEngine`]
//! trait so tests can substitute a scripted engine. The real implementation
//! is [`BundleEngine`]: it builds a path from the leaf up to a trust anchor
//! loaded from a PEM bundle at startup, checking validity windows and
//! signatures along the way, and consults revocation data through a
//! [`RevocationSource`].
//!
//! [`CacheRevocation`] is the production revocation source. It answers CRL
//! lookups from the CRL cache, one lookup per distribution point of the
//! certificate under check, and OCSP lookups from the OCSP cache. A CRL
//! that cannot be fetched is simply absent from the result; whether that
//! fails the path is the engine’s policy decision. Certificate lookups
//! always come back empty since this subsystem supplies revocation data
//! only.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use bytes::Bytes;
use chrono::Utc;
use log::error;
use x509_parser::prelude::FromDer;
use x509_parser::revocation_list::CertificateRevocationList;
use crate::cert::{Cert, DecodeError};
use crate::crl::CrlCache;
use crate::error::Failed;
use crate::http::Fetch;
use crate::ocsp::{OcspCache, OcspStatus};


//------------ Error Names ---------------------------------------------------
//
// The stable failure class names written into responses. They follow the
// OpenSSL verify-error vocabulary the proxy already uses for the errors it
// reports to us.

pub const ERR_CERT_EXPIRED: &str = "X509_V_ERR_CERT_HAS_EXPIRED";
pub const ERR_CERT_NOT_YET_VALID: &str = "X509_V_ERR_CERT_NOT_YET_VALID";
pub const ERR_CERT_SIGNATURE: &str = "X509_V_ERR_CERT_SIGNATURE_FAILURE";
pub const ERR_NO_ISSUER: &str = "X509_V_ERR_UNABLE_TO_GET_ISSUER_CERT";
pub const ERR_CERT_REVOKED: &str = "X509_V_ERR_CERT_REVOKED";
pub const ERR_NO_CRL: &str = "X509_V_ERR_UNABLE_TO_GET_CRL";
pub const ERR_INVALID_EXTENSION: &str = "X509_V_ERR_INVALID_EXTENSION";
pub const ERR_SELF_SIGNED: &str = "X509_V_ERR_SELF_SIGNED_CERT_IN_CHAIN";


//------------ PathEngine ----------------------------------------------------

/// Path validation of a certificate chain.
pub trait PathEngine: Send + Sync {
    /// Validates the chain, leaf first.
    ///
    /// On failure returns the failure class and the index of the offending
    /// certificate within the given chain.
    fn validate(&self, chain: &[Cert]) -> Result<(), PathFailure>;
}


//------------ PathFailure ---------------------------------------------------

/// A failed path validation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PathFailure {
    /// The stable name of the failure class.
    pub error: &'static str,

    /// The index of the offending certificate in the validated chain.
    pub cert_index: usize,
}

impl PathFailure {
    fn new(error: &'static str, cert_index: usize) -> Self {
        PathFailure { error, cert_index }
    }
}


//------------ RevocationSource ----------------------------------------------

/// The store surface the path engine consumes.
pub trait RevocationSource: Send + Sync {
    /// Returns all CRLs covering the given certificate.
    ///
    /// One lookup per distribution point; unreachable CRLs are simply
    /// missing from the result. A distribution-point extension that cannot
    /// be decoded is an error of the certificate itself, not of any
    /// network fetch.
    fn crls_for(&self, cert: &Cert) -> Result<Vec<Arc<Bytes>>, DecodeError>;

    /// Returns all certificates matching the given subject name.
    ///
    /// This source supplies revocation data only, so this is always empty.
    fn certs_for(&self, subject: &Bytes) -> Vec<Cert>;

    /// Returns the OCSP status of the certificate if a responder answered.
    fn ocsp_status(&self, cert: &Cert, issuer: &Cert) -> Option<OcspStatus>;
}


//------------ CacheRevocation -----------------------------------------------

/// The revocation source backed by the CRL and OCSP caches.
pub struct CacheRevocation {
    crl_cache: Arc<CrlCache>,
    ocsp_cache: Arc<OcspCache>,
    fetch: Arc<dyn Fetch>,
}

impl CacheRevocation {
    pub fn new(
        crl_cache: Arc<CrlCache>,
        ocsp_cache: Arc<OcspCache>,
        fetch: Arc<dyn Fetch>,
    ) -> Self {
        CacheRevocation { crl_cache, ocsp_cache, fetch }
    }
}

impl RevocationSource for CacheRevocation {
    fn crls_for(&self, cert: &Cert) -> Result<Vec<Arc<Bytes>>, DecodeError> {
        Ok(cert.crl_uris()?.iter().filter_map(|uri| {
            self.crl_cache.get(uri, self.fetch.as_ref())
        }).collect())
    }

    fn certs_for(&self, _subject: &Bytes) -> Vec<Cert> {
        Vec::new()
    }

    fn ocsp_status(&self, cert: &Cert, issuer: &Cert) -> Option<OcspStatus> {
        self.ocsp_cache.get(cert, issuer, self.fetch.as_ref())
    }
}


//------------ BundleEngine --------------------------------------------------

/// A path engine validating against a static CA bundle.
pub struct BundleEngine {
    /// The trust anchors indexed by subject name.
    anchors: HashMap<Bytes, Vec<Cert>>,

    /// The DER encodings of all anchors, for terminating the walk when an
    /// anchor itself appears in the chain.
    anchor_ders: HashSet<Bytes>,

    /// Where revocation data comes from.
    revocation: Arc<dyn RevocationSource>,

    /// Whether unavailable revocation data fails the path.
    hard_fail: bool,
}

impl BundleEngine {
    /// Creates an engine with the anchors from the given PEM bundle.
    ///
    /// The bundle is read once; unlike the hot-reloadable stores, a CA
    /// bundle that cannot be read at startup is a fatal error.
    pub fn new(
        bundle: &Path,
        revocation: Arc<dyn RevocationSource>,
        hard_fail: bool,
    ) -> Result<Self, Failed> {
        let file = fs::File::open(bundle).map_err(|err| {
            error!("Failed to open CA bundle {}: {}", bundle.display(), err);
            Failed
        })?;
        let der_list = rustls_pemfile::certs(
            &mut io::BufReader::new(file)
        ).map_err(|err| {
            error!("Failed to read CA bundle {}: {}", bundle.display(), err);
            Failed
        })?;
        let mut anchors = Vec::with_capacity(der_list.len());
        for der in der_list {
            let cert = Cert::decode(der.into()).map_err(|err| {
                error!(
                    "Undecodable certificate in CA bundle {}: {}",
                    bundle.display(), err
                );
                Failed
            })?;
            anchors.push(cert);
        }
        if anchors.is_empty() {
            error!("CA bundle {} contains no certificates", bundle.display());
            return Err(Failed)
        }
        Ok(Self::with_anchors(anchors, revocation, hard_fail))
    }

    /// Creates an engine with the given anchors.
    pub fn with_anchors(
        anchor_list: Vec<Cert>,
        revocation: Arc<dyn RevocationSource>,
        hard_fail: bool,
    ) -> Self {
        let mut anchors: HashMap<Bytes, Vec<Cert>> = HashMap::new();
        let mut anchor_ders = HashSet::new();
        for cert in anchor_list {
            anchor_ders.insert(cert.der().clone());
            anchors.entry(cert.subject().clone()).or_default().push(cert);
        }
        BundleEngine { anchors, anchor_ders, revocation, hard_fail }
    }

    /// Checks the revocation status of one certificate.
    ///
    /// OCSP is consulted first; a definite answer decides. Otherwise the
    /// CRLs resolvable from the certificate’s distribution points are
    /// checked for the serial. A certificate that names revocation sources
    /// none of which could be reached passes under soft-fail policy and
    /// fails under hard-fail.
    fn check_revocation(
        &self, cert: &Cert, issuer: &Cert, idx: usize
    ) -> Result<(), PathFailure> {
        match self.revocation.ocsp_status(cert, issuer) {
            Some(OcspStatus::Good) => return Ok(()),
            Some(OcspStatus::Revoked) => {
                return Err(PathFailure::new(ERR_CERT_REVOKED, idx))
            }
            Some(OcspStatus::Unknown)
            | Some(OcspStatus::ResponderError)
            | None => { }
        }
        let crls = match self.revocation.crls_for(cert) {
            Ok(crls) => crls,
            Err(_) => {
                return Err(PathFailure::new(ERR_INVALID_EXTENSION, idx))
            }
        };
        for crl in &crls {
            if crl_revokes(crl.as_ref(), cert.serial()) {
                return Err(PathFailure::new(ERR_CERT_REVOKED, idx))
            }
        }
        // crls_for above already decoded the distribution points.
        let has_crl_uris = !cert.crl_uris().unwrap_or_default().is_empty();
        if self.hard_fail && has_crl_uris && crls.is_empty() {
            return Err(PathFailure::new(ERR_NO_CRL, idx))
        }
        Ok(())
    }
}

impl PathEngine for BundleEngine {
    fn validate(&self, chain: &[Cert]) -> Result<(), PathFailure> {
        if chain.is_empty() {
            return Err(PathFailure::new(ERR_NO_ISSUER, 0))
        }
        let now = Utc::now().timestamp();
        let mut idx = 0;
        loop {
            let cert = &chain[idx];
            if cert.is_expired_at(now) {
                return Err(PathFailure::new(ERR_CERT_EXPIRED, idx))
            }
            if !cert.is_valid_at(now) {
                return Err(PathFailure::new(ERR_CERT_NOT_YET_VALID, idx))
            }

            // A chain certificate that is itself an anchor terminates the
            // walk. Everything below it has already been checked.
            if self.anchor_ders.contains(cert.der()) {
                return Ok(())
            }

            // Prefer the next chain certificate as issuer if its name
            // matches; otherwise look among the anchors.
            let chain_issuer = chain.get(idx + 1).filter(|next| {
                next.subject() == cert.issuer()
            });
            match chain_issuer {
                Some(issuer) => {
                    if !signed_by(cert, issuer) {
                        return Err(
                            PathFailure::new(ERR_CERT_SIGNATURE, idx)
                        )
                    }
                    self.check_revocation(cert, issuer, idx)?;
                    idx += 1;
                }
                None => {
                    let candidates = match self.anchors.get(cert.issuer()) {
                        Some(candidates) => candidates,
                        None => {
                            let error = if cert.is_self_signed() {
                                ERR_SELF_SIGNED
                            }
                            else {
                                ERR_NO_ISSUER
                            };
                            return Err(PathFailure::new(error, idx))
                        }
                    };
                    let anchor = candidates.iter().find(|anchor| {
                        signed_by(cert, anchor)
                    });
                    match anchor {
                        Some(anchor) => {
                            self.check_revocation(cert, anchor, idx)?;
                            return Ok(())
                        }
                        None => {
                            return Err(
                                PathFailure::new(ERR_CERT_SIGNATURE, idx)
                            )
                        }
                    }
                }
            }
        }
    }
}


//------------ Helpers -------------------------------------------------------

/// Returns whether `cert`’s signature verifies under `issuer`’s key.
fn signed_by(cert: &Cert, issuer: &Cert) -> bool {
    let (Ok(cert), Ok(issuer)) = (cert.x509(), issuer.x509()) else {
        return false
    };
    cert.verify_signature(
        Some(&issuer.tbs_certificate.subject_pki)
    ).is_ok()
}

/// Returns whether the given DER CRL lists the serial as revoked.
fn crl_revokes(crl_der: &[u8], serial: &[u8]) -> bool {
    let Ok((_, crl)) = CertificateRevocationList::from_der(crl_der) else {
        return false
    };
    let revokes = crl.iter_revoked_certificates().any(|revoked| {
        revoked.raw_serial() == serial
    });
    revokes
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::pki;

    /// A scripted revocation source.
    #[derive(Default)]
    struct MockRevocation {
        /// CRLs returned for certificates that carry distribution points.
        crls: Vec<Arc<Bytes>>,

        /// Makes `crls_for` report a corrupt extension.
        broken_extension: bool,

        /// The OCSP answer, if any.
        ocsp: Option<OcspStatus>,
    }

    impl RevocationSource for MockRevocation {
        fn crls_for(
            &self, cert: &Cert
        ) -> Result<Vec<Arc<Bytes>>, DecodeError> {
            if self.broken_extension {
                return Err(DecodeError::new("corrupt extension"))
            }
            if cert.crl_uris().unwrap().is_empty() {
                Ok(Vec::new())
            }
            else {
                Ok(self.crls.clone())
            }
        }

        fn certs_for(&self, _subject: &Bytes) -> Vec<Cert> {
            Vec::new()
        }

        fn ocsp_status(
            &self, _cert: &Cert, _issuer: &Cert
        ) -> Option<OcspStatus> {
            self.ocsp
        }
    }

    fn engine(revocation: MockRevocation, hard_fail: bool) -> BundleEngine {
        BundleEngine::with_anchors(
            vec![pki::root()], Arc::new(revocation), hard_fail
        )
    }

    fn soft_engine() -> BundleEngine {
        engine(MockRevocation::default(), false)
    }

    #[test]
    fn valid_chain_passes() {
        let engine = soft_engine();
        assert_eq!(
            engine.validate(&[pki::leaf(), pki::int_a()]), Ok(())
        );
        // An anchor supplied in the chain terminates the walk, too.
        assert_eq!(
            engine.validate(&[pki::leaf(), pki::int_a(), pki::root()]),
            Ok(())
        );
    }

    #[test]
    fn incomplete_chain_fails() {
        assert_eq!(
            soft_engine().validate(&[pki::leaf()]),
            Err(PathFailure::new(ERR_NO_ISSUER, 0))
        );
    }

    #[test]
    fn self_signed_stranger_fails() {
        assert_eq!(
            soft_engine().validate(&[pki::other()]),
            Err(PathFailure::new(ERR_SELF_SIGNED, 0))
        );
    }

    #[test]
    fn wrong_issuer_signature_fails() {
        // int-b has the right subject name but did not sign the leaf.
        assert_eq!(
            soft_engine().validate(&[pki::leaf(), pki::int_b()]),
            Err(PathFailure::new(ERR_CERT_SIGNATURE, 0))
        );
    }

    #[test]
    fn expired_leaf_fails() {
        assert_eq!(
            soft_engine().validate(&[pki::expired(), pki::int_a()]),
            Err(PathFailure::new(ERR_CERT_EXPIRED, 0))
        );
    }

    #[test]
    fn ocsp_revoked_fails() {
        let engine = engine(
            MockRevocation {
                ocsp: Some(OcspStatus::Revoked),
                ..Default::default()
            },
            false,
        );
        assert_eq!(
            engine.validate(&[pki::leaf(), pki::int_a()]),
            Err(PathFailure::new(ERR_CERT_REVOKED, 0))
        );
    }

    #[test]
    fn ocsp_unknown_falls_back_to_crl() {
        let engine = engine(
            MockRevocation {
                ocsp: Some(OcspStatus::Unknown),
                crls: vec![Arc::new(pki::revoked_crl())],
                ..Default::default()
            },
            false,
        );
        assert_eq!(
            engine.validate(&[pki::leaf(), pki::int_a()]),
            Err(PathFailure::new(ERR_CERT_REVOKED, 0))
        );
    }

    #[test]
    fn crl_without_the_serial_passes() {
        let engine = engine(
            MockRevocation {
                crls: vec![Arc::new(pki::empty_crl())],
                ..Default::default()
            },
            false,
        );
        assert_eq!(
            engine.validate(&[pki::leaf(), pki::int_a()]), Ok(())
        );
    }

    #[test]
    fn unavailable_revocation_data_follows_policy() {
        // The leaf names a distribution point but no CRL resolves.
        assert_eq!(
            soft_engine().validate(&[pki::leaf(), pki::int_a()]),
            Ok(())
        );
        let hard = engine(MockRevocation::default(), true);
        assert_eq!(
            hard.validate(&[pki::leaf(), pki::int_a()]),
            Err(PathFailure::new(ERR_NO_CRL, 0))
        );
    }

    #[test]
    fn broken_crl_extension_fails_the_certificate() {
        let engine = engine(
            MockRevocation {
                broken_extension: true,
                ..Default::default()
            },
            false,
        );
        assert_eq!(
            engine.validate(&[pki::leaf(), pki::int_a()]),
            Err(PathFailure::new(ERR_INVALID_EXTENSION, 0))
        );
    }

    #[test]
    fn empty_chain_fails() {
        assert_eq!(
            soft_engine().validate(&[]),
            Err(PathFailure::new(ERR_NO_ISSUER, 0))
        );
    }
}
