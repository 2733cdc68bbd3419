//! The OCSP cache.
//!
//! [`OcspCache`] keeps the revocation status of individual certificates as
//! reported by their issuer’s OCSP responder, keyed by issuer identity and
//! serial number. A lookup builds an unsigned single-certificate request
//! per RFC 6960 and posts it to the responder named in the certificate’s
//! authority information access extension.
//!
//! A parseable response is cached until the tighter of its own `nextUpdate`
//! time and a configured max-age, where a response whose outer status is
//! anything but `successful` gets its own, typically much shorter, max-age.
//! A failed or unparseable fetch is never cached. Unlike CRLs there is no
//! conditional revalidation: [`refresh`][OcspCache::refresh] simply drops
//! expired entries and the next lookup fetches anew.
//!
//! Request building and response parsing stay within the plain DER
//! primitives of _asn1-rs_; signature checking on responses is out of
//! scope here, as is the cryptography of the certificates themselves.

use std::{cmp, io, thread};
use std::collections::HashMap;
use std::sync::{mpsc, Arc};
use std::time::Duration;
use asn1_rs::{
    oid, Any, Class, Enumerated, FromDer, GeneralizedTime, Integer, Null,
    OctetString, Oid, Sequence, Tag, ToDer
};
use bytes::Bytes;
use chrono::Utc;
use log::{debug, warn};
use ring::digest;
use crate::cert::{Cert, DecodeError};
use crate::http::Fetch;
use crate::utils::binio::{Compose, Parse};
use crate::utils::flight::FlightMap;
use crate::utils::sync::Mutex;


//------------ Configuration Constants ---------------------------------------

/// The tag identifying an OCSP cache snapshot stream.
const SNAPSHOT_MAGIC: &[u8; 8] = b"cwrdocsp";

/// The snapshot format version we read and write.
const SNAPSHOT_VERSION: u8 = 1;


//------------ OcspStatus ----------------------------------------------------

/// The cached outcome of an OCSP lookup.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OcspStatus {
    /// The responder confirmed the certificate as not revoked.
    Good,

    /// The responder reported the certificate as revoked.
    Revoked,

    /// The responder does not know the certificate.
    Unknown,

    /// The responder answered but refused the request.
    ///
    /// Covers the non-success response statuses such as `unauthorized` or
    /// `malformedRequest`. Cached with the error max-age so a misbehaving
    /// responder is not hammered on every request.
    ResponderError,
}

impl OcspStatus {
    fn to_u8(self) -> u8 {
        match self {
            OcspStatus::Good => 0,
            OcspStatus::Revoked => 1,
            OcspStatus::Unknown => 2,
            OcspStatus::ResponderError => 3,
        }
    }

    fn from_u8(value: u8) -> Result<Self, io::Error> {
        match value {
            0 => Ok(OcspStatus::Good),
            1 => Ok(OcspStatus::Revoked),
            2 => Ok(OcspStatus::Unknown),
            3 => Ok(OcspStatus::ResponderError),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData, "illegal OCSP status"
            ))
        }
    }
}


//------------ OcspCache -----------------------------------------------------

/// A bounded cache of OCSP lookup outcomes.
#[derive(Debug)]
pub struct OcspCache {
    /// The maximum number of entries kept.
    max_entries: usize,

    /// The max-age for responses with the outer status `successful`.
    success_max_age: i64,

    /// The max-age for responses with any other outer status.
    error_max_age: i64,

    /// The entries.
    entries: Mutex<Entries>,

    /// The fetches currently in flight.
    flights: FlightMap<Key>,
}

impl OcspCache {
    /// Creates a new, empty cache.
    pub fn new(
        max_entries: usize,
        success_max_age: Duration,
        error_max_age: Duration,
    ) -> Self {
        OcspCache {
            max_entries,
            success_max_age: i64::try_from(
                success_max_age.as_secs()
            ).unwrap_or(i64::MAX),
            error_max_age: i64::try_from(
                error_max_age.as_secs()
            ).unwrap_or(i64::MAX),
            entries: Mutex::new(Entries::default()),
            flights: FlightMap::new(),
        }
    }

    /// Returns the revocation status of a certificate.
    ///
    /// Returns `None` if the certificate names no responder or if the
    /// lookup failed. A failure is not remembered.
    pub fn get(
        &self, cert: &Cert, issuer: &Cert, fetch: &dyn Fetch
    ) -> Option<OcspStatus> {
        let uri = cert.ocsp_uri()?;
        let key = Key::new(cert, issuer);
        if let Some(status) = self.lookup(&key) {
            return Some(status)
        }
        match self.flights.join(&key) {
            Some(_guard) => self.lead(uri, key, cert, issuer, fetch),
            None => {
                // Someone else fetched while we waited.
                self.lookup(&key)
            }
        }
    }

    /// Fetches a status as the leader of its flight.
    ///
    /// The caller must hold the flight for the key. The cache is checked
    /// once more first: the status may have arrived between the caller’s
    /// initial miss and it gaining the flight.
    fn lead(
        &self,
        uri: &str,
        key: Key,
        cert: &Cert,
        issuer: &Cert,
        fetch: &dyn Fetch,
    ) -> Option<OcspStatus> {
        if let Some(status) = self.lookup(&key) {
            return Some(status)
        }
        let request = match build_request(cert, issuer) {
            Ok(request) => request,
            Err(err) => {
                warn!("OCSP {}: cannot build request: {}", uri, err);
                return None
            }
        };
        let body = fetch.post_ocsp(uri, &request).ok()?;
        let parsed = match parse_response(body.as_ref()) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!("OCSP {}: {}", uri, err);
                return None
            }
        };
        let now = Utc::now().timestamp();
        let (status, expires_at) = match parsed {
            ParsedResponse::Success { status, next_update } => {
                let mut expires_at = now + self.success_max_age;
                if let Some(next_update) = next_update {
                    expires_at = cmp::min(expires_at, next_update);
                }
                (status, expires_at)
            }
            ParsedResponse::NonSuccess { status } => {
                debug!("OCSP {}: responder status {}", uri, status);
                (OcspStatus::ResponderError, now + self.error_max_age)
            }
        };
        self.insert(key, Entry { status, expires_at, last_used: 0 });
        Some(status)
    }

    /// Drops all expired entries.
    ///
    /// Runs on the periodic refresh task. There is no revalidation; a
    /// dropped status is simply re-fetched on the next lookup.
    pub fn refresh(&self) {
        let now = Utc::now().timestamp();
        let mut entries = self.entries.lock();
        entries.map.retain(|_, entry| entry.expires_at > now);
        debug!("OCSP cache: {} entries", entries.map.len());
    }

    /// Returns the number of entries currently cached.
    pub fn len(&self) -> usize {
        self.entries.lock().map.len()
    }

    /// Returns whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().map.is_empty()
    }

    /// Returns an unexpired cached status, updating its recency.
    fn lookup(&self, key: &Key) -> Option<OcspStatus> {
        let now = Utc::now().timestamp();
        let mut entries = self.entries.lock();
        let counter = entries.next_use();
        let entry = entries.map.get_mut(key)?;
        if entry.expires_at <= now {
            return None
        }
        entry.last_used = counter;
        Some(entry.status)
    }

    /// Inserts an entry, evicting the least-recently-used one if necessary.
    fn insert(&self, key: Key, mut entry: Entry) {
        let mut entries = self.entries.lock();
        if !entries.map.contains_key(&key)
            && entries.map.len() >= self.max_entries
        {
            entries.evict_lru();
        }
        entry.last_used = entries.next_use();
        entries.map.insert(key, entry);
    }


    //--- Snapshots

    /// Writes the full cache content to the given stream.
    pub fn snapshot(
        &self, target: &mut impl io::Write
    ) -> Result<(), io::Error> {
        target.write_all(SNAPSHOT_MAGIC)?;
        SNAPSHOT_VERSION.compose(target)?;
        let entries = self.entries.lock();
        entries.map.len().compose(target)?;
        let mut sorted: Vec<_> = entries.map.iter().collect();
        sorted.sort_by_key(|(_, entry)| entry.last_used);
        for (key, entry) in sorted {
            key.issuer.compose(target)?;
            key.serial.compose(target)?;
            entry.status.to_u8().compose(target)?;
            entry.expires_at.compose(target)?;
        }
        Ok(())
    }

    /// Loads entries from a snapshot stream.
    ///
    /// Expired entries are loaded as-is and swept by the next refresh.
    /// Returns the number of entries loaded.
    pub fn restore(
        &self, source: &mut impl io::Read
    ) -> Result<usize, io::Error> {
        let mut magic = [0u8; 8];
        source.read_exact(&mut magic)?;
        if magic != *SNAPSHOT_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData, "not an OCSP cache snapshot"
            ))
        }
        let version = u8::parse(source)?;
        if version != SNAPSHOT_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported OCSP snapshot version {}", version)
            ))
        }
        let count = usize::parse(source)?;
        for _ in 0..count {
            let key = Key {
                issuer: Bytes::parse(source)?,
                serial: Bytes::parse(source)?,
            };
            let entry = Entry {
                status: OcspStatus::from_u8(u8::parse(source)?)?,
                expires_at: i64::parse(source)?,
                last_used: 0,
            };
            self.insert(key, entry);
        }
        Ok(count)
    }

    /// Loads a snapshot on a background thread.
    ///
    /// The returned channel delivers the result once loading finished.
    /// The source stream is dropped, and thereby closed, in any case.
    pub fn spawn_restore(
        self: &Arc<Self>, source: impl io::Read + Send + 'static
    ) -> mpsc::Receiver<Result<usize, io::Error>> {
        let (tx, rx) = mpsc::channel();
        let cache = self.clone();
        thread::spawn(move || {
            let mut source = source;
            let res = cache.restore(&mut source);
            drop(source);
            let _ = tx.send(res);
        });
        rx
    }

    /// Returns the expiry time of a cached status for expiry testing.
    #[cfg(test)]
    fn expiry(&self, cert: &Cert, issuer: &Cert) -> Option<i64> {
        let key = Key::new(cert, issuer);
        self.entries.lock().map.get(&key).map(|entry| entry.expires_at)
    }

    /// Marks an entry as expired for refresh testing.
    #[cfg(test)]
    fn force_expire(&self, cert: &Cert, issuer: &Cert) {
        let key = Key::new(cert, issuer);
        if let Some(entry) = self.entries.lock().map.get_mut(&key) {
            entry.expires_at = Utc::now().timestamp() - 1;
        }
    }
}


//------------ Entries -------------------------------------------------------

/// The entry map plus the recency counter backing LRU eviction.
#[derive(Debug, Default)]
struct Entries {
    map: HashMap<Key, Entry>,
    use_counter: u64,
}

impl Entries {
    fn next_use(&mut self) -> u64 {
        self.use_counter += 1;
        self.use_counter
    }

    fn evict_lru(&mut self) {
        let lru = self.map.iter().min_by_key(|(_, entry)| {
            entry.last_used
        }).map(|(key, _)| key.clone());
        if let Some(key) = lru {
            self.map.remove(&key);
        }
    }
}


//------------ Key -----------------------------------------------------------

/// The cache key: issuer identity plus subject serial number.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct Key {
    /// The SHA-256 digest of the issuer certificate’s DER encoding.
    issuer: Bytes,

    /// The content octets of the subject’s serial number.
    serial: Bytes,
}

impl Key {
    fn new(cert: &Cert, issuer: &Cert) -> Self {
        Key {
            issuer: Bytes::copy_from_slice(
                digest::digest(&digest::SHA256, issuer.der()).as_ref()
            ),
            serial: cert.serial().clone(),
        }
    }
}


//------------ Entry ---------------------------------------------------------

/// A cached OCSP outcome.
#[derive(Debug)]
struct Entry {
    /// The cached status.
    status: OcspStatus,

    /// When the entry expires, as a Unix timestamp.
    expires_at: i64,

    /// The recency mark for LRU eviction.
    last_used: u64,
}


//------------ Request Building ----------------------------------------------

/// Builds an unsigned DER OCSP request for a single certificate.
///
/// The `CertID` uses SHA-1 name and key hashes as is conventional for
/// OCSP requests. SHA-1 serves as an identifier here, not as a security
/// boundary.
pub fn build_request(
    cert: &Cert, issuer: &Cert
) -> Result<Vec<u8>, DecodeError> {
    let issuer_x509 = issuer.x509()?;
    let name_hash = digest::digest(
        &digest::SHA1_FOR_LEGACY_USE_ONLY, issuer.subject()
    );
    let key_hash = digest::digest(
        &digest::SHA1_FOR_LEGACY_USE_ONLY,
        issuer_x509.tbs_certificate.subject_pki.subject_public_key
            .data.as_ref()
    );

    let mut algorithm = oid!(1.3.14.3.2.26).to_der_vec().map_err(ser_err)?;
    algorithm.extend(Null::new().to_der_vec().map_err(ser_err)?);

    let mut cert_id = der_sequence(algorithm)?;
    cert_id.extend(
        OctetString::from(name_hash.as_ref())
            .to_der_vec().map_err(ser_err)?
    );
    cert_id.extend(
        OctetString::from(key_hash.as_ref())
            .to_der_vec().map_err(ser_err)?
    );
    cert_id.extend(
        Integer::new(cert.serial()).to_der_vec().map_err(ser_err)?
    );

    // Request, requestList, TBSRequest, OCSPRequest. All optional and
    // defaulted fields are absent.
    let request = der_sequence(der_sequence(cert_id)?)?;
    der_sequence(der_sequence(der_sequence(request)?)?)
}

fn der_sequence(content: Vec<u8>) -> Result<Vec<u8>, DecodeError> {
    Sequence::new(content.into()).to_der_vec().map_err(ser_err)
}

fn ser_err(err: asn1_rs::SerializeError) -> DecodeError {
    DecodeError::new(format!("cannot encode OCSP request: {}", err))
}


//------------ Response Parsing ----------------------------------------------

/// The parts of an OCSP response the cache cares about.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ParsedResponse {
    /// The outer status was `successful`.
    Success {
        /// The status of the first single response.
        status: OcspStatus,

        /// The `nextUpdate` time as a Unix timestamp if present.
        next_update: Option<i64>,
    },

    /// The outer status was anything else.
    NonSuccess {
        /// The raw value of the outer status.
        status: u32,
    },
}

/// Parses a DER OCSP response.
///
/// Only the fields that determine caching are extracted: the outer
/// response status and, for a successful basic response, the certificate
/// status and `nextUpdate` time of the first single response.
fn parse_response(der: &[u8]) -> Result<ParsedResponse, DecodeError> {
    let (_, outer) = Sequence::from_der(der).map_err(parse_err)?;
    let (rest, status) = Enumerated::from_der(
        outer.content.as_ref()
    ).map_err(parse_err)?;
    if status.0 != 0 {
        return Ok(ParsedResponse::NonSuccess { status: status.0 })
    }

    // responseBytes [0] EXPLICIT ResponseBytes
    let (_, tagged) = Any::from_der(rest).map_err(parse_err)?;
    if tagged.header.class() != Class::ContextSpecific
        || tagged.header.tag() != Tag(0)
    {
        return Err(DecodeError::new(
            "malformed OCSP response: missing responseBytes"
        ))
    }
    let (_, response_bytes) = Sequence::from_der(
        tagged.data
    ).map_err(parse_err)?;
    let (rest, response_type) = Oid::from_der(
        response_bytes.content.as_ref()
    ).map_err(parse_err)?;
    if response_type != oid!(1.3.6.1.5.5.7.48.1.1) {
        return Err(DecodeError::new(
            "malformed OCSP response: not a basic response"
        ))
    }
    let (_, basic_octets) = OctetString::from_der(rest).map_err(parse_err)?;

    // BasicOCSPResponse, then its tbsResponseData.
    let (_, basic) = Sequence::from_der(
        basic_octets.as_ref()
    ).map_err(parse_err)?;
    let (_, tbs) = Sequence::from_der(
        basic.content.as_ref()
    ).map_err(parse_err)?;

    // version [0] EXPLICIT INTEGER DEFAULT v1 -- skipped if present
    let mut rest = tbs.content.as_ref();
    let (after, first) = Any::from_der(rest).map_err(parse_err)?;
    if first.header.class() == Class::ContextSpecific
        && first.header.tag() == Tag(0)
    {
        rest = after;
    }
    // responderID and producedAt
    let (rest, _) = Any::from_der(rest).map_err(parse_err)?;
    let (rest, _) = Any::from_der(rest).map_err(parse_err)?;

    // responses; only the first single response matters since the request
    // asked about a single certificate.
    let (_, responses) = Sequence::from_der(rest).map_err(parse_err)?;
    let (_, single) = Sequence::from_der(
        responses.content.as_ref()
    ).map_err(parse_err)?;

    let (rest, _cert_id) = Sequence::from_der(
        single.content.as_ref()
    ).map_err(parse_err)?;
    let (rest, cert_status) = Any::from_der(rest).map_err(parse_err)?;
    if cert_status.header.class() != Class::ContextSpecific {
        return Err(DecodeError::new(
            "malformed OCSP response: bad certStatus"
        ))
    }
    let status = match cert_status.header.tag() {
        Tag(0) => OcspStatus::Good,
        Tag(1) => OcspStatus::Revoked,
        Tag(2) => OcspStatus::Unknown,
        _ => {
            return Err(DecodeError::new(
                "malformed OCSP response: bad certStatus"
            ))
        }
    };

    // thisUpdate, then nextUpdate [0] EXPLICIT GeneralizedTime OPTIONAL.
    let (rest, _this_update) = GeneralizedTime::from_der(
        rest
    ).map_err(parse_err)?;
    let mut next_update = None;
    if !rest.is_empty() {
        let (_, tagged) = Any::from_der(rest).map_err(parse_err)?;
        if tagged.header.class() == Class::ContextSpecific
            && tagged.header.tag() == Tag(0)
        {
            let (_, time) = GeneralizedTime::from_der(
                tagged.data
            ).map_err(parse_err)?;
            next_update = Some(
                time.utc_datetime().map_err(parse_err)?.unix_timestamp()
            );
        }
    }

    Ok(ParsedResponse::Success { status, next_update })
}

fn parse_err(err: impl std::fmt::Display) -> DecodeError {
    DecodeError::new(format!("malformed OCSP response: {}", err))
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use chrono::{DateTime, Utc};
    use crate::http::{FetchError, FetchedBody};
    use crate::test::pki;

    struct MockResponder {
        posts: AtomicUsize,
        body: StdMutex<Option<Bytes>>,
    }

    impl MockResponder {
        fn new(body: Option<Bytes>) -> Self {
            MockResponder {
                posts: AtomicUsize::new(0),
                body: StdMutex::new(body),
            }
        }

        fn posts(&self) -> usize {
            self.posts.load(Ordering::SeqCst)
        }
    }

    impl Fetch for MockResponder {
        fn get(&self, _uri: &str) -> Result<FetchedBody, FetchError> {
            unreachable!("OCSP cache never uses GET")
        }

        fn get_conditional(
            &self,
            _uri: &str,
            _last_modified: Option<DateTime<Utc>>,
            _etag: Option<&Bytes>,
        ) -> Result<Option<FetchedBody>, FetchError> {
            unreachable!("OCSP cache never uses GET")
        }

        fn post_ocsp(
            &self, uri: &str, request: &[u8]
        ) -> Result<Bytes, FetchError> {
            self.posts.fetch_add(1, Ordering::SeqCst);
            assert_eq!(uri, "http://ocsp.example/");
            assert_eq!(request, pki::ocsp_request().as_ref());
            match self.body.lock().unwrap().clone() {
                Some(body) => Ok(body),
                None => Err(FetchError),
            }
        }
    }

    fn test_cache() -> OcspCache {
        OcspCache::new(
            8,
            Duration::from_secs(3600),
            Duration::from_secs(60),
        )
    }

    #[test]
    fn request_matches_openssl() {
        // The fixture was produced by `openssl ocsp -no_nonce -reqout`.
        assert_eq!(
            build_request(&pki::leaf(), &pki::int_a()).unwrap(),
            pki::ocsp_request().as_ref()
        );
    }

    #[test]
    fn parse_fixture_responses() {
        match parse_response(pki::ocsp_good().as_ref()).unwrap() {
            ParsedResponse::Success { status, next_update } => {
                assert_eq!(status, OcspStatus::Good);
                assert!(next_update.is_some());
            }
            other => panic!("unexpected {:?}", other),
        }
        match parse_response(pki::ocsp_revoked().as_ref()).unwrap() {
            ParsedResponse::Success { status, .. } => {
                assert_eq!(status, OcspStatus::Revoked);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            parse_response(pki::ocsp_unauthorized().as_ref()).unwrap(),
            ParsedResponse::NonSuccess { status: 6 }
        );
        assert!(parse_response(b"garbage").is_err());
    }

    #[test]
    fn lookup_is_cached() {
        let cache = test_cache();
        let responder = MockResponder::new(Some(pki::ocsp_good()));
        assert_eq!(
            cache.get(&pki::leaf(), &pki::int_a(), &responder),
            Some(OcspStatus::Good)
        );
        assert_eq!(
            cache.get(&pki::leaf(), &pki::int_a(), &responder),
            Some(OcspStatus::Good)
        );
        assert_eq!(responder.posts(), 1);
    }

    #[test]
    fn revoked_is_cached() {
        let cache = test_cache();
        let responder = MockResponder::new(Some(pki::ocsp_revoked()));
        assert_eq!(
            cache.get(&pki::leaf(), &pki::int_a(), &responder),
            Some(OcspStatus::Revoked)
        );
    }

    #[test]
    fn responder_errors_use_the_error_bucket() {
        let cache = test_cache();
        let responder = MockResponder::new(Some(pki::ocsp_unauthorized()));
        assert_eq!(
            cache.get(&pki::leaf(), &pki::int_a(), &responder),
            Some(OcspStatus::ResponderError)
        );
        assert_eq!(
            cache.get(&pki::leaf(), &pki::int_a(), &responder),
            Some(OcspStatus::ResponderError)
        );
        assert_eq!(responder.posts(), 1);

        // The error bucket is 60 seconds, far tighter than the response’s
        // own week-long nextUpdate would have allowed.
        let expiry = cache.expiry(&pki::leaf(), &pki::int_a()).unwrap();
        assert!(expiry <= Utc::now().timestamp() + 60);
    }

    #[test]
    fn next_update_bounds_the_expiry() {
        // With a huge success max-age, nextUpdate is the tighter bound.
        let cache = OcspCache::new(
            8,
            Duration::from_secs(365 * 24 * 3600),
            Duration::from_secs(60),
        );
        let responder = MockResponder::new(Some(pki::ocsp_good()));
        cache.get(&pki::leaf(), &pki::int_a(), &responder).unwrap();
        let expiry = cache.expiry(&pki::leaf(), &pki::int_a()).unwrap();
        // The fixture’s nextUpdate is a week out.
        assert!(expiry <= Utc::now().timestamp() + 8 * 24 * 3600);
    }

    #[test]
    fn failures_are_not_cached() {
        let cache = test_cache();

        let unreachable = MockResponder::new(None);
        assert!(
            cache.get(&pki::leaf(), &pki::int_a(), &unreachable).is_none()
        );
        assert!(
            cache.get(&pki::leaf(), &pki::int_a(), &unreachable).is_none()
        );
        assert_eq!(unreachable.posts(), 2);

        let garbage = MockResponder::new(
            Some(Bytes::from_static(b"not DER"))
        );
        assert!(cache.get(&pki::leaf(), &pki::int_a(), &garbage).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn no_responder_uri_means_no_lookup() {
        let cache = test_cache();
        let responder = MockResponder::new(Some(pki::ocsp_good()));
        assert!(
            cache.get(&pki::leaf_noaki(), &pki::int_a(), &responder)
                .is_none()
        );
        assert_eq!(responder.posts(), 0);
    }

    #[test]
    fn flight_leaders_recheck_the_cache_first() {
        let cache = test_cache();
        let responder = MockResponder::new(Some(pki::ocsp_good()));
        cache.get(&pki::leaf(), &pki::int_a(), &responder).unwrap();

        // A thread whose initial lookup missed but that gained the
        // flight only after another thread completed the whole fetch
        // must serve the cached status instead of posting again.
        let key = Key::new(&pki::leaf(), &pki::int_a());
        let _guard = cache.flights.join(&key).unwrap();
        assert_eq!(
            cache.lead(
                "http://ocsp.example/", key.clone(), &pki::leaf(),
                &pki::int_a(), &responder,
            ),
            Some(OcspStatus::Good)
        );
        assert_eq!(responder.posts(), 1);
    }

    #[test]
    fn refresh_drops_expired_entries() {
        let cache = test_cache();
        let responder = MockResponder::new(Some(pki::ocsp_good()));
        cache.get(&pki::leaf(), &pki::int_a(), &responder).unwrap();

        cache.refresh();
        assert_eq!(cache.len(), 1);

        cache.force_expire(&pki::leaf(), &pki::int_a());
        cache.refresh();
        assert!(cache.is_empty());

        // The next lookup fetches anew.
        cache.get(&pki::leaf(), &pki::int_a(), &responder).unwrap();
        assert_eq!(responder.posts(), 2);
    }

    #[test]
    fn capacity_is_bounded_lru() {
        let now = Utc::now().timestamp();
        let cache = OcspCache::new(
            3,
            Duration::from_secs(3600),
            Duration::from_secs(60),
        );
        let key = |serial: u8| Key {
            issuer: Bytes::copy_from_slice(&[serial; 32]),
            serial: Bytes::copy_from_slice(&[serial]),
        };
        let entry = || Entry {
            status: OcspStatus::Good,
            expires_at: now + 3600,
            last_used: 0,
        };
        for serial in 1..=4 {
            cache.insert(key(serial), entry());
        }
        assert_eq!(cache.len(), 3);
        let entries = cache.entries.lock();
        assert!(!entries.map.contains_key(&key(1)));
        assert!(entries.map.contains_key(&key(4)));
    }

    #[test]
    fn snapshot_round_trip() {
        let cache = test_cache();
        let responder = MockResponder::new(Some(pki::ocsp_revoked()));
        cache.get(&pki::leaf(), &pki::int_a(), &responder).unwrap();

        let mut stream = Vec::new();
        cache.snapshot(&mut stream).unwrap();

        let restored = Arc::new(test_cache());
        let rx = restored.spawn_restore(io::Cursor::new(stream));
        assert_eq!(rx.recv().unwrap().unwrap(), 1);

        // The status serves without any network traffic.
        let broken = MockResponder::new(None);
        assert_eq!(
            restored.get(&pki::leaf(), &pki::int_a(), &broken),
            Some(OcspStatus::Revoked)
        );
        assert_eq!(broken.posts(), 0);
    }

    #[test]
    fn foreign_snapshots_are_rejected() {
        let cache = test_cache();
        assert!(cache.restore(&mut b"not a snapshot".as_ref()).is_err());
        let mut bad_version = SNAPSHOT_MAGIC.to_vec();
        bad_version.push(SNAPSHOT_VERSION + 1);
        assert!(cache.restore(&mut bad_version.as_slice()).is_err());
    }
}
