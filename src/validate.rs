//! The validator chain.
//!
//! A request runs through a fixed sequence of validators, each of which
//! either answers it or hands it to the next one:
//!
//! 1. [`PinnedValidator`] accepts a chain whose leaf is pinned outright,
//!    as long as the leaf is within its validity period.
//! 2. [`ChainCompleter`] extends a chain the client sent incomplete with
//!    intermediates from the store.
//! 3. [`CachedValidator`] answers repeat chains from a bounded cache.
//! 4. [`PathCheckValidator`] hands the chain to the path engine.
//!
//! The sequence is wired once at startup by [`standard_chain`]. Requests
//! travel behind an `Arc`; a validator that has nothing to do passes the
//! very same request on, so the common case allocates nothing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use chrono::Utc;
use log::debug;
use crate::cert::{chain_fingerprint, Cert};
use crate::engine::{
    PathEngine, ERR_CERT_EXPIRED, ERR_CERT_NOT_YET_VALID
};
use crate::proto::{ValidationRequest, ValidationResponse};
use crate::store::{IntermediateStore, PinnedStore};
use crate::utils::sync::Mutex;


//------------ Configuration Constants ---------------------------------------

/// The reported error names that trigger chain completion.
///
/// Both names mean the same thing for our purposes: the client’s TLS
/// library gave up because the chain does not reach anything it trusts.
const MISSING_ISSUER_ERRORS: &[&str] = &[
    "X509_V_ERR_UNABLE_TO_GET_ISSUER_CERT_LOCALLY",
    "X509_V_ERR_UNABLE_TO_GET_ISSUER_CERT",
];

/// The maximum number of certificates chain completion will append.
///
/// Well-formed stores terminate at a self-signed certificate long before
/// this; the bound only stops pathological store contents such as
/// cross-signed issuer loops.
const MAX_COMPLETION_DEPTH: usize = 16;


//------------ Validator -----------------------------------------------------

/// A single stage of the validator chain.
pub trait Validator: Send + Sync {
    /// Produces a response for the given request.
    fn validate(&self, request: &Arc<ValidationRequest>)
        -> ValidationResponse;
}

impl<V: Validator + ?Sized> Validator for Box<V> {
    fn validate(
        &self, request: &Arc<ValidationRequest>
    ) -> ValidationResponse {
        (**self).validate(request)
    }
}

impl<V: Validator + ?Sized> Validator for Arc<V> {
    fn validate(
        &self, request: &Arc<ValidationRequest>
    ) -> ValidationResponse {
        (**self).validate(request)
    }
}


//------------ PinnedValidator -----------------------------------------------

/// Accepts chains whose leaf certificate is pinned.
///
/// Pinning overrides whatever errors the client reported, but not time:
/// an expired or not-yet-valid pinned certificate still fails.
pub struct PinnedValidator<V> {
    store: Arc<PinnedStore>,
    next: V,
}

impl<V> PinnedValidator<V> {
    pub fn new(store: Arc<PinnedStore>, next: V) -> Self {
        PinnedValidator { store, next }
    }
}

impl<V: Validator> Validator for PinnedValidator<V> {
    fn validate(
        &self, request: &Arc<ValidationRequest>
    ) -> ValidationResponse {
        let leaf = match request.chain.first() {
            Some(leaf) => leaf,
            None => return self.next.validate(request),
        };
        if !self.store.contains(leaf.der()) {
            return self.next.validate(request)
        }
        let now = Utc::now().timestamp();
        if leaf.is_expired_at(now) {
            return ValidationResponse::fail_with(
                request.id, ERR_CERT_EXPIRED, 0
            )
        }
        if !leaf.is_valid_at(now) {
            return ValidationResponse::fail_with(
                request.id, ERR_CERT_NOT_YET_VALID, 0
            )
        }
        debug!("{}: leaf is pinned, accepting", request.host);
        ValidationResponse::pass(request.id)
    }
}


//------------ ChainCompleter ------------------------------------------------

/// Completes chains the client could not build.
///
/// Runs only when the client reported a missing-issuer error. Walks up
/// from the last supplied certificate through the intermediate store and
/// appends whatever could have issued it; when several same-name
/// candidates match, all of them are appended and the walk continues from
/// the first. The walk stops at a self-signed certificate, at a
/// certificate without a match, or at the depth bound.
///
/// A completed request is a fresh copy with the missing-issuer errors
/// dropped. If there was nothing to do, the original request is forwarded
/// untouched.
pub struct ChainCompleter<V> {
    store: Arc<IntermediateStore>,
    next: V,
}

impl<V> ChainCompleter<V> {
    pub fn new(store: Arc<IntermediateStore>, next: V) -> Self {
        ChainCompleter { store, next }
    }
}

impl<V: Validator> Validator for ChainCompleter<V> {
    fn validate(
        &self, request: &Arc<ValidationRequest>
    ) -> ValidationResponse {
        if !request.reported.iter().any(|err| {
            MISSING_ISSUER_ERRORS.contains(&err.name.as_str())
        }) {
            return self.next.validate(request)
        }
        let mut current = match request.chain.last() {
            Some(last) => last.clone(),
            None => return self.next.validate(request),
        };

        let mut appended: Vec<Cert> = Vec::new();
        while !current.is_self_signed()
            && appended.len() < MAX_COMPLETION_DEPTH
        {
            let candidates = self.store.find_issuers(&current);
            let first = match candidates.first() {
                Some(first) => first.clone(),
                None => break,
            };
            appended.extend(candidates);
            current = first;
        }

        if appended.is_empty() {
            return self.next.validate(request)
        }

        debug!(
            "{}: completed chain from {} to {} certificates",
            request.host,
            request.chain.len(),
            request.chain.len() + appended.len(),
        );
        let mut completed = (**request).clone();
        completed.chain.extend(appended);
        completed.reported.retain(|err| {
            !MISSING_ISSUER_ERRORS.contains(&err.name.as_str())
        });

        let mut response = self.next.validate(&Arc::new(completed));

        // Failures pointing at an appended certificate are reported
        // against the last certificate the client actually sent.
        let last_original = request.chain.len() - 1;
        for error in &mut response.errors {
            if error.cert_index > last_original {
                error.cert_index = last_original;
            }
        }
        response
    }
}


//------------ CachedValidator -----------------------------------------------

/// Answers repeat chains from a bounded LRU cache.
///
/// The key is a fingerprint of the chain contents only; host, protocol
/// version and cipher do not influence the trust outcome. Entries expire
/// after the configured TTL, independent of eviction for space.
pub struct CachedValidator<V> {
    max_entries: usize,
    ttl: i64,
    entries: Mutex<Entries>,
    next: V,
}

impl<V> CachedValidator<V> {
    pub fn new(max_entries: usize, ttl: Duration, next: V) -> Self {
        CachedValidator {
            max_entries,
            ttl: i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX),
            entries: Mutex::new(Entries::default()),
            next,
        }
    }

    /// Marks an entry as expired for TTL testing.
    #[cfg(test)]
    fn force_expire(&self, chain: &[Cert]) {
        let key = chain_fingerprint(chain);
        if let Some(entry) = self.entries.lock().map.get_mut(&key) {
            entry.expires_at = Utc::now().timestamp() - 1;
        }
    }
}

impl<V: Validator> Validator for CachedValidator<V> {
    fn validate(
        &self, request: &Arc<ValidationRequest>
    ) -> ValidationResponse {
        let key = chain_fingerprint(&request.chain);
        let now = Utc::now().timestamp();
        {
            let mut entries = self.entries.lock();
            let counter = entries.next_use();
            if let Some(entry) = entries.map.get_mut(&key) {
                if entry.expires_at > now {
                    entry.last_used = counter;
                    debug!("{}: cached verdict", request.host);
                    return ValidationResponse {
                        id: request.id,
                        pass: entry.pass,
                        errors: entry.errors.clone(),
                    }
                }
            }
        }

        let response = self.next.validate(request);

        let mut entries = self.entries.lock();
        if !entries.map.contains_key(&key)
            && entries.map.len() >= self.max_entries
        {
            entries.evict_lru();
        }
        let counter = entries.next_use();
        entries.map.insert(key, CacheEntry {
            pass: response.pass,
            errors: response.errors.clone(),
            expires_at: Utc::now().timestamp() + self.ttl,
            last_used: counter,
        });
        response
    }
}

/// The entry map plus the recency counter backing LRU eviction.
#[derive(Default)]
struct Entries {
    map: HashMap<Bytes, CacheEntry>,
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

/// A cached verdict. The request id is never cached.
struct CacheEntry {
    pass: bool,
    errors: Vec<crate::proto::ReportedError>,
    expires_at: i64,
    last_used: u64,
}


//------------ PathCheckValidator --------------------------------------------

/// The terminal stage: full path validation.
pub struct PathCheckValidator {
    engine: Arc<dyn PathEngine>,
}

impl PathCheckValidator {
    pub fn new(engine: Arc<dyn PathEngine>) -> Self {
        PathCheckValidator { engine }
    }
}

impl Validator for PathCheckValidator {
    fn validate(
        &self, request: &Arc<ValidationRequest>
    ) -> ValidationResponse {
        match self.engine.validate(&request.chain) {
            Ok(()) => ValidationResponse::pass(request.id),
            Err(failure) => {
                debug!(
                    "{}: {} at cert_{}",
                    request.host, failure.error, failure.cert_index
                );
                ValidationResponse::fail_with(
                    request.id, failure.error, failure.cert_index
                )
            }
        }
    }
}


//------------ standard_chain ------------------------------------------------

/// Wires the standard validator sequence.
pub fn standard_chain(
    pinned: Arc<PinnedStore>,
    intermediates: Arc<IntermediateStore>,
    engine: Arc<dyn PathEngine>,
    result_cache_size: usize,
    result_cache_ttl: Duration,
) -> impl Validator {
    PinnedValidator::new(
        pinned,
        ChainCompleter::new(
            intermediates,
            CachedValidator::new(
                result_cache_size,
                result_cache_ttl,
                PathCheckValidator::new(engine),
            ),
        ),
    )
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use crate::proto::ReportedError;
    use crate::test::pki;

    /// A terminal validator that records what reaches it.
    #[derive(Default)]
    struct Recorder {
        calls: AtomicUsize,
        last: StdMutex<Option<Arc<ValidationRequest>>>,
        response: StdMutex<Option<ValidationResponse>>,
    }

    impl Recorder {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn last(&self) -> Arc<ValidationRequest> {
            self.last.lock().unwrap().clone().unwrap()
        }
    }

    impl Validator for Recorder {
        fn validate(
            &self, request: &Arc<ValidationRequest>
        ) -> ValidationResponse {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some(request.clone());
            match self.response.lock().unwrap().clone() {
                Some(mut response) => {
                    response.id = request.id;
                    response
                }
                None => ValidationResponse::pass(request.id),
            }
        }
    }

    fn request(chain: Vec<Cert>, reported: Vec<ReportedError>)
        -> Arc<ValidationRequest>
    {
        Arc::new(ValidationRequest {
            id: Some(7),
            host: "leaf.example".into(),
            protocol_version: "TLSv1.3".into(),
            cipher_suite: "TLS_AES_128_GCM_SHA256".into(),
            chain,
            reported,
        })
    }

    fn missing_issuer() -> Vec<ReportedError> {
        vec![ReportedError::new(
            "X509_V_ERR_UNABLE_TO_GET_ISSUER_CERT_LOCALLY", 0
        )]
    }

    fn pem_store<T>(
        certs: &[Cert],
        make: impl FnOnce(std::path::PathBuf) -> T,
    ) -> (T, tempfile::NamedTempFile) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for cert in certs {
            writeln!(file, "{}", cert.to_pem()).unwrap();
        }
        file.flush().unwrap();
        let store = make(file.path().to_path_buf());
        (store, file)
    }

    //--- PinnedValidator

    fn pinned_store(certs: &[Cert]) -> (Arc<PinnedStore>, tempfile::NamedTempFile) {
        let (store, file) = pem_store(certs, |path| {
            PinnedStore::new(Some(path))
        });
        store.refresh();
        (Arc::new(store), file)
    }

    #[test]
    fn pinned_leaf_overrides_reported_errors() {
        let (store, _file) = pinned_store(&[pki::leaf()]);
        let next = Arc::new(Recorder::default());
        let validator = PinnedValidator::new(store, next.clone());

        let reported = vec![
            ReportedError::new("X509_V_ERR_CERT_UNTRUSTED", 0),
            ReportedError::new("X509_V_ERR_UNABLE_TO_GET_ISSUER_CERT", 0),
            ReportedError::new("X509_V_ERR_CERT_SIGNATURE_FAILURE", 0),
        ];
        let response = validator.validate(
            &request(vec![pki::leaf()], reported)
        );
        assert!(response.pass);
        assert!(response.errors.is_empty());
        assert_eq!(next.calls(), 0);
    }

    #[test]
    fn expired_pinned_leaf_still_fails() {
        let (store, _file) = pinned_store(&[pki::expired()]);
        let next = Arc::new(Recorder::default());
        let validator = PinnedValidator::new(store, next.clone());

        let response = validator.validate(
            &request(vec![pki::expired()], Vec::new())
        );
        assert!(!response.pass);
        assert_eq!(
            response.errors,
            [ReportedError::new(ERR_CERT_EXPIRED, 0)]
        );
        assert_eq!(next.calls(), 0);
    }

    #[test]
    fn unpinned_leaf_passes_through() {
        let (store, _file) = pinned_store(&[pki::other()]);
        let next = Arc::new(Recorder::default());
        let validator = PinnedValidator::new(store, next.clone());

        let req = request(vec![pki::leaf()], Vec::new());
        validator.validate(&req);
        assert_eq!(next.calls(), 1);
        assert!(Arc::ptr_eq(&next.last(), &req));
    }

    //--- ChainCompleter

    fn intermediate_store(
        certs: &[Cert]
    ) -> (Arc<IntermediateStore>, tempfile::NamedTempFile) {
        let (store, file) = pem_store(certs, |path| {
            IntermediateStore::new(Some(path))
        });
        store.refresh();
        (Arc::new(store), file)
    }

    #[test]
    fn no_trigger_forwards_the_identical_request() {
        let (store, _file) = intermediate_store(&[pki::int_a()]);
        let next = Arc::new(Recorder::default());
        let completer = ChainCompleter::new(store, next.clone());

        let req = request(
            vec![pki::leaf()],
            vec![ReportedError::new("X509_V_ERR_CERT_HAS_EXPIRED", 0)],
        );
        completer.validate(&req);
        assert!(Arc::ptr_eq(&next.last(), &req));
    }

    #[test]
    fn missing_intermediate_is_appended() {
        let (store, _file) = intermediate_store(&[pki::int_a(), pki::root()]);
        let next = Arc::new(Recorder::default());
        let completer = ChainCompleter::new(store, next.clone());

        completer.validate(&request(vec![pki::leaf()], missing_issuer()));
        let completed = next.last();
        assert_eq!(
            completed.chain,
            [pki::leaf(), pki::int_a(), pki::root()]
        );
        assert!(completed.reported.is_empty());
    }

    #[test]
    fn other_errors_survive_completion() {
        let (store, _file) = intermediate_store(&[pki::int_a(), pki::root()]);
        let next = Arc::new(Recorder::default());
        let completer = ChainCompleter::new(store, next.clone());

        let mut reported = missing_issuer();
        reported.push(ReportedError::new("X509_V_ERR_CERT_REVOKED", 0));
        completer.validate(&request(vec![pki::leaf()], reported));
        assert_eq!(
            next.last().reported,
            [ReportedError::new("X509_V_ERR_CERT_REVOKED", 0)]
        );
    }

    #[test]
    fn ambiguous_candidates_are_all_appended() {
        let (store, _file) = intermediate_store(&[pki::int_a(), pki::int_b()]);
        let next = Arc::new(Recorder::default());
        let completer = ChainCompleter::new(store, next.clone());

        completer.validate(
            &request(vec![pki::leaf_noaki()], missing_issuer())
        );
        let completed = next.last();
        // Both same-name intermediates, then the walk stops for lack of
        // a root in the store. The chain grew by two, not one.
        assert_eq!(completed.chain.len(), 3);
        assert!(completed.chain.contains(&pki::int_a()));
        assert!(completed.chain.contains(&pki::int_b()));
        assert!(completed.reported.is_empty());
    }

    #[test]
    fn completion_is_bounded_against_issuer_loops() {
        let (store, _file) = intermediate_store(
            &[pki::loop_x(), pki::loop_y()]
        );
        let next = Arc::new(Recorder::default());
        let completer = ChainCompleter::new(store, next.clone());

        completer.validate(&request(vec![pki::loop_x()], missing_issuer()));
        assert_eq!(
            next.last().chain.len(), 1 + MAX_COMPLETION_DEPTH
        );
    }

    #[test]
    fn failures_in_appended_certs_map_to_the_last_original_index() {
        let (store, _file) = intermediate_store(&[pki::int_a(), pki::root()]);
        let next = Arc::new(Recorder::default());
        *next.response.lock().unwrap() = Some(ValidationResponse::fail(
            None,
            vec![
                ReportedError::new("X509_V_ERR_CERT_HAS_EXPIRED", 2),
                ReportedError::new("X509_V_ERR_CERT_REVOKED", 0),
            ],
        ));
        let completer = ChainCompleter::new(store, next.clone());

        let response = completer.validate(
            &request(vec![pki::leaf()], missing_issuer())
        );
        assert_eq!(
            response.errors,
            [
                ReportedError::new("X509_V_ERR_CERT_HAS_EXPIRED", 0),
                ReportedError::new("X509_V_ERR_CERT_REVOKED", 0),
            ]
        );
    }

    //--- CachedValidator

    #[test]
    fn repeat_chains_hit_the_cache() {
        let next = Arc::new(Recorder::default());
        let cached = CachedValidator::new(
            8, Duration::from_secs(3600), next.clone()
        );

        let first = cached.validate(&request(vec![pki::leaf()], Vec::new()));
        assert!(first.pass);
        assert_eq!(next.calls(), 1);

        // Same chain under a different id: served from cache with the
        // new id.
        let mut repeat = (*request(vec![pki::leaf()], Vec::new())).clone();
        repeat.id = Some(99);
        let second = cached.validate(&Arc::new(repeat));
        assert!(second.pass);
        assert_eq!(second.id, Some(99));
        assert_eq!(next.calls(), 1);

        // A different chain misses.
        cached.validate(&request(vec![pki::other()], Vec::new()));
        assert_eq!(next.calls(), 2);
    }

    #[test]
    fn expired_entries_are_validated_anew() {
        let next = Arc::new(Recorder::default());
        let cached = CachedValidator::new(
            8, Duration::from_secs(3600), next.clone()
        );
        let req = request(vec![pki::leaf()], Vec::new());
        cached.validate(&req);
        cached.force_expire(&req.chain);
        cached.validate(&req);
        assert_eq!(next.calls(), 2);
    }

    #[test]
    fn cache_capacity_is_bounded() {
        let next = Arc::new(Recorder::default());
        let cached = CachedValidator::new(
            1, Duration::from_secs(3600), next.clone()
        );
        let one = request(vec![pki::leaf()], Vec::new());
        let two = request(vec![pki::other()], Vec::new());
        cached.validate(&one);
        cached.validate(&two);    // evicts one
        cached.validate(&one);    // miss again
        assert_eq!(next.calls(), 3);
    }
}
