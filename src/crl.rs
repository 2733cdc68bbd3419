//! The CRL cache.
//!
//! [`CrlCache`] keeps certificate revocation lists fetched from their
//! distribution-point URIs. Entries stay valid for a configured TTL; the
//! periodic [`refresh`][CrlCache::refresh] revalidates stale entries with a
//! conditional GET so an unchanged CRL costs only a 304. A stale entry that
//! cannot be revalidated is evicted rather than served indefinitely.
//! Failed fetches are never cached – revocation data that is unavailable
//! right now may well be available a second later.
//!
//! The cache is bounded: when a new entry would exceed the configured
//! capacity, the least-recently-used entry is dropped first. At most one
//! fetch per URI is in flight at any time.
//!
//! The full cache content can be written to a snapshot stream and loaded
//! back on startup, so a restart does not begin with an empty cache.

use std::io;
use std::collections::HashMap;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use x509_parser::prelude::FromDer;
use x509_parser::revocation_list::CertificateRevocationList;
use crate::http::{Fetch, FetchedBody};
use crate::utils::binio::{Compose, Parse};
use crate::utils::flight::FlightMap;
use crate::utils::sync::Mutex;


//------------ Configuration Constants ---------------------------------------

/// The tag identifying a CRL cache snapshot stream.
const SNAPSHOT_MAGIC: &[u8; 8] = b"cwrd-crl";

/// The snapshot format version we read and write.
const SNAPSHOT_VERSION: u8 = 1;


//------------ CrlCache ------------------------------------------------------

/// A bounded cache of CRLs keyed by distribution-point URI.
#[derive(Debug)]
pub struct CrlCache {
    /// The maximum number of entries kept.
    max_entries: usize,

    /// How long a fetched CRL is used before it needs revalidation.
    ttl: i64,

    /// The entries.
    entries: Mutex<Entries>,

    /// The fetches currently in flight.
    flights: FlightMap<String>,
}

impl CrlCache {
    /// Creates a new, empty cache.
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        CrlCache {
            max_entries,
            ttl: i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX),
            entries: Mutex::new(Entries::default()),
            flights: FlightMap::new(),
        }
    }

    /// Returns the CRL for the given distribution-point URI.
    ///
    /// Returns `None` if the CRL could not be fetched or did not parse.
    /// Such a failure is not remembered.
    pub fn get(&self, uri: &str, fetch: &dyn Fetch) -> Option<Arc<Bytes>> {
        if let Some(value) = self.lookup(uri) {
            return Some(value)
        }
        match self.flights.join(&String::from(uri)) {
            Some(_guard) => self.lead(uri, fetch),
            None => {
                // Someone else fetched while we waited. If the entry still
                // isn’t there, their fetch failed and so would ours.
                self.lookup(uri)
            }
        }
    }

    /// Fetches a CRL as the leader of its flight.
    ///
    /// The caller must hold the flight for the URI. The cache is checked
    /// once more first: the value may have arrived between the caller’s
    /// initial miss and it gaining the flight.
    fn lead(&self, uri: &str, fetch: &dyn Fetch) -> Option<Arc<Bytes>> {
        if let Some(value) = self.lookup(uri) {
            return Some(value)
        }
        // Fetch without holding the entries lock.
        let fetched = match fetch.get(uri) {
            Ok(fetched) => fetched,
            Err(_) => return None,
        };
        if !crl_parses(uri, &fetched.body) {
            return None
        }
        let value = Arc::new(fetched.body.clone());
        self.insert(
            String::from(uri),
            Entry::fresh(value.clone(), &fetched, self.ttl),
        );
        Some(value)
    }

    /// Revalidates stale entries.
    ///
    /// This is meant to run off the request path on the periodic refresh
    /// task. Each stale entry gets one conditional GET; a 304 extends its
    /// lifetime in place, a 200 replaces it, and anything else evicts it.
    /// No lock is held while a request is on the wire.
    pub fn refresh(&self, fetch: &dyn Fetch) {
        let now = Utc::now().timestamp();
        let stale: Vec<_> = {
            let entries = self.entries.lock();
            entries.map.iter().filter(|(_, entry)| {
                entry.stale_at <= now
            }).map(|(uri, entry)| {
                (uri.clone(), entry.last_modified, entry.etag.clone())
            }).collect()
        };
        for (uri, last_modified, etag) in stale {
            let last_modified = last_modified.and_then(|ts| {
                DateTime::from_timestamp(ts, 0)
            });
            let res = fetch.get_conditional(
                &uri, last_modified, etag.as_ref()
            );
            let mut entries = self.entries.lock();
            match res {
                Ok(None) => {
                    if let Some(entry) = entries.map.get_mut(&uri) {
                        entry.stale_at = Utc::now().timestamp() + self.ttl;
                    }
                }
                Ok(Some(fetched)) => {
                    if crl_parses(&uri, &fetched.body) {
                        if let Some(entry) = entries.map.get_mut(&uri) {
                            entry.replace(&fetched, self.ttl);
                        }
                    }
                    else {
                        entries.map.remove(&uri);
                    }
                }
                Err(_) => {
                    warn!("CRL {}: revalidation failed, dropping", uri);
                    entries.map.remove(&uri);
                }
            }
        }
        debug!("CRL cache: {} entries", self.entries.lock().map.len());
    }

    /// Returns the number of entries currently cached.
    pub fn len(&self) -> usize {
        self.entries.lock().map.len()
    }

    /// Returns whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().map.is_empty()
    }

    /// Returns a fresh cached value, updating its recency.
    fn lookup(&self, uri: &str) -> Option<Arc<Bytes>> {
        let now = Utc::now().timestamp();
        let mut entries = self.entries.lock();
        let counter = entries.next_use();
        let entry = entries.map.get_mut(uri)?;
        if entry.stale_at <= now {
            return None
        }
        entry.last_used = counter;
        Some(entry.value.clone())
    }

    /// Inserts an entry, evicting the least-recently-used one if necessary.
    fn insert(&self, uri: String, mut entry: Entry) {
        let mut entries = self.entries.lock();
        if !entries.map.contains_key(&uri)
            && entries.map.len() >= self.max_entries
        {
            entries.evict_lru();
        }
        entry.last_used = entries.next_use();
        entries.map.insert(uri, entry);
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
        for (uri, entry) in sorted {
            uri.compose(target)?;
            entry.value.compose(target)?;
            entry.fetched_at.compose(target)?;
            entry.stale_at.compose(target)?;
            entry.last_modified.compose(target)?;
            entry.etag.compose(target)?;
        }
        Ok(())
    }

    /// Loads entries from a snapshot stream.
    ///
    /// Entries are taken at face value; stale ones get picked up by the
    /// next refresh cycle. Returns the number of entries loaded.
    pub fn restore(
        &self, source: &mut impl io::Read
    ) -> Result<usize, io::Error> {
        let mut magic = [0u8; 8];
        source.read_exact(&mut magic)?;
        if magic != *SNAPSHOT_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData, "not a CRL cache snapshot"
            ))
        }
        let version = u8::parse(source)?;
        if version != SNAPSHOT_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported CRL snapshot version {}", version)
            ))
        }
        let count = usize::parse(source)?;
        for _ in 0..count {
            let uri = String::parse(source)?;
            let entry = Entry {
                value: Arc::new(Bytes::parse(source)?),
                fetched_at: i64::parse(source)?,
                stale_at: i64::parse(source)?,
                last_modified: Option::<i64>::parse(source)?,
                etag: Option::<Bytes>::parse(source)?,
                last_used: 0,
            };
            self.insert(uri, entry);
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

    /// Marks an entry as stale for refresh testing.
    #[cfg(test)]
    fn force_stale(&self, uri: &str) {
        if let Some(entry) = self.entries.lock().map.get_mut(uri) {
            entry.stale_at = Utc::now().timestamp() - 1;
        }
    }
}


//------------ Entries -------------------------------------------------------

/// The entry map plus the recency counter backing LRU eviction.
#[derive(Debug, Default)]
struct Entries {
    map: HashMap<String, Entry>,
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
        }).map(|(uri, _)| uri.clone());
        if let Some(uri) = lru {
            self.map.remove(&uri);
        }
    }
}


//------------ Entry ---------------------------------------------------------

/// A cached CRL.
#[derive(Debug)]
struct Entry {
    /// The DER encoding of the CRL.
    ///
    /// Shared so a 304 revalidation keeps the exact same allocation alive.
    value: Arc<Bytes>,

    /// When the value was fetched, as a Unix timestamp.
    fetched_at: i64,

    /// When the value needs revalidation, as a Unix timestamp.
    stale_at: i64,

    /// The origin’s Last-Modified time, if it sent one.
    last_modified: Option<i64>,

    /// The origin’s ETag, kept verbatim, if it sent one.
    etag: Option<Bytes>,

    /// The recency mark for LRU eviction.
    last_used: u64,
}

impl Entry {
    /// Creates an entry from a just-fetched body.
    fn fresh(value: Arc<Bytes>, fetched: &FetchedBody, ttl: i64) -> Self {
        let now = Utc::now().timestamp();
        Entry {
            value,
            fetched_at: now,
            stale_at: now + ttl,
            last_modified: fetched.last_modified.map(|dt| dt.timestamp()),
            etag: fetched.etag.clone(),
            last_used: 0,
        }
    }

    /// Replaces the value after a 200 revalidation.
    fn replace(&mut self, fetched: &FetchedBody, ttl: i64) {
        let now = Utc::now().timestamp();
        self.value = Arc::new(fetched.body.clone());
        self.fetched_at = now;
        self.stale_at = now + ttl;
        self.last_modified = fetched.last_modified.map(|dt| dt.timestamp());
        self.etag = fetched.etag.clone();
    }
}


//------------ Helpers -------------------------------------------------------

/// Checks that a fetched body is a parseable DER CRL.
fn crl_parses(uri: &str, body: &Bytes) -> bool {
    match CertificateRevocationList::from_der(body.as_ref()) {
        Ok(_) => true,
        Err(err) => {
            warn!("CRL {}: failed to parse: {}", uri, err);
            false
        }
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use crate::http::FetchError;
    use crate::test::pki;

    /// What `get_conditional` should answer.
    enum Conditional {
        NotModified,
        Replace(Bytes),
        Fail,
    }

    struct MockFetch {
        gets: AtomicUsize,
        conditionals: AtomicUsize,
        body: StdMutex<Option<Bytes>>,
        conditional: StdMutex<Conditional>,
        delay: Option<Duration>,
    }

    impl MockFetch {
        fn new(body: Option<Bytes>) -> Self {
            MockFetch {
                gets: AtomicUsize::new(0),
                conditionals: AtomicUsize::new(0),
                body: StdMutex::new(body),
                conditional: StdMutex::new(Conditional::Fail),
                delay: None,
            }
        }

        fn gets(&self) -> usize {
            self.gets.load(Ordering::SeqCst)
        }
    }

    impl Fetch for MockFetch {
        fn get(&self, _uri: &str) -> Result<FetchedBody, FetchError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                thread::sleep(delay)
            }
            match self.body.lock().unwrap().clone() {
                Some(body) => Ok(FetchedBody {
                    body,
                    last_modified: None,
                    etag: Some(Bytes::from_static(b"\"v1\"")),
                }),
                None => Err(FetchError),
            }
        }

        fn get_conditional(
            &self,
            _uri: &str,
            _last_modified: Option<DateTime<Utc>>,
            etag: Option<&Bytes>,
        ) -> Result<Option<FetchedBody>, FetchError> {
            self.conditionals.fetch_add(1, Ordering::SeqCst);
            // The stored validator must come back verbatim.
            assert_eq!(
                etag.map(AsRef::as_ref), Some(b"\"v1\"".as_ref())
            );
            match *self.conditional.lock().unwrap() {
                Conditional::NotModified => Ok(None),
                Conditional::Replace(ref body) => Ok(Some(FetchedBody {
                    body: body.clone(),
                    last_modified: None,
                    etag: Some(Bytes::from_static(b"\"v2\"")),
                })),
                Conditional::Fail => Err(FetchError),
            }
        }

        fn post_ocsp(
            &self, _uri: &str, _request: &[u8]
        ) -> Result<Bytes, FetchError> {
            unreachable!("CRL cache never speaks OCSP")
        }
    }

    const TTL: Duration = Duration::from_secs(3600);

    #[test]
    fn miss_fetches_then_hits() {
        let cache = CrlCache::new(8, TTL);
        let fetch = MockFetch::new(Some(pki::empty_crl()));
        let first = cache.get("http://crl.example/a", &fetch).unwrap();
        let second = cache.get("http://crl.example/a", &fetch).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(fetch.gets(), 1);
        assert_eq!(first.as_ref(), &pki::empty_crl());
    }

    #[test]
    fn failures_are_not_cached() {
        let cache = CrlCache::new(8, TTL);

        let fetch = MockFetch::new(None);
        assert!(cache.get("http://crl.example/a", &fetch).is_none());
        assert!(cache.get("http://crl.example/a", &fetch).is_none());
        assert_eq!(fetch.gets(), 2);

        // An unparseable body counts as a failure, too.
        let garbage = MockFetch::new(
            Some(Bytes::from_static(b"not a CRL"))
        );
        assert!(cache.get("http://crl.example/b", &garbage).is_none());
        assert!(cache.get("http://crl.example/b", &garbage).is_none());
        assert_eq!(garbage.gets(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn capacity_is_bounded_lru() {
        let cache = CrlCache::new(3, TTL);
        let fetch = MockFetch::new(Some(pki::empty_crl()));
        for uri in ["u1", "u2", "u3"] {
            cache.get(uri, &fetch).unwrap();
        }
        // Touch u1 so u2 becomes the least recently used.
        cache.get("u1", &fetch).unwrap();
        cache.get("u4", &fetch).unwrap();
        assert_eq!(cache.len(), 3);
        assert_eq!(fetch.gets(), 4);

        // u2 is gone and needs a new fetch, u1 is still cached.
        cache.get("u2", &fetch).unwrap();
        assert_eq!(fetch.gets(), 5);
        cache.get("u1", &fetch).unwrap();
        assert_eq!(fetch.gets(), 5);
    }

    #[test]
    fn refresh_not_modified_keeps_value() {
        let cache = CrlCache::new(8, TTL);
        let fetch = MockFetch::new(Some(pki::empty_crl()));
        let before = cache.get("u1", &fetch).unwrap();
        cache.force_stale("u1");

        *fetch.conditional.lock().unwrap() = Conditional::NotModified;
        cache.refresh(&fetch);
        assert_eq!(fetch.conditionals.load(Ordering::SeqCst), 1);

        // The very same allocation is served again, with no new fetch.
        let after = cache.get("u1", &fetch).unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(fetch.gets(), 1);
    }

    #[test]
    fn refresh_modified_replaces_value() {
        let cache = CrlCache::new(8, TTL);
        let fetch = MockFetch::new(Some(pki::empty_crl()));
        let before = cache.get("u1", &fetch).unwrap();
        cache.force_stale("u1");

        *fetch.conditional.lock().unwrap()
            = Conditional::Replace(pki::revoked_crl());
        cache.refresh(&fetch);

        let after = cache.get("u1", &fetch).unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.as_ref(), &pki::revoked_crl());
        assert_eq!(fetch.gets(), 1);
    }

    #[test]
    fn refresh_failure_evicts() {
        let cache = CrlCache::new(8, TTL);
        let fetch = MockFetch::new(Some(pki::empty_crl()));
        cache.get("u1", &fetch).unwrap();
        cache.force_stale("u1");

        cache.refresh(&fetch);
        assert!(cache.is_empty());

        // The next get has to fetch anew.
        cache.get("u1", &fetch).unwrap();
        assert_eq!(fetch.gets(), 2);
    }

    #[test]
    fn refresh_skips_fresh_entries() {
        let cache = CrlCache::new(8, TTL);
        let fetch = MockFetch::new(Some(pki::empty_crl()));
        cache.get("u1", &fetch).unwrap();
        cache.refresh(&fetch);
        assert_eq!(fetch.conditionals.load(Ordering::SeqCst), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn single_flight_per_uri() {
        let cache = Arc::new(CrlCache::new(8, TTL));
        let mut fetch = MockFetch::new(Some(pki::empty_crl()));
        fetch.delay = Some(Duration::from_millis(50));
        let fetch = Arc::new(fetch);

        let handles: Vec<_> = (0..4).map(|_| {
            let cache = cache.clone();
            let fetch = fetch.clone();
            thread::spawn(move || {
                cache.get("u1", fetch.as_ref()).is_some()
            })
        }).collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert_eq!(fetch.gets(), 1);
    }

    #[test]
    fn flight_leaders_recheck_the_cache_first() {
        let cache = CrlCache::new(8, TTL);
        let fetch = MockFetch::new(Some(pki::empty_crl()));
        let before = cache.get("u1", &fetch).unwrap();

        // A thread whose initial lookup missed but that gained the
        // flight only after another thread completed the whole fetch
        // must serve the cached value instead of fetching again.
        let _guard = cache.flights.join(&String::from("u1")).unwrap();
        let after = cache.lead("u1", &fetch).unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(fetch.gets(), 1);
    }

    #[test]
    fn snapshot_round_trip() {
        let cache = CrlCache::new(8, TTL);
        let fetch = MockFetch::new(Some(pki::empty_crl()));
        let before = cache.get("u1", &fetch).unwrap();
        cache.get("u2", &fetch).unwrap();

        let mut stream = Vec::new();
        cache.snapshot(&mut stream).unwrap();

        let restored = CrlCache::new(8, TTL);
        assert_eq!(
            restored.restore(&mut stream.as_slice()).unwrap(), 2
        );

        // Both entries serve without any network traffic.
        let broken = MockFetch::new(None);
        let after = restored.get("u1", &broken).unwrap();
        assert_eq!(before.as_ref(), after.as_ref());
        assert!(restored.get("u2", &broken).is_some());
        assert_eq!(broken.gets(), 0);
    }

    #[test]
    fn snapshot_restore_in_background() {
        let cache = CrlCache::new(8, TTL);
        let fetch = MockFetch::new(Some(pki::empty_crl()));
        cache.get("u1", &fetch).unwrap();
        let mut stream = Vec::new();
        cache.snapshot(&mut stream).unwrap();

        let restored = Arc::new(CrlCache::new(8, TTL));
        let rx = restored.spawn_restore(io::Cursor::new(stream));
        assert_eq!(rx.recv().unwrap().unwrap(), 1);
        assert_eq!(restored.len(), 1);
    }

    #[test]
    fn foreign_snapshots_are_rejected() {
        let cache = CrlCache::new(8, TTL);
        assert!(cache.restore(&mut b"not a snapshot".as_ref()).is_err());

        let mut bad_version = SNAPSHOT_MAGIC.to_vec();
        bad_version.push(SNAPSHOT_VERSION + 1);
        assert!(cache.restore(&mut bad_version.as_slice()).is_err());
        assert!(cache.is_empty());
    }
}
