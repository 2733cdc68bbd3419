//! The file-backed certificate stores.
//!
//! Two stores follow the same refresh contract: [`IntermediateStore`] holds
//! intermediate CA certificates used to complete chains the client sent
//! incomplete, and [`PinnedStore`] holds certificates that are trusted
//! unconditionally.
//!
//! Both are backed by a PEM bundle file. `refresh` checks the file’s
//! modification time and, only if it changed, re-parses the file wholesale
//! and swaps the in-memory index atomically. A missing or unreadable file
//! makes the store empty – chain completion simply finds nothing and
//! pinning never matches – which is the safe direction for both. Lookups
//! never touch the file system; they only read the current snapshot.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use bytes::Bytes;
use log::{debug, warn};
use crate::cert::Cert;
use crate::utils::sync::{Mutex, RwLock};


//------------ IntermediateStore ---------------------------------------------

/// A refreshable index of intermediate CA certificates.
///
/// The index is keyed by the raw subject name. Multiple non-identical
/// certificates sharing a subject name – cross-signed or reissued CAs –
/// are all kept.
#[derive(Debug)]
pub struct IntermediateStore {
    /// The backing PEM bundle. If `None`, the store stays empty.
    path: Option<PathBuf>,

    /// The modification time of the file at the last reload.
    ///
    /// Also serializes concurrent `refresh` calls.
    loaded: Mutex<Option<SystemTime>>,

    /// The current index snapshot.
    current: RwLock<Arc<HashMap<Bytes, Vec<Cert>>>>,
}

impl IntermediateStore {
    /// Creates a store backed by the given file.
    ///
    /// The store is empty until the first call to `refresh`.
    pub fn new(path: Option<PathBuf>) -> Self {
        IntermediateStore {
            path,
            loaded: Mutex::new(None),
            current: RwLock::new(Default::default()),
        }
    }

    /// Reloads the backing file if it changed.
    pub fn refresh(&self) {
        let path = match self.path.as_ref() {
            Some(path) => path,
            None => return,
        };
        let mut loaded = self.loaded.lock();
        match file_changed(path, &loaded) {
            FileState::Unchanged => return,
            FileState::Missing => {
                *loaded = None;
                *self.current.write() = Default::default();
            }
            FileState::Changed(mtime) => {
                let mut map: HashMap<Bytes, Vec<Cert>> = HashMap::new();
                let mut len = 0;
                for cert in load_pem_certs(path) {
                    let list = map.entry(cert.subject().clone()).or_default();
                    if !list.contains(&cert) {
                        list.push(cert);
                        len += 1;
                    }
                }
                debug!(
                    "intermediate store: loaded {} certificates from {}",
                    len, path.display()
                );
                *loaded = Some(mtime);
                *self.current.write() = Arc::new(map);
            }
        }
    }

    /// Returns the certificates that could have issued the given one.
    ///
    /// Candidates are matched by subject name against the given
    /// certificate’s issuer name. If the certificate carries an authority
    /// key identifier and any candidate’s subject key identifier matches
    /// it exactly, only those candidates are returned. Otherwise all
    /// same-name candidates are returned, which may be ambiguous.
    pub fn find_issuers(&self, cert: &Cert) -> Vec<Cert> {
        let current = self.current.read().clone();
        let candidates = match current.get(cert.issuer()) {
            Some(candidates) => candidates,
            None => return Vec::new(),
        };
        if let Some(aki) = cert.aki() {
            let exact: Vec<_> = candidates.iter().filter(|candidate| {
                candidate.ski() == Some(aki)
            }).cloned().collect();
            if !exact.is_empty() {
                return exact
            }
        }
        candidates.clone()
    }

    /// Returns the number of certificates currently in the store.
    pub fn len(&self) -> usize {
        self.current.read().values().map(Vec::len).sum()
    }

    /// Returns whether the store is currently empty.
    pub fn is_empty(&self) -> bool {
        self.current.read().is_empty()
    }
}


//------------ PinnedStore ---------------------------------------------------

/// A refreshable set of unconditionally trusted certificates.
///
/// Membership is by byte-identical DER encoding. Before the first refresh,
/// and whenever the backing file is missing or unreadable, the set is empty:
/// a certificate that cannot be proven pinned simply goes through regular
/// validation.
#[derive(Debug)]
pub struct PinnedStore {
    /// The backing PEM bundle. If `None`, the store stays empty.
    path: Option<PathBuf>,

    /// The modification time of the file at the last reload.
    loaded: Mutex<Option<SystemTime>>,

    /// The current snapshot of pinned DER encodings.
    current: RwLock<Arc<HashSet<Bytes>>>,
}

impl PinnedStore {
    /// Creates a store backed by the given file.
    pub fn new(path: Option<PathBuf>) -> Self {
        PinnedStore {
            path,
            loaded: Mutex::new(None),
            current: RwLock::new(Default::default()),
        }
    }

    /// Reloads the backing file if it changed.
    pub fn refresh(&self) {
        let path = match self.path.as_ref() {
            Some(path) => path,
            None => return,
        };
        let mut loaded = self.loaded.lock();
        match file_changed(path, &loaded) {
            FileState::Unchanged => return,
            FileState::Missing => {
                *loaded = None;
                *self.current.write() = Default::default();
            }
            FileState::Changed(mtime) => {
                let set: HashSet<Bytes> = load_pem_certs(path).into_iter()
                    .map(|cert| cert.der().clone())
                    .collect();
                debug!(
                    "pinned store: loaded {} certificates from {}",
                    set.len(), path.display()
                );
                *loaded = Some(mtime);
                *self.current.write() = Arc::new(set);
            }
        }
    }

    /// Returns whether a certificate with this DER encoding is pinned.
    pub fn contains(&self, der: &Bytes) -> bool {
        self.current.read().contains(der)
    }

    /// Returns the number of pinned certificates.
    pub fn len(&self) -> usize {
        self.current.read().len()
    }

    /// Returns whether the store is currently empty.
    pub fn is_empty(&self) -> bool {
        self.current.read().is_empty()
    }
}


//------------ Helpers -------------------------------------------------------

/// The state of the backing file relative to the last load.
enum FileState {
    Unchanged,
    Missing,
    Changed(SystemTime),
}

/// Determines whether the backing file needs to be re-read.
fn file_changed(path: &Path, loaded: &Option<SystemTime>) -> FileState {
    let mtime = match fs::metadata(path).and_then(|meta| meta.modified()) {
        Ok(mtime) => mtime,
        Err(err) => {
            if loaded.is_some() {
                warn!(
                    "certificate store {} became unreadable: {}",
                    path.display(), err
                );
            }
            return FileState::Missing
        }
    };
    if *loaded == Some(mtime) {
        FileState::Unchanged
    }
    else {
        FileState::Changed(mtime)
    }
}

/// Loads all certificates from a PEM bundle.
///
/// A file that cannot be read or parsed results in an empty list – store
/// corruption must never propagate into request handling. Individual
/// undecodable certificates are skipped with a warning.
fn load_pem_certs(path: &Path) -> Vec<Cert> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(err) => {
            warn!("failed to open {}: {}", path.display(), err);
            return Vec::new()
        }
    };
    let der_list = match rustls_pemfile::certs(
        &mut io::BufReader::new(file)
    ) {
        Ok(list) => list,
        Err(err) => {
            warn!("failed to read {}: {}", path.display(), err);
            return Vec::new()
        }
    };
    let mut res = Vec::with_capacity(der_list.len());
    for der in der_list {
        match Cert::decode(der.into()) {
            Ok(cert) => res.push(cert),
            Err(err) => {
                warn!(
                    "skipping undecodable certificate in {}: {}",
                    path.display(), err
                );
            }
        }
    }
    res
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;
    use crate::test::pki;

    fn write_bundle(certs: &[Cert]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for cert in certs {
            writeln!(file, "{}", cert.to_pem()).unwrap();
        }
        file.flush().unwrap();
        file
    }

    /// Forces the next refresh to re-read the file.
    ///
    /// The file system’s mtime granularity is too coarse for tests that
    /// rewrite the backing file back to back.
    fn force_reload(loaded: &Mutex<Option<SystemTime>>) {
        *loaded.lock() = None;
    }

    #[test]
    fn intermediate_lookup() {
        let bundle = write_bundle(&[pki::int_a(), pki::int_b(), pki::root()]);
        let store = IntermediateStore::new(
            Some(bundle.path().to_path_buf())
        );
        assert!(store.is_empty());
        store.refresh();
        assert_eq!(store.len(), 3);

        // The leaf has an AKI matching int-a only.
        assert_eq!(store.find_issuers(&pki::leaf()), [pki::int_a()]);

        // Without an AKI both same-name intermediates come back.
        let ambiguous = store.find_issuers(&pki::leaf_noaki());
        assert_eq!(ambiguous.len(), 2);
        assert!(ambiguous.contains(&pki::int_a()));
        assert!(ambiguous.contains(&pki::int_b()));

        // Nothing matches an unknown issuer.
        assert!(store.find_issuers(&pki::other()).is_empty());
    }

    #[test]
    fn refresh_is_mtime_gated_and_swaps_wholesale() {
        let bundle = write_bundle(&[pki::int_a()]);
        let store = IntermediateStore::new(
            Some(bundle.path().to_path_buf())
        );
        store.refresh();
        assert_eq!(store.len(), 1);

        // Same mtime: refresh is a no-op even though we check again.
        store.refresh();
        assert_eq!(store.len(), 1);

        // Replace the content and force a reload: old entries are gone.
        let mut file = fs::File::create(bundle.path()).unwrap();
        writeln!(file, "{}", pki::int_b().to_pem()).unwrap();
        drop(file);
        force_reload(&store.loaded);
        store.refresh();
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.find_issuers(&pki::leaf_noaki()), [pki::int_b()]
        );
    }

    #[test]
    fn missing_file_means_empty_store() {
        let store = IntermediateStore::new(
            Some(PathBuf::from("/nonexistent/certward/test"))
        );
        store.refresh();
        assert!(store.is_empty());
        assert!(store.find_issuers(&pki::leaf()).is_empty());
    }

    #[test]
    fn pinned_membership() {
        let bundle = write_bundle(&[pki::leaf(), pki::expired()]);
        let store = PinnedStore::new(Some(bundle.path().to_path_buf()));
        assert!(!store.contains(pki::leaf().der()));
        store.refresh();
        assert_eq!(store.len(), 2);
        assert!(store.contains(pki::leaf().der()));
        assert!(store.contains(pki::expired().der()));
        assert!(!store.contains(pki::other().der()));
    }

    #[test]
    fn pinned_garbage_file_fails_open() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"this is not PEM at all\n").unwrap();
        file.flush().unwrap();
        let store = PinnedStore::new(Some(file.path().to_path_buf()));
        store.refresh();
        assert!(store.is_empty());
    }
}
