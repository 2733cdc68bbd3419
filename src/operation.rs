//! What certward can do for you.
//!
//! This module implements all the commands users can ask certward to
//! perform. They are encapsulated in the type [`Operation`] which can
//! determine the command from the command line arguments and then execute
//! it.

use std::{fs, io, thread};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc;
use clap::{Args, ArgMatches, FromArgMatches, Parser};
use log::{error, info, warn};
use tempfile::NamedTempFile;
use crate::cert::Cert;
use crate::config::{Config, RunMode};
use crate::crl::CrlCache;
use crate::engine::{BundleEngine, CacheRevocation, PathEngine};
use crate::error::{ExitError, Failed};
use crate::http::{Fetch, HttpClient};
use crate::ocsp::OcspCache;
use crate::proto::{ResponseWriter, ValidationRequest};
use crate::server::Dispatcher;
use crate::store::{IntermediateStore, PinnedStore};
use crate::validate::{standard_chain, Validator};


//------------ Constants -----------------------------------------------------

/// The file name of the CRL cache snapshot within the state directory.
const CRL_SNAPSHOT_FILE: &str = "crl.snapshot";

/// The file name of the OCSP cache snapshot within the state directory.
const OCSP_SNAPSHOT_FILE: &str = "ocsp.snapshot";


//------------ Operation -----------------------------------------------------

/// The command to execute.
///
/// This type collects all the commands we have defined plus any possible
/// extra configuration they support.
///
/// You can create a value from the command line arguments. First, you add
/// all necessary sub-commands and arguments to a clap `Command` via
/// [`config_args`] and then process the argument matches into a value in
/// [`from_arg_matches`]. Finally, you can execute the created command
/// through the [`run`] method.
///
/// [`config_args`]: #method.config_args
/// [`from_arg_matches`]: #method.from_arg_matches
/// [`run`]: #method.run
pub enum Operation {
    Server(Server),
    Check(Check),
}

impl Operation {
    /// Adds the command configuration to a clap app.
    pub fn config_args(app: clap::Command) -> clap::Command {
        let app = Server::config_args(app);
        Check::config_args(app)
    }

    /// Creates a command from clap matches.
    pub fn from_arg_matches(
        matches: &ArgMatches,
        cur_dir: &Path,
    ) -> Result<Self, Failed> {
        Ok(match matches.subcommand() {
            Some(("server", matches)) => {
                Operation::Server(Server::from_arg_matches(matches)?)
            }
            Some(("check", matches)) => {
                Operation::Check(Check::from_arg_matches(matches, cur_dir)?)
            }
            _ => {
                error!(
                    "Failed: a command is required.\n\
                     \nAvailable commands are:\
                     \n   server  Serve validation requests over \
                                  stdin and stdout\
                     \n   check   Validate a single PEM chain file\
                     \n\
                     \nSee certward -h for a usage summary."
                );
                return Err(Failed)
            }
        })
    }

    /// Runs the command.
    pub fn run(self, config: Config) -> Result<(), ExitError> {
        config.init_logging()?;
        match self {
            Operation::Server(cmd) => cmd.run(config),
            Operation::Check(cmd) => cmd.run(config),
        }
    }
}


//------------ Server --------------------------------------------------------

/// Serve validation requests over stdin and stdout.
pub struct Server;

impl Server {
    /// Adds the command configuration to a clap app.
    pub fn config_args(app: clap::Command) -> clap::Command {
        app.subcommand(
            clap::Command::new("server")
                .about("Serves validation requests over stdin and stdout")
        )
    }

    /// Creates a command from clap matches.
    pub fn from_arg_matches(_matches: &ArgMatches) -> Result<Self, Failed> {
        Ok(Server)
    }

    /// Runs the helper until the input is exhausted.
    ///
    /// Cache snapshots are restored from the state directory in the
    /// background at startup and written back after a clean shutdown.
    pub fn run(self, config: Config) -> Result<(), ExitError> {
        let (validator, caches) = build_validator(&config)?;

        let mut restores = Vec::new();
        if let Some(dir) = config.state_dir.as_deref() {
            if let Some(rx) = start_restore(
                dir.join(CRL_SNAPSHOT_FILE), &caches.crl
            ) {
                restores.push(("CRL", rx));
            }
            if let Some(rx) = start_restore_ocsp(
                dir.join(OCSP_SNAPSHOT_FILE), &caches.ocsp
            ) {
                restores.push(("OCSP", rx));
            }
        }

        caches.spawn_refresh(config.refresh);

        info!("Serving in {} mode.", config.mode);
        let concurrent = config.mode == RunMode::Concurrent;
        Dispatcher::new(validator, concurrent)
            .run(io::stdin().lock(), io::stdout())?;

        // Make sure a still running restore cannot race the save below.
        for (name, rx) in restores {
            match rx.recv() {
                Ok(Ok(count)) => {
                    info!("Restored {} {} cache entries.", count, name)
                }
                Ok(Err(err)) => {
                    warn!("Failed to restore the {} cache: {}", name, err)
                }
                Err(_) => {
                    warn!("Failed to restore the {} cache.", name)
                }
            }
        }
        if let Some(dir) = config.state_dir.as_deref() {
            save_snapshots(dir, &caches);
        }
        Ok(())
    }
}


//------------ Check ---------------------------------------------------------

/// Validate a single chain from a PEM file.
#[derive(Clone, Debug, Parser)]
pub struct Check {
    /// The PEM file with the chain to check, leaf first
    #[arg(value_name = "CHAIN")]
    chain: PathBuf,

    /// The host name to attribute the check to
    #[arg(long, value_name = "NAME", default_value = "check")]
    host: String,
}

impl Check {
    /// Adds the command configuration to a clap app.
    pub fn config_args(app: clap::Command) -> clap::Command {
        app.subcommand(
            Check::augment_args(
                clap::Command::new("check")
                    .about("Validates a single PEM chain file")
            )
        )
    }

    /// Creates a command from clap matches.
    pub fn from_arg_matches(
        matches: &ArgMatches,
        cur_dir: &Path,
    ) -> Result<Self, Failed> {
        let mut res = <Check as FromArgMatches>::from_arg_matches(
            matches
        ).expect("bug in command line arguments parser");
        res.chain = cur_dir.join(&res.chain);
        Ok(res)
    }

    /// Validates the chain and reports the outcome.
    ///
    /// The result is written in the response record format. The exit
    /// status is 2 for a chain that did not validate.
    pub fn run(self, config: Config) -> Result<(), ExitError> {
        let chain = load_chain(&self.chain)?;
        let (validator, _caches) = build_validator(&config)?;
        let request = Arc::new(ValidationRequest {
            id: None,
            host: self.host,
            protocol_version: String::new(),
            cipher_suite: String::new(),
            chain,
            reported: Vec::new(),
        });
        let response = validator.validate(&request);
        let mut stdout = io::stdout();
        if let Err(err) = ResponseWriter::new(
            &mut stdout, false
        ).write(&response) {
            error!("Failed to write result: {}", err);
            return Err(ExitError::Generic)
        }
        if response.pass {
            Ok(())
        }
        else {
            Err(ExitError::Invalid)
        }
    }
}


//------------ Caches --------------------------------------------------------

/// The long-lived parts behind the validator chain.
struct Caches {
    intermediates: Arc<IntermediateStore>,
    pinned: Arc<PinnedStore>,
    crl: Arc<CrlCache>,
    ocsp: Arc<OcspCache>,
    fetch: Arc<dyn Fetch>,
}

impl Caches {
    /// Spawns the background thread driving store and cache refresh.
    fn spawn_refresh(&self, interval: std::time::Duration) {
        let intermediates = self.intermediates.clone();
        let pinned = self.pinned.clone();
        let crl = self.crl.clone();
        let ocsp = self.ocsp.clone();
        let fetch = self.fetch.clone();
        thread::spawn(move || {
            loop {
                thread::sleep(interval);
                intermediates.refresh();
                pinned.refresh();
                crl.refresh(fetch.as_ref());
                ocsp.refresh();
            }
        });
    }
}


//------------ Helper Functions ----------------------------------------------

/// Wires the full validator chain from the configuration.
fn build_validator(
    config: &Config
) -> Result<(impl Validator, Caches), Failed> {
    let crl = Arc::new(CrlCache::new(config.crl_cache_size, config.crl_ttl));
    let ocsp = Arc::new(OcspCache::new(
        config.ocsp_cache_size,
        config.ocsp_success_max_age,
        config.ocsp_error_max_age,
    ));
    let fetch: Arc<dyn Fetch> = Arc::new(HttpClient::new(config)?);
    let intermediates = Arc::new(
        IntermediateStore::new(config.intermediates_file.clone())
    );
    let pinned = Arc::new(PinnedStore::new(config.pinned_file.clone()));
    intermediates.refresh();
    pinned.refresh();

    let revocation = Arc::new(CacheRevocation::new(
        crl.clone(), ocsp.clone(), fetch.clone()
    ));
    let engine: Arc<dyn PathEngine> = Arc::new(BundleEngine::new(
        &config.ca_bundle, revocation, config.hard_fail
    )?);
    let validator = standard_chain(
        pinned.clone(),
        intermediates.clone(),
        engine,
        config.result_cache_size,
        config.result_cache_ttl,
    );
    Ok((validator, Caches { intermediates, pinned, crl, ocsp, fetch }))
}

/// Loads a leaf-first certificate chain from a PEM file.
fn load_chain(path: &Path) -> Result<Vec<Cert>, Failed> {
    let file = fs::File::open(path).map_err(|err| {
        error!("Failed to open chain file {}: {}", path.display(), err);
        Failed
    })?;
    let der_list = rustls_pemfile::certs(
        &mut io::BufReader::new(file)
    ).map_err(|err| {
        error!("Failed to read chain file {}: {}", path.display(), err);
        Failed
    })?;
    if der_list.is_empty() {
        error!("Chain file {} contains no certificates.", path.display());
        return Err(Failed)
    }
    der_list.into_iter().map(|der| {
        Cert::decode(der.into()).map_err(|err| {
            error!(
                "Undecodable certificate in {}: {}", path.display(), err
            );
            Failed
        })
    }).collect()
}

/// Starts restoring the CRL cache from a snapshot file if one exists.
fn start_restore(
    path: PathBuf, cache: &Arc<CrlCache>
) -> Option<mpsc::Receiver<Result<usize, io::Error>>> {
    match fs::File::open(&path) {
        Ok(file) => Some(cache.spawn_restore(file)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => None,
        Err(err) => {
            warn!(
                "Failed to open snapshot {}: {}", path.display(), err
            );
            None
        }
    }
}

/// Starts restoring the OCSP cache from a snapshot file if one exists.
fn start_restore_ocsp(
    path: PathBuf, cache: &Arc<OcspCache>
) -> Option<mpsc::Receiver<Result<usize, io::Error>>> {
    match fs::File::open(&path) {
        Ok(file) => Some(cache.spawn_restore(file)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => None,
        Err(err) => {
            warn!(
                "Failed to open snapshot {}: {}", path.display(), err
            );
            None
        }
    }
}

/// Writes both cache snapshots into the state directory.
///
/// Snapshots are written to a temporary file first and moved into place,
/// so a crash mid-write never leaves a truncated snapshot behind. Failures
/// are logged but do not change the exit status; the helper did its job.
fn save_snapshots(dir: &Path, caches: &Caches) {
    if let Err(err) = fs::create_dir_all(dir) {
        error!(
            "Failed to create state directory {}: {}", dir.display(), err
        );
        return
    }
    save_snapshot(dir, CRL_SNAPSHOT_FILE, |target| {
        caches.crl.snapshot(target)
    });
    save_snapshot(dir, OCSP_SNAPSHOT_FILE, |target| {
        caches.ocsp.snapshot(target)
    });
}

/// Writes one snapshot file atomically.
fn save_snapshot(
    dir: &Path,
    name: &str,
    write: impl FnOnce(&mut NamedTempFile) -> Result<(), io::Error>,
) {
    let mut tmp = match NamedTempFile::new_in(dir) {
        Ok(tmp) => tmp,
        Err(err) => {
            error!(
                "Failed to create snapshot file in {}: {}",
                dir.display(), err
            );
            return
        }
    };
    if let Err(err) = write(&mut tmp) {
        error!("Failed to write snapshot {}: {}", name, err);
        return
    }
    if let Err(err) = tmp.persist(dir.join(name)) {
        error!("Failed to persist snapshot {}: {}", name, err);
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;
    use crate::test::pki;

    #[test]
    fn load_chain_reads_leaf_first() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{}", pki::leaf().to_pem()).unwrap();
        writeln!(file, "{}", pki::int_a().to_pem()).unwrap();
        file.flush().unwrap();
        let chain = load_chain(file.path()).unwrap();
        assert_eq!(chain, [pki::leaf(), pki::int_a()]);
    }

    #[test]
    fn load_chain_rejects_empty_and_missing_files() {
        let file = NamedTempFile::new().unwrap();
        assert!(load_chain(file.path()).is_err());
        assert!(load_chain(Path::new("/nonexistent/chain.pem")).is_err());
    }
}
