//! Configuration.
//!
//! This module primarily contains the type [`Config`] that holds all the
//! configuration used by certward. It can be loaded both from a TOML
//! formatted config file and command line options.

use std::{env, fmt, fs, io};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use clap::{
    Command, Args, ArgAction, ArgMatches, FromArgMatches, Parser,
    crate_version,
};
use log::{LevelFilter, error};
use crate::error::Failed;


//------------ Defaults for Some Values --------------------------------------

/// The default dispatch mode.
const DEFAULT_MODE: RunMode = RunMode::Sequential;

/// The default CA bundle location.
const DEFAULT_CA_BUNDLE: &str = "/etc/ssl/certs/ca-certificates.crt";

/// The default maximum number of CRL cache entries.
const DEFAULT_CRL_CACHE_SIZE: usize = 256;

/// The default CRL time-to-live in seconds.
const DEFAULT_CRL_TTL: u64 = 3600;

/// The default maximum number of OCSP cache entries.
const DEFAULT_OCSP_CACHE_SIZE: usize = 1024;

/// The default maximum age of a successful OCSP answer in seconds.
const DEFAULT_OCSP_SUCCESS_MAX_AGE: u64 = 3600;

/// The default maximum age of an OCSP responder error in seconds.
const DEFAULT_OCSP_ERROR_MAX_AGE: u64 = 300;

/// The default maximum number of cached verdicts.
const DEFAULT_RESULT_CACHE_SIZE: usize = 1024;

/// The default verdict time-to-live in seconds.
const DEFAULT_RESULT_CACHE_TTL: u64 = 600;

/// The default background refresh interval in seconds.
const DEFAULT_REFRESH: u64 = 60;

/// The default for the HTTP request timeout.
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// The default HTTP User Agent header value to send.
const DEFAULT_HTTP_USER_AGENT: &str = concat!("certward/", crate_version!());


//------------ Config --------------------------------------------------------

/// Certward configuration.
///
/// This type contains both the basic configuration of the helper, such as
/// where to find the CA bundle and the hot-reloadable stores, as well as
/// the cache tuning for server mode.
///
/// All values are public and can be accessed directly.
///
/// The function [`config_args`] can be used to create the clap application.
/// Its matches can then be turned into a config via [`from_arg_matches`].
/// The method [`init_logging`] configures logging according to the strategy
/// provided by the configuration.
///
/// [`config_args`]: #method.config_args
/// [`from_arg_matches`]: #method.from_arg_matches
/// [`init_logging`]: #method.init_logging
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    /// Whether requests are processed sequentially or concurrently.
    pub mode: RunMode,

    /// Path to the CA bundle holding the trust anchors.
    ///
    /// The bundle is loaded once at startup. An unreadable or empty bundle
    /// is a startup error since without anchors nothing can ever validate.
    pub ca_bundle: PathBuf,

    /// Path to the hot-reloadable intermediate certificate file.
    pub intermediates_file: Option<PathBuf>,

    /// Path to the hot-reloadable pinned certificate file.
    pub pinned_file: Option<PathBuf>,

    /// The maximum number of CRL cache entries.
    pub crl_cache_size: usize,

    /// How long a fetched CRL counts as fresh.
    pub crl_ttl: Duration,

    /// The maximum number of OCSP cache entries.
    pub ocsp_cache_size: usize,

    /// The maximum age of a cached successful OCSP answer.
    ///
    /// The effective expiry is the tighter of this and the `nextUpdate`
    /// time of the response itself.
    pub ocsp_success_max_age: Duration,

    /// The maximum age of a cached OCSP responder error.
    pub ocsp_error_max_age: Duration,

    /// The maximum number of cached validation verdicts.
    pub result_cache_size: usize,

    /// How long a cached verdict stays valid.
    pub result_cache_ttl: Duration,

    /// The interval between background refresh runs.
    pub refresh: Duration,

    /// Whether unavailable revocation data fails a certificate.
    pub hard_fail: bool,

    /// The directory to keep cache snapshots in.
    ///
    /// If this is `None`, caches start empty and are not persisted.
    pub state_dir: Option<PathBuf>,

    /// The HTTP User Agent to send on revocation fetches.
    pub http_user_agent: String,

    /// Optional timeout for connecting to an origin server.
    pub http_connect_timeout: Option<Duration>,

    /// Optional timeout for a whole HTTP request.
    ///
    /// If this is `None`, no timeout is set.
    pub http_timeout: Option<Duration>,

    /// The maximum log level.
    pub log_level: LevelFilter,

    /// The target to log to.
    pub log_target: LogTarget,
}

impl Config {
    /// Adds the basic arguments to a clap app.
    ///
    /// The function follows clap’s builder pattern: it takes an app,
    /// adds a bunch of arguments to it and returns it at the end.
    pub fn config_args(app: Command) -> Command {
        GlobalArgs::augment_args(app)
    }

    /// Creates a configuration from command line matches.
    ///
    /// The function attempts to create configuration from the command line
    /// arguments provided via `matches`. It will try to read a config file
    /// if provided via the config file option (`-c` or `--config`) and
    /// starts with a default configuration otherwise.
    ///
    /// All relative paths given in command line arguments will be
    /// interpreted relative to `cur_dir`. Conversely, paths in the config
    /// file are treated as relative to the config file’s directory.
    pub fn from_arg_matches(
        matches: &ArgMatches,
        cur_dir: &Path,
    ) -> Result<Self, Failed> {
        let mut res = Self::create_base_config(
            Self::path_value_of(matches, "config", cur_dir)
                .as_ref().map(AsRef::as_ref)
        )?;

        res.apply_arg_matches(matches, cur_dir)?;

        Ok(res)
    }

    /// Applies the basic command line arguments to a configuration.
    ///
    /// The path arguments in `matches` will be interpreted relative to
    /// `cur_dir`.
    #[allow(clippy::cognitive_complexity)]
    fn apply_arg_matches(
        &mut self,
        matches: &ArgMatches,
        cur_dir: &Path,
    ) -> Result<(), Failed> {
        let args = GlobalArgs::from_arg_matches(
            matches
        ).expect("bug in command line arguments parser");

        // mode
        if let Some(value) = args.mode {
            self.mode = value
        }

        // ca_bundle
        if let Some(path) = args.ca_bundle {
            self.ca_bundle = cur_dir.join(path)
        }

        // intermediates_file
        if let Some(path) = args.intermediates {
            self.intermediates_file = Some(cur_dir.join(path))
        }

        // pinned_file
        if let Some(path) = args.pinned {
            self.pinned_file = Some(cur_dir.join(path))
        }

        // crl_cache_size
        if let Some(value) = args.crl_cache_size {
            self.crl_cache_size = value
        }

        // crl_ttl
        if let Some(value) = args.crl_ttl {
            self.crl_ttl = Duration::from_secs(value)
        }

        // ocsp_cache_size
        if let Some(value) = args.ocsp_cache_size {
            self.ocsp_cache_size = value
        }

        // ocsp_success_max_age
        if let Some(value) = args.ocsp_success_max_age {
            self.ocsp_success_max_age = Duration::from_secs(value)
        }

        // ocsp_error_max_age
        if let Some(value) = args.ocsp_error_max_age {
            self.ocsp_error_max_age = Duration::from_secs(value)
        }

        // result_cache_size
        if let Some(value) = args.result_cache_size {
            self.result_cache_size = value
        }

        // result_cache_ttl
        if let Some(value) = args.result_cache_ttl {
            self.result_cache_ttl = Duration::from_secs(value)
        }

        // refresh
        if let Some(value) = args.refresh {
            self.refresh = Duration::from_secs(value)
        }

        // hard_fail
        if args.hard_fail {
            self.hard_fail = true
        }

        // state_dir
        if let Some(path) = args.state_dir {
            self.state_dir = Some(cur_dir.join(path))
        }

        // http_connect_timeout
        if let Some(value) = args.http_connect_timeout {
            self.http_connect_timeout = Some(Duration::from_secs(value))
        }

        // http_timeout
        if let Some(value) = args.http_timeout {
            self.http_timeout = if value == 0 {
                None
            }
            else {
                Some(Duration::from_secs(value))
            };
        }

        // log_target
        if let Some(file) = args.logfile.as_ref() {
            if file == "-" {
                self.log_target = LogTarget::Stderr
            }
            else {
                self.log_target = LogTarget::File(cur_dir.join(file))
            }
        }

        // log_level
        if args.verbose > 1 {
            self.log_level = LevelFilter::Debug
        }
        else if args.verbose == 1 {
            self.log_level = LevelFilter::Info
        }
        else if args.quiet > 1 {
            self.log_level = LevelFilter::Off
        }
        else if args.quiet == 1 {
            self.log_level = LevelFilter::Error
        }

        Ok(())
    }

    /// Returns a path value in arg matches.
    ///
    /// This expands a relative path based on the given directory.
    fn path_value_of(
        matches: &ArgMatches,
        key: &str,
        dir: &Path
    ) -> Option<PathBuf> {
        matches.get_one::<PathBuf>(key).map(|path| dir.join(path))
    }

    /// Creates the correct base configuration for the given config file path.
    ///
    /// If no config path is given, creates a default config.
    fn create_base_config(path: Option<&Path>) -> Result<Self, Failed> {
        let file = match path {
            Some(path) => {
                match ConfigFile::read(path)? {
                    Some(file) => file,
                    None => {
                        error!("Cannot read config file {}", path.display());
                        return Err(Failed);
                    }
                }
            }
            None => return Ok(Self::default()),
        };
        Self::from_config_file(file)
    }

    /// Creates a base config from a config file.
    fn from_config_file(mut file: ConfigFile) -> Result<Self, Failed> {
        let log_target = Self::log_target_from_config_file(&mut file)?;
        let res = Config {
            mode: file.take_from_str("mode")?.unwrap_or(DEFAULT_MODE),
            ca_bundle: {
                file.take_path("ca-bundle")?
                    .unwrap_or_else(|| DEFAULT_CA_BUNDLE.into())
            },
            intermediates_file: file.take_path("intermediates-file")?,
            pinned_file: file.take_path("pinned-file")?,
            crl_cache_size: {
                file.take_usize("crl-cache-size")?
                    .unwrap_or(DEFAULT_CRL_CACHE_SIZE)
            },
            crl_ttl: {
                Duration::from_secs(
                    file.take_u64("crl-ttl")?.unwrap_or(DEFAULT_CRL_TTL)
                )
            },
            ocsp_cache_size: {
                file.take_usize("ocsp-cache-size")?
                    .unwrap_or(DEFAULT_OCSP_CACHE_SIZE)
            },
            ocsp_success_max_age: {
                Duration::from_secs(
                    file.take_u64("ocsp-success-max-age")?
                        .unwrap_or(DEFAULT_OCSP_SUCCESS_MAX_AGE)
                )
            },
            ocsp_error_max_age: {
                Duration::from_secs(
                    file.take_u64("ocsp-error-max-age")?
                        .unwrap_or(DEFAULT_OCSP_ERROR_MAX_AGE)
                )
            },
            result_cache_size: {
                file.take_usize("result-cache-size")?
                    .unwrap_or(DEFAULT_RESULT_CACHE_SIZE)
            },
            result_cache_ttl: {
                Duration::from_secs(
                    file.take_u64("result-cache-ttl")?
                        .unwrap_or(DEFAULT_RESULT_CACHE_TTL)
                )
            },
            refresh: {
                Duration::from_secs(
                    file.take_u64("refresh")?.unwrap_or(DEFAULT_REFRESH)
                )
            },
            hard_fail: file.take_bool("hard-fail")?.unwrap_or(false),
            state_dir: file.take_path("state-dir")?,
            http_user_agent: DEFAULT_HTTP_USER_AGENT.to_string(),
            http_connect_timeout: {
                file.take_u64("http-connect-timeout")?
                    .map(Duration::from_secs)
            },
            http_timeout: {
                match file.take_u64("http-timeout")? {
                    Some(0) => None,
                    Some(value) => Some(Duration::from_secs(value)),
                    None => Some(DEFAULT_HTTP_TIMEOUT)
                }
            },
            log_level: {
                file.take_from_str("log-level")?.unwrap_or(LevelFilter::Warn)
            },
            log_target,
        };

        file.check_exhausted()?;
        Ok(res)
    }

    /// Determines the logging target from the config file.
    fn log_target_from_config_file(
        file: &mut ConfigFile
    ) -> Result<LogTarget, Failed> {
        let log_target = file.take_string("log")?;
        let log_file = file.take_path("log-file")?;
        match log_target.as_ref().map(AsRef::as_ref) {
            Some("stderr") | None => Ok(LogTarget::Stderr),
            Some("file") => {
                match log_file {
                    Some(file) => Ok(LogTarget::File(file)),
                    None => {
                        error!(
                            "Failed in config file {}: \
                             log target \"file\" requires 'log-file' value.",
                            file.path.display()
                        );
                        Err(Failed)
                    }
                }
            }
            Some(value) => {
                error!(
                    "Failed in config file {}: \
                     invalid log target '{}'",
                    file.path.display(), value
                );
                Err(Failed)
            }
        }
    }

    /// Initializes logging according to the configuration.
    pub fn init_logging(&self) -> Result<(), Failed> {
        let dispatch = fern::Dispatch::new()
            .level(self.log_level)
            .format(|out, message, record| {
                out.finish(
                    format_args!("[{}] {}", record.level(), message)
                )
            });
        let dispatch = match self.log_target {
            LogTarget::Stderr => dispatch.chain(io::stderr()),
            LogTarget::File(ref path) => {
                let file = match fern::log_file(path) {
                    Ok(file) => file,
                    Err(err) => {
                        eprintln!(
                            "Failed to open log file '{}': {}",
                            path.display(), err
                        );
                        return Err(Failed)
                    }
                };
                dispatch.chain(file)
            }
        };
        if let Err(err) = dispatch.apply() {
            eprintln!("Failed to initialize logger: {}.\nAborting.", err);
            return Err(Failed)
        }
        Ok(())
    }
}


//--- Default

impl Default for Config {
    fn default() -> Self {
        Config {
            mode: DEFAULT_MODE,
            ca_bundle: DEFAULT_CA_BUNDLE.into(),
            intermediates_file: None,
            pinned_file: None,
            crl_cache_size: DEFAULT_CRL_CACHE_SIZE,
            crl_ttl: Duration::from_secs(DEFAULT_CRL_TTL),
            ocsp_cache_size: DEFAULT_OCSP_CACHE_SIZE,
            ocsp_success_max_age: Duration::from_secs(
                DEFAULT_OCSP_SUCCESS_MAX_AGE
            ),
            ocsp_error_max_age: Duration::from_secs(
                DEFAULT_OCSP_ERROR_MAX_AGE
            ),
            result_cache_size: DEFAULT_RESULT_CACHE_SIZE,
            result_cache_ttl: Duration::from_secs(DEFAULT_RESULT_CACHE_TTL),
            refresh: Duration::from_secs(DEFAULT_REFRESH),
            hard_fail: false,
            state_dir: None,
            http_user_agent: DEFAULT_HTTP_USER_AGENT.to_string(),
            http_connect_timeout: None,
            http_timeout: Some(DEFAULT_HTTP_TIMEOUT),
            log_level: LevelFilter::Warn,
            log_target: LogTarget::default(),
        }
    }
}


//------------ RunMode -------------------------------------------------------

/// The dispatch mode for incoming requests.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum RunMode {
    /// One request at a time, responses in request order.
    #[default]
    Sequential,

    /// A thread per request, responses correlated by id.
    Concurrent,
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(RunMode::Sequential),
            "concurrent" => Ok(RunMode::Concurrent),
            _ => Err(format!("invalid mode '{}'", s))
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            RunMode::Sequential => "sequential",
            RunMode::Concurrent => "concurrent",
        })
    }
}


//------------ LogTarget -----------------------------------------------------

/// The target to log to.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum LogTarget {
    /// Stderr.
    #[default]
    Stderr,

    /// A file.
    ///
    /// The argument is the file name.
    File(PathBuf)
}


//------------ GlobalArgs ----------------------------------------------------

/// The global command line arguments.
#[derive(Clone, Debug, Parser)]
struct GlobalArgs {
    /// Read base configuration from this file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Process requests sequentially or concurrently
    #[arg(short, long, value_name = "MODE")]
    mode: Option<RunMode>,

    /// The CA bundle with the trust anchors
    #[arg(long, value_name = "PATH")]
    ca_bundle: Option<PathBuf>,

    /// PEM file with extra intermediate certificates
    #[arg(long, value_name = "PATH")]
    intermediates: Option<PathBuf>,

    /// PEM file with pinned certificates
    #[arg(long, value_name = "PATH")]
    pinned: Option<PathBuf>,

    /// Maximum number of cached CRLs
    #[arg(long, value_name = "COUNT")]
    crl_cache_size: Option<usize>,

    /// How long a fetched CRL counts as fresh
    #[arg(long, value_name = "SECONDS")]
    crl_ttl: Option<u64>,

    /// Maximum number of cached OCSP answers
    #[arg(long, value_name = "COUNT")]
    ocsp_cache_size: Option<usize>,

    /// Maximum age of a successful OCSP answer
    #[arg(long, value_name = "SECONDS")]
    ocsp_success_max_age: Option<u64>,

    /// Maximum age of an OCSP responder error
    #[arg(long, value_name = "SECONDS")]
    ocsp_error_max_age: Option<u64>,

    /// Maximum number of cached verdicts
    #[arg(long, value_name = "COUNT")]
    result_cache_size: Option<usize>,

    /// How long a cached verdict stays valid
    #[arg(long, value_name = "SECONDS")]
    result_cache_ttl: Option<u64>,

    /// Interval between background refresh runs
    #[arg(long, value_name = "SECONDS")]
    refresh: Option<u64>,

    /// Fail certificates whose revocation data is unavailable
    #[arg(long)]
    hard_fail: bool,

    /// Keep cache snapshots in this directory
    #[arg(long, value_name = "PATH")]
    state_dir: Option<PathBuf>,

    /// Timeout for connecting to an origin server
    #[arg(long, value_name = "SECONDS")]
    http_connect_timeout: Option<u64>,

    /// Timeout of a whole HTTP request (0 for none)
    #[arg(long, value_name = "SECONDS")]
    http_timeout: Option<u64>,

    /// Log more information, twice for even more
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Log less information, twice for no information
    #[arg(short, long, action = ArgAction::Count, conflicts_with = "verbose")]
    quiet: u8,

    /// Log to this file
    #[arg(long, value_name = "PATH")]
    logfile: Option<String>,
}


//------------ ConfigFile ----------------------------------------------------

/// The content of a config file.
///
/// This is a thin wrapper around `toml::Table` to make dealing with it more
/// convenient.
#[derive(Clone, Debug)]
struct ConfigFile {
    /// The content of the file.
    content: toml::value::Table,

    /// The path to the config file.
    path: PathBuf,

    /// The directory we found the file in.
    ///
    /// This is used in relative paths.
    dir: PathBuf,
}

impl ConfigFile {
    /// Reads the config file at the given path.
    ///
    /// If there is no such file, returns `None`. If there is a file but it
    /// is broken, aborts.
    #[allow(clippy::verbose_file_reads)]
    fn read(path: &Path) -> Result<Option<Self>, Failed> {
        let mut file = match fs::File::open(path) {
            Ok(file) => file,
            Err(_) => return Ok(None)
        };
        let mut config = String::new();
        if let Err(err) = file.read_to_string(&mut config) {
            error!(
                "Failed to read config file {}: {}",
                path.display(), err
            );
            return Err(Failed);
        }
        Self::parse(&config, path).map(Some)
    }

    /// Parses the content of the file from a string.
    fn parse(content: &str, path: &Path) -> Result<Self, Failed> {
        let content = match toml::from_str(content) {
            Ok(toml::Value::Table(content)) => content,
            Ok(_) => {
                error!(
                    "Failed to parse config file {}: Not a mapping.",
                    path.display()
                );
                return Err(Failed);
            }
            Err(err) => {
                error!(
                    "Failed to parse config file {}: {}",
                    path.display(), err
                );
                return Err(Failed);
            }
        };
        let dir = if path.is_relative() {
            path.join(match env::current_dir() {
                Ok(dir) => dir,
                Err(err) => {
                    error!(
                        "Fatal: Can't determine current directory: {}.",
                        err
                    );
                    return Err(Failed);
                }
            }).parent().unwrap().into() // a file always has a parent
        }
        else {
            path.parent().unwrap().into()
        };
        Ok(ConfigFile {
            content,
            path: path.into(),
            dir
        })
    }

    /// Takes a boolean value from the config file.
    ///
    /// The value is taken from the given `key`. Returns `Ok(None)` if there
    /// is no such key. Returns an error if the key exists but the value
    /// isn’t a boolean.
    fn take_bool(&mut self, key: &str) -> Result<Option<bool>, Failed> {
        match self.content.remove(key) {
            Some(value) => {
                if let toml::Value::Boolean(res) = value {
                    Ok(Some(res))
                }
                else {
                    error!(
                        "Failed in config file {}: \
                         '{}' expected to be a boolean.",
                        self.path.display(), key
                    );
                    Err(Failed)
                }
            }
            None => Ok(None)
        }
    }

    /// Takes an unsigned integer value from the config file.
    ///
    /// The value is taken from the given `key`. Returns `Ok(None)` if there
    /// is no such key. Returns an error if the key exists but the value
    /// isn’t an integer or if it is negative.
    fn take_u64(&mut self, key: &str) -> Result<Option<u64>, Failed> {
        match self.content.remove(key) {
            Some(value) => {
                if let toml::Value::Integer(res) = value {
                    match u64::try_from(res) {
                        Ok(res) => Ok(Some(res)),
                        Err(_) => {
                            error!(
                                "Failed in config file {}: \
                                 '{}' expected to be a positive integer.",
                                self.path.display(), key
                            );
                            Err(Failed)
                        }
                    }
                }
                else {
                    error!(
                        "Failed in config file {}: \
                         '{}' expected to be an integer.",
                        self.path.display(), key
                    );
                    Err(Failed)
                }
            }
            None => Ok(None)
        }
    }

    /// Takes a usize value from the config file.
    fn take_usize(&mut self, key: &str) -> Result<Option<usize>, Failed> {
        match self.take_u64(key)? {
            Some(value) => {
                match usize::try_from(value) {
                    Ok(value) => Ok(Some(value)),
                    Err(_) => {
                        error!(
                            "Failed in config file {}: \
                             value for '{}' is too large.",
                            self.path.display(), key
                        );
                        Err(Failed)
                    }
                }
            }
            None => Ok(None)
        }
    }

    /// Takes a string value from the config file.
    ///
    /// The value is taken from the given `key`. Returns `Ok(None)` if there
    /// is no such key. Returns an error if the key exists but the value
    /// isn’t a string.
    fn take_string(&mut self, key: &str) -> Result<Option<String>, Failed> {
        match self.content.remove(key) {
            Some(value) => {
                if let toml::Value::String(res) = value {
                    Ok(Some(res))
                }
                else {
                    error!(
                        "Failed in config file {}: \
                         '{}' expected to be a string.",
                        self.path.display(), key
                    );
                    Err(Failed)
                }
            }
            None => Ok(None)
        }
    }

    /// Takes a value from the config file parsed from a string.
    fn take_from_str<T: FromStr>(
        &mut self, key: &str
    ) -> Result<Option<T>, Failed> {
        match self.take_string(key)? {
            Some(value) => {
                match T::from_str(&value) {
                    Ok(some) => Ok(Some(some)),
                    Err(_) => {
                        error!(
                            "Failed in config file {}: \
                             invalid value for '{}'.",
                            self.path.display(), key
                        );
                        Err(Failed)
                    }
                }
            }
            None => Ok(None)
        }
    }

    /// Takes a path value from the config file.
    ///
    /// The path is interpreted relative to the directory of the config
    /// file.
    fn take_path(&mut self, key: &str) -> Result<Option<PathBuf>, Failed> {
        self.take_string(key).map(|opt| {
            opt.map(|path| self.dir.join(path))
        })
    }

    /// Checks whether the config file is now empty.
    ///
    /// If it isn’t, logs all remaining keys and returns an error.
    fn check_exhausted(&self) -> Result<(), Failed> {
        if !self.content.is_empty() {
            let keys: Vec<_> = self.content.keys()
                .map(String::as_str).collect();
            error!(
                "Failed in config file {}: Unknown settings {}.",
                self.path.display(), keys.join(", ")
            );
            Err(Failed)
        }
        else {
            Ok(())
        }
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;

    fn process_basic_args(args: &[&str]) -> Config {
        let app = Config::config_args(Command::new("certward"));
        Config::from_arg_matches(
            &app.try_get_matches_from(args).unwrap(),
            Path::new("/test")
        ).unwrap()
    }

    fn process_file(content: &str) -> Result<Config, Failed> {
        Config::from_config_file(
            ConfigFile::parse(content, Path::new("/etc/certward.conf"))?
        )
    }

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.mode, RunMode::Sequential);
        assert_eq!(config.crl_ttl, Duration::from_secs(DEFAULT_CRL_TTL));
        assert_eq!(config.http_timeout, Some(DEFAULT_HTTP_TIMEOUT));
        assert!(!config.hard_fail);
        assert!(config.state_dir.is_none());
        assert_eq!(config.log_level, LevelFilter::Warn);
        assert_eq!(config.log_target, LogTarget::Stderr);
    }

    #[test]
    fn config_file() {
        let config = process_file(
            "mode = \"concurrent\"\n\
             ca-bundle = \"bundle.pem\"\n\
             intermediates-file = \"intermediates.pem\"\n\
             crl-ttl = 120\n\
             http-timeout = 0\n\
             hard-fail = true\n\
             log-level = \"debug\"\n"
        ).unwrap();
        assert_eq!(config.mode, RunMode::Concurrent);
        assert_eq!(config.ca_bundle, Path::new("/etc/bundle.pem"));
        assert_eq!(
            config.intermediates_file.as_deref(),
            Some(Path::new("/etc/intermediates.pem"))
        );
        assert_eq!(config.crl_ttl, Duration::from_secs(120));
        assert_eq!(config.http_timeout, None);
        assert!(config.hard_fail);
        assert_eq!(config.log_level, LevelFilter::Debug);
    }

    #[test]
    fn config_file_rejects_unknown_and_mistyped_keys() {
        assert!(process_file("no-such-setting = true\n").is_err());
        assert!(process_file("crl-ttl = \"fast\"\n").is_err());
        assert!(process_file("crl-ttl = -3\n").is_err());
        assert!(process_file("mode = \"sideways\"\n").is_err());
    }

    #[test]
    fn arg_overrides() {
        let config = process_basic_args(&[
            "certward",
            "--mode", "concurrent",
            "--ca-bundle", "anchors.pem",
            "--crl-ttl", "60",
            "--hard-fail",
            "-vv",
        ]);
        assert_eq!(config.mode, RunMode::Concurrent);
        assert_eq!(config.ca_bundle, Path::new("/test/anchors.pem"));
        assert_eq!(config.crl_ttl, Duration::from_secs(60));
        assert!(config.hard_fail);
        assert_eq!(config.log_level, LevelFilter::Debug);
    }

    #[test]
    fn quiet_lowers_the_log_level() {
        assert_eq!(
            process_basic_args(&["certward", "-q"]).log_level,
            LevelFilter::Error
        );
        assert_eq!(
            process_basic_args(&["certward", "-qq"]).log_level,
            LevelFilter::Off
        );
    }
}
