//! The wire protocol between the proxy and the helper.
//!
//! Requests and responses travel as newline-separated groups of `key=value`
//! pairs terminated by an empty line. Certificates are transported
//! PEM-armored, so a single `cert_N` value spans multiple physical lines;
//! the reader reassembles them by watching for the armor markers.
//!
//! In sequential mode each record stands on its own. In concurrent mode
//! every record starts with an `id=N` pair and responses may be written in
//! any order, correlated by that id.
//!
//! A record that cannot be turned into a usable request – a certificate
//! that does not decode, a missing `host` – is not dropped silently. The
//! reader still assembles what is there and reports the problem together
//! with the id so the dispatcher can fail that one request fast. Unknown
//! keys are ignored as the protocol consumer may be newer than we are.

use std::collections::BTreeMap;
use std::io;
use std::io::{BufRead, Write};
use crate::cert::{Cert, PEM_BEGIN, PEM_END};


//------------ Constants -----------------------------------------------------

/// The error name reported for requests we could not decode.
pub const MALFORMED_REQUEST: &str = "MALFORMED_REQUEST";


//------------ ValidationRequest ---------------------------------------------

/// A request to validate a certificate chain.
///
/// Values of this type are immutable once constructed. The validator chain
/// only ever reads them and passes them on behind an `Arc`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ValidationRequest {
    /// The request id in concurrent mode.
    pub id: Option<u64>,

    /// The host name the client asked for.
    pub host: String,

    /// The negotiated protocol version. Informational only.
    pub protocol_version: String,

    /// The negotiated cipher suite. Informational only.
    pub cipher_suite: String,

    /// The certificate chain, leaf first.
    pub chain: Vec<Cert>,

    /// The errors the caller’s TLS library already reported.
    pub reported: Vec<ReportedError>,
}

impl ValidationRequest {
    /// Returns whether the caller reported an error with the given name.
    pub fn has_reported(&self, name: &str) -> bool {
        self.reported.iter().any(|err| err.name == name)
    }
}


//------------ ReportedError -------------------------------------------------

/// A single error referring to one certificate of a chain.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReportedError {
    /// The symbolic name of the error.
    pub name: String,

    /// The index into the chain of the certificate the error refers to.
    pub cert_index: usize,
}

impl ReportedError {
    pub fn new(name: impl Into<String>, cert_index: usize) -> Self {
        ReportedError { name: name.into(), cert_index }
    }
}


//------------ ValidationResponse --------------------------------------------

/// The helper’s answer to a validation request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ValidationResponse {
    /// The id echoed from the request in concurrent mode.
    pub id: Option<u64>,

    /// Whether the chain was judged trustworthy.
    pub pass: bool,

    /// The errors explaining a failure. Empty on success.
    pub errors: Vec<ReportedError>,
}

impl ValidationResponse {
    /// Creates a passing response.
    pub fn pass(id: Option<u64>) -> Self {
        ValidationResponse { id, pass: true, errors: Vec::new() }
    }

    /// Creates a failing response with the given errors.
    pub fn fail(id: Option<u64>, errors: Vec<ReportedError>) -> Self {
        ValidationResponse { id, pass: false, errors }
    }

    /// Creates a failing response with a single error.
    pub fn fail_with(
        id: Option<u64>, name: impl Into<String>, cert_index: usize
    ) -> Self {
        Self::fail(id, vec![ReportedError::new(name, cert_index)])
    }
}


//------------ ReadOutcome ---------------------------------------------------

/// The result of reading one record off the wire.
#[derive(Clone, Debug)]
pub enum ReadOutcome {
    /// The input is exhausted.
    Eof,

    /// A request was decoded successfully.
    Request(ValidationRequest),

    /// A record was read but could not be turned into a request.
    ///
    /// The id is included if it could at least be parsed so the failure
    /// can be attributed in concurrent mode.
    Malformed {
        id: Option<u64>,
        reason: String,
    },
}


//------------ RequestReader -------------------------------------------------

/// Reads validation requests off a line-oriented source.
pub struct RequestReader<R> {
    /// The source to read records from.
    source: R,

    /// Whether records carry an `id` pair.
    concurrent: bool,
}

impl<R: BufRead> RequestReader<R> {
    /// Creates a new reader.
    ///
    /// If `concurrent` is `true`, records are expected to start with an
    /// `id=N` pair which is decoded into the request. Otherwise the key is
    /// treated like any other unknown key.
    pub fn new(source: R, concurrent: bool) -> Self {
        RequestReader { source, concurrent }
    }

    /// Reads the next record.
    ///
    /// Only an actual IO error is returned as an error. Decoding problems
    /// are reported through [`ReadOutcome::Malformed`] so that the caller
    /// can keep the read loop alive.
    pub fn read(&mut self) -> Result<ReadOutcome, io::Error> {
        let record = match self.read_record()? {
            Some(record) => record,
            None => return Ok(ReadOutcome::Eof),
        };
        Ok(self.decode_record(record))
    }

    /// Reads the raw lines of the next record.
    ///
    /// Returns `None` if the source is exhausted before any content line
    /// was seen. Empty lines before the first content line are skipped so
    /// that sloppy extra delimiters don’t produce phantom records.
    fn read_record(&mut self) -> Result<Option<Vec<String>>, io::Error> {
        let mut lines = Vec::new();
        let mut in_pem = false;
        loop {
            let mut line = String::new();
            if self.source.read_line(&mut line)? == 0 {
                if lines.is_empty() {
                    return Ok(None)
                }
                return Ok(Some(lines))
            }
            while line.ends_with('\n') || line.ends_with('\r') {
                line.pop();
            }
            if line.is_empty() && !in_pem {
                if lines.is_empty() {
                    continue
                }
                return Ok(Some(lines))
            }
            if line.contains(PEM_BEGIN) {
                in_pem = true
            }
            if line.contains(PEM_END) {
                in_pem = false
            }
            lines.push(line)
        }
    }

    /// Decodes the raw lines of a record.
    fn decode_record(&self, lines: Vec<String>) -> ReadOutcome {
        let mut id = None;
        let mut host = None;
        let mut protocol_version = String::new();
        let mut cipher_suite = String::new();
        let mut certs = BTreeMap::new();
        let mut error_names = BTreeMap::new();
        let mut error_certs = BTreeMap::new();
        let mut bad_id = false;

        let mut iter = lines.into_iter();
        let mut pending = iter.next();
        while let Some(line) = pending.take() {
            let (key, value) = match line.split_once('=') {
                Some(some) => some,
                None => {
                    // A keyless line outside PEM reassembly. Ignore.
                    pending = iter.next();
                    continue
                }
            };
            let mut value = value.to_string();
            if value.contains(PEM_BEGIN) && !value.contains(PEM_END) {
                // The value is PEM spanning further physical lines.
                for cont in iter.by_ref() {
                    value.push('\n');
                    let done = cont.contains(PEM_END);
                    value.push_str(&cont);
                    if done {
                        break
                    }
                }
            }

            if key == "id" && self.concurrent {
                match value.parse::<u64>() {
                    Ok(value) => id = Some(value),
                    Err(_) => bad_id = true,
                }
            }
            else if key == "host" {
                host = Some(value)
            }
            else if key == "proto_version" {
                protocol_version = value
            }
            else if key == "cipher" {
                cipher_suite = value
            }
            else if let Some(index) = parse_indexed_key(key, "cert_") {
                certs.insert(index, value);
            }
            else if let Some(index) = parse_indexed_key(key, "error_name_") {
                error_names.insert(index, value);
            }
            else if let Some(index) = parse_indexed_key(key, "error_cert_") {
                if let Some(cert) = parse_cert_ref(&value) {
                    error_certs.insert(index, cert);
                }
            }
            // Any other key is quietly ignored.
            pending = iter.next();
        }

        if bad_id {
            return ReadOutcome::Malformed {
                id, reason: "unparseable request id".into()
            }
        }
        let host = match host {
            Some(host) if !host.is_empty() => host,
            _ => {
                return ReadOutcome::Malformed {
                    id, reason: "missing host".into()
                }
            }
        };
        if self.concurrent && id.is_none() {
            return ReadOutcome::Malformed {
                id, reason: "missing request id".into()
            }
        }

        let mut chain = Vec::with_capacity(certs.len());
        for index in 0..certs.len() {
            let pem = match certs.get(&index) {
                Some(pem) => pem,
                None => {
                    return ReadOutcome::Malformed {
                        id,
                        reason: format!("gap in certificate list at {}", index)
                    }
                }
            };
            match Cert::from_pem(pem) {
                Ok(cert) => chain.push(cert),
                Err(err) => {
                    return ReadOutcome::Malformed {
                        id,
                        reason: format!("cert_{}: {}", index, err)
                    }
                }
            }
        }
        if chain.is_empty() {
            return ReadOutcome::Malformed {
                id, reason: "empty certificate chain".into()
            }
        }

        let reported = error_names.into_iter().map(|(index, name)| {
            ReportedError::new(
                name,
                error_certs.get(&index).copied().unwrap_or(0),
            )
        }).collect();

        ReadOutcome::Request(ValidationRequest {
            id, host, protocol_version, cipher_suite, chain, reported
        })
    }
}


//------------ ResponseWriter ------------------------------------------------

/// Writes validation responses onto a line-oriented target.
pub struct ResponseWriter<W> {
    /// The target to write records to.
    target: W,

    /// Whether records carry an `id` pair.
    concurrent: bool,
}

impl<W: Write> ResponseWriter<W> {
    /// Creates a new writer.
    pub fn new(target: W, concurrent: bool) -> Self {
        ResponseWriter { target, concurrent }
    }

    /// Writes a single response record and flushes the target.
    pub fn write(
        &mut self, response: &ValidationResponse
    ) -> Result<(), io::Error> {
        if self.concurrent {
            writeln!(
                self.target, "id={}", response.id.unwrap_or_default()
            )?;
        }
        if response.pass {
            writeln!(self.target, "OK")?;
        }
        else {
            writeln!(self.target, "ERR")?;
            for (index, error) in response.errors.iter().enumerate() {
                writeln!(
                    self.target, "error_name_{}={}", index, error.name
                )?;
                writeln!(
                    self.target, "error_cert_{}=cert_{}",
                    index, error.cert_index
                )?;
            }
        }
        writeln!(self.target)?;
        self.target.flush()
    }
}


//------------ Free Encoding and Decoding Functions --------------------------

/// Writes a request record.
///
/// This is the inverse of [`RequestReader`]. The helper itself never sends
/// requests; the encoder exists for the `check` command and the tests.
pub fn write_request<W: Write>(
    target: &mut W, request: &ValidationRequest
) -> Result<(), io::Error> {
    if let Some(id) = request.id {
        writeln!(target, "id={}", id)?;
    }
    writeln!(target, "host={}", request.host)?;
    if !request.protocol_version.is_empty() {
        writeln!(target, "proto_version={}", request.protocol_version)?;
    }
    if !request.cipher_suite.is_empty() {
        writeln!(target, "cipher={}", request.cipher_suite)?;
    }
    for (index, cert) in request.chain.iter().enumerate() {
        writeln!(target, "cert_{}={}", index, cert.to_pem())?;
    }
    for (index, error) in request.reported.iter().enumerate() {
        writeln!(target, "error_name_{}={}", index, error.name)?;
        writeln!(target, "error_cert_{}=cert_{}", index, error.cert_index)?;
    }
    writeln!(target)?;
    target.flush()
}

/// Reads a response record.
///
/// Returns `None` if the source is exhausted. This, too, exists for the
/// benefit of protocol consumers and the tests; the helper only writes
/// responses.
pub fn read_response<R: BufRead>(
    source: &mut R, concurrent: bool
) -> Result<Option<ValidationResponse>, io::Error> {
    let mut id = None;
    let mut pass = None;
    let mut error_names = BTreeMap::new();
    let mut error_certs = BTreeMap::new();
    let mut saw_line = false;

    loop {
        let mut line = String::new();
        if source.read_line(&mut line)? == 0 {
            if !saw_line {
                return Ok(None)
            }
            break
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        if line.is_empty() {
            if saw_line {
                break
            }
            continue
        }
        saw_line = true;
        if line == "OK" {
            pass = Some(true)
        }
        else if line == "ERR" {
            pass = Some(false)
        }
        else if let Some((key, value)) = line.split_once('=') {
            if key == "id" && concurrent {
                id = value.parse::<u64>().ok()
            }
            else if let Some(index) = parse_indexed_key(key, "error_name_") {
                error_names.insert(index, value.to_string());
            }
            else if let Some(index) = parse_indexed_key(key, "error_cert_") {
                if let Some(cert) = parse_cert_ref(value) {
                    error_certs.insert(index, cert);
                }
            }
        }
    }

    let pass = match pass {
        Some(pass) => pass,
        None => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData, "response without OK or ERR"
            ))
        }
    };
    let errors = error_names.into_iter().map(|(index, name)| {
        ReportedError::new(
            name, error_certs.get(&index).copied().unwrap_or(0)
        )
    }).collect();
    Ok(Some(ValidationResponse { id, pass, errors }))
}

/// Parses keys of the form `<prefix><decimal index>`.
fn parse_indexed_key(key: &str, prefix: &str) -> Option<usize> {
    key.strip_prefix(prefix)?.parse().ok()
}

/// Parses a reference to a chain certificate.
///
/// The protocol writes these as `cert_N` but a bare index is accepted, too.
fn parse_cert_ref(value: &str) -> Option<usize> {
    value.strip_prefix("cert_").unwrap_or(value).parse().ok()
}


//============ Tests =========================================================
