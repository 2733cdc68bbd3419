//! Serving validation requests.
//!
//! The [`Dispatcher`] owns the read loop: it pulls records off the source,
//! runs each through the validator chain and writes the answer back. In
//! sequential mode this happens inline, one request at a time. In
//! concurrent mode every request gets its own thread and the writer is
//! shared behind a mutex so that whole records are written atomically –
//! responses may then appear in any order, correlated by id.
//!
//! Records that could not be decoded are answered rather than dropped:
//! the proxy is waiting for an answer and, in sequential mode, counts
//! responses to pair them with requests.

use std::io::{BufRead, Write};
use std::sync::Arc;
use std::thread;
use log::{debug, error, warn};
use crate::error::Failed;
use crate::proto::{
    ReadOutcome, RequestReader, ResponseWriter, ValidationRequest,
    ValidationResponse, MALFORMED_REQUEST,
};
use crate::utils::sync::Mutex;
use crate::validate::Validator;


//------------ Dispatcher ----------------------------------------------------

/// Runs the request loop over a pair of IO channels.
pub struct Dispatcher<V> {
    /// The validator chain answering the requests.
    validator: Arc<V>,

    /// Whether to process requests concurrently.
    concurrent: bool,
}

impl<V: Validator + 'static> Dispatcher<V> {
    /// Creates a dispatcher running requests through the given validator.
    pub fn new(validator: V, concurrent: bool) -> Self {
        Dispatcher { validator: Arc::new(validator), concurrent }
    }

    /// Reads requests from `source` until EOF, answering onto `target`.
    ///
    /// Returns an error only if an actual IO error makes the channel
    /// unusable. A clean EOF is a normal shutdown.
    pub fn run<R, W>(&self, source: R, target: W) -> Result<(), Failed>
    where R: BufRead, W: Write + Send + 'static {
        if self.concurrent {
            self.run_concurrent(source, target)
        }
        else {
            self.run_sequential(source, target)
        }
    }

    fn run_sequential<R, W>(
        &self, source: R, mut target: W
    ) -> Result<(), Failed>
    where R: BufRead, W: Write {
        let mut reader = RequestReader::new(source, false);
        let mut writer = ResponseWriter::new(&mut target, false);
        loop {
            let response = match self.next_request(&mut reader)? {
                Some(NextRequest::Request(request)) => {
                    self.validator.validate(&request)
                }
                Some(NextRequest::Malformed(response)) => response,
                None => return Ok(()),
            };
            if let Err(err) = writer.write(&response) {
                error!("Failed to write response: {}", err);
                return Err(Failed)
            }
        }
    }

    fn run_concurrent<R, W>(
        &self, source: R, target: W
    ) -> Result<(), Failed>
    where R: BufRead, W: Write + Send + 'static {
        let mut reader = RequestReader::new(source, true);
        let writer = Arc::new(Mutex::new(ResponseWriter::new(target, true)));
        let mut handles = Vec::new();
        let res = loop {
            match self.next_request(&mut reader) {
                Ok(Some(NextRequest::Request(request))) => {
                    let validator = self.validator.clone();
                    let writer = writer.clone();
                    handles.push(thread::spawn(move || {
                        let response = validator.validate(&request);
                        if let Err(err) = writer.lock().write(&response) {
                            error!("Failed to write response: {}", err);
                        }
                    }));
                    // A session lives as long as the proxy process, so
                    // completed workers cannot wait for EOF to be joined.
                    if let Err(err) = reap_finished(&mut handles) {
                        break Err(err)
                    }
                }
                Ok(Some(NextRequest::Malformed(response))) => {
                    if let Err(err) = writer.lock().write(&response) {
                        error!("Failed to write response: {}", err);
                        break Err(Failed)
                    }
                }
                Ok(None) => break Ok(()),
                Err(err) => break Err(err),
            }
        };
        for handle in handles {
            if handle.join().is_err() {
                error!("A validation thread panicked.");
                return Err(Failed)
            }
        }
        res
    }

    /// Reads the next record, turning decode failures into responses.
    fn next_request<R: BufRead>(
        &self, reader: &mut RequestReader<R>
    ) -> Result<Option<NextRequest>, Failed> {
        match reader.read() {
            Ok(ReadOutcome::Eof) => {
                debug!("Input exhausted, shutting down.");
                Ok(None)
            }
            Ok(ReadOutcome::Request(request)) => {
                debug!(
                    "Request for {} with {} certificates.",
                    request.host, request.chain.len()
                );
                Ok(Some(NextRequest::Request(Arc::new(request))))
            }
            Ok(ReadOutcome::Malformed { id, reason }) => {
                warn!("Malformed request: {}", reason);
                Ok(Some(NextRequest::Malformed(
                    ValidationResponse::fail_with(id, MALFORMED_REQUEST, 0)
                )))
            }
            Err(err) => {
                error!("Failed to read request: {}", err);
                Err(Failed)
            }
        }
    }
}

/// A request ready for processing.
enum NextRequest {
    /// A decoded request.
    Request(Arc<ValidationRequest>),

    /// The canned answer to an undecodable record.
    Malformed(ValidationResponse),
}


//------------ Helper Functions ----------------------------------------------

/// Joins all finished worker threads, keeping the running ones.
fn reap_finished(
    handles: &mut Vec<thread::JoinHandle<()>>
) -> Result<(), Failed> {
    let mut idx = 0;
    while idx < handles.len() {
        if handles[idx].is_finished() {
            if handles.swap_remove(idx).join().is_err() {
                error!("A validation thread panicked.");
                return Err(Failed)
            }
        }
        else {
            idx += 1
        }
    }
    Ok(())
}


//============ Tests =========================================================
