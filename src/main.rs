//! The certward binary.

use std::env::current_dir;
use std::process::exit;
use clap::crate_version;
use certward::{Config, ExitError, Operation};

// Since `main` with a result insists on printing a message, but in our
// case everything worth saying has been logged by the time we get an
// `ExitError`, we make our own, more quiet version.
fn _main() -> Result<(), ExitError> {
    let cur_dir = match current_dir() {
        Ok(dir) => dir,
        Err(err) => {
            eprintln!(
                "Fatal: cannot get current directory ({}). Aborting.",
                err
            );
            return Err(ExitError::Generic);
        }
    };
    let matches = Operation::config_args(Config::config_args(
        clap::Command::new("certward")
            .version(crate_version!())
            .about("validates TLS certificate chains for a filtering proxy")
    )).get_matches();
    let config = Config::from_arg_matches(&matches, &cur_dir)?;
    let operation = Operation::from_arg_matches(&matches, &cur_dir)?;
    operation.run(config)
}

fn main() {
    match _main() {
        Ok(_) => exit(0),
        Err(ExitError::Generic) => exit(1),
        Err(ExitError::Invalid) => exit(2),
    }
}
