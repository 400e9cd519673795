use hindsight::HindsightError;
use std::ffi::OsString;
use std::process::ExitCode;

/// Exit codes: subcommands report their own verdict (0 = valid run / clean
/// replay / passing checks, 1 otherwise), load and I/O failures exit 1,
/// command-line misuse exits 2.
fn main() -> ExitCode {
    let args: Vec<OsString> = std::env::args_os().collect();
    match hindsight::run_with_args(&args) {
        Ok(verdict) => ExitCode::from(u8::try_from(verdict).unwrap_or(1)),
        Err(HindsightError::Cli(message)) => {
            eprintln!("{message}");
            ExitCode::from(2)
        }
        Err(error) => {
            eprintln!("hindsight: {error}");
            ExitCode::FAILURE
        }
    }
}
