use std::process::ExitCode;

fn main() -> ExitCode {
    guest_threads::run_cli()
}
