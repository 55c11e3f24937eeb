use std::process::ExitCode;

fn main() -> ExitCode {
    trove_cli::run()
}
