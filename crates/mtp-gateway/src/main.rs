mod infra {
    pub mod audit;
}
mod runtime;

fn main() -> std::process::ExitCode {
    runtime::run_from_args()
}
