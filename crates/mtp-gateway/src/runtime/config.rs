use std::path::PathBuf;

#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub show_help: bool,
    pub config_path: Option<PathBuf>,
    pub override_path: Option<PathBuf>,
    pub check_config: bool,
    pub simulate: bool,
    pub run_seconds: Option<u64>,
    pub json_logs: bool,
    pub log_dir: Option<PathBuf>,
    pub metrics_addr: Option<String>,
    pub audit_path: Option<PathBuf>,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let args: Vec<String> = std::env::args().collect();
        Self::from_args(&args)
    }

    pub fn from_args(args: &[String]) -> Self {
        let mut cfg = RuntimeConfig::default();
        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--config" | "-c" => {
                    if i + 1 < args.len() {
                        cfg.config_path = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--override" => {
                    if i + 1 < args.len() {
                        cfg.override_path = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--check-config" => {
                    cfg.check_config = true;
                }
                "--simulate" => {
                    cfg.simulate = true;
                }
                "--run-seconds" => {
                    if i + 1 < args.len() {
                        cfg.run_seconds = args[i + 1].parse::<u64>().ok();
                        i += 1;
                    }
                }
                "--json-logs" => {
                    cfg.json_logs = true;
                }
                "--log-dir" => {
                    if i + 1 < args.len() {
                        cfg.log_dir = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--metrics-addr" => {
                    if i + 1 < args.len() {
                        cfg.metrics_addr = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--audit-log" => {
                    if i + 1 < args.len() {
                        cfg.audit_path = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--help" | "-h" => {
                    cfg.show_help = true;
                    break;
                }
                _ => {}
            }
            i += 1;
        }
        cfg
    }

    pub fn print_help() {
        println!(
            r#"mtp-gateway - MTP/PackML gateway between a process orchestration layer and field PLCs

USAGE:
    mtp-gateway --config <PATH> [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Gateway configuration document (YAML)
    --override <PATH>       Second YAML document deep-merged over the first
    --check-config          Load and validate the configuration, then exit
    --simulate              Replace every connector with a simulated one
    --run-seconds <SECS>    Run for a fixed duration then exit
    --json-logs             Output logs in JSON format (for log aggregation)
    --log-dir <DIR>         Also write JSON logs to a daily rolling file in DIR
    --metrics-addr <ADDR>   Enable Prometheus metrics server on address (e.g., 0.0.0.0:9090)
    --audit-log <PATH>      Enable audit logging to specified JSONL file
    -h, --help              Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log filter (e.g., RUST_LOG=debug,mtp_io=trace)
    ${{VAR}}                  Referenced from string values in the configuration

EXAMPLES:
    # Validate a configuration
    mtp-gateway --config gateway.yaml --check-config

    # Dry run against simulated PLCs
    mtp-gateway --config gateway.yaml --simulate --run-seconds 30

    # Production run with all observability
    mtp-gateway --config gateway.yaml --json-logs --metrics-addr 0.0.0.0:9090 --audit-log /var/log/mtp/audit.jsonl
"#
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("mtp-gateway")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parses_run_options() {
        let cfg = RuntimeConfig::from_args(&args(&[
            "--config",
            "plant.yaml",
            "--override",
            "site.yaml",
            "--simulate",
            "--run-seconds",
            "5",
            "--metrics-addr",
            "127.0.0.1:9090",
        ]));
        assert_eq!(cfg.config_path, Some(PathBuf::from("plant.yaml")));
        assert_eq!(cfg.override_path, Some(PathBuf::from("site.yaml")));
        assert!(cfg.simulate);
        assert_eq!(cfg.run_seconds, Some(5));
        assert_eq!(cfg.metrics_addr.as_deref(), Some("127.0.0.1:9090"));
        assert!(!cfg.check_config);
    }

    #[test]
    fn help_stops_parsing() {
        let cfg = RuntimeConfig::from_args(&args(&["-h", "--simulate"]));
        assert!(cfg.show_help);
        assert!(!cfg.simulate);
    }

    #[test]
    fn dangling_flag_is_ignored() {
        let cfg = RuntimeConfig::from_args(&args(&["--check-config", "--config"]));
        assert!(cfg.check_config);
        assert_eq!(cfg.config_path, None);
    }
}
