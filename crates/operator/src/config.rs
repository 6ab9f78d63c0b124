use clap::{ArgAction, CommandFactory, Parser};

use crate::manager::{ManagerOptions, DEFAULT_HEALTH_PROBE_ADDR, DEFAULT_METRICS_ADDR};
use crate::singleton::CreatePolicy;

#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Eq)]
pub enum LogFormat { Text, Json }

#[derive(Parser, Debug)]
#[command(name = "observability-operator", version, about = "Managed-services Observability operator")]
pub struct Cli {
    /// The address the metric endpoint binds to.
    #[arg(long, env = "OBSERVABILITY_OPERATOR_METRICS_ADDR", default_value = DEFAULT_METRICS_ADDR)]
    pub metrics_addr: String,
    /// Enable leader election for controller manager. Enabling this will ensure there is only one active controller manager.
    #[arg(long, env = "OBSERVABILITY_OPERATOR_ENABLE_LEADER_ELECTION", action = ArgAction::Set, num_args = 0..=1, require_equals = true, default_value_t = false, default_missing_value = "true")]
    pub enable_leader_election: bool,
    /// The address the health and readiness probes bind to.
    #[arg(long, env = "OBSERVABILITY_OPERATOR_HEALTH_PROBE_ADDR", default_value = DEFAULT_HEALTH_PROBE_ADDR)]
    pub health_probe_addr: String,
    /// Namespace holding the leader election lease. Defaults to the pod's namespace.
    #[arg(long, env = "OBSERVABILITY_OPERATOR_LEADER_ELECTION_NAMESPACE")]
    pub leader_election_namespace: Option<String>,
    /// Adopt an Observability object left over from a previous run instead of failing.
    #[arg(long, env = "OBSERVABILITY_OPERATOR_ADOPT_EXISTING_SINGLETON", action = ArgAction::Set, num_args = 0..=1, require_equals = true, default_value_t = false, default_missing_value = "true")]
    pub adopt_existing_singleton: bool,
    /// Log level: trace|debug|info|warn|error
    #[arg(long, env = "OBSERVABILITY_OPERATOR_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
    #[arg(long, env = "OBSERVABILITY_OPERATOR_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,
}

impl Cli {
    /// Parses the process arguments, accepting Go-style single-dash flags.
    pub fn parse_args() -> Self {
        Self::parse_from(normalize_args(std::env::args()))
    }

    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            metrics_bind_address: self.metrics_addr.clone(),
            health_probe_bind_address: self.health_probe_addr.clone(),
            leader_election: self.enable_leader_election,
            leader_election_namespace: self.leader_election_namespace.clone(),
            ..ManagerOptions::default()
        }
    }

    pub fn create_policy(&self) -> CreatePolicy {
        if self.adopt_existing_singleton { CreatePolicy::AdoptExisting } else { CreatePolicy::Strict }
    }
}

/// Rewrites `-metrics-addr=:9090` to `--metrics-addr=:9090` for every long
/// flag the CLI knows. Anything else passes through untouched.
pub fn normalize_args<I, S>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let cmd = Cli::command();
    let longs: Vec<&str> = cmd.get_arguments().filter_map(|a| a.get_long()).chain(["help", "version"]).collect();
    args.into_iter()
        .map(Into::into)
        .map(|arg| {
            let Some(rest) = arg.strip_prefix('-') else { return arg };
            if rest.starts_with('-') {
                return arg;
            }
            let name = rest.split('=').next().unwrap_or(rest);
            if name.len() > 1 && longs.contains(&name) { format!("-{arg}") } else { arg }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(normalize_args(args.iter().copied())).unwrap()
    }

    #[test]
    fn go_style_flags_configure_manager() {
        let cli = parse(&["observability-operator", "-metrics-addr=:9090", "-enable-leader-election=true"]);
        let opts = cli.manager_options();
        assert_eq!(opts.metrics_bind_address, ":9090");
        assert_eq!(opts.port, 9443);
        assert!(opts.leader_election);
        assert_eq!(opts.leader_election_id, "04220e3f.redhat.com");
    }

    #[test]
    fn defaults_without_flags() {
        let cli = parse(&["observability-operator"]);
        let opts = cli.manager_options();
        assert_eq!(opts.metrics_bind_address, ":8080");
        assert!(!opts.leader_election);
        assert_eq!(cli.create_policy(), CreatePolicy::Strict);
        assert_eq!(cli.log_format, LogFormat::Text);
    }

    #[test]
    fn bare_bool_flag_means_true() {
        let cli = parse(&["observability-operator", "--enable-leader-election", "--adopt-existing-singleton"]);
        assert!(cli.enable_leader_election);
        assert_eq!(cli.create_policy(), CreatePolicy::AdoptExisting);
    }

    #[test]
    fn unknown_single_dash_args_are_untouched() {
        assert_eq!(normalize_args(["-v", "-unknown=1", "--metrics-addr", "-metrics-addr"]), vec!["-v", "-unknown=1", "--metrics-addr", "--metrics-addr"]);
    }
}
