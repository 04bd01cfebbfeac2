use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "pulse-ops",
    version,
    about = "Track Pulse remote operations until they settle"
)]
pub(crate) struct Args {
    #[arg(long, default_value = "config/pulse-ops.toml")]
    pub(crate) config: PathBuf,
    #[arg(long, default_value_t = false)]
    pub(crate) log_to_stderr: bool,
    /// Also write JSON logs to a daily rolling file in this directory.
    #[arg(long)]
    pub(crate) log_dir: Option<PathBuf>,
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Run a discovery scan for one resource.
    Discover {
        resource_type: String,
        host: String,
        resource_id: String,
        #[arg(long, default_value_t = false)]
        force: bool,
        #[arg(long)]
        hostname: Option<String>,
    },
    /// Ask a docker agent to stop and uninstall itself.
    StopAgent {
        host: String,
        /// Force removal once the operation runs past the timeout threshold.
        #[arg(long, default_value_t = false)]
        force_on_timeout: bool,
    },
    UpdateContainer {
        host: String,
        container: String,
        #[arg(long)]
        name: Option<String>,
    },
    UpdateAll {
        host: String,
    },
    CheckUpdates {
        host: String,
    },
    /// Print every progress event received on the push channel.
    Watch,
    /// Re-verify audit events whose signature check did not pass.
    AuditResume {
        #[arg(long)]
        state: PathBuf,
        #[arg(long, default_value_t = 25)]
        batch_size: usize,
        /// Run every batch without asking.
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_discover_with_flags() {
        let args = Args::try_parse_from([
            "pulse-ops",
            "--log-to-stderr",
            "discover",
            "vm",
            "pve1",
            "101",
            "--force",
        ])
        .expect("args");
        assert!(args.log_to_stderr);
        assert_eq!(args.config, PathBuf::from("config/pulse-ops.toml"));
        match args.command {
            Command::Discover {
                resource_type,
                force,
                hostname,
                ..
            } => {
                assert_eq!(resource_type, "vm");
                assert!(force);
                assert!(hostname.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parses_audit_resume_defaults() {
        let args = Args::try_parse_from(["pulse-ops", "audit-resume", "--state", "audit.json"])
            .expect("args");
        match args.command {
            Command::AuditResume {
                batch_size, yes, ..
            } => {
                assert_eq!(batch_size, 25);
                assert!(!yes);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
