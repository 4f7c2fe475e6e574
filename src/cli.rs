use crate::config::TunnelKind;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "sshtunnel", about = "Supervise SSH tunnel processes", version)]
pub struct Cli {
    /// Print responses as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start tunnel groups (all configured groups when no name is given)
    Start { names: Vec<String> },
    /// Stop tunnel groups
    Stop { names: Vec<String> },
    /// Stop then start tunnel groups
    Restart { names: Vec<String> },
    /// Show state, pid and reachability
    #[command(visible_alias = "list")]
    Status { name: Option<String> },
    /// Add a tunnel to a group: local PORT HOST PORT | remote LHOST LPORT HOST PORT | dynamic PORT
    Add {
        group: String,
        tunnel: String,
        #[arg(allow_hyphen_values = true)]
        kind: TunnelKind,
        #[arg(required = true, num_args = 1..)]
        params: Vec<String>,
    },
    /// Remove every tunnel with this name from a group
    Remove { group: String, tunnel: String },
    /// Stop orphaned tunnels and restart every configured group
    Reload,
    /// Run the supervisor in the foreground
    Daemon,
    /// Stop all tunnels and shut down the daemon
    Kill,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_no_args() {
        let cli = Cli::try_parse_from(["sshtunnel", "start"]).unwrap();
        match cli.command.unwrap() {
            Command::Start { names } => assert!(names.is_empty()),
            _ => panic!("expected Start"),
        }
    }

    #[test]
    fn test_stop_with_multiple_names() {
        let cli = Cli::try_parse_from(["sshtunnel", "stop", "siteA", "siteB"]).unwrap();
        match cli.command.unwrap() {
            Command::Stop { names } => assert_eq!(names, vec!["siteA", "siteB"]),
            _ => panic!("expected Stop"),
        }
    }

    #[test]
    fn test_restart_with_name() {
        let cli = Cli::try_parse_from(["sshtunnel", "restart", "siteA"]).unwrap();
        match cli.command.unwrap() {
            Command::Restart { names } => assert_eq!(names, vec!["siteA"]),
            _ => panic!("expected Restart"),
        }
    }

    #[test]
    fn test_status_optional_name() {
        let cli = Cli::try_parse_from(["sshtunnel", "status"]).unwrap();
        assert!(matches!(cli.command.unwrap(), Command::Status { name: None }));

        let cli = Cli::try_parse_from(["sshtunnel", "list", "siteA"]).unwrap();
        match cli.command.unwrap() {
            Command::Status { name } => assert_eq!(name.as_deref(), Some("siteA")),
            _ => panic!("expected Status"),
        }
    }

    #[test]
    fn test_add_local() {
        let cli =
            Cli::try_parse_from(["sshtunnel", "add", "siteA", "web", "local", "8080", "localhost", "80"])
                .unwrap();
        match cli.command.unwrap() {
            Command::Add {
                group,
                tunnel,
                kind,
                params,
            } => {
                assert_eq!(group, "siteA");
                assert_eq!(tunnel, "web");
                assert_eq!(kind, TunnelKind::Local);
                assert_eq!(params, vec!["8080", "localhost", "80"]);
            }
            _ => panic!("expected Add"),
        }
    }

    #[test]
    fn test_add_accepts_flag_style_kind() {
        let cli = Cli::try_parse_from(["sshtunnel", "add", "siteA", "socks", "-D", "1080"]).unwrap();
        match cli.command.unwrap() {
            Command::Add { kind, params, .. } => {
                assert_eq!(kind, TunnelKind::Dynamic);
                assert_eq!(params, vec!["1080"]);
            }
            _ => panic!("expected Add"),
        }
    }

    #[test]
    fn test_add_requires_params() {
        assert!(Cli::try_parse_from(["sshtunnel", "add", "siteA", "web", "local"]).is_err());
        assert!(Cli::try_parse_from(["sshtunnel", "add", "siteA", "web", "sideways", "1"]).is_err());
    }

    #[test]
    fn test_remove() {
        let cli = Cli::try_parse_from(["sshtunnel", "remove", "siteA", "web"]).unwrap();
        match cli.command.unwrap() {
            Command::Remove { group, tunnel } => {
                assert_eq!(group, "siteA");
                assert_eq!(tunnel, "web");
            }
            _ => panic!("expected Remove"),
        }
    }

    #[test]
    fn test_plain_subcommands() {
        let parse = |arg: &str| Cli::try_parse_from(["sshtunnel", arg]).unwrap().command;
        assert!(matches!(parse("reload"), Some(Command::Reload)));
        assert!(matches!(parse("daemon"), Some(Command::Daemon)));
        assert!(matches!(parse("kill"), Some(Command::Kill)));
    }

    #[test]
    fn test_global_json_flag() {
        let cli = Cli::try_parse_from(["sshtunnel", "status", "--json"]).unwrap();
        assert!(cli.json);
    }

    #[test]
    fn test_unknown_subcommand() {
        assert!(Cli::try_parse_from(["sshtunnel", "bogus"]).is_err());
    }

    #[test]
    fn test_no_args_no_command() {
        let cli = Cli::try_parse_from(["sshtunnel"]).unwrap();
        assert!(cli.command.is_none());
    }
}
