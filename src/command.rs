use crate::config::TunnelGroup;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// External programs
// ---------------------------------------------------------------------------

/// An external executable plus the fixed arguments it always receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Program {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Program {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// `autossh -M 0 -N`: no monitor port, no remote command.
    pub fn autossh() -> Self {
        Self::new("autossh", &["-M", "0", "-N"])
    }

    /// `trickle -s`: standalone mode, no trickled daemon required.
    pub fn trickle() -> Self {
        Self::new("trickle", &["-s"])
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBuilder {
    pub launcher: Program,
    pub limiter: Program,
}

impl Default for CommandBuilder {
    fn default() -> Self {
        Self {
            launcher: Program::autossh(),
            limiter: Program::trickle(),
        }
    }
}

impl CommandBuilder {
    pub fn new(launcher: Program, limiter: Program) -> Self {
        Self { launcher, limiter }
    }

    /// Render a group into the argv that establishes its tunnels. The first
    /// element is the program to execute.
    pub fn build_argv(&self, group: &TunnelGroup) -> Vec<String> {
        let mut argv = Vec::new();

        if let Some(bw) = group.bandwidth {
            argv.push(self.limiter.program.clone());
            argv.extend(self.limiter.args.iter().cloned());
            argv.extend([
                "-u".to_string(),
                bw.up.to_string(),
                "-d".to_string(),
                bw.down.to_string(),
            ]);
        }

        argv.push(self.launcher.program.clone());
        argv.extend(self.launcher.args.iter().cloned());

        if let Some(ref key) = group.private_key_path {
            argv.push("-i".to_string());
            argv.push(key.clone());
        }
        argv.push(format!("{}@{}", group.user, group.remote_ip));
        argv.push("-p".to_string());
        argv.push(group.ssh_port.to_string());

        if let Some(interval) = group.options.keepalive_interval {
            argv.push("-o".to_string());
            argv.push(format!("ServerAliveInterval={interval}"));
        }
        for (key, value) in &group.options.extra {
            argv.push("-o".to_string());
            argv.push(format!("{key}={value}"));
        }

        for spec in &group.tunnels {
            argv.push(spec.kind().flag().to_string());
            argv.push(spec.forward_arg());
        }

        argv
    }
}

/// Build with the default launcher and limiter.
pub fn build_argv(group: &TunnelGroup) -> Vec<String> {
    CommandBuilder::default().build_argv(group)
}

/// Shell-quoted form of an argv, for logs and status output.
pub fn render(argv: &[String]) -> String {
    shell_words::join(argv)
}
