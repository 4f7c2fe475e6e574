use clap::{CommandFactory, Parser};
use comfy_table::{Attribute, Cell, Color, Table, presets::UTF8_FULL_CONDENSED};
use owo_colors::OwoColorize;
use sshtunnel::cli::{Cli, Command};
use sshtunnel::config::TunnelSpec;
use sshtunnel::paths::Paths;
use sshtunnel::probe::Reachability;
use sshtunnel::protocol::{BatchReport, GroupStatus, Request, Response, TunnelState};
use sshtunnel::settings::Settings;
use sshtunnel::supervisor::Supervisor;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        return Ok(());
    };

    let base = Paths::new()?;
    let settings = Settings::load(&base)?;
    let paths = settings.apply(base);

    if matches!(command, Command::Daemon) {
        init_tracing(&settings.daemon.log_level);
        return sshtunnel::daemon::run(paths, settings).await;
    }
    init_tracing("warn");

    let request = command_to_request(command)?;
    let response = if sshtunnel::client::daemon_available(&paths)? {
        sshtunnel::client::send_request(&paths, &request)?
    } else if matches!(request, Request::Kill) {
        Response::Error {
            message: "daemon is not running".to_string(),
        }
    } else {
        Supervisor::new(paths, &settings).dispatch(request).await
    };

    if cli.json {
        println!("{}", serde_json::to_string(&response)?);
    } else {
        print_response(&response);
    }

    if is_failure(&response) {
        std::process::exit(1);
    }
    Ok(())
}

/// `SSHTUNNEL_LOG` wins over the configured level.
fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_env("SSHTUNNEL_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn command_to_request(command: Command) -> color_eyre::Result<Request> {
    Ok(match command {
        Command::Start { names } => Request::Start { names },
        Command::Stop { names } => Request::Stop { names },
        Command::Restart { names } => Request::Restart { names },
        Command::Status { name } => Request::Status { name },
        Command::Add {
            group,
            tunnel,
            kind,
            params,
        } => Request::AddTunnel {
            group,
            spec: TunnelSpec::from_params(kind, &tunnel, &params)?,
        },
        Command::Remove { group, tunnel } => Request::RemoveTunnel { group, tunnel },
        Command::Reload => Request::Reload,
        Command::Kill => Request::Kill,
        Command::Daemon => unreachable!("daemon is handled directly in main"),
    })
}

fn is_failure(response: &Response) -> bool {
    match response {
        Response::Error { .. } => true,
        Response::Report { report } => !report.is_success(),
        _ => false,
    }
}

fn state_color(state: TunnelState) -> Color {
    match state {
        TunnelState::Running => Color::Green,
        TunnelState::Starting | TunnelState::Stopping => Color::Yellow,
        TunnelState::Stale => Color::Red,
        TunnelState::Absent => Color::Reset,
    }
}

fn reachability_color(reachability: &Reachability) -> Color {
    match reachability {
        Reachability::Reachable { .. } => Color::Green,
        Reachability::Unreachable | Reachability::TimedOut => Color::Red,
        Reachability::Unknown => Color::Reset,
    }
}

fn print_response(response: &Response) {
    match response {
        Response::Success { message } => {
            println!("{}", message.as_deref().unwrap_or("ok").green());
        }
        Response::Error { message } => {
            eprintln!("{} {}", "error:".red().bold(), message);
        }
        Response::Report { report } => print_report(report),
        Response::Status { groups } => print_status(groups),
    }
}

fn print_report(report: &BatchReport) {
    if report.is_empty() {
        println!("{}", "no tunnel groups configured".yellow());
        return;
    }
    for (name, message) in &report.succeeded {
        println!("{} {}", format!("{name}:").cyan().bold(), message.green());
    }
    for (name, error) in &report.failed {
        eprintln!("{} {}", format!("{name}:").cyan().bold(), error.red());
    }
}

fn print_status(groups: &[GroupStatus]) {
    if groups.is_empty() {
        println!("{}", "no tunnel groups configured".yellow());
        return;
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec![
        Cell::new("name").add_attribute(Attribute::Bold),
        Cell::new("state").add_attribute(Attribute::Bold),
        Cell::new("pid").add_attribute(Attribute::Bold),
        Cell::new("uptime").add_attribute(Attribute::Bold),
        Cell::new("endpoint").add_attribute(Attribute::Bold),
        Cell::new("reachability").add_attribute(Attribute::Bold),
        Cell::new("tunnels").add_attribute(Attribute::Bold),
    ]);
    for g in groups {
        let pid = g
            .pid
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        let uptime = if g.alive {
            format_uptime(
                g.launched_at
                    .map(|t| (chrono::Utc::now() - t).num_seconds().max(0) as u64),
            )
        } else {
            "-".to_string()
        };
        let name = if g.configured {
            Cell::new(&g.name).fg(Color::Cyan)
        } else {
            Cell::new(format!("{} (orphan)", g.name)).fg(Color::Magenta)
        };
        let tunnels = match &g.error {
            Some(error) => Cell::new(error).fg(Color::Red),
            None => Cell::new(g.tunnels.join("\n")),
        };
        table.add_row(vec![
            name,
            Cell::new(g.state.to_string()).fg(state_color(g.state)),
            Cell::new(&pid),
            Cell::new(&uptime),
            Cell::new(g.endpoint.as_deref().unwrap_or("-")),
            Cell::new(g.reachability.to_string()).fg(reachability_color(&g.reachability)),
            tunnels,
        ]);
    }
    println!("{table}");
}

fn format_uptime(seconds: Option<u64>) -> String {
    match seconds {
        None => "-".to_string(),
        Some(s) if s < 60 => format!("{s}s"),
        Some(s) if s < 3600 => format!("{}m {}s", s / 60, s % 60),
        Some(s) if s < 86400 => format!("{}h {}m", s / 3600, (s % 3600) / 60),
        Some(s) => format!("{}d {}h", s / 86400, (s % 86400) / 3600),
    }
}
