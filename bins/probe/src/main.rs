//! bxp-probe - connect to a BEEP listener and show its greeting.

use std::time::Duration;

use clap::Parser;
use serde::Serialize;

use bxp::peer::{Context, IoMechanism, Session, SessionOpts, Transport};

#[derive(Parser)]
#[command(name = "bxp-probe", version, about = "BEEP greeting probe")]
struct Cli {
    /// Host to connect to.
    host: String,

    /// Port to connect to.
    #[arg(default_value_t = 10288)]
    port: u16,

    /// Use IPv6.
    #[arg(short = '6')]
    ipv6: bool,

    /// Output JSON.
    #[arg(short = 'j', long)]
    json: bool,

    /// Pretty print JSON.
    #[arg(short = 'p', long)]
    pretty: bool,

    /// Connect timeout in seconds.
    #[arg(short = 't', long)]
    timeout: Option<u64>,

    /// I/O waiting mechanism (select, poll, epoll).
    #[arg(long)]
    io: Option<IoMechanismArg>,

    /// serverName to request on the session.
    #[arg(long)]
    server_name: Option<String>,
}

#[derive(Clone)]
struct IoMechanismArg(IoMechanism);

impl std::str::FromStr for IoMechanismArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        s.parse()
            .map(IoMechanismArg)
            .map_err(|()| format!("unknown I/O mechanism '{s}', expected select, poll or epoll"))
    }
}

#[derive(Serialize)]
struct GreetingReport {
    host: String,
    port: u16,
    session_id: u64,
    local_addr: Option<String>,
    local_port: Option<u16>,
    features: Option<String>,
    localize: Option<String>,
    profiles: Vec<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();

    let ctx = Context::new();
    if let Some(secs) = cli.timeout {
        ctx.set_connect_timeout(Duration::from_secs(secs));
    }
    if let Some(IoMechanismArg(mechanism)) = cli.io {
        ctx.set_io_mechanism(mechanism);
    }

    let transport = if cli.ipv6 {
        Transport::Ipv6
    } else {
        Transport::Ipv4
    };
    let opts = SessionOpts {
        server_name: cli.server_name.clone(),
        acquire_server_name: false,
    };

    let session = match Session::connect_full(&ctx, &cli.host, cli.port, transport, opts) {
        Ok(session) => session,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let report = GreetingReport {
        host: cli.host.clone(),
        port: cli.port,
        session_id: session.id(),
        local_addr: session.local_addr(),
        local_port: session.local_port(),
        features: session.features(),
        localize: session.localize(),
        profiles: session.remote_profiles(),
    };

    if cli.json {
        let rendered = if cli.pretty {
            serde_json::to_string_pretty(&report)
        } else {
            serde_json::to_string(&report)
        };
        match rendered {
            Ok(out) => println!("{out}"),
            Err(e) => {
                eprintln!("Error: {e}");
                std::process::exit(1);
            }
        }
    } else {
        println!(
            "connected to {}:{} (session {})",
            report.host, report.port, report.session_id
        );
        if let Some(features) = &report.features {
            println!("features: {features}");
        }
        if let Some(localize) = &report.localize {
            println!("localize: {localize}");
        }
        if report.profiles.is_empty() {
            println!("peer advertises no profiles");
        } else {
            println!("profiles:");
            for uri in &report.profiles {
                println!("  {uri}");
            }
        }
    }

    session.close();
}
