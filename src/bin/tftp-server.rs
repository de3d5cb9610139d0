use anyhow::{bail, Context, Result};
use argh::FromArgs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use tftp_engine::server::{Server, ServerConfig, DEFAULT_PORT};
use tftp_engine::shutdown;

#[derive(FromArgs, Debug)]
/// Serve the files of a directory over TFTP.
struct Args {
    #[argh(option, short = 'p', default = "DEFAULT_PORT", description = "port to listen on")]
    port: u16,

    #[argh(
        option,
        default = "IpAddr::V4(Ipv4Addr::UNSPECIFIED)",
        description = "address to listen on"
    )]
    bind: IpAddr,

    #[argh(option, description = "ports used for transfers, given as LO-HI")]
    port_range: Option<String>,

    #[argh(switch, description = "refuse all write requests")]
    read_only: bool,

    #[argh(positional, description = "directory files are served from and written to")]
    root: PathBuf,
}

fn parse_port_range(raw: &str) -> Result<RangeInclusive<u16>> {
    let (lo, hi) = raw
        .split_once('-')
        .with_context(|| format!("port range '{raw}' must look like LO-HI"))?;
    let lo: u16 = lo.trim().parse().with_context(|| format!("invalid port '{lo}'"))?;
    let hi: u16 = hi.trim().parse().with_context(|| format!("invalid port '{hi}'"))?;
    if lo == 0 || lo > hi {
        bail!("port range '{raw}' is empty or starts at 0");
    }
    Ok(lo..=hi)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args: Args = argh::from_env();

    if !args.root.is_dir() {
        bail!("{} is not a directory", args.root.display());
    }

    let mut config = ServerConfig::new(args.root);
    config.bind_address = SocketAddr::new(args.bind, args.port);
    config.port_range = args.port_range.as_deref().map(parse_port_range).transpose()?;
    config.allow_writes = !args.read_only;

    let bind_address = config.bind_address;
    let server = Server::bind(config).with_context(|| format!("unable to listen on {bind_address}"))?;

    let (trigger, shutdown) = shutdown::channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                log::info!("Interrupted, shutting down");
                trigger.trigger();
            }
            Err(e) => log::error!("Unable to listen for interrupts: {e}"),
        }
    });

    server.run(shutdown).await?;
    Ok(())
}
