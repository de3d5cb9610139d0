use anyhow::{Context, Result};
use argh::FromArgs;
use std::path::Path;
use tftp_engine::client::{Client, ClientConfig};
use tftp_engine::options::{OptionSet, BLKSIZE, TIMEOUT, TSIZE};
use tftp_engine::server::DEFAULT_PORT;
use tftp_engine::shutdown;
use tftp_engine::tftp::FileMode;

#[derive(FromArgs, Debug)]
/// Download a file from a TFTP server, or upload standard input to one.
struct Args {
    #[argh(option, short = 'a', description = "host name or address of the server")]
    address: String,

    #[argh(option, short = 'p', default = "DEFAULT_PORT", description = "server port")]
    port: u16,

    #[argh(
        option,
        short = 'f',
        description = "remote file to download; without it standard input is uploaded"
    )]
    from: Option<String>,

    #[argh(
        option,
        short = 't',
        description = "local path a download is saved to, or remote name of an upload"
    )]
    to: String,

    #[argh(option, default = "FileMode::Octet", description = "transfer mode, octet or netascii")]
    mode: FileMode,

    #[argh(option, description = "block size to request")]
    blksize: Option<u16>,

    #[argh(option, description = "timeout in seconds to request")]
    timeout: Option<u8>,

    #[argh(switch, description = "ask the server for the size of a download")]
    tsize: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args: Args = argh::from_env();

    let server = tokio::net::lookup_host((args.address.as_str(), args.port))
        .await
        .with_context(|| format!("unable to resolve {}", args.address))?
        .next()
        .with_context(|| format!("no address found for {}", args.address))?;

    let mut options = OptionSet::new();
    if let Some(blksize) = args.blksize {
        options.insert(BLKSIZE, blksize.to_string());
    }
    if let Some(timeout) = args.timeout {
        options.insert(TIMEOUT, timeout.to_string());
    }
    if args.tsize {
        if args.from.is_some() {
            options.insert(TSIZE, "0");
        } else {
            log::warn!("--tsize only applies to downloads, ignoring it");
        }
    }

    let (trigger, shutdown) = shutdown::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupted, stopping transfer");
            trigger.trigger();
        }
    });

    let client = Client::new(ClientConfig { server, mode: args.mode, options }, shutdown);
    match &args.from {
        Some(remote) => client
            .download(remote, Path::new(&args.to))
            .await
            .with_context(|| format!("download of {remote} from {server} failed"))?,
        None => client
            .upload(tokio::io::stdin(), &args.to)
            .await
            .with_context(|| format!("upload of {} to {server} failed", args.to))?,
    }
    Ok(())
}
