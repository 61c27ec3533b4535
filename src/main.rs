use anyhow::{Context, Result};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use tftpd::server::Server;

// 6969 keeps the default out of privileged-port territory; pass 69 to
// serve the well-known port.
const DEFAULT_PORT: u16 = 6969;

#[tokio::main]
async fn main() -> Result<()> {
    // Set RUST_LOG to control verbosity.
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() > 3 {
        eprintln!("Usage: {} [port] [root_dir]", args[0]);
        eprintln!("Example: {} 6969 /srv/tftp", args[0]);
        std::process::exit(1);
    }

    let port: u16 = match args.get(1) {
        Some(raw) => raw.parse().with_context(|| format!("invalid port: {raw}"))?,
        None => DEFAULT_PORT,
    };
    let root_dir = PathBuf::from(args.get(2).map(String::as_str).unwrap_or("."));

    let server = Server::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)), root_dir)
        .context("binding listener socket")?;
    log::info!("Serving on {}", server.local_addr()?);

    server.run().await;
    Ok(())
}
