//! msspi-probe: dial a TLS server, complete a client handshake and fetch `/`.
//!
//! Usage: `msspi-probe [host] [port]` (defaults to `tls.cryptopro.ru:443`).
//!
//! `MSSPI_CONFIG` names an optional TOML configuration file. `MSSPI_ENGINE`
//! selects `native` or `rustls` when both are compiled in.

use std::path::Path;

use anyhow::{Context, Result, bail};
use msspi_net::{EngineProvider, Session, StdNetworkStream};
use msspi_types::config::MsspiConfig;

const DEFAULT_HOST: &str = "tls.cryptopro.ru";
const DEFAULT_PORT: u16 = 443;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = match args.next() {
        Some(p) => p.parse().with_context(|| format!("invalid port {p:?}"))?,
        None => DEFAULT_PORT,
    };

    let config = match std::env::var_os("MSSPI_CONFIG") {
        Some(path) => MsspiConfig::load(Path::new(&path))?,
        None => MsspiConfig::default(),
    };

    let engine = std::env::var("MSSPI_ENGINE").unwrap_or_else(|_| default_engine().to_string());
    log::info!("Probing {host}:{port} with the {engine} engine");
    match engine.as_str() {
        #[cfg(feature = "native")]
        "native" => probe(&msspi_net::NativeProvider, &host, port, &config),
        #[cfg(feature = "engine-rustls")]
        "rustls" => probe(&msspi_net::RustlsProvider::new(), &host, port, &config),
        other => bail!("engine {other:?} is not available in this build"),
    }
}

fn default_engine() -> &'static str {
    if cfg!(feature = "native") {
        "native"
    } else {
        "rustls"
    }
}

fn probe<P: EngineProvider>(
    provider: &P,
    host: &str,
    port: u16,
    config: &MsspiConfig,
) -> Result<()> {
    let stream = StdNetworkStream::connect(host, port, &config.transport)
        .with_context(|| format!("connecting to {host}:{port}"))?;
    let mut session = Session::client(provider, Box::new(stream), &[], host)?
        .with_handshake_config(config.handshake);
    session.handshake().context("TLS handshake")?;

    let protocol = session
        .protocol_version()
        .map_or_else(|| format!("{:#06x}", session.version_tls()), |v| v.to_string());
    println!("protocol:          {protocol}");
    println!("cipher suite:      {:#06x}", session.cipher_suite());
    println!("peer certificates: {}", session.peer_certificates().len());
    println!("verified chain:    {}", session.verified_chains().len());

    let request = format!("GET / HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    session.write(request.as_bytes()).context("sending request")?;

    let mut response = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match session.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => response.extend_from_slice(&buf[..n]),
            Err(e) if e.is_eof() => break,
            Err(e) => return Err(e).context("reading response"),
        }
    }

    let status = response
        .split(|&b| b == b'\n')
        .next()
        .map(|line| String::from_utf8_lossy(line).trim().to_string())
        .unwrap_or_default();
    println!("response:          {} bytes ({status})", response.len());

    if let Err(e) = session.close() {
        log::warn!("Close failed: {e}");
    }
    Ok(())
}
