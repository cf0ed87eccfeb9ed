// tagbus
//
// pure-rust tag I/O for PLCs over EtherNet/IP (CIP, PCCC) and Modbus TCP.
// Copyright: 2024, tagbus contributors
// License: MIT

//! standalone Allen-Bradley EIP/CIP test server.
//!
//! ```text
//! ab-server --plc controllogix --path 1,0 --tag 'TestBigArray:DINT[10]'
//! ```

use clap::Parser;
use std::net::SocketAddr;
use tagbus_server::{AbServer, AbServerConfig, ServerFile, ServerPlcKind, ServerTag};

#[derive(Parser)]
#[command(name = "ab-server", about = "Allen-Bradley EIP/CIP test server")]
struct Args {
    /// listen address
    #[arg(long, default_value = "0.0.0.0:44818")]
    bind: SocketAddr,

    /// PLC personality: controllogix, omron, plc5, slc
    #[arg(long, default_value = "controllogix")]
    plc: String,

    /// backplane route the Forward Open path must match
    #[arg(long, default_value = "1,0")]
    path: String,

    /// served tags, repeatable: Name:TYPE[d1,d2,d3]
    #[arg(long = "tag")]
    tags: Vec<String>,

    /// served PCCC data files, repeatable: N7:100 (file 7, 100 elements)
    #[arg(long = "file")]
    files: Vec<String>,

    /// reject the first N Forward Opens as duplicate connections
    #[arg(long, default_value_t = 0)]
    reject_fo: u32,

    /// debug level 0..5
    #[arg(long, default_value_t = 3)]
    debug: u8,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    env_logger::Builder::new()
        .filter_level(match args.debug {
            0 => log::LevelFilter::Off,
            1 => log::LevelFilter::Error,
            2 => log::LevelFilter::Warn,
            3 => log::LevelFilter::Info,
            4 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        })
        .init();

    let kind = match args.plc.to_ascii_lowercase().as_str() {
        "controllogix" | "compactlogix" => ServerPlcKind::ControlLogix,
        "omron" | "omron-njnx" => ServerPlcKind::Omron,
        "plc5" => ServerPlcKind::Plc5,
        "slc" | "slc500" | "micrologix" => ServerPlcKind::Slc,
        other => anyhow::bail!("unknown plc kind {other:?}"),
    };
    let route = args
        .path
        .split(',')
        .map(|p| p.trim().parse::<u8>())
        .collect::<Result<Vec<u8>, _>>()
        .map_err(|_| anyhow::anyhow!("bad route path {:?}", args.path))?;

    let mut config = AbServerConfig {
        bind: args.bind,
        kind,
        route,
        reject_fo: args.reject_fo,
        ..Default::default()
    };
    for spec in &args.tags {
        config.tags.push(ServerTag::parse(spec)?);
    }
    for spec in &args.files {
        config.files.push(ServerFile::parse(spec)?);
    }
    if config.tags.is_empty() && config.files.is_empty() {
        config.tags.push(ServerTag::parse("TestBigArray:DINT[10]")?);
        config.files.push(ServerFile::parse("N7:100")?);
    }

    let server = AbServer::spawn(config).await?;
    println!("ab-server listening on {}", server.addr);
    tokio::signal::ctrl_c().await?;
    server.stop();
    Ok(())
}
