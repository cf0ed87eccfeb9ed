// tagbus
//
// pure-rust tag I/O for PLCs over EtherNet/IP (CIP, PCCC) and Modbus TCP.
// Copyright: 2024, tagbus contributors
// License: MIT

//! standalone Modbus TCP test server.

use clap::Parser;
use std::net::SocketAddr;
use tagbus_server::{ModbusServer, ModbusServerConfig};

#[derive(Parser)]
#[command(name = "modbus-server", about = "Modbus TCP test server")]
struct Args {
    /// listen address
    #[arg(long, default_value = "0.0.0.0:502")]
    bind: SocketAddr,

    /// unit id answered by the server
    #[arg(long, default_value_t = 1)]
    unit: u8,

    /// register file sizes
    #[arg(long, default_value_t = 65536)]
    coils: usize,
    #[arg(long, default_value_t = 65536)]
    discretes: usize,
    #[arg(long, default_value_t = 65536)]
    holding: usize,
    #[arg(long, default_value_t = 65536)]
    inputs: usize,

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

    let config = ModbusServerConfig {
        bind: args.bind,
        unit_id: args.unit,
        coils: args.coils,
        discretes: args.discretes,
        holding: args.holding,
        inputs: args.inputs,
    };
    let server = ModbusServer::spawn(config).await?;
    println!("modbus-server listening on {}", server.addr);
    tokio::signal::ctrl_c().await?;
    server.stop();
    Ok(())
}
