// tagbus
//
// pure-rust tag I/O for PLCs over EtherNet/IP (CIP, PCCC) and Modbus TCP.
// Copyright: 2024, tagbus contributors
// License: MIT

//! # tagbus-server
//!
//! Protocol test servers for `tagbus`: an Allen-Bradley EIP/CIP emulator
//! and a Modbus TCP emulator, each usable as an async task or as a
//! self-contained background thread for blocking round-trip tests.

#![warn(missing_docs)]

#[macro_use]
extern crate log;

pub mod ab;
pub mod modbus;

pub use ab::{AbServer, AbServerConfig, PlcState, ServerFile, ServerPlcKind, ServerTag};
pub use modbus::{ModbusServer, ModbusServerConfig, RegisterFile};

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::watch;

/// a server running on its own background thread and runtime; dropping
/// the handle stops the server and joins the thread
pub struct ServerHandle<S> {
    /// the bound address, useful with an ephemeral port
    pub addr: SocketAddr,
    /// shared server state for test assertions
    pub state: Arc<S>,
    stop: watch::Sender<bool>,
    thread: Option<JoinHandle<()>>,
}

impl<S> ServerHandle<S> {
    /// stop the server without waiting for the thread
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

impl<S> Drop for ServerHandle<S> {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run_on_thread<T, S, F>(
    spawn: impl FnOnce() -> F,
    state_of: impl FnOnce(&T) -> Arc<S>,
) -> anyhow::Result<ServerHandle<S>>
where
    F: std::future::Future<Output = anyhow::Result<T>>,
    T: HasAddr + Send + 'static,
    S: Send + Sync + 'static,
{
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let server = rt.block_on(spawn())?;
    let addr = server.addr();
    let state = state_of(&server);
    let (stop, mut stop_rx) = watch::channel(false);
    let thread = std::thread::Builder::new()
        .name("tagbus-server".into())
        .spawn(move || {
            rt.block_on(async move {
                let _ = stop_rx.changed().await;
                drop(server);
            });
        })?;
    Ok(ServerHandle {
        addr,
        state,
        stop,
        thread: Some(thread),
    })
}

trait HasAddr {
    fn addr(&self) -> SocketAddr;
}

impl HasAddr for AbServer {
    fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl HasAddr for ModbusServer {
    fn addr(&self) -> SocketAddr {
        self.addr
    }
}

/// start an AB test server on a background thread; use `bind` with port
/// zero for an ephemeral port
pub fn start_ab(config: AbServerConfig) -> anyhow::Result<ServerHandle<PlcState>> {
    run_on_thread(
        move || AbServer::spawn(config),
        |server| Arc::clone(&server.state),
    )
}

/// start a Modbus test server on a background thread
pub fn start_modbus(config: ModbusServerConfig) -> anyhow::Result<ServerHandle<RegisterFile>> {
    run_on_thread(
        move || ModbusServer::spawn(config),
        |server| Arc::clone(&server.registers),
    )
}
