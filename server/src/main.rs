//! Process entry point: binds the TCP listener, brings up the process-wide
//! RDMA device, pinned slab pool, and cache index, then spawns one
//! connection task per accepted socket on a single-threaded runtime so all
//! socket I/O and state mutation stay on one event-loop thread.

use anyhow::{Context, Result};
use cache::CacheIndex;
use gpu::SimulatedRuntime;
use log::{error, info};
use psa::SlabPool;
use rdma::RdmaDevice;
use server::config::Config;
use server::connection;
use server::state::AppState;
use socket2::{Domain, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// `infinistore.cpp`'s `register_server` passes this straight to `uv_listen`.
const LISTEN_BACKLOG: i32 = 128;

fn main() -> Result<()> {
    env_logger::init();
    install_segv_handler();

    let config = Config::from_env().context("loading configuration")?;

    // Socket I/O and all state mutation run on this one thread;
    // `max_blocking_threads` bounds the pool the copy orchestrator's
    // deferred drain-and-release tasks run on.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .max_blocking_threads(config.worker_threads)
        .build()
        .context("failed to build the tokio runtime")?;

    match runtime.block_on(run(config)) {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("fatal startup failure: {:#}", e);
            std::process::exit(1);
        }
    }
}

async fn run(config: Config) -> Result<()> {
    info!("starting cache server: {:?}", config);

    let device = RdmaDevice::open(&config.device_name).context("opening RDMA device")?;
    let pool = Arc::new(
        SlabPool::new(&device, config.total_bytes(), config.block_bytes as usize)
            .context("registering pinned slab pool")?,
    );
    let cache = Arc::new(CacheIndex::new());
    let gpu: Arc<dyn gpu::GpuRuntime> = Arc::new(SimulatedRuntime::new());

    let app_state = Arc::new(AppState {
        config: config.clone(),
        device,
        pool,
        cache,
        gpu,
    });

    let listener = bind_listener(config.service_port)
        .with_context(|| format!("binding TCP listener on port {}", config.service_port))?;
    info!(
        "listening on 0.0.0.0:{} (backlog {})",
        config.service_port, LISTEN_BACKLOG
    );

    let mut shutdown = shutdown_signal();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer)) => {
                        info!(
                            "accepted connection from {} (cache: {} keys, pool: {}/{} slabs free, block_bytes={})",
                            peer,
                            app_state.cache.len(),
                            app_state.pool.free_slots(),
                            app_state.pool.num_slabs(),
                            app_state.pool.block_bytes(),
                        );
                        let state = app_state.clone();
                        // `current_thread` runtime: every spawned task still
                        // runs on the one event-loop thread.
                        tokio::spawn(async move {
                            connection::run(state, socket, peer).await;
                        });
                    }
                    Err(e) => error!("accept failed: {}", e),
                }
            }
            _ = &mut shutdown => {
                info!("received shutdown signal, stopping event loop");
                break;
            }
        }
    }

    Ok(())
}

/// Binds with an explicit backlog of 128; `tokio::net::TcpListener::bind`
/// doesn't expose the backlog argument directly, so the socket is built and
/// listened on via `socket2` first and handed to tokio afterward.
fn bind_listener(port: u16) -> Result<TcpListener> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into()).context("handing listener socket to tokio")
}

/// Resolves once on SIGINT or SIGTERM; the event loop stops cleanly and the
/// process exits 0.
fn shutdown_signal() -> std::pin::Pin<Box<dyn std::future::Future<Output = ()>>> {
    use tokio::signal::unix::{signal, SignalKind};

    Box::pin(async move {
        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut int = tokio::signal::ctrl_c();
        tokio::select! {
            _ = term.recv() => {}
            _ = &mut int => {}
        }
    })
}

/// Installs a SIGSEGV handler that prints a backtrace and exits with code 1,
/// mirroring `infinistore.cpp`'s `signal_handler`.
fn install_segv_handler() {
    extern "C" fn on_segv(_signum: libc::c_int) {
        eprintln!("caught SIGSEGV: segmentation fault");
        let bt = backtrace::Backtrace::new();
        eprintln!("{:?}", bt);
        std::process::exit(1);
    }

    unsafe {
        libc::signal(libc::SIGSEGV, on_segv as usize);
    }
}
