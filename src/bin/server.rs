use std::net::UdpSocket;

use anyhow::{Context, Result};
use clap::Parser;
use gstreamer as gst;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gridmix::pipeline::{bind_input_sockets, CompositePipeline};
use gridmix::pools::InputPool;
use gridmix::{Server, ServerConfig, DEFAULT_PORT};

/// Multipoint video conferencing server.
///
/// Clients send RTP/H.264 datagrams (or empty keepalives to watch without
/// publishing) and receive the composited grid back on the same port.
#[derive(Parser, Debug)]
#[command(name = "server")]
#[command(about = "Mix UDP video publishers into one composited H.264 grid")]
struct Args {
    /// UDP port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run() {
        error!("fatal: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let cfg = ServerConfig {
        port: args.port,
        ..Default::default()
    };
    cfg.validate().map_err(anyhow::Error::msg)?;

    gst::init().context("initialize GStreamer")?;

    let socket = UdpSocket::bind(("0.0.0.0", cfg.port))
        .with_context(|| format!("bind client socket on port {}", cfg.port))?;
    let composite_rx =
        UdpSocket::bind("127.0.0.1:0").context("bind composite receive socket")?;
    let sink_port = composite_rx
        .local_addr()
        .context("local address of composite receive socket")?
        .port();

    let input_sockets = bind_input_sockets(cfg.max_clients)?;
    let endpoints = input_sockets
        .iter()
        .map(|s| s.local_addr())
        .collect::<std::io::Result<Vec<_>>>()
        .context("local addresses of input sockets")?;

    let pipeline = CompositePipeline::new(&cfg, sink_port)?;
    for (index, input_socket) in input_sockets.into_iter().enumerate() {
        pipeline.bind_input(index, input_socket)?;
    }
    pipeline.play()?;
    info!(
        port = cfg.port,
        sink_port,
        max_clients = cfg.max_clients,
        "listening"
    );

    let mut server = Server::new(&cfg, socket, composite_rx, InputPool::new(endpoints), pipeline);
    let result = server.run(cfg.sweep_period);

    server.mixer_mut().shutdown();
    result
}
