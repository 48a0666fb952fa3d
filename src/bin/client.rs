use std::net::{ToSocketAddrs, UdpSocket};
use std::os::fd::OwnedFd;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use gstreamer as gst;
use gstreamer::prelude::*;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use gridmix::pipeline::rtp_video_caps;
use gridmix::{ServerConfig, DEFAULT_PORT};

/// Conferencing client: publishes one camera (or test pattern) stream to
/// the server and plays back the composited grid.
///
/// One UDP socket carries both directions, so the server pairs the
/// outgoing composite with the 5-tuple our published stream arrives on.
#[derive(Parser, Debug)]
#[command(name = "client")]
#[command(about = "Publish a video stream and watch the composited grid")]
struct Args {
    /// Use a synthetic test pattern instead of a capture device
    #[arg(short = 't', long)]
    test_pattern: bool,

    /// Video4Linux capture device
    #[arg(short, long, default_value = "/dev/video0")]
    device: String,

    /// Server UDP port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Watch without publishing; sends keepalives so the server keeps us
    /// in the fan-out set
    #[arg(long)]
    view_only: bool,

    /// Server host
    #[arg(default_value = "127.0.0.1")]
    host: String,
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
    let cfg = ServerConfig::default();

    gst::init().context("initialize GStreamer")?;

    let socket = UdpSocket::bind("0.0.0.0:0").context("bind client socket")?;

    if args.view_only {
        let keepalive = socket.try_clone().context("clone keepalive socket")?;
        let server_addr = (args.host.as_str(), args.port)
            .to_socket_addrs()
            .with_context(|| format!("resolve {}:{}", args.host, args.port))?
            .next()
            .ok_or_else(|| anyhow!("no address found for {}", args.host))?;
        thread::spawn(move || loop {
            if let Err(err) = keepalive.send_to(&[], server_addr) {
                warn!(%err, "keepalive send failed");
            }
            thread::sleep(Duration::from_secs(1));
        });
        info!(%server_addr, "view-only, sending keepalives");
    }

    let gsocket = unsafe { gio::Socket::from_fd(OwnedFd::from(socket)) }
        .context("wrap client socket as a GSocket")?;

    let playback = playback_pipeline(&gsocket)?;
    let _playback_watch = watch_bus(&playback, "playback")?;

    let capture = if args.view_only {
        None
    } else {
        let capture = capture_pipeline(&args, &cfg, &gsocket)?;
        let watch = watch_bus(&capture, "capture")?;
        Some((capture, watch))
    };

    playback
        .set_state(gst::State::Playing)
        .context("failed to start playback pipeline")?;
    if let Some((capture, _)) = &capture {
        capture
            .set_state(gst::State::Playing)
            .context("failed to start capture pipeline")?;
    }
    info!(host = %args.host, port = args.port, "running");

    let main_loop = gst::glib::MainLoop::new(None, false);
    main_loop.run();

    if let Some((capture, _)) = &capture {
        let _ = capture.set_state(gst::State::Null);
    }
    let _ = playback.set_state(gst::State::Null);
    Ok(())
}

/// udpsrc (shared socket) ! rtph264depay ! avdec_h264 ! videoconvert !
/// autovideosink
fn playback_pipeline(socket: &gio::Socket) -> Result<gst::Pipeline> {
    let pipeline = gst::Pipeline::new();

    let source = make("udpsrc")?;
    source.set_property("caps", &rtp_video_caps());
    source.set_property("socket", socket);
    source.set_property("close-socket", false);
    let depay = make("rtph264depay")?;
    let decoder = make("avdec_h264")?;
    let convert = make("videoconvert")?;
    let sink = make("autovideosink")?;

    pipeline.add_many(&[&source, &depay, &decoder, &convert, &sink])?;
    gst::Element::link_many(&[&source, &depay, &decoder, &convert, &sink])
        .context("failed to link playback pipeline")?;
    Ok(pipeline)
}

/// v4l2src or videotestsrc ! videoconvert ! videoscale ! cell caps !
/// videoconvert ! x264enc ! rtph264pay ! udpsink (shared socket)
fn capture_pipeline(args: &Args, cfg: &ServerConfig, socket: &gio::Socket) -> Result<gst::Pipeline> {
    let pipeline = gst::Pipeline::new();

    let source = if args.test_pattern {
        let source = make("videotestsrc")?;
        source.set_property_from_str("pattern", "ball");
        source
    } else {
        let source = make("v4l2src")?;
        source.set_property("device", args.device.as_str());
        source
    };
    let convert_in = make("videoconvert")?;
    let scale = make("videoscale")?;
    let caps = make("capsfilter")?;
    caps.set_property(
        "caps",
        &gst::Caps::builder("video/x-raw")
            .field("framerate", gst::Fraction::new(cfg.framerate as i32, 1))
            .field("width", cfg.cell_width as i32)
            .field("height", cfg.cell_height as i32)
            .build(),
    );
    let convert_out = make("videoconvert")?;
    let encoder = make("x264enc")?;
    encoder.set_property_from_str("tune", "zerolatency");
    encoder.set_property_from_str("speed-preset", "superfast");
    encoder.set_property("bitrate", cfg.bitrate_kbps);
    let pay = make("rtph264pay")?;
    pay.set_property("pt", 96u32);
    let sink = make("udpsink")?;
    sink.set_property("host", args.host.as_str());
    sink.set_property("port", i32::from(args.port));
    sink.set_property("socket", socket);
    sink.set_property("close-socket", false);

    pipeline.add_many(&[
        &source,
        &convert_in,
        &scale,
        &caps,
        &convert_out,
        &encoder,
        &pay,
        &sink,
    ])?;
    gst::Element::link_many(&[
        &source,
        &convert_in,
        &scale,
        &caps,
        &convert_out,
        &encoder,
        &pay,
        &sink,
    ])
    .context("failed to link capture pipeline")?;
    Ok(pipeline)
}

fn watch_bus(pipeline: &gst::Pipeline, label: &'static str) -> Result<gst::bus::BusWatchGuard> {
    let bus = pipeline
        .bus()
        .ok_or_else(|| anyhow!("{label} pipeline has no bus"))?;
    bus.add_watch(move |_, msg| {
        match msg.view() {
            gst::MessageView::Error(err) => {
                error!(pipeline = label, error = %err.error(), debug = ?err.debug(), "pipeline error");
            }
            gst::MessageView::Warning(warning) => {
                warn!(pipeline = label, warning = %warning.error(), "pipeline warning");
            }
            gst::MessageView::Eos(..) => {
                info!(pipeline = label, "end of stream");
            }
            _ => {}
        }
        gst::glib::ControlFlow::Continue
    })
    .with_context(|| format!("watch {label} pipeline bus"))
}

fn make(factory: &str) -> Result<gst::Element> {
    gst::ElementFactory::make(factory)
        .build()
        .map_err(|_| anyhow!("missing GStreamer element: {factory}"))
}
