//! Media pipeline orchestration.
//!
//! The server owns one GStreamer pipeline for its whole lifetime:
//!
//! ```text
//! input_0:  udpsrc ! rtph264depay ! avdec_h264 ! videoscale ! videoconvert ! caps(WxH@fps) !\
//! input_1:  ...                                                                             \
//!                 compositor background=black zero-size-is-unscaled=false
//!                   ! videobox autocrop=true
//!                   ! capsfilter caps=video/x-raw,width=W*cols,height=H*rows
//!                   ! x264enc tune=zerolatency bitrate=500 speed-preset=superfast
//!                   ! rtph264pay
//!                   ! udpsink host=127.0.0.1 port=<composite port>
//! ```
//!
//! Every decode branch exists from startup; whether it is visible in the
//! composite is purely a matter of its compositor pad's alpha and geometry,
//! which the event loop adjusts through [`MixerControl`]. The `udpsrc`
//! elements read from sockets the server binds itself, so the server knows
//! each input's loopback endpoint before the pipeline ever starts.
//!
//! [`MixerControl`] is the seam between routing and media: the event loop
//! and its tests never touch GStreamer types.

use std::net::{Ipv4Addr, UdpSocket};
use std::os::fd::OwnedFd;

use anyhow::{anyhow, Context, Result};
use gstreamer as gst;
use gstreamer::prelude::*;
use tracing::{debug, error, warn};

use crate::config::ServerConfig;
use crate::layout::Origin;

/// Placement of one compositor input pad, in composite pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PadGeometry {
    pub alpha: f64,
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl PadGeometry {
    /// Fully opaque placement at `origin`, one cell large.
    pub fn visible(origin: Origin, width: u32, height: u32) -> Self {
        Self {
            alpha: 1.0,
            x: origin.x,
            y: origin.y,
            width: width as i32,
            height: height as i32,
        }
    }

    /// Invisible zero-size placement. With `zero-size-is-unscaled=false`
    /// the compositor collapses such a pad entirely.
    pub fn hidden() -> Self {
        Self {
            alpha: 0.0,
            x: 0,
            y: 0,
            width: 0,
            height: 0,
        }
    }
}

/// Control surface the event loop drives the media pipeline through.
pub trait MixerControl {
    /// Reposition and reveal or conceal an input pad.
    fn place_pad(&mut self, input: usize, geometry: PadGeometry);

    /// Move an already-placed pad to a new origin, leaving alpha and size
    /// untouched.
    fn move_pad(&mut self, input: usize, origin: Origin);

    /// Crop the composite to `rows` x `cols` cells.
    fn set_crop(&mut self, rows: u32, cols: u32);

    /// Drain pending media-framework notifications. Called periodically.
    fn poll_events(&mut self) {}
}

/// Caps of the RTP/H.264 encapsulation used on every hop: publisher to
/// server, server to pipeline input, composite back to clients.
pub fn rtp_video_caps() -> gst::Caps {
    gst::Caps::builder("application/x-rtp")
        .field("media", "video")
        .field("clock-rate", 90000i32)
        .field("encoding-name", "H264")
        .field("payload", 96i32)
        .build()
}

/// Bind `count` loopback sockets on ephemeral ports, one per pipeline
/// decode input. The sockets live for the whole process.
pub fn bind_input_sockets(count: usize) -> Result<Vec<UdpSocket>> {
    (0..count)
        .map(|index| {
            UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
                .with_context(|| format!("bind pipeline input socket {index}"))
        })
        .collect()
}

/// The composite GStreamer pipeline and its adjustable pieces.
pub struct CompositePipeline {
    pipeline: gst::Pipeline,
    input_sources: Vec<gst::Element>,
    compositor_pads: Vec<gst::Pad>,
    crop_filter: gst::Element,
    cell_width: u32,
    cell_height: u32,
}

impl CompositePipeline {
    /// Build the media graph with `cfg.max_clients` decode branches. The
    /// encoded composite is sent to `127.0.0.1:sink_port`.
    ///
    /// The pipeline is left in the Null state; bind the input sockets with
    /// [`bind_input`](Self::bind_input) and then call
    /// [`play`](Self::play).
    pub fn new(cfg: &ServerConfig, sink_port: u16) -> Result<Self> {
        let pipeline = gst::Pipeline::new();

        let compositor = make_named("compositor", "mixer")?;
        compositor.set_property_from_str("background", "black");
        compositor.set_property("zero-size-is-unscaled", false);

        let autocrop = make_named("videobox", "autocrop")?;
        autocrop.set_property("autocrop", true);

        let crop_filter = make_named("capsfilter", "crop")?;
        crop_filter.set_property("caps", &crop_caps(cfg.cell_width, cfg.cell_height));

        let encoder = make_named("x264enc", "encoder")?;
        encoder.set_property_from_str("tune", "zerolatency");
        encoder.set_property_from_str("speed-preset", "superfast");
        encoder.set_property("bitrate", cfg.bitrate_kbps);
        encoder.set_property("key-int-max", cfg.framerate);

        let pay = make_named("rtph264pay", "pay")?;
        pay.set_property("pt", 96u32);

        let sink = make_named("udpsink", "composite-sink")?;
        sink.set_property("host", "127.0.0.1");
        sink.set_property("port", i32::from(sink_port));

        pipeline.add_many(&[&compositor, &autocrop, &crop_filter, &encoder, &pay, &sink])?;
        gst::Element::link_many(&[&compositor, &autocrop, &crop_filter, &encoder, &pay, &sink])
            .context("failed to link composite output chain")?;

        let rtp_caps = rtp_video_caps();
        let cell_caps = gst::Caps::builder("video/x-raw")
            .field("framerate", gst::Fraction::new(cfg.framerate as i32, 1))
            .field("width", cfg.cell_width as i32)
            .field("height", cfg.cell_height as i32)
            .build();

        let mut input_sources = Vec::with_capacity(cfg.max_clients);
        let mut compositor_pads = Vec::with_capacity(cfg.max_clients);
        for index in 0..cfg.max_clients {
            let source = make_named("udpsrc", &format!("input{index}_src"))?;
            source.set_property("caps", &rtp_caps);
            source.set_property("close-socket", false);
            let depay = make_named("rtph264depay", &format!("input{index}_depay"))?;
            let decoder = make_named("avdec_h264", &format!("input{index}_decode"))?;
            let scale = make_named("videoscale", &format!("input{index}_scale"))?;
            let convert = make_named("videoconvert", &format!("input{index}_convert"))?;
            let caps = make_named("capsfilter", &format!("input{index}_caps"))?;
            caps.set_property("caps", &cell_caps);

            pipeline.add_many(&[&source, &depay, &decoder, &scale, &convert, &caps])?;
            gst::Element::link_many(&[&source, &depay, &decoder, &scale, &convert, &caps])
                .with_context(|| format!("failed to link decode branch {index}"))?;

            let branch_src = caps
                .static_pad("src")
                .ok_or_else(|| anyhow!("capsfilter for input {index} has no src pad"))?;
            let mixer_sink = compositor
                .request_pad_simple("sink_%u")
                .ok_or_else(|| anyhow!("compositor refused a sink pad for input {index}"))?;
            branch_src.link(&mixer_sink).map_err(|err| {
                anyhow!("failed to link input {index} into the compositor: {err:?}")
            })?;
            apply_geometry(&mixer_sink, PadGeometry::hidden());

            input_sources.push(source);
            compositor_pads.push(mixer_sink);
        }

        Ok(Self {
            pipeline,
            input_sources,
            compositor_pads,
            crop_filter,
            cell_width: cfg.cell_width,
            cell_height: cfg.cell_height,
        })
    }

    /// Hand an externally-bound socket to decode input `input`. Must be
    /// called before [`play`](Self::play).
    pub fn bind_input(&self, input: usize, socket: UdpSocket) -> Result<()> {
        let endpoint = socket
            .local_addr()
            .with_context(|| format!("local address of input socket {input}"))?;
        let source = self
            .input_sources
            .get(input)
            .ok_or_else(|| anyhow!("pipeline has no input {input}"))?;
        let fd = OwnedFd::from(socket);
        let gsocket = unsafe { gio::Socket::from_fd(fd) }
            .with_context(|| format!("wrap input socket {input} as a GSocket"))?;
        source.set_property("socket", &gsocket);
        debug!(input, %endpoint, "input socket bound");
        Ok(())
    }

    /// Start the pipeline.
    pub fn play(&self) -> Result<()> {
        self.pipeline
            .set_state(gst::State::Playing)
            .context("failed to set pipeline to Playing")?;
        Ok(())
    }

    /// Stop the pipeline. Errors are logged, not propagated; there is
    /// nothing left to salvage at this point.
    pub fn shutdown(&self) {
        if let Err(err) = self.pipeline.set_state(gst::State::Null) {
            warn!(%err, "failed to stop pipeline");
        }
    }
}

impl MixerControl for CompositePipeline {
    fn place_pad(&mut self, input: usize, geometry: PadGeometry) {
        match self.compositor_pads.get(input) {
            Some(pad) => apply_geometry(pad, geometry),
            None => warn!(input, "no compositor pad for input"),
        }
    }

    fn move_pad(&mut self, input: usize, origin: Origin) {
        match self.compositor_pads.get(input) {
            Some(pad) => {
                pad.set_property("xpos", origin.x);
                pad.set_property("ypos", origin.y);
            }
            None => warn!(input, "no compositor pad for input"),
        }
    }

    fn set_crop(&mut self, rows: u32, cols: u32) {
        let width = self.cell_width * cols;
        let height = self.cell_height * rows;
        self.crop_filter
            .set_property("caps", &crop_caps(width, height));
        debug!(rows, cols, width, height, "composite crop updated");
    }

    /// Drain the pipeline bus. The server runs no GLib main loop, so bus
    /// messages are polled instead of watched.
    fn poll_events(&mut self) {
        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(msg) = bus.pop() {
            let source = msg.src().map(|s| s.path_string());
            match msg.view() {
                gst::MessageView::Error(err) => {
                    error!(?source, error = %err.error(), debug = ?err.debug(), "pipeline error");
                }
                gst::MessageView::Warning(warning) => {
                    warn!(?source, warning = %warning.error(), "pipeline warning");
                }
                _ => {}
            }
        }
    }
}

fn make_named(factory: &str, name: &str) -> Result<gst::Element> {
    gst::ElementFactory::make(factory)
        .name(name)
        .build()
        .map_err(|_| anyhow!("missing GStreamer element: {factory}"))
}

fn crop_caps(width: u32, height: u32) -> gst::Caps {
    gst::Caps::builder("video/x-raw")
        .field("width", width as i32)
        .field("height", height as i32)
        .build()
}

fn apply_geometry(pad: &gst::Pad, geometry: PadGeometry) {
    pad.set_property("alpha", geometry.alpha);
    pad.set_property("xpos", geometry.x);
    pad.set_property("ypos", geometry.y);
    pad.set_property("width", geometry.width);
    pad.set_property("height", geometry.height);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visible_geometry_is_one_opaque_cell() {
        let geometry = PadGeometry::visible(Origin { x: 320, y: 240 }, 320, 240);
        assert_eq!(geometry.alpha, 1.0);
        assert_eq!((geometry.x, geometry.y), (320, 240));
        assert_eq!((geometry.width, geometry.height), (320, 240));
    }

    #[test]
    fn hidden_geometry_collapses_the_pad() {
        let geometry = PadGeometry::hidden();
        assert_eq!(geometry.alpha, 0.0);
        assert_eq!((geometry.width, geometry.height), (0, 0));
    }

    #[test]
    fn input_sockets_bind_distinct_loopback_ports() {
        let sockets = bind_input_sockets(4).unwrap();
        let mut ports = std::collections::HashSet::new();
        for socket in &sockets {
            let addr = socket.local_addr().unwrap();
            assert!(addr.ip().is_loopback());
            assert!(ports.insert(addr.port()));
        }
    }
}
