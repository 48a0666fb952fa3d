//! The routing core: admission, forwarding, fan-out, liveness.
//!
//! One `Server` value owns both sockets, every pool and table, and the
//! mixer handle; all mutation happens on the event-loop thread, so the
//! structure needs no locking. The loop itself is a calloop event loop with
//! four sources: the client-facing socket, the composite socket, a sweep
//! timer, and SIGINT/SIGTERM.
//!
//! Datagram handling is deliberately shallow. A datagram from an unknown
//! peer admits it; a non-empty first datagram additionally claims a
//! pipeline input and a grid slot when both are free, making the peer a
//! publisher. Publisher datagrams are forwarded verbatim to the pipeline
//! input's loopback endpoint; composite datagrams are fanned out to every
//! known client. Nothing in the steady state allocates or blocks beyond
//! the socket calls themselves.

use std::net::UdpSocket;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use calloop::generic::Generic;
use calloop::signals::{Signal, Signals};
use calloop::timer::{TimeoutAction, Timer};
use calloop::{EventLoop, Interest, Mode, PostAction};
use tracing::{debug, info, warn};

use crate::clients::ClientTable;
use crate::config::ServerConfig;
use crate::layout::GridLayout;
use crate::pipeline::{MixerControl, PadGeometry};
use crate::pools::{InputPool, SlotPool};

/// The conferencing server: sockets, state, and the mixer handle.
pub struct Server<M> {
    socket: UdpSocket,
    composite_rx: UdpSocket,
    mixer: M,
    layout: GridLayout,
    slots: SlotPool,
    inputs: InputPool,
    clients: ClientTable,
    idle_limit: Duration,
    buf: Vec<u8>,
}

impl<M: MixerControl> Server<M> {
    /// Assemble a server from its pre-bound sockets and input pool.
    ///
    /// `inputs` must hold exactly `cfg.max_clients` endpoints, matching the
    /// decode branches of the pipeline behind `mixer`.
    pub fn new(
        cfg: &ServerConfig,
        socket: UdpSocket,
        composite_rx: UdpSocket,
        inputs: InputPool,
        mixer: M,
    ) -> Self {
        debug_assert_eq!(inputs.capacity(), cfg.max_clients);
        Self {
            socket,
            composite_rx,
            mixer,
            layout: GridLayout::new(
                cfg.max_clients,
                cfg.cell_width,
                cfg.cell_height,
                cfg.target_aspect,
            ),
            slots: SlotPool::new(cfg.max_clients),
            inputs,
            clients: ClientTable::new(),
            idle_limit: cfg.idle_limit,
            buf: vec![0; cfg.buffer_size],
        }
    }

    pub fn clients(&self) -> &ClientTable {
        &self.clients
    }

    pub fn layout(&self) -> &GridLayout {
        &self.layout
    }

    pub fn slots(&self) -> &SlotPool {
        &self.slots
    }

    pub fn inputs(&self) -> &InputPool {
        &self.inputs
    }

    pub fn mixer(&self) -> &M {
        &self.mixer
    }

    pub fn mixer_mut(&mut self) -> &mut M {
        &mut self.mixer
    }

    /// Drain one datagram from the client-facing socket: refresh activity,
    /// admit newcomers, and forward publisher traffic into the pipeline.
    pub fn handle_external(&mut self, now: Instant) {
        let (len, peer) = match self.socket.recv_from(&mut self.buf) {
            Ok(received) => received,
            Err(err) => {
                warn!(%err, "receive from client socket failed");
                return;
            }
        };

        let mut publisher_added = false;
        if self.clients.touch(peer, now) {
            // A non-empty first datagram claims an input and a slot when
            // both are free; an empty one is a keepalive admitting a
            // viewer.
            if len > 0 {
                if let Some((input, slot)) = self.claim_pair() {
                    if let Some(client) = self.clients.get_mut(peer) {
                        client.input = Some(input);
                        client.slot = Some(slot);
                    }
                    self.mixer.place_pad(
                        input,
                        PadGeometry::visible(
                            self.layout.origin(slot),
                            self.layout.cell_width(),
                            self.layout.cell_height(),
                        ),
                    );
                    publisher_added = true;
                    info!(%peer, input, slot, clients = self.clients.len(), "publisher admitted");
                } else {
                    info!(%peer, clients = self.clients.len(), "no free input or slot, admitted as viewer");
                }
            } else {
                info!(%peer, clients = self.clients.len(), "viewer admitted");
            }
        }

        if let Some(input) = self.clients.get(peer).and_then(|c| c.input) {
            let target = self.inputs.endpoint(input);
            if let Err(err) = self.socket.send_to(&self.buf[..len], target) {
                warn!(%err, %target, "forward to pipeline input failed");
            }
        }

        if publisher_added {
            self.refresh_crop();
        }
    }

    /// Drain one composite datagram and fan it out to every known client.
    /// A failing peer is skipped, not fatal.
    pub fn handle_internal(&mut self) {
        let len = match self.composite_rx.recv(&mut self.buf) {
            Ok(len) => len,
            Err(err) => {
                warn!(%err, "receive from composite socket failed");
                return;
            }
        };
        for peer in self.clients.addrs() {
            if let Err(err) = self.socket.send_to(&self.buf[..len], peer) {
                warn!(%err, %peer, "fan-out to client failed");
            }
        }
    }

    /// Evict every client idle past the limit, then restore slot
    /// contiguity and the crop geometry if a publisher left.
    pub fn sweep(&mut self, now: Instant) {
        let mut publisher_removed = false;
        for peer in self.clients.idle_since(now, self.idle_limit) {
            let Some(client) = self.clients.remove(peer) else {
                continue;
            };
            if let (Some(input), Some(slot)) = (client.input, client.slot) {
                self.mixer.place_pad(input, PadGeometry::hidden());
                self.inputs.release(input);
                self.slots.release(slot);
                publisher_removed = true;
                info!(%peer, input, slot, clients = self.clients.len(), "publisher evicted");
            } else {
                info!(%peer, clients = self.clients.len(), "viewer evicted");
            }
        }
        if publisher_removed {
            self.compact_slots();
            self.refresh_crop();
        }
    }

    /// Run the event loop until SIGINT or SIGTERM.
    pub fn run(&mut self, sweep_period: Duration) -> Result<()>
    where
        M: 'static,
    {
        let mut event_loop: EventLoop<'_, Self> =
            EventLoop::try_new().context("create event loop")?;
        let handle = event_loop.handle();

        let external = self.socket.try_clone().context("clone client socket")?;
        handle
            .insert_source(
                Generic::new(external, Interest::READ, Mode::Level),
                |_, _, server: &mut Self| {
                    server.handle_external(Instant::now());
                    Ok(PostAction::Continue)
                },
            )
            .map_err(|err| anyhow!("register client socket: {err}"))?;

        let internal = self
            .composite_rx
            .try_clone()
            .context("clone composite socket")?;
        handle
            .insert_source(
                Generic::new(internal, Interest::READ, Mode::Level),
                |_, _, server: &mut Self| {
                    server.handle_internal();
                    Ok(PostAction::Continue)
                },
            )
            .map_err(|err| anyhow!("register composite socket: {err}"))?;

        handle
            .insert_source(Timer::from_duration(sweep_period), move |_, _, server| {
                server.mixer.poll_events();
                server.sweep(Instant::now());
                TimeoutAction::ToDuration(sweep_period)
            })
            .map_err(|err| anyhow!("register sweep timer: {err}"))?;

        let signal = event_loop.get_signal();
        handle
            .insert_source(
                Signals::new(&[Signal::SIGINT, Signal::SIGTERM]).context("register signals")?,
                move |event, _, _| {
                    info!(signal = ?event.signal(), "shutting down");
                    signal.stop();
                },
            )
            .map_err(|err| anyhow!("register signal source: {err}"))?;

        event_loop
            .run(None, self, |_| {})
            .context("event loop failed")?;
        Ok(())
    }

    /// Pop an input and a slot together, or neither.
    fn claim_pair(&mut self) -> Option<(usize, usize)> {
        let input = self.inputs.acquire()?;
        let Some(slot) = self.slots.acquire() else {
            self.inputs.release(input);
            return None;
        };
        Some((input, slot))
    }

    /// Move publishers down into the lowest free slots until the occupied
    /// region is contiguous from slot zero.
    fn compact_slots(&mut self) {
        self.slots.sort_descending();
        while let Some(lowest) = self.slots.lowest() {
            let Some(peer) = self.clients.publisher_above(lowest) else {
                break;
            };
            let Some((input, old_slot)) = self
                .clients
                .get(peer)
                .and_then(|c| Some((c.input?, c.slot?)))
            else {
                break;
            };
            let Some(new_slot) = self.slots.swap_lowest(old_slot) else {
                break;
            };
            if let Some(client) = self.clients.get_mut(peer) {
                client.slot = Some(new_slot);
            }
            self.mixer.move_pad(input, self.layout.origin(new_slot));
            debug!(%peer, from = old_slot, to = new_slot, "slot compacted");
        }
    }

    /// Recompute the bounding grid of the assigned slots and crop the
    /// composite to it.
    fn refresh_crop(&mut self) {
        let (rows, cols) = self.layout.extent(self.clients.assigned_slots());
        self.mixer.set_crop(rows, cols);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Origin;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    #[derive(Debug, Default)]
    struct RecordingMixer {
        placements: Vec<(usize, PadGeometry)>,
        moves: Vec<(usize, Origin)>,
        crops: Vec<(u32, u32)>,
    }

    impl MixerControl for RecordingMixer {
        fn place_pad(&mut self, input: usize, geometry: PadGeometry) {
            self.placements.push((input, geometry));
        }

        fn move_pad(&mut self, input: usize, origin: Origin) {
            self.moves.push((input, origin));
        }

        fn set_crop(&mut self, rows: u32, cols: u32) {
            self.crops.push((rows, cols));
        }
    }

    fn fake_endpoints(n: usize) -> Vec<SocketAddr> {
        (0..n)
            .map(|i| {
                SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::LOCALHOST),
                    50000 + u16::try_from(i).unwrap(),
                )
            })
            .collect()
    }

    fn test_server() -> (Server<RecordingMixer>, SocketAddr, SocketAddr) {
        let cfg = ServerConfig::default();
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let external_addr = socket.local_addr().unwrap();
        let composite_rx = UdpSocket::bind("127.0.0.1:0").unwrap();
        let composite_addr = composite_rx.local_addr().unwrap();
        let server = Server::new(
            &cfg,
            socket,
            composite_rx,
            InputPool::new(fake_endpoints(cfg.max_clients)),
            RecordingMixer::default(),
        );
        (server, external_addr, composite_addr)
    }

    #[test]
    fn fan_out_survives_a_poisoned_peer() {
        let (mut server, external_addr, composite_addr) = test_server();
        let now = Instant::now();

        // Port zero sorts first in the table and makes send_to fail, so the
        // healthy client exercises the continue-after-error path.
        let poisoned = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        server.clients.touch(poisoned, now);

        let viewer = UdpSocket::bind("127.0.0.1:0").unwrap();
        viewer
            .set_read_timeout(Some(Duration::from_secs(1)))
            .unwrap();
        viewer.send_to(&[], external_addr).unwrap();
        server.handle_external(now);

        let feeder = UdpSocket::bind("127.0.0.1:0").unwrap();
        feeder.send_to(b"composite-frame", composite_addr).unwrap();
        server.handle_internal();

        let mut buf = [0u8; 64];
        let len = viewer.recv(&mut buf).expect("viewer should still receive");
        assert_eq!(&buf[..len], b"composite-frame");
    }

    #[test]
    fn compaction_restores_contiguity_after_scattered_removals() {
        let (mut server, external_addr, _) = test_server();
        let t0 = Instant::now();

        let publishers: Vec<UdpSocket> = (0..4)
            .map(|_| UdpSocket::bind("127.0.0.1:0").unwrap())
            .collect();
        for socket in &publishers {
            socket.send_to(b"frame", external_addr).unwrap();
            server.handle_external(t0);
        }
        assert_eq!(server.clients.publisher_count(), 4);

        // Publishers on slots 1 and 3 stay active; 0 and 2 go silent.
        let t1 = t0 + Duration::from_secs(3);
        for socket in [&publishers[1], &publishers[3]] {
            let addr = socket.local_addr().unwrap();
            server.clients.touch(addr, t1);
        }
        server.sweep(t1);

        assert_eq!(server.clients.publisher_count(), 2);
        let mut assigned: Vec<_> = server.clients.assigned_slots().collect();
        assigned.sort_unstable();
        assert_eq!(assigned, vec![0, 1]);

        // Pools and publishers always account for every resource.
        assert_eq!(
            server.clients.publisher_count() + server.slots.free_count(),
            server.layout.capacity()
        );
        assert_eq!(
            server.clients.publisher_count() + server.inputs.free_count(),
            server.inputs.capacity()
        );

        // The crop shrank with the population.
        assert_eq!(server.mixer.crops.last(), Some(&(1, 2)));
    }

    #[test]
    fn claim_pair_is_all_or_nothing() {
        let (mut server, _, _) = test_server();
        for _ in 0..server.layout.capacity() {
            assert!(server.claim_pair().is_some());
        }
        assert!(server.claim_pair().is_none());
        assert_eq!(server.inputs.free_count(), 0);
        assert_eq!(server.slots.free_count(), 0);
    }
}
