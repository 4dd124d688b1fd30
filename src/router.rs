//! Plugin registry and pub/sub routing engine.
//!
//! The registry is slot-indexed and append-only: slots come from the
//! settings roster at startup and never change, so routing reads need no
//! lock. What does change is attachment — a `std` plugin's channel opens
//! as soon as its child process spawns, while a `tcp` plugin's channel
//! opens when the process connects back and names its slot in the
//! handshake. Slot 0 is the main plugin; when its transport ends the
//! whole process quits.

use std::process::Stdio;
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{PluginDef, PluginMethod};
use crate::constants::PLUGIN_HANDSHAKE_TIMEOUT;
use crate::error::HubError;
use crate::plugin::channel::{BoxReader, BoxWriter};
use crate::plugin::{message, BusEvent, Message, PluginChannel, Source};

/// One registry slot: the roster entry plus the channel once attached.
struct SlotEntry {
    def: PluginDef,
    channel: std::sync::OnceLock<Arc<PluginChannel>>,
}

/// The message router: plugin registry, routing, process lifecycle.
pub struct MessageRouter {
    slots: Vec<SlotEntry>,
    hub_tx: UnboundedSender<Message>,
    event_tx: UnboundedSender<BusEvent>,
    event_rx: Mutex<Option<UnboundedReceiver<BusEvent>>>,
    quit: CancellationToken,
    children: Mutex<Vec<Child>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MessageRouter {
    /// Builds the registry from the startup roster.
    ///
    /// Messages addressed to the hub's command handlers arrive on
    /// `hub_tx`; `quit` is the whole-process shutdown signal, which the
    /// router fires itself when the main plugin's transport ends.
    pub fn new(
        defs: &[PluginDef],
        hub_tx: UnboundedSender<Message>,
        quit: CancellationToken,
    ) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let slots = defs
            .iter()
            .map(|def| SlotEntry {
                def: def.clone(),
                channel: std::sync::OnceLock::new(),
            })
            .collect();
        Arc::new(Self {
            slots,
            hub_tx,
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            quit,
            children: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawns plugin processes, the TCP accept loop and the bus event
    /// loop. Returns the bound bus port (useful when `port` is 0).
    pub async fn start(self: &Arc<Self>, port: u16) -> Result<u16, HubError> {
        let Some(event_rx) = self.event_rx.lock().await.take() else {
            return Err(HubError::Closed);
        };
        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(Arc::clone(self).event_loop(event_rx)));

        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| HubError::Transport(format!("bind plugin port {port}: {e}")))?;
        let bound = listener
            .local_addr()
            .map_err(|e| HubError::Transport(format!("plugin port addr: {e}")))?
            .port();
        log::info!("[Router] Plugin bus listening on 127.0.0.1:{bound}");
        tasks.push(tokio::spawn(Arc::clone(self).accept_loop(listener)));
        drop(tasks);

        for slot in 0..self.slots.len() {
            self.spawn_plugin(slot, bound).await?;
        }
        Ok(bound)
    }

    /// Launches the plugin process for `slot`, wiring stdio for `std`
    /// plugins. A `tcp` plugin with no exec line is started externally and
    /// only attaches later.
    async fn spawn_plugin(self: &Arc<Self>, slot: usize, port: u16) -> Result<(), HubError> {
        let def = &self.slots[slot].def;
        if def.exec.is_empty() {
            if def.method == PluginMethod::Std {
                return Err(HubError::Protocol(format!(
                    "std plugin {:?} has no exec command",
                    def.name
                )));
            }
            return Ok(());
        }

        let mut cmd = Command::new(&def.exec[0]);
        cmd.args(&def.exec[1..])
            .env("NICOHUB_PLUGIN_PORT", port.to_string())
            .env("NICOHUB_PLUGIN_SLOT", slot.to_string())
            .kill_on_drop(true);

        match def.method {
            PluginMethod::Std => {
                cmd.stdin(Stdio::piped()).stdout(Stdio::piped());
                let mut child = cmd
                    .spawn()
                    .map_err(|e| HubError::Transport(format!("spawn {:?}: {e}", def.name)))?;
                let (Some(stdout), Some(stdin)) = (child.stdout.take(), child.stdin.take())
                else {
                    return Err(HubError::Transport(format!(
                        "no stdio pipes for {:?}",
                        def.name
                    )));
                };
                self.attach(slot, Box::new(stdout), Box::new(stdin), true)
                    .await?;
                self.children.lock().await.push(child);
            }
            PluginMethod::Tcp => {
                let child = cmd
                    .spawn()
                    .map_err(|e| HubError::Transport(format!("spawn {:?}: {e}", def.name)))?;
                self.children.lock().await.push(child);
            }
        }
        log::info!("[Router] Launched plugin {} in slot {slot}", def.name);
        Ok(())
    }

    /// Attaches an open transport to its registry slot.
    ///
    /// The slot must exist and still be vacant before any channel task
    /// starts; otherwise a rejected claimant could inject messages
    /// attributed to the slot's real owner, or report the slot closed.
    pub(crate) async fn attach(
        &self,
        slot: usize,
        reader: BoxReader,
        writer: BoxWriter,
        initially_enabled: bool,
    ) -> Result<Arc<PluginChannel>, HubError> {
        let entry = self
            .slots
            .get(slot)
            .ok_or_else(|| HubError::RecordNotFound(format!("plugin slot {slot}")))?;
        if entry.channel.get().is_some() {
            return Err(HubError::Protocol(format!(
                "slot {slot} already attached"
            )));
        }
        let channel = PluginChannel::open(
            slot,
            &entry.def.name,
            entry.def.subscribe.iter().cloned(),
            reader,
            writer,
            initially_enabled,
            self.event_tx.clone(),
        );
        if entry.channel.set(Arc::clone(&channel)).is_err() {
            // Two claimants raced past the vacancy check; the loser's
            // tasks must die before they can speak for the slot.
            channel.close().await;
            return Err(HubError::Protocol(format!(
                "slot {slot} already attached"
            )));
        }
        Ok(channel)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                () = self.quit.cancelled() => break,
                conn = listener.accept() => match conn {
                    Ok((stream, peer)) => {
                        log::debug!("[Router] Plugin connection from {peer}");
                        let router = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = router.handshake(stream).await {
                                log::warn!("[Router] Handshake from {peer} rejected: {e}");
                            }
                        });
                    }
                    Err(e) => log::warn!("[Router] Accept failed: {e}"),
                },
            }
        }
    }

    /// Reads the slot handshake off a fresh TCP connection and attaches
    /// it. The first line must be a direct-domain `No` message naming a
    /// pre-assigned, still-vacant `tcp` slot.
    async fn handshake(&self, stream: TcpStream) -> Result<(), HubError> {
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        tokio::time::timeout(PLUGIN_HANDSHAKE_TIMEOUT, reader.read_line(&mut line))
            .await
            .map_err(|_| HubError::Transport("handshake timed out".into()))?
            .map_err(|e| HubError::Transport(format!("handshake read: {e}")))?;

        let msg = message::decode_line(&line, 0)
            .map_err(|e| HubError::Protocol(format!("handshake: {e:#}")))?;
        if !msg.is_direct() || msg.command != "No" {
            return Err(HubError::Protocol(format!(
                "first message must be a direct No, got {}/{}",
                msg.domain, msg.command
            )));
        }
        let slot = msg
            .content
            .get("no")
            .and_then(Value::as_u64)
            .ok_or_else(|| HubError::Protocol("handshake without slot number".into()))?
            as usize;

        let entry = self
            .slots
            .get(slot)
            .ok_or_else(|| HubError::RecordNotFound(format!("plugin slot {slot}")))?;
        if entry.def.method != PluginMethod::Tcp {
            return Err(HubError::Protocol(format!(
                "slot {slot} is not a tcp plugin"
            )));
        }

        let channel = self
            .attach(slot, Box::new(reader), Box::new(write_half), true)
            .await?;
        log::info!("[Router] Plugin {} attached to slot {slot}", channel.name());
        Ok(())
    }

    async fn event_loop(self: Arc<Self>, mut event_rx: UnboundedReceiver<BusEvent>) {
        loop {
            tokio::select! {
                () = self.quit.cancelled() => break,
                ev = event_rx.recv() => match ev {
                    Some(BusEvent::Inbound(msg)) => self.route(msg),
                    Some(BusEvent::ChannelClosed(slot)) => {
                        if let Some(channel) = self.channel(slot) {
                            channel.mark_closed();
                        }
                        if slot == 0 {
                            log::info!("[Router] Main plugin closed, shutting down");
                            self.quit.cancel();
                        } else {
                            log::info!("[Router] Plugin in slot {slot} closed");
                        }
                    }
                    None => break,
                },
            }
        }
    }

    fn channel(&self, slot: usize) -> Option<&Arc<PluginChannel>> {
        self.slots.get(slot).and_then(|entry| entry.channel.get())
    }

    /// Dispatches one message. Never blocks: every plugin delivery is a
    /// bounded-queue `try_send`.
    pub fn route(&self, msg: Message) {
        if msg.is_direct() {
            // Unicast lane between one plugin and the hub; never fanned out.
            match msg.source {
                Source::Plugin(_) => {
                    if self.hub_tx.send(msg).is_err() {
                        log::warn!("[Router] Hub handler gone");
                    }
                }
                Source::Internal => {
                    log::warn!(
                        "[Router] Internal direct message {} needs unicast(), dropped",
                        msg.command
                    );
                }
            }
            return;
        }

        if let Some(base) = msg.filter_base() {
            let base = base.to_string();
            if self.offer_to_filter(&msg) {
                return;
            }
            // No filter stage took it; fall through as a plain broadcast.
            self.broadcast(msg.with_domain(&base));
            return;
        }

        self.broadcast(msg);
    }

    /// Offers a filter-suffixed message to the first enabled subscriber
    /// after the sender's slot, wrapping. Returns true when consumed.
    fn offer_to_filter(&self, msg: &Message) -> bool {
        let sender = match msg.source {
            Source::Plugin(slot) => Some(slot),
            Source::Internal => None,
        };
        let start = sender.map_or(0, |s| s + 1);
        let n = self.slots.len();
        let Some(base) = msg.filter_base() else {
            return false;
        };

        for i in 0..n {
            let slot = (start + i) % n;
            if Some(slot) == sender {
                continue;
            }
            let Some(channel) = self.channel(slot) else {
                continue;
            };
            if channel.is_enabled() && channel.subscribes_to(&msg.domain) {
                channel.try_send(msg.with_domain(base));
                return true;
            }
        }
        false
    }

    /// Fans a message out to every enabled subscriber except the sender,
    /// plus the hub's command handlers.
    fn broadcast(&self, msg: Message) {
        let sender = match msg.source {
            Source::Plugin(slot) => Some(slot),
            Source::Internal => None,
        };
        for (slot, entry) in self.slots.iter().enumerate() {
            if Some(slot) == sender {
                continue;
            }
            let Some(channel) = entry.channel.get() else {
                continue;
            };
            if channel.is_enabled() && channel.subscribes_to(&msg.domain) {
                channel.try_send(msg.clone());
            }
        }
        if self.hub_tx.send(msg).is_err() {
            log::warn!("[Router] Hub handler gone");
        }
    }

    /// Sends a host message to exactly one plugin over the direct domain.
    pub fn unicast(&self, slot: usize, msg: Message) -> Result<(), HubError> {
        let channel = self
            .channel(slot)
            .ok_or_else(|| HubError::RecordNotFound(format!("plugin slot {slot}")))?;
        channel.try_send(msg);
        Ok(())
    }

    /// Enables or disables routing to the plugin in `slot`.
    pub fn set_enabled(&self, slot: usize, enabled: bool) -> Result<(), HubError> {
        let channel = self
            .channel(slot)
            .ok_or_else(|| HubError::RecordNotFound(format!("plugin slot {slot}")))?;
        channel.set_enabled(enabled);
        Ok(())
    }

    /// Slot number for a plugin name, if present in the roster.
    pub fn slot_of(&self, name: &str) -> Option<usize> {
        self.slots.iter().position(|entry| entry.def.name == name)
    }

    /// Closes every channel, kills plugin processes and joins the router
    /// tasks. The quit token must already be cancelled.
    pub async fn shutdown(&self) {
        for entry in &self.slots {
            if let Some(channel) = entry.channel.get() {
                channel.close().await;
            }
        }
        let mut children = self.children.lock().await;
        for child in children.iter_mut() {
            if let Err(e) = child.kill().await {
                log::warn!("[Router] Kill failed: {e}");
            }
        }
        children.clear();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(e) = task.await {
                log::warn!("[Router] Task panicked: {e}");
            }
        }
        log::info!("[Router] Shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{DOMAIN_BROADCAST, DOMAIN_DIRECT};
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn roster(subs: &[&[&str]]) -> Vec<PluginDef> {
        subs.iter()
            .enumerate()
            .map(|(i, subscribe)| PluginDef {
                name: format!("p{i}"),
                description: String::new(),
                version: String::new(),
                exec: vec![],
                method: PluginMethod::Tcp,
                subscribe: subscribe.iter().map(|s| s.to_string()).collect(),
            })
            .collect()
    }

    struct TestBus {
        router: Arc<MessageRouter>,
        hub_rx: UnboundedReceiver<Message>,
        quit: CancellationToken,
        sides: Vec<tokio::io::DuplexStream>,
    }

    /// Builds a router with every slot attached over an in-memory pipe.
    async fn attach_all(subs: &[&[&str]]) -> TestBus {
        let (hub_tx, hub_rx) = mpsc::unbounded_channel();
        let quit = CancellationToken::new();
        let router = MessageRouter::new(&roster(subs), hub_tx, quit.clone());
        let mut sides = Vec::new();
        for slot in 0..subs.len() {
            let (host, plugin) = tokio::io::duplex(4096);
            let (r, w) = tokio::io::split(host);
            router
                .attach(slot, Box::new(r), Box::new(w), true)
                .await
                .unwrap();
            sides.push(plugin);
        }
        TestBus {
            router,
            hub_rx,
            quit,
            sides,
        }
    }

    async fn read_burst(side: &mut tokio::io::DuplexStream) -> String {
        let mut buf = vec![0u8; 4096];
        let n = tokio::time::timeout(Duration::from_secs(2), side.read(&mut buf))
            .await
            .expect("timed out")
            .expect("read failed");
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender_and_non_subscribers() {
        let mut bus = attach_all(&[
            &[DOMAIN_BROADCAST],
            &[DOMAIN_BROADCAST],
            &["other_domain"],
        ]).await;

        bus.router.route(Message::from_plugin(
            0,
            DOMAIN_BROADCAST,
            "Comment.Got",
            json!({"no": 1}),
        ));

        // Subscriber in slot 1 receives it.
        let text = read_burst(&mut bus.sides[1]).await;
        assert!(text.contains("Comment.Got"));

        // Hub handlers always see broadcasts.
        let msg = bus.hub_rx.recv().await.unwrap();
        assert_eq!(msg.command, "Comment.Got");

        // Sender (slot 0) and non-subscriber (slot 2) stay silent.
        let mut buf = [0u8; 64];
        for slot in [0, 2] {
            let quiet =
                tokio::time::timeout(Duration::from_millis(200), bus.sides[slot].read(&mut buf))
                    .await;
            assert!(quiet.is_err(), "unexpected delivery to slot {slot}");
        }
        bus.quit.cancel();
    }

    #[tokio::test]
    async fn test_filter_goes_to_first_subscriber_after_sender() {
        let filter = "nicohub@filter";
        let mut bus = attach_all(&[
            &[DOMAIN_BROADCAST],
            &[filter],
            &[filter],
        ]).await;

        // Sent from slot 2: the scan wraps and lands on slot 1's stage
        // after skipping slot 0 (not subscribed to the filter domain).
        bus.router.route(Message::from_plugin(
            2,
            filter,
            "Comment.Got",
            json!({"text": "raw"}),
        ));

        let text = read_burst(&mut bus.sides[1]).await;
        // Delivered with the marker stripped.
        assert!(text.contains("\"nicohub\""));
        assert!(!text.contains("@filter"));

        // Consumed exclusively: no plain broadcast to slot 0, no hub copy.
        let mut buf = [0u8; 64];
        let quiet =
            tokio::time::timeout(Duration::from_millis(200), bus.sides[0].read(&mut buf)).await;
        assert!(quiet.is_err());
        assert!(bus.hub_rx.try_recv().is_err());
        bus.quit.cancel();
    }

    #[tokio::test]
    async fn test_filter_without_taker_falls_back_to_broadcast() {
        let mut bus = attach_all(&[&[DOMAIN_BROADCAST], &[DOMAIN_BROADCAST]]).await;

        bus.router.route(Message::from_plugin(
            0,
            "nicohub@filter",
            "Comment.Got",
            json!(null),
        ));

        // Nobody subscribes to the filter domain, so the bare-domain
        // subscriber gets the marker-stripped broadcast.
        let text = read_burst(&mut bus.sides[1]).await;
        assert!(text.contains("\"nicohub\""));
        let msg = bus.hub_rx.recv().await.unwrap();
        assert_eq!(msg.domain, DOMAIN_BROADCAST);
        bus.quit.cancel();
    }

    #[tokio::test]
    async fn test_direct_from_plugin_reaches_only_hub() {
        let mut bus = attach_all(&[&[DOMAIN_BROADCAST], &[DOMAIN_BROADCAST, DOMAIN_DIRECT]]).await;

        bus.router.route(Message::from_plugin(
            0,
            DOMAIN_DIRECT,
            "Broad.Connect",
            json!({"id": "lv1"}),
        ));

        let msg = bus.hub_rx.recv().await.unwrap();
        assert_eq!(msg.command, "Broad.Connect");

        // Even a direct-domain subscriber never sees someone else's lane.
        let mut buf = [0u8; 64];
        let quiet =
            tokio::time::timeout(Duration::from_millis(200), bus.sides[1].read(&mut buf)).await;
        assert!(quiet.is_err());
        bus.quit.cancel();
    }

    #[tokio::test]
    async fn test_disabled_plugin_excluded_until_reenabled() {
        let mut bus = attach_all(&[&[DOMAIN_BROADCAST], &[DOMAIN_BROADCAST]]).await;
        bus.router.set_enabled(1, false).unwrap();
        // Drain the Disabled notification.
        let note = read_burst(&mut bus.sides[1]).await;
        assert!(note.contains("Disabled"));

        bus.router
            .route(Message::internal(DOMAIN_BROADCAST, "Ping", json!(1)));
        let mut buf = [0u8; 64];
        let quiet =
            tokio::time::timeout(Duration::from_millis(200), bus.sides[1].read(&mut buf)).await;
        assert!(quiet.is_err());

        bus.router.set_enabled(1, true).unwrap();
        let note = read_burst(&mut bus.sides[1]).await;
        assert!(note.contains("Enabled"));
        bus.router
            .route(Message::internal(DOMAIN_BROADCAST, "Ping", json!(2)));
        let text = read_burst(&mut bus.sides[1]).await;
        assert!(text.contains("Ping"));
        bus.quit.cancel();
    }

    #[tokio::test]
    async fn test_unicast_targets_one_slot() {
        let mut bus = attach_all(&[&[DOMAIN_BROADCAST], &[DOMAIN_BROADCAST]]).await;
        bus.router
            .unicast(1, Message::internal(DOMAIN_DIRECT, "Settings.Get", json!(null)))
            .unwrap();
        let text = read_burst(&mut bus.sides[1]).await;
        assert!(text.contains("Settings.Get"));
        assert!(matches!(
            bus.router.unicast(9, Message::internal(DOMAIN_DIRECT, "x", json!(null))),
            Err(HubError::RecordNotFound(_))
        ));
        bus.quit.cancel();
    }

    #[tokio::test]
    async fn test_second_claim_on_taken_slot_is_refused() {
        let mut bus = attach_all(&[&[DOMAIN_BROADCAST]]).await;

        // A second transport claiming slot 0 is refused before any of its
        // channel tasks start; its bytes never enter the bus.
        let (host, mut intruder) = tokio::io::duplex(4096);
        let (r, w) = tokio::io::split(host);
        assert!(matches!(
            bus.router.attach(0, Box::new(r), Box::new(w), true).await,
            Err(HubError::Protocol(_))
        ));
        intruder
            .write_all(b"{\"domain\":\"nicohub\",\"command\":\"Spoofed\",\"content\":null}\n")
            .await
            .unwrap();
        drop(intruder);

        // The slot still holds the original occupant.
        bus.router
            .route(Message::internal(DOMAIN_BROADCAST, "Ping", json!(1)));
        let text = read_burst(&mut bus.sides[0]).await;
        assert!(text.contains("Ping"));
        assert!(!text.contains("Spoofed"));
        bus.quit.cancel();
    }

    #[tokio::test]
    async fn test_slot_of_resolves_roster_names() {
        let bus = attach_all(&[&[], &[]]).await;
        assert_eq!(bus.router.slot_of("p0"), Some(0));
        assert_eq!(bus.router.slot_of("p1"), Some(1));
        assert_eq!(bus.router.slot_of("nope"), None);
        bus.quit.cancel();
    }
}
