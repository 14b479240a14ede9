//! Per-device session: command payloads, answer decoding and the
//! polling task for one curtain motor on the shared bus.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use crate::bus::{BusHandle, ConnectionState, DEFAULT_ATTEMPTS};
use crate::protocol::{self, Command, DeviceAddress, Direction, MotionState, ProtocolError};

/// How long a session waits for its bus to come up before reporting
/// an unresolved status.
const BUS_WAIT: Duration = Duration::from_secs(10);
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Semantic quantities the host can observe. Only linked channels are
/// polled, so an unobserved quantity costs no bus bandwidth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Position,
    Motion,
    Direction,
}

impl Channel {
    const ALL: [Channel; 3] = [Channel::Position, Channel::Motion, Channel::Direction];

    fn query(self) -> Command {
        match self {
            Channel::Position => Command::QueryPosition,
            Channel::Motion => Command::QueryMotion,
            Channel::Direction => Command::QueryDirection,
        }
    }
}

/// Decoded state pushed to the host, tagged with the reporting device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateUpdate {
    Position(u8),
    Motion(MotionState),
    Direction(Direction),
    Version(u8),
    Programmed(DeviceAddress),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceStatus {
    Unknown,
    Online,
    Offline(String),
}

pub struct CurtainDevice {
    address: DeviceAddress,
    bus: BusHandle,
    updates: UnboundedSender<(DeviceAddress, StateUpdate)>,
    links: Mutex<HashSet<Channel>>,
    attempts: usize,
}

impl CurtainDevice {
    pub fn new(
        address: DeviceAddress,
        bus: BusHandle,
        updates: UnboundedSender<(DeviceAddress, StateUpdate)>,
    ) -> Self {
        Self {
            address,
            bus,
            updates,
            links: Mutex::new(HashSet::new()),
            attempts: DEFAULT_ATTEMPTS,
        }
    }

    pub fn with_attempts(mut self, attempts: usize) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    pub fn link(&self, channel: Channel) {
        self.links.lock().unwrap().insert(channel);
    }

    pub fn unlink(&self, channel: Channel) {
        self.links.lock().unwrap().remove(&channel);
    }

    /// Linked channels in fixed polling order.
    pub fn linked(&self) -> Vec<Channel> {
        let links = self.links.lock().unwrap();
        Channel::ALL
            .iter()
            .copied()
            .filter(|c| links.contains(c))
            .collect()
    }

    /// Waits (bounded) for the bus, then runs the version handshake.
    pub async fn init(&self) -> DeviceStatus {
        if !self.wait_online().await {
            warn!(
                "bus offline for {}s, status of {} unresolved",
                BUS_WAIT.as_secs(),
                self.address
            );
            return DeviceStatus::Unknown;
        }

        let answer = self.bus.send(Command::Probe, self.address, self.attempts).await;
        if self.answer_is_mine(Command::Probe, &answer) {
            if let Some(version) = protocol::decode_version(&answer) {
                self.emit(StateUpdate::Version(version));
            }
            DeviceStatus::Online
        } else {
            DeviceStatus::Offline("no answer to version probe".to_string())
        }
    }

    pub async fn open(&self) {
        self.command(Command::Open).await;
    }

    pub async fn close(&self) {
        self.command(Command::Close).await;
    }

    pub async fn stop(&self) {
        self.command(Command::Stop).await;
    }

    pub async fn move_to(&self, percent: u8) -> Result<(), ProtocolError> {
        if percent > 100 {
            return Err(ProtocolError::BadPosition(percent));
        }
        self.command(Command::MoveTo(percent)).await;
        Ok(())
    }

    pub async fn set_direction(&self, direction: Direction) {
        self.command(Command::SetDirection(direction)).await;
    }

    /// User-issued commands are fire-and-forget: the dispatcher
    /// retries and logs, nothing propagates back here.
    async fn command(&self, cmd: Command) {
        let _ = self.bus.send(cmd, self.address, self.attempts).await;
    }

    /// Broadcasts the programming-mode command so the listening device
    /// claims this session's address.
    pub async fn program(&self) -> bool {
        let cmd = Command::Assign(self.address);
        let answer = self.bus.send(cmd, self.address, self.attempts).await;
        let ok = answer.first() == Some(&protocol::SYNC)
            && protocol::assign_acknowledged(&answer, self.address);
        if ok {
            self.emit(StateUpdate::Programmed(self.address));
        }
        ok
    }

    /// Issues one query per linked channel and emits decoded state for
    /// every valid answer.
    pub async fn poll_once(&self) {
        for channel in self.linked() {
            let cmd = channel.query();
            let answer = self.bus.send(cmd, self.address, self.attempts).await;
            self.handle_answer(channel, cmd, &answer);
        }
    }

    fn handle_answer(&self, channel: Channel, cmd: Command, answer: &[u8]) {
        if !self.answer_is_mine(cmd, answer) {
            return;
        }
        let update = match channel {
            Channel::Position => protocol::decode_position(answer).map(StateUpdate::Position),
            Channel::Motion => protocol::decode_motion(answer).map(StateUpdate::Motion),
            Channel::Direction => protocol::decode_direction(answer).map(StateUpdate::Direction),
        };
        match update {
            Some(update) => self.emit(update),
            None => debug!(
                "{}: unrecognized {:?} answer {:02X?}, state unchanged",
                self.address, channel, answer
            ),
        }
    }

    /// Noise, short answers and cross-talk from other devices all stop
    /// here; the current state is never overwritten with garbage.
    fn answer_is_mine(&self, cmd: Command, answer: &[u8]) -> bool {
        if !protocol::frame_valid(answer, cmd.response_len())
            || !protocol::address_matches(answer, self.address)
        {
            debug!("{}: discarding answer {:02X?}", self.address, answer);
            return false;
        }
        true
    }

    fn emit(&self, update: StateUpdate) {
        let _ = self.updates.send((self.address, update));
    }

    async fn wait_online(&self) -> bool {
        let mut state_rx = self.bus.state_rx();
        timeout(BUS_WAIT, async move {
            loop {
                if *state_rx.borrow() == ConnectionState::Online {
                    return true;
                }
                if state_rx.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await
        .unwrap_or(false)
    }
}

/// Queries the linked channels on a fixed tick until aborted. Abort
/// pollers before shutting the bus down.
pub fn spawn_poller(device: Arc<CurtainDevice>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            device.poll_once().await;
            sleep(interval).await;
        }
    })
}
