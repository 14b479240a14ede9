use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{sleep, timeout};
use tokio_serial::SerialStream;

use super::Transport;
use crate::port;

/// Fixed wait after a write; the protocol has no end-of-frame marker,
/// the device just needs this long to answer.
pub const SETTLE_DELAY: Duration = Duration::from_millis(200);
const READ_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDirection {
    Sent,
    Received,
}

/// Optional diagnostic callback fed every raw frame in both
/// directions.
pub type FrameHook = Box<dyn Fn(FrameDirection, &[u8]) + Send>;

/// Owns the open serial handle for one bus. Exchange faults are
/// swallowed here and surface as short/zeroed answers; sessions must
/// validate the sync byte before trusting content.
pub struct SerialTransport {
    port_name: String,
    force: bool,
    port: Option<SerialStream>,
    hook: Option<FrameHook>,
}

impl SerialTransport {
    pub fn new(port_name: &str, force: bool) -> Self {
        Self {
            port_name: port_name.to_string(),
            force,
            port: None,
            hook: None,
        }
    }

    pub fn set_frame_hook(&mut self, hook: FrameHook) {
        self.hook = Some(hook);
    }

    fn trace(&self, direction: FrameDirection, bytes: &[u8]) {
        if let Some(hook) = &self.hook {
            hook(direction, bytes);
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn connect(&mut self) -> anyhow::Result<()> {
        if self.port.is_some() {
            return Ok(()); // already connected
        }
        self.port = Some(port::open_port_async(&self.port_name, self.force)?);
        Ok(())
    }

    async fn disconnect(&mut self) {
        if self.port.take().is_some() {
            debug!("disconnected {}", self.port_name);
        }
    }

    async fn exchange(&mut self, frame: &[u8], expected_len: usize) -> Vec<u8> {
        let mut answer = vec![0u8; expected_len];
        let port = match self.port.as_mut() {
            Some(port) => port,
            None => return answer,
        };

        debug!("send {:02X?}", frame);
        if port.write_all(frame).await.is_err() || port.flush().await.is_err() {
            return answer;
        }
        self.trace(FrameDirection::Sent, frame);

        sleep(SETTLE_DELAY).await;

        let port = match self.port.as_mut() {
            Some(port) => port,
            None => return answer,
        };
        let mut filled = 0;
        while filled < expected_len {
            match timeout(READ_TIMEOUT, port.read(&mut answer[filled..])).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => filled += n,
                Ok(Err(_)) | Err(_) => break,
            }
        }
        debug!("recv {:02X?}", &answer);
        self.trace(FrameDirection::Received, &answer[..filled]);

        answer
    }
}
