use std::sync::Arc;

use anyhow::Result;
use env_logger::TimestampPrecision;
use log::info;
use tokio::sync::mpsc;

use dooya_lib::bus::{Bus, BusConfig, SerialTransport};
use dooya_lib::device::{self, Channel, CurtainDevice};
use dooya_lib::protocol::DeviceAddress;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(Some(TimestampPrecision::Millis))
        .format_target(false)
        .init();

    let address: DeviceAddress = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "0101".to_string())
        .parse()?;
    let port = std::env::args().nth(2).unwrap_or_else(|| "auto".to_string());

    let mut transport = SerialTransport::new(&port, false);
    if std::env::var("FRAME_TRACE").is_ok() {
        transport.set_frame_hook(Box::new(|direction, bytes| {
            info!("{:?} {:02X?}", direction, bytes);
        }));
    }

    let bus = Bus::start(transport, BusConfig::default());
    let (updates_tx, mut updates) = mpsc::unbounded_channel();
    let device = Arc::new(CurtainDevice::new(address, bus.handle(), updates_tx));

    device.link(Channel::Position);
    device.link(Channel::Motion);
    device.link(Channel::Direction);

    info!("init {}: {:?}", address, device.init().await);
    let poller = device::spawn_poller(device, device::POLL_INTERVAL);

    while let Some((addr, update)) = updates.recv().await {
        info!("{}: {:?}", addr, update);
    }

    poller.abort();
    bus.shutdown().await;
    Ok(())
}
