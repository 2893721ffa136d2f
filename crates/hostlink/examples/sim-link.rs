//! A slave and a simulated host exchanging frames over an in-memory bus.
//!
//! Run with: `cargo run -p hostlink --example sim-link`

use std::time::Duration;

use hostlink::frame::{decode_header, Frame, FrameError, InterfaceType};
use hostlink::spi::{SpiConfig, SpiTransport};
use hostlink::transport::{SimBus, SimGpio, SimHost};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = SpiConfig::default();
    let bus = SimBus::new(config.bus_queue_size);
    let gpio = SimGpio::new();
    let transport = SpiTransport::new(config.clone(), bus.clone(), gpio.clone())?;
    let host = SimHost::new(bus, gpio);

    // Queued before start: still goes out after the capability event.
    transport.submit_frame(InterfaceType::Station, 0, b"bulk data")?;
    transport.submit_frame(InterfaceType::Hci, 0, b"hci event")?;
    transport.submit_frame(InterfaceType::Serial, 0, b"ctrl resp")?;
    transport.start()?;

    let mut host_tx = vec![0u8; config.frame.block_size()];
    Frame::new(InterfaceType::Serial, &b"ctrl req"[..]).encode(&mut host_tx, &config.frame)?;

    for round in 0..5 {
        let wire = host.exchange(&host_tx, Duration::from_secs(1))?;
        host_tx.fill(0);

        match decode_header(&wire, &config.frame) {
            Ok(header) => println!(
                "exchange {round}: {} seq={} {:?}",
                header.if_type,
                header.seq_num,
                String::from_utf8_lossy(&wire[header.payload_range()])
            ),
            Err(FrameError::DummyFrame) => println!("exchange {round}: dummy"),
            Err(err) => println!("exchange {round}: rejected ({err})"),
        }
    }

    let received = transport.recv_timeout(Duration::from_secs(1))?;
    println!(
        "slave received {} {:?}",
        received.if_type(),
        String::from_utf8_lossy(received.payload())
    );

    transport.deinit()?;
    println!("{}", serde_json::to_string_pretty(&transport.stats())?);
    Ok(())
}
