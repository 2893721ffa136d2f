use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hostlink_frame::event::PACKET_TYPE_EVENT;
use hostlink_frame::{
    decode_header, Frame, FrameConfig, FrameError, InterfaceType, SlaveCapabilities, Throttle,
};
use hostlink_spi::{LinkState, PowerSaveEvent, SpiConfig, SpiError, SpiTransport, StatsSnapshot};
use hostlink_transport::{SimBus, SimGpio, SimHost};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cmd::{apply_polarity, parse_timeout, SimulateArgs};
use crate::exit::{spi_error, transport_error, CliError, CliResult, FAILURE, INTERNAL, SUCCESS, USAGE};
use crate::output::{row, OutputFormat, Report};

const SETTLE_TIMEOUT: Duration = Duration::from_millis(200);

/// What the simulated host saw on its side of the bus.
#[derive(Debug, Default, Serialize)]
struct HostView {
    exchanges: u64,
    startup_event_first: bool,
    capabilities: Option<SlaveCapabilities>,
    frames: BTreeMap<&'static str, u64>,
    dummies: u64,
    rejected: u64,
    throttled_exchanges: u64,
}

impl HostView {
    fn record(&mut self, wire: &[u8], config: &FrameConfig) {
        self.exchanges += 1;
        if wire.len() > 10 && Throttle::from_bits(wire[10]) == Throttle::On {
            self.throttled_exchanges += 1;
        }

        match decode_header(wire, config) {
            Ok(header)
                if header.if_type == InterfaceType::Private
                    && header.pkt_type == PACKET_TYPE_EVENT =>
            {
                if self.exchanges == 1 {
                    self.startup_event_first = true;
                }
                self.capabilities =
                    SlaveCapabilities::from_event_payload(&wire[header.payload_range()]).ok();
            }
            Ok(header) => {
                *self.frames.entry(header.if_type.name()).or_default() += 1;
            }
            Err(FrameError::DummyFrame) => self.dummies += 1,
            Err(err) => {
                warn!(error = %err, "host rejected slave frame");
                self.rejected += 1;
            }
        }
    }

    fn data_frames(&self) -> u64 {
        self.frames.values().sum()
    }
}

#[derive(Serialize)]
struct SimulateOutput {
    host: HostView,
    slave_received: u64,
    power_save_events: u64,
    final_state: LinkState,
    buffers_in_use: usize,
    stats: StatsSnapshot,
}

pub fn run(args: SimulateArgs, mut config: SpiConfig, format: OutputFormat) -> CliResult<i32> {
    args.frame.apply(&mut config);
    apply_polarity(&mut config, args.active_low);
    if let Some(policy) = args.policy {
        config.deassert_policy = policy.into();
    }
    let timeout = parse_timeout(&args.timeout)?;

    if args.interfaces.is_empty() {
        return Err(CliError::new(USAGE, "at least one interface is required"));
    }
    let max_payload = config.frame.max_payload();
    if args.payload_size == 0 || args.payload_size > max_payload {
        return Err(CliError::new(
            USAGE,
            format!("payload size must be between 1 and {max_payload}"),
        ));
    }

    let bus = SimBus::new(config.bus_queue_size);
    let gpio = SimGpio::new();
    let transport = SpiTransport::new(config.clone(), bus.clone(), gpio.clone())
        .map_err(|err| spi_error("init failed", err))?;

    let power_save_events = Arc::new(AtomicU64::new(0));
    {
        let counter = Arc::clone(&power_save_events);
        transport.register_event_handler(move |event: PowerSaveEvent| {
            debug!(?event, "power save event");
            counter.fetch_add(1, Ordering::Relaxed);
        });
    }

    let running = Arc::new(AtomicBool::new(true));
    if args.forever {
        install_ctrlc_handler(running.clone())?;
    }

    transport
        .start()
        .map_err(|err| spi_error("start failed", err))?;

    let host = SimHost::new(bus, gpio).with_active_levels(
        config.handshake.polarity.active(),
        config.data_ready.polarity.active(),
    );

    let mut view = HostView::default();
    let mut slave_received = 0u64;
    let mut submitted = 0usize;
    let mut host_sent = 0usize;
    let mut host_tx = vec![0u8; config.frame.block_size()];
    let budget = (args.frames + args.host_frames + 1) as u64 * 4 + 8;

    info!(
        frames = args.frames,
        host_frames = args.host_frames,
        forever = args.forever,
        "simulation started"
    );

    loop {
        while submitted < args.frames {
            let if_type = args.interfaces[submitted % args.interfaces.len()];
            let payload = test_payload(submitted, args.payload_size);
            match transport.submit_frame(if_type, 0, &payload) {
                Ok(()) => submitted += 1,
                Err(SpiError::QueueFull { .. }) => break,
                Err(err) => return Err(spi_error("submit failed", err)),
            }
        }

        host_tx.fill(0);
        if host_sent < args.host_frames {
            Frame::new(InterfaceType::Station, test_payload(host_sent, args.payload_size))
                .with_seq_num(host_sent as u16)
                .encode(&mut host_tx, &config.frame)
                .map_err(|err| CliError::new(INTERNAL, format!("host encode failed: {err}")))?;
            host_sent += 1;
        }

        let wire = host
            .exchange(&host_tx, timeout)
            .map_err(|err| transport_error("exchange failed", err))?;
        view.record(&wire, &config.frame);

        while let Ok(Some(_frame)) = transport.try_recv() {
            slave_received += 1;
        }

        if args.forever {
            if !running.load(Ordering::SeqCst) {
                break;
            }
            continue;
        }
        let done = submitted == args.frames
            && host_sent == args.host_frames
            && view.data_frames() >= args.frames as u64;
        if done || view.exchanges >= budget {
            break;
        }
    }

    while slave_received < host_sent as u64 {
        match transport.recv_timeout(SETTLE_TIMEOUT) {
            Ok(_frame) => slave_received += 1,
            Err(_) => break,
        }
    }

    transport
        .deinit()
        .map_err(|err| spi_error("deinit failed", err))?;

    let out = SimulateOutput {
        host: view,
        slave_received,
        power_save_events: power_save_events.load(Ordering::Relaxed),
        final_state: transport.state(),
        buffers_in_use: transport.buffers_in_use(),
        stats: transport.stats(),
    };

    let complete = args.forever
        || (out.host.data_frames() == args.frames as u64
            && out.host.rejected == 0
            && out.host.startup_event_first);

    print_report(&out, format);
    Ok(if complete { SUCCESS } else { FAILURE })
}

fn print_report(out: &SimulateOutput, format: OutputFormat) {
    let stats = &out.stats;
    let mut rows = vec![
        row("exchanges", out.host.exchanges),
        row("startup_event_first", out.host.startup_event_first),
    ];
    rows.extend(
        out.host
            .frames
            .iter()
            .map(|(name, count)| row(&format!("host_rx.{}", name.to_lowercase()), count)),
    );
    rows.extend([
        row("host_rx.dummy", out.host.dummies),
        row("host_rx.rejected", out.host.rejected),
        row("host_rx.throttled", out.host.throttled_exchanges),
        row("slave_rx", out.slave_received),
        row("tx.control", stats.tx.control),
        row("tx.voice", stats.tx.voice),
        row("tx.bulk", stats.tx.bulk),
        row("tx.dummy", stats.tx_dummy),
        row("tx.queue_full", stats.tx_queue_full),
        row("rx.total", stats.rx.total()),
        row("dropped.checksum", stats.dropped.checksum),
        row("dropped.malformed", stats.dropped.malformed),
        row("dropped.overrun", stats.dropped.overrun),
        row("throttle_on", stats.throttle_on),
        row("pool_exhausted", stats.pool_exhausted),
        row("bus_failures", stats.bus_failures),
        row("power_save_events", out.power_save_events),
        row("final_state", format!("{:?}", out.final_state).to_lowercase()),
        row("buffers_in_use", out.buffers_in_use),
    ]);

    Report {
        schema_id: "hostlink/cli/v1/simulate-report",
        body: out,
        rows,
    }
    .print(format);
}

fn test_payload(index: usize, size: usize) -> Vec<u8> {
    const PATTERN: &[u8] = b"hostlink";
    (0..size)
        .map(|n| PATTERN[(index + n) % PATTERN.len()])
        .collect()
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

#[cfg(test)]
mod tests {
    use hostlink_frame::{encode_dummy, DEFAULT_BUFFER_SIZE};

    use super::*;

    #[test]
    fn payload_is_sized_and_varies_by_index() {
        assert_eq!(test_payload(0, 5), b"hostl");
        assert_eq!(test_payload(1, 5), b"ostli");
        assert_eq!(test_payload(3, 0), b"");
    }

    #[test]
    fn host_view_classifies_wire_frames() {
        let config = FrameConfig::default();
        let mut view = HostView::default();

        let caps = SpiConfig::default().slave_capabilities();
        let mut wire = vec![0u8; DEFAULT_BUFFER_SIZE];
        caps.to_frame().encode(&mut wire, &config).unwrap();
        view.record(&wire, &config);

        wire.fill(0);
        Frame::new(InterfaceType::Hci, &b"voice"[..])
            .encode(&mut wire, &config)
            .unwrap();
        view.record(&wire, &config);

        wire.fill(0);
        encode_dummy(&mut wire, Throttle::On).unwrap();
        view.record(&wire, &config);

        assert!(view.startup_event_first);
        assert_eq!(view.capabilities, Some(caps));
        assert_eq!(view.frames.get("HCI"), Some(&1));
        assert_eq!(view.dummies, 1);
        assert_eq!(view.throttled_exchanges, 1);
        assert_eq!(view.data_frames(), 1);
    }
}
