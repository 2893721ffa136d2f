use hostlink_frame::event::cap;
use hostlink_frame::SlaveCapabilities;
use hostlink_spi::SpiConfig;
use serde::Serialize;

use crate::cmd::CapsArgs;
use crate::exit::{frame_error, CliResult, SUCCESS};
use crate::output::{hex_string, row, OutputFormat, Report};

#[derive(Serialize)]
struct CapsOutput<'a> {
    #[serde(flatten)]
    capabilities: &'a SlaveCapabilities,
    capability_names: Vec<&'static str>,
    frame_len: usize,
    frame_hex: String,
}

pub fn run(args: CapsArgs, mut config: SpiConfig, format: OutputFormat) -> CliResult<i32> {
    args.frame.apply(&mut config);
    if let Some(chip_id) = args.chip_id {
        config.capabilities.chip_id = chip_id;
    }
    if args.no_bluetooth {
        config.capabilities.bluetooth = false;
    }

    let caps = config.slave_capabilities();
    let mut wire = vec![0u8; config.frame.block_size()];
    let len = caps
        .to_frame()
        .encode(&mut wire, &config.frame)
        .map_err(|err| frame_error("encode capability frame", err))?;

    let out = CapsOutput {
        capabilities: &caps,
        capability_names: capability_names(caps.capabilities),
        frame_len: len,
        frame_hex: hex_string(&wire[..len]),
    };

    let mut rows = vec![
        row("chip_id", format!("{:#04x}", caps.chip_id)),
        row(
            "capabilities",
            format!("{:#04x} [{}]", caps.capabilities, out.capability_names.join(",")),
        ),
    ];
    if let Some(ext) = caps.extended_capabilities {
        rows.push(row("extended_capabilities", format!("{ext:#010x}")));
    }
    rows.extend([
        row("raw_tp_test", caps.raw_tp_test),
        row("rx_queue_size", caps.rx_queue_size),
        row("tx_queue_size", caps.tx_queue_size),
        row("firmware_version", caps.firmware_version),
        row("frame_len", len),
        row("frame_hex", &out.frame_hex),
    ]);

    Report {
        schema_id: "hostlink/cli/v1/capabilities",
        body: &out,
        rows,
    }
    .print(format);
    Ok(SUCCESS)
}

fn capability_names(bits: u8) -> Vec<&'static str> {
    [
        (cap::WLAN_SDIO, "wlan_sdio"),
        (cap::BT_UART, "bt_uart"),
        (cap::BT_SDIO, "bt_sdio"),
        (cap::BLE_ONLY, "ble_only"),
        (cap::BR_EDR_ONLY, "br_edr_only"),
        (cap::WLAN_SPI, "wlan_spi"),
        (cap::BT_SPI, "bt_spi"),
        (cap::CHECKSUM_ENABLED, "checksum"),
    ]
    .into_iter()
    .filter(|(bit, _)| bits & bit != 0)
    .map(|(_, name)| name)
    .collect()
}
