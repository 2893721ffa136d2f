use hostlink_frame::event::PACKET_TYPE_EVENT;
use hostlink_frame::{
    decode_header, peek_flags, Flags, FrameError, Header, InterfaceType, SlaveCapabilities,
    Throttle,
};
use hostlink_spi::SpiConfig;
use serde::Serialize;

use crate::cmd::DecodeArgs;
use crate::exit::{CliError, CliResult, DATA_INVALID, FAILURE, SUCCESS, USAGE};
use crate::output::{parse_hex, payload_preview, row, OutputFormat, Report};

#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
enum Verdict {
    Frame,
    Dummy,
    Rejected,
}

#[derive(Serialize)]
struct HeaderOutput {
    if_type: InterfaceType,
    if_num: u8,
    priority: &'static str,
    flags: Vec<&'static str>,
    len: u16,
    offset: u16,
    checksum: u16,
    seq_num: u16,
    throttle: Throttle,
    pkt_type: u8,
    payload: String,
}

#[derive(Serialize)]
struct DecodeOutput {
    verdict: Verdict,
    wire_len: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    header: Option<HeaderOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    capabilities: Option<SlaveCapabilities>,
}

pub fn run(args: DecodeArgs, mut config: SpiConfig, format: OutputFormat) -> CliResult<i32> {
    args.frame.apply(&mut config);
    let bytes = read_input(&args)?;
    let (out, code) = inspect(&bytes, &config);

    let mut rows = vec![
        row("verdict", verdict_name(&out.verdict)),
        row("wire_len", out.wire_len),
    ];
    if let Some(reason) = &out.reason {
        rows.push(row("reason", reason));
    }
    if let Some(header) = &out.header {
        rows.extend([
            row("if_type", header.if_type),
            row("if_num", header.if_num),
            row("priority", header.priority),
            row("flags", header.flags.join(",")),
            row("len", header.len),
            row("offset", header.offset),
            row("checksum", format!("{:#06x}", header.checksum)),
            row("seq_num", header.seq_num),
            row("throttle", format!("{:?}", header.throttle).to_lowercase()),
            row("pkt_type", format!("{:#04x}", header.pkt_type)),
            row("payload", &header.payload),
        ]);
    }
    if let Some(caps) = &out.capabilities {
        rows.extend([
            row("chip_id", format!("{:#04x}", caps.chip_id)),
            row("capabilities", format!("{:#04x}", caps.capabilities)),
            row("firmware_version", caps.firmware_version),
        ]);
    }

    Report {
        schema_id: "hostlink/cli/v1/frame-decode",
        body: &out,
        rows,
    }
    .print(format);
    Ok(code)
}

fn read_input(args: &DecodeArgs) -> CliResult<Vec<u8>> {
    if let Some(path) = &args.file {
        return std::fs::read(path)
            .map_err(|err| CliError::new(FAILURE, format!("read {}: {err}", path.display())));
    }
    let hex = args.hex.as_deref().unwrap_or_default();
    parse_hex(hex).map_err(|err| CliError::new(USAGE, format!("invalid hex: {err}")))
}

fn inspect(bytes: &[u8], config: &SpiConfig) -> (DecodeOutput, i32) {
    let mut out = DecodeOutput {
        verdict: Verdict::Rejected,
        wire_len: bytes.len(),
        reason: None,
        header: None,
        capabilities: None,
    };

    match decode_header(bytes, &config.frame) {
        Ok(header) => {
            let payload = &bytes[header.payload_range()];
            if header.if_type == InterfaceType::Private && header.pkt_type == PACKET_TYPE_EVENT {
                out.capabilities = SlaveCapabilities::from_event_payload(payload).ok();
            }
            out.verdict = Verdict::Frame;
            out.header = Some(header_output(&header, payload));
            (out, SUCCESS)
        }
        Err(FrameError::DummyFrame) => {
            out.verdict = Verdict::Dummy;
            let flags = flag_names(peek_flags(bytes));
            if !flags.is_empty() {
                out.reason = Some(format!("flags: {}", flags.join(",")));
            }
            (out, SUCCESS)
        }
        Err(err) => {
            out.reason = Some(err.to_string());
            (out, DATA_INVALID)
        }
    }
}

fn header_output(header: &Header, payload: &[u8]) -> HeaderOutput {
    HeaderOutput {
        if_type: header.if_type,
        if_num: header.if_num,
        priority: header.if_type.priority().name(),
        flags: flag_names(header.flags),
        len: header.len,
        offset: header.offset,
        checksum: header.checksum,
        seq_num: header.seq_num,
        throttle: header.throttle,
        pkt_type: header.pkt_type,
        payload: payload_preview(payload),
    }
}

fn flag_names(flags: Flags) -> Vec<&'static str> {
    [
        (Flags::MORE_FRAGMENT, "more_fragment"),
        (Flags::WAKEUP, "wakeup"),
        (Flags::POWER_SAVE_STARTED, "power_save_started"),
        (Flags::POWER_SAVE_STOPPED, "power_save_stopped"),
    ]
    .into_iter()
    .filter(|(flag, _)| flags.contains(*flag))
    .map(|(_, name)| name)
    .collect()
}

fn verdict_name(verdict: &Verdict) -> &'static str {
    match verdict {
        Verdict::Frame => "frame",
        Verdict::Dummy => "dummy",
        Verdict::Rejected => "rejected",
    }
}
