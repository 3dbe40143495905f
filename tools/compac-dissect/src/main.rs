//! Dissect captured BM13xx serial traffic.
//!
//! Feeds hex-dumped frames through the same classification code the driver
//! runs at runtime, so what the tool prints is exactly what the miner
//! would have done with the bytes. Input is one frame per line, hex with
//! optional separators, e.g. the driver's own TX/RX trace output.

use anyhow::{Context, Result};
use clap::Parser;
use compac_miner::asic::frame::{classify, FrameClass};
use compac_miner::asic::{crc, AsicFamily};
use std::io::{self, BufRead};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "compac-dissect",
    version,
    about = "Dissector for captured BM13xx serial frames"
)]
struct Options {
    /// Chip family the capture came from.
    #[arg(long, default_value = "bm1397")]
    family: String,

    /// Capture file; standard input when omitted.
    file: Option<PathBuf>,

    /// Also dump frames that classify as noise.
    #[arg(long)]
    noise: bool,
}

fn parse_family(name: &str) -> Result<AsicFamily> {
    match name.to_ascii_lowercase().as_str() {
        "bm1384" => Ok(AsicFamily::BM1384),
        "bm1387" => Ok(AsicFamily::BM1387),
        "bm1397" => Ok(AsicFamily::BM1397),
        "bm1362" => Ok(AsicFamily::BM1362),
        "bm1370" => Ok(AsicFamily::BM1370),
        other => anyhow::bail!("unknown family '{other}'"),
    }
}

/// Strip direction prefixes and separators out of one capture line.
fn parse_line(line: &str) -> Option<(Direction, Vec<u8>)> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }

    let (direction, rest) = if let Some(rest) = trimmed.strip_prefix("TX") {
        (Direction::HostToChip, rest)
    } else if let Some(rest) = trimmed.strip_prefix("RX") {
        (Direction::ChipToHost, rest)
    } else {
        (Direction::ChipToHost, trimmed)
    };

    let cleaned: String = rest
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .collect();
    if cleaned.is_empty() || cleaned.len() % 2 != 0 {
        return None;
    }
    hex::decode(&cleaned).ok().map(|bytes| (direction, bytes))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    HostToChip,
    ChipToHost,
}

/// Render one frame the way the driver would interpret it.
fn dissect(family: AsicFamily, direction: Direction, bytes: &[u8], show_noise: bool) -> Option<String> {
    let dump = hex::encode(bytes);

    if direction == Direction::HostToChip {
        return Some(format!("-> {dump}  {}", describe_command(family, bytes)));
    }

    let described = match classify(family, bytes) {
        FrameClass::ChipReply => "chip enumeration reply".to_string(),
        FrameClass::FrequencyReport(Some(mhz)) => format!("frequency report {mhz:.2}MHz"),
        FrameClass::FrequencyReport(None) => "frequency report (bad divisor)".to_string(),
        FrameClass::OpenCoreNonce => "open-core nonce".to_string(),
        FrameClass::Nonce(nonce) => format!(
            "nonce {:08x} @ job {:02x}",
            nonce.nonce, nonce.job_id
        ),
        FrameClass::Noise => {
            if !show_noise {
                return None;
            }
            "noise".to_string()
        }
    };
    Some(format!("<- {dump}  {described}"))
}

/// Best-effort naming of host-side frames from their leading byte.
fn describe_command(family: AsicFamily, bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "empty".into();
    }
    let crc_ok = match family {
        AsicFamily::BM1384 => {
            crc::bmcrc(bytes, 8 * bytes.len() as u32 - 5) == bytes[bytes.len() - 1] & 0x1f
        }
        _ => {
            let bits = family.cmd_crc_bits(bytes.len());
            crc::bmcrc(bytes, bits) == bytes[bytes.len() - 1] & 0x1f
        }
    };
    let crc_tag = if crc_ok { "" } else { " [BAD CRC]" };

    let name = match (family, bytes[0]) {
        (AsicFamily::BM1384, 0x84) if bytes.get(2) == Some(&0x04) => "frequency ping",
        (AsicFamily::BM1384, 0x84) => "chip query",
        (AsicFamily::BM1384, 0x85) => "chain inactive",
        (AsicFamily::BM1384, 0x82) => "set PLL",
        (AsicFamily::BM1384, 0x01) => "set chip address",
        (_, 0x54) if bytes.get(3) == Some(&0x0c) => "frequency ping",
        (_, 0x54) => "chip query",
        (_, 0x55) => "chain inactive",
        (_, 0x41) => "set chip address",
        (_, 0x58) if bytes.get(3) == Some(&0x0c) => "set PLL",
        (_, 0x58) if bytes.get(3) == Some(&0x1c) => "set clock gate / baud",
        (_, 0x21) => return format!("work task, job {:02x}", bytes.get(2).copied().unwrap_or(0)),
        _ => "unknown command",
    };
    format!("{name}{crc_tag}")
}

fn main() -> Result<()> {
    let options = Options::parse();
    let family = parse_family(&options.family)?;

    let reader: Box<dyn BufRead> = match &options.file {
        Some(path) => Box::new(io::BufReader::new(
            std::fs::File::open(path).with_context(|| format!("open {}", path.display()))?,
        )),
        None => Box::new(io::BufReader::new(io::stdin())),
    };

    for line in reader.lines() {
        let line = line?;
        let Some((direction, bytes)) = parse_line(&line) else {
            continue;
        };
        if let Some(rendered) = dissect(family, direction, &bytes, options.noise) {
            println!("{rendered}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("TX: 55:05:00:00:00", Direction::HostToChip; "driver tx dump")]
    #[test_case("RX: aa 55 13", Direction::ChipToHost; "spaced rx dump")]
    #[test_case("deadbeef", Direction::ChipToHost; "bare hex")]
    fn line_parsing(line: &str, direction: Direction) {
        let (d, bytes) = parse_line(line).expect("parses");
        assert_eq!(d, direction);
        assert!(!bytes.is_empty());
    }

    #[test]
    fn comments_and_blanks_are_skipped() {
        assert!(parse_line("# comment").is_none());
        assert!(parse_line("   ").is_none());
        assert!(parse_line("abc").is_none(), "odd-length hex");
    }

    #[test]
    fn chain_inactive_is_named() {
        let described = describe_command(AsicFamily::BM1397, &[0x55, 0x05, 0x00, 0x00, 0x03]);
        assert!(described.starts_with("chain inactive"), "{described}");
    }

    #[test]
    fn work_task_shows_job_id() {
        let described = describe_command(AsicFamily::BM1397, &[0x21, 0x36, 0x18, 0x01]);
        assert_eq!(described, "work task, job 18");
    }

    #[test]
    fn response_nonce_renders() {
        let mut frame = vec![0x12, 0x34, 0x56, 0x78, 0x00, 0x1c, 0x00];
        let crc = crc::bmcrc(&frame, 8 * frame.len() as u32 - 8);
        let last = frame.len() - 1;
        frame[last] = crc;
        let line = dissect(AsicFamily::BM1397, Direction::ChipToHost, &frame, false)
            .expect("renders");
        assert!(line.contains("nonce 12345678"), "{line}");
    }

    #[test]
    fn noise_is_hidden_by_default() {
        let frame = [0xff, 0xff];
        assert!(dissect(AsicFamily::BM1397, Direction::ChipToHost, &frame, false).is_none());
        assert!(dissect(AsicFamily::BM1397, Direction::ChipToHost, &frame, true).is_some());
    }
}
