//! In-process synthetic instrument.
//!
//! Answers the profile's poll payload with one well-formed frame and each
//! command payload with its expected response prefix. Profiles in `once` poll
//! mode start streaming after the first poll at a fixed frame period.
//! Useful for dry runs of a station config without hardware attached.

use super::{not_open, DeviceInfo, Transport};
use crate::error::AppResult;
use crate::ingest::decode::checksum_index;
use crate::profile::{BinaryEncoding, BinaryField, FieldSpan, FrameGrammar, PollMode, Profile, SerialSettings};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Frame period once a `once`-mode profile has started streaming.
const STREAM_PERIOD: Duration = Duration::from_millis(500);

/// Synthetic instrument speaking one profile's grammar.
#[derive(Debug)]
pub struct SimulatedTransport {
    profile: Profile,
    info: DeviceInfo,
    pending: VecDeque<u8>,
    open: bool,
    tick: u64,
    streaming_since: Option<Instant>,
    emitted_while_streaming: u64,
}

impl SimulatedTransport {
    pub fn for_profile(profile: &Profile) -> Self {
        Self {
            profile: profile.clone(),
            info: DeviceInfo {
                port: "sim0".to_string(),
                serial_number: Some(format!("SIM-{}", profile.name)),
                model: Some("Simulated Instrument".to_string()),
                description: Some(profile.description.clone()),
            },
            pending: VecDeque::new(),
            open: false,
            tick: 0,
            streaming_since: None,
            emitted_while_streaming: 0,
        }
    }

    /// Next synthetic reading: a slow drift around a fixed level.
    fn next_value(&mut self) -> (f64, f64) {
        self.tick += 1;
        let phase = self.tick as f64 / 10.0;
        (1.25 + 0.05 * phase.sin(), 24.0 + 0.5 * phase.cos())
    }

    fn emit_frame(&mut self) {
        let (value, temperature) = self.next_value();
        let frame = encode_frame(&self.profile.frame, value, temperature, &self.profile.measurement.unit);
        self.pending.extend(frame);
    }

    fn take_pending(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        n
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn open(&mut self, _settings: &SerialSettings) -> AppResult<DeviceInfo> {
        self.pending.clear();
        self.streaming_since = None;
        self.emitted_while_streaming = 0;
        self.open = true;
        Ok(self.info.clone())
    }

    async fn close(&mut self) -> AppResult<()> {
        self.open = false;
        self.streaming_since = None;
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> AppResult<usize> {
        if !self.open {
            return Err(not_open());
        }
        if !self.pending.is_empty() {
            return Ok(self.take_pending(buf));
        }
        if let Some(since) = self.streaming_since {
            let due = since + STREAM_PERIOD * (self.emitted_while_streaming as u32 + 1);
            let now = Instant::now();
            if due <= now + timeout {
                tokio::time::sleep_until(due).await;
                self.emitted_while_streaming += 1;
                self.emit_frame();
                return Ok(self.take_pending(buf));
            }
        }
        tokio::time::sleep(timeout).await;
        Ok(0)
    }

    async fn write_all(&mut self, data: &[u8]) -> AppResult<()> {
        if !self.open {
            return Err(not_open());
        }
        if data == self.profile.poll_payload.as_slice() {
            self.emit_frame();
            if self.profile.poll == PollMode::Once && self.streaming_since.is_none() {
                self.streaming_since = Some(Instant::now());
            }
        } else if let Some(command) = self
            .profile
            .commands
            .iter()
            .find(|c| c.payload.as_slice() == data)
        {
            let mut reply = format!("{} OK", command.expect).into_bytes();
            if let Some(terminator) = frame_terminator(&self.profile.frame) {
                reply.extend_from_slice(terminator.as_bytes());
            }
            self.pending.extend(reply);
        }
        Ok(())
    }

    fn device_info(&self) -> Option<&DeviceInfo> {
        self.open.then_some(&self.info)
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

fn frame_terminator(grammar: &FrameGrammar) -> Option<&str> {
    match grammar {
        FrameGrammar::Delimited { terminator, .. } | FrameGrammar::FixedWidth { terminator, .. } => {
            Some(terminator)
        }
        FrameGrammar::Binary { .. } => None,
    }
}

/// Render one frame in the given grammar.
pub fn encode_frame(grammar: &FrameGrammar, value: f64, temperature: f64, unit: &str) -> Vec<u8> {
    match grammar {
        FrameGrammar::Delimited {
            terminator,
            separator,
            prefix,
            value_field,
            unit_field,
            temperature_field,
        } => {
            let width = [Some(*value_field), *unit_field, *temperature_field]
                .into_iter()
                .flatten()
                .max()
                .unwrap_or(0)
                + 1;
            let mut tokens = vec![String::new(); width];
            tokens[*value_field] = format!("{value:+.4}");
            if let Some(i) = unit_field {
                tokens[*i] = unit.to_string();
            }
            if let Some(i) = temperature_field {
                tokens[*i] = format!("{temperature:.2}");
            }
            let mut line = prefix.clone().unwrap_or_default();
            line.push_str(&tokens.join(separator));
            line.push_str(terminator);
            line.into_bytes()
        }
        FrameGrammar::FixedWidth {
            terminator,
            value: value_span,
            unit: unit_span,
            temperature: temperature_span,
        } => {
            let spans = [Some(value_span), unit_span.as_ref(), temperature_span.as_ref()];
            let width = spans
                .iter()
                .flatten()
                .map(|s| s.start + s.width)
                .max()
                .unwrap_or(0);
            let mut line = vec![b' '; width];
            let mut put = |span: &FieldSpan, text: String| {
                let text = format!("{text:>w$}", w = span.width);
                let bytes = text.as_bytes();
                let take = bytes.len().min(span.width);
                line[span.start..span.start + take].copy_from_slice(&bytes[bytes.len() - take..]);
            };
            put(value_span, format!("{value:.3}"));
            if let Some(span) = unit_span {
                put(span, unit.to_string());
            }
            if let Some(span) = temperature_span {
                put(span, format!("{temperature:.1}"));
            }
            line.extend_from_slice(terminator.as_bytes());
            line
        }
        FrameGrammar::Binary {
            start_byte,
            end_byte,
            length,
            value: value_field,
            temperature: temperature_field,
            xor_checksum,
        } => {
            let mut frame = vec![0u8; *length];
            frame[0] = *start_byte;
            write_binary(&mut frame, value_field, value);
            if let Some(field) = temperature_field {
                write_binary(&mut frame, field, temperature);
            }
            if let Some(end) = end_byte {
                frame[*length - 1] = *end;
            }
            if *xor_checksum {
                let at = checksum_index(*length, end_byte.is_some());
                frame[at] = frame[1..at].iter().fold(0u8, |acc, b| acc ^ b);
            }
            frame
        }
    }
}

fn write_binary(frame: &mut [u8], field: &BinaryField, value: f64) {
    let raw = value / field.scale;
    let at = field.offset;
    match field.encoding {
        BinaryEncoding::U8 => frame[at] = raw.round().clamp(0.0, 255.0) as u8,
        BinaryEncoding::I16Be => {
            frame[at..at + 2].copy_from_slice(&(raw.round() as i16).to_be_bytes())
        }
        BinaryEncoding::U16Be => {
            frame[at..at + 2].copy_from_slice(&(raw.round() as u16).to_be_bytes())
        }
        BinaryEncoding::I32Be => {
            frame[at..at + 4].copy_from_slice(&(raw.round() as i32).to_be_bytes())
        }
        BinaryEncoding::U32Be => {
            frame[at..at + 4].copy_from_slice(&(raw.round() as u32).to_be_bytes())
        }
        BinaryEncoding::F32Be => frame[at..at + 4].copy_from_slice(&(raw as f32).to_be_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::load_registry_from_str;

    const SIM: &str = r#"
[profiles.sim]
transport = "simulated"
poll_payload = { literal = "D?\r\n" }
poll_interval_s = 0.1
frame = { kind = "delimited", value_field = 0, unit_field = 1, temperature_field = 2 }
measurement = { unit = "mS/cm" }

[[profiles.sim.commands]]
name = "ident"
payload = { literal = "ID?\r\n" }
expect = "ID"
"#;

    #[tokio::test]
    async fn test_poll_yields_one_frame() {
        let registry = load_registry_from_str(SIM).unwrap();
        let profile = registry.get("sim").unwrap();
        let mut sim = SimulatedTransport::for_profile(profile);
        sim.open(&profile.serial).await.unwrap();
        sim.write_all(b"D?\r\n").await.unwrap();

        let mut buf = [0u8; 64];
        let n = sim.read(&mut buf, Duration::from_millis(10)).await.unwrap();
        let text = std::str::from_utf8(&buf[..n]).unwrap();
        assert!(text.ends_with("\r\n"));
        assert_eq!(text.trim_end().split(',').count(), 3);
        assert!(text.contains("mS/cm"));
    }

    #[tokio::test]
    async fn test_command_reply_starts_with_expect() {
        let registry = load_registry_from_str(SIM).unwrap();
        let profile = registry.get("sim").unwrap();
        let mut sim = SimulatedTransport::for_profile(profile);
        sim.open(&profile.serial).await.unwrap();
        sim.write_all(b"ID?\r\n").await.unwrap();

        let mut buf = [0u8; 64];
        let n = sim.read(&mut buf, Duration::from_millis(10)).await.unwrap();
        assert_eq!(&buf[..n], b"ID OK\r\n");
    }

    #[test]
    fn test_binary_checksum_position() {
        let grammar = FrameGrammar::Binary {
            start_byte: 0xAA,
            end_byte: Some(0x55),
            length: 6,
            value: BinaryField {
                offset: 1,
                encoding: BinaryEncoding::U16Be,
                scale: 0.01,
            },
            temperature: None,
            xor_checksum: true,
        };
        let frame = encode_frame(&grammar, 2.5, 0.0, "");
        assert_eq!(frame[0], 0xAA);
        assert_eq!(&frame[1..3], &250u16.to_be_bytes());
        assert_eq!(frame[4], frame[1] ^ frame[2] ^ frame[3]);
        assert_eq!(frame[5], 0x55);
    }
}
