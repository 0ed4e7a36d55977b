//! Grammar-driven decoding of a single, complete frame.

use super::compensation::compensate;
use super::{DecodeResult, DecodeStatus, Measurement, RawFrame, Value};
use crate::profile::{BinaryEncoding, BinaryField, FieldSpan, FrameGrammar, MeasurementSpec, Profile};
use std::fmt;

/// Why a frame could not be decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum MalformedReason {
    /// Frame bytes are not valid UTF-8 text
    NotText,
    /// Token or column the grammar names is missing
    MissingField { field: &'static str, index: usize },
    /// Value token is not a number and the profile does not accept text
    NotNumeric { token: String },
    /// Temperature token is present but not a number
    BadTemperature { token: String },
    /// Binary frame did not end with the expected byte
    BadTrailer { expected: u8, actual: u8 },
    /// XOR checksum mismatch
    ChecksumMismatch { expected: u8, actual: u8 },
    /// Bytes discarded while searching for a frame start
    Garbage { discarded: usize },
    /// No terminator within the maximum frame length
    Overflow { discarded: usize },
    /// Decoded number is NaN or infinite
    NonFinite,
}

impl fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MalformedReason::NotText => write!(f, "frame is not valid text"),
            MalformedReason::MissingField { field, index } => {
                write!(f, "missing {field} field at {index}")
            }
            MalformedReason::NotNumeric { token } => write!(f, "value '{token}' is not numeric"),
            MalformedReason::BadTemperature { token } => {
                write!(f, "temperature '{token}' is not numeric")
            }
            MalformedReason::BadTrailer { expected, actual } => {
                write!(f, "end byte {actual:#04x}, expected {expected:#04x}")
            }
            MalformedReason::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum {actual:#04x}, expected {expected:#04x}")
            }
            MalformedReason::Garbage { discarded } => {
                write!(f, "{discarded} bytes before frame start discarded")
            }
            MalformedReason::Overflow { discarded } => {
                write!(f, "no terminator within {discarded} bytes")
            }
            MalformedReason::NonFinite => write!(f, "decoded value is not finite"),
        }
    }
}

/// Fields pulled out of a frame before unit handling.
#[derive(Debug, Clone, PartialEq)]
struct Fields {
    value: Value,
    unit: Option<String>,
    temperature: Option<f64>,
}

/// Decoder for one profile's grammar and measurement rules.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    grammar: FrameGrammar,
    measurement: MeasurementSpec,
}

impl FrameDecoder {
    pub fn new(grammar: FrameGrammar, measurement: MeasurementSpec) -> Self {
        Self {
            grammar,
            measurement,
        }
    }

    pub fn for_profile(profile: &Profile) -> Self {
        Self::new(profile.frame.clone(), profile.measurement.clone())
    }

    pub fn grammar(&self) -> &FrameGrammar {
        &self.grammar
    }

    /// Decode one complete frame.
    pub fn decode(&self, frame: RawFrame) -> DecodeResult {
        match self.decode_fields(&frame.bytes) {
            Ok(fields) => match self.finish(fields, frame) {
                Ok(m) => DecodeResult::Ok(m),
                Err(reason) => DecodeResult::Malformed(reason),
            },
            Err(reason) => DecodeResult::Malformed(reason),
        }
    }

    fn decode_fields(&self, bytes: &[u8]) -> Result<Fields, MalformedReason> {
        match &self.grammar {
            FrameGrammar::Delimited {
                terminator,
                separator,
                prefix,
                value_field,
                unit_field,
                temperature_field,
            } => {
                let text = frame_text(bytes, terminator)?;
                let text = match prefix {
                    Some(prefix) => text.strip_prefix(prefix.as_str()).unwrap_or(text),
                    None => text,
                };
                let tokens: Vec<&str> = text.split(separator.as_str()).map(str::trim).collect();
                let token = |field: &'static str, index: usize| {
                    tokens
                        .get(index)
                        .copied()
                        .filter(|t| !t.is_empty())
                        .ok_or(MalformedReason::MissingField { field, index })
                };

                let value = self.parse_value(token("value", *value_field)?)?;
                let unit = unit_field
                    .map(|i| token("unit", i))
                    .transpose()?
                    .map(str::to_string);
                let temperature = temperature_field
                    .map(|i| token("temperature", i).and_then(parse_temperature))
                    .transpose()?;
                Ok(Fields {
                    value,
                    unit,
                    temperature,
                })
            }
            FrameGrammar::FixedWidth {
                terminator,
                value,
                unit,
                temperature,
            } => {
                let text = frame_text(bytes, terminator)?;
                let value = self.parse_value(column(text, "value", value)?)?;
                let unit = unit
                    .as_ref()
                    .map(|span| column(text, "unit", span))
                    .transpose()?
                    .map(str::to_string);
                let temperature = temperature
                    .as_ref()
                    .map(|span| column(text, "temperature", span).and_then(parse_temperature))
                    .transpose()?;
                Ok(Fields {
                    value,
                    unit,
                    temperature,
                })
            }
            FrameGrammar::Binary {
                end_byte,
                length,
                value,
                temperature,
                xor_checksum,
                ..
            } => {
                if bytes.len() != *length {
                    return Err(MalformedReason::MissingField {
                        field: "frame",
                        index: *length,
                    });
                }
                if let Some(expected) = end_byte {
                    let actual = bytes[length - 1];
                    if actual != *expected {
                        return Err(MalformedReason::BadTrailer {
                            expected: *expected,
                            actual,
                        });
                    }
                }
                if *xor_checksum {
                    let at = checksum_index(*length, end_byte.is_some());
                    let expected = bytes[1..at].iter().fold(0u8, |acc, b| acc ^ b);
                    let actual = bytes[at];
                    if actual != expected {
                        return Err(MalformedReason::ChecksumMismatch { expected, actual });
                    }
                }
                let raw = read_binary(bytes, "value", value)?;
                let temperature = temperature
                    .as_ref()
                    .map(|field| read_binary(bytes, "temperature", field))
                    .transpose()?;
                Ok(Fields {
                    value: Value::Numeric(raw),
                    unit: None,
                    temperature,
                })
            }
        }
    }

    fn parse_value(&self, token: &str) -> Result<Value, MalformedReason> {
        match token.parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(Value::Numeric(v)),
            Ok(_) => Err(MalformedReason::NonFinite),
            Err(_) if self.measurement.allow_text => Ok(Value::Text(token.to_string())),
            Err(_) => Err(MalformedReason::NotNumeric {
                token: token.to_string(),
            }),
        }
    }

    fn finish(&self, fields: Fields, frame: RawFrame) -> Result<Measurement, MalformedReason> {
        let spec = &self.measurement;
        let (value, status) = match fields.value {
            Value::Numeric(raw) => {
                let scaled = raw * spec.scale + spec.offset;
                if !scaled.is_finite() {
                    return Err(MalformedReason::NonFinite);
                }
                (Value::Numeric(scaled), DecodeStatus::Ok)
            }
            text @ Value::Text(_) => (text, DecodeStatus::Text),
        };
        let compensated = match (&value, fields.temperature) {
            (Value::Numeric(v), Some(t)) => compensate(*v, t, &spec.compensation),
            _ => None,
        };
        let unit = fields
            .unit
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| spec.unit.clone());

        Ok(Measurement {
            value,
            unit,
            temperature: fields.temperature,
            compensated,
            status,
            frame,
        })
    }
}

/// Position of the XOR checksum byte in a binary frame.
pub(crate) fn checksum_index(length: usize, has_end_byte: bool) -> usize {
    length - 1 - usize::from(has_end_byte)
}

fn frame_text<'a>(bytes: &'a [u8], terminator: &str) -> Result<&'a str, MalformedReason> {
    let body = bytes
        .strip_suffix(terminator.as_bytes())
        .unwrap_or(bytes);
    std::str::from_utf8(body).map_err(|_| MalformedReason::NotText)
}

fn column<'a>(text: &'a str, field: &'static str, span: &FieldSpan) -> Result<&'a str, MalformedReason> {
    text.get(span.start..span.start + span.width)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(MalformedReason::MissingField {
            field,
            index: span.start,
        })
}

fn parse_temperature(token: &str) -> Result<f64, MalformedReason> {
    match token.parse::<f64>() {
        Ok(t) if t.is_finite() => Ok(t),
        _ => Err(MalformedReason::BadTemperature {
            token: token.to_string(),
        }),
    }
}

fn read_binary(bytes: &[u8], field: &'static str, spec: &BinaryField) -> Result<f64, MalformedReason> {
    let at = spec.offset;
    let slice = bytes
        .get(at..at + spec.encoding.width())
        .ok_or(MalformedReason::MissingField { field, index: at })?;
    let raw = match spec.encoding {
        BinaryEncoding::U8 => f64::from(slice[0]),
        BinaryEncoding::I16Be => f64::from(i16::from_be_bytes([slice[0], slice[1]])),
        BinaryEncoding::U16Be => f64::from(u16::from_be_bytes([slice[0], slice[1]])),
        BinaryEncoding::I32Be => {
            f64::from(i32::from_be_bytes([slice[0], slice[1], slice[2], slice[3]]))
        }
        BinaryEncoding::U32Be => {
            f64::from(u32::from_be_bytes([slice[0], slice[1], slice[2], slice[3]]))
        }
        BinaryEncoding::F32Be => {
            f64::from(f32::from_be_bytes([slice[0], slice[1], slice[2], slice[3]]))
        }
    };
    let value = raw * spec.scale;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(MalformedReason::NonFinite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::Compensation;
    use chrono::Utc;

    fn delimited() -> FrameDecoder {
        FrameDecoder::new(
            FrameGrammar::Delimited {
                terminator: "\r\n".into(),
                separator: ",".into(),
                prefix: None,
                value_field: 0,
                unit_field: Some(1),
                temperature_field: Some(2),
            },
            MeasurementSpec {
                unit: "uS/cm".into(),
                compensation: Compensation::Linear {
                    coefficient_per_c: 0.02,
                    reference_c: 25.0,
                },
                ..MeasurementSpec::default()
            },
        )
    }

    fn frame(bytes: &[u8]) -> RawFrame {
        RawFrame::new(bytes.to_vec(), Utc::now())
    }

    #[test]
    fn test_delimited_frame() {
        let DecodeResult::Ok(m) = delimited().decode(frame(b"+1.250,mS/cm,25.0\r\n")) else {
            panic!("expected a measurement");
        };
        assert_eq!(m.value, Value::Numeric(1.25));
        assert_eq!(m.unit, "mS/cm");
        assert_eq!(m.temperature, Some(25.0));
        assert_eq!(m.compensated, Some(1.25));
        assert_eq!(m.status, DecodeStatus::Ok);
    }

    #[test]
    fn test_missing_unit_falls_back_to_profile() {
        let decoder = FrameDecoder::new(
            FrameGrammar::Delimited {
                terminator: "\n".into(),
                separator: ";".into(),
                prefix: Some("V=".into()),
                value_field: 0,
                unit_field: None,
                temperature_field: None,
            },
            MeasurementSpec {
                unit: "pH".into(),
                ..MeasurementSpec::default()
            },
        );
        let DecodeResult::Ok(m) = decoder.decode(frame(b"V=7.01\n")) else {
            panic!("expected a measurement");
        };
        assert_eq!(m.value, Value::Numeric(7.01));
        assert_eq!(m.unit, "pH");
        assert_eq!(m.compensated, None);
    }

    #[test]
    fn test_non_numeric_rejected_unless_text_allowed() {
        let result = delimited().decode(frame(b"OVER,mS/cm,25.0\r\n"));
        assert!(matches!(
            result,
            DecodeResult::Malformed(MalformedReason::NotNumeric { .. })
        ));

        let decoder = FrameDecoder::new(
            delimited().grammar().clone(),
            MeasurementSpec {
                allow_text: true,
                ..MeasurementSpec::default()
            },
        );
        let DecodeResult::Ok(m) = decoder.decode(frame(b"OVER,mS/cm,25.0\r\n")) else {
            panic!("expected a text measurement");
        };
        assert_eq!(m.value, Value::Text("OVER".into()));
        assert_eq!(m.status, DecodeStatus::Text);
    }

    #[test]
    fn test_missing_field() {
        let result = delimited().decode(frame(b"1.0\r\n"));
        assert_eq!(
            result,
            DecodeResult::Malformed(MalformedReason::MissingField {
                field: "unit",
                index: 1
            })
        );
    }

    #[test]
    fn test_fixed_width_with_scale() {
        let decoder = FrameDecoder::new(
            FrameGrammar::FixedWidth {
                terminator: "\r".into(),
                value: FieldSpan { start: 0, width: 6 },
                unit: Some(FieldSpan { start: 7, width: 2 }),
                temperature: None,
            },
            MeasurementSpec {
                scale: 10.0,
                offset: 1.0,
                ..MeasurementSpec::default()
            },
        );
        let DecodeResult::Ok(m) = decoder.decode(frame(b" 0.500 mV\r")) else {
            panic!("expected a measurement");
        };
        assert_eq!(m.value, Value::Numeric(6.0));
        assert_eq!(m.unit, "mV");
    }

    #[test]
    fn test_binary_checksum() {
        let decoder = FrameDecoder::new(
            FrameGrammar::Binary {
                start_byte: 0xAA,
                end_byte: Some(0x55),
                length: 6,
                value: BinaryField {
                    offset: 1,
                    encoding: BinaryEncoding::I16Be,
                    scale: 0.01,
                },
                temperature: None,
                xor_checksum: true,
            },
            MeasurementSpec::default(),
        );
        let payload = (-150i16).to_be_bytes();
        let checksum = payload[0] ^ payload[1];
        let good = [0xAA, payload[0], payload[1], 0x00, checksum, 0x55];
        let DecodeResult::Ok(m) = decoder.decode(frame(&good)) else {
            panic!("expected a measurement");
        };
        assert_eq!(m.value, Value::Numeric(-1.5));

        let mut bad = good;
        bad[4] ^= 0xFF;
        assert!(matches!(
            decoder.decode(frame(&bad)),
            DecodeResult::Malformed(MalformedReason::ChecksumMismatch { .. })
        ));
    }
}
