//! Validation of profile specs into ready-to-use `Profile`s.
//!
//! Every check pushes a `FieldError` instead of returning early, so an operator
//! sees all problems in a registry at once. Nothing here substitutes a default
//! for a bad value.

use super::schema::{
    BinaryField, CommandDef, CommandSpec, CommandTrigger, CommandTriggerSpec, Compensation,
    FrameGrammar, PayloadSpec, PollMode, PollModeSpec, Profile, ProfileSpec,
};
use crate::error::FieldError;
use serde_valid::Validate;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

/// Decode a payload spec into bytes.
pub fn parse_payload(spec: &PayloadSpec) -> Result<Vec<u8>, String> {
    match spec {
        PayloadSpec::Literal(text) => {
            if text.is_empty() {
                return Err("literal payload must not be empty".to_string());
            }
            Ok(text.as_bytes().to_vec())
        }
        PayloadSpec::Hex(text) => parse_hex(text),
    }
}

fn parse_hex(text: &str) -> Result<Vec<u8>, String> {
    let digits: String = text
        .split_whitespace()
        .map(|chunk| chunk.trim_start_matches("0x").trim_start_matches("0X"))
        .collect();
    if digits.is_empty() {
        return Err("hex payload must not be empty".to_string());
    }
    let chars: Vec<char> = digits.chars().collect();
    if chars.len() % 2 != 0 {
        return Err(format!("hex payload has odd digit count ({})", chars.len()));
    }
    chars
        .chunks(2)
        .map(|pair| match (pair[0].to_digit(16), pair[1].to_digit(16)) {
            (Some(hi), Some(lo)) => Ok((hi * 16 + lo) as u8),
            _ => Err(format!("invalid hex byte '{}{}'", pair[0], pair[1])),
        })
        .collect()
}

/// Convert positive, finite seconds to a `Duration`.
fn positive_seconds(value: f64) -> Option<Duration> {
    if value.is_finite() && value > 0.0 {
        Duration::try_from_secs_f64(value).ok()
    } else {
        None
    }
}

/// Validate one profile spec.
pub fn validate_profile(
    name: &str,
    spec: &ProfileSpec,
    known_profiles: &HashSet<&str>,
) -> Result<Profile, Vec<FieldError>> {
    let base = format!("profiles.{name}");
    let mut errors = Vec::new();

    if name.trim().is_empty() {
        errors.push(FieldError::new(&base, "profile name must not be empty"));
    }

    let poll_payload = match parse_payload(&spec.poll_payload) {
        Ok(bytes) => bytes,
        Err(msg) => {
            errors.push(FieldError::new(format!("{base}.poll_payload"), msg));
            Vec::new()
        }
    };

    // A zero interval silently starves the instrument; never accept it.
    let field = format!("{base}.poll_interval_s");
    let interval = match spec.poll_interval_s {
        Some(value) => {
            let interval = positive_seconds(value);
            if interval.is_none() {
                errors.push(FieldError::new(
                    &field,
                    format!("must be a finite number of seconds greater than 0 (got {value})"),
                ));
            }
            interval
        }
        None => {
            if spec.poll_mode == PollModeSpec::Periodic {
                errors.push(FieldError::new(&field, "required for periodic polling"));
            }
            None
        }
    };
    let poll = match (spec.poll_mode, interval) {
        (PollModeSpec::Periodic, Some(interval)) => PollMode::Periodic { interval },
        _ => PollMode::Once,
    };

    if let Err(validation) = spec.serial.validate() {
        for line in validation.to_string().lines() {
            errors.push(FieldError::new(format!("{base}.serial"), line));
        }
    }
    if spec.serial.latency_timer_ms == Some(0) {
        errors.push(FieldError::new(
            format!("{base}.serial.latency_timer_ms"),
            "must be between 1 and 255",
        ));
    }

    validate_frame(&format!("{base}.frame"), &spec.frame, &mut errors);
    validate_measurement(&base, spec, &mut errors);

    let commands = validate_commands(&base, &spec.commands, &mut errors);

    if let Some(fallback) = &spec.fallback {
        if fallback == name {
            errors.push(FieldError::new(
                format!("{base}.fallback"),
                "profile cannot fall back to itself",
            ));
        } else if !known_profiles.contains(fallback.as_str()) {
            errors.push(FieldError::new(
                format!("{base}.fallback"),
                format!("references unknown profile '{fallback}'"),
            ));
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(Profile {
        name: name.to_string(),
        description: spec.description.clone(),
        transport: spec.transport,
        serial: spec.serial.clone(),
        poll_payload,
        poll,
        frame: spec.frame.clone(),
        measurement: spec.measurement.clone(),
        commands,
        fallback: spec.fallback.clone(),
    })
}

fn validate_frame(path: &str, frame: &FrameGrammar, errors: &mut Vec<FieldError>) {
    match frame {
        FrameGrammar::Delimited {
            terminator,
            separator,
            value_field,
            unit_field,
            temperature_field,
            ..
        } => {
            if terminator.is_empty() {
                errors.push(FieldError::new(
                    format!("{path}.terminator"),
                    "must not be empty",
                ));
            }
            if separator.is_empty() {
                errors.push(FieldError::new(
                    format!("{path}.separator"),
                    "must not be empty",
                ));
            }
            for (field, index) in [("unit_field", unit_field), ("temperature_field", temperature_field)] {
                if *index == Some(*value_field) {
                    errors.push(FieldError::new(
                        format!("{path}.{field}"),
                        "must differ from value_field",
                    ));
                }
            }
        }
        FrameGrammar::FixedWidth {
            terminator,
            value,
            unit,
            temperature,
        } => {
            if terminator.is_empty() {
                errors.push(FieldError::new(
                    format!("{path}.terminator"),
                    "must not be empty",
                ));
            }
            for (field, span) in [("value", Some(value)), ("unit", unit.as_ref()), ("temperature", temperature.as_ref())] {
                if let Some(span) = span {
                    if span.width == 0 {
                        errors.push(FieldError::new(
                            format!("{path}.{field}.width"),
                            "must be at least 1",
                        ));
                    }
                }
            }
        }
        FrameGrammar::Binary {
            end_byte,
            length,
            value,
            temperature,
            xor_checksum,
            ..
        } => {
            let trailer = usize::from(end_byte.is_some()) + usize::from(*xor_checksum);
            let body_end = length.saturating_sub(trailer);
            if *length < 2 + trailer {
                errors.push(FieldError::new(
                    format!("{path}.length"),
                    format!("{length} bytes cannot hold start byte, payload and trailer"),
                ));
            }
            let mut check_field = |field: &str, spec: &BinaryField| {
                if spec.offset == 0 {
                    errors.push(FieldError::new(
                        format!("{path}.{field}.offset"),
                        "offset 0 is the start byte",
                    ));
                }
                if spec.offset + spec.encoding.width() > body_end {
                    errors.push(FieldError::new(
                        format!("{path}.{field}.offset"),
                        format!(
                            "field of {} bytes at offset {} overruns frame body ({body_end} bytes)",
                            spec.encoding.width(),
                            spec.offset
                        ),
                    ));
                }
                if !spec.scale.is_finite() || spec.scale == 0.0 {
                    errors.push(FieldError::new(
                        format!("{path}.{field}.scale"),
                        "must be finite and non-zero",
                    ));
                }
            };
            check_field("value", value);
            if let Some(temperature) = temperature {
                check_field("temperature", temperature);
            }
        }
    }
}

fn validate_measurement(base: &str, spec: &ProfileSpec, errors: &mut Vec<FieldError>) {
    let measurement = &spec.measurement;
    if !measurement.scale.is_finite() || measurement.scale == 0.0 {
        errors.push(FieldError::new(
            format!("{base}.measurement.scale"),
            "must be finite and non-zero",
        ));
    }
    if !measurement.offset.is_finite() {
        errors.push(FieldError::new(
            format!("{base}.measurement.offset"),
            "must be finite",
        ));
    }
    if let Compensation::Linear {
        coefficient_per_c,
        reference_c,
    } = measurement.compensation
    {
        if !coefficient_per_c.is_finite() || !reference_c.is_finite() {
            errors.push(FieldError::new(
                format!("{base}.measurement.compensation"),
                "coefficients must be finite",
            ));
        }
        let has_temperature = match &spec.frame {
            FrameGrammar::Delimited {
                temperature_field, ..
            } => temperature_field.is_some(),
            FrameGrammar::FixedWidth { temperature, .. } => temperature.is_some(),
            FrameGrammar::Binary { temperature, .. } => temperature.is_some(),
        };
        if !has_temperature {
            errors.push(FieldError::new(
                format!("{base}.measurement.compensation"),
                "linear compensation needs a temperature field in the frame grammar",
            ));
        }
    }
}

fn validate_commands(
    base: &str,
    commands: &[CommandSpec],
    errors: &mut Vec<FieldError>,
) -> Vec<CommandDef> {
    let mut seen = HashSet::new();
    let mut defs = Vec::with_capacity(commands.len());

    for (index, command) in commands.iter().enumerate() {
        let path = format!("{base}.commands[{index}]");
        let before = errors.len();

        if command.name.trim().is_empty() {
            errors.push(FieldError::new(format!("{path}.name"), "must not be empty"));
        } else if !seen.insert(command.name.as_str()) {
            errors.push(FieldError::new(
                format!("{path}.name"),
                format!("duplicate command name '{}'", command.name),
            ));
        }

        let payload = parse_payload(&command.payload).unwrap_or_else(|msg| {
            errors.push(FieldError::new(format!("{path}.payload"), msg));
            Vec::new()
        });

        if command.expect.is_empty() {
            errors.push(FieldError::new(
                format!("{path}.expect"),
                "response prefix must not be empty",
            ));
        }
        if command.retries == 0 {
            errors.push(FieldError::new(
                format!("{path}.retries"),
                "must be at least 1",
            ));
        }

        let backoff_base = positive_seconds(command.backoff_s);
        if backoff_base.is_none() {
            errors.push(FieldError::new(
                format!("{path}.backoff_s"),
                "must be a finite number of seconds greater than 0",
            ));
        }
        let backoff_cap = match command.backoff_cap_s {
            Some(cap) => {
                let parsed = positive_seconds(cap);
                match (parsed, backoff_base) {
                    (Some(cap), Some(base)) if cap >= base => Some(cap),
                    _ => {
                        errors.push(FieldError::new(
                            format!("{path}.backoff_cap_s"),
                            "must be finite and >= backoff_s",
                        ));
                        None
                    }
                }
            }
            None => backoff_base.map(|base| base * command.retries.max(1)),
        };

        let trigger = match command.trigger {
            CommandTriggerSpec::Startup => Some(CommandTrigger::Startup),
            CommandTriggerSpec::Periodic => match command.every_s.and_then(positive_seconds) {
                Some(every) => Some(CommandTrigger::Periodic { every }),
                None => {
                    errors.push(FieldError::new(
                        format!("{path}.every_s"),
                        "periodic commands need every_s > 0",
                    ));
                    None
                }
            },
            CommandTriggerSpec::Once => {
                let delay = command.delay_s.unwrap_or(0.0);
                if delay.is_finite() && delay >= 0.0 {
                    Some(CommandTrigger::Once {
                        delay: Duration::from_secs_f64(delay),
                    })
                } else {
                    errors.push(FieldError::new(
                        format!("{path}.delay_s"),
                        "must be finite and >= 0",
                    ));
                    None
                }
            }
        };

        if errors.len() != before {
            continue;
        }
        if let (Some(backoff_base), Some(backoff_cap), Some(trigger)) =
            (backoff_base, backoff_cap, trigger)
        {
            defs.push(CommandDef {
                name: command.name.clone(),
                payload,
                expect: command.expect.clone(),
                max_retries: command.retries,
                backoff_base,
                backoff_cap,
                trigger,
            });
        }
    }

    defs
}

/// Reject fallback chains that loop back on themselves.
pub fn validate_fallback_cycles(specs: &BTreeMap<String, ProfileSpec>) -> Vec<FieldError> {
    let mut errors = Vec::new();
    for start in specs.keys() {
        let mut visited = HashSet::new();
        let mut current = start.as_str();
        visited.insert(current);
        while let Some(next) = specs.get(current).and_then(|s| s.fallback.as_deref()) {
            if !specs.contains_key(next) {
                break;
            }
            if !visited.insert(next) {
                if next != start {
                    break;
                }
                errors.push(FieldError::new(
                    format!("profiles.{start}.fallback"),
                    "fallback chain forms a cycle",
                ));
                break;
            }
            current = next;
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_with_separators() {
        assert_eq!(parse_hex("02 52 03").unwrap(), vec![0x02, 0x52, 0x03]);
        assert_eq!(parse_hex("0x0A0d").unwrap(), vec![0x0A, 0x0D]);
    }

    #[test]
    fn test_parse_hex_rejects_bad_input() {
        assert!(parse_hex("").is_err());
        assert!(parse_hex("123").is_err());
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn test_parse_hex_rejects_non_ascii() {
        assert_eq!(parse_hex("aé").unwrap_err(), "invalid hex byte 'aé'");
        assert!(parse_hex("aé1").is_err());
        assert!(parse_hex("0x52 ü3").is_err());
    }

    #[test]
    fn test_literal_payload() {
        let bytes = parse_payload(&PayloadSpec::Literal("D?\r\n".into())).unwrap();
        assert_eq!(bytes, b"D?\r\n");
        assert!(parse_payload(&PayloadSpec::Literal(String::new())).is_err());
    }

    #[test]
    fn test_positive_seconds() {
        assert_eq!(positive_seconds(1.5), Some(Duration::from_millis(1500)));
        assert_eq!(positive_seconds(0.0), None);
        assert_eq!(positive_seconds(-1.0), None);
        assert_eq!(positive_seconds(f64::NAN), None);
        assert_eq!(positive_seconds(f64::INFINITY), None);
    }
}
