//! Profile registry loading.
//!
//! The registry is a TOML file parsed through figment, then every profile is
//! validated. Parse errors and validation errors both come back as a
//! `CaptureError::ProfileValidation` carrying field-level detail.

use super::schema::{Profile, RegistryFile};
use super::validation::{validate_fallback_cycles, validate_profile};
use super::ProfileRegistry;
use crate::error::{AppResult, CaptureError, FieldError};
use figment::{
    providers::{Data, Format, Toml},
    Figment,
};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tracing::{debug, info};

/// Load and validate a registry file.
pub fn load_registry(path: &Path) -> AppResult<ProfileRegistry> {
    if !path.exists() {
        return Err(CaptureError::Configuration(format!(
            "profile registry not found: {}",
            path.display()
        )));
    }
    debug!(path = %path.display(), "Loading profile registry");
    let registry = build(Toml::file(path))?;
    info!(
        path = %path.display(),
        profiles = registry.len(),
        "Profile registry loaded"
    );
    Ok(registry)
}

/// Load and validate a registry from TOML text.
pub fn load_registry_from_str(toml: &str) -> AppResult<ProfileRegistry> {
    build(Toml::string(toml))
}

fn build(provider: Data<Toml>) -> AppResult<ProfileRegistry> {
    let file: RegistryFile = Figment::new()
        .merge(provider)
        .extract()
        .map_err(|err| CaptureError::ProfileValidation {
            profile: "<registry>".to_string(),
            errors: figment_field_errors(err),
        })?;
    validate_registry(file)
}

/// Validate every profile in a parsed registry file.
pub fn validate_registry(file: RegistryFile) -> AppResult<ProfileRegistry> {
    if file.profiles.is_empty() {
        return Err(CaptureError::Configuration(
            "profile registry defines no profiles".to_string(),
        ));
    }

    let known: HashSet<&str> = file.profiles.keys().map(String::as_str).collect();
    let mut profiles = BTreeMap::new();
    let mut failed = Vec::new();
    let mut errors = Vec::new();

    for (name, spec) in &file.profiles {
        match validate_profile(name, spec, &known) {
            Ok(profile) => {
                profiles.insert(name.clone(), profile);
            }
            Err(mut profile_errors) => {
                failed.push(name.clone());
                errors.append(&mut profile_errors);
            }
        }
    }

    let cycle_errors = validate_fallback_cycles(&file.profiles);
    for error in &cycle_errors {
        if let Some(name) = error
            .field
            .strip_prefix("profiles.")
            .and_then(|rest| rest.strip_suffix(".fallback"))
        {
            if !failed.iter().any(|f| f == name) {
                failed.push(name.to_string());
            }
        }
    }
    errors.extend(cycle_errors);

    if !errors.is_empty() {
        return Err(CaptureError::ProfileValidation {
            profile: failed.join(", "),
            errors,
        });
    }

    Ok(ProfileRegistry::new(profiles))
}

fn figment_field_errors(err: figment::Error) -> Vec<FieldError> {
    err.into_iter()
        .map(|e| {
            let field = if e.path.is_empty() {
                "<root>".to_string()
            } else {
                e.path.join(".")
            };
            FieldError::new(field, e.kind.to_string())
        })
        .collect()
}

impl ProfileRegistry {
    /// Convenience wrapper around [`load_registry`].
    pub fn load(path: &Path) -> AppResult<Self> {
        load_registry(path)
    }

    /// A registry holding exactly one already-validated profile.
    pub fn single(profile: Profile) -> Self {
        let mut profiles = BTreeMap::new();
        profiles.insert(profile.name.clone(), profile);
        Self::new(profiles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::schema::{CommandTrigger, PollMode};
    use std::time::Duration;

    const VALID: &str = r#"
[profiles.ph]
transport = "usb_serial"
poll_payload = { literal = "D?\r\n" }
poll_interval_s = 1.0

[profiles.ph.frame]
kind = "delimited"
value_field = 0
unit_field = 1

[[profiles.ph.commands]]
name = "calibrate"
payload = { hex = "43 41 4C 0D 0A" }
expect = "CAL"
retries = 2
backoff_s = 0.5
trigger = "startup"
"#;

    fn field_errors(err: CaptureError) -> Vec<FieldError> {
        match err {
            CaptureError::ProfileValidation { errors, .. } => errors,
            other => panic!("expected ProfileValidation, got {other:?}"),
        }
    }

    #[test]
    fn test_load_valid_registry() {
        let registry = load_registry_from_str(VALID).unwrap();
        let profile = registry.get("ph").unwrap();
        assert_eq!(profile.poll_payload, b"D?\r\n");
        assert_eq!(
            profile.poll,
            PollMode::Periodic {
                interval: Duration::from_secs(1)
            }
        );
        let cal = profile.command("calibrate").unwrap();
        assert_eq!(cal.payload, b"CAL\r\n");
        assert_eq!(cal.trigger, CommandTrigger::Startup);
        assert_eq!(cal.max_retries, 2);
        assert_eq!(cal.backoff_cap, Duration::from_secs(1));
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let toml = VALID.replace("poll_interval_s = 1.0", "poll_interval_s = 0");
        let errors = field_errors(load_registry_from_str(&toml).unwrap_err());
        assert!(errors
            .iter()
            .any(|e| e.field == "profiles.ph.poll_interval_s"));
    }

    #[test]
    fn test_negative_interval_is_rejected() {
        let toml = VALID.replace("poll_interval_s = 1.0", "poll_interval_s = -2.5");
        assert!(load_registry_from_str(&toml).is_err());
    }

    #[test]
    fn test_non_ascii_hex_payload_is_a_field_error() {
        let toml = VALID.replace(r#"{ literal = "D?\r\n" }"#, r#"{ hex = "aé1" }"#);
        let errors = field_errors(load_registry_from_str(&toml).unwrap_err());
        assert!(errors
            .iter()
            .any(|e| e.field == "profiles.ph.poll_payload"));
    }

    #[test]
    fn test_missing_interval_is_required_for_periodic_polling() {
        let toml = VALID.replace("poll_interval_s = 1.0\n", "");
        let errors = field_errors(load_registry_from_str(&toml).unwrap_err());
        assert_eq!(errors[0].field, "profiles.ph.poll_interval_s");
    }

    #[test]
    fn test_once_mode_needs_no_interval() {
        let toml = VALID.replace("poll_interval_s = 1.0", "poll_mode = \"once\"");
        let registry = load_registry_from_str(&toml).unwrap();
        assert_eq!(registry.get("ph").unwrap().poll, PollMode::Once);

        let toml = VALID.replace(
            "poll_interval_s = 1.0",
            "poll_mode = \"once\"\npoll_interval_s = 0.0",
        );
        assert!(load_registry_from_str(&toml).is_err());
    }

    #[test]
    fn test_unknown_fallback_is_rejected() {
        let toml = VALID.replace(
            "poll_interval_s = 1.0",
            "poll_interval_s = 1.0\nfallback = \"missing\"",
        );
        let errors = field_errors(load_registry_from_str(&toml).unwrap_err());
        assert_eq!(errors[0].field, "profiles.ph.fallback");
    }

    #[test]
    fn test_zero_retries_is_rejected() {
        let toml = VALID.replace("retries = 2", "retries = 0");
        let errors = field_errors(load_registry_from_str(&toml).unwrap_err());
        assert!(errors
            .iter()
            .any(|e| e.field == "profiles.ph.commands[0].retries"));
    }

    #[test]
    fn test_multiple_errors_are_collected() {
        let toml = VALID
            .replace("poll_interval_s = 1.0", "poll_interval_s = 0.0")
            .replace("43 41 4C 0D 0A", "4G");
        let errors = field_errors(load_registry_from_str(&toml).unwrap_err());
        assert!(errors.len() >= 2);
    }

    #[test]
    fn test_parse_error_carries_field_path() {
        let toml = VALID.replace("poll_interval_s = 1.0", "poll_interval_s = \"fast\"");
        let errors = field_errors(load_registry_from_str(&toml).unwrap_err());
        assert!(errors[0].field.contains("poll_interval_s"));
    }

    #[test]
    fn test_missing_file() {
        let err = load_registry(Path::new("/nonexistent/profiles.toml")).unwrap_err();
        assert!(matches!(err, CaptureError::Configuration(_)));
    }

    #[test]
    fn test_empty_registry_rejected() {
        assert!(load_registry_from_str("").is_err());
    }
}
