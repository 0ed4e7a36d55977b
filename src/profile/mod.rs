//! Declarative protocol profiles.
//!
//! A profile tells the protocol engine everything it needs to talk to one
//! instrument family: link settings, the poll payload and cadence, how frames
//! are shaped on the wire, and the named commands the instrument accepts.
//! Profiles are loaded from a TOML registry once at startup and validated
//! before any port is opened.

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_registry, load_registry_from_str};
pub use schema::{
    BinaryEncoding, BinaryField, CommandDef, CommandTrigger, Compensation, FieldSpan,
    FrameGrammar, MeasurementSpec, Parity, PollMode, Profile, SerialSettings, TransportKind,
};

use crate::error::{AppResult, CaptureError};
use std::collections::BTreeMap;

/// Validated profiles keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ProfileRegistry {
    profiles: BTreeMap<String, Profile>,
}

impl ProfileRegistry {
    pub(crate) fn new(profiles: BTreeMap<String, Profile>) -> Self {
        Self { profiles }
    }

    /// Look up a profile by name.
    pub fn get(&self, name: &str) -> AppResult<&Profile> {
        self.profiles.get(name).ok_or_else(|| {
            CaptureError::Configuration(format!("unknown profile '{name}'"))
        })
    }

    /// Profile names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// The profile `name` falls back to, if any.
    pub fn fallback_for(&self, name: &str) -> Option<&Profile> {
        self.profiles
            .get(name)
            .and_then(|p| p.fallback.as_deref())
            .and_then(|f| self.profiles.get(f))
    }

    /// `name` followed by each successive fallback.
    ///
    /// Cycles are rejected at load time; the visited check only guards
    /// registries assembled by hand.
    pub fn fallback_chain(&self, name: &str) -> Vec<&Profile> {
        let mut chain: Vec<&Profile> = Vec::new();
        let mut current = self.profiles.get(name);
        while let Some(profile) = current {
            if chain.iter().any(|p| p.name == profile.name) {
                break;
            }
            chain.push(profile);
            current = self.fallback_for(&profile.name);
        }
        chain
    }
}
