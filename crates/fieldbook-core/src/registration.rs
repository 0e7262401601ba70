//! Sequential registration IDs of the form `PREFIX-YEAR-SERIAL`.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde_json::Value;

use crate::db::{keys, load_json, save_json, DurableStore};
use crate::error::{Error, RemoteError, Result};
use crate::models::{MutationPayload, PendingMutation};
use crate::sync::{MutationRepair, Repair};

/// Entity field holding the registration ID
pub const REGISTRATION_FIELD: &str = "registration_id";

/// A parsed registration ID; serial is zero-padded to at least 4 digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationId {
    pub prefix: String,
    pub year: i32,
    pub serial: u32,
}

impl RegistrationId {
    pub fn new(prefix: impl Into<String>, year: i32, serial: u32) -> Self {
        Self {
            prefix: prefix.into(),
            year,
            serial,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        value.parse().ok()
    }
}

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{:04}", self.prefix, self.year, self.serial)
    }
}

impl FromStr for RegistrationId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidInput(format!("invalid registration ID '{s}'"));
        let mut parts = s.trim().rsplitn(3, '-');
        let serial = parts.next().ok_or_else(invalid)?;
        let year = parts.next().ok_or_else(invalid)?;
        let prefix = parts.next().ok_or_else(invalid)?;

        let all_digits = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());
        if prefix.is_empty() || !all_digits(year) || !all_digits(serial) {
            return Err(invalid());
        }

        Ok(Self {
            prefix: prefix.to_string(),
            year: year.parse().map_err(|_| invalid())?,
            serial: serial.parse().map_err(|_| invalid())?,
        })
    }
}

/// Hands out the next free serial for a prefix and year.
///
/// IDs issued on this device are remembered so two allocations from the
/// same stale view of existing IDs never return the same value.
pub struct IdAllocator {
    store: Arc<dyn DurableStore>,
    prefix: String,
    issued: BTreeSet<String>,
}

impl IdAllocator {
    pub fn load(store: Arc<dyn DurableStore>, prefix: impl Into<String>) -> Result<Self> {
        let issued = load_json(store.as_ref(), keys::ISSUED_REGISTRATION_IDS)?.unwrap_or_default();
        Ok(Self {
            store,
            prefix: prefix.into(),
            issued,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Allocate `max(existing serial for year) + 1`, skipping anything known or issued.
    pub fn allocate<'a>(
        &mut self,
        existing: impl IntoIterator<Item = &'a str>,
        year: i32,
    ) -> Result<RegistrationId> {
        let prefix = self.prefix.clone();
        self.allocate_with_prefix(&prefix, existing, year)
    }

    pub fn allocate_with_prefix<'a>(
        &mut self,
        prefix: &str,
        existing: impl IntoIterator<Item = &'a str>,
        year: i32,
    ) -> Result<RegistrationId> {
        let known: BTreeSet<String> = existing
            .into_iter()
            .map(|id| id.trim().to_string())
            .collect();
        let max_serial = known
            .iter()
            .chain(self.issued.iter())
            .filter_map(|id| RegistrationId::parse(id))
            .filter(|id| id.prefix == prefix && id.year == year)
            .map(|id| id.serial)
            .max()
            .unwrap_or(0);

        let mut serial = max_serial;
        let candidate = loop {
            serial = serial.checked_add(1).ok_or_else(|| {
                Error::AllocationCollision(format!("serial space exhausted for {prefix}-{year}"))
            })?;
            let candidate = RegistrationId::new(prefix, year, serial);
            let text = candidate.to_string();
            if !known.contains(&text) && !self.issued.contains(&text) {
                break candidate;
            }
        };

        self.remember(candidate.to_string())?;
        tracing::debug!(id = %candidate, "Allocated registration ID");
        Ok(candidate)
    }

    /// Replace an ID the remote reported as taken with a fresh one.
    pub fn reallocate(&mut self, taken: &str) -> Result<RegistrationId> {
        let parsed = RegistrationId::parse(taken).ok_or_else(|| {
            Error::AllocationCollision(format!("cannot reallocate unparseable ID '{taken}'"))
        })?;
        self.remember(taken.to_string())?;
        self.allocate_with_prefix(&parsed.prefix, std::iter::once(taken), parsed.year)
    }

    fn remember(&mut self, id: String) -> Result<()> {
        if !self.issued.insert(id.clone()) {
            return Ok(());
        }
        if let Err(error) = save_json(self.store.as_ref(), keys::ISSUED_REGISTRATION_IDS, &self.issued) {
            self.issued.remove(&id);
            return Err(error);
        }
        Ok(())
    }
}

impl MutationRepair for IdAllocator {
    fn repair(
        &mut self,
        mutation: &PendingMutation,
        error: &RemoteError,
    ) -> Result<Option<(PendingMutation, Repair)>> {
        let RemoteError::DuplicateId(_) = error else {
            return Ok(None);
        };
        let MutationPayload::Entity(write) = &mutation.payload else {
            return Ok(None);
        };
        let Some(Value::String(current)) = write.fields.get(REGISTRATION_FIELD) else {
            return Ok(None);
        };

        let replacement = self.reallocate(current)?.to_string();
        let mut rewritten = write.clone();
        rewritten
            .fields
            .insert(REGISTRATION_FIELD.to_string(), Value::String(replacement.clone()));

        let repair = Repair {
            entity_type: write.entity_type.clone(),
            entity_id: write.entity_id.clone(),
            previous: current.clone(),
            replacement,
        };
        Ok(Some((
            PendingMutation {
                payload: MutationPayload::Entity(rewritten),
                ..mutation.clone()
            },
            repair,
        )))
    }
}
