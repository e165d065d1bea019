//! Processor Registry (spec.md §4.2): the durable record of which
//! processors exist, what they can handle, and how to reach them. Backed
//! by a Redis hash (`processors:<id>` -> JSON descriptor) plus one set
//! per capability (`processors:by-capability:<name>`) so the Router can
//! filter by capability in one round trip, plus a `processors:all` set
//! tracking every registered id so `list_all` never needs a substrate scan.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use frame_error::ValidationError;
use frame_store::{Store, StoreError};
use frame_types::ProcessorDescriptor;

use frame_logger::warn_target;

const LOG_TARGET: &str = "frame_registry";
const ALL_KEY: &str = "processors:all";

fn processor_key(id: &str) -> String {
    format!("processors:{id}")
}

fn capability_key(capability: &str) -> String {
    format!("processors:by-capability:{capability}")
}

/// Outcome of [`ProcessorRegistry::register`] (spec.md §4.2: "accepted | conflict").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Accepted,
    Conflict,
}

/// Outcome of [`ProcessorRegistry::unregister`] / [`ProcessorRegistry::update`]
/// (spec.md §4.2: "found | missing").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupOutcome {
    Found,
    Missing,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Registration and lookup of processor descriptors, with an optional
/// read-through cache for `get_processor` (invalidated on every mutation
/// so a stale read never outlives the write that caused it).
pub struct ProcessorRegistry {
    store: Arc<dyn Store>,
    cache: Option<DashMap<String, ProcessorDescriptor>>,
}

impl ProcessorRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        ProcessorRegistry { store, cache: None }
    }

    /// Enables the read-through cache. Use when `get_processor` is on a
    /// hot path (the Router calls it once per dispatch).
    pub fn with_cache(mut self) -> Self {
        self.cache = Some(DashMap::new());
        self
    }

    /// Rejects if `descriptor.id` is already present (spec.md §4.2:
    /// "rejects if id already present"); the Store's conditional write
    /// decides the winner under concurrent registration of the same id, so
    /// at most one caller sees [`RegisterOutcome::Accepted`].
    pub async fn register(
        &self,
        descriptor: ProcessorDescriptor,
    ) -> Result<RegisterOutcome, RegistryError> {
        let descriptor = descriptor.normalize()?;
        let encoded = serde_json::to_string(&descriptor).expect("descriptor always serializes");
        let won = self
            .store
            .hsetnx(&processor_key(&descriptor.id), "data", &encoded)
            .await?;
        if !won {
            return Ok(RegisterOutcome::Conflict);
        }

        for capability in &descriptor.capabilities {
            self.store
                .sadd(&capability_key(capability), &descriptor.id)
                .await?;
        }
        self.store.sadd(ALL_KEY, &descriptor.id).await?;

        if let Some(cache) = &self.cache {
            cache.insert(descriptor.id.clone(), descriptor);
        }
        Ok(RegisterOutcome::Accepted)
    }

    /// Atomically removes the descriptor and prunes every capability-index
    /// entry derived from the *stored* copy, not the caller's claim
    /// (spec.md §4.2).
    pub async fn unregister(&self, processor_id: &str) -> Result<LookupOutcome, RegistryError> {
        let Some(descriptor) = self.get_processor(processor_id).await? else {
            return Ok(LookupOutcome::Missing);
        };
        for capability in &descriptor.capabilities {
            self.store.srem(&capability_key(capability), processor_id).await?;
        }
        self.store.hdel(&processor_key(processor_id), "data").await?;
        self.store.srem(ALL_KEY, processor_id).await?;
        if let Some(cache) = &self.cache {
            cache.remove(processor_id);
        }
        Ok(LookupOutcome::Found)
    }

    pub async fn get_processor(
        &self,
        processor_id: &str,
    ) -> Result<Option<ProcessorDescriptor>, RegistryError> {
        if let Some(cache) = &self.cache {
            if let Some(descriptor) = cache.get(processor_id) {
                return Ok(Some(descriptor.clone()));
            }
        }
        let raw = self.store.hget(&processor_key(processor_id), "data").await?;
        let Some(raw) = raw else { return Ok(None) };
        match serde_json::from_str::<ProcessorDescriptor>(&raw) {
            Ok(descriptor) => {
                if let Some(cache) = &self.cache {
                    cache.insert(processor_id.to_string(), descriptor.clone());
                }
                Ok(Some(descriptor))
            }
            Err(err) => {
                warn_target!(
                    LOG_TARGET,
                    "dropping corrupt descriptor for {}: {}",
                    processor_id,
                    err
                );
                Ok(None)
            }
        }
    }

    /// Replaces a processor's descriptor, maintaining the capability index
    /// by diffing the old and new capability sets rather than clearing and
    /// rebuilding it (spec.md §4.2 "diff-based index maintenance"). Only
    /// persists if `descriptor.id` already exists; the stored record's
    /// identity (its presence in `processors:all`) is preserved.
    pub async fn update(&self, descriptor: ProcessorDescriptor) -> Result<LookupOutcome, RegistryError> {
        let descriptor = descriptor.normalize()?;
        let Some(previous) = self.get_processor(&descriptor.id).await? else {
            return Ok(LookupOutcome::Missing);
        };

        let encoded = serde_json::to_string(&descriptor).expect("descriptor always serializes");
        self.store
            .hset(&processor_key(&descriptor.id), "data", &encoded)
            .await?;

        let old_caps: BTreeSet<String> = previous.capabilities.into_iter().collect();
        let new_caps: BTreeSet<String> = descriptor.capabilities.iter().cloned().collect();

        for removed in old_caps.difference(&new_caps) {
            self.store.srem(&capability_key(removed), &descriptor.id).await?;
        }
        for added in new_caps.difference(&old_caps) {
            self.store.sadd(&capability_key(added), &descriptor.id).await?;
        }

        if let Some(cache) = &self.cache {
            cache.insert(descriptor.id.clone(), descriptor);
        }
        Ok(LookupOutcome::Found)
    }

    /// Processor ids registered under `capability`.
    pub async fn find_by_capability(
        &self,
        capability: &str,
    ) -> Result<BTreeSet<String>, RegistryError> {
        Ok(self.store.smembers(&capability_key(capability)).await?)
    }

    /// Descriptors of every processor registered under `capability`
    /// (spec.md §4.2 `find_by_capability(c) → [descriptor]`), skipping any
    /// id whose stored value is corrupt.
    pub async fn find_descriptors_by_capability(
        &self,
        capability: &str,
    ) -> Result<Vec<ProcessorDescriptor>, RegistryError> {
        let ids = self.find_by_capability(capability).await?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(descriptor) = self.get_processor(&id).await? {
                out.push(descriptor);
            }
        }
        Ok(out)
    }

    /// All registered processors (spec.md I2: equals the union of
    /// descriptors referenced by any capability index entry; no orphans),
    /// skipping (and logging) any entry whose stored JSON fails to parse
    /// rather than failing the whole listing.
    pub async fn list_all(&self) -> Result<Vec<ProcessorDescriptor>, RegistryError> {
        let ids = self.store.smembers(ALL_KEY).await?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(descriptor) = self.get_processor(&id).await? {
                out.push(descriptor);
            }
        }
        Ok(out)
    }

    pub async fn clear_all(&self) -> Result<(), RegistryError> {
        let ids = self.store.smembers(ALL_KEY).await?;
        for id in &ids {
            self.unregister(id).await?;
        }
        if let Some(cache) = &self.cache {
            cache.clear();
        }
        Ok(())
    }
}
