//! In-memory record store behind the discovery engine.
//!
//! Three indices: pointers by service type, detail records by instance
//! domain, and the set of locally owned domains. Every domain in the detail
//! index has a pointer, and locally owned entries are shielded from remote
//! overwrite and from expiry-driven removal.

use super::info::ServiceInfo;
use crate::wire::{Record, RecordKind};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// One cached record and when it stops being believable.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub record: Record,
    pub expires_at: Instant,
}

impl CacheEntry {
    /// A TTL of zero produces an entry that is already expired.
    pub fn new(record: Record) -> Self {
        let expires_at = Instant::now() + Duration::from_secs(u64::from(record.ttl));
        Self { record, expires_at }
    }

    pub fn expired(&self) -> bool {
        self.expires_at < Instant::now()
    }
}

/// Outcome of [`RecordCache::insert_or_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheUpdate {
    /// No pointer existed for this (type, domain) before.
    Added,
    /// The pointer was already present; details were replaced.
    Refreshed,
}

#[derive(Debug, Default)]
pub struct RecordCache {
    /// service type → (instance domain → pointer entry)
    pointers: HashMap<String, HashMap<String, CacheEntry>>,
    /// instance domain → (record kind → entries of that kind)
    details: HashMap<String, HashMap<RecordKind, Vec<CacheEntry>>>,
    /// service type → locally owned instance domains
    registered: HashMap<String, Vec<String>>,
}

impl RecordCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes the descriptor's records into both indices.
    ///
    /// Without `force`, a locally owned (type, domain) is left untouched so
    /// remote packets can never clobber our own registration. On update the
    /// detail row is cleared first; address/endpoint/text replacement is
    /// wholesale, never additive.
    pub fn insert_or_update(&mut self, info: &ServiceInfo, force: bool) -> CacheUpdate {
        let domain = info.domain_name();
        let existed = self
            .pointers
            .get(&info.service_type)
            .is_some_and(|m| m.contains_key(&domain));

        if self.is_registered(&info.service_type, &domain) && !force {
            return CacheUpdate::Refreshed;
        }

        let detail_row = self.details.entry(domain.clone()).or_default();
        detail_row.clear();
        for record in info.to_records() {
            match record.kind() {
                RecordKind::Pointer => {
                    self.pointers
                        .entry(info.service_type.clone())
                        .or_default()
                        .insert(domain.clone(), CacheEntry::new(record));
                }
                kind => {
                    detail_row.entry(kind).or_default().push(CacheEntry::new(record));
                }
            }
        }

        if existed {
            CacheUpdate::Refreshed
        } else {
            CacheUpdate::Added
        }
    }

    /// Drops the pointer and the whole detail row; empty outer maps go too.
    pub fn remove(&mut self, service_type: &str, domain: &str) {
        if let Some(row) = self.pointers.get_mut(service_type) {
            row.remove(domain);
            if row.is_empty() {
                self.pointers.remove(service_type);
            }
        }
        self.details.remove(domain);
    }

    /// Reassembles a descriptor from the cached records. `None` when no
    /// pointer is cached for the pair.
    pub fn reconstruct(&self, service_type: &str, domain: &str) -> Option<ServiceInfo> {
        let pointer = self.pointers.get(service_type)?.get(domain)?;
        let mut records = vec![pointer.record.clone()];
        if let Some(row) = self.details.get(domain) {
            for entries in row.values() {
                records.extend(entries.iter().map(|e| e.record.clone()));
            }
        }
        ServiceInfo::from_records(&records).into_iter().next()
    }

    /// True when a pointer for the pair exists and has not expired.
    pub fn has_live_pointer(&self, service_type: &str, domain: &str) -> bool {
        self.pointers
            .get(service_type)
            .and_then(|m| m.get(domain))
            .is_some_and(|entry| !entry.expired())
    }

    pub fn is_registered(&self, service_type: &str, domain: &str) -> bool {
        self.registered
            .get(service_type)
            .is_some_and(|domains| domains.iter().any(|d| d == domain))
    }

    pub fn has_registered_type(&self, service_type: &str) -> bool {
        self.registered.contains_key(service_type)
    }

    /// Records local ownership of a domain.
    pub fn register(&mut self, service_type: &str, domain: String) {
        self.registered
            .entry(service_type.to_string())
            .or_default()
            .push(domain);
    }

    /// Releases local ownership. Returns false when the pair was not owned.
    pub fn unregister(&mut self, service_type: &str, domain: &str) -> bool {
        let Some(domains) = self.registered.get_mut(service_type) else {
            return false;
        };
        let Some(pos) = domains.iter().position(|d| d == domain) else {
            return false;
        };
        domains.remove(pos);
        if domains.is_empty() {
            self.registered.remove(service_type);
        }
        true
    }

    /// All locally owned (service type, domain) pairs.
    pub fn registered_domains(&self) -> Vec<(String, String)> {
        self.registered
            .iter()
            .flat_map(|(ty, domains)| {
                domains.iter().map(move |d| (ty.clone(), d.clone()))
            })
            .collect()
    }

    /// Locally owned domains under one service type.
    pub fn registered_domains_of(&self, service_type: &str) -> Vec<String> {
        self.registered
            .get(service_type)
            .cloned()
            .unwrap_or_default()
    }

    /// All remote (type, domain) pairs with their expiry status, for the
    /// cleanup pass.
    pub fn remote_pointers(&self) -> Vec<(String, String, bool)> {
        let mut out = Vec::new();
        for (ty, row) in &self.pointers {
            for (domain, entry) in row {
                if self.is_registered(ty, domain) {
                    continue;
                }
                out.push((ty.clone(), domain.clone(), entry.expired()));
            }
        }
        out
    }

    /// Cached pointer record for one pair.
    pub fn pointer_record(&self, service_type: &str, domain: &str) -> Option<Record> {
        Some(
            self.pointers
                .get(service_type)?
                .get(domain)?
                .record
                .clone(),
        )
    }

    /// Every cached pointer record under a service type, remote ones included.
    pub fn pointer_records_for_type(&self, service_type: &str) -> Vec<Record> {
        self.pointers
            .get(service_type)
            .map(|row| row.values().map(|e| e.record.clone()).collect())
            .unwrap_or_default()
    }

    /// All detail records of one domain, flattened across kinds.
    pub fn detail_records(&self, domain: &str) -> Vec<Record> {
        self.details
            .get(domain)
            .map(|row| {
                row.values()
                    .flat_map(|entries| entries.iter().map(|e| e.record.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Unexpired domains under a service type, for browser cache replay.
    pub fn live_domains_of_type(&self, service_type: &str) -> Vec<String> {
        self.pointers
            .get(service_type)
            .map(|row| {
                row.iter()
                    .filter(|(_, entry)| !entry.expired())
                    .map(|(domain, _)| domain.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}
