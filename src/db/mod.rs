//! Address Database
//!
//! Owns every known address record, hands out probe candidates, folds probe
//! outcomes back into decaying reliability statistics and serves the
//! currently good addresses.
//!
//! ## Address lifecycle
//!
//! ```text
//!                 add                first probe
//!   (unknown) ─────────▶ UNTRIED ─────────────────▶ TRIED ◀──▶ GOOD
//!       ▲                                              │
//!       │  ban expired + newer add          ban time > 0│
//!       └────────────────────── BANNED ◀───────────────┘
//! ```
//!
//! All state lives in one [`DbState`] behind a single mutex. Public methods
//! lock once and call private `DbState` methods, which never lock.

pub mod codec;
pub mod format;
pub mod record;
pub mod stat;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, info, warn};

pub use codec::CodecError;
pub use record::{AddrRecord, AddrReport, ChainParams, Reliableness, MIN_RETRY};

use crate::types::{current_timestamp, AddrObservation, AllowedNetworks, Endpoint, ServiceFlags};

/// Stable handle of a record inside the database
pub type AddrId = u32;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("feedback for unknown endpoint {0}")]
    UnknownEndpoint(Endpoint),

    #[error("feedback for endpoint {0} which is not checked out")]
    NotCheckedOut(Endpoint),

    #[error("corrupt database: {0}")]
    Codec(#[from] CodecError),
}

/// Lifecycle stage of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AddrStatus {
    /// Never probed by us
    Untried,
    /// Probed, currently failing classification
    Tried,
    /// Probed and currently reliable
    Good,
}

/// Candidate handed to a prober and returned with the outcome filled in
///
/// Every result obtained from [`AddrDb::get_many`] must be resolved exactly
/// once through [`AddrDb::good`], [`AddrDb::bad`] or [`AddrDb::skipped`]
/// (or their batch forms).
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub endpoint: Endpoint,
    pub services: ServiceFlags,

    // Filled in by the prober
    pub good: bool,
    /// Extra ban requested by the prober (seconds)
    pub ban_time: i64,
    pub height: i32,
    pub client_version: i32,
    pub client_sub_version: String,
    pub checkpoint_verified: bool,

    // Copied from the record so the prober can decide what to ask for
    pub our_last_success: i64,
    pub last_address_request: i64,
}

/// Aggregate counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DbStats {
    /// Endpoints in the ban map
    pub banned: usize,
    /// Records tracked in the database
    pub available: usize,
    /// Records probed at least once
    pub tracked: usize,
    /// Records never probed
    pub new: usize,
    /// Records currently classified reliable
    pub good: usize,
    /// Seconds since the stalest queued record was probed
    pub age: i64,
}

/// Time source of the database
#[derive(Debug, Default)]
pub enum Clock {
    #[default]
    System,
    /// Fixed time, moved explicitly
    Manual(AtomicI64),
}

impl Clock {
    pub fn manual(now: i64) -> Self {
        Clock::Manual(AtomicI64::new(now))
    }

    pub fn now(&self) -> i64 {
        match self {
            Clock::System => current_timestamp(),
            Clock::Manual(t) => t.load(Ordering::Relaxed),
        }
    }

    /// Move a manual clock forward; no-op for the system clock
    pub fn advance(&self, secs: i64) {
        if let Clock::Manual(t) = self {
            t.fetch_add(secs, Ordering::Relaxed);
        }
    }
}

// =============================================================================
// STATE
// =============================================================================

struct Slot {
    record: AddrRecord,
    status: AddrStatus,
    /// Handed to a prober and not yet resolved
    checked_out: bool,
}

struct DbState {
    params: ChainParams,
    next_id: AddrId,

    /// Primary store
    slots: HashMap<AddrId, Slot>,
    /// Endpoint index, inverse of `slots`
    ip_to_id: HashMap<Endpoint, AddrId>,

    /// Untried records available for probing, oldest first
    untried: BTreeSet<AddrId>,
    /// Tried records available for probing, stalest first
    tried_queue: VecDeque<AddrId>,
    /// Records with status `Good`
    good: BTreeSet<AddrId>,
    /// Number of records with status other than `Untried`
    tried_total: usize,

    /// Unban time per banned endpoint
    banned: BTreeMap<Endpoint, i64>,

    rng: StdRng,
}

impl DbState {
    fn new(params: ChainParams) -> Self {
        Self {
            params,
            next_id: 0,
            slots: HashMap::new(),
            ip_to_id: HashMap::new(),
            untried: BTreeSet::new(),
            tried_queue: VecDeque::new(),
            good: BTreeSet::new(),
            tried_total: 0,
            banned: BTreeMap::new(),
            rng: StdRng::from_entropy(),
        }
    }

    fn lookup(&self, endpoint: &Endpoint) -> Option<AddrId> {
        self.ip_to_id.get(endpoint).copied()
    }

    /// Insert a record under a fresh id with status derived from its history
    fn insert(&mut self, record: AddrRecord) -> AddrId {
        let id = self.next_id;
        self.next_id += 1;

        let status = if !record.is_tried() {
            self.untried.insert(id);
            AddrStatus::Untried
        } else {
            self.tried_total += 1;
            self.tried_queue.push_back(id);
            if record.is_reliable(&self.params) {
                self.good.insert(id);
                AddrStatus::Good
            } else {
                AddrStatus::Tried
            }
        };

        self.ip_to_id.insert(record.endpoint, id);
        self.slots.insert(id, Slot { record, status, checked_out: false });
        id
    }

    /// Drop a record from every index
    fn remove(&mut self, id: AddrId) -> Option<AddrRecord> {
        let slot = self.slots.remove(&id)?;
        self.ip_to_id.remove(&slot.record.endpoint);
        self.untried.remove(&id);
        self.good.remove(&id);
        if slot.status != AddrStatus::Untried {
            self.tried_total -= 1;
            // Checked-out ids are in no queue
            if !slot.checked_out {
                self.tried_queue.retain(|queued| *queued != id);
            }
        }
        Some(slot.record)
    }

    fn add(&mut self, obs: &AddrObservation, force: bool, now: i64) {
        if !force && !obs.endpoint.is_routable() {
            return;
        }

        if let Some(&until) = self.banned.get(&obs.endpoint) {
            if force || (until < now && obs.time > until) {
                self.banned.remove(&obs.endpoint);
            } else {
                return;
            }
        }

        if let Some(id) = self.lookup(&obs.endpoint) {
            if let Some(slot) = self.slots.get_mut(&id) {
                let record = &mut slot.record;
                if obs.time > record.last_try || record.services != obs.services {
                    record.last_try = record.last_try.max(obs.time);
                    record.services |= obs.services;
                }
                if force {
                    record.services = obs.services;
                }
            }
            return;
        }

        self.insert(AddrRecord::new(obs.endpoint, obs.services, obs.time));
    }

    fn take_untried(&mut self) -> Option<AddrId> {
        self.untried.pop_first()
    }

    /// Pick one candidate and check it out
    fn select(&mut self, now: i64) -> Option<AddrId> {
        let total = self.untried.len() + self.tried_queue.len();
        if total == 0 {
            return None;
        }

        let pick = self.rng.gen_range(0..total);
        let picked = if pick < self.untried.len() {
            self.take_untried()
        } else {
            let stalest_due = self.tried_queue.front().is_some_and(|id| {
                self.slots
                    .get(id)
                    .is_some_and(|slot| now - slot.record.our_last_try >= MIN_RETRY)
            });
            if stalest_due {
                self.tried_queue.pop_front()
            } else {
                self.take_untried()
            }
        };

        let id = picked?;
        let slot = self.slots.get_mut(&id)?;
        slot.checked_out = true;
        Some(id)
    }

    fn checkout_result(&self, id: AddrId) -> Option<ProbeResult> {
        let record = &self.slots.get(&id)?.record;
        Some(ProbeResult {
            endpoint: record.endpoint,
            services: record.services,
            good: false,
            ban_time: 0,
            height: 0,
            client_version: 0,
            client_sub_version: String::new(),
            checkpoint_verified: false,
            our_last_success: record.our_last_success,
            last_address_request: record.last_address_request,
        })
    }

    /// Resolve a result's endpoint to a checked-out id, releasing it
    fn check_in(&mut self, endpoint: &Endpoint) -> Result<AddrId, DbError> {
        let id = self.lookup(endpoint).ok_or(DbError::UnknownEndpoint(*endpoint))?;
        let slot = self.slots.get_mut(&id).ok_or(DbError::UnknownEndpoint(*endpoint))?;
        if !slot.checked_out {
            return Err(DbError::NotCheckedOut(*endpoint));
        }
        slot.checked_out = false;
        Ok(id)
    }

    /// Re-run classification after an update and requeue as tried
    fn reclassify(&mut self, id: AddrId) {
        let Some(slot) = self.slots.get_mut(&id) else {
            return;
        };
        if slot.status == AddrStatus::Untried {
            self.tried_total += 1;
        }

        let reliable = slot.record.is_reliable(&self.params);
        let endpoint = slot.record.endpoint;
        slot.status = if reliable { AddrStatus::Good } else { AddrStatus::Tried };

        if reliable {
            if self.good.insert(id) {
                debug!("{} entered the good set", endpoint);
            }
        } else if self.good.remove(&id) {
            debug!("{} left the good set", endpoint);
        }
        self.tried_queue.push_back(id);
    }

    fn good_result(&mut self, res: &ProbeResult, now: i64) -> Result<(), DbError> {
        let id = self.check_in(&res.endpoint)?;
        self.banned.remove(&res.endpoint);

        if let Some(slot) = self.slots.get_mut(&id) {
            let record = &mut slot.record;
            record.client_version = res.client_version;
            record.client_sub_version = res.client_sub_version.clone();
            record.blocks = res.height;
            record.checkpoint_verified = res.checkpoint_verified;
            record.last_address_request = record.last_address_request.max(res.last_address_request);
            record.update(true, now);
        }
        self.reclassify(id);
        Ok(())
    }

    fn bad_result(&mut self, res: &ProbeResult, now: i64) -> Result<(), DbError> {
        let id = self.check_in(&res.endpoint)?;

        let ban = match self.slots.get_mut(&id) {
            Some(slot) => {
                let record = &mut slot.record;
                // Keep what the peer told us before failing it
                if res.client_version != 0 {
                    record.client_version = res.client_version;
                    record.client_sub_version = res.client_sub_version.clone();
                    record.blocks = res.height;
                }
                record.update(false, now);
                res.ban_time.max(record.ban_time(&self.params))
            }
            None => 0,
        };

        if ban > 0 {
            self.remove(id);
            self.banned.insert(res.endpoint, now + ban);
            debug!("{} banned for {}s", res.endpoint, ban);
        } else {
            self.reclassify(id);
        }
        Ok(())
    }

    fn skipped_result(&mut self, res: &ProbeResult) -> Result<(), DbError> {
        let id = self.check_in(&res.endpoint)?;
        match self.slots.get(&id).map(|slot| slot.status) {
            Some(AddrStatus::Untried) => {
                self.untried.insert(id);
            }
            Some(_) => self.tried_queue.push_back(id),
            None => {}
        }
        Ok(())
    }

    fn get_ips(&mut self, requested: ServiceFlags, max: usize, nets: &AllowedNetworks) -> Vec<Endpoint> {
        let candidates: Vec<Endpoint> = self
            .good
            .iter()
            .filter_map(|id| self.slots.get(id))
            .map(|slot| &slot.record)
            .filter(|record| record.services.contains(requested) && nets.allows(record.endpoint.network()))
            .map(|record| record.endpoint)
            .collect();

        let amount = max.min(candidates.len());
        rand::seq::index::sample(&mut self.rng, candidates.len(), amount)
            .into_iter()
            .map(|i| candidates[i])
            .collect()
    }

    fn stats(&self, now: i64) -> DbStats {
        let age = self
            .tried_queue
            .front()
            .and_then(|id| self.slots.get(id))
            .map(|slot| now - slot.record.our_last_try)
            .unwrap_or(0);

        DbStats {
            banned: self.banned.len(),
            available: self.slots.len(),
            tracked: self.tried_total,
            new: self.slots.len() - self.tried_total,
            good: self.good.len(),
            age,
        }
    }

    /// Tried records ordered by our last probe, then untried ones by id
    fn ordered_records(&self) -> Vec<&AddrRecord> {
        let mut tried: Vec<(i64, AddrId, &AddrRecord)> = Vec::with_capacity(self.tried_total);
        let mut untried: Vec<(AddrId, &AddrRecord)> = Vec::new();
        for (id, slot) in &self.slots {
            if slot.status == AddrStatus::Untried {
                untried.push((*id, &slot.record));
            } else {
                tried.push((slot.record.our_last_try, *id, &slot.record));
            }
        }
        tried.sort_by_key(|(t, id, _)| (*t, *id));
        untried.sort_by_key(|(id, _)| *id);

        tried
            .into_iter()
            .map(|(_, _, record)| record)
            .chain(untried.into_iter().map(|(_, record)| record))
            .collect()
    }

    fn reports(&self) -> Vec<AddrReport> {
        self.ordered_records()
            .into_iter()
            .filter(|record| record.is_tried() && record.success > 0)
            .map(|record| record.report(&self.params))
            .collect()
    }

    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let records: Vec<(u8, &AddrRecord)> = self
            .ordered_records()
            .into_iter()
            .map(|record| (format::RECORD_VERSION, record))
            .collect();
        format::write_database(format::DB_VERSION, &records, &self.banned)
    }

    /// Rebuild from a decoded image, dropping banned or bannable records
    fn restore(params: ChainParams, image: format::DbImage) -> Self {
        let mut state = DbState::new(params);
        state.banned = image.banned;
        let mut dropped = 0usize;
        for record in image.records {
            if record.ban_time(&state.params) != 0
                || state.banned.contains_key(&record.endpoint)
                || state.ip_to_id.contains_key(&record.endpoint)
            {
                dropped += 1;
                continue;
            }
            state.insert(record);
        }
        if dropped > 0 {
            debug!("Dropped {} records while loading", dropped);
        }
        state
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        assert_eq!(self.ip_to_id.len(), self.slots.len());
        for (endpoint, id) in &self.ip_to_id {
            assert_eq!(&self.slots[id].record.endpoint, endpoint);
        }

        let mut tried = 0;
        for (id, slot) in &self.slots {
            assert_eq!(slot.status == AddrStatus::Untried, !slot.record.is_tried());
            assert_eq!(slot.status == AddrStatus::Good, self.good.contains(id));
            let in_untried = self.untried.contains(id);
            let in_queue = self.tried_queue.iter().filter(|q| *q == id).count();
            if slot.checked_out {
                assert!(!in_untried && in_queue == 0);
            } else if slot.status == AddrStatus::Untried {
                assert!(in_untried && in_queue == 0);
            } else {
                assert!(!in_untried && in_queue == 1);
            }
            if slot.status != AddrStatus::Untried {
                tried += 1;
            }
            assert!(!self.banned.contains_key(&slot.record.endpoint));
        }
        assert_eq!(tried, self.tried_total);
        assert!(self.good.iter().all(|id| self.slots.contains_key(id)));
    }
}

// =============================================================================
// PUBLIC DATABASE
// =============================================================================

/// Thread-safe address database
pub struct AddrDb {
    state: Mutex<DbState>,
    clock: Clock,
}

impl AddrDb {
    pub fn new(params: ChainParams) -> Self {
        Self::with_clock(params, Clock::System)
    }

    pub fn with_clock(params: ChainParams, clock: Clock) -> Self {
        Self {
            state: Mutex::new(DbState::new(params)),
            clock,
        }
    }

    /// Decode a persisted database
    ///
    /// Records whose ban time is nonzero under `params` are not admitted.
    pub fn from_bytes(bytes: &[u8], params: ChainParams, clock: Clock) -> Result<Self, DbError> {
        let image = format::read_database(bytes)?;
        let state = DbState::restore(params, image);
        info!(
            "📦 Loaded address database: {} records, {} banned",
            state.slots.len(),
            state.banned.len()
        );
        Ok(Self {
            state: Mutex::new(state),
            clock,
        })
    }

    /// Encode the full database in the current format
    pub fn to_bytes(&self) -> Result<Vec<u8>, DbError> {
        Ok(self.state.lock().encode()?)
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn params(&self) -> ChainParams {
        self.state.lock().params.clone()
    }

    pub fn add(&self, obs: &AddrObservation, force: bool) {
        let now = self.clock.now();
        self.state.lock().add(obs, force, now);
    }

    pub fn add_many(&self, observations: &[AddrObservation], force: bool) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        for obs in observations {
            state.add(obs, force, now);
        }
    }

    /// Check out up to `max` candidates for probing
    pub fn get_many(&self, max: usize) -> Vec<ProbeResult> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let mut out = Vec::new();
        while out.len() < max {
            let Some(id) = state.select(now) else {
                break;
            };
            if let Some(result) = state.checkout_result(id) {
                out.push(result);
            }
        }
        out
    }

    pub fn good(&self, res: &ProbeResult) -> Result<(), DbError> {
        let now = self.clock.now();
        self.state.lock().good_result(res, now)
    }

    pub fn bad(&self, res: &ProbeResult) -> Result<(), DbError> {
        let now = self.clock.now();
        self.state.lock().bad_result(res, now)
    }

    /// Release a candidate without counting an attempt
    pub fn skipped(&self, res: &ProbeResult) -> Result<(), DbError> {
        self.state.lock().skipped_result(res)
    }

    /// Resolve each result as good or bad according to its `good` flag
    ///
    /// Every result is processed; the first error is returned.
    pub fn result_many(&self, results: &[ProbeResult]) -> Result<(), DbError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let mut first_err = None;
        for res in results {
            let outcome = if res.good {
                state.good_result(res, now)
            } else {
                state.bad_result(res, now)
            };
            if let Err(e) = outcome {
                warn!("Dropping probe result: {}", e);
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub fn skipped_many(&self, results: &[ProbeResult]) -> Result<(), DbError> {
        let mut state = self.state.lock();
        let mut first_err = None;
        for res in results {
            if let Err(e) = state.skipped_result(res) {
                warn!("Dropping skipped result: {}", e);
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub fn lookup(&self, endpoint: &Endpoint) -> Option<AddrId> {
        self.state.lock().lookup(endpoint)
    }

    pub fn status(&self, endpoint: &Endpoint) -> Option<AddrStatus> {
        let state = self.state.lock();
        let id = state.lookup(endpoint)?;
        state.slots.get(&id).map(|slot| slot.status)
    }

    /// Clone of the record stored for `endpoint`
    pub fn record(&self, endpoint: &Endpoint) -> Option<AddrRecord> {
        let state = self.state.lock();
        let id = state.lookup(endpoint)?;
        state.slots.get(&id).map(|slot| slot.record.clone())
    }

    /// Random distinct good endpoints offering `requested` services
    pub fn get_ips(&self, requested: ServiceFlags, max: usize, nets: &AllowedNetworks) -> Vec<Endpoint> {
        self.state.lock().get_ips(requested, max, nets)
    }

    pub fn stats(&self) -> DbStats {
        let now = self.clock.now();
        self.state.lock().stats(now)
    }

    pub fn report(&self, endpoint: &Endpoint) -> Option<AddrReport> {
        let state = self.state.lock();
        let id = state.lookup(endpoint)?;
        state.slots.get(&id).map(|slot| slot.record.report(&state.params))
    }

    /// Reports of every tried address with at least one success
    pub fn get_all(&self) -> Vec<AddrReport> {
        self.state.lock().reports()
    }

    /// Ban an endpoint until `until`, purging its record
    pub fn ban(&self, endpoint: &Endpoint, until: i64) {
        let mut state = self.state.lock();
        if let Some(id) = state.lookup(endpoint) {
            state.remove(id);
        }
        state.banned.insert(*endpoint, until);
    }

    pub fn banned_until(&self, endpoint: &Endpoint) -> Option<i64> {
        self.state.lock().banned.get(endpoint).copied()
    }

    /// Forget bans that have expired, returning how many were dropped
    pub fn expire_bans(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let before = state.banned.len();
        state.banned.retain(|_, until| *until > now);
        before - state.banned.len()
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        self.state.lock().check_invariants();
    }
}
