// Accounting specialization of the share crawler.
//
// Each slice reconciles one prefix: shares on disk but not in the catalog
// get a row and a starter lease, shares in the catalog but not on disk lose
// their rows, and everything examined feeds the cycle statistics. Between
// cycles an expiration sweep removes expired leases and deletes whatever
// shares are left unleased.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde_json::json;
use tracing::{debug, info, warn};

use holdfast_common::si::StorageIndex;
use holdfast_common::types::{ShareId, ShareType};

use crate::backend::Backend;
use crate::clock::Clock;
use crate::crawler::share_crawler::{CrawlerDelegate, CrawlerState, Progress};
use crate::crawler::stats::CycleStats;
use crate::expiration::ExpirationPolicy;
use crate::store::lease_db::{LeaseDb, LeaseDbError};

pub struct AccountingCrawler<B> {
    db: LeaseDb,
    backend: B,
    policy: ExpirationPolicy,
    clock: Arc<dyn Clock>,
}

impl<B: Backend> AccountingCrawler<B> {
    pub fn new(db: LeaseDb, backend: B, policy: ExpirationPolicy, clock: Arc<dyn Clock>) -> Self {
        Self { db, backend, policy, clock }
    }

    pub fn leasedb(&self) -> &LeaseDb {
        &self.db
    }

    pub fn leasedb_mut(&mut self) -> &mut LeaseDb {
        &mut self.db
    }

    pub fn expiration_policy(&self) -> &ExpirationPolicy {
        &self.policy
    }

    pub fn is_expiration_enabled(&self) -> bool {
        self.policy.is_enabled()
    }

    /// Remove expired leases, then delete every share left without a lease.
    ///
    /// Runs between cycles (and may be invoked opportunistically between
    /// slices). A share whose backend delete fails stays in GOING and is
    /// retried on the next sweep; an unleased COMING share is an upload
    /// still in flight and is left alone.
    pub fn expiration_sweep(&mut self, stats: &mut CycleStats) -> Result<()> {
        let now = self.clock.now();
        let removed = self.db.remove_expired_leases(&self.policy, now)?;
        if removed > 0 {
            info!(removed, "expired leases removed");
        }
        if !self.policy.is_enabled() {
            return Ok(());
        }

        let mut recovered_buckets: HashMap<ShareType, HashSet<StorageIndex>> = HashMap::new();
        for (share_id, sharetype) in self.db.get_unleased_shares(None)? {
            let storage_index = share_id.storage_index;
            let si_s = storage_index.to_base32();
            let prefix = storage_index.prefix();

            let Some(record) = self.db.get_share(&storage_index, share_id.shnum)? else {
                continue;
            };
            match self.db.mark_share_as_going(&storage_index, share_id.shnum) {
                Ok(()) => {}
                // The guard refuses COMING shares; skip them.
                Err(LeaseDbError::NonExistentShare { .. }) => continue,
                Err(error) => return Err(error.into()),
            }
            // The GOING state must be durable before the file disappears.
            self.db.commit()?;

            match self.backend.delete_share(&prefix, &si_s, share_id.shnum) {
                Ok(()) => {}
                Err(error) if error.kind() == io::ErrorKind::NotFound => {
                    // A previous sweep unlinked the file but crashed before
                    // dropping the row; finishing the removal is all that's
                    // left.
                    debug!(share = %share_id, "share file already gone");
                }
                Err(error) => {
                    warn!(share = %share_id, %error,
                        "backend delete failed; share left in going state");
                    continue;
                }
            }

            self.db.remove_deleted_share(&storage_index, share_id.shnum)?;
            self.db.commit()?;
            stats.space_recovered.add_actual_share(sharetype, record.used_space);
            recovered_buckets.entry(sharetype).or_default().insert(storage_index);
            info!(share = %share_id, bytes = record.used_space, "unleased share deleted");
        }

        for sharetype in ShareType::ALL {
            let count = recovered_buckets.get(&sharetype).map(|set| set.len()).unwrap_or(0);
            stats.space_recovered.add_actual_buckets(sharetype, count as u64);
        }
        Ok(())
    }

    /// Crawler state for status reporting: the base state plus `history`,
    /// and while a cycle is in progress, the cycle-to-date statistics with
    /// remaining/whole-cycle projections scaled by completion fraction.
    pub fn get_state(&self, state: &CrawlerState, progress: Progress) -> Result<serde_json::Value> {
        let mut object = match serde_json::to_value(state)
            .context("failed to serialize crawler state")?
        {
            serde_json::Value::Object(object) => object,
            _ => return Err(anyhow!("crawler state did not serialize to an object")),
        };

        object.insert(
            "history".to_string(),
            serde_json::to_value(self.db.get_history()?)
                .context("failed to serialize crawler history")?,
        );

        if !progress.cycle_in_progress {
            object.remove("cycle-to-date");
            return Ok(serde_json::Value::Object(object));
        }

        if let Some(serde_json::Value::Object(so_far)) = object.get_mut("cycle-to-date") {
            so_far.insert("expiration-enabled".to_string(), json!(self.policy.is_enabled()));
            so_far.insert(
                "configured-expiration-mode".to_string(),
                serde_json::to_value(self.policy.parameters())
                    .context("failed to serialize expiration parameters")?,
            );
        }

        let so_far_recovered = match serde_json::to_value(&state.cycle_to_date.space_recovered)? {
            serde_json::Value::Object(map) => map,
            _ => return Err(anyhow!("space-recovered did not serialize to an object")),
        };

        let mut remaining = serde_json::Map::new();
        let mut whole_cycle = serde_json::Map::new();
        let pc = progress.cycle_complete_fraction;
        for (key, value) in &so_far_recovered {
            if pc > 0.0 {
                let so_far = value.as_f64().unwrap_or(0.0);
                let m = (1.0 - pc) / pc;
                remaining.insert(key.clone(), json!(m * so_far));
                whole_cycle.insert(key.clone(), json!(so_far + m * so_far));
            } else {
                remaining.insert(key.clone(), serde_json::Value::Null);
                whole_cycle.insert(key.clone(), serde_json::Value::Null);
            }
        }
        object.insert(
            "estimated-remaining-cycle".to_string(),
            json!({ "space-recovered": remaining }),
        );
        object.insert(
            "estimated-current-cycle".to_string(),
            json!({ "space-recovered": whole_cycle }),
        );

        Ok(serde_json::Value::Object(object))
    }
}

impl<B: Backend> CrawlerDelegate for AccountingCrawler<B> {
    fn started_cycle(&mut self, _cycle: u64, state: &mut CrawlerState) -> Result<()> {
        state.cycle_to_date = CycleStats::default();
        Ok(())
    }

    fn process_prefix(
        &mut self,
        _cycle: u64,
        prefix: &str,
        start_slice: i64,
        state: &mut CrawlerState,
    ) -> Result<()> {
        let bucket_names = match self.backend.list_prefix(prefix) {
            Ok(names) => names,
            Err(error) => {
                warn!(%prefix, %error, "backend enumeration failed; prefix skipped this cycle");
                return Ok(());
            }
        };

        let mut disk_shares: HashSet<ShareId> = HashSet::new();
        let mut failed_buckets: HashSet<StorageIndex> = HashSet::new();
        for si_s in bucket_names {
            let Ok(storage_index) = StorageIndex::parse(&si_s) else {
                debug!(%prefix, name = %si_s, "ignoring non-storage-index directory");
                continue;
            };
            match self.backend.list_bucket(prefix, &si_s) {
                Ok(shnums) => {
                    for shnum in shnums {
                        disk_shares.insert(ShareId::new(storage_index, shnum));
                    }
                }
                Err(error) => {
                    warn!(%prefix, bucket = %si_s, %error,
                        "bucket enumeration failed; bucket skipped this slice");
                    failed_buckets.insert(storage_index);
                }
            }
        }

        let db_sharemap = self.db.get_shares_for_prefix(prefix)?;

        let stats = &mut state.cycle_to_date;
        let mut sharesets: HashMap<ShareType, HashSet<StorageIndex>> = HashMap::new();
        for (share_id, &(used_space, sharetype)) in &db_sharemap {
            sharesets.entry(sharetype).or_default().insert(share_id.storage_index);

            let ages =
                self.db.get_lease_ages(&share_id.storage_index, share_id.shnum, start_slice)?;
            for &age in &ages {
                stats.lease_age_histogram.add(age);
            }
            *stats.leases_per_share_histogram.entry(ages.len() as u64).or_insert(0) += 1;
            stats.space_recovered.add_examined_share(sharetype, used_space);
        }
        for sharetype in ShareType::ALL {
            let count = sharesets.get(&sharetype).map(|set| set.len()).unwrap_or(0);
            stats.space_recovered.add_examined_buckets(sharetype, count as u64);
        }

        // Orphans found on disk enter the catalog in COMING with a starter
        // lease, so an abandoned share still ages out eventually.
        let db_shares: HashSet<ShareId> = db_sharemap.keys().copied().collect();
        for share_id in disk_shares.difference(&db_shares) {
            let si_s = share_id.storage_index.to_base32();
            let used_space = match self.backend.used_space(prefix, &si_s, share_id.shnum) {
                Ok(bytes) => bytes,
                Err(error) => {
                    warn!(share = %share_id, %error,
                        "cannot stat discovered share; retrying next cycle");
                    continue;
                }
            };
            match self.db.add_new_share(
                &share_id.storage_index,
                share_id.shnum,
                used_space,
                ShareType::Unknown,
            ) {
                Ok(()) => {
                    self.db.add_starter_lease(
                        &share_id.storage_index,
                        share_id.shnum,
                        self.clock.now(),
                    )?;
                    info!(share = %share_id, used_space, "discovered share; issued starter lease");
                }
                Err(LeaseDbError::ShareAlreadyInDatabase { .. }) => {
                    // Raced with the protocol path adding the same share.
                    debug!(share = %share_id, "share appeared in catalog mid-slice");
                }
                Err(error) => return Err(error.into()),
            }
        }

        // Shares recorded in the catalog but gone from disk were deleted
        // out-of-band; drop their rows and leases.
        for share_id in db_shares.difference(&disk_shares) {
            if failed_buckets.contains(&share_id.storage_index) {
                continue;
            }
            info!(share = %share_id, "share vanished from backend; dropping catalog row");
            self.db.remove_deleted_share(&share_id.storage_index, share_id.shnum)?;
        }

        self.db.commit()?;
        Ok(())
    }

    fn finished_cycle(&mut self, cycle: u64, state: &mut CrawlerState) -> Result<()> {
        // The sweep runs here so its recoveries land in this cycle's
        // history entry.
        if self.policy.is_enabled() {
            let mut stats = std::mem::take(&mut state.cycle_to_date);
            let outcome = self.expiration_sweep(&mut stats);
            state.cycle_to_date = stats;
            outcome?;
        }

        let finish = self.clock.now();
        let start = state.current_cycle_start_time.unwrap_or(finish);
        let stats = &state.cycle_to_date;
        let entry = json!({
            "cycle-start-finish-times": [start, finish],
            "expiration-enabled": self.policy.is_enabled(),
            "configured-expiration-mode": self.policy.parameters(),
            "lease-age-histogram": stats.lease_age_histogram,
            "leases-per-share-histogram": stats.leases_per_share_histogram,
            "corrupt-shares": stats.corrupt_shares,
            "space-recovered": stats.space_recovered,
        });
        self.db.add_history_entry(cycle, &entry)?;
        Ok(())
    }
}
