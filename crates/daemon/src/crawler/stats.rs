// Per-cycle crawler statistics.
//
// The history wire format uses open string-keyed maps; here each counter is
// a named field and the flat map only exists at the serde boundary, so a
// typo in a counter name is a compile error instead of a silent new key.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use holdfast_common::types::{ShareType, DAY};

/// The `space-recovered` record: `{examined,actual}` ×
/// `{buckets,shares,diskbytes}`, each with a total and four per-sharetype
/// counters. "Examined" is what the cycle looked at; "actual" is what the
/// sweep deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpaceRecovered {
    #[serde(rename = "examined-buckets")]
    pub examined_buckets: u64,
    #[serde(rename = "examined-buckets-immutable")]
    pub examined_buckets_immutable: u64,
    #[serde(rename = "examined-buckets-mutable")]
    pub examined_buckets_mutable: u64,
    #[serde(rename = "examined-buckets-corrupted")]
    pub examined_buckets_corrupted: u64,
    #[serde(rename = "examined-buckets-unknown")]
    pub examined_buckets_unknown: u64,

    #[serde(rename = "examined-shares")]
    pub examined_shares: u64,
    #[serde(rename = "examined-shares-immutable")]
    pub examined_shares_immutable: u64,
    #[serde(rename = "examined-shares-mutable")]
    pub examined_shares_mutable: u64,
    #[serde(rename = "examined-shares-corrupted")]
    pub examined_shares_corrupted: u64,
    #[serde(rename = "examined-shares-unknown")]
    pub examined_shares_unknown: u64,

    #[serde(rename = "examined-diskbytes")]
    pub examined_diskbytes: u64,
    #[serde(rename = "examined-diskbytes-immutable")]
    pub examined_diskbytes_immutable: u64,
    #[serde(rename = "examined-diskbytes-mutable")]
    pub examined_diskbytes_mutable: u64,
    #[serde(rename = "examined-diskbytes-corrupted")]
    pub examined_diskbytes_corrupted: u64,
    #[serde(rename = "examined-diskbytes-unknown")]
    pub examined_diskbytes_unknown: u64,

    #[serde(rename = "actual-buckets")]
    pub actual_buckets: u64,
    #[serde(rename = "actual-buckets-immutable")]
    pub actual_buckets_immutable: u64,
    #[serde(rename = "actual-buckets-mutable")]
    pub actual_buckets_mutable: u64,
    #[serde(rename = "actual-buckets-corrupted")]
    pub actual_buckets_corrupted: u64,
    #[serde(rename = "actual-buckets-unknown")]
    pub actual_buckets_unknown: u64,

    #[serde(rename = "actual-shares")]
    pub actual_shares: u64,
    #[serde(rename = "actual-shares-immutable")]
    pub actual_shares_immutable: u64,
    #[serde(rename = "actual-shares-mutable")]
    pub actual_shares_mutable: u64,
    #[serde(rename = "actual-shares-corrupted")]
    pub actual_shares_corrupted: u64,
    #[serde(rename = "actual-shares-unknown")]
    pub actual_shares_unknown: u64,

    #[serde(rename = "actual-diskbytes")]
    pub actual_diskbytes: u64,
    #[serde(rename = "actual-diskbytes-immutable")]
    pub actual_diskbytes_immutable: u64,
    #[serde(rename = "actual-diskbytes-mutable")]
    pub actual_diskbytes_mutable: u64,
    #[serde(rename = "actual-diskbytes-corrupted")]
    pub actual_diskbytes_corrupted: u64,
    #[serde(rename = "actual-diskbytes-unknown")]
    pub actual_diskbytes_unknown: u64,
}

impl SpaceRecovered {
    /// One share looked at during reconciliation.
    pub fn add_examined_share(&mut self, sharetype: ShareType, used_space: u64) {
        self.examined_shares += 1;
        self.examined_diskbytes += used_space;
        match sharetype {
            ShareType::Immutable => {
                self.examined_shares_immutable += 1;
                self.examined_diskbytes_immutable += used_space;
            }
            ShareType::Mutable => {
                self.examined_shares_mutable += 1;
                self.examined_diskbytes_mutable += used_space;
            }
            ShareType::Corrupted => {
                self.examined_shares_corrupted += 1;
                self.examined_diskbytes_corrupted += used_space;
            }
            ShareType::Unknown => {
                self.examined_shares_unknown += 1;
                self.examined_diskbytes_unknown += used_space;
            }
        }
    }

    /// Distinct storage indexes holding at least one share of `sharetype`
    /// in the prefix just examined. The total is the sum over sharetypes.
    pub fn add_examined_buckets(&mut self, sharetype: ShareType, count: u64) {
        self.examined_buckets += count;
        match sharetype {
            ShareType::Immutable => self.examined_buckets_immutable += count,
            ShareType::Mutable => self.examined_buckets_mutable += count,
            ShareType::Corrupted => self.examined_buckets_corrupted += count,
            ShareType::Unknown => self.examined_buckets_unknown += count,
        }
    }

    /// One share deleted by the sweep.
    pub fn add_actual_share(&mut self, sharetype: ShareType, used_space: u64) {
        self.actual_shares += 1;
        self.actual_diskbytes += used_space;
        match sharetype {
            ShareType::Immutable => {
                self.actual_shares_immutable += 1;
                self.actual_diskbytes_immutable += used_space;
            }
            ShareType::Mutable => {
                self.actual_shares_mutable += 1;
                self.actual_diskbytes_mutable += used_space;
            }
            ShareType::Corrupted => {
                self.actual_shares_corrupted += 1;
                self.actual_diskbytes_corrupted += used_space;
            }
            ShareType::Unknown => {
                self.actual_shares_unknown += 1;
                self.actual_diskbytes_unknown += used_space;
            }
        }
    }

    /// Distinct storage indexes the sweep deleted shares of `sharetype`
    /// from. The total is the sum over sharetypes.
    pub fn add_actual_buckets(&mut self, sharetype: ShareType, count: u64) {
        self.actual_buckets += count;
        match sharetype {
            ShareType::Immutable => self.actual_buckets_immutable += count,
            ShareType::Mutable => self.actual_buckets_mutable += count,
            ShareType::Corrupted => self.actual_buckets_corrupted += count,
            ShareType::Unknown => self.actual_buckets_unknown += count,
        }
    }
}

/// Lease ages binned into days, recorded as `[bin_start, bin_end, count]`
/// triples on the wire (JSON objects cannot key on tuples).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseAgeHistogram {
    bins: BTreeMap<i64, u64>,
}

impl LeaseAgeHistogram {
    pub fn add(&mut self, age: i64) {
        let bin_start = age.div_euclid(DAY) * DAY;
        *self.bins.entry(bin_start).or_insert(0) += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    /// `(min, max, count)` triples sorted by `min`.
    pub fn to_triples(&self) -> Vec<(i64, i64, u64)> {
        self.bins.iter().map(|(&start, &count)| (start, start + DAY, count)).collect()
    }
}

impl Serialize for LeaseAgeHistogram {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_triples().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for LeaseAgeHistogram {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let triples = Vec::<(i64, i64, u64)>::deserialize(deserializer)?;
        let mut bins = BTreeMap::new();
        for (start, _end, count) in triples {
            *bins.entry(start).or_insert(0) += count;
        }
        Ok(Self { bins })
    }
}

/// Everything the crawler accumulates within one cycle; serialized into the
/// statefile after each slice and into a history entry at cycle end.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleStats {
    #[serde(rename = "corrupt-shares")]
    pub corrupt_shares: Vec<(String, u32)>,
    #[serde(rename = "space-recovered")]
    pub space_recovered: SpaceRecovered,
    #[serde(rename = "lease-age-histogram")]
    pub lease_age_histogram: LeaseAgeHistogram,
    #[serde(rename = "leases-per-share-histogram")]
    pub leases_per_share_histogram: BTreeMap<u64, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── SpaceRecovered ─────────────────────────────────────────────

    #[test]
    fn examined_share_updates_total_and_sharetype_counters() {
        let mut rec = SpaceRecovered::default();
        rec.add_examined_share(ShareType::Immutable, 100);
        rec.add_examined_share(ShareType::Immutable, 50);
        rec.add_examined_share(ShareType::Unknown, 7);

        assert_eq!(rec.examined_shares, 3);
        assert_eq!(rec.examined_shares_immutable, 2);
        assert_eq!(rec.examined_shares_unknown, 1);
        assert_eq!(rec.examined_shares_mutable, 0);
        assert_eq!(rec.examined_diskbytes, 157);
        assert_eq!(rec.examined_diskbytes_immutable, 150);
        assert_eq!(rec.examined_diskbytes_unknown, 7);
    }

    #[test]
    fn bucket_totals_are_the_sum_over_sharetypes() {
        let mut rec = SpaceRecovered::default();
        rec.add_examined_buckets(ShareType::Immutable, 3);
        rec.add_examined_buckets(ShareType::Mutable, 2);
        assert_eq!(rec.examined_buckets, 5);

        rec.add_actual_buckets(ShareType::Corrupted, 1);
        assert_eq!(rec.actual_buckets, 1);
        assert_eq!(rec.actual_buckets_corrupted, 1);
    }

    #[test]
    fn serializes_to_the_flat_wire_map() {
        let mut rec = SpaceRecovered::default();
        rec.add_actual_share(ShareType::Mutable, 1024);

        let value = serde_json::to_value(&rec).unwrap();
        let map = value.as_object().unwrap();
        assert_eq!(map.len(), 30);
        assert_eq!(map["actual-shares"], 1);
        assert_eq!(map["actual-shares-mutable"], 1);
        assert_eq!(map["actual-diskbytes-mutable"], 1024);
        assert_eq!(map["examined-buckets-unknown"], 0);

        let back: SpaceRecovered = serde_json::from_value(value).unwrap();
        assert_eq!(back, rec);
    }

    // ── LeaseAgeHistogram ──────────────────────────────────────────

    #[test]
    fn ages_bin_by_day() {
        let mut histogram = LeaseAgeHistogram::default();
        histogram.add(0);
        histogram.add(DAY - 1);
        histogram.add(DAY);
        histogram.add(10 * DAY + 5);

        assert_eq!(
            histogram.to_triples(),
            vec![(0, DAY, 2), (DAY, 2 * DAY, 1), (10 * DAY, 11 * DAY, 1)]
        );
    }

    #[test]
    fn histogram_round_trips_through_json_triples() {
        let mut histogram = LeaseAgeHistogram::default();
        histogram.add(3 * DAY + 10);
        histogram.add(100);

        let json = serde_json::to_value(&histogram).unwrap();
        assert_eq!(json, serde_json::json!([[0, DAY, 1], [3 * DAY, 4 * DAY, 1]]));

        let back: LeaseAgeHistogram = serde_json::from_value(json).unwrap();
        assert_eq!(back, histogram);
    }

    // ── CycleStats ─────────────────────────────────────────────────

    #[test]
    fn cycle_stats_use_wire_key_names() {
        let mut stats = CycleStats::default();
        stats.corrupt_shares.push(("a".repeat(26), 2));
        stats.leases_per_share_histogram.insert(1, 40);
        stats.lease_age_histogram.add(5);

        let value = serde_json::to_value(&stats).unwrap();
        assert_eq!(value["corrupt-shares"], serde_json::json!([["a".repeat(26), 2]]));
        // Integer map keys become JSON strings.
        assert_eq!(value["leases-per-share-histogram"]["1"], 40);
        assert_eq!(value["lease-age-histogram"][0][2], 1);
        assert_eq!(value["space-recovered"]["examined-shares"], 0);

        let back: CycleStats = serde_json::from_value(value).unwrap();
        assert_eq!(back, stats);
    }
}
