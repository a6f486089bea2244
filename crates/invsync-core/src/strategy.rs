//! Strategy selection and scope resolution.
//!
//! A [`SyncStrategy`] is what the caller asks for; a [`SyncTier`] is the
//! concrete tier a run executes; a [`SyncScope`] is the filter, field set and
//! deactivation policy the tier maps to. Every function here is pure:
//! selection depends only on `(now, watermarks, thresholds)`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{NaturalKey, RecordKind, Timestamp};

/// Stock fields fetched by an inventory-only run.
pub const INVENTORY_FIELDS: &[&str] = &["quantity_on_hand", "reorder_point", "status"];

/// A requested sync strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    Full,
    Incremental,
    InventoryOnly,
    CriticalOnly,
    /// Pick a tier from staleness budgets.
    Smart,
}

impl SyncStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStrategy::Full => "full",
            SyncStrategy::Incremental => "incremental",
            SyncStrategy::InventoryOnly => "inventory_only",
            SyncStrategy::CriticalOnly => "critical_only",
            SyncStrategy::Smart => "smart",
        }
    }

    /// The concrete tier this strategy runs as.
    pub fn tier(
        &self,
        now: Timestamp,
        watermarks: &TierWatermarks,
        thresholds: &SmartThresholds,
    ) -> SyncTier {
        match self {
            SyncStrategy::Full => SyncTier::Full,
            SyncStrategy::Incremental => SyncTier::Incremental,
            SyncStrategy::InventoryOnly => SyncTier::InventoryOnly,
            SyncStrategy::CriticalOnly => SyncTier::CriticalOnly,
            SyncStrategy::Smart => select_smart(now, watermarks, thresholds),
        }
    }
}

impl fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStrategy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.replace('-', "_").as_str() {
            "full" => Ok(SyncStrategy::Full),
            "incremental" => Ok(SyncStrategy::Incremental),
            "inventory_only" => Ok(SyncStrategy::InventoryOnly),
            "critical_only" => Ok(SyncStrategy::CriticalOnly),
            "smart" => Ok(SyncStrategy::Smart),
            _ => Err(CoreError::UnknownStrategy(s.to_string())),
        }
    }
}

/// The concrete tier a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTier {
    Full,
    Incremental,
    InventoryOnly,
    CriticalOnly,
    /// An explicit key set, used to re-drive failures of an earlier run.
    Targeted,
}

impl SyncTier {
    /// Tiers eligible for smart selection, most comprehensive first.
    pub const SMART_ORDER: [SyncTier; 4] = [
        SyncTier::Full,
        SyncTier::Incremental,
        SyncTier::InventoryOnly,
        SyncTier::CriticalOnly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTier::Full => "full",
            SyncTier::Incremental => "incremental",
            SyncTier::InventoryOnly => "inventory_only",
            SyncTier::CriticalOnly => "critical_only",
            SyncTier::Targeted => "targeted",
        }
    }
}

impl fmt::Display for SyncTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncTier {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(SyncTier::Full),
            "incremental" => Ok(SyncTier::Incremental),
            "inventory_only" => Ok(SyncTier::InventoryOnly),
            "critical_only" => Ok(SyncTier::CriticalOnly),
            "targeted" => Ok(SyncTier::Targeted),
            _ => Err(CoreError::UnknownStrategy(s.to_string())),
        }
    }
}

/// Start time of the newest successful run of each tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierWatermarks {
    pub full: Option<Timestamp>,
    pub incremental: Option<Timestamp>,
    pub inventory_only: Option<Timestamp>,
    pub critical_only: Option<Timestamp>,
}

impl TierWatermarks {
    /// Record a successful run of `tier` that started at `started_at`.
    pub fn record(&mut self, tier: SyncTier, started_at: Timestamp) {
        let slot = match tier {
            SyncTier::Full => &mut self.full,
            SyncTier::Incremental => &mut self.incremental,
            SyncTier::InventoryOnly => &mut self.inventory_only,
            SyncTier::CriticalOnly => &mut self.critical_only,
            SyncTier::Targeted => return,
        };
        *slot = max_opt(*slot, Some(started_at));
    }

    /// Newest success of `tier` or of any tier that subsumes it.
    ///
    /// Full subsumes every tier; inventory-only subsumes critical-only.
    pub fn freshness(&self, tier: SyncTier) -> Option<Timestamp> {
        match tier {
            SyncTier::Full => self.full,
            SyncTier::Incremental => max_opt(self.incremental, self.full),
            SyncTier::InventoryOnly => max_opt(self.inventory_only, self.full),
            SyncTier::CriticalOnly => {
                max_opt(self.critical_only, max_opt(self.inventory_only, self.full))
            }
            SyncTier::Targeted => None,
        }
    }

    /// The `ModifiedSince` base for an incremental run.
    pub fn incremental_base(&self) -> Option<Timestamp> {
        max_opt(self.incremental, self.full)
    }
}

fn max_opt(a: Option<Timestamp>, b: Option<Timestamp>) -> Option<Timestamp> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

/// Staleness budgets for smart selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmartThresholds {
    pub critical_only: Duration,
    pub inventory_only: Duration,
    pub incremental: Duration,
    pub full: Duration,
}

impl SmartThresholds {
    /// The budget for a tier. Targeted runs are never selected.
    pub fn budget(&self, tier: SyncTier) -> Duration {
        match tier {
            SyncTier::Full => self.full,
            SyncTier::Incremental => self.incremental,
            SyncTier::InventoryOnly => self.inventory_only,
            SyncTier::CriticalOnly | SyncTier::Targeted => self.critical_only,
        }
    }
}

impl Default for SmartThresholds {
    fn default() -> Self {
        Self {
            critical_only: Duration::from_secs(15 * 60),
            inventory_only: Duration::from_secs(60 * 60),
            incremental: Duration::from_secs(6 * 60 * 60),
            full: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Deterministic smart tier selection.
///
/// Tiers are checked from most to least comprehensive; the first whose
/// staleness exceeds its budget wins. A tier that never ran is infinitely
/// stale. If nothing is stale, the cheapest tier runs.
pub fn select_smart(
    now: Timestamp,
    watermarks: &TierWatermarks,
    thresholds: &SmartThresholds,
) -> SyncTier {
    for tier in SyncTier::SMART_ORDER {
        let budget_ms = i64::try_from(thresholds.budget(tier).as_millis()).unwrap_or(i64::MAX);
        let stale = match watermarks.freshness(tier) {
            Some(at) => now.saturating_sub(at) > budget_ms,
            None => true,
        };
        if stale {
            return tier;
        }
    }
    SyncTier::CriticalOnly
}

/// Which remote records a listing includes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordFilter {
    All,
    /// Records whose remote last-modified is at or after the timestamp.
    ModifiedSince(Timestamp),
    /// Records the remote source considers active.
    ActiveOnly,
}

/// Which fields a fetch requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldScope {
    All,
    Only(Vec<String>),
}

impl FieldScope {
    /// The stock-level field subset.
    pub fn inventory() -> Self {
        FieldScope::Only(INVENTORY_FIELDS.iter().map(|f| f.to_string()).collect())
    }

    /// Whether only some fields are fetched.
    pub fn is_partial(&self) -> bool {
        matches!(self, FieldScope::Only(_))
    }

    /// Requested field names, or `None` for all fields.
    pub fn names(&self) -> Option<&[String]> {
        match self {
            FieldScope::All => None,
            FieldScope::Only(names) => Some(names),
        }
    }
}

/// Where a run's records come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeSource {
    /// A paginated (or report) listing under a filter.
    Listing { filter: RecordFilter },
    /// An explicit key set per kind.
    Keys(BTreeMap<RecordKind, BTreeSet<NaturalKey>>),
}

/// The resolved scope of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncScope {
    pub tier: SyncTier,
    pub source: ScopeSource,
    pub fields: FieldScope,
    pub kinds: Vec<RecordKind>,
    /// Whether keys absent from a complete listing are soft-deleted.
    pub deactivate_missing: bool,
}

impl SyncScope {
    /// Scope for an explicit key set.
    pub fn targeted(keys: BTreeMap<RecordKind, BTreeSet<NaturalKey>>) -> Self {
        let kinds = keys
            .iter()
            .filter(|(_, set)| !set.is_empty())
            .map(|(kind, _)| *kind)
            .collect();
        Self {
            tier: SyncTier::Targeted,
            source: ScopeSource::Keys(keys),
            fields: FieldScope::All,
            kinds,
            deactivate_missing: false,
        }
    }

    /// The keys this scope is restricted to for `kind`, if any.
    pub fn keys_for(&self, kind: RecordKind) -> Option<&BTreeSet<NaturalKey>> {
        match &self.source {
            ScopeSource::Keys(map) => map.get(&kind),
            ScopeSource::Listing { .. } => None,
        }
    }
}

/// Everything resolution needs, gathered by the caller.
#[derive(Debug, Clone, Default)]
pub struct StrategyContext {
    pub now: Timestamp,
    pub watermarks: TierWatermarks,
    pub thresholds: SmartThresholds,
    /// Active item keys at or below their reorder point.
    pub critical_keys: BTreeSet<NaturalKey>,
}

impl SyncScope {
    /// Resolve a strategy into a concrete scope.
    pub fn resolve(strategy: SyncStrategy, ctx: &StrategyContext) -> Self {
        let tier = strategy.tier(ctx.now, &ctx.watermarks, &ctx.thresholds);
        Self::for_tier(tier, ctx)
    }

    /// Build the scope of a concrete tier.
    pub fn for_tier(tier: SyncTier, ctx: &StrategyContext) -> Self {
        let all_kinds = RecordKind::ALL.to_vec();
        match tier {
            SyncTier::Full => Self {
                tier,
                source: ScopeSource::Listing { filter: RecordFilter::All },
                fields: FieldScope::All,
                kinds: all_kinds,
                deactivate_missing: true,
            },
            SyncTier::Incremental => {
                let filter = match ctx.watermarks.incremental_base() {
                    Some(since) => RecordFilter::ModifiedSince(since),
                    None => RecordFilter::All,
                };
                Self {
                    tier,
                    source: ScopeSource::Listing { filter },
                    fields: FieldScope::All,
                    kinds: all_kinds,
                    deactivate_missing: false,
                }
            }
            SyncTier::InventoryOnly => Self {
                tier,
                source: ScopeSource::Listing {
                    filter: RecordFilter::ActiveOnly,
                },
                fields: FieldScope::inventory(),
                kinds: vec![RecordKind::Item],
                deactivate_missing: false,
            },
            SyncTier::CriticalOnly => {
                let mut keys = BTreeMap::new();
                keys.insert(RecordKind::Item, ctx.critical_keys.clone());
                Self {
                    tier,
                    source: ScopeSource::Keys(keys),
                    fields: FieldScope::All,
                    kinds: vec![RecordKind::Item],
                    deactivate_missing: false,
                }
            }
            SyncTier::Targeted => Self::targeted(BTreeMap::new()),
        }
    }
}

/// Resolve a strategy into a concrete scope.
pub fn resolve(strategy: SyncStrategy, ctx: &StrategyContext) -> SyncScope {
    SyncScope::resolve(strategy, ctx)
}
