use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ResolveError {
    #[error("replacement `{replacement}` for `{original}` does not exist in the target metadata")]
    UnknownReplacement { original: String, replacement: String },
}

/// Lookup table from a source database's numeric metadata id to the stable
/// external statistic name (`statistics_meta.statistic_id`).
#[derive(Debug, Clone, Default)]
pub struct SourceIdentityIndex {
    by_id: HashMap<i64, String>,
}

impl SourceIdentityIndex {
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (i64, String)>,
    {
        Self { by_id: pairs.into_iter().collect() }
    }

    #[must_use]
    pub fn name_of(&self, metadata_id: i64) -> Option<&str> {
        self.by_id.get(&metadata_id).map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// Lookup table from a stable external statistic name to the target
/// database's numeric metadata id. Duplicate names are last-write-wins;
/// the schema is expected to keep `statistic_id` unique.
#[derive(Debug, Clone, Default)]
pub struct TargetIdentityIndex {
    by_name: HashMap<String, i64>,
}

impl TargetIdentityIndex {
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (i64, String)>,
    {
        Self { by_name: pairs.into_iter().map(|(id, name)| (name, id)).collect() }
    }

    #[must_use]
    pub fn id_of(&self, name: &str) -> Option<i64> {
        self.by_name.get(name).copied()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

/// Outcome of resolving one source `metadata_id` against the target store.
///
/// `NeedsDecision` is the suspension point of the interactive protocol: the
/// resolver never blocks on operator input itself. The caller gathers a
/// [`Decision`] and feeds it back through [`Resolver::apply_decision`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Direct, override, or previously decided mapping to a target id.
    Resolved(i64),
    /// The operator declared this name skipped for the rest of the run.
    Skipped,
    /// The source database has no metadata entry for this id at all.
    /// `first_occurrence` is true the first time the id is seen, so the
    /// caller can warn exactly once per id.
    MissingSourceEntry { metadata_id: i64, first_occurrence: bool },
    /// The name has no target counterpart and no recorded decision.
    NeedsDecision { name: String },
}

/// Operator (or auto-selected) answer for one unresolved statistic name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Skip the current row only; the same name prompts again next time.
    SkipOnce,
    /// Skip every remaining row with this name for the rest of the run.
    SkipAll,
    /// Resolve this and all later rows through the given replacement name.
    Remap(String),
}

/// A source entity that reached the decision protocol, with the metadata id
/// it was first observed under (used for the advisory example lookup).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnresolvedEntity {
    pub name: String,
    pub metadata_id: i64,
}

/// Mutable state scoped to one import run: the skip set, the override map,
/// the warned-id set, and the record of every entity that ever prompted.
/// Constructed fresh per run and discarded afterwards; never global.
#[derive(Debug, Default)]
pub struct RunContext {
    skip_all: HashSet<String>,
    overrides: HashMap<String, String>,
    missing_source_ids: HashSet<i64>,
    unresolved: BTreeMap<String, i64>,
}

impl RunContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every distinct name that triggered the decision protocol this run,
    /// in name order, regardless of how it was decided.
    #[must_use]
    pub fn unresolved_entities(&self) -> Vec<UnresolvedEntity> {
        self.unresolved
            .iter()
            .map(|(name, metadata_id)| UnresolvedEntity {
                name: name.clone(),
                metadata_id: *metadata_id,
            })
            .collect()
    }

    #[must_use]
    pub fn is_skipped(&self, name: &str) -> bool {
        self.skip_all.contains(name)
    }

    #[must_use]
    pub fn override_for(&self, name: &str) -> Option<&str> {
        self.overrides.get(name).map(String::as_str)
    }

    /// Source metadata ids that had no entry in the source's own metadata
    /// table, in ascending order.
    #[must_use]
    pub fn missing_source_ids(&self) -> Vec<i64> {
        let ordered: BTreeSet<i64> = self.missing_source_ids.iter().copied().collect();
        ordered.into_iter().collect()
    }
}

/// Maps source metadata ids to target metadata ids across the two identity
/// indexes, consulting and updating the run-scoped decision state.
#[derive(Debug, Clone, Copy)]
pub struct Resolver<'a> {
    source: &'a SourceIdentityIndex,
    target: &'a TargetIdentityIndex,
}

impl<'a> Resolver<'a> {
    #[must_use]
    pub fn new(source: &'a SourceIdentityIndex, target: &'a TargetIdentityIndex) -> Self {
        Self { source, target }
    }

    #[must_use]
    pub fn target_index(&self) -> &'a TargetIdentityIndex {
        self.target
    }

    /// Resolve one source `metadata_id`, in precedence order: source name
    /// lookup, direct target hit, skip set, override map, decision needed.
    pub fn resolve(&self, ctx: &mut RunContext, metadata_id: i64) -> Resolution {
        let Some(name) = self.source.name_of(metadata_id) else {
            let first_occurrence = ctx.missing_source_ids.insert(metadata_id);
            return Resolution::MissingSourceEntry { metadata_id, first_occurrence };
        };

        // Fast path: the name exists in the target as-is.
        if let Some(target_id) = self.target.id_of(name) {
            return Resolution::Resolved(target_id);
        }

        if ctx.skip_all.contains(name) {
            return Resolution::Skipped;
        }

        if let Some(replacement) = ctx.overrides.get(name) {
            // Replacements are validated in `apply_decision`, so this
            // lookup cannot miss unless the context was built elsewhere.
            if let Some(target_id) = self.target.id_of(replacement) {
                return Resolution::Resolved(target_id);
            }
        }

        ctx.unresolved.entry(name.to_string()).or_insert(metadata_id);
        Resolution::NeedsDecision { name: name.to_string() }
    }

    /// Record the operator's decision for an unresolved name and return the
    /// target id the current row should use, if any.
    ///
    /// `SkipOnce` records nothing, so the next row with the same name
    /// resolves to `NeedsDecision` again. `SkipAll` and `Remap` are
    /// memoized in the context and never prompt again this run.
    ///
    /// # Errors
    /// Returns [`ResolveError::UnknownReplacement`] when a `Remap`
    /// replacement name does not exist in the target index; nothing is
    /// recorded in that case.
    pub fn apply_decision(
        &self,
        ctx: &mut RunContext,
        name: &str,
        decision: Decision,
    ) -> Result<Option<i64>, ResolveError> {
        match decision {
            Decision::SkipOnce => Ok(None),
            Decision::SkipAll => {
                ctx.skip_all.insert(name.to_string());
                Ok(None)
            }
            Decision::Remap(replacement) => match self.target.id_of(&replacement) {
                Some(target_id) => {
                    ctx.overrides.insert(name.to_string(), replacement);
                    Ok(Some(target_id))
                }
                None => Err(ResolveError::UnknownReplacement {
                    original: name.to_string(),
                    replacement,
                }),
            },
        }
    }
}

/// Per-table result counters emitted after each table completes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableSummary {
    pub table: String,
    pub total_rows: u64,
    pub inserted: u64,
    pub skipped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn indexes() -> (SourceIdentityIndex, TargetIdentityIndex) {
        let source = SourceIdentityIndex::from_pairs([
            (5, "temp_sensor_1".to_string()),
            (7, "temp_sensor_2".to_string()),
        ]);
        let target = TargetIdentityIndex::from_pairs([
            (42, "temp_sensor_1".to_string()),
            (99, "temp_sensor_2_renamed".to_string()),
        ]);
        (source, target)
    }

    #[test]
    fn direct_name_match_resolves_to_target_id() {
        let (source, target) = indexes();
        let resolver = Resolver::new(&source, &target);
        let mut ctx = RunContext::new();

        assert_eq!(resolver.resolve(&mut ctx, 5), Resolution::Resolved(42));
        assert!(ctx.unresolved_entities().is_empty());
    }

    #[test]
    fn duplicate_target_names_are_last_write_wins() {
        let target = TargetIdentityIndex::from_pairs([
            (1, "temp_sensor_1".to_string()),
            (2, "temp_sensor_1".to_string()),
        ]);
        assert_eq!(target.id_of("temp_sensor_1"), Some(2));
        assert_eq!(target.len(), 1);
    }

    #[test]
    fn missing_source_entry_warns_only_on_first_occurrence() {
        let (source, target) = indexes();
        let resolver = Resolver::new(&source, &target);
        let mut ctx = RunContext::new();

        assert_eq!(
            resolver.resolve(&mut ctx, 123),
            Resolution::MissingSourceEntry { metadata_id: 123, first_occurrence: true }
        );
        assert_eq!(
            resolver.resolve(&mut ctx, 123),
            Resolution::MissingSourceEntry { metadata_id: 123, first_occurrence: false }
        );
        assert_eq!(ctx.missing_source_ids(), vec![123]);
    }

    #[test]
    fn skip_once_does_not_memoize() {
        let (source, target) = indexes();
        let resolver = Resolver::new(&source, &target);
        let mut ctx = RunContext::new();

        let resolution = resolver.resolve(&mut ctx, 7);
        assert_eq!(resolution, Resolution::NeedsDecision { name: "temp_sensor_2".to_string() });

        let outcome = resolver.apply_decision(&mut ctx, "temp_sensor_2", Decision::SkipOnce);
        assert_eq!(outcome, Ok(None));

        // The next row with the same name must prompt again.
        assert_eq!(
            resolver.resolve(&mut ctx, 7),
            Resolution::NeedsDecision { name: "temp_sensor_2".to_string() }
        );
    }

    #[test]
    fn skip_all_suppresses_further_prompts() {
        let (source, target) = indexes();
        let resolver = Resolver::new(&source, &target);
        let mut ctx = RunContext::new();

        assert_eq!(
            resolver.resolve(&mut ctx, 7),
            Resolution::NeedsDecision { name: "temp_sensor_2".to_string() }
        );
        let outcome = resolver.apply_decision(&mut ctx, "temp_sensor_2", Decision::SkipAll);
        assert_eq!(outcome, Ok(None));

        for _ in 0..1000 {
            assert_eq!(resolver.resolve(&mut ctx, 7), Resolution::Skipped);
        }
        assert!(ctx.is_skipped("temp_sensor_2"));
    }

    #[test]
    fn remap_resolves_current_and_later_rows() {
        let (source, target) = indexes();
        let resolver = Resolver::new(&source, &target);
        let mut ctx = RunContext::new();

        assert_eq!(
            resolver.resolve(&mut ctx, 7),
            Resolution::NeedsDecision { name: "temp_sensor_2".to_string() }
        );
        let outcome = resolver.apply_decision(
            &mut ctx,
            "temp_sensor_2",
            Decision::Remap("temp_sensor_2_renamed".to_string()),
        );
        assert_eq!(outcome, Ok(Some(99)));
        assert_eq!(ctx.override_for("temp_sensor_2"), Some("temp_sensor_2_renamed"));

        assert_eq!(resolver.resolve(&mut ctx, 7), Resolution::Resolved(99));
    }

    #[test]
    fn unknown_replacement_is_rejected_and_not_recorded() {
        let (source, target) = indexes();
        let resolver = Resolver::new(&source, &target);
        let mut ctx = RunContext::new();

        let outcome = resolver.apply_decision(
            &mut ctx,
            "temp_sensor_2",
            Decision::Remap("does_not_exist".to_string()),
        );
        assert_eq!(
            outcome,
            Err(ResolveError::UnknownReplacement {
                original: "temp_sensor_2".to_string(),
                replacement: "does_not_exist".to_string(),
            })
        );
        assert_eq!(ctx.override_for("temp_sensor_2"), None);
    }

    #[test]
    fn unresolved_entities_record_first_observed_metadata_id() {
        let source = SourceIdentityIndex::from_pairs([
            (7, "temp_sensor_2".to_string()),
            (8, "temp_sensor_3".to_string()),
        ]);
        let target = TargetIdentityIndex::default();
        let resolver = Resolver::new(&source, &target);
        let mut ctx = RunContext::new();

        let _ = resolver.resolve(&mut ctx, 8);
        let _ = resolver.resolve(&mut ctx, 7);
        let _ = resolver.resolve(&mut ctx, 7);

        assert_eq!(
            ctx.unresolved_entities(),
            vec![
                UnresolvedEntity { name: "temp_sensor_2".to_string(), metadata_id: 7 },
                UnresolvedEntity { name: "temp_sensor_3".to_string(), metadata_id: 8 },
            ]
        );
    }
}
