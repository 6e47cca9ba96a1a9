// ========================================================================================
//
//                            PER-SUBJECT RISK AGGREGATION
//
// ========================================================================================
//
// ### Purpose ###
//
// Combines the per-locus log odds ratios of accepted segregation records into one
// score per subject: the mean log10 odds ratio over every locus at which the
// subject's called genotype matches a scored category.
//
// Loci are fed in one at a time by the caller. Within a locus the calls are
// processed in parallel, and the per-subject cells live in a sharded concurrent
// map; an update to one subject's `(sum, count)` happens under that key's shard
// lock, so two contributions to the same subject can never interleave.

use crate::genotype::canonicalize;
use crate::segregation::SegregationRecord;
use crate::types::{CaseControlLabel, GenotypeCall, Locus};
use ahash::AHashMap;
use dashmap::DashMap;
use rayon::prelude::*;
use std::sync::Arc;

/// The scored genotype categories of one locus, keyed by genotype.
#[derive(Debug, Clone)]
pub struct LocusLogOdds {
    locus: Locus,
    values: AHashMap<String, f64>,
}

impl LocusLogOdds {
    pub fn from_record(record: &SegregationRecord) -> Self {
        Self {
            locus: record.locus().clone(),
            values: record.log_odds_ratios().into_iter().collect(),
        }
    }

    /// Builds a lookup directly from `(genotype, log10 odds ratio)` pairs.
    pub fn from_pairs<I, S>(locus: Locus, pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        Self {
            locus,
            values: pairs.into_iter().map(|(g, v)| (g.into(), v)).collect(),
        }
    }

    pub fn locus(&self) -> &Locus {
        &self.locus
    }

    #[inline]
    pub fn get(&self, genotype: &str) -> Option<f64> {
        self.values.get(genotype).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Running total for one subject.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScoreCell {
    pub sum: f64,
    pub count: u32,
}

/// A finalized per-subject score.
#[derive(Debug, Clone, PartialEq)]
pub struct SubjectScore {
    pub subject: String,
    pub is_case: bool,
    /// Mean log10 odds ratio over the contributing loci.
    pub score: f64,
    pub contributing_loci: u32,
}

pub struct RiskScoreAggregator {
    /// Variant-source sample name to the label it was resolved from.
    included: AHashMap<Arc<str>, CaseControlLabel>,
    cells: DashMap<Arc<str>, ScoreCell>,
    ignore_phase: bool,
}

impl RiskScoreAggregator {
    pub fn new(included: AHashMap<Arc<str>, CaseControlLabel>, ignore_phase: bool) -> Self {
        Self {
            included,
            cells: DashMap::new(),
            ignore_phase,
        }
    }

    /// Adds this locus's contribution for every included subject whose called
    /// genotype has a scored category. Returns the number of contributions made.
    pub fn accumulate(&self, lookup: &LocusLogOdds, calls: &[GenotypeCall]) -> usize {
        if lookup.is_empty() {
            return 0;
        }

        calls
            .par_iter()
            .filter(|call| !call.is_no_call && self.included.contains_key(&call.subject))
            .filter_map(|call| {
                let genotype = canonicalize(&call.genotype, self.ignore_phase);
                lookup.get(&genotype).map(|value| (&call.subject, value))
            })
            .map(|(subject, value)| {
                let mut cell = self.cells.entry(Arc::clone(subject)).or_default();
                cell.sum += value;
                cell.count += 1;
                1usize
            })
            .sum()
    }

    /// Number of subjects with at least one contribution so far.
    pub fn num_scored_subjects(&self) -> usize {
        self.cells.len()
    }

    /// Final mean scores in natural subject order. Subjects that never
    /// contributed are omitted.
    pub fn finalize(self) -> Vec<SubjectScore> {
        let included = self.included;
        let mut scores: Vec<SubjectScore> = self
            .cells
            .into_iter()
            .filter(|(_, cell)| cell.count > 0)
            .filter_map(|(sample, cell)| {
                included.get(&sample).map(|label| SubjectScore {
                    subject: label.subject.clone(),
                    is_case: label.is_case,
                    score: cell.sum / cell.count as f64,
                    contributing_loci: cell.count,
                })
            })
            .collect();
        scores.sort_by(|a, b| natord::compare(&a.subject, &b.subject));
        scores
    }
}
