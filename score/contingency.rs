// ========================================================================================
//
//                        PER-LOCUS CONTINGENCY TABLES
//
// ========================================================================================
//
// Turns the genotype calls at one locus into an ordered 2×k table of control and
// case counts per genotype category, applying the no-call and minor allele
// frequency filters of the association stage.
//
// Categories are ordered by descending control count, ties broken by ascending
// genotype string. The trend test assigns weight 0 to the first column, and the
// persisted record keeps the same order, so this ordering is part of the output
// contract.

use crate::genotype::canonicalize;
use crate::types::{GenotypeCall, GenotypeCounts};
use ahash::{AHashMap, AHashSet};
use std::sync::Arc;
use thiserror::Error;

/// Filters and normalization applied while building a table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TableSettings {
    pub ignore_phase: bool,
    pub min_maf: f64,
    /// Maximum tolerated no-calls; 0 disables the filter.
    pub max_no_calls: u32,
}

/// The subjects of a run split by status. Subjects in neither set are ignored.
#[derive(Debug, Clone, Default)]
pub struct SubjectClasses {
    pub cases: AHashSet<Arc<str>>,
    pub controls: AHashSet<Arc<str>>,
}

impl SubjectClasses {
    pub fn num_cases(&self) -> usize {
        self.cases.len()
    }

    pub fn num_controls(&self) -> usize {
        self.controls.len()
    }
}

/// Why a locus produced no table.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum TableRejection {
    #[error("{no_calls} no-calls exceed the limit of {limit}")]
    TooManyNoCalls { no_calls: u32, limit: u32 },
    #[error("MAF {maf} is below the minimum of {min_maf}")]
    BelowMinMaf { maf: f64, min_maf: f64 },
    #[error("no case or control genotype categories")]
    NoCategories,
}

/// An accepted locus: ordered categories with aligned counts, plus the locus-level
/// statistics that travel with it into the segregation record.
#[derive(Debug, Clone, PartialEq)]
pub struct ContingencyTable {
    pub categories: Vec<GenotypeCounts>,
    pub maf: f64,
    pub no_call_count: u32,
    /// Called genotypes belonging to subjects that are neither cases nor controls.
    pub ignored_count: u32,
}

impl ContingencyTable {
    pub fn control_row(&self) -> Vec<u32> {
        self.categories.iter().map(|c| c.controls).collect()
    }

    pub fn case_row(&self) -> Vec<u32> {
        self.categories.iter().map(|c| c.cases).collect()
    }
}

/// Fraction of called chromosomes that do not carry the most frequent allele at
/// this locus. The majority allele is found empirically from the calls, so a
/// locus where ALT dominates is handled the same as one where REF does. Returns
/// 0.0 when nothing was called.
pub fn empirical_minor_allele_frequency(calls: &[GenotypeCall]) -> f64 {
    let mut allele_counts: AHashMap<&str, u64> = AHashMap::new();
    let mut total = 0u64;
    for call in calls.iter().filter(|c| !c.is_no_call) {
        for allele in call.alleles().filter(|a| *a != ".") {
            *allele_counts.entry(allele).or_insert(0) += 1;
            total += 1;
        }
    }

    if total == 0 {
        return 0.0;
    }
    let majority = allele_counts.values().copied().max().unwrap_or(0);
    (total - majority) as f64 / total as f64
}

/// Builds the ordered contingency table for one locus.
pub fn build_table(
    calls: &[GenotypeCall],
    subjects: &SubjectClasses,
    settings: &TableSettings,
) -> Result<ContingencyTable, TableRejection> {
    let mut counts: AHashMap<String, (u32, u32)> = AHashMap::new();
    let mut no_call_count = 0u32;
    let mut ignored_count = 0u32;

    for call in calls {
        if call.is_no_call {
            no_call_count += 1;
            continue;
        }

        let is_case = subjects.cases.contains(&call.subject);
        let is_control = !is_case && subjects.controls.contains(&call.subject);
        if !is_case && !is_control {
            ignored_count += 1;
            continue;
        }

        let genotype = canonicalize(&call.genotype, settings.ignore_phase);
        let entry = counts.entry(genotype).or_insert((0, 0));
        if is_case {
            entry.0 += 1;
        } else {
            entry.1 += 1;
        }
    }

    if settings.max_no_calls > 0 && no_call_count > settings.max_no_calls {
        return Err(TableRejection::TooManyNoCalls {
            no_calls: no_call_count,
            limit: settings.max_no_calls,
        });
    }

    let maf = empirical_minor_allele_frequency(calls);
    if maf < settings.min_maf {
        return Err(TableRejection::BelowMinMaf {
            maf,
            min_maf: settings.min_maf,
        });
    }

    if counts.is_empty() {
        return Err(TableRejection::NoCategories);
    }

    let mut categories: Vec<GenotypeCounts> = counts
        .into_iter()
        .map(|(genotype, (cases, controls))| GenotypeCounts {
            genotype,
            cases,
            controls,
        })
        .collect();
    categories.sort_by(|a, b| {
        b.controls
            .cmp(&a.controls)
            .then_with(|| a.genotype.cmp(&b.genotype))
    });

    Ok(ContingencyTable {
        categories,
        maf,
        no_call_count,
        ignored_count,
    })
}
