// ========================================================================================
//
//                         THE SEGREGATION AND SCORING PASSES
//
// ========================================================================================
//
// ### Purpose ###
//
// Drives the two passes over a variant source. The segregation pass builds a
// contingency table and runs the trend test at every locus in scope, writing one
// record per accepted locus as soon as it is computed. The scoring pass reads those
// records back, re-queries each accepted locus, and aggregates log odds ratios into
// per-subject scores.
//
// Loci are processed strictly one after another in source order. Each query is a
// `ScopedQuery` that is dropped before the next one opens.

use crate::aggregate::{LocusLogOdds, RiskScoreAggregator, SubjectScore};
use crate::contingency::{TableRejection, TableSettings, build_table};
use crate::io::{ScopedQuery, SourceError, VariantSource};
use crate::labels::{InclusionCaps, LabelError, ResolvedLabels};
use crate::plink_list::ListFormatError;
use crate::segregation::{RecordDecodeError, SegregationRecord, format_decimal, format_percent};
use crate::trend::{TrendTestError, cochran_armitage, default_weights};
use crate::types::{Region, RegionParseError, VariantSite, in_scope};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, info, warn};
use std::fmt;
use std::io::{self, IsTerminal, Write};
use std::time::Duration;
use thiserror::Error;

// --- Defaults ---

pub const DEFAULT_SEGREGATION_MIN_MAF: f64 = 0.0;
/// Zero disables the no-call filter in the segregation pass.
pub const DEFAULT_SEGREGATION_MAX_NO_CALLS: u32 = 0;
pub const DEFAULT_SCORING_MIN_MAF: f64 = 0.01;
pub const DEFAULT_SCORING_MAX_NO_CALLS: u32 = 1000;

/// Number of decimal places for fractions in human-facing summaries.
const SUMMARY_PRECISION: usize = 2;

// ========================================================================================
//                                    Error handling
// ========================================================================================

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("I/O error during pipeline execution: {0}")]
    Io(String),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Labels(#[from] LabelError),
    #[error(transparent)]
    Regions(#[from] RegionParseError),
    #[error(transparent)]
    Trend(#[from] TrendTestError),
    #[error(transparent)]
    ListFormat(#[from] ListFormatError),
    #[error("{origin}, line {line_number}: {source}\n  offending line: {line}")]
    Decode {
        origin: String,
        line_number: usize,
        line: String,
        source: RecordDecodeError,
    },
}

impl From<io::Error> for PipelineError {
    fn from(e: io::Error) -> Self {
        PipelineError::Io(e.to_string())
    }
}

// ========================================================================================
//                                    Configuration
// ========================================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct SegregationConfig {
    pub min_maf: f64,
    pub max_no_calls: u32,
    pub ignore_phase: bool,
    /// Empty means the whole genome.
    pub regions: Vec<Region>,
}

impl Default for SegregationConfig {
    fn default() -> Self {
        Self {
            min_maf: DEFAULT_SEGREGATION_MIN_MAF,
            max_no_calls: DEFAULT_SEGREGATION_MAX_NO_CALLS,
            ignore_phase: false,
            regions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoringConfig {
    pub min_maf: f64,
    pub max_no_calls: u32,
    pub ignore_phase: bool,
    pub regions: Vec<Region>,
    pub caps: InclusionCaps,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            min_maf: DEFAULT_SCORING_MIN_MAF,
            max_no_calls: DEFAULT_SCORING_MAX_NO_CALLS,
            ignore_phase: false,
            regions: Vec::new(),
            caps: InclusionCaps::default(),
        }
    }
}

// ========================================================================================
//                                   Progress reporting
// ========================================================================================

pub(crate) fn create_spinner(message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(None, draw_target);
    pb.set_style(
        ProgressStyle::with_template("> [{elapsed_precise}] {spinner} {pos} loci {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(200));
    pb
}

/// One query per region, or a single full scan when no regions are given.
fn open_queries<'a>(
    source: &'a dyn VariantSource,
    regions: &'a [Region],
) -> Box<dyn Iterator<Item = Result<ScopedQuery, SourceError>> + 'a> {
    if regions.is_empty() {
        Box::new(std::iter::once_with(move || source.scan()))
    } else {
        Box::new(regions.iter().map(move |region| source.query(region)))
    }
}

// ========================================================================================
//                                  The segregation pass
// ========================================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegregationSummary {
    pub loci_seen: u64,
    pub emitted: u64,
    pub too_many_no_calls: u64,
    pub below_min_maf: u64,
    pub no_categories: u64,
    /// Emitted loci whose test had no variance; their p-value was written as 1.0.
    pub degenerate: u64,
    /// Loci whose genotype categories cannot be written unambiguously, such as
    /// phased diploid calls next to haploid calls on a sex chromosome.
    pub unencodable: u64,
}

impl SegregationSummary {
    fn record_rejection(&mut self, rejection: &TableRejection) {
        match rejection {
            TableRejection::TooManyNoCalls { .. } => self.too_many_no_calls += 1,
            TableRejection::BelowMinMaf { .. } => self.below_min_maf += 1,
            TableRejection::NoCategories => self.no_categories += 1,
        }
    }
}

impl fmt::Display for SegregationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let emitted_fraction = if self.loci_seen == 0 {
            0.0
        } else {
            self.emitted as f64 / self.loci_seen as f64
        };
        write!(
            f,
            "{} loci read, {} emitted ({}), {} over the no-call limit, {} below minimum MAF, \
             {} without case/control genotypes, {} with unencodable genotypes, \
             {} degenerate tests",
            self.loci_seen,
            self.emitted,
            format_percent(emitted_fraction, SUMMARY_PRECISION),
            self.too_many_no_calls,
            self.below_min_maf,
            self.no_categories,
            self.unencodable,
            self.degenerate,
        )
    }
}

/// Runs the association test at every locus in scope and writes one record line
/// per accepted locus to `out`, in source order.
pub fn run_segregation<W: Write>(
    source: &dyn VariantSource,
    labels: &ResolvedLabels,
    config: &SegregationConfig,
    out: &mut W,
) -> Result<SegregationSummary, PipelineError> {
    let classes = labels.classes();
    let settings = TableSettings {
        ignore_phase: config.ignore_phase,
        min_maf: config.min_maf,
        max_no_calls: config.max_no_calls,
    };
    info!(
        "Segregating {} cases and {} controls",
        classes.num_cases(),
        classes.num_controls()
    );

    let pb = create_spinner("segregating");
    let mut summary = SegregationSummary::default();

    for query in open_queries(source, &config.regions) {
        let query = query?;
        debug!("Opened query {}", query.description());
        for site in query {
            let site = site?;
            summary.loci_seen += 1;
            pb.inc(1);

            let table = match build_table(&site.calls, &classes, &settings) {
                Ok(table) => table,
                Err(rejection) => {
                    debug!("{}: rejected, {rejection}", site.locus);
                    summary.record_rejection(&rejection);
                    continue;
                }
            };

            let weights = default_weights(table.categories.len());
            let result = cochran_armitage(&table.control_row(), &table.case_row(), &weights)?;

            let record = SegregationRecord::from_table(site.locus, table, &result);
            if !record.survives_round_trip() {
                warn!(
                    "{}: genotype categories cannot be read back once written, skipping",
                    record.locus()
                );
                summary.unencodable += 1;
                continue;
            }
            if result.is_degenerate() {
                summary.degenerate += 1;
            }
            writeln!(out, "{record}")?;
            summary.emitted += 1;
        }
    }

    out.flush()?;
    pb.finish_and_clear();
    info!("Segregation complete: {summary}");
    Ok(summary)
}

// ========================================================================================
//                                    The scoring pass
// ========================================================================================

/// Selects which persisted records take part in scoring.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordFilter {
    pub regions: Vec<Region>,
    pub max_no_calls: u32,
}

impl RecordFilter {
    pub fn accepts(&self, record: &SegregationRecord) -> bool {
        let locus = record.locus();
        in_scope(&self.regions, &locus.contig, locus.position)
            && record.no_call_count() <= self.max_no_calls
    }
}

/// True when at least two declared alleles have a called frequency strictly above
/// `min_maf`. This is a fixed threshold applied to every allele, the most common
/// one included, with no majority detection.
pub fn passes_fixed_maf_threshold(site: &VariantSite, min_maf: f64) -> bool {
    let (counts, total) = site.called_chromosome_counts();
    if total == 0 {
        return false;
    }
    counts
        .iter()
        .filter(|&&count| count as f64 / total as f64 > min_maf)
        .count()
        >= 2
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScoringSummary {
    pub records_read: u64,
    pub records_filtered: u64,
    /// Accepted records with no finite, non-zero odds ratio to score with.
    pub records_without_odds: u64,
    pub sites_scored: u64,
    pub sites_too_few_calls: u64,
    pub sites_below_maf: u64,
    pub contributions: u64,
    pub subjects_scored: u64,
}

impl fmt::Display for ScoringSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} records read, {} filtered out, {} without usable odds ratios; \
             {} sites scored, {} skipped for too few calls, {} below minimum MAF; \
             {} contributions to {} subjects",
            self.records_read,
            self.records_filtered,
            self.records_without_odds,
            self.sites_scored,
            self.sites_too_few_calls,
            self.sites_below_maf,
            self.contributions,
            self.subjects_scored,
        )
    }
}

/// Aggregates the records' log odds ratios into per-subject mean scores.
pub fn run_scoring<I>(
    records: I,
    source: &dyn VariantSource,
    labels: ResolvedLabels,
    config: &ScoringConfig,
) -> Result<(Vec<SubjectScore>, ScoringSummary), PipelineError>
where
    I: IntoIterator<Item = Result<SegregationRecord, PipelineError>>,
{
    let filter = RecordFilter {
        regions: config.regions.clone(),
        max_no_calls: config.max_no_calls,
    };
    info!("Scoring {} subjects", labels.len());
    let aggregator = RiskScoreAggregator::new(labels.into_map(), config.ignore_phase);
    let pb = create_spinner("scoring");
    let mut summary = ScoringSummary::default();

    for record in records {
        let record = record?;
        summary.records_read += 1;
        if !filter.accepts(&record) {
            summary.records_filtered += 1;
            continue;
        }

        let lookup = LocusLogOdds::from_record(&record);
        if lookup.is_empty() {
            debug!("{}: no finite odds ratios", record.locus());
            summary.records_without_odds += 1;
            continue;
        }

        let locus = record.locus();
        let query = source.query(&Region::point(locus.contig.as_str(), locus.position))?;
        for site in query {
            let site = site?;
            if site.calls.len() < 2 {
                summary.sites_too_few_calls += 1;
                continue;
            }
            if !passes_fixed_maf_threshold(&site, config.min_maf) {
                summary.sites_below_maf += 1;
                continue;
            }
            summary.contributions += aggregator.accumulate(&lookup, &site.calls) as u64;
            summary.sites_scored += 1;
        }
        pb.inc(1);
    }

    pb.finish_and_clear();
    let scores = aggregator.finalize();
    summary.subjects_scored = scores.len() as u64;
    info!("Scoring complete: {summary}");
    Ok((scores, summary))
}

/// Writes the score table: a `sample`, `label`, `score` header, then one row per
/// subject with the score in shortest round-trip form.
pub fn write_scores<W: Write>(out: &mut W, scores: &[SubjectScore]) -> io::Result<()> {
    writeln!(out, "sample\tlabel\tscore")?;
    for score in scores {
        writeln!(
            out,
            "{}\t{}\t{}",
            score.subject,
            if score.is_case { "case" } else { "ctrl" },
            format_decimal(score.score, None)
        )?;
    }
    out.flush()
}
