// ========================================================================================
//
//                        SEGREGATION RECORDS AND THEIR TEXT FORM
//
// ========================================================================================
//
// ### Purpose ###
//
// A `SegregationRecord` is the persisted result of the association stage for one
// locus: the ordered genotype categories with their case and control counts, the
// locus MAF and no-call count, and the trend test outcome. Records are written as
// one tab-separated line each and read back, possibly many times, by the scoring
// stage, so the text form must round-trip exactly.
//
//     0      1     2  3              4    5        6            7               8     9
//     contig start id genotypes(|)   maf  nocalls  cases(|)     controls(|)     stat  p

use crate::contingency::ContingencyTable;
use crate::pipeline::PipelineError;
use crate::shared::files::{HeaderRule, LineClassifier, LineKind, TextSource, line_as_str};
use crate::trend::TrendResult;
use crate::types::{GenotypeCounts, Locus};
use itertools::Itertools;
use std::fmt;
use thiserror::Error;

const FIELD_COUNT: usize = 10;
const CATEGORY_SEPARATOR: char = '|';

// ========================================================================================
//                                 Numeric formatting
// ========================================================================================

/// Formats a float without any shared formatter state.
///
/// `None` gives the shortest representation that parses back to the identical
/// value (used for persisted records). `Some(p)` gives exactly `p` decimal places
/// for human-facing output. Non-finite values are written as `NaN`, `inf`, `-inf`.
pub fn format_decimal(value: f64, precision: Option<usize>) -> String {
    match precision {
        None => ryu::Buffer::new().format(value).to_string(),
        Some(_) if value.is_nan() => "NaN".to_string(),
        Some(places) => format!("{value:.places$}"),
    }
}

/// Formats a fraction as a percentage with `precision` decimal places.
pub fn format_percent(fraction: f64, precision: usize) -> String {
    format!("{}%", format_decimal(fraction * 100.0, Some(precision)))
}

// ========================================================================================
//                                     The record
// ========================================================================================

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordDecodeError {
    #[error("expected {FIELD_COUNT} tab-separated fields but found {0}")]
    FieldCount(usize),
    #[error("field '{field}' has invalid value '{value}'")]
    InvalidNumber { field: &'static str, value: String },
    #[error(
        "per-category fields disagree: {genotypes} genotypes, {cases} case counts, {controls} control counts"
    )]
    LengthMismatch {
        genotypes: usize,
        cases: usize,
        controls: usize,
    },
}

/// The association result for one locus. Immutable once built; the aligned
/// genotype/case/control sequences are a single ordered list of
/// [`GenotypeCounts`], so they cannot drift apart.
#[derive(Debug, Clone)]
pub struct SegregationRecord {
    locus: Locus,
    categories: Vec<GenotypeCounts>,
    maf: f64,
    no_call_count: u32,
    statistic: f64,
    p_value: f64,
}

/// Any two NaNs compare equal, so a degenerate record equals its own decode.
/// The NaN payload is not preserved by the text form.
impl PartialEq for SegregationRecord {
    fn eq(&self, other: &Self) -> bool {
        let same = |a: f64, b: f64| a == b || (a.is_nan() && b.is_nan());
        self.locus == other.locus
            && self.categories == other.categories
            && same(self.maf, other.maf)
            && self.no_call_count == other.no_call_count
            && same(self.statistic, other.statistic)
            && same(self.p_value, other.p_value)
    }
}

impl SegregationRecord {
    pub fn new(
        locus: Locus,
        categories: Vec<GenotypeCounts>,
        maf: f64,
        no_call_count: u32,
        statistic: f64,
        p_value: f64,
    ) -> Self {
        Self {
            locus,
            categories,
            maf,
            no_call_count,
            statistic,
            p_value,
        }
    }

    /// Builds the record emitted for an accepted locus. This is the emission
    /// point, so a degenerate (NaN) p-value is normalized to 1.0 here.
    pub fn from_table(locus: Locus, table: ContingencyTable, result: &TrendResult) -> Self {
        Self::new(
            locus,
            table.categories,
            table.maf,
            table.no_call_count,
            result.statistic,
            result.emitted_p_value(),
        )
    }

    #[inline]
    pub fn locus(&self) -> &Locus {
        &self.locus
    }

    #[inline]
    pub fn categories(&self) -> &[GenotypeCounts] {
        &self.categories
    }

    #[inline]
    pub fn maf(&self) -> f64 {
        self.maf
    }

    #[inline]
    pub fn no_call_count(&self) -> u32 {
        self.no_call_count
    }

    #[inline]
    pub fn statistic(&self) -> f64 {
        self.statistic
    }

    #[inline]
    pub fn p_value(&self) -> f64 {
        self.p_value
    }

    /// Odds of being a case in category `index` relative to the pooled odds of
    /// every other category at this locus:
    ///
    /// `(cases[g] / controls[g]) / (Σ_{g'≠g} cases / Σ_{g'≠g} controls)`
    ///
    /// Plain IEEE arithmetic: a zero denominator gives ±infinity (or NaN for
    /// 0/0). Callers taking logarithms must screen these out.
    pub fn odds_ratio_at(&self, index: usize) -> f64 {
        let target = &self.categories[index];
        let (other_cases, other_controls) = self
            .categories
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != index)
            .fold((0u64, 0u64), |(cases, controls), (_, c)| {
                (cases + c.cases as u64, controls + c.controls as u64)
            });

        (target.cases as f64 / target.controls as f64)
            / (other_cases as f64 / other_controls as f64)
    }

    /// The odds ratio of a named category, or `None` if the locus has no such category.
    pub fn odds_ratio(&self, genotype: &str) -> Option<f64> {
        self.categories
            .iter()
            .position(|c| c.genotype == genotype)
            .map(|index| self.odds_ratio_at(index))
    }

    /// `log10` of every odds ratio that is finite and non-zero, in category order.
    pub fn log_odds_ratios(&self) -> Vec<(String, f64)> {
        (0..self.categories.len())
            .filter_map(|index| {
                let odds_ratio = self.odds_ratio_at(index);
                (odds_ratio.is_finite() && odds_ratio != 0.0)
                    .then(|| (self.categories[index].genotype.clone(), odds_ratio.log10()))
            })
            .collect()
    }

    /// The single-line text form, with no trailing delimiter or newline.
    pub fn encode(&self) -> String {
        let genotypes = self.categories.iter().map(|c| &c.genotype).join("|");
        let cases = self.categories.iter().map(|c| c.cases).join("|");
        let controls = self.categories.iter().map(|c| c.controls).join("|");
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            self.locus.contig,
            self.locus.position,
            self.locus.id,
            genotypes,
            format_decimal(self.maf, None),
            self.no_call_count,
            cases,
            controls,
            format_decimal(self.statistic, None),
            format_decimal(self.p_value, None),
        )
    }

    /// True when `decode(encode())` rebuilds this record exactly. Fails for
    /// category lists mixing phased genotypes with haploid calls, whose `|`
    /// separators cannot be told apart once joined.
    pub fn survives_round_trip(&self) -> bool {
        Self::decode(&self.encode()).is_ok_and(|decoded| decoded == *self)
    }

    /// Parses one line produced by [`SegregationRecord::encode`].
    pub fn decode(line: &str) -> Result<Self, RecordDecodeError> {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != FIELD_COUNT {
            return Err(RecordDecodeError::FieldCount(fields.len()));
        }

        let position = parse_field::<u64>("start", fields[1])?;
        let maf = parse_field::<f64>("maf", fields[4])?;
        let no_call_count = parse_field::<u32>("nocalls", fields[5])?;
        let statistic = parse_field::<f64>("stat", fields[8])?;
        let p_value = parse_field::<f64>("p", fields[9])?;

        let cases = fields[6]
            .split(CATEGORY_SEPARATOR)
            .map(|v| parse_field::<u32>("cases", v))
            .collect::<Result<Vec<_>, _>>()?;
        let controls = fields[7]
            .split(CATEGORY_SEPARATOR)
            .map(|v| parse_field::<u32>("controls", v))
            .collect::<Result<Vec<_>, _>>()?;

        let genotype_tokens: Vec<&str> = fields[3].split(CATEGORY_SEPARATOR).collect();
        let mismatch = || RecordDecodeError::LengthMismatch {
            genotypes: genotype_tokens.len(),
            cases: cases.len(),
            controls: controls.len(),
        };
        if cases.len() != controls.len() {
            return Err(mismatch());
        }
        let genotypes = regroup_genotypes(&genotype_tokens, cases.len()).ok_or_else(mismatch)?;

        let categories = genotypes
            .into_iter()
            .zip(cases)
            .zip(controls)
            .map(|((genotype, cases), controls)| GenotypeCounts {
                genotype,
                cases,
                controls,
            })
            .collect();

        Ok(Self::new(
            Locus::new(fields[0], position, fields[2]),
            categories,
            maf,
            no_call_count,
            statistic,
            p_value,
        ))
    }
}

impl fmt::Display for SegregationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

fn parse_field<T: std::str::FromStr>(
    field: &'static str,
    value: &str,
) -> Result<T, RecordDecodeError> {
    value
        .parse::<T>()
        .map_err(|_| RecordDecodeError::InvalidNumber {
            field,
            value: value.to_string(),
        })
}

/// Rebuilds `expected` genotype categories from the `|`-split genotype field.
///
/// Phased genotypes use `|` internally, so `A|T|A|A` is two categories, not four.
/// Tokens containing `/` are whole unphased genotypes; the remaining tokens are
/// phased alleles (or haploid calls) and are regrouped assuming one ploidy for
/// all of them. Returns `None` when no consistent grouping exists.
fn regroup_genotypes(tokens: &[&str], expected: usize) -> Option<Vec<String>> {
    if tokens.len() == expected {
        return Some(tokens.iter().map(|t| t.to_string()).collect());
    }

    let standalone = tokens.iter().filter(|t| t.contains('/')).count();
    let phased_tokens = tokens.len() - standalone;
    let phased_groups = expected.checked_sub(standalone)?;
    if phased_groups == 0 || phased_tokens % phased_groups != 0 {
        return None;
    }
    let ploidy = phased_tokens / phased_groups;

    let mut genotypes = Vec::with_capacity(expected);
    let mut pending: Vec<&str> = Vec::with_capacity(ploidy);
    for token in tokens {
        if token.contains('/') {
            if !pending.is_empty() {
                return None;
            }
            genotypes.push(token.to_string());
        } else {
            pending.push(token);
            if pending.len() == ploidy {
                genotypes.push(pending.join("|"));
                pending.clear();
            }
        }
    }

    (pending.is_empty() && genotypes.len() == expected).then_some(genotypes)
}

// ========================================================================================
//                                   Record reader
// ========================================================================================

/// Streams persisted records from a text source. `#` comment lines and blank
/// lines are skipped; any malformed line is fatal and reported with its number.
pub struct SegregationReader {
    source: Box<dyn TextSource>,
    source_name: String,
    classifier: LineClassifier,
    line_number: usize,
}

impl SegregationReader {
    pub fn new(source: Box<dyn TextSource>) -> Self {
        Self {
            source_name: source.name().to_string(),
            source,
            classifier: LineClassifier::new(HeaderRule::Absent),
            line_number: 0,
        }
    }

    pub fn next_record(&mut self) -> Result<Option<SegregationRecord>, PipelineError> {
        loop {
            let Some(raw) = self.source.next_line()? else {
                return Ok(None);
            };
            self.line_number += 1;
            let line = line_as_str(raw, &self.source_name, self.line_number)?;
            if self.classifier.classify(line) != LineKind::Data {
                continue;
            }

            return SegregationRecord::decode(line)
                .map(Some)
                .map_err(|source| PipelineError::Decode {
                    origin: self.source_name.clone(),
                    line_number: self.line_number,
                    line: line.to_string(),
                    source,
                });
        }
    }
}

impl Iterator for SegregationReader {
    type Item = Result<SegregationRecord, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng, rngs::StdRng};

    fn record(categories: Vec<GenotypeCounts>) -> SegregationRecord {
        SegregationRecord::new(
            Locus::new("6", 30_018_537, "AA_A_9_30018537_FS"),
            categories,
            0.125,
            3,
            2.75,
            0.005_96,
        )
    }

    #[test]
    fn encode_writes_fields_in_order_without_trailing_delimiter() {
        let rec = record(vec![
            GenotypeCounts::new("A/A", 20, 80),
            GenotypeCounts::new("A/T", 80, 20),
        ]);
        assert_eq!(
            rec.encode(),
            "6\t30018537\tAA_A_9_30018537_FS\tA/A|A/T\t0.125\t3\t20|80\t80|20\t2.75\t0.00596"
        );
        assert_eq!(rec.to_string(), rec.encode());
    }

    #[test]
    fn decode_restores_phased_categories() {
        let rec = record(vec![
            GenotypeCounts::new("A|A", 5, 40),
            GenotypeCounts::new("A|T", 7, 11),
            GenotypeCounts::new("T/T", 9, 2),
            GenotypeCounts::new("T|A", 1, 1),
        ]);
        let decoded = SegregationRecord::decode(&rec.encode()).unwrap();
        assert_eq!(decoded, rec);
    }

    #[test]
    fn decode_round_trips_random_records() {
        let pool = ["A/A", "A/T", "T/T", "AT/A", "C|G", "G|C", "G|G", "C|C"];
        let mut rng = StdRng::seed_from_u64(0x5e9);
        for _ in 0..200 {
            let k = rng.gen_range(1..=pool.len());
            let chosen: Vec<&str> = pool.choose_multiple(&mut rng, k).copied().collect();
            let categories = chosen
                .into_iter()
                .map(|g| GenotypeCounts::new(g, rng.gen_range(0..5000), rng.gen_range(0..5000)))
                .collect();
            let (statistic, p_value) = match rng.gen_range(0..4) {
                0 => (f64::NAN, 1.0),
                1 => (0.0, 1.0),
                _ => (rng.gen_range(-12.0..12.0), rng.gen_range(0.0..1.0)),
            };
            let rec = SegregationRecord::new(
                Locus::new("chr1", rng.gen_range(1..250_000_000), "rs1"),
                categories,
                rng.gen_range(0.0..0.5),
                rng.gen_range(0..100),
                statistic,
                p_value,
            );
            assert_eq!(SegregationRecord::decode(&rec.encode()).unwrap(), rec);
        }
    }

    #[test]
    fn degenerate_records_equal_their_decoded_form() {
        // Sign bit set, as 0.0 / 0.0 produces on x86.
        let negative_nan = -f64::NAN;
        let rec = SegregationRecord::new(
            Locus::new("1", 10, "rs1"),
            vec![GenotypeCounts::new("A/T", 3, 3)],
            0.5,
            0,
            negative_nan,
            1.0,
        );
        let line = rec.encode();
        assert_eq!(line, "1\t10\trs1\tA/T\t0.5\t0\t3\t3\tNaN\t1.0");
        assert_eq!(SegregationRecord::decode(&line).unwrap(), rec);
        assert!(rec.survives_round_trip());

        let other = SegregationRecord::new(
            Locus::new("1", 10, "rs1"),
            vec![GenotypeCounts::new("A/T", 3, 3)],
            0.5,
            0,
            0.0,
            1.0,
        );
        assert_ne!(rec, other);
    }

    #[test]
    fn mixed_haploid_and_phased_categories_do_not_round_trip() {
        let rec = record(vec![
            GenotypeCounts::new("A", 1, 2),
            GenotypeCounts::new("A|A", 1, 2),
            GenotypeCounts::new("A|T", 1, 0),
            GenotypeCounts::new("T", 1, 0),
        ]);
        assert!(matches!(
            SegregationRecord::decode(&rec.encode()),
            Err(RecordDecodeError::LengthMismatch { genotypes: 6, cases: 4, controls: 4 })
        ));
        assert!(!rec.survives_round_trip());

        let haploid_only = record(vec![GenotypeCounts::new("A", 3, 1), GenotypeCounts::new("T", 1, 3)]);
        assert!(haploid_only.survives_round_trip());
    }

    #[test]
    fn decode_rejects_misaligned_count_fields() {
        let line = "6\t100\trs1\tA/A|A/T\t0.1\t0\t1|2|3\t4|5\t0.5\t0.6";
        assert_eq!(
            SegregationRecord::decode(line),
            Err(RecordDecodeError::LengthMismatch {
                genotypes: 2,
                cases: 3,
                controls: 2
            })
        );

        let line = "6\t100\trs1\tA/A|A/T|T/T\t0.1\t0\t1|2\t4|5\t0.5\t0.6";
        assert!(matches!(
            SegregationRecord::decode(line),
            Err(RecordDecodeError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn decode_rejects_bad_shapes_and_numbers() {
        assert_eq!(
            SegregationRecord::decode("6\t100\trs1"),
            Err(RecordDecodeError::FieldCount(3))
        );
        assert!(matches!(
            SegregationRecord::decode("6\t100\trs1\tA/A\t0.1\t0\t-1\t4\t0.5\t0.6"),
            Err(RecordDecodeError::InvalidNumber { field: "cases", .. })
        ));
        assert!(matches!(
            SegregationRecord::decode("6\tx\trs1\tA/A\t0.1\t0\t1\t4\t0.5\t0.6"),
            Err(RecordDecodeError::InvalidNumber { field: "start", .. })
        ));
    }

    #[test]
    fn odds_ratio_compares_against_pooled_other_categories() {
        let rec = record(vec![
            GenotypeCounts::new("REF", 20, 80),
            GenotypeCounts::new("HET", 80, 20),
        ]);
        assert_relative_eq!(rec.odds_ratio("HET").unwrap(), 16.0);
        assert_relative_eq!(rec.odds_ratio("REF").unwrap(), 1.0 / 16.0);
        assert_eq!(rec.odds_ratio("HOM"), None);
    }

    #[test]
    fn swapping_case_and_control_rows_inverts_odds_ratios() {
        let counts = [(12, 40), (30, 25), (9, 3)];
        let forward = record(
            counts
                .iter()
                .enumerate()
                .map(|(i, &(cases, controls))| GenotypeCounts::new(format!("g{i}"), cases, controls))
                .collect(),
        );
        let swapped = record(
            counts
                .iter()
                .enumerate()
                .map(|(i, &(cases, controls))| GenotypeCounts::new(format!("g{i}"), controls, cases))
                .collect(),
        );
        for i in 0..counts.len() {
            assert_relative_eq!(
                forward.odds_ratio_at(i),
                1.0 / swapped.odds_ratio_at(i),
                max_relative = 1e-12
            );
        }
    }

    #[test]
    fn zero_denominators_give_infinities_that_logs_skip() {
        let rec = record(vec![
            GenotypeCounts::new("A/A", 10, 50),
            GenotypeCounts::new("A/T", 5, 0),
            GenotypeCounts::new("T/T", 0, 4),
        ]);
        assert_eq!(rec.odds_ratio("A/T"), Some(f64::INFINITY));
        assert_eq!(rec.odds_ratio("T/T"), Some(0.0));

        let logs = rec.log_odds_ratios();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].0, "A/A");
        let expected = ((10.0_f64 / 50.0) / (5.0 / 4.0)).log10();
        assert_relative_eq!(logs[0].1, expected);
    }

    #[test]
    fn formatting_is_stateless_and_precision_driven() {
        assert_eq!(format_decimal(0.1, None), "0.1");
        assert_eq!(format_decimal(1.0, None), "1.0");
        assert_eq!(format_decimal(f64::NAN, None), "NaN");
        assert_eq!(format_decimal(2.0 / 3.0, Some(3)), "0.667");
        assert_eq!(format_decimal(f64::NAN, Some(3)), "NaN");
        assert_eq!(format_percent(0.012_34, 3), "1.234%");
        let tiny = 3.2e-17;
        assert_eq!(format_decimal(tiny, None).parse::<f64>().unwrap(), tiny);
    }
}
