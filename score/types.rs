// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are used in one file.

use natord::compare;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// A closed genomic interval `contig:start-end`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Region {
    pub contig: String,
    pub start: u64,
    pub end: u64,
}

impl Region {
    pub fn new(contig: impl Into<String>, start: u64, end: u64) -> Self {
        Self {
            contig: contig.into(),
            start,
            end,
        }
    }

    /// A single-base region, used for per-locus point queries.
    pub fn point(contig: impl Into<String>, position: u64) -> Self {
        Self::new(contig, position, position)
    }

    /// The whole of one contig.
    pub fn whole_contig(contig: impl Into<String>) -> Self {
        Self::new(contig, 0, u64::MAX)
    }

    #[inline]
    pub fn contains(&self, contig: &str, position: u64) -> bool {
        contig == self.contig && position >= self.start && position <= self.end
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == 0 && self.end == u64::MAX {
            write!(f, "{}", self.contig)
        } else {
            write!(f, "{}:{}-{}", self.contig, self.start, self.end)
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegionParseError {
    #[error("Invalid region '{0}'. Expected contig:start-end or a bare contig name.")]
    Malformed(String),
    #[error("Invalid coordinate '{value}' in region '{region}'.")]
    Coordinate { region: String, value: String },
    #[error("Region '{0}' has a start greater than its end.")]
    Inverted(String),
}

impl std::str::FromStr for Region {
    type Err = RegionParseError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let token = token.trim();
        let Some((contig, span)) = token.split_once(':') else {
            if token.is_empty() || token.contains('-') {
                return Err(RegionParseError::Malformed(token.to_string()));
            }
            return Ok(Region::whole_contig(token));
        };

        let (start_text, end_text) = span
            .split_once('-')
            .ok_or_else(|| RegionParseError::Malformed(token.to_string()))?;
        if contig.is_empty() {
            return Err(RegionParseError::Malformed(token.to_string()));
        }

        let parse_coordinate = |text: &str| {
            text.trim()
                .parse::<u64>()
                .map_err(|_| RegionParseError::Coordinate {
                    region: token.to_string(),
                    value: text.to_string(),
                })
        };
        let start = parse_coordinate(start_text)?;
        let end = parse_coordinate(end_text)?;
        if start > end {
            return Err(RegionParseError::Inverted(token.to_string()));
        }

        Ok(Region::new(contig, start, end))
    }
}

/// Parses a comma-separated list of `contig:start-end` tokens. An empty
/// string means whole-genome scope and yields no regions. Since the comma
/// separates regions, coordinates cannot use comma digit grouping.
pub fn parse_regions(text: &str) -> Result<Vec<Region>, RegionParseError> {
    text.split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::parse)
        .collect()
}

/// Returns true when `regions` is empty (whole genome) or any region covers the position.
pub fn in_scope(regions: &[Region], contig: &str, position: u64) -> bool {
    regions.is_empty() || regions.iter().any(|r| r.contains(contig, position))
}

/// A genomic position under test. Ordered by contig (natural order, so "2" sorts
/// before "10") and then by position; the id only breaks ties.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Locus {
    pub contig: String,
    pub position: u64,
    pub id: String,
}

impl Locus {
    pub fn new(contig: impl Into<String>, position: u64, id: impl Into<String>) -> Self {
        Self {
            contig: contig.into(),
            position,
            id: id.into(),
        }
    }
}

impl Ord for Locus {
    fn cmp(&self, other: &Self) -> Ordering {
        compare(&self.contig, &other.contig)
            .then(self.contig.cmp(&other.contig))
            .then(self.position.cmp(&other.position))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for Locus {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Locus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.contig, self.position, self.id)
    }
}

/// One subject's genotype at one locus, as produced by a variant source. The
/// locus itself lives on the enclosing [`VariantSite`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenotypeCall {
    /// Sample name as it appears in the variant source. Shared across all sites.
    pub subject: Arc<str>,
    /// Allele representation such as `A/T` or `A|T`.
    pub genotype: String,
    pub is_no_call: bool,
}

impl GenotypeCall {
    pub fn called(subject: Arc<str>, genotype: impl Into<String>) -> Self {
        Self {
            subject,
            genotype: genotype.into(),
            is_no_call: false,
        }
    }

    pub fn no_call(subject: Arc<str>, genotype: impl Into<String>) -> Self {
        Self {
            subject,
            genotype: genotype.into(),
            is_no_call: true,
        }
    }

    /// The individual alleles of a called genotype. A genotype without a
    /// separator is a single allele.
    pub fn alleles(&self) -> impl Iterator<Item = &str> {
        split_alleles(&self.genotype)
    }
}

/// Splits a genotype string on either phased (`|`) or unphased (`/`) separators.
pub fn split_alleles(genotype: &str) -> impl Iterator<Item = &str> {
    genotype.split(['|', '/'])
}

/// All calls observed at one locus.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantSite {
    pub locus: Locus,
    /// REF followed by ALT alleles, as declared by the source.
    pub alleles: Vec<String>,
    pub calls: Vec<GenotypeCall>,
}

impl VariantSite {
    /// Number of called chromosomes per declared allele, plus the total number of
    /// called chromosomes. Alleles observed in calls but not declared are counted
    /// toward the total only.
    pub fn called_chromosome_counts(&self) -> (Vec<u64>, u64) {
        let mut counts = vec![0u64; self.alleles.len()];
        let mut total = 0u64;
        for call in self.calls.iter().filter(|c| !c.is_no_call) {
            for allele in call.alleles() {
                total += 1;
                if let Some(idx) = self.alleles.iter().position(|a| a == allele) {
                    counts[idx] += 1;
                }
            }
        }
        (counts, total)
    }
}

/// Case and control counts for one genotype category at one locus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenotypeCounts {
    pub genotype: String,
    pub cases: u32,
    pub controls: u32,
}

impl GenotypeCounts {
    pub fn new(genotype: impl Into<String>, cases: u32, controls: u32) -> Self {
        Self {
            genotype: genotype.into(),
            cases,
            controls,
        }
    }
}

/// Case/control status of one subject, fixed for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseControlLabel {
    pub subject: String,
    pub is_case: bool,
}

impl CaseControlLabel {
    pub fn label_text(&self) -> &'static str {
        if self.is_case { "case" } else { "ctrl" }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_contains_enforces_closed_bounds() {
        let region = Region::new("6", 100, 200);

        assert!(region.contains("6", 100));
        assert!(region.contains("6", 200));
        assert!(!region.contains("6", 99));
        assert!(!region.contains("7", 150));
        assert!(!region.contains("6", 201));
    }

    #[test]
    fn parse_regions_supports_lists_and_whole_genome() {
        assert!(parse_regions("").unwrap().is_empty());
        assert!(parse_regions("  ").unwrap().is_empty());

        let regions = parse_regions("6:30000000-30100000, chrX:5-10,7").unwrap();
        assert_eq!(regions.len(), 3);
        assert_eq!(regions[0], Region::new("6", 30_000_000, 30_100_000));
        assert_eq!(regions[1], Region::new("chrX", 5, 10));
        assert_eq!(regions[2], Region::whole_contig("7"));
        assert_eq!(regions[0].to_string(), "6:30000000-30100000");
        assert_eq!(regions[2].to_string(), "7");
    }

    #[test]
    fn parse_regions_rejects_malformed_tokens() {
        assert!(matches!(
            parse_regions("6:100"),
            Err(RegionParseError::Malformed(_))
        ));
        assert!(matches!(
            parse_regions("6:abc-200"),
            Err(RegionParseError::Coordinate { .. })
        ));
        assert!(matches!(
            parse_regions("6:300-200"),
            Err(RegionParseError::Inverted(_))
        ));
        assert!(matches!(
            parse_regions("6:30,000,000-30,100,000"),
            Err(RegionParseError::Malformed(_))
        ));
    }

    #[test]
    fn region_filter_scenario() {
        let included = parse_regions("6:30000000-30100000").unwrap();
        let excluded = parse_regions("6:40000000-40100000").unwrap();
        assert!(in_scope(&included, "6", 30_018_537));
        assert!(!in_scope(&excluded, "6", 30_018_537));
        assert!(in_scope(&[], "6", 30_018_537));
    }

    #[test]
    fn loci_sort_by_natural_contig_then_position() {
        let mut loci = vec![
            Locus::new("10", 5, "c"),
            Locus::new("2", 900, "b"),
            Locus::new("2", 100, "a"),
            Locus::new("X", 1, "d"),
        ];
        loci.sort();
        let ids: Vec<&str> = loci.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn called_chromosome_counts_skip_no_calls() {
        let s: Arc<str> = Arc::from("s");
        let site = VariantSite {
            locus: Locus::new("1", 10, "rs1"),
            alleles: vec!["A".into(), "T".into()],
            calls: vec![
                GenotypeCall::called(s.clone(), "A/T"),
                GenotypeCall::called(s.clone(), "T|T"),
                GenotypeCall::no_call(s.clone(), "./."),
                GenotypeCall::called(s, "A"),
            ],
        };
        let (counts, total) = site.called_chromosome_counts();
        assert_eq!(counts, vec![2, 3]);
        assert_eq!(total, 5);
    }
}
