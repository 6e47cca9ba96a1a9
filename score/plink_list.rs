// ========================================================================================
//
//                          SEGREGATION OVER PLINK --list FILES
//
// ========================================================================================
//
// ### Purpose ###
//
// PLINK's `--list` output groups subjects by genotype. Each variant takes exactly four
// tab-separated lines, always in this order:
//
//     6  AA_A_9_30018537_FS  AA  174 174 509 509 ...    minor homozygote
//     6  AA_A_9_30018537_FS  AP  42 42 58 58 ...        heterozygote
//     6  AA_A_9_30018537_FS  PP  45 45 55 55 ...        reference homozygote
//     6  AA_A_9_30018537_FS  00  ...                    no-calls
//
// Every subject appears as a FID/IID pair of identical names, so every count is
// halved. The trend test groups the two non-reference genotypes together
// (weights 0, 1, 1 over REF, HET, HOM).

use crate::contingency::SubjectClasses;
use crate::labels::{InclusionCaps, LabelSet};
use crate::pipeline::PipelineError;
use crate::segregation::{RecordDecodeError, format_decimal};
use crate::shared::files::{HeaderRule, LineClassifier, LineKind, TextSource};
use crate::shared::files::{line_as_str, open_text_source};
use crate::trend::cochran_armitage;
use ahash::AHashSet;
use log::{debug, info};
use std::fmt;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

pub const LIST_HEADER: &str = "Contig\tID\tHET\tCaseREF\tControlREF\tCaseHET\tControlHET\tCaseHOM\tControlHOM\tCaseNC\tControlNC\tStdStat\tp\tOR";
pub const DEFAULT_LIST_MIN_MAF: f64 = 0.01;
pub const DEFAULT_LIST_MAX_NO_CALLS: u32 = 1000;

const NO_CALL_GENOTYPE: &str = "00";
const LINES_PER_VARIANT: usize = 4;
const LIST_WEIGHTS: [i32; 3] = [0, 1, 1];
const RECORD_FIELDS: usize = 14;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ListFormatError {
    #[error("{origin}, line {line_number}: expected at least 3 fields")]
    TooFewFields { origin: String, line_number: usize },
    #[error("{origin}, line {line_number}: expected id={expected} but found {found}")]
    IdMismatch {
        origin: String,
        line_number: usize,
        expected: String,
        found: String,
    },
    #[error("{origin}, line {line_number}: expected a {NO_CALL_GENOTYPE} line but found a {found} line")]
    MissingNoCallLine {
        origin: String,
        line_number: usize,
        found: String,
    },
    #[error("{origin}: the file ends partway through variant {id}")]
    TruncatedGroup { origin: String, id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListConfig {
    pub min_maf: f64,
    pub max_no_calls: u32,
}

impl Default for ListConfig {
    fn default() -> Self {
        Self {
            min_maf: DEFAULT_LIST_MIN_MAF,
            max_no_calls: DEFAULT_LIST_MAX_NO_CALLS,
        }
    }
}

/// One tested variant of a `--list` file.
#[derive(Debug, Clone, PartialEq)]
pub struct ListRecord {
    pub contig: String,
    pub id: String,
    pub het_genotype: String,
    pub case_ref: u32,
    pub control_ref: u32,
    pub case_het: u32,
    pub control_het: u32,
    pub case_hom: u32,
    pub control_hom: u32,
    pub case_nc: u32,
    pub control_nc: u32,
    pub statistic: f64,
    pub p_value: f64,
}

impl ListRecord {
    /// Allelic odds ratio: non-reference alleles in cases over controls, relative
    /// to reference homozygotes in cases over controls.
    pub fn odds_ratio(&self) -> f64 {
        let case_alleles = (self.case_het + 2 * self.case_hom) as f64;
        let control_alleles = (self.control_het + 2 * self.control_hom) as f64;
        (case_alleles / control_alleles) / (self.case_ref as f64 / self.control_ref as f64)
    }

    /// Fraction of called alleles that are non-reference. 0.0 when nothing was called.
    pub fn minor_allele_frequency(&self) -> f64 {
        let called = self.case_hom
            + self.control_hom
            + self.case_het
            + self.control_het
            + self.case_ref
            + self.control_ref;
        if called == 0 {
            return 0.0;
        }
        let minor = self.case_het + 2 * self.case_hom + self.control_het + 2 * self.control_hom;
        minor as f64 / (2 * called) as f64
    }

    pub fn encode(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            self.contig,
            self.id,
            self.het_genotype,
            self.case_ref,
            self.control_ref,
            self.case_het,
            self.control_het,
            self.case_hom,
            self.control_hom,
            self.case_nc,
            self.control_nc,
            format_decimal(self.statistic, None),
            format_decimal(self.p_value, None),
            format_decimal(self.odds_ratio(), None),
        )
    }

    /// Parses an output line. The stored odds ratio is derived, so it is only
    /// checked for being a number.
    pub fn decode(line: &str) -> Result<Self, RecordDecodeError> {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != RECORD_FIELDS {
            return Err(RecordDecodeError::FieldCount(fields.len()));
        }
        let count = |field: &'static str, index: usize| {
            fields[index]
                .parse::<u32>()
                .map_err(|_| RecordDecodeError::InvalidNumber {
                    field,
                    value: fields[index].to_string(),
                })
        };
        let float = |field: &'static str, index: usize| {
            fields[index]
                .parse::<f64>()
                .map_err(|_| RecordDecodeError::InvalidNumber {
                    field,
                    value: fields[index].to_string(),
                })
        };
        float("OR", 13)?;

        Ok(Self {
            contig: fields[0].to_string(),
            id: fields[1].to_string(),
            het_genotype: fields[2].to_string(),
            case_ref: count("CaseREF", 3)?,
            control_ref: count("ControlREF", 4)?,
            case_het: count("CaseHET", 5)?,
            control_het: count("ControlHET", 6)?,
            case_hom: count("CaseHOM", 7)?,
            control_hom: count("ControlHOM", 8)?,
            case_nc: count("CaseNC", 9)?,
            control_nc: count("ControlNC", 10)?,
            statistic: float("StdStat", 11)?,
            p_value: float("p", 12)?,
        })
    }
}

impl fmt::Display for ListRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListSummary {
    pub variants: u64,
    pub emitted: u64,
    pub no_call_rejects: u64,
    pub maf_rejects: u64,
}

impl fmt::Display for ListSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} variants, {} emitted, {} over the no-call limit, {} below minimum MAF",
            self.variants, self.emitted, self.no_call_rejects, self.maf_rejects
        )
    }
}

// ========================================================================================
//                                      Reading
// ========================================================================================

/// One `--list` line split into its parts.
struct ListLine {
    contig: String,
    id: String,
    genotype: String,
    samples: Vec<String>,
    line_number: usize,
}

struct ListReader {
    source: Box<dyn TextSource>,
    origin: String,
    classifier: LineClassifier,
    line_number: usize,
}

impl ListReader {
    fn open(path: &Path) -> Result<Self, PipelineError> {
        let source = open_text_source(path)?;
        Ok(Self {
            origin: source.name().to_string(),
            source,
            classifier: LineClassifier::new(HeaderRule::Absent),
            line_number: 0,
        })
    }

    fn next_line(&mut self) -> Result<Option<ListLine>, PipelineError> {
        while let Some(raw) = self.source.next_line()? {
            self.line_number += 1;
            let line = line_as_str(raw, &self.origin, self.line_number)?;
            if self.classifier.classify(line) != LineKind::Data {
                continue;
            }

            let mut fields = line.split('\t');
            let (Some(contig), Some(id), Some(genotype)) =
                (fields.next(), fields.next(), fields.next())
            else {
                return Err(ListFormatError::TooFewFields {
                    origin: self.origin.clone(),
                    line_number: self.line_number,
                }
                .into());
            };
            return Ok(Some(ListLine {
                contig: contig.to_string(),
                id: id.to_string(),
                genotype: genotype.to_string(),
                samples: fields.filter(|s| !s.is_empty()).map(str::to_string).collect(),
                line_number: self.line_number,
            }));
        }
        Ok(None)
    }

    /// The next four-line variant group, or `None` at a clean end of file.
    fn next_group(&mut self) -> Result<Option<[ListLine; LINES_PER_VARIANT]>, PipelineError> {
        let Some(hom) = self.next_line()? else {
            return Ok(None);
        };
        let mut rest = Vec::with_capacity(LINES_PER_VARIANT - 1);
        for _ in 1..LINES_PER_VARIANT {
            let line = self.next_line()?.ok_or_else(|| ListFormatError::TruncatedGroup {
                origin: self.origin.clone(),
                id: hom.id.clone(),
            })?;
            if line.id != hom.id {
                return Err(ListFormatError::IdMismatch {
                    origin: self.origin.clone(),
                    line_number: line.line_number,
                    expected: hom.id.clone(),
                    found: line.id,
                }
                .into());
            }
            rest.push(line);
        }

        let mut rest = rest.into_iter();
        let (Some(het), Some(reference), Some(no_calls)) = (rest.next(), rest.next(), rest.next())
        else {
            return Ok(None);
        };
        if no_calls.genotype != NO_CALL_GENOTYPE {
            return Err(ListFormatError::MissingNoCallLine {
                origin: self.origin.clone(),
                line_number: no_calls.line_number,
                found: no_calls.genotype,
            }
            .into());
        }
        Ok(Some([hom, het, reference, no_calls]))
    }
}

/// Every sample name mentioned anywhere in the file, in first-seen order.
fn collect_sample_names(path: &Path) -> Result<Vec<String>, PipelineError> {
    let mut reader = ListReader::open(path)?;
    let mut seen = AHashSet::new();
    let mut names = Vec::new();
    while let Some(line) = reader.next_line()? {
        for sample in line.samples {
            if seen.insert(sample.clone()) {
                names.push(sample);
            }
        }
    }
    Ok(names)
}

/// Case and control counts on one line, halved for the FID/IID double entry.
fn count_line(line: &ListLine, classes: &SubjectClasses) -> (u32, u32) {
    let (mut cases, mut controls) = (0u32, 0u32);
    for sample in &line.samples {
        if classes.cases.contains(sample.as_str()) {
            cases += 1;
        } else if classes.controls.contains(sample.as_str()) {
            controls += 1;
        }
    }
    (cases / 2, controls / 2)
}

// ========================================================================================
//                                     The pass
// ========================================================================================

/// Tests every variant group in a `--list` file and writes the header followed by
/// one line per accepted variant.
pub fn run_list_segregation<W: Write>(
    path: &Path,
    labels: &LabelSet,
    config: &ListConfig,
    out: &mut W,
) -> Result<ListSummary, PipelineError> {
    let sample_names = collect_sample_names(path)?;
    let classes = labels
        .resolve_against(&sample_names, InclusionCaps::default())?
        .classes();
    info!(
        "Found {} cases and {} controls in {}",
        classes.num_cases(),
        classes.num_controls(),
        path.display()
    );

    writeln!(out, "{LIST_HEADER}")?;
    let mut reader = ListReader::open(path)?;
    let mut summary = ListSummary::default();

    while let Some([hom, het, reference, no_calls]) = reader.next_group()? {
        summary.variants += 1;
        let (case_hom, control_hom) = count_line(&hom, &classes);
        let (case_het, control_het) = count_line(&het, &classes);
        let (case_ref, control_ref) = count_line(&reference, &classes);
        let (case_nc, control_nc) = count_line(&no_calls, &classes);

        if case_nc + control_nc > config.max_no_calls {
            debug!("{}: {} no-calls", hom.id, case_nc + control_nc);
            summary.no_call_rejects += 1;
            continue;
        }

        let mut record = ListRecord {
            contig: hom.contig,
            id: hom.id,
            het_genotype: het.genotype,
            case_ref,
            control_ref,
            case_het,
            control_het,
            case_hom,
            control_hom,
            case_nc,
            control_nc,
            statistic: f64::NAN,
            p_value: f64::NAN,
        };
        let maf = record.minor_allele_frequency();
        if maf < config.min_maf {
            debug!("{}: MAF {maf}", record.id);
            summary.maf_rejects += 1;
            continue;
        }

        let result = cochran_armitage(
            &[control_ref, control_het, control_hom],
            &[case_ref, case_het, case_hom],
            &LIST_WEIGHTS,
        )?;
        record.statistic = result.statistic;
        record.p_value = result.emitted_p_value();
        writeln!(out, "{record}")?;
        summary.emitted += 1;
    }

    out.flush()?;
    info!("List segregation complete: {summary}");
    Ok(summary)
}
