// ========================================================================================
//
//                           CASE/CONTROL LABELS FOR A RUN
//
// ========================================================================================
//
// Label files are two tab-separated columns, `subject` and `label`. The label
// `case` marks a case; any other label marks a control (`ctrl` by convention).
// Labels are matched against the sample names of the variant source before a run
// starts, which is where inclusion caps are applied and missing subjects reported.

use crate::contingency::SubjectClasses;
use crate::pipeline::PipelineError;
use crate::shared::files::{HeaderRule, LineClassifier, LineKind, line_as_str, open_text_source};
use crate::types::CaseControlLabel;
use ahash::{AHashMap, AHashSet};
use log::{debug, info, warn};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

const CASE_LABEL: &str = "case";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LabelError {
    #[error("Subject '{subject}' is labelled both case and control (line {line_number}).")]
    Conflicting { subject: String, line_number: usize },
    #[error("No labelled subjects were found in '{0}'.")]
    Empty(String),
    #[error("None of the {0} labelled subjects appear in the variant source.")]
    NoneResolved(usize),
}

/// Optional first-come limits on how many cases and controls take part in a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InclusionCaps {
    pub max_cases: Option<usize>,
    pub max_controls: Option<usize>,
}

/// Labels in file order, one per subject.
#[derive(Debug, Clone, Default)]
pub struct LabelSet {
    labels: Vec<CaseControlLabel>,
}

impl LabelSet {
    pub fn from_file(path: &Path) -> Result<Self, PipelineError> {
        let mut source = open_text_source(path)?;
        let name = source.name().to_string();
        let mut classifier = LineClassifier::new(HeaderRule::Absent);
        let mut set = LabelSet::default();
        let mut seen: AHashMap<String, bool> = AHashMap::new();
        let mut line_number = 0usize;

        while let Some(raw) = source.next_line()? {
            line_number += 1;
            let line = line_as_str(raw, &name, line_number)?;
            if classifier.classify(line) != LineKind::Data {
                continue;
            }

            let fields: Vec<&str> = line.split('\t').collect();
            let [subject, label] = fields.as_slice() else {
                debug!("{name}, line {line_number}: skipping line without exactly two fields");
                continue;
            };
            let is_case = *label == CASE_LABEL;

            match seen.get(*subject) {
                Some(&previous) if previous != is_case => {
                    return Err(LabelError::Conflicting {
                        subject: subject.to_string(),
                        line_number,
                    }
                    .into());
                }
                Some(_) => continue,
                None => {
                    seen.insert(subject.to_string(), is_case);
                    set.labels.push(CaseControlLabel {
                        subject: subject.to_string(),
                        is_case,
                    });
                }
            }
        }

        if set.labels.is_empty() {
            return Err(LabelError::Empty(name).into());
        }
        info!(
            "Read {} cases and {} controls from {name}",
            set.num_cases(),
            set.num_controls()
        );
        Ok(set)
    }

    pub fn from_labels(labels: impl IntoIterator<Item = CaseControlLabel>) -> Self {
        let mut seen = AHashSet::new();
        Self {
            labels: labels
                .into_iter()
                .filter(|l| seen.insert(l.subject.clone()))
                .collect(),
        }
    }

    pub fn labels(&self) -> &[CaseControlLabel] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn num_cases(&self) -> usize {
        self.labels.iter().filter(|l| l.is_case).count()
    }

    pub fn num_controls(&self) -> usize {
        self.labels.len() - self.num_cases()
    }

    /// Matches every label to a sample name of the variant source, trying the
    /// subject id itself and then the doubled `id_id` form. Subjects found under
    /// neither name are reported and left out. Caps are applied in file order
    /// over the subjects that were found.
    pub fn resolve_against(
        &self,
        sample_names: &[String],
        caps: InclusionCaps,
    ) -> Result<ResolvedLabels, LabelError> {
        let samples: AHashSet<&str> = sample_names.iter().map(String::as_str).collect();
        let mut by_sample = AHashMap::with_capacity(self.labels.len());
        let mut missing = 0usize;
        let mut capped = 0usize;
        let (mut num_cases, mut num_controls) = (0usize, 0usize);

        for label in &self.labels {
            let doubled = format!("{0}_{0}", label.subject);
            let sample = if samples.contains(label.subject.as_str()) {
                label.subject.clone()
            } else if samples.contains(doubled.as_str()) {
                doubled
            } else {
                warn!(
                    "Subject {} (or {doubled}) not found in the variant source; excluded",
                    label.subject
                );
                missing += 1;
                continue;
            };

            let (count, cap) = if label.is_case {
                (&mut num_cases, caps.max_cases)
            } else {
                (&mut num_controls, caps.max_controls)
            };
            if cap.is_some_and(|max| *count >= max) {
                capped += 1;
                continue;
            }
            *count += 1;
            by_sample.insert(Arc::<str>::from(sample), label.clone());
        }

        if by_sample.is_empty() {
            return Err(LabelError::NoneResolved(self.labels.len()));
        }
        info!(
            "Using {num_cases} cases and {num_controls} controls present in the variant source"
        );
        if capped > 0 {
            info!("{capped} subjects left out by the case/control caps");
        }

        Ok(ResolvedLabels {
            by_sample,
            missing,
            capped,
        })
    }
}

/// Labels keyed by the sample names the variant source uses.
#[derive(Debug, Clone)]
pub struct ResolvedLabels {
    by_sample: AHashMap<Arc<str>, CaseControlLabel>,
    missing: usize,
    capped: usize,
}

impl ResolvedLabels {
    pub fn get(&self, sample: &str) -> Option<&CaseControlLabel> {
        self.by_sample.get(sample)
    }

    pub fn len(&self) -> usize {
        self.by_sample.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_sample.is_empty()
    }

    /// Labelled subjects that matched no sample name.
    pub fn missing(&self) -> usize {
        self.missing
    }

    /// Subjects found in the source but left out by the caps.
    pub fn capped(&self) -> usize {
        self.capped
    }

    /// The case and control sample-name sets used to build contingency tables.
    pub fn classes(&self) -> SubjectClasses {
        let mut classes = SubjectClasses::default();
        for (sample, label) in &self.by_sample {
            if label.is_case {
                classes.cases.insert(Arc::clone(sample));
            } else {
                classes.controls.insert(Arc::clone(sample));
            }
        }
        classes
    }

    pub fn into_map(self) -> AHashMap<Arc<str>, CaseControlLabel> {
        self.by_sample
    }
}
