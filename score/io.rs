// ========================================================================================
//
//                         VARIANT SOURCES AND SCOPED QUERIES
//
// ========================================================================================
//
// ### Purpose ###
//
// The association and scoring passes never touch a file format directly. They ask a
// `VariantSource` for the sites inside a region (or for every site), and receive a
// `ScopedQuery`: an iterator of `VariantSite`s that owns whatever handle the source
// opened and releases it when dropped, on every exit path.
//
// Two sources ship with the crate:
//
// - `VcfSource` reads plain or gzip/BGZF-compressed VCF text. Plain files are indexed
//   once at open (position and byte offset of every record, per contig) so region
//   queries seek straight to the matching records. Compressed files are streamed and
//   filtered, since there is no random access into a gzip stream.
// - `MemoryVariantSource` holds sites in memory, for tests and for callers that
//   already have the calls.

use crate::shared::files::{HeaderRule, LineClassifier, LineKind, TextSource, is_gzip_path};
use crate::shared::files::{line_as_str, open_text_source};
use crate::types::{GenotypeCall, Locus, Region, VariantSite};
use ahash::AHashMap;
use log::{debug, info, warn};
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

const VCF_HEADER_PREFIX: &str = "#CHROM";
const VCF_FIXED_COLUMNS: usize = 9;
const NO_CALL_ALLELE: &str = ".";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{0}")]
    Io(String),
    #[error("{origin}, {location}: {message}")]
    Malformed {
        origin: String,
        location: String,
        message: String,
    },
    #[error("{0} has no {VCF_HEADER_PREFIX} header line")]
    MissingHeader(String),
}

// ========================================================================================
//                               Cursors and scoped queries
// ========================================================================================

/// A forward-only cursor over the sites of one query.
pub trait SiteCursor: Send {
    fn next_site(&mut self) -> Result<Option<VariantSite>, SourceError>;

    /// Releases the underlying handle. Called exactly once.
    fn close(&mut self) -> Result<(), SourceError>;
}

/// An open query. Iterating yields its sites; dropping it releases the cursor.
/// A failure while releasing is logged and otherwise ignored.
pub struct ScopedQuery {
    cursor: Option<Box<dyn SiteCursor>>,
    description: String,
}

impl ScopedQuery {
    pub fn new(cursor: Box<dyn SiteCursor>, description: impl Into<String>) -> Self {
        Self {
            cursor: Some(cursor),
            description: description.into(),
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Releases the cursor now and reports the outcome. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<(), SourceError> {
        match self.cursor.take() {
            Some(mut cursor) => cursor.close(),
            None => Ok(()),
        }
    }
}

impl Iterator for ScopedQuery {
    type Item = Result<VariantSite, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.cursor.as_mut()?.next_site().transpose()
    }
}

impl Drop for ScopedQuery {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to release query {}: {e}", self.description);
        }
    }
}

/// Anything that can answer region queries over genotype calls.
pub trait VariantSource {
    /// Sample names in column order.
    fn sample_names(&self) -> &[String];

    fn query(&self, region: &Region) -> Result<ScopedQuery, SourceError>;

    fn scan(&self) -> Result<ScopedQuery, SourceError>;
}

// ========================================================================================
//                                  VCF record parsing
// ========================================================================================

/// Parses one VCF data line into a site. GT allele indices are replaced by the
/// allele bases, keeping each separator, so `0|1` with REF A and ALT T becomes
/// `A|T`. Any `.` allele makes the call a no-call.
fn parse_vcf_record(line: &str, samples: &[Arc<str>]) -> Result<VariantSite, String> {
    let fields: Vec<&str> = line.split('\t').collect();
    let expected = if samples.is_empty() {
        fields.len().max(8)
    } else {
        VCF_FIXED_COLUMNS + samples.len()
    };
    if fields.len() < 8 || fields.len() != expected {
        return Err(format!(
            "expected {expected} columns but found {}",
            fields.len()
        ));
    }

    let position = fields[1]
        .parse::<u64>()
        .map_err(|_| format!("invalid position '{}'", fields[1]))?;

    let mut alleles = vec![fields[3].to_string()];
    if fields[4] != NO_CALL_ALLELE {
        alleles.extend(fields[4].split(',').map(str::to_string));
    }

    let gt_index = fields
        .get(8)
        .and_then(|format| format.split(':').position(|key| key == "GT"));

    let calls = samples
        .iter()
        .zip(fields.iter().skip(VCF_FIXED_COLUMNS))
        .map(|(sample, column)| {
            let gt = gt_index
                .and_then(|i| column.split(':').nth(i))
                .unwrap_or(NO_CALL_ALLELE);
            decode_gt(gt, &alleles).map(|(genotype, is_no_call)| GenotypeCall {
                subject: Arc::clone(sample),
                genotype,
                is_no_call,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(VariantSite {
        locus: Locus::new(fields[0], position, fields[2]),
        alleles,
        calls,
    })
}

fn decode_gt(gt: &str, alleles: &[String]) -> Result<(String, bool), String> {
    let mut genotype = String::with_capacity(gt.len() * 2);
    let mut token_start = 0;
    let mut is_no_call = false;

    let bytes = gt.as_bytes();
    for end in 0..=bytes.len() {
        let at_separator = end < bytes.len() && (bytes[end] == b'|' || bytes[end] == b'/');
        if end < bytes.len() && !at_separator {
            continue;
        }

        let token = &gt[token_start..end];
        if token == NO_CALL_ALLELE || token.is_empty() {
            is_no_call = true;
        } else {
            let index = token
                .parse::<usize>()
                .map_err(|_| format!("invalid GT allele '{token}' in '{gt}'"))?;
            let base = alleles
                .get(index)
                .ok_or_else(|| format!("GT allele index {index} out of range in '{gt}'"))?;
            genotype.push_str(base);
        }
        if at_separator {
            genotype.push(bytes[end] as char);
        }
        token_start = end + 1;
    }

    if is_no_call {
        Ok((gt.to_string(), true))
    } else {
        Ok((genotype, false))
    }
}

fn parse_sample_header(line: &str) -> Vec<Arc<str>> {
    line.split('\t')
        .skip(VCF_FIXED_COLUMNS)
        .map(Arc::from)
        .collect()
}

// ========================================================================================
//                                      VcfSource
// ========================================================================================

/// Record positions of a plain-text VCF, per contig, sorted by position.
#[derive(Debug, Default)]
struct OffsetIndex {
    contigs: AHashMap<String, Vec<(u64, u64)>>,
    contig_order: Vec<String>,
}

impl OffsetIndex {
    fn offsets_in(&self, region: &Region) -> Vec<u64> {
        let Some(entries) = self.contigs.get(&region.contig) else {
            return Vec::new();
        };
        let first = entries.partition_point(|&(pos, _)| pos < region.start);
        entries[first..]
            .iter()
            .take_while(|&&(pos, _)| pos <= region.end)
            .map(|&(_, offset)| offset)
            .collect()
    }
}

pub struct VcfSource {
    path: PathBuf,
    display_name: String,
    sample_names: Vec<String>,
    samples: Arc<[Arc<str>]>,
    index: Option<OffsetIndex>,
    queries_opened: AtomicUsize,
}

impl VcfSource {
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        let display_name = path.display().to_string();
        let (samples, index) = if is_gzip_path(path) {
            let mut source = open_text_source(path).map_err(|e| SourceError::Io(e.to_string()))?;
            let samples = read_vcf_header(source.as_mut())?;
            info!("{display_name} is compressed; region queries will stream the file");
            (samples, None)
        } else {
            let (samples, index) = build_offset_index(path)?;
            let records: usize = index.contigs.values().map(Vec::len).sum();
            info!(
                "Indexed {records} records on {} contigs in {display_name}",
                index.contig_order.len()
            );
            (samples, Some(index))
        };

        Ok(Self {
            path: path.to_path_buf(),
            display_name,
            sample_names: samples.iter().map(|s| s.to_string()).collect(),
            samples: samples.into(),
            index,
            queries_opened: AtomicUsize::new(0),
        })
    }

    /// Contigs in file order. Only known for plain-text files.
    pub fn contigs(&self) -> Option<&[String]> {
        self.index.as_ref().map(|i| i.contig_order.as_slice())
    }

    /// Number of queries opened so far.
    pub fn queries_opened(&self) -> usize {
        self.queries_opened.load(Ordering::Relaxed)
    }

    fn open_stream(&self, region: Option<Region>) -> Result<StreamCursor, SourceError> {
        let source = open_text_source(&self.path).map_err(|e| SourceError::Io(e.to_string()))?;
        Ok(StreamCursor {
            source: Some(source),
            origin: self.display_name.clone(),
            samples: Arc::clone(&self.samples),
            classifier: LineClassifier::new(HeaderRule::Prefixed(VCF_HEADER_PREFIX)),
            region,
            line_number: 0,
        })
    }
}

impl VariantSource for VcfSource {
    fn sample_names(&self) -> &[String] {
        &self.sample_names
    }

    fn query(&self, region: &Region) -> Result<ScopedQuery, SourceError> {
        self.queries_opened.fetch_add(1, Ordering::Relaxed);
        let description = format!("{region} in {}", self.display_name);
        let Some(index) = &self.index else {
            let cursor = self.open_stream(Some(region.clone()))?;
            return Ok(ScopedQuery::new(Box::new(cursor), description));
        };

        let offsets = index.offsets_in(region);
        debug!("{description}: {} indexed records", offsets.len());
        let reader = if offsets.is_empty() {
            None
        } else {
            let file = File::open(&self.path)
                .map_err(|e| SourceError::Io(format!("Opening {}: {e}", self.display_name)))?;
            Some(BufReader::new(file))
        };
        let cursor = SeekCursor {
            reader,
            origin: self.display_name.clone(),
            samples: Arc::clone(&self.samples),
            offsets: offsets.into_iter(),
            line: String::new(),
        };
        Ok(ScopedQuery::new(Box::new(cursor), description))
    }

    fn scan(&self) -> Result<ScopedQuery, SourceError> {
        self.queries_opened.fetch_add(1, Ordering::Relaxed);
        let cursor = self.open_stream(None)?;
        Ok(ScopedQuery::new(
            Box::new(cursor),
            format!("full scan of {}", self.display_name),
        ))
    }
}

/// Reads `##` meta lines up to and including the `#CHROM` header and returns the
/// sample names.
fn read_vcf_header(source: &mut dyn TextSource) -> Result<Vec<Arc<str>>, SourceError> {
    let origin = source.name().to_string();
    let mut classifier = LineClassifier::new(HeaderRule::Prefixed(VCF_HEADER_PREFIX));
    let mut line_number = 0usize;
    while let Some(raw) = source.next_line().map_err(|e| SourceError::Io(e.to_string()))? {
        line_number += 1;
        let line = line_as_str(raw, &origin, line_number).map_err(|e| SourceError::Io(e.to_string()))?;
        match classifier.classify(line) {
            LineKind::Header => return Ok(parse_sample_header(line)),
            LineKind::Comment | LineKind::Blank => continue,
            LineKind::Data => break,
        }
    }
    Err(SourceError::MissingHeader(origin))
}

fn build_offset_index(path: &Path) -> Result<(Vec<Arc<str>>, OffsetIndex), SourceError> {
    let origin = path.display().to_string();
    let io_error = |e: std::io::Error| SourceError::Io(format!("Reading {origin}: {e}"));
    let mut reader = BufReader::new(File::open(path).map_err(io_error)?);

    let mut samples = None;
    let mut index = OffsetIndex::default();
    let mut classifier = LineClassifier::new(HeaderRule::Prefixed(VCF_HEADER_PREFIX));
    let mut line = String::new();
    let mut offset = 0u64;
    let mut line_number = 0usize;

    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).map_err(io_error)?;
        if bytes_read == 0 {
            break;
        }
        let line_offset = offset;
        offset += bytes_read as u64;
        line_number += 1;

        let text = line.trim_end_matches(['\n', '\r']);
        match classifier.classify(text) {
            LineKind::Header => samples = Some(parse_sample_header(text)),
            LineKind::Comment | LineKind::Blank => {}
            LineKind::Data => {
                if samples.is_none() {
                    return Err(SourceError::MissingHeader(origin.clone()));
                }
                let mut columns = text.splitn(3, '\t');
                let (Some(contig), Some(pos_text)) = (columns.next(), columns.next()) else {
                    return Err(malformed(&origin, line_number, "too few columns"));
                };
                let position = pos_text.parse::<u64>().map_err(|_| {
                    malformed(&origin, line_number, &format!("invalid position '{pos_text}'"))
                })?;
                if !index.contigs.contains_key(contig) {
                    index.contig_order.push(contig.to_string());
                }
                index
                    .contigs
                    .entry(contig.to_string())
                    .or_default()
                    .push((position, line_offset));
            }
        }
    }

    let samples = samples.ok_or_else(|| SourceError::MissingHeader(origin.clone()))?;
    for entries in index.contigs.values_mut() {
        entries.sort_unstable();
    }
    Ok((samples, index))
}

fn malformed(origin: &str, line_number: usize, message: &str) -> SourceError {
    SourceError::Malformed {
        origin: origin.to_string(),
        location: format!("line {line_number}"),
        message: message.to_string(),
    }
}

/// Reads indexed records by seeking to each offset in turn.
struct SeekCursor {
    reader: Option<BufReader<File>>,
    origin: String,
    samples: Arc<[Arc<str>]>,
    offsets: std::vec::IntoIter<u64>,
    line: String,
}

impl SiteCursor for SeekCursor {
    fn next_site(&mut self) -> Result<Option<VariantSite>, SourceError> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        let Some(offset) = self.offsets.next() else {
            return Ok(None);
        };

        reader
            .seek(SeekFrom::Start(offset))
            .map_err(|e| SourceError::Io(format!("Seeking in {}: {e}", self.origin)))?;
        self.line.clear();
        reader
            .read_line(&mut self.line)
            .map_err(|e| SourceError::Io(format!("Reading {}: {e}", self.origin)))?;

        let text = self.line.trim_end_matches(['\n', '\r']);
        parse_vcf_record(text, &self.samples)
            .map(Some)
            .map_err(|message| SourceError::Malformed {
                origin: self.origin.clone(),
                location: format!("byte offset {offset}"),
                message,
            })
    }

    fn close(&mut self) -> Result<(), SourceError> {
        self.reader = None;
        Ok(())
    }
}

/// Streams every record, keeping those inside the optional region.
struct StreamCursor {
    source: Option<Box<dyn TextSource>>,
    origin: String,
    samples: Arc<[Arc<str>]>,
    classifier: LineClassifier,
    region: Option<Region>,
    line_number: usize,
}

impl SiteCursor for StreamCursor {
    fn next_site(&mut self) -> Result<Option<VariantSite>, SourceError> {
        let Some(source) = self.source.as_mut() else {
            return Ok(None);
        };

        while let Some(raw) = source.next_line().map_err(|e| SourceError::Io(e.to_string()))? {
            self.line_number += 1;
            let line = line_as_str(raw, &self.origin, self.line_number)
                .map_err(|e| SourceError::Io(e.to_string()))?;
            if self.classifier.classify(line) != LineKind::Data {
                continue;
            }

            if let Some(region) = &self.region {
                let mut columns = line.splitn(3, '\t');
                let contig = columns.next().unwrap_or_default();
                let position = columns.next().and_then(|p| p.parse::<u64>().ok());
                if let Some(position) = position {
                    if !region.contains(contig, position) {
                        continue;
                    }
                }
            }

            return parse_vcf_record(line, &self.samples)
                .map(Some)
                .map_err(|message| malformed(&self.origin, self.line_number, &message));
        }
        Ok(None)
    }

    fn close(&mut self) -> Result<(), SourceError> {
        self.source = None;
        Ok(())
    }
}

// ========================================================================================
//                                 MemoryVariantSource
// ========================================================================================

/// An in-memory source. Tracks how many of its queries are still open, which
/// lets callers verify that every query is released.
pub struct MemoryVariantSource {
    sample_names: Vec<String>,
    sites: Arc<[VariantSite]>,
    open_queries: Arc<AtomicUsize>,
}

impl MemoryVariantSource {
    pub fn new(sample_names: Vec<String>, mut sites: Vec<VariantSite>) -> Self {
        sites.sort_by(|a, b| a.locus.cmp(&b.locus));
        Self {
            sample_names,
            sites: sites.into(),
            open_queries: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn open_queries(&self) -> usize {
        self.open_queries.load(Ordering::SeqCst)
    }

    fn cursor(&self, region: Option<Region>) -> MemoryCursor {
        self.open_queries.fetch_add(1, Ordering::SeqCst);
        MemoryCursor {
            sites: Arc::clone(&self.sites),
            next: 0,
            region,
            open_queries: Arc::clone(&self.open_queries),
        }
    }
}

impl VariantSource for MemoryVariantSource {
    fn sample_names(&self) -> &[String] {
        &self.sample_names
    }

    fn query(&self, region: &Region) -> Result<ScopedQuery, SourceError> {
        Ok(ScopedQuery::new(
            Box::new(self.cursor(Some(region.clone()))),
            format!("{region} in memory"),
        ))
    }

    fn scan(&self) -> Result<ScopedQuery, SourceError> {
        Ok(ScopedQuery::new(
            Box::new(self.cursor(None)),
            "full scan in memory",
        ))
    }
}

struct MemoryCursor {
    sites: Arc<[VariantSite]>,
    next: usize,
    region: Option<Region>,
    open_queries: Arc<AtomicUsize>,
}

impl SiteCursor for MemoryCursor {
    fn next_site(&mut self) -> Result<Option<VariantSite>, SourceError> {
        while let Some(site) = self.sites.get(self.next) {
            self.next += 1;
            let in_region = self
                .region
                .as_ref()
                .is_none_or(|r| r.contains(&site.locus.contig, site.locus.position));
            if in_region {
                return Ok(Some(site.clone()));
            }
        }
        Ok(None)
    }

    fn close(&mut self) -> Result<(), SourceError> {
        self.open_queries.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}
