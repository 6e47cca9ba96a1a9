// ========================================================================================
//
//                       LINE-ORIENTED TEXT SOURCES AND SINKS
//
// ========================================================================================
//
// ### Purpose ###
//
// Every external text format this crate touches (label files, VCF, PLINK `--list`
// files, persisted segregation records) is read through the same two pieces:
// a `TextSource` that yields raw lines regardless of compression, and a
// `LineClassifier` that decides whether a line is a comment, a blank, a header or
// data. Outputs that land on disk are written through a temporary file and renamed
// into place so a failed run never leaves a truncated result behind.

use crate::pipeline::PipelineError;
use flate2::read::MultiGzDecoder;
use log::debug;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// A trait that abstracts sequential, line-oriented access to text data,
/// regardless of whether the bytes on disk are plain or gzip-compressed.
pub trait TextSource: Send {
    fn len(&self) -> Option<u64> {
        None
    }

    /// A display name for error messages.
    fn name(&self) -> &str;

    fn next_line<'a>(&'a mut self) -> Result<Option<&'a [u8]>, PipelineError>;
}

struct LocalTextSource<R: Read + Send> {
    reader: BufReader<R>,
    line: Vec<u8>,
    line_active: bool,
    len: Option<u64>,
    path_display: String,
}

impl<R: Read + Send> LocalTextSource<R> {
    fn new(reader: R, len: Option<u64>, path: &Path) -> Self {
        Self {
            reader: BufReader::new(reader),
            line: Vec::with_capacity(1024),
            line_active: false,
            len,
            path_display: path.display().to_string(),
        }
    }
}

impl<R: Read + Send> TextSource for LocalTextSource<R> {
    fn len(&self) -> Option<u64> {
        self.len
    }

    fn name(&self) -> &str {
        &self.path_display
    }

    fn next_line<'a>(&'a mut self) -> Result<Option<&'a [u8]>, PipelineError> {
        if self.line_active {
            self.line.clear();
            self.line_active = false;
        }

        let bytes_read = self
            .reader
            .read_until(b'\n', &mut self.line)
            .map_err(|e| PipelineError::Io(format!("Error reading {}: {e}", self.path_display)))?;

        if bytes_read == 0 {
            return Ok(None);
        }

        if self.line.last() == Some(&b'\n') {
            self.line.pop();
        }
        if self.line.last() == Some(&b'\r') {
            self.line.pop();
        }

        self.line_active = true;
        Ok(Some(&self.line))
    }
}

/// Returns true when the path names a gzip (or BGZF) compressed file.
pub fn is_gzip_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz") || ext.eq_ignore_ascii_case("bgz"))
}

/// Opens a local text file for line-by-line reading. Compressed inputs are
/// decoded transparently; BGZF is a series of gzip members, so a multi-member
/// decoder handles both.
pub fn open_text_source(path: &Path) -> Result<Box<dyn TextSource>, PipelineError> {
    let file = File::open(path)
        .map_err(|e| PipelineError::Io(format!("Opening {}: {e}", path.display())))?;

    if is_gzip_path(path) {
        debug!("Decoding {} as gzip", path.display());
        Ok(Box::new(LocalTextSource::new(
            MultiGzDecoder::new(file),
            None,
            path,
        )))
    } else {
        let len = file
            .metadata()
            .map_err(|e| PipelineError::Io(format!("Metadata for {}: {e}", path.display())))?
            .len();
        Ok(Box::new(LocalTextSource::new(file, Some(len), path)))
    }
}

/// Interprets a raw line as UTF-8, naming the source and line on failure.
pub fn line_as_str<'a>(
    raw: &'a [u8],
    source_name: &str,
    line_number: usize,
) -> Result<&'a str, PipelineError> {
    std::str::from_utf8(raw).map_err(|err| {
        PipelineError::Io(format!(
            "{source_name}, line {line_number}: line is not valid UTF-8: {err}"
        ))
    })
}

// ========================================================================================
//                                 Line classification
// ========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Comment,
    Blank,
    Header,
    Data,
}

/// How a format marks its (single) header line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderRule {
    /// The format has no header; every non-comment line is data.
    Absent,
    /// The first line that is neither a comment nor blank is the header.
    FirstNonComment,
    /// The header is the first line starting with this prefix. It is checked
    /// before the comment rule, so `#CHROM` headers are not mistaken for comments.
    Prefixed(&'static str),
}

/// Classifies lines of a `#`-commented text format. Stateful only in whether the
/// header has been seen yet.
#[derive(Debug, Clone)]
pub struct LineClassifier {
    rule: HeaderRule,
    header_seen: bool,
}

impl LineClassifier {
    pub fn new(rule: HeaderRule) -> Self {
        Self {
            rule,
            header_seen: false,
        }
    }

    pub fn classify(&mut self, line: &str) -> LineKind {
        if line.trim().is_empty() {
            return LineKind::Blank;
        }

        if let HeaderRule::Prefixed(prefix) = self.rule {
            if !self.header_seen && line.starts_with(prefix) {
                self.header_seen = true;
                return LineKind::Header;
            }
        }

        if line.starts_with('#') {
            return LineKind::Comment;
        }

        if self.rule == HeaderRule::FirstNonComment && !self.header_seen {
            self.header_seen = true;
            return LineKind::Header;
        }

        LineKind::Data
    }

    pub fn header_seen(&self) -> bool {
        self.header_seen
    }
}

// ========================================================================================
//                                   Output sinks
// ========================================================================================

/// Writes `path` through a uniquely named temporary sibling, syncing and renaming
/// only after `write` succeeds. On any failure the temporary file is removed.
pub fn write_output_atomically<F, E>(path: &Path, write: F) -> Result<(), E>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<(), E>,
    E: From<io::Error>,
{
    let output_dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let output_name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("segscore_output"));

    let pid = std::process::id();
    let ts_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    let mut temp = None;
    for attempt in 0..32u32 {
        let candidate = output_dir.join(format!(
            ".{}.{}.{}.tmp",
            output_name.to_string_lossy(),
            pid,
            ts_nanos + attempt as u128
        ));
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(file) => {
                temp = Some((candidate, file));
                break;
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let (temp_path, temp_file) = temp.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!(
                "Failed to allocate a unique temporary output file in '{}'.",
                output_dir.display()
            ),
        )
    })?;

    let mut writer = BufWriter::new(temp_file);
    let write_result = write(&mut writer).and_then(|()| {
        let finish = || -> io::Result<()> {
            writer.flush()?;
            let file = writer.into_inner().map_err(io::Error::other)?;
            file.sync_all()
        };
        finish().map_err(E::from)
    });

    if let Err(err) = write_result {
        let _ = fs::remove_file(&temp_path);
        return Err(err);
    }

    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        E::from(e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use tempfile::tempdir;

    fn collect_lines(source: &mut dyn TextSource) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = source.next_line().unwrap() {
            lines.push(String::from_utf8(line.to_vec()).unwrap());
        }
        lines
    }

    #[test]
    fn classifier_separates_comments_blanks_header_and_data() {
        let mut classifier = LineClassifier::new(HeaderRule::FirstNonComment);
        assert_eq!(classifier.classify("# study accession"), LineKind::Comment);
        assert_eq!(classifier.classify("   "), LineKind::Blank);
        assert_eq!(classifier.classify("ID\tSTATUS"), LineKind::Header);
        assert_eq!(classifier.classify("s1\tcase"), LineKind::Data);
        assert!(classifier.header_seen());
    }

    #[test]
    fn prefixed_header_wins_over_comment_rule() {
        let mut classifier = LineClassifier::new(HeaderRule::Prefixed("#CHROM"));
        assert_eq!(classifier.classify("##fileformat=VCFv4.2"), LineKind::Comment);
        assert_eq!(classifier.classify("#CHROM\tPOS"), LineKind::Header);
        assert_eq!(classifier.classify("#CHROM\tPOS"), LineKind::Comment);
        assert_eq!(classifier.classify("1\t100"), LineKind::Data);
    }

    #[test]
    fn absent_rule_never_reports_a_header() {
        let mut classifier = LineClassifier::new(HeaderRule::Absent);
        assert_eq!(classifier.classify("s1\tcase"), LineKind::Data);
        assert!(!classifier.header_seen());
    }

    #[test]
    fn plain_and_gzip_sources_yield_identical_lines() {
        let dir = tempdir().unwrap();
        let contents = "a\tb\r\nc\n\nlast";
        let plain = dir.path().join("input.txt");
        fs::write(&plain, contents).unwrap();

        let gz = dir.path().join("input.txt.gz");
        let mut encoder = GzEncoder::new(File::create(&gz).unwrap(), Compression::default());
        encoder.write_all(contents.as_bytes()).unwrap();
        encoder.finish().unwrap();

        let mut plain_source = open_text_source(&plain).unwrap();
        let mut gz_source = open_text_source(&gz).unwrap();
        assert_eq!(plain_source.len(), Some(contents.len() as u64));
        assert_eq!(gz_source.len(), None);

        let expected = vec!["a\tb", "c", "", "last"];
        assert_eq!(collect_lines(plain_source.as_mut()), expected);
        assert_eq!(collect_lines(gz_source.as_mut()), expected);
    }

    #[test]
    fn atomic_writer_leaves_no_file_on_failure() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("scores.tsv");

        let failed: Result<(), io::Error> = write_output_atomically(&target, |w| {
            writeln!(w, "partial")?;
            Err(io::Error::other("boom"))
        });
        assert!(failed.is_err());
        assert!(!target.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);

        let ok: Result<(), io::Error> =
            write_output_atomically(&target, |w| writeln!(w, "sample\tlabel\tscore"));
        assert!(ok.is_ok());
        assert_eq!(fs::read_to_string(&target).unwrap(), "sample\tlabel\tscore\n");
    }
}
