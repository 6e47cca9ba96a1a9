// ========================================================================================
//
//                              THE COMMAND LINE: SEGSCORE
//
// ========================================================================================
//
// Three subcommands, one per pass:
//
// - `segregate`: Cochran-Armitage trend test at every VCF locus in scope, one
//   segregation record per accepted locus.
// - `score`: per-subject mean log odds ratio over the loci of a segregation file.
// - `list`: the trend test over a PLINK `--list` file.
//
// Results go to stdout, or atomically to `--out`. Diagnostics go to stderr.

use clap::{CommandFactory, Parser, Subcommand};
use log::info;
use segscore::io::{VariantSource, VcfSource};
use segscore::labels::{InclusionCaps, LabelSet};
use segscore::pipeline::{
    DEFAULT_SCORING_MAX_NO_CALLS, DEFAULT_SCORING_MIN_MAF, DEFAULT_SEGREGATION_MAX_NO_CALLS,
    DEFAULT_SEGREGATION_MIN_MAF, PipelineError, ScoringConfig, SegregationConfig, run_scoring,
    run_segregation, write_scores,
};
use segscore::plink_list::{
    DEFAULT_LIST_MAX_NO_CALLS, DEFAULT_LIST_MIN_MAF, ListConfig, run_list_segregation,
};
use segscore::segregation::SegregationReader;
use segscore::shared::files::{open_text_source, write_output_atomically};
use segscore::types::parse_regions;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;

#[derive(Parser)]
#[command(
    name = "segscore",
    about = "Case/control genotype segregation and segregation-based risk scores",
    long_about = "Runs a Cochran-Armitage trend test per locus over case/control genotype \
                 calls, and aggregates the per-genotype log odds ratios of the tested loci \
                 into a mean score per subject."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Test every locus of a VCF for case/control segregation
    #[command(about = "Write one segregation record per accepted locus")]
    Segregate {
        /// VCF file (plain, .gz or .bgz)
        #[arg(value_name = "VCF")]
        vcf: PathBuf,

        /// Tab-separated subject/label file; the label `case` marks a case
        #[arg(long)]
        labels: PathBuf,

        /// Comma-separated contig:start-end regions; the whole genome if omitted
        #[arg(long)]
        regions: Option<String>,

        /// Minimum empirical minor allele frequency
        #[arg(long, default_value_t = DEFAULT_SEGREGATION_MIN_MAF)]
        min_maf: f64,

        /// Maximum no-calls per locus; 0 for no limit
        #[arg(long, default_value_t = DEFAULT_SEGREGATION_MAX_NO_CALLS)]
        max_no_calls: u32,

        /// Treat A|T, T|A and A/T as the same genotype
        #[arg(long)]
        ignore_phase: bool,

        /// Output file; stdout if omitted
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Score subjects from a segregation file and the VCF it came from
    #[command(about = "Write a mean log odds ratio per subject")]
    Score {
        /// Segregation records written by `segregate`
        #[arg(value_name = "SEG_FILE")]
        seg_file: PathBuf,

        /// VCF file (plain, .gz or .bgz)
        #[arg(value_name = "VCF")]
        vcf: PathBuf,

        /// Tab-separated subject/label file; the label `case` marks a case
        #[arg(long)]
        labels: PathBuf,

        /// Comma-separated contig:start-end regions; every record if omitted
        #[arg(long)]
        regions: Option<String>,

        /// Minimum frequency that at least two alleles must exceed at a scored site
        #[arg(long, default_value_t = DEFAULT_SCORING_MIN_MAF)]
        min_maf: f64,

        /// Skip records with more no-calls than this
        #[arg(long, default_value_t = DEFAULT_SCORING_MAX_NO_CALLS)]
        max_no_calls: u32,

        /// Score at most this many cases, first come first served
        #[arg(long, value_name = "N")]
        max_cases: Option<usize>,

        /// Score at most this many controls, first come first served
        #[arg(long, value_name = "N")]
        max_controls: Option<usize>,

        /// Treat A|T, T|A and A/T as the same genotype
        #[arg(long)]
        ignore_phase: bool,

        /// Output file; stdout if omitted
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Test every variant of a PLINK --list file for case/control segregation
    #[command(about = "Trend test over a PLINK --list file")]
    List {
        #[arg(value_name = "LIST_FILE")]
        list_file: PathBuf,

        /// Tab-separated subject/label file; the label `case` marks a case
        #[arg(long)]
        labels: PathBuf,

        /// Minimum non-reference allele frequency
        #[arg(long, default_value_t = DEFAULT_LIST_MIN_MAF)]
        min_maf: f64,

        /// Maximum no-calls per variant
        #[arg(long, default_value_t = DEFAULT_LIST_MAX_NO_CALLS)]
        max_no_calls: u32,

        /// Output file; stdout if omitted
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Print version information
    Version,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let start = Instant::now();

    let result = match cli.command {
        Some(Commands::Segregate {
            vcf,
            labels,
            regions,
            min_maf,
            max_no_calls,
            ignore_phase,
            out,
        }) => parse_regions(regions.as_deref().unwrap_or_default())
            .map_err(PipelineError::from)
            .and_then(|regions| {
                let config = SegregationConfig {
                    min_maf,
                    max_no_calls,
                    ignore_phase,
                    regions,
                };
                run_segregate(&vcf, &labels, &config, out.as_deref())
            }),
        Some(Commands::Score {
            seg_file,
            vcf,
            labels,
            regions,
            min_maf,
            max_no_calls,
            max_cases,
            max_controls,
            ignore_phase,
            out,
        }) => parse_regions(regions.as_deref().unwrap_or_default())
            .map_err(PipelineError::from)
            .and_then(|regions| {
                let config = ScoringConfig {
                    min_maf,
                    max_no_calls,
                    ignore_phase,
                    regions,
                    caps: InclusionCaps {
                        max_cases,
                        max_controls,
                    },
                };
                run_score(&seg_file, &vcf, &labels, &config, out.as_deref())
            }),
        Some(Commands::List {
            list_file,
            labels,
            min_maf,
            max_no_calls,
            out,
        }) => {
            let config = ListConfig {
                min_maf,
                max_no_calls,
            };
            run_list(&list_file, &labels, &config, out.as_deref())
        }
        Some(Commands::Version) => {
            println!("segscore {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => {
            let _ = Cli::command().print_help();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
    info!("Finished in {:.2?}", start.elapsed());
}

/// Runs `produce` against stdout, or against a temporary file that replaces `out`
/// only once `produce` succeeds.
fn write_to<T>(
    out: Option<&Path>,
    produce: impl FnOnce(&mut dyn Write) -> Result<T, PipelineError>,
) -> Result<T, PipelineError> {
    match out {
        None => {
            let stdout = io::stdout();
            let mut writer = BufWriter::new(stdout.lock());
            let produced = produce(&mut writer)?;
            writer.flush()?;
            Ok(produced)
        }
        Some(path) => {
            let mut produced = None;
            write_output_atomically(path, |writer| {
                produced = Some(produce(writer)?);
                Ok::<(), PipelineError>(())
            })?;
            info!("Wrote {}", path.display());
            produced.ok_or_else(|| PipelineError::Io(format!("Nothing written to {}", path.display())))
        }
    }
}

fn run_segregate(
    vcf: &Path,
    labels: &Path,
    config: &SegregationConfig,
    out: Option<&Path>,
) -> Result<(), PipelineError> {
    let labels = LabelSet::from_file(labels)?;
    let source = VcfSource::open(vcf)?;
    let resolved = labels.resolve_against(source.sample_names(), InclusionCaps::default())?;

    write_to(out, |mut writer| {
        run_segregation(&source, &resolved, config, &mut writer)
    })?;
    Ok(())
}

fn run_score(
    seg_file: &Path,
    vcf: &Path,
    labels: &Path,
    config: &ScoringConfig,
    out: Option<&Path>,
) -> Result<(), PipelineError> {
    let labels = LabelSet::from_file(labels)?;
    let source = VcfSource::open(vcf)?;
    let resolved = labels.resolve_against(source.sample_names(), config.caps)?;
    let records = SegregationReader::new(open_text_source(seg_file)?);

    let (scores, _) = run_scoring(records, &source, resolved, config)?;
    write_to(out, |mut writer| {
        write_scores(&mut writer, &scores).map_err(PipelineError::from)
    })
}

fn run_list(
    list_file: &Path,
    labels: &Path,
    config: &ListConfig,
    out: Option<&Path>,
) -> Result<(), PipelineError> {
    let labels = LabelSet::from_file(labels)?;
    write_to(out, |mut writer| {
        run_list_segregation(list_file, &labels, config, &mut writer)
    })?;
    Ok(())
}
