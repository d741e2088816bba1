use clap::{command, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget};
use itq::{
    database::persistence::SAVE_FILE, Descriptor, DistanceMethod, ItqIndex, ItqIndexOptions,
};
use pretty_duration::pretty_duration;
use std::io::{stdout, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use ticky::Stopwatch;
use tracing::info;

#[derive(Parser)]
#[command(version, about, long_about = None, arg_required_else_help(true))]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(
        about = "Build an index from files of vectors, one JSON array per line.",
        arg_required_else_help(true)
    )]
    Build {
        #[arg(long, default_value = "itq-index")]
        index_dir: PathBuf,
        #[arg(long, default_value_t = 8)]
        bits: usize,
        #[arg(long, default_value_t = 50)]
        iterations: usize,
        #[arg(long, default_value = "cosine")]
        distance: DistanceMethod,
        #[arg(long)]
        seed: Option<u64>,
        file_paths: Vec<PathBuf>,
    },
    #[command(
        about = "Query an index with vectors, each a JSON array.",
        arg_required_else_help(true)
    )]
    Query {
        #[arg(long, default_value = "itq-index")]
        index_dir: PathBuf,
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
        vectors: Vec<String>,
    },
    #[command(about = "Describe an index.")]
    Info {
        #[arg(long, default_value = "itq-index")]
        index_dir: PathBuf,
    },
    #[command(about = "Clear an index.")]
    Clear {
        #[arg(long, default_value = "itq-index")]
        index_dir: PathBuf,
    },
}

fn read_descriptors(file_paths: &[PathBuf]) -> anyhow::Result<Vec<Descriptor>> {
    let progress_bar =
        ProgressBar::with_draw_target(Some(file_paths.len().try_into()?), ProgressDrawTarget::hidden())
            .with_message(format!("Reading vectors from {} file(s).", file_paths.len()));
    let mut descriptors = Vec::new();
    for file_path in file_paths {
        let reader = BufReader::new(std::fs::File::open(file_path)?);
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            descriptors.push(Descriptor::new(serde_json::from_str(&line)?));
        }
        progress_bar.inc(1);
        if progress_bar.is_hidden() {
            progress_bar.set_draw_target(ProgressDrawTarget::stderr_with_hz(100));
        }
    }
    progress_bar.finish_and_clear();
    Ok(descriptors)
}

/// Remove the saved index in a directory, returning whether there was one.
fn clear_index(index_dir: &Path) -> anyhow::Result<bool> {
    match std::fs::remove_file(index_dir.join(SAVE_FILE)) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut sw = Stopwatch::start_new();
    let mut buffer = BufWriter::new(stdout().lock());
    match cli.command {
        Some(Commands::Build {
            index_dir,
            bits,
            iterations,
            distance,
            seed,
            file_paths,
        }) => {
            let index = ItqIndex::new(ItqIndexOptions {
                bit_length: bits,
                itq_iterations: iterations,
                distance_method: distance,
                random_seed: seed,
            })?;
            let descriptors = read_descriptors(&file_paths)?;
            info!("Read {} vector(s).", descriptors.len());
            index.build_index(descriptors)?;
            index.save_index(&index_dir)?;
            sw.stop();
            writeln!(
                buffer,
                "Indexed {} vector(s) into {} in {}.",
                index.count()?,
                index_dir.display(),
                pretty_duration(&sw.elapsed(), None)
            )?;
        }
        Some(Commands::Query {
            index_dir,
            count,
            vectors,
        }) => {
            let index = ItqIndex::new(ItqIndexOptions::default())?;
            index.load_index(&index_dir)?;
            let num_vectors = vectors.len();
            writeln!(buffer, "Querying {} vector(s).", num_vectors)?;
            for vector in vectors {
                let query: Vec<f32> = serde_json::from_str(&vector)?;
                writeln!(buffer, "Results for {}:", vector)?;
                for (rank, (descriptor, distance)) in
                    index.nn(&query, count)?.into_iter().enumerate()
                {
                    writeln!(
                        buffer,
                        "{}. \t{}\t{:?}\t{}",
                        rank + 1,
                        descriptor.id(),
                        descriptor.vector(),
                        distance
                    )?;
                }
            }
            sw.stop();
            writeln!(
                buffer,
                "Queried {} vector(s) in {}.",
                num_vectors,
                pretty_duration(&sw.elapsed(), None)
            )?;
        }
        Some(Commands::Info { index_dir }) => {
            let index = ItqIndex::new(ItqIndexOptions::default())?;
            index.load_index(&index_dir)?;
            let options = index.options();
            writeln!(buffer, "Bit length: {}", options.bit_length)?;
            writeln!(buffer, "ITQ iterations: {}", options.itq_iterations)?;
            writeln!(buffer, "Distance method: {}", options.distance_method)?;
            match options.random_seed {
                Some(seed) => writeln!(buffer, "Random seed: {}", seed)?,
                None => writeln!(buffer, "Random seed: none")?,
            }
            writeln!(buffer, "Descriptors: {}", index.count()?)?;
        }
        Some(Commands::Clear { index_dir }) => {
            writeln!(buffer, "Clearing index.")?;
            if !clear_index(&index_dir)? {
                writeln!(buffer, "No index saved in {}.", index_dir.display())?;
            }
            sw.stop();
            writeln!(
                buffer,
                "Index cleared in {}.",
                pretty_duration(&sw.elapsed(), None)
            )?;
        }
        None => unreachable!(),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_removes_saved_index() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SAVE_FILE), b"index").unwrap();
        assert!(clear_index(dir.path()).unwrap());
        assert!(!dir.path().join(SAVE_FILE).exists());
        assert!(!clear_index(dir.path()).unwrap());
    }

    #[test]
    fn clear_reports_removal_failures() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(SAVE_FILE)).unwrap();
        assert!(clear_index(dir.path()).is_err());
        assert!(dir.path().join(SAVE_FILE).exists());
    }
}
