use clap::{Parser, Subcommand};
use std::path::PathBuf;
use wimrs::archive::{self, ImageNaming, WriteOptions};
use wimrs::chunked::CompressionThreshold;
use wimrs::header::CompressionKind;
use wimrs::WimArchive;

#[derive(Parser)]
#[command(name = "wim", version = "1.0.0", about = "Content-addressed, chunk-compressed disk-image archive engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug log to a sibling log file (spec §6 `--debug`).
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture a directory tree into a fresh archive as image 1.
    Capture {
        src_dir: PathBuf,
        archive: PathBuf,
        #[command(flatten)]
        write: WriteArgs,
    },
    /// Append a captured directory tree as a new image in an existing archive.
    Append {
        src_dir: PathBuf,
        archive: PathBuf,
        #[command(flatten)]
        write: WriteArgs,
    },
    /// Replace one image's tree in place, keeping its index.
    Update {
        src_dir: PathBuf,
        archive: PathBuf,
        image: String,
        #[command(flatten)]
        write: WriteArgs,
    },
    /// Remove one image, renumbering the images after it.
    Delete { archive: PathBuf, image: String },
    /// Verify every referenced resource (and the optional integrity table).
    Test { archive: PathBuf, image: Option<String> },
    /// Split an archive into a set of sibling part files.
    Split {
        archive: PathBuf,
        /// Maximum size per part, in MiB.
        max_mib: u64,
    },
    /// Materialize one image's tree under a target directory.
    Apply { archive: PathBuf, image: String, target_dir: PathBuf },
    /// Print archive-level header/manifest information.
    Info { archive: PathBuf },
    /// List one image's directory tree.
    Dir { archive: PathBuf, image: String },
    /// Copy one image (or `*` for all) into another archive.
    Export {
        src_archive: PathBuf,
        image: String,
        dst_archive: PathBuf,
        #[command(flatten)]
        write: WriteArgs,
    },
    /// Inspect an archive left behind by a crashed writer and report what
    /// crash recovery found, repairing the write-in-progress bit if needed.
    Scan { archive: PathBuf },
}

#[derive(clap::Args, Clone)]
struct WriteArgs {
    /// Compression codec.
    #[arg(long, value_enum, default_value = "xpress")]
    compress: CompressArg,
    /// XML `NAME` for the image.
    #[arg(long)]
    name: Option<String>,
    /// XML `DESCRIPTION` for the image.
    #[arg(long)]
    description: Option<String>,
    /// Pathname exclusion glob (repeatable).
    #[arg(long = "exclude")]
    exclude: Vec<String>,
    /// File listing additional exclusion globs, one per line.
    #[arg(long = "xf")]
    xf: Option<PathBuf>,
    /// Codec pool size.
    #[arg(long, default_value_t = wimrs::codec::pool::DEFAULT_THREADS)]
    threads: usize,
    /// Emit the optional integrity table.
    #[arg(long)]
    check: bool,
    /// `SIZE,N,RATIO` — abort compression if gain < RATIO after 1/N of the
    /// input and the resource spans >= SIZE chunks.
    #[arg(long)]
    threshold: Option<String>,
}

#[derive(Clone, clap::ValueEnum)]
enum CompressArg {
    None,
    Xpress,
    Lzx,
}

impl WriteArgs {
    fn write_options(&self) -> Result<WriteOptions, Box<dyn std::error::Error>> {
        let compression = match self.compress {
            CompressArg::None => CompressionKind::Copy,
            CompressArg::Xpress => CompressionKind::Xpress,
            CompressArg::Lzx => CompressionKind::Lzx,
        };
        let threshold = self.threshold.as_deref().map(parse_threshold).transpose()?;
        Ok(WriteOptions { compression, threshold, threads: self.threads.max(1), integrity: self.check })
    }

    fn naming(&self) -> Result<ImageNaming, Box<dyn std::error::Error>> {
        let mut excludes = self.exclude.clone();
        if let Some(path) = &self.xf {
            let text = std::fs::read_to_string(path)?;
            excludes.extend(text.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from));
        }
        Ok(ImageNaming { name: self.name.clone(), description: self.description.clone(), excludes })
    }
}

fn parse_threshold(s: &str) -> Result<CompressionThreshold, Box<dyn std::error::Error>> {
    let parts: Vec<&str> = s.split(',').collect();
    if parts.len() != 3 {
        return Err(format!("--threshold expects SIZE,N,RATIO, got '{s}'").into());
    }
    Ok(CompressionThreshold {
        size_chunks: parts[0].parse()?,
        n: parts[1].parse()?,
        ratio: parts[2].parse()?,
    })
}

fn main() {
    let cli = Cli::parse();
    if cli.debug {
        tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).init();
    } else {
        tracing_subscriber::fmt().with_max_level(tracing::Level::WARN).init();
    }

    if let Err(e) = run(cli.command) {
        eprintln!("wim: error: {e}");
        std::process::exit(1);
    }
}

fn run(command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Capture { src_dir, archive: archive_path, write } => {
            let opts = write.write_options()?;
            let naming = write.naming()?;
            let t0 = std::time::Instant::now();
            let summary = archive::capture(&archive_path, &src_dir, &naming, &opts)?;
            report_write("Captured", &archive_path, &summary, t0.elapsed());
        }

        Commands::Append { src_dir, archive: archive_path, write } => {
            let opts = write.write_options()?;
            let naming = write.naming()?;
            let t0 = std::time::Instant::now();
            let summary = archive::append(&archive_path, &src_dir, &naming, &opts)?;
            report_write("Appended", &archive_path, &summary, t0.elapsed());
        }

        Commands::Update { src_dir, archive: archive_path, image, write } => {
            let opts = write.write_options()?;
            let t0 = std::time::Instant::now();
            let summary = archive::update(&archive_path, &image, &src_dir, &opts)?;
            report_write("Updated", &archive_path, &summary, t0.elapsed());
        }

        Commands::Delete { archive: archive_path, image } => {
            archive::delete(&archive_path, &image)?;
            println!("Deleted image {image} from {}", archive_path.display());
        }

        Commands::Test { archive: archive_path, image } => {
            let report = archive::test(&archive_path, image.as_deref())?;
            println!("Resources checked:          {}", report.resources_checked);
            println!("Resources failed:           {}", report.resources_failed);
            println!("Integrity windows checked:  {}", report.integrity_windows_checked);
            println!("Integrity windows failed:   {}", report.integrity_windows_failed);
            if report.is_clean() {
                println!("Result: OK");
            } else {
                println!("Result: CORRUPT");
                std::process::exit(1);
            }
        }

        Commands::Split { archive: archive_path, max_mib } => {
            let parts = archive::split(&archive_path, max_mib * 1024 * 1024)?;
            println!("Split into {} part(s):", parts.len());
            for p in &parts {
                println!("  {}", p.display());
            }
        }

        Commands::Apply { archive: archive_path, image, target_dir } => {
            archive::apply(&archive_path, &image, &target_dir)?;
            println!("Applied image {image} to {}", target_dir.display());
        }

        Commands::Info { archive: archive_path } => {
            let archive = WimArchive::open(&archive_path)?;
            let file_size = std::fs::metadata(&archive_path)?.len();
            println!("Path:           {}", archive_path.display());
            println!("GUID:           {}", archive.header.guid);
            println!("File size:      {file_size} B");
            println!("Part:           {} of {}", archive.header.part_number, archive.header.total_parts);
            println!("Compression:    {}", archive.header.compression().name());
            println!("Image count:    {}", archive.image_count());
            println!("Read-only:      {}", archive.header.is_read_only());
            for img in &archive.xml.images {
                println!();
                println!("Image {}:", img.index);
                if let Some(name) = &img.name {
                    println!("  Name:        {name}");
                }
                if let Some(desc) = &img.description {
                    println!("  Description: {desc}");
                }
                println!("  Directories: {}", img.dir_count);
                println!("  Files:       {}", img.file_count);
                println!("  Total bytes: {}", img.total_bytes);
            }
        }

        Commands::Dir { archive: archive_path, image } => {
            let archive = WimArchive::open(&archive_path)?;
            let index = archive.resolve_image(&image)?;
            let parsed = archive.parsed_metadata_for_image(index)?;
            let mut paths: Vec<&std::path::PathBuf> = parsed.directories.values().collect();
            for (_, entries) in parsed.by_hash.iter() {
                for (path, entry) in entries {
                    if !entry.is_directory() {
                        paths.push(path);
                    }
                }
            }
            paths.sort();
            paths.dedup();
            for p in paths {
                if !p.as_os_str().is_empty() {
                    println!("{}", p.display());
                }
            }
        }

        Commands::Export { src_archive, image, dst_archive, write } => {
            let opts = write.write_options()?;
            let t0 = std::time::Instant::now();
            let summary = archive::export(&src_archive, &image, &dst_archive, &opts)?;
            report_write("Exported", &dst_archive, &summary, t0.elapsed());
        }

        Commands::Scan { archive: archive_path } => {
            let report = wimrs::recovery::scan(&archive_path)?;
            println!("Path:                  {}", archive_path.display());
            println!("Write-in-progress:     {}", report.was_write_in_progress);
            if report.was_write_in_progress {
                println!("Prior index recovered: {}", report.prior_index_recovered);
                println!("Original size:         {} B", report.original_len);
                println!("Recovered size:        {} B", report.recovered_len);
            }
            println!("Image count:           {}", report.image_count);
        }
    }
    Ok(())
}

fn report_write(verb: &str, archive_path: &std::path::Path, summary: &wimrs::WriteSummary, elapsed: std::time::Duration) {
    println!("{verb}: {}", archive_path.display());
    println!("  Files stored:        {}", summary.files_stored);
    println!("  Files deduplicated:  {}", summary.files_deduplicated);
    println!("  Bytes in:            {}", summary.bytes_in);
    println!("  Bytes out:           {}", summary.bytes_out);
    println!("  Compression ratio:   {:.2}%", summary.ratio() * 100.0);
    println!("  Elapsed:             {:.2?}", elapsed);
}
