//! docker-forensics - recover Docker images from a mounted host filesystem
//!
//! This is the main CLI entry point.

use clap::{Parser, Subcommand};
use docker_forensics::config::DEFAULT_REPO_TAG;
use docker_forensics::error::Result;
use docker_forensics::pipeline::extract_images_parallel;
use docker_forensics::store::{DockerRoot, ImageDb};
use docker_forensics::{ExtractOptions, ForensicsError, Summary};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Recover Docker images from forensic disk images
#[derive(Parser)]
#[command(name = "docker-forensics")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Rebuild importable Docker images from an overlay2 store", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconstruct one or more images
    Extract {
        /// Mount point of the evidence filesystem
        mount_path: PathBuf,
        /// Directory that receives the reconstructed images
        output_dir: PathBuf,
        /// Image IDs, full or shortened
        #[arg(required = true)]
        image_ids: Vec<String>,
        /// Docker root, if not under a standard location in the mount
        #[arg(long)]
        docker_root: Option<PathBuf>,
        /// Repository tag for the manifest (repeatable)
        #[arg(short, long = "tag", default_value = DEFAULT_REPO_TAG)]
        tags: Vec<String>,
        /// Gzip the combined archive
        #[arg(short, long)]
        compress: bool,
        /// Images processed at once (default: number of CPUs)
        #[arg(short, long)]
        jobs: Option<usize>,
    },

    /// List images found in the image database
    Images {
        /// Mount point of the evidence filesystem
        mount_path: PathBuf,
        /// Docker root, if not under a standard location in the mount
        #[arg(long)]
        docker_root: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Extract {
            mount_path,
            output_dir,
            image_ids,
            docker_root,
            tags,
            compress,
            jobs,
        } => {
            let mut options = ExtractOptions::new(&mount_path, &output_dir)
                .repo_tags(tags)
                .compress(compress);
            if let Some(root) = docker_root {
                options = options.docker_root(root);
            }
            options.validate()?;

            let jobs = jobs.unwrap_or_else(num_cpus::get);
            let results = extract_images_parallel(Arc::new(options), image_ids, jobs).await;

            let mut failed = 0;
            let mut incomplete = 0;
            println!(
                "{:<14} {:<12} {:<8} {:<8} {:<11} {}",
                "IMAGE ID", "STATUS", "LAYERS", "MISSING", "UNREADABLE", "ARCHIVE"
            );
            for (id, result) in &results {
                match result {
                    Ok(summary) => {
                        summary.log();
                        print_summary(summary);
                        if !summary.is_complete() {
                            incomplete += 1;
                        }
                    }
                    Err(e) => {
                        failed += 1;
                        print_failure(id, e);
                    }
                }
            }

            if incomplete > 0 {
                println!();
                println!(
                    "{} image(s) rebuilt with placeholder layers; see summary.json",
                    incomplete
                );
            }
            if failed > 0 {
                return Ok(ExitCode::FAILURE);
            }
        }

        Commands::Images {
            mount_path,
            docker_root: root,
        } => {
            let root = match root {
                Some(root) => DockerRoot::new(root),
                None => DockerRoot::discover(&mount_path)?,
            };
            let images = ImageDb::new(&root).list()?;

            println!(
                "{:<14} {:<20} {:<8} {}",
                "IMAGE ID", "CREATED", "LAYERS", "TAGS"
            );
            for image in images {
                let created = image
                    .created
                    .map(|c| c.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string());
                let tags = if image.repo_tags.is_empty() {
                    "<none>".to_string()
                } else {
                    image.repo_tags.join(", ")
                };
                println!(
                    "{:<14} {:<20} {:<8} {}",
                    &image.id[..image.id.len().min(12)],
                    created,
                    image.layers,
                    tags
                );
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn print_summary(summary: &Summary) {
    println!(
        "{:<14} {:<12} {:<8} {:<8} {:<11} {}",
        &summary.image_id[..summary.image_id.len().min(12)],
        summary.status.to_string(),
        format!("{}/{}", summary.layers_resolved, summary.layers_total),
        summary.layers_missing,
        summary.unreadable_entries,
        summary.archive.display()
    );
}

fn print_failure(id: &str, error: &ForensicsError) {
    let status = if error.is_lookup_failure() {
        "NOT FOUND"
    } else {
        "FAILED"
    };
    println!("{:<14} {:<12} {}", id, status, error);
}
