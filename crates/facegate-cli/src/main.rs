use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facegate_core::{
    open_store, Config, EnrollmentService, FaceIdError, IdentityStore, MatchPolicy, ModelSlot,
    VerificationService,
};
use facegate_models::{DETECTOR_MODEL_FILE, RECOGNIZER_MODEL_FILE};

#[derive(Parser)]
#[command(name = "facegate", about = "Facegate face enrollment and verification CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a face under a name
    Enroll {
        /// Name to enroll the face under
        #[arg(short, long)]
        name: String,
        /// Image file containing the face
        image: PathBuf,
    },
    /// Verify a face against enrolled identities
    Verify {
        /// Image file containing the face
        image: PathBuf,
    },
    /// List enrolled identities
    List,
    /// Remove every enrolled identity
    Clear,
    /// Show configuration, store and model status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("failed to load configuration")?;
    let store = open_store(config.store_backend, &config.store_path)
        .context("failed to open identity store")?;

    match cli.command {
        Commands::Enroll { name, image } => {
            let bytes = read_image(&image)?;
            let enrollment = EnrollmentService::new(models(&config), store, config.extraction_timeout);
            let enrolled = enrollment.enroll(Some(bytes), &name).await?;
            println!(
                "Enrolled {} ({} values) in {} ms",
                enrolled.record.name,
                enrolled.record.descriptor.len(),
                enrolled.elapsed.as_millis()
            );
        }
        Commands::Verify { image } => {
            let bytes = read_image(&image)?;
            let verification = VerificationService::new(
                models(&config),
                store,
                config.extraction_timeout,
                MatchPolicy::new(config.match_threshold),
            );
            match verification.verify(Some(bytes)).await {
                Ok(verified) => println!(
                    "Accepted: {} (distance {:.4}, confidence {:.4}) in {} ms",
                    verified.name,
                    verified.distance,
                    verified.confidence,
                    verified.elapsed.as_millis()
                ),
                Err(FaceIdError::NoMatchFound { min_distance }) => {
                    println!(
                        "Rejected: closest distance {min_distance:.4} is not below threshold {:.4}",
                        config.match_threshold
                    );
                    std::process::exit(1);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::List => {
            let records = store.load_all()?;
            if records.is_empty() {
                println!("No identities enrolled");
            }
            for (i, record) in records.iter().enumerate() {
                println!(
                    "{:>4}  {:<24} {:>4} values  {}",
                    i + 1,
                    record.name,
                    record.descriptor.len(),
                    record.enrolled_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
                );
            }
        }
        Commands::Clear => {
            store.clear()?;
            println!("Identity store cleared");
        }
        Commands::Status => print_status(&config, store.as_ref()),
    }

    Ok(())
}

fn models(config: &Config) -> Arc<ModelSlot> {
    Arc::new(ModelSlot::new(facegate_models::loader(config.model_dir.clone())))
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read image {}", path.display()))
}

fn print_status(config: &Config, store: &dyn IdentityStore) {
    println!("store:     {:?} at {}", config.store_backend, config.store_path.display());
    match store.load_all() {
        Ok(records) => println!("enrolled:  {}", records.len()),
        Err(e) => println!("enrolled:  unavailable ({e})"),
    }
    println!("threshold: {}", config.match_threshold);
    println!("models:    {}", config.model_dir.display());
    for file in [DETECTOR_MODEL_FILE, RECOGNIZER_MODEL_FILE] {
        let present = config.model_dir.join(file).exists();
        println!("  {file}: {}", if present { "present" } else { "missing" });
    }
}
