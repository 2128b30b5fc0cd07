use eyre::{bail, Context, ContextCompat, Result};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use xvector_rs::{SpeakerVerifier, VerifierConfig};

const USAGE: &str = "Usage: xvector-rs <model_dir> <enroll <wav>... | verify <wav> | info>";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let model_dir = PathBuf::from(args.next().context(USAGE)?);
    let command = args.next().context(USAGE)?;
    let files: Vec<String> = args.collect();

    let config = VerifierConfig::from_model_dir(&model_dir)?;
    let mut verifier = SpeakerVerifier::init(&model_dir, config)?;

    match command.as_str() {
        "enroll" => {
            if files.is_empty() {
                bail!("{USAGE}");
            }
            for file in &files {
                let (samples, _) = xvector_rs::read_wav(file)?;
                verifier
                    .feed_enrolling_wave(&samples)
                    .with_context(|| format!("Failed to extract {file}"))?;
            }
            let speaker_id = verifier.commit_enrollment(0)?;
            verifier.save_enrollment()?;
            println!(
                "enrolled speaker {speaker_id} from {} file(s) into {}",
                files.len(),
                verifier.enrollment_path().display()
            );
        }
        "verify" => {
            let [file] = files.as_slice() else {
                bail!("{USAGE}");
            };
            let (samples, _) = xvector_rs::read_wav(file)?;
            let result = verifier.verify_wave(&samples)?;
            println!(
                "score = {:.4}, threshold = {:.4}, accepted = {}",
                result.score,
                verifier.threshold(),
                result.accepted
            );
            if let Some((speaker_id, score)) = result.best_match() {
                println!("closest speaker = {speaker_id} ({score:.4})");
            }
        }
        "info" => {
            println!("PLDA dimension: {}", verifier.plda().dim());
            println!("enrolled speakers: {}", verifier.enrollments().len());
            for (id, speaker) in verifier.enrollments().iter().enumerate() {
                println!("  speaker {id}: {} utterance(s)", speaker.num_utts);
            }
            println!("threshold: {}", verifier.threshold());
        }
        _ => bail!("{USAGE}"),
    }

    Ok(())
}
