use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facegate_core::{EnrolledTemplate, Metric, Purpose, SessionState, VerificationOptions};

mod replay;

#[derive(Parser)]
#[command(name = "facegate", about = "Facegate face verification CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture a template from recorded observations and enroll it with the daemon
    Enroll {
        /// Subject the template belongs to
        subject: String,
        /// JSON Lines file of extractor output
        #[arg(short, long)]
        observations: PathBuf,
        /// Frames with a face required before the capture completes
        #[arg(long, default_value_t = 3)]
        min_frames: u32,
        /// Print the captured template instead of sending it to the daemon
        #[arg(long)]
        dry_run: bool,
    },
    /// Verify recorded observations through a daemon session
    Verify {
        subject: String,
        #[arg(short, long)]
        observations: PathBuf,
        /// Call site: check_in, check_out or login
        #[arg(short, long, default_value = "check_in")]
        purpose: String,
    },
    /// List a subject's templates
    List { subject: String },
    /// Remove every template for a subject
    Remove { subject: String },
    /// Set the fallback PIN for a subject
    SetPin { subject: String, pin: String },
    /// Show recent audit records
    Audit {
        #[arg(short, long)]
        subject: Option<String>,
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },
    /// Show daemon status
    Status,
    /// Run a verification locally over recorded observations (no daemon)
    Replay {
        /// JSON Lines file of extractor output
        #[arg(short, long)]
        observations: PathBuf,
        /// Enrolled template as JSON
        #[arg(short, long)]
        template: PathBuf,
        #[arg(short, long, default_value = "check_in")]
        purpose: String,
        /// TOML file of verification options
        #[arg(long)]
        config: Option<PathBuf>,
        /// Use the cosine presets instead of Euclidean distance
        #[arg(long)]
        cosine: bool,
    },
}

#[zbus::proxy(
    interface = "org.facegate.Verifier1",
    default_service = "org.facegate.Verifier1",
    default_path = "/org/facegate/Verifier1"
)]
trait Verifier {
    async fn enroll(&self, subject: &str, descriptor_json: &str) -> zbus::Result<String>;
    async fn remove_templates(&self, subject: &str) -> zbus::Result<u32>;
    async fn list_templates(&self, subject: &str) -> zbus::Result<String>;
    async fn start_session(&self, subject: &str, purpose: &str) -> zbus::Result<String>;
    async fn should_sample(&self, session_id: &str) -> zbus::Result<bool>;
    async fn submit_observation(&self, session_id: &str, observation_json: &str) -> zbus::Result<String>;
    async fn outcome(&self, session_id: &str) -> zbus::Result<String>;
    async fn close_session(&self, session_id: &str) -> zbus::Result<bool>;
    async fn set_pin(&self, subject: &str, pin: &str) -> zbus::Result<()>;
    async fn status(&self) -> zbus::Result<String>;
    async fn recent_audit(&self, subject: &str, limit: u32) -> zbus::Result<String>;
}

async fn connect() -> Result<VerifierProxy<'static>> {
    let conn = if std::env::var("FACEGATE_SESSION_BUS").is_ok() {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    VerifierProxy::new(&conn)
        .await
        .context("facegated is not reachable")
}

fn print_json(text: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(text).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn load_options(config: Option<&Path>, cosine: bool) -> Result<VerificationOptions> {
    let options = match config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str(&text).with_context(|| format!("invalid options in {}", path.display()))?
        }
        None if cosine => VerificationOptions::cosine(),
        None => VerificationOptions::default(),
    };
    options.validate()?;
    Ok(options)
}

fn load_template(path: &Path) -> Result<EnrolledTemplate> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid template in {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Enroll {
            subject,
            observations,
            min_frames,
            dry_run,
        } => {
            let lines = replay::read_observations(&observations)?;
            let options = VerificationOptions::default();
            let template = replay::capture(lines, &subject, options, min_frames)
                .await
                .context("enrollment capture failed")?;
            if dry_run {
                println!("{}", serde_json::to_string_pretty(&template)?);
                return Ok(());
            }
            let proxy = connect().await?;
            let descriptor = serde_json::to_string(&template.descriptor)?;
            let id = proxy.enroll(&subject, &descriptor).await?;
            println!("Enrolled {subject} (template {id})");
        }
        Commands::Verify {
            subject,
            observations,
            purpose,
        } => {
            let lines = replay::read_observations(&observations)?;
            let proxy = connect().await?;
            let reply: serde_json::Value = serde_json::from_str(&proxy.start_session(&subject, &purpose).await?)?;
            let Some(session_id) = reply["session_id"].as_str().map(str::to_string) else {
                bail!("daemon did not return a session id");
            };

            let mut outcome = reply["outcome"].to_string();
            for line in &lines {
                if !is_scanning(&outcome)? {
                    break;
                }
                if proxy.should_sample(&session_id).await? {
                    outcome = proxy.submit_observation(&session_id, line).await?;
                }
            }
            if is_scanning(&outcome)? {
                outcome = proxy.outcome(&session_id).await?;
            }
            print_json(&outcome)?;
            proxy.close_session(&session_id).await?;
        }
        Commands::List { subject } => {
            let proxy = connect().await?;
            print_json(&proxy.list_templates(&subject).await?)?;
        }
        Commands::Remove { subject } => {
            let proxy = connect().await?;
            let removed = proxy.remove_templates(&subject).await?;
            println!("Removed {removed} template(s) for {subject}");
        }
        Commands::SetPin { subject, pin } => {
            let proxy = connect().await?;
            proxy.set_pin(&subject, &pin).await?;
            println!("Fallback PIN set for {subject}");
        }
        Commands::Audit { subject, limit } => {
            let proxy = connect().await?;
            let records = proxy
                .recent_audit(subject.as_deref().unwrap_or(""), limit)
                .await?;
            print_json(&records)?;
        }
        Commands::Status => {
            let proxy = connect().await?;
            print_json(&proxy.status().await?)?;
        }
        Commands::Replay {
            observations,
            template,
            purpose,
            config,
            cosine,
        } => {
            let purpose: Purpose = purpose.parse()?;
            let options = load_options(config.as_deref(), cosine)?;
            let template = load_template(&template)?;
            if cosine && options.metric != Metric::Cosine {
                tracing::warn!("--cosine ignored: options file sets the metric");
            }
            let lines = replay::read_observations(&observations)?;
            let outcome = replay::verify(lines, template, purpose, options).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
    }

    Ok(())
}

fn is_scanning(outcome_json: &str) -> Result<bool> {
    let value: serde_json::Value = serde_json::from_str(outcome_json)?;
    let state: SessionState = serde_json::from_value(value["state"].clone())?;
    Ok(state.is_active())
}
