use std::{io::Write, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use pipeconsole::{
    config::Config,
    context::{ContextError, UserContext},
    jobs::{JobEvent, JobRegistry, JobRequest, JobService, JobStatus},
    logging::{self, LogOptions},
    supervisor::Supervisor,
};

#[derive(Parser)]
#[command(
    name = "pipeconsole-run",
    about = "Run one pipeline job to completion and print its record"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
    /// Interval between polls of the job record, in milliseconds.
    #[arg(long, default_value_t = 500, global = true)]
    poll_ms: u64,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest every allowed file under a root.
    Ingest {
        /// Discovery root; defaults to PLK_INGEST_ROOT.
        #[arg(long)]
        root: Option<PathBuf>,
        #[command(flatten)]
        identity: Identity,
    },
    /// Bootstrap, ingest the fixture set and run the validation query.
    SelfTest {
        #[command(flatten)]
        identity: Identity,
    },
}

#[derive(Args)]
struct Identity {
    /// Actor identifier.
    #[arg(long)]
    actor: Option<String>,
    /// Role; repeat or comma-separate for several.
    #[arg(long = "role", value_delimiter = ',')]
    roles: Vec<String>,
    /// Classification label.
    #[arg(long)]
    classification: Option<String>,
}

impl Identity {
    fn into_context(self) -> Result<UserContext, ContextError> {
        let defaults = UserContext::default();
        let roles = if self.roles.is_empty() {
            defaults.roles().to_vec()
        } else {
            self.roles
        };
        UserContext::new(
            self.actor.unwrap_or_else(|| defaults.actor().to_string()),
            roles,
            self.classification
                .unwrap_or_else(|| defaults.classification().to_string()),
        )
    }
}

impl Command {
    fn into_request(self) -> Result<JobRequest> {
        Ok(match self {
            Self::Ingest { root, identity } => JobRequest::ingest(
                root,
                identity.into_context().context("invalid caller context")?,
            ),
            Self::SelfTest { identity } => {
                JobRequest::self_test(identity.into_context().context("invalid caller context")?)
            }
        })
    }
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(JobStatus::Pass) => {}
        Ok(_) => std::process::exit(1),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(1);
        }
    }
}

async fn run() -> Result<JobStatus> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();
    logging::init_tracing_with(LogOptions {
        default_filter: "warn",
        file: false,
    });

    let config = Arc::new(Config::from_env().context("failed to load configuration")?);
    let runner = Arc::new(Supervisor::new(config.ingest_debug));
    let registry = JobRegistry::new(config, runner);
    let started = registry.start(cli.command.into_request()?);
    let poll = Duration::from_millis(cli.poll_ms.max(10));

    let mut printed = 0;
    let record = loop {
        let record = registry
            .get(started.id)
            .ok_or_else(|| anyhow!("job {} is no longer registered", started.id))?;
        {
            let mut stdout = std::io::stdout().lock();
            for event in &record.events[printed..] {
                writeln!(stdout, "{}", format_event(event)).context("failed to write event")?;
            }
        }
        printed = record.events.len();
        if record.status.is_terminal() {
            break record;
        }
        tokio::time::sleep(poll).await;
    };

    let json = serde_json::to_string_pretty(&record).context("failed to serialize job record")?;
    println!("{json}");
    Ok(record.status)
}

fn format_event(event: &JobEvent) -> String {
    let mut line = format!(
        "{} [{:<5}] {}: {}",
        event.ts,
        event.severity,
        event.stage_name(),
        event.message
    );
    if let Some(detail) = &event.detail {
        line.push_str(" (");
        line.push_str(detail);
        line.push(')');
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeconsole::jobs::{JobKind, Severity, Stage};
    use std::path::Path;

    #[test]
    fn parses_ingest_with_repeated_and_delimited_roles() {
        let cli = Cli::try_parse_from([
            "pipeconsole-run",
            "ingest",
            "--root",
            "/mnt/docs",
            "--actor",
            "analyst",
            "--role",
            "ENGINEER,AUDITOR",
            "--role",
            "ENGINEER",
            "--poll-ms",
            "50",
        ])
        .expect("valid arguments");
        assert_eq!(cli.poll_ms, 50);

        let request = cli.command.into_request().expect("valid request");
        assert_eq!(request.kind(), JobKind::Ingest);
        assert_eq!(request.root(), Some(Path::new("/mnt/docs")));
        assert_eq!(request.context().joined_roles(), "ENGINEER,AUDITOR");
        assert_eq!(request.context().classification(), "REFERENCE");
    }

    #[test]
    fn self_test_defaults_to_the_console_identity() {
        let cli = Cli::try_parse_from(["pipeconsole-run", "self-test"]).expect("valid arguments");
        assert_eq!(cli.poll_ms, 500);
        let request = cli.command.into_request().expect("valid request");
        assert_eq!(request.kind(), JobKind::SelfTest);
        assert_eq!(request.context(), &UserContext::default());
    }

    #[test]
    fn blank_actor_is_rejected() {
        let cli = Cli::try_parse_from(["pipeconsole-run", "ingest", "--actor", " "])
            .expect("valid arguments");
        assert!(cli.command.into_request().is_err());
    }

    #[test]
    fn events_render_on_one_line() {
        let event = JobEvent {
            ts: "2026-01-01T00:00:00Z".into(),
            stage: Some(Stage::Chunking),
            severity: Severity::Ok,
            message: "Chunked artefact a1".into(),
            detail: Some("chunks=3".into()),
        };
        assert_eq!(
            format_event(&event),
            "2026-01-01T00:00:00Z [ok   ] CHUNKING: Chunked artefact a1 (chunks=3)"
        );

        let lifecycle = JobEvent {
            stage: None,
            severity: Severity::Info,
            message: "Self-test started".into(),
            detail: None,
            ..event
        };
        assert_eq!(
            format_event(&lifecycle),
            "2026-01-01T00:00:00Z [info ] JOB: Self-test started"
        );
    }
}
