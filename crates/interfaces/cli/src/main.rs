use std::io::{self, BufRead, Write};

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tutor_agent::{QuestionId, StudentId, StudentInput};
use tutor_config::TutoringConfig;
use tutor_runtime::TutoringService;

/// Manual end-to-end exercise of a tutoring session: reads one student
/// question up front, then one line of student input per turn from stdin,
/// printing the resulting tutor response until the student types "quit".
#[derive(Debug, Parser)]
#[command(name = "tutor-cli", version, about = "Drive a tutoring session from the terminal")]
struct Cli {
    /// Path to a TOML config file; falls back to defaults if absent.
    #[arg(long, default_value = "config/tutor.toml")]
    config: String,

    /// The question the student is working through.
    #[arg(long, default_value = "Solve for x: 3x + 5 = 20")]
    question: String,

    /// The standard (never shown to the student) solution.
    #[arg(long, default_value = "x = 5")]
    solution: String,

    /// Comma-separated required concepts for this question.
    #[arg(long, default_value = "linear_eq")]
    concepts: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = TutoringConfig::load_from(&cli.config).context("loading tutor config")?;
    let service = TutoringService::new(config);

    let required_concepts = cli
        .concepts
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(String::from)
        .collect();

    let start = service
        .start(
            QuestionId("demo-question".into()),
            StudentId("demo-student".into()),
            cli.question,
            cli.solution,
            required_concepts,
        )
        .await;

    println!("tutor> {}", start.initial_message);

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    for line in stdin.lock().lines() {
        let line = line.context("reading stdin")?;
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text.eq_ignore_ascii_case("quit") {
            break;
        }

        let response = service
            .input(StudentInput {
                session_id: start.session_id.clone(),
                text: text.to_string(),
                audio_features: None,
            })
            .await?;

        println!("tutor> {}", response.text);
        if let Some(level) = response.hint_level {
            println!("       (hint level {level})");
        }
        if response.degraded {
            println!("       (degraded response — the model was unavailable)");
        }
        stdout.flush().ok();
    }

    let summary = service.end(&start.session_id).await?;
    println!(
        "\nsession ended: coverage={:.2} turns={} hints_used={}",
        summary.concept_coverage,
        summary.total_turns,
        summary.hints_used.len()
    );

    Ok(())
}
