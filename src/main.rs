use anyhow::Result;
use clap::Parser;
use insight_agent::agent::{Agent, AgentEvent};
use insight_agent::config::{AgentConfig, DatabaseConfig, LlmConfig};
use insight_agent::executor::{PostgresExecutor, QueryExecutor};
use insight_agent::llm::LlmClient;
use insight_agent::prompts::PromptBuilder;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "insight-agent")]
#[command(about = "Answers natural-language business questions against a relational store")]
struct Args {
    /// The business question in natural language
    question: String,

    /// Path to the prompts directory (schema.txt, examples.txt)
    #[arg(short, long, default_value = "prompts")]
    prompts_dir: PathBuf,

    /// Print per-iteration progress while the agent works
    #[arg(long)]
    stream: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let llm_config = LlmConfig::from_env()?;
    let db_config = DatabaseConfig::from_env()?;
    let agent_config = AgentConfig::from_env();

    let prompts = PromptBuilder::from_dir(&args.prompts_dir)?;
    let executor = PostgresExecutor::connect(&db_config).await?;
    executor.test_connection().await?;
    info!("database connection OK");

    let generation = LlmClient::new(llm_config, prompts);
    let agent = Agent::new(Arc::new(generation), Arc::new(executor), agent_config);

    if args.stream {
        let (sender, mut receiver) = mpsc::channel(32);
        let printer = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                render_event(&event);
            }
        });
        agent.run_query_stream(&args.question, sender).await?;
        printer.await?;
    } else {
        let outcome = agent.run_query(&args.question).await?;
        println!("{}", outcome.answer);
        println!(
            "\n({} iterations, status: {}{})",
            outcome.iterations,
            outcome.status.as_str(),
            if outcome.degraded { ", degraded" } else { "" }
        );
    }

    Ok(())
}

fn render_event(event: &AgentEvent) {
    match event {
        AgentEvent::Start { question } => println!("[start] {question}"),
        AgentEvent::IterationStart { iteration } => println!("\n[iteration {iteration}]"),
        AgentEvent::Thought { thought, .. } => println!("  thought: {thought}"),
        AgentEvent::Action { action, .. } => println!("  action: {action}"),
        AgentEvent::SqlExecuting { sql, .. } => println!("  executing: {sql}"),
        AgentEvent::SqlResult {
            success,
            row_count,
            error,
            ..
        } => {
            if *success {
                println!("  result: {row_count} rows");
            } else {
                println!("  result: failed: {}", error.as_deref().unwrap_or("unknown"));
            }
        }
        AgentEvent::AnalyzingResult { .. } => println!("  analyzing result..."),
        AgentEvent::Answer { answer, .. } => println!("  answer: {answer}"),
        AgentEvent::Error { error, .. } => println!("  error: {error}"),
        AgentEvent::Final {
            answer,
            iterations,
            status,
            degraded,
            ..
        } => {
            println!("\n[done] status: {}{}", status.as_str(), if *degraded { " (degraded)" } else { "" });
            println!("[done] iterations: {iterations}");
            println!("\n{answer}");
        }
    }
}
