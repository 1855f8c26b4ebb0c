//! Command-line client for the orchestrator API.

mod client;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::client::ApiClient;
use crate::output::{ellipsize, render_table};

#[derive(Parser)]
#[command(name = "ampx", version, about = "Client for the task orchestrator API")]
struct Cli {
    /// Base URL of the orchestrator API.
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    server: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new task.
    Create {
        /// Repository URL or owner/repo shorthand.
        repo: String,
        /// Prompt for the generator.
        prompt: String,
    },
    /// List tasks.
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        repo: Option<String>,
        #[arg(long)]
        limit: Option<i64>,
        #[arg(long)]
        offset: Option<i64>,
    },
    /// Show one task in detail.
    Show { id: String },
    /// Re-queue a suspended task, optionally with a new prompt.
    Continue {
        id: String,
        #[arg(long)]
        prompt: Option<String>,
    },
    /// Abort a task.
    Abort { id: String },
    /// Stream task logs (Ctrl-C to stop).
    Logs { id: String },
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = ApiClient::new(&cli.server);

    match cli.command {
        Command::Create { repo, prompt } => {
            let created = client.create(&repo, &prompt).await?;
            println!("created task {} on branch {}", created.id, created.branch);
        }
        Command::List {
            status,
            repo,
            limit,
            offset,
        } => {
            let list = client
                .list(status.as_deref(), repo.as_deref(), limit, offset)
                .await?;
            let rows: Vec<Vec<String>> = list
                .tasks
                .iter()
                .map(|task| {
                    vec![
                        task.id.clone(),
                        task.status.clone(),
                        task.attempts.to_string(),
                        ellipsize(&task.repo, 40),
                        ellipsize(&task.prompt, 40),
                    ]
                })
                .collect();
            print!(
                "{}",
                render_table(&["ID", "STATUS", "ATTEMPTS", "REPO", "PROMPT"], &rows)
            );
            println!("{} of {} task(s)", list.tasks.len(), list.total);
        }
        Command::Show { id } => {
            let task = client.get(&id).await?;
            println!("id:         {}", task.id);
            println!("repo:       {}", task.repo);
            println!("branch:     {}", task.branch);
            println!("status:     {}", task.status);
            println!("attempts:   {}", task.attempts);
            if let Some(run_id) = task.ci_run_id {
                println!("ci run:     {run_id}");
            }
            if let Some(url) = &task.branch_url {
                println!("branch url: {url}");
            }
            if let Some(url) = &task.pr_url {
                println!("pr url:     {url}");
            }
            if !task.summary.is_empty() {
                println!("summary:    {}", task.summary);
            }
            println!("created:    {}", task.created_at);
            println!("updated:    {}", task.updated_at);
            println!("prompt:\n{}", task.prompt);
        }
        Command::Continue { id, prompt } => {
            client.update(&id, "continue", prompt.as_deref()).await?;
            println!("task {id} re-queued");
        }
        Command::Abort { id } => {
            client.update(&id, "abort", None).await?;
            println!("task {id} aborted");
        }
        Command::Logs { id } => {
            client
                .stream_logs(&id, |data| {
                    match serde_json::from_str::<serde_json::Value>(data) {
                        Ok(entry) => {
                            let ts = entry["timestamp"].as_str().unwrap_or("-");
                            let level = entry["level"].as_str().unwrap_or("info");
                            let message = entry["message"].as_str().unwrap_or(data);
                            println!("{ts} [{level}] {message}");
                        }
                        Err(_) => println!("{data}"),
                    }
                })
                .await?;
        }
    }
    Ok(())
}
