//! Command-line interface for driving a Hashflow node over HTTP.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hashflow_core::{ExternalId, JobRecord, NewRecord, Record, WindowCounter};
use hashflow_engine::JobOutcome;
use humantime::parse_duration;
use rand::distr::Alphanumeric;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;

#[derive(Parser)]
#[command(author, version, about = "Hashflow CLI", long_about = None)]
struct Cli {
    /// Base URL of the running hashflow-node (e.g., http://127.0.0.1:8080)
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    api: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Trigger one aggregation run and print its outcome
    Run,
    /// List recent jobs, newest first
    Jobs {
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// Show a single job by id
    Job { id: String },
    /// Show the top tag counters
    Counts {
        /// Restrict to one window, e.g. 2024-05-01T12:00:00Z
        #[arg(long)]
        window: Option<String>,
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// List recent records, newest first
    Records {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Submit one record
    Submit {
        #[arg(long)]
        author: String,
        body: String,
        /// Defaults to a random id
        #[arg(long)]
        external_id: Option<String>,
        /// Explicit comma-separated tags; extracted from the body when omitted
        #[arg(long)]
        tags: Option<String>,
    },
    /// Post mock records at a fixed interval
    Stream {
        /// Delay between records (humantime, e.g. 2s)
        #[arg(long, default_value = "2s")]
        every: String,
        /// Stop after this many records; runs until interrupted when omitted
        #[arg(long)]
        count: Option<usize>,
    },
    /// Print the node health report
    Health,
}

/// Sample authors and bodies used by `stream`.
const MOCK_RECORDS: &[(&str, &str)] = &[
    (
        "TechGuru",
        "Breaking: New AI breakthrough in #MachineLearning and #DeepLearning #Tech",
    ),
    (
        "DataScientist",
        "Loving the new #BigData tools for #Analytics and #DataProcessing",
    ),
    (
        "CloudExpert",
        "Just deployed a massive #Kubernetes cluster with #Docker containers #DevOps",
    ),
    (
        "AIResearcher",
        "Working on #NLP models for better #TextAnalysis and #SentimentAnalysis",
    ),
    (
        "WebDev",
        "Building responsive UIs with #React #JavaScript and #TypeScript",
    ),
    (
        "MobileGuru",
        "Flutter vs React Native debate continues #Flutter #ReactNative #MobileDev",
    ),
    (
        "CyberSecPro",
        "Important security updates for #CyberSecurity and #DataProtection #InfoSec",
    ),
    (
        "StartupFounder",
        "Scaling our #Startup with #Microservices architecture #Innovation",
    ),
];

fn parse_csv(input: Option<String>) -> Option<Vec<String>> {
    input.map(|raw| {
        raw.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

fn random_external_id<R: Rng>(rng: &mut R) -> ExternalId {
    let id: String = rng
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(char::from)
        .collect();
    ExternalId::new(id.to_ascii_lowercase())
}

fn mock_record<R: Rng>(rng: &mut R) -> NewRecord {
    let (author, body) = MOCK_RECORDS[rng.random_range(0..MOCK_RECORDS.len())];
    NewRecord {
        external_id: random_external_id(rng),
        author: author.to_string(),
        body: body.to_string(),
        tags: None,
    }
}

async fn get_json<T: DeserializeOwned>(client: &Client, url: String) -> Result<T> {
    let value = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("GET {url}"))?
        .error_for_status()?
        .json()
        .await?;
    Ok(value)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(client: &Client, api: &str) -> Result<()> {
    let resp = client.post(format!("{api}/jobs/run")).send().await?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.unwrap_or_default();
        anyhow::bail!(
            "run failed ({status}): {}",
            body["error"].as_str().unwrap_or("unknown error")
        );
    }
    let outcome: JobOutcome = resp.json().await?;
    print_json(&outcome)
}

async fn submit(client: &Client, api: &str, record: NewRecord) -> Result<Option<Record>> {
    let resp = client
        .post(format!("{api}/records"))
        .json(&record)
        .send()
        .await?;
    if resp.status() == StatusCode::CONFLICT {
        return Ok(None);
    }
    Ok(Some(resp.error_for_status()?.json().await?))
}

async fn stream(client: &Client, api: &str, every: Duration, count: Option<usize>) -> Result<()> {
    let mut ticker = tokio::time::interval(every);
    let mut sent = 0usize;
    while count.map_or(true, |max| sent < max) {
        ticker.tick().await;
        let record = mock_record(&mut rand::rng());
        match submit(client, api, record).await? {
            Some(stored) => println!("{} {}: {}", stored.id, stored.author, stored.body),
            None => println!("duplicate id skipped"),
        }
        sent += 1;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let api = cli.api.trim_end_matches('/');

    match cli.command {
        Commands::Run => run(&client, api).await,
        Commands::Jobs { limit } => {
            let jobs: Vec<JobRecord> =
                get_json(&client, format!("{api}/jobs?limit={limit}")).await?;
            print_json(&jobs)
        }
        Commands::Job { id } => {
            let job: JobRecord = get_json(&client, format!("{api}/jobs/{id}")).await?;
            print_json(&job)
        }
        Commands::Counts { window, limit } => {
            let mut url = format!("{api}/counts?limit={limit}");
            if let Some(window) = window {
                url.push_str("&window=");
                url.push_str(&window);
            }
            let counters: Vec<WindowCounter> = get_json(&client, url).await?;
            for c in &counters {
                println!("{:>8}  #{:<24} {}", c.count, c.tag, c.window);
            }
            Ok(())
        }
        Commands::Records { limit } => {
            let records: Vec<Record> =
                get_json(&client, format!("{api}/records?limit={limit}")).await?;
            print_json(&records)
        }
        Commands::Submit {
            author,
            body,
            external_id,
            tags,
        } => {
            let record = NewRecord {
                external_id: external_id
                    .map(ExternalId::new)
                    .unwrap_or_else(|| random_external_id(&mut rand::rng())),
                author,
                body,
                tags: parse_csv(tags),
            };
            match submit(&client, api, record).await? {
                Some(stored) => print_json(&stored),
                None => anyhow::bail!("a record with that external id already exists"),
            }
        }
        Commands::Stream { every, count } => {
            let every = parse_duration(&every).context("invalid --every")?;
            stream(&client, api, every, count).await
        }
        Commands::Health => {
            let report: serde_json::Value = get_json(&client, format!("{api}/health")).await?;
            print_json(&report)
        }
    }
}
