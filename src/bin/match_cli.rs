use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use reqwest::blocking::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Parser, Debug)]
#[command(
    name = "match-cli",
    about = "Send a profile to match-api and print the ranked catalog matches"
)]
struct MatchCli {
    /// Base URL of the match API
    #[arg(long, env = "CASCADE_API_URL", default_value = "http://127.0.0.1:8080")]
    api_url: String,

    /// ANN candidates (server default when omitted)
    #[arg(long, global = true)]
    k0: Option<usize>,

    /// Stage-1 survivors (server default when omitted)
    #[arg(long, global = true)]
    k1: Option<usize>,

    /// Final results (server default when omitted)
    #[arg(long, global = true)]
    k2: Option<usize>,

    /// Seconds to wait for the API; the cascade can take a while
    #[arg(long, default_value_t = 180)]
    timeout_secs: u64,

    /// Print the raw JSON response instead of a summary
    #[arg(long, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Match a free-text profile directly
    Profile {
        /// Profile text
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        text: Option<String>,

        /// Read the profile text from a file
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Match against the profile someone would have after closing a skills gap
    Gap {
        /// Current role
        #[arg(long)]
        current_position: String,

        /// Desired role
        #[arg(long)]
        target_position: String,

        /// Skills acquired on the way (comma separated)
        #[arg(long, default_value = "")]
        acquired_skills: String,
    },
}

fn main() -> Result<()> {
    let cli = MatchCli::parse();
    let client = Client::builder()
        .timeout(Duration::from_secs(cli.timeout_secs.max(1)))
        .build()
        .context("failed to build match API HTTP client")?;
    let base = cli.api_url.trim_end_matches('/');
    let budgets = BudgetOverrides {
        k0: cli.k0,
        k1: cli.k1,
        k2: cli.k2,
    };

    match &cli.command {
        Command::Profile { text, file } => {
            let profile = match (text, file) {
                (Some(text), _) => text.clone(),
                (None, Some(path)) => std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read profile from {}", path.display()))?,
                (None, None) => bail!("either --text or --file is required"),
            };
            let request = ProfileRequest {
                profile: &profile,
                budgets,
            };
            let url = format!("{base}/v1/match");
            if cli.json {
                let raw: serde_json::Value = post(&client, &url, &request)?;
                println!("{}", serde_json::to_string_pretty(&raw)?);
                return Ok(());
            }
            let response: MatchResponse = post(&client, &url, &request)?;
            print!("{}", render_matches(&response));
        }
        Command::Gap {
            current_position,
            target_position,
            acquired_skills,
        } => {
            let request = GapRequest {
                current_position,
                target_position,
                acquired_skills,
                budgets,
            };
            let url = format!("{base}/v1/match/gap");
            if cli.json {
                let raw: serde_json::Value = post(&client, &url, &request)?;
                println!("{}", serde_json::to_string_pretty(&raw)?);
                return Ok(());
            }
            let response: GapResponse = post(&client, &url, &request)?;
            println!("--- Target Profile ---\n{}\n", response.future_profile.trim());
            print!("{}", render_matches(&response.matches));
        }
    }
    Ok(())
}

fn post<Req: Serialize, Resp: DeserializeOwned>(
    client: &Client,
    url: &str,
    body: &Req,
) -> Result<Resp> {
    let resp = client
        .post(url)
        .json(body)
        .send()
        .with_context(|| format!("failed to call match API at {url}"))?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp
            .text()
            .unwrap_or_else(|_| "<body unavailable>".to_string());
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|err| err.message)
            .unwrap_or(body);
        bail!("match API returned {}: {}", status, message);
    }
    resp.json().context("failed to parse match API response")
}

fn render_matches(response: &MatchResponse) -> String {
    let mut out = format!(
        "--- Matches ({} retrieved, {} after titles, {} final) ---\n",
        response.retrieved.len(),
        response.stage1.len(),
        response.results.len()
    );
    if response.results.is_empty() {
        out.push_str("(no matches)\n");
    }
    for (rank, row) in response.results.iter().enumerate() {
        out.push_str(&format!(
            "{}. [{}] {} | {} | {} | score {:.2} (similarity {:.3})\n",
            rank + 1,
            row.idx,
            row.title,
            display_or_dash(&row.company),
            row.seniority_level,
            row.match_score,
            row.similarity
        ));
        let details = [&row.location, &row.compensation, &row.experience]
            .into_iter()
            .filter(|value| !value.trim().is_empty())
            .map(|value| value.trim())
            .collect::<Vec<_>>();
        if !details.is_empty() {
            out.push_str(&format!("   {}\n", details.join(" | ")));
        }
        if let Some(url) = &row.source_url {
            out.push_str(&format!("   {url}\n"));
        }
    }
    let fallbacks = [&response.trace.stage1, &response.trace.stage2]
        .into_iter()
        .flatten()
        .filter_map(|report| {
            report
                .fallback
                .as_ref()
                .map(|fallback| format!("{}: {}", report.stage, fallback.reason))
        })
        .collect::<Vec<_>>();
    if !fallbacks.is_empty() {
        out.push_str(&format!("note: similarity fallback used ({})\n", fallbacks.join(", ")));
    }
    out
}

fn display_or_dash(value: &str) -> &str {
    if value.trim().is_empty() {
        "-"
    } else {
        value.trim()
    }
}

#[derive(Serialize)]
struct BudgetOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    k0: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    k1: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    k2: Option<usize>,
}

#[derive(Serialize)]
struct ProfileRequest<'a> {
    profile: &'a str,
    #[serde(flatten)]
    budgets: BudgetOverrides,
}

#[derive(Serialize)]
struct GapRequest<'a> {
    current_position: &'a str,
    target_position: &'a str,
    acquired_skills: &'a str,
    #[serde(flatten)]
    budgets: BudgetOverrides,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(Debug, Deserialize)]
struct GapResponse {
    future_profile: String,
    #[serde(flatten)]
    matches: MatchResponse,
}

#[derive(Debug, Deserialize)]
struct MatchResponse {
    retrieved: Vec<u64>,
    stage1: Vec<u64>,
    results: Vec<MatchRow>,
    trace: Trace,
}

#[derive(Debug, Deserialize)]
struct MatchRow {
    idx: u64,
    title: String,
    #[serde(default)]
    company: String,
    #[serde(default)]
    location: String,
    #[serde(default)]
    compensation: String,
    #[serde(default)]
    experience: String,
    #[serde(default)]
    source_url: Option<String>,
    seniority_level: String,
    match_score: f32,
    similarity: f32,
}

#[derive(Debug, Deserialize)]
struct Trace {
    #[serde(default)]
    stage1: Option<StageTrace>,
    #[serde(default)]
    stage2: Option<StageTrace>,
}

#[derive(Debug, Deserialize)]
struct StageTrace {
    stage: String,
    #[serde(default)]
    fallback: Option<FallbackTrace>,
}

#[derive(Debug, Deserialize)]
struct FallbackTrace {
    reason: String,
}
