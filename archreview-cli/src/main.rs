mod sse;

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

use archreview_core::{AccountId, Pillar, Region, Review, ReviewId, ReviewStatus};
use sse::SseProcessor;

/// SSE event name carrying a review update.
const REVIEW_UPDATED_EVENT: &str = "reviewUpdated";

/// Timeout for ordinary (non-streaming) requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Consecutive failed polls after which `watch` gives up.
const MAX_POLL_FAILURES: u32 = 8;

/// Upper bound for the wait between failed polls.
const MAX_POLL_BACKOFF: Duration = Duration::from_secs(60);

/// A non-success answer from the server.
#[derive(Debug, thiserror::Error)]
#[error("Server error: {status} - {message}")]
struct ServerError {
    status: reqwest::StatusCode,
    message: String,
}

/// archreview: submit architecture reviews and follow their progress
#[derive(Parser, Debug)]
#[command(name = "archreview")]
#[command(about = "Client for the archreview service", long_about = None)]
struct Cli {
    /// Base URL of the archreview server
    #[arg(long, global = true, env = "ARCHREVIEW_SERVER", default_value = "http://localhost:3000")]
    server: String,

    /// Bearer token for operator commands
    #[arg(long, global = true, env = "ARCHREVIEW_OPS_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a new review
    Submit(SubmitArgs),
    /// Show one review
    Show(ShowArgs),
    /// List reviews, newest first
    List(ListArgs),
    /// Follow a review until it completes or fails
    Watch(WatchArgs),
    /// Retry a failed review
    Retry(ShowArgs),
    /// List work items that exhausted their retries (operator)
    DeadLetters(DeadLettersArgs),
    /// Return a dead-lettered work item to the queue (operator)
    Redrive(RedriveArgs),
}

#[derive(Parser, Debug)]
struct SubmitArgs {
    /// Twelve-digit account to review
    #[arg(long)]
    account: String,

    /// Region to review (server default if omitted)
    #[arg(long)]
    region: Option<String>,

    /// Restrict the review to one pillar
    #[arg(long)]
    pillar: Option<String>,

    /// Keep watching the review after submitting it
    #[arg(long)]
    watch: bool,
}

#[derive(Parser, Debug)]
struct ShowArgs {
    review_id: ReviewId,
}

#[derive(Parser, Debug)]
struct ListArgs {
    /// Page size
    #[arg(long, default_value_t = 20)]
    limit: usize,

    /// Only reviews with this status (PENDING, IN_PROGRESS, COMPLETED, FAILED)
    #[arg(long)]
    status: Option<ReviewStatus>,

    /// Follow nextToken until every review has been listed
    #[arg(long)]
    all: bool,
}

#[derive(Parser, Debug)]
struct WatchArgs {
    review_id: ReviewId,

    /// Seconds between polls of the review
    #[arg(long, default_value_t = 5)]
    poll_interval: u64,
}

#[derive(Parser, Debug)]
struct DeadLettersArgs {
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Parser, Debug)]
struct RedriveArgs {
    message_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    review_id: ReviewId,
    status: ReviewStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviewPage {
    items: Vec<Review>,
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeadLetter {
    message_id: String,
    review_id: ReviewId,
    receive_count: u32,
    enqueued_at: DateTime<Utc>,
    dead_lettered_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct DeadLetterList {
    items: Vec<DeadLetter>,
}

/// Thin client for the archreview HTTP API.
#[derive(Clone)]
struct Api {
    client: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl Api {
    fn new(server: &str, token: Option<String>) -> Result<Self> {
        // No overall timeout: the subscription stream stays open
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            base: server.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn operator(&self, request: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        let token = self
            .token
            .as_ref()
            .context("Operator commands need a token via --token or ARCHREVIEW_OPS_TOKEN")?;
        Ok(request.bearer_auth(token))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to reach archreview server at {}", self.base))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response
                .text()
                .await
                .context("Failed to read error response")?;
            let message = serde_json::from_str::<serde_json::Value>(&text)
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
                .unwrap_or(text);
            return Err(ServerError { status, message }.into());
        }

        Ok(response)
    }

    async fn json<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T> {
        self.send(request.timeout(REQUEST_TIMEOUT))
            .await?
            .json()
            .await
            .context("Failed to parse server response")
    }

    async fn get_review(&self, id: ReviewId) -> Result<Review> {
        self.json(self.client.get(self.url(&format!("/reviews/{}", id))))
            .await
    }

    async fn subscribe(&self, id: ReviewId) -> Result<reqwest::Response> {
        let request = self
            .client
            .get(self.url("/subscriptions/reviews"))
            .query(&[("reviewId", id.to_string())])
            .header(reqwest::header::ACCEPT, "text/event-stream");
        self.send(request).await
    }
}

/// Whether a failed poll is worth repeating. Client errors never are.
fn is_retryable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ServerError>()
        .map_or(true, |e| !e.status.is_client_error())
}

/// Wait after the `failures`-th consecutive failed poll: doubling from
/// `base`, capped at [`MAX_POLL_BACKOFF`].
fn poll_backoff(base: Duration, failures: u32) -> Duration {
    let factor = 1u32 << failures.saturating_sub(1).min(16);
    base.saturating_mul(factor).min(MAX_POLL_BACKOFF)
}

/// Whether `candidate` is a later state than `current`.
fn is_newer(current: Option<&Review>, candidate: &Review) -> bool {
    match current {
        None => true,
        Some(current) => {
            (candidate.updated_at, candidate.version) > (current.updated_at, current.version)
        }
    }
}

fn print_review(review: &Review) {
    println!("Review:   {}", review.review_id);
    println!("Status:   {}", review.status);
    println!("Account:  {}", review.aws_account_id);
    println!("Region:   {}", review.region);
    if let Some(pillar) = review.pillar {
        println!("Pillar:   {}", pillar);
    }
    println!("Created:  {}", review.created_at.to_rfc3339());
    println!("Updated:  {}", review.updated_at.to_rfc3339());
    if review.attempts > 1 {
        println!("Attempts: {}", review.attempts);
    }
    if let Some(error) = &review.error_message {
        println!("Error:    {}", error);
    }
    if let Some(score) = review.score {
        println!("Score:    {:.1}", score);
    }
    if let Some(findings) = review.findings.as_deref().filter(|f| !f.is_empty()) {
        println!();
        println!("Findings:");
        for finding in findings {
            println!(
                "  [{:?}] {} ({}): {}",
                finding.severity, finding.title, finding.pillar, finding.description
            );
            if let Some(arn) = &finding.resource_arn {
                println!("      resource: {}", arn);
            }
        }
    }
    if let Some(recommendations) = review.recommendations.as_deref().filter(|r| !r.is_empty()) {
        println!();
        println!("Recommendations:");
        for rec in recommendations {
            println!(
                "  [{:?}] {} (effort: {}): {}",
                rec.priority, rec.title, rec.effort, rec.description
            );
            for link in rec.links.iter().flatten() {
                println!("      {}", link);
            }
        }
    }
}

fn print_row(review: &Review) {
    let score = review
        .score
        .map(|s| format!("{:.1}", s))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{}  {:<11}  {}  {:<14}  {:>5}  {}",
        review.review_id,
        review.status.as_str(),
        review.aws_account_id,
        review.region.as_str(),
        score,
        review.created_at.format("%Y-%m-%d %H:%M:%S")
    );
}

async fn run_submit(api: &Api, args: SubmitArgs) -> Result<()> {
    // Validate locally so obvious mistakes never reach the server
    let account = AccountId::parse(&args.account)?;
    let region = args.region.as_deref().map(Region::parse).transpose()?;
    let pillar = Pillar::parse_optional(args.pillar.as_deref())?;

    let body = json!({
        "awsAccountId": account.as_str(),
        "region": region.as_ref().map(Region::as_str),
        "pillar": pillar.map(|p| p.as_str()),
    });
    let submitted: SubmitResponse = api
        .json(api.client.post(api.url("/reviews")).json(&body))
        .await?;

    eprintln!("Submitted review {} ({})", submitted.review_id, submitted.status);
    println!("{}", submitted.review_id);

    if args.watch {
        watch(api, submitted.review_id, Duration::from_secs(5)).await?;
    }
    Ok(())
}

async fn run_show(api: &Api, args: ShowArgs) -> Result<()> {
    print_review(&api.get_review(args.review_id).await?);
    Ok(())
}

async fn run_list(api: &Api, args: ListArgs) -> Result<()> {
    let mut token: Option<String> = None;
    let mut total = 0usize;

    loop {
        let mut query = vec![("limit", args.limit.to_string())];
        if let Some(status) = args.status {
            query.push(("status", status.as_str().to_string()));
        }
        if let Some(token) = &token {
            query.push(("nextToken", token.clone()));
        }

        let page: ReviewPage = api
            .json(api.client.get(api.url("/reviews")).query(&query))
            .await?;
        total += page.items.len();
        for review in &page.items {
            print_row(review);
        }

        match page.next_token {
            Some(next) if args.all => token = Some(next),
            Some(_) => {
                eprintln!("More reviews available; use --all to list everything");
                break;
            }
            None => break,
        }
    }

    eprintln!("{} review(s)", total);
    Ok(())
}

/// Forward every update from the subscription stream into `tx`.
async fn stream_updates(api: Api, id: ReviewId, tx: mpsc::Sender<Review>) -> Result<()> {
    let response = api.subscribe(id).await?;
    let mut stream = response.bytes_stream();
    let mut sse = SseProcessor::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("Failed to read chunk from stream")?;
        sse.push(&chunk);

        while let Some(event) = sse.next_event() {
            let event = event.context("Failed to parse SSE event")?;
            if event.event != REVIEW_UPDATED_EVENT {
                continue;
            }
            let review: Review =
                serde_json::from_str(&event.data).context("Failed to parse review update")?;
            if tx.send(review).await.is_err() {
                return Ok(());
            }
        }
    }

    if sse.has_remaining() {
        eprintln!("Warning: update stream ended with unparsed data");
    }
    Err(anyhow!("Update stream closed by the server"))
}

/// Follow a review through both the live stream and polling. The most recent
/// state from either source is printed; older or repeated states are ignored.
async fn watch(api: &Api, id: ReviewId, poll_interval: Duration) -> Result<()> {
    let (tx, mut rx) = mpsc::channel::<Review>(16);
    let streamer = tokio::spawn({
        let api = api.clone();
        async move {
            if let Err(e) = stream_updates(api, id, tx).await {
                eprintln!("Live updates unavailable ({:#}); polling only", e);
            }
        }
    });

    let mut latest: Option<Review> = None;
    let poll_interval = poll_interval.max(Duration::from_secs(1));
    let mut next_poll = tokio::time::Instant::now();
    let mut poll_failures = 0u32;
    let mut streaming = true;

    let result = loop {
        let candidate = tokio::select! {
            update = rx.recv(), if streaming => match update {
                Some(review) => review,
                None => {
                    streaming = false;
                    continue;
                }
            },
            _ = tokio::time::sleep_until(next_poll) => match api.get_review(id).await {
                Ok(review) => {
                    poll_failures = 0;
                    next_poll = tokio::time::Instant::now() + poll_interval;
                    review
                }
                Err(e) if is_retryable(&e) && poll_failures + 1 < MAX_POLL_FAILURES => {
                    poll_failures += 1;
                    let wait = poll_backoff(poll_interval, poll_failures);
                    eprintln!("Warning: poll failed ({:#}); retrying in {:?}", e, wait);
                    next_poll = tokio::time::Instant::now() + wait;
                    continue;
                }
                Err(e) => break Err(e),
            },
        };

        if !is_newer(latest.as_ref(), &candidate) {
            continue;
        }
        let changed = latest.as_ref().map(|r| r.status) != Some(candidate.status);
        if changed {
            eprintln!(
                "{}  {}",
                candidate.updated_at.format("%H:%M:%S"),
                candidate.status
            );
        }
        let done = candidate.status.is_terminal();
        latest = Some(candidate);
        if done {
            break Ok(());
        }
    };
    streamer.abort();
    result?;

    let review = latest.context("No state received")?;
    println!();
    print_review(&review);
    if review.status == ReviewStatus::Failed {
        bail!(
            "Review failed: {}",
            review.error_message.as_deref().unwrap_or("no reason recorded")
        );
    }
    Ok(())
}

async fn run_retry(api: &Api, args: ShowArgs) -> Result<()> {
    let review: Review = api
        .json(
            api.client
                .put(api.url(&format!("/reviews/{}/status", args.review_id)))
                .json(&json!({ "status": ReviewStatus::Pending })),
        )
        .await?;
    eprintln!("Review {} is {} again", review.review_id, review.status);
    Ok(())
}

async fn run_dead_letters(api: &Api, args: DeadLettersArgs) -> Result<()> {
    let mut request = api.client.get(api.url("/dead-letters"));
    if let Some(limit) = args.limit {
        request = request.query(&[("limit", limit)]);
    }
    let list: DeadLetterList = api.json(api.operator(request)?).await?;

    for item in &list.items {
        println!(
            "{}  review {}  received {}x  enqueued {}  dead-lettered {}",
            item.message_id,
            item.review_id,
            item.receive_count,
            item.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
            item.dead_lettered_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    eprintln!("{} dead letter(s)", list.items.len());
    Ok(())
}

async fn run_redrive(api: &Api, args: RedriveArgs) -> Result<()> {
    let request = api
        .client
        .post(api.url(&format!("/dead-letters/{}/redrive", args.message_id)));
    let _: serde_json::Value = api.json(api.operator(request)?).await?;
    eprintln!("Message {} returned to the queue", args.message_id);
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let api = Api::new(&cli.server, cli.token)?;

    match cli.command {
        Commands::Submit(args) => run_submit(&api, args).await,
        Commands::Show(args) => run_show(&api, args).await,
        Commands::List(args) => run_list(&api, args).await,
        Commands::Watch(args) => {
            watch(&api, args.review_id, Duration::from_secs(args.poll_interval)).await
        }
        Commands::Retry(args) => run_retry(&api, args).await,
        Commands::DeadLetters(args) => run_dead_letters(&api, args).await,
        Commands::Redrive(args) => run_redrive(&api, args).await,
    }
}
