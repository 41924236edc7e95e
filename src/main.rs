use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use proxy_sweep::{
    proxy::{
        Candidate, CandidateParser, Pipeline, PipelineConfig, ProbeOutcome, Protocol, ProxySource,
        RunSummary, Scraper, ScraperConfig,
    },
    tui::CheckProgressApp,
};
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// A proxy scraper and checker with anonymity tiers and geolocation
#[derive(Parser)]
#[command(name = "proxy-sweep")]
#[command(about = "A proxy scraper and checker with anonymity tiers and geolocation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Options shared by the checking subcommands
#[derive(Debug, Args)]
struct CheckArgs {
    /// Per-probe timeout in seconds
    #[arg(long, default_value = "5")]
    timeout: u64,

    /// Maximum simultaneous in-flight probes
    #[arg(short = 'n', long, default_value = "512")]
    max_in_flight: usize,

    /// Identity-echo endpoint (plain http URL)
    #[arg(long, default_value = "http://httpbin.org/get")]
    echo_url: String,

    /// Real origin IP; discovered via the echo endpoint when omitted
    #[arg(long)]
    real_ip: Option<Ipv4Addr>,

    /// Path to a GeoLite2-City.mmdb; enables the geolocation buckets
    #[arg(long)]
    mmdb: Option<PathBuf>,

    /// Disable the anonymous-only buckets
    #[arg(long)]
    no_anonymous: bool,

    /// Base directory for the output trees
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Show live progress in a TUI
    #[arg(long)]
    tui: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Scrape sources, check candidates and write the output buckets
    Run {
        /// Protocols to scrape and check (comma separated)
        #[arg(short, long, default_value = "http,socks4,socks5")]
        protocols: String,

        /// File of sources, one `protocol url` per line; built-in
        /// sources are used when omitted
        #[arg(short, long)]
        source_file: Option<PathBuf>,

        #[command(flatten)]
        check: CheckArgs,
    },
    /// Scrape proxy sources into a candidate list
    Scrape {
        /// URLs to scrape (can specify multiple)
        #[arg(short, long)]
        url: Vec<String>,

        /// Protocol of the scraped proxies
        #[arg(short = 't', long, default_value = "http")]
        protocol: String,

        /// Timeout in seconds for source fetches
        #[arg(long, default_value = "15")]
        timeout: u64,

        /// Output file for scraped candidates
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Check candidates from a file and write the output buckets
    Check {
        /// Input file containing candidates (IP:PORT or scheme://IP:PORT)
        input: PathBuf,

        /// Protocol for lines without a scheme prefix
        #[arg(short = 't', long, default_value = "http")]
        protocol: String,

        #[command(flatten)]
        check: CheckArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            protocols,
            source_file,
            check,
        } => {
            let protocols = parse_protocols(&protocols)?;
            let sources = match source_file {
                Some(path) => parse_source_file(&path)?,
                None => Vec::new(),
            };

            let config = pipeline_config(&check)?
                .with_protocols(protocols)
                .with_sources(sources);
            let pipeline = Arc::new(Pipeline::new(config));
            install_interrupt_handler(&pipeline);

            println!("Scraping sources...");
            let candidates = pipeline.scrape().await?;
            let candidates = Pipeline::validate(candidates);
            println!("Found {} unique candidates", candidates.len());

            check_and_save(pipeline, candidates, check.tui).await
        }
        Commands::Scrape {
            url,
            protocol,
            timeout,
            output,
        } => {
            let protocol = parse_protocol(&protocol)?;
            let sources: Vec<ProxySource> = if url.is_empty() {
                Scraper::default_sources(protocol)
            } else {
                url.iter()
                    .map(|u| ProxySource::new(u, u, protocol))
                    .collect()
            };

            let scraper = Scraper::with_config(
                ScraperConfig::new().with_timeout(Duration::from_secs(timeout)),
            )?;
            let results = scraper.fetch_all(&sources).await;
            for result in &results {
                match &result.error {
                    None => println!(
                        "Found {} candidates from {}",
                        result.candidates.len(),
                        result.source
                    ),
                    Some(error) => eprintln!("Error scraping {}: {}", result.source, error),
                }
            }

            let candidates = Scraper::collect_candidates(&results);
            println!("\nTotal unique candidates: {}", candidates.len());

            if let Some(output_path) = output {
                CandidateParser::save_to_file(&candidates, &output_path)?;
                println!("Saved candidates to {:?}", output_path);
            } else {
                for candidate in &candidates {
                    println!("{}", candidate.addr());
                }
            }
            Ok(())
        }
        Commands::Check {
            input,
            protocol,
            check,
        } => {
            let protocol = parse_protocol(&protocol)?;
            let candidates = CandidateParser::parse_file(&input, protocol)?;
            let candidates = Pipeline::validate(candidates);
            println!("Loaded {} candidates from {:?}", candidates.len(), input);

            let pipeline = Arc::new(Pipeline::new(pipeline_config(&check)?));
            install_interrupt_handler(&pipeline);

            check_and_save(pipeline, candidates, check.tui).await
        }
    }
}

/// Check the candidate set, aggregate, write the buckets and report
async fn check_and_save(
    pipeline: Arc<Pipeline>,
    candidates: Vec<Candidate>,
    tui: bool,
) -> Result<()> {
    let real_ip = pipeline.discover_real_ip().await?;
    let total = candidates.len();
    println!(
        "Checking {} candidates ({} max in flight, {}s timeout)",
        total,
        pipeline.config().max_in_flight,
        pipeline.config().timeout.as_secs()
    );

    let (tx, rx) = mpsc::unbounded_channel();
    let check_task = tokio::spawn({
        let pipeline = Arc::clone(&pipeline);
        async move { pipeline.check(candidates, Some(tx)).await }
    });

    if tui {
        let mut app = CheckProgressApp::new(rx, total, pipeline.cancellation_token());
        app.run().await?;
    } else {
        plain_progress(rx, total).await;
    }

    let outcomes = check_task.await??;
    let buckets = pipeline.aggregate(&outcomes, real_ip)?;
    pipeline.write(&buckets)?;

    let summary = RunSummary::new(&outcomes, &buckets);
    println!("{summary}");
    println!(
        "Output written to {:?}",
        pipeline.config().output_dir
    );
    Ok(())
}

/// Carriage-return progress line for non-TUI runs
async fn plain_progress(mut rx: mpsc::UnboundedReceiver<ProbeOutcome>, total: usize) {
    let mut checked = 0usize;
    let mut live = 0usize;
    while let Some(outcome) = rx.recv().await {
        checked += 1;
        if outcome.is_alive() {
            live += 1;
        }
        if checked % 25 == 0 || checked == total {
            eprint!("\rChecked {checked}/{total} | live {live}");
            let _ = std::io::stderr().flush();
        }
    }
    eprintln!();
}

/// Cancel in-flight probes on ctrl-c; the run then completes with the
/// partial outcome set
fn install_interrupt_handler(pipeline: &Arc<Pipeline>) {
    let token = pipeline.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupted, cancelling in-flight probes...");
            token.cancel();
        }
    });
}

fn pipeline_config(check: &CheckArgs) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::new()
        .with_timeout(Duration::from_secs(check.timeout))
        .with_max_in_flight(check.max_in_flight)
        .with_echo_url(check.echo_url.clone())
        .with_anonymity(!check.no_anonymous)
        .with_output_dir(check.output_dir.clone());
    if let Some(real_ip) = check.real_ip {
        config = config.with_real_ip(real_ip);
    }
    if let Some(mmdb) = &check.mmdb {
        config = config.with_mmdb_path(mmdb.clone());
    }
    Ok(config)
}

fn parse_protocol(s: &str) -> Result<Protocol> {
    match s.to_lowercase().as_str() {
        "http" | "https" => Ok(Protocol::Http),
        "socks4" => Ok(Protocol::Socks4),
        "socks5" => Ok(Protocol::Socks5),
        _ => Err(anyhow!(
            "Invalid protocol: {}. Use: http, socks4, socks5",
            s
        )),
    }
}

fn parse_protocols(s: &str) -> Result<Vec<Protocol>> {
    let mut protocols: Vec<Protocol> = s
        .split(',')
        .map(|p| parse_protocol(p.trim()))
        .collect::<Result<_>>()?;
    protocols.sort();
    protocols.dedup();
    if protocols.is_empty() {
        return Err(anyhow!("No protocols selected"));
    }
    Ok(protocols)
}

/// Parse a source file: one `protocol url` pair per line
fn parse_source_file(path: &PathBuf) -> Result<Vec<ProxySource>> {
    let content = std::fs::read_to_string(path)?;
    let mut sources = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (protocol, url) = line
            .split_once(char::is_whitespace)
            .ok_or_else(|| anyhow!("Invalid source line: {line}"))?;
        let url = url.trim();
        sources.push(ProxySource::new(url, url, parse_protocol(protocol)?));
    }
    Ok(sources)
}
