mod collector;
mod db;
mod error;
mod normalizer;
mod pipeline;
mod report;
mod settings;

use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};

use collector::Page;
use settings::Settings;

#[derive(Parser)]
#[command(
    name = "social_scraper",
    about = "Scrape public social pages into a relational schema"
)]
struct Cli {
    /// Pipeline config (TOML); SOCIAL_* env vars override it
    #[arg(short, long, global = true, default_value = "pipeline.toml")]
    config: PathBuf,

    /// Database path (overrides the config)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the schema
    Init,
    /// Fetch, clean and store every configured target
    Run {
        /// Only this target
        #[arg(short, long)]
        target: Option<String>,
        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run the pipeline over a saved HTML page instead of fetching
    Import {
        #[arg(short, long)]
        file: PathBuf,
        /// Rule set to extract with
        #[arg(short, long)]
        rules: String,
        /// URL the page came from (resolves relative links)
        #[arg(short, long, default_value = "http://localhost/")]
        url: String,
        #[arg(long)]
        json: bool,
    },
    /// Row counts per table
    Stats,
    /// Most used hashtags
    Hashtags {
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so `--json` output on stdout stays parseable.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let mut settings = Settings::load(&cli.config)?;
    if let Some(path) = cli.db {
        settings.database = path;
    }

    let conn = db::connect(&settings.database)
        .with_context(|| format!("Failed to open {:?}", settings.database))?;
    db::init_schema(&conn)?;

    let result = match cli.command {
        Commands::Init => {
            println!("Schema ready in {:?}", settings.database);
            Ok(())
        }
        Commands::Run { target, json } => {
            if !json {
                println!(
                    "Running {} target(s)...",
                    target.as_ref().map_or(settings.targets.len(), |_| 1)
                );
            }
            let summary = pipeline::run(&conn, &settings, target.as_deref()).await?;
            print_summary(&summary, json)
        }
        Commands::Import {
            file,
            rules,
            url,
            json,
        } => {
            if !settings.rules.contains_key(&rules) {
                anyhow::bail!("unknown rule set {:?}", rules);
            }
            let html = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {:?}", file))?;
            let page = Page {
                target: file.display().to_string(),
                url,
                rules,
                html,
            };
            let summary = pipeline::run_pages(&conn, &settings, &[page])?;
            print_summary(&summary, json)
        }
        Commands::Stats => {
            let s = db::get_stats(&conn)?;
            println!("Users:     {}", s.users);
            println!("Posts:     {}", s.posts);
            println!("Comments:  {}", s.comments);
            println!("Hashtags:  {}", s.hashtags);
            println!("Post tags: {}", s.post_tags);
            println!("Followers: {}", s.followers);
            Ok(())
        }
        Commands::Hashtags { limit } => {
            let rows = db::top_hashtags(&conn, limit)?;
            if rows.is_empty() {
                println!("No hashtags yet. Run 'run' or 'import' first.");
                return Ok(());
            }
            println!("{:>3} | {:<32} | {:>5}", "#", "Hashtag", "Posts");
            println!("{}", "-".repeat(46));
            for (i, r) in rows.iter().enumerate() {
                println!("{:>3} | {:<32} | {:>5}", i + 1, clip(&r.name, 32), r.posts);
            }
            Ok(())
        }
    };

    let took = t0.elapsed();
    if took.as_secs() >= 1 {
        eprintln!("Done in {}", elapsed(took));
    }

    result
}

fn print_summary(summary: &report::RunSummary, json: bool) -> anyhow::Result<()> {
    if json {
        write_json(&mut std::io::stdout().lock(), summary)
    } else {
        summary.print();
        Ok(())
    }
}

/// The summary as the only thing on `out`, so it can be piped into a parser.
fn write_json(out: &mut impl Write, summary: &report::RunSummary) -> anyhow::Result<()> {
    serde_json::to_writer_pretty(&mut *out, summary)?;
    writeln!(out)?;
    Ok(())
}

/// Fit `s` into `width` columns, marking a cut with `…`.
fn clip(s: &str, width: usize) -> String {
    match s.char_indices().nth(width) {
        Some(_) => {
            let kept: String = s.chars().take(width.saturating_sub(1)).collect();
            format!("{}…", kept)
        }
        None => s.to_string(),
    }
}

fn elapsed(d: Duration) -> String {
    match d.as_secs() {
        0..=59 => format!("{:.1}s", d.as_secs_f64()),
        secs => format!("{}m {:02}s", secs / 60, secs % 60),
    }
}
