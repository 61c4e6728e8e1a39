//! cdxfetch command line tool
//!
//! Query CDX web-archive indices from the shell: `iter` prints captures,
//! `size` prints a rough match count, `warc` extracts capture content into
//! WARC files.

use std::path::Path;
use std::sync::Arc;

use anyhow::bail;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cdxfetch::catalog::CrawlSelector;
use cdxfetch::record::CaptureRecord;
use cdxfetch::warc::{materialize_stream, HttpRangeSource, Materializer, WarcInfo, WarcWriter};
use cdxfetch::{CdxFetcher, CrawlOrder, FilterClause, MatchType, QuerySpec, Source};

/// cdxfetch: query CDX web-archive indices
#[derive(Parser, Debug)]
#[command(name = "cdxfetch")]
#[command(version)]
#[command(about = "Query CDX web-archive indices", long_about = None)]
struct Cli {
    /// Direct the query to the Common Crawl CDX/WARCs
    #[arg(long, global = true)]
    cc: bool,

    /// Direct the query to the Internet Archive CDX/wayback
    #[arg(long, global = true)]
    ia: bool,

    /// Direct the query to this CDX server URL
    #[arg(long, global = true, value_name = "URL")]
    source: Option<String>,

    /// Use this Common Crawl index mirror
    #[arg(long, global = true, value_name = "URL")]
    cc_mirror: Option<String>,

    /// Common Crawl crawl selector: an id, a count of recent crawls, a
    /// year, or a year range (repeatable)
    #[arg(long, global = true)]
    crawl: Vec<String>,

    /// Shard ordering: mixed (newest crawl first) or ascending
    #[arg(long, global = true, default_value = "mixed")]
    cc_sort: String,

    /// Use a single bounded get instead of a paged iteration
    #[arg(long, global = true)]
    get: bool,

    /// Get the capture closest to this timestamp; works best with --get
    #[arg(long, global = true, value_name = "TIMESTAMP")]
    closest: Option<String>,

    /// Maximum records to return
    #[arg(long, global = true)]
    limit: Option<u64>,

    /// Lower time bound (a 14-digit timestamp or any prefix)
    #[arg(long = "from", global = true, value_name = "TIMESTAMP")]
    from_ts: Option<String>,

    /// Upper time bound
    #[arg(long, global = true, value_name = "TIMESTAMP")]
    to: Option<String>,

    /// Filter clause like status:200, =mime:text/html, !=status:200
    /// (repeatable, AND-combined)
    #[arg(long, global = true)]
    filter: Vec<String>,

    /// Increase logging verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Iterate printing captures
    Iter(IterArgs),
    /// Iterate over capture content, creating WARC files
    Warc(WarcArgs),
    /// Imprecise count of how many results are available
    Size(SizeArgs),
}

#[derive(Args, Debug)]
struct IterArgs {
    /// Comma-separated fields to print
    #[arg(long, default_value = "url,status,timestamp")]
    fields: String,

    /// Print every field the service returned
    #[arg(long)]
    all_fields: bool,

    /// Print one JSON object per line
    #[arg(long, conflicts_with = "csv")]
    jsonl: bool,

    /// Print CSV with a header row
    #[arg(long)]
    csv: bool,

    /// URL or URL pattern (end with /* or start with *. to widen the match)
    url: String,
}

#[derive(Args, Debug)]
struct WarcArgs {
    /// Prefix for the WARC filenames
    #[arg(long, default_value = "TEST")]
    prefix: String,

    /// Subprefix for the WARC filenames, recorded in isPartOf
    #[arg(long)]
    subprefix: Option<String>,

    /// Target WARC segment size in bytes
    #[arg(long, default_value_t = 1_000_000_000)]
    size: u64,

    /// Creator of the WARC: person, organization, service
    #[arg(long)]
    creator: Option<String>,

    /// A person, if the creator is an organization
    #[arg(long)]
    operator: Option<String>,

    /// Only warc URLs containing this substring
    #[arg(long)]
    url_fgrep: Option<String>,

    /// Skip URLs containing this substring, e.g. /robots.txt
    #[arg(long)]
    url_fgrepv: Option<String>,

    /// Stop at the first failing capture instead of skipping it
    #[arg(long)]
    fail_fast: bool,

    url: String,
}

#[derive(Args, Debug)]
struct SizeArgs {
    /// Show a per-subindex breakdown
    #[arg(long)]
    details: bool,

    url: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose, cli.quiet);

    let fetcher = build_fetcher(&cli)?;
    let spec = build_spec(&cli)?;

    match &cli.cmd {
        Command::Iter(args) => run_iter(&cli, args, &fetcher, &spec),
        Command::Warc(args) => run_warc(args, &fetcher, &spec),
        Command::Size(args) => run_size(args, &fetcher, &spec),
    }
}

/// Sets up the tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("cdxfetch=warn"),
            1 => EnvFilter::new("cdxfetch=info"),
            _ => EnvFilter::new("cdxfetch=debug"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn build_fetcher(cli: &Cli) -> anyhow::Result<CdxFetcher> {
    let source = match (cli.cc, cli.ia, &cli.source) {
        (true, false, None) => Source::CommonCrawl,
        (false, true, None) => Source::InternetArchive,
        (false, false, Some(url)) => Source::parse(url)?,
        (false, false, None) => bail!("must specify --cc, --ia, or a --source URL"),
        _ => bail!("--cc, --ia, and --source are mutually exclusive"),
    };

    let order = match cli.cc_sort.as_str() {
        "mixed" => CrawlOrder::Mixed,
        "ascending" => CrawlOrder::Ascending,
        other => bail!("unknown --cc-sort {:?}, expected mixed or ascending", other),
    };

    let crawls = cli
        .crawl
        .iter()
        .map(|raw| CrawlSelector::parse(raw))
        .collect::<Result<Vec<_>, _>>()?;

    let mut fetcher = CdxFetcher::new(source)?
        .with_order(order)
        .with_crawls(crawls);
    if let Some(mirror) = &cli.cc_mirror {
        fetcher = fetcher.with_mirror(mirror);
    }
    Ok(fetcher)
}

fn build_spec(cli: &Cli) -> anyhow::Result<QuerySpec> {
    let mut spec = QuerySpec::new(&cli.cmd_url());
    spec.match_type = infer_match_type(&spec.url);
    spec.from_ts = cli.from_ts.clone();
    spec.to = cli.to.clone();
    spec.closest = cli.closest.clone();
    spec.limit = cli.limit;
    for raw in &cli.filter {
        spec.filters.push(FilterClause::parse(raw)?);
    }
    if spec.closest.is_some() && !cli.get {
        tracing::info!("note: --closest works best with --get");
    }
    spec.validate()?;
    Ok(spec)
}

impl Cli {
    fn cmd_url(&self) -> String {
        match &self.cmd {
            Command::Iter(a) => a.url.clone(),
            Command::Warc(a) => a.url.clone(),
            Command::Size(a) => a.url.clone(),
        }
    }
}

/// A trailing `/*` or leading `*.` in the url pattern implies the match
/// type, the same shorthand the services themselves accept.
fn infer_match_type(url: &str) -> Option<MatchType> {
    if url.starts_with("*.") {
        Some(MatchType::Domain)
    } else if url.ends_with('*') {
        Some(MatchType::Prefix)
    } else {
        None
    }
}

fn run_iter(cli: &Cli, args: &IterArgs, fetcher: &CdxFetcher, spec: &QuerySpec) -> anyhow::Result<()> {
    let fields = split_fields(&args.fields);
    if args.csv && args.all_fields {
        bail!("the combination of --csv and --all-fields is not supported");
    }
    if args.csv {
        println!("{}", csv_row(&fields));
    }

    let mut print_record = |rec: &CaptureRecord| {
        let pairs: Vec<(String, String)> = if args.all_fields {
            rec.all_fields()
        } else {
            fields
                .iter()
                .map(|f| (f.clone(), rec.field(f).unwrap_or_default()))
                .collect()
        };
        if args.jsonl {
            let map: serde_json::Map<String, serde_json::Value> = pairs
                .into_iter()
                .map(|(k, v)| (k, serde_json::Value::String(v)))
                .collect();
            println!("{}", serde_json::Value::Object(map));
        } else if args.csv {
            let values: Vec<String> = pairs.into_iter().map(|(_, v)| v).collect();
            println!("{}", csv_row(&values));
        } else {
            let joined: Vec<String> = pairs
                .into_iter()
                .map(|(k, v)| format!("{} {}", k, v))
                .collect();
            println!("{}", joined.join(", "));
        }
    };

    if cli.get {
        for rec in fetcher.get(spec)? {
            print_record(&rec);
        }
        return Ok(());
    }
    for rec in fetcher.iter(spec)? {
        print_record(&rec?);
    }
    Ok(())
}

fn run_warc(args: &WarcArgs, fetcher: &CdxFetcher, spec: &QuerySpec) -> anyhow::Result<()> {
    let Some(prefix) = fetcher.warc_download_prefix() else {
        bail!("this source has no content download location; warc extraction needs one");
    };

    let cmdline: Vec<String> = std::env::args().collect();
    let mut info = WarcInfo::for_extraction(
        &args.prefix,
        args.subprefix.as_deref(),
        &cmdline.join(" "),
    );
    info.creator = args.creator.clone();
    info.operator = args.operator.clone();

    let mut writer = WarcWriter::new(
        Path::new("."),
        &args.prefix,
        args.subprefix.as_deref(),
        info,
        args.size,
        true,
    );
    let source = HttpRangeSource::new(Arc::clone(fetcher.transport()), prefix);
    let mut materializer = Materializer::new(source);

    let wanted = |rec: &CaptureRecord| {
        if let Some(pat) = &args.url_fgrep {
            if !rec.url.contains(pat.as_str()) {
                return false;
            }
        }
        if let Some(pat) = &args.url_fgrepv {
            if rec.url.contains(pat.as_str()) {
                return false;
            }
        }
        true
    };

    let captures = fetcher
        .iter(spec)?
        .filter(|rec| rec.as_ref().map(&wanted).unwrap_or(true));
    let (written, skipped) =
        materialize_stream(&mut materializer, &mut writer, captures, args.fail_fast)?;
    tracing::info!(written, skipped, "warc extraction finished");
    Ok(())
}

fn run_size(args: &SizeArgs, fetcher: &CdxFetcher, spec: &QuerySpec) -> anyhow::Result<()> {
    let estimate = fetcher.size_estimate(spec)?;
    if args.details {
        for (endpoint, samples) in &estimate.per_endpoint {
            println!("{} {}", endpoint, samples);
        }
    }
    println!("{}", estimate.samples);
    Ok(())
}

fn split_fields(fields: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for f in fields.split(',') {
        let f = f.trim();
        if !f.is_empty() && !out.iter().any(|seen| seen == f) {
            out.push(f.to_string());
        }
    }
    out
}

fn csv_row(values: &[String]) -> String {
    values
        .iter()
        .map(|v| {
            if v.contains(',') || v.contains('"') || v.contains('\n') {
                format!("\"{}\"", v.replace('"', "\"\""))
            } else {
                v.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}
