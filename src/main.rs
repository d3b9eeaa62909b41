use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use barkview::config::EngineConfig;
use barkview::filter::FilterSpec;
use barkview::sources::file::{FileFeed, LogFeed, pump_into};
use barkview::sources::{LineSource, MemorySource};
use barkview::tail::ViewEvent;
use barkview::view::{Engine, LogView};

const USAGE: &str = "Usage: barkview <file_path> [pattern] [--regex] [-i] [-v] [-B n] [-A n] [--fuzzy n]";

struct Args {
    path: PathBuf,
    spec: Option<FilterSpec>,
}

fn parse_args(args: &[String]) -> Result<Args> {
    let mut path = None;
    let mut pattern = None;
    let mut spec = FilterSpec::default();

    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        let mut count = |flag: &str| -> Result<usize> {
            iter.next()
                .with_context(|| format!("{flag} needs a value"))?
                .parse()
                .with_context(|| format!("{flag} expects a number"))
        };
        match arg.as_str() {
            "--regex" | "-E" => spec.is_regex = true,
            "-i" => spec.case_sensitive = false,
            "-I" | "--case-sensitive" => spec.case_sensitive = true,
            "-v" | "--invert" => spec.invert = true,
            "-B" => spec.spread_before = count("-B")?,
            "-A" => spec.spread_behind = count("-A")?,
            "-C" => {
                let n = count("-C")?;
                spec.spread_before = n;
                spec.spread_behind = n;
            }
            "--fuzzy" => spec.fuzzy = count("--fuzzy")?,
            flag if flag.starts_with('-') && flag.len() > 1 => bail!("Unknown option {flag}\n{USAGE}"),
            value if path.is_none() => path = Some(PathBuf::from(value)),
            value if pattern.is_none() => pattern = Some(value.to_string()),
            value => bail!("Unexpected argument {value}\n{USAGE}"),
        }
    }

    let path = path.with_context(|| USAGE.to_string())?;
    let spec = pattern.map(|text| FilterSpec {
        search_text: text,
        ..spec
    });
    Ok(Args { path, spec })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("barkview=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let args = parse_args(&args)?;

    let config = EngineConfig::load().context("Failed to load configuration")?;
    let engine = Engine::new(config);

    let feed = FileFeed::new(args.path.clone());
    let store = Arc::new(MemorySource::new(feed.name()));
    let feed_rx = feed.stream().await;
    let pump = tokio::spawn(pump_into(feed_rx, store.clone()));

    let view = engine.open_view(store.clone());
    let mut events = view.subscribe();
    if let Some(spec) = args.spec {
        // Passes over a still-empty store finish at once; the tail does the rest
        view.start_filter(spec).context("Invalid filter")?;
    }

    let mut printer = Printer::default();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ViewEvent::Updated { .. }) | Ok(ViewEvent::FilterApplied { .. }) => {
                    printer.print_new(&view, store.as_ref());
                }
                Ok(ViewEvent::RolledOver { offset }) => printer.shift(offset),
                Ok(ViewEvent::SourceLost { .. }) => eprintln!("-- {} is unavailable --", store.name()),
                Ok(ViewEvent::SourceRestored { .. }) => {
                    eprintln!("-- {} restarted --", store.name());
                    printer = Printer::default();
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Observer lagged");
                    printer.print_new(&view, store.as_ref());
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
        if pump.is_finished() {
            view.flush().await;
            printer.print_new(&view, store.as_ref());
            break;
        }
    }

    Ok(())
}

/// Prints lines of the view that were not printed yet
#[derive(Default)]
struct Printer {
    /// Lines at or after this one have not been printed
    next_line: usize,
}

impl Printer {
    fn print_new(&mut self, view: &LogView, store: &MemorySource) {
        if view.is_filtered() {
            let snapshot = view.filter_snapshot();
            let start = snapshot.matched_lines.partition_point(|&l| l < self.next_line);
            for &line in &snapshot.matched_lines[start..] {
                if let Some(text) = store.line(line) {
                    let marker = if snapshot.hit_lines.binary_search(&line).is_ok() { ':' } else { '-' };
                    println!("{:>6}{} {}", line + 1, marker, text);
                }
                self.next_line = line + 1;
            }
        } else {
            let count = store.line_count();
            for line in self.next_line..count {
                if let Some(text) = store.line(line) {
                    println!("{text}");
                }
            }
            self.next_line = self.next_line.max(count);
        }
    }

    fn shift(&mut self, offset: usize) {
        self.next_line = self.next_line.saturating_sub(offset);
    }
}
