use clap::{Parser, Subcommand};
use reframe::codec::RustCodec;
use reframe::config;
use reframe::pipeline::{ErrorClass, Pipeline};
use reframe::request::RequestIdentity;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

fn version_string() -> &'static str {
    let on_tag = env!("ON_RELEASE_TAG");
    if on_tag == "true" {
        env!("CARGO_PKG_VERSION")
    } else {
        let hash = env!("GIT_HASH");
        if hash.is_empty() {
            "dev@unknown"
        } else {
            // Leaked once at startup — trivial, called exactly once
            Box::leak(format!("dev@{hash}").into_boxed_str())
        }
    }
}

#[derive(Parser)]
#[command(name = "reframe")]
#[command(about = "On-demand image transformation proxy")]
#[command(long_about = "\
On-demand image transformation proxy

Resizes, crops, and recompresses images named by a compact parameter
string, caching every rendition so identical requests are served from
disk. Typically driven by a web server rewrite rule; the render command
exercises the same pipeline from the shell.

Request format:

  <params>/<path>   e.g.  w300-h300-c1.1.smart/photos/cat.jpg

  w<px>    maximum width           h<px>    maximum height
  c<w.h>   crop ratio, optional third token picks the cropper
           (centered, topcentered, smart)
  q<0-100> JPEG quality            p<0|1>   progressive JPEG
  b<hex>   background fill color   g<0|1>   grayscale

Run 'reframe gen-config' to generate a documented reframe.toml.")]
#[command(version = version_string())]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = "reframe.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Render one request URI and write the image bytes
    Render {
        /// Request URI, e.g. "w300-h200/photos/cat.jpg"
        uri: String,

        /// Host the request identity is scoped to
        #[arg(long, default_value = "localhost")]
        host: String,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Sweep stale entries out of the cache
    Gc,
    /// Print a stock reframe.toml with all options documented
    GenConfig,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Render { uri, host, output } => {
            let config = config::load_config(&cli.config)?;
            let pipeline = Pipeline::new(config, RustCodec);

            let rendition = pipeline
                .handle(&RequestIdentity::new(host, uri))
                .map_err(|err| {
                    let class = match err.class() {
                        ErrorClass::Client => "invalid request",
                        ErrorClass::NotFound => "not found",
                        ErrorClass::Server => "internal",
                    };
                    format!("{class}: {err}")
                })?;

            eprintln!(
                "{} ({}, {} bytes)",
                rendition.status.label(),
                rendition.mime,
                rendition.bytes.len()
            );

            match output {
                Some(path) => std::fs::write(path, &rendition.bytes)?,
                None => std::io::stdout().write_all(&rendition.bytes)?,
            }
        }
        Command::Gc => {
            let config = config::load_config(&cli.config)?;
            let pipeline = Pipeline::new(config, RustCodec);
            match pipeline.run_garbage_collection()? {
                Some(stats) => println!(
                    "examined {} entries, deleted {}",
                    stats.examined, stats.deleted
                ),
                None => println!("another sweep is already running"),
            }
        }
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
        }
    }

    Ok(())
}
