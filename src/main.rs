use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use todb::error::Outcome;
use todb::formats::DecodePolicy;
use todb::runner::{ImportArgs, ImportSummary, run_import};

#[derive(Parser, Clone)]
#[command(version, about = "Import delimited text files into a database table")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Subcommand)]
enum Command {
    Load {
        /// JSON model file with the file dialect, columns and primary key
        #[arg(short, long)]
        model: PathBuf,

        /// Delimited input file
        #[arg(short, long)]
        input: PathBuf,

        /// Database URL (postgres://..., postgresql://... or sqlite:...)
        #[arg(short, long)]
        db_url: String,

        /// File that rejected rows are appended to
        #[arg(short, long)]
        fail_output: PathBuf,

        /// Target table name (default: <input file name>_<HH_MM_SS>)
        #[arg(short, long)]
        table: Option<String>,

        /// Number of workers, each with its own connection (1-128)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Size of the read buffer in kB (1-64000)
        #[arg(long)]
        chunk_kb: Option<usize>,

        /// What to do with a chunk that cannot be decoded (skip, fail-fast)
        #[arg(long, default_value = "skip", value_parser = cli::parse_decode_policy)]
        decode_policy: DecodePolicy,

        /// Quiet mode - minimal output, only show summary
        #[arg(short, long)]
        quiet: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let outcome = match args.command {
        Command::Load {
            model,
            input,
            db_url,
            fail_output,
            table,
            workers,
            chunk_kb,
            decode_policy,
            quiet,
        } => {
            run_loader(ImportArgs {
                model_path: model,
                input_path: input,
                db_url,
                fail_output_path: fail_output,
                table_name: table,
                worker_count: workers,
                chunk_size_kb: chunk_kb,
                decode_policy,
                quiet,
            })
            .await
        }
    };

    ExitCode::from(outcome.exit_code() as u8)
}

async fn run_loader(args: ImportArgs) -> Outcome {
    // Initialize tracing based on quiet mode
    use tracing_subscriber::{EnvFilter, FmtSubscriber};
    let filter = if args.quiet {
        EnvFilter::new("todb=warn,sqlx=off")
    } else {
        EnvFilter::new("todb=info,sqlx=off")
    };
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    if !args.quiet {
        println!("todb");
        println!("====");
        println!("Model: {}", args.model_path.display());
        println!("Input: {}", args.input_path.display());
        println!("Failures: {}", args.fail_output_path.display());
        println!();
    }

    match run_import(args).await {
        Ok(summary) => {
            print_summary(&summary);
            Outcome::Success
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            e.outcome()
        }
    }
}

fn print_summary(summary: &ImportSummary) {
    let seconds = summary.duration.as_secs_f64();

    println!();
    println!("Import Summary");
    println!("==============");
    println!("Table: {}", summary.table_name);
    println!("Rows read: {}", summary.rows_read);
    println!("Rows committed: {}", summary.rows_committed);
    println!("Rows failed: {}", summary.rows_failed);
    println!("Rows in table: {}", summary.table_row_count);
    println!("Duration: {:.2}s", seconds);
    if seconds > 0.0 {
        println!(
            "Throughput: {:.2} rows/sec",
            summary.rows_committed as f64 / seconds
        );
    }

    if let Some(ref path) = summary.failure_file {
        println!();
        println!("Rejected rows were appended to:");
        println!("  {}", path.display());
    }
}

/// CLI utility functions for parsing command-line arguments
mod cli {
    use todb::formats::DecodePolicy;

    pub fn parse_decode_policy(s: &str) -> Result<DecodePolicy, String> {
        DecodePolicy::parse(s).map_err(|e| e.to_string())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_parse_decode_policy() {
            assert_eq!(parse_decode_policy("skip").unwrap(), DecodePolicy::Skip);
            assert_eq!(
                parse_decode_policy("Fail-Fast").unwrap(),
                DecodePolicy::FailFast
            );
            assert!(parse_decode_policy("retry").is_err());
        }
    }
}
