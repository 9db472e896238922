//! # Knob Diagnostic Tool
//!
//! Offline inspection of knob definition files:
//!
//! - `validate`: check a document for duplicate ids, dangling group
//!   references and malformed limit settings; exits nonzero on problems.
//! - `show`: print a human-readable summary of a document, or the full
//!   document as JSON with `--json`.

use clap::{Parser, Subcommand};
use knob_store::Document;
use std::path::PathBuf;
use std::process;
use tracing::{error, info};

/// Knob definition file inspector
#[derive(Parser, Debug)]
#[command(name = "knob_diagnostic")]
#[command(version)]
#[command(about = "Validate and inspect knob definition files")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging (DEBUG level).
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check a knob document for internal inconsistencies.
    Validate {
        /// Path to the knob definition TOML.
        file: PathBuf,
    },
    /// Print a summary of a knob document.
    Show {
        /// Path to the knob definition TOML.
        file: PathBuf,

        /// Print the full document as JSON instead of a summary.
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let args = Args::parse();
    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(level)
        .init();

    if let Err(e) = run(&args) {
        error!("FATAL: {e}");
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    match &args.command {
        Command::Validate { file } => {
            let document = Document::load(file)?;
            let problems = document.validate();
            if problems.is_empty() {
                info!(
                    knobs = document.knobs.len(),
                    groups = document.groups.len(),
                    "document is consistent"
                );
                Ok(())
            } else {
                for problem in &problems {
                    error!("{problem}");
                }
                Err(format!("{} problem(s) found", problems.len()).into())
            }
        }
        Command::Show { file, json } => {
            let document = Document::load(file)?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&document)?);
            } else {
                print!("{}", summarize(&document));
            }
            Ok(())
        }
    }
}

/// Human-readable one-screen summary of a document.
fn summarize(document: &Document) -> String {
    let mut out = String::new();
    for knob in &document.knobs {
        out.push_str(&format!(
            "knob {} \"{}\" ({} elements)\n",
            knob.id,
            knob.name,
            knob.elements.len()
        ));
        for element in &knob.elements {
            let pv = element.pv.as_deref().unwrap_or("<detached>");
            let limits = if element.using_custom_limits {
                format!(
                    "custom [{}, {}]",
                    element.custom_lower_limit.unwrap_or(f64::NAN),
                    element.custom_upper_limit.unwrap_or(f64::NAN)
                )
            } else {
                "remote".to_string()
            };
            let wrap = if element.wraps_value_around_limits {
                ", wraps"
            } else {
                ""
            };
            out.push_str(&format!(
                "  {pv}  coefficient {}  limits {limits}{wrap}\n",
                element.coefficient
            ));
        }
    }
    for group in &document.groups {
        out.push_str(&format!(
            "group \"{}\": knobs {:?}\n",
            group.label, group.knob_ids
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use knob_store::{ElementRecord, GroupRecord, KnobRecord};

    fn sample() -> Document {
        Document {
            knobs: vec![KnobRecord {
                id: 3,
                name: "phase".to_string(),
                elements: vec![ElementRecord {
                    pv: Some("DIP:PHASE".to_string()),
                    coefficient: 1.0,
                    using_custom_limits: true,
                    custom_lower_limit: Some(-180.0),
                    custom_upper_limit: Some(180.0),
                    wraps_value_around_limits: true,
                }],
            }],
            groups: vec![GroupRecord {
                label: "rf".to_string(),
                knob_ids: vec![3],
            }],
        }
    }

    #[test]
    fn summary_names_knobs_elements_and_groups() {
        let text = summarize(&sample());
        assert!(text.contains("knob 3 \"phase\" (1 elements)"));
        assert!(text.contains("DIP:PHASE"));
        assert!(text.contains("custom [-180, 180]"));
        assert!(text.contains("wraps"));
        assert!(text.contains("group \"rf\": knobs [3]"));
    }

    #[test]
    fn detached_elements_show_as_such() {
        let mut document = sample();
        document.knobs[0].elements[0].pv = None;
        document.knobs[0].elements[0].using_custom_limits = false;
        let text = summarize(&document);
        assert!(text.contains("<detached>"));
        assert!(text.contains("limits remote"));
    }

    #[test]
    fn validate_accepts_a_consistent_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        sample().save(file.path()).unwrap();

        let args = Args {
            command: Command::Validate {
                file: file.path().to_path_buf(),
            },
            verbose: false,
        };
        assert!(run(&args).is_ok());
    }

    #[test]
    fn validate_rejects_a_file_with_problems() {
        let mut document = sample();
        document.groups[0].knob_ids.push(99);
        let file = tempfile::NamedTempFile::new().unwrap();
        document.save(file.path()).unwrap();

        let args = Args {
            command: Command::Validate {
                file: file.path().to_path_buf(),
            },
            verbose: false,
        };
        let err = run(&args).unwrap_err();
        assert!(err.to_string().contains("1 problem(s) found"));
    }
}
