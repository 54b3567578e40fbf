//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Caseflow - compliance case pipeline
///
/// Take in identity documents for an applicant, run the analysis agents
/// over them, and record the officer's decision with a full audit trail.
///
/// Examples:
///   caseflow intake --name "Jane Doe" --dob 1990-04-01 --document passport.jpg
///   caseflow run 3f0c9a5e-8d5b-4a7e-9a51-0f4f6f0f2d11
///   caseflow run 3f0c9a5e-8d5b-4a7e-9a51-0f4f6f0f2d11 --sse
///   caseflow decide 3f0c9a5e-... --decision approved --justification "..." --officer-id o-17
///   caseflow audit 3f0c9a5e-... --officer-id o-17 --output audit.csv
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Path to configuration file
    ///
    /// If not specified, looks for .caseflow.toml in the current directory
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Location of the JSON state file shared between invocations
    #[arg(long, global = true, value_name = "FILE", env = "CASEFLOW_STATE_FILE")]
    pub state_file: Option<PathBuf>,

    /// Delay between the final pipeline event and stream closure
    #[arg(long, global = true, value_name = "MS")]
    pub grace_period_ms: Option<u64>,

    /// Enable verbose logging output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Generate a default .caseflow.toml configuration file
    InitConfig,

    /// Create a new pending case
    Intake {
        /// Applicant's full legal name
        #[arg(long)]
        name: String,

        /// Date of birth
        #[arg(long, value_name = "YYYY-MM-DD")]
        dob: Option<NaiveDate>,

        /// Nationality (ISO country code)
        #[arg(long)]
        nationality: Option<String>,

        /// Identity document to attach (repeatable)
        #[arg(short, long = "document", value_name = "FILE")]
        documents: Vec<PathBuf>,
    },

    /// Attach another document to an existing case
    AddDocument {
        case_id: Uuid,

        #[arg(value_name = "FILE")]
        path: PathBuf,
    },

    /// Run the agent pipeline for a case and follow its progress
    Run {
        case_id: Uuid,

        /// Reset a case in review and run every stage again
        #[arg(long)]
        retry: bool,

        /// Print the raw server-sent-event stream instead of spinners
        #[arg(long)]
        sse: bool,
    },

    /// List every case, oldest first
    List,

    /// Show a case, its agent runs and its progress history
    Status {
        case_id: Uuid,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Record an officer's decision
    Decide {
        case_id: Uuid,

        /// approved, denied or escalated
        #[arg(long)]
        decision: Option<String>,

        /// Written rationale for the decision
        #[arg(long)]
        justification: Option<String>,

        #[arg(long, env = "CASEFLOW_OFFICER_ID")]
        officer_id: Option<String>,

        #[arg(long)]
        officer_name: Option<String>,
    },

    /// Export a case's audit trail as CSV
    Audit {
        case_id: Uuid,

        /// Officer requesting the export; recorded in the trail
        #[arg(long, env = "CASEFLOW_OFFICER_ID")]
        officer_id: String,

        /// Write to a file instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        match &self.command {
            Command::Intake {
                name, documents, ..
            } => {
                if name.trim().is_empty() {
                    return Err("Applicant name must not be empty".to_string());
                }
                for path in documents {
                    check_file(path)?;
                }
            }
            Command::AddDocument { path, .. } => check_file(path)?,
            Command::Audit { officer_id, .. } if officer_id.trim().is_empty() => {
                return Err("Officer id must not be empty".to_string());
            }
            _ => {}
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}

fn check_file(path: &Path) -> Result<(), String> {
    if !path.exists() {
        return Err(format!("Document does not exist: {}", path.display()));
    }
    if !path.is_file() {
        return Err(format!("Document is not a file: {}", path.display()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_args(command: Command) -> Args {
        Args {
            command,
            config: None,
            state_file: None,
            grace_period_ms: None,
            verbose: false,
            quiet: false,
        }
    }

    #[test]
    fn test_parse_run_with_global_flags() {
        let id = Uuid::new_v4();
        let args = Args::try_parse_from([
            "caseflow",
            "run",
            &id.to_string(),
            "--sse",
            "--state-file",
            "/tmp/state.json",
            "-v",
        ])
        .unwrap();

        assert_eq!(
            args.command,
            Command::Run {
                case_id: id,
                retry: false,
                sse: true
            }
        );
        assert_eq!(args.state_file, Some(PathBuf::from("/tmp/state.json")));
        assert!(args.verbose);
    }

    #[test]
    fn test_parse_intake() {
        let args = Args::try_parse_from([
            "caseflow",
            "intake",
            "--name",
            "Jane Doe",
            "--dob",
            "1990-04-01",
            "-d",
            "a.jpg",
            "-d",
            "b.pdf",
        ])
        .unwrap();

        match args.command {
            Command::Intake {
                name,
                dob,
                documents,
                ..
            } => {
                assert_eq!(name, "Jane Doe");
                assert_eq!(dob, NaiveDate::from_ymd_opt(1990, 4, 1));
                assert_eq!(documents.len(), 2);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_rejects_bad_case_id() {
        assert!(Args::try_parse_from(["caseflow", "status", "not-a-uuid"]).is_err());
    }

    #[test]
    fn test_decide_fields_are_left_to_the_guard() {
        let id = Uuid::new_v4();
        let args =
            Args::try_parse_from(["caseflow", "decide", &id.to_string(), "--decision", "maybe"])
                .unwrap();
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_validation_missing_document() {
        let args = make_args(Command::Intake {
            name: "Jane Doe".to_string(),
            dob: None,
            nationality: None,
            documents: vec![PathBuf::from("/definitely/not/here.jpg")],
        });
        assert!(args.validate().is_err());

        let file = tempfile::NamedTempFile::new().unwrap();
        let args = make_args(Command::AddDocument {
            case_id: Uuid::new_v4(),
            path: file.path().to_path_buf(),
        });
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_validation_conflicting_options() {
        let mut args = make_args(Command::InitConfig);
        args.verbose = true;
        args.quiet = true;
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_log_level() {
        let mut args = make_args(Command::InitConfig);
        assert_eq!(args.log_level(), tracing::Level::INFO);

        args.verbose = true;
        assert_eq!(args.log_level(), tracing::Level::DEBUG);

        args.verbose = false;
        args.quiet = true;
        assert_eq!(args.log_level(), tracing::Level::ERROR);
    }
}
