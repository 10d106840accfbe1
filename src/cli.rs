use crate::admission::{AdmissionController, CommandContext};
use crate::config::types::{LabError, LabboxConfig};
use crate::config::validator::validate_config;
use crate::grading::{self, SubmissionContext};
use crate::kernel::signal::{request_shutdown, should_continue, ShutdownCoordinator};
use crate::lab::definition::LabDefinition;
use crate::lab::lease::LeasePool;
use crate::lab::orchestrator::Orchestrator;
use crate::lab::params::SubstitutionEngine;
use crate::lab::provision::LabProvisioner;
use crate::observability::audit::{audit_path, init_security_logger};
use crate::principal::{principal_name, Identity, Principal, PrincipalManager};
use crate::terminal::{
    ClientEvent, EventSink, Gateway, InMemoryDirectory, JsonLineSink, LabSessionDirectory,
    TerminalEvent, TerminalManager,
};
use crate::utils::env_hygiene::EnvPolicy;
use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use crossbeam_channel::RecvTimeoutError;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (JSON); falls back to LABBOX_CONFIG, then defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a console command against admission rules without running it
    Validate {
        #[arg(long)]
        command: String,
        /// Working directory the command would run from
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Accessible resource (repeatable)
        #[arg(long = "resource", value_name = "PATH")]
        resources: Vec<String>,
    },
    /// Validate and run a console command as a student's principal
    Exec {
        #[arg(long)]
        email: String,
        #[arg(long)]
        command: String,
        #[arg(long)]
        cwd: Option<PathBuf>,
        #[arg(long = "resource", value_name = "PATH")]
        resources: Vec<String>,
    },
    /// Resolve a lab's parameters without touching the filesystem
    Resolve {
        /// Lab definition (JSON)
        #[arg(long)]
        lab: PathBuf,
        #[arg(long)]
        email: String,
        /// Seed for reproducible draws
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Provision a lab for a student
    Start {
        #[arg(long)]
        lab: PathBuf,
        #[arg(long)]
        email: String,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Stop a student's lab and return its network leases
    Stop {
        #[arg(long)]
        lab: PathBuf,
        #[arg(long)]
        email: String,
    },
    /// Grade a submission
    Grade {
        #[arg(long)]
        lab: PathBuf,
        #[arg(long)]
        email: String,
        /// Answer (repeatable, in checkpoint order)
        #[arg(long = "answer")]
        answers: Vec<String>,
        /// JSON array of answers, used instead of --answer
        #[arg(long, conflicts_with = "answers")]
        answers_file: Option<PathBuf>,
        /// Local date flags are computed for (YYYY-MM-DD); defaults to today
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Print the expected flag for a student
    Flag {
        #[arg(long)]
        email: String,
        #[arg(long)]
        secret: String,
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Manage student principals
    Principal {
        #[command(subcommand)]
        action: PrincipalAction,
    },
    /// Drive the external lab orchestration tooling
    Orchestrate {
        #[command(subcommand)]
        action: OrchestrateAction,
    },
    /// Serve the terminal event protocol as JSON lines over stdin/stdout
    Serve {
        /// Lab sessions file: { "<id>": { "lab": ..., "student_folder": ..., "email": ... } }
        #[arg(long)]
        sessions: Option<PathBuf>,
    },
    /// Validate configuration and report warnings
    CheckConfig,
}

#[derive(Subcommand)]
enum PrincipalAction {
    /// Create the principal for an email if it does not exist
    Ensure {
        #[arg(long)]
        email: String,
    },
    /// Stop and delete the principal's lab folders, then remove the account
    /// with its processes and home
    Destroy {
        #[arg(long)]
        name: String,
    },
    /// Print the principal name derived from an email
    Name {
        #[arg(long)]
        email: String,
    },
}

#[derive(Subcommand)]
enum OrchestrateAction {
    Rebuild { folder: String },
    Start { folder: String },
    Stop { folder: String },
    Status { folder: String },
    Exec { folder: String, command: String },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_lab(path: &Path) -> Result<LabDefinition> {
    Ok(LabDefinition::load(path)?)
}

fn rng_for(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

fn current_dir_or(cwd: Option<PathBuf>) -> Result<PathBuf> {
    match cwd {
        Some(dir) => Ok(dir),
        None => std::env::current_dir().context("cannot determine working directory"),
    }
}

pub fn run() -> Result<()> {
    env_logger::init();

    if !cfg!(unix) {
        eprintln!("Error: labbox requires a Unix-like system (pseudo-terminals, process groups)");
        std::process::exit(1);
    }

    let cli = Cli::parse();
    let config = LabboxConfig::load(cli.config.as_deref())?;

    if let Err(e) = init_security_logger(config.audit_log.clone()) {
        eprintln!("Failed to initialize security logger: {}", e);
        std::process::exit(1);
    }

    match dispatch(cli.command, config) {
        Ok(0) => Ok(()),
        Ok(code) => std::process::exit(code),
        Err(e) => match e.downcast_ref::<LabError>() {
            Some(lab_error) => {
                eprintln!("Error: {}", lab_error);
                std::process::exit(lab_error.exit_code());
            }
            None => Err(e),
        },
    }
}

fn dispatch(command: Commands, config: LabboxConfig) -> Result<i32> {
    let validation = validate_config(&config)?;
    for warning in &validation.warnings {
        log::warn!("config: {}", warning);
    }

    match command {
        Commands::Validate {
            command,
            cwd,
            resources,
        } => {
            let cwd = current_dir_or(cwd)?;
            let admission =
                AdmissionController::new(config.admission.clone(), EnvPolicy::from_terminal(&config.terminal));
            let verdict = admission.validate(&command, &resources, &cwd);
            print_json(&verdict)?;
            verdict.into_result()?;
            Ok(0)
        }
        Commands::Exec {
            email,
            command,
            cwd,
            resources,
        } => {
            let cwd = current_dir_or(cwd)?;
            let identity = Identity::new(email)?;
            let principals = PrincipalManager::from_config(&config.principal);
            let principal = principals.ensure(&identity).unwrap_or_else(|e| {
                log::warn!("Principal unavailable, running as service account: {}", e);
                Principal::service_fallback(&identity.principal_name(), cwd.clone(), "/bin/sh".into())
            });
            let admission =
                AdmissionController::new(config.admission.clone(), EnvPolicy::from_terminal(&config.terminal));
            let session_id = uuid::Uuid::new_v4().to_string();
            let ctx = CommandContext {
                session_id: &session_id,
                principal: &principal,
                current_dir: &cwd,
                accessible_resources: &resources,
            };
            let execution = admission.submit(&command, &ctx);
            print_json(&execution.log)?;
            let log = execution.into_result(admission.config().command_timeout())?;
            Ok(log.exit_code)
        }
        Commands::Resolve { lab, email, seed } => {
            let lab = load_lab(&lab)?;
            let identity = Identity::new(email)?;
            let pool = LeasePool::from_specs(
                &config.provisioning.leases,
                config.provisioning.exclusive_leases,
            )?;
            let engine = SubstitutionEngine::new(Arc::new(pool), config.provisioning.parameter_mode);
            let tokens = engine.resolve(&lab, &identity.principal_name(), &mut rng_for(seed))?;
            print_json(&tokens)?;
            Ok(0)
        }
        Commands::Start { lab, email, seed } => {
            let lab = load_lab(&lab)?;
            let identity = Identity::new(email)?;
            let principals = Arc::new(PrincipalManager::from_config(&config.principal));
            let provisioner = LabProvisioner::from_config(&config, principals)?;
            let report = provisioner.start_with_rng(&lab, &identity, &mut rng_for(seed))?;
            for warning in &report.warnings {
                eprintln!("Warning: {}", warning);
            }
            print_json(&report)?;
            Ok(0)
        }
        Commands::Stop { lab, email } => {
            let lab = load_lab(&lab)?;
            let identity = Identity::new(email)?;
            let principals = Arc::new(PrincipalManager::from_config(&config.principal));
            let provisioner = LabProvisioner::from_config(&config, principals)?;
            let report = provisioner.stop(&lab, &identity);
            for warning in &report.warnings {
                eprintln!("Warning: {}", warning);
            }
            print_json(&report)?;
            Ok(if report.warnings.is_empty() { 0 } else { 1 })
        }
        Commands::Grade {
            lab,
            email,
            answers,
            answers_file,
            date,
        } => {
            let lab = load_lab(&lab)?;
            let answers = match answers_file {
                Some(path) => {
                    let text = std::fs::read_to_string(&path)
                        .with_context(|| format!("failed to read {}", path.display()))?;
                    serde_json::from_str::<Vec<String>>(&text)
                        .map_err(|e| LabError::InvalidSubmission(e.to_string()))?
                }
                None => answers,
            };
            let ctx = SubmissionContext {
                email,
                date: date.unwrap_or_else(|| Local::now().date_naive()),
            };
            let report = grading::score(&lab, &answers, &ctx)?;
            print_json(&report)?;
            Ok(if report.passed { 0 } else { 1 })
        }
        Commands::Flag {
            email,
            secret,
            date,
        } => {
            let date = date.unwrap_or_else(|| Local::now().date_naive());
            println!("{}", grading::compute_expected_flag(date, &email, &secret));
            Ok(0)
        }
        Commands::Principal { action } => run_principal(action, &config),
        Commands::Orchestrate { action } => run_orchestrate(action, &config),
        Commands::Serve { sessions } => serve(&config, sessions),
        Commands::CheckConfig => {
            println!("Configuration valid");
            for warning in &validation.warnings {
                println!("  warning: {}", warning);
            }
            if let Some(path) = audit_path() {
                println!("Audit log: {}", path.display());
            }
            Ok(0)
        }
    }
}

fn run_principal(action: PrincipalAction, config: &LabboxConfig) -> Result<i32> {
    match action {
        PrincipalAction::Name { email } => {
            println!("{}", principal_name(&email));
        }
        PrincipalAction::Ensure { email } => {
            let identity = Identity::new(email)?;
            let principal = PrincipalManager::from_config(&config.principal).ensure(&identity)?;
            print_json(&principal)?;
        }
        PrincipalAction::Destroy { name } => {
            let principals = Arc::new(PrincipalManager::from_config(&config.principal));
            let provisioner = LabProvisioner::from_config(config, principals)?;
            let report = provisioner.retire_principal(&name)?;
            for warning in &report.warnings {
                eprintln!("Warning: {}", warning);
            }
            print_json(&report)?;
            eprintln!("Principal {} destroyed", name);
        }
    }
    Ok(0)
}

fn run_orchestrate(action: OrchestrateAction, config: &LabboxConfig) -> Result<i32> {
    let orchestrator = Orchestrator::from_config(&config.provisioning);
    let outcome = match action {
        OrchestrateAction::Rebuild { folder } => orchestrator.rebuild(&folder)?,
        OrchestrateAction::Start { folder } => orchestrator.start(&folder)?,
        OrchestrateAction::Stop { folder } => orchestrator.stop(&folder)?,
        OrchestrateAction::Exec { folder, command } => orchestrator.exec(&folder, &command)?,
        OrchestrateAction::Status { folder } => {
            let status = orchestrator.status(&folder)?;
            print_json(&status)?;
            return Ok(if status.running { 0 } else { 1 });
        }
    };
    print_json(&outcome)?;
    Ok(outcome.exit_code)
}

/// One gateway connection over stdio until EOF or a shutdown signal
fn serve(config: &LabboxConfig, sessions: Option<PathBuf>) -> Result<i32> {
    let mut coordinator = ShutdownCoordinator::new()?;

    let directory: Arc<dyn LabSessionDirectory> = match sessions {
        Some(path) => Arc::new(InMemoryDirectory::load(path)?),
        None => Arc::new(InMemoryDirectory::new()),
    };
    let terminals = Arc::new(TerminalManager::new(config.terminal.clone()));
    let gateway = Gateway {
        mode: config.terminal.mode,
        terminals: terminals.clone(),
        admission: Arc::new(AdmissionController::new(
            config.admission.clone(),
            EnvPolicy::from_terminal(&config.terminal),
        )),
        principals: Arc::new(PrincipalManager::from_config(&config.principal)),
        directory,
    };

    {
        let terminals = terminals.clone();
        coordinator.register_cleanup(move || terminals.close_all());
    }

    let sink: Arc<dyn EventSink> = Arc::new(JsonLineSink::new(std::io::stdout()));
    let mut connection = gateway.connect(sink.clone());

    let (tx, rx) = crossbeam_channel::unbounded::<String>();
    std::thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        })
        .context("failed to start stdin reader")?;

    log::info!("Serving terminal events on stdio ({:?} mode)", config.terminal.mode);
    while should_continue() {
        let line = match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(line) => line,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                request_shutdown();
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<ClientEvent>(&line) {
            Ok(event) => {
                if let Err(e) = connection.handle(event) {
                    log::warn!("Event handling failed: {}", e);
                }
            }
            Err(e) => {
                log::warn!("Malformed client event: {}", e);
                sink.emit(TerminalEvent::error("Error: malformed event"))?;
            }
        }
    }

    connection.disconnect();
    coordinator.run_cleanup();
    Ok(0)
}
