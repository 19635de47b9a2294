use bill_ingest::ingestion_log::IngestionLog;
use bill_ingest::service::{classify_file, Outcome, RunReport};
use bill_ingest::triage;
use bill_ingest::{ClassificationPolicy, Config, IngestionService, PollMode, VendorMatcher};
use clap::{Arg, ArgAction, Command};
use log::LevelFilter;
use std::process;

fn cli() -> Command {
    Command::new("bill-ingest")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Pull invoices and bills out of an IMAP mailbox into the upload store")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/bill-ingest.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Validate the configuration and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("once")
                .long("once")
                .help("Run a single ingestion cycle and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("daemon")
                .short('d')
                .long("daemon")
                .help("Poll the mailbox until interrupted (default)")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("backfill-days")
                .long("backfill-days")
                .value_name("DAYS")
                .help("Re-scan messages received in the last DAYS days")
                .value_parser(clap::value_parser!(u32))
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("force")
                .long("force")
                .help("With --backfill-days, reprocess messages already in the log")
                .requires("backfill-days")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("reingest")
                .long("reingest")
                .value_name("UID")
                .help("Ingest one message by UID regardless of classification")
                .value_parser(clap::value_parser!(u32))
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("test-email")
                .long("test-email")
                .value_name("FILE")
                .help("Classify a local .eml file without ingesting it")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("stats")
                .long("stats")
                .help("Show ingestion log statistics")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("triage")
                .long("triage")
                .help("List recently skipped messages with a re-ingest recommendation")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(ArgAction::SetTrue),
        )
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("/etc/bill-ingest.yaml");
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            process::exit(1);
        }
    };

    if let Some(email_file) = matches.get_one::<String>("test-email") {
        test_email_file(&config, email_file).await;
        return;
    }

    if matches.get_flag("test-config") {
        test_config(&config);
        return;
    }

    if matches.get_flag("stats") {
        show_stats(&config);
        return;
    }

    if matches.get_flag("triage") {
        show_triage(&config);
        return;
    }

    if let Err(e) = config.validate() {
        eprintln!("❌ Invalid configuration: {e}");
        process::exit(1);
    }

    let service = match IngestionService::from_config(config) {
        Ok(service) => service,
        Err(e) => {
            eprintln!("❌ Failed to start ingestion service: {e:#}");
            process::exit(1);
        }
    };

    let one_shot = if let Some(uid) = matches.get_one::<u32>("reingest") {
        Some(PollMode::Single {
            uid: *uid,
            bypass_policy: true,
        })
    } else if let Some(days) = matches.get_one::<u32>("backfill-days") {
        Some(PollMode::Backfill {
            days: *days,
            force: matches.get_flag("force"),
        })
    } else if matches.get_flag("once") {
        Some(PollMode::Incremental)
    } else {
        None
    };

    if let Some(mode) = one_shot {
        let report = service.poll_once(mode).await;
        print_report(&report);
        if report.has_errors() {
            process::exit(1);
        }
        return;
    }

    log::info!("Starting bill-ingest for user '{}'...", service.config().user_id);
    service.run(shutdown_signal()).await;
    log::info!("bill-ingest stopped");
}

/// Resolves on Ctrl-C, or on SIGTERM from a service manager
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => log::info!("Received Ctrl-C"),
        _ = terminate => log::info!("Received SIGTERM"),
    }
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}

fn test_config(config: &Config) {
    println!("🔍 Testing configuration...");
    println!();
    println!("User: {}", config.user_id);
    println!(
        "Mailbox: {}@{}:{} / {} ({})",
        config.imap.username,
        config.imap.host,
        config.imap.port,
        config.imap.mailbox,
        if config.imap.tls { "TLS" } else { "STARTTLS" }
    );
    println!("Database: {}", config.database_path);
    println!("Upload directory: {}", config.storage.upload_dir);
    println!("Number of vendors: {}", config.vendors.len());
    for vendor in &config.vendors {
        let state = if vendor.is_active { "" } else { " (inactive)" };
        println!("  • {}{state}", vendor.name);
    }
    println!(
        "LLM tier: {}",
        if config.classification.llm.is_usable() {
            format!("{} via {}", config.classification.llm.model, config.classification.llm.base_url)
        } else {
            "disabled".to_string()
        }
    );
    println!();

    if let Err(e) = config.validate() {
        println!("❌ Configuration validation failed:");
        println!("Error: {e}");
        process::exit(1);
    }
    match ClassificationPolicy::from_settings(
        &config.classification,
        VendorMatcher::new(config.vendors.clone()),
    ) {
        Ok(_) => println!("✅ Configuration is valid"),
        Err(e) => {
            println!("❌ Classification settings are invalid: {e:#}");
            process::exit(1);
        }
    }
}

fn open_log(config: &Config) -> IngestionLog {
    match IngestionLog::open(&config.database_path) {
        Ok(log) => log,
        Err(e) => {
            println!("❌ Failed to access ingestion database: {e:#}");
            process::exit(1);
        }
    }
}

fn show_stats(config: &Config) {
    let log = open_log(config);
    let summary = match log.summary(&config.user_id) {
        Ok(summary) => summary,
        Err(e) => {
            println!("❌ Failed to read statistics: {e:#}");
            process::exit(1);
        }
    };

    println!("📊 Ingestion Statistics for {}", config.user_id);
    println!("═══════════════════════════════════════");
    println!("  Messages Seen: {}", summary.total);
    if summary.total > 0 {
        let pct = |n: u64| n as f64 / summary.total as f64 * 100.0;
        println!("  ├─ Ingested: {} ({:.1}%)", summary.ingested, pct(summary.ingested));
        println!("  ├─ Skipped: {} ({:.1}%)", summary.skipped, pct(summary.skipped));
        println!("  ├─ Errors: {} ({:.1}%)", summary.errors, pct(summary.errors));
        println!("  └─ Pending: {} ({:.1}%)", summary.pending, pct(summary.pending));
    }
    if let Some(last) = &summary.last_activity {
        println!();
        println!("  Last Activity: {last}");
    }
}

fn show_triage(config: &Config) {
    let log = open_log(config);
    let entries = match log.recent(&config.user_id, 100) {
        Ok(entries) => entries,
        Err(e) => {
            println!("❌ Failed to read ingestion log: {e:#}");
            process::exit(1);
        }
    };
    let vendors = VendorMatcher::new(config.vendors.clone()).active_names();

    let skipped: Vec<_> = entries.iter().filter(|e| e.was_skipped()).collect();
    if skipped.is_empty() {
        println!("📭 No skipped messages to review");
        return;
    }

    println!("📋 Skipped messages ({} total)", skipped.len());
    println!("═══════════════════════════════════════");
    for entry in skipped {
        let rec = triage::recommend(entry, &vendors);
        let mark = if rec.should_process { "👉" } else { "  " };
        println!(
            "{mark} UID {:<8} {:<40} {}",
            entry.uid,
            truncate_string(entry.subject.as_deref().unwrap_or("(no subject)"), 40),
            entry.from.as_deref().unwrap_or("")
        );
        println!("     {} ({:.0}%)", rec.reason, rec.confidence * 100.0);
    }
    println!();
    println!("💡 Re-ingest a message with: bill-ingest --reingest <UID>");
}

fn print_report(report: &RunReport) {
    println!(
        "📬 {}: fetched {}, ingested {}, skipped {}, already recorded {}, failed {}",
        report.mailbox,
        report.total_fetched,
        report.ingested,
        report.skipped,
        report.already_recorded,
        report.failed
    );
    for detail in &report.details {
        let icon = match detail.outcome {
            Outcome::Ingested => "✅",
            Outcome::Skipped => "⏭️ ",
            Outcome::AlreadyRecorded => "🔁",
            Outcome::OutOfWindow => "🕰️ ",
            Outcome::Failed => "❌",
        };
        println!(
            "  {icon} UID {:<8} {:<40} {}",
            detail.uid,
            truncate_string(detail.subject.as_deref().unwrap_or("(no subject)"), 40),
            detail.reason
        );
    }
    for error in &report.errors {
        eprintln!("❌ {error}");
    }
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

async fn test_email_file(config: &Config, email_file: &str) {
    println!("🧪 Testing email file: {email_file}");
    println!();

    let policy = match ClassificationPolicy::from_settings(
        &config.classification,
        VendorMatcher::new(config.vendors.clone()),
    ) {
        Ok(policy) => policy,
        Err(e) => {
            eprintln!("❌ Invalid classification settings: {e:#}");
            process::exit(1);
        }
    };

    let (email, decision) = match classify_file(&policy, std::path::Path::new(email_file)).await {
        Ok(result) => result,
        Err(e) => {
            eprintln!("❌ {e:#}");
            process::exit(1);
        }
    };

    println!("From: {}", email.from_text());
    println!("Subject: {}", email.subject.as_deref().unwrap_or("(none)"));
    println!("Message-ID: {}", email.message_id.as_deref().unwrap_or("(none)"));
    println!("PDF attachments: {}", email.pdf_attachments().count());
    for pdf in email.pdf_attachments() {
        println!(
            "  • {} ({} bytes, sha256 {})",
            pdf.filename.as_deref().unwrap_or("(unnamed)"),
            pdf.content.len(),
            pdf.sha256_hex()
        );
    }
    println!();
    if decision.should_ingest() {
        println!("✅ Would ingest: {}", decision.reason());
    } else {
        println!("⏭️  Would skip: {}", decision.reason());
    }
}
