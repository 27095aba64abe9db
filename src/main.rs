use async_trait::async_trait;
use clap::{Arg, Command};
use log::LevelFilter;
use scan_milter::session::{Gateway, Outcome, QuarantineSink, Session};
use scan_milter::{Config, Milter, PolicyEvaluator};
use std::fs::OpenOptions;
use std::process;

#[tokio::main]
async fn main() {
    let matches = Command::new("scan-milter")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Milter that submits every message part to a malware scanning backend")
        .long_about(
            "scan-milter decomposes each message into its attachments and bodies,\n\
             uploads every unit to a scan backend over HTTP and evaluates a\n\
             quarantine expression against the findings.\n\n\
             Logs go to stderr, or are appended to `log_file` when it is set and\n\
             -v is not given. The file is never rotated here; use logrotate with\n\
             copytruncate.",
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/scan-milter.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Validate the configuration and quarantine expression")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("test-email")
                .long("test-email")
                .value_name("FILE")
                .help("Run a raw message file through the scan pipeline (advisory mode)")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging on stderr")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("/etc/scan-milter.yaml");
    let verbose = matches.get_flag("verbose");

    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            process::exit(1);
        }
    };

    if let Err(e) = init_logger(verbose, config.log_file.as_deref()) {
        eprintln!("Error opening log file: {e:#}");
        process::exit(1);
    }
    log::info!("using config: {:?}", config);

    if matches.get_flag("test-config") {
        match PolicyEvaluator::compile(&config.quarantine_expression) {
            Ok(policy) => {
                println!("Configuration is valid.");
                println!("Scan endpoint: {}", config.scan_endpoint);
                println!("Quarantine expression: {}", policy.expression());
                println!(
                    "Mode: {}",
                    if config.active_mode { "active" } else { "advisory" }
                );
            }
            Err(e) => {
                println!("Configuration validation failed: {e}");
                process::exit(1);
            }
        }
        return;
    }

    if let Some(email_file) = matches.get_one::<String>("test-email") {
        test_email_file(&config, email_file).await;
        return;
    }

    let milter = match Milter::new(&config) {
        Ok(milter) => milter,
        Err(e) => {
            log::error!("Failed to start milter: {e:#}");
            process::exit(1);
        }
    };

    if let Err(e) = milter.run(shutdown_signal()).await {
        log::error!("Milter error: {e:#}");
        process::exit(1);
    }
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    if std::path::Path::new(path).exists() {
        Config::from_file(path)
    } else {
        eprintln!("Configuration file '{path}' not found, using default configuration");
        Ok(Config::default())
    }
}

fn generate_default_config(path: &str) {
    match Config::default().to_file(path) {
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

fn init_logger(verbose: bool, log_file: Option<&str>) -> anyhow::Result<()> {
    let log_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_level(log_level);

    if let (false, Some(path)) = (verbose, log_file) {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                log::warn!("Unable to listen for SIGTERM: {e}");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await.ok();

    log::info!("Received shutdown signal, stopping milter");
}

/// Used by `--test-email`; advisory mode never calls it.
struct NoQuarantine;

#[async_trait]
impl QuarantineSink for NoQuarantine {
    async fn quarantine(&self, _reason: &str) -> anyhow::Result<()> {
        anyhow::bail!("quarantine is not available outside the milter")
    }
}

async fn test_email_file(config: &Config, email_file: &str) {
    println!("Testing email file: {}", email_file);

    let raw = match std::fs::read(email_file) {
        Ok(raw) => raw,
        Err(e) => {
            eprintln!("Error reading email file: {e}");
            process::exit(1);
        }
    };

    let (parsed_headers, body_offset) = match mailparse::parse_headers(&raw) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("Error parsing email headers: {e}");
            process::exit(1);
        }
    };

    let mut advisory = config.clone();
    advisory.active_mode = false;
    let gateway = match Gateway::from_config(&advisory) {
        Ok(gateway) => gateway,
        Err(e) => {
            eprintln!("Error building scan pipeline: {e:#}");
            process::exit(1);
        }
    };

    let session = Session::new();
    for header in &parsed_headers {
        let (name, value) = (header.get_key(), header.get_value());
        if name.eq_ignore_ascii_case("from") {
            session.set_from(&value).await;
        } else if name.eq_ignore_ascii_case("to") {
            session.add_recipient(&value).await;
        }
        session.add_header(&name, &value).await;
    }
    session
        .append_body(&raw[body_offset..], gateway.max_message_size())
        .await;

    println!("Trace id: {}", session.trace_id());
    match session.finish(&gateway, &NoQuarantine).await {
        Outcome::SizeExceeded => {
            println!("Result: PASS (message exceeds max_message_size, not scanned)");
        }
        Outcome::ExtractionFailed(reason) => {
            println!("Result: PASS (message could not be decomposed: {reason})");
        }
        Outcome::Scanned(verdict) => {
            println!("Findings: {}", verdict.findings_count);
            if verdict.should_quarantine {
                println!("Result: QUARANTINE (advisory)");
            } else {
                println!("Result: ACCEPT");
            }
        }
    }
}
