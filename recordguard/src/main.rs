//! Operator CLI for the protection core. Key material is read from the
//! environment (or the config file named by `RECORDGUARD_CONFIG`) and is never
//! printed.

use std::env;
use std::process::ExitCode;

use chrono::Datelike;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use recordguard::config::{load_config, CoreConfig, ENV_LOG};
use recordguard::records::generate_claim_id;
use recordguard::{ProtectionCore, RecordFingerprint, Verification};

const ENV_CONFIG: &str = "RECORDGUARD_CONFIG";

fn print_usage() -> ExitCode {
    eprintln!(
        "Commands:\n  encrypt <plaintext>\n  decrypt <iv:ciphertext>\n  stamp <record-json>\n  verify <record-json> <signature> <algorithm-label>\n  claim-id [year]\n  show-config <path>"
    );
    ExitCode::from(2)
}

fn init_logging() {
    // The config file is read again by the command; only `logLevel` is used here.
    let config = match env::var(ENV_CONFIG) {
        Ok(path) => load_config(&path).unwrap_or_default(),
        Err(_) => CoreConfig::default(),
    };
    let directives = config.log_directives(env::var(ENV_LOG).ok());
    let filter = EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_core() -> Result<ProtectionCore, String> {
    let config = match env::var(ENV_CONFIG) {
        Ok(path) => load_config(&path).map_err(|e| format!("config load failed: {e}"))?,
        Err(_) => CoreConfig::from_env().map_err(|e| format!("config load failed: {e}"))?,
    };
    config.build().map_err(|e| format!("core setup failed: {e}"))
}

fn parse_record(text: &str) -> Result<Value, String> {
    serde_json::from_str(text).map_err(|e| format!("invalid record json: {e}"))
}

fn run(args: &[String]) -> Result<(), String> {
    match args[1].as_str() {
        "encrypt" => {
            let core = load_core()?;
            let blob = core
                .cipher
                .encrypt(&args[2])
                .map_err(|e| format!("encryption failed: {e}"))?;
            println!("{blob}");
        }
        "decrypt" => {
            let core = load_core()?;
            match core.cipher.decrypt(&args[2]) {
                Ok(text) => println!("{text}"),
                Err(err) if err.is_security_event() => {
                    return Err("record unreadable: integrity check failed".to_string())
                }
                Err(err) => return Err(format!("record unreadable: {err}")),
            }
        }
        "stamp" => {
            let core = load_core()?;
            let record = parse_record(&args[2])?;
            let fingerprint = core
                .stamper
                .compute(&record)
                .map_err(|e| format!("stamping failed: {e}"))?;
            let out = json!({
                "signature_data": fingerprint.value,
                "signing_algorithm": fingerprint.algorithm_label(),
            });
            println!("{out}");
        }
        "verify" => {
            let core = load_core()?;
            let record = parse_record(&args[2])?;
            let stored = RecordFingerprint::from_stored(&args[3], &args[4])
                .map_err(|e| format!("invalid stored signature: {e}"))?;
            let outcome = core
                .stamper
                .verify(&record, Some(&stored))
                .map_err(|e| format!("verification failed: {e}"))?;
            match outcome {
                Verification::Intact => println!("intact"),
                Verification::WeakLegacy => println!("intact (legacy 32-bit checksum, weak)"),
                Verification::Absent => println!("absent"),
                Verification::Mismatch => return Err("mismatch".to_string()),
            }
        }
        "claim-id" => {
            let year = match args.get(2) {
                Some(text) => text
                    .parse::<i32>()
                    .map_err(|_| format!("invalid year: {text}"))?,
                None => chrono::Utc::now().year(),
            };
            println!("{}", generate_claim_id(year));
        }
        "show-config" => {
            let config = load_config(&args[2]).map_err(|e| format!("config load failed: {e}"))?;
            let algorithm = config
                .stamper
                .algorithm()
                .map_err(|e| format!("config invalid: {e}"))?;
            let printable = json!({
                "cipher": {
                    "secretEnv": config.cipher.secret_env,
                    "keyEnv": config.cipher.key_env,
                    "keyPath": config.cipher.key_path,
                    "kdf": format!("{:?}", config.cipher.kdf).to_lowercase(),
                    "salt": config.cipher.salt_b64.as_ref().map(|_| "<configured>"),
                },
                "stamper": { "algorithm": algorithm.label() },
                "logLevel": config.log_level,
            });
            let text = serde_json::to_string_pretty(&printable)
                .map_err(|e| format!("render failed: {e}"))?;
            println!("{text}");
        }
        other => return Err(format!("unknown command: {other}")),
    }
    Ok(())
}

fn expected_args(command: &str) -> Option<std::ops::RangeInclusive<usize>> {
    match command {
        "encrypt" | "decrypt" | "stamp" | "show-config" => Some(3..=3),
        "verify" => Some(5..=5),
        "claim-id" => Some(2..=3),
        _ => None,
    }
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        return print_usage();
    }
    match expected_args(&args[1]) {
        Some(range) if range.contains(&args.len()) => {}
        _ => return print_usage(),
    }

    init_logging();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("{message}");
            ExitCode::FAILURE
        }
    }
}
