//! Certificate management utility.
//!
//! Gets the status of a certificate, revokes a certificate, or approves or
//! denies a pending certificate request, by certificate id
//! (`<issuer>:<serial>`) or from a PKCS#12 certificate file.

use std::io::Write;
use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use clap::error::ErrorKind;
use clap::{ArgGroup, Parser, ValueEnum};
use secrecy::SecretString;

use pvacms::admin_channel::{request_over_socket, Request, Response};
use pvacms::crypto::{load_keychain, status_uri_from_cert};
use pvacms::error::CmsError;
use pvacms::peer_status::CertStatusManager;
use pvacms::status::{parse_status_pv_name, StatusValue};

const EXIT_OK: i32 = 0;
const EXIT_USAGE: i32 = 1;
const EXIT_CONFLICT: i32 = 2;
const EXIT_FAILED: i32 = 3;
const EXIT_TIMEOUT: i32 = 4;
const EXIT_INTERRUPTED: i32 = 5;
const EXIT_UNHANDLED: i32 = 6;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Delta,
    Tree,
}

#[derive(Parser, Debug)]
#[command(
    name = "pvacert",
    about = "Certificate management utility for PVACMS",
    disable_version_flag = true
)]
#[command(group(ArgGroup::new("action").multiple(false)))]
struct Options {
    /// Certificate id: <issuer>:<serial>, where <issuer> is the first 8 hex
    /// digits of the CA's subject key identifier
    cert_id: Option<String>,

    /// Read the certificate from a PKCS#12 file instead
    #[arg(short = 'f', long = "file")]
    file: Option<PathBuf>,

    /// APPROVE a pending certificate request (admin only)
    #[arg(short = 'A', long = "approve", group = "action")]
    approve: bool,

    /// DENY a pending certificate request (admin only)
    #[arg(short = 'D', long = "deny", group = "action")]
    deny: bool,

    /// REVOKE a certificate (admin only)
    #[arg(short = 'R', long = "revoke", group = "action")]
    revoke: bool,

    /// Operation timeout in seconds
    #[arg(short = 'w', long = "timeout", default_value_t = 5.0)]
    timeout: f64,

    /// Prompt for the certificate file password
    #[arg(short = 'p', long = "password")]
    password: bool,

    /// Output format
    #[arg(short = 'F', long = "format", value_enum, default_value_t = Format::Delta)]
    format: Format,

    /// Maximum number of array elements to print; 0 for unlimited
    #[arg(short = '#', long = "limit", default_value_t = 20)]
    limit: u64,

    /// Verbose mode
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Debug mode
    #[arg(short = 'd', long = "debug")]
    debug: bool,

    /// Print version and exit
    #[arg(short = 'V', long = "version")]
    version: bool,

    /// Management socket of the PVACMS service
    #[arg(long = "socket", default_value = "/tmp/pvacms.sock")]
    socket: PathBuf,
}

fn main() {
    let options = match Options::try_parse() {
        Ok(options) => options,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                    let _ = e.print();
                    exit(EXIT_OK);
                }
                ErrorKind::ArgumentConflict => EXIT_CONFLICT,
                _ => EXIT_USAGE,
            };
            let _ = e.print();
            exit(code);
        }
    };
    exit(run(options));
}

fn run(options: Options) -> i32 {
    if options.version {
        println!("pvacert {}", env!("CARGO_PKG_VERSION"));
        return EXIT_OK;
    }

    if options.debug {
        // Shorthand for RUST_LOG=pvacms=debug
        std::env::set_var("RUST_LOG", "pvacms=debug");
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pvacms=warn".into()),
        )
        .try_init();

    if options.password && options.file.is_none() {
        eprintln!("Error: -p must only be used with -f.");
        return EXIT_USAGE;
    }
    let action_requested = options.approve || options.deny || options.revoke;
    if options.file.is_some() && action_requested {
        eprintln!("Error: -A, -R, or -D cannot be used with -f.");
        return EXIT_CONFLICT;
    }

    let cert_id = match resolve_cert_id(&options) {
        Ok(id) => id,
        Err(code) => return code,
    };

    let request = if options.approve {
        set_state(&cert_id, "APPROVED")
    } else if options.deny {
        set_state(&cert_id, "DENIED")
    } else if options.revoke {
        set_state(&cert_id, "REVOKED")
    } else {
        Request::GetStatus {
            cert_id: cert_id.clone(),
        }
    };

    if options.verbose {
        let verb = if options.approve {
            "Approve"
        } else if options.deny {
            "Deny"
        } else if options.revoke {
            "Revoke"
        } else {
            "Get Status"
        };
        println!("{verb} ==> CERT:STATUS:{cert_id}");
    }

    let timeout = Duration::from_secs_f64(options.timeout.max(0.1));
    match request_over_socket(&options.socket, &request, timeout) {
        Ok(Response::Status { value }) => {
            print_status(&cert_id, &value, options.format, options.limit);
            EXIT_OK
        }
        Ok(Response::Created { .. }) => {
            // The operator tool never submits creation requests
            eprintln!("Error: unexpected response from service");
            EXIT_UNHANDLED
        }
        Ok(Response::Error { kind, message }) => {
            eprintln!("Error: {kind}: {message}");
            EXIT_FAILED
        }
        Err(CmsError::CmsUnavailable(message)) => {
            if message.contains("Interrupted") {
                eprintln!("Interrupted.");
                EXIT_INTERRUPTED
            } else {
                eprintln!("Could not contact PVACMS: {message}");
                EXIT_TIMEOUT
            }
        }
        Err(e) => {
            eprintln!("Error: {e}");
            EXIT_UNHANDLED
        }
    }
}

fn set_state(cert_id: &str, state: &str) -> Request {
    Request::SetState {
        cert_id: cert_id.to_string(),
        state: state.to_string(),
        requester: std::env::var("USER").unwrap_or_else(|_| "unknown".to_string()),
    }
}

/// Resolve `<issuer>:<serial>` from the positional argument or from the
/// status extension of a certificate file.
fn resolve_cert_id(options: &Options) -> Result<String, i32> {
    if let Some(file) = &options.file {
        let password = if options.password {
            print!("Enter password: ");
            let _ = std::io::stdout().flush();
            let mut line = String::new();
            if std::io::stdin().read_line(&mut line).is_err() {
                eprintln!("Error: unable to read password");
                return Err(EXIT_INTERRUPTED);
            }
            Some(SecretString::new(line.trim_end_matches('\n').to_string()))
        } else {
            None
        };

        let keychain = match load_keychain(file, password.as_ref()) {
            Ok(k) => k,
            Err(e) => {
                eprintln!("Unable to get cert from cert file: {e}");
                return Err(EXIT_FAILED);
            }
        };
        let uri = match status_uri_from_cert(&keychain.cert) {
            Ok(Some(uri)) => uri,
            Ok(None) => {
                eprintln!("Certificate does not carry a status PV extension");
                return Err(EXIT_FAILED);
            }
            Err(e) => {
                eprintln!("Unable to get cert from cert file: {e}");
                return Err(EXIT_FAILED);
            }
        };
        let (issuer, serial) = match parse_status_pv_name(&uri) {
            Ok(parts) => parts,
            Err(e) => {
                eprintln!("Bad status PV in certificate: {e}");
                return Err(EXIT_FAILED);
            }
        };
        // Cross-check the certificate's own serial against the PV name
        if let Ok(cert_serial) = CertStatusManager::serial_of(&keychain.cert) {
            if cert_serial != serial {
                eprintln!("Certificate serial does not match its status PV");
                return Err(EXIT_FAILED);
            }
        }
        return Ok(format!("{issuer}:{serial}"));
    }

    match &options.cert_id {
        Some(id) if id.contains(':') => Ok(id.clone()),
        Some(id) => {
            eprintln!("Error: bad certificate id {id:?}; expected <issuer>:<serial>");
            Err(EXIT_USAGE)
        }
        None => {
            eprintln!("Error: a certificate id or -f <file> is required");
            Err(EXIT_USAGE)
        }
    }
}

fn print_status(cert_id: &str, value: &StatusValue, format: Format, limit: u64) {
    match format {
        Format::Delta => {
            println!("CERT:STATUS:{cert_id}");
            println!("  status        {}", value.state);
            println!("  ocsp_status   {}", value.ocsp_state);
            println!("  status_date   {}", value.ocsp_status_date);
            println!("  valid_until   {}", value.ocsp_certified_until);
            if !value.ocsp_revocation_date.is_empty() {
                println!("  revoked_on    {}", value.ocsp_revocation_date);
            }
            println!(
                "  ocsp_response {} bytes",
                value.ocsp_response.len()
            );
        }
        Format::Tree => {
            let mut shown = value.clone();
            if limit != 0 && shown.ocsp_response.len() > limit as usize {
                shown.ocsp_response.truncate(limit as usize);
            }
            match serde_json::to_string_pretty(&shown) {
                Ok(json) => println!("{json}"),
                Err(e) => eprintln!("Error: cannot render status: {e}"),
            }
        }
    }
}
