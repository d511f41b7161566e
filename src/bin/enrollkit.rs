//! Batch enrollment command-line tool.
//!
//! ```text
//! enrollkit [OPTIONS]
//!
//! Options:
//!   --debug              Enable debug logging
//!   --skip-root          Do not fetch or install the CA root certificate
//!   --skip-store         Remove containers and certificates once exported
//!   --skip-csr-request   Only create containers and requests
//!   --flat               Write every artifact straight into the output folder
//!   --file <PATH>        Batch file [default: csr.json]
//!   --ca-url <URL>       CA host or base URL [default: testgost2012.cryptopro.ru]
//!   --folder <PATH>      Output folder [default: test_certs]
//!   --key-root <PATH>    Key-storage root of folder containers
//!   --timeout <SECS>     Deadline of each CA call [default: 30]
//! ```
//!
//! Values in the batch file's `params` object override these flags.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use enrollkit::config::{
    BatchFile, DEFAULT_CA_URL, DEFAULT_OUTPUT_FOLDER, DEFAULT_TIMEOUT_SECS, Defaults, Settings,
};
use enrollkit::logging;
use enrollkit::provider::software::SoftwareProvider;
use enrollkit::storage::KeyStorage;

/// Batch X.509 enrollment tool
#[derive(Parser)]
#[command(name = "enrollkit")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Batch certificate enrollment through CA web enrollment", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Do not fetch or install the CA root certificate
    #[arg(long)]
    skip_root: bool,

    /// Remove containers and certificates from the provider once exported
    #[arg(long)]
    skip_store: bool,

    /// Only create containers and requests, do not contact the CA
    #[arg(long = "skip-csr-request")]
    skip_csr_request: bool,

    /// Write every artifact straight into the output folder
    #[arg(long)]
    flat: bool,

    /// Batch file
    #[arg(long, value_name = "PATH", default_value = "csr.json")]
    file: PathBuf,

    /// CA host or base URL
    #[arg(long, value_name = "URL", default_value = DEFAULT_CA_URL)]
    ca_url: String,

    /// Output folder
    #[arg(long, value_name = "PATH", default_value = DEFAULT_OUTPUT_FOLDER)]
    folder: PathBuf,

    /// Key-storage root of folder containers
    #[arg(long, value_name = "PATH")]
    key_root: Option<PathBuf>,

    /// Deadline of each CA call, in seconds
    #[arg(long, value_name = "SECS", default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout: u64,
}

impl Cli {
    fn defaults(&self) -> Defaults {
        Defaults {
            flat: self.flat,
            skip_root: self.skip_root,
            skip_store: self.skip_store,
            skip_csr_request: self.skip_csr_request,
            output_folder: self.folder.clone(),
            ca_url: self.ca_url.clone(),
            timeout_secs: self.timeout,
            key_storage_root: self.key_root.clone(),
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logging::init(cli.debug, Path::new(logging::LOG_FILE)) {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> enrollkit::error::Result<()> {
    let batch = BatchFile::load(&cli.file)?;
    let settings = Settings::merge(&batch.params, &cli.defaults())?;
    info!(
        requests = batch.requests.len(),
        ca = %settings.ca_url,
        output = %settings.output_folder.display(),
        "starting batch"
    );

    let storage = KeyStorage::detect(settings.key_storage_root.clone())?;
    let provider = SoftwareProvider::builder().storage(storage.clone()).build();

    enrollkit::pipeline::run(&batch, &settings, &provider, &storage).await?;
    Ok(())
}
