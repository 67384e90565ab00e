// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use mudband_client::Client;
use mudband_client::api::ApiClient;
use mudband_client::config::{self, ClientToml, DEFAULT_CONFIG_PATH};
use mudband_client::engine::CurrentEngine;
use mudband_client::enroll::{EnrollOutcome, UnenrollOutcome};
use mudband_client::logging::{self, DailyFile};
use mudband_client::platform::CurrentPlatform;
use mudband_client::session::ConnectOutcome;
use mudband_client::snapshot;
use mudband_client::status::ConnectionStatus;
use mudband_client::store::BandStore;

type MudbandClient = Client<CurrentEngine, CurrentPlatform>;

#[derive(Debug, Parser)]
#[command(name = "mudband")]
#[command(version = env!("GIT_VERSION"))]
#[command(about = "Mesh VPN client for mud.band")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Enroll this device into a band
    Enroll {
        /// Enrollment token from the band administrator
        #[arg(short, long)]
        token: String,
        /// Device name, defaults to the host name
        #[arg(short = 'n', long)]
        device_name: Option<String>,
        /// Enrollment secret, when the band requires one
        #[arg(short, long)]
        secret: Option<String>,
    },
    /// List enrolled bands
    List,
    /// Make another enrolled band the default
    Use { band_uuid: String },
    /// Leave a band (the default band when omitted)
    Unenroll { band_uuid: Option<String> },
    /// Show the default band and its cached configuration
    Status,
    /// Bring the tunnel up until interrupted
    Up,
    /// Print the web CLI sign-in URL of a public band
    Webcli,
    /// Create a guest band administered by this device and join it
    CreateBand {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(short = 'n', long)]
        device_name: Option<String>,
    },
    /// Print a shareable enrollment token for the default band
    Token,
}

fn open_log_file(config: &ClientToml) -> Option<DailyFile> {
    let dir = config.log_dir.as_ref()?;
    match DailyFile::new(dir) {
        Ok(file) => Some(file),
        Err(e) => {
            eprintln!("cannot open log directory {}: {e}", dir.display());
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = config::load(&args.config).await?;
    logging::init_tracing(args.verbose, open_log_file(&config));

    if let Some(dir) = &config.log_dir {
        let today = chrono::Local::now().date_naive();
        if let Err(e) = logging::purge_expired(dir, config.log_retention_days(), today) {
            warn!(error = %e, "failed to purge expired logs");
        }
    }

    info!(
        config = %args.config.display(),
        api_host = %config.api_host,
        version = env!("GIT_VERSION"),
        "starting mudband"
    );

    let api = ApiClient::new(&config.api_host)?;
    let store = BandStore::open(&config.state_dir).await?;
    let engine = Arc::new(CurrentEngine::new(&config));
    let platform = Arc::new(CurrentPlatform::default());
    let client = Client::new(api, store, engine, platform, config.ping_interval());

    match args.command {
        Command::Enroll {
            token,
            device_name,
            secret,
        } => {
            let device_name = device_name.unwrap_or_else(|| config.device_name());
            let outcome = client
                .enrollment
                .enroll(&token, &device_name, secret.as_deref())
                .await
                .map_err(|e| e.user_message())?;
            print_enroll_outcome(&outcome);
        }
        Command::List => {
            let list = client
                .enrollment
                .list_enrollments()
                .await
                .map_err(|e| e.user_message())?;
            if list.is_empty() {
                println!("no bands enrolled");
            }
            for entry in list {
                let marker = if entry.is_default { "*" } else { " " };
                println!("{marker} {}  {}", entry.band_uuid, entry.band_name);
            }
        }
        Command::Use { band_uuid } => {
            let changed = client
                .enrollment
                .change_enrollment(&band_uuid)
                .await
                .map_err(|e| e.user_message())?;
            if !changed {
                return Err(format!("band {band_uuid} is not enrolled").into());
            }
            println!("default band is now {band_uuid}");
        }
        Command::Unenroll { band_uuid } => {
            let band_uuid = match band_uuid {
                Some(uuid) => uuid,
                None => client
                    .store
                    .default_band_uuid()
                    .await
                    .ok_or("no band is enrolled")?,
            };
            let outcome = client
                .enrollment
                .unenroll(&band_uuid)
                .await
                .map_err(|e| e.user_message())?;
            match outcome {
                UnenrollOutcome::Removed => println!("left band {band_uuid}"),
                UnenrollOutcome::NotEnrolled => println!("band {band_uuid} is not enrolled"),
            }
        }
        Command::Status => print_status(&client).await?,
        Command::Up => run_up(&client, &config).await?,
        Command::Webcli => {
            let url = client
                .enrollment
                .webcli_url()
                .await
                .map_err(|e| e.user_message())?;
            println!("{url}");
        }
        Command::CreateBand {
            name,
            description,
            device_name,
        } => {
            let device_name = device_name.unwrap_or_else(|| config.device_name());
            let outcome = client
                .enrollment
                .create_band_as_guest(&name, &description, &device_name)
                .await
                .map_err(|e| e.user_message())?;
            print_enroll_outcome(&outcome);
        }
        Command::Token => {
            let token = client
                .enrollment
                .issue_enrollment_token()
                .await
                .map_err(|e| e.user_message())?;
            println!("{token}");
        }
    }

    Ok(())
}

fn print_enroll_outcome(outcome: &EnrollOutcome) {
    match outcome {
        EnrollOutcome::Enrolled(e) => {
            println!("enrolled into {} ({})", e.band_name, e.band_uuid);
        }
        EnrollOutcome::MfaRequired { sso_url } => {
            println!("MFA authentication required, open: {sso_url}");
        }
    }
}

async fn print_status(client: &MudbandClient) -> Result<(), Box<dyn std::error::Error>> {
    let Some(enrollment) = client.store.default_enrollment().await? else {
        println!("no band is enrolled");
        return Ok(());
    };
    println!("band:   {} ({})", enrollment.band_name, enrollment.band_uuid);
    println!("device: {}", enrollment.device_name);

    match client.store.load_config(&enrollment.band_uuid).await? {
        Some(conf) => {
            println!(
                "address: {}/{}",
                conf.interface.private_ip,
                conf.interface.prefix_len().unwrap_or(32)
            );
            println!("peers:");
            for peer in &conf.peers {
                println!("  {:<24} {}", peer.name, peer.private_ip);
            }
            if !conf.links.is_empty() {
                println!("links:");
                for link in &conf.links {
                    println!("  {:<24} {}", link.name, link.url);
                }
            }
        }
        None => println!("configuration not fetched yet"),
    }
    Ok(())
}

async fn run_up(client: &MudbandClient, config: &ClientToml) -> Result<(), Box<dyn std::error::Error>> {
    match client.session.connect().await? {
        ConnectOutcome::Connected => println!("connected"),
        ConnectOutcome::MfaRequired { sso_url } => {
            println!("MFA authentication required, open: {sso_url}");
            return Ok(());
        }
    }

    let snapshots = config
        .status_snapshot
        .then(|| snapshot::spawn(client.store.clone(), client.status.clone(), client.mfa.clone()));

    let mut mfa = client.mfa.subscribe();
    let mut poll = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            _ = poll.tick() => {
                let status = client.session.refresh_status().await;
                if matches!(status, ConnectionStatus::Disconnected | ConnectionStatus::Invalid) {
                    warn!(%status, "tunnel went down");
                    break;
                }
            }
            Ok(()) = mfa.changed() => {
                if let Some(url) = mfa.borrow_and_update().clone() {
                    println!("MFA authentication required, open: {url}");
                }
            }
        }
    }

    if let Some(task) = snapshots {
        task.abort();
    }
    client.session.disconnect().await?;
    println!("disconnected");
    Ok(())
}
