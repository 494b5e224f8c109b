use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use report_capture::{
    CaptureFlow, Config, FileCamera, FileDraftStore, FlowState, HttpReportApi, Identity,
    LocationProvider, NoLocation, ReportApi, Role, StaticLocation,
};

#[derive(Parser, Debug)]
#[command(
    name = "report-capture",
    about = "Capture a civic problem photo, run AI detection and submit the report"
)]
struct Cli {
    /// Path to the photo to report
    #[arg(long)]
    image: Option<PathBuf>,

    /// Device latitude (omit together with --lng to simulate a host
    /// without GPS)
    #[arg(long)]
    lat: Option<f64>,

    /// Device longitude
    #[arg(long)]
    lng: Option<f64>,

    /// Manually placed pin as "lat,lng", applied after analysis
    #[arg(long)]
    pin: Option<String>,

    /// Base URL for the report API (overrides REPORT_API_URL)
    #[arg(long)]
    api_url: Option<String>,

    /// Reporting user id
    #[arg(long, default_value = "cli-user")]
    user: String,

    /// Act as an admin for --all / --set-status
    #[arg(long, default_value_t = false)]
    admin: bool,

    /// Submit the report after analysis; without it, detection is a dry run
    #[arg(long, default_value_t = false)]
    submit: bool,

    /// List this user's submitted reports and exit
    #[arg(long, default_value_t = false)]
    list: bool,

    /// List all reports (admin) and exit
    #[arg(long, default_value_t = false)]
    all: bool,

    /// Update a report's status (admin), as "report_id=status", and exit
    #[arg(long)]
    set_status: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_target(false)
        .compact()
        .init();

    if let Err(e) = run().await {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::from_env().context("loading configuration")?;
    if let Some(api_url) = &cli.api_url {
        config.api_url = api_url.clone();
        config.validate().context("validating configuration")?;
    }
    info!("API: {}", config.api_url);

    let api = HttpReportApi::new(&config).context("building API client")?;

    if cli.all {
        let reports = api.list_all().await?;
        print_reports(&reports);
        return Ok(());
    }

    if let Some(spec) = &cli.set_status {
        let (report_id, status) = spec
            .split_once('=')
            .context("--set-status expects report_id=status")?;
        let updated = api.update_status(report_id, status).await?;
        info!("report {} is now {}", updated.report_id, updated.status);
        return Ok(());
    }

    if cli.list {
        let reports = api.list_by_user(&cli.user).await?;
        print_reports(&reports);
        return Ok(());
    }

    let image = cli
        .image
        .as_ref()
        .context("--image is required unless listing reports")?;

    let location: Box<dyn LocationProvider> = match (cli.lat, cli.lng) {
        (Some(lat), Some(lng)) => Box::new(StaticLocation::new(lat, lng)),
        (None, None) => {
            warn!("no --lat/--lng given; location will be unavailable");
            Box::new(NoLocation)
        }
        _ => bail!("--lat and --lng must be given together"),
    };

    let role = if cli.admin { Role::Admin } else { Role::Civilian };
    let identity = Identity::new(cli.user.clone(), role);
    let camera = FileCamera::new(image);
    let store = FileDraftStore::new(&config.draft_dir, &cli.user);

    let mut flow = CaptureFlow::new(identity, camera, location, api, store, &config);

    flow.open_camera().await?;
    flow.capture().await?;

    if let Some(pin) = &cli.pin {
        let (lat, lng) = pin
            .split_once(',')
            .context("--pin expects lat,lng")?;
        flow.set_pin(lat.trim().parse()?, lng.trim().parse()?).await?;
    }

    match flow.state() {
        FlowState::AnalyzedReady => {
            if flow.analysis_failed() {
                warn!(
                    "analysis failed ({}); submitting would be a manual report",
                    flow.last_error().unwrap_or("unknown error")
                );
            } else {
                if let Some(message) = flow.detect_message() {
                    info!("{}", message);
                }
                for d in flow.detections() {
                    info!(
                        "  {} {:.0}% at [{:.0},{:.0},{:.0},{:.0}]",
                        d.class_name,
                        d.confidence * 100.0,
                        d.x_min,
                        d.y_min,
                        d.x_max,
                        d.y_max
                    );
                }
            }
        }
        FlowState::Preview => {
            warn!("no position yet; pass --pin lat,lng to place one");
        }
        state => bail!("unexpected flow state {:?}", state),
    }

    if !cli.submit {
        info!("dry run; pass --submit to send the report");
        flow.cancel()?;
        return Ok(());
    }

    let report = flow.submit().await?;
    info!(
        "submitted report {} ({}) at {}",
        report.report_id, report.ward_name, report.full_address
    );
    if !report.image_url.is_empty() {
        info!("image: {}", report.image_url);
    }
    Ok(())
}

fn print_reports(reports: &[report_capture::SubmittedReport]) {
    if reports.is_empty() {
        info!("no reports");
        return;
    }
    for r in reports {
        info!(
            "{} [{}] {} - {}",
            r.report_id,
            r.status,
            r.problem_types.join(","),
            r.full_address
        );
    }
}
