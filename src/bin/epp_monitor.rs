//! epp-monitor - Operator CLI for the EPP compliance dashboard.
//!
//! One-shot subcommands query or drive the backend once and print the
//! result. `watch` mounts the full monitor (status poll and record refresh
//! loops) and prints updates until Ctrl-C.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::io::IsTerminal;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use epp_monitor::{
    report, ui, Backend, Command, HttpBackend, Monitor, MonitorConfig, MonitorSettings,
    MonitorUpdate, RecordId, RecordSync, RefreshOrigin, RefreshOutcome, SessionController,
    StubBackend,
};

#[derive(Parser, Debug)]
#[command(
    name = "epp-monitor",
    version,
    about = "Monitor PPE compliance detections and control the camera session"
)]
struct Args {
    /// Backend base URL (overrides EPP_BACKEND_URL and the config file).
    #[arg(long, global = true, value_name = "URL")]
    backend: Option<String>,

    /// Use an in-memory backend with a synthetic detection feed.
    #[arg(long, global = true)]
    stub: bool,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, global = true, default_value = "auto", value_name = "MODE")]
    ui: String,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the live monitor until Ctrl-C.
    Watch {
        /// Request a camera start right after mounting.
        #[arg(long)]
        start: bool,
    },
    /// Show the camera session status.
    Status,
    /// Start the camera session.
    Start,
    /// Stop the camera session.
    Stop,
    /// List detection records, newest first.
    Records,
    /// Show aggregate compliance statistics and the trend.
    Stats,
    /// Show one record with its per-person breakdown.
    Detail { id: RecordId },
    /// Delete one record.
    Delete { id: RecordId },
    /// Delete every record.
    DeleteAll {
        /// Confirm the deletion.
        #[arg(long)]
        yes: bool,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::from_args(Some(&args.ui), is_tty, !stdout_is_tty);

    let mut cfg = MonitorConfig::load()?;
    if let Some(url) = &args.backend {
        cfg.backend_url = url.clone();
    }
    let evidence_base = evidence_base(&cfg.backend_url)?;
    let backend: Arc<dyn Backend> = if args.stub {
        log::info!("using in-memory stub backend");
        Arc::new(StubBackend::new().with_synthetic_feed(rand::random()))
    } else {
        Arc::new(HttpBackend::from_config(&cfg)?)
    };

    match args.command {
        Cmd::Watch { start } => watch(backend, &cfg, &ui, start),
        Cmd::Status => {
            let mut controller = SessionController::new(backend.as_ref(), cfg.session);
            let view = {
                let _stage = ui.stage("Consultando estado de cámara");
                controller.sync_status()?
            };
            println!("{}", report::render_session(&view));
            Ok(())
        }
        Cmd::Start => drive_session(backend.as_ref(), &cfg, &ui, true),
        Cmd::Stop => drive_session(backend.as_ref(), &cfg, &ui, false),
        Cmd::Records => {
            let sync = load_records(backend.as_ref(), &cfg, &ui)?;
            print!("{}", report::render_records(sync.records()));
            Ok(())
        }
        Cmd::Stats => {
            let sync = load_records(backend.as_ref(), &cfg, &ui)?;
            print!("{}", report::render_overview(sync.stats(), sync.series()));
            Ok(())
        }
        Cmd::Detail { id } => {
            let mut sync = RecordSync::new(cfg.series_window);
            let _stage = ui.stage("Consultando detalle");
            let detail = sync.open_detail_with(backend.as_ref(), id)?;
            print!("{}", report::render_detail(detail, &evidence_base));
            Ok(())
        }
        Cmd::Delete { id } => {
            let mut sync = RecordSync::new(cfg.series_window);
            let outcome = {
                let _stage = ui.stage("Eliminando registro");
                sync.delete_with(backend.as_ref(), id)?
            };
            println!("registro #{id} eliminado");
            report_remaining(&outcome);
            Ok(())
        }
        Cmd::DeleteAll { yes } => {
            if !yes {
                return Err(anyhow!("refusing to delete every record without --yes"));
            }
            let mut sync = RecordSync::new(cfg.series_window);
            let outcome = {
                let _stage = ui.stage("Eliminando todos los registros");
                sync.delete_all_with(backend.as_ref())?
            };
            println!("todos los registros eliminados");
            report_remaining(&outcome);
            Ok(())
        }
    }
}

fn evidence_base(backend_url: &str) -> Result<Url> {
    let mut base = Url::parse(backend_url).context("parse backend url")?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    Ok(base)
}

fn load_records(backend: &dyn Backend, cfg: &MonitorConfig, ui: &ui::Ui) -> Result<RecordSync> {
    let mut sync = RecordSync::new(cfg.series_window);
    let outcome = {
        let _stage = ui.stage("Consultando registros");
        sync.refresh_with(backend, RefreshOrigin::Manual)
    };
    if let RefreshOutcome::Failed(err) = outcome {
        return Err(err.into());
    }
    Ok(sync)
}

fn report_remaining(outcome: &RefreshOutcome) {
    match outcome {
        RefreshOutcome::Applied { records, .. } => println!("{records} registro(s) restantes"),
        RefreshOutcome::Failed(err) => eprintln!("✗ {err}"),
        RefreshOutcome::Stale | RefreshOutcome::Retrying => {}
    }
}

fn drive_session(backend: &dyn Backend, cfg: &MonitorConfig, ui: &ui::Ui, start: bool) -> Result<()> {
    let mut notice = ui.session_notice();
    let mut controller =
        SessionController::new(backend, cfg.session).on_change(|view| notice.update(view));
    controller.sync_status()?;
    let view = if start {
        controller.start()?
    } else {
        controller.stop()?
    };
    drop(controller);
    println!("{}", report::render_session(&view));
    Ok(())
}

fn watch(backend: Arc<dyn Backend>, cfg: &MonitorConfig, ui: &ui::Ui, start: bool) -> Result<()> {
    let handle = Monitor::new(backend, MonitorSettings::from(cfg)).spawn()?;
    if start {
        handle.send(Command::StartSession)?;
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("install Ctrl-C handler")?;
    log::info!("epp-monitor watching (Ctrl-C to exit)");

    let mut notice = ui.session_notice();
    let mut last_seen = None;
    loop {
        if rx.try_recv().is_ok() {
            break;
        }
        let update = match handle.updates().recv_timeout(Duration::from_millis(200)) {
            Ok(update) => update,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        match update {
            MonitorUpdate::Session(view) => {
                notice.update(&view);
                log::debug!("session: {}", report::render_session(&view));
            }
            MonitorUpdate::Records(view) => {
                if view.loading {
                    continue;
                }
                // reprint only when the snapshot changed
                let key = (view.stats.total_registros, view.records.first().map(|r| r.id));
                if last_seen != Some(key) {
                    last_seen = Some(key);
                    print!("{}", report::render_overview(&view.stats, &view.series));
                    println!();
                }
            }
            MonitorUpdate::Detail(Some(detail)) => {
                log::info!("detail #{} refreshed", detail.record.id);
            }
            MonitorUpdate::Detail(None) => {}
            MonitorUpdate::Notice(text) => eprintln!("{text}"),
            MonitorUpdate::Error(err) => eprintln!("✗ {err}"),
        }
    }

    log::info!("shutdown signal received, stopping monitor...");
    notice.dismiss();
    handle.stop()
}
