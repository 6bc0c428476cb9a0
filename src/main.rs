use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::{debug, info, warn};

use colloquy::browser::{native_browser_available, ChatSession};
use colloquy::driver::cdp::CdpSurface;
use colloquy::{
    intake, load_config, new_task_id, AppState, BatchService, Command, Event, Relay, Reply,
    Timings,
};

#[derive(Default)]
struct CliArgs {
    questions: Option<PathBuf>,
    url: Option<String>,
    out: Option<PathBuf>,
    check: bool,
    clear_all: bool,
    help: bool,
}

fn parse_args() -> Result<CliArgs> {
    let mut parsed = CliArgs::default();
    let mut args = std::env::args().skip(1);
    while let Some(a) = args.next() {
        match a.as_str() {
            "--questions" | "-q" => {
                parsed.questions = Some(PathBuf::from(
                    args.next().ok_or_else(|| anyhow!("--questions needs a file path"))?,
                ));
            }
            "--url" | "-u" => {
                parsed.url = Some(args.next().ok_or_else(|| anyhow!("--url needs a value"))?);
            }
            "--out" | "-o" => {
                parsed.out = Some(PathBuf::from(
                    args.next().ok_or_else(|| anyhow!("--out needs a directory"))?,
                ));
            }
            "--check" => parsed.check = true,
            "--clear-all" => parsed.clear_all = true,
            "--help" | "-h" => parsed.help = true,
            other => return Err(anyhow!("unknown argument: {other} (try --help)")),
        }
    }
    Ok(parsed)
}

fn print_usage() {
    println!(
        "colloquy — batch chat Q&A automation and CSV harvesting\n\
         \n\
         USAGE:\n\
         \u{20}  colloquy --questions <file.csv> [--url <chat url>] [--out <dir>]\n\
         \u{20}  colloquy --check          verify a usable browser is installed\n\
         \u{20}  colloquy --clear-all      wipe all persisted task state\n\
         \n\
         The questions file is delimited text (comma, semicolon, or tab); the\n\
         question column is found by header match, defaulting to the first\n\
         column. The chat URL can also come from colloquy.json or the\n\
         COLLOQUY_CHAT_URL env var. Results land in the output directory as a\n\
         timestamped CSV. Ctrl-C stops the run and exports what was collected."
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = parse_args()?;
    if args.help {
        print_usage();
        return Ok(());
    }

    let config = load_config();

    if args.check {
        if native_browser_available() {
            println!("ok: found a usable Chromium-family browser");
            return Ok(());
        }
        println!(
            "missing: no browser found. Install Chrome, Chromium, or Brave, \
             or set CHROME_EXECUTABLE."
        );
        std::process::exit(2);
    }

    if args.clear_all {
        let state = AppState::new(config);
        state.registry.force_clear_all();
        println!("all task state cleared");
        return Ok(());
    }

    let Some(questions_path) = args.questions else {
        print_usage();
        return Err(anyhow!("--questions <file> is required for a batch run"));
    };

    // Input errors are reported before any task exists.
    let questions = intake::load_questions(&questions_path)?;
    info!("{} question(s) queued from {}", questions.len(), questions_path.display());

    let chat_url = args
        .url
        .or_else(|| config.automation.resolve_chat_url())
        .ok_or_else(|| {
            anyhow!(
                "no chat URL configured — pass --url, set automation.chat_url \
                 in colloquy.json, or export COLLOQUY_CHAT_URL"
            )
        })?;

    let state = AppState::new(config);
    let sweeper = state.registry.spawn_sweeper();

    let session = ChatSession::open(&chat_url, None).await?;
    let surface = Arc::new(
        CdpSurface::attach(
            session.page(),
            state.config.page.clone(),
            Some(state.events.clone()),
        )
        .await
        .map_err(|e| anyhow!("could not attach to the chat page: {e}"))?,
    );

    let mut timings = Timings::default();
    timings.reply_timeout = state.config.automation.resolve_reply_timeout();

    let exporter = match &args.out {
        Some(out) => colloquy::export::CsvExporter::new(
            out.clone(),
            state.config.export.resolve_fallback_dir(),
        ),
        None => colloquy::export::CsvExporter::from_config(&state.config.export),
    };

    let service = BatchService::new(
        state.clone(),
        surface,
        timings,
        exporter,
        session.context_id(),
    );
    let (relay, rx) = Relay::channel(16);
    let serve = tokio::spawn(service.serve(rx));

    match relay.request(Command::Ping).await {
        Reply::Pong { ready: true } => info!("chat page is ready"),
        Reply::Pong { ready: false } => warn!(
            "chat input not detected yet — the page may still be loading; \
             if the run fails, reload the chat page and retry"
        ),
        other => warn!("liveness check failed: {other:?}"),
    }

    let mut events = state.subscribe();
    let task_id = new_task_id();
    match relay
        .request(Command::StartBatch {
            task_id: task_id.clone(),
            questions,
        })
        .await
    {
        Reply::Ack { message } => info!("{message}"),
        Reply::Failure { error } => {
            session.close().await;
            return Err(anyhow!(error));
        }
        other => {
            session.close().await;
            return Err(anyhow!("unexpected start reply: {other:?}"));
        }
    }

    let mut exit_ok = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupt received — stopping the batch and exporting partial results");
                match relay.request(Command::StopBatch { task_id: task_id.clone() }).await {
                    Reply::Exported { filename, rows } => {
                        info!("partial export saved: {filename} ({rows} rows)");
                    }
                    Reply::Ack { message } => info!("{message}"),
                    other => warn!("stop reply: {other:?}"),
                }
                exit_ok = false;
                break;
            }
            event = events.recv() => match event {
                Ok(Event::Progress { current, total, message, .. }) => {
                    info!("[{current}/{total}] {message}");
                }
                Ok(Event::SourceProgress { current, total }) => {
                    debug!("sources: {current}/{total}");
                }
                Ok(Event::Notice { title, message }) => info!("{title}: {message}"),
                Ok(Event::BatchFinished { task_id: finished, success, rows, .. }) => {
                    if finished == task_id {
                        info!("batch finished: success={success}, rows={rows}");
                        exit_ok = success;
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    session.close().await;
    sweeper.abort();
    serve.abort();

    if exit_ok {
        Ok(())
    } else {
        std::process::exit(1);
    }
}
