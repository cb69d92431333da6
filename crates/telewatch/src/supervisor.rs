//! Task supervisor: builds every component from the validated config,
//! owns the tasks, broadcasts cancellation, and bounds the drain.

use crate::pipeline::Pipeline;
use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use telewatch_anomaly::AnomalyDetector;
use telewatch_classify::patterns::PatternSet;
use telewatch_classify::Classifier;
use telewatch_common::config::Config;
use telewatch_common::status::StatusBoard;
use telewatch_common::types::{Event, SourceKind};
use telewatch_notify::dispatcher::Dispatcher;
use telewatch_notify::telegram::TelegramTransport;
use telewatch_notify::{control, Transport};
use telewatch_progress::{HistoryStore, ProgressTracker};
use telewatch_source::{
    file::FileTailer, journal::JournalReader, pid::PidWatcher, RecordQueue, SourceAdapter,
    DEFAULT_HIGH_WATER,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

/// Whole-process termination budget once shutdown is requested.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(10);
const COMMAND_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub enum RunError {
    /// Bad config or a source unavailable at startup (exit code 2).
    Startup(anyhow::Error),
    /// Irrecoverable failure after startup (exit code 3).
    Runtime(anyhow::Error),
}

pub async fn run(config: Config) -> Result<(), RunError> {
    let built = build(config).map_err(RunError::Startup)?;
    run_built(built).await.map_err(RunError::Runtime)
}

struct Built {
    adapters: Vec<Box<dyn SourceAdapter>>,
    source_flags: HashMap<String, Arc<AtomicBool>>,
    pipeline: Pipeline,
    dispatcher: Dispatcher,
    transport: Arc<dyn Transport>,
    events_rx: mpsc::Receiver<Event>,
    events_tx: mpsc::Sender<Event>,
    status: Arc<StatusBoard>,
}

/// Construct every component. All fail-fast checks happen here so a bad
/// source or credential aborts before anything starts.
fn build(config: Config) -> Result<Built> {
    let status = Arc::new(StatusBoard::new());
    let (events_tx, events_rx) = mpsc::channel::<Event>(256);

    let transport: Arc<dyn Transport> = Arc::new(
        TelegramTransport::new(&config.telegram.bot_token, &config.telegram.chat_id)
            .context("failed to build telegram transport")?,
    );

    let advisor = match &config.llm {
        Some(llm) => Some(
            telewatch_advisor::create_advisor(llm).context("failed to build llm advisor")?,
        ),
        None => None,
    };
    let budget = config
        .llm
        .as_ref()
        .map(|l| l.calls_per_hour)
        .unwrap_or(telewatch_classify::DEFAULT_ADVISOR_BUDGET_PER_HOUR);

    let mut adapters: Vec<Box<dyn SourceAdapter>> = Vec::new();
    let mut source_flags = HashMap::new();
    let mut keywords = HashMap::new();
    let mut pid_sources = HashSet::new();
    for (index, monitor) in config.monitors.iter().enumerate() {
        let descriptor = monitor.descriptor(index);
        if monitor.kind == SourceKind::Pid {
            pid_sources.insert(descriptor.id.clone());
        }
        keywords.insert(
            descriptor.id.clone(),
            descriptor
                .keywords
                .iter()
                .map(|k| k.to_lowercase())
                .collect::<Vec<_>>(),
        );
        source_flags.insert(descriptor.id.clone(), Arc::new(AtomicBool::new(false)));

        let adapter: Box<dyn SourceAdapter> = match monitor.kind {
            SourceKind::File => Box::new(
                FileTailer::new(descriptor, monitor.replay_existing)
                    .context("file monitor failed to start")?,
            ),
            SourceKind::Pid => Box::new(
                PidWatcher::new(
                    descriptor,
                    Duration::from_secs(monitor.check_interval_secs),
                    monitor.rss_cap_mb,
                )
                .context("pid monitor failed to start")?,
            ),
            SourceKind::Journal => Box::new(
                JournalReader::new(descriptor).context("journal monitor failed to start")?,
            ),
        };
        adapters.push(adapter);
    }

    let progress = config.process.as_ref().map(|process| {
        let history_path = config
            .history_path
            .as_ref()
            .map(std::path::PathBuf::from)
            .unwrap_or_else(HistoryStore::default_path);
        ProgressTracker::new(process, HistoryStore::load(&history_path))
    });

    let classifier = Classifier::new(PatternSet::from_config(&config.patterns), advisor, budget);
    let anomaly = AnomalyDetector::new(
        config.anomaly.spike_threshold,
        config.anomaly.stall_seconds,
    );

    if config.turbo {
        tracing::info!("Turbo mode: profiler and anomaly detection disabled");
    }

    let pipeline = Pipeline::new(
        status.clone(),
        events_tx.clone(),
        config.turbo,
        source_flags.clone(),
        keywords,
        pid_sources,
        anomaly,
        progress,
        classifier,
    );

    let dispatcher = Dispatcher::new(
        transport.clone(),
        status.clone(),
        config.notification.rate_limit_per_hour,
        config.notification.debounce_seconds,
        config.notification.severity_levels.clone(),
    );

    Ok(Built {
        adapters,
        source_flags,
        pipeline,
        dispatcher,
        transport,
        events_rx,
        events_tx,
        status: status.clone(),
    })
}

async fn run_built(built: Built) -> Result<()> {
    let Built {
        adapters,
        source_flags,
        mut pipeline,
        mut dispatcher,
        transport,
        mut events_rx,
        events_tx,
        status: _status,
    } = built;

    let queue = Arc::new(RecordQueue::new(DEFAULT_HIGH_WATER));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (commands_tx, mut commands_rx) = mpsc::channel::<String>(32);

    let mut tasks = JoinSet::new();

    // One task per source adapter.
    for adapter in adapters {
        let flag = source_flags
            .get(&adapter.descriptor().id)
            .cloned()
            .unwrap_or_default();
        let queue = queue.clone();
        let events = events_tx.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(telewatch_source::run_adapter(
            adapter, queue, events, flag, shutdown,
        ));
    }
    drop(events_tx);

    // Pipeline worker.
    {
        let queue = queue.clone();
        let mut shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    record = queue.pop() => pipeline.handle_record(record).await,
                    _ = tick.tick() => pipeline.tick().await,
                }
            }
        });
    }

    // Inbound command poller.
    {
        let transport = transport.clone();
        let mut shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(COMMAND_POLL_INTERVAL) => {
                        match transport.poll_commands().await {
                            Ok(messages) => {
                                for message in messages {
                                    let _ = commands_tx.send(message).await;
                                }
                            }
                            Err(e) => {
                                tracing::debug!(error = %e, "Inbound command poll failed");
                            }
                        }
                    }
                }
            }
        });
    }

    // Dispatcher: last consumer standing; drains events, then says goodbye.
    let dispatcher_task = {
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    maybe_event = events_rx.recv() => match maybe_event {
                        Some(event) => dispatcher.handle_event(event, Utc::now()).await,
                        None => break,
                    },
                    Some(text) = commands_rx.recv() => {
                        if let Some(command) = control::parse(&text) {
                            dispatcher.handle_command(command, Utc::now()).await;
                        }
                    }
                    _ = tick.tick() => dispatcher.tick(Utc::now()).await,
                }
            }
            // Flush anything still pending, then the farewell.
            while let Ok(event) = events_rx.try_recv() {
                dispatcher.handle_event(event, Utc::now()).await;
            }
            dispatcher.flush_all(Utc::now()).await;
            dispatcher.send_stopped_notice().await;
        })
    };

    wait_for_shutdown_signal().await;
    tracing::info!("Shutdown requested, draining");
    let _ = shutdown_tx.send(true);

    let drain = async {
        while tasks.join_next().await.is_some() {}
        let _ = dispatcher_task.await;
    };
    if tokio::time::timeout(SHUTDOWN_BUDGET, drain).await.is_err() {
        tracing::warn!(
            budget_secs = SHUTDOWN_BUDGET.as_secs(),
            "Drain exceeded the shutdown budget, exiting anyway"
        );
    }
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
