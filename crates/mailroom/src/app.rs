//! Process wiring: stores, workers, scheduler, SMTP receiver and HTTP.

use anyhow::Context;
use mailroom_core::pipeline::{
    InboxSink, LocalDomains, MailTransport, NoRelay, RECEIVE_GROUP, RECEIVE_TOPIC, ReceiveWorker,
    SEND_GROUP, SEND_TOPIC, Scheduler, SendWorker, SmtpRelay, create_topics,
};
use mailroom_core::{Database, Notifier};
use mailroom_queue::{Broker, Consumer, RecordHandler, run_consumer};
use mailroom_smtp::Receiver;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::api::{self, AppState};
use crate::config::{Config, QueueConfig};

/// How long open connections and workers get to finish after a signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Runs everything until SIGINT/SIGTERM, then stops gracefully.
///
/// # Errors
///
/// Returns an error if a store cannot be opened, a listener cannot be
/// bound or the HTTP server fails.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let db = Database::open(&config.database.path)
        .await
        .with_context(|| format!("opening database {}", config.database.path))?;
    let broker = Broker::open(&config.database.queue_path)
        .await
        .with_context(|| format!("opening topic log {}", config.database.queue_path))?;
    create_topics(&broker, config.queue.partitions)
        .await
        .context("creating topics")?;

    let notifier = Notifier::new();
    let local = LocalDomains::new(&config.mail.domains);
    let hostname = config.primary_domain().to_string();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    let transport: Arc<dyn MailTransport> = if config.relay.enabled {
        info!(host = %config.relay.host, "outbound relay configured");
        Arc::new(SmtpRelay::new(config.relay.transport(&hostname)))
    } else {
        warn!("no outbound relay configured; remote recipients will bounce");
        Arc::new(NoRelay)
    };

    for n in 0..config.queue.send_workers {
        let worker = SendWorker::new(
            &db,
            broker.clone(),
            notifier.clone(),
            Arc::clone(&transport),
            local.clone(),
            config.queue.max_attempts,
        );
        let member = format!("sender-{n}");
        tasks.push(
            spawn_consumer(&broker, SEND_GROUP, &member, SEND_TOPIC, worker, &config.queue, &shutdown_rx)
                .await?,
        );
    }
    for n in 0..config.queue.receive_workers {
        let worker = ReceiveWorker::new(&db, notifier.clone());
        let member = format!("receiver-{n}");
        tasks.push(
            spawn_consumer(
                &broker,
                RECEIVE_GROUP,
                &member,
                RECEIVE_TOPIC,
                worker,
                &config.queue,
                &shutdown_rx,
            )
            .await?,
        );
    }

    let state = AppState::new(&db, broker.clone(), notifier.clone(), config.auth.auth())
        .context("building services")?;

    let scheduler = Scheduler::new(
        state.mail.clone(),
        Duration::from_secs(config.mail.schedule_interval_secs),
        config.mail.schedule_batch,
    );
    tasks.push(tokio::spawn(scheduler.run(shutdown_rx.clone())));

    if config.inbound.enabled {
        let sink = Arc::new(InboxSink::new(&db, broker.clone(), local.clone()));
        let receiver = Receiver::bind(
            config.inbound.bind,
            config.inbound.receiver(&hostname),
            sink,
        )
        .await
        .with_context(|| format!("binding SMTP receiver on {}", config.inbound.bind))?;
        let stop = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = receiver.serve(stop).await {
                error!(error = %e, "SMTP receiver failed");
            }
        }));
    }

    let app = api::router(state, config.server.max_body_bytes);
    let listener = TcpListener::bind(config.server.bind)
        .await
        .with_context(|| format!("binding HTTP listener on {}", config.server.bind))?;
    info!(addr = %listener.local_addr()?, domains = ?local.as_slice(), "mailroom listening");

    let mut http_stop = shutdown_rx.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = http_stop.wait_for(|stop| *stop).await;
            })
            .await
    });

    let early = tokio::select! {
        () = shutdown_signal() => None,
        joined = &mut server => Some(joined),
    };
    info!("shutting down");
    shutdown_tx.send_replace(true);

    let served = match early {
        Some(joined) => joined,
        None => {
            if let Ok(joined) = tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await {
                joined
            } else {
                // Event streams never end on their own.
                warn!("HTTP connections still open after the grace period");
                server.abort();
                Ok(Ok(()))
            }
        }
    };

    for task in tasks {
        if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
            warn!("background task did not stop in time");
        }
    }

    served
        .context("HTTP server task panicked")?
        .context("HTTP server failed")?;
    info!("mailroom stopped");
    Ok(())
}

/// Subscribes one group member and runs it on its own task.
async fn spawn_consumer<H>(
    broker: &Broker,
    group: &str,
    member: &str,
    topic: &str,
    handler: H,
    queue: &QueueConfig,
    shutdown: &watch::Receiver<bool>,
) -> anyhow::Result<JoinHandle<()>>
where
    H: RecordHandler + 'static,
{
    let consumer = Consumer::subscribe(broker, group, member, &[topic], queue.consumer())
        .await
        .with_context(|| format!("subscribing {member} to {topic}"))?;
    let policy = queue.retry_policy();
    let shutdown = shutdown.clone();
    let member = member.to_string();
    let group = group.to_string();
    Ok(tokio::spawn(async move {
        info!(%group, %member, "worker started");
        if let Err(e) = run_consumer(consumer, &handler, &policy, shutdown).await {
            error!(%group, %member, error = %e, "worker stopped on error");
        } else {
            info!(%group, %member, "worker stopped");
        }
    }))
}

/// Resolves on SIGTERM or SIGINT (Ctrl-C elsewhere).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(mut term), Ok(mut int)) => {
                tokio::select! {
                    _ = term.recv() => {}
                    _ = int.recv() => {}
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "signal handlers unavailable; falling back to Ctrl-C");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
