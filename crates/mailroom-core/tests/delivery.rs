//! End-to-end delivery between local mailboxes through both topics.

#![allow(clippy::unwrap_used)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use mailroom_core::mail::{Compose, EmailStatus, Folder, ListQuery};
use mailroom_core::pipeline::{
    LocalDomains, NoRelay, RECEIVE_GROUP, RECEIVE_TOPIC, ReceiveWorker, SEND_GROUP, SEND_TOPIC,
    SendWorker, create_topics,
};
use mailroom_core::service::{AuthConfig, ReplyRequest};
use mailroom_core::user::UserRepository;
use mailroom_core::{
    AnalyticsEvent, AnalyticsRepository, AuthService, Database, MailService, Notifier, UserId,
};
use mailroom_queue::{Broker, Consumer, ConsumerConfig, RetryPolicy, run_consumer};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const MAX_ATTEMPTS: u32 = 3;

struct Harness {
    db: Database,
    service: MailService,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    ada: UserId,
    bob: UserId,
}

fn consumer_config() -> ConsumerConfig {
    ConsumerConfig {
        poll_interval: Duration::from_millis(10),
        ..ConsumerConfig::default()
    }
}

fn retry_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: MAX_ATTEMPTS,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
        multiplier: 2.0,
    }
}

async fn harness() -> Harness {
    let db = Database::in_memory().await.unwrap();
    let broker = Broker::in_memory().await.unwrap();
    create_topics(&broker, 2).await.unwrap();
    let notifier = Notifier::new();

    let auth = AuthService::new(
        UserRepository::new(&db),
        AuthConfig {
            password_memory_kib: 64,
            password_iterations: 1,
            ..AuthConfig::default()
        },
    )
    .unwrap();
    let ada = auth
        .register("ada@example.com", "correct horse", "Ada")
        .await
        .unwrap()
        .id;
    let bob = auth
        .register("bob@example.com", "battery staple", "Bob")
        .await
        .unwrap()
        .id;

    let (shutdown, rx) = watch::channel(false);
    let mut workers = Vec::new();

    let sender = SendWorker::new(
        &db,
        broker.clone(),
        notifier.clone(),
        Arc::new(NoRelay),
        LocalDomains::new(["example.com"]),
        MAX_ATTEMPTS,
    );
    let consumer = Consumer::subscribe(&broker, SEND_GROUP, "sender-1", &[SEND_TOPIC], consumer_config())
        .await
        .unwrap();
    let stop = rx.clone();
    workers.push(tokio::spawn(async move {
        run_consumer(consumer, &sender, &retry_policy(), stop)
            .await
            .unwrap();
    }));

    let receiver = ReceiveWorker::new(&db, notifier.clone());
    let consumer = Consumer::subscribe(
        &broker,
        RECEIVE_GROUP,
        "receiver-1",
        &[RECEIVE_TOPIC],
        consumer_config(),
    )
    .await
    .unwrap();
    workers.push(tokio::spawn(async move {
        run_consumer(consumer, &receiver, &retry_policy(), rx)
            .await
            .unwrap();
    }));

    Harness {
        service: MailService::new(&db, broker, notifier),
        db,
        shutdown,
        workers,
        ada,
        bob,
    }
}

impl Harness {
    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        for worker in self.workers {
            tokio::time::timeout(Duration::from_secs(5), worker)
                .await
                .unwrap()
                .unwrap();
        }
    }

    async fn inbox(&self, user: UserId) -> Vec<mailroom_core::mail::EmailSummary> {
        self.service
            .list(
                user,
                &ListQuery {
                    folder: Some(Folder::Inbox),
                    ..ListQuery::default()
                },
            )
            .await
            .unwrap()
            .items
    }
}

/// Polls `check` until it yields a value or five seconds pass.
async fn eventually<T, F, Fut>(mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(value) = check().await {
            return value;
        }
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn local_mail_round_trip() {
    let h = harness().await;

    let sent = h
        .service
        .send_new(
            h.ada,
            &Compose {
                to: vec!["Bob <bob@example.com>".into()],
                cc: vec!["carol@example.org".into()],
                subject: "Quarterly numbers".into(),
                body_text: "Attached soon.".into(),
                ..Compose::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(sent.status, EmailStatus::Queued);

    // Bob is local; Carol has no relay to go through.
    let finished = eventually(|| async {
        let email = h.service.owned(h.ada, sent.id).await.unwrap();
        email.status.is_terminal().then_some(email)
    })
    .await;
    assert_eq!(finished.status, EmailStatus::PartiallySent);
    assert_eq!(finished.folder, Folder::Sent);

    let bob_inbox = eventually(|| async {
        let inbox = h.inbox(h.bob).await;
        (!inbox.is_empty()).then_some(inbox)
    })
    .await;
    assert_eq!(bob_inbox.len(), 1);
    assert_eq!(bob_inbox[0].subject, "Quarterly numbers");
    assert!(!bob_inbox[0].is_read);

    // Bob answers; the reply threads with Ada's sent copy.
    let reply = h
        .service
        .reply(
            h.bob,
            bob_inbox[0].id,
            &ReplyRequest {
                body_text: "Looking forward to it.".into(),
                send: true,
                ..ReplyRequest::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(reply.subject, "Re: Quarterly numbers");

    let ada_inbox = eventually(|| async {
        let inbox = h.inbox(h.ada).await;
        (!inbox.is_empty()).then_some(inbox)
    })
    .await;
    assert_eq!(ada_inbox[0].thread_id, finished.thread_id);

    let thread = h.service.thread(h.ada, finished.thread_id).await.unwrap();
    assert_eq!(thread.emails.len(), 2);

    let analytics = AnalyticsRepository::new(&h.db)
        .summary(h.ada, chrono::Utc::now() - chrono::Duration::days(1))
        .await
        .unwrap();
    assert_eq!(analytics.count(AnalyticsEvent::Queued), 1);
    assert_eq!(analytics.count(AnalyticsEvent::Delivered), 1);
    assert_eq!(analytics.count(AnalyticsEvent::Bounced), 1);
    assert_eq!(analytics.count(AnalyticsEvent::Received), 1);

    h.stop().await;
}

#[tokio::test]
async fn mail_to_self_keeps_one_copy() {
    let h = harness().await;
    let sent = h
        .service
        .send_new(
            h.ada,
            &Compose {
                to: vec!["ada@example.com".into()],
                subject: "Note to self".into(),
                body_text: "Buy milk.".into(),
                ..Compose::default()
            },
        )
        .await
        .unwrap();

    let finished = eventually(|| async {
        let email = h.service.owned(h.ada, sent.id).await.unwrap();
        email.status.is_terminal().then_some(email)
    })
    .await;
    assert_eq!(finished.status, EmailStatus::Sent);

    // Give the receive worker time to see (and skip) the local copy.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.inbox(h.ada).await.is_empty());

    h.stop().await;
}
