//! Turns due scheduled sends into send jobs.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::service::MailService;
use crate::{Error, Result};

/// Polls `email_schedules` and sends what is due.
#[derive(Debug, Clone)]
pub struct Scheduler {
    service: MailService,
    interval: Duration,
    batch: u32,
}

impl Scheduler {
    /// Creates a scheduler checking every `interval`, at most `batch`
    /// schedules per check.
    #[must_use]
    pub fn new(service: MailService, interval: Duration, batch: u32) -> Self {
        Self {
            service,
            interval,
            batch: batch.max(1),
        }
    }

    /// Dispatches the schedules due at `now` and returns how many were sent.
    ///
    /// Schedules whose email can no longer be sent (deleted, edited into
    /// something invalid, already sent by hand) are cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or the topic log fails; the remaining
    /// schedules are picked up on the next tick.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.service.due_schedules(now, self.batch).await?;
        let mut sent = 0;
        for schedule in &due {
            match self.service.dispatch(schedule).await {
                Ok(email) => {
                    info!(schedule_id = %schedule.id, email_id = %email.id, status = %email.status, "scheduled send dispatched");
                    sent += 1;
                }
                Err(
                    e @ (Error::Validation(_)
                    | Error::Conflict(_)
                    | Error::NotFound(_)
                    | Error::Forbidden(_)),
                ) => {
                    warn!(schedule_id = %schedule.id, email_id = %schedule.email_id, error = %e, "scheduled send abandoned");
                    self.service.abandon(schedule).await?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(sent)
    }

    /// Ticks until `shutdown` turns true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = self.interval.as_millis(), "scheduler started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick(Utc::now()).await {
                        Ok(0) => {}
                        Ok(n) => debug!(dispatched = n, "scheduler tick"),
                        Err(e) => warn!(error = %e, "scheduler tick failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("scheduler stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::ids::UserId;
    use crate::mail::{Compose, EmailStatus, MailRepository};
    use crate::notify::Notifier;
    use crate::pipeline::create_topics;
    use crate::schedule::{ScheduleRepository, ScheduleStatus};
    use crate::user::UserRepository;
    use mailroom_queue::Broker;

    struct Fixture {
        scheduler: Scheduler,
        service: MailService,
        mail: MailRepository,
        schedules: ScheduleRepository,
        ada: UserId,
    }

    async fn fixture() -> Fixture {
        let db = Database::in_memory().await.unwrap();
        let broker = Broker::in_memory().await.unwrap();
        create_topics(&broker, 1).await.unwrap();
        let ada = UserRepository::new(&db)
            .create("ada@example.com", "Ada", "h")
            .await
            .unwrap()
            .id;
        let service = MailService::new(&db, broker, Notifier::new());
        Fixture {
            scheduler: Scheduler::new(service.clone(), Duration::from_millis(10), 10),
            service,
            mail: MailRepository::new(&db),
            schedules: ScheduleRepository::new(&db),
            ada,
        }
    }

    fn compose() -> Compose {
        Compose {
            to: vec!["bob@example.org".into()],
            subject: "Later".into(),
            body_text: "Sent by the clock.".into(),
            ..Compose::default()
        }
    }

    #[tokio::test]
    async fn dispatches_only_due_schedules() {
        let f = fixture().await;
        let draft = f.service.create_draft(f.ada, &compose()).await.unwrap();
        let send_at = Utc::now() + chrono::Duration::hours(1);
        let schedule = f.service.schedule(f.ada, draft.id, send_at).await.unwrap();

        assert_eq!(f.scheduler.tick(Utc::now()).await.unwrap(), 0);
        assert_eq!(
            f.mail.get(draft.id).await.unwrap().unwrap().status,
            EmailStatus::Draft
        );

        let later = send_at + chrono::Duration::seconds(1);
        assert_eq!(f.scheduler.tick(later).await.unwrap(), 1);
        assert_eq!(
            f.mail.get(draft.id).await.unwrap().unwrap().status,
            EmailStatus::Queued
        );
        let stored = f.schedules.get(schedule.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ScheduleStatus::Dispatched);

        // Nothing left to do.
        assert_eq!(f.scheduler.tick(later).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unsendable_schedules_are_cancelled() {
        let f = fixture().await;
        let draft = f.service.create_draft(f.ada, &compose()).await.unwrap();
        let send_at = Utc::now() + chrono::Duration::hours(1);
        let schedule = f.service.schedule(f.ada, draft.id, send_at).await.unwrap();
        // The draft loses its recipients after scheduling.
        let emptied = Compose {
            to: Vec::new(),
            ..compose()
        };
        f.service.update_draft(f.ada, draft.id, &emptied).await.unwrap();

        let later = send_at + chrono::Duration::seconds(1);
        assert_eq!(f.scheduler.tick(later).await.unwrap(), 0);
        let stored = f.schedules.get(schedule.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ScheduleStatus::Cancelled);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let f = fixture().await;
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(f.scheduler.clone().run(rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
