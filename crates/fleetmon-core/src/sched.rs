//! Time-driven scheduling primitives.
//!
//! Replaces ad hoc `loop { sleep }` constructions with a small tagged
//! schedule type plus three runners. `Schedule::next_fire` is a pure
//! function of the current time, so schedule arithmetic is tested without
//! sleeping; the runners only ever sleep until a computed instant and
//! observe the cooperative stop signal at every await point.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// When a task should run next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Fixed interval between executions.
    Periodic(Duration),
    /// Every day at the given wall-clock time in `tz`.
    DailyAt { hour: u32, minute: u32, tz: Tz },
}

impl Schedule {
    /// The next fire instant strictly after `now`.
    ///
    /// For `DailyAt` the occurrence is recomputed from scratch: invoked at
    /// 09:05 local with a 09:00 schedule it returns 09:00 tomorrow, and a
    /// DST transition shifts the result rather than accumulating drift.
    pub fn next_fire(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Schedule::Periodic(interval) => {
                now + chrono::Duration::from_std(*interval)
                    .unwrap_or_else(|_| chrono::Duration::seconds(interval.as_secs() as i64))
            }
            Schedule::DailyAt { hour, minute, tz } => {
                next_daily(now.with_timezone(tz), *hour, *minute).with_timezone(&Utc)
            }
        }
    }
}

/// First occurrence of `hour:minute` strictly after `now` in its timezone.
fn next_daily(now: DateTime<Tz>, hour: u32, minute: u32) -> DateTime<Tz> {
    let tz = now.timezone();
    let mut date = now.date_naive();
    for _ in 0..3 {
        if let Some(candidate) = resolve_local(tz, date, hour, minute) {
            if candidate > now {
                return candidate;
            }
        }
        date = date.succ_opt().unwrap_or(date);
    }
    // Unreachable with a valid hour/minute; fall back to a day from now.
    now + chrono::Duration::days(1)
}

/// Maps a local wall-clock time to an instant, handling DST folds (earliest
/// side wins) and gaps (shifted one hour forward).
fn resolve_local(tz: Tz, date: NaiveDate, hour: u32, minute: u32) -> Option<DateTime<Tz>> {
    let naive = date.and_hms_opt(hour, minute, 0)?;
    match tz.from_local_datetime(&naive) {
        chrono::LocalResult::Single(t) => Some(t),
        chrono::LocalResult::Ambiguous(earliest, _) => Some(earliest),
        chrono::LocalResult::None => tz
            .from_local_datetime(&(naive + chrono::Duration::hours(1)))
            .earliest(),
    }
}

/// True once the stop signal has been raised or its sender dropped.
fn stopped(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow()
}

/// Sleeps for `duration` unless stopped first. Returns false when stopped.
pub(crate) async fn sleep_or_stop(stop: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        res = stop.changed() => !(res.is_err() || *stop.borrow()),
    }
}

/// Runs `task` forever at a fixed interval. Errors are logged and never
/// stop the loop; the stop signal does.
pub async fn run_periodically<F, Fut, E>(
    mut stop: watch::Receiver<bool>,
    interval: Duration,
    mut task: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    loop {
        if stopped(&stop) {
            return;
        }
        if let Err(e) = task().await {
            warn!(error = %e, "periodic task failed");
        }
        if !sleep_or_stop(&mut stop, interval).await {
            return;
        }
    }
}

/// Runs `task` every day at `hour:minute` in `tz`.
///
/// The next occurrence is recomputed on every iteration — never cached
/// across the long sleep — so the loop self-corrects against clock
/// adjustments and DST.
pub async fn run_daily_at<F, Fut, E>(
    mut stop: watch::Receiver<bool>,
    hour: u32,
    minute: u32,
    tz: Tz,
    mut task: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    let schedule = Schedule::DailyAt { hour, minute, tz };
    loop {
        if stopped(&stop) {
            return;
        }
        let now = Utc::now();
        let target = schedule.next_fire(now);
        let wait = (target - now).to_std().unwrap_or(Duration::ZERO);
        debug!(next_run = %target, "daily task scheduled");
        if !sleep_or_stop(&mut stop, wait).await {
            return;
        }
        if stopped(&stop) {
            return;
        }
        if let Err(e) = task().await {
            warn!(error = %e, "daily task failed");
        }
    }
}

/// Runs a long-lived task, restarting it after `backoff` whenever it returns
/// an error. A clean return ends the loop (the task observed its stop
/// signal); `make_task` builds a fresh run for each attempt.
pub async fn run_with_restart<F, Fut, E>(
    mut stop: watch::Receiver<bool>,
    backoff: Duration,
    mut make_task: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    loop {
        if stopped(&stop) {
            return;
        }
        match make_task().await {
            Ok(()) => return,
            Err(e) => {
                error!(error = %e, "collector loop crashed, restarting");
            }
        }
        if !sleep_or_stop(&mut stop, backoff).await {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEOUL: Tz = chrono_tz::Asia::Seoul;

    fn seoul_utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        SEOUL
            .with_ymd_and_hms(y, mo, d, h, mi, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn periodic_adds_interval() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let next = Schedule::Periodic(Duration::from_secs(900)).next_fire(now);
        assert_eq!(next, now + chrono::Duration::seconds(900));
    }

    #[test]
    fn daily_after_target_rolls_to_tomorrow() {
        let schedule = Schedule::DailyAt {
            hour: 9,
            minute: 0,
            tz: SEOUL,
        };
        // 09:05 local → 09:00 the following day, not the same day.
        let next = schedule.next_fire(seoul_utc(2024, 5, 1, 9, 5));
        assert_eq!(next, seoul_utc(2024, 5, 2, 9, 0));
    }

    #[test]
    fn daily_before_target_fires_same_day() {
        let schedule = Schedule::DailyAt {
            hour: 9,
            minute: 0,
            tz: SEOUL,
        };
        let next = schedule.next_fire(seoul_utc(2024, 5, 1, 8, 59));
        assert_eq!(next, seoul_utc(2024, 5, 1, 9, 0));
    }

    #[test]
    fn daily_handles_dst_gap() {
        // US Eastern, 2024-03-10: 02:30 local does not exist.
        let tz: Tz = chrono_tz::America::New_York;
        let schedule = Schedule::DailyAt {
            hour: 2,
            minute: 30,
            tz,
        };
        let now = tz
            .with_ymd_and_hms(2024, 3, 10, 0, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        let next = schedule.next_fire(now);
        // Shifted into the hour after the gap.
        let expected = tz
            .with_ymd_and_hms(2024, 3, 10, 3, 30, 0)
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(next, expected);
    }

    #[tokio::test]
    async fn periodic_runner_survives_errors_and_stops() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let counter = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = counter.clone();

        let handle = tokio::spawn(run_periodically(
            stop_rx,
            Duration::from_millis(5),
            move || {
                let n = c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async move {
                    if n % 2 == 0 {
                        Err("boom")
                    } else {
                        Ok(())
                    }
                }
            },
        ));

        tokio::time::sleep(Duration::from_millis(40)).await;
        stop_tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(counter.load(std::sync::atomic::Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn restart_runner_retries_until_clean_exit() {
        let (_stop_tx, stop_rx) = watch::channel(false);
        let attempts = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let a = attempts.clone();

        run_with_restart(stop_rx, Duration::from_millis(1), move || {
            let n = a.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("transient crash")
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn runners_exit_promptly_on_stop() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_periodically(
            stop_rx,
            Duration::from_secs(3600),
            || async { Ok::<(), &str>(()) },
        ));
        tokio::time::sleep(Duration::from_millis(10)).await;
        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("runner did not observe stop")
            .unwrap();
    }
}
