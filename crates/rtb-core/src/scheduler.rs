//! Cron-driven job scheduler.
//!
//! - Standard 5-field cron syntax (min hour dom mon dow), evaluated in a
//!   fixed time zone
//! - One independent loop per job; errors are logged and the loop continues
//! - No catch-up: runs missed while the process was down are not replayed

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    /// First run strictly after `now`; `None` stops the job.
    fn next_run(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>>;

    async fn run(&self, cancel: &CancellationToken) -> Result<()>;
}

pub struct JobScheduler {
    cancel: CancellationToken,
}

impl JobScheduler {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub fn start(&self, jobs: Vec<Arc<dyn Job>>) -> Vec<JoinHandle<()>> {
        jobs.into_iter().map(|job| self.spawn(job)).collect()
    }

    pub fn spawn(&self, job: Arc<dyn Job>) -> JoinHandle<()> {
        let cancel = self.cancel.clone();
        tokio::spawn(job_loop(job, cancel))
    }
}

async fn job_loop(job: Arc<dyn Job>, cancel: CancellationToken) {
    loop {
        let Some(next) = job.next_run(Utc::now()) else {
            tracing::warn!(job = job.name(), "job has no next run (stopping)");
            break;
        };
        tracing::debug!(job = job.name(), next = %next, "job scheduled");

        let dur = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(dur) => {
                let started = std::time::Instant::now();
                match job.run(&cancel).await {
                    Ok(()) => tracing::info!(
                        job = job.name(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "job finished"
                    ),
                    Err(e) => tracing::error!(job = job.name(), error = %e, "job failed"),
                }
            }
        }
    }
    tracing::debug!(job = job.name(), "job loop stopped");
}

/// One or more cron expressions sharing a time zone. The next run is the
/// earliest next match of any of them.
#[derive(Clone, Debug)]
pub struct Schedule {
    exprs: Vec<CronExpr>,
    tz: Tz,
}

impl Schedule {
    pub fn parse<S: AsRef<str>>(exprs: &[S], tz: Tz) -> Result<Self> {
        if exprs.is_empty() {
            return Err(Error::Config("schedule needs at least one cron expression".to_string()));
        }
        let exprs = exprs
            .iter()
            .map(|e| {
                CronExpr::parse(e.as_ref())
                    .map_err(|err| Error::Config(format!("cron `{}`: {err}", e.as_ref())))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { exprs, tz })
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.exprs
            .iter()
            .filter_map(|e| e.next_after(now, self.tz))
            .min()
    }
}

// === Cron expression engine ===

#[derive(Clone, Debug)]
struct CronExpr {
    min: Field,
    hour: Field,
    dom: Field,
    mon: Field,
    dow: Field,
}

#[derive(Clone, Debug)]
struct Field {
    min: u32,
    max: u32,
    any: bool,
    allowed: Vec<bool>, // index = value
}

impl CronExpr {
    fn parse(expr: &str) -> Result<Self> {
        let parts = expr.split_whitespace().collect::<Vec<_>>();
        if parts.len() != 5 {
            return Err(Error::Config(format!(
                "expected 5 fields, got {}",
                parts.len()
            )));
        }

        Ok(Self {
            min: Field::parse(parts[0], 0, 59, false)?,
            hour: Field::parse(parts[1], 0, 23, false)?,
            dom: Field::parse(parts[2], 1, 31, false)?,
            mon: Field::parse(parts[3], 1, 12, false)?,
            dow: Field::parse(parts[4], 0, 6, true)?,
        })
    }

    fn day_matches(&self, t: &NaiveDateTime) -> bool {
        if !self.mon.contains(t.month()) {
            return false;
        }

        // Standard cron semantics: if both DOM and DOW are restricted, match when EITHER matches.
        let dom_match = self.dom.contains(t.day());
        let dow_match = self.dow.contains(t.weekday().num_days_from_sunday());

        match (self.dom.any, self.dow.any) {
            (true, true) => true,
            (true, false) => dow_match,
            (false, true) => dom_match,
            (false, false) => dom_match || dow_match,
        }
    }

    /// Walks local wall-clock minutes in `tz`. Local times skipped by a DST
    /// jump never match; repeated ones resolve to their first occurrence.
    fn next_after(&self, now: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        // Start at the next minute boundary.
        let local = now.with_timezone(&tz).naive_local();
        let mut t = (local + chrono::Duration::minutes(1))
            .with_second(0)?
            .with_nanosecond(0)?;

        // Hard cap to avoid infinite loops for impossible expressions.
        let max_iters = 366usize * 24 * 60;
        for _ in 0..max_iters {
            if !self.day_matches(&t) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hour.contains(t.hour()) {
                t = t.with_minute(0)? + chrono::Duration::hours(1);
                continue;
            }
            if self.min.contains(t.minute()) {
                if let Some(at) = tz.from_local_datetime(&t).earliest() {
                    let at = at.with_timezone(&Utc);
                    if at > now {
                        return Some(at);
                    }
                }
            }
            t += chrono::Duration::minutes(1);
        }
        None
    }
}

impl Field {
    fn parse(raw: &str, min: u32, max: u32, allow_7_as_0: bool) -> Result<Self> {
        let raw = raw.trim();
        if raw == "*" {
            return Ok(Self {
                min,
                max,
                any: true,
                allowed: vec![true; (max + 1) as usize],
            });
        }

        let mut allowed = vec![false; (max + 1) as usize];
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (base, step) = match part.split_once('/') {
                Some((a, b)) => {
                    let step: u32 = b
                        .trim()
                        .parse()
                        .map_err(|_| Error::Config(format!("invalid step: {b}")))?;
                    if step == 0 {
                        return Err(Error::Config("step must be > 0".to_string()));
                    }
                    (a.trim(), Some(step))
                }
                None => (part, None),
            };

            let (start, end) = if base == "*" {
                (min, max)
            } else if let Some((a, b)) = base.split_once('-') {
                let a = parse_u32(a.trim(), allow_7_as_0)?;
                let b = parse_u32(b.trim(), false)?;
                // `5-7` on weekdays: Friday through Sunday.
                if allow_7_as_0 && b == 7 {
                    allowed[0] = true;
                    (a, max)
                } else {
                    (a, b)
                }
            } else {
                let a = parse_u32(base, allow_7_as_0)?;
                if step.is_some() {
                    (a, max)
                } else {
                    (a, a)
                }
            };

            if start < min || end > max || start > end {
                return Err(Error::Config(format!("invalid range: {base}")));
            }

            let step = step.unwrap_or(1);
            let mut v = start;
            while v <= end {
                allowed[v as usize] = true;
                v += step;
            }
        }

        let any = (min..=max).all(|v| allowed[v as usize]);
        Ok(Self {
            min,
            max,
            any,
            allowed,
        })
    }

    fn contains(&self, v: u32) -> bool {
        if v < self.min || v > self.max {
            return false;
        }
        self.allowed.get(v as usize).copied().unwrap_or(false)
    }
}

fn parse_u32(s: &str, allow_7_as_0: bool) -> Result<u32> {
    let v: u32 = s
        .parse()
        .map_err(|_| Error::Config(format!("invalid number: {s}")))?;
    if allow_7_as_0 && v == 7 {
        return Ok(0);
    }
    Ok(v)
}

// === Tests ===
