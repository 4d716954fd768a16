use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Asia::Seoul;

/// Civil date for an instant, pinned to KST. The process-local timezone must
/// never participate in date math anywhere in this crate.
pub fn kst_date(now_utc: DateTime<Utc>) -> NaiveDate {
    now_utc.with_timezone(&Seoul).date_naive()
}

pub trait Clock: Send {
    fn today(&self) -> NaiveDate;
}

/// Wall clock, normalized to KST.
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        kst_date(Utc::now())
    }
}

/// Pinned date for demos and sidecar tests (CERTD_TODAY).
pub struct FixedClock(pub NaiveDate);

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        self.0
    }
}

/// CERTD_TODAY=YYYY-MM-DD pins the clock; anything else is the wall clock.
pub fn from_env() -> Box<dyn Clock> {
    if let Ok(raw) = std::env::var("CERTD_TODAY") {
        if let Ok(d) = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d") {
            return Box::new(FixedClock(d));
        }
        tracing::warn!(value = %raw, "ignoring unparseable CERTD_TODAY");
    }
    Box::new(SystemClock)
}
