use std::time::Duration;

use serde::Serialize;

use crate::clock;
use crate::error::Result;
use crate::maps::VmaRecord;
use crate::pagemap::PresentRuns;

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// Sample
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// The outcome of one sampling tick: the VMAs of the target with their resident page counts.
///
/// A `Sample` borrows the engine's scratch arena, which the next tick overwrites in place; the
/// borrow must end before the engine can be sampled again.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Sample<'a> {
    pub pid: u32,
    /// `CLOCK_MONOTONIC` time at which the kernel data was captured, in nanoseconds.
    pub timestamp_ns: u64,
    pub vmas: &'a [VmaRecord],
    #[serde(skip)]
    page_size: u64,
    /// Page-table status words of every VMA, back to back, when the engine has them.
    #[serde(skip)]
    status_words: Option<&'a [u64]>,
}

impl<'a> Sample<'a> {
    pub(crate) fn new(pid: u32, timestamp_ns: u64, vmas: &'a [VmaRecord], page_size: u64) -> Self {
        Sample {
            pid,
            timestamp_ns,
            vmas,
            page_size,
            status_words: None,
        }
    }

    pub(crate) fn with_status_words(mut self, words: &'a [u64]) -> Self {
        debug_assert_eq!(
            words.len() as u64,
            self.vmas.iter().map(|v| v.pages(self.page_size)).sum::<u64>()
        );
        self.status_words = Some(words);
        self
    }

    /// Resident pages summed over every VMA.
    pub fn total_rss_pages(&self) -> u64 {
        self.vmas.iter().map(|v| v.rss).sum()
    }

    /// Resident bytes summed over every VMA.
    pub fn total_rss_bytes(&self) -> u64 {
        self.total_rss_pages() * self.page_size
    }

    /// The system page size the sample was taken with.
    #[inline(always)]
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// The runs of contiguous resident pages of every VMA, in VMA order.
    ///
    /// Only available from the page-table engine; `None` otherwise.
    pub fn present_runs(&self) -> Option<impl Iterator<Item = (&'a VmaRecord, PresentRuns<'a>)>> {
        let mut words = self.status_words?;
        let page_size = self.page_size;
        Some(self.vmas.iter().map(move |vma| {
            let (head, tail) = words.split_at(vma.pages(page_size) as usize);
            words = tail;
            (vma, PresentRuns::new(head, vma.start_page(page_size)))
        }))
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// RssEngine
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A strategy for computing the resident pages of every VMA of one process.
///
/// Implementors own every resource they need (pseudo-file handles and a scratch arena), acquire
/// them when constructed and release them when dropped.
pub trait RssEngine {
    /// The process being sampled.
    fn pid(&self) -> u32;

    /// Take one sample. A failure spoils this tick only, unless [`RssError::ends_sampling`]
    /// says otherwise.
    ///
    /// [`RssError::ends_sampling`]: crate::RssError::ends_sampling
    fn sample(&mut self) -> Result<Sample<'_>>;
}

impl<E: RssEngine + ?Sized> RssEngine for Box<E> {
    fn pid(&self) -> u32 {
        (**self).pid()
    }

    fn sample(&mut self) -> Result<Sample<'_>> {
        (**self).sample()
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// Schedule
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Fixed-period pacing: each sample is due one period after the previous one completed.
#[derive(Debug, Clone, Copy)]
pub struct Schedule {
    period_ns: u64,
    previous: Option<u64>,
}

impl Schedule {
    pub fn new(period: Duration) -> Self {
        Schedule {
            period_ns: clock::duration_ns(period),
            previous: None,
        }
    }

    #[inline(always)]
    pub fn period(&self) -> Duration {
        Duration::from_nanos(self.period_ns)
    }

    /// When the next sample is due; `None` before the first sample.
    #[inline(always)]
    pub fn next_deadline(&self) -> Option<u64> {
        self.previous.map(|ts| ts.saturating_add(self.period_ns))
    }

    /// Note the completion of a sample at `timestamp_ns`.
    #[inline(always)]
    pub fn record(&mut self, timestamp_ns: u64) {
        self.previous = Some(timestamp_ns);
    }

    /// Block until the next sample is due. Returns at once for the first sample and when the
    /// deadline has already passed.
    pub fn wait(&self) -> std::io::Result<()> {
        match self.next_deadline() {
            Some(deadline) => clock::sleep_until(deadline),
            None => Ok(()),
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// Sampler
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// An [`RssEngine`] driven by a [`Schedule`].
#[derive(Debug)]
pub struct Sampler<E> {
    engine: E,
    schedule: Schedule,
}

impl<E: RssEngine> Sampler<E> {
    pub fn new(engine: E, period: Duration) -> Self {
        Sampler {
            engine,
            schedule: Schedule::new(period),
        }
    }

    #[inline(always)]
    pub fn engine(&self) -> &E {
        &self.engine
    }

    #[inline(always)]
    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// Wait for the next tick and sample.
    ///
    /// A failed tick still counts as completed "now", so a retry keeps to the period.
    pub fn next_sample(&mut self) -> Result<Sample<'_>> {
        self.schedule.wait()?;
        match self.engine.sample() {
            Ok(sample) => {
                self.schedule.record(sample.timestamp_ns);
                Ok(sample)
            }
            Err(e) => {
                self.schedule.record(clock::now_ns());
                Err(e)
            }
        }
    }

    pub fn into_engine(self) -> E {
        self.engine
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// tests
//
///////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RssError;

    struct FixedEngine {
        vmas: Vec<VmaRecord>,
        fail: bool,
    }

    impl RssEngine for FixedEngine {
        fn pid(&self) -> u32 {
            1
        }

        fn sample(&mut self) -> Result<Sample<'_>> {
            if self.fail {
                return Err(RssError::parse("Rss: ?", "broken"));
            }
            Ok(Sample::new(1, clock::now_ns(), &self.vmas, 4096))
        }
    }

    fn engine(fail: bool) -> FixedEngine {
        FixedEngine {
            vmas: vec![
                VmaRecord {
                    start_addr: 0x1000,
                    end_addr: 0x5000,
                    rss: 3,
                },
                VmaRecord {
                    start_addr: 0x8000,
                    end_addr: 0x9000,
                    rss: 1,
                },
            ],
            fail,
        }
    }

    #[test]
    fn test_first_sample_is_immediate() -> anyhow::Result<()> {
        let schedule = Schedule::new(Duration::from_secs(3600));
        assert_eq!(schedule.next_deadline(), None);
        let start = clock::now_ns();
        schedule.wait()?;
        assert!(clock::now_ns() - start < 50_000_000);
        Ok(())
    }

    #[test]
    fn test_wait_does_not_return_before_deadline() -> anyhow::Result<()> {
        let mut schedule = Schedule::new(Duration::from_millis(30));
        let now = clock::now_ns();
        schedule.record(now);
        assert_eq!(schedule.next_deadline(), Some(now + 30_000_000));
        schedule.wait()?;
        assert!(clock::now_ns() >= now + 30_000_000);
        Ok(())
    }

    #[test]
    fn test_wait_after_deadline_returns_immediately() -> anyhow::Result<()> {
        let mut schedule = Schedule::new(Duration::from_millis(10));
        schedule.record(clock::now_ns().saturating_sub(1_000_000_000));
        let start = clock::now_ns();
        schedule.wait()?;
        assert!(clock::now_ns() - start < 50_000_000);
        Ok(())
    }

    #[test]
    fn test_sampler_keeps_the_period() -> anyhow::Result<()> {
        let mut sampler = Sampler::new(engine(false), Duration::from_millis(25));
        let first = sampler.next_sample()?.timestamp_ns;
        let second = sampler.next_sample()?;
        assert!(second.timestamp_ns >= first + 25_000_000);
        assert_eq!(second.total_rss_pages(), 4);
        assert_eq!(second.total_rss_bytes(), 4 * 4096);
        assert!(second.present_runs().is_none());
        Ok(())
    }

    #[test]
    fn test_failed_tick_still_paces_the_retry() {
        let mut sampler = Sampler::new(engine(true), Duration::from_millis(25));
        let before = clock::now_ns();
        assert!(sampler.next_sample().is_err());
        let deadline = sampler.schedule().next_deadline().unwrap();
        assert!(deadline >= before + 25_000_000);
        assert!(sampler.next_sample().is_err());
        assert!(clock::now_ns() >= deadline);
    }

    #[test]
    fn test_sample_serializes_without_internals() -> anyhow::Result<()> {
        let mut e = engine(false);
        let sample = e.sample()?;
        let json = serde_json::to_value(&sample)?;
        assert_eq!(json["pid"], 1);
        assert_eq!(json["vmas"][0]["rss"], 3);
        assert!(json.get("page_size").is_none());
        assert!(json.get("status_words").is_none());
        Ok(())
    }
}
