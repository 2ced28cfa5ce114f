use std::collections::BTreeMap;
use std::fmt;

/// Counters for a single function.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FuncStat {
    pub worker: u64,
    pub job: u64,
    pub processing: u64,
}

impl FuncStat {
    /// Every ready-or-processing job is already leased out.
    pub fn is_saturated(&self) -> bool {
        self.job > 0 && self.processing >= self.job
    }

    /// Worth asking the ready index for a candidate.
    pub fn is_dispatchable(&self) -> bool {
        self.worker > 0 && !self.is_saturated()
    }
}

/// One line of a STATUS report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatLine<'a> {
    pub func: &'a str,
    pub stat: FuncStat,
}

impl fmt::Display for StatLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.func, self.stat.worker, self.stat.job, self.stat.processing
        )
    }
}

/// Per-function statistics driving dispatch eligibility.
///
/// Increments create the entry lazily; decrements on a missing entry are
/// no-ops and never go below zero.
#[derive(Debug, Default)]
pub struct FuncStats {
    stats: BTreeMap<String, FuncStat>,
}

impl FuncStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, func: &str) -> &mut FuncStat {
        self.stats.entry(func.to_string()).or_default()
    }

    pub fn incr_worker(&mut self, func: &str) -> u64 {
        let stat = self.entry(func);
        stat.worker += 1;
        stat.worker
    }

    pub fn decr_worker(&mut self, func: &str) -> u64 {
        match self.stats.get_mut(func) {
            Some(stat) => {
                stat.worker = stat.worker.saturating_sub(1);
                stat.worker
            }
            None => 0,
        }
    }

    pub fn incr_job(&mut self, func: &str) -> u64 {
        let stat = self.entry(func);
        stat.job += 1;
        stat.job
    }

    pub fn decr_job(&mut self, func: &str) -> u64 {
        match self.stats.get_mut(func) {
            Some(stat) => {
                stat.job = stat.job.saturating_sub(1);
                stat.processing = stat.processing.min(stat.job);
                stat.job
            }
            None => 0,
        }
    }

    pub fn incr_proc(&mut self, func: &str) -> u64 {
        let stat = self.entry(func);
        stat.processing += 1;
        stat.job = stat.job.max(stat.processing);
        stat.processing
    }

    pub fn decr_proc(&mut self, func: &str) -> u64 {
        match self.stats.get_mut(func) {
            Some(stat) => {
                stat.processing = stat.processing.saturating_sub(1);
                stat.processing
            }
            None => 0,
        }
    }

    /// Pull job-count down to processing-count after the ready index turned
    /// out to hold nothing for this function.
    pub fn deflate_job(&mut self, func: &str) {
        if let Some(stat) = self.stats.get_mut(func) {
            stat.job = stat.processing;
        }
    }

    pub fn get(&self, func: &str) -> Option<FuncStat> {
        self.stats.get(func).copied()
    }

    pub fn remove(&mut self, func: &str) -> Option<FuncStat> {
        self.stats.remove(func)
    }

    /// Functions with a connected worker and spare ready jobs, in name order.
    pub fn dispatchable(&self) -> Vec<String> {
        self.stats
            .iter()
            .filter(|(_, stat)| stat.is_dispatchable())
            .map(|(func, _)| func.clone())
            .collect()
    }

    pub fn lines(&self) -> impl Iterator<Item = StatLine<'_>> {
        self.stats.iter().map(|(func, stat)| StatLine {
            func: func.as_str(),
            stat: *stat,
        })
    }

    /// Newline-delimited STATUS report.
    pub fn report(&self) -> String {
        let mut out = String::new();
        for line in self.lines() {
            out.push_str(&line.to_string());
            out.push('\n');
        }
        out
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }
}
