//! Resource Usage Monitoring
//!
//! Samples CPU and memory of one process (the sandbox worker, or the
//! current process) so limits can be enforced while a run is in flight.

use std::time::{Duration, Instant};

use sysinfo::{get_current_pid, Pid, ProcessRefreshKind, System};

/// A single resource usage sample.
#[derive(Debug, Clone)]
pub struct ResourceSample {
    /// When this sample was taken
    pub timestamp: Instant,
    /// CPU usage percentage (0-100+)
    pub cpu_usage: f32,
    /// Memory usage in megabytes
    pub memory_mb: u64,
}

/// Monitors resource usage of a single process.
///
/// # Example
///
/// ```rust,ignore
/// use piperunner::monitoring::ResourceMonitor;
///
/// let mut monitor = ResourceMonitor::for_process(worker_pid);
/// if let Some(sample) = monitor.sample() {
///     println!("worker uses {} MB", sample.memory_mb);
/// }
/// ```
pub struct ResourceMonitor {
    system: System,
    process_id: Pid,
    samples: Vec<ResourceSample>,
    warmup_done: bool,
    last_sample: Option<Instant>,
    min_interval: Duration,
}

impl ResourceMonitor {
    /// Creates a monitor for the given OS process id.
    pub fn for_process(pid: u32) -> Self {
        Self {
            system: System::new(),
            process_id: Pid::from_u32(pid),
            samples: Vec::new(),
            warmup_done: false,
            last_sample: None,
            min_interval: Duration::from_millis(250),
        }
    }

    /// Creates a monitor for the current process.
    pub fn current() -> Option<Self> {
        get_current_pid().ok().map(|pid| Self::for_process(pid.as_u32()))
    }

    /// Sets the minimum interval between samples.
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Takes a resource usage sample and returns it if one was recorded.
    ///
    /// The first call performs CPU warmup (required for accurate readings).
    /// Subsequent calls are rate-limited by `min_interval`. Returns `None`
    /// as well when the process is gone.
    pub fn sample(&mut self) -> Option<&ResourceSample> {
        let now = Instant::now();
        let refresh_kind = ProcessRefreshKind::new().with_cpu().with_memory();

        if !self.warmup_done {
            self.system.refresh_processes_specifics(refresh_kind);
            self.warmup_done = true;
            self.last_sample = Some(now);
            return None;
        }

        if let Some(last) = self.last_sample {
            if now.duration_since(last) < self.min_interval {
                return None;
            }
        }

        self.system.refresh_processes_specifics(refresh_kind);
        self.last_sample = Some(now);

        let process = self.system.process(self.process_id)?;
        self.samples.push(ResourceSample {
            timestamp: now,
            cpu_usage: process.cpu_usage(),
            memory_mb: process.memory() / (1024 * 1024),
        });
        self.samples.last()
    }

    /// One line for the run log.
    pub fn usage_summary(&self) -> String {
        if self.samples.is_empty() {
            return format!("pid {}: no resource samples", self.process_id);
        }
        format!(
            "pid {}: peak memory {} MB, average CPU {:.1}% over {} samples",
            self.process_id,
            self.peak_memory_mb(),
            self.average_cpu(),
            self.samples.len()
        )
    }

    pub fn samples(&self) -> &[ResourceSample] {
        &self.samples
    }

    pub fn peak_memory_mb(&self) -> u64 {
        self.samples.iter().map(|s| s.memory_mb).max().unwrap_or(0)
    }

    pub fn average_cpu(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|s| s.cpu_usage).sum::<f32>() / self.samples.len() as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_first_sample_is_warmup() {
        let mut monitor = ResourceMonitor::current().unwrap();
        assert!(monitor.sample().is_none());
        assert!(monitor.samples().is_empty());
    }

    #[test]
    fn test_sampling_current_process() {
        let mut monitor = ResourceMonitor::current()
            .unwrap()
            .with_min_interval(Duration::from_millis(50));
        monitor.sample();
        thread::sleep(Duration::from_millis(100));

        let sample = monitor.sample().cloned();
        assert!(sample.is_some());
        assert!(monitor.peak_memory_mb() > 0);
        assert!(monitor.usage_summary().contains("peak memory"));
    }

    #[test]
    fn test_rate_limited() {
        let mut monitor = ResourceMonitor::current()
            .unwrap()
            .with_min_interval(Duration::from_secs(60));
        monitor.sample();
        assert!(monitor.sample().is_none());
    }

    #[test]
    fn test_missing_process() {
        let mut monitor =
            ResourceMonitor::for_process(u32::MAX - 1).with_min_interval(Duration::ZERO);
        monitor.sample();
        assert!(monitor.sample().is_none());
        assert_eq!(monitor.peak_memory_mb(), 0);
        assert_eq!(monitor.average_cpu(), 0.0);
    }
}
