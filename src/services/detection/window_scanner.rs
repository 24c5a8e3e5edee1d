// Window Scanner
// Overlapping windows over the sentence sequence, detectors run per window,
// window-local citations remapped to global indexes here and nowhere else.

use crate::models::{Flag, SourceStatus, Window};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::detector::Detector;

#[derive(Debug, Clone, Copy)]
pub struct WindowSettings {
    pub window_size: usize,
    pub overlap: usize,
    pub max_concurrency: usize,
}

impl Default for WindowSettings {
    fn default() -> Self {
        Self {
            window_size: 40,
            overlap: 5,
            max_concurrency: 4,
        }
    }
}

/// Window boundaries for `n` sentences.
///
/// `end = min(n, pos + W)`; stop once `end == n`; otherwise `pos = max(end - O, pos + 1)`.
/// The `+1` floor bounds the plan at `n` windows even when `O >= W`. `W = 0` is treated as 1.
pub fn plan_windows(n: usize, window_size: usize, overlap: usize) -> Vec<Window> {
    let w = window_size.max(1);
    let mut windows = Vec::new();
    let mut position = 0usize;
    while position < n {
        let end = n.min(position + w);
        windows.push(Window::new(position, end));
        if end == n {
            break;
        }
        position = end.saturating_sub(overlap).max(position + 1);
    }
    windows
}

/// Globally indexed output of one scan.
#[derive(Debug, Default)]
pub struct WindowedScan {
    pub windows: Vec<Window>,
    /// Flags per detector, in detector order; each list is sorted by window.
    pub flags: Vec<Vec<Flag>>,
    pub sources: Vec<SourceStatus>,
}

impl WindowedScan {
    pub fn all_flags(&self) -> Vec<Flag> {
        self.flags.iter().flatten().cloned().collect()
    }

    pub fn degraded(&self) -> bool {
        self.sources.iter().any(SourceStatus::is_degraded)
    }
}

type TaskOutput = (usize, usize, Result<Vec<Flag>, String>);

/// Run every detector over every window, at most `max_concurrency` calls in flight.
///
/// A failing (window, detector) pair contributes nothing and is counted in its source
/// status; the scan itself never fails.
pub async fn scan_windows(
    sentences: Arc<Vec<String>>,
    detectors: &[Arc<dyn Detector>],
    settings: &WindowSettings,
) -> WindowedScan {
    let started = Instant::now();
    let windows = plan_windows(sentences.len(), settings.window_size, settings.overlap);

    let mut sources: Vec<SourceStatus> = detectors
        .iter()
        .map(|d| SourceStatus {
            detector: d.name().to_string(),
            ..Default::default()
        })
        .collect();

    if windows.is_empty() || detectors.is_empty() {
        return WindowedScan {
            windows,
            flags: vec![Vec::new(); detectors.len()],
            sources,
        };
    }

    info!(
        "[SCANNER] start sentences={} windows={} detectors={} window_size={} overlap={}",
        sentences.len(),
        windows.len(),
        detectors.len(),
        settings.window_size,
        settings.overlap
    );

    let semaphore = Arc::new(Semaphore::new(settings.max_concurrency.max(1)));
    let mut join_set: JoinSet<TaskOutput> = JoinSet::new();
    let mut pending: HashSet<(usize, usize)> = HashSet::new();

    for (w_idx, window) in windows.iter().copied().enumerate() {
        for (d_idx, detector) in detectors.iter().enumerate() {
            let detector = Arc::clone(detector);
            let sentences = Arc::clone(&sentences);
            let semaphore = Arc::clone(&semaphore);
            pending.insert((w_idx, d_idx));

            join_set.spawn(async move {
                let result = match semaphore.acquire().await {
                    Ok(_permit) => detector
                        .detect(window.slice(&sentences))
                        .await
                        .map_err(|e| e.to_string()),
                    Err(_) => Err("semaphore closed".to_string()),
                };
                (w_idx, d_idx, result)
            });
        }
    }

    // (window, flags) per detector, remapped as each task lands.
    let mut per_detector: Vec<Vec<(usize, Vec<Flag>)>> = vec![Vec::new(); detectors.len()];
    while let Some(res) = join_set.join_next().await {
        match res {
            Ok((w_idx, d_idx, outcome)) => {
                pending.remove(&(w_idx, d_idx));
                let status = &mut sources[d_idx];
                match outcome {
                    Ok(local) => {
                        status.windows_ok += 1;
                        let global = windows[w_idx].remap(local);
                        debug!(
                            "[SCANNER] window={} detector={} flags={}",
                            w_idx,
                            status.detector,
                            global.len()
                        );
                        per_detector[d_idx].push((w_idx, global));
                    }
                    Err(e) => {
                        warn!(
                            "[SCANNER] window={} [{}, {}) detector={} failed: {}",
                            w_idx, windows[w_idx].start, windows[w_idx].end, status.detector, e
                        );
                        status.windows_failed += 1;
                        status.last_error = Some(e);
                    }
                }
            }
            Err(e) => warn!("[SCANNER] detector task failed: {}", e),
        }
    }

    for (_, d_idx) in pending {
        let status = &mut sources[d_idx];
        status.windows_failed += 1;
        status.last_error = Some("detector task aborted".to_string());
    }

    let flags = per_detector
        .into_iter()
        .map(|mut by_window| {
            by_window.sort_by_key(|(w_idx, _)| *w_idx);
            by_window.into_iter().flat_map(|(_, f)| f).collect()
        })
        .collect();

    info!(
        "[SCANNER] done windows={} elapsed_ms={}",
        windows.len(),
        started.elapsed().as_millis()
    );

    WindowedScan { windows, flags, sources }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FlagSource;
    use crate::services::detection::detector::DetectError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Cites every sentence of its window by local index and records what it saw.
    struct EchoDetector {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Detector for EchoDetector {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn source(&self) -> FlagSource {
            FlagSource::Unknown
        }

        async fn detect(&self, sentences: &[String]) -> Result<Vec<Flag>, DetectError> {
            self.seen.lock().unwrap().extend(sentences.iter().cloned());
            let local: Vec<i64> = (0..sentences.len() as i64).collect();
            Ok(vec![Flag::new("Echo", local, "")])
        }
    }

    struct FailingDetector;

    #[async_trait]
    impl Detector for FailingDetector {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn source(&self) -> FlagSource {
            FlagSource::Llm
        }

        async fn detect(&self, _sentences: &[String]) -> Result<Vec<Flag>, DetectError> {
            Err(DetectError::Other("backend down".to_string()))
        }
    }

    /// Holds each call open briefly and records the most calls in flight at once.
    #[derive(Default)]
    struct PeakDetector {
        active: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Detector for PeakDetector {
        fn name(&self) -> &'static str {
            "peak"
        }

        fn source(&self) -> FlagSource {
            FlagSource::Llm
        }

        async fn detect(&self, _sentences: &[String]) -> Result<Vec<Flag>, DetectError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![])
        }
    }

    fn doc(n: usize) -> Arc<Vec<String>> {
        Arc::new((0..n).map(|i| format!("s{}", i)).collect())
    }

    fn starts(windows: &[Window]) -> Vec<usize> {
        windows.iter().map(|w| w.start).collect()
    }

    #[test]
    fn test_plan_windows_transition_rule() {
        assert_eq!(starts(&plan_windows(10, 6, 2)), vec![0, 4]);
        assert_eq!(plan_windows(10, 6, 2)[1], Window::new(4, 10));
        assert_eq!(starts(&plan_windows(12, 6, 2)), vec![0, 4, 8]);
        assert_eq!(starts(&plan_windows(5, 40, 5)), vec![0]);
        assert!(plan_windows(0, 6, 2).is_empty());
    }

    #[test]
    fn test_plan_windows_no_gaps() {
        for n in 1..30 {
            for w in 1..8 {
                for o in 0..w {
                    let windows = plan_windows(n, w, o);
                    assert_eq!(windows[0].start, 0);
                    assert_eq!(windows.last().unwrap().end, n);
                    for pair in windows.windows(2) {
                        assert!(pair[1].start <= pair[0].end);
                        assert!(pair[1].start > pair[0].start);
                    }
                }
            }
        }
    }

    #[test]
    fn test_plan_windows_terminates_on_misconfiguration() {
        for n in 1..25 {
            for (w, o) in [(3, 3), (3, 10), (0, 0), (1, 5)] {
                let windows = plan_windows(n, w, o);
                assert!(windows.len() <= n);
                assert_eq!(windows.last().unwrap().end, n);
            }
        }
    }

    #[tokio::test]
    async fn test_overlap_sentences_scanned_twice() {
        let detector = Arc::new(EchoDetector { seen: Mutex::new(vec![]) });
        let detectors: Vec<Arc<dyn Detector>> = vec![detector.clone()];
        let settings = WindowSettings {
            window_size: 6,
            overlap: 2,
            max_concurrency: 2,
        };
        let scan = scan_windows(doc(12), &detectors, &settings).await;
        assert_eq!(starts(&scan.windows), vec![0, 4, 8]);

        let seen = detector.seen.lock().unwrap().clone();
        for s in ["s4", "s5", "s8", "s9"] {
            assert_eq!(seen.iter().filter(|x| x.as_str() == s).count(), 2, "{}", s);
        }
        assert_eq!(seen.iter().filter(|x| x.as_str() == "s0").count(), 1);

        // Remapped once: window 2 cites 8..12, never 16..20.
        let flags = &scan.flags[0];
        assert_eq!(flags.len(), 3);
        assert_eq!(flags[2].sentence_indexes, vec![8, 9, 10, 11]);
        assert!(flags.iter().flat_map(|f| &f.sentence_indexes).all(|&i| (0..12).contains(&i)));
    }

    #[tokio::test]
    async fn test_failing_detector_degrades_scan() {
        let detectors: Vec<Arc<dyn Detector>> = vec![
            Arc::new(EchoDetector { seen: Mutex::new(vec![]) }),
            Arc::new(FailingDetector),
        ];
        let settings = WindowSettings {
            window_size: 6,
            overlap: 2,
            max_concurrency: 4,
        };
        let scan = scan_windows(doc(10), &detectors, &settings).await;
        assert!(scan.degraded());
        assert_eq!(scan.flags[0].len(), 2);
        assert!(scan.flags[1].is_empty());
        assert_eq!(scan.sources[0].windows_ok, 2);
        assert_eq!(scan.sources[1].windows_failed, 2);
        assert_eq!(scan.sources[1].last_error.as_deref(), Some("backend down"));
        assert_eq!(scan.all_flags().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_calls_capped_by_max_concurrency() {
        for limit in [1, 2, 3] {
            let detector = Arc::new(PeakDetector::default());
            let detectors: Vec<Arc<dyn Detector>> = vec![detector.clone(), detector.clone()];
            let settings = WindowSettings {
                window_size: 3,
                overlap: 0,
                max_concurrency: limit,
            };
            let scan = scan_windows(doc(30), &detectors, &settings).await;
            assert_eq!(scan.windows.len(), 10);
            assert_eq!(detector.calls.load(Ordering::SeqCst), 20);
            assert_eq!(detector.peak.load(Ordering::SeqCst), limit, "limit {}", limit);
        }
    }

    #[tokio::test]
    async fn test_empty_document() {
        let detectors: Vec<Arc<dyn Detector>> = vec![Arc::new(FailingDetector)];
        let scan = scan_windows(doc(0), &detectors, &WindowSettings::default()).await;
        assert!(scan.windows.is_empty());
        assert!(!scan.degraded());
        assert_eq!(scan.flags.len(), 1);
    }
}
