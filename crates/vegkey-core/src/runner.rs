//! Run orchestration: register → seal → stream windows → complete.
//!
//! Per window the order is fixed: read the mask slice, evaluate the catalog,
//! gate, write. Windows are independent, so they may run on a rayon pool
//! when the `threading` feature is enabled.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::catalog::{lint, Catalog, Finding};
use crate::engine::{ClassificationBuffer, OutputSpec, RuleEngine};
use crate::error::{KeyError, Result};
use crate::grid::Window;
use crate::mask::{DomainMask, MaskGate};
use crate::raster::LayerSource;
use crate::registry::{LayerHandle, LayerRegistry, SealedRegistry};
use crate::sink::{OutputSink, ProgressReporter};
use crate::tiling::{BlockShape, CompletionTracker, Partition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Unstarted,
    Registering,
    Sealed,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunState::Unstarted => "unstarted",
            RunState::Registering => "registering",
            RunState::Sealed => "sealed",
            RunState::Streaming => "streaming",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        })
    }
}

fn transition(state: &mut RunState, to: RunState) {
    if *state != to {
        info!(from = %state, to = %to, "run state");
        *state = to;
    }
}

/// Knobs for one run. None of them change the output.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub block: BlockShape,
    /// Process windows on a rayon pool. Ignored without the `threading` feature.
    pub parallel: bool,
    /// Worker count for the parallel path; `None` uses rayon's default.
    pub threads: Option<usize>,
    /// Upper bound on progress updates per run.
    pub progress_updates: usize,
    /// Checked between windows; setting it cancels the run.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            block: BlockShape::default(),
            parallel: cfg!(feature = "threading"),
            threads: None,
            progress_updates: ProgressReporter::DEFAULT_UPDATES,
            cancel: None,
        }
    }
}

impl RunOptions {
    pub fn with_block(mut self, block: BlockShape) -> Self {
        self.block = block;
        self
    }

    pub fn sequential(mut self) -> Self {
        self.parallel = false;
        self
    }

    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|f| f.load(Ordering::Acquire))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub windows: usize,
    pub elapsed: Duration,
    /// Pixel count per written code, nodata included.
    pub histogram: BTreeMap<i32, u64>,
}

impl RunSummary {
    pub fn pixels(&self) -> u64 {
        self.histogram.values().sum()
    }
}

type Histogram = BTreeMap<i32, u64>;

fn count(buffer: &ClassificationBuffer) -> Histogram {
    let mut h = Histogram::new();
    for &c in buffer.codes() {
        *h.entry(c).or_default() += 1;
    }
    h
}

fn merge(mut a: Histogram, b: Histogram) -> Histogram {
    for (code, n) in b {
        *a.entry(code).or_default() += n;
    }
    a
}

// ── Builder (Unstarted → Registering → Sealed) ──────────────────────────────

#[derive(Debug)]
pub struct PipelineBuilder {
    registry: LayerRegistry,
    state: RunState,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self { registry: LayerRegistry::new(), state: RunState::Unstarted }
    }
}

impl PipelineBuilder {
    pub fn register(&mut self, name: impl Into<String>, source: impl LayerSource + 'static) -> Result<LayerHandle> {
        self.register_shared(name, Arc::new(source))
    }

    pub fn register_shared(&mut self, name: impl Into<String>, source: Arc<dyn LayerSource>) -> Result<LayerHandle> {
        transition(&mut self.state, RunState::Registering);
        self.registry.register_shared(name, source)
    }

    /// Seal the registry and validate everything the run will need. Nothing
    /// is read from any layer here.
    pub fn build(self, catalog: &Catalog, mask: &DomainMask, output: OutputSpec) -> Result<Pipeline> {
        let mut state = self.state;
        let validated = self.registry.seal().and_then(|registry| {
            let engine = RuleEngine::compile(catalog, &registry, output)?;
            let gate = mask.bind(&registry, &output)?;
            Ok((registry, engine, gate))
        });
        let (registry, engine, gate) = match validated {
            Ok(parts) => parts,
            Err(e) => {
                transition(&mut state, RunState::Failed);
                return Err(e);
            }
        };

        let findings = lint(catalog);
        for f in &findings {
            warn!(rule = %f.rule, phase = %f.phase, kind = %f.kind, "{}", f.message);
        }
        transition(&mut state, RunState::Sealed);
        info!(
            catalog = %engine.catalog().name,
            layers = registry.len(),
            rules = engine.catalog().rules.len(),
            "pipeline validated"
        );
        Ok(Pipeline { registry, engine, gate, findings, state })
    }
}

// ── Pipeline (Sealed → Streaming → Completed) ───────────────────────────────

#[derive(Debug)]
pub struct Pipeline {
    registry: SealedRegistry,
    engine: RuleEngine,
    gate: MaskGate,
    findings: Vec<Finding>,
    state: RunState,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    pub fn registry(&self) -> &SealedRegistry {
        &self.registry
    }

    pub fn engine(&self) -> &RuleEngine {
        &self.engine
    }

    /// Lint findings for the catalog this pipeline was built with.
    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Read → Evaluate → Gate for one window.
    pub fn process_window(&self, window: &Window) -> Result<ClassificationBuffer> {
        let in_scope = self.gate.read(&self.registry, window)?;
        let buffer = self.engine.evaluate(window, &self.registry, &in_scope)?;
        Ok(self.gate.apply(buffer, &in_scope))
    }

    /// Stream every window into `sink`, then finish the sink.
    ///
    /// The first failing window aborts the run; `finish` is only called when
    /// every window was written, so a staging sink never promotes partial
    /// output.
    pub fn run(&mut self, sink: &dyn OutputSink, options: &RunOptions) -> Result<RunSummary> {
        let started = Instant::now();
        let partition = Partition::new(self.registry.reference(), options.block)?;
        transition(&mut self.state, RunState::Streaming);
        info!(
            windows = partition.len(),
            block_rows = options.block.rows,
            block_cols = options.block.cols,
            "streaming"
        );

        let tracker = CompletionTracker::new(partition.len());
        let result = self.stream(&partition, &tracker, sink, options).and_then(|histogram| {
            sink.finish()?;
            Ok(histogram)
        });

        match result {
            Ok(histogram) => {
                transition(&mut self.state, RunState::Completed);
                let summary = RunSummary { windows: tracker.completed(), elapsed: started.elapsed(), histogram };
                info!(
                    windows = summary.windows,
                    elapsed_ms = summary.elapsed.as_millis() as u64,
                    "run completed"
                );
                Ok(summary)
            }
            Err(KeyError::Cancelled { .. }) => {
                transition(&mut self.state, RunState::Cancelled);
                let (completed, total) = (tracker.completed(), tracker.total());
                warn!(completed, total, "run cancelled; output is incomplete");
                Err(KeyError::Cancelled { completed, total })
            }
            Err(e) => {
                transition(&mut self.state, RunState::Failed);
                tracing::error!(error = %e, "run failed");
                Err(e)
            }
        }
    }

    fn step(
        &self,
        index: usize,
        window: Window,
        tracker: &CompletionTracker,
        progress: &ProgressReporter,
        sink: &dyn OutputSink,
        options: &RunOptions,
    ) -> Result<Histogram> {
        if options.cancelled() {
            return Err(KeyError::Cancelled { completed: tracker.completed(), total: tracker.total() });
        }
        let wrap = |source: KeyError| KeyError::WindowFailed { index, window, source: Box::new(source) };
        let buffer = self.process_window(&window).map_err(wrap)?;
        sink.write(&window, &buffer).map_err(wrap)?;

        let done = tracker.complete(index);
        progress.report(done);
        debug!(index, %window, "window written");
        Ok(count(&buffer))
    }

    fn stream(
        &self,
        partition: &Partition,
        tracker: &CompletionTracker,
        sink: &dyn OutputSink,
        options: &RunOptions,
    ) -> Result<Histogram> {
        let progress = ProgressReporter::new(partition.len(), options.progress_updates);

        #[cfg(feature = "threading")]
        if options.parallel {
            use rayon::prelude::*;

            let windows: Vec<Window> = partition.iter().collect();
            let work = || {
                windows
                    .par_iter()
                    .enumerate()
                    .map(|(i, w)| self.step(i, *w, tracker, &progress, sink, options))
                    .try_reduce(Histogram::new, |a, b| Ok(merge(a, b)))
            };
            return match options.threads {
                Some(n) => rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .build()
                    .map_err(|e| KeyError::Manifest(format!("cannot start {n} worker threads: {e}")))?
                    .install(work),
                None => work(),
            };
        }

        let mut histogram = Histogram::new();
        for (i, w) in partition.iter().enumerate() {
            histogram = merge(histogram, self.step(i, w, tracker, &progress, sink, options)?);
        }
        Ok(histogram)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::RuleSpec;
    use crate::grid::GridGeometry;
    use crate::raster::{ElementType, MemoryRaster, RasterMeta};
    use crate::sink::{staging_path, MemorySink, RawRasterSink};
    use proptest::prelude::*;

    const NODATA: i64 = -32768;

    /// Small deterministic generator so fixtures need no extra dependency.
    fn values(seed: u64, n: usize, modulo: u64) -> Vec<i64> {
        let mut s = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (0..n)
            .map(|_| {
                s = s.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                ((s >> 33) % modulo) as i64
            })
            .collect()
    }

    fn catalog() -> Catalog {
        Catalog::new("fixture", 253)
            .with_fill("lichen", 0.0)
            .with_derived("picsum", "picgla + picmar")
            .with_derived("picratio", "picgla / picsum * 100")
            .with_phase(
                "major breaks",
                vec![
                    RuleSpec::new("1", "picsum >= 10", 1),
                    RuleSpec::new("2", "picsum < 10 && lichen >= 40", 2),
                ],
            )
            .with_phase(
                "refinement",
                vec![
                    RuleSpec::new("3", "current == 1 && picratio >= 70", 11),
                    RuleSpec::new("4", "current == 1 && picratio < 70", 12),
                    RuleSpec::new("5", "current in [11, 12] && lichen > 80", 13),
                    RuleSpec::new("6", "current == 99", 98).disabled("never produced"),
                ],
            )
    }

    fn builder(width: usize, height: usize, seed: u64) -> PipelineBuilder {
        let geo = GridGeometry::unit(width, height);
        let n = width * height;
        let layer = |vals: Vec<i64>| MemoryRaster::from_ints(geo.clone(), ElementType::U8, Some(255.0), &vals);

        let mut b = Pipeline::builder();
        b.register("area", layer(values(seed, n, 3))).unwrap();
        b.register("picgla", layer(values(seed + 1, n, 30))).unwrap();
        b.register("picmar", layer(values(seed + 2, n, 30))).unwrap();
        let mut lichen = values(seed + 3, n, 101);
        for v in lichen.iter_mut().step_by(7) {
            *v = 255;
        }
        b.register("lichen", layer(lichen)).unwrap();
        b
    }

    fn pipeline(width: usize, height: usize, seed: u64) -> Pipeline {
        builder(width, height, seed)
            .build(&catalog(), &DomainMask::equals("area", 1.0), OutputSpec::new(ElementType::I16, NODATA).unwrap())
            .unwrap()
    }

    fn run_memory(p: &mut Pipeline, options: &RunOptions) -> Vec<i32> {
        let sink = MemorySink::new(p.registry().reference(), i32::MIN);
        p.run(&sink, options).unwrap();
        sink.into_codes()
    }

    fn whole_grid(p: &Pipeline) -> Vec<i32> {
        p.process_window(&p.registry().reference().full_window()).unwrap().into_codes()
    }

    #[test]
    fn output_is_independent_of_block_shape() {
        let mut p = pipeline(23, 17, 7);
        let reference = whole_grid(&p);
        for block in [BlockShape::square(1), BlockShape::new(3, 5), BlockShape::new(16, 4), BlockShape::new(17, 23)] {
            let seq = run_memory(&mut p, &RunOptions::default().with_block(block).sequential());
            assert_eq!(seq, reference, "sequential run with {block:?} differs from whole-grid pass");
            let par = run_memory(&mut p, &RunOptions::default().with_block(block));
            assert_eq!(par, reference, "parallel run with {block:?} differs from whole-grid pass");
        }
    }

    #[test]
    fn fixture_exercises_every_outcome() {
        let p = pipeline(48, 48, 3);
        let codes = whole_grid(&p);
        for code in [NODATA as i32, 253, 2, 11, 12, 13] {
            assert!(codes.contains(&code), "fixture never produced {code}");
        }
        assert!(!codes.contains(&98), "disabled rule must not fire");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn any_tiling_matches_single_pass(
            width in 1usize..20,
            height in 1usize..20,
            rows in 1usize..24,
            cols in 1usize..24,
            seed in 0u64..1000,
        ) {
            let mut p = pipeline(width, height, seed);
            let reference = whole_grid(&p);
            let tiled = run_memory(&mut p, &RunOptions::default().with_block(BlockShape::new(rows, cols)).sequential());
            prop_assert_eq!(tiled, reference);
        }
    }

    #[test]
    fn repeated_runs_are_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = pipeline(31, 29, 11);
        let mut outputs = Vec::new();
        for (name, options) in [
            ("a.bin", RunOptions::default().with_block(BlockShape::square(8))),
            ("b.bin", RunOptions::default().with_block(BlockShape::square(8))),
        ] {
            let path = dir.path().join(name);
            let sink = RawRasterSink::create(&path, p.registry().reference(), p.engine().output()).unwrap();
            p.run(&sink, &options).unwrap();
            outputs.push(std::fs::read(&path).unwrap());
        }
        assert_eq!(outputs[0], outputs[1]);
    }

    #[test]
    fn summary_counts_windows_and_codes() {
        let mut p = pipeline(10, 10, 5);
        let sink = MemorySink::new(p.registry().reference(), 0);
        let summary = p.run(&sink, &RunOptions::default().with_block(BlockShape::square(4)).sequential()).unwrap();

        assert_eq!(summary.windows, 9);
        assert_eq!(summary.pixels(), 100);
        let codes = sink.into_codes();
        for (code, n) in &summary.histogram {
            assert_eq!(codes.iter().filter(|c| *c == code).count() as u64, *n, "histogram for {code}");
        }
        assert_eq!(p.state(), RunState::Completed);
    }

    #[test]
    fn cancelled_run_never_produces_final_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let mut p = pipeline(8, 8, 1);
        let flag = Arc::new(AtomicBool::new(true));
        let sink = RawRasterSink::create(&path, p.registry().reference(), p.engine().output()).unwrap();

        let err = p
            .run(&sink, &RunOptions::default().with_block(BlockShape::square(2)).with_cancel(flag))
            .unwrap_err();
        assert!(matches!(err, KeyError::Cancelled { completed: 0, total: 16 }));
        assert_eq!(p.state(), RunState::Cancelled);
        assert!(!path.exists());
        assert!(staging_path(&path).exists(), "staging file is left for inspection");
    }

    /// Sink that trips the cancel flag after its first write.
    struct CancelAfterFirst {
        inner: MemorySink,
        flag: Arc<AtomicBool>,
    }

    impl OutputSink for CancelAfterFirst {
        fn write(&self, window: &Window, buffer: &ClassificationBuffer) -> Result<()> {
            self.inner.write(window, buffer)?;
            self.flag.store(true, Ordering::Release);
            Ok(())
        }

        fn finish(&self) -> Result<()> {
            panic!("finish must not run on a cancelled run");
        }
    }

    #[test]
    fn cancellation_is_checked_between_windows() {
        let mut p = pipeline(6, 6, 2);
        let flag = Arc::new(AtomicBool::new(false));
        let sink = CancelAfterFirst { inner: MemorySink::new(p.registry().reference(), 0), flag: flag.clone() };
        let options = RunOptions::default().with_block(BlockShape::square(3)).sequential().with_cancel(flag);
        let err = p.run(&sink, &options).unwrap_err();
        assert!(matches!(err, KeyError::Cancelled { completed: 1, total: 4 }));
    }

    /// Layer that fails to read one region.
    struct Broken {
        meta: RasterMeta,
        bad: Window,
    }

    impl LayerSource for Broken {
        fn meta(&self) -> &RasterMeta {
            &self.meta
        }

        fn read_window(&self, window: &Window) -> Result<Vec<f64>> {
            if window.overlaps(&self.bad) {
                Err(KeyError::io("disk on fire", std::io::Error::other("boom")))
            } else {
                Ok(vec![0.0; window.len()])
            }
        }
    }

    #[test]
    fn window_failure_names_the_window_and_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let mut b = builder(4, 4, 9);
        b.register(
            "zones",
            Broken {
                meta: RasterMeta::new(GridGeometry::unit(4, 4), ElementType::U8, None),
                bad: Window::new(2, 2, 1, 1),
            },
        )
        .unwrap();
        let catalog = catalog().with_phase("zones", vec![RuleSpec::new("z", "zones == 3", 40)]);
        let output = OutputSpec::new(ElementType::I16, NODATA).unwrap();
        let mut p = b.build(&catalog, &DomainMask::equals("area", 1.0), output).unwrap();
        let sink = RawRasterSink::create(&path, p.registry().reference(), &output).unwrap();

        let err = p.run(&sink, &RunOptions::default().with_block(BlockShape::square(2)).sequential()).unwrap_err();
        assert!(
            matches!(err, KeyError::WindowFailed { index: 3, .. }),
            "expected failure in window 3, got {err}"
        );
        assert_eq!(p.state(), RunState::Failed);
        assert!(!path.exists());
    }

    #[test]
    fn validation_fails_before_streaming() {
        let b = builder(4, 4, 0);
        let catalog = Catalog::new("t", 253).with_phase("p", vec![RuleSpec::new("r", "zones == 1", 5)]);
        let output = OutputSpec::new(ElementType::I16, NODATA).unwrap();
        let err = b.build(&catalog, &DomainMask::equals("area", 1.0), output).unwrap_err();
        assert!(matches!(err, KeyError::UnknownLayer { .. }));
    }
}
