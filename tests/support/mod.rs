//! Scripted sources, factories, and a recording observer for driving a view
//! end-to-end without any real transport.
//!
//! Not every helper is used by every test crate.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use seqview::context::merge::MergeDiff;
use seqview::context::{Alignment, Block, Feature, FeatureContext, FeatureSet, Span, Strand};
use seqview::worker::{spawn_service_worker, ServiceError, SourceService, WorkerFactory};
use seqview::{
    Region, ReplyPayload, Request, RequestPayload, ServerInfo, SourceDescriptor, StageKind, Style,
    StyleSet, View, ViewObserver, ViewState, WorkerChannel,
};

/// Script for one simulated source: what it serves and where it fails.
#[derive(Clone)]
pub struct SimSource {
    /// Feature ids are prefixed with this so sources never collide.
    pub prefix: String,
    pub feature_sets: Vec<String>,
    pub required_styles: Vec<String>,
    pub dna: Option<Bytes>,
    /// Reply `RequestError` when asked to execute this stage.
    pub fail_at: Option<StageKind>,
    /// Die (fatal) when asked to execute this stage.
    pub die_at: Option<StageKind>,
    /// Region remembered from the open / new-context requests.
    region: Option<Region>,
    /// Every stage this worker was asked to execute, in order.
    pub log: Arc<Mutex<Vec<StageKind>>>,
}

impl SimSource {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            feature_sets: vec!["genes".to_string()],
            required_styles: vec![format!("{prefix}-style")],
            dna: None,
            fail_at: None,
            die_at: None,
            region: None,
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_dna(mut self, dna: &'static [u8]) -> Self {
        self.dna = Some(Bytes::from_static(dna));
        self
    }

    pub fn failing_at(mut self, stage: StageKind) -> Self {
        self.fail_at = Some(stage);
        self
    }

    pub fn dying_at(mut self, stage: StageKind) -> Self {
        self.die_at = Some(stage);
        self
    }

    pub fn executed(&self) -> Vec<StageKind> {
        self.log.lock().unwrap().clone()
    }

    fn fragment(&self, region: &Region, sets: &[String]) -> FeatureContext {
        let mut ctx = FeatureContext::new(region.clone());
        let mut align = Alignment::new("master");
        let mut block = Block::new("b1", Span::new(region.start, region.end.max(region.start)));
        for set_name in sets {
            let mut set = FeatureSet::new(set_name.clone());
            set.style = self.required_styles.first().cloned();
            for i in 0..2u64 {
                let start = region.start + i * 10;
                set.insert(Feature {
                    id: format!("{}-{set_name}-f{i}", self.prefix),
                    name: format!("{}-{set_name}-f{i}", self.prefix),
                    span: Span::new(start, start + 5),
                    strand: Strand::Forward,
                    style: None,
                    score: Some(0.5),
                });
            }
            block.insert(set);
        }
        align.insert(block);
        ctx.insert(align);
        ctx
    }
}

impl SourceService for SimSource {
    fn execute(&mut self, request: Request) -> Result<ReplyPayload, ServiceError> {
        self.log.lock().unwrap().push(request.stage);
        if self.die_at == Some(request.stage) {
            return Err(ServiceError::fatal("simulated source death"));
        }
        if self.fail_at == Some(request.stage) {
            return Err(ServiceError::request("simulated request failure"));
        }
        match request.payload {
            RequestPayload::Create { .. } => Ok(ReplyPayload::Created {
                session: format!("{}-session", self.prefix),
            }),
            RequestPayload::Open { region } => {
                self.region = Some(region);
                Ok(ReplyPayload::Opened)
            }
            RequestPayload::GetServerInfo => Ok(ReplyPayload::ServerInfo(ServerInfo {
                program: "simsource".to_string(),
                version: "0.1".to_string(),
                database: Some(self.prefix.clone()),
            })),
            RequestPayload::GetFeatureSets { filter } => {
                let names = if filter.is_empty() {
                    self.feature_sets.clone()
                } else {
                    filter
                };
                Ok(ReplyPayload::FeatureSets {
                    names,
                    required_styles: self.required_styles.clone(),
                })
            }
            RequestPayload::GetStyles { names } => {
                let mut styles = StyleSet::new();
                for name in names {
                    let mut style = Style::named(name);
                    style.fill_colour = Some(format!("{}-fill", self.prefix));
                    styles.insert(style);
                }
                Ok(ReplyPayload::Styles(styles))
            }
            RequestPayload::NewContext { region } => {
                self.region = Some(region);
                Ok(ReplyPayload::ContextReady)
            }
            RequestPayload::GetFeatures { feature_sets } => {
                let region = self
                    .region
                    .clone()
                    .unwrap_or_else(|| Region::new("chr11", 1, 1000).unwrap());
                Ok(ReplyPayload::Features(self.fragment(&region, &feature_sets)))
            }
            RequestPayload::GetSequence => match &self.dna {
                Some(dna) => Ok(ReplyPayload::Sequence { dna: dna.clone() }),
                None => Err(ServiceError::request("source has no sequence")),
            },
        }
    }
}

/// Factory that spawns a scripted worker per known URL; unknown URLs fail
/// the way a dead host would.
pub struct SimFactory {
    sources: HashMap<String, SimSource>,
}

impl SimFactory {
    pub fn new() -> Self {
        Self {
            sources: HashMap::new(),
        }
    }

    pub fn register(&mut self, url: &str, source: SimSource) -> SimSource {
        self.sources.insert(url.to_string(), source.clone());
        source
    }
}

impl WorkerFactory for SimFactory {
    fn spawn(
        &mut self,
        descriptor: &SourceDescriptor,
        _region: &Region,
    ) -> Result<WorkerChannel, String> {
        match self.sources.get(&descriptor.url) {
            Some(source) => Ok(spawn_service_worker(source.clone())),
            None => Err("host unreachable".to_string()),
        }
    }
}

/// Observer that records everything it is told.
#[derive(Clone, Default)]
pub struct Recorder {
    inner: Arc<Mutex<RecorderInner>>,
}

#[derive(Default)]
pub struct RecorderInner {
    pub states: Vec<ViewState>,
    pub diffs: usize,
    pub full_redraws: usize,
    pub diff_features: usize,
    pub load_failures: Vec<String>,
    pub destroyed: bool,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn states(&self) -> Vec<ViewState> {
        self.inner.lock().unwrap().states.clone()
    }

    pub fn diffs(&self) -> usize {
        self.inner.lock().unwrap().diffs
    }

    pub fn full_redraws(&self) -> usize {
        self.inner.lock().unwrap().full_redraws
    }

    pub fn diff_features(&self) -> usize {
        self.inner.lock().unwrap().diff_features
    }

    pub fn load_failures(&self) -> Vec<String> {
        self.inner.lock().unwrap().load_failures.clone()
    }

    pub fn destroyed(&self) -> bool {
        self.inner.lock().unwrap().destroyed
    }
}

impl ViewObserver for Recorder {
    fn on_diff_ready(&mut self, diff: &MergeDiff, _styles: &StyleSet) {
        let mut inner = self.inner.lock().unwrap();
        inner.diffs += 1;
        inner.diff_features += diff.feature_count();
        if diff.is_full_redraw() {
            inner.full_redraws += 1;
        }
    }

    fn on_state_changed(&mut self, state: ViewState) {
        self.inner.lock().unwrap().states.push(state);
    }

    fn on_load_failed(&mut self, reason: &str) {
        self.inner.lock().unwrap().load_failures.push(reason.to_string());
    }

    fn on_view_destroyed(&mut self) {
        self.inner.lock().unwrap().destroyed = true;
    }
}

/// Capture view tracing in test output; safe to call from every test.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("seqview=debug")),
        )
        .with_test_writer()
        .try_init();
}

pub fn region() -> Region {
    Region::new("chr11", 1, 1000).unwrap()
}

pub fn descriptor(url: &str) -> SourceDescriptor {
    SourceDescriptor::new(url)
}

/// Tick the view until it reports done or the deadline passes. Returns true
/// when the view stopped on its own.
pub fn poll_to_completion(view: &mut View, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !view.poll() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}

/// Tick the view until `pred` holds or the deadline passes.
pub fn poll_until(
    view: &mut View,
    timeout: Duration,
    mut pred: impl FnMut(&View) -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if pred(view) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        view.poll();
        std::thread::sleep(Duration::from_millis(1));
    }
}
