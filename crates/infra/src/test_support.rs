//! Scripted collaborators for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bulklabel_ai::{
    Classification, ClassificationError, ClassificationService, ContentSource, Cursor,
    InMemoryContentSource, Page, SourceError,
};
use bulklabel_core::{ClassificationParams, SourceRef};

type CallHook = Box<dyn FnMut(usize) + Send>;

/// Deterministic classifier: "positive" for texts whose length is even,
/// "negative" otherwise. Failures and per-call hooks can be scripted.
#[derive(Default)]
pub struct ScriptedClassifier {
    calls: AtomicUsize,
    items: AtomicUsize,
    batch_sizes: Mutex<Vec<usize>>,
    queued_failures: Mutex<VecDeque<ClassificationError>>,
    permanent_failure: Mutex<Option<ClassificationError>>,
    hook: Mutex<Option<CallHook>>,
}

impl ScriptedClassifier {
    pub fn arc() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next `n` calls fail with `err`.
    pub fn fail_next(&self, n: usize, err: ClassificationError) {
        let mut q = self.queued_failures.lock().unwrap();
        for _ in 0..n {
            q.push_back(err.clone());
        }
    }

    pub fn fail_always(&self, err: ClassificationError) {
        *self.permanent_failure.lock().unwrap() = Some(err);
    }

    /// Run `hook(call_number)` (1-indexed) at the start of every call.
    pub fn on_call(&self, hook: impl FnMut(usize) + Send + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn items_classified(&self) -> usize {
        self.items.load(Ordering::SeqCst)
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().unwrap().clone()
    }

    pub fn label_for(text: &str) -> &'static str {
        if text.len() % 2 == 0 { "positive" } else { "negative" }
    }
}

impl ClassificationService for ScriptedClassifier {
    fn classify(
        &self,
        _params: &ClassificationParams,
        batch: &[String],
    ) -> Result<Vec<Classification>, ClassificationError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(hook) = self.hook.lock().unwrap().as_mut() {
            hook(call);
        }
        if let Some(err) = self.queued_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        if let Some(err) = self.permanent_failure.lock().unwrap().clone() {
            return Err(err);
        }
        self.batch_sizes.lock().unwrap().push(batch.len());
        self.items.fetch_add(batch.len(), Ordering::SeqCst);
        Ok(batch
            .iter()
            .map(|t| Classification::new(Self::label_for(t), 0.75))
            .collect())
    }
}

/// Wraps an in-memory source and injects scripted page-fetch failures.
pub struct FlakySource {
    inner: InMemoryContentSource,
    queued_failures: Mutex<VecDeque<SourceError>>,
    fetches: AtomicUsize,
}

impl FlakySource {
    pub fn new(inner: InMemoryContentSource) -> Self {
        Self {
            inner,
            queued_failures: Mutex::new(VecDeque::new()),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn generated(source_ref: &str, count: usize) -> Arc<Self> {
        Arc::new(Self::new(
            InMemoryContentSource::new().with_generated(source_ref, count),
        ))
    }

    pub fn fail_next(&self, n: usize, err: SourceError) {
        let mut q = self.queued_failures.lock().unwrap();
        for _ in 0..n {
            q.push_back(err.clone());
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl ContentSource for FlakySource {
    fn fetch_page(
        &self,
        source_ref: &SourceRef,
        cursor: Option<&Cursor>,
        page_size: usize,
    ) -> Result<Page, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.queued_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.inner.fetch_page(source_ref, cursor, page_size)
    }
}
