//! Content detectors consulted when a file name is inconclusive.
//!
//! Detectors form an ordered chain; the first one to return a classification
//! wins. A detector that errors or panics is logged and treated as having no
//! opinion, so one faulty detector cannot break classification.

use anyhow::Result;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::classification::Classification;
use crate::fs::FileRef;

/// What a detector gets to look at.
#[derive(Debug, Clone, Copy)]
pub struct DetectionInput<'a> {
    pub file: &'a FileRef,
    /// The content prefix, possibly shorter than the file.
    pub bytes: &'a [u8],
    /// The prefix decoded as text, `None` when it looks binary.
    pub text: Option<&'a str>,
}

pub trait ContentDetector: Send + Sync {
    /// Return `Ok(None)` to defer to the next detector.
    fn detect(&self, input: &DetectionInput<'_>) -> Result<Option<Classification>>;

    /// How many leading bytes this detector wants to see.
    fn desired_prefix_len(&self) -> Option<usize> {
        None
    }

    /// Whether this detector should also run for zero-length files.
    fn accepts_empty_files(&self) -> bool {
        false
    }

    fn name(&self) -> &str {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full)
    }
}

struct FnDetector<F> {
    name: String,
    accepts_empty: bool,
    detect: F,
}

impl<F> ContentDetector for FnDetector<F>
where
    F: Fn(&DetectionInput<'_>) -> Option<Classification> + Send + Sync,
{
    fn detect(&self, input: &DetectionInput<'_>) -> Result<Option<Classification>> {
        Ok((self.detect)(input))
    }

    fn accepts_empty_files(&self) -> bool {
        self.accepts_empty
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Wraps a closure as a detector.
pub fn detector_fn<F>(name: impl Into<String>, detect: F) -> impl ContentDetector
where
    F: Fn(&DetectionInput<'_>) -> Option<Classification> + Send + Sync,
{
    FnDetector {
        name: name.into(),
        accepts_empty: false,
        detect,
    }
}

/// Like [`detector_fn`], but also consulted for empty files.
pub fn empty_file_detector_fn<F>(name: impl Into<String>, detect: F) -> impl ContentDetector
where
    F: Fn(&DetectionInput<'_>) -> Option<Classification> + Send + Sync,
{
    FnDetector {
        name: name.into(),
        accepts_empty: true,
        detect,
    }
}

#[derive(Clone, Default)]
pub struct DetectorChain {
    detectors: Vec<Arc<dyn ContentDetector>>,
}

impl fmt::Debug for DetectorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.detectors.iter().map(|d| d.name().to_string()))
            .finish()
    }
}

impl DetectorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prepend(mut self, detector: impl ContentDetector + 'static) -> Self {
        self.detectors.insert(0, Arc::new(detector));
        self
    }

    pub fn push(mut self, detector: impl ContentDetector + 'static) -> Self {
        self.detectors.push(Arc::new(detector));
        self
    }

    pub fn push_shared(mut self, detector: Arc<dyn ContentDetector>) -> Self {
        self.detectors.push(detector);
        self
    }

    /// First non-`None` answer, in registration order.
    pub fn run(&self, input: &DetectionInput<'_>) -> Option<Classification> {
        self.run_filtered(input, |_| true)
    }

    /// Runs only the detectors that accept zero-length files.
    pub fn run_empty(&self, input: &DetectionInput<'_>) -> Option<Classification> {
        self.run_filtered(input, |d| d.accepts_empty_files())
    }

    pub fn max_prefix_len(&self) -> Option<usize> {
        self.detectors.iter().filter_map(|d| d.desired_prefix_len()).max()
    }

    pub fn any_accepts_empty(&self) -> bool {
        self.detectors.iter().any(|d| d.accepts_empty_files())
    }

    pub fn len(&self) -> usize {
        self.detectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }

    fn run_filtered(
        &self,
        input: &DetectionInput<'_>,
        include: impl Fn(&dyn ContentDetector) -> bool,
    ) -> Option<Classification> {
        for detector in &self.detectors {
            if !include(detector.as_ref()) {
                continue;
            }
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| detector.detect(input)));
            match outcome {
                Ok(Ok(Some(c))) => {
                    tracing::trace!(detector = detector.name(), classification = %c, "Detector matched");
                    return Some(c);
                }
                Ok(Ok(None)) => {}
                Ok(Err(err)) => {
                    tracing::warn!(
                        detector = detector.name(),
                        file = %input.file.path().display(),
                        error = %err,
                        "Content detector failed"
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        detector = detector.name(),
                        file = %input.file.path().display(),
                        "Content detector panicked"
                    );
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FileId;

    struct Failing;

    impl ContentDetector for Failing {
        fn detect(&self, _: &DetectionInput<'_>) -> Result<Option<Classification>> {
            anyhow::bail!("boom")
        }
    }

    struct Panicking;

    impl ContentDetector for Panicking {
        fn detect(&self, _: &DetectionInput<'_>) -> Result<Option<Classification>> {
            panic!("detector bug")
        }

        fn desired_prefix_len(&self) -> Option<usize> {
            Some(4096)
        }
    }

    fn input<'a>(file: &'a FileRef, bytes: &'a [u8]) -> DetectionInput<'a> {
        DetectionInput {
            file,
            bytes,
            text: std::str::from_utf8(bytes).ok(),
        }
    }

    #[test]
    fn faulty_detectors_are_skipped() {
        let chain = DetectorChain::new()
            .push(Failing)
            .push(Panicking)
            .push(detector_fn("hello", |i| {
                i.text
                    .filter(|t| t.starts_with("hello"))
                    .map(|_| Classification::builder("Hello").build())
            }));
        let file = FileRef::new(FileId(1), "/a");
        assert_eq!(chain.run(&input(&file, b"hello world")).unwrap().name(), "Hello");
        assert!(chain.run(&input(&file, b"bye")).is_none());
    }

    #[test]
    fn first_match_wins_and_prepend_takes_priority() {
        let first = |name: &'static str| detector_fn(name, move |_| Some(Classification::builder(name).build()));
        let chain = DetectorChain::new().push(first("A")).prepend(first("B"));
        let file = FileRef::new(FileId(1), "/a");
        assert_eq!(chain.run(&input(&file, b"x")).unwrap().name(), "B");
    }

    #[test]
    fn empty_file_detectors_are_filtered() {
        let chain = DetectorChain::new()
            .push(detector_fn("any", |_| Some(Classification::builder("Any").build())))
            .push(empty_file_detector_fn("empty", |_| Some(Classification::builder("Empty").build())));
        let file = FileRef::new(FileId(1), "/a");
        assert!(chain.any_accepts_empty());
        assert_eq!(chain.run_empty(&input(&file, b"")).unwrap().name(), "Empty");
    }

    #[test]
    fn name_and_prefix_wishes() {
        assert_eq!(Failing.name(), "Failing");
        let chain = DetectorChain::new().push(Failing).push(Panicking);
        assert_eq!(chain.max_prefix_len(), Some(4096));
        assert_eq!(format!("{chain:?}"), r#"["Failing", "Panicking"]"#);
    }
}
