//! End-to-end batch tests against stub OCR, LLM and rasteriser services.
//!
//! Each stub is deterministic and offline:
//! - OCR returns whatever text follows the PNG signature in the image bytes
//!   (`"fail…"` → service error, `"blank"` → no text).
//! - The LLM parses `serial title author` lines of the OCR text into table
//!   JSON, or echoes it as a cleaned document.
//! - The rasteriser writes one page image per tag into a temporary directory.

use async_trait::async_trait;
use scan2table::pipeline::llm::{BackendError, GenerateRequest};
use scan2table::pipeline::render::RasterizedPdf;
use scan2table::{
    BatchOrchestrator, BatchProgressCallback, BatchRequest, ColumnSpec, ExecutionStrategy,
    GenerativeBackend, LlmFormatter, OcrEngine, OutputShape, PageFailurePolicy, PdfRasterizer,
    PipelineConfig, RetryPolicy, ScanError, UploadedFile,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

const PNG_SIGNATURE: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52,
];

const RAW_MARKER: &str = "Here is the raw OCR text:\n";

fn image_bytes(tag: &str) -> Vec<u8> {
    let mut bytes = PNG_SIGNATURE.to_vec();
    bytes.extend_from_slice(tag.as_bytes());
    bytes
}

fn tag_of(bytes: &[u8]) -> String {
    String::from_utf8_lossy(&bytes[PNG_SIGNATURE.len().min(bytes.len())..]).into_owned()
}

fn image(name: &str, tag: &str) -> UploadedFile {
    UploadedFile::from_bytes(name, Some("image/png"), image_bytes(tag)).unwrap()
}

/// A PDF upload whose pages carry the given OCR tags, separated by `|`.
fn pdf(name: &str, page_tags: &[&str]) -> UploadedFile {
    let body = format!("%PDF-1.4\n{}", page_tags.join("|"));
    UploadedFile::from_bytes(name, Some("application/pdf"), body.into_bytes()).unwrap()
}

// ── Stubs ────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct TagOcr {
    seen: Mutex<Vec<String>>,
}

impl TagOcr {
    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl OcrEngine for TagOcr {
    async fn extract_text(&self, image: &[u8]) -> Result<String, ScanError> {
        let tag = tag_of(image);
        self.seen.lock().unwrap().push(tag.clone());
        if tag.starts_with("fail") {
            return Err(ScanError::ExternalService {
                service: "vision",
                status: Some(500),
                body: format!("cannot read {tag}"),
            });
        }
        if tag == "blank" {
            return Ok(String::new());
        }
        Ok(tag)
    }
}

#[derive(Default)]
struct CatalogueLlm {
    calls: AtomicUsize,
    requests: Mutex<Vec<GenerateRequest>>,
}

impl CatalogueLlm {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerativeBackend for CatalogueLlm {
    async fn generate(&self, request: &GenerateRequest) -> Result<String, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        if request.image.is_some() {
            return Ok(match request.response_schema {
                Some(_) => r#"[{"sankhya":"१","granth_naam":"गीता","karta":"व्यास"}]"#.to_string(),
                None => "Text read from the image.".to_string(),
            });
        }

        let raw = request
            .prompt
            .split_once(RAW_MARKER)
            .map(|(_, raw)| raw)
            .unwrap_or_default();
        if raw.contains("llm-unavailable") {
            return Err(BackendError::Transient {
                status: 429,
                body: "quota".into(),
            });
        }

        match &request.response_schema {
            Some(schema) => {
                let keys: Vec<String> = schema["items"]["propertyOrdering"]
                    .as_array()
                    .map(|a| a.iter().filter_map(|k| k.as_str().map(String::from)).collect())
                    .unwrap_or_default();
                let rows: Vec<Value> = raw
                    .lines()
                    .filter(|l| !l.trim().is_empty())
                    .map(|line| {
                        let cells: Vec<&str> = line.splitn(keys.len(), ' ').collect();
                        let mut obj = serde_json::Map::new();
                        for (key, cell) in keys.iter().zip(cells) {
                            obj.insert(key.clone(), json!(cell));
                        }
                        Value::Object(obj)
                    })
                    .collect();
                Ok(format!("```json\n{}\n```", Value::Array(rows)))
            }
            None => Ok(format!("  Cleaned: {}  ", raw.trim())),
        }
    }
}

/// Writes one page per `|`-separated tag after the `%PDF-1.4\n` header.
#[derive(Default)]
struct TagRasterizer {
    pages: Mutex<Vec<PathBuf>>,
}

#[async_trait]
impl PdfRasterizer for TagRasterizer {
    async fn rasterize(&self, pdf: &[u8]) -> Result<RasterizedPdf, ScanError> {
        let body = String::from_utf8_lossy(pdf);
        let tags = body.trim_start_matches("%PDF-1.4\n");
        if tags.is_empty() {
            return Err(ScanError::Rasterizer {
                detail: "produced no page images".into(),
            });
        }

        let dir = tempfile::tempdir().map_err(|e| ScanError::io("tempdir", e))?;
        let mut paths = Vec::new();
        for (i, tag) in tags.split('|').enumerate() {
            let path = dir.path().join(format!("page-{}.png", i + 1));
            std::fs::write(&path, image_bytes(tag)).map_err(|e| ScanError::io("page", e))?;
            paths.push(path);
        }
        self.pages.lock().unwrap().extend(paths.iter().cloned());
        Ok(RasterizedPdf::new(dir, paths))
    }
}

#[derive(Default)]
struct RecordingProgress {
    events: Mutex<Vec<String>>,
}

impl BatchProgressCallback for RecordingProgress {
    fn on_batch_start(&self, total: usize) {
        self.events.lock().unwrap().push(format!("start {total}"));
    }
    fn on_file_start(&self, index: usize, _total: usize, name: &str) {
        self.events.lock().unwrap().push(format!("file {index} {name}"));
    }
    fn on_page_start(&self, _file: usize, page: usize, total: usize) {
        self.events.lock().unwrap().push(format!("page {page}/{total}"));
    }
    fn on_file_complete(&self, index: usize, _total: usize, _name: &str, _chars: usize) {
        self.events.lock().unwrap().push(format!("done {index}"));
    }
    fn on_file_error(&self, index: usize, _total: usize, _name: &str, _error: &str) {
        self.events.lock().unwrap().push(format!("error {index}"));
    }
    fn on_batch_complete(&self, _total: usize, _chars: usize) {
        self.events.lock().unwrap().push("complete".into());
    }
}

struct Harness {
    ocr: Arc<TagOcr>,
    llm: Arc<CatalogueLlm>,
    rasterizer: Arc<TagRasterizer>,
    orchestrator: BatchOrchestrator,
}

fn harness_with(config: PipelineConfig) -> Harness {
    let ocr = Arc::new(TagOcr::default());
    let llm = Arc::new(CatalogueLlm::default());
    let rasterizer = Arc::new(TagRasterizer::default());
    let formatter = LlmFormatter::new(llm.clone(), RetryPolicy::from_config(&config));
    let orchestrator =
        BatchOrchestrator::new(ocr.clone(), formatter, rasterizer.clone(), &config);
    Harness {
        ocr,
        llm,
        rasterizer,
        orchestrator,
    }
}

fn harness() -> Harness {
    harness_with(PipelineConfig::default())
}

fn request(strategy: ExecutionStrategy, shape: OutputShape) -> BatchRequest {
    BatchRequest::new(strategy, shape)
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn two_step_table_has_one_header_and_a_block_per_file() {
    let h = harness();
    let files = vec![
        image("a.png", "१६१ रामायण वाल्मीकि\n१६२ महाभारत व्यास"),
        image("b.png", "१६३ पंचतंत्र विष्णुशर्मा"),
    ];

    let out = h
        .orchestrator
        .run(files, &request(ExecutionStrategy::TwoStep, OutputShape::Table))
        .await
        .unwrap();

    assert_eq!(
        out.text,
        "क्रमांक\tग्रंथ-नाम\tकर्ता\n\
         161\tरामायण\tवाल्मीकि\n162\tमहाभारत\tव्यास\n\n\
         163\tपंचतंत्र\tविष्णुशर्मा"
    );
    assert_eq!(out.text.matches("क्रमांक").count(), 1);
    assert_eq!(out.file_extension, "csv");
    assert_eq!(out.default_file_name(), "ocr_results.csv");
    assert_eq!(out.stats.ocr_calls, 2);
    assert_eq!(out.stats.llm_calls, 2);
    assert_eq!(h.llm.calls(), 2);
}

#[tokio::test]
async fn custom_columns_drive_header_and_rows() {
    let h = harness();
    let columns = ColumnSpec::parse("No, Title, Author").unwrap();
    let req = request(ExecutionStrategy::TwoStep, OutputShape::Table).with_columns(columns);

    let out = h
        .orchestrator
        .run(vec![image("a.png", "१२ कथा प्रेमचंद")], &req)
        .await
        .unwrap();

    assert_eq!(out.text, "No\tTitle\tAuthor\n12\tकथा\tप्रेमचंद");
    let sent = h.llm.requests.lock().unwrap();
    assert!(sent[0].prompt.contains("`no`, `title`, `author`"));
}

#[tokio::test]
async fn identical_runs_produce_identical_output() {
    let h = harness();
    let files = || vec![image("a.png", "१ गीता व्यास"), image("b.png", "२ गीत गोविंद जयदेव")];
    let req = request(ExecutionStrategy::TwoStep, OutputShape::Table);

    let first = h.orchestrator.run(files(), &req).await.unwrap();
    let second = h.orchestrator.run(files(), &req).await.unwrap();
    assert_eq!(first.text, second.text);
}

#[tokio::test]
async fn first_failing_file_aborts_the_batch() {
    let progress = Arc::new(RecordingProgress::default());
    let config = PipelineConfig::builder()
        .progress_callback(progress.clone())
        .build()
        .unwrap();
    let tracked = harness_with(config);

    let files = vec![
        image("a.png", "१ गीता व्यास"),
        image("b.png", "fail-b"),
        image("c.png", "३ मेघदूत कालिदास"),
    ];
    let err = tracked
        .orchestrator
        .run(files, &request(ExecutionStrategy::TwoStep, OutputShape::Table))
        .await
        .unwrap_err();

    assert_eq!(err.file_name(), Some("b.png"));
    assert!(matches!(
        err.root_cause(),
        ScanError::ExternalService {
            service: "vision",
            ..
        }
    ));
    assert_eq!(tracked.ocr.seen(), vec!["१ गीता व्यास", "fail-b"]);
    assert_eq!(tracked.llm.calls(), 1);

    let events = progress.events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec!["start 3", "file 0 a.png", "done 0", "file 1 b.png", "error 1"]
    );
}

#[tokio::test]
async fn raw_strategy_with_table_falls_back_to_plain_text() {
    let h = harness();
    let files = vec![image("a.png", "first page text"), image("b.png", "second page text")];

    let out = h
        .orchestrator
        .run(files, &request(ExecutionStrategy::Raw, OutputShape::Table))
        .await
        .unwrap();

    assert_eq!(out.text, "first page text\n\nsecond page text");
    assert_eq!(out.shape, OutputShape::Document);
    assert_eq!(out.file_extension, "txt");
    assert_eq!(h.llm.calls(), 0);
}

#[tokio::test]
async fn raw_text_is_not_numeral_normalised() {
    let h = harness();
    let out = h
        .orchestrator
        .run(
            vec![image("a.png", "१६१ रामायण")],
            &request(ExecutionStrategy::Raw, OutputShape::Document),
        )
        .await
        .unwrap();
    assert_eq!(out.text, "१६१ रामायण");
}

#[tokio::test]
async fn pdf_pages_are_appended_in_order_and_cleaned_up() {
    let progress = Arc::new(RecordingProgress::default());
    let config = PipelineConfig::builder()
        .progress_callback(progress.clone())
        .build()
        .unwrap();
    let h = harness_with(config);

    let files = vec![
        pdf("book.pdf", &["१ अ क", "२ ब ख", "३ स ग"]),
        image("tail.png", "४ द घ"),
    ];
    let out = h
        .orchestrator
        .run(files, &request(ExecutionStrategy::TwoStep, OutputShape::Table))
        .await
        .unwrap();

    assert_eq!(
        out.text,
        "क्रमांक\tग्रंथ-नाम\tकर्ता\n1\tअ\tक\n\n2\tब\tख\n\n3\tस\tग\n\n4\tद\tघ"
    );
    assert_eq!(out.files[0].pages, 3);
    assert_eq!(out.files[1].pages, 1);
    assert_eq!(out.stats.total_pages, 4);

    let pages = h.rasterizer.pages.lock().unwrap().clone();
    assert_eq!(pages.len(), 3);
    for page in &pages {
        assert!(!page.exists(), "{} should be deleted", page.display());
    }
    assert!(!pages[0].parent().unwrap().exists());

    let events = progress.events.lock().unwrap().clone();
    assert_eq!(
        &events[1..5],
        &["file 0 book.pdf", "page 1/3", "page 2/3", "page 3/3"]
    );
}

#[tokio::test]
async fn failing_page_aborts_by_default_and_cleans_up() {
    let h = harness();
    let err = h
        .orchestrator
        .run(
            vec![pdf("book.pdf", &["१ अ क", "fail-page", "३ स ग"])],
            &request(ExecutionStrategy::TwoStep, OutputShape::Table),
        )
        .await
        .unwrap_err();

    assert_eq!(err.file_name(), Some("book.pdf"));
    assert_eq!(h.ocr.seen().len(), 2);
    for page in h.rasterizer.pages.lock().unwrap().iter() {
        assert!(!page.exists());
    }
}

#[tokio::test]
async fn failing_page_is_skipped_when_configured() {
    let config = PipelineConfig::builder()
        .page_failure_policy(PageFailurePolicy::Skip)
        .build()
        .unwrap();
    let h = harness_with(config);

    let out = h
        .orchestrator
        .run(
            vec![pdf("book.pdf", &["१ अ क", "fail-page", "३ स ग"])],
            &request(ExecutionStrategy::TwoStep, OutputShape::Table),
        )
        .await
        .unwrap();

    assert_eq!(out.text, "क्रमांक\tग्रंथ-नाम\tकर्ता\n1\tअ\tक\n\n3\tस\tग");
    let report = &out.files[0];
    assert_eq!(report.pages, 3);
    assert_eq!(report.skipped_pages.len(), 1);
    assert_eq!(report.skipped_pages[0].page, 2);
    assert!(report.skipped_pages[0].detail.contains("fail-page"));
    assert_eq!(out.stats.skipped_pages, 1);
}

#[tokio::test]
async fn blank_ocr_skips_the_llm_and_adds_no_block() {
    let h = harness();
    let out = h
        .orchestrator
        .run(
            vec![image("a.png", "blank"), image("b.png", "५ ऋग्वेद वेदव्यास")],
            &request(ExecutionStrategy::TwoStep, OutputShape::Table),
        )
        .await
        .unwrap();

    assert_eq!(out.text, "क्रमांक\tग्रंथ-नाम\tकर्ता\n5\tऋग्वेद\tवेदव्यास");
    assert_eq!(h.llm.calls(), 1);
    assert_eq!(out.files[0].chars, 0);
}

#[tokio::test]
async fn two_step_document_uses_prompt_override() {
    let h = harness();
    let req = request(ExecutionStrategy::TwoStep, OutputShape::Document)
        .with_prompt("Fix the spelling only.");

    let out = h
        .orchestrator
        .run(vec![image("a.png", "teh text")], &req)
        .await
        .unwrap();

    assert_eq!(out.text, "Cleaned: teh text");
    assert_eq!(out.file_extension, "txt");
    let sent = h.llm.requests.lock().unwrap();
    assert!(sent[0].prompt.starts_with("Fix the spelling only."));
}

#[tokio::test]
async fn single_step_sends_the_image_and_skips_ocr() {
    let h = harness();
    let out = h
        .orchestrator
        .run(
            vec![image("a.png", "ignored"), image("b.png", "ignored")],
            &request(ExecutionStrategy::SingleStep, OutputShape::Table),
        )
        .await
        .unwrap();

    assert_eq!(
        out.text,
        "क्रमांक\tग्रंथ-नाम\tकर्ता\n1\tगीता\tव्यास\n\n1\tगीता\tव्यास"
    );
    assert!(h.ocr.seen().is_empty());
    let sent = h.llm.requests.lock().unwrap();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].image.as_ref().unwrap().mime_type, "image/png");
}

#[tokio::test(start_paused = true)]
async fn exhausted_llm_retries_fail_the_file() {
    let h = harness();
    let start = tokio::time::Instant::now();

    let err = h
        .orchestrator
        .run(
            vec![image("quota.png", "llm-unavailable")],
            &request(ExecutionStrategy::TwoStep, OutputShape::Document),
        )
        .await
        .unwrap_err();

    assert_eq!(err.file_name(), Some("quota.png"));
    assert!(matches!(
        err.root_cause(),
        ScanError::ExternalServiceExhausted { attempts: 5, .. }
    ));
    assert_eq!(h.llm.calls(), 5);
    assert_eq!(start.elapsed(), Duration::from_secs(15));
}

#[tokio::test]
async fn empty_batch_is_rejected() {
    let h = harness();
    let err = assert_err!(h.orchestrator.run(Vec::new(), &BatchRequest::default()).await);
    assert!(err.is_validation());
}

#[tokio::test]
async fn run_to_file_writes_named_download() {
    let h = harness();
    let dir = tempfile::tempdir().unwrap();

    let (path, stats) = assert_ok!(
        h.orchestrator
            .run_to_file(
                vec![image("a.png", "१ गीता व्यास")],
                &BatchRequest::default(),
                dir.path(),
            )
            .await
    );

    assert_eq!(path, dir.path().join("ocr_results.csv"));
    assert_eq!(stats.total_files, 1);
    let written = std::fs::read_to_string(&path).unwrap();
    assert_eq!(written, "क्रमांक\tग्रंथ-नाम\tकर्ता\n1\tगीता\tव्यास");
}

#[tokio::test]
async fn rasterizer_failure_names_the_pdf() {
    let h = harness();
    let err = h
        .orchestrator
        .run(
            vec![image("a.png", "१ गीता व्यास"), pdf("empty.pdf", &[])],
            &BatchRequest::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.file_name(), Some("empty.pdf"));
    assert!(matches!(err.root_cause(), ScanError::Rasterizer { .. }));
}
