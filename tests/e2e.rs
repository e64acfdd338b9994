//! End-to-end tests against the live Vision and Gemini services.
//!
//! These tests read scans from `./test_cases/` and make real API calls. They
//! are gated behind `E2E_ENABLED` so they do not run in CI unless explicitly
//! requested, and additionally need `GEMINI_API_KEY` and
//! `GOOGLE_VISION_API_KEY`.
//!
//! Run with:
//!   E2E_ENABLED=1 cargo test --test e2e -- --nocapture
//!
//! PDF tests also need `pdftoppm` on `PATH`.

use scan2table::{
    BatchOrchestrator, BatchRequest, ExecutionStrategy, OcrAuth, OutputShape, PipelineConfig,
    ScanError, UploadedFile,
};
use std::path::PathBuf;

// ── Test helpers ─────────────────────────────────────────────────────────────

fn test_cases_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("test_cases")
}

fn output_dir() -> PathBuf {
    let d = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("test_cases/output");
    std::fs::create_dir_all(&d).ok();
    d
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("scan2table=debug"))
        .with_test_writer()
        .try_init();
}

/// Skip this test unless E2E_ENABLED is set, credentials exist and the file is present.
macro_rules! e2e_skip_unless_ready {
    ($path:expr) => {{
        if std::env::var("E2E_ENABLED").is_err() {
            println!("SKIP: set E2E_ENABLED=1 to run e2e tests");
            return;
        }
        if std::env::var("GEMINI_API_KEY").is_err()
            || std::env::var("GOOGLE_VISION_API_KEY").is_err()
        {
            println!("SKIP: GEMINI_API_KEY and GOOGLE_VISION_API_KEY are required");
            return;
        }
        let p: PathBuf = $path;
        if !p.exists() {
            println!("SKIP: test file not found: {}", p.display());
            return;
        }
        init_tracing();
        p
    }};
}

fn live_orchestrator() -> BatchOrchestrator {
    let config = PipelineConfig::builder()
        .gemini_api_key(std::env::var("GEMINI_API_KEY").unwrap_or_default())
        .vision_auth(OcrAuth::ApiKey(
            std::env::var("GOOGLE_VISION_API_KEY").unwrap_or_default(),
        ))
        .max_attempts(3)
        .build()
        .expect("valid config");
    BatchOrchestrator::from_config(&config).expect("clients should build")
}

/// Every data row has exactly as many cells as the header.
fn assert_table_shape(tsv: &str, context: &str) {
    let mut lines = tsv.lines().filter(|l| !l.is_empty());
    let header = lines.next().expect("table must have a header");
    let width = header.split('\t').count();
    let mut rows = 0;
    for line in lines {
        assert_eq!(
            line.split('\t').count(),
            width,
            "[{context}] row has the wrong number of cells: {line:?}"
        );
        rows += 1;
    }
    assert!(rows > 0, "[{context}] table has no data rows");
    println!("[{context}] ✓  {rows} row(s) of {width} cells");
}

// ── Image tests ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_two_step_register_page() {
    let path = e2e_skip_unless_ready!(test_cases_dir().join("register_page.jpg"));
    let file = UploadedFile::from_path(&path).await.expect("readable scan");

    let output = live_orchestrator()
        .run(vec![file], &BatchRequest::default())
        .await
        .expect("batch should succeed");

    assert!(output.text.starts_with("क्रमांक\tग्रंथ-नाम\tकर्ता\n"));
    assert_table_shape(&output.text, "two_step");
    for row in output.text.lines().skip(1) {
        let serial = row.split('\t').next().unwrap_or_default();
        assert!(
            !serial.chars().any(|c| ('०'..='९').contains(&c)),
            "serial numbers should use ASCII digits: {row:?}"
        );
    }
    std::fs::write(output_dir().join("register_two_step.csv"), &output.text).ok();
}

#[tokio::test]
async fn test_single_step_register_page() {
    let path = e2e_skip_unless_ready!(test_cases_dir().join("register_page.jpg"));
    let file = UploadedFile::from_path(&path).await.expect("readable scan");

    let output = live_orchestrator()
        .run(
            vec![file],
            &BatchRequest::new(ExecutionStrategy::SingleStep, OutputShape::Table),
        )
        .await
        .expect("batch should succeed");

    assert_table_shape(&output.text, "single_step");
    assert_eq!(output.stats.ocr_calls, 0);
}

#[tokio::test]
async fn test_raw_is_plain_text() {
    let path = e2e_skip_unless_ready!(test_cases_dir().join("register_page.jpg"));
    let file = UploadedFile::from_path(&path).await.expect("readable scan");

    let output = live_orchestrator()
        .run(
            vec![file],
            &BatchRequest::new(ExecutionStrategy::Raw, OutputShape::Table),
        )
        .await
        .expect("batch should succeed");

    assert_eq!(output.file_extension, "txt");
    assert!(!output.text.trim().is_empty());
    assert_eq!(output.stats.llm_calls, 0);
}

// ── PDF tests ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_pdf_register_pages_in_order() {
    let path = e2e_skip_unless_ready!(test_cases_dir().join("register.pdf"));
    let file = UploadedFile::from_path(&path).await.expect("readable pdf");
    let dir = output_dir();

    let (written, stats) = live_orchestrator()
        .run_to_file(vec![file], &BatchRequest::default(), &dir)
        .await
        .expect("batch should succeed");

    assert_eq!(written, dir.join("ocr_results.csv"));
    assert!(stats.total_pages >= 1);
    let text = std::fs::read_to_string(&written).expect("output written");
    assert_table_shape(&text, "pdf");
}

// ── Failure tests ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_bad_key_names_the_file() {
    let path = e2e_skip_unless_ready!(test_cases_dir().join("register_page.jpg"));
    let file = UploadedFile::from_path(&path).await.expect("readable scan");

    let config = PipelineConfig::builder()
        .gemini_api_key("invalid")
        .vision_auth(OcrAuth::ApiKey("invalid".into()))
        .build()
        .expect("valid config");
    let orchestrator = BatchOrchestrator::from_config(&config).expect("clients should build");

    let err = orchestrator
        .run(vec![file], &BatchRequest::default())
        .await
        .expect_err("invalid keys must fail");

    assert_eq!(err.file_name(), Some("register_page.jpg"));
    assert!(matches!(
        err.root_cause(),
        ScanError::ExternalService {
            service: "vision",
            ..
        }
    ));
}
