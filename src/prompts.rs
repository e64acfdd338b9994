//! Prompts and response schemas for the LLM formatting step.
//!
//! Every instruction sent to the generative service is built here so the
//! wording can change without touching retry or parsing logic in
//! [`crate::pipeline::llm`].
//!
//! Two prompt families exist: one for text that the OCR service already
//! extracted (two-step), and one for a raw image (single-step). Table prompts
//! are paired with [`table_response_schema`] so the service returns a JSON
//! array whose keys match the [`ColumnSpec`].

use crate::request::ColumnSpec;
use serde_json::{json, Value};

/// Catalogue rules shared by the text and image variants of the default
/// table prompt. `{keys}` style placeholders are filled by [`catalogue_rules`].
const CATALOGUE_RULES: &str = "Follow these rules precisely:
1. Extract every book entry. An entry starts with a serial number ({serial}), for example १६१ or १६२.
2. For each entry, take the complete book title ({title}): the text that follows the serial number.
3. For each title, look for its author ({author}) on the same line or on any following line up to the next serial number.
4. When an author is found for a title, put them in the same entry.
5. When no author is found, leave the `{author_key}` field as an empty string.
6. Return only a JSON array. Each object has exactly these keys: {key_list}.";

/// Default instruction for cleaning OCR text into a document.
pub const DEFAULT_DOCUMENT_PROMPT: &str = "The following text was extracted from an image with OCR. \
It may contain recognition errors, stray line breaks and messy formatting. \
Clean it up and present it as a logical, easy-to-read document. \
Correct spelling and grammar without changing the meaning of the original. \
Do not add any new information.";

/// Default instruction for reading and cleaning an image in one call.
pub const DEFAULT_IMAGE_DOCUMENT_PROMPT: &str = "Extract all of the text in this image, clean it up, \
correct misspellings and format it as a readable document. \
Keep paragraph and line breaks where they belong. \
Do not add new content or summaries.";

fn key_list(columns: &ColumnSpec) -> String {
    columns
        .columns()
        .iter()
        .map(|c| format!("`{}`", c.key))
        .collect::<Vec<_>>()
        .join(", ")
}

fn catalogue_rules(columns: &ColumnSpec) -> String {
    let cols = columns.columns();
    CATALOGUE_RULES
        .replace("{serial}", &format!("`{}`", cols[0].label))
        .replace("{title}", &format!("`{}`", cols[1].label))
        .replace("{author}", &format!("`{}`", cols[2].label))
        .replace("{author_key}", &cols[2].key)
        .replace("{key_list}", &key_list(columns))
}

fn generic_table_rules(columns: &ColumnSpec) -> String {
    let mut rules = String::from("Follow these rules precisely:\n");
    rules.push_str("1. Split the content into records, one per logical row or entry.\n");
    rules.push_str("2. For each record, fill these fields:\n");
    for col in columns.columns() {
        rules.push_str(&format!("   - `{}`: {}\n", col.key, col.label));
    }
    rules.push_str("3. When a field is not present for a record, use an empty string.\n");
    rules.push_str(&format!(
        "4. Return only a JSON array. Each object has exactly these keys: {}.",
        key_list(columns)
    ));
    rules
}

fn table_rules(columns: &ColumnSpec) -> String {
    if columns.is_default() {
        catalogue_rules(columns)
    } else {
        generic_table_rules(columns)
    }
}

/// Instruction for turning extracted OCR text into table records.
pub fn table_prompt_from_text(raw_text: &str, columns: &ColumnSpec) -> String {
    let intro = if columns.is_default() {
        "I have a list of books and their authors extracted via OCR. The text is messy, \
and an author may be on a different line or missing entirely.\n\
Convert this messy text into a clean JSON array."
    } else {
        "The following text was extracted from a scanned page via OCR and may be messy.\n\
Convert it into a clean JSON array of records."
    };
    format!(
        "{intro}\n\n{}\n\nHere is the raw OCR text:\n{raw_text}",
        table_rules(columns)
    )
}

/// Instruction for reading table records directly from an image.
pub fn table_prompt_from_image(columns: &ColumnSpec) -> String {
    let intro = if columns.is_default() {
        "This image shows a list of books and their authors. The layout is messy, \
and an author may be on a different line or missing entirely.\n\
Read the text in the image and convert it into a clean JSON array."
    } else {
        "Read the text in this scanned image and convert it into a clean JSON array of records."
    };
    format!("{intro}\n\n{}", table_rules(columns))
}

/// Instruction for cleaning extracted OCR text into prose.
pub fn document_prompt_from_text(raw_text: &str, prompt_override: Option<&str>) -> String {
    let instruction = prompt_override.unwrap_or(DEFAULT_DOCUMENT_PROMPT);
    format!("{instruction}\n\nHere is the raw OCR text:\n{raw_text}")
}

/// Instruction for reading and cleaning an image into prose.
pub fn document_prompt_from_image(prompt_override: Option<&str>) -> String {
    prompt_override
        .unwrap_or(DEFAULT_IMAGE_DOCUMENT_PROMPT)
        .to_string()
}

/// Structured-output schema: an array of objects keyed per column, all strings.
pub fn table_response_schema(columns: &ColumnSpec) -> Value {
    let keys: Vec<&str> = columns.columns().iter().map(|c| c.key.as_str()).collect();
    let properties: serde_json::Map<String, Value> = keys
        .iter()
        .map(|k| (k.to_string(), json!({ "type": "STRING" })))
        .collect();

    json!({
        "type": "ARRAY",
        "items": {
            "type": "OBJECT",
            "properties": properties,
            "required": keys,
            "propertyOrdering": keys,
        }
    })
}
