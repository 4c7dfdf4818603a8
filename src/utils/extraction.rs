//! Extraction of code and JSON from LLM responses.
//!
//! Models are asked for bare output but routinely wrap it in markdown fences
//! or explanatory prose. These helpers recover the payload:
//!
//! - [`extract_code`]: the first Python (or untagged) fenced block, else the
//!   first fenced block of any language, else the whole text when it has no
//!   fences at all.
//! - [`extract_json_object`]: a ```json block, else the largest valid JSON
//!   object anywhere in the text.
//!
//! # Example
//!
//! ```
//! use automl_forge::utils::extraction::extract_code;
//!
//! let response = "Here you go:\n```python\nprint('hi')\n```\nEnjoy!";
//! assert_eq!(extract_code(response), "print('hi')");
//! ```

/// A fenced markdown block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FencedBlock {
    /// Info string after the opening fence, lowercased (`python`, `json`, or empty).
    pub lang: String,
    pub body: String,
    /// False when the response ended before the closing fence.
    pub closed: bool,
}

const FENCE: &str = "```";

/// Splits `text` into its fenced blocks, in order.
pub fn fenced_blocks(text: &str) -> Vec<FencedBlock> {
    let mut blocks = Vec::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in text.lines() {
        let trimmed = line.trim();
        match current.take() {
            None => {
                if let Some(rest) = trimmed.strip_prefix(FENCE) {
                    let lang = rest.trim().to_lowercase();
                    current = Some((lang, Vec::new()));
                }
            }
            Some((lang, mut body)) => {
                if trimmed == FENCE {
                    blocks.push(FencedBlock {
                        lang,
                        body: join_body(&body),
                        closed: true,
                    });
                } else if let Some(before) = line.trim_end().strip_suffix(FENCE) {
                    body.push(before);
                    blocks.push(FencedBlock {
                        lang,
                        body: join_body(&body),
                        closed: true,
                    });
                } else {
                    body.push(line);
                    current = Some((lang, body));
                }
            }
        }
    }

    if let Some((lang, body)) = current {
        blocks.push(FencedBlock {
            lang,
            body: join_body(&body),
            closed: false,
        });
    }

    blocks
}

fn join_body(lines: &[&str]) -> String {
    lines.join("\n").trim_start_matches('\n').trim_end().to_string()
}

fn is_python_lang(lang: &str) -> bool {
    matches!(lang, "" | "python" | "python3" | "py")
}

/// Extracts script text from an LLM response.
pub fn extract_code(response: &str) -> String {
    let blocks = fenced_blocks(response);

    if let Some(block) = blocks
        .iter()
        .find(|b| is_python_lang(&b.lang) && !b.body.trim().is_empty())
    {
        return block.body.clone();
    }

    if let Some(block) = blocks.iter().find(|b| !b.body.trim().is_empty()) {
        return block.body.clone();
    }

    if !blocks.is_empty() {
        return String::new();
    }

    response.trim().to_string()
}

/// Finds the index of the '}' closing the object that `s` starts with.
///
/// Braces inside string literals (including escaped quotes) are ignored.
pub fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match c {
            '\\' if in_string => {
                escape_next = true;
            }
            '"' => {
                in_string = !in_string;
            }
            '{' if !in_string => {
                depth += 1;
            }
            '}' if !in_string => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

/// Prose scanned for bare JSON objects, in bytes.
pub const MAX_JSON_SCAN_BYTES: usize = 16 * 1024;

/// Extracts a JSON object from an LLM response.
///
/// Prefers a ```json block; otherwise returns the largest object in the
/// first [`MAX_JSON_SCAN_BYTES`] of text that parses, later occurrences
/// winning ties.
pub fn extract_json_object(response: &str) -> Option<String> {
    let trimmed = response.trim();
    if trimmed.starts_with('{') && serde_json::from_str::<serde_json::Value>(trimmed).is_ok() {
        return Some(trimmed.to_string());
    }

    for block in fenced_blocks(response).iter().filter(|b| b.lang == "json") {
        if serde_json::from_str::<serde_json::Value>(&block.body).is_ok() {
            return Some(block.body.clone());
        }
    }

    let mut limit = response.len().min(MAX_JSON_SCAN_BYTES);
    while !response.is_char_boundary(limit) {
        limit -= 1;
    }
    let text = &response[..limit];

    let mut best: Option<&str> = None;
    // Objects nested in one that already parsed are smaller, so skip them.
    let mut resume_at = 0;
    for (start, _) in text.char_indices().filter(|(_, c)| *c == '{') {
        if start < resume_at {
            continue;
        }
        let Some(end) = find_matching_brace(&text[start..]) else {
            continue;
        };
        let candidate = &text[start..=start + end];
        if serde_json::from_str::<serde_json::Value>(candidate).is_err() {
            continue;
        }
        resume_at = start + end + 1;
        if best.map(|b| candidate.len() >= b.len()).unwrap_or(true) {
            best = Some(candidate);
        }
    }

    best.map(str::to_string)
}
