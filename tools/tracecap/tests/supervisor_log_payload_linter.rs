use std::fs;
use std::path::PathBuf;

const TARGET_FILES: &[&str] = &["supervisor.rs"];
const RUN_LOG_CALL: &str = "append_run_log(";

#[derive(Debug)]
struct CallViolation {
    file: &'static str,
    line: usize,
    snippet: String,
}

#[test]
fn supervisor_log_payloads_include_run_id() {
    let src_root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("src");
    let mut violations = Vec::new();
    let mut calls_seen = 0;

    for file in TARGET_FILES {
        let source = fs::read_to_string(src_root.join(file)).expect("read source file");
        for (offset, call) in extract_calls(&source) {
            calls_seen += 1;
            if !call.contains("\"run_id\"") {
                violations.push(CallViolation {
                    file,
                    line: source[..offset].bytes().filter(|b| *b == b'\n').count() + 1,
                    snippet: call.lines().take(3).collect::<Vec<_>>().join(" "),
                });
            }
        }
    }

    assert!(calls_seen > 0, "linter found no run log calls");
    if !violations.is_empty() {
        let mut message = String::from(
            "supervisor log linter failed: every event must carry \"run_id\" in its payload\n",
        );
        for v in violations {
            message.push_str(&format!("  - {}:{} :: {}\n", v.file, v.line, v.snippet));
        }
        panic!("{message}");
    }
}

/// Every `append_run_log(...)` call with its offset. Parentheses inside
/// string literals are skipped.
fn extract_calls(source: &str) -> Vec<(usize, String)> {
    let bytes = source.as_bytes();
    let mut calls = Vec::new();
    let mut cursor = 0usize;

    while let Some(found) = source[cursor..].find(RUN_LOG_CALL) {
        let start = cursor + found;
        let mut i = start + RUN_LOG_CALL.len() - 1;
        let mut depth = 0i32;
        let mut in_string = false;
        let mut escaped = false;
        let mut end = None;
        while i < bytes.len() {
            let b = bytes[i];
            if in_string {
                if escaped {
                    escaped = false;
                } else if b == b'\\' {
                    escaped = true;
                } else if b == b'"' {
                    in_string = false;
                }
            } else if b == b'"' {
                in_string = true;
            } else if b == b'(' {
                depth += 1;
            } else if b == b')' {
                depth -= 1;
                if depth == 0 {
                    end = Some(i + 1);
                    break;
                }
            }
            i += 1;
        }
        let Some(end) = end else {
            break;
        };
        calls.push((start, source[start..end].to_string()));
        cursor = end;
    }
    calls
}
