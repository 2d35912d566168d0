//! Print the source spans of selected fields, including one split across chunks.
use bytes::Bytes;
use jql::{Engine, EngineOptions, Match};

fn main() -> Result<(), jql::QueryError> {
    let text = r#"{"user": {"id": 7, "name": "Lin", "meta": {"x": [1, 2]}}, "note": "skipped"}"#;
    println!("input: {}", text);

    let mut engine = Engine::from_query("{ user { id, meta } }", EngineOptions::raw())?;
    // Split in the middle of the `meta` object so its capture spans two chunks.
    let cut = text.find("[1").map_or(text.len() / 2, |i| i + 2);
    for chunk in [&text[..cut], &text[cut..]] {
        engine.process_bytes(&Bytes::copy_from_slice(chunk.as_bytes()))?;
    }
    engine.finish()?;

    for m in engine.take_matches() {
        if let Match::Raw(raw) = m {
            let start = raw.span.start;
            println!("{} {}..{} => {}", raw.key, start, raw.span.end, String::from_utf8_lossy(&raw.bytes));
            println!("  matches source: {}", &text.as_bytes()[raw.span.range()] == &raw.bytes[..]);
        }
    }
    Ok(())
}
