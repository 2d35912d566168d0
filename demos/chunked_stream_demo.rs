//! Feed a document to the engine in awkward chunks and print records as they close.
use jql::{Engine, EngineOptions, Match};

fn main() -> Result<(), jql::QueryError> {
    let chunks = [
        "[{\"id\": 1, \"na",
        "me\": \"Ada\", \"bio\": {\"long\": \"ignored \\\"text\\\"\"}, \"tags\": [\"x\"",
        ", \"y\"]}, {\"id\": 2, \"name\": \"Grace\", \"bio\"",
        ": null, \"tags\": []}",
        "]",
    ];

    let mut engine = Engine::from_query("{ id, tags }", EngineOptions::default())?;
    for c in chunks {
        println!("feeding chunk: {:?}", c);
        engine.process_chunk(c.as_bytes())?;
        for m in engine.take_matches() {
            if let Match::Value(v) = m {
                println!("RECORD {}  (depth now {})", v, engine.depth());
            }
        }
    }
    engine.finish()?;
    let stats = engine.stats();
    println!("matched {} of {} bytes, skip ratio {:.2}", stats.matched_count, stats.processed_bytes, stats.skip_ratio);
    Ok(())
}
