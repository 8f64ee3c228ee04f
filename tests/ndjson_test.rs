mod common;

use bytes::Bytes;
use common::{test_state, ScriptedModel};
use futures_util::{stream, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use studyhall::generate::GenerationEvent;
use studyhall::ndjson::{decode_stream, read_ndjson, NDJSON_CONTENT_TYPE};
use studyhall::routes::build_router;

#[derive(Debug, Deserialize, PartialEq)]
struct Record {
    n: u32,
    label: String,
}

async fn decode_all(chunks: Vec<&'static str>) -> Vec<studyhall::types::Result<Record>> {
    let reads = stream::iter(
        chunks
            .into_iter()
            .map(|c| Ok::<Bytes, std::io::Error>(Bytes::from_static(c.as_bytes()))),
    );
    decode_stream::<Record, _, _>(reads).collect().await
}

#[tokio::test]
async fn test_record_split_across_reads() {
    let records = decode_all(vec!["{\"n\":1,\"label\":\"fi", "rst\"}\n{\"n\":2,", "\"label\":\"second\"}\n"]).await;

    let parsed: Vec<Record> = records
        .into_iter()
        .map(|r| match r {
            Ok(rec) => rec,
            Err(e) => panic!("Decode failed: {:?}", e),
        })
        .collect();
    assert_eq!(
        parsed,
        vec![
            Record { n: 1, label: "first".into() },
            Record { n: 2, label: "second".into() },
        ]
    );
}

#[tokio::test]
async fn test_blank_lines_and_unterminated_tail() {
    let records = decode_all(vec!["\n{\"n\":1,\"label\":\"a\"}\n\n  \n", "{\"n\":2,\"label\":\"b\"}"]).await;

    let labels: Vec<String> = records
        .into_iter()
        .map(|r| match r {
            Ok(rec) => rec.label,
            Err(e) => panic!("Decode failed: {:?}", e),
        })
        .collect();
    assert_eq!(labels, vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test]
async fn test_invalid_record_is_an_error() {
    let records = decode_all(vec!["{\"n\":1,\"label\":\"ok\"}\nnot json\n"]).await;
    assert_eq!(records.len(), 2);
    assert!(records[0].is_ok());
    assert!(records[1].is_err());
}

#[tokio::test]
async fn test_flashcards_stream_over_http() {
    let model = Arc::new(ScriptedModel::completing(&[r#"```json
{"flashcards": [
  {"front": "ATP", "back": "Energy currency of the cell"},
  {"front": "", "back": "no front"},
  {"term": "Osmosis", "definition": "Diffusion of water across a membrane"},
]}
```"#]));
    let (_dir, state) = test_state(model.clone()).await;
    let app = build_router(state);

    let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
        Ok(l) => l,
        Err(e) => panic!("Failed to bind: {:?}", e),
    };
    let addr = match listener.local_addr() {
        Ok(a) => a,
        Err(e) => panic!("No local addr: {:?}", e),
    };
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let response = match reqwest::Client::new()
        .post(format!("http://{}/api/flashcards", addr))
        .json(&serde_json::json!({"topic": "Cell biology", "count": 5}))
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => panic!("Request failed: {:?}", e),
    };
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    assert_eq!(content_type.as_deref(), Some(NDJSON_CONTENT_TYPE));

    let mut events = Vec::new();
    let mut lines = read_ndjson::<GenerationEvent>(response);
    while let Some(event) = lines.next().await {
        match event {
            Ok(e) => events.push(e),
            Err(e) => panic!("Bad NDJSON line: {:?}", e),
        }
    }

    assert_eq!(
        events,
        vec![
            GenerationEvent::Card {
                index: 0,
                front: "ATP".into(),
                back: "Energy currency of the cell".into(),
            },
            GenerationEvent::Card {
                index: 1,
                front: "Osmosis".into(),
                back: "Diffusion of water across a membrane".into(),
            },
            GenerationEvent::Done { count: 2 },
        ]
    );
    assert_eq!(model.total_calls(), 1);
}
