//! Library-level tests of [`RagContext`] over a temporary SQLite database
//! with the deterministic hash embedder.

use std::path::Path;

use docrag::config::Config;
use docrag::pipeline::{QueryOptions, RagContext, UploadRequest};
use docrag::sqlite_store::SqliteIndex;
use docrag_core::models::{DocumentStatus, MetadataFilter};
use docrag_core::store::VectorIndex;
use docrag_core::{ErrorKind, RagError};
use tempfile::TempDir;

fn config(db: &Path, dims: usize) -> Config {
    toml::from_str(&format!(
        r#"
        [db]
        path = "{}"

        [embedding]
        provider = "hash"
        dims = {}

        [chunking]
        chunk_size = 300
        overlap = 60

        [ocr]
        enabled = false
        "#,
        db.display(),
        dims
    ))
    .unwrap()
}

const SPECS: &[(&str, &str)] = &[
    (
        "electrical",
        "Panelboards shall be located in dedicated electrical rooms. \
         Branch circuits serving receptacles require ground fault protection.",
    ),
    (
        "plumbing",
        "Domestic water piping shall be type L copper. \
         Backflow preventers are required at every irrigation connection.",
    ),
    (
        "masonry",
        "Mortar joints shall be tooled concave. \
         Weep holes are spaced no more than twenty four inches apart.",
    ),
];

async fn seeded(tmp: &TempDir) -> RagContext {
    let ctx = RagContext::open(config(&tmp.path().join("rag.sqlite"), 256))
        .await
        .unwrap();
    let requests = SPECS
        .iter()
        .map(|(id, text)| {
            UploadRequest::new(id, &format!("{}.txt", id), text.as_bytes().to_vec(), "text/plain")
                .with_tag("division", id)
        })
        .collect();
    let outcomes = ctx.ingest_batch(requests).await.unwrap();
    assert!(outcomes.iter().all(|o| o.is_indexed()));
    ctx
}

#[tokio::test]
async fn own_text_ranks_first() {
    let tmp = TempDir::new().unwrap();
    let ctx = seeded(&tmp).await;

    for (id, text) in SPECS {
        let result = ctx.query(text, &QueryOptions::default()).await.unwrap();
        assert_eq!(result.chunks[0].document_id, *id);
        assert!(result.chunks[0].score > ctx.config().retrieval.min_score);
    }
    ctx.close().await;
}

#[tokio::test]
async fn query_respects_filter_and_budget() {
    let tmp = TempDir::new().unwrap();
    let ctx = seeded(&tmp).await;

    let opts = QueryOptions {
        filter: Some(MetadataFilter::new().with("division", "plumbing")),
        ..QueryOptions::default()
    };
    let result = ctx.query(SPECS[0].1, &opts).await.unwrap();
    assert!(result.chunks.iter().all(|c| c.document_id == "plumbing"));

    let opts = QueryOptions {
        max_context_chars: Some(50),
        ..QueryOptions::default()
    };
    let result = ctx.query(SPECS[1].1, &opts).await.unwrap();
    assert!(result.total_chars <= 50);
    assert_eq!(result.context.chars().count(), result.total_chars);
    ctx.close().await;
}

#[tokio::test]
async fn delete_removes_document_from_results() {
    let tmp = TempDir::new().unwrap();
    let ctx = seeded(&tmp).await;

    let outcome = ctx.delete_document("masonry").await.unwrap();
    assert_eq!(outcome.entries_removed, 1);
    assert!(outcome.record_removed);

    let result = ctx.query(SPECS[2].1, &QueryOptions::default()).await.unwrap();
    assert!(result.chunks.iter().all(|c| c.document_id != "masonry"));

    let again = ctx.delete_document("masonry").await.unwrap();
    assert_eq!(again.entries_removed, 0);
    assert!(!again.record_removed);
    ctx.close().await;
}

#[tokio::test]
async fn index_survives_reopen() {
    let tmp = TempDir::new().unwrap();
    let ctx = seeded(&tmp).await;
    ctx.close().await;

    let ctx = RagContext::open(config(&tmp.path().join("rag.sqlite"), 256))
        .await
        .unwrap();
    let stats = ctx.stats().await.unwrap();
    assert_eq!(stats.documents.indexed, 3);
    assert_eq!(stats.entries, 3);
    assert_eq!(stats.model, "hash-v1-256");

    let doc = ctx.get_document("electrical").await.unwrap().unwrap();
    assert_eq!(doc.document.status, DocumentStatus::Indexed);
    assert_eq!(doc.entries.len(), 1);
    assert_eq!(doc.entries[0].metadata["division"], "electrical");

    let result = ctx.query(SPECS[0].1, &QueryOptions::default()).await.unwrap();
    assert_eq!(result.chunks[0].document_id, "electrical");
    ctx.close().await;
}

#[tokio::test]
async fn reopen_with_other_dims_is_refused() {
    let tmp = TempDir::new().unwrap();
    let db = tmp.path().join("rag.sqlite");
    RagContext::open(config(&db, 768)).await.unwrap().close().await;

    let err = RagContext::open(config(&db, 384)).await.err().unwrap();
    let rag = err.downcast_ref::<RagError>().unwrap();
    assert_eq!(
        *rag,
        RagError::DimensionMismatch {
            expected: 768,
            actual: 384
        }
    );
}

#[tokio::test]
async fn short_vectors_are_rejected_atomically() {
    let tmp = TempDir::new().unwrap();
    let db = tmp.path().join("rag.sqlite");
    let pool = docrag::db::connect_path(&db).await.unwrap();
    docrag::migrate::apply(&pool).await.unwrap();
    let index = SqliteIndex::open(pool.clone(), 768, "wide-model").await.unwrap();

    let chunk = docrag_core::models::Chunk {
        id: "c0".into(),
        document_id: "doc".into(),
        chunk_index: 0,
        start: 0,
        end: 4,
        total_chunks: 1,
        text: "text".into(),
        hash: String::new(),
        metadata: Default::default(),
    };
    let entry = docrag_core::models::IndexEntry::from_chunk(&chunk, vec![0.1; 384]);
    let err = index.upsert("doc", vec![entry]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DimensionMismatch);
    assert_eq!(index.count().await.unwrap(), 0);
    assert!(index.document_entries("doc").await.unwrap().is_empty());
    pool.close().await;
}

#[tokio::test]
async fn empty_index_returns_no_context() {
    let tmp = TempDir::new().unwrap();
    let ctx = RagContext::open(config(&tmp.path().join("rag.sqlite"), 64))
        .await
        .unwrap();
    let result = ctx
        .query("where are the fire extinguishers", &QueryOptions::default())
        .await
        .unwrap();
    assert!(result.is_empty());
    assert_eq!(result.context, "");
    ctx.close().await;
}

#[tokio::test]
async fn failed_documents_are_listed_with_their_kind() {
    let tmp = TempDir::new().unwrap();
    let ctx = RagContext::open(config(&tmp.path().join("rag.sqlite"), 64))
        .await
        .unwrap();
    let outcomes = ctx
        .ingest_batch(vec![
            UploadRequest::new("good", "good.txt", b"Roof drains every 10,000 sq ft.".to_vec(), "text"),
            UploadRequest::new("bad", "bad.docx", b"PK not really a zip".to_vec(), "docx"),
        ])
        .await
        .unwrap();
    assert!(outcomes[0].is_indexed());
    assert_eq!(outcomes[1].error_kind, Some(ErrorKind::ExtractionError));

    let docs = ctx.list_documents(10, 0).await.unwrap();
    assert_eq!(docs.len(), 2);
    let bad = docs.iter().find(|d| d.id == "bad").unwrap();
    assert_eq!(bad.status, DocumentStatus::Failed);
    assert_eq!(bad.error_kind, Some(ErrorKind::ExtractionError));
    assert!(bad.error_message.is_some());

    ctx.clear().await.unwrap();
    assert!(ctx.list_documents(10, 0).await.unwrap().is_empty());
    ctx.close().await;
}

#[tokio::test]
async fn failed_reupload_is_no_longer_searchable() {
    let tmp = TempDir::new().unwrap();
    let ctx = seeded(&tmp).await;

    let outcome = ctx
        .ingest_document(UploadRequest::new(
            "plumbing",
            "plumbing.docx",
            b"PK not really a zip".to_vec(),
            "docx",
        ))
        .await
        .unwrap();
    assert_eq!(outcome.error_kind, Some(ErrorKind::ExtractionError));

    let detail = ctx.get_document("plumbing").await.unwrap().unwrap();
    assert_eq!(detail.document.status, DocumentStatus::Failed);
    assert!(detail.entries.is_empty());

    let result = ctx.query(SPECS[1].1, &QueryOptions::default()).await.unwrap();
    assert!(result.chunks.iter().all(|c| c.document_id != "plumbing"));
    assert_eq!(ctx.stats().await.unwrap().entries, 2);
    ctx.close().await;
}
