mod support;

use std::{fs, sync::Arc};

use gsync::{
   index::MemoryIndexer,
   types::{ChangeOp, DocContent, RunStatus},
};
use support::{EMBED_DIM, open_store, options, orchestrator, reader};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn bare_paths_resolve_from_the_filesystem() {
   let state = TempDir::new().expect("state dir");
   let repo = TempDir::new().expect("repo dir");
   let small = repo.path().join("small.rs");
   let big = repo.path().join("big.log");
   fs::write(&small, "fn answer() -> u32 { 42 }\n").expect("small file");
   fs::write(&big, "y".repeat(2 * 1024 * 1024)).expect("big file");

   // Binary and vendored paths are rejected before any filesystem access,
   // so neither needs to exist.
   let source = format!(
      "{}\n{}\nlogo.png\nnode_modules/lodash/index.js\n",
      small.display(),
      big.display()
   );

   let indexer = Arc::new(MemoryIndexer::new());
   let mut orch = orchestrator(&state, indexer.clone(), options("code"));
   let cancel = CancellationToken::new();
   let outcome = orch.run(reader(&source), &cancel, &mut ()).await.expect("run");

   assert!(outcome.success());
   assert_eq!(outcome.run.processed, 4);
   assert_eq!(outcome.run.succeeded, 4);
   assert_eq!(outcome.run.failed, 0);

   // Skipped lines complete without producing documents.
   assert_eq!(indexer.len("code"), 2);

   let doc = indexer.document("code", &small.display().to_string()).expect("small doc");
   assert_eq!(doc.op, ChangeOp::Modify);
   assert_eq!(
      doc.content,
      Some(DocContent::Inline { text: "fn answer() -> u32 { 42 }\n".to_string() })
   );
   assert_eq!(doc.vector.as_ref().map(Vec::len), Some(EMBED_DIM));

   // Oversized files travel as a pointer and carry no embedding.
   let doc = indexer.document("code", &big.display().to_string()).expect("big doc");
   assert_eq!(doc.content, Some(DocContent::Reference { size_bytes: 2 * 1024 * 1024 }));
   assert!(doc.vector.is_none());
}

#[tokio::test]
async fn content_ref_reads_the_referenced_file() {
   let state = TempDir::new().expect("state dir");
   let repo = TempDir::new().expect("repo dir");
   let target = repo.path().join("generated.rs");
   fs::write(&target, "fn generated() {}\n").expect("target file");

   let line = serde_json::json!({
      "path": "virtual/widget.rs",
      "op": "add",
      "content_ref": target.display().to_string(),
   })
   .to_string();
   let source = format!("{line}\n");

   let indexer = Arc::new(MemoryIndexer::new());
   let mut orch = orchestrator(&state, indexer.clone(), options("code"));
   let cancel = CancellationToken::new();
   let outcome = orch.run(reader(&source), &cancel, &mut ()).await.expect("run");

   assert!(outcome.success());
   // The document lives under the declared path, not the referenced one.
   let doc = indexer.document("code", "virtual/widget.rs").expect("doc");
   assert_eq!(doc.op, ChangeOp::Add);
   assert_eq!(doc.content, Some(DocContent::Inline { text: "fn generated() {}\n".to_string() }));
}

#[tokio::test]
async fn resync_is_idempotent() {
   let state = TempDir::new().expect("state dir");
   let source = concat!(
      r#"{"path": "a.rs", "op": "add", "content": "fn a() {}"}"#,
      "\n",
      r#"{"path": "b.rs", "op": "add", "content": "fn b() {}"}"#,
      "\n",
   );

   let indexer = Arc::new(MemoryIndexer::new());
   let cancel = CancellationToken::new();

   let mut first = orchestrator(&state, indexer.clone(), options("code"));
   let one = first.run(reader(source), &cancel, &mut ()).await.expect("first run");
   drop(first);

   let mut second = orchestrator(&state, indexer.clone(), options("code"));
   let two = second.run(reader(source), &cancel, &mut ()).await.expect("second run");

   assert!(one.success());
   assert!(two.success());
   assert_ne!(one.run.run_id, two.run.run_id);

   // Upserts land on stable ids; a re-sync overwrites instead of duplicating.
   assert_eq!(indexer.len("code"), 2);

   let store = open_store(&state);
   let runs = store.list_runs(10).expect("list runs");
   assert_eq!(runs.len(), 2);
   assert!(runs.iter().all(|r| r.status == RunStatus::Completed));
}

#[tokio::test]
async fn clean_run_of_adds_leaves_no_failed_lines() {
   let state = TempDir::new().expect("state dir");
   let repo = TempDir::new().expect("repo dir");

   let mut source = String::new();
   for i in 0..5 {
      let path = repo.path().join(format!("mod{i}.rs"));
      fs::write(&path, format!("pub fn item{i}() {{}}\n")).expect("write file");
      source.push_str(&serde_json::json!({ "path": path, "op": "add" }).to_string());
      source.push('\n');
   }

   let indexer = Arc::new(MemoryIndexer::new());
   let mut orch = orchestrator(&state, indexer.clone(), options("code"));
   let cancel = CancellationToken::new();
   let outcome = orch.run(reader(&source), &cancel, &mut ()).await.expect("run");

   assert!(outcome.success());
   assert_eq!(outcome.run.processed, 5);
   assert_eq!(outcome.run.succeeded, 5);
   assert_eq!(outcome.run.failed, 0);
   assert_eq!(indexer.len("code"), 5);

   let store = open_store(&state);
   assert!(store.get_failed_all(&outcome.run.run_id).expect("failed rows").is_empty());
}

#[tokio::test]
async fn fixed_path_replays_without_reprocessing_neighbors() {
   let state = TempDir::new().expect("state dir");
   let repo = TempDir::new().expect("repo dir");
   let first_file = repo.path().join("one.rs");
   let missing = repo.path().join("two.rs");
   let third_file = repo.path().join("three.rs");
   fs::write(&first_file, "fn one() {}\n").expect("first file");
   fs::write(&third_file, "fn three() {}\n").expect("third file");

   let source =
      format!("{}\n{}\n{}\n", first_file.display(), missing.display(), third_file.display());

   let indexer = Arc::new(MemoryIndexer::new());
   let cancel = CancellationToken::new();
   let mut first = orchestrator(&state, indexer.clone(), options("code"));
   let one = first.run(reader(&source), &cancel, &mut ()).await.expect("first run");
   drop(first);

   // The run finishes despite the unreadable line and reports it.
   assert!(!one.success());
   assert_eq!(one.run.status, RunStatus::Completed);
   assert_eq!(one.run.succeeded, 2);
   assert_eq!(one.run.failed, 1);

   let store = open_store(&state);
   let failures = store.get_failed_all(&one.run.run_id).expect("failed rows");
   assert_eq!(failures.len(), 1);
   assert_eq!(failures[0].line_no, 2);
   assert!(!failures[0].error.is_empty());
   drop(store);

   // Create the file the second line pointed at, then run again.
   fs::write(&missing, "fn two() {}\n").expect("fixed file");

   let fresh = Arc::new(MemoryIndexer::new());
   let mut second = orchestrator(&state, fresh.clone(), options("code"));
   let cancel = CancellationToken::new();
   let two = second.run(reader(&source), &cancel, &mut ()).await.expect("second run");

   // The completed run reopens for its stored failure instead of starting over.
   assert_eq!(two.run.run_id, one.run.run_id);
   assert!(two.success());
   assert_eq!(two.run.succeeded, 3);
   assert_eq!(two.run.failed, 0);
   assert_eq!(two.run.status, RunStatus::Completed);

   // Only the replayed line reached the backend this time.
   assert_eq!(fresh.paths("code"), vec![missing.display().to_string()]);

   let store = open_store(&state);
   assert!(store.get_failed_all(&one.run.run_id).expect("failed rows").is_empty());
}

#[tokio::test]
async fn replayed_lines_respect_retry_ceiling() {
   let state = TempDir::new().expect("state dir");

   // Seed an interrupted run: line 7 has exhausted its retries, line 8 has
   // budget left and a payload that can be replayed without a filesystem.
   let run_id = {
      let mut store = open_store(&state);
      let run_id = store.start_run("code", false, "stdin").expect("start run");
      let stuck = r#"{"line_no":7,"path":"stuck.rs","op":"modify","repo":null,"content":null}"#;
      for _ in 0..3 {
         store
            .mark_failed(&run_id, 7, "stuck.rs", ChangeOp::Modify, None, "backend down", stuck)
            .expect("seed stuck line");
      }
      let fixed =
         r#"{"line_no":8,"path":"fixed.rs","op":"modify","repo":null,"content":{"raw":"fn fixed() {}"}}"#;
      store
         .mark_failed(&run_id, 8, "fixed.rs", ChangeOp::Modify, None, "backend down", fixed)
         .expect("seed fixed line");
      run_id
   };

   let indexer = Arc::new(MemoryIndexer::new());
   let mut opts = options("code");
   opts.max_retries = 2;
   let mut orch = orchestrator(&state, indexer.clone(), opts);

   let cancel = CancellationToken::new();
   let outcome = orch.run(reader(""), &cancel, &mut ()).await.expect("resume");

   assert_eq!(outcome.run.run_id, run_id);
   assert_eq!(outcome.run.status, RunStatus::Completed);
   assert!(!outcome.success());

   // Line 8 replayed and landed; line 7 was left untouched at its ceiling.
   assert_eq!(indexer.paths("code"), vec!["fixed.rs".to_string()]);
   assert_eq!(outcome.run.succeeded, 1);
   assert_eq!(outcome.run.failed, 1);

   let store = open_store(&state);
   let remaining = store.get_failed_all(&run_id).expect("failed lines");
   assert_eq!(remaining.len(), 1);
   assert_eq!(remaining[0].line_no, 7);
   assert_eq!(remaining[0].retry_count, 2);
}

#[tokio::test]
async fn active_run_for_another_collection_is_left_alone() {
   let state = TempDir::new().expect("state dir");
   let docs_run = {
      let mut store = open_store(&state);
      store.start_run("docs", false, "stdin").expect("start docs run")
   };

   let source = concat!(r#"{"path": "a.rs", "content": "fn a() {}"}"#, "\n");
   let indexer = Arc::new(MemoryIndexer::new());
   let mut orch = orchestrator(&state, indexer, options("code"));

   let cancel = CancellationToken::new();
   let outcome = orch.run(reader(source), &cancel, &mut ()).await.expect("run");

   assert!(outcome.success());
   assert_ne!(outcome.run.run_id, docs_run);
   assert_eq!(outcome.run.collection, "code");

   // The foreign run stays resumable by whoever owns it.
   let store = open_store(&state);
   assert_eq!(store.get_run(&docs_run).expect("docs run").status, RunStatus::Running);
}

#[tokio::test]
async fn skip_embedding_indexes_without_vectors() {
   let state = TempDir::new().expect("state dir");
   let source = concat!(
      r#"{"path": "a.rs", "content": "fn a() {}"}"#,
      "\n",
      r#"{"path": "b.rs", "content": "fn b() {}"}"#,
      "\n",
   );

   let indexer = Arc::new(MemoryIndexer::new());
   let mut opts = options("code");
   opts.skip_embedding = true;
   let mut orch = orchestrator(&state, indexer.clone(), opts);

   let cancel = CancellationToken::new();
   let outcome = orch.run(reader(source), &cancel, &mut ()).await.expect("run");

   assert!(outcome.success());
   assert_eq!(indexer.len("code"), 2);
   let doc = indexer.document("code", "a.rs").expect("doc");
   assert!(doc.vector.is_none());
   assert!(doc.content.is_some());
}
