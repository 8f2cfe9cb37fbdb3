//! Checkpoint persistence and recovery across runs.

mod common;

use common::{payload_ops, read_json_lines, run, TestEnv, BLOCK_SIZE};
use redo_capture::redo::test_utils::{begin, commit, insert, LogFileBuilder};
use redo_capture::types::Xid;

fn one_transaction_log(path: &std::path::Path, sequence: u32, scn: u64, value: &[u8]) {
    let xid = Xid::new(1, 0, scn as u32);
    LogFileBuilder::new(sequence, BLOCK_SIZE as usize)
        .add_lwn(
            scn,
            &[
                begin(xid, scn),
                insert(xid, scn, 101, sequence, 0, &[(1, Some(value))]),
                commit(xid, scn + 1, 0),
            ],
        )
        .write(path)
        .unwrap();
}

#[tokio::test]
async fn final_checkpoint_is_written() {
    let env = TestEnv::new();
    let log = env.log_path("redo.1");
    one_transaction_log(&log, 1, 1000, b"v1");

    run(env.config(vec![log])).await.unwrap();

    let files: Vec<String> = std::fs::read_dir(&env.state)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(files.len(), 1, "one checkpoint expected: {files:?}");
    assert!(files[0].starts_with("TESTDB-"));
    assert!(files[0].ends_with(".json"));

    let record: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(env.state.join(&files[0])).unwrap()).unwrap();
    assert_eq!(record["scn"], 1001, "fenced at the confirmed commit scn");
    assert!(record["schema"].is_string(), "first checkpoint embeds the schema body");
    assert!(record["open_xids"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn restart_with_no_new_input_emits_nothing() {
    let env = TestEnv::new();
    let log = env.log_path("redo.1");
    one_transaction_log(&log, 1, 1000, b"v1");

    run(env.config(vec![log.clone()])).await.unwrap();
    let first = env.read_output();
    assert!(!payload_ops(&first, "c").is_empty());

    // Second run over the same log resumes from the checkpoint; every
    // commit is at or below the fence.
    let second_out = env.dir.path().join("out2.json");
    let mut config = env.config(vec![log]);
    config.target[0].writer.output = Some(second_out.clone());
    run(config).await.unwrap();

    let second = read_json_lines(&second_out);
    assert!(second.is_empty(), "duplicate output after restart: {second:?}");
}

#[tokio::test]
async fn restart_resumes_identically_from_the_fence() {
    let reference = TestEnv::new();
    let staged = TestEnv::new();

    // The same two log sequences in both environments.
    for env in [&reference, &staged] {
        one_transaction_log(&env.log_path("redo.1"), 1, 1000, b"v1");
        one_transaction_log(&env.log_path("redo.2"), 2, 2000, b"v2");
    }

    // Reference: both sequences in one uninterrupted run.
    run(reference
        .config(vec![reference.log_path("redo.1"), reference.log_path("redo.2")]))
    .await
    .unwrap();
    let full = std::fs::read_to_string(&reference.output).unwrap();

    // Staged: first run sees only sequence 1, then a restart picks up
    // sequence 2 from the checkpoint.
    run(staged.config(vec![staged.log_path("redo.1")])).await.unwrap();
    let head = std::fs::read_to_string(&staged.output).unwrap();

    let tail_out = staged.dir.path().join("out2.json");
    let mut config = staged.config(vec![staged.log_path("redo.1"), staged.log_path("redo.2")]);
    config.target[0].writer.output = Some(tail_out.clone());
    run(config).await.unwrap();
    let tail = std::fs::read_to_string(&tail_out).unwrap();

    assert_eq!(
        format!("{head}{tail}"),
        full,
        "staged runs must reproduce the reference byte stream"
    );
}
