//! Exactly-once semantics: every committed transaction appears exactly
//! once in the output, across restarts and re-read log ranges.

mod common;

use common::{payload_ops, read_json_lines, run, TestEnv, BLOCK_SIZE};
use redo_capture::redo::test_utils::{begin, commit, insert, LogFileBuilder};
use redo_capture::types::Xid;

#[tokio::test]
async fn each_commit_framed_exactly_once() {
    let env = TestEnv::new();
    let log = env.log_path("redo.1");

    let mut file = LogFileBuilder::new(1, BLOCK_SIZE as usize);
    for i in 0u32..20 {
        let xid = Xid::new(1, 0, i + 1);
        let scn = 1000 + i as u64 * 10;
        file.add_lwn(
            scn,
            &[
                begin(xid, scn),
                insert(xid, scn, 101, i, 0, &[(1, Some(format!("row-{i}").as_bytes()))]),
                commit(xid, scn + 1, 0),
            ],
        );
    }
    file.write(&log).unwrap();

    run(env.config(vec![log])).await.unwrap();

    let lines = env.read_output();
    let begins = payload_ops(&lines, "begin");
    let commits = payload_ops(&lines, "commit");
    let inserts = payload_ops(&lines, "c");
    assert_eq!(begins.len(), 20);
    assert_eq!(commits.len(), 20);
    assert_eq!(inserts.len(), 20);

    // Every row appears exactly once, in commit order.
    for (i, row) in inserts.iter().enumerate() {
        assert_eq!(row["after"]["COL_1"], format!("row-{i}"));
    }

    // Message scns never decrease.
    let scns: Vec<u64> = lines.iter().map(|l| l["scn"].as_u64().unwrap()).collect();
    let mut sorted = scns.clone();
    sorted.sort();
    assert_eq!(scns, sorted, "output not in commit-scn order");
}

#[tokio::test]
async fn rereading_a_confirmed_range_adds_nothing() {
    let env = TestEnv::new();
    let log1 = env.log_path("redo.1");
    let log2 = env.log_path("redo.2");

    let xid1 = Xid::new(1, 0, 1);
    LogFileBuilder::new(1, BLOCK_SIZE as usize)
        .add_lwn(
            1000,
            &[
                begin(xid1, 1000),
                insert(xid1, 1000, 101, 1, 0, &[(1, Some(b"first"))]),
                commit(xid1, 1001, 0),
            ],
        )
        .write(&log1)
        .unwrap();

    let xid2 = Xid::new(1, 0, 2);
    LogFileBuilder::new(2, BLOCK_SIZE as usize)
        .add_lwn(
            2000,
            &[
                begin(xid2, 2000),
                insert(xid2, 2000, 101, 2, 0, &[(1, Some(b"second"))]),
                commit(xid2, 2001, 0),
            ],
        )
        .write(&log2)
        .unwrap();

    // First run: sequence 1 only.
    run(env.config(vec![log1.clone()])).await.unwrap();
    assert_eq!(payload_ops(&env.read_output(), "c").len(), 1);

    // Restart over both sequences: sequence 1 is at or below the fence.
    let out2 = env.dir.path().join("out2.json");
    let mut config = env.config(vec![log1.clone(), log2.clone()]);
    config.target[0].writer.output = Some(out2.clone());
    run(config).await.unwrap();

    let second = read_json_lines(&out2);
    let inserts = payload_ops(&second, "c");
    assert_eq!(inserts.len(), 1, "re-read range duplicated: {second:?}");
    assert_eq!(inserts[0]["after"]["COL_1"], "second");

    // Third run with nothing new: silence.
    let out3 = env.dir.path().join("out3.json");
    let mut config = env.config(vec![log1, log2]);
    config.target[0].writer.output = Some(out3.clone());
    run(config).await.unwrap();
    assert!(read_json_lines(&out3).is_empty());
}

#[tokio::test]
async fn checkpoint_fence_never_passes_confirmed_output() {
    let env = TestEnv::new();
    let log = env.log_path("redo.1");

    let xid = Xid::new(9, 0, 1);
    LogFileBuilder::new(1, BLOCK_SIZE as usize)
        .add_lwn(
            500,
            &[
                begin(xid, 500),
                insert(xid, 500, 101, 1, 0, &[(1, Some(b"v"))]),
                commit(xid, 501, 0),
            ],
        )
        .write(&log)
        .unwrap();

    run(env.config(vec![log])).await.unwrap();

    let max_scn = env
        .read_output()
        .iter()
        .map(|l| l["scn"].as_u64().unwrap())
        .max()
        .unwrap();

    let checkpoint_files: Vec<_> = std::fs::read_dir(&env.state)
        .unwrap()
        .filter_map(|e| e.ok())
        .collect();
    for entry in checkpoint_files {
        let record: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(entry.path()).unwrap()).unwrap();
        assert!(
            record["scn"].as_u64().unwrap() <= max_scn,
            "checkpoint fence beyond confirmed output"
        );
    }
}
