//! Cross-component invariants exercised end-to-end.

use serde_json::json;

use llmcmd::dispatch::ToolDispatcher;
use llmcmd::quota::{QuotaManager, QuotaUsage, QuotaWeights};
use llmcmd::stream::anon_pipe;
use llmcmd::transcript::truncate_utf8;
use llmcmd::types::ToolCallRequest;
use llmcmd::vfs::SharedBuffer;

async fn sandbox() -> (ToolDispatcher, SharedBuffer) {
    let (stdin, feeder) = anon_pipe();
    tokio::spawn(async move {
        let _ = feeder.send_eof().await;
    });
    let stdout = SharedBuffer::new();
    let stderr = SharedBuffer::new();
    let dispatcher = ToolDispatcher::new(
        stdin,
        stdout.writer(),
        stderr.writer(),
        vec![],
        vec![],
        false,
    )
    .await
    .unwrap();
    (dispatcher, stdout)
}

fn call(name: &str, args: serde_json::Value) -> ToolCallRequest {
    ToolCallRequest::new(format!("call_{}", name), name, args.to_string())
}

fn parse(content: &str) -> serde_json::Value {
    serde_json::from_str(content).unwrap()
}

#[tokio::test]
async fn handle_ids_are_unique_and_dead_after_close() {
    let (mut d, _out) = sandbox().await;

    // Allocate a batch of descriptors through open and spawn.
    let mut seen = std::collections::HashSet::new();
    for i in 0..5 {
        let msg = d
            .dispatch(&call("open", json!({"path": format!("file-{}", i), "mode": "w"})))
            .await;
        let fd = parse(&msg.content)["fd"].as_u64().unwrap();
        assert!(seen.insert(fd), "duplicate fd {}", fd);
    }
    let msg = d.dispatch(&call("spawn", json!({"script": "cat"}))).await;
    let result = parse(&msg.content);
    for key in ["in_fd", "out_fd"] {
        let fd = result[key].as_u64().unwrap();
        assert!(seen.insert(fd), "duplicate fd {}", fd);
    }

    // Close one and verify every operation on it reports an invalid fd.
    let victim = *seen.iter().min().unwrap();
    d.dispatch(&call("close", json!({"fd": victim}))).await;
    for (tool, args) in [
        ("read", json!({"fd": victim})),
        ("write", json!({"fd": victim, "data": "x"})),
        ("close", json!({"fd": victim})),
    ] {
        let msg = d.dispatch(&call(tool, args)).await;
        assert_eq!(
            parse(&msg.content)["error"],
            "invalid file descriptor",
            "tool {} on closed fd",
            tool
        );
    }
}

#[tokio::test]
async fn closing_a_spawn_input_joins_dependents_first() {
    let (mut d, _out) = sandbox().await;

    let msg = d
        .dispatch(&call("spawn", json!({"script": "sort | uniq"})))
        .await;
    let result = parse(&msg.content);
    let in_fd = result["in_fd"].as_u64().unwrap();
    let out_fd = result["out_fd"].as_u64().unwrap();

    d.dispatch(&call("write", json!({"fd": in_fd, "data": "b\na\nb\n"})))
        .await;

    // Closing the write side without ever sending eof or reading the
    // output: the cascade must close the read side first, unblock the
    // pipeline, and still produce its exit code.
    let msg = d.dispatch(&call("close", json!({"fd": in_fd}))).await;
    let result = parse(&msg.content);
    assert_eq!(result["success"], true);
    assert!(result["exit_code"].is_i64() || result["exit_code"].is_u64());

    // Both ends are gone.
    let msg = d.dispatch(&call("read", json!({"fd": out_fd}))).await;
    assert_eq!(parse(&msg.content)["error"], "invalid file descriptor");
}

#[tokio::test]
async fn stderr_redirect_captures_diagnostics() {
    let (mut d, _out) = sandbox().await;

    // sed with a bad expression writes its complaint to stderr, which the
    // redirection routes into a virtual file readable afterwards.
    let msg = d
        .dispatch(&call(
            "spawn",
            json!({"script": "echo x | sed y/a/b/ 2> errors.txt", "out_fd": 1}),
        ))
        .await;
    let in_fd = parse(&msg.content)["in_fd"].as_u64().unwrap();
    let msg = d.dispatch(&call("close", json!({"fd": in_fd}))).await;
    let code = parse(&msg.content)["exit_code"].as_i64().unwrap();
    assert_ne!(code, 0);

    let msg = d
        .dispatch(&call("open", json!({"path": "errors.txt", "mode": "r"})))
        .await;
    let fd = parse(&msg.content)["fd"].as_u64().unwrap();
    let msg = d.dispatch(&call("read", json!({"fd": fd, "count": 4096}))).await;
    let captured = parse(&msg.content)["input"].as_str().unwrap().to_string();
    assert!(captured.contains("sed"), "captured: {}", captured);
}

#[test]
fn quota_total_equals_sum_of_weighted_contributions() {
    let weights = QuotaWeights {
        input: 1.0,
        cached: 0.5,
        output: 3.0,
    };
    let manager = QuotaManager::new(1_000_000_000, weights);
    manager.register(1, None);

    // A deterministic pseudo-random consumption sequence.
    let mut state = 0x2545F491u64;
    let mut next = || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state % 997
    };

    let mut expected = 0.0;
    let mut previous = 0.0;
    for _ in 0..500 {
        let usage = QuotaUsage {
            input: next(),
            cached: next(),
            output: next(),
        };
        expected += usage.weighted(&weights);
        manager.consume(1, &usage);

        let total = manager.snapshot().total_weighted;
        assert!(total >= previous, "total_weighted decreased");
        previous = total;
    }
    assert!((manager.snapshot().total_weighted - expected).abs() < 1e-3);
}

#[test]
fn truncation_is_always_a_valid_utf8_prefix() {
    let samples = [
        "plain ascii text with several words",
        "mixéd accénts and ümlauts éverywhere",
        "日本語のテキストと English mixed content",
        "emoji 🦀🔥💧 clusters and ½ fractions",
        "\u{10FFFF} boundary \u{10000} planes",
    ];
    for text in samples {
        for budget in 0..=text.len() + 2 {
            let prefix = truncate_utf8(text, budget);
            // A &str return type already guarantees UTF-8 validity; check
            // the prefix and length properties explicitly.
            assert!(prefix.len() <= budget);
            assert!(text.starts_with(prefix));
            if text.len() <= budget {
                assert_eq!(prefix, text);
            } else {
                // At most 3 bytes are lost to the boundary backoff.
                assert!(budget - prefix.len() <= 3);
            }
        }
    }
}

#[test]
fn pipe_semantics_hold_without_the_runtime_macro() {
    // Anonymous pipes are single-shot: once drained, they stay at EOF.
    tokio_test::block_on(async {
        let (reader, writer) = anon_pipe();
        writer.write_all(b"once").await.unwrap();
        writer.send_eof().await.unwrap();
        assert_eq!(reader.read_to_end().await.unwrap(), b"once");
        assert!(reader.read_some(8).await.unwrap().is_empty());
    });
}

#[tokio::test]
async fn session_stdout_receives_only_what_was_written() {
    let (mut d, stdout) = sandbox().await;

    d.dispatch(&call("write", json!({"fd": 1, "data": "one", "newline": true})))
        .await;
    let msg = d.dispatch(&call("read", json!({"fd": 5}))).await;
    assert!(parse(&msg.content)["error"].is_string());
    d.dispatch(&call("write", json!({"fd": 1, "data": "two", "newline": true})))
        .await;

    assert_eq!(stdout.snapshot(), b"one\ntwo\n");
}
